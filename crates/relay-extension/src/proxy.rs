//! Envelope dispatch: relay commands in, debugger calls out.
//!
//! Forwarded CDP commands carry the `tab-<id>` tag in their `sessionId` slot;
//! the proxy translates the tag to the platform's tab target. Recording
//! control rides the same JSON channel under its own method names.

use std::sync::Arc;

use relay_wire::{parse_tab_tag, tab_tag, CdpError, Envelope};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::debugger::{DebuggerHost, HostEvent};
use crate::recorder::{RecorderEvent, RecorderHost};

#[derive(Clone)]
pub struct ExtensionProxy {
    debugger: Arc<dyn DebuggerHost>,
    recorder: Arc<dyn RecorderHost>,
}

impl ExtensionProxy {
    pub fn new(debugger: Arc<dyn DebuggerHost>, recorder: Arc<dyn RecorderHost>) -> Self {
        Self { debugger, recorder }
    }

    pub async fn next_debugger_event(&self) -> Option<HostEvent> {
        self.debugger.next_event().await
    }

    pub async fn next_recorder_event(&self) -> Option<RecorderEvent> {
        self.recorder.next_event().await
    }

    /// Envelopes announcing the current attachment snapshot; sent after
    /// every (re)connect so the relay rebuilds its target table.
    pub async fn snapshot_envelopes(&self) -> Vec<Envelope> {
        self.debugger
            .attached_tabs()
            .await
            .into_iter()
            .map(|tab| {
                Envelope::event(
                    "tabAttached",
                    json!({"tabId": tab.tab_id, "url": tab.url, "title": tab.title}),
                )
            })
            .collect()
    }

    /// Process one envelope from the relay. Requests produce a response
    /// envelope; notifications produce none.
    pub async fn handle_envelope(&self, envelope: Envelope) -> Option<Envelope> {
        if envelope.is_event() {
            if envelope.method.as_deref() == Some("detachTab") {
                let params = envelope.params.unwrap_or(json!({}));
                if let Some(tab_id) = params["tabId"].as_i64() {
                    if let Err(err) = self.debugger.detach(tab_id).await {
                        debug!(target: "ext-proxy", tab_id, %err, "detach notification failed");
                    }
                }
            } else {
                debug!(target: "ext-proxy", method = ?envelope.method, "unhandled notification");
            }
            return None;
        }
        if !envelope.is_request() {
            return None;
        }

        let id = envelope.id.unwrap_or_default();
        let method = envelope.method.clone().unwrap_or_default();
        let params = envelope.params.clone().unwrap_or(json!({}));

        let reply = match method.as_str() {
            "attachTab" => match params["tabId"].as_i64() {
                Some(tab_id) => self.host_result(id, self.debugger.attach(tab_id).await),
                None => bad_request(id, "attachTab requires tabId"),
            },
            "detachTab" => match params["tabId"].as_i64() {
                Some(tab_id) => self.host_result(id, self.debugger.detach(tab_id).await),
                None => bad_request(id, "detachTab requires tabId"),
            },
            "startRecording" => match params["tabId"].as_i64() {
                Some(tab_id) => match self.recorder.start(tab_id).await {
                    Ok(()) => Envelope::response(id, json!({"success": true})),
                    Err(err) => {
                        Envelope::error_response(id, CdpError::server_error(err.to_string()))
                    }
                },
                None => bad_request(id, "startRecording requires tabId"),
            },
            "stopRecording" => match params["tabId"].as_i64() {
                Some(tab_id) => match self.recorder.stop(tab_id).await {
                    Ok(()) => Envelope::response(id, json!({"success": true})),
                    Err(err) => {
                        Envelope::error_response(id, CdpError::server_error(err.to_string()))
                    }
                },
                None => bad_request(id, "stopRecording requires tabId"),
            },
            "cancelRecording" => match params["tabId"].as_i64() {
                Some(tab_id) => match self.recorder.cancel(tab_id).await {
                    Ok(()) => Envelope::response(id, json!({"success": true})),
                    Err(err) => {
                        Envelope::error_response(id, CdpError::server_error(err.to_string()))
                    }
                },
                None => bad_request(id, "cancelRecording requires tabId"),
            },
            "isRecording" => match params["tabId"].as_i64() {
                Some(tab_id) => Envelope::response(
                    id,
                    json!({"recording": self.recorder.is_recording(tab_id).await}),
                ),
                None => bad_request(id, "isRecording requires tabId"),
            },
            _ => self.forward_cdp(id, &method, params, envelope.session_id).await,
        };
        Some(reply)
    }

    async fn forward_cdp(
        &self,
        id: u64,
        method: &str,
        params: Value,
        session_tag: Option<String>,
    ) -> Envelope {
        let Some(tab_id) = session_tag.as_deref().and_then(parse_tab_tag) else {
            return Envelope::error_response(
                id,
                CdpError::new(
                    -32601,
                    format!("'{method}' is not supported without a target session"),
                ),
            );
        };
        match self.debugger.send_command(tab_id, method, params).await {
            Ok(result) => Envelope::response(id, result),
            Err(err) => {
                warn!(target: "ext-proxy", tab_id, method, %err, "debugger command failed");
                Envelope::error_response(id, CdpError::server_error(err.to_string()))
            }
        }
    }

    fn host_result(&self, id: u64, outcome: Result<(), crate::debugger::HostError>) -> Envelope {
        match outcome {
            Ok(()) => Envelope::response(id, json!({})),
            Err(err) => Envelope::error_response(id, CdpError::server_error(err.to_string())),
        }
    }
}

/// Lifecycle and debugger events rendered as relay envelopes.
pub fn host_event_envelope(event: &HostEvent) -> Envelope {
    match event {
        HostEvent::TabAttached { tab_id, url, title } => Envelope::event(
            "tabAttached",
            json!({"tabId": tab_id, "url": url, "title": title}),
        ),
        HostEvent::TabNavigated { tab_id, url, title } => Envelope::event(
            "tabNavigated",
            json!({"tabId": tab_id, "url": url, "title": title}),
        ),
        HostEvent::TabDetached { tab_id, reason } => Envelope::event(
            "tabDetached",
            json!({"tabId": tab_id, "reason": reason}),
        ),
        HostEvent::Debugger {
            tab_id,
            method,
            params,
        } => Envelope::event(method.clone(), params.clone()).with_session(tab_tag(*tab_id)),
    }
}

/// A recorder event becomes a metadata envelope plus, for chunks, the binary
/// frame that must immediately follow it on the wire.
pub fn recorder_frames(event: RecorderEvent) -> (Envelope, Option<Vec<u8>>) {
    match event {
        RecorderEvent::Chunk { tab_id, bytes } => (
            Envelope::event("recordingData", json!({"tabId": tab_id, "final": false})),
            Some(bytes),
        ),
        RecorderEvent::Finished { tab_id } => (
            Envelope::event("recordingData", json!({"tabId": tab_id, "final": true})),
            None,
        ),
    }
}

fn bad_request(id: u64, message: &str) -> Envelope {
    Envelope::error_response(id, CdpError::server_error(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::ScriptedDebugger;
    use crate::recorder::ScriptedRecorder;

    fn proxy() -> (ExtensionProxy, Arc<ScriptedDebugger>, Arc<ScriptedRecorder>) {
        let debugger = Arc::new(ScriptedDebugger::new());
        let recorder = Arc::new(ScriptedRecorder::new());
        (
            ExtensionProxy::new(debugger.clone(), recorder.clone()),
            debugger,
            recorder,
        )
    }

    #[tokio::test]
    async fn tagged_command_reaches_the_debugger() {
        let (proxy, debugger, _) = proxy();
        debugger.open_tab(42, "https://a.example", "a");
        debugger.set_response("Runtime.evaluate", json!({"result": {"value": 2}}));

        let request = Envelope::request(
            5,
            "Runtime.evaluate",
            Some(json!({"expression": "1+1"})),
        )
        .with_session(tab_tag(42));
        let reply = proxy.handle_envelope(request).await.expect("response");
        assert_eq!(reply.id, Some(5));
        assert_eq!(reply.result.as_ref().unwrap()["result"]["value"], 2);
        assert_eq!(debugger.sent_commands().len(), 1);
    }

    #[tokio::test]
    async fn untagged_command_is_refused() {
        let (proxy, _, _) = proxy();
        let request = Envelope::request(1, "Target.createTarget", Some(json!({})));
        let reply = proxy.handle_envelope(request).await.expect("response");
        let error = reply.error.expect("error payload");
        assert_eq!(error.code, -32601);
        assert!(error.message.contains("Target.createTarget"));
    }

    #[tokio::test]
    async fn recording_controls_round_trip() {
        let (proxy, _, recorder) = proxy();
        let start = Envelope::request(1, "startRecording", Some(json!({"tabId": 42})));
        let reply = proxy.handle_envelope(start).await.expect("response");
        assert_eq!(reply.result.unwrap()["success"], true);
        assert!(recorder.is_recording(42).await);

        let status = Envelope::request(2, "isRecording", Some(json!({"tabId": 42})));
        let reply = proxy.handle_envelope(status).await.expect("response");
        assert_eq!(reply.result.unwrap()["recording"], true);

        let stop = Envelope::request(3, "stopRecording", Some(json!({"tabId": 42})));
        proxy.handle_envelope(stop).await.expect("response");
        assert!(matches!(
            proxy.next_recorder_event().await,
            Some(RecorderEvent::Finished { tab_id: 42 })
        ));
    }

    #[tokio::test]
    async fn detach_notification_needs_no_reply() {
        let (proxy, debugger, _) = proxy();
        debugger.open_tab(42, "https://a.example", "a");
        let _ = debugger.next_event().await;

        let notify = Envelope::event("detachTab", json!({"tabId": 42}));
        assert!(proxy.handle_envelope(notify).await.is_none());
        assert!(matches!(
            debugger.next_event().await,
            Some(HostEvent::TabDetached { tab_id: 42, .. })
        ));
    }

    #[test]
    fn recorder_frames_pair_metadata_with_binary() {
        let (meta, bytes) = recorder_frames(RecorderEvent::Chunk {
            tab_id: 42,
            bytes: vec![1, 2, 3],
        });
        assert_eq!(meta.params.as_ref().unwrap()["final"], false);
        assert_eq!(bytes.as_deref(), Some(&[1u8, 2, 3][..]));

        let (meta, bytes) = recorder_frames(RecorderEvent::Finished { tab_id: 42 });
        assert_eq!(meta.params.as_ref().unwrap()["final"], true);
        assert!(bytes.is_none());
    }
}
