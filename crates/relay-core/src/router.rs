//! The relay actor: joins the wire codec, client registry, extension link,
//! target manager, and recording accumulator.
//!
//! Four directions flow through here. Client requests are either answered
//! locally (the fixed intercepted set below) or rewritten onto the extension
//! link; extension responses are rewritten back; extension events fan out to
//! every session attached to the originating tab; and target-lifecycle
//! transitions are injected as synthesized `Target.*` notifications. Because
//! one task owns all of it, responses and events for a `(client, session)`
//! pair can never reorder.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use relay_wire::{
    decode, tab_tag, CdpError, Envelope, TabId, CLOSE_PROTOCOL_ERROR, CLOSE_TRY_AGAIN_LATER,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::clients::{ClientId, ClientRecord, DeliverOutcome};
use crate::config::{IdlePolicy, RelayConfig};
use crate::error::{RelayError, RelayErrorKind};
use crate::extension::{ExtensionLink, HeartbeatAction, PendingOrigin, SendOutcome};
use crate::handle::{
    ClientConnection, ConnectReject, ExtensionConnection, RecordingStatusReply, RelayHandle,
    RelayMsg, StartRecordingReply, StartRecordingRequest, StatusSnapshot, StopRecordingReply,
};
use crate::recording::{write_output, RecordingManager};
use crate::targets::{TargetManager, TargetRecord};

/// Methods the relay answers locally because `chrome.debugger` cannot express
/// them. Fixed set; adding an entry changes wire semantics.
pub static INTERCEPTED_METHODS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "Target.setAutoAttach",
        "Target.getTargets",
        "Target.attachToTarget",
        "Target.detachFromTarget",
        "Browser.getVersion",
        "Browser.close",
        "Browser.setDownloadBehavior",
    ]
    .into_iter()
    .collect()
});

/// Start the relay actor and hand back its message endpoint.
pub fn spawn_relay(config: RelayConfig) -> RelayHandle {
    let (tx, rx) = mpsc::channel(256);
    let handle = RelayHandle::new(tx);
    let actor = RelayActor::new(config, handle.clone());
    tokio::spawn(actor.run(rx));
    handle
}

struct SessionRecord {
    client: ClientId,
    target_id: String,
}

struct RelayActor {
    config: RelayConfig,
    handle: RelayHandle,
    clients: HashMap<ClientId, ClientRecord>,
    link: ExtensionLink,
    targets: TargetManager,
    recordings: RecordingManager,
    sessions: HashMap<String, SessionRecord>,
    next_session: u64,
    next_client_ordinal: u64,
    dead_clients: Vec<ClientId>,
    shutting_down: bool,
}

impl RelayActor {
    fn new(config: RelayConfig, handle: RelayHandle) -> Self {
        let link = ExtensionLink::new(&config);
        let targets = TargetManager::new(config.frozen_target_ttl);
        Self {
            config,
            handle,
            clients: HashMap::new(),
            link,
            targets,
            recordings: RecordingManager::default(),
            sessions: HashMap::new(),
            next_session: 0,
            next_client_ordinal: 0,
            dead_clients: Vec::new(),
            shutting_down: false,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<RelayMsg>) {
        let mut sweep = interval(Duration::from_secs(1));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let stop = self.handle_msg(msg);
                    self.reap_dead();
                    if stop {
                        break;
                    }
                }
                _ = sweep.tick() => {
                    self.on_sweep();
                    self.reap_dead();
                }
                _ = heartbeat.tick() => {
                    self.on_heartbeat();
                    self.reap_dead();
                }
            }
        }
        debug!(target: "relay-router", "relay actor stopped");
    }

    /// Returns true when the actor should stop.
    fn handle_msg(&mut self, msg: RelayMsg) -> bool {
        match msg {
            RelayMsg::ClientConnect { id, reply } => {
                let _ = reply.send(self.on_client_connect(id));
            }
            RelayMsg::ClientText { id, text } => self.on_client_text(&id, &text),
            RelayMsg::ClientClosed { id } => self.cleanup_client(&id),
            RelayMsg::ExtensionConnect { reply } => {
                let _ = reply.send(self.on_extension_connect());
            }
            RelayMsg::ExtensionText { conn, text } => self.on_extension_text(conn, &text),
            RelayMsg::ExtensionBinary { conn, bytes } => {
                if self.link.current_conn() == Some(conn) {
                    self.recordings.push_binary(bytes);
                }
            }
            RelayMsg::ExtensionPong { conn } => self.link.pong(conn),
            RelayMsg::ExtensionClosed { conn } => self.on_extension_lost(conn),
            RelayMsg::RecordingStart { request, reply } => self.on_recording_start(request, reply),
            RelayMsg::RecordingStarted { tab_id, outcome } => {
                if let Err(error) = outcome {
                    warn!(target: "relay-recording", tab_id, %error, "extension refused startRecording");
                    self.recordings.abort(tab_id);
                }
            }
            RelayMsg::RecordingStop { session_id, reply } => {
                self.on_recording_stop(session_id, reply)
            }
            RelayMsg::RecordingStopFailed { tab_id, error } => {
                self.recordings.fail_tab(tab_id, &error);
            }
            RelayMsg::RecordingCancel { session_id, reply } => {
                self.on_recording_cancel(session_id, reply)
            }
            RelayMsg::RecordingStatus { session_id, reply } => {
                self.on_recording_status(session_id, reply)
            }
            RelayMsg::Status { reply } => {
                let _ = reply.send(StatusSnapshot {
                    extension_connected: self.link.is_connected(),
                    clients: self.clients.len(),
                    targets: self.targets.len(),
                    recordings: self.recordings.len(),
                });
            }
            RelayMsg::Shutdown { reply } => {
                self.on_shutdown();
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    // ---- client leg ----

    fn on_client_connect(&mut self, id: ClientId) -> Result<ClientConnection, ConnectReject> {
        if self.shutting_down {
            return Err(ConnectReject {
                code: 1001,
                reason: "relay shutting down".into(),
            });
        }
        if !self.link.is_connected() && self.config.idle_policy == IdlePolicy::Reject {
            return Err(ConnectReject {
                code: CLOSE_TRY_AGAIN_LATER,
                reason: "extension not connected".into(),
            });
        }

        // Path ids are caller-chosen and only used for logging; collisions
        // get an ordinal suffix so records stay distinct.
        let key = if self.clients.contains_key(&id) {
            self.next_client_ordinal += 1;
            format!("{id}#{}", self.next_client_ordinal)
        } else {
            id
        };

        let (tx, outbound) = mpsc::unbounded_channel();
        let queued_bytes = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let record = ClientRecord::new(
            key.clone(),
            tx,
            queued_bytes.clone(),
            self.config.client_buffer_limit,
        );
        info!(target: "relay-router", client = %key, "cdp client connected");

        // Replay the current target set so a late-joining client sees the
        // same world as one that was present at attach time.
        if self.link.is_connected() {
            for target in self.targets.iter().cloned().collect::<Vec<_>>() {
                let envelope = Envelope::event(
                    "Target.targetCreated",
                    json!({"targetInfo": target.target_info(true)}),
                );
                match record.deliver(&envelope) {
                    DeliverOutcome::Ok => {}
                    _ => break,
                }
            }
        }

        self.clients.insert(key.clone(), record);
        Ok(ClientConnection {
            client_key: key,
            outbound,
            queued_bytes,
        })
    }

    fn on_client_text(&mut self, client: &ClientId, text: &str) {
        let envelope = match decode(text, self.config.max_frame_bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(target: "relay-router", %client, %err, "client wire violation");
                if let Some(record) = self.clients.get(client) {
                    record.close(err.close_code(), err.to_string());
                }
                self.dead_clients.push(client.clone());
                return;
            }
        };

        if !envelope.is_request() {
            debug!(target: "relay-router", %client, "ignoring non-request client frame");
            return;
        }
        let id = envelope.id.unwrap_or_default();
        let method = envelope.method.clone().unwrap_or_default();

        if INTERCEPTED_METHODS.contains(method.as_str()) {
            self.handle_intercepted(
                client,
                id,
                &method,
                envelope.params.unwrap_or(json!({})),
                envelope.session_id.clone(),
            );
            return;
        }

        // Everything else is rewritten onto the extension link.
        let session_tag = match &envelope.session_id {
            Some(session_id) => match self.resolve_session_tab(client, session_id) {
                Ok(tab_id) => Some(tab_tag(tab_id)),
                Err(error) => {
                    self.deliver_to(client, &Envelope::error_response(id, error.to_cdp()));
                    return;
                }
            },
            None => None,
        };

        let origin = PendingOrigin::Client {
            client: client.clone(),
            id,
            session: envelope.session_id.clone(),
        };
        match self
            .link
            .send_command(method, envelope.params, session_tag, origin)
        {
            SendOutcome::Sent | SendOutcome::Queued => {}
            SendOutcome::Rejected(origin, error) => self.fail_origin(origin, error.to_cdp()),
        }
    }

    fn resolve_session_tab(
        &self,
        client: &ClientId,
        session_id: &str,
    ) -> Result<TabId, RelayError> {
        let target_gone =
            || RelayError::new(RelayErrorKind::TargetGone).with_hint(session_id.to_string());
        let record = self
            .sessions
            .get(session_id)
            .filter(|record| &record.client == client)
            .ok_or_else(target_gone)?;
        self.targets
            .get_by_target(&record.target_id)
            .map(|target| target.tab_id)
            .ok_or_else(target_gone)
    }

    fn handle_intercepted(
        &mut self,
        client: &ClientId,
        id: u64,
        method: &str,
        params: Value,
        session: Option<String>,
    ) {
        trace!(target: "relay-router", %client, method, "answering intercepted method locally");
        // Responses must echo the request's sessionId or a flat-session
        // client cannot match them.
        let respond = |result: Value| {
            let mut reply = Envelope::response(id, result);
            reply.session_id = session.clone();
            reply
        };
        let respond_err = |error: CdpError| {
            let mut reply = Envelope::error_response(id, error);
            reply.session_id = session.clone();
            reply
        };

        match method {
            "Target.setAutoAttach" => {
                let auto = params["autoAttach"].as_bool().unwrap_or(false);
                let flatten = params["flatten"].as_bool().unwrap_or(false);
                if auto && session.is_none() && !flatten {
                    let reply = respond_err(CdpError::server_error(
                        "Target.setAutoAttach requires flatten: true",
                    ));
                    self.deliver_to(client, &reply);
                    return;
                }
                // Session-scoped auto-attach concerns child targets, which
                // the relay never synthesizes; acknowledge and move on.
                if session.is_none() {
                    if let Some(record) = self.clients.get_mut(client) {
                        record.auto_attach = auto;
                    }
                }
                let reply = respond(json!({}));
                self.deliver_to(client, &reply);
                if auto && session.is_none() {
                    self.attach_missing_sessions(client);
                }
            }
            "Target.getTargets" => {
                let infos: Vec<Value> = self
                    .targets
                    .iter()
                    .map(|target| target.target_info(true))
                    .collect();
                let reply = respond(json!({"targetInfos": infos}));
                self.deliver_to(client, &reply);
            }
            "Target.attachToTarget" => {
                let target_id = params["targetId"].as_str().unwrap_or_default().to_string();
                let Some(target) = self.targets.get_by_target(&target_id).cloned() else {
                    let reply = respond_err(CdpError::no_target(&target_id));
                    self.deliver_to(client, &reply);
                    return;
                };
                let session_id = self.mint_session(client, &target.target_id);
                let reply = respond(json!({"sessionId": session_id}));
                self.deliver_to(client, &reply);
                self.emit_attached(client, &session_id, &target);
            }
            "Target.detachFromTarget" => {
                let session_id = params["sessionId"].as_str().unwrap_or_default().to_string();
                let owned = self
                    .sessions
                    .get(&session_id)
                    .is_some_and(|record| &record.client == client);
                if !owned {
                    let reply = respond_err(CdpError::no_session(&session_id));
                    self.deliver_to(client, &reply);
                    return;
                }
                let target_id = self.remove_session(&session_id);
                let reply = respond(json!({}));
                self.deliver_to(client, &reply);
                if let Some(target_id) = target_id {
                    self.deliver_to(
                        client,
                        &Envelope::event(
                            "Target.detachedFromTarget",
                            json!({"sessionId": session_id, "targetId": target_id}),
                        ),
                    );
                }
            }
            "Browser.getVersion" => {
                let version = env!("CARGO_PKG_VERSION");
                let reply = respond(json!({
                    "protocolVersion": "1.3",
                    "product": format!("CdpRelay/{version}"),
                    "revision": "",
                    "userAgent": format!("CdpRelay/{version}"),
                    "jsVersion": "",
                }));
                self.deliver_to(client, &reply);
            }
            // Browser-level no-ops: acknowledged, never forwarded.
            "Browser.close" | "Browser.setDownloadBehavior" => {
                let reply = respond(json!({}));
                self.deliver_to(client, &reply);
            }
            _ => unreachable!("method {method} not in intercepted table"),
        }
    }

    /// Mint sessions for every target the client is not yet attached to.
    fn attach_missing_sessions(&mut self, client: &ClientId) {
        let missing: Vec<TargetRecord> = self
            .targets
            .iter()
            .filter(|target| !self.client_has_session(client, &target.target_id))
            .cloned()
            .collect();
        for target in missing {
            let session_id = self.mint_session(client, &target.target_id);
            self.emit_attached(client, &session_id, &target);
        }
    }

    fn client_has_session(&self, client: &ClientId, target_id: &str) -> bool {
        self.sessions
            .values()
            .any(|record| &record.client == client && record.target_id == target_id)
    }

    /// Session ids are opaque and never repeat within the process.
    fn mint_session(&mut self, client: &ClientId, target_id: &str) -> String {
        self.next_session += 1;
        let session_id = format!("s{}", self.next_session);
        self.sessions.insert(
            session_id.clone(),
            SessionRecord {
                client: client.clone(),
                target_id: target_id.to_string(),
            },
        );
        if let Some(record) = self.clients.get_mut(client) {
            record.sessions.insert(session_id.clone());
        }
        session_id
    }

    /// Drop a session record everywhere. Returns its target id.
    fn remove_session(&mut self, session_id: &str) -> Option<String> {
        let record = self.sessions.remove(session_id)?;
        if let Some(client) = self.clients.get_mut(&record.client) {
            client.sessions.remove(session_id);
        }
        Some(record.target_id)
    }

    fn emit_attached(&mut self, client: &ClientId, session_id: &str, target: &TargetRecord) {
        if let Some(record) = self.clients.get_mut(client) {
            record.lifecycle_seq += 1;
            trace!(
                target: "relay-router",
                %client,
                session = session_id,
                seq = record.lifecycle_seq,
                "session attached"
            );
        }
        self.deliver_to(
            client,
            &Envelope::event(
                "Target.attachedToTarget",
                json!({
                    "sessionId": session_id,
                    "targetInfo": target.target_info(true),
                    "waitingForDebugger": false,
                }),
            ),
        );
    }

    // ---- extension leg ----

    fn on_extension_connect(&mut self) -> ExtensionConnection {
        let (conn, outbound, displaced) = self.link.connect();
        if !displaced.is_empty() {
            let error = RelayError::new(RelayErrorKind::ExtensionReplaced);
            for origin in displaced {
                self.fail_origin(origin, error.to_cdp());
            }
        }
        // Targets announced by a previous socket are stale either way; the
        // new extension re-announces its snapshot.
        self.freeze_targets_with_events();
        self.recordings.fail_all("Extension disconnected");
        self.link.flush_waiting();
        info!(target: "relay-ext", conn, "extension connected");
        ExtensionConnection { conn, outbound }
    }

    fn on_extension_lost(&mut self, conn: u64) {
        let Some(drained) = self.link.disconnect(conn) else {
            return;
        };
        warn!(target: "relay-ext", conn, "extension disconnected");
        let error = RelayError::new(RelayErrorKind::ExtensionDisconnected);
        for origin in drained {
            self.fail_origin(origin, error.to_cdp());
        }
        self.freeze_targets_with_events();
        self.recordings.fail_all("Extension disconnected");
    }

    fn on_extension_text(&mut self, conn: u64, text: &str) {
        if self.link.current_conn() != Some(conn) {
            return;
        }
        let envelope = match decode(text, self.config.max_frame_bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(target: "relay-ext", %err, "extension wire violation");
                self.link.close(err.close_code(), &err.to_string());
                self.on_extension_lost(conn);
                return;
            }
        };

        if envelope.is_response() {
            self.route_extension_response(envelope);
        } else if envelope.is_event() {
            self.route_extension_event(envelope);
        } else {
            debug!(target: "relay-ext", "ignoring request frame from extension");
        }
    }

    fn route_extension_response(&mut self, envelope: Envelope) {
        let ext_id = envelope.id.unwrap_or_default();
        let Some(origin) = self.link.take_response(ext_id) else {
            debug!(target: "relay-ext", ext_id, "late extension response discarded");
            return;
        };
        match origin {
            PendingOrigin::Client {
                client,
                id,
                session,
            } => {
                let reply = Envelope {
                    id: Some(id),
                    result: envelope.result,
                    error: envelope.error,
                    session_id: session,
                    ..Envelope::default()
                };
                self.deliver_to(&client, &reply);
            }
            PendingOrigin::Internal { reply } => {
                let outcome = match envelope.error {
                    Some(error) => Err(error),
                    None => Ok(envelope.result.unwrap_or(json!({}))),
                };
                let _ = reply.send(outcome);
            }
        }
    }

    fn route_extension_event(&mut self, envelope: Envelope) {
        let method = envelope.method.as_deref().unwrap_or_default();
        let params = envelope.params.clone().unwrap_or(json!({}));
        match method {
            "tabAttached" => {
                let Some(tab_id) = params["tabId"].as_i64() else {
                    return;
                };
                let url = params["url"].as_str().unwrap_or_default().to_string();
                let title = params["title"].as_str().unwrap_or_default().to_string();
                self.on_tab_attached(tab_id, url, title);
            }
            "tabNavigated" => {
                let Some(tab_id) = params["tabId"].as_i64() else {
                    return;
                };
                let url = params["url"].as_str().unwrap_or_default().to_string();
                let title = params["title"].as_str().unwrap_or_default().to_string();
                if let Some(target) = self.targets.tab_navigated(tab_id, url, title) {
                    self.broadcast(&Envelope::event(
                        "Target.targetInfoChanged",
                        json!({"targetInfo": target.target_info(true)}),
                    ));
                }
            }
            "tabDetached" => {
                let Some(tab_id) = params["tabId"].as_i64() else {
                    return;
                };
                let reason = params["reason"].as_str().unwrap_or("detached");
                debug!(target: "relay-ext", tab_id, reason, "tab detached");
                self.on_tab_detached(tab_id);
            }
            "recordingData" => {
                let final_chunk = params["final"].as_bool().unwrap_or(false);
                let tab_id = params["tabId"]
                    .as_i64()
                    .or_else(|| self.recordings.find_tab(None));
                let Some(tab_id) = tab_id else {
                    warn!(target: "relay-recording", "recordingData without tabId");
                    return;
                };
                if final_chunk {
                    self.finish_recording(tab_id);
                } else {
                    self.recordings.note_metadata(tab_id);
                }
            }
            _ => {
                // Debugger events carry the tab routing tag; fan out to every
                // session attached to that target.
                let Some(tab_id) = envelope.session_id.as_deref().and_then(relay_wire::parse_tab_tag)
                else {
                    debug!(target: "relay-ext", method, "untagged extension event dropped");
                    return;
                };
                self.fan_out_event(tab_id, envelope);
            }
        }
    }

    fn fan_out_event(&mut self, tab_id: TabId, envelope: Envelope) {
        let Some(target_id) = self
            .targets
            .get_by_tab(tab_id)
            .map(|target| target.target_id.clone())
        else {
            return;
        };
        let routes: Vec<(ClientId, String)> = self
            .sessions
            .iter()
            .filter(|(_, record)| record.target_id == target_id)
            .map(|(session_id, record)| (record.client.clone(), session_id.clone()))
            .collect();
        for (client, session_id) in routes {
            let mut event = envelope.clone();
            event.id = None;
            event.session_id = Some(session_id);
            self.deliver_to(&client, &event);
        }
    }

    fn on_tab_attached(&mut self, tab_id: TabId, url: String, title: String) {
        if self.targets.get_by_tab(tab_id).is_some() {
            // Re-announce of a live tab (snapshot after reconnect overlaps a
            // queued lifecycle event); only the info may have moved.
            if let Some(target) = self.targets.tab_navigated(tab_id, url, title) {
                self.broadcast(&Envelope::event(
                    "Target.targetInfoChanged",
                    json!({"targetInfo": target.target_info(true)}),
                ));
            }
            return;
        }
        let target = self.targets.tab_attached(tab_id, url, title);
        info!(target: "relay-router", tab_id, target_id = %target.target_id, "target attached");
        self.broadcast(&Envelope::event(
            "Target.targetCreated",
            json!({"targetInfo": target.target_info(true)}),
        ));

        let auto_clients: Vec<ClientId> = self
            .clients
            .values()
            .filter(|record| record.auto_attach)
            .map(|record| record.id.clone())
            .collect();
        for client in auto_clients {
            if !self.client_has_session(&client, &target.target_id) {
                let session_id = self.mint_session(&client, &target.target_id);
                self.emit_attached(&client, &session_id, &target);
            }
        }
    }

    fn on_tab_detached(&mut self, tab_id: TabId) {
        let Some(target) = self.targets.tab_detached(tab_id) else {
            return;
        };
        self.destroy_target_sessions(&target);
        self.broadcast(&Envelope::event(
            "Target.targetDestroyed",
            json!({"targetId": target.target_id}),
        ));
    }

    /// Detach every session bound to the target, notifying each owner.
    fn destroy_target_sessions(&mut self, target: &TargetRecord) {
        let attached: Vec<(String, ClientId)> = self
            .sessions
            .iter()
            .filter(|(_, record)| record.target_id == target.target_id)
            .map(|(session_id, record)| (session_id.clone(), record.client.clone()))
            .collect();
        for (session_id, client) in attached {
            self.remove_session(&session_id);
            self.deliver_to(
                &client,
                &Envelope::event(
                    "Target.detachedFromTarget",
                    json!({"sessionId": session_id, "targetId": target.target_id}),
                ),
            );
        }
    }

    /// Extension outage path: every live target is frozen and announced as
    /// destroyed; reattachment within the TTL revives the same `targetId`.
    fn freeze_targets_with_events(&mut self) {
        for target in self.targets.freeze_all() {
            self.destroy_target_sessions(&target);
            self.broadcast(&Envelope::event(
                "Target.targetDestroyed",
                json!({"targetId": target.target_id}),
            ));
        }
    }

    // ---- recording ----

    fn on_recording_start(
        &mut self,
        request: StartRecordingRequest,
        reply: oneshot::Sender<StartRecordingReply>,
    ) {
        if !request.output_path.is_absolute() {
            let _ = reply.send(StartRecordingReply::failure("outputPath must be absolute"));
            return;
        }
        let tab_id = match &request.session_id {
            Some(session_id) => match self.resolve_session_tab_any(session_id) {
                Some(tab_id) => tab_id,
                None => {
                    let _ = reply.send(StartRecordingReply::failure(format!(
                        "No session with given id: {session_id}"
                    )));
                    return;
                }
            },
            None => match self.targets.first_attached() {
                Some(target) => target.tab_id,
                None => {
                    let _ = reply.send(StartRecordingReply::failure("no attached tab"));
                    return;
                }
            },
        };

        let started_at = match self.recordings.start(
            tab_id,
            request.session_id.clone(),
            request.output_path.clone(),
        ) {
            Ok(started_at) => started_at,
            Err(error) => {
                let _ = reply.send(StartRecordingReply::failure(error));
                return;
            }
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        let outcome = self.link.send_command(
            "startRecording",
            Some(json!({"tabId": tab_id})),
            None,
            PendingOrigin::Internal { reply: ack_tx },
        );
        if let SendOutcome::Rejected(..) = outcome {
            self.recordings.abort(tab_id);
            let _ = reply.send(StartRecordingReply::failure("Extension not connected"));
            return;
        }

        let handle = self.handle.sender();
        let started_stamp = started_at.to_rfc3339();
        tokio::spawn(async move {
            let outcome = match ack_rx.await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(error)) => Err(error.message),
                Err(_) => Err("Extension disconnected".to_string()),
            };
            match &outcome {
                Ok(()) => {
                    let _ = reply.send(StartRecordingReply {
                        success: true,
                        tab_id: Some(tab_id),
                        started_at: Some(started_stamp),
                        error: None,
                    });
                }
                Err(error) => {
                    let _ = reply.send(StartRecordingReply::failure(error.clone()));
                }
            }
            let _ = handle
                .send(RelayMsg::RecordingStarted { tab_id, outcome })
                .await;
        });
    }

    fn resolve_session_tab_any(&self, session_id: &str) -> Option<TabId> {
        let record = self.sessions.get(session_id)?;
        self.targets
            .get_by_target(&record.target_id)
            .map(|target| target.tab_id)
    }

    fn on_recording_stop(
        &mut self,
        session_id: Option<String>,
        reply: oneshot::Sender<StopRecordingReply>,
    ) {
        let selector = session_id.as_deref();
        let Some(tab_id) = self.recordings.find_tab(selector) else {
            let _ = reply.send(StopRecordingReply::failure("No active recording"));
            return;
        };
        if !self.link.is_connected() {
            self.recordings.fail_tab(tab_id, "Extension disconnected");
            let _ = reply.send(StopRecordingReply::failure("Extension not connected"));
            return;
        }

        let deadline = Instant::now() + self.config.recording_stop_deadline;
        self.recordings.begin_stop(selector, reply, deadline);

        let (ack_tx, ack_rx) = oneshot::channel();
        self.link.send_command(
            "stopRecording",
            Some(json!({"tabId": tab_id})),
            None,
            PendingOrigin::Internal { reply: ack_tx },
        );
        let handle = self.handle.sender();
        tokio::spawn(async move {
            if let Ok(Err(error)) = ack_rx.await {
                let _ = handle
                    .send(RelayMsg::RecordingStopFailed {
                        tab_id,
                        error: error.message,
                    })
                    .await;
            }
        });
    }

    /// `final: true` arrived: write the file off-actor and resolve the stop.
    fn finish_recording(&mut self, tab_id: TabId) {
        let Some((session, stop_reply)) = self.recordings.finalize(tab_id) else {
            debug!(target: "relay-recording", tab_id, "final chunk for unknown recording");
            return;
        };
        let duration_ms = (chrono::Utc::now() - session.started_at).num_milliseconds();
        tokio::spawn(async move {
            let outcome = write_output(&session.output_path, &session.chunks).await;
            let reply = match outcome {
                Ok(size) => {
                    info!(
                        target: "relay-recording",
                        tab_id,
                        size,
                        path = %session.output_path.display(),
                        "recording written"
                    );
                    StopRecordingReply {
                        success: true,
                        path: Some(session.output_path),
                        size: Some(size),
                        duration_ms: Some(duration_ms),
                        error: None,
                    }
                }
                Err(err) => StopRecordingReply::failure(format!("failed to write recording: {err}")),
            };
            if let Some(stop_reply) = stop_reply {
                let _ = stop_reply.send(reply);
            }
        });
    }

    fn on_recording_cancel(
        &mut self,
        session_id: Option<String>,
        reply: oneshot::Sender<StartRecordingReply>,
    ) {
        let Some(session) = self.recordings.cancel(session_id.as_deref()) else {
            let _ = reply.send(StartRecordingReply::failure("No active recording"));
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        self.link.send_command(
            "cancelRecording",
            Some(json!({"tabId": session.tab_id})),
            None,
            PendingOrigin::Internal { reply: ack_tx },
        );
        tokio::spawn(async move {
            let _ = ack_rx.await;
        });
        let _ = reply.send(StartRecordingReply {
            success: true,
            tab_id: Some(session.tab_id),
            started_at: None,
            error: None,
        });
    }

    fn on_recording_status(
        &mut self,
        session_id: Option<String>,
        reply: oneshot::Sender<RecordingStatusReply>,
    ) {
        if !self.link.is_connected() {
            let _ = reply.send(RecordingStatusReply {
                recording: false,
                tab_id: None,
                error: Some("Extension not connected".into()),
            });
            return;
        }
        let selector = session_id.as_deref();
        let tab_id = self
            .recordings
            .find_tab(selector)
            .or_else(|| session_id.as_deref().and_then(|sid| self.resolve_session_tab_any(sid)))
            .or_else(|| self.targets.first_attached().map(|target| target.tab_id));
        let Some(tab_id) = tab_id else {
            let _ = reply.send(RecordingStatusReply {
                recording: false,
                tab_id: None,
                error: None,
            });
            return;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        self.link.send_command(
            "isRecording",
            Some(json!({"tabId": tab_id})),
            None,
            PendingOrigin::Internal { reply: ack_tx },
        );
        tokio::spawn(async move {
            let response = match ack_rx.await {
                Ok(Ok(value)) => RecordingStatusReply {
                    recording: value["recording"].as_bool().unwrap_or(false),
                    tab_id: Some(tab_id),
                    error: None,
                },
                Ok(Err(error)) => RecordingStatusReply {
                    recording: false,
                    tab_id: Some(tab_id),
                    error: Some(error.message),
                },
                Err(_) => RecordingStatusReply {
                    recording: false,
                    tab_id: Some(tab_id),
                    error: Some("Extension disconnected".into()),
                },
            };
            let _ = reply.send(response);
        });
    }

    // ---- shared plumbing ----

    fn fail_origin(&mut self, origin: PendingOrigin, error: CdpError) {
        match origin {
            PendingOrigin::Client {
                client,
                id,
                session,
            } => {
                let mut reply = Envelope::error_response(id, error);
                reply.session_id = session;
                self.deliver_to(&client, &reply);
            }
            PendingOrigin::Internal { reply } => {
                let _ = reply.send(Err(error));
            }
        }
    }

    fn deliver_to(&mut self, client: &ClientId, envelope: &Envelope) {
        let Some(record) = self.clients.get(client) else {
            return;
        };
        match record.deliver(envelope) {
            DeliverOutcome::Ok => {}
            DeliverOutcome::Overflow => {
                record.close_overflow();
                self.dead_clients.push(client.clone());
            }
            DeliverOutcome::Gone => self.dead_clients.push(client.clone()),
        }
    }

    fn broadcast(&mut self, envelope: &Envelope) {
        let ids: Vec<ClientId> = self.clients.keys().cloned().collect();
        for client in ids {
            self.deliver_to(&client, envelope);
        }
    }

    /// Full teardown for one client: sessions dropped, and when it held the
    /// last session on a tab the extension is told to release its debugger.
    fn cleanup_client(&mut self, client: &ClientId) {
        let Some(record) = self.clients.remove(client) else {
            return;
        };
        info!(target: "relay-router", %client, sessions = record.sessions.len(), "cdp client gone");
        for session_id in record.sessions {
            let Some(target_id) = self.remove_session(&session_id) else {
                continue;
            };
            let orphaned = !self
                .sessions
                .values()
                .any(|other| other.target_id == target_id);
            if orphaned {
                if let Some(target) = self.targets.get_by_target(&target_id) {
                    self.link
                        .notify("detachTab", json!({"tabId": target.tab_id}));
                }
            }
        }
    }

    fn reap_dead(&mut self) {
        while let Some(client) = self.dead_clients.pop() {
            self.cleanup_client(&client);
        }
    }

    fn on_sweep(&mut self) {
        for (origin, error) in self.link.sweep(Instant::now()) {
            self.fail_origin(origin, error.to_cdp());
        }
        let expired = self.targets.sweep_frozen();
        if expired > 0 {
            debug!(target: "relay-targets", expired, "frozen target reservations dropped");
        }
        self.recordings.sweep(Instant::now());
    }

    fn on_heartbeat(&mut self) {
        match self.link.heartbeat_tick() {
            HeartbeatAction::Skip | HeartbeatAction::Pinged => {}
            HeartbeatAction::Expired => {
                warn!(target: "relay-ext", "extension heartbeat expired");
                self.link.close(CLOSE_PROTOCOL_ERROR, "heartbeat timeout");
                if let Some(conn) = self.link.current_conn() {
                    self.on_extension_lost(conn);
                }
            }
        }
    }

    /// Graceful drain: every client sees its sessions detach and targets
    /// disappear before the sockets close; the extension link goes last.
    fn on_shutdown(&mut self) {
        self.shutting_down = true;
        info!(target: "relay-router", clients = self.clients.len(), "relay draining");

        let session_routes: Vec<(String, ClientId, String)> = self
            .sessions
            .iter()
            .map(|(session_id, record)| {
                (
                    session_id.clone(),
                    record.client.clone(),
                    record.target_id.clone(),
                )
            })
            .collect();
        for (session_id, client, target_id) in session_routes {
            self.deliver_to(
                &client,
                &Envelope::event(
                    "Target.detachedFromTarget",
                    json!({"sessionId": session_id, "targetId": target_id}),
                ),
            );
        }
        let target_ids: Vec<String> = self
            .targets
            .iter()
            .map(|target| target.target_id.clone())
            .collect();
        for target_id in target_ids {
            self.broadcast(&Envelope::event(
                "Target.targetDestroyed",
                json!({"targetId": target_id}),
            ));
        }
        self.sessions.clear();

        for record in self.clients.values() {
            record.close(1001, "relay shutting down");
        }
        self.recordings.fail_all("relay shutting down");
        self.link.close(1001, "relay shutting down");
    }
}
