//! Reconnecting `/extension` socket.
//!
//! On socket loss the loop falls back to probing the relay's reachability
//! endpoint once a second; no events are emitted during the outage (the relay
//! rebuilds from the snapshot announced after reconnect).

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relay_wire::{decode, encode, Envelope, DEFAULT_MAX_FRAME_BYTES};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::proxy::{host_event_envelope, recorder_frames, ExtensionProxy};

#[derive(Clone, Debug)]
pub struct ExtensionClientConfig {
    /// HTTP base of the relay, e.g. `http://127.0.0.1:19988`.
    pub relay_http: Url,
    pub token: Option<String>,
    pub probe_interval: Duration,
}

impl ExtensionClientConfig {
    pub fn new(relay_http: Url) -> Self {
        Self {
            relay_http,
            token: None,
            probe_interval: Duration::from_secs(1),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn ws_url(&self) -> String {
        let mut url = self.relay_http.clone();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        let _ = url.set_scheme(scheme);
        url.set_path("/extension");
        if let Some(token) = &self.token {
            url.set_query(Some(&format!("token={token}")));
        }
        url.to_string()
    }

    fn probe_url(&self) -> String {
        let mut url = self.relay_http.clone();
        url.set_path("/");
        url.set_query(None);
        url.to_string()
    }
}

/// Run the extension side against a relay until the task is aborted.
pub async fn run_extension_proxy(
    proxy: ExtensionProxy,
    config: ExtensionClientConfig,
) -> Result<(), reqwest::Error> {
    let probe = reqwest::Client::builder()
        .timeout(config.probe_interval)
        .build()?;
    let ws_url = config.ws_url();
    let probe_url = config.probe_url();

    loop {
        if !relay_reachable(&probe, &probe_url).await {
            sleep(config.probe_interval).await;
            continue;
        }
        match connect_async(ws_url.as_str()).await {
            Ok((socket, _)) => {
                info!(target: "ext-client", url = %probe_url, "extension link established");
                run_connection(&proxy, socket).await;
                warn!(target: "ext-client", "extension link lost; falling back to probe loop");
            }
            Err(err) => {
                debug!(target: "ext-client", %err, "extension connect failed");
                sleep(config.probe_interval).await;
            }
        }
    }
}

async fn relay_reachable(probe: &reqwest::Client, url: &str) -> bool {
    matches!(probe.head(url).send().await, Ok(response) if response.status().is_success())
}

async fn run_connection(
    proxy: &ExtensionProxy,
    socket: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    for envelope in proxy.snapshot_envelopes().await {
        send_envelope(&out_tx, &envelope);
    }

    loop {
        tokio::select! {
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match decode(&text, DEFAULT_MAX_FRAME_BYTES) {
                            Ok(envelope) => {
                                if let Some(reply) = proxy.handle_envelope(envelope).await {
                                    send_envelope(&out_tx, &reply);
                                }
                            }
                            Err(err) => {
                                warn!(target: "ext-client", %err, "bad frame from relay");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = out_tx.send(Message::Pong(payload));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(target: "ext-client", ?frame, "relay closed the extension socket");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(target: "ext-client", %err, "extension socket error");
                        break;
                    }
                    None => break,
                }
            }
            event = proxy.next_debugger_event() => {
                let Some(event) = event else { break };
                send_envelope(&out_tx, &host_event_envelope(&event));
            }
            event = proxy.next_recorder_event() => {
                let Some(event) = event else { break };
                let (metadata, binary) = recorder_frames(event);
                // The binary frame must directly follow its metadata; both go
                // through the single writer so nothing interleaves.
                send_envelope(&out_tx, &metadata);
                if let Some(bytes) = binary {
                    let _ = out_tx.send(Message::Binary(bytes));
                }
            }
        }
    }

    writer.abort();
}

fn send_envelope(out_tx: &mpsc::UnboundedSender<Message>, envelope: &Envelope) {
    match encode(envelope) {
        Ok(text) => {
            let _ = out_tx.send(Message::Text(text));
        }
        Err(err) => warn!(target: "ext-client", %err, "failed to encode envelope"),
    }
}
