//! Messages into the relay actor and the cheap clonable handle the server
//! layer holds. Every mutation of shared relay state travels through
//! [`RelayMsg`]; replies come back on oneshots.

use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use relay_wire::TabId;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::clients::{ClientFrameOut, ClientId};
use crate::extension::ExtFrameOut;

/// Why a `/cdp` connection was turned away at the door.
#[derive(Clone, Debug)]
pub struct ConnectReject {
    pub code: u16,
    pub reason: String,
}

/// Accepted `/cdp` connection: the socket pump drains `outbound`, keeps
/// `queued_bytes` honest as frames leave the process, and addresses the relay
/// with `client_key` (the path id, suffixed when two clients collide on it).
pub struct ClientConnection {
    pub client_key: ClientId,
    pub outbound: mpsc::UnboundedReceiver<ClientFrameOut>,
    pub queued_bytes: Arc<AtomicUsize>,
}

/// Accepted `/extension` connection.
pub struct ExtensionConnection {
    pub conn: u64,
    pub outbound: mpsc::UnboundedReceiver<ExtFrameOut>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StartRecordingRequest {
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
    #[serde(rename = "outputPath")]
    pub output_path: PathBuf,
}

#[derive(Clone, Debug, Serialize)]
pub struct StartRecordingReply {
    pub success: bool,
    #[serde(rename = "tabId", skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
    #[serde(rename = "startedAt", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StartRecordingReply {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            tab_id: None,
            started_at: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StopRecordingReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(rename = "durationMs", skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StopRecordingReply {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            path: None,
            size: None,
            duration_ms: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RecordingStatusReply {
    pub recording: bool,
    #[serde(rename = "tabId", skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    #[serde(rename = "extensionConnected")]
    pub extension_connected: bool,
    pub clients: usize,
    pub targets: usize,
    pub recordings: usize,
}

pub enum RelayMsg {
    ClientConnect {
        id: ClientId,
        reply: oneshot::Sender<Result<ClientConnection, ConnectReject>>,
    },
    ClientText {
        id: ClientId,
        text: String,
    },
    ClientClosed {
        id: ClientId,
    },
    ExtensionConnect {
        reply: oneshot::Sender<ExtensionConnection>,
    },
    ExtensionText {
        conn: u64,
        text: String,
    },
    ExtensionBinary {
        conn: u64,
        bytes: Vec<u8>,
    },
    ExtensionPong {
        conn: u64,
    },
    ExtensionClosed {
        conn: u64,
    },
    RecordingStart {
        request: StartRecordingRequest,
        reply: oneshot::Sender<StartRecordingReply>,
    },
    RecordingStarted {
        tab_id: TabId,
        outcome: Result<(), String>,
    },
    RecordingStop {
        session_id: Option<String>,
        reply: oneshot::Sender<StopRecordingReply>,
    },
    RecordingStopFailed {
        tab_id: TabId,
        error: String,
    },
    RecordingCancel {
        session_id: Option<String>,
        reply: oneshot::Sender<StartRecordingReply>,
    },
    RecordingStatus {
        session_id: Option<String>,
        reply: oneshot::Sender<RecordingStatusReply>,
    },
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Clonable entry point into the relay actor.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayMsg>,
}

impl RelayHandle {
    pub fn new(tx: mpsc::Sender<RelayMsg>) -> Self {
        Self { tx }
    }

    pub async fn client_connect(&self, id: ClientId) -> Result<ClientConnection, ConnectReject> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RelayMsg::ClientConnect { id, reply }).await.is_err() {
            return Err(ConnectReject {
                code: relay_wire::CLOSE_INTERNAL_ERROR,
                reason: "relay shutting down".into(),
            });
        }
        rx.await.unwrap_or_else(|_| {
            Err(ConnectReject {
                code: relay_wire::CLOSE_INTERNAL_ERROR,
                reason: "relay shutting down".into(),
            })
        })
    }

    pub async fn client_text(&self, id: ClientId, text: String) {
        let _ = self.tx.send(RelayMsg::ClientText { id, text }).await;
    }

    pub async fn client_closed(&self, id: ClientId) {
        let _ = self.tx.send(RelayMsg::ClientClosed { id }).await;
    }

    pub async fn extension_connect(&self) -> Option<ExtensionConnection> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RelayMsg::ExtensionConnect { reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn extension_text(&self, conn: u64, text: String) {
        let _ = self.tx.send(RelayMsg::ExtensionText { conn, text }).await;
    }

    pub async fn extension_binary(&self, conn: u64, bytes: Vec<u8>) {
        let _ = self.tx.send(RelayMsg::ExtensionBinary { conn, bytes }).await;
    }

    pub async fn extension_pong(&self, conn: u64) {
        let _ = self.tx.send(RelayMsg::ExtensionPong { conn }).await;
    }

    pub async fn extension_closed(&self, conn: u64) {
        let _ = self.tx.send(RelayMsg::ExtensionClosed { conn }).await;
    }

    pub async fn recording_start(&self, request: StartRecordingRequest) -> StartRecordingReply {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RelayMsg::RecordingStart { request, reply })
            .await
            .is_err()
        {
            return StartRecordingReply::failure("relay shutting down");
        }
        rx.await
            .unwrap_or_else(|_| StartRecordingReply::failure("relay shutting down"))
    }

    pub async fn recording_stop(&self, session_id: Option<String>) -> StopRecordingReply {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RelayMsg::RecordingStop { session_id, reply })
            .await
            .is_err()
        {
            return StopRecordingReply::failure("relay shutting down");
        }
        rx.await
            .unwrap_or_else(|_| StopRecordingReply::failure("relay shutting down"))
    }

    pub async fn recording_cancel(&self, session_id: Option<String>) -> StartRecordingReply {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RelayMsg::RecordingCancel { session_id, reply })
            .await
            .is_err()
        {
            return StartRecordingReply::failure("relay shutting down");
        }
        rx.await
            .unwrap_or_else(|_| StartRecordingReply::failure("relay shutting down"))
    }

    pub async fn recording_status(&self, session_id: Option<String>) -> RecordingStatusReply {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RelayMsg::RecordingStatus { session_id, reply })
            .await
            .is_err()
        {
            return RecordingStatusReply {
                recording: false,
                tab_id: None,
                error: Some("relay shutting down".into()),
            };
        }
        rx.await.unwrap_or(RecordingStatusReply {
            recording: false,
            tab_id: None,
            error: Some("relay shutting down".into()),
        })
    }

    pub async fn status(&self) -> StatusSnapshot {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RelayMsg::Status { reply }).await.is_err() {
            return StatusSnapshot {
                extension_connected: false,
                clients: 0,
                targets: 0,
                recordings: 0,
            };
        }
        rx.await.unwrap_or(StatusSnapshot {
            extension_connected: false,
            clients: 0,
            targets: 0,
            recordings: 0,
        })
    }

    /// Drain every connection and stop the actor. Resolves once lifecycle
    /// events have been queued toward all clients.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RelayMsg::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<RelayMsg> {
        self.tx.clone()
    }
}
