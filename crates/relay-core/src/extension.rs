//! The single privileged extension link.
//!
//! Owns the extension-visible request-id space, the pending-request table,
//! the idle-grace queue, and the heartbeat counters. A second `/extension`
//! connection replaces the first; the displaced socket's in-flight requests
//! fail with a distinguishable error. The router drives this from the relay
//! actor, so none of this needs its own locking.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use relay_wire::{encode, CdpError, Envelope, CLOSE_PROTOCOL_ERROR};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::clients::ClientId;
use crate::config::{IdlePolicy, RelayConfig};
use crate::error::{RelayError, RelayErrorKind};

/// Frames flowing from the relay to the extension socket.
#[derive(Debug)]
pub enum ExtFrameOut {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
}

/// Who is waiting on an extension-bound request.
pub enum PendingOrigin {
    /// A CDP client request; the response is rewritten back into its id and
    /// session namespace.
    Client {
        client: ClientId,
        id: u64,
        session: Option<String>,
    },
    /// A relay-internal request (recording control); resolved via oneshot.
    Internal {
        reply: oneshot::Sender<Result<Value, CdpError>>,
    },
}

struct Pending {
    origin: PendingOrigin,
    deadline: Instant,
}

struct QueuedCommand {
    method: String,
    params: Option<Value>,
    session_tag: Option<String>,
    origin: PendingOrigin,
    deadline: Instant,
}

enum LinkState {
    Idle,
    Connected {
        conn: u64,
        tx: mpsc::UnboundedSender<ExtFrameOut>,
    },
}

pub enum SendOutcome {
    Sent,
    Queued,
    Rejected(PendingOrigin, RelayError),
}

pub enum HeartbeatAction {
    Skip,
    Pinged,
    /// Too many unanswered pings; the caller must drop the link.
    Expired,
}

pub struct ExtensionLink {
    state: LinkState,
    next_conn: u64,
    next_ext_id: u64,
    pending: HashMap<u64, Pending>,
    waiting: VecDeque<QueuedCommand>,
    unanswered_pings: u32,
    idle_policy: IdlePolicy,
    idle_grace: Duration,
    request_deadline: Duration,
    heartbeat_misses: u32,
}

impl ExtensionLink {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            state: LinkState::Idle,
            next_conn: 0,
            next_ext_id: 0,
            pending: HashMap::new(),
            waiting: VecDeque::new(),
            unanswered_pings: 0,
            idle_policy: config.idle_policy,
            idle_grace: config.idle_grace,
            request_deadline: config.request_deadline,
            heartbeat_misses: config.heartbeat_misses,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, LinkState::Connected { .. })
    }

    pub fn current_conn(&self) -> Option<u64> {
        match &self.state {
            LinkState::Connected { conn, .. } => Some(*conn),
            LinkState::Idle => None,
        }
    }

    /// Bind a new extension socket. Returns the connection id, the outbound
    /// frame stream for its pump, and, when it displaced a previous socket,
    /// the origins whose in-flight requests must fail as replaced.
    pub fn connect(&mut self) -> (u64, mpsc::UnboundedReceiver<ExtFrameOut>, Vec<PendingOrigin>) {
        let mut displaced = Vec::new();
        let old = std::mem::replace(&mut self.state, LinkState::Idle);
        if let LinkState::Connected { conn, tx } = old {
            warn!(target: "relay-ext", old_conn = conn, "extension link replaced by new connection");
            let _ = tx.send(ExtFrameOut::Close {
                code: CLOSE_PROTOCOL_ERROR,
                reason: "replaced by new extension connection".into(),
            });
            displaced = self.drain_pending();
        }

        self.next_conn += 1;
        let conn = self.next_conn;
        let (tx, rx) = mpsc::unbounded_channel();
        self.state = LinkState::Connected { conn, tx };
        self.unanswered_pings = 0;
        (conn, rx, displaced)
    }

    /// The socket with this connection id went away. Returns the drained
    /// in-flight origins, or `None` when the id is stale (already replaced).
    pub fn disconnect(&mut self, conn: u64) -> Option<Vec<PendingOrigin>> {
        match &self.state {
            LinkState::Connected { conn: current, .. } if *current == conn => {
                self.state = LinkState::Idle;
                self.unanswered_pings = 0;
                Some(self.drain_pending())
            }
            _ => None,
        }
    }

    /// Forward one command to the extension, allocating an extension-side id
    /// and recording the origin. While idle, the command queues for one grace
    /// interval under [`IdlePolicy::Wait`] and is rejected otherwise.
    pub fn send_command(
        &mut self,
        method: impl Into<String>,
        params: Option<Value>,
        session_tag: Option<String>,
        origin: PendingOrigin,
    ) -> SendOutcome {
        let method = method.into();
        match &self.state {
            LinkState::Connected { .. } => {
                self.dispatch(method, params, session_tag, origin);
                SendOutcome::Sent
            }
            LinkState::Idle => match self.idle_policy {
                IdlePolicy::Wait => {
                    debug!(target: "relay-ext", %method, "extension idle; queueing command");
                    self.waiting.push_back(QueuedCommand {
                        method,
                        params,
                        session_tag,
                        origin,
                        deadline: Instant::now() + self.idle_grace,
                    });
                    SendOutcome::Queued
                }
                IdlePolicy::Reject => SendOutcome::Rejected(
                    origin,
                    RelayError::new(RelayErrorKind::ExtensionUnavailable).with_hint(method),
                ),
            },
        }
    }

    /// Fire-and-forget notification toward the extension. Dropped while idle.
    pub fn notify(&mut self, method: impl Into<String>, params: Value) {
        if let LinkState::Connected { tx, .. } = &self.state {
            let envelope = Envelope::event(method, params);
            if let Ok(text) = encode(&envelope) {
                let _ = tx.send(ExtFrameOut::Text(text));
            }
        }
    }

    /// Resolve an extension response id back to its origin.
    pub fn take_response(&mut self, ext_id: u64) -> Option<PendingOrigin> {
        self.pending.remove(&ext_id).map(|pending| pending.origin)
    }

    /// Send every command queued while idle. Called right after a connect.
    pub fn flush_waiting(&mut self) {
        if !self.is_connected() {
            return;
        }
        while let Some(queued) = self.waiting.pop_front() {
            self.dispatch(queued.method, queued.params, queued.session_tag, queued.origin);
        }
    }

    /// Expire in-flight requests past their deadline and queued commands past
    /// the idle grace. Returns the failures the router must deliver.
    pub fn sweep(&mut self, now: Instant) -> Vec<(PendingOrigin, RelayError)> {
        let mut failed = Vec::new();

        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(ext_id, _)| *ext_id)
            .collect();
        for ext_id in expired {
            if let Some(pending) = self.pending.remove(&ext_id) {
                warn!(target: "relay-ext", ext_id, "extension request timed out");
                failed.push((
                    pending.origin,
                    RelayError::new(RelayErrorKind::Timeout)
                        .with_hint(format!("extension request {ext_id}")),
                ));
            }
        }

        while matches!(self.waiting.front(), Some(queued) if queued.deadline <= now) {
            if let Some(queued) = self.waiting.pop_front() {
                failed.push((
                    queued.origin,
                    RelayError::new(RelayErrorKind::ExtensionUnavailable).with_hint(queued.method),
                ));
            }
        }

        failed
    }

    pub fn heartbeat_tick(&mut self) -> HeartbeatAction {
        match &self.state {
            LinkState::Idle => HeartbeatAction::Skip,
            LinkState::Connected { tx, .. } => {
                if self.unanswered_pings >= self.heartbeat_misses {
                    return HeartbeatAction::Expired;
                }
                let _ = tx.send(ExtFrameOut::Ping);
                self.unanswered_pings += 1;
                HeartbeatAction::Pinged
            }
        }
    }

    pub fn pong(&mut self, conn: u64) {
        if self.current_conn() == Some(conn) {
            self.unanswered_pings = 0;
        }
    }

    pub fn close(&mut self, code: u16, reason: &str) {
        if let LinkState::Connected { tx, .. } = &self.state {
            let _ = tx.send(ExtFrameOut::Close {
                code,
                reason: reason.into(),
            });
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn dispatch(
        &mut self,
        method: String,
        params: Option<Value>,
        session_tag: Option<String>,
        origin: PendingOrigin,
    ) {
        self.next_ext_id += 1;
        let ext_id = self.next_ext_id;

        // A request frame must always carry `params`; the wire layer rejects
        // id+method frames without it.
        let params = Some(params.unwrap_or_else(|| serde_json::json!({})));
        let mut envelope = Envelope::request(ext_id, method, params);
        envelope.session_id = session_tag;

        let LinkState::Connected { tx, .. } = &self.state else {
            return;
        };
        match encode(&envelope) {
            Ok(text) => {
                self.pending.insert(
                    ext_id,
                    Pending {
                        origin,
                        deadline: Instant::now() + self.request_deadline,
                    },
                );
                let _ = tx.send(ExtFrameOut::Text(text));
            }
            Err(err) => {
                warn!(target: "relay-ext", %err, "failed to encode extension command");
            }
        }
    }

    fn drain_pending(&mut self) -> Vec<PendingOrigin> {
        self.pending
            .drain()
            .map(|(_, pending)| pending.origin)
            .collect()
    }
}
