//! Per-client records. Each `/cdp/<id>` socket gets one record holding its
//! outbound channel, its byte budget, and the sessions it currently observes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use relay_wire::{encode, Envelope, CLOSE_POLICY_VIOLATION};
use tokio::sync::mpsc;
use tracing::warn;

/// Stable identifier taken from the `/cdp/<id>` URL path. Used for logging
/// and bookkeeping only; it is never a session id.
pub type ClientId = String;

/// Frames flowing from the relay to one client socket.
#[derive(Clone, Debug)]
pub enum ClientFrameOut {
    Text(String),
    Close { code: u16, reason: String },
}

pub enum DeliverOutcome {
    Ok,
    /// The client's outbound buffer crossed the high-water mark; the caller
    /// must drop the client.
    Overflow,
    /// The socket pump is gone; the caller must reap the record.
    Gone,
}

pub struct ClientRecord {
    pub id: ClientId,
    tx: mpsc::UnboundedSender<ClientFrameOut>,
    /// Bytes accepted but not yet written by the socket pump. Shared with the
    /// pump, which subtracts as frames drain.
    queued_bytes: Arc<AtomicUsize>,
    buffer_limit: usize,
    /// `Target.setAutoAttach {autoAttach: true}` has been seen.
    pub auto_attach: bool,
    /// Session ids this client currently observes as attached.
    pub sessions: HashSet<String>,
    /// Count of target-lifecycle events sequenced toward this client.
    pub lifecycle_seq: u64,
}

impl ClientRecord {
    pub fn new(
        id: ClientId,
        tx: mpsc::UnboundedSender<ClientFrameOut>,
        queued_bytes: Arc<AtomicUsize>,
        buffer_limit: usize,
    ) -> Self {
        Self {
            id,
            tx,
            queued_bytes,
            buffer_limit,
            auto_attach: false,
            sessions: HashSet::new(),
            lifecycle_seq: 0,
        }
    }

    /// Enqueue one envelope for the socket pump, enforcing the byte budget.
    pub fn deliver(&self, envelope: &Envelope) -> DeliverOutcome {
        let text = match encode(envelope) {
            Ok(text) => text,
            Err(err) => {
                warn!(target: "relay-clients", client = %self.id, %err, "failed to encode outbound frame");
                return DeliverOutcome::Ok;
            }
        };

        let queued = self.queued_bytes.fetch_add(text.len(), Ordering::AcqRel) + text.len();
        if queued > self.buffer_limit {
            warn!(
                target: "relay-clients",
                client = %self.id,
                queued,
                limit = self.buffer_limit,
                "client outbound buffer overflow"
            );
            return DeliverOutcome::Overflow;
        }

        match self.tx.send(ClientFrameOut::Text(text)) {
            Ok(()) => DeliverOutcome::Ok,
            Err(_) => DeliverOutcome::Gone,
        }
    }

    /// Ask the socket pump to close with the given code. Best effort; the
    /// pump may already be gone.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.tx.send(ClientFrameOut::Close {
            code,
            reason: reason.into(),
        });
    }

    pub fn close_overflow(&self) {
        self.close(CLOSE_POLICY_VIOLATION, "outbound buffer limit exceeded");
    }
}
