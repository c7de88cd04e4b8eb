//! Abstraction over the tab media recorder.
//!
//! The production binding wraps the platform `MediaRecorder`; chunks surface
//! as [`RecorderEvent::Chunk`] while it runs and a [`RecorderEvent::Finished`]
//! marks the flush after a stop. Cancel tears the recorder down without a
//! final marker.

use async_trait::async_trait;
use dashmap::DashMap;
use relay_wire::TabId;
use tokio::sync::mpsc;

use crate::debugger::HostError;

#[derive(Clone, Debug)]
pub enum RecorderEvent {
    Chunk { tab_id: TabId, bytes: Vec<u8> },
    /// All chunks flushed; nothing further follows for this tab.
    Finished { tab_id: TabId },
}

#[async_trait]
pub trait RecorderHost: Send + Sync {
    async fn start(&self, tab_id: TabId) -> Result<(), HostError>;
    async fn stop(&self, tab_id: TabId) -> Result<(), HostError>;
    async fn cancel(&self, tab_id: TabId) -> Result<(), HostError>;
    async fn is_recording(&self, tab_id: TabId) -> bool;
    async fn next_event(&self) -> Option<RecorderEvent>;
}

/// In-memory recorder scripted by tests: the driver pushes chunks while a
/// recording is active; `stop` emits the finished marker.
pub struct ScriptedRecorder {
    active: DashMap<TabId, ()>,
    events_tx: mpsc::UnboundedSender<RecorderEvent>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RecorderEvent>>,
}

impl ScriptedRecorder {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            active: DashMap::new(),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
        }
    }

    /// Emit one chunk for an active recording.
    pub fn push_chunk(&self, tab_id: TabId, bytes: Vec<u8>) -> bool {
        if !self.active.contains_key(&tab_id) {
            return false;
        }
        self.events_tx
            .send(RecorderEvent::Chunk { tab_id, bytes })
            .is_ok()
    }
}

impl Default for ScriptedRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecorderHost for ScriptedRecorder {
    async fn start(&self, tab_id: TabId) -> Result<(), HostError> {
        if self.active.insert(tab_id, ()).is_some() {
            return Err(HostError::Call(format!(
                "recorder already running for tab {tab_id}"
            )));
        }
        Ok(())
    }

    async fn stop(&self, tab_id: TabId) -> Result<(), HostError> {
        if self.active.remove(&tab_id).is_none() {
            return Err(HostError::Call(format!("no recorder for tab {tab_id}")));
        }
        let _ = self.events_tx.send(RecorderEvent::Finished { tab_id });
        Ok(())
    }

    async fn cancel(&self, tab_id: TabId) -> Result<(), HostError> {
        self.active.remove(&tab_id);
        Ok(())
    }

    async fn is_recording(&self, tab_id: TabId) -> bool {
        self.active.contains_key(&tab_id)
    }

    async fn next_event(&self) -> Option<RecorderEvent> {
        self.events_rx.lock().await.recv().await
    }
}
