//! Recording side channel, relay half.
//!
//! Chunks arrive as binary frames, each announced by a preceding
//! `recordingData` metadata envelope that names the tab. The metadata fills a
//! single routing slot; the next binary frame consumes it. A stray binary
//! frame (no slot) is dropped, never misrouted. `final: true` closes the
//! accumulator: chunks are concatenated and written in one pass, then the
//! pending `stopRecording` caller is resolved.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use relay_wire::TabId;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::handle::StopRecordingReply;

pub struct RecordingSession {
    pub tab_id: TabId,
    /// Client session id supplied at start, if any. Used only to select the
    /// recording in later calls.
    pub session_id: Option<String>,
    pub output_path: PathBuf,
    pub chunks: Vec<Vec<u8>>,
    pub started_at: DateTime<Utc>,
    stop: Option<StopWaiter>,
}

struct StopWaiter {
    reply: oneshot::Sender<StopRecordingReply>,
    deadline: Instant,
}

impl RecordingSession {
    pub fn total_bytes(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }
}

/// How a caller names a recording: by the session id given at start, or the
/// only active recording when omitted.
pub fn selector_matches(session: &RecordingSession, selector: Option<&str>) -> bool {
    match selector {
        Some(wanted) => session.session_id.as_deref() == Some(wanted),
        None => true,
    }
}

pub enum BinaryOutcome {
    Routed { tab_id: TabId, bytes: usize },
    Dropped,
}

#[derive(Default)]
pub struct RecordingManager {
    sessions: HashMap<TabId, RecordingSession>,
    /// Tab named by the most recent non-final `recordingData` metadata; the
    /// next binary frame consumes it.
    last_meta: Option<TabId>,
}

impl RecordingManager {
    pub fn start(
        &mut self,
        tab_id: TabId,
        session_id: Option<String>,
        output_path: PathBuf,
    ) -> Result<DateTime<Utc>, String> {
        if self.sessions.contains_key(&tab_id) {
            return Err(format!("recording already active for tab {tab_id}"));
        }
        let started_at = Utc::now();
        self.sessions.insert(
            tab_id,
            RecordingSession {
                tab_id,
                session_id,
                output_path,
                chunks: Vec::new(),
                started_at,
                stop: None,
            },
        );
        Ok(started_at)
    }

    /// Undo a provisional `start` after the extension refused it.
    pub fn abort(&mut self, tab_id: TabId) {
        self.sessions.remove(&tab_id);
    }

    /// Non-final metadata: arm the routing slot for the next binary frame.
    pub fn note_metadata(&mut self, tab_id: TabId) {
        if !self.sessions.contains_key(&tab_id) {
            warn!(target: "relay-recording", tab_id, "recordingData for unknown recording");
            return;
        }
        self.last_meta = Some(tab_id);
    }

    pub fn push_binary(&mut self, bytes: Vec<u8>) -> BinaryOutcome {
        let Some(tab_id) = self.last_meta.take() else {
            warn!(
                target: "relay-recording",
                len = bytes.len(),
                "binary frame without preceding recordingData metadata; dropping"
            );
            return BinaryOutcome::Dropped;
        };
        let Some(session) = self.sessions.get_mut(&tab_id) else {
            warn!(target: "relay-recording", tab_id, "binary frame for finished recording; dropping");
            return BinaryOutcome::Dropped;
        };
        let len = bytes.len();
        session.chunks.push(bytes);
        debug!(target: "relay-recording", tab_id, len, total = session.total_bytes(), "chunk accumulated");
        BinaryOutcome::Routed { tab_id, bytes: len }
    }

    /// Attach the pending `stopRecording` resolver to its recording.
    pub fn begin_stop(
        &mut self,
        selector: Option<&str>,
        reply: oneshot::Sender<StopRecordingReply>,
        deadline: Instant,
    ) -> Option<TabId> {
        let session = self
            .sessions
            .values_mut()
            .find(|session| selector_matches(session, selector))?;
        session.stop = Some(StopWaiter { reply, deadline });
        Some(session.tab_id)
    }

    /// `final: true` arrived: detach the session for writing. The caller
    /// performs the file write and resolves the returned waiter.
    pub fn finalize(
        &mut self,
        tab_id: TabId,
    ) -> Option<(RecordingSession, Option<oneshot::Sender<StopRecordingReply>>)> {
        if self.last_meta == Some(tab_id) {
            self.last_meta = None;
        }
        let mut session = self.sessions.remove(&tab_id)?;
        let reply = session.stop.take().map(|waiter| waiter.reply);
        Some((session, reply))
    }

    pub fn cancel(&mut self, selector: Option<&str>) -> Option<RecordingSession> {
        let tab_id = self
            .sessions
            .values()
            .find(|session| selector_matches(session, selector))
            .map(|session| session.tab_id)?;
        if self.last_meta == Some(tab_id) {
            self.last_meta = None;
        }
        self.sessions.remove(&tab_id)
    }

    pub fn find_tab(&self, selector: Option<&str>) -> Option<TabId> {
        self.sessions
            .values()
            .find(|session| selector_matches(session, selector))
            .map(|session| session.tab_id)
    }

    /// Discard one recording, resolving its pending stop with a failure.
    pub fn fail_tab(&mut self, tab_id: TabId, error: &str) {
        if self.last_meta == Some(tab_id) {
            self.last_meta = None;
        }
        if let Some(mut session) = self.sessions.remove(&tab_id) {
            if let Some(waiter) = session.stop.take() {
                let _ = waiter.reply.send(StopRecordingReply::failure(error));
            }
        }
    }

    /// Extension link went down: resolve every pending stop with a failure
    /// and discard all accumulated chunks. No partial files.
    pub fn fail_all(&mut self, error: &str) {
        self.last_meta = None;
        for (_, mut session) in self.sessions.drain() {
            if let Some(waiter) = session.stop.take() {
                let _ = waiter.reply.send(StopRecordingReply::failure(error));
            }
        }
    }

    /// Expire stop waiters past their deadline; the recording is discarded.
    pub fn sweep(&mut self, now: Instant) {
        let expired: Vec<TabId> = self
            .sessions
            .values()
            .filter(|session| {
                session
                    .stop
                    .as_ref()
                    .is_some_and(|waiter| waiter.deadline <= now)
            })
            .map(|session| session.tab_id)
            .collect();
        for tab_id in expired {
            if let Some(mut session) = self.sessions.remove(&tab_id) {
                warn!(target: "relay-recording", tab_id, "no final recording chunk before deadline");
                if let Some(waiter) = session.stop.take() {
                    let _ = waiter
                        .reply
                        .send(StopRecordingReply::failure("Timeout waiting for recording data"));
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Concatenate chunks and write the output in a single pass, creating parent
/// directories as needed. Returns the byte count written.
pub async fn write_output(path: &Path, chunks: &[Vec<u8>]) -> std::io::Result<usize> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut buffer = Vec::with_capacity(chunks.iter().map(Vec::len).sum());
    for chunk in chunks {
        buffer.extend_from_slice(chunk);
    }
    tokio::fs::write(path, &buffer).await?;
    Ok(buffer.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_recording(tab_id: TabId) -> RecordingManager {
        let mut manager = RecordingManager::default();
        manager
            .start(tab_id, Some("s1".into()), PathBuf::from("/tmp/out.webm"))
            .expect("start");
        manager
    }

    #[test]
    fn metadata_then_binary_routes_to_the_recording() {
        let mut manager = manager_with_recording(42);
        manager.note_metadata(42);
        assert!(matches!(
            manager.push_binary(vec![0, 1, 2]),
            BinaryOutcome::Routed { tab_id: 42, bytes: 3 }
        ));
        let (session, _) = manager.finalize(42).expect("session");
        assert_eq!(session.total_bytes(), 3);
    }

    #[test]
    fn stray_binary_is_dropped_not_misrouted() {
        let mut manager = manager_with_recording(42);
        assert!(matches!(manager.push_binary(vec![9]), BinaryOutcome::Dropped));

        manager.note_metadata(42);
        manager.push_binary(vec![1]);
        // Slot consumed; a second binary without fresh metadata is dropped.
        assert!(matches!(manager.push_binary(vec![2]), BinaryOutcome::Dropped));
        let (session, _) = manager.finalize(42).expect("session");
        assert_eq!(session.total_bytes(), 1);
    }

    #[test]
    fn duplicate_start_is_refused() {
        let mut manager = manager_with_recording(42);
        let err = manager
            .start(42, None, PathBuf::from("/tmp/other.webm"))
            .expect_err("second start");
        assert!(err.contains("already active"));
    }

    #[tokio::test]
    async fn stop_waiter_expires_with_timeout_reply() {
        let mut manager = manager_with_recording(42);
        let (tx, rx) = oneshot::channel();
        manager.begin_stop(Some("s1"), tx, Instant::now());
        manager.sweep(Instant::now());
        let reply = rx.await.expect("resolved");
        assert!(!reply.success);
        assert_eq!(reply.error.as_deref(), Some("Timeout waiting for recording data"));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn fail_all_discards_chunks_and_resolves_stops() {
        let mut manager = manager_with_recording(42);
        manager.note_metadata(42);
        manager.push_binary(vec![1, 2, 3]);
        let (tx, rx) = oneshot::channel();
        manager.begin_stop(None, tx, Instant::now() + std::time::Duration::from_secs(30));

        manager.fail_all("Extension disconnected");
        let reply = rx.await.expect("resolved");
        assert!(!reply.success);
        assert_eq!(reply.error.as_deref(), Some("Extension disconnected"));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn write_output_concatenates_byte_exact() {
        let dir = std::env::temp_dir().join(format!("relay-rec-{}", std::process::id()));
        let path = dir.join("nested/out.webm");
        let chunks = vec![vec![0u8, 1, 2], vec![3u8, 4]];
        let written = write_output(&path, &chunks).await.expect("write");
        assert_eq!(written, 5);
        let on_disk = tokio::fs::read(&path).await.expect("read back");
        assert_eq!(on_disk, vec![0, 1, 2, 3, 4]);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
