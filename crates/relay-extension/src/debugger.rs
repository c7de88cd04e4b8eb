//! Abstraction over the platform debugger surface.
//!
//! A production binding maps these calls onto the browser's debugger API
//! (attach/detach per tab, sendCommand, event capture). [`ScriptedDebugger`]
//! is the in-memory host used by tests and local development; it records
//! every command and lets the driver script tab lifecycle and events.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use relay_wire::TabId;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Clone, Debug, Error)]
pub enum HostError {
    #[error("no debugger attachment for tab {0}")]
    NotAttached(TabId),
    #[error("debugger call failed: {0}")]
    Call(String),
}

/// Everything the platform reports upward: tab lifecycle plus captured
/// debugger events.
#[derive(Clone, Debug)]
pub enum HostEvent {
    TabAttached {
        tab_id: TabId,
        url: String,
        title: String,
    },
    TabNavigated {
        tab_id: TabId,
        url: String,
        title: String,
    },
    TabDetached {
        tab_id: TabId,
        reason: String,
    },
    Debugger {
        tab_id: TabId,
        method: String,
        params: Value,
    },
}

#[derive(Clone, Debug)]
pub struct TabSnapshot {
    pub tab_id: TabId,
    pub url: String,
    pub title: String,
}

#[async_trait]
pub trait DebuggerHost: Send + Sync {
    async fn attach(&self, tab_id: TabId) -> Result<(), HostError>;
    async fn detach(&self, tab_id: TabId) -> Result<(), HostError>;
    async fn send_command(
        &self,
        tab_id: TabId,
        method: &str,
        params: Value,
    ) -> Result<Value, HostError>;
    /// Next lifecycle or debugger event; `None` once the host is closed.
    async fn next_event(&self) -> Option<HostEvent>;
    /// Current attachments, re-announced after every reconnect.
    async fn attached_tabs(&self) -> Vec<TabSnapshot>;
}

/// In-memory host scripted by tests: tabs open and close on demand, commands
/// are recorded, responses come from a canned table (default `{}`).
pub struct ScriptedDebugger {
    tabs: DashMap<TabId, TabSnapshot>,
    canned: DashMap<String, Value>,
    commands: Mutex<Vec<(TabId, String, Value)>>,
    events_tx: mpsc::UnboundedSender<HostEvent>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<HostEvent>>,
}

impl ScriptedDebugger {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            tabs: DashMap::new(),
            canned: DashMap::new(),
            commands: Mutex::new(Vec::new()),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
        }
    }

    /// Simulate the user enabling the extension on a tab.
    pub fn open_tab(&self, tab_id: TabId, url: &str, title: &str) {
        let snapshot = TabSnapshot {
            tab_id,
            url: url.to_string(),
            title: title.to_string(),
        };
        self.tabs.insert(tab_id, snapshot);
        let _ = self.events_tx.send(HostEvent::TabAttached {
            tab_id,
            url: url.to_string(),
            title: title.to_string(),
        });
    }

    pub fn navigate_tab(&self, tab_id: TabId, url: &str, title: &str) {
        if let Some(mut entry) = self.tabs.get_mut(&tab_id) {
            entry.url = url.to_string();
            entry.title = title.to_string();
        }
        let _ = self.events_tx.send(HostEvent::TabNavigated {
            tab_id,
            url: url.to_string(),
            title: title.to_string(),
        });
    }

    pub fn close_tab(&self, tab_id: TabId) {
        self.tabs.remove(&tab_id);
        let _ = self.events_tx.send(HostEvent::TabDetached {
            tab_id,
            reason: "target_closed".to_string(),
        });
    }

    pub fn emit_debugger_event(&self, tab_id: TabId, method: &str, params: Value) {
        let _ = self.events_tx.send(HostEvent::Debugger {
            tab_id,
            method: method.to_string(),
            params,
        });
    }

    /// Fix the result returned for a method; unset methods answer `{}`.
    pub fn set_response(&self, method: &str, result: Value) {
        self.canned.insert(method.to_string(), result);
    }

    pub fn sent_commands(&self) -> Vec<(TabId, String, Value)> {
        self.commands.lock().clone()
    }
}

impl Default for ScriptedDebugger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DebuggerHost for ScriptedDebugger {
    async fn attach(&self, tab_id: TabId) -> Result<(), HostError> {
        if !self.tabs.contains_key(&tab_id) {
            return Err(HostError::NotAttached(tab_id));
        }
        Ok(())
    }

    async fn detach(&self, tab_id: TabId) -> Result<(), HostError> {
        if self.tabs.remove(&tab_id).is_none() {
            return Err(HostError::NotAttached(tab_id));
        }
        let _ = self.events_tx.send(HostEvent::TabDetached {
            tab_id,
            reason: "target_closed".to_string(),
        });
        Ok(())
    }

    async fn send_command(
        &self,
        tab_id: TabId,
        method: &str,
        params: Value,
    ) -> Result<Value, HostError> {
        if !self.tabs.contains_key(&tab_id) {
            return Err(HostError::NotAttached(tab_id));
        }
        self.commands
            .lock()
            .push((tab_id, method.to_string(), params));
        Ok(self
            .canned
            .get(method)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| json!({})))
    }

    async fn next_event(&self) -> Option<HostEvent> {
        self.events_rx.lock().await.recv().await
    }

    async fn attached_tabs(&self) -> Vec<TabSnapshot> {
        self.tabs.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commands_fail_without_attachment() {
        let host = ScriptedDebugger::new();
        let err = host
            .send_command(42, "Page.enable", json!({}))
            .await
            .expect_err("unattached tab");
        assert!(matches!(err, HostError::NotAttached(42)));
    }

    #[tokio::test]
    async fn canned_responses_and_command_log() {
        let host = ScriptedDebugger::new();
        host.open_tab(42, "https://a.example", "a");
        assert!(matches!(
            host.next_event().await,
            Some(HostEvent::TabAttached { tab_id: 42, .. })
        ));

        host.set_response("Runtime.evaluate", json!({"result": {"value": 3}}));
        let value = host
            .send_command(42, "Runtime.evaluate", json!({"expression": "1+2"}))
            .await
            .expect("canned response");
        assert_eq!(value["result"]["value"], 3);
        assert_eq!(host.sent_commands().len(), 1);
    }
}
