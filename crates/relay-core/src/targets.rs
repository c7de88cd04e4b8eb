//! Source of truth for what tabs exist and which `targetId` each carries.
//!
//! `targetId` is minted here, survives navigations, and (for up to the frozen
//! TTL) survives extension outages: a tab that reattaches with the same
//! `tabId` inside the window gets its old `targetId` back. The manager
//! only mutates state; the router turns transitions into `Target.*` events.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use relay_wire::TabId;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct TargetRecord {
    pub target_id: String,
    pub tab_id: TabId,
    pub url: String,
    pub title: String,
    /// Position in attachment chronology; the lowest value is the first
    /// connected tab. Reattachment after a freeze gets a fresh position.
    pub attach_order: u64,
}

impl TargetRecord {
    /// The `TargetInfo` shape Playwright expects for a page target.
    pub fn target_info(&self, attached: bool) -> Value {
        json!({
            "targetId": self.target_id,
            "type": "page",
            "title": self.title,
            "url": self.url,
            "attached": attached,
            "browserContextId": "default",
            "canAccessOpener": false,
        })
    }
}

struct FrozenTarget {
    target_id: String,
    frozen_at: Instant,
}

#[derive(Default)]
pub struct TargetManager {
    by_tab: HashMap<TabId, TargetRecord>,
    by_target: HashMap<String, TabId>,
    frozen: HashMap<TabId, FrozenTarget>,
    frozen_ttl: Duration,
    next_order: u64,
}

impl TargetManager {
    pub fn new(frozen_ttl: Duration) -> Self {
        Self {
            frozen_ttl,
            ..Self::default()
        }
    }

    /// Register an extension-owned tab. Reuses the frozen `targetId` when the
    /// tab reattaches within the TTL, otherwise mints a fresh one.
    pub fn tab_attached(&mut self, tab_id: TabId, url: String, title: String) -> TargetRecord {
        let target_id = match self.frozen.remove(&tab_id) {
            Some(frozen) if frozen.frozen_at.elapsed() <= self.frozen_ttl => {
                debug!(target: "relay-targets", tab_id, target_id = %frozen.target_id, "thawed target");
                frozen.target_id
            }
            _ => mint_target_id(),
        };

        self.next_order += 1;
        let record = TargetRecord {
            target_id: target_id.clone(),
            tab_id,
            url,
            title,
            attach_order: self.next_order,
        };
        self.by_target.insert(target_id, tab_id);
        self.by_tab.insert(tab_id, record.clone());
        record
    }

    /// Update url/title in place; `targetId` is stable across navigations.
    pub fn tab_navigated(
        &mut self,
        tab_id: TabId,
        url: String,
        title: String,
    ) -> Option<TargetRecord> {
        let record = self.by_tab.get_mut(&tab_id)?;
        record.url = url;
        record.title = title;
        Some(record.clone())
    }

    /// The tab is gone for good; its `targetId` is never reused.
    pub fn tab_detached(&mut self, tab_id: TabId) -> Option<TargetRecord> {
        let record = self.by_tab.remove(&tab_id)?;
        self.by_target.remove(&record.target_id);
        Some(record)
    }

    /// Extension outage: clear live targets but reserve each `targetId` for
    /// its `tabId` until the TTL elapses.
    pub fn freeze_all(&mut self) -> Vec<TargetRecord> {
        let now = Instant::now();
        let records: Vec<TargetRecord> = self.by_tab.drain().map(|(_, record)| record).collect();
        self.by_target.clear();
        for record in &records {
            self.frozen.insert(
                record.tab_id,
                FrozenTarget {
                    target_id: record.target_id.clone(),
                    frozen_at: now,
                },
            );
        }
        records
    }

    /// Drop frozen reservations past the TTL. Returns how many expired.
    pub fn sweep_frozen(&mut self) -> usize {
        let ttl = self.frozen_ttl;
        let before = self.frozen.len();
        self.frozen.retain(|_, frozen| frozen.frozen_at.elapsed() <= ttl);
        before - self.frozen.len()
    }

    pub fn get_by_tab(&self, tab_id: TabId) -> Option<&TargetRecord> {
        self.by_tab.get(&tab_id)
    }

    pub fn get_by_target(&self, target_id: &str) -> Option<&TargetRecord> {
        self.by_target
            .get(target_id)
            .and_then(|tab_id| self.by_tab.get(tab_id))
    }

    /// The earliest-attached live tab. Map iteration order is arbitrary, so
    /// "first connected tab" callers must go through the attachment counter.
    pub fn first_attached(&self) -> Option<&TargetRecord> {
        self.by_tab.values().min_by_key(|record| record.attach_order)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetRecord> {
        self.by_tab.values()
    }

    pub fn len(&self) -> usize {
        self.by_tab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tab.is_empty()
    }
}

fn mint_target_id() -> String {
    format!("T-{}", Uuid::new_v4().simple())
}
