//! Relay tuning knobs. Defaults match the wire contract; every field has a
//! `CDP_RELAY_*` environment override resolved the same way the CLI flags are.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use relay_wire::DEFAULT_MAX_FRAME_BYTES;

/// What happens to client traffic while no extension is connected.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IdlePolicy {
    /// Refuse `/cdp` connections and fail commands immediately.
    Reject,
    /// Hold clients open and queue commands for at most one grace interval.
    Wait,
}

impl IdlePolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reject" => Some(Self::Reject),
            "wait" => Some(Self::Wait),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    /// Shared token required on every handshake when set.
    pub token: Option<String>,
    pub idle_policy: IdlePolicy,
    /// How long queued commands may wait for the extension under
    /// [`IdlePolicy::Wait`].
    pub idle_grace: Duration,
    /// Deadline for every extension-bound request.
    pub request_deadline: Duration,
    pub heartbeat_interval: Duration,
    /// Consecutive unanswered pings before the extension socket is dropped.
    pub heartbeat_misses: u32,
    /// How long a frozen target keeps its `targetId` reserved across an
    /// extension outage.
    pub frozen_target_ttl: Duration,
    /// Deadline for the final recording chunk after `stopRecording`.
    pub recording_stop_deadline: Duration,
    /// Per-client outbound buffer high-water mark.
    pub client_buffer_limit: usize,
    pub max_frame_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
            idle_policy: resolve_idle_policy(),
            idle_grace: Duration::from_secs(10),
            request_deadline: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_misses: 3,
            frozen_target_ttl: Duration::from_secs(30),
            recording_stop_deadline: Duration::from_secs(30),
            client_buffer_limit: 16 * 1024 * 1024,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl RelayConfig {
    /// True when the bind address is reachable from off-host, which makes the
    /// auth token mandatory.
    pub fn is_public_bind(&self) -> bool {
        !self.bind.ip().is_loopback()
    }
}

fn default_bind() -> SocketAddr {
    resolve_env("CDP_RELAY_BIND")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 19988)))
}

fn resolve_idle_policy() -> IdlePolicy {
    resolve_env("CDP_RELAY_ON_IDLE")
        .and_then(|raw| IdlePolicy::parse(&raw))
        .unwrap_or(IdlePolicy::Reject)
}

fn resolve_env(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(raw) => {
            let trimmed = raw.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_loopback_with_reject_policy() {
        let config = RelayConfig::default();
        assert!(config.bind.ip().is_loopback());
        assert!(!config.is_public_bind());
        assert_eq!(config.heartbeat_misses, 3);
    }

    #[test]
    fn idle_policy_parses_known_values() {
        assert_eq!(IdlePolicy::parse("reject"), Some(IdlePolicy::Reject));
        assert_eq!(IdlePolicy::parse(" Wait "), Some(IdlePolicy::Wait));
        assert_eq!(IdlePolicy::parse("queue"), None);
    }
}
