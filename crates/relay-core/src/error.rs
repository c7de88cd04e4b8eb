//! Relay error taxonomy. Kinds carry the classification, hints carry the
//! human-readable detail; the wire form is always a [`CdpError`].

use std::fmt;

use relay_wire::CdpError;
use thiserror::Error;

/// Extension-link and session failures. Wire-format violations are
/// classified by `relay_wire::WireError` instead; unexpected internal
/// failures close the offending socket with 1011 and never cross this type.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RelayErrorKind {
    #[error("extension not connected")]
    ExtensionUnavailable,
    #[error("extension replaced")]
    ExtensionReplaced,
    #[error("extension disconnected")]
    ExtensionDisconnected,
    #[error("request timed out")]
    Timeout,
    /// The session's target is gone (tab closed, extension outage) or the
    /// session id was never minted; the hint carries the session id.
    #[error("target gone")]
    TargetGone,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RelayError {
    pub kind: RelayErrorKind,
    pub hint: Option<String>,
}

impl RelayError {
    pub fn new(kind: RelayErrorKind) -> Self {
        Self { kind, hint: None }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// The CDP error payload a client sees for this failure.
    pub fn to_cdp(&self) -> CdpError {
        match self.kind {
            RelayErrorKind::ExtensionUnavailable => CdpError::extension_unavailable(),
            RelayErrorKind::ExtensionReplaced => CdpError::extension_replaced(),
            RelayErrorKind::ExtensionDisconnected => CdpError::extension_disconnected(),
            RelayErrorKind::Timeout => CdpError::request_timeout(),
            RelayErrorKind::TargetGone => {
                CdpError::no_session(self.hint.as_deref().unwrap_or_default())
            }
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(hint) = &self.hint {
            write!(f, ": {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RelayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_keeps_codes_distinguishable() {
        let replaced = RelayError::new(RelayErrorKind::ExtensionReplaced).to_cdp();
        let dropped = RelayError::new(RelayErrorKind::ExtensionDisconnected).to_cdp();
        assert_ne!(replaced.code, dropped.code);
        assert_eq!(dropped.message, "Extension disconnected");
    }

    #[test]
    fn hints_reach_the_display_form() {
        let err = RelayError::new(RelayErrorKind::Timeout).with_hint("startRecording");
        assert_eq!(err.to_string(), "request timed out: startRecording");
    }

    #[test]
    fn target_gone_becomes_the_no_session_payload() {
        let err = RelayError::new(RelayErrorKind::TargetGone).with_hint("s9");
        let cdp = err.to_cdp();
        assert_eq!(cdp, CdpError::no_session("s9"));
        assert_eq!(cdp.code, -32001);
        assert!(cdp.message.contains("No session with given id"));
    }
}
