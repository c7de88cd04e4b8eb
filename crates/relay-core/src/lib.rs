//! Core of the CDP relay: the message router and the state it serializes.
//!
//! The relay brokers Chrome DevTools Protocol traffic between any number of
//! CDP clients (Playwright instances on `/cdp/<id>`) and the single privileged
//! extension socket (`/extension`). All shared state (client registry,
//! extension link with its pending-request table, target manager, recording
//! accumulator) is owned by one actor task; sockets and HTTP handlers talk to
//! it through [`RelayHandle`] messages, which makes the ordering guarantees of
//! the protocol trivial to uphold.

pub mod clients;
pub mod config;
pub mod error;
pub mod extension;
pub mod handle;
pub mod recording;
pub mod router;
pub mod targets;

pub use clients::{ClientFrameOut, ClientId};
pub use config::{IdlePolicy, RelayConfig};
pub use error::{RelayError, RelayErrorKind};
pub use extension::ExtFrameOut;
pub use handle::{
    ClientConnection, ConnectReject, ExtensionConnection, RecordingStatusReply, RelayHandle,
    StartRecordingReply, StartRecordingRequest, StatusSnapshot, StopRecordingReply,
};
pub use router::spawn_relay;
