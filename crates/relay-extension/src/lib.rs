//! Extension-side half of the relay.
//!
//! In production this logic runs next to the browser's debugger API; here it
//! is expressed against the [`DebuggerHost`] and [`RecorderHost`] traits so
//! the same proxy drives a real platform binding or the scripted in-memory
//! hosts. The proxy owns attach/detach per tab, translates relay envelopes
//! into debugger calls, forwards debugger events tagged with their origin
//! tab, and pumps recording chunks as metadata + binary frame pairs. The
//! client module keeps the `/extension` socket alive across relay restarts.

pub mod client;
pub mod debugger;
pub mod proxy;
pub mod recorder;

pub use client::{run_extension_proxy, ExtensionClientConfig};
pub use debugger::{DebuggerHost, HostError, HostEvent, ScriptedDebugger, TabSnapshot};
pub use proxy::ExtensionProxy;
pub use recorder::{RecorderEvent, RecorderHost, ScriptedRecorder};
