//! CDP relay server: exposes a browser-extension debugger attachment as a
//! standard CDP WebSocket endpoint (`ws://host:port/cdp/<id>`).

pub mod cli;
pub mod server;

pub use relay_core::{IdlePolicy, RelayConfig, RelayHandle};
pub use server::{build_router, AuthPolicy, ServeState};
