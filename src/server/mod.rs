pub mod auth;
pub mod router;
pub mod state;
pub mod ws;

pub use auth::{relay_auth_middleware, AuthPolicy};
pub use router::build_router;
pub use state::ServeState;
