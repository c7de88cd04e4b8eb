use std::sync::Arc;

use relay_core::RelayHandle;
use tokio::sync::mpsc;

use super::auth::AuthPolicy;

#[derive(Clone)]
pub struct ServeState {
    pub relay: RelayHandle,
    pub policy: Option<Arc<AuthPolicy>>,
    /// Firing this asks the serve loop to drain and exit (signal handling and
    /// the `/shutdown` endpoint share it).
    pub shutdown: mpsc::Sender<()>,
}

impl ServeState {
    pub fn new(
        relay: RelayHandle,
        policy: Option<Arc<AuthPolicy>>,
        shutdown: mpsc::Sender<()>,
    ) -> Self {
        Self {
            relay,
            policy,
            shutdown,
        }
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown.try_send(());
    }
}
