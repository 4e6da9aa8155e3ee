//! Shared state for control API handlers.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::router::AgentRouter;

/// State shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// The agent router (and through it, the supervisor).
    pub router: Arc<AgentRouter>,
    /// The UI's currently focused web tab, if the host reports one.
    pub active_tab: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(router: Arc<AgentRouter>) -> Self {
        Self {
            router,
            active_tab: Arc::new(RwLock::new(None)),
        }
    }
}
