// NovelMind Application State
//
// One explicit session object owns the supervised backend process, the
// allocated port, and the HTTP client: at most one backend, one window, one
// port per run. Injected into command handlers instead of living in globals.
use crate::backend::BackendManager;
use crate::connectivity::BackendClient;
use std::sync::Arc;

pub struct AppState {
    /// Supervisor for the analysis backend process
    pub backend: Arc<BackendManager>,
    /// HTTP client half of the port handshake
    pub client: Arc<BackendClient>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            backend: Arc::new(BackendManager::new()),
            client: Arc::new(BackendClient::new()),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
