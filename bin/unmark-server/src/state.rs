//! Shared application state injected into every Axum handler.

use std::sync::Arc;
use std::time::Instant;

use unmark_core::TaskService;

use crate::config::Config;

#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Submit / query / list / delete entry point.
    pub service: TaskService,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config, service: TaskService) -> Self {
        Self {
            config: Arc::new(config),
            service,
            started_at: Instant::now(),
        }
    }
}
