//! Application state.

use std::sync::Arc;

use crate::config::ServiceConfig;
use crate::engine::MeteringEngine;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The metering engine.
    pub engine: Arc<MeteringEngine>,

    /// Service configuration.
    pub config: ServiceConfig,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub fn new(engine: Arc<MeteringEngine>, config: ServiceConfig) -> Self {
        Self { engine, config }
    }
}
