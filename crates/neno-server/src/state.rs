//! Application state management

use std::sync::Arc;

use neno_core::EngineCore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<EngineCore>,
    pub model_name: String,
}

impl AppState {
    pub fn new(engine: Arc<EngineCore>, model_name: String) -> Self {
        Self { engine, model_name }
    }
}
