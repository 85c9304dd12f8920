//! Shared application state for the HTTP server.

use std::time::Instant;

use prime::Engine;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The engine every handler talks to. Cheap to clone.
    pub engine: Engine,
    pub started: Instant,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            started: Instant::now(),
        }
    }
}
