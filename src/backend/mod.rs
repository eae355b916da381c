//! Loopback control listener used by the browser integration

pub mod router;
pub mod submit;

use crate::engine::Engine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}
