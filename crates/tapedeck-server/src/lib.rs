//! Tapedeck Server Library
//!
//! This module exposes the server components for testing and embedding.

pub mod api;
pub mod error;
pub mod session;
pub mod state;
pub mod storage;
pub mod webrtc;

use anyhow::Result;

/// Create and configure the server application
pub fn create_app(config: state::Config) -> Result<axum::Router> {
    let app_state = state::AppState::new(config)?;
    Ok(api::create_router(app_state))
}
