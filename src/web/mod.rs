//! The web module for handling the Axum API and WebSocket bridge.

pub mod api;
pub mod models;
