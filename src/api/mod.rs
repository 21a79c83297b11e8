//! HTTP API Module
//!
//! Provides a REST API for router status and server state updates.

mod http;

pub use http::{AppState, ErrorResponse, HealthResponse, HttpServer};
