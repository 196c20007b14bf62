//! HTTP handlers outside the webhook endpoint

pub mod status;

pub use status::{health_handler, status_handler, status_router, AppState};
