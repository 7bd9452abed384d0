//! Rebill API Library
//!
//! HTTP surface for the billing engine: webhook ingress, subscriber billing
//! actions, and admin operations.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
