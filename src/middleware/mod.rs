//! HTTP middleware
//!
//! Caller authentication and request logging

pub mod auth;
pub mod logging;

pub use auth::auth_middleware;
pub use logging::{request_logging_middleware, RequestId};
