//! HTTP API Module
//!
//! Serves the inbound side of the peer exchange protocol (register, peer
//! list, health check) plus status and metrics endpoints.

mod metrics;
mod rate_limiter;
mod registration;
mod routes;

pub use metrics::Metrics;
pub use rate_limiter::RateLimiter;
pub use registration::{ApiError, RegistrationService};
pub use routes::{router, run_api_server};
