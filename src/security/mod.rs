//! Security middleware: CORS, HTTP Basic authentication and per-client rate
//! limiting.
//!
//! - [`CorsMiddleware`]: Cross-Origin Resource Sharing header injection and
//!   preflight (`OPTIONS`) short-circuiting, configured by [`CorsConfig`].
//! - [`BasicAuthMiddleware`]: `401` + `WWW-Authenticate` unless the request
//!   carries acceptable Basic credentials.
//! - [`RateLimitMiddleware`]: sliding-window limit per client IP, backed by a
//!   shared [`RateLimiter`].

mod auth;
mod cors;
mod rate_limit;

pub use auth::BasicAuthMiddleware;
pub use cors::{CorsConfig, CorsMiddleware};
pub use rate_limit::{RateLimitMiddleware, RateLimiter};
