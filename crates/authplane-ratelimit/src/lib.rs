#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Fixed-window rate limiting for Authplane.
//!
//! Layout: `limiter.rs` (rule resolution and counting), `middleware.rs`
//! (axum layer), `error.rs`.

pub mod error;
pub mod limiter;
pub mod middleware;

pub use error::{RateLimitError, RateLimitResult};
pub use limiter::{Decision, RateLimiter};
pub use middleware::{
    HEADER_RATE_LIMIT_LIMIT, RateLimitState, ThrottleHook, enforce_rate_limit,
};
