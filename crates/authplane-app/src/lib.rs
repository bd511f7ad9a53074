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

//! Authplane standalone server wiring.
//!
//! Layout: `settings.rs` (environment), `bootstrap.rs` (service wiring),
//! `http.rs` (control-plane routes), `server.rs` (hosting loop).

/// Application bootstrap.
pub mod bootstrap;
/// Application errors.
pub mod error;
/// Control-plane HTTP routes.
pub mod http;
/// Listener generations and shutdown.
pub mod server;
/// Environment-derived settings.
pub mod settings;

pub use bootstrap::{Services, run_app};
pub use error::{AppError, AppResult};
pub use settings::AppSettings;
