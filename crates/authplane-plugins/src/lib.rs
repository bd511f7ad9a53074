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

//! Plugin orchestration for Authplane.
//!
//! Layout: `registry.rs` (`PluginRegistry`), `builder.rs` (`PluginBuilder`
//! and `SimplePlugin`), `error.rs`.

pub mod builder;
pub mod error;
pub mod registry;

pub use builder::{LifecycleFuture, PluginBuilder, SimplePlugin};
pub use error::{PluginError, PluginResult};
pub use registry::PluginRegistry;
