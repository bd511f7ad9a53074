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

//! Event bus and pub/sub transport for the Authplane control plane.
//!
//! Publishers hand an [`Event`] to the [`EventBus`], which fills in envelope
//! defaults, encodes it as JSON and pushes exactly one [`Message`] onto the
//! configured [`PubSub`] transport under `"<prefix>.<event type>"`. Every
//! subscription owns a consumer task that decodes messages and runs the
//! handler in isolation so a failing or panicking handler never takes the
//! loop down with it.
//!
//! Layout: `envelope.rs` (event + message types, topic naming), `pubsub.rs`
//! (transport trait and in-memory transport), `bus.rs` (`EventBus` and
//! subscriptions), `cancel.rs` (cooperative cancellation), `error.rs`.

pub mod bus;
pub mod cancel;
pub mod envelope;
pub mod error;
pub mod pubsub;

pub use bus::{EventBus, EventBusOptions, EventHandler, Subscription, handler_fn};
pub use cancel::{CancelHandle, CancelToken};
pub use envelope::{Event, METADATA_EVENT_TYPE, METADATA_TIMESTAMP, Message, topic_for};
pub use error::{EventBusError, EventBusResult};
pub use pubsub::{DEFAULT_SUBSCRIBER_CAPACITY, InMemoryPubSub, PubSub, PubSubStats};
