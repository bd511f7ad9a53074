//! Transport abstraction and the default in-process implementation.
//!
//! # Design
//! - One bounded channel per subscription; publishers never wait on consumers.
//! - A full subscriber queue drops the message for that subscriber only.
//! - Closing the transport drops every sender so each channel closes once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::envelope::Message;
use crate::error::EventBusResult;

/// Queue capacity allocated to each in-memory subscription.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 100;

/// Topic-addressed message transport consumed by the [`crate::EventBus`].
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Deliver `message` to every current subscriber of `topic` without
    /// waiting for them to consume it.
    async fn publish(&self, topic: &str, message: Arc<Message>) -> EventBusResult<()>;

    /// Open a new subscription on `topic`.
    async fn subscribe(&self, topic: &str) -> EventBusResult<mpsc::Receiver<Arc<Message>>>;

    /// Release the transport. Subsequent calls are no-ops.
    async fn close(&self) -> EventBusResult<()>;

    /// Queue statistics, for transports that keep them.
    fn queue_stats(&self) -> Option<PubSubStats> {
        None
    }
}

/// Point-in-time view of the in-memory transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PubSubStats {
    /// Topics with at least one live subscriber.
    pub topics: usize,
    /// Live subscriber channels.
    pub subscribers: usize,
    /// Messages buffered across all subscriber queues.
    pub queued: usize,
    /// Messages dropped because a subscriber queue was full.
    pub dropped: u64,
}

#[derive(Default)]
struct TopicTable {
    closed: bool,
    topics: HashMap<String, Vec<mpsc::Sender<Arc<Message>>>>,
}

/// In-process [`PubSub`] backed by bounded `tokio::mpsc` channels.
pub struct InMemoryPubSub {
    table: RwLock<TopicTable>,
    capacity: usize,
    dropped: AtomicU64,
}

impl InMemoryPubSub {
    /// Create a transport using [`DEFAULT_SUBSCRIBER_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Create a transport whose subscriber queues hold `capacity` messages.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            table: RwLock::new(TopicTable::default()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Whether [`PubSub::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    /// Snapshot queue depth and drop counters.
    #[must_use]
    pub fn stats(&self) -> PubSubStats {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let mut stats = PubSubStats {
            dropped: self.dropped.load(Ordering::Relaxed),
            ..PubSubStats::default()
        };
        for senders in table.topics.values() {
            let live: Vec<_> = senders.iter().filter(|tx| !tx.is_closed()).collect();
            if live.is_empty() {
                continue;
            }
            stats.topics += 1;
            stats.subscribers += live.len();
            stats.queued += live
                .iter()
                .map(|tx| tx.max_capacity() - tx.capacity())
                .sum::<usize>();
        }
        stats
    }

    fn prune_topic(&self, topic: &str) {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(senders) = table.topics.get_mut(topic) {
            senders.retain(|tx| !tx.is_closed());
            if senders.is_empty() {
                table.topics.remove(topic);
            }
        }
    }
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for InMemoryPubSub {
    fn queue_stats(&self) -> Option<PubSubStats> {
        Some(self.stats())
    }

    async fn publish(&self, topic: &str, message: Arc<Message>) -> EventBusResult<()> {
        let mut stale = false;
        {
            let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
            if table.closed {
                return Ok(());
            }
            let Some(senders) = table.topics.get(topic) else {
                return Ok(());
            };
            for sender in senders {
                match sender.try_send(Arc::clone(&message)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(topic, message_id = %message.id, "subscriber queue full; message dropped");
                    }
                    Err(TrySendError::Closed(_)) => stale = true,
                }
            }
        }
        if stale {
            self.prune_topic(topic);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> EventBusResult<mpsc::Receiver<Arc<Message>>> {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if table.closed {
            let (_, receiver) = mpsc::channel(1);
            return Ok(receiver);
        }
        let (sender, receiver) = mpsc::channel(self.capacity);
        let senders = table.topics.entry(topic.to_string()).or_default();
        senders.retain(|tx| !tx.is_closed());
        senders.push(sender);
        Ok(receiver)
    }

    async fn close(&self) -> EventBusResult<()> {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if table.closed {
            return Ok(());
        }
        table.closed = true;
        table.topics.clear();
        debug!("in-memory pub/sub closed");
        Ok(())
    }
}
