//! Event bus routing on top of a [`PubSub`] transport.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{SecondsFormat, Utc};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::cancel::{CancelHandle, CancelToken};
use crate::envelope::{Event, METADATA_EVENT_TYPE, METADATA_TIMESTAMP, Message, topic_for};
use crate::error::{EventBusError, EventBusResult};
use crate::pubsub::{InMemoryPubSub, PubSub};

/// Future returned by an [`EventHandler`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Callback invoked for each event delivered to a subscription.
pub type EventHandler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as an [`EventHandler`].
#[must_use]
pub fn handler_fn<F, Fut>(handler: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(handler(event)))
}

/// Construction options for an [`EventBus`].
#[derive(Debug, Clone, Default)]
pub struct EventBusOptions {
    /// Namespace prepended to every topic.
    pub prefix: String,
    /// Upper bound on handlers running at once across all subscriptions.
    /// `0` disables the bound.
    pub max_concurrent_handlers: usize,
}

/// Shared event bus. Cloning is cheap; all clones share one transport.
///
/// Options and transport can be swapped while the bus is in use. Running
/// subscriptions keep the topic they were opened on.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    state: ArcSwap<BusState>,
}

struct BusState {
    prefix: String,
    transport: Arc<dyn PubSub>,
    max_concurrent_handlers: usize,
    handler_slots: Option<Arc<Semaphore>>,
}

impl BusState {
    fn new(options: EventBusOptions, transport: Arc<dyn PubSub>) -> Self {
        let handler_slots = (options.max_concurrent_handlers > 0)
            .then(|| Arc::new(Semaphore::new(options.max_concurrent_handlers)));
        Self {
            prefix: options.prefix,
            transport,
            max_concurrent_handlers: options.max_concurrent_handlers,
            handler_slots,
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.load();
        formatter
            .debug_struct("EventBus")
            .field("prefix", &state.prefix)
            .field("max_concurrent_handlers", &state.max_concurrent_handlers)
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Build a bus over `transport` with the given topic prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>, transport: Arc<dyn PubSub>) -> Self {
        Self::with_options(
            EventBusOptions {
                prefix: prefix.into(),
                ..EventBusOptions::default()
            },
            transport,
        )
    }

    /// Build a bus over `transport` from explicit options.
    #[must_use]
    pub fn with_options(options: EventBusOptions, transport: Arc<dyn PubSub>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                state: ArcSwap::from_pointee(BusState::new(options, transport)),
            }),
        }
    }

    /// Build a bus over a fresh [`InMemoryPubSub`].
    #[must_use]
    pub fn in_memory(prefix: impl Into<String>) -> Self {
        Self::new(prefix, Arc::new(InMemoryPubSub::new()))
    }

    /// Topic used for `event_type` on this bus.
    #[must_use]
    pub fn topic(&self, event_type: &str) -> String {
        topic_for(&self.inner.state.load().prefix, event_type)
    }

    /// Current options.
    #[must_use]
    pub fn options(&self) -> EventBusOptions {
        let state = self.inner.state.load();
        EventBusOptions {
            prefix: state.prefix.clone(),
            max_concurrent_handlers: state.max_concurrent_handlers,
        }
    }

    /// Underlying transport.
    #[must_use]
    pub fn transport(&self) -> Arc<dyn PubSub> {
        Arc::clone(&self.inner.state.load().transport)
    }

    /// Apply new options to later publishes and handler runs.
    ///
    /// The handler limit is shared by every subscription, including those
    /// already running; a changed prefix only affects topics resolved after
    /// this call. Handlers already holding a slot finish under the old limit.
    pub fn reconfigure(&self, options: EventBusOptions) {
        debug!(
            prefix = %options.prefix,
            max_concurrent_handlers = options.max_concurrent_handlers,
            "event bus reconfigured"
        );
        let _previous = self.inner.state.rcu(move |current| {
            let mut next = BusState::new(options.clone(), Arc::clone(&current.transport));
            if next.max_concurrent_handlers == current.max_concurrent_handlers {
                next.handler_slots.clone_from(&current.handler_slots);
            }
            next
        });
    }

    /// Route later publishes and subscriptions through `transport` and
    /// return the one it replaced. The caller decides when to close it.
    #[must_use]
    pub fn replace_transport(&self, transport: Arc<dyn PubSub>) -> Arc<dyn PubSub> {
        let previous = self.inner.state.rcu(move |current| BusState {
            prefix: current.prefix.clone(),
            transport: Arc::clone(&transport),
            max_concurrent_handlers: current.max_concurrent_handlers,
            handler_slots: current.handler_slots.clone(),
        });
        Arc::clone(&previous.transport)
    }

    /// Publish an event and return the identifier it was sent with.
    ///
    /// The caller's event is left untouched; defaults are applied to a copy.
    /// Publishing does not wait for any subscriber.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::InvalidEvent`] when the type is empty,
    /// [`EventBusError::Encode`] when the payload cannot be serialised and
    /// any transport error unchanged.
    #[instrument(name = "event_bus.publish", skip(self, event), fields(event_type = %event.kind))]
    pub async fn publish(&self, event: &Event) -> EventBusResult<String> {
        if event.kind.is_empty() {
            return Err(EventBusError::InvalidEvent {
                reason: "missing_type",
            });
        }

        let mut event = event.clone();
        if event.id.is_empty() {
            event.id = Uuid::new_v4().to_string();
        }
        let timestamp = *event.timestamp.get_or_insert_with(Utc::now);

        let payload = serde_json::to_vec(&event).map_err(|source| EventBusError::Encode { source })?;
        let metadata = HashMap::from([
            (METADATA_EVENT_TYPE.to_string(), event.kind.clone()),
            (
                METADATA_TIMESTAMP.to_string(),
                timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            ),
        ]);
        let message = Arc::new(Message {
            id: event.id.clone(),
            payload,
            metadata,
        });

        let state = self.inner.state.load_full();
        let topic = topic_for(&state.prefix, &event.kind);
        state.transport.publish(&topic, message).await?;
        Ok(event.id)
    }

    /// Subscribe `handler` to events of `event_type`.
    ///
    /// A dedicated task consumes the subscription until `cancel` fires, the
    /// transport closes the channel, or [`Subscription::unsubscribe`] runs.
    ///
    /// # Errors
    ///
    /// Returns any error raised by the transport while opening the channel.
    pub async fn subscribe(
        &self,
        cancel: &CancelToken,
        event_type: &str,
        handler: EventHandler,
    ) -> EventBusResult<Subscription> {
        let state = self.inner.state.load_full();
        let topic = topic_for(&state.prefix, event_type);
        let receiver = state.transport.subscribe(&topic).await?;

        let own = CancelHandle::new();
        let consumer = Consumer {
            topic: topic.clone(),
            handler,
            bus: Arc::clone(&self.inner),
        };
        let task = tokio::spawn(consumer.run(receiver, cancel.clone(), own.token()));

        debug!(topic = %topic, "event subscription started");
        Ok(Subscription {
            id: Uuid::new_v4(),
            topic,
            cancel: own,
            task,
        })
    }

    /// Close the underlying transport.
    ///
    /// # Errors
    ///
    /// Returns any error raised by the transport.
    pub async fn close(&self) -> EventBusResult<()> {
        self.transport().close().await
    }
}

/// Handle to a running subscription.
///
/// Dropping the handle leaves the consumer running; call
/// [`Subscription::unsubscribe`] to stop it.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    topic: String,
    cancel: CancelHandle,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Identifier assigned when the subscription was created.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Topic this subscription consumes.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether the consumer task is still running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the consumer and wait for it to exit. A handler still running
    /// for this subscription is aborted.
    pub async fn unsubscribe(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(topic = %self.topic, error = %err, "event subscription task failed to join");
        }
    }
}

struct Consumer {
    topic: String,
    handler: EventHandler,
    bus: Arc<BusInner>,
}

/// Aborts the handler task if dispatch is dropped before it finishes.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Consumer {
    async fn run(
        self,
        mut receiver: mpsc::Receiver<Arc<Message>>,
        parent: CancelToken,
        own: CancelToken,
    ) {
        loop {
            let message = tokio::select! {
                () = parent.cancelled() => break,
                () = own.cancelled() => break,
                message = receiver.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let event: Event = match serde_json::from_slice(&message.payload) {
                Ok(event) => event,
                Err(err) => {
                    error!(
                        topic = %self.topic,
                        message_id = %message.id,
                        error = %err,
                        "failed to decode event; skipping"
                    );
                    continue;
                }
            };

            // Cancellation drops the dispatch future, which aborts the
            // handler and releases its slot.
            tokio::select! {
                () = parent.cancelled() => break,
                () = own.cancelled() => break,
                () = self.dispatch(event) => {}
            }
        }
        debug!(topic = %self.topic, "event subscription stopped");
    }

    async fn dispatch(&self, event: Event) {
        let slots = self.bus.state.load().handler_slots.clone();
        let _permit = match slots {
            Some(slots) => match slots.acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return,
            },
            None => None,
        };

        let event_type = event.kind.clone();
        let event_id = event.id.clone();
        let handler = Arc::clone(&self.handler);
        let task = tokio::spawn(async move { handler(event).await });
        let _abort = AbortOnDrop(task.abort_handle());
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(
                    event_type = %event_type,
                    event_id = %event_id,
                    error = %err,
                    "event handler error"
                );
            }
            Err(join) if join.is_panic() => {
                error!(
                    event_type = %event_type,
                    event_id = %event_id,
                    panic = %panic_message(join.into_panic().as_ref()),
                    "event handler panicked"
                );
            }
            Err(join) => {
                warn!(
                    event_type = %event_type,
                    event_id = %event_id,
                    error = %join,
                    "event handler task cancelled"
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn counting_handler(counter: Arc<AtomicUsize>) -> EventHandler {
        handler_fn(move |_event| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    async fn wait_for_count(counter: &AtomicUsize, expected: usize) {
        timeout(Duration::from_secs(2), async {
            while counter.load(Ordering::SeqCst) < expected {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handler count should reach expected value");
    }

    #[tokio::test]
    async fn publish_rejects_empty_type() {
        let bus = EventBus::in_memory("auth");
        let err = bus
            .publish(&Event::new("", json!({})))
            .await
            .expect_err("empty type should be rejected");
        assert!(matches!(
            err,
            EventBusError::InvalidEvent {
                reason: "missing_type"
            }
        ));
    }

    #[tokio::test]
    async fn publish_fills_defaults_on_copy_only() {
        let bus = EventBus::in_memory("auth");
        let (tx, mut rx) = mpsc::channel(1);
        let _subscription = bus
            .subscribe(
                &CancelToken::never(),
                "user.signed_up",
                handler_fn(move |event| {
                    let tx = tx.clone();
                    async move {
                        tx.send(event).await?;
                        Ok(())
                    }
                }),
            )
            .await
            .expect("subscribe");

        let original = Event::new("user.signed_up", json!({"email": "a@example.com"}));
        let id = bus.publish(&original).await.expect("publish");

        assert!(original.id.is_empty());
        assert!(original.timestamp.is_none());

        let received = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event delivered")
            .expect("channel open");
        assert_eq!(received.id, id);
        assert!(Uuid::parse_str(&received.id).is_ok());
        assert!(received.timestamp.is_some());
        assert_eq!(received.payload["email"], "a@example.com");
    }

    #[tokio::test]
    async fn publish_keeps_caller_supplied_id() {
        let bus = EventBus::in_memory("");
        let mut event = Event::new("user.logged_in", json!(null));
        event.id = "fixed-id".to_string();
        assert_eq!(bus.publish(&event).await.expect("publish"), "fixed-id");
    }

    #[tokio::test]
    async fn publish_without_subscribers_returns_promptly() {
        let bus = EventBus::in_memory("auth");
        for _ in 0..500 {
            timeout(
                Duration::from_millis(100),
                bus.publish(&Event::new("user.logged_in", json!({}))),
            )
            .await
            .expect("publish should not block")
            .expect("publish should succeed");
        }
    }

    #[tokio::test]
    async fn ten_subscribers_each_receive_one_delivery() {
        let bus = EventBus::in_memory("auth");
        let counters: Vec<Arc<AtomicUsize>> =
            (0..10).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let mut subscriptions = Vec::new();
        for counter in &counters {
            subscriptions.push(
                bus.subscribe(
                    &CancelToken::never(),
                    "user.signed_up",
                    counting_handler(Arc::clone(counter)),
                )
                .await
                .expect("subscribe"),
            );
        }

        bus.publish(&Event::new("user.signed_up", json!({})))
            .await
            .expect("publish");

        for counter in &counters {
            wait_for_count(counter, 1).await;
        }
        sleep(Duration::from_millis(50)).await;
        for counter in &counters {
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
        assert_eq!(subscriptions.len(), 10);
    }

    #[tokio::test]
    async fn handler_panic_and_error_do_not_stop_the_loop() {
        let bus = EventBus::in_memory("auth");
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_handler = Arc::clone(&seen);
        let _subscription = bus
            .subscribe(
                &CancelToken::never(),
                "user.logged_in",
                handler_fn(move |event| {
                    let seen = Arc::clone(&seen_in_handler);
                    async move {
                        let index = seen.fetch_add(1, Ordering::SeqCst);
                        match index {
                            0 => panic!("boom on {}", event.kind),
                            1 => Err(anyhow::anyhow!("handler failure")),
                            _ => Ok(()),
                        }
                    }
                }),
            )
            .await
            .expect("subscribe");

        for _ in 0..3 {
            bus.publish(&Event::new("user.logged_in", json!({})))
                .await
                .expect("publish");
        }
        wait_for_count(&seen, 3).await;
    }

    #[tokio::test]
    async fn malformed_payload_is_skipped() {
        let transport = Arc::new(InMemoryPubSub::new());
        let bus = EventBus::new("auth", transport.clone());
        let counter = Arc::new(AtomicUsize::new(0));
        let _subscription = bus
            .subscribe(
                &CancelToken::never(),
                "user.logged_in",
                counting_handler(Arc::clone(&counter)),
            )
            .await
            .expect("subscribe");

        transport
            .publish(
                "auth.user.logged_in",
                Arc::new(Message {
                    id: "garbage".to_string(),
                    payload: b"not json".to_vec(),
                    metadata: HashMap::new(),
                }),
            )
            .await
            .expect("raw publish");
        bus.publish(&Event::new("user.logged_in", json!({})))
            .await
            .expect("publish");

        wait_for_count(&counter, 1).await;
    }

    #[tokio::test]
    async fn unsubscribe_stops_only_that_handler() {
        let bus = EventBus::in_memory("auth");
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let first_sub = bus
            .subscribe(
                &CancelToken::never(),
                "user.email_changed",
                counting_handler(Arc::clone(&first)),
            )
            .await
            .expect("subscribe first");
        let second_sub = bus
            .subscribe(
                &CancelToken::never(),
                "user.email_changed",
                counting_handler(Arc::clone(&second)),
            )
            .await
            .expect("subscribe second");

        first_sub.unsubscribe().await;
        bus.publish(&Event::new("user.email_changed", json!({})))
            .await
            .expect("publish");

        wait_for_count(&second, 1).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert!(second_sub.is_active());
    }

    #[tokio::test]
    async fn parent_cancellation_and_close_end_consumers() {
        let bus = EventBus::in_memory("auth");
        let handle = CancelHandle::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let cancelled = bus
            .subscribe(
                &handle.token(),
                "user.signed_up",
                counting_handler(Arc::clone(&counter)),
            )
            .await
            .expect("subscribe");
        let closed = bus
            .subscribe(
                &CancelToken::never(),
                "user.signed_up",
                counting_handler(Arc::clone(&counter)),
            )
            .await
            .expect("subscribe");

        handle.cancel();
        timeout(Duration::from_secs(1), async {
            while cancelled.is_active() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("cancelled consumer should exit");

        bus.close().await.expect("close");
        timeout(Duration::from_secs(1), async {
            while closed.is_active() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("consumer should exit after transport close");
    }

    #[tokio::test]
    async fn handler_limit_bounds_concurrency() {
        let bus = EventBus::with_options(
            EventBusOptions {
                prefix: "auth".to_string(),
                max_concurrent_handlers: 1,
            },
            Arc::new(InMemoryPubSub::new()),
        );
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let mut subscriptions = Vec::new();
        for _ in 0..3 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            subscriptions.push(
                bus.subscribe(
                    &CancelToken::never(),
                    "user.signed_up",
                    handler_fn(move |_event| {
                        let running = Arc::clone(&running);
                        let peak = Arc::clone(&peak);
                        let done = Arc::clone(&done);
                        async move {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            sleep(Duration::from_millis(20)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                            done.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
                )
                .await
                .expect("subscribe"),
            );
        }

        bus.publish(&Event::new("user.signed_up", json!({})))
            .await
            .expect("publish");
        wait_for_count(&done, 3).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_aborts_a_stuck_handler() {
        let bus = EventBus::in_memory("auth");
        let started = Arc::new(AtomicUsize::new(0));
        let started_in_handler = Arc::clone(&started);
        let subscription = bus
            .subscribe(
                &CancelToken::never(),
                "user.signed_up",
                handler_fn(move |_event| {
                    let started = Arc::clone(&started_in_handler);
                    async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        std::future::pending::<()>().await;
                        Ok(())
                    }
                }),
            )
            .await
            .expect("subscribe");

        bus.publish(&Event::new("user.signed_up", json!({})))
            .await
            .expect("publish");
        wait_for_count(&started, 1).await;

        timeout(Duration::from_secs(2), subscription.unsubscribe())
            .await
            .expect("unsubscribe should not wait for the handler");
    }

    #[tokio::test]
    async fn parent_cancellation_releases_the_handler_slot() {
        let bus = EventBus::with_options(
            EventBusOptions {
                prefix: "auth".to_string(),
                max_concurrent_handlers: 1,
            },
            Arc::new(InMemoryPubSub::new()),
        );
        let hooks = CancelHandle::new();
        let started = Arc::new(AtomicUsize::new(0));
        let started_in_handler = Arc::clone(&started);
        let stuck = bus
            .subscribe(
                &hooks.token(),
                "user.signed_up",
                handler_fn(move |_event| {
                    let started = Arc::clone(&started_in_handler);
                    async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        std::future::pending::<()>().await;
                        Ok(())
                    }
                }),
            )
            .await
            .expect("subscribe stuck");
        bus.publish(&Event::new("user.signed_up", json!({})))
            .await
            .expect("publish");
        wait_for_count(&started, 1).await;

        hooks.cancel();
        timeout(Duration::from_secs(2), stuck.unsubscribe())
            .await
            .expect("cancelled consumer should exit");

        let counter = Arc::new(AtomicUsize::new(0));
        let _next = bus
            .subscribe(
                &CancelToken::never(),
                "user.logged_in",
                counting_handler(Arc::clone(&counter)),
            )
            .await
            .expect("subscribe next");
        bus.publish(&Event::new("user.logged_in", json!({})))
            .await
            .expect("publish");
        wait_for_count(&counter, 1).await;
    }

    #[tokio::test]
    async fn reconfigured_prefix_applies_to_later_topics() {
        let bus = EventBus::in_memory("auth");
        assert_eq!(bus.topic("user.signed_up"), "auth.user.signed_up");

        bus.reconfigure(EventBusOptions {
            prefix: "tenant".to_string(),
            max_concurrent_handlers: 0,
        });
        assert_eq!(bus.topic("user.signed_up"), "tenant.user.signed_up");
        assert_eq!(bus.options().prefix, "tenant");

        let counter = Arc::new(AtomicUsize::new(0));
        let subscription = bus
            .subscribe(
                &CancelToken::never(),
                "user.signed_up",
                counting_handler(Arc::clone(&counter)),
            )
            .await
            .expect("subscribe");
        assert_eq!(subscription.topic(), "tenant.user.signed_up");

        bus.publish(&Event::new("user.signed_up", json!({})))
            .await
            .expect("publish");
        wait_for_count(&counter, 1).await;
    }

    #[tokio::test]
    async fn reconfigured_limit_applies_to_running_subscriptions() {
        let bus = EventBus::in_memory("auth");
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let mut subscriptions = Vec::new();
        for _ in 0..3 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            subscriptions.push(
                bus.subscribe(
                    &CancelToken::never(),
                    "user.signed_up",
                    handler_fn(move |_event| {
                        let running = Arc::clone(&running);
                        let peak = Arc::clone(&peak);
                        let done = Arc::clone(&done);
                        async move {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            sleep(Duration::from_millis(20)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                            done.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
                )
                .await
                .expect("subscribe"),
            );
        }

        bus.reconfigure(EventBusOptions {
            prefix: "auth".to_string(),
            max_concurrent_handlers: 1,
        });
        bus.publish(&Event::new("user.signed_up", json!({})))
            .await
            .expect("publish");
        wait_for_count(&done, 3).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(subscriptions.len(), 3);
    }

    #[tokio::test]
    async fn replaced_transport_carries_later_publishes() {
        let first = Arc::new(InMemoryPubSub::new());
        let bus = EventBus::new("auth", first.clone());
        let second = Arc::new(InMemoryPubSub::new());

        let previous = bus.replace_transport(second.clone());
        assert!(Arc::ptr_eq(
            &previous,
            &(Arc::clone(&first) as Arc<dyn PubSub>)
        ));

        let counter = Arc::new(AtomicUsize::new(0));
        let _subscription = bus
            .subscribe(
                &CancelToken::never(),
                "user.signed_up",
                counting_handler(Arc::clone(&counter)),
            )
            .await
            .expect("subscribe");
        assert_eq!(second.stats().subscribers, 1);
        assert_eq!(first.stats().subscribers, 0);

        bus.publish(&Event::new("user.signed_up", json!({})))
            .await
            .expect("publish");
        wait_for_count(&counter, 1).await;
    }

    #[test]
    fn panic_message_extracts_strings() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        assert_eq!(panic_message(borrowed.as_ref()), "borrowed");
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
