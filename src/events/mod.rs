//! In-process typed publish/subscribe bus.
//!
//! Connection lifecycle, media readiness and provider readiness are all
//! signalled through this bus. Publication is non-blocking: handlers are
//! dispatched on fresh tasks, concurrently across subscribers, spawned in
//! registration order for a given event type. A handler failure (error,
//! timeout or panic) is isolated from every other handler.
//!
//! "Wait for dependency X, else fail after N seconds" is expressed as
//! [`EventBus::wait_for`] / [`EventBus::subscribe_with_timeout`], never as a
//! sleep loop.

pub mod middleware;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::oneshot;

use middleware::{Middleware, Next};

// ── Event types ────────────────────────────────────────────────────

/// Closed set of event names carried by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    ConnectionCreated,
    ConnectionReady,
    ConnectionTerminated,
    SdpOfferReceived,
    SdpAnswerGenerated,
    AudioTrackReady,
    IceConnectionChanged,
    AiConnectionInit,
    AiAudioReady,
    AiDataChannelReady,
    WhatsAppCallStarted,
    WhatsAppCallAccepted,
    WhatsAppAudioReady,
}

impl EventType {
    /// Wire/log name of the event.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionCreated => "ConnectionCreated",
            Self::ConnectionReady => "ConnectionReady",
            Self::ConnectionTerminated => "ConnectionTerminated",
            Self::SdpOfferReceived => "SDPOfferReceived",
            Self::SdpAnswerGenerated => "SDPAnswerGenerated",
            Self::AudioTrackReady => "AudioTrackReady",
            Self::IceConnectionChanged => "ICEConnectionChanged",
            Self::AiConnectionInit => "AIConnectionInit",
            Self::AiAudioReady => "AIAudioReady",
            Self::AiDataChannelReady => "AIDataChannelReady",
            Self::WhatsAppCallStarted => "WhatsAppCallStarted",
            Self::WhatsAppCallAccepted => "WhatsAppCallAccepted",
            Self::WhatsAppAudioReady => "WhatsAppAudioReady",
        }
    }

    pub fn all() -> &'static [EventType] {
        &[
            Self::ConnectionCreated,
            Self::ConnectionReady,
            Self::ConnectionTerminated,
            Self::SdpOfferReceived,
            Self::SdpAnswerGenerated,
            Self::AudioTrackReady,
            Self::IceConnectionChanged,
            Self::AiConnectionInit,
            Self::AiAudioReady,
            Self::AiDataChannelReady,
            Self::WhatsAppCallStarted,
            Self::WhatsAppCallAccepted,
            Self::WhatsAppAudioReady,
        ]
    }
}

/// Optional typed payload attached to an event.
#[derive(Debug, Clone)]
pub enum EventData {
    Sdp { sdp: String },
    IceState { state: String },
    CallInfo { call_id: String, from: String, to: String },
    Error { message: String },
    Text { value: String },
}

/// A published event. Every event carries the connection it concerns.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub connection_id: String,
    pub data: Option<EventData>,
}

impl Event {
    pub fn new(event_type: EventType, connection_id: impl Into<String>) -> Self {
        Self {
            event_type,
            connection_id: connection_id.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: EventData) -> Self {
        self.data = Some(data);
        self
    }
}

// ── Handlers and subscriptions ─────────────────────────────────────

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// An event handler. Receives a clone of the published event.
pub type Handler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

struct Subscription {
    id: u64,
    handler: Handler,
    timeout: Option<Duration>,
}

/// Returned by `subscribe*`; pass back to [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle {
    event_type: EventType,
    id: u64,
}

// ── Statistics ─────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Serialize)]
pub struct TypeStats {
    pub published: u64,
    pub handled: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub panicked: u64,
    pub dropped: u64,
}

#[derive(Default)]
pub struct EventStats {
    inner: Mutex<HashMap<&'static str, TypeStats>>,
}

impl EventStats {
    fn entry(&self, event_type: EventType, update: impl FnOnce(&mut TypeStats)) {
        let mut inner = self.inner.lock();
        update(inner.entry(event_type.as_str()).or_default());
    }

    pub fn record_published(&self, event_type: EventType) {
        self.entry(event_type, |s| s.published += 1);
    }

    pub fn record_handled(&self, event_type: EventType) {
        self.entry(event_type, |s| s.handled += 1);
    }

    pub fn record_failed(&self, event_type: EventType) {
        self.entry(event_type, |s| s.failed += 1);
    }

    pub fn record_timed_out(&self, event_type: EventType) {
        self.entry(event_type, |s| s.timed_out += 1);
    }

    pub fn record_panicked(&self, event_type: EventType) {
        self.entry(event_type, |s| s.panicked += 1);
    }

    pub fn record_dropped(&self, event_type: EventType) {
        self.entry(event_type, |s| s.dropped += 1);
    }

    pub fn snapshot(&self) -> HashMap<&'static str, TypeStats> {
        self.inner.lock().clone()
    }
}

// ── Bus ────────────────────────────────────────────────────────────

pub struct EventBus {
    subscriptions: RwLock<HashMap<EventType, Vec<Subscription>>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    stats: Arc<EventStats>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            middleware: RwLock::new(Vec::new()),
            stats: Arc::new(EventStats::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn stats(&self) -> &Arc<EventStats> {
        &self.stats
    }

    /// Append a middleware. The first appended is the outermost wrapper.
    pub fn use_middleware(&self, mw: Arc<dyn Middleware>) {
        self.middleware.write().push(mw);
    }

    /// Register a handler for an event type.
    pub fn subscribe(&self, event_type: EventType, handler: Handler) -> SubscriptionHandle {
        self.subscribe_inner(event_type, handler, None)
    }

    /// Register a handler whose invocations are abandoned (but not killed)
    /// after `timeout`. Abandonment is logged and counted.
    pub fn subscribe_with_timeout(
        &self,
        event_type: EventType,
        handler: Handler,
        timeout: Duration,
    ) -> SubscriptionHandle {
        self.subscribe_inner(event_type, handler, Some(timeout))
    }

    fn subscribe_inner(
        &self,
        event_type: EventType,
        handler: Handler,
        timeout: Option<Duration>,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions
            .write()
            .entry(event_type)
            .or_default()
            .push(Subscription { id, handler, timeout });
        SubscriptionHandle { event_type, id }
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        if let Some(subs) = self.subscriptions.write().get_mut(&handle.event_type) {
            subs.retain(|s| s.id != handle.id);
        }
    }

    /// Publish an event. Never blocks on handlers: the middleware chain and
    /// handler dispatch run on a fresh task, against a snapshot of the
    /// subscribers current at publication time.
    pub fn publish(&self, event: Event) {
        self.stats.record_published(event.event_type);
        tracing::debug!(
            event = event.event_type.as_str(),
            connection_id = %event.connection_id,
            "publishing event"
        );

        let chain = self.middleware.read().clone();
        let handlers: Vec<(Handler, Option<Duration>)> = self
            .subscriptions
            .read()
            .get(&event.event_type)
            .map(|list| {
                list.iter()
                    .map(|s| (Arc::clone(&s.handler), s.timeout))
                    .collect()
            })
            .unwrap_or_default();
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            let dispatch_stats = Arc::clone(&stats);
            let endpoint = move |event: Event| -> HandlerFuture {
                let handlers = handlers.clone();
                let stats = Arc::clone(&dispatch_stats);
                Box::pin(async move {
                    dispatch(event, handlers, stats);
                    Ok(())
                })
            };
            let next = Next::new(&chain, &endpoint);
            if let Err(e) = next.run(&event).await {
                tracing::warn!(
                    event = event.event_type.as_str(),
                    connection_id = %event.connection_id,
                    error = %e,
                    "event dropped by middleware"
                );
                stats.record_dropped(event.event_type);
            }
        });
    }

    /// Synchronously register a one-shot watch for the next event of
    /// `event_type` on `connection_id`. The subscription exists before this
    /// returns, so an event published immediately afterwards cannot be
    /// missed. The caller must [`EventBus::unsubscribe`] the handle.
    pub fn watch_for(
        &self,
        event_type: EventType,
        connection_id: &str,
    ) -> (SubscriptionHandle, oneshot::Receiver<Event>) {
        let (tx, rx) = oneshot::channel::<Event>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let wanted = connection_id.to_owned();

        let handle = self.subscribe(
            event_type,
            Arc::new(move |event: Event| {
                let tx = Arc::clone(&tx);
                let wanted = wanted.clone();
                Box::pin(async move {
                    if event.connection_id == wanted {
                        if let Some(tx) = tx.lock().take() {
                            let _ = tx.send(event);
                        }
                    }
                    Ok(())
                })
            }),
        );
        (handle, rx)
    }

    /// Wait for the next event of `event_type` for `connection_id`, with a
    /// deadline. The temporary subscription is removed either way.
    pub async fn wait_for(
        &self,
        event_type: EventType,
        connection_id: &str,
        deadline: Duration,
    ) -> anyhow::Result<Event> {
        let (handle, rx) = self.watch_for(event_type, connection_id);
        let result = tokio::time::timeout(deadline, rx).await;
        self.unsubscribe(handle);
        match result {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => anyhow::bail!(
                "event bus dropped while waiting for {}",
                event_type.as_str()
            ),
            Err(_) => anyhow::bail!(
                "timed out waiting {:?} for {} on {}",
                deadline,
                event_type.as_str(),
                connection_id
            ),
        }
    }
}

/// Fan an event out to its subscribers, one task per subscription so a
/// slow or panicking handler cannot affect the others.
fn dispatch(event: Event, handlers: Vec<(Handler, Option<Duration>)>, stats: Arc<EventStats>) {
    for (handler, handler_timeout) in handlers {
        let event = event.clone();
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            let event_type = event.event_type;
            let connection_id = event.connection_id.clone();
            // Run the handler in its own task so a timeout abandons it
            // without cancelling it, and a panic stays contained.
            let work = tokio::spawn(handler(event));
            let outcome = match handler_timeout {
                Some(t) => match tokio::time::timeout(t, work).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        tracing::warn!(
                            event = event_type.as_str(),
                            connection_id = %connection_id,
                            timeout_ms = t.as_millis() as u64,
                            "handler exceeded its deadline; abandoned"
                        );
                        stats.record_timed_out(event_type);
                        return;
                    }
                },
                None => work.await,
            };
            match outcome {
                Ok(Ok(())) => stats.record_handled(event_type),
                Ok(Err(e)) => {
                    tracing::warn!(
                        event = event_type.as_str(),
                        connection_id = %connection_id,
                        error = %e,
                        "handler failed"
                    );
                    stats.record_failed(event_type);
                }
                Err(join_err) => {
                    if join_err.is_panic() {
                        tracing::error!(
                            event = event_type.as_str(),
                            connection_id = %connection_id,
                            "handler panicked"
                        );
                        stats.record_panicked(event_type);
                    }
                }
            }
        });
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_event| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn event_type_names_match_wire_names() {
        assert_eq!(EventType::AiConnectionInit.as_str(), "AIConnectionInit");
        assert_eq!(EventType::SdpOfferReceived.as_str(), "SDPOfferReceived");
        assert_eq!(EventType::IceConnectionChanged.as_str(), "ICEConnectionChanged");
        assert_eq!(EventType::all().len(), 13);
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = Arc::new(EventBus::new());
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventType::ConnectionCreated, counting_handler(Arc::clone(&a)));
        bus.subscribe(EventType::ConnectionCreated, counting_handler(Arc::clone(&b)));
        bus.subscribe(EventType::ConnectionReady, counting_handler(Arc::clone(&b)));

        bus.publish(Event::new(EventType::ConnectionCreated, "c1"));
        settle().await;

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_failure_is_isolated() {
        let bus = Arc::new(EventBus::new());
        let ok = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            EventType::ConnectionCreated,
            Arc::new(|_| Box::pin(async { anyhow::bail!("boom") })),
        );
        bus.subscribe(EventType::ConnectionCreated, counting_handler(Arc::clone(&ok)));

        bus.publish(Event::new(EventType::ConnectionCreated, "c1"));
        settle().await;

        assert_eq!(ok.load(Ordering::SeqCst), 1);
        let stats = bus.stats().snapshot();
        assert_eq!(stats["ConnectionCreated"].failed, 1);
        assert_eq!(stats["ConnectionCreated"].handled, 1);
    }

    #[tokio::test]
    async fn handler_panic_is_contained_and_counted() {
        let bus = Arc::new(EventBus::new());
        let ok = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            EventType::AudioTrackReady,
            Arc::new(|_| Box::pin(async { panic!("handler bug") })),
        );
        bus.subscribe(EventType::AudioTrackReady, counting_handler(Arc::clone(&ok)));

        bus.publish(Event::new(EventType::AudioTrackReady, "c1"));
        settle().await;

        assert_eq!(ok.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().snapshot()["AudioTrackReady"].panicked, 1);
    }

    #[tokio::test]
    async fn slow_handler_is_abandoned_after_timeout() {
        let bus = Arc::new(EventBus::new());
        bus.subscribe_with_timeout(
            EventType::AiConnectionInit,
            Arc::new(|_| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                })
            }),
            Duration::from_millis(20),
        );

        bus.publish(Event::new(EventType::AiConnectionInit, "c1"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(bus.stats().snapshot()["AIConnectionInit"].timed_out, 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = Arc::new(EventBus::new());
        let n = Arc::new(AtomicUsize::new(0));
        let handle = bus.subscribe(EventType::ConnectionReady, counting_handler(Arc::clone(&n)));

        bus.publish(Event::new(EventType::ConnectionReady, "c1"));
        settle().await;
        bus.unsubscribe(handle);
        bus.publish(Event::new(EventType::ConnectionReady, "c1"));
        settle().await;

        assert_eq!(n.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_for_resolves_on_matching_connection() {
        let bus = Arc::new(EventBus::new());
        let waiter = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                bus.wait_for(EventType::AiConnectionInit, "c2", Duration::from_secs(1))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Non-matching connection must not resolve the wait.
        bus.publish(Event::new(EventType::AiConnectionInit, "c1"));
        bus.publish(Event::new(EventType::AiConnectionInit, "c2"));

        let event = waiter.await.unwrap().unwrap();
        assert_eq!(event.connection_id, "c2");
    }

    #[tokio::test]
    async fn wait_for_times_out() {
        let bus = Arc::new(EventBus::new());
        let err = bus
            .wait_for(EventType::AiAudioReady, "c1", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        // Temporary subscription must be gone.
        assert!(bus.subscriptions.read()[&EventType::AiAudioReady].is_empty());
    }
}
