//! Middleware chain for the event bus.
//!
//! Middlewares wrap publication in append order: the first `use_middleware`
//! call becomes the outermost wrapper. A middleware can observe the event,
//! enrich logs/metrics, bound the chain with a deadline, or drop the event
//! entirely by returning an error instead of calling `next.run`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use parking_lot::Mutex;

use super::{Event, EventStats, HandlerFuture};

// ── Chain plumbing ─────────────────────────────────────────────────

pub type Endpoint = dyn Fn(Event) -> HandlerFuture + Send + Sync;

#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &Event, next: Next<'_>) -> anyhow::Result<()>;
}

/// The remainder of the chain. `run` invokes the next middleware, or the
/// dispatch endpoint once the chain is exhausted.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a Endpoint,
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Middleware>], endpoint: &'a Endpoint) -> Self {
        Self { chain, endpoint }
    }

    pub async fn run(self, event: &Event) -> anyhow::Result<()> {
        match self.chain.split_first() {
            Some((first, rest)) => {
                first
                    .handle(event, Next { chain: rest, endpoint: self.endpoint })
                    .await
            }
            None => (self.endpoint)(event.clone()).await,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────────

/// Logs every event that passes through the chain.
pub struct LoggingMiddleware;

#[async_trait::async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn handle(&self, event: &Event, next: Next<'_>) -> anyhow::Result<()> {
        let started = Instant::now();
        let result = next.run(event).await;
        tracing::debug!(
            event = event.event_type.as_str(),
            connection_id = %event.connection_id,
            elapsed_us = started.elapsed().as_micros() as u64,
            ok = result.is_ok(),
            "event processed"
        );
        result
    }
}

// ── Metrics ────────────────────────────────────────────────────────

/// Counts chain outcomes into the shared [`EventStats`].
pub struct MetricsMiddleware {
    stats: Arc<EventStats>,
}

impl MetricsMiddleware {
    pub fn new(stats: Arc<EventStats>) -> Self {
        Self { stats }
    }
}

#[async_trait::async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn handle(&self, event: &Event, next: Next<'_>) -> anyhow::Result<()> {
        let result = next.run(event).await;
        if result.is_err() {
            self.stats.record_failed(event.event_type);
        }
        result
    }
}

// ── Recovery ───────────────────────────────────────────────────────

/// Captures panics raised inside the rest of the chain so publication never
/// unwinds into the caller.
pub struct RecoveryMiddleware;

#[async_trait::async_trait]
impl Middleware for RecoveryMiddleware {
    fn name(&self) -> &'static str {
        "recovery"
    }

    async fn handle(&self, event: &Event, next: Next<'_>) -> anyhow::Result<()> {
        match std::panic::AssertUnwindSafe(next.run(event)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(
                    event = event.event_type.as_str(),
                    connection_id = %event.connection_id,
                    "panic captured in event chain"
                );
                anyhow::bail!("panic in event chain")
            }
        }
    }
}

// ── Timeout ────────────────────────────────────────────────────────

/// Bounds the whole chain with a deadline.
pub struct TimeoutMiddleware {
    deadline: Duration,
}

impl TimeoutMiddleware {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }
}

#[async_trait::async_trait]
impl Middleware for TimeoutMiddleware {
    fn name(&self) -> &'static str {
        "timeout"
    }

    async fn handle(&self, event: &Event, next: Next<'_>) -> anyhow::Result<()> {
        match tokio::time::timeout(self.deadline, next.run(event)).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!(
                "event chain exceeded {:?} for {}",
                self.deadline,
                event.event_type.as_str()
            ),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────────

/// Rejects events with an empty connection id.
pub struct ValidationMiddleware;

#[async_trait::async_trait]
impl Middleware for ValidationMiddleware {
    fn name(&self) -> &'static str {
        "validation"
    }

    async fn handle(&self, event: &Event, next: Next<'_>) -> anyhow::Result<()> {
        if event.connection_id.trim().is_empty() {
            anyhow::bail!("event {} has no connection id", event.event_type.as_str());
        }
        next.run(event).await
    }
}

// ── Rate limit ─────────────────────────────────────────────────────

/// Sliding-window rate limit per event type.
pub struct RateLimitMiddleware {
    limit_per_window: u32,
    window: Duration,
    seen: Mutex<HashMap<&'static str, Vec<Instant>>>,
}

impl RateLimitMiddleware {
    pub fn new(limit_per_window: u32, window: Duration) -> Self {
        Self {
            limit_per_window,
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    fn allow(&self, key: &'static str) -> bool {
        if self.limit_per_window == 0 {
            return true;
        }
        let now = Instant::now();
        let mut seen = self.seen.lock();
        let entry = seen.entry(key).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);
        if entry.len() >= self.limit_per_window as usize {
            return false;
        }
        entry.push(now);
        true
    }
}

#[async_trait::async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn handle(&self, event: &Event, next: Next<'_>) -> anyhow::Result<()> {
        if !self.allow(event.event_type.as_str()) {
            anyhow::bail!("rate limit exceeded for {}", event.event_type.as_str());
        }
        next.run(event).await
    }
}

// ── Deduplication ──────────────────────────────────────────────────

/// Suppresses identical `(type, connection_id)` pairs within a window.
pub struct DeduplicationMiddleware {
    window: Duration,
    seen: Mutex<HashMap<(&'static str, String), Instant>>,
}

impl DeduplicationMiddleware {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if this pair is new inside the window and is now
    /// recorded.
    fn record_if_new(&self, key: (&'static str, String)) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        seen.retain(|_, t| now.duration_since(*t) < self.window);
        if seen.contains_key(&key) {
            return false;
        }
        seen.insert(key, now);
        true
    }
}

#[async_trait::async_trait]
impl Middleware for DeduplicationMiddleware {
    fn name(&self) -> &'static str {
        "deduplication"
    }

    async fn handle(&self, event: &Event, next: Next<'_>) -> anyhow::Result<()> {
        let key = (event.event_type.as_str(), event.connection_id.clone());
        if !self.record_if_new(key) {
            tracing::debug!(
                event = event.event_type.as_str(),
                connection_id = %event.connection_id,
                "duplicate event suppressed"
            );
            anyhow::bail!("duplicate event suppressed");
        }
        next.run(event).await
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn endpoint_counting(counter: Arc<AtomicUsize>) -> Box<Endpoint> {
        Box::new(move |_event| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    async fn run_chain(
        chain: Vec<Arc<dyn Middleware>>,
        endpoint: &Endpoint,
        event: &Event,
    ) -> anyhow::Result<()> {
        Next::new(&chain, endpoint).run(event).await
    }

    #[tokio::test]
    async fn chain_runs_outermost_first() {
        struct Tag(&'static str, Arc<Mutex<Vec<&'static str>>>);

        #[async_trait::async_trait]
        impl Middleware for Tag {
            fn name(&self) -> &'static str {
                self.0
            }
            async fn handle(&self, event: &Event, next: Next<'_>) -> anyhow::Result<()> {
                self.1.lock().push(self.0);
                next.run(event).await
            }
        }

        let order = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Tag("outer", Arc::clone(&order))),
            Arc::new(Tag("inner", Arc::clone(&order))),
        ];
        let hits = Arc::new(AtomicUsize::new(0));
        let endpoint = endpoint_counting(Arc::clone(&hits));
        let event = Event::new(EventType::ConnectionCreated, "c1");

        run_chain(chain, &endpoint, &event).await.unwrap();

        assert_eq!(*order.lock(), vec!["outer", "inner"]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn validation_rejects_empty_connection_id() {
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(ValidationMiddleware)];
        let hits = Arc::new(AtomicUsize::new(0));
        let endpoint = endpoint_counting(Arc::clone(&hits));

        let bad = Event::new(EventType::ConnectionCreated, "  ");
        assert!(run_chain(chain.clone(), &endpoint, &bad).await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let good = Event::new(EventType::ConnectionCreated, "c1");
        assert!(run_chain(chain, &endpoint, &good).await.is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dedup_suppresses_repeat_within_window() {
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(DeduplicationMiddleware::new(Duration::from_secs(60)))];
        let hits = Arc::new(AtomicUsize::new(0));
        let endpoint = endpoint_counting(Arc::clone(&hits));

        let event = Event::new(EventType::AiConnectionInit, "c1");
        assert!(run_chain(chain.clone(), &endpoint, &event).await.is_ok());
        assert!(run_chain(chain.clone(), &endpoint, &event).await.is_err());
        // A different connection is not a duplicate.
        let other = Event::new(EventType::AiConnectionInit, "c2");
        assert!(run_chain(chain, &endpoint, &other).await.is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rate_limit_blocks_over_budget() {
        let mw = RateLimitMiddleware::new(2, Duration::from_secs(60));
        assert!(mw.allow("X"));
        assert!(mw.allow("X"));
        assert!(!mw.allow("X"));
        // Other types have their own budget.
        assert!(mw.allow("Y"));
    }

    #[tokio::test]
    async fn timeout_bounds_the_chain() {
        struct Slow;
        #[async_trait::async_trait]
        impl Middleware for Slow {
            fn name(&self) -> &'static str {
                "slow"
            }
            async fn handle(&self, event: &Event, next: Next<'_>) -> anyhow::Result<()> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                next.run(event).await
            }
        }

        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(TimeoutMiddleware::new(Duration::from_millis(20))),
            Arc::new(Slow),
        ];
        let hits = Arc::new(AtomicUsize::new(0));
        let endpoint = endpoint_counting(Arc::clone(&hits));
        let event = Event::new(EventType::ConnectionReady, "c1");

        let err = run_chain(chain, &endpoint, &event).await.unwrap_err();
        assert!(err.to_string().contains("exceeded"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn recovery_captures_panic() {
        struct Exploding;
        #[async_trait::async_trait]
        impl Middleware for Exploding {
            fn name(&self) -> &'static str {
                "exploding"
            }
            async fn handle(&self, _event: &Event, _next: Next<'_>) -> anyhow::Result<()> {
                panic!("middleware bug")
            }
        }

        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(RecoveryMiddleware), Arc::new(Exploding)];
        let hits = Arc::new(AtomicUsize::new(0));
        let endpoint = endpoint_counting(Arc::clone(&hits));
        let event = Event::new(EventType::ConnectionReady, "c1");

        let err = run_chain(chain, &endpoint, &event).await.unwrap_err();
        assert!(err.to_string().contains("panic"));
    }
}
