//! Observer event bus: a fire-and-forget, batched, circuit-broken emission
//! surface. Grounds on the channel-fed background-drain-loop shape used for
//! UWB out-of-collision-sequence events, and the batch-flush-on-size-or-timer
//! loop used for ingestion persistence.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::config::Config;
use crate::id::SortableId;
use crate::store::KvStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circle_id: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Event {
            event_id: SortableId::new(now.timestamp_millis().max(0) as u64).to_hex(),
            event_type: event_type.into(),
            user_id: user_id.into(),
            related_user_id: None,
            circle_id: None,
            metadata: HashMap::new(),
            created_at: now,
        }
    }

    pub fn with_related_user(mut self, user_id: impl Into<String>) -> Self {
        self.related_user_id = Some(user_id.into());
        self
    }

    pub fn with_circle(mut self, circle_id: impl Into<String>) -> Self {
        self.circle_id = Some(circle_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Sliding-window failure-rate gate. Single-owner (only the flusher task
/// touches it), so it needs no internal locking.
struct CircuitBreaker {
    state: BreakerState,
    failure_window: VecDeque<Instant>,
    window_size: Duration,
    failure_threshold: u32,
    reset_timeout: Duration,
    success_threshold: u32,
    opened_at: Option<Instant>,
    consecutive_successes: u32,
}

impl CircuitBreaker {
    fn new(window_size: Duration, failure_threshold: u32, reset_timeout: Duration, success_threshold: u32) -> Self {
        CircuitBreaker {
            state: BreakerState::Closed,
            failure_window: VecDeque::new(),
            window_size,
            failure_threshold,
            reset_timeout,
            success_threshold,
            opened_at: None,
            consecutive_successes: 0,
        }
    }

    /// Whether a flush attempt is currently allowed. Transitions
    /// open -> half_open as a side effect once `reset_timeout` has passed.
    fn allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if self.opened_at.map(|t| t.elapsed() >= self.reset_timeout).unwrap_or(false) {
                    self.state = BreakerState::HalfOpen;
                    self.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&mut self) {
        match self.state {
            BreakerState::Closed => {}
            BreakerState::HalfOpen => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.success_threshold {
                    self.state = BreakerState::Closed;
                    self.failure_window.clear();
                    self.consecutive_successes = 0;
                }
            }
            BreakerState::Open => {}
        }
    }

    fn record_failure(&mut self) {
        match self.state {
            BreakerState::Closed => {
                let now = Instant::now();
                self.failure_window.push_back(now);
                while let Some(&front) = self.failure_window.front() {
                    if now.duration_since(front) > self.window_size {
                        self.failure_window.pop_front();
                    } else {
                        break;
                    }
                }
                if self.failure_window.len() as u32 >= self.failure_threshold {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(now);
                }
            }
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.opened_at = Some(Instant::now());
                self.consecutive_successes = 0;
            }
            BreakerState::Open => {}
        }
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        self.state == BreakerState::Open
    }
}

#[derive(Default, Debug, Clone)]
pub struct EventBusMetrics {
    pub dropped_while_open: u64,
    pub flush_failures: u64,
    pub flushed_events: u64,
}

struct SharedMetrics {
    dropped_while_open: AtomicU64,
    flush_failures: AtomicU64,
    flushed_events: AtomicU64,
}

impl Default for SharedMetrics {
    fn default() -> Self {
        SharedMetrics {
            dropped_while_open: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            flushed_events: AtomicU64::new(0),
        }
    }
}

/// The event bus handle. `emit` is synchronous and O(1); a background task
/// owns the buffer and the breaker. Cloning an `EventBus` shares the same
/// background flusher.
#[derive(Clone)]
pub struct EventBus {
    enabled: bool,
    sender: Option<mpsc::UnboundedSender<Event>>,
    metrics: Arc<SharedMetrics>,
}

impl EventBus {
    /// Spawns the flusher task and returns a handle. `enabled = false`
    /// makes `emit` a pure no-op with an idle flusher.
    pub fn start(store: Arc<dyn KvStore>, config: &Config, enabled: bool) -> Self {
        let metrics = Arc::new(SharedMetrics::default());

        if !enabled {
            return EventBus { enabled: false, sender: None, metrics };
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let flusher_metrics = metrics.clone();
        let batch_size = config.batch_size;
        let batch_wait = config.batch_wait();
        let stream_max_len = config.stream_max_len;
        let event_ttl = Duration::from_secs(config.event_ttl_secs);
        let breaker = CircuitBreaker::new(
            config.window_size(),
            config.failure_threshold,
            config.reset_timeout(),
            config.success_threshold,
        );

        tokio::spawn(run_flusher(rx, store, flusher_metrics, batch_size, batch_wait, stream_max_len, event_ttl, breaker));

        EventBus { enabled: true, sender: Some(tx), metrics }
    }

    /// Builds a bus with no background flusher at all, purely for tests
    /// that only care whether `emit` panics or blocks.
    pub fn disabled() -> Self {
        EventBus { enabled: false, sender: None, metrics: Arc::new(SharedMetrics::default()) }
    }

    /// Synchronous, non-throwing, O(1): enqueue and return.
    pub fn emit(&self, event: Event) {
        if !self.enabled {
            return;
        }
        if let Some(sender) = &self.sender {
            if sender.send(event).is_err() {
                warn!("event bus flusher task is gone, dropping event");
            }
        }
    }

    pub fn metrics(&self) -> EventBusMetrics {
        EventBusMetrics {
            dropped_while_open: self.metrics.dropped_while_open.load(Ordering::Relaxed),
            flush_failures: self.metrics.flush_failures.load(Ordering::Relaxed),
            flushed_events: self.metrics.flushed_events.load(Ordering::Relaxed),
        }
    }
}

async fn run_flusher(
    mut rx: mpsc::UnboundedReceiver<Event>,
    store: Arc<dyn KvStore>,
    metrics: Arc<SharedMetrics>,
    batch_size: usize,
    batch_wait: Duration,
    stream_max_len: usize,
    event_ttl: Duration,
    breaker: CircuitBreaker,
) {
    let breaker = Mutex::new(breaker);
    let mut buffer: Vec<Event> = Vec::with_capacity(batch_size);
    let mut oldest_buffered: Option<Instant> = None;

    loop {
        let wait_deadline = oldest_buffered
            .map(|t| batch_wait.saturating_sub(t.elapsed()))
            .unwrap_or(batch_wait);

        tokio::select! {
            maybe_event = rx.recv() => {
                match maybe_event {
                    Some(event) => {
                        if oldest_buffered.is_none() {
                            oldest_buffered = Some(Instant::now());
                        }
                        buffer.push(event);
                        if buffer.len() >= batch_size {
                            flush_batch(&mut buffer, &store, &metrics, stream_max_len, event_ttl, &breaker).await;
                            oldest_buffered = None;
                        }
                    }
                    None => {
                        if !buffer.is_empty() {
                            flush_batch(&mut buffer, &store, &metrics, stream_max_len, event_ttl, &breaker).await;
                        }
                        return;
                    }
                }
            }
            _ = tokio::time::sleep(wait_deadline), if oldest_buffered.is_some() => {
                flush_batch(&mut buffer, &store, &metrics, stream_max_len, event_ttl, &breaker).await;
                oldest_buffered = None;
            }
        }
    }
}

async fn flush_batch(
    buffer: &mut Vec<Event>,
    store: &Arc<dyn KvStore>,
    metrics: &Arc<SharedMetrics>,
    stream_max_len: usize,
    event_ttl: Duration,
    breaker: &Mutex<CircuitBreaker>,
) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);

    let allowed = {
        let mut guard = breaker.lock().await;
        guard.allow()
    };

    if !allowed {
        metrics.dropped_while_open.fetch_add(batch.len() as u64, Ordering::Relaxed);
        debug!(count = batch.len(), "circuit open, dropping batch");
        return;
    }

    let mut any_failure = false;
    for event in &batch {
        if let Err(err) = flush_one(store, event, stream_max_len, event_ttl).await {
            warn!(error = %err, event_id = %event.event_id, "event flush failed");
            any_failure = true;
            break;
        }
        metrics.flushed_events.fetch_add(1, Ordering::Relaxed);
    }

    let mut guard = breaker.lock().await;
    if any_failure {
        metrics.flush_failures.fetch_add(1, Ordering::Relaxed);
        guard.record_failure();
    } else {
        guard.record_success();
    }
}

async fn flush_one(store: &Arc<dyn KvStore>, event: &Event, stream_max_len: usize, event_ttl: Duration) -> crate::error::AppResult<()> {
    let json = serde_json::to_string(event).map_err(|e| crate::error::AppError::transient(e))?;

    store
        .hash_set_fields(&format!("observer:event:{}", event.event_id), &[("payload", json.as_str())], Some(event_ttl))
        .await?;

    store
        .xadd(
            &format!("observer:events:{}", event.event_type),
            &[("event_id", event.event_id.as_str()), ("payload", json.as_str())],
            stream_max_len,
        )
        .await?;

    store
        .xadd("observer:events:all", &[("event_id", event.event_id.as_str()), ("payload", json.as_str())], stream_max_len)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use std::sync::Arc;

    fn config() -> Config {
        let mut c = Config::from_env();
        c.batch_size = 5;
        c.batch_wait_ms = 20;
        c.failure_threshold = 3;
        c.window_size_ms = 60_000;
        c.reset_timeout_ms = 50;
        c.success_threshold = 2;
        c
    }

    #[tokio::test]
    async fn emit_is_non_blocking_and_flushes_by_size() {
        let concrete = InMemoryStore::new();
        let store: Arc<dyn KvStore> = Arc::new(concrete.clone());
        let cfg = config();
        let bus = EventBus::start(store, &cfg, true);

        for i in 0..5 {
            bus.emit(Event::new("collision.detected", format!("u{i}")));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(concrete.stream_len("observer:events:all").await, 5);
        assert_eq!(concrete.stream_len("observer:events:collision.detected").await, 5);
        assert_eq!(bus.metrics().flushed_events, 5);
    }

    #[tokio::test]
    async fn disabled_bus_never_flushes() {
        let bus = EventBus::disabled();
        bus.emit(Event::new("collision.detected", "u1"));
        assert_eq!(bus.metrics().flushed_events, 0);
    }

    #[test]
    fn breaker_opens_after_threshold_failures() {
        let mut breaker = CircuitBreaker::new(Duration::from_secs(60), 3, Duration::from_millis(20), 2);
        assert!(breaker.allow());
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());
        assert!(!breaker.allow());
    }

    #[tokio::test]
    async fn breaker_half_opens_after_reset_timeout_and_closes_on_successes() {
        let mut breaker = CircuitBreaker::new(Duration::from_secs(60), 2, Duration::from_millis(10), 2);
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_open());

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(breaker.allow());
        breaker.record_success();
        assert!(breaker.is_open() == false);
        breaker.record_success();
        assert!(!breaker.is_open());
    }

    #[test]
    fn breaker_any_failure_in_half_open_reopens() {
        let mut breaker = CircuitBreaker::new(Duration::from_secs(60), 1, Duration::from_millis(1), 2);
        breaker.record_failure();
        assert!(breaker.is_open());
        std::thread::sleep(Duration::from_millis(5));
        assert!(breaker.allow());
        breaker.record_failure();
        assert!(breaker.is_open());
    }

    #[test]
    fn event_builder_sets_optional_fields() {
        let event = Event::new("match.created", "u1").with_related_user("u2").with_circle("c1");
        assert_eq!(event.related_user_id, Some("u2".to_string()));
        assert_eq!(event.circle_id, Some("c1".to_string()));
    }
}
