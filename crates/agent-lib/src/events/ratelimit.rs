//! Rate-limiting event source decorator
//!
//! Wraps any [`EventSource`] and forwards its events at a bounded rate.
//! Bursts are absorbed by a small fixed-capacity buffer; once the buffer is
//! full further events are dropped silently. A lost trigger is acceptable
//! because the next periodic tick re-triggers a scan, while unbounded
//! buffering is not.

use super::EventSource;
use crate::error::TopologyError;
use crate::models::TriggerEvent;
use crate::observability;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Default burst-buffer capacity.
const DEFAULT_BUFFER_CAPACITY: usize = 10;

/// Rate-limiter configuration: at most `max_events` forwarded per
/// `time_unit`.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_events: u64,
    pub time_unit: Duration,
    pub buffer_capacity: usize,
}

impl RateLimitConfig {
    pub fn new(max_events: u64, time_unit: Duration) -> Self {
        Self {
            max_events,
            time_unit,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

/// Fixed-window token bucket: up to `capacity` takes per `window`, then the
/// caller sleeps until the window rolls over.
pub struct TokenBucket {
    capacity: u64,
    window: Duration,
    taken: u64,
    window_start: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u64, window: Duration) -> Self {
        Self {
            capacity,
            window,
            taken: 0,
            window_start: Instant::now(),
        }
    }

    /// Take one token, sleeping until one is available.
    pub async fn take(&mut self) {
        loop {
            let now = Instant::now();
            if now.duration_since(self.window_start) >= self.window {
                self.window_start = now;
                self.taken = 0;
            }
            if self.taken < self.capacity {
                self.taken += 1;
                return;
            }
            tokio::time::sleep_until(self.window_start + self.window).await;
        }
    }
}

/// Decorator forwarding a wrapped source's events at a bounded rate.
///
/// Two tasks run internally: a receiver draining the wrapped source into the
/// burst buffer (dropping on overflow), and a sender pulling from the buffer
/// behind the token bucket. The forward to the public channel blocks, so
/// backpressure lands on the limiter itself, never on the wrapped source.
pub struct RateLimitedEventSource {
    inner: Box<dyn EventSource>,
    config: RateLimitConfig,
    out_tx: mpsc::Sender<TriggerEvent>,
    out_rx: Option<mpsc::Receiver<TriggerEvent>>,
    stop_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl RateLimitedEventSource {
    pub fn new(inner: Box<dyn EventSource>, config: RateLimitConfig) -> Self {
        let (out_tx, out_rx) = mpsc::channel(config.buffer_capacity.max(1));
        let (stop_tx, _) = broadcast::channel(1);

        Self {
            inner,
            config,
            out_tx,
            out_rx: Some(out_rx),
            stop_tx,
            tasks: Vec::new(),
        }
    }

    fn spawn_receiver(
        &mut self,
        mut src_rx: mpsc::Receiver<TriggerEvent>,
        buffer_tx: mpsc::Sender<TriggerEvent>,
    ) {
        let mut stop_rx = self.stop_tx.subscribe();

        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_event = src_rx.recv() => {
                        match maybe_event {
                            Some(event) => match buffer_tx.try_send(event) {
                                Ok(()) => {}
                                Err(TrySendError::Full(_)) => {
                                    observability::metrics().inc_events_dropped();
                                    debug!("Burst buffer full, dropping trigger event");
                                }
                                Err(TrySendError::Closed(_)) => break,
                            },
                            None => {
                                debug!("Wrapped event source closed");
                                break;
                            }
                        }
                    }
                    _ = stop_rx.recv() => break,
                }
            }
        }));
    }

    fn spawn_sender(&mut self, mut buffer_rx: mpsc::Receiver<TriggerEvent>) {
        let mut bucket = TokenBucket::new(self.config.max_events, self.config.time_unit);
        let out_tx = self.out_tx.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_event = buffer_rx.recv() => {
                        match maybe_event {
                            Some(event) => {
                                bucket.take().await;
                                if out_tx.send(event).await.is_err() {
                                    debug!("Event channel closed, stopping rate limiter");
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = stop_rx.recv() => break,
                }
            }
        }));
    }
}

#[async_trait]
impl EventSource for RateLimitedEventSource {
    fn events(&mut self) -> Result<mpsc::Receiver<TriggerEvent>, TopologyError> {
        self.out_rx.take().ok_or(TopologyError::EventStreamTaken)
    }

    async fn run(&mut self) -> Result<(), TopologyError> {
        self.inner.run().await?;
        let src_rx = self.inner.events()?;

        let (buffer_tx, buffer_rx) = mpsc::channel(self.config.buffer_capacity.max(1));
        self.spawn_receiver(src_rx, buffer_tx);
        self.spawn_sender(buffer_rx);
        Ok(())
    }

    /// Shutdown order is a hard invariant: the wrapped source must be stopped
    /// and fully waited-on before the receiver task exits, otherwise the
    /// wrapped source could block forever handing off an event to a receiver
    /// that is already gone.
    async fn stop(&mut self) {
        self.inner.stop().await;
        self.inner.wait().await;
        let _ = self.stop_tx.send(());
    }

    async fn wait(&mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventOrigin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Event source that emits a fixed burst of events immediately.
    struct BurstSource {
        count: usize,
        out_rx: Option<mpsc::Receiver<TriggerEvent>>,
        out_tx: mpsc::Sender<TriggerEvent>,
        stopped: Arc<AtomicBool>,
        task: Option<JoinHandle<()>>,
    }

    impl BurstSource {
        fn new(count: usize) -> Self {
            let (out_tx, out_rx) = mpsc::channel(count.max(1));
            Self {
                count,
                out_rx: Some(out_rx),
                out_tx,
                stopped: Arc::new(AtomicBool::new(false)),
                task: None,
            }
        }
    }

    #[async_trait]
    impl EventSource for BurstSource {
        fn events(&mut self) -> Result<mpsc::Receiver<TriggerEvent>, TopologyError> {
            self.out_rx.take().ok_or(TopologyError::EventStreamTaken)
        }

        async fn run(&mut self) -> Result<(), TopologyError> {
            let tx = self.out_tx.clone();
            let count = self.count;
            self.task = Some(tokio::spawn(async move {
                for _ in 0..count {
                    if tx.send(TriggerEvent::now(EventOrigin::FsNotify)).await.is_err() {
                        break;
                    }
                }
            }));
            Ok(())
        }

        async fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        async fn wait(&mut self) {
            if let Some(task) = self.task.take() {
                task.abort();
                let _ = task.await;
            }
        }

        fn close(&mut self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_paces_takes() {
        let mut bucket = TokenBucket::new(3, Duration::from_secs(1));
        let start = Instant::now();

        for _ in 0..3 {
            bucket.take().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Fourth take must wait for the window to roll over.
        bucket.take().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_paced_to_configured_rate() {
        let source = Box::new(BurstSource::new(6));
        let mut limiter = RateLimitedEventSource::new(
            source,
            RateLimitConfig {
                max_events: 2,
                time_unit: Duration::from_secs(1),
                buffer_capacity: 16,
            },
        );

        let mut events = limiter.events().unwrap();
        limiter.run().await.unwrap();

        let start = Instant::now();
        let mut arrival_windows = Vec::new();
        for _ in 0..6 {
            let event = events.recv().await.expect("event stream closed early");
            assert_eq!(event.origin, EventOrigin::FsNotify);
            arrival_windows.push(start.elapsed().as_secs());
        }

        // Two events per one-second window.
        assert_eq!(arrival_windows, vec![0, 0, 1, 1, 2, 2]);

        limiter.stop().await;
        limiter.wait().await;
        limiter.close();
    }

    #[tokio::test]
    async fn test_overflow_beyond_buffer_is_dropped() {
        // One event per hour: the sender forwards one event and then parks in
        // the token bucket, so the burst can only land in the buffer.
        let source = Box::new(BurstSource::new(32));
        let mut limiter = RateLimitedEventSource::new(
            source,
            RateLimitConfig {
                max_events: 1,
                time_unit: Duration::from_secs(3600),
                buffer_capacity: 2,
            },
        );

        let mut events = limiter.events().unwrap();
        limiter.run().await.unwrap();

        // Let the receiver churn through the burst.
        tokio::time::sleep(Duration::from_millis(200)).await;

        limiter.stop().await;

        let mut delivered = 0;
        while events.try_recv().is_ok() {
            delivered += 1;
        }

        assert!(delivered >= 1, "at least one event should get through");
        assert!(
            delivered < 32,
            "excess events beyond the buffer must be dropped, got {delivered}"
        );
    }

    #[tokio::test]
    async fn test_stop_halts_wrapped_source_first() {
        let source = Box::new(BurstSource::new(1));
        let stopped = source.stopped.clone();

        let mut limiter =
            RateLimitedEventSource::new(source, RateLimitConfig::new(10, Duration::from_secs(1)));

        let _events = limiter.events().unwrap();
        limiter.run().await.unwrap();

        limiter.stop().await;
        // stop() returns only after the wrapped source is stopped and
        // drained; the limiter's own tasks go down afterwards.
        assert!(stopped.load(Ordering::SeqCst));
        limiter.wait().await;
        limiter.close();
    }
}
