//! Trigger-event production for the scan pipeline
//!
//! An [`EventSource`] merges two trigger streams into one channel: a
//! fixed-interval ticker (periodic events) and filesystem watches over the
//! notify file and kubelet state directories (reactive events). The
//! rate-limiting decorator in [`ratelimit`] wraps any source behind the same
//! contract.

mod filters;
pub mod ratelimit;

pub use filters::{
    EventFilterSet, FsEventFilter, NotifyFileFilter, StateDirFilter, KUBELET_STATE_FILES,
};
pub use ratelimit::{RateLimitConfig, RateLimitedEventSource};

use crate::error::TopologyError;
use crate::models::{EventOrigin, TriggerEvent};
use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the public event channel.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Source of trigger events.
///
/// Lifecycle: `run` once, consume the stream from `events`, then `stop`,
/// `wait`, and finally `close` to release watch handles. Decorators expose
/// the same contract so they are transparently substitutable.
#[async_trait]
pub trait EventSource: Send {
    /// Take the receiving half of the event stream. Yields the stream on the
    /// first call and errors afterwards.
    fn events(&mut self) -> Result<mpsc::Receiver<TriggerEvent>, TopologyError>;

    /// Start producing events. Call once.
    async fn run(&mut self) -> Result<(), TopologyError>;

    /// Signal shutdown to the producing tasks.
    async fn stop(&mut self);

    /// Block until all producing tasks have drained and exited.
    async fn wait(&mut self);

    /// Release filesystem watch handles.
    fn close(&mut self);
}

/// Configuration for the timer/filesystem event source.
#[derive(Debug, Clone, Default)]
pub struct FsEventSourceConfig {
    /// Periodic trigger interval; zero disables the ticker.
    pub sleep_interval: Duration,
    /// File external writers touch to request a re-scan.
    pub notify_file: Option<PathBuf>,
    /// Kubelet state directories to watch for checkpoint-file creation.
    pub kubelet_state_dirs: Vec<PathBuf>,
}

/// Event source merging a periodic ticker with filesystem watches.
pub struct FsEventSource {
    config: FsEventSourceConfig,
    out_tx: mpsc::Sender<TriggerEvent>,
    out_rx: Option<mpsc::Receiver<TriggerEvent>>,
    stop_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    watcher: Option<RecommendedWatcher>,
}

impl FsEventSource {
    pub fn new(config: FsEventSourceConfig) -> Self {
        let (out_tx, out_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (stop_tx, _) = broadcast::channel(1);

        Self {
            config,
            out_tx,
            out_rx: Some(out_rx),
            stop_tx,
            tasks: Vec::new(),
            watcher: None,
        }
    }

    /// Create the notify file if absent. A pre-existing path must be an
    /// empty regular file; anything else (symlink, directory, data file)
    /// refuses startup rather than silently watching the wrong thing.
    fn ensure_notify_file(path: &Path) -> Result<(), TopologyError> {
        match std::fs::symlink_metadata(path) {
            Ok(meta) => {
                if !meta.is_file() {
                    return Err(TopologyError::NotifyFile {
                        path: path.to_path_buf(),
                        reason: "path exists and is not a regular file".to_string(),
                    });
                }
                if meta.len() > 0 {
                    return Err(TopologyError::NotifyFile {
                        path: path.to_path_buf(),
                        reason: "path exists and is not empty".to_string(),
                    });
                }
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| TopologyError::NotifyFile {
                        path: path.to_path_buf(),
                        reason: format!("failed to create parent directory: {e}"),
                    })?;
                }
                OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(path)
                    .map_err(|e| TopologyError::NotifyFile {
                        path: path.to_path_buf(),
                        reason: format!("failed to create: {e}"),
                    })?;
                info!(path = %path.display(), "Created notify file");
                Ok(())
            }
            Err(e) => Err(TopologyError::NotifyFile {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }

    fn build_filter(&self) -> EventFilterSet {
        let mut set = EventFilterSet::new();
        if let Some(path) = &self.config.notify_file {
            set.add(Box::new(NotifyFileFilter::new(path.clone())));
        }
        if !self.config.kubelet_state_dirs.is_empty() {
            set.add(Box::new(StateDirFilter::new(
                self.config.kubelet_state_dirs.clone(),
            )));
        }
        set
    }

    /// Directories to watch: the notify file's parent and each state dir.
    fn watch_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(file) = &self.config.notify_file {
            if let Some(parent) = file.parent() {
                paths.push(parent.to_path_buf());
            }
        }
        paths.extend(self.config.kubelet_state_dirs.iter().cloned());
        paths
    }

    fn spawn_ticker(&mut self) {
        let interval = self.config.sleep_interval;
        let out_tx = self.out_tx.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so the interval is
            // honored from startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let event = TriggerEvent::now(EventOrigin::Periodic);
                        if out_tx.send(event).await.is_err() {
                            debug!("Event channel closed, stopping ticker");
                            break;
                        }
                    }
                    _ = stop_rx.recv() => {
                        debug!("Stopping periodic ticker");
                        break;
                    }
                }
            }
        }));
    }

    fn spawn_fs_pump(&mut self, mut raw_rx: mpsc::UnboundedReceiver<notify::Event>) {
        let filter = self.build_filter();
        let out_tx = self.out_tx.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_raw = raw_rx.recv() => {
                        match maybe_raw {
                            Some(raw) => {
                                if !filter.matches(&raw) {
                                    continue;
                                }
                                debug!(kind = ?raw.kind, "Filesystem trigger");
                                let event = TriggerEvent::now(EventOrigin::FsNotify);
                                if out_tx.send(event).await.is_err() {
                                    debug!("Event channel closed, stopping fs pump");
                                    break;
                                }
                            }
                            None => {
                                debug!("Watcher channel closed");
                                break;
                            }
                        }
                    }
                    _ = stop_rx.recv() => {
                        debug!("Stopping filesystem event pump");
                        break;
                    }
                }
            }
        }));
    }
}

#[async_trait]
impl EventSource for FsEventSource {
    fn events(&mut self) -> Result<mpsc::Receiver<TriggerEvent>, TopologyError> {
        self.out_rx.take().ok_or(TopologyError::EventStreamTaken)
    }

    async fn run(&mut self) -> Result<(), TopologyError> {
        if let Some(path) = &self.config.notify_file {
            Self::ensure_notify_file(path)?;
        }

        let watch_paths = self.watch_paths();
        if !watch_paths.is_empty() {
            let (raw_tx, raw_rx) = mpsc::unbounded_channel();

            let mut watcher = RecommendedWatcher::new(
                move |res: Result<notify::Event, notify::Error>| match res {
                    Ok(event) => {
                        let _ = raw_tx.send(event);
                    }
                    Err(e) => warn!(error = %e, "Filesystem watch error"),
                },
                notify::Config::default(),
            )?;

            for path in &watch_paths {
                watcher.watch(path, RecursiveMode::NonRecursive)?;
                info!(path = %path.display(), "Watching for resource state changes");
            }

            self.watcher = Some(watcher);
            self.spawn_fs_pump(raw_rx);
        }

        if !self.config.sleep_interval.is_zero() {
            info!(
                interval_secs = self.config.sleep_interval.as_secs(),
                "Starting periodic trigger"
            );
            self.spawn_ticker();
        }

        Ok(())
    }

    async fn stop(&mut self) {
        let _ = self.stop_tx.send(());
    }

    async fn wait(&mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }

    fn close(&mut self) {
        self.watcher = None;
    }
}

/// Build the configured event source chain: the timer/filesystem source,
/// wrapped by the rate limiter when one is configured.
pub fn make_event_source(
    fs_config: FsEventSourceConfig,
    rate_limit: Option<RateLimitConfig>,
) -> Box<dyn EventSource> {
    let source = Box::new(FsEventSource::new(fs_config));
    match rate_limit {
        Some(config) => {
            info!(
                max_events = config.max_events,
                time_unit_secs = config.time_unit.as_secs(),
                "Rate limiting trigger events"
            );
            Box::new(RateLimitedEventSource::new(source, config))
        }
        None => source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use tokio::time::timeout;

    #[test]
    fn test_ensure_notify_file_creates_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub").join("notify");

        FsEventSource::ensure_notify_file(&path).unwrap();
        assert!(path.is_file());

        // Idempotent on the empty file it just created.
        FsEventSource::ensure_notify_file(&path).unwrap();
    }

    #[test]
    fn test_ensure_notify_file_rejects_non_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notify");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"stale data").unwrap();

        let err = FsEventSource::ensure_notify_file(&path).unwrap_err();
        assert!(matches!(err, TopologyError::NotifyFile { .. }));
    }

    #[test]
    fn test_ensure_notify_file_rejects_directory() {
        let dir = TempDir::new().unwrap();

        let err = FsEventSource::ensure_notify_file(dir.path()).unwrap_err();
        assert!(matches!(err, TopologyError::NotifyFile { .. }));
    }

    #[tokio::test]
    async fn test_events_stream_taken_once() {
        let mut source = FsEventSource::new(FsEventSourceConfig::default());
        assert!(source.events().is_ok());
        assert!(matches!(
            source.events(),
            Err(TopologyError::EventStreamTaken)
        ));
    }

    #[tokio::test]
    async fn test_ticker_produces_periodic_events() {
        let mut source = FsEventSource::new(FsEventSourceConfig {
            sleep_interval: Duration::from_millis(10),
            ..Default::default()
        });

        let mut events = source.events().unwrap();
        source.run().await.unwrap();

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for periodic event")
            .expect("event stream closed");
        assert_eq!(event.origin, EventOrigin::Periodic);

        source.stop().await;
        source.wait().await;
        source.close();
    }

    #[tokio::test]
    async fn test_notify_file_write_produces_reactive_event() {
        let dir = TempDir::new().unwrap();
        let notify_file = dir.path().join("notify");

        let mut source = FsEventSource::new(FsEventSourceConfig {
            sleep_interval: Duration::ZERO,
            notify_file: Some(notify_file.clone()),
            kubelet_state_dirs: Vec::new(),
        });

        let mut events = source.events().unwrap();
        source.run().await.unwrap();

        // Give the watcher a moment to arm before touching the file.
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&notify_file, b"poke").unwrap();

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for reactive event")
            .expect("event stream closed");
        assert_eq!(event.origin, EventOrigin::FsNotify);

        source.stop().await;
        source.wait().await;
        source.close();
    }

    #[tokio::test]
    async fn test_state_dir_create_produces_reactive_event() {
        let dir = TempDir::new().unwrap();

        let mut source = FsEventSource::new(FsEventSourceConfig {
            sleep_interval: Duration::ZERO,
            notify_file: None,
            kubelet_state_dirs: vec![dir.path().to_path_buf()],
        });

        let mut events = source.events().unwrap();
        source.run().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(dir.path().join("cpu_manager_state"), b"{}").unwrap();

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for reactive event")
            .expect("event stream closed");
        assert_eq!(event.origin, EventOrigin::FsNotify);

        source.stop().await;
        source.wait().await;
        source.close();
    }
}
