//! Configuration Refresher
//!
//! Background subsystem keeping topology current. Each registered bucket
//! runs one monitor task consuming a streamed configuration source (terse
//! first, verbose as fallback per policy, plain polling as a last resort)
//! and installing strictly newer snapshots into the dispatcher. Malformed
//! or stale payloads are dropped with a diagnostic; they never surface as
//! request-level errors.

use crate::config::{FallbackPolicy, RefresherConfig};
use crate::dispatcher::TopologySink;
use crate::error::{ClientError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use reef_types::parse_payload;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod http;

pub use http::HttpConfigSource;

/// Which streaming endpoint flavor to ask the source for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Compact payload, preferred
    Terse,
    /// Fuller payload, fallback when terse fails
    Verbose,
}

/// Credentials for a bucket's configuration source.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One raw configuration payload together with the host that served it.
///
/// The origin travels with the payload rather than living on the source:
/// a source falling through its seed list must substitute `$HOST` with the
/// host the bytes actually came from, not the first seed.
#[derive(Debug, Clone)]
pub struct ConfigPayload {
    pub raw: String,
    pub origin: String,
}

/// A lazy sequence of configuration payloads. Finite on stream end/error,
/// otherwise lives until dropped.
pub type ConfigStream = BoxStream<'static, Result<ConfigPayload>>;

/// Capability interface to the configuration service.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// One-shot fetch of the bucket's current raw configuration.
    async fn fetch_once(
        &self,
        bucket: &str,
        auth: &Credentials,
        mode: StreamMode,
    ) -> Result<ConfigPayload>;

    /// Open a long-lived stream of raw configurations.
    async fn open_stream(
        &self,
        bucket: &str,
        auth: &Credentials,
        mode: StreamMode,
    ) -> Result<ConfigStream>;
}

/// Monitor state machine per registered bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Registered, stream not yet established
    Registered,
    /// Consuming a configuration stream
    Streaming,
    /// Installed configuration is provisionally unreliable
    Tainted,
    /// Taint cleared after a fresh push
    Untainted,
    /// Torn down; the last-known topology stays usable until the bucket
    /// itself is closed
    Deregistered,
}

struct BucketMonitor {
    bucket: String,
    state_tx: watch::Sender<MonitorState>,
    state_rx: watch::Receiver<MonitorState>,
    installed_revision: AtomicU64,
    shutdown: Arc<Notify>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Keeps one monitor per open bucket and pushes snapshots into the sink.
pub struct ConfigRefresher {
    sink: Arc<dyn TopologySink>,
    source: Arc<dyn ConfigSource>,
    config: RefresherConfig,
    monitors: DashMap<String, Arc<BucketMonitor>>,
}

impl ConfigRefresher {
    pub fn new(
        sink: Arc<dyn TopologySink>,
        source: Arc<dyn ConfigSource>,
        config: RefresherConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sink,
            source,
            config,
            monitors: DashMap::new(),
        })
    }

    /// Establish a configuration source for the bucket and start streaming.
    pub fn register_bucket(self: &Arc<Self>, bucket: impl Into<String>, auth: Credentials) {
        let bucket = bucket.into();
        if self.monitors.contains_key(&bucket) {
            return;
        }
        let (state_tx, state_rx) = watch::channel(MonitorState::Registered);
        let monitor = Arc::new(BucketMonitor {
            bucket: bucket.clone(),
            state_tx,
            state_rx,
            installed_revision: AtomicU64::new(0),
            shutdown: Arc::new(Notify::new()),
            task: parking_lot::Mutex::new(None),
        });
        self.monitors.insert(bucket.clone(), Arc::clone(&monitor));

        let refresher = Arc::clone(self);
        let handle = tokio::spawn(async move {
            refresher.run_monitor(monitor, auth).await;
        });
        if let Some(m) = self.monitors.get(&bucket) {
            *m.task.lock() = Some(handle);
        }
        info!(%bucket, "Bucket registered for config refresh");
    }

    /// Tear down the bucket's streaming connection. Dispatch against the
    /// last-known topology keeps working until the caller closes the bucket.
    pub fn deregister_bucket(&self, bucket: &str) {
        if let Some((_, monitor)) = self.monitors.remove(bucket) {
            monitor.shutdown.notify_one();
            if let Some(task) = monitor.task.lock().take() {
                task.abort();
            }
            monitor.state_tx.send_replace(MonitorState::Deregistered);
            info!(%bucket, "Bucket deregistered from config refresh");
        }
    }

    /// Offer a raw configuration payload, e.g. one received out-of-band.
    ///
    /// Parses, gates on revision and installs; stale or duplicate pushes are
    /// dropped silently.
    pub fn push_config(&self, bucket: &str, raw: &str, origin_host: &str) {
        let Some(monitor) = self.monitors.get(bucket).map(|m| Arc::clone(&m)) else {
            debug!(%bucket, "Dropping config push for unregistered bucket");
            return;
        };
        self.apply_raw(&monitor, raw, origin_host);
    }

    /// Flag the bucket's configuration as provisionally unreliable.
    pub fn mark_tainted(&self, bucket: &str) {
        if let Some(monitor) = self.monitors.get(bucket) {
            monitor.state_tx.send_if_modified(|s| {
                if matches!(s, MonitorState::Streaming | MonitorState::Untainted) {
                    *s = MonitorState::Tainted;
                    true
                } else {
                    false
                }
            });
            self.sink.set_tainted(bucket, true);
        }
    }

    /// Clear the taint flag.
    pub fn mark_untainted(&self, bucket: &str) {
        if let Some(monitor) = self.monitors.get(bucket) {
            monitor.state_tx.send_if_modified(|s| {
                if *s == MonitorState::Tainted {
                    *s = MonitorState::Untainted;
                    true
                } else {
                    false
                }
            });
            self.sink.set_tainted(bucket, false);
        }
    }

    /// Current monitor state for a bucket.
    pub fn state(&self, bucket: &str) -> Option<MonitorState> {
        self.monitors.get(bucket).map(|m| *m.state_rx.borrow())
    }

    /// Revision currently installed for a bucket (0 before the first).
    pub fn installed_revision(&self, bucket: &str) -> Option<u64> {
        self.monitors
            .get(bucket)
            .map(|m| m.installed_revision.load(Ordering::Acquire))
    }

    fn apply_raw(&self, monitor: &BucketMonitor, raw: &str, origin_host: &str) -> Applied {
        let map = match parse_payload(raw, origin_host) {
            Ok(map) => map,
            Err(e) => {
                warn!(bucket = %monitor.bucket, "Dropping malformed config payload: {}", e);
                return Applied::Malformed;
            }
        };
        let revision = map.revision();
        let installed = monitor.installed_revision.load(Ordering::Acquire);
        if installed != 0 && revision <= installed {
            debug!(
                bucket = %monitor.bucket,
                installed,
                offered = revision,
                "Ignoring stale config"
            );
            return Applied::Stale;
        }
        monitor.installed_revision.store(revision, Ordering::Release);
        self.sink.install(Arc::new(map));
        Applied::Installed
    }

    async fn run_monitor(self: Arc<Self>, monitor: Arc<BucketMonitor>, auth: Credentials) {
        let mut attempt: u32 = 0;
        let mut mode = StreamMode::Terse;

        loop {
            let shutdown = Arc::clone(&monitor.shutdown);
            let outcome = tokio::select! {
                _ = shutdown.notified() => break,
                outcome = self.consume_stream(&monitor, &auth, mode) => outcome,
            };

            monitor.state_tx.send_replace(MonitorState::Registered);
            match outcome {
                StreamOutcome::Delivered => {
                    // Stream ended after producing payloads; reconnect terse.
                    attempt = 0;
                    mode = StreamMode::Terse;
                }
                StreamOutcome::Failed(parse_failure) => {
                    if mode == StreamMode::Terse && self.should_fall_back(parse_failure) {
                        info!(bucket = %monitor.bucket, "Falling back to verbose config stream");
                        mode = StreamMode::Verbose;
                    } else if mode == StreamMode::Verbose {
                        // Both flavors failed; poll once before retrying the
                        // stream from the top.
                        self.poll_once(&monitor, &auth).await;
                        mode = StreamMode::Terse;
                        tokio::select! {
                            _ = shutdown.notified() => break,
                            _ = tokio::time::sleep(self.config.poll_interval) => {}
                        }
                    }
                }
            }

            let delay = self.config.reconnect.calculate_delay(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        monitor.state_tx.send_replace(MonitorState::Deregistered);
    }

    /// Consume one stream until it ends or errors. Returns whether any
    /// payload was delivered, so the fallback policy can distinguish a
    /// stream that never worked from one that died later.
    async fn consume_stream(
        &self,
        monitor: &BucketMonitor,
        auth: &Credentials,
        mode: StreamMode,
    ) -> StreamOutcome {
        let mut stream = match self.source.open_stream(&monitor.bucket, auth, mode).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(bucket = %monitor.bucket, ?mode, "Config stream open failed: {}", e);
                return StreamOutcome::Failed(false);
            }
        };

        monitor.state_tx.send_replace(MonitorState::Streaming);
        let mut delivered = false;
        let mut parse_failure = false;
        while let Some(item) = stream.next().await {
            match item {
                Ok(payload) => match self.apply_raw(monitor, &payload.raw, &payload.origin) {
                    Applied::Installed => delivered = true,
                    Applied::Malformed if !delivered => parse_failure = true,
                    Applied::Malformed | Applied::Stale => {}
                },
                Err(e) => {
                    debug!(bucket = %monitor.bucket, ?mode, "Config stream error: {}", e);
                    break;
                }
            }
        }

        if delivered {
            StreamOutcome::Delivered
        } else {
            StreamOutcome::Failed(parse_failure)
        }
    }

    async fn poll_once(&self, monitor: &BucketMonitor, auth: &Credentials) {
        match self
            .source
            .fetch_once(&monitor.bucket, auth, StreamMode::Verbose)
            .await
        {
            Ok(payload) => {
                self.apply_raw(monitor, &payload.raw, &payload.origin);
            }
            Err(e) => {
                debug!(bucket = %monitor.bucket, "Config poll failed: {}", e);
            }
        }
    }

    fn should_fall_back(&self, parse_failure: bool) -> bool {
        match self.config.fallback {
            FallbackPolicy::OnAnyError => true,
            FallbackPolicy::OnParseError => parse_failure,
            FallbackPolicy::Never => false,
        }
    }
}

/// What happened to one offered payload.
enum Applied {
    Installed,
    Stale,
    Malformed,
}

/// Why a stream attempt ended.
enum StreamOutcome {
    /// At least one payload was installed before the stream ended
    Delivered,
    /// No payload installed; the flag records whether a payload arrived but
    /// failed to parse (as opposed to connect/transport failure)
    Failed(bool),
}

/// Convenience error for sources that cannot reach any seed host.
pub fn no_config_source(bucket: &str) -> ClientError {
    ClientError::config(
        format!("no configuration source reachable for bucket '{bucket}'"),
        None,
    )
}
