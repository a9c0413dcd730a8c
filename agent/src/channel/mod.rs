//! `ChannelManager` (C5): named registry of output sinks with per-sink
//! bounded queues and fan-out (§4.5).
//!
//! Grounded on `original_source/core/cms/core/ChannelManager.h`: an
//! `atomic<bool>` start flag gating every send, and a name-to-sink map
//! (`SafeMap<string, shared_ptr<OutputChannel>>` there, `RwLock<HashMap>`
//! here since Rust's ownership already makes the map's contents safe to
//! share via `Arc` without a custom safe-map wrapper). The per-sink queue
//! trim-on-overflow policy is the same shape as the teacher's
//! `TaskScheduler::handle_task_result` emergency trim (keep the newest half
//! of a full buffer) in `agent/src/scheduler.rs`, generalized into a
//! documented `OverflowPolicy` per sink instead of one hardcoded buffer.

mod queue;
pub mod sinks;

pub use queue::OverflowPolicy;
use queue::SinkQueue;
use shared::error::MonitoringError;
use shared::metrics::Metric;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A sink's write side. Concrete sinks (local file, remote HTTP, log
/// aggregator) only need to implement this — queueing, retry suppression,
/// and poisoning are handled by `ChannelManager` uniformly.
#[async_trait::async_trait]
pub trait SinkWriter: Send + Sync {
    async fn write(&self, metrics: &[Metric]) -> shared::Result<()>;
}

struct ErrorSuppressor {
    window: Duration,
    last_seen: std::sync::Mutex<HashMap<String, Instant>>,
}

impl ErrorSuppressor {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if this error id should be logged now (first time seen,
    /// or its suppression window has elapsed).
    fn should_log(&self, error_id: &str) -> bool {
        let now = Instant::now();
        let mut map = self.last_seen.lock().unwrap();
        match map.get(error_id) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                map.insert(error_id.to_string(), now);
                true
            }
        }
    }
}

/// Shared between `ChannelManager::send` (producer side) and the spawned
/// consumer task (writer side). Split out from `SinkEntry` so the consumer
/// task can hold its own `Arc` without a cycle back through its own
/// `JoinHandle`.
struct SinkState {
    queue: Arc<SinkQueue>,
    poisoned: AtomicBool,
    consecutive_failures: AtomicU32,
    suppressor: ErrorSuppressor,
}

struct SinkEntry {
    state: Arc<SinkState>,
    _consumer: JoinHandle<()>,
}

/// Consecutive write failures after which a sink stops accepting batches
/// (§4.5 "sustained failure" poisons the output).
const POISON_THRESHOLD: u32 = 5;

pub struct ChannelManager {
    started: AtomicBool,
    sinks: RwLock<HashMap<String, Arc<SinkEntry>>>,
    default_queue_capacity: usize,
    error_suppress_window: Duration,
}

impl ChannelManager {
    pub fn new(default_queue_capacity: usize, error_suppress_window: Duration) -> Self {
        Self {
            started: AtomicBool::new(false),
            sinks: RwLock::new(HashMap::new()),
            default_queue_capacity,
            error_suppress_window,
        }
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub async fn end(&self) {
        self.started.store(false, Ordering::SeqCst);
        // Drain consumer tasks so in-flight batches get a last chance to
        // write before the process exits (§5 cancellation: sink queues
        // drain up to a grace period).
        let sinks = self.sinks.read().await;
        for entry in sinks.values() {
            entry.queue.close();
        }
    }

    /// Duplicate names are rejected (§4.5).
    pub async fn register(
        &self,
        name: impl Into<String>,
        writer: Arc<dyn SinkWriter>,
        policy: OverflowPolicy,
    ) -> shared::Result<()> {
        let name = name.into();
        let mut sinks = self.sinks.write().await;
        if sinks.contains_key(&name) {
            return Err(MonitoringError::EConfig(format!("sink '{name}' already registered")).into());
        }

        let state = Arc::new(SinkState {
            queue: Arc::new(SinkQueue::new(self.default_queue_capacity, policy)),
            poisoned: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            suppressor: ErrorSuppressor::new(self.error_suppress_window),
        });
        let consumer = spawn_consumer(name.clone(), state.clone(), writer);

        sinks.insert(
            name,
            Arc::new(SinkEntry {
                state,
                _consumer: consumer,
            }),
        );
        Ok(())
    }

    /// True if `name` is registered and not poisoned.
    pub async fn is_usable(&self, name: &str) -> bool {
        let sinks = self.sinks.read().await;
        sinks
            .get(name)
            .map(|e| !e.state.poisoned.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// For each `(sinkName, _)` in `outputs`, look up the named sink and
    /// enqueue `metrics`. Unknown sink names are logged and skipped; a
    /// poisoned sink's submission is dropped with `EPoisoned`.
    pub async fn send(
        &self,
        metrics: Vec<Metric>,
        outputs: &[(String, serde_json::Value)],
    ) -> shared::Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(MonitoringError::EIO("ChannelManager is not started".into()).into());
        }
        if metrics.is_empty() || outputs.is_empty() {
            return Ok(());
        }

        let sinks = self.sinks.read().await;
        for (sink_name, _sink_config) in outputs {
            let Some(entry) = sinks.get(sink_name) else {
                warn!(sink = %sink_name, "output references unknown sink, dropping");
                continue;
            };
            if entry.state.poisoned.load(Ordering::SeqCst) {
                debug!(sink = %sink_name, "sink is poisoned, dropping submission");
                continue;
            }
            if !entry.state.queue.push(metrics.clone()) {
                warn!(sink = %sink_name, "sink queue at capacity, batch dropped per policy");
            }
        }
        Ok(())
    }

    /// Fan out to every registered, non-poisoned sink rather than a named
    /// `outputs` list. Self-metrics (`module_status`, `script_status`,
    /// `exporter_status`, `detect_status`) and probe results have no
    /// per-task output routing of their own (§7: "emitted through the
    /// normal channel fan-out"), so they ride this instead of `send`.
    pub async fn send_to_all(&self, metrics: Vec<Metric>) {
        if metrics.is_empty() || !self.started.load(Ordering::SeqCst) {
            return;
        }
        let sinks = self.sinks.read().await;
        for entry in sinks.values() {
            if entry.state.poisoned.load(Ordering::SeqCst) {
                continue;
            }
            if !entry.state.queue.push(metrics.clone()) {
                warn!("sink queue at capacity, self-metric batch dropped per policy");
            }
        }
    }
}

fn spawn_consumer(
    name: String,
    state: Arc<SinkState>,
    writer: Arc<dyn SinkWriter>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(batch) = state.queue.pop().await else {
                debug!(sink = %name, "sink queue closed, consumer exiting");
                break;
            };
            match writer.write(&batch).await {
                Ok(()) => {
                    state.consecutive_failures.store(0, Ordering::SeqCst);
                }
                Err(e) => {
                    let failures = state.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if state.suppressor.should_log(&e.to_string()) {
                        warn!(sink = %name, error = %e, failures, "sink write failed");
                    }
                    if failures >= POISON_THRESHOLD {
                        state.poisoned.store(true, Ordering::SeqCst);
                        warn!(sink = %name, "sink poisoned after sustained failure");
                        break;
                    }
                }
            }
        }
    })
}
