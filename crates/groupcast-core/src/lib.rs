//! Groupcast Core
//!
//! Outbound dispatch engine: reactive intake, forward batching and bulk
//! campaigns behind one coordinator

pub mod activity;
pub mod backlog;
pub mod dedup;
mod engine;
pub mod error;
pub mod forward;

pub use activity::{InteractionAction, InteractionLogEntry, SkipReason, SkippedLogEntry};
pub use backlog::{BacklogCount, BacklogOptions, BacklogReport};
pub use dedup::DedupLedger;
pub use engine::{FlushReport, IngestOutcome, IntakeStats, INTAKE_NOT_READY_POLL};
pub use error::DispatchError;
pub use forward::{ForwardMeta, ForwardQueueItem};

use activity::ActivityLog;
use anyhow::Result;
use chrono::{DateTime, Utc};
use engine::{Inner, Policy};
use forward::ForwardAccumulator;
use groupcast_bulk::{BulkScheduler, BulkStatus};
use groupcast_config::{SendMode, Settings};
use groupcast_ipc::{EventBus, InboundMessage, Transport};
use groupcast_policy::{CooldownTracker, RateLimiter};
use groupcast_storage::{keys, load, save, StateStore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub running: bool,
    pub transport: String,
    pub transport_ready: bool,
    pub queue_len: usize,
    pub intake_paused: bool,
    pub stats: IntakeStats,
    pub processed_ids: usize,
    pub rate_per_minute: u32,
    pub cooldown_seconds: u64,
    pub mode: SendMode,
    /// Actions recorded in the shared rate window.
    pub recent_actions: usize,
    pub clients: usize,
    pub forward_target: Option<String>,
    pub forward_pending: usize,
    pub forward_flushing: bool,
    pub last_forwarded_at: Option<DateTime<Utc>>,
    pub bulk: BulkStatus,
}

/// Top-level coordinator owning every dispatch component.
///
/// Must be opened inside a tokio runtime; the intake worker and a resumed
/// bulk campaign are spawned immediately.
pub struct Dispatcher {
    inner: Arc<Inner>,
    bulk: BulkScheduler,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Open the engine over `store`. Settings persisted by a previous run win
    /// over `defaults`.
    pub fn open(
        defaults: Settings,
        store: Arc<dyn StateStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let settings = match load::<Settings>(store.as_ref(), keys::SETTINGS) {
            Ok(Some(persisted)) => match persisted.validate() {
                Ok(()) => persisted,
                Err(e) => {
                    warn!("Ignoring invalid persisted settings: {}", e);
                    defaults
                }
            },
            Ok(None) => defaults,
            Err(e) => {
                warn!("Failed to read persisted settings: {}", e);
                defaults
            }
        };
        settings.validate()?;

        let limiter = Arc::new(RateLimiter::new());
        let dedup = DedupLedger::open(Arc::clone(&store), settings.engine.dedup_capacity)?;
        let activity = ActivityLog::new(Arc::clone(&store), settings.engine.log_capacity);
        let forward = ForwardAccumulator::open(Arc::clone(&store))?;
        let last_checked: HashMap<String, i64> =
            load(store.as_ref(), keys::LAST_CHECKED)?.unwrap_or_default();
        let bulk = BulkScheduler::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::clone(&limiter),
            settings.engine.rate_per_minute,
        );

        let inner = Arc::new(Inner {
            policy: RwLock::new(Arc::new(Policy::new(settings))),
            store,
            transport,
            limiter,
            cooldown: CooldownTracker::new(),
            dedup,
            activity,
            forward,
            running: AtomicBool::new(false),
            intake_paused: AtomicBool::new(false),
            intake: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            lane: tokio::sync::Mutex::new(()),
            flush_gate: tokio::sync::Mutex::new(()),
            stats: Mutex::new(IntakeStats::default()),
            last_checked: Mutex::new(last_checked),
        });

        let status = bulk.restore()?;
        if status.state == groupcast_bulk::CampaignPhase::Running {
            info!(
                "Restored bulk campaign to {:?}: {}/{}",
                status.destination, status.sent_count, status.total_count
            );
        }

        let worker = tokio::spawn(engine::intake_worker(Arc::clone(&inner)));
        Ok(Self {
            inner,
            bulk,
            tasks: Mutex::new(vec![worker]),
        })
    }

    /// Feed inbound messages published on `bus` into the intake path.
    pub fn attach(&self, bus: &EventBus) {
        let mut rx = bus.subscribe();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if !inner.is_running() {
                            debug!(
                                "Engine stopped, ignoring message {} (trace_id={})",
                                envelope.message.id, envelope.trace_id
                            );
                            continue;
                        }
                        inner.ingest(envelope.message);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Inbound listener lagged, {} message(s) missed", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }

    /// Stop background tasks. Persisted state is left untouched.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.bulk.shutdown();
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }

    pub async fn start(&self) {
        if !self.inner.transport.is_ready().await {
            warn!(
                "Starting engine while transport '{}' is not ready",
                self.inner.transport.name()
            );
        }
        if !self.inner.running.swap(true, Ordering::SeqCst) {
            info!("Reactive engine started");
        }
        self.inner.wake.notify_one();
    }

    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            info!("Reactive engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// Hold queued messages without stopping the engine. Intake keeps accepting.
    pub fn pause_intake(&self) -> bool {
        let changed = !self.inner.intake_paused.swap(true, Ordering::SeqCst);
        if changed {
            info!("Intake paused with {} message(s) queued", self.inner.queue_len());
        }
        changed
    }

    pub fn resume_intake(&self) -> bool {
        let changed = self.inner.intake_paused.swap(false, Ordering::SeqCst);
        if changed {
            info!("Intake resumed");
            self.inner.wake.notify_one();
        }
        changed
    }

    /// Discard queued messages that have not been sent yet.
    pub fn clear_intake(&self) -> usize {
        let removed = self.inner.clear_intake();
        info!("Cleared {} message(s) from the intake queue", removed);
        removed
    }

    /// Accept one inbound message into the intake path.
    pub fn ingest(&self, message: InboundMessage) -> Result<IngestOutcome, DispatchError> {
        if !self.inner.is_running() {
            return Err(DispatchError::EngineStopped);
        }
        Ok(self.inner.ingest(message))
    }

    pub fn enqueue_forward(&self, message: &InboundMessage) -> Result<bool, DispatchError> {
        let policy = self.inner.policy();
        if policy.forward_target().is_none() {
            return Err(DispatchError::ForwardingDisabled);
        }
        Ok(self.inner.enqueue_forward(&policy, message))
    }

    /// Forward everything queued now, regardless of batch size.
    pub async fn flush(&self) -> Result<FlushReport, DispatchError> {
        if self.inner.policy().forward_target().is_none() {
            return Err(DispatchError::ForwardingDisabled);
        }
        Ok(self.inner.flush(true).await)
    }

    pub fn clear_forward(&self) -> Result<usize> {
        let removed = self.inner.forward.clear()?;
        info!("Cleared {} item(s) from the forward queue", removed);
        Ok(removed)
    }

    pub fn forward_queue(&self) -> Vec<ForwardQueueItem> {
        self.inner.forward.snapshot()
    }

    pub fn forward_meta(&self) -> Result<ForwardMeta> {
        self.inner.forward.meta()
    }

    pub async fn bulk_start(
        &self,
        destination: &str,
        messages: Vec<String>,
        delay_seconds: u64,
        rate_per_minute: Option<u32>,
    ) -> Result<BulkStatus, DispatchError> {
        Ok(self
            .bulk
            .start(destination, messages, delay_seconds, rate_per_minute)
            .await?)
    }

    pub fn bulk_pause(&self) -> Result<bool, DispatchError> {
        Ok(self.bulk.pause()?)
    }

    pub fn bulk_resume(&self) -> Result<bool, DispatchError> {
        Ok(self.bulk.resume()?)
    }

    pub fn bulk_stop(&self) -> Result<bool, DispatchError> {
        Ok(self.bulk.stop()?)
    }

    pub fn bulk_status(&self) -> BulkStatus {
        self.bulk.status()
    }

    pub async fn status(&self) -> EngineStatus {
        let policy = self.inner.policy();
        let engine = &policy.settings.engine;
        let last_forwarded_at = match self.inner.forward.meta() {
            Ok(meta) => meta.last_forwarded_at,
            Err(e) => {
                error!("Failed to read forward meta: {}", e);
                None
            }
        };
        EngineStatus {
            running: self.inner.is_running(),
            transport: self.inner.transport.name().to_string(),
            transport_ready: self.inner.transport.is_ready().await,
            queue_len: self.inner.queue_len(),
            intake_paused: self.inner.is_intake_paused(),
            stats: self.inner.stats_snapshot(),
            processed_ids: self.inner.dedup.len(),
            rate_per_minute: engine.rate_per_minute,
            cooldown_seconds: engine.cooldown_seconds,
            mode: engine.mode,
            recent_actions: self.inner.limiter.recent(),
            clients: policy.matcher.len(),
            forward_target: policy.forward_target(),
            forward_pending: self.inner.forward.len(),
            forward_flushing: self.inner.is_flushing(),
            last_forwarded_at,
            bulk: self.bulk.status(),
        }
    }

    pub fn interactions(&self) -> Result<Vec<InteractionLogEntry>> {
        self.inner.activity.interactions()
    }

    pub fn skipped(&self) -> Result<Vec<SkippedLogEntry>> {
        self.inner.activity.skipped()
    }

    pub fn settings(&self) -> Settings {
        self.inner.policy().settings.clone()
    }

    /// Validate, persist and apply new engine settings.
    pub fn update_settings(&self, settings: Settings) -> Result<(), DispatchError> {
        settings.validate()?;
        save(self.inner.store.as_ref(), keys::SETTINGS, &settings)?;

        self.bulk.set_default_rate(settings.engine.rate_per_minute);
        self.inner.dedup.set_capacity(settings.engine.dedup_capacity);
        self.inner.activity.set_capacity(settings.engine.log_capacity);
        info!(
            "Settings updated: {}/min, cooldown {}s, {:?} mode, {} client rule(s)",
            settings.engine.rate_per_minute,
            settings.engine.cooldown_seconds,
            settings.engine.mode,
            settings.clients.len()
        );
        *self.inner.policy.write().unwrap_or_else(|e| e.into_inner()) =
            Arc::new(Policy::new(settings));
        Ok(())
    }

    pub fn last_checked(&self) -> HashMap<String, i64> {
        self.inner
            .last_checked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Count matching messages that the engine has not handled yet.
    pub async fn backlog_check(&self, options: BacklogOptions) -> Result<BacklogReport, DispatchError> {
        if !self.inner.transport.is_ready().await {
            return Err(DispatchError::TransportNotReady);
        }
        Ok(self.inner.backlog_check(options).await)
    }

    /// Queue unhandled history through the normal intake path, oldest first.
    pub async fn backlog_process(&self, options: BacklogOptions) -> Result<BacklogReport, DispatchError> {
        if !self.inner.is_running() {
            return Err(DispatchError::EngineStopped);
        }
        if !self.inner.transport.is_ready().await {
            return Err(DispatchError::TransportNotReady);
        }
        Ok(self.inner.backlog_process(options).await)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
