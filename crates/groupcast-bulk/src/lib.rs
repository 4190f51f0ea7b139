//! Groupcast Bulk - resumable broadcast campaigns
//!
//! A campaign sends an ordered message list to one destination at a chosen
//! pace. Its state is persisted after every mutation, so a restart resumes
//! from the last sent index.

use chrono::{DateTime, Utc};
use groupcast_ipc::{Outbound, Transport};
use groupcast_policy::RateLimiter;
use groupcast_storage::{keys, load, save, StateStore};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const PAUSED_POLL: Duration = Duration::from_millis(1_000);
pub const NOT_READY_POLL: Duration = Duration::from_millis(3_000);

#[derive(Debug, thiserror::Error)]
pub enum BulkError {
    #[error("transport is not ready")]
    TransportNotReady,
    #[error("campaign destination is required")]
    MissingDestination,
    #[error("campaign has no messages")]
    EmptyCampaign,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CampaignPhase {
    #[default]
    Idle,
    Running,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BulkCampaignState {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub state: CampaignPhase,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub sent_count: usize,
    #[serde(default)]
    pub total_count: usize,
    #[serde(default)]
    pub delay_seconds: u64,
    /// Campaign-specific cap. `None` shares the engine-wide budget.
    #[serde(default)]
    pub rate_per_minute: Option<u32>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Public view of a campaign, without the message bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkStatus {
    pub id: Option<Uuid>,
    pub state: CampaignPhase,
    pub paused: bool,
    pub destination: Option<String>,
    pub sent_count: usize,
    pub total_count: usize,
    pub remaining: usize,
    pub delay_seconds: u64,
    pub rate_per_minute: Option<u32>,
    pub last_error: Option<String>,
}

impl From<&BulkCampaignState> for BulkStatus {
    fn from(state: &BulkCampaignState) -> Self {
        Self {
            id: state.id,
            state: state.state,
            paused: state.paused,
            destination: state.destination.clone(),
            sent_count: state.sent_count,
            total_count: state.total_count,
            remaining: state.total_count.saturating_sub(state.sent_count),
            delay_seconds: state.delay_seconds,
            rate_per_minute: state.rate_per_minute,
            last_error: state.last_error.clone(),
        }
    }
}

/// Split campaign text into messages.
///
/// A line holding only `---` separates multi-line messages; without one,
/// every non-empty line is a message.
pub fn parse_messages(raw: &str) -> Vec<String> {
    let has_separator = raw.lines().any(|line| line.trim() == "---");
    if has_separator {
        let mut messages = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        for line in raw.lines() {
            if line.trim() == "---" {
                messages.push(current.join("\n"));
                current.clear();
            } else {
                current.push(line);
            }
        }
        messages.push(current.join("\n"));
        messages
            .into_iter()
            .map(|message| message.trim().to_string())
            .filter(|message| !message.is_empty())
            .collect()
    } else {
        raw.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }
}

enum Tick {
    Stop,
    After(Duration),
}

struct Inner {
    state: Mutex<BulkCampaignState>,
    generation: AtomicU64,
    default_rate: AtomicU32,
    store: Arc<dyn StateStore>,
    transport: Arc<dyn Transport>,
    shared_limiter: Arc<RateLimiter>,
    campaign_limiter: Mutex<Arc<RateLimiter>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, BulkCampaignState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, state: &BulkCampaignState) {
        if let Err(e) = save(self.store.as_ref(), keys::BULK_STATE, state) {
            error!("Failed to persist bulk campaign state: {}", e);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Wait for a send slot; returns the limiter that granted it and the slot.
    async fn acquire(&self, rate_per_minute: Option<u32>) -> (Arc<RateLimiter>, Instant) {
        let (limiter, limit) = match rate_per_minute {
            Some(limit) => (
                Arc::clone(
                    &self
                        .campaign_limiter
                        .lock()
                        .unwrap_or_else(|e| e.into_inner()),
                ),
                limit,
            ),
            None => (
                Arc::clone(&self.shared_limiter),
                self.default_rate.load(Ordering::SeqCst),
            ),
        };
        let slot = limiter.acquire(limit).await;
        (limiter, slot)
    }

    async fn tick(&self, generation: u64) -> Tick {
        if !self.is_current(generation) {
            return Tick::Stop;
        }

        {
            let state = self.state();
            if state.state != CampaignPhase::Running {
                return Tick::Stop;
            }
            if state.paused {
                return Tick::After(PAUSED_POLL);
            }
        }

        if !self.transport.is_ready().await {
            warn!("Bulk campaign waiting: transport not ready");
            return Tick::After(NOT_READY_POLL);
        }

        let (destination, message, index, rate_per_minute, delay) = {
            let mut state = self.state();
            if !self.is_current(generation) || state.state != CampaignPhase::Running {
                return Tick::Stop;
            }
            if state.sent_count >= state.total_count {
                state.state = CampaignPhase::Idle;
                state.paused = false;
                state.messages.clear();
                state.finished_at = Some(Utc::now());
                self.persist(&state);
                info!(
                    "Bulk campaign finished: {}/{} sent",
                    state.sent_count, state.total_count
                );
                return Tick::Stop;
            }
            let destination = match state.destination.clone() {
                Some(destination) => destination,
                None => {
                    error!("Bulk campaign has no destination, stopping");
                    state.state = CampaignPhase::Idle;
                    self.persist(&state);
                    return Tick::Stop;
                }
            };
            let index = state.sent_count;
            let Some(message) = state.messages.get(index).cloned() else {
                error!(
                    "Bulk campaign message #{} missing from persisted list, stopping",
                    index
                );
                state.state = CampaignPhase::Idle;
                self.persist(&state);
                return Tick::Stop;
            };
            (
                destination,
                message,
                index,
                state.rate_per_minute,
                Duration::from_secs(state.delay_seconds),
            )
        };

        let (limiter, slot) = self.acquire(rate_per_minute).await;

        // Checkpoint: stop/pause requested while waiting on the rate limiter.
        {
            let state = self.state();
            if !self.is_current(generation) || state.state != CampaignPhase::Running {
                limiter.release(slot);
                return Tick::Stop;
            }
            if state.paused {
                limiter.release(slot);
                return Tick::After(PAUSED_POLL);
            }
        }

        let content = Outbound::Text {
            text: message,
            quoted: None,
        };
        let result = self.transport.send(&destination, &content).await;

        let mut state = self.state();
        if !self.is_current(generation) {
            return Tick::Stop;
        }
        match result {
            Ok(()) => {
                if state.sent_count == index {
                    state.sent_count += 1;
                }
                state.last_error = None;
                info!(
                    "Bulk message {}/{} sent to {}",
                    state.sent_count, state.total_count, destination
                );
            }
            Err(e) => {
                warn!(
                    "Bulk send #{} to {} failed, will retry: {}",
                    index + 1,
                    destination,
                    e
                );
                state.last_error = Some(e.to_string());
            }
        }
        self.persist(&state);
        Tick::After(delay)
    }
}

async fn run_loop(inner: Arc<Inner>, generation: u64) {
    loop {
        match inner.tick(generation).await {
            Tick::Stop => break,
            Tick::After(delay) => tokio::time::sleep(delay).await,
        }
    }
}

/// Timer-driven campaign runner: `idle -> running <-> paused -> idle`.
#[derive(Clone)]
pub struct BulkScheduler {
    inner: Arc<Inner>,
}

impl BulkScheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        transport: Arc<dyn Transport>,
        shared_limiter: Arc<RateLimiter>,
        default_rate_per_minute: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BulkCampaignState::default()),
                generation: AtomicU64::new(0),
                default_rate: AtomicU32::new(default_rate_per_minute.max(1)),
                store,
                transport,
                shared_limiter,
                campaign_limiter: Mutex::new(Arc::new(RateLimiter::new())),
            }),
        }
    }

    /// Per-minute cap used by campaigns that do not carry their own.
    pub fn set_default_rate(&self, rate_per_minute: u32) {
        self.inner
            .default_rate
            .store(rate_per_minute.max(1), Ordering::SeqCst);
    }

    fn spawn_loop(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(run_loop(Arc::clone(&self.inner), generation));
    }

    /// Load the persisted campaign and continue it if it was running.
    pub fn restore(&self) -> anyhow::Result<BulkStatus> {
        let persisted: BulkCampaignState =
            load(self.inner.store.as_ref(), keys::BULK_STATE)?.unwrap_or_default();
        let running = persisted.state == CampaignPhase::Running;
        let status = BulkStatus::from(&persisted);
        *self.inner.state() = persisted;
        if running {
            info!(
                "Resuming bulk campaign at {}/{} (paused={})",
                status.sent_count, status.total_count, status.paused
            );
            self.spawn_loop();
        }
        Ok(status)
    }

    pub async fn start(
        &self,
        destination: &str,
        messages: Vec<String>,
        delay_seconds: u64,
        rate_per_minute: Option<u32>,
    ) -> Result<BulkStatus, BulkError> {
        if !self.inner.transport.is_ready().await {
            return Err(BulkError::TransportNotReady);
        }
        let destination = destination.trim();
        if destination.is_empty() {
            return Err(BulkError::MissingDestination);
        }
        let messages: Vec<String> = messages
            .into_iter()
            .filter(|message| !message.trim().is_empty())
            .collect();
        if messages.is_empty() {
            return Err(BulkError::EmptyCampaign);
        }

        let state = BulkCampaignState {
            id: Some(Uuid::new_v4()),
            state: CampaignPhase::Running,
            paused: false,
            destination: Some(destination.to_string()),
            total_count: messages.len(),
            messages,
            sent_count: 0,
            delay_seconds,
            rate_per_minute: rate_per_minute.map(|rate| rate.max(1)),
            started_at: Some(Utc::now()),
            finished_at: None,
            last_error: None,
        };
        save(self.inner.store.as_ref(), keys::BULK_STATE, &state)?;

        let status = BulkStatus::from(&state);
        *self
            .inner
            .campaign_limiter
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Arc::new(RateLimiter::new());
        *self.inner.state() = state;
        info!(
            "Bulk campaign started: {} messages to {} (delay={}s, rate={:?}/min)",
            status.total_count, destination, delay_seconds, status.rate_per_minute
        );
        self.spawn_loop();
        Ok(status)
    }

    fn transition<F>(&self, apply: F) -> anyhow::Result<bool>
    where
        F: FnOnce(&mut BulkCampaignState) -> bool,
    {
        let mut state = self.inner.state();
        if !apply(&mut state) {
            return Ok(false);
        }
        save(self.inner.store.as_ref(), keys::BULK_STATE, &*state)?;
        Ok(true)
    }

    pub fn pause(&self) -> anyhow::Result<bool> {
        let changed = self.transition(|state| {
            if state.state != CampaignPhase::Running || state.paused {
                return false;
            }
            state.paused = true;
            true
        })?;
        if changed {
            info!("Bulk campaign paused");
        }
        Ok(changed)
    }

    pub fn resume(&self) -> anyhow::Result<bool> {
        let changed = self.transition(|state| {
            if state.state != CampaignPhase::Running || !state.paused {
                return false;
            }
            state.paused = false;
            true
        })?;
        if changed {
            info!("Bulk campaign resumed");
        }
        Ok(changed)
    }

    pub fn stop(&self) -> anyhow::Result<bool> {
        let changed = self.transition(|state| {
            if state.state != CampaignPhase::Running {
                return false;
            }
            state.state = CampaignPhase::Idle;
            state.paused = false;
            state.messages.clear();
            state.finished_at = Some(Utc::now());
            true
        })?;
        if changed {
            info!("Bulk campaign stopped");
        }
        Ok(changed)
    }

    /// Detach the running loop without touching persisted state.
    pub fn shutdown(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn status(&self) -> BulkStatus {
        BulkStatus::from(&*self.inner.state())
    }

    pub fn snapshot(&self) -> BulkCampaignState {
        self.inner.state().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use groupcast_ipc::testing::RecordingTransport;
    use groupcast_storage::MemoryStore;
    use tokio::time::Instant;

    fn scheduler(
        store: &Arc<MemoryStore>,
        transport: &Arc<RecordingTransport>,
    ) -> BulkScheduler {
        BulkScheduler::new(
            Arc::clone(store) as Arc<dyn StateStore>,
            Arc::clone(transport) as Arc<dyn Transport>,
            Arc::new(RateLimiter::new()),
            20,
        )
    }

    fn texts(transport: &RecordingTransport) -> Vec<String> {
        transport
            .sent()
            .into_iter()
            .filter_map(|record| match record.content {
                Outbound::Text { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    fn msgs(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    async fn wait_until_idle(scheduler: &BulkScheduler) {
        for _ in 0..10_000 {
            if scheduler.status().state == CampaignPhase::Idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("campaign never finished: {:?}", scheduler.status());
    }

    #[tokio::test(start_paused = true)]
    async fn campaign_runs_to_completion() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let bulk = scheduler(&store, &transport);

        bulk.start("g@g.us", msgs(&["m1", "m2"]), 0, Some(100))
            .await
            .expect("start");
        wait_until_idle(&bulk).await;

        let status = bulk.status();
        assert_eq!(status.state, CampaignPhase::Idle);
        assert_eq!(status.sent_count, 2);
        assert_eq!(texts(&transport), vec!["m1", "m2"]);
        assert!(bulk.snapshot().messages.is_empty());

        let persisted: BulkCampaignState = load(store.as_ref(), keys::BULK_STATE)
            .expect("load")
            .expect("persisted");
        assert_eq!(persisted.state, CampaignPhase::Idle);
        assert_eq!(persisted.sent_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn start_rejects_invalid_requests() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let bulk = scheduler(&store, &transport);

        let err = bulk.start("  ", msgs(&["m1"]), 0, None).await.unwrap_err();
        assert!(matches!(err, BulkError::MissingDestination));

        let err = bulk.start("g", msgs(&[" ", ""]), 0, None).await.unwrap_err();
        assert!(matches!(err, BulkError::EmptyCampaign));

        transport.set_ready(false);
        let err = bulk.start("g", msgs(&["m1"]), 0, None).await.unwrap_err();
        assert!(matches!(err, BulkError::TransportNotReady));

        assert_eq!(bulk.status().state, CampaignPhase::Idle);
        let persisted: Option<BulkCampaignState> =
            load(store.as_ref(), keys::BULK_STATE).expect("load");
        assert!(persisted.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pause_freezes_progress_until_resume() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let bulk = scheduler(&store, &transport);

        bulk.start("g", msgs(&["m1", "m2", "m3"]), 10, Some(100))
            .await
            .expect("start");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(bulk.status().sent_count, 1);

        assert!(bulk.pause().expect("pause"));
        assert!(!bulk.pause().expect("pause again"));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(bulk.status().sent_count, 1);
        assert!(bulk.status().paused);

        assert!(bulk.resume().expect("resume"));
        wait_until_idle(&bulk).await;
        assert_eq!(bulk.status().sent_count, 3);
        assert_eq!(texts(&transport), vec!["m1", "m2", "m3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_resumes_from_persisted_index() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let first = scheduler(&store, &transport);

        first
            .start("g", msgs(&["m1", "m2", "m3"]), 10, Some(100))
            .await
            .expect("start");
        tokio::time::sleep(Duration::from_secs(1)).await;
        first.pause().expect("pause");
        first.shutdown();

        let after_restart = Arc::new(RecordingTransport::new());
        let second = scheduler(&store, &after_restart);
        let status = second.restore().expect("restore");
        assert_eq!(status.state, CampaignPhase::Running);
        assert!(status.paused);
        assert_eq!(status.sent_count, 1);

        second.resume().expect("resume");
        wait_until_idle(&second).await;
        assert_eq!(second.status().sent_count, 3);
        assert_eq!(texts(&after_restart), vec!["m2", "m3"]);
        assert_eq!(texts(&transport), vec!["m1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_is_retried_without_advancing() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let bulk = scheduler(&store, &transport);

        transport.fail_next(1);
        bulk.start("g", msgs(&["m1"]), 5, Some(100))
            .await
            .expect("start");
        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = bulk.status();
        assert_eq!(status.sent_count, 0);
        assert!(status.last_error.is_some());

        wait_until_idle(&bulk).await;
        assert_eq!(bulk.status().sent_count, 1);
        assert!(bulk.status().last_error.is_none());
        assert_eq!(texts(&transport), vec!["m1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_transport_readiness() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let bulk = scheduler(&store, &transport);

        bulk.start("g", msgs(&["m1"]), 0, Some(100))
            .await
            .expect("start");
        transport.set_ready(false);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(bulk.status().sent_count, 0);
        assert_eq!(bulk.status().state, CampaignPhase::Running);

        transport.set_ready(true);
        wait_until_idle(&bulk).await;
        assert_eq!(bulk.status().sent_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn campaign_rate_override_spaces_sends() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let bulk = scheduler(&store, &transport);

        let start = Instant::now();
        bulk.start("g", msgs(&["m1", "m2", "m3"]), 0, Some(2))
            .await
            .expect("start");
        wait_until_idle(&bulk).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent[2].at.duration_since(start) >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_campaign_and_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let bulk = scheduler(&store, &transport);

        bulk.start("g", msgs(&["m1", "m2", "m3"]), 30, None)
            .await
            .expect("start");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(bulk.stop().expect("stop"));
        assert!(!bulk.stop().expect("stop again"));
        assert!(!bulk.resume().expect("resume after stop"));

        tokio::time::sleep(Duration::from_secs(120)).await;
        let status = bulk.status();
        assert_eq!(status.state, CampaignPhase::Idle);
        assert_eq!(status.sent_count, 1);
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_a_campaign_replaces_the_old_loop() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let bulk = scheduler(&store, &transport);

        bulk.start("old", msgs(&["a1", "a2", "a3"]), 30, Some(100))
            .await
            .expect("start");
        tokio::time::sleep(Duration::from_secs(1)).await;
        bulk.start("new", msgs(&["b1", "b2"]), 0, Some(100))
            .await
            .expect("restart");
        wait_until_idle(&bulk).await;

        assert_eq!(transport.sent_to("old").len(), 1);
        assert_eq!(transport.sent_to("new").len(), 2);
        assert_eq!(bulk.status().sent_count, 2);
    }

    #[test]
    fn parse_messages_splits_lines_or_blocks() {
        assert_eq!(parse_messages("one\n\n two \nthree"), vec!["one", "two", "three"]);
        assert_eq!(
            parse_messages("line a\nline b\n---\n\n---\nsecond"),
            vec!["line a\nline b", "second"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn message_bodies_are_sent_verbatim() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let bulk = scheduler(&store, &transport);

        let status = bulk
            .start("g", msgs(&["  indented", "   ", "two lines\nend\n"]), 0, Some(100))
            .await
            .expect("start");
        assert_eq!(status.total_count, 2);
        wait_until_idle(&bulk).await;
        assert_eq!(texts(&transport), vec!["  indented", "two lines\nend\n"]);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_during_rate_wait_returns_the_slot() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let limiter = Arc::new(RateLimiter::new());
        let bulk = BulkScheduler::new(
            Arc::clone(&store) as Arc<dyn StateStore>,
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&limiter),
            1,
        );

        bulk.start("g", msgs(&["m1", "m2"]), 0, None)
            .await
            .expect("start");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(bulk.status().sent_count, 1);
        assert!(bulk.pause().expect("pause"));

        tokio::time::sleep(Duration::from_secs(55)).await;
        assert_eq!(bulk.status().sent_count, 1);
        assert_eq!(limiter.recent(), 0);
        bulk.stop().expect("stop");
    }
}
