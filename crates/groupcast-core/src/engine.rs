//! Intake processor and forward flusher sharing one send lane

use crate::activity::{
    ActivityLog, InteractionAction, InteractionLogEntry, SkipReason, SkippedLogEntry,
};
use crate::dedup::DedupLedger;
use crate::forward::ForwardAccumulator;
use chrono::Utc;
use groupcast_config::{ClientRule, SendMode, Settings};
use groupcast_ipc::{InboundMessage, Outbound, Transport};
use groupcast_policy::{CooldownTracker, RateLimiter, TextMatcher, WatchPolicy};
use groupcast_storage::{keys, save, StateStore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Readiness poll of the intake loop while the transport is down.
pub const INTAKE_NOT_READY_POLL: Duration = Duration::from_millis(3_000);

/// Settings with their compiled matcher and watch-list.
pub(crate) struct Policy {
    pub settings: Settings,
    pub matcher: TextMatcher,
    pub watch: WatchPolicy,
}

impl Policy {
    pub fn new(settings: Settings) -> Self {
        let matcher = TextMatcher::new(&settings.clients, settings.engine.normalize_arabic);
        let watch = WatchPolicy::new(&settings.engine.watch_list);
        Self {
            settings,
            matcher,
            watch,
        }
    }

    pub fn forward_target(&self) -> Option<String> {
        self.settings.forward.active_target().map(str::to_string)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeStats {
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    pub forwarded: usize,
    pub failed: usize,
    /// Items left queued because the transport could not look them up.
    pub skipped: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Queued,
    AlreadyQueued,
    Skipped(SkipReason),
}

pub(crate) struct Inner {
    pub policy: RwLock<Arc<Policy>>,
    pub store: Arc<dyn StateStore>,
    pub transport: Arc<dyn Transport>,
    pub limiter: Arc<RateLimiter>,
    pub cooldown: CooldownTracker,
    pub dedup: DedupLedger,
    pub activity: ActivityLog,
    pub forward: ForwardAccumulator,
    pub running: AtomicBool,
    pub intake_paused: AtomicBool,
    pub intake: Mutex<VecDeque<InboundMessage>>,
    pub wake: Notify,
    pub lane: tokio::sync::Mutex<()>,
    /// Held for the whole of a flush; a second flush backs off.
    pub flush_gate: tokio::sync::Mutex<()>,
    pub stats: Mutex<IntakeStats>,
    pub last_checked: Mutex<HashMap<String, i64>>,
}

impl Inner {
    pub fn policy(&self) -> Arc<Policy> {
        Arc::clone(&self.policy.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_intake_paused(&self) -> bool {
        self.intake_paused.load(Ordering::SeqCst)
    }

    fn may_send(&self) -> bool {
        self.is_running() && !self.is_intake_paused()
    }

    pub fn is_flushing(&self) -> bool {
        self.flush_gate.try_lock().is_err()
    }

    fn intake(&self) -> MutexGuard<'_, VecDeque<InboundMessage>> {
        self.intake.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stats(&self) -> MutexGuard<'_, IntakeStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn queue_len(&self) -> usize {
        self.intake().len()
    }

    /// Drop every queued message; returns how many were removed.
    pub fn clear_intake(&self) -> usize {
        let mut intake = self.intake();
        let removed = intake.len();
        intake.clear();
        removed
    }

    pub fn stats_snapshot(&self) -> IntakeStats {
        *self.stats()
    }

    /// Eligibility checks in the order the audit trail reports them.
    pub fn eligibility(&self, policy: &Policy, message: &InboundMessage) -> Result<ClientRule, SkipReason> {
        if message.from_self {
            return Err(SkipReason::FromSelf);
        }
        if message.text.trim().is_empty() {
            return Err(SkipReason::EmptyText);
        }
        if !policy.watch.is_watched(&message.destination) {
            return Err(SkipReason::NotWatched);
        }
        let rule = policy.matcher.find(&message.text).ok_or(SkipReason::NoMatch)?;
        if self.dedup.is_processed(&message.id) {
            return Err(SkipReason::AlreadyProcessed);
        }
        Ok(rule.clone())
    }

    pub fn skip(&self, message: &InboundMessage, reason: SkipReason) {
        debug!("Skipping message {} from {}: {}", message.id, message.destination, reason);
        self.stats().skipped += 1;
        self.activity.record_skip(SkippedLogEntry {
            at: Utc::now(),
            destination: message.destination.clone(),
            message_id: message.id.clone(),
            reason,
            preview: message.preview(),
        });
        self.mark_checked(message);
    }

    /// Advance the per-destination watermark; it never moves backwards.
    pub fn mark_checked(&self, message: &InboundMessage) {
        let snapshot = {
            let mut last_checked = self.last_checked.lock().unwrap_or_else(|e| e.into_inner());
            let current = last_checked.get(&message.destination).copied().unwrap_or(0);
            if message.timestamp <= current {
                return;
            }
            last_checked.insert(message.destination.clone(), message.timestamp);
            last_checked.clone()
        };
        if let Err(e) = save(self.store.as_ref(), keys::LAST_CHECKED, &snapshot) {
            error!("Failed to persist last-checked watermark: {}", e);
        }
    }

    pub fn last_checked(&self, destination: &str) -> Option<i64> {
        self.last_checked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(destination)
            .copied()
    }

    pub fn ingest(&self, message: InboundMessage) -> IngestOutcome {
        let policy = self.policy();
        if let Err(reason) = self.eligibility(&policy, &message) {
            self.skip(&message, reason);
            return IngestOutcome::Skipped(reason);
        }
        {
            let mut intake = self.intake();
            if intake.iter().any(|queued| queued.id == message.id) {
                return IngestOutcome::AlreadyQueued;
            }
            debug!("Queued message {} from {}", message.id, message.destination);
            intake.push_back(message);
        }
        if self.is_running() {
            self.wake.notify_one();
        }
        IngestOutcome::Queued
    }

    pub fn enqueue_forward(&self, policy: &Policy, message: &InboundMessage) -> bool {
        if policy.forward_target().is_none() {
            return false;
        }
        match self.forward.push(message) {
            Ok(added) => {
                if added {
                    debug!("Message {} queued for forwarding", message.id);
                }
                added
            }
            Err(e) => {
                error!("Failed to queue message {} for forwarding: {}", message.id, e);
                false
            }
        }
    }

    /// Drain the intake queue until it is empty or the engine stops or pauses.
    pub async fn drain(&self) {
        loop {
            if !self.may_send() {
                return;
            }
            if self.queue_len() == 0 {
                break;
            }
            if !self.transport.is_ready().await {
                warn!(
                    "Transport '{}' not ready, {} message(s) waiting",
                    self.transport.name(),
                    self.queue_len()
                );
                tokio::time::sleep(INTAKE_NOT_READY_POLL).await;
                continue;
            }

            let handled = {
                let _lane = self.lane.lock().await;
                let next = self.intake().pop_front();
                match next {
                    Some(message) => {
                        self.process(message).await;
                        true
                    }
                    None => false,
                }
            };
            if !handled {
                break;
            }

            let policy = self.policy();
            if policy.forward_target().is_some()
                && self.forward.len() >= policy.settings.forward.batch_size
            {
                self.flush(false).await;
            }
        }

        let policy = self.policy();
        if self.is_running()
            && policy.settings.forward.flush_on_idle
            && policy.forward_target().is_some()
            && !self.forward.is_empty()
        {
            self.flush(true).await;
        }
    }

    /// Handle one message. Must be called with the send lane held.
    async fn process(&self, message: InboundMessage) {
        let policy = self.policy();
        let rule = match self.eligibility(&policy, &message) {
            Ok(rule) => rule,
            Err(reason) => {
                self.skip(&message, reason);
                return;
            }
        };
        let engine = &policy.settings.engine;

        let slot = self.limiter.acquire(engine.rate_per_minute).await;
        self.cooldown
            .await_cooldown(&message.destination, Duration::from_secs(engine.cooldown_seconds))
            .await;

        if !self.may_send() {
            debug!("Intake halted, returning message {} to the queue", message.id);
            self.limiter.release(slot);
            self.intake().push_front(message);
            return;
        }

        let reply_text = engine.reply_text.trim();
        let (content, action, detail) = if engine.mode == SendMode::Reply && !reply_text.is_empty() {
            (
                Outbound::Text {
                    text: reply_text.to_string(),
                    quoted: Some(message.id.clone()),
                },
                InteractionAction::Replied,
                reply_text.to_string(),
            )
        } else {
            let emoji = if rule.emoji.trim().is_empty() {
                engine.default_emoji.clone()
            } else {
                rule.emoji.clone()
            };
            (
                Outbound::Reaction {
                    message_id: message.id.clone(),
                    emoji: emoji.clone(),
                },
                InteractionAction::Reacted,
                emoji,
            )
        };

        match self.transport.send(&message.destination, &content).await {
            Ok(()) => {
                info!(
                    "{} message {} in {} for client '{}'",
                    content.kind(),
                    message.id,
                    message.destination,
                    rule.name
                );
                self.activity.record_interaction(InteractionLogEntry {
                    at: Utc::now(),
                    destination: message.destination.clone(),
                    message_id: message.id.clone(),
                    client: Some(rule.name.clone()),
                    action,
                    detail,
                });
                self.dedup.mark_processed(&message.id);
                self.stats().processed += 1;
                self.enqueue_forward(&policy, &message);
            }
            Err(e) => {
                warn!(
                    "Failed to send {} for message {} in {}: {}",
                    content.kind(),
                    message.id,
                    message.destination,
                    e
                );
                self.activity.record_interaction(InteractionLogEntry {
                    at: Utc::now(),
                    destination: message.destination.clone(),
                    message_id: message.id.clone(),
                    client: Some(rule.name.clone()),
                    action: InteractionAction::Failed,
                    detail: e.to_string(),
                });
                self.stats().failed += 1;
            }
        }
        self.mark_checked(&message);
    }

    /// Forward queued items to the configured target.
    ///
    /// Unforced flushes wait for a full batch. A flush that finds another in
    /// progress returns immediately.
    pub async fn flush(&self, force: bool) -> FlushReport {
        let policy = self.policy();
        let Some(target) = policy.forward_target() else {
            return FlushReport {
                remaining: self.forward.len(),
                ..FlushReport::default()
            };
        };
        if !force && self.forward.len() < policy.settings.forward.batch_size {
            return FlushReport {
                remaining: self.forward.len(),
                ..FlushReport::default()
            };
        }
        // Released on every exit, including a caller dropping this future.
        let Ok(gate) = self.flush_gate.try_lock() else {
            debug!("Forward flush already in progress");
            return FlushReport {
                remaining: self.forward.len(),
                ..FlushReport::default()
            };
        };

        let mut report = {
            let _lane = self.lane.lock().await;
            self.flush_items(&policy, &target).await
        };
        report.remaining = self.forward.len();
        drop(gate);

        if report.forwarded > 0 || report.failed > 0 || report.skipped > 0 {
            info!(
                "Forward flush to {}: {} forwarded, {} failed, {} skipped, {} remaining",
                target, report.forwarded, report.failed, report.skipped, report.remaining
            );
        }

        if self.may_send() && self.queue_len() > 0 {
            self.wake.notify_one();
        }
        report
    }

    async fn flush_items(&self, policy: &Policy, target: &str) -> FlushReport {
        let engine = &policy.settings.engine;
        let mut report = FlushReport::default();

        for item in self.forward.snapshot() {
            let original = match self.transport.resolve_message(&item.message_id).await {
                Ok(Some(original)) => original,
                Ok(None) => {
                    warn!(
                        "Message {} from {} not found, leaving it queued for the next flush",
                        item.message_id, item.source_destination
                    );
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Failed to resolve message {}: {}", item.message_id, e);
                    report.failed += 1;
                    continue;
                }
            };

            self.limiter.acquire(engine.rate_per_minute).await;
            self.cooldown
                .await_cooldown(target, Duration::from_secs(engine.cooldown_seconds))
                .await;

            let content = Outbound::Forward {
                message_id: item.message_id.clone(),
                source: original.destination.clone(),
            };
            match self.transport.send(target, &content).await {
                Ok(()) => {
                    let now = Utc::now();
                    if let Err(e) = self.forward.remove(&item.message_id) {
                        error!("Failed to update forward queue: {}", e);
                    }
                    if let Err(e) = self.forward.touch_forwarded(now) {
                        error!("Failed to persist forward meta: {}", e);
                    }
                    self.activity.record_interaction(InteractionLogEntry {
                        at: now,
                        destination: item.source_destination.clone(),
                        message_id: item.message_id.clone(),
                        client: None,
                        action: InteractionAction::Forwarded,
                        detail: target.to_string(),
                    });
                    report.forwarded += 1;
                }
                Err(e) => {
                    warn!(
                        "Failed to forward message {} to {}, keeping it queued: {}",
                        item.message_id, target, e
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }
}

pub(crate) async fn intake_worker(inner: Arc<Inner>) {
    loop {
        inner.wake.notified().await;
        inner.drain().await;
    }
}
