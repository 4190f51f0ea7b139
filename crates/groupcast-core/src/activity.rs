//! Operator audit trail: what was sent, what was skipped and why

use chrono::{DateTime, Utc};
use groupcast_storage::{append_limited, keys, load, StateStore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::error;

pub const DEFAULT_LOG_CAPACITY: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionAction {
    Reacted,
    Replied,
    Forwarded,
    /// Reaction or reply the transport refused; `detail` holds the error.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionLogEntry {
    pub at: DateTime<Utc>,
    pub destination: String,
    pub message_id: String,
    #[serde(default)]
    pub client: Option<String>,
    pub action: InteractionAction,
    /// Emoji, reply text, forward target or send error.
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    FromSelf,
    EmptyText,
    NotWatched,
    NoMatch,
    AlreadyProcessed,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::FromSelf => "from self",
            SkipReason::EmptyText => "empty text",
            SkipReason::NotWatched => "destination not watched",
            SkipReason::NoMatch => "no client match",
            SkipReason::AlreadyProcessed => "already processed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedLogEntry {
    pub at: DateTime<Utc>,
    pub destination: String,
    pub message_id: String,
    pub reason: SkipReason,
    #[serde(default)]
    pub preview: String,
}

pub struct ActivityLog {
    store: Arc<dyn StateStore>,
    capacity: AtomicUsize,
}

impl ActivityLog {
    pub fn new(store: Arc<dyn StateStore>, capacity: usize) -> Self {
        Self {
            store,
            capacity: AtomicUsize::new(capacity.max(1)),
        }
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::SeqCst);
    }

    fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    pub fn record_interaction(&self, entry: InteractionLogEntry) {
        if let Err(e) = append_limited(self.store.as_ref(), keys::INTERACTIONS, entry, self.capacity()) {
            error!("Failed to append interaction log: {}", e);
        }
    }

    pub fn record_skip(&self, entry: SkippedLogEntry) {
        if let Err(e) = append_limited(self.store.as_ref(), keys::SKIPPED, entry, self.capacity()) {
            error!("Failed to append skipped log: {}", e);
        }
    }

    pub fn interactions(&self) -> anyhow::Result<Vec<InteractionLogEntry>> {
        Ok(load(self.store.as_ref(), keys::INTERACTIONS)?.unwrap_or_default())
    }

    pub fn skipped(&self) -> anyhow::Result<Vec<SkippedLogEntry>> {
        Ok(load(self.store.as_ref(), keys::SKIPPED)?.unwrap_or_default())
    }
}
