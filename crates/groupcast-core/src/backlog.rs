//! Catch-up over messages that arrived while the engine was not listening

use crate::engine::{IngestOutcome, Inner};
use groupcast_ipc::InboundMessage;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_BACKLOG_LIMIT: usize = 800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacklogOptions {
    /// Unix milliseconds. `None` uses each destination's last-checked watermark.
    pub since: Option<i64>,
    pub limit_per_destination: usize,
}

impl Default for BacklogOptions {
    fn default() -> Self {
        Self {
            since: None,
            limit_per_destination: DEFAULT_BACKLOG_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogCount {
    pub destination: String,
    /// Unprocessed text messages from others newer than the cut-off.
    pub pending: usize,
    /// Of those, the ones a client rule matches (check), or that were queued (process).
    pub matched: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogReport {
    pub total: usize,
    pub destinations: Vec<BacklogCount>,
}

impl Inner {
    fn backlog_destinations(&self) -> Vec<String> {
        let watched = self.policy().watch.destinations();
        if !watched.is_empty() {
            return watched;
        }
        let mut seen: Vec<String> = self
            .last_checked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        seen.sort();
        seen
    }

    async fn backlog_candidates(&self, destination: &str, options: BacklogOptions) -> Vec<InboundMessage> {
        let since = options
            .since
            .or_else(|| self.last_checked(destination))
            .unwrap_or(0);
        let history = match self
            .transport
            .recent_messages(destination, options.limit_per_destination)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!("Failed to load history of {}: {}", destination, e);
                return Vec::new();
            }
        };

        let mut candidates: Vec<InboundMessage> = history
            .into_iter()
            .filter(|message| {
                message.timestamp > since
                    && !message.from_self
                    && !message.text.trim().is_empty()
                    && !self.dedup.is_processed(&message.id)
            })
            .collect();
        candidates.sort_by_key(|message| message.timestamp);
        candidates.truncate(options.limit_per_destination);
        candidates
    }

    pub async fn backlog_check(&self, options: BacklogOptions) -> BacklogReport {
        let policy = self.policy();
        let mut report = BacklogReport::default();
        for destination in self.backlog_destinations() {
            let candidates = self.backlog_candidates(&destination, options).await;
            let matched = candidates
                .iter()
                .filter(|message| policy.matcher.find(&message.text).is_some())
                .count();
            report.total += matched;
            report.destinations.push(BacklogCount {
                destination,
                pending: candidates.len(),
                matched,
            });
        }
        report
    }

    pub async fn backlog_process(&self, options: BacklogOptions) -> BacklogReport {
        let mut report = BacklogReport::default();
        for destination in self.backlog_destinations() {
            let candidates = self.backlog_candidates(&destination, options).await;
            let pending = candidates.len();
            let mut queued = 0;
            for message in candidates {
                if self.ingest(message) == IngestOutcome::Queued {
                    queued += 1;
                }
            }
            if pending > 0 {
                info!(
                    "Backlog of {}: {} pending, {} queued",
                    destination, pending, queued
                );
            }
            report.total += queued;
            report.destinations.push(BacklogCount {
                destination,
                pending,
                matched: queued,
            });
        }
        report
    }
}
