//! In-memory transport that records every outbound action

use crate::{InboundMessage, Outbound, Transport};
use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct SentRecord {
    pub destination: String,
    pub content: Outbound,
    pub at: Instant,
}

pub struct RecordingTransport {
    ready: AtomicBool,
    sent: Mutex<Vec<SentRecord>>,
    known: Mutex<HashMap<String, InboundMessage>>,
    failures: Mutex<usize>,
    failing_messages: Mutex<HashSet<String>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            known: Mutex::new(HashMap::new()),
            failures: Mutex::new(0),
            failing_messages: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Make the next `count` sends fail.
    pub fn fail_next(&self, count: usize) {
        *self.failures.lock().unwrap_or_else(|e| e.into_inner()) = count;
    }

    /// Make every send that targets `message_id` (reaction, quote, forward) fail.
    pub fn fail_message(&self, message_id: &str) {
        self.failing_messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(message_id.to_string());
    }

    pub fn heal_message(&self, message_id: &str) {
        self.failing_messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(message_id);
    }

    /// Register a message so that `resolve_message` and `recent_messages` can find it.
    pub fn remember(&self, message: InboundMessage) {
        self.known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(message.id.clone(), message);
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn sent_to(&self, destination: &str) -> Vec<SentRecord> {
        self.sent()
            .into_iter()
            .filter(|record| record.destination == destination)
            .collect()
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn target_message(content: &Outbound) -> Option<&str> {
    match content {
        Outbound::Text { quoted, .. } => quoted.as_deref(),
        Outbound::Reaction { message_id, .. } => Some(message_id),
        Outbound::Forward { message_id, .. } => Some(message_id),
    }
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    async fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn send(&self, destination: &str, content: &Outbound) -> Result<()> {
        {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            if *failures > 0 {
                *failures -= 1;
                return Err(anyhow!("simulated send failure to {}", destination));
            }
        }
        if let Some(id) = target_message(content) {
            let failing = self.failing_messages.lock().unwrap_or_else(|e| e.into_inner());
            if failing.contains(id) {
                return Err(anyhow!("simulated failure for message {}", id));
            }
        }

        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentRecord {
                destination: destination.to_string(),
                content: content.clone(),
                at: Instant::now(),
            });
        Ok(())
    }

    async fn resolve_message(&self, id: &str) -> Result<Option<InboundMessage>> {
        Ok(self
            .known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned())
    }

    async fn recent_messages(&self, destination: &str, limit: usize) -> Result<Vec<InboundMessage>> {
        let known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        let mut messages: Vec<InboundMessage> = known
            .values()
            .filter(|message| message.destination == destination)
            .cloned()
            .collect();
        messages.sort_by_key(|message| message.timestamp);
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.into_iter().skip(skip).collect())
    }
}
