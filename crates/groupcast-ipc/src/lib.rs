//! Groupcast IPC
//!
//! Message types, the transport contract, and the event bus between the
//! transport adapter and the dispatch engine

pub mod command;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use command::ControlCommand;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

static NEXT_TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn generate_trace_id() -> String {
    let ts = now_unix_secs();
    let n = NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("trace-{}-{}", ts, n)
}

fn default_schema_version() -> u16 {
    1
}

fn default_trace_id() -> String {
    generate_trace_id()
}

/// A message observed by the transport. Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub destination: String,
    #[serde(default)]
    pub from_self: bool,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl InboundMessage {
    pub fn preview(&self) -> String {
        self.text.chars().take(120).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_schema_version")]
    pub schema_version: u16,
    #[serde(default = "default_trace_id")]
    pub trace_id: String,
    pub message: InboundMessage,
}

impl Envelope {
    pub fn new(message: InboundMessage) -> Self {
        Self {
            schema_version: default_schema_version(),
            trace_id: generate_trace_id(),
            message,
        }
    }
}

/// Content of one outbound action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quoted: Option<String>,
    },
    Reaction {
        message_id: String,
        emoji: String,
    },
    Forward {
        message_id: String,
        source: String,
    },
}

impl Outbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Text { quoted: Some(_), .. } => "reply",
            Outbound::Text { quoted: None, .. } => "text",
            Outbound::Reaction { .. } => "reaction",
            Outbound::Forward { .. } => "forward",
        }
    }
}

/// What the dispatch engine needs from a chat transport.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn is_ready(&self) -> bool;

    async fn send(&self, destination: &str, content: &Outbound) -> Result<()>;

    /// Look up a previously seen message. `Ok(None)` is a lookup miss, not a failure.
    async fn resolve_message(&self, id: &str) -> Result<Option<InboundMessage>>;

    /// Recent history of a destination, oldest first.
    async fn recent_messages(&self, _destination: &str, _limit: usize) -> Result<Vec<InboundMessage>> {
        Ok(Vec::new())
    }
}

pub const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    inbound: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            inbound: inbound_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }

    pub fn publish(&self, envelope: Envelope) -> Result<()> {
        self.inbound.send(envelope)?;
        Ok(())
    }

    pub fn publish_message(&self, message: InboundMessage) -> Result<()> {
        self.publish(Envelope::new(message))
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
