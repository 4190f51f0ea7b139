//! Persisted accumulator of messages waiting to be forwarded

use anyhow::Result;
use chrono::{DateTime, Utc};
use groupcast_ipc::InboundMessage;
use groupcast_storage::{keys, load, save, StateStore};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardQueueItem {
    pub source_destination: String,
    pub message_id: String,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardMeta {
    #[serde(default)]
    pub last_forwarded_at: Option<DateTime<Utc>>,
}

/// Forward queue unique by message id. Every mutation is written through.
pub struct ForwardAccumulator {
    items: Mutex<Vec<ForwardQueueItem>>,
    store: Arc<dyn StateStore>,
}

impl ForwardAccumulator {
    pub fn open(store: Arc<dyn StateStore>) -> Result<Self> {
        let items: Vec<ForwardQueueItem> =
            load(store.as_ref(), keys::FORWARD_QUEUE)?.unwrap_or_default();
        Ok(Self {
            items: Mutex::new(items),
            store,
        })
    }

    fn items(&self) -> MutexGuard<'_, Vec<ForwardQueueItem>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append `message` unless it is already queued. Returns whether it was added.
    pub fn push(&self, message: &InboundMessage) -> Result<bool> {
        let mut items = self.items();
        if items.iter().any(|item| item.message_id == message.id) {
            return Ok(false);
        }
        items.push(ForwardQueueItem {
            source_destination: message.destination.clone(),
            message_id: message.id.clone(),
            enqueued_at: Utc::now(),
        });
        save(self.store.as_ref(), keys::FORWARD_QUEUE, &*items)?;
        Ok(true)
    }

    pub fn remove(&self, message_id: &str) -> Result<bool> {
        let mut items = self.items();
        let before = items.len();
        items.retain(|item| item.message_id != message_id);
        if items.len() == before {
            return Ok(false);
        }
        save(self.store.as_ref(), keys::FORWARD_QUEUE, &*items)?;
        Ok(true)
    }

    /// Drop every queued item. Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let mut items = self.items();
        let removed = items.len();
        items.clear();
        save(self.store.as_ref(), keys::FORWARD_QUEUE, &*items)?;
        Ok(removed)
    }

    pub fn snapshot(&self) -> Vec<ForwardQueueItem> {
        self.items().clone()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn meta(&self) -> Result<ForwardMeta> {
        Ok(load(self.store.as_ref(), keys::FORWARD_META)?.unwrap_or_default())
    }

    pub fn touch_forwarded(&self, at: DateTime<Utc>) -> Result<()> {
        let meta = ForwardMeta {
            last_forwarded_at: Some(at),
        };
        save(self.store.as_ref(), keys::FORWARD_META, &meta)
    }
}

#[cfg(test)]
mod tests {
    use super::ForwardAccumulator;
    use groupcast_ipc::InboundMessage;
    use groupcast_storage::{MemoryStore, StateStore};
    use std::sync::Arc;

    fn message(id: &str) -> InboundMessage {
        InboundMessage {
            id: id.to_string(),
            destination: "src@g.us".to_string(),
            from_self: false,
            text: "hello".to_string(),
            timestamp: 0,
        }
    }

    #[test]
    fn push_is_idempotent_by_message_id() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let queue = ForwardAccumulator::open(Arc::clone(&store)).expect("open");
        assert!(queue.push(&message("m1")).expect("push"));
        assert!(!queue.push(&message("m1")).expect("push again"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.snapshot()[0].source_destination, "src@g.us");
    }

    #[test]
    fn queue_survives_reopen() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        {
            let queue = ForwardAccumulator::open(Arc::clone(&store)).expect("open");
            queue.push(&message("m1")).expect("push");
            queue.push(&message("m2")).expect("push");
            assert!(queue.remove("m1").expect("remove"));
            assert!(!queue.remove("m1").expect("remove again"));
        }
        let queue = ForwardAccumulator::open(Arc::clone(&store)).expect("reopen");
        let ids: Vec<String> = queue.snapshot().into_iter().map(|i| i.message_id).collect();
        assert_eq!(ids, vec!["m2"]);
        assert_eq!(queue.clear().expect("clear"), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn meta_records_last_flush() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let queue = ForwardAccumulator::open(store).expect("open");
        assert!(queue.meta().expect("meta").last_forwarded_at.is_none());
        let now = chrono::Utc::now();
        queue.touch_forwarded(now).expect("touch");
        assert_eq!(queue.meta().expect("meta").last_forwarded_at, Some(now));
    }
}
