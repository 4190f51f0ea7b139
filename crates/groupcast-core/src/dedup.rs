//! Bounded ledger of handled message ids

use anyhow::Result;
use groupcast_storage::{keys, load, save, StateStore};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::error;

pub const DEFAULT_DEDUP_CAPACITY: usize = 50_000;

#[derive(Debug, Default)]
struct Ledger {
    order: VecDeque<String>,
    members: HashSet<String>,
}

/// Insertion-ordered id set; the oldest ids are evicted once `capacity` is exceeded.
pub struct DedupLedger {
    ledger: Mutex<Ledger>,
    capacity: Mutex<usize>,
    store: Arc<dyn StateStore>,
}

impl DedupLedger {
    pub fn open(store: Arc<dyn StateStore>, capacity: usize) -> Result<Self> {
        let persisted: Vec<String> = load(store.as_ref(), keys::PROCESSED)?.unwrap_or_default();
        let mut ledger = Ledger::default();
        for id in persisted {
            if ledger.members.insert(id.clone()) {
                ledger.order.push_back(id);
            }
        }
        let this = Self {
            ledger: Mutex::new(ledger),
            capacity: Mutex::new(capacity.max(1)),
            store,
        };
        this.trim();
        Ok(this)
    }

    pub fn is_processed(&self, id: &str) -> bool {
        self.ledger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .members
            .contains(id)
    }

    /// Record `id` as handled. Returns `false` if it was already present.
    pub fn mark_processed(&self, id: &str) -> bool {
        {
            let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
            if !ledger.members.insert(id.to_string()) {
                return false;
            }
            ledger.order.push_back(id.to_string());
        }
        self.trim();
        true
    }

    pub fn set_capacity(&self, capacity: usize) {
        *self.capacity.lock().unwrap_or_else(|e| e.into_inner()) = capacity.max(1);
        self.trim();
    }

    pub fn len(&self) -> usize {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner()).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn trim(&self) {
        let capacity = *self.capacity.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot: Vec<String> = {
            let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
            while ledger.order.len() > capacity {
                if let Some(oldest) = ledger.order.pop_front() {
                    ledger.members.remove(&oldest);
                }
            }
            ledger.order.iter().cloned().collect()
        };
        if let Err(e) = save(self.store.as_ref(), keys::PROCESSED, &snapshot) {
            error!("Failed to persist processed ids: {}", e);
        }
    }
}
