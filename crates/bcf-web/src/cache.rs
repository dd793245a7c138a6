use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use bcf_core::SyncJob;
use bcf_sync::CompletionHook;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct Entries {
    values: HashMap<String, JsonValue>,
    order: VecDeque<String>,
}

/// Bounded cache of rendered read responses, dropped wholesale whenever a sync completes.
#[derive(Debug)]
pub struct ResponseCache {
    max_entries: usize,
    entries: RwLock<Entries>,
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            entries: RwLock::new(Entries::default()),
        }
    }

    /// Hashes the request parts into a fixed-size key.
    pub fn key(parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        hex::encode(hasher.finalize())
    }

    pub async fn get(&self, key: &str) -> Option<JsonValue> {
        self.entries.read().await.values.get(key).cloned()
    }

    /// Oldest entries are evicted first once the bound is reached.
    pub async fn insert(&self, key: String, value: JsonValue) {
        if self.max_entries == 0 {
            return;
        }
        let mut entries = self.entries.write().await;
        if entries.values.insert(key.clone(), value).is_some() {
            return;
        }
        entries.order.push_back(key);
        while entries.order.len() > self.max_entries {
            if let Some(oldest) = entries.order.pop_front() {
                entries.values.remove(&oldest);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.values.len()
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.values.clear();
        entries.order.clear();
    }
}

#[async_trait]
impl CompletionHook for ResponseCache {
    async fn on_completed(&self, job: &SyncJob) {
        self.clear().await;
        debug!(job_id = %job.id, "response cache cleared");
    }
}
