//! Persistence boundary for harvested info-hashes.
//!
//! The engine itself never persists anything; it hands [`InfoHash`]
//! observations to collaborators. This module pins down the contract those
//! collaborators implement (an idempotent upsert keyed by the hex hash)
//! together with the merge rules a store must apply, and ships an
//! in-memory implementation used by tests and embedders that do their own
//! batching.
//!
//! Merge rules: the first write sets `create_time` and every write
//! refreshes `update_time`; numeric counters accumulate by addition; the
//! file list merges as a set union; a non-empty name is last-write-wins;
//! the resolved flag is sticky once set.

use std::collections::HashMap;
use std::time::SystemTime;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// One file inside a torrent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TorrentFile {
    pub path: String,
    pub size: u64,
}

/// The persisted shape of a harvested torrent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InfoHashRecord {
    /// Lowercase hex of the 20-byte info-hash; the upsert key.
    pub info_hash: String,
    pub name: Option<String>,
    /// How many times a metadata download has been attempted.
    pub download_count: u64,
    pub file_count: u64,
    pub total_size: u64,
    pub resolved: bool,
    pub files: Vec<TorrentFile>,
    pub create_time: Option<SystemTime>,
    pub update_time: Option<SystemTime>,
}

impl InfoHashRecord {
    pub fn new(info_hash: impl Into<String>) -> Self {
        Self {
            info_hash: info_hash.into(),
            name: None,
            download_count: 0,
            file_count: 0,
            total_size: 0,
            resolved: false,
            files: Vec::new(),
            create_time: None,
            update_time: None,
        }
    }

    /// Folds a fresh observation into this stored record.
    pub fn merge_from(&mut self, incoming: &InfoHashRecord) {
        self.update_time = Some(SystemTime::now());
        self.resolved |= incoming.resolved;
        self.download_count += incoming.download_count;
        self.file_count += incoming.file_count;
        self.total_size += incoming.total_size;
        if let Some(name) = &incoming.name {
            if !name.is_empty() {
                self.name = Some(name.clone());
            }
        }
        for file in &incoming.files {
            if !self.files.contains(file) {
                self.files.push(file.clone());
            }
        }
    }
}

/// Where harvested records end up. Implementations live outside the
/// protocol core (a document store, a batching writer); the contract is
/// only that upserts are idempotent per hash.
#[async_trait]
pub trait InfoHashStore: Send + Sync {
    async fn upsert(&self, record: InfoHashRecord) -> Result<()>;

    async fn find(&self, info_hash: &str) -> Result<Option<InfoHashRecord>>;
}

/// Hash-map backed store for tests and in-process embedding.
pub struct MemoryInfoHashStore {
    records: Mutex<HashMap<String, InfoHashRecord>>,
}

impl MemoryInfoHashStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

impl Default for MemoryInfoHashStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InfoHashStore for MemoryInfoHashStore {
    async fn upsert(&self, mut record: InfoHashRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        match records.get_mut(&record.info_hash) {
            Some(existing) => existing.merge_from(&record),
            None => {
                let now = SystemTime::now();
                record.create_time = Some(now);
                record.update_time = Some(now);
                records.insert(record.info_hash.clone(), record);
            }
        }
        Ok(())
    }

    async fn find(&self, info_hash: &str) -> Result<Option<InfoHashRecord>> {
        Ok(self.records.lock().await.get(info_hash).cloned())
    }
}
