//! Shared tables and their on-disk snapshot format.
//!
//! Every engine owns seven tables: one data table per stage and four
//! pipeline tables holding middleware state. Tables are concurrent
//! key→value maps behind copyable handles; the engine creates them, hands
//! the handles to stages, and dumps or loads them as a set. It never reads
//! or writes their contents itself.
//!
//! The snapshot container is a MessagePack body (the sorted entry list)
//! followed by a 32-byte SHA-256 trailer over the body. Dump and load are
//! exact inverses; the loader rejects any file whose trailer does not match.

use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::EngineError;

const HASH_LEN: usize = 32;

static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

/// A copyable reference to a [`SharedTable`]. Cloning the handle does not
/// clone the table.
pub type TableHandle = Arc<SharedTable>;

/// A concurrent key→value table.
///
/// Multi-reader, multi-writer; stages read and write entries directly
/// through their handles. Each table carries a process-unique id, and two
/// handles compare equal exactly when they reference the same table.
#[derive(Debug)]
pub struct SharedTable {
    id: u64,
    entries: DashMap<String, Value>,
}

impl PartialEq for SharedTable {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SharedTable {}

#[derive(Serialize, Deserialize)]
struct TableImage {
    entries: Vec<(String, Value)>,
}

impl SharedTable {
    pub fn new() -> TableHandle {
        Arc::new(SharedTable {
            id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
            entries: DashMap::new(),
        })
    }

    fn from_entries(entries: Vec<(String, Value)>) -> TableHandle {
        let table = SharedTable::new();
        for (key, value) in entries {
            table.entries.insert(key, value);
        }
        table
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.entries.insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes and returns up to `n` entries, in no particular order.
    pub fn take_batch(&self, n: usize) -> Vec<(String, Value)> {
        let keys: Vec<String> = self
            .entries
            .iter()
            .take(n)
            .map(|entry| entry.key().clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .collect()
    }

    /// A point-in-time copy of the entries, sorted by key.
    ///
    /// Only consistent while nothing mutates the table; the engine calls
    /// this with all stages suspended.
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        let mut entries: Vec<(String, Value)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        entries
    }

    /// Writes the table to `path` with a synchronous flush.
    pub fn dump(&self, path: &Path) -> Result<(), EngineError> {
        let dump_err = |reason: String| EngineError::TableDump {
            file: path.to_path_buf(),
            reason,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| dump_err(e.to_string()))?;
            }
        }

        let image = TableImage {
            entries: self.snapshot(),
        };
        let body = rmp_serde::to_vec(&image).map_err(|e| dump_err(e.to_string()))?;
        let digest = Sha256::digest(&body);

        let mut file = File::create(path).map_err(|e| dump_err(e.to_string()))?;
        file.write_all(&body).map_err(|e| dump_err(e.to_string()))?;
        file.write_all(digest.as_slice())
            .map_err(|e| dump_err(e.to_string()))?;
        file.sync_all().map_err(|e| dump_err(e.to_string()))?;

        debug!(file = %path.display(), entries = image.entries.len(), "table dumped");
        Ok(())
    }

    /// Reads a table back from `path`, verifying the integrity trailer.
    pub fn load(path: &Path) -> Result<TableHandle, EngineError> {
        let load_err = |reason: String| EngineError::TableLoad {
            file: path.to_path_buf(),
            reason,
        };

        let bytes = fs::read(path).map_err(|e| load_err(e.to_string()))?;
        if bytes.len() < HASH_LEN {
            return Err(load_err("file too short for integrity trailer".into()));
        }
        let (body, trailer) = bytes.split_at(bytes.len() - HASH_LEN);
        let digest = Sha256::digest(body);
        if digest.as_slice() != trailer {
            return Err(load_err("integrity check failed".into()));
        }

        let image: TableImage =
            rmp_serde::from_slice(body).map_err(|e| load_err(e.to_string()))?;
        debug!(file = %path.display(), entries = image.entries.len(), "table loaded");
        Ok(SharedTable::from_entries(image.entries))
    }
}

/// The seven table roles of one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableRole {
    Downloader,
    Spider,
    ItemProcessor,
    CommonPipeline,
    DownloaderPipeline,
    SpiderPipeline,
    ItemProcessorPipeline,
}

impl TableRole {
    pub const ALL: [TableRole; 7] = [
        TableRole::Downloader,
        TableRole::Spider,
        TableRole::ItemProcessor,
        TableRole::CommonPipeline,
        TableRole::DownloaderPipeline,
        TableRole::SpiderPipeline,
        TableRole::ItemProcessorPipeline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TableRole::Downloader => "downloader",
            TableRole::Spider => "spider",
            TableRole::ItemProcessor => "item_processor",
            TableRole::CommonPipeline => "common_pipeline",
            TableRole::DownloaderPipeline => "downloader_pipeline",
            TableRole::SpiderPipeline => "spider_pipeline",
            TableRole::ItemProcessorPipeline => "item_processor_pipeline",
        }
    }

    /// The snapshot file for this role under `base`: `<base>_<role>.ets`.
    pub fn file_for(&self, base: &Path) -> PathBuf {
        PathBuf::from(format!("{}_{}.ets", base.display(), self.as_str()))
    }
}

impl fmt::Display for TableRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The seven live tables of one engine.
#[derive(Debug, Clone)]
pub struct TableSet {
    downloader: TableHandle,
    spider: TableHandle,
    item_processor: TableHandle,
    common_pipeline: TableHandle,
    downloader_pipeline: TableHandle,
    spider_pipeline: TableHandle,
    item_processor_pipeline: TableHandle,
}

impl TableSet {
    /// Creates seven fresh, empty tables.
    pub fn create() -> Self {
        TableSet {
            downloader: SharedTable::new(),
            spider: SharedTable::new(),
            item_processor: SharedTable::new(),
            common_pipeline: SharedTable::new(),
            downloader_pipeline: SharedTable::new(),
            spider_pipeline: SharedTable::new(),
            item_processor_pipeline: SharedTable::new(),
        }
    }

    /// Loads all seven tables from their conventionally-named files under
    /// `base`. Any failure aborts with an error naming the offending file.
    pub fn load(base: &Path) -> Result<Self, EngineError> {
        let set = TableSet {
            downloader: SharedTable::load(&TableRole::Downloader.file_for(base))?,
            spider: SharedTable::load(&TableRole::Spider.file_for(base))?,
            item_processor: SharedTable::load(&TableRole::ItemProcessor.file_for(base))?,
            common_pipeline: SharedTable::load(&TableRole::CommonPipeline.file_for(base))?,
            downloader_pipeline: SharedTable::load(&TableRole::DownloaderPipeline.file_for(base))?,
            spider_pipeline: SharedTable::load(&TableRole::SpiderPipeline.file_for(base))?,
            item_processor_pipeline: SharedTable::load(
                &TableRole::ItemProcessorPipeline.file_for(base),
            )?,
        };
        info!(base = %base.display(), "tables restored from snapshot");
        Ok(set)
    }

    /// Dumps all seven tables under `base`, one file per role.
    ///
    /// Not atomic across the seven files; the caller guarantees a quiescent
    /// point by only dumping a suspended engine.
    pub fn dump(&self, base: &Path) -> Result<(), EngineError> {
        for role in TableRole::ALL {
            self.get(role).dump(&role.file_for(base))?;
        }
        info!(base = %base.display(), "tables dumped");
        Ok(())
    }

    pub fn get(&self, role: TableRole) -> &TableHandle {
        match role {
            TableRole::Downloader => &self.downloader,
            TableRole::Spider => &self.spider,
            TableRole::ItemProcessor => &self.item_processor,
            TableRole::CommonPipeline => &self.common_pipeline,
            TableRole::DownloaderPipeline => &self.downloader_pipeline,
            TableRole::SpiderPipeline => &self.spider_pipeline,
            TableRole::ItemProcessorPipeline => &self.item_processor_pipeline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dump_then_load_restores_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spider_one_spider.ets");

        let table = SharedTable::new();
        table.insert("a", json!({"url": "https://example.com"}));
        table.insert("b", json!(42));
        table.dump(&path).unwrap();

        let restored = SharedTable::load(&path).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.get("a"), Some(json!({"url": "https://example.com"})));
        assert_eq!(restored.get("b"), Some(json!(42)));
    }

    #[test]
    fn empty_table_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.ets");

        SharedTable::new().dump(&path).unwrap();
        let restored = SharedTable::load(&path).unwrap();
        assert!(restored.is_empty());
    }

    #[test]
    fn corrupted_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.ets");

        let table = SharedTable::new();
        table.insert("a", json!(1));
        table.dump(&path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let err = SharedTable::load(&path).unwrap_err();
        match err {
            EngineError::TableLoad { file, reason } => {
                assert_eq!(file, path);
                assert!(reason.contains("integrity"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn truncated_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.ets");
        std::fs::write(&path, b"tiny").unwrap();

        assert!(matches!(
            SharedTable::load(&path),
            Err(EngineError::TableLoad { .. })
        ));
    }

    #[test]
    fn dump_creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("nested").join("snap");

        let set = TableSet::create();
        set.get(TableRole::Spider).insert("k", json!("v"));
        set.dump(&base).unwrap();

        for role in TableRole::ALL {
            assert!(role.file_for(&base).is_file(), "missing {role} file");
        }

        let restored = TableSet::load(&base).unwrap();
        assert_eq!(restored.get(TableRole::Spider).get("k"), Some(json!("v")));
    }

    #[test]
    fn handles_compare_by_identity() {
        let a = SharedTable::new();
        let b = SharedTable::new();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
