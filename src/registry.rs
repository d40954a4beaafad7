//! Process-wide directories for tables and engines.
//!
//! Stages locate shared tables by `(spider, key)` instead of having handles
//! threaded through every constructor, and callers reach a running engine by
//! spider id alone. Entries are published during engine setup and removed at
//! teardown; the engine directory doubles as the unique-name guard that
//! keeps two engines with the same spider id from coexisting.

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::engine::EngineHandle;
use crate::error::EngineError;
use crate::spider::SpiderId;
use crate::table::TableHandle;

static TABLES: Lazy<DashMap<(SpiderId, String), TableHandle>> = Lazy::new(DashMap::new);

static ENGINES: Lazy<DashMap<SpiderId, EngineHandle>> = Lazy::new(DashMap::new);

/// Publishes a table handle under `(spider, key)`, replacing any previous
/// entry for that pair.
pub fn publish_table(spider: &SpiderId, key: &str, handle: TableHandle) {
    TABLES.insert((spider.clone(), key.to_string()), handle);
}

/// Looks up a table handle by `(spider, key)`.
pub fn lookup_table(spider: &SpiderId, key: &str) -> Option<TableHandle> {
    TABLES
        .get(&(spider.clone(), key.to_string()))
        .map(|entry| entry.value().clone())
}

/// Removes every table entry published for `spider`.
pub fn unpublish_spider(spider: &SpiderId) {
    TABLES.retain(|(id, _), _| id != spider);
}

/// Registers a running engine under its spider id. Fails when the name is
/// already taken.
pub(crate) fn register_engine(handle: EngineHandle) -> Result<(), EngineError> {
    use dashmap::mapref::entry::Entry;

    match ENGINES.entry(handle.spider().clone()) {
        Entry::Occupied(_) => Err(EngineError::AlreadyStarted(handle.spider().clone())),
        Entry::Vacant(slot) => {
            slot.insert(handle);
            Ok(())
        }
    }
}

/// Looks up a running engine by spider id.
pub fn engine(spider: &SpiderId) -> Option<EngineHandle> {
    ENGINES.get(spider).map(|entry| entry.value().clone())
}

pub(crate) fn unregister_engine(spider: &SpiderId) {
    ENGINES.remove(spider);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::SharedTable;

    #[test]
    fn publish_lookup_unpublish() {
        let spider = SpiderId::from("registry-test");
        let table = SharedTable::new();

        publish_table(&spider, "spider_tid", table.clone());
        let found = lookup_table(&spider, "spider_tid").expect("published handle");
        assert_eq!(found, table);
        assert!(lookup_table(&spider, "downloader_tid").is_none());

        unpublish_spider(&spider);
        assert!(lookup_table(&spider, "spider_tid").is_none());
    }
}
