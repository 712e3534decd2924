//! Persisted sync-session configuration, keyed by tag
//!
//! Each configured sync pair (local root, remote root) survives client
//! restarts as one row in its own state table, so sessions can resume
//! with the same tag and filesystem fingerprint they were created with.

use std::collections::HashMap;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use rkyv::rancor::Error as RkyvError;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::StateTable;
use crate::remote::RemoteHandle;

/// One configured sync pair
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct SyncConfig {
    /// Caller-chosen unique id of this sync pair
    pub tag: u32,
    pub local_root: String,
    pub remote_root: RemoteHandle,
    /// Filesystem fingerprint of the local volume at creation time;
    /// a changed value on resume means fsids cannot be trusted
    pub fsfp: u64,
    pub enabled: bool,
    /// Sticky failure reason, if the session went into a failed state
    pub error: Option<String>,
}

/// Tag-keyed config store over a [`StateTable`]
pub struct ConfigStore<T: StateTable> {
    table: T,
    configs: HashMap<u32, SyncConfig>,
    dbids: HashMap<u32, u64>,
}

impl<T: StateTable> ConfigStore<T> {
    /// Open the store, loading every persisted config.
    ///
    /// Rows that fail to deserialize are dropped with a warning rather
    /// than failing the whole load.
    ///
    /// # Errors
    /// Returns an error if the table itself cannot be read.
    pub fn open(mut table: T) -> Result<Self> {
        let mut configs = HashMap::new();
        let mut dbids = HashMap::new();

        table.rewind();
        while let Some((dbid, data)) = table.next_row() {
            match rkyv::from_bytes::<SyncConfig, RkyvError>(&data) {
                Ok(config) => {
                    dbids.insert(config.tag, dbid);
                    configs.insert(config.tag, config);
                }
                Err(e) => {
                    warn!(dbid, error = %e, "dropping unreadable sync config row");
                }
            }
        }

        debug!(count = configs.len(), "sync configs loaded");
        Ok(Self {
            table,
            configs,
            dbids,
        })
    }

    /// Insert or update a config, persisting it immediately
    ///
    /// # Errors
    /// Returns an error if serialization or the table write fails.
    pub fn insert(&mut self, config: SyncConfig) -> Result<()> {
        let dbid = match self.dbids.get(&config.tag) {
            Some(dbid) => *dbid,
            None => self.table.alloc_id(),
        };
        let bytes = rkyv::to_bytes::<RkyvError>(&config)
            .map_err(|e| eyre!("sync config serialization failed: {e}"))?;

        self.table.begin();
        if let Err(e) = self.table.put(dbid, &bytes) {
            self.table.abort();
            return Err(e);
        }
        self.table.commit()?;

        self.dbids.insert(config.tag, dbid);
        self.configs.insert(config.tag, config);
        Ok(())
    }

    /// Remove the config with the given tag, if present
    ///
    /// # Errors
    /// Returns an error if the table write fails.
    pub fn remove_by_tag(&mut self, tag: u32) -> Result<bool> {
        let Some(dbid) = self.dbids.remove(&tag) else {
            return Ok(false);
        };
        self.table.begin();
        if let Err(e) = self.table.del(dbid) {
            self.table.abort();
            self.dbids.insert(tag, dbid);
            return Err(e);
        }
        self.table.commit()?;
        self.configs.remove(&tag);
        Ok(true)
    }

    #[must_use]
    pub fn get(&self, tag: u32) -> Option<&SyncConfig> {
        self.configs.get(&tag)
    }

    /// All configs, in no particular order
    pub fn all(&self) -> impl Iterator<Item = &SyncConfig> {
        self.configs.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Drop every config, persisted and in memory
    ///
    /// # Errors
    /// Returns an error if the table truncation fails.
    pub fn clear(&mut self) -> Result<()> {
        self.table.truncate()?;
        self.configs.clear();
        self.dbids.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryTable;

    fn sample(tag: u32) -> SyncConfig {
        SyncConfig {
            tag,
            local_root: format!("/sync/{tag}"),
            remote_root: 1000 + u64::from(tag),
            fsfp: 0xfeed,
            enabled: true,
            error: None,
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let mut store = ConfigStore::open(MemoryTable::new()).unwrap();
        store.insert(sample(1)).unwrap();
        store.insert(sample(2)).unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.get(1).unwrap().local_root, "/sync/1");

        assert!(store.remove_by_tag(1).unwrap());
        assert!(!store.remove_by_tag(1).unwrap());
        assert!(store.get(1).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_upsert_keeps_one_row_per_tag() {
        let mut store = ConfigStore::open(MemoryTable::new()).unwrap();
        store.insert(sample(7)).unwrap();

        let mut updated = sample(7);
        updated.enabled = false;
        updated.error = Some("volume changed".into());
        store.insert(updated).unwrap();

        assert_eq!(store.len(), 1);
        let cfg = store.get(7).unwrap();
        assert!(!cfg.enabled);
        assert_eq!(cfg.error.as_deref(), Some("volume changed"));
    }

    #[test]
    fn test_roundtrip_through_table() {
        let mut store = ConfigStore::open(MemoryTable::new()).unwrap();
        store.insert(sample(3)).unwrap();
        store.insert(sample(4)).unwrap();
        store.remove_by_tag(3).unwrap();

        // reopen over the same rows
        let table = std::mem::replace(&mut store.table, MemoryTable::new());
        let reopened = ConfigStore::open(table).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get(4), Some(&sample(4)));
        assert!(reopened.get(3).is_none());
    }

    #[test]
    fn test_clear() {
        let mut store = ConfigStore::open(MemoryTable::new()).unwrap();
        store.insert(sample(1)).unwrap();
        store.clear().unwrap();
        assert!(store.is_empty());

        let table = std::mem::replace(&mut store.table, MemoryTable::new());
        let reopened = ConfigStore::open(table).unwrap();
        assert!(reopened.is_empty());
    }
}
