//! Embedded key-value datastores.
//!
//! Each logical store is one redb environment inside its own directory.
//! Keys are UTF-8 strings; values are MessagePack-encoded with the same
//! codec used for remote metadata files. Reads and writes are serializable
//! per key; cross-key scans see a snapshot-consistent view of one read
//! transaction.

mod stores;

pub use stores::{ContentBackendStore, FileVersionStore, LocalVersionStore, PathRequestStore};

use std::collections::BTreeMap;
use std::io;
use std::marker::PhantomData;
use std::path::Path;

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

const TABLE: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("firmament");

#[derive(Error, Debug)]
pub enum StoreError {
    /// Path-shaped keys must start with `/`; anything else is a programming
    /// error in the caller.
    #[error("datastore keys must start with '/', got {key:?}")]
    InvalidKey { key: String },

    #[error("no such key {key:?}")]
    MissingKey { key: String },

    #[error("failed to decode value for {key:?}: {source}")]
    Decode {
        key: String,
        source: rmp_serde::decode::Error,
    },

    #[error("failed to encode value: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("datastore backend error: {0}")]
    Database(#[from] redb::Error),

    #[error("datastore io error: {0}")]
    Io(#[from] io::Error),
}

/// A generic key-value store backed by one redb environment.
pub struct DiskStore<T> {
    db: Database,
    path_keys: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> DiskStore<T> {
    /// Open (creating if necessary) the environment under `dir`.
    ///
    /// `path_keys` enables the `/`-prefix key validation used by the
    /// path-shaped stores.
    pub fn open(dir: &Path, path_keys: bool) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let db = Database::create(dir.join("data.redb")).map_err(redb::Error::from)?;
        // Materialize the table so later read transactions always find it.
        let txn = db.begin_write().map_err(redb::Error::from)?;
        txn.open_table(TABLE).map_err(redb::Error::from)?;
        txn.commit().map_err(redb::Error::from)?;
        Ok(Self {
            db,
            path_keys,
            _marker: PhantomData,
        })
    }

    fn validate_key(&self, key: &str) -> Result<(), StoreError> {
        if self.path_keys && !key.starts_with('/') {
            return Err(StoreError::InvalidKey {
                key: key.to_owned(),
            });
        }
        Ok(())
    }

    fn decode(key: &str, raw: &[u8]) -> Result<T, StoreError> {
        rmp_serde::from_slice(raw).map_err(|source| StoreError::Decode {
            key: key.to_owned(),
            source,
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<T>, StoreError> {
        let txn = self.db.begin_read().map_err(redb::Error::from)?;
        let table = txn.open_table(TABLE).map_err(redb::Error::from)?;
        match table.get(key).map_err(redb::Error::from)? {
            Some(guard) => Ok(Some(Self::decode(key, guard.value())?)),
            None => Ok(None),
        }
    }

    /// Point get with a fallback for missing keys.
    pub fn get_or(&self, key: &str, default: T) -> Result<T, StoreError> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    pub fn set(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.validate_key(key)?;
        let encoded = rmp_serde::to_vec_named(value)?;
        let txn = self.db.begin_write().map_err(redb::Error::from)?;
        {
            let mut table = txn.open_table(TABLE).map_err(redb::Error::from)?;
            table
                .insert(key, encoded.as_slice())
                .map_err(redb::Error::from)?;
        }
        txn.commit().map_err(redb::Error::from)?;
        Ok(())
    }

    /// Delete a key; missing keys are an error, matching the callers that
    /// only delete entries they just observed.
    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.validate_key(key)?;
        let txn = self.db.begin_write().map_err(redb::Error::from)?;
        let removed = {
            let mut table = txn.open_table(TABLE).map_err(redb::Error::from)?;
            table.remove(key).map_err(redb::Error::from)?.is_some()
        };
        txn.commit().map_err(redb::Error::from)?;
        if removed {
            Ok(())
        } else {
            Err(StoreError::MissingKey {
                key: key.to_owned(),
            })
        }
    }

    pub fn contains(&self, key: &str) -> Result<bool, StoreError> {
        let txn = self.db.begin_read().map_err(redb::Error::from)?;
        let table = txn.open_table(TABLE).map_err(redb::Error::from)?;
        Ok(table.get(key).map_err(redb::Error::from)?.is_some())
    }

    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        let txn = self.db.begin_read().map_err(redb::Error::from)?;
        let table = txn.open_table(TABLE).map_err(redb::Error::from)?;
        let mut keys = Vec::new();
        for entry in table.iter().map_err(redb::Error::from)? {
            let (key, _) = entry.map_err(redb::Error::from)?;
            keys.push(key.value().to_owned());
        }
        Ok(keys)
    }

    pub fn values(&self) -> Result<Vec<T>, StoreError> {
        Ok(self.items()?.into_iter().map(|(_, value)| value).collect())
    }

    /// Snapshot of every `(key, value)` pair.
    pub fn items(&self) -> Result<Vec<(String, T)>, StoreError> {
        let txn = self.db.begin_read().map_err(redb::Error::from)?;
        let table = txn.open_table(TABLE).map_err(redb::Error::from)?;
        let mut items = Vec::new();
        for entry in table.iter().map_err(redb::Error::from)? {
            let (key, value) = entry.map_err(redb::Error::from)?;
            let key = key.value().to_owned();
            let decoded = Self::decode(&key, value.value())?;
            items.push((key, decoded));
        }
        Ok(items)
    }

    /// Full snapshot as a map.
    pub fn all(&self) -> Result<BTreeMap<String, T>, StoreError> {
        Ok(self.items()?.into_iter().collect())
    }

    /// Atomically replace the entire store contents.
    pub fn set_all(&self, values: &BTreeMap<String, T>) -> Result<(), StoreError> {
        for key in values.keys() {
            self.validate_key(key)?;
        }
        let mut encoded = Vec::with_capacity(values.len());
        for (key, value) in values {
            encoded.push((key.as_str(), rmp_serde::to_vec_named(value)?));
        }
        let txn = self.db.begin_write().map_err(redb::Error::from)?;
        {
            txn.delete_table(TABLE).map_err(redb::Error::from)?;
            let mut table = txn.open_table(TABLE).map_err(redb::Error::from)?;
            for (key, value) in &encoded {
                table
                    .insert(*key, value.as_slice())
                    .map_err(redb::Error::from)?;
            }
        }
        txn.commit().map_err(redb::Error::from)?;
        Ok(())
    }

    pub fn len(&self) -> Result<u64, StoreError> {
        let txn = self.db.begin_read().map_err(redb::Error::from)?;
        let table = txn.open_table(TABLE).map_err(redb::Error::from)?;
        Ok(table.len().map_err(redb::Error::from)?)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &tempfile::TempDir, path_keys: bool) -> DiskStore<String> {
        DiskStore::open(&dir.path().join("store"), path_keys).unwrap()
    }

    #[test]
    fn get_set_delete_contains() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, true);

        assert_eq!(store.get("/a").unwrap(), None);
        store.set("/a", &"one".to_owned()).unwrap();
        assert_eq!(store.get("/a").unwrap().as_deref(), Some("one"));
        assert!(store.contains("/a").unwrap());

        store.delete("/a").unwrap();
        assert!(!store.contains("/a").unwrap());
        assert!(matches!(
            store.delete("/a"),
            Err(StoreError::MissingKey { .. })
        ));
    }

    #[test]
    fn path_keys_must_start_with_slash() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, true);
        assert!(matches!(
            store.set("relative", &"x".to_owned()),
            Err(StoreError::InvalidKey { .. })
        ));

        let free = DiskStore::<String>::open(&dir.path().join("free"), false).unwrap();
        free.set("anything-goes", &"x".to_owned()).unwrap();
    }

    #[test]
    fn set_all_replaces_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, true);
        store.set("/old", &"stale".to_owned()).unwrap();

        let replacement: BTreeMap<String, String> = [
            ("/x".to_owned(), "1".to_owned()),
            ("/y".to_owned(), "2".to_owned()),
        ]
        .into();
        store.set_all(&replacement).unwrap();

        assert_eq!(store.all().unwrap(), replacement);
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persistent");
        {
            let store = DiskStore::<String>::open(&path, true).unwrap();
            store.set("/kept", &"value".to_owned()).unwrap();
        }
        let store = DiskStore::<String>::open(&path, true).unwrap();
        assert_eq!(store.get("/kept").unwrap().as_deref(), Some("value"));
    }
}
