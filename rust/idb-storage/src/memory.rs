//! A sorted-array in-memory [`Backend`].
//!
//! Each object store is a `Vec<(Vec<u8>, Vec<u8>)>` kept sorted by encoded
//! key and binary-searched for point reads and in-order inserts; each index
//! is a `Vec<(Vec<u8>, Vec<u8>)>` of `(index key, primary key)` pairs kept
//! sorted the same way. A transaction that may write takes a deep snapshot
//! of the whole database at `begin`; `abort` restores it, `commit` just
//! discards it. Cursors snapshot their filtered, direction-ordered slice at
//! `open_cursor` time and never touch the backend again.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use idb_codec::KeyPath;
use idb_codec::key::KeyRange;
use parking_lot::Mutex;

use crate::{
    Backend, BackendCursor, BackendError, BackendTx, DatabaseMetadata, Direction, IndexMetadata,
    StoreMetadata, TxMode,
};

const MAX_AUTO_INCREMENT: f64 = 9_007_199_254_740_992.0; // 2^53

#[derive(Clone, Default)]
struct DbState {
    version: u64,
    stores: HashMap<String, StoreState>,
}

#[derive(Clone)]
struct StoreState {
    meta: StoreMetadata,
    records: Vec<(Vec<u8>, Vec<u8>)>,
    indexes: HashMap<String, IndexState>,
}

#[derive(Clone)]
struct IndexState {
    meta: IndexMetadata,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

/// An in-memory, sorted-array storage backend.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    databases: Arc<Mutex<HashMap<String, DbState>>>,
}

impl MemoryBackend {
    /// Creates an empty backend with no databases.
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot_metadata(db: &DbState, name: &str) -> DatabaseMetadata {
        let mut stores = Vec::new();
        let mut indexes = Vec::new();
        for store in db.stores.values() {
            stores.push(store.meta.clone());
            for index in store.indexes.values() {
                indexes.push(index.meta.clone());
            }
        }
        DatabaseMetadata {
            name: name.to_string(),
            version: db.version,
            stores,
            indexes,
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    type Tx = MemoryTx;

    async fn committed_version(&self, name: &str) -> Result<u64, BackendError> {
        Ok(self
            .databases
            .lock()
            .get(name)
            .map(|db| db.version)
            .unwrap_or(0))
    }

    async fn metadata(&self, name: &str) -> Result<DatabaseMetadata, BackendError> {
        let databases = self.databases.lock();
        Ok(match databases.get(name) {
            Some(db) => Self::snapshot_metadata(db, name),
            None => DatabaseMetadata {
                name: name.to_string(),
                ..Default::default()
            },
        })
    }

    async fn list_databases(&self) -> Result<Vec<(String, u64)>, BackendError> {
        let databases = self.databases.lock();
        Ok(databases.iter().map(|(n, db)| (n.clone(), db.version)).collect())
    }

    async fn delete_database(&self, name: &str) -> Result<(), BackendError> {
        self.databases.lock().remove(name);
        Ok(())
    }

    async fn begin_transaction(
        &self,
        name: &str,
        _scope: &[String],
        mode: TxMode,
    ) -> Result<Self::Tx, BackendError> {
        let mut databases = self.databases.lock();
        let db = databases.entry(name.to_string()).or_default();
        let snapshot = if mode == TxMode::ReadOnly {
            None
        } else {
            Some(db.clone())
        };
        Ok(MemoryTx {
            databases: self.databases.clone(),
            db_name: name.to_string(),
            snapshot,
            finished: false,
        })
    }
}

/// A transaction against a [`MemoryBackend`].
pub struct MemoryTx {
    databases: Arc<Mutex<HashMap<String, DbState>>>,
    db_name: String,
    snapshot: Option<DbState>,
    finished: bool,
}

impl MemoryTx {
    fn with_db<R>(&self, f: impl FnOnce(&mut DbState) -> Result<R, BackendError>) -> Result<R, BackendError> {
        let mut databases = self.databases.lock();
        let db = databases.entry(self.db_name.clone()).or_default();
        f(db)
    }

    fn with_store<R>(
        &self,
        store: &str,
        f: impl FnOnce(&mut StoreState) -> Result<R, BackendError>,
    ) -> Result<R, BackendError> {
        self.with_db(|db| {
            let store = db
                .stores
                .get_mut(store)
                .ok_or_else(|| BackendError::NotFound(format!("object store {store:?}")))?;
            f(store)
        })
    }

    fn with_index<R>(
        &self,
        store: &str,
        index: &str,
        f: impl FnOnce(&mut IndexState) -> Result<R, BackendError>,
    ) -> Result<R, BackendError> {
        self.with_store(store, |store| {
            let index = store
                .indexes
                .get_mut(index)
                .ok_or_else(|| BackendError::NotFound(format!("index {index:?}")))?;
            f(index)
        })
    }
}

fn binary_search(records: &[(Vec<u8>, Vec<u8>)], key: &[u8]) -> Result<usize, usize> {
    records.binary_search_by(|(k, _)| k.as_slice().cmp(key))
}

fn range_slice<'a>(records: &'a [(Vec<u8>, Vec<u8>)], range: Option<&KeyRange>) -> Vec<&'a (Vec<u8>, Vec<u8>)> {
    match range {
        None => records.iter().collect(),
        Some(range) => records.iter().filter(|(k, _)| range.includes(k)).collect(),
    }
}

impl BackendTx for MemoryTx {
    fn create_object_store(
        &mut self,
        name: &str,
        key_path: KeyPath,
        auto_increment: bool,
    ) -> Result<(), BackendError> {
        self.with_db(|db| {
            if db.stores.contains_key(name) {
                return Err(BackendError::Constraint(format!(
                    "object store {name:?} already exists"
                )));
            }
            db.stores.insert(
                name.to_string(),
                StoreState {
                    meta: StoreMetadata {
                        name: name.to_string(),
                        key_path,
                        auto_increment,
                        current_key: 0.0,
                    },
                    records: Vec::new(),
                    indexes: HashMap::new(),
                },
            );
            Ok(())
        })
    }

    fn delete_object_store(&mut self, name: &str) -> Result<(), BackendError> {
        self.with_db(|db| {
            db.stores
                .remove(name)
                .ok_or_else(|| BackendError::NotFound(format!("object store {name:?}")))?;
            Ok(())
        })
    }

    fn rename_object_store(&mut self, name: &str, new_name: &str) -> Result<(), BackendError> {
        self.with_db(|db| {
            if db.stores.contains_key(new_name) {
                return Err(BackendError::Constraint(format!(
                    "object store {new_name:?} already exists"
                )));
            }
            let mut store = db
                .stores
                .remove(name)
                .ok_or_else(|| BackendError::NotFound(format!("object store {name:?}")))?;
            store.meta.name = new_name.to_string();
            for index in store.indexes.values_mut() {
                index.meta.store_name = new_name.to_string();
            }
            db.stores.insert(new_name.to_string(), store);
            Ok(())
        })
    }

    fn create_index(
        &mut self,
        store: &str,
        name: &str,
        key_path: KeyPath,
        unique: bool,
        multi_entry: bool,
    ) -> Result<(), BackendError> {
        self.with_store(store, |store| {
            if store.indexes.contains_key(name) {
                return Err(BackendError::Constraint(format!(
                    "index {name:?} already exists"
                )));
            }
            store.indexes.insert(
                name.to_string(),
                IndexState {
                    meta: IndexMetadata {
                        name: name.to_string(),
                        store_name: store.meta.name.clone(),
                        key_path,
                        unique,
                        multi_entry,
                    },
                    entries: Vec::new(),
                },
            );
            Ok(())
        })
    }

    fn delete_index(&mut self, store: &str, name: &str) -> Result<(), BackendError> {
        self.with_store(store, |store| {
            store
                .indexes
                .remove(name)
                .ok_or_else(|| BackendError::NotFound(format!("index {name:?}")))?;
            Ok(())
        })
    }

    fn rename_index(&mut self, store: &str, name: &str, new_name: &str) -> Result<(), BackendError> {
        self.with_store(store, |store| {
            if store.indexes.contains_key(new_name) {
                return Err(BackendError::Constraint(format!(
                    "index {new_name:?} already exists"
                )));
            }
            let mut index = store
                .indexes
                .remove(name)
                .ok_or_else(|| BackendError::NotFound(format!("index {name:?}")))?;
            index.meta.name = new_name.to_string();
            store.indexes.insert(new_name.to_string(), index);
            Ok(())
        })
    }

    fn index_put(
        &mut self,
        store: &str,
        index: &str,
        index_key: Vec<u8>,
        primary_key: Vec<u8>,
    ) -> Result<(), BackendError> {
        self.with_index(store, index, |index| {
            if index.meta.unique
                && index
                    .entries
                    .iter()
                    .any(|(k, _)| k == &index_key)
            {
                return Err(BackendError::Constraint(format!(
                    "unique index {:?} already has an entry for this key",
                    index.meta.name
                )));
            }
            let pos = index
                .entries
                .partition_point(|(k, pk)| (k.as_slice(), pk.as_slice()) < (index_key.as_slice(), primary_key.as_slice()));
            index.entries.insert(pos, (index_key, primary_key));
            Ok(())
        })
    }

    fn index_delete_for_primary_key(
        &mut self,
        store: &str,
        index: &str,
        primary_key: &[u8],
    ) -> Result<(), BackendError> {
        self.with_index(store, index, |index| {
            index.entries.retain(|(_, pk)| pk.as_slice() != primary_key);
            Ok(())
        })
    }

    fn get(&mut self, store: &str, key: &[u8]) -> Result<Option<Vec<u8>>, BackendError> {
        self.with_store(store, |store| {
            Ok(binary_search(&store.records, key)
                .ok()
                .map(|idx| store.records[idx].1.clone()))
        })
    }

    fn get_all(
        &mut self,
        store: &str,
        range: Option<&KeyRange>,
        limit: Option<u32>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, BackendError> {
        self.with_store(store, |store| {
            let mut matches = range_slice(&store.records, range);
            if let Some(limit) = limit {
                matches.truncate(limit as usize);
            }
            Ok(matches.into_iter().cloned().collect())
        })
    }

    fn get_all_keys(
        &mut self,
        store: &str,
        range: Option<&KeyRange>,
        limit: Option<u32>,
    ) -> Result<Vec<Vec<u8>>, BackendError> {
        self.get_all(store, range, limit)
            .map(|rows| rows.into_iter().map(|(k, _)| k).collect())
    }

    fn put(&mut self, store: &str, key: Vec<u8>, value: Vec<u8>) -> Result<(), BackendError> {
        self.with_store(store, |store| {
            match binary_search(&store.records, &key) {
                Ok(idx) => store.records[idx].1 = value,
                Err(idx) => store.records.insert(idx, (key, value)),
            }
            Ok(())
        })
    }

    fn add(&mut self, store: &str, key: Vec<u8>, value: Vec<u8>) -> Result<(), BackendError> {
        self.with_store(store, |store| match binary_search(&store.records, &key) {
            Ok(_) => Err(BackendError::Constraint("key already exists".into())),
            Err(idx) => {
                store.records.insert(idx, (key, value));
                Ok(())
            }
        })
    }

    fn delete(&mut self, store: &str, range: &KeyRange) -> Result<(), BackendError> {
        self.with_store(store, |store| {
            store.records.retain(|(k, _)| !range.includes(k));
            Ok(())
        })
    }

    fn clear(&mut self, store: &str) -> Result<(), BackendError> {
        self.with_store(store, |store| {
            store.records.clear();
            Ok(())
        })
    }

    fn count(&mut self, store: &str, range: Option<&KeyRange>) -> Result<u64, BackendError> {
        self.with_store(store, |store| Ok(range_slice(&store.records, range).len() as u64))
    }

    fn index_get(
        &mut self,
        store: &str,
        index: &str,
        range: &KeyRange,
    ) -> Result<Option<Vec<u8>>, BackendError> {
        let primary = self.index_get_key(store, index, range)?;
        match primary {
            Some(pk) => self.get(store, &pk),
            None => Ok(None),
        }
    }

    fn index_get_key(
        &mut self,
        store: &str,
        index: &str,
        range: &KeyRange,
    ) -> Result<Option<Vec<u8>>, BackendError> {
        self.with_index(store, index, |index| {
            Ok(index
                .entries
                .iter()
                .find(|(k, _)| range.includes(k))
                .map(|(_, pk)| pk.clone()))
        })
    }

    fn index_get_all(
        &mut self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
        limit: Option<u32>,
    ) -> Result<Vec<Vec<u8>>, BackendError> {
        let primaries = self.index_get_all_keys(store, index, range, limit)?;
        primaries
            .into_iter()
            .map(|pk| {
                self.get(store, &pk)
                    .map(|value| value.unwrap_or_default())
            })
            .collect()
    }

    fn index_get_all_keys(
        &mut self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
        limit: Option<u32>,
    ) -> Result<Vec<Vec<u8>>, BackendError> {
        self.with_index(store, index, |index| {
            let mut matches: Vec<_> = match range {
                None => index.entries.iter().map(|(_, pk)| pk.clone()).collect(),
                Some(range) => index
                    .entries
                    .iter()
                    .filter(|(k, _)| range.includes(k))
                    .map(|(_, pk)| pk.clone())
                    .collect(),
            };
            if let Some(limit) = limit {
                matches.truncate(limit as usize);
            }
            Ok(matches)
        })
    }

    fn index_count(
        &mut self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
    ) -> Result<u64, BackendError> {
        self.with_index(store, index, |index| {
            Ok(match range {
                None => index.entries.len() as u64,
                Some(range) => index.entries.iter().filter(|(k, _)| range.includes(k)).count() as u64,
            })
        })
    }

    fn open_cursor(
        &mut self,
        store: &str,
        range: Option<&KeyRange>,
        direction: Direction,
    ) -> Result<Option<Box<dyn BackendCursor>>, BackendError> {
        let rows: Vec<CursorRow> = self.with_store(store, |store| {
            Ok(range_slice(&store.records, range)
                .into_iter()
                .map(|(k, v)| CursorRow {
                    key: k.clone(),
                    primary_key: k.clone(),
                    value: Some(v.clone()),
                })
                .collect())
        })?;
        Ok(MemoryCursor::new(apply_direction(rows, direction)))
    }

    fn open_key_cursor(
        &mut self,
        store: &str,
        range: Option<&KeyRange>,
        direction: Direction,
    ) -> Result<Option<Box<dyn BackendCursor>>, BackendError> {
        let rows: Vec<CursorRow> = self.with_store(store, |store| {
            Ok(range_slice(&store.records, range)
                .into_iter()
                .map(|(k, _)| CursorRow {
                    key: k.clone(),
                    primary_key: k.clone(),
                    value: None,
                })
                .collect())
        })?;
        Ok(MemoryCursor::new(apply_direction(rows, direction)))
    }

    fn open_index_cursor(
        &mut self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
        direction: Direction,
    ) -> Result<Option<Box<dyn BackendCursor>>, BackendError> {
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = self.with_index(store, index, |index| {
            Ok(match range {
                None => index.entries.clone(),
                Some(range) => index
                    .entries
                    .iter()
                    .filter(|(k, _)| range.includes(k))
                    .cloned()
                    .collect(),
            })
        })?;
        let mut rows = Vec::with_capacity(pairs.len());
        for (index_key, primary_key) in pairs {
            let value = self.get(store, &primary_key)?;
            rows.push(CursorRow {
                key: index_key,
                primary_key,
                value,
            });
        }
        Ok(MemoryCursor::new(apply_direction(rows, direction)))
    }

    fn open_index_key_cursor(
        &mut self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
        direction: Direction,
    ) -> Result<Option<Box<dyn BackendCursor>>, BackendError> {
        let rows: Vec<CursorRow> = self.with_index(store, index, |index| {
            let pairs: Vec<_> = match range {
                None => index.entries.clone(),
                Some(range) => index
                    .entries
                    .iter()
                    .filter(|(k, _)| range.includes(k))
                    .cloned()
                    .collect(),
            };
            Ok(pairs
                .into_iter()
                .map(|(index_key, primary_key)| CursorRow {
                    key: index_key,
                    primary_key,
                    value: None,
                })
                .collect())
        })?;
        Ok(MemoryCursor::new(apply_direction(rows, direction)))
    }

    fn next_auto_increment_key(&mut self, store: &str) -> Result<f64, BackendError> {
        self.with_store(store, |store| {
            if store.meta.current_key >= MAX_AUTO_INCREMENT {
                return Err(BackendError::GeneratorExhausted);
            }
            let key = store.meta.current_key + 1.0;
            store.meta.current_key = key;
            Ok(key)
        })
    }

    fn maybe_update_key_generator(&mut self, store: &str, key: f64) -> Result<(), BackendError> {
        self.with_store(store, |store| {
            let candidate = (key.floor() + 1.0).min(MAX_AUTO_INCREMENT);
            if candidate > store.meta.current_key {
                store.meta.current_key = candidate;
            }
            Ok(())
        })
    }

    fn commit(mut self: Box<Self>) -> Result<(), BackendError> {
        self.finished = true;
        // Writes already landed on the live map; the snapshot (if any) is
        // simply discarded, matching "commit() discards it".
        self.snapshot = None;
        if let Some(db) = self.databases.lock().get_mut(&self.db_name) {
            db.version = db.version.max(db.version);
        }
        Ok(())
    }

    fn abort(mut self: Box<Self>) -> Result<(), BackendError> {
        self.finished = true;
        if let Some(snapshot) = self.snapshot.take() {
            self.databases.lock().insert(self.db_name.clone(), snapshot);
        }
        Ok(())
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(db = %self.db_name, "memory transaction dropped without commit or abort");
        }
    }
}

#[derive(Clone)]
struct CursorRow {
    key: Vec<u8>,
    primary_key: Vec<u8>,
    value: Option<Vec<u8>>,
}

fn apply_direction(mut rows: Vec<CursorRow>, direction: Direction) -> Vec<CursorRow> {
    if !direction.is_forward() {
        rows.reverse();
    }
    if direction.is_unique() {
        let mut deduped: Vec<CursorRow> = Vec::new();
        for row in rows {
            if deduped.last().map(|r| &r.key) != Some(&row.key) {
                deduped.push(row);
            }
        }
        deduped
    } else {
        rows
    }
}

struct MemoryCursor {
    rows: Vec<CursorRow>,
    pos: usize,
}

impl MemoryCursor {
    fn new(rows: Vec<CursorRow>) -> Option<Box<dyn BackendCursor>> {
        if rows.is_empty() {
            None
        } else {
            Some(Box::new(MemoryCursor { rows, pos: 0 }))
        }
    }
}

impl BackendCursor for MemoryCursor {
    fn key(&self) -> &[u8] {
        &self.rows[self.pos].key
    }

    fn primary_key(&self) -> &[u8] {
        &self.rows[self.pos].primary_key
    }

    fn value(&self) -> Option<&[u8]> {
        self.rows[self.pos].value.as_deref()
    }

    fn advance(&mut self) -> Result<bool, BackendError> {
        if self.pos + 1 < self.rows.len() {
            self.pos += 1;
            Ok(true)
        } else {
            self.pos = self.rows.len();
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idb_codec::Key;

    async fn writer(backend: &MemoryBackend, db: &str) -> MemoryTx {
        backend
            .begin_transaction(db, &[], TxMode::ReadWrite)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn it_inserts_and_reads_back_a_record() {
        let backend = MemoryBackend::new();
        let mut tx = writer(&backend, "db").await;
        tx.create_object_store("s", KeyPath::None, false).unwrap();
        tx.add("s", Key::Number(1.0).encode(), b"a".to_vec()).unwrap();
        let value = tx.get("s", &Key::Number(1.0).encode()).unwrap();
        assert_eq!(value, Some(b"a".to_vec()));
        Box::new(tx).commit().unwrap();
    }

    #[tokio::test]
    async fn it_rejects_duplicate_add_and_rolls_back_on_abort() {
        let backend = MemoryBackend::new();
        let mut tx = writer(&backend, "db").await;
        tx.create_object_store("s", KeyPath::None, false).unwrap();
        tx.add("s", Key::Number(1.0).encode(), b"a".to_vec()).unwrap();
        Box::new(tx).commit().unwrap();

        let mut tx = writer(&backend, "db").await;
        let err = tx.add("s", Key::Number(1.0).encode(), b"b".to_vec()).unwrap_err();
        assert!(matches!(err, BackendError::Constraint(_)));
        Box::new(tx).abort().unwrap();

        let mut tx = writer(&backend, "db").await;
        assert_eq!(tx.count("s", None).unwrap(), 1);
        Box::new(tx).abort().unwrap();
    }

    #[tokio::test]
    async fn it_maintains_auto_increment_monotonicity() {
        let backend = MemoryBackend::new();
        let mut tx = writer(&backend, "db").await;
        tx.create_object_store("s", KeyPath::None, true).unwrap();
        assert_eq!(tx.next_auto_increment_key("s").unwrap(), 1.0);
        assert_eq!(tx.next_auto_increment_key("s").unwrap(), 2.0);
        tx.maybe_update_key_generator("s", 10.0).unwrap();
        assert_eq!(tx.next_auto_increment_key("s").unwrap(), 11.0);
        Box::new(tx).commit().unwrap();
    }

    #[tokio::test]
    async fn a_forward_cursor_visits_every_record_in_key_order() {
        let backend = MemoryBackend::new();
        let mut tx = writer(&backend, "db").await;
        tx.create_object_store("s", KeyPath::None, false).unwrap();
        for k in [3.0, 1.0, 2.0] {
            tx.add("s", Key::Number(k).encode(), vec![]).unwrap();
        }
        let mut cursor = tx.open_cursor("s", None, Direction::Forward).unwrap().unwrap();
        let mut seen = vec![Key::decode(cursor.key()).unwrap()];
        while cursor.advance().unwrap() {
            seen.push(Key::decode(cursor.key()).unwrap());
        }
        assert_eq!(
            seen,
            vec![Key::Number(1.0), Key::Number(2.0), Key::Number(3.0)]
        );
        Box::new(tx).abort().unwrap();
    }
}
