//! The object store facade: the client-facing CRUD and schema surface over
//! one store within a transaction.

use idb_codec::key::{Key, KeyPath, KeyRange};
use idb_codec::value::Value;
use idb_storage::{BackendTx, Direction, IndexMetadata, StoreMetadata, TxMode};

use crate::cursor::Cursor;
use crate::error::IdbError;
use crate::index::Index;
use crate::request::{Request, RequestSource};
use crate::transaction::Transaction;

/// A handle to one object store, scoped to the transaction it was opened
/// from.
pub struct ObjectStore {
    transaction: Transaction,
    name: String,
}

impl ObjectStore {
    pub(crate) fn new(transaction: Transaction, name: String) -> Self {
        ObjectStore { transaction, name }
    }

    /// This store's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The transaction this handle was opened from.
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    fn meta(&self) -> Result<StoreMetadata, IdbError> {
        self.transaction
            .metadata()
            .store(&self.name)
            .cloned()
            .ok_or_else(|| IdbError::NotFound(format!("no object store named {:?}", self.name)))
    }

    fn require_writable(&self) -> Result<(), IdbError> {
        if self.transaction.mode() == TxMode::ReadOnly {
            return Err(IdbError::ReadOnly);
        }
        Ok(())
    }

    /// Looks up the record at `key`.
    pub fn get(&self, key: &Key) -> Result<Request<Option<Value>>, IdbError> {
        let name = self.name.clone();
        let key_bytes = key.encode();
        self.transaction.issue(RequestSource::Store(name.clone()), move |tx| {
            let raw = tx.get(&name, &key_bytes)?;
            Ok(match raw {
                Some(bytes) => Some(Value::decode(&bytes)?),
                None => None,
            })
        })
    }

    /// Every value whose key falls in `range`, in key order, capped at
    /// `limit`.
    pub fn get_all(
        &self,
        range: Option<&KeyRange>,
        limit: Option<u32>,
    ) -> Result<Request<Vec<Value>>, IdbError> {
        let name = self.name.clone();
        let range = range.cloned();
        self.transaction.issue(RequestSource::Store(name.clone()), move |tx| {
            let rows = tx.get_all(&name, range.as_ref(), limit)?;
            rows.into_iter()
                .map(|(_, v)| Ok(Value::decode(&v)?))
                .collect()
        })
    }

    /// Every key in `range`, in key order, capped at `limit`.
    pub fn get_all_keys(
        &self,
        range: Option<&KeyRange>,
        limit: Option<u32>,
    ) -> Result<Request<Vec<Key>>, IdbError> {
        let name = self.name.clone();
        let range = range.cloned();
        self.transaction.issue(RequestSource::Store(name.clone()), move |tx| {
            let rows = tx.get_all_keys(&name, range.as_ref(), limit)?;
            rows.into_iter()
                .map(|k| Ok(Key::decode(&k)?))
                .collect()
        })
    }

    /// Inserts or replaces the record for `value`, using `key` if this store
    /// has no key path, or deriving/generating one otherwise.
    pub fn put(&self, value: Value, key: Option<Key>) -> Result<Request<Key>, IdbError> {
        self.write_record(value, key, false)
    }

    /// Like [`Self::put`], but fails with [`IdbError::Constraint`] if a
    /// record already exists at the resolved key.
    pub fn add(&self, value: Value, key: Option<Key>) -> Result<Request<Key>, IdbError> {
        self.write_record(value, key, true)
    }

    fn write_record(
        &self,
        value: Value,
        explicit_key: Option<Key>,
        add_only: bool,
    ) -> Result<Request<Key>, IdbError> {
        self.require_writable()?;
        let store_meta = self.meta()?;
        if explicit_key.is_some() && store_meta.key_path != KeyPath::None {
            return Err(IdbError::Data(
                "an explicit key may not be supplied for a store with a key path".into(),
            ));
        }
        if explicit_key.is_none() && store_meta.key_path == KeyPath::None && !store_meta.auto_increment {
            return Err(IdbError::Data("this store requires an explicit key".into()));
        }

        let name = self.name.clone();
        let indexes: Vec<IndexMetadata> = self
            .transaction
            .metadata()
            .indexes_of(&self.name)
            .cloned()
            .collect();

        self.transaction.issue(RequestSource::Store(name.clone()), move |tx| {
            let mut value = value;
            let key = resolve_key(tx, &name, &store_meta, &mut value, explicit_key)?;
            write_value_and_indexes(tx, &name, &indexes, &key, value, add_only)?;
            Ok(key)
        })
    }

    /// Deletes every record whose key falls in `range`.
    pub fn delete(&self, range: &KeyRange) -> Result<Request<()>, IdbError> {
        self.require_writable()?;
        let name = self.name.clone();
        let range = range.clone();
        let indexes: Vec<IndexMetadata> = self
            .transaction
            .metadata()
            .indexes_of(&self.name)
            .cloned()
            .collect();
        self.transaction.issue(RequestSource::Store(name.clone()), move |tx| {
            let keys = tx.get_all_keys(&name, Some(&range), None)?;
            tx.delete(&name, &range)?;
            for key in &keys {
                for idx in &indexes {
                    tx.index_delete_for_primary_key(&name, &idx.name, key)?;
                }
            }
            Ok(())
        })
    }

    /// Deletes every record in this store.
    pub fn clear(&self) -> Result<Request<()>, IdbError> {
        self.require_writable()?;
        let name = self.name.clone();
        self.transaction
            .issue(RequestSource::Store(name.clone()), move |tx| tx.clear(&name))
    }

    /// The number of records in `range` (the whole store if `None`).
    pub fn count(&self, range: Option<&KeyRange>) -> Result<Request<u64>, IdbError> {
        let name = self.name.clone();
        let range = range.cloned();
        self.transaction
            .issue(RequestSource::Store(name.clone()), move |tx| tx.count(&name, range.as_ref()))
    }

    /// Registers a new, empty index on this store, populating it from
    /// existing records. Only valid on a version-change transaction.
    pub fn create_index(
        &self,
        name: &str,
        key_path: KeyPath,
        unique: bool,
        multi_entry: bool,
    ) -> Result<Index, IdbError> {
        if self.transaction.mode() != TxMode::VersionChange {
            return Err(IdbError::InvalidState(
                "indexes may only be created inside a version-change transaction".into(),
            ));
        }
        let store_name = self.name.clone();
        let index_name = name.to_string();
        let path = key_path.clone();
        self.transaction.issue(RequestSource::Store(self.name.clone()), move |tx| {
            tx.create_index(&store_name, &index_name, path.clone(), unique, multi_entry)?;
            for (key, value) in tx.get_all(&store_name, None, None)? {
                let value = Value::decode(&value)?;
                put_index_entries(tx, &store_name, &index_name, &path, multi_entry, &key, &value)?;
            }
            Ok(())
        })?;
        self.transaction.with_metadata_mut(|meta| {
            meta.indexes.push(IndexMetadata {
                name: name.to_string(),
                store_name: self.name.clone(),
                key_path,
                unique,
                multi_entry,
            });
        });
        self.index(name)
    }

    /// Deletes an index and all its entries. Only valid on a version-change
    /// transaction.
    pub fn delete_index(&self, name: &str) -> Result<(), IdbError> {
        if self.transaction.mode() != TxMode::VersionChange {
            return Err(IdbError::InvalidState(
                "indexes may only be deleted inside a version-change transaction".into(),
            ));
        }
        let store_name = self.name.clone();
        let index_name = name.to_string();
        self.transaction
            .issue(RequestSource::Store(self.name.clone()), move |tx| tx.delete_index(&store_name, &index_name))?;
        self.transaction.with_metadata_mut(|meta| {
            meta.indexes.retain(|i| !(i.store_name == self.name && i.name == name));
        });
        Ok(())
    }

    /// Opens a handle to an existing index on this store.
    pub fn index(&self, name: &str) -> Result<Index, IdbError> {
        if self.transaction.metadata().index(&self.name, name).is_none() {
            return Err(IdbError::NotFound(format!("no index named {name:?}")));
        }
        Ok(Index::new(self.transaction.clone(), self.name.clone(), name.to_string()))
    }

    /// Opens a cursor with values over this store.
    pub fn open_cursor(
        &self,
        range: Option<&KeyRange>,
        direction: Direction,
    ) -> Result<Option<Cursor>, IdbError> {
        Cursor::open_store(self.transaction.clone(), self.name.clone(), range.cloned(), direction, true)
    }

    /// Opens a key-only cursor over this store.
    pub fn open_key_cursor(
        &self,
        range: Option<&KeyRange>,
        direction: Direction,
    ) -> Result<Option<Cursor>, IdbError> {
        Cursor::open_store(self.transaction.clone(), self.name.clone(), range.cloned(), direction, false)
    }
}

fn resolve_key(
    tx: &mut dyn BackendTx,
    store_name: &str,
    store_meta: &StoreMetadata,
    value: &mut Value,
    explicit_key: Option<Key>,
) -> Result<Key, IdbError> {
    if let Some(key) = explicit_key {
        return Ok(key);
    }
    match &store_meta.key_path {
        KeyPath::None => {
            let key_num = tx.next_auto_increment_key(store_name)?;
            Ok(Key::Number(key_num))
        }
        path => match path.extract(value)? {
            Some(key) => Ok(key),
            None if store_meta.auto_increment => {
                let key_num = tx.next_auto_increment_key(store_name)?;
                let key = Key::Number(key_num);
                if let KeyPath::Single(segment) = path {
                    inject_property(value, segment, Value::Number(key_num));
                }
                Ok(key)
            }
            None => Err(IdbError::Data(
                "value has no key at this store's key path".into(),
            )),
        },
    }
}

fn inject_property(value: &mut Value, path: &str, new_value: Value) {
    if path.contains('.') {
        // Nested injection targets are rare in practice and are left
        // unset rather than guessed at; callers needing this should
        // supply an explicit key instead.
        return;
    }
    if let Value::Object(entries) = value {
        let mut entries = entries.borrow_mut();
        if let Some(existing) = entries.iter_mut().find(|(k, _)| k == path) {
            existing.1 = new_value;
        } else {
            entries.push((path.to_string(), new_value));
        }
    }
}

fn write_value_and_indexes(
    tx: &mut dyn BackendTx,
    store_name: &str,
    indexes: &[IndexMetadata],
    key: &Key,
    value: Value,
    add_only: bool,
) -> Result<(), IdbError> {
    let key_bytes = key.encode();
    let value_bytes = value.encode();
    if add_only {
        tx.add(store_name, key_bytes.clone(), value_bytes)?;
    } else {
        tx.put(store_name, key_bytes.clone(), value_bytes)?;
    }
    for idx in indexes {
        tx.index_delete_for_primary_key(store_name, &idx.name, &key_bytes)?;
        put_index_entries(tx, store_name, &idx.name, &idx.key_path, idx.multi_entry, &key_bytes, &value)?;
    }
    Ok(())
}

fn put_index_entries(
    tx: &mut dyn BackendTx,
    store_name: &str,
    index_name: &str,
    key_path: &KeyPath,
    multi_entry: bool,
    primary_key_bytes: &[u8],
    value: &Value,
) -> Result<(), IdbError> {
    let extracted = match key_path.extract(value) {
        Ok(Some(key)) => key,
        Ok(None) => return Ok(()),
        Err(_) => return Ok(()),
    };
    match extracted {
        Key::Array(items) if multi_entry => {
            let mut seen = Vec::new();
            for item in items {
                let encoded = item.encode();
                if seen.contains(&encoded) {
                    continue;
                }
                seen.push(encoded.clone());
                tx.index_put(store_name, index_name, encoded, primary_key_bytes.to_vec())?;
            }
        }
        other => {
            tx.index_put(store_name, index_name, other.encode(), primary_key_bytes.to_vec())?;
        }
    }
    Ok(())
}

/// Writes a record at an already-known key, bypassing auto-increment/key
/// path derivation. Shared by [`crate::cursor::Cursor::update`].
pub(crate) fn write_at_key(
    transaction: &Transaction,
    store_name: &str,
    key: Key,
    value: Value,
) -> Result<Request<Key>, IdbError> {
    if transaction.mode() == TxMode::ReadOnly {
        return Err(IdbError::ReadOnly);
    }
    let indexes: Vec<IndexMetadata> = transaction.metadata().indexes_of(store_name).cloned().collect();
    let store_name = store_name.to_string();
    let source = RequestSource::Cursor(Box::new(RequestSource::Store(store_name.clone())));
    transaction.issue(source, move |tx| {
        write_value_and_indexes(tx, &store_name, &indexes, &key, value, false)?;
        Ok(key)
    })
}

/// Deletes the record at an already-known key. Shared by
/// [`crate::cursor::Cursor::delete`].
pub(crate) fn delete_at_key(
    transaction: &Transaction,
    store_name: &str,
    key: &Key,
) -> Result<Request<()>, IdbError> {
    if transaction.mode() == TxMode::ReadOnly {
        return Err(IdbError::ReadOnly);
    }
    let indexes: Vec<IndexMetadata> = transaction.metadata().indexes_of(store_name).cloned().collect();
    let store_name = store_name.to_string();
    let key = key.clone();
    let source = RequestSource::Cursor(Box::new(RequestSource::Store(store_name.clone())));
    transaction.issue(source, move |tx| {
        let key_bytes = key.encode();
        let range = KeyRange::only(&key);
        tx.delete(&store_name, &range)?;
        for idx in &indexes {
            tx.index_delete_for_primary_key(&store_name, &idx.name, &key_bytes)?;
        }
        Ok(())
    })
}
