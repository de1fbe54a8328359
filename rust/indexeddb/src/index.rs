//! The secondary index facade: the same read surface as an object store,
//! scoped to one index's secondary key space.

use idb_codec::key::{Key, KeyRange};
use idb_codec::value::Value;
use idb_storage::Direction;

use crate::cursor::Cursor;
use crate::error::IdbError;
use crate::request::{Request, RequestSource};
use crate::transaction::Transaction;

/// A handle to one secondary index, scoped to the transaction it was
/// opened from.
pub struct Index {
    transaction: Transaction,
    store_name: String,
    name: String,
}

impl Index {
    pub(crate) fn new(transaction: Transaction, store_name: String, name: String) -> Self {
        Index {
            transaction,
            store_name,
            name,
        }
    }

    /// This index's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The store this index is defined on.
    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    fn source(&self) -> RequestSource {
        RequestSource::Index {
            store: self.store_name.clone(),
            index: self.name.clone(),
        }
    }

    /// The value of the first record whose index key falls in `range`.
    pub fn get(&self, range: &KeyRange) -> Result<Request<Option<Value>>, IdbError> {
        let store = self.store_name.clone();
        let name = self.name.clone();
        let range = range.clone();
        self.transaction.issue(self.source(), move |tx| {
            let raw = tx.index_get(&store, &name, &range)?;
            Ok(match raw {
                Some(bytes) => Some(Value::decode(&bytes)?),
                None => None,
            })
        })
    }

    /// The primary key of the first record whose index key falls in `range`.
    pub fn get_key(&self, range: &KeyRange) -> Result<Request<Option<Key>>, IdbError> {
        let store = self.store_name.clone();
        let name = self.name.clone();
        let range = range.clone();
        self.transaction.issue(self.source(), move |tx| {
            let raw = tx.index_get_key(&store, &name, &range)?;
            Ok(match raw {
                Some(bytes) => Some(Key::decode(&bytes)?),
                None => None,
            })
        })
    }

    /// All values reachable through this index in `range`, capped at
    /// `limit`.
    pub fn get_all(
        &self,
        range: Option<&KeyRange>,
        limit: Option<u32>,
    ) -> Result<Request<Vec<Value>>, IdbError> {
        let store = self.store_name.clone();
        let name = self.name.clone();
        let range = range.cloned();
        self.transaction.issue(self.source(), move |tx| {
            let rows = tx.index_get_all(&store, &name, range.as_ref(), limit)?;
            rows.into_iter().map(|v| Ok(Value::decode(&v)?)).collect()
        })
    }

    /// All primary keys reachable through this index in `range`, capped at
    /// `limit`.
    pub fn get_all_keys(
        &self,
        range: Option<&KeyRange>,
        limit: Option<u32>,
    ) -> Result<Request<Vec<Key>>, IdbError> {
        let store = self.store_name.clone();
        let name = self.name.clone();
        let range = range.cloned();
        self.transaction.issue(self.source(), move |tx| {
            let rows = tx.index_get_all_keys(&store, &name, range.as_ref(), limit)?;
            rows.into_iter().map(|k| Ok(Key::decode(&k)?)).collect()
        })
    }

    /// The number of index entries in `range` (the whole index if `None`).
    pub fn count(&self, range: Option<&KeyRange>) -> Result<Request<u64>, IdbError> {
        let store = self.store_name.clone();
        let name = self.name.clone();
        let range = range.cloned();
        self.transaction
            .issue(self.source(), move |tx| Ok(tx.index_count(&store, &name, range.as_ref())?))
    }

    /// Opens a cursor with values over this index.
    pub fn open_cursor(
        &self,
        range: Option<&KeyRange>,
        direction: Direction,
    ) -> Result<Option<Cursor>, IdbError> {
        Cursor::open_index(
            self.transaction.clone(),
            self.store_name.clone(),
            self.name.clone(),
            range.cloned(),
            direction,
            true,
        )
    }

    /// Opens a key-only cursor over this index.
    pub fn open_key_cursor(
        &self,
        range: Option<&KeyRange>,
        direction: Direction,
    ) -> Result<Option<Cursor>, IdbError> {
        Cursor::open_index(
            self.transaction.clone(),
            self.store_name.clone(),
            self.name.clone(),
            range.cloned(),
            direction,
            false,
        )
    }
}
