//! The cursor facade: key/primary-key/value snapshotting, `continue`/
//! `continuePrimaryKey` target validation, and in-place `update`/`delete`.

use std::cell::RefCell;
use std::rc::Rc;

use idb_codec::key::{Key, KeyRange};
use idb_codec::value::Value;
use idb_storage::{BackendCursor, Direction};

use crate::error::IdbError;
use crate::request::{Request, RequestSource};
use crate::store;
use crate::transaction::Transaction;

/// A live cursor over a store or index, scoped to the transaction it was
/// opened from.
///
/// Each position's key/primary key/value are whatever the backend cursor
/// last read; the backend cursors both snapshot those fields at query time
/// rather than re-reading on demand, so repeated reads of the same position
/// stay stable even if a later operation on this transaction mutates the
/// underlying record.
pub struct Cursor {
    transaction: Transaction,
    store_name: String,
    index_name: Option<String>,
    direction: Direction,
    with_value: bool,
    inner: Rc<RefCell<Box<dyn BackendCursor>>>,
}

impl Cursor {
    pub(crate) fn open_store(
        transaction: Transaction,
        store_name: String,
        range: Option<KeyRange>,
        direction: Direction,
        with_value: bool,
    ) -> Result<Option<Cursor>, IdbError> {
        let name = store_name.clone();
        let backend_cursor = transaction.with_active_backend(move |tx| {
            let opened = if with_value {
                tx.open_cursor(&name, range.as_ref(), direction)?
            } else {
                tx.open_key_cursor(&name, range.as_ref(), direction)?
            };
            Ok(opened)
        })?;
        Ok(backend_cursor.map(|inner| Cursor {
            transaction,
            store_name,
            index_name: None,
            direction,
            with_value,
            inner: Rc::new(RefCell::new(inner)),
        }))
    }

    pub(crate) fn open_index(
        transaction: Transaction,
        store_name: String,
        index_name: String,
        range: Option<KeyRange>,
        direction: Direction,
        with_value: bool,
    ) -> Result<Option<Cursor>, IdbError> {
        let store = store_name.clone();
        let index = index_name.clone();
        let backend_cursor = transaction.with_active_backend(move |tx| {
            let opened = if with_value {
                tx.open_index_cursor(&store, &index, range.as_ref(), direction)?
            } else {
                tx.open_index_key_cursor(&store, &index, range.as_ref(), direction)?
            };
            Ok(opened)
        })?;
        Ok(backend_cursor.map(|inner| Cursor {
            transaction,
            store_name,
            index_name: Some(index_name),
            direction,
            with_value,
            inner: Rc::new(RefCell::new(inner)),
        }))
    }

    /// This cursor's iteration direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The object store this cursor iterates (directly, or through an
    /// index).
    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    /// The index this cursor iterates through, if any.
    pub fn index_name(&self) -> Option<&str> {
        self.index_name.as_deref()
    }

    fn source(&self) -> RequestSource {
        let walked = match &self.index_name {
            Some(index) => RequestSource::Index {
                store: self.store_name.clone(),
                index: index.clone(),
            },
            None => RequestSource::Store(self.store_name.clone()),
        };
        RequestSource::Cursor(Box::new(walked))
    }

    /// The cursor's current key: the store key for a store cursor, or the
    /// secondary index key for an index cursor.
    pub fn key(&self) -> Result<Key, IdbError> {
        Ok(Key::decode(self.inner.borrow().key())?)
    }

    /// The primary key of the record the cursor is currently positioned on.
    pub fn primary_key(&self) -> Result<Key, IdbError> {
        Ok(Key::decode(self.inner.borrow().primary_key())?)
    }

    /// The cursor's current value, or `None` for a key-only cursor.
    pub fn value(&self) -> Result<Option<Value>, IdbError> {
        match self.inner.borrow().value() {
            Some(bytes) => Ok(Some(Value::decode(bytes)?)),
            None => Ok(None),
        }
    }

    /// Advances the cursor `count` steps (at least one), delivering whether
    /// it is still positioned on a record afterward.
    pub fn advance(&self, count: u32) -> Result<Request<bool>, IdbError> {
        let steps = count.max(1);
        let cursor = self.inner.clone();
        self.transaction.issue(self.source(), move |_tx| {
            let mut cursor = cursor.borrow_mut();
            let mut moved = false;
            for _ in 0..steps {
                moved = cursor.advance()?;
                if !moved {
                    break;
                }
            }
            Ok(moved)
        })
    }

    /// Advances the cursor until it reaches the first record at or past
    /// `target` in this cursor's direction, or delivers `false` if none
    /// exists. `target` must be strictly ahead of the cursor's current key;
    /// anything else is a synchronous [`IdbError::Data`].
    pub fn continue_to(&self, target: &Key) -> Result<Request<bool>, IdbError> {
        let current = self.inner.borrow().key().to_vec();
        let target_bytes = target.encode();
        if !is_strictly_ahead(&current, &target_bytes, self.direction) {
            return Err(IdbError::Data(
                "continue() target must be strictly ahead of the cursor's current key".into(),
            ));
        }
        let cursor = self.inner.clone();
        let direction = self.direction;
        self.transaction.issue(self.source(), move |_tx| {
            let mut cursor = cursor.borrow_mut();
            loop {
                if !cursor.advance()? {
                    return Ok(false);
                }
                if reached(cursor.key(), &target_bytes, direction) {
                    return Ok(true);
                }
            }
        })
    }

    /// Like [`Self::continue_to`], but targets an exact (index key, primary
    /// key) pair. Only valid on a non-unique index cursor.
    pub fn continue_primary_key(&self, key: &Key, primary_key: &Key) -> Result<Request<bool>, IdbError> {
        if self.index_name.is_none() {
            return Err(IdbError::InvalidAccess(
                "continuePrimaryKey is only valid on an index cursor".into(),
            ));
        }
        if self.direction.is_unique() {
            return Err(IdbError::InvalidAccess(
                "continuePrimaryKey is not valid on a unique-direction cursor".into(),
            ));
        }
        let target_key = key.encode();
        let target_primary = primary_key.encode();
        let current_key = self.inner.borrow().key().to_vec();
        let current_primary = self.inner.borrow().primary_key().to_vec();
        if !is_strictly_ahead_pair(
            (&current_key, &current_primary),
            (&target_key, &target_primary),
            self.direction,
        ) {
            return Err(IdbError::Data(
                "continuePrimaryKey target must be strictly ahead of the cursor's current position".into(),
            ));
        }
        let cursor = self.inner.clone();
        let direction = self.direction;
        self.transaction.issue(self.source(), move |_tx| {
            let mut cursor = cursor.borrow_mut();
            loop {
                if !cursor.advance()? {
                    return Ok(false);
                }
                let pair = (cursor.key(), cursor.primary_key());
                if reached_pair(pair, (&target_key, &target_primary), direction) {
                    return Ok(true);
                }
            }
        })
    }

    /// Replaces the value of the record this cursor is positioned on.
    /// Requires a value cursor opened on a read-write transaction.
    pub fn update(&self, value: Value) -> Result<Request<Key>, IdbError> {
        if !self.with_value {
            return Err(IdbError::InvalidAccess(
                "update() is not valid on a key-only cursor".into(),
            ));
        }
        let primary_key = self.primary_key()?;
        store::write_at_key(&self.transaction, &self.store_name, primary_key, value)
    }

    /// Deletes the record this cursor is positioned on.
    pub fn delete(&self) -> Result<Request<()>, IdbError> {
        let primary_key = self.primary_key()?;
        store::delete_at_key(&self.transaction, &self.store_name, &primary_key)
    }
}

fn is_strictly_ahead(current: &[u8], target: &[u8], direction: Direction) -> bool {
    if direction.is_forward() {
        target > current
    } else {
        target < current
    }
}

fn reached(current: &[u8], target: &[u8], direction: Direction) -> bool {
    if direction.is_forward() {
        current >= target
    } else {
        current <= target
    }
}

fn is_strictly_ahead_pair(current: (&[u8], &[u8]), target: (&[u8], &[u8]), direction: Direction) -> bool {
    if direction.is_forward() {
        target > current
    } else {
        target < current
    }
}

fn reached_pair(current: (&[u8], &[u8]), target: (&[u8], &[u8]), direction: Direction) -> bool {
    if direction.is_forward() {
        current >= target
    } else {
        current <= target
    }
}
