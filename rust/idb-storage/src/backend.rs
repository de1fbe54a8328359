use async_trait::async_trait;
use idb_codec::KeyPath;
use idb_codec::key::KeyRange;

use crate::{BackendError, DatabaseMetadata, Direction, TxMode};

/// A storage substrate capable of hosting many named databases.
///
/// A [`Backend`] owns database-level lifecycle (enumerate, read committed
/// version, delete); everything below one open database is the province of
/// [`BackendTx`].
#[async_trait]
pub trait Backend: Send + Sync {
    /// The transaction handle this backend produces.
    type Tx: BackendTx;

    /// The committed schema version of `name`, or `0` if it does not exist.
    async fn committed_version(&self, name: &str) -> Result<u64, BackendError>;

    /// Full schema (stores, indexes) of `name`. Empty/default if it does
    /// not exist.
    async fn metadata(&self, name: &str) -> Result<DatabaseMetadata, BackendError>;

    /// Every database known to this backend, with its committed version.
    async fn list_databases(&self) -> Result<Vec<(String, u64)>, BackendError>;

    /// Irrecoverably removes a database and all its data.
    async fn delete_database(&self, name: &str) -> Result<(), BackendError>;

    /// Opens a transaction scoped to `scope` (the object stores it may
    /// touch) in the given mode. `scope` is ignored (treated as "all
    /// stores") for `VersionChange`.
    async fn begin_transaction(
        &self,
        name: &str,
        scope: &[String],
        mode: TxMode,
    ) -> Result<Self::Tx, BackendError>;
}

/// A single backend transaction: schema DDL, point/range data access, and
/// cursor creation, all scoped to one open database.
///
/// Every method here is synchronous by design (see the crate-level scheduling
/// notes in `indexeddb`): suspension happens only at the engine layer, on
/// the microtask that delivers a request's result.
pub trait BackendTx: Send {
    // -- schema --------------------------------------------------------
    /// Creates a new object store. Errs with [`BackendError::Constraint`] if
    /// the name is already in use.
    fn create_object_store(
        &mut self,
        name: &str,
        key_path: KeyPath,
        auto_increment: bool,
    ) -> Result<(), BackendError>;

    /// Deletes an object store and everything in it (records, indexes).
    fn delete_object_store(&mut self, name: &str) -> Result<(), BackendError>;

    /// Renames an object store in place.
    fn rename_object_store(&mut self, name: &str, new_name: &str) -> Result<(), BackendError>;

    /// Registers a new, empty index on `store`.
    ///
    /// The backend only owns index *storage*: it has no access to the value
    /// codec and so cannot extract secondary keys itself. Population (and
    /// the `unique`-constraint check against existing records) is driven by
    /// the engine layer, which extracts keys and calls [`Self::index_put`]
    /// for each one after this call succeeds.
    fn create_index(
        &mut self,
        store: &str,
        name: &str,
        key_path: KeyPath,
        unique: bool,
        multi_entry: bool,
    ) -> Result<(), BackendError>;

    /// Deletes an index and all its entries.
    fn delete_index(&mut self, store: &str, name: &str) -> Result<(), BackendError>;

    /// Renames an index in place.
    fn rename_index(&mut self, store: &str, name: &str, new_name: &str) -> Result<(), BackendError>;

    /// Inserts one secondary-key -> primary-key entry into `index`. Errs
    /// with [`BackendError::Constraint`] if the index is unique and already
    /// holds an entry for `index_key`.
    fn index_put(
        &mut self,
        store: &str,
        index: &str,
        index_key: Vec<u8>,
        primary_key: Vec<u8>,
    ) -> Result<(), BackendError>;

    /// Removes every entry `index` holds for `primary_key` (all of them, in
    /// the `multiEntry` case). Called by the engine before re-deriving a
    /// record's index entries on `put`/`delete`.
    fn index_delete_for_primary_key(
        &mut self,
        store: &str,
        index: &str,
        primary_key: &[u8],
    ) -> Result<(), BackendError>;

    // -- data ------------------------------------------------------------
    /// Point lookup by encoded key.
    fn get(&mut self, store: &str, key: &[u8]) -> Result<Option<Vec<u8>>, BackendError>;

    /// All (key, value) pairs in `range`, in key order, capped at `limit`.
    fn get_all(
        &mut self,
        store: &str,
        range: Option<&KeyRange>,
        limit: Option<u32>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, BackendError>;

    /// All keys in `range`, in key order, capped at `limit`.
    fn get_all_keys(
        &mut self,
        store: &str,
        range: Option<&KeyRange>,
        limit: Option<u32>,
    ) -> Result<Vec<Vec<u8>>, BackendError>;

    /// Inserts or replaces the record at `key`.
    fn put(&mut self, store: &str, key: Vec<u8>, value: Vec<u8>) -> Result<(), BackendError>;

    /// Inserts the record at `key`. Errs with [`BackendError::Constraint`]
    /// if a record already exists there.
    fn add(&mut self, store: &str, key: Vec<u8>, value: Vec<u8>) -> Result<(), BackendError>;

    /// Deletes every record whose key falls in `range`.
    fn delete(&mut self, store: &str, range: &KeyRange) -> Result<(), BackendError>;

    /// Deletes every record in `store`.
    fn clear(&mut self, store: &str) -> Result<(), BackendError>;

    /// The number of records in `range` (or the whole store, if `None`).
    fn count(&mut self, store: &str, range: Option<&KeyRange>) -> Result<u64, BackendError>;

    // -- index data --------------------------------------------------------
    /// The value of the first record whose index key falls in `range`.
    fn index_get(
        &mut self,
        store: &str,
        index: &str,
        range: &KeyRange,
    ) -> Result<Option<Vec<u8>>, BackendError>;

    /// The primary key of the first record whose index key falls in `range`.
    fn index_get_key(
        &mut self,
        store: &str,
        index: &str,
        range: &KeyRange,
    ) -> Result<Option<Vec<u8>>, BackendError>;

    /// All values reachable through `index` in `range`, capped at `limit`.
    fn index_get_all(
        &mut self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
        limit: Option<u32>,
    ) -> Result<Vec<Vec<u8>>, BackendError>;

    /// All primary keys reachable through `index` in `range`, capped at `limit`.
    fn index_get_all_keys(
        &mut self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
        limit: Option<u32>,
    ) -> Result<Vec<Vec<u8>>, BackendError>;

    /// The number of index entries in `range` (or the whole index, if `None`).
    fn index_count(
        &mut self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
    ) -> Result<u64, BackendError>;

    // -- cursors -----------------------------------------------------------
    /// Opens a cursor with values over `store`. Returns `None` if no record
    /// matches `range` at the initial position.
    fn open_cursor(
        &mut self,
        store: &str,
        range: Option<&KeyRange>,
        direction: Direction,
    ) -> Result<Option<Box<dyn BackendCursor>>, BackendError>;

    /// Opens a key-only cursor over `store`.
    fn open_key_cursor(
        &mut self,
        store: &str,
        range: Option<&KeyRange>,
        direction: Direction,
    ) -> Result<Option<Box<dyn BackendCursor>>, BackendError>;

    /// Opens a cursor with values over `index`.
    fn open_index_cursor(
        &mut self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
        direction: Direction,
    ) -> Result<Option<Box<dyn BackendCursor>>, BackendError>;

    /// Opens a key-only cursor over `index`.
    fn open_index_key_cursor(
        &mut self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
        direction: Direction,
    ) -> Result<Option<Box<dyn BackendCursor>>, BackendError>;

    // -- auto-increment -----------------------------------------------------
    /// Allocates and returns the next auto-increment key for `store`, and
    /// advances its counter. Errs with [`BackendError::GeneratorExhausted`]
    /// if the counter has reached 2^53.
    fn next_auto_increment_key(&mut self, store: &str) -> Result<f64, BackendError>;

    /// Raises `store`'s auto-increment counter to `min(floor(key) + 1, 2^53)`
    /// if that is larger than the current counter. No-op otherwise.
    fn maybe_update_key_generator(&mut self, store: &str, key: f64) -> Result<(), BackendError>;

    // -- lifecycle -----------------------------------------------------------
    /// Commits every mutation made on this transaction.
    fn commit(self: Box<Self>) -> Result<(), BackendError>;

    /// Rolls back every mutation made on this transaction.
    fn abort(self: Box<Self>) -> Result<(), BackendError>;
}

/// A backend-level cursor over a store or index, in either direction.
///
/// The facade in the engine crate layers key-target/primary-key-target
/// continuation, snapshotting, and caching on top of this minimal surface.
pub trait BackendCursor: Send {
    /// The cursor's current key (the store key, or the secondary index key
    /// for an index cursor).
    fn key(&self) -> &[u8];

    /// The cursor's current primary key (equal to `key()` for a store
    /// cursor; the record's primary key for an index cursor).
    fn primary_key(&self) -> &[u8];

    /// The cursor's current value, or `None` for a key-only cursor.
    fn value(&self) -> Option<&[u8]>;

    /// Advances the cursor one step in its direction. Returns `false` (and
    /// leaves the cursor parked past the end) if no further record exists.
    fn advance(&mut self) -> Result<bool, BackendError>;
}
