use idb_codec::KeyPath;

/// The isolation mode a backend transaction was opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    /// Read-only; may run concurrently with other readers and writers.
    ReadOnly,
    /// Single-writer; serialized against other read-write transactions
    /// with overlapping scope.
    ReadWrite,
    /// Exclusive schema-upgrade transaction; no other transaction may exist
    /// for the database while it is open.
    VersionChange,
}

/// Cursor iteration direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending key order, visiting every matching record.
    Forward,
    /// Ascending key order, visiting each distinct key once.
    ForwardUnique,
    /// Descending key order, visiting every matching record.
    Backward,
    /// Descending key order, visiting each distinct key once.
    BackwardUnique,
}

impl Direction {
    /// Whether this direction skips non-unique duplicate secondary keys.
    pub fn is_unique(&self) -> bool {
        matches!(self, Direction::ForwardUnique | Direction::BackwardUnique)
    }

    /// Whether this direction iterates in ascending key order.
    pub fn is_forward(&self) -> bool {
        matches!(self, Direction::Forward | Direction::ForwardUnique)
    }
}

/// Persisted attributes of one object store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreMetadata {
    /// The store's name, unique within its database.
    pub name: String,
    /// How keys are derived from stored values, if at all.
    pub key_path: KeyPath,
    /// Whether this store assigns numeric keys automatically.
    pub auto_increment: bool,
    /// The smallest integer strictly greater than every integer key ever
    /// inserted into this store (capped at 2^53), used only when
    /// `auto_increment` is set.
    pub current_key: f64,
}

/// Persisted attributes of one secondary index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMetadata {
    /// The index's name, unique within its store.
    pub name: String,
    /// The store this index is defined on.
    pub store_name: String,
    /// How the secondary key is derived from a record's value.
    pub key_path: KeyPath,
    /// Whether two live records may not share a secondary key.
    pub unique: bool,
    /// Whether an array-valued key path yields one entry per element.
    pub multi_entry: bool,
}

/// A database's full schema and committed version, as seen by a backend.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DatabaseMetadata {
    /// The database's name.
    pub name: String,
    /// The last successfully committed schema version (0 if the database
    /// does not exist).
    pub version: u64,
    /// Object stores, in no particular order.
    pub stores: Vec<StoreMetadata>,
    /// Secondary indexes, in no particular order.
    pub indexes: Vec<IndexMetadata>,
}

impl DatabaseMetadata {
    /// Looks up a store by name.
    pub fn store(&self, name: &str) -> Option<&StoreMetadata> {
        self.stores.iter().find(|s| s.name == name)
    }

    /// Looks up an index by store and index name.
    pub fn index(&self, store: &str, name: &str) -> Option<&IndexMetadata> {
        self.indexes
            .iter()
            .find(|i| i.store_name == store && i.name == name)
    }

    /// Every index defined on `store`.
    pub fn indexes_of(&self, store: &str) -> impl Iterator<Item = &IndexMetadata> {
        self.indexes.iter().filter(move |i| i.store_name == store)
    }
}
