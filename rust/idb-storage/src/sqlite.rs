//! A durable [`Backend`] built on one SQLite file per logical database.
//!
//! A database file is named by percent-encoding the logical database name
//! and appending `.sqlite`, inside the directory this backend was opened
//! with. Each file holds the same five fixed tables (`_idb_database`,
//! `_idb_stores`, `_idb_indexes`, `_idb_records`, `_idb_index_entries`)
//! scoped to that one database — a file is single-tenant, so rows need no
//! database-name column to disambiguate. Keys and values are stored exactly
//! as the codecs produced them (`BLOB`), so SQLite's default byte-wise
//! `BLOB` ordering is what gives us key order for free.
//!
//! Cursors never buffer: each [`BackendCursor::advance`] re-runs a `LIMIT 1`
//! query positioned just past the current row. This keeps cursor memory flat
//! regardless of range size, at the cost of one round trip per step.
//!
//! At most [`MAX_OPEN_DATABASES`] database files are held open at once; past
//! that, opening another evicts the least-recently-used file with no
//! outstanding reference (no connection checked out to it).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use idb_codec::KeyPath;
use idb_codec::key::KeyRange;
use percent_encoding::{NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use crate::backend::BackendTx;
use crate::{
    Backend, BackendCursor, BackendError, DatabaseMetadata, Direction, IndexMetadata,
    StoreMetadata, TxMode,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS _idb_database (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    version INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS _idb_stores (
    store_name TEXT PRIMARY KEY,
    key_path TEXT,
    auto_increment INTEGER NOT NULL,
    current_key REAL NOT NULL
);
CREATE TABLE IF NOT EXISTS _idb_indexes (
    store_name TEXT NOT NULL,
    index_name TEXT NOT NULL,
    key_path TEXT,
    is_unique INTEGER NOT NULL,
    multi_entry INTEGER NOT NULL,
    PRIMARY KEY (store_name, index_name),
    FOREIGN KEY (store_name) REFERENCES _idb_stores(store_name) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS _idb_records (
    store_name TEXT NOT NULL,
    key BLOB NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (store_name, key),
    FOREIGN KEY (store_name) REFERENCES _idb_stores(store_name) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS _idb_index_entries (
    store_name TEXT NOT NULL,
    index_name TEXT NOT NULL,
    index_key BLOB NOT NULL,
    primary_key BLOB NOT NULL,
    PRIMARY KEY (store_name, index_name, index_key, primary_key),
    FOREIGN KEY (store_name, index_name) REFERENCES _idb_indexes(store_name, index_name) ON DELETE CASCADE
);
";

/// How many distinct database files this backend keeps open at once.
const MAX_OPEN_DATABASES: usize = 50;
const MAX_POOLED_CONNECTIONS: usize = 8;
const MAX_AUTO_INCREMENT: f64 = 9_007_199_254_740_992.0; // 2^53

fn db_file_name(name: &str) -> String {
    format!("{}.sqlite", utf8_percent_encode(name, NON_ALPHANUMERIC))
}

/// Where one database's file actually lives.
enum Target {
    /// A real file on disk at this path.
    File(PathBuf),
    /// A named, shared-cache in-memory database. Lost the moment every
    /// connection to it closes, which is why [`Registry`] never evicts
    /// these.
    Memory(String),
}

struct PooledConn {
    conn: Connection,
    last_used: Instant,
}

/// A pool of connections to exactly one database file (or one in-memory
/// database).
struct ConnectionPool {
    target: Target,
    idle: Mutex<Vec<PooledConn>>,
}

impl ConnectionPool {
    fn open(target: Target) -> Result<Self, BackendError> {
        let pool = ConnectionPool {
            target,
            idle: Mutex::new(Vec::new()),
        };
        // Run the schema migration eagerly so the first real acquire never pays for it.
        let conn = pool.open_connection()?;
        pool.idle.lock().unwrap().push(PooledConn {
            conn,
            last_used: Instant::now(),
        });
        Ok(pool)
    }

    fn open_connection(&self) -> Result<Connection, BackendError> {
        let conn = match &self.target {
            Target::File(path) => {
                let conn = Connection::open(path).map_err(|e| BackendError::Io(e.to_string()))?;
                conn.pragma_update(None, "journal_mode", "WAL")
                    .map_err(|e| BackendError::Io(e.to_string()))?;
                conn
            }
            Target::Memory(uri) => Connection::open_with_flags(
                uri,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_URI,
            )
            .map_err(|e| BackendError::Io(e.to_string()))?,
        };
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| BackendError::Io(e.to_string()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| BackendError::Io(e.to_string()))?;
        conn.execute_batch(SCHEMA).map_err(|e| BackendError::Io(e.to_string()))?;
        Ok(conn)
    }

    fn acquire(&self) -> Result<Connection, BackendError> {
        if let Some(pooled) = self.idle.lock().unwrap().pop() {
            return Ok(pooled.conn);
        }
        self.open_connection()
    }

    fn release(&self, conn: Connection) {
        let mut idle = self.idle.lock().unwrap();
        idle.push(PooledConn {
            conn,
            last_used: Instant::now(),
        });
        if idle.len() > MAX_POOLED_CONNECTIONS {
            idle.sort_by_key(|p| p.last_used);
            let excess = idle.len() - MAX_POOLED_CONNECTIONS;
            idle.drain(0..excess);
        }
    }
}

/// Every currently-open database file, keyed by logical database name.
#[derive(Default)]
struct Registry {
    pools: HashMap<String, (Arc<ConnectionPool>, Instant)>,
}

impl Registry {
    fn get(&mut self, name: &str) -> Option<Arc<ConnectionPool>> {
        let (pool, last_used) = self.pools.get_mut(name)?;
        *last_used = Instant::now();
        Some(pool.clone())
    }

    /// Registers a freshly opened pool, evicting the oldest unreferenced
    /// entry first if this would push us over [`MAX_OPEN_DATABASES`].
    /// `evictable` is `false` for in-memory databases, which would lose
    /// their data if closed.
    fn insert(&mut self, name: String, pool: Arc<ConnectionPool>, evictable: bool) {
        if evictable {
            self.evict_excess();
        }
        self.pools.insert(name, (pool, Instant::now()));
    }

    fn remove(&mut self, name: &str) {
        self.pools.remove(name);
    }

    fn evict_excess(&mut self) {
        if self.pools.len() < MAX_OPEN_DATABASES {
            return;
        }
        let mut unreferenced: Vec<(String, Instant)> = self
            .pools
            .iter()
            .filter(|(_, (pool, _))| Arc::strong_count(pool) == 1)
            .map(|(name, (_, last_used))| (name.clone(), *last_used))
            .collect();
        unreferenced.sort_by_key(|(_, last_used)| *last_used);
        if let Some((name, _)) = unreferenced.first() {
            self.pools.remove(name);
        }
    }
}

/// Where this backend's database files live.
enum Root {
    Dir(PathBuf),
    Memory,
}

/// A durable storage backend keeping each logical database in its own
/// SQLite file.
#[derive(Clone)]
pub struct SqliteBackend {
    root: Arc<Root>,
    registry: Arc<Mutex<Registry>>,
}

impl SqliteBackend {
    /// Opens (creating if necessary) `dir` as the directory holding one
    /// SQLite file per database.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, BackendError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| BackendError::Io(e.to_string()))?;
        Ok(SqliteBackend {
            root: Arc::new(Root::Dir(dir.to_path_buf())),
            registry: Arc::new(Mutex::new(Registry::default())),
        })
    }

    /// Opens a backend whose databases live only in memory, useful for
    /// tests. Each database is a separate shared-cache SQLite database
    /// that disappears once this backend (and every connection derived
    /// from it) is dropped.
    pub fn open_in_memory() -> Result<Self, BackendError> {
        Ok(SqliteBackend {
            root: Arc::new(Root::Memory),
            registry: Arc::new(Mutex::new(Registry::default())),
        })
    }

    /// Looks up (or, if `create`, opens and registers) the pool for `name`.
    /// Returns `Ok(None)` when `create` is `false` and the database does
    /// not exist yet, so read-only metadata queries never conjure a file
    /// into existence.
    fn pool_for(&self, name: &str, create: bool) -> Result<Option<Arc<ConnectionPool>>, BackendError> {
        if let Some(pool) = self.registry.lock().unwrap().get(name) {
            return Ok(Some(pool));
        }
        match self.root.as_ref() {
            Root::Dir(dir) => {
                let path = dir.join(db_file_name(name));
                if !create && !path.exists() {
                    return Ok(None);
                }
                let pool = Arc::new(ConnectionPool::open(Target::File(path))?);
                self.registry.lock().unwrap().insert(name.to_string(), pool.clone(), true);
                Ok(Some(pool))
            }
            Root::Memory => {
                if !create {
                    return Ok(None);
                }
                let uri = format!("file:idb-{}?mode=memory&cache=shared", utf8_percent_encode(name, NON_ALPHANUMERIC));
                let pool = Arc::new(ConnectionPool::open(Target::Memory(uri))?);
                self.registry.lock().unwrap().insert(name.to_string(), pool.clone(), false);
                Ok(Some(pool))
            }
        }
    }
}

fn keypath_to_text(path: &KeyPath) -> Option<String> {
    match path {
        KeyPath::None => None,
        KeyPath::Single(p) => Some(format!("s:{p}")),
        KeyPath::Sequence(paths) => Some(format!("q:{}", paths.join("\u{1f}"))),
    }
}

fn text_to_keypath(text: Option<String>) -> KeyPath {
    match text {
        None => KeyPath::None,
        Some(text) => match text.split_once(':') {
            Some(("s", rest)) => KeyPath::Single(rest.to_string()),
            Some(("q", rest)) => {
                KeyPath::Sequence(rest.split('\u{1f}').map(str::to_string).collect())
            }
            _ => KeyPath::None,
        },
    }
}

fn map_sql_err(e: rusqlite::Error) -> BackendError {
    BackendError::Io(e.to_string())
}

fn finished_err() -> BackendError {
    BackendError::Corrupt("transaction already committed or aborted".into())
}

#[async_trait]
impl Backend for SqliteBackend {
    type Tx = SqliteTx;

    async fn committed_version(&self, name: &str) -> Result<u64, BackendError> {
        let Some(pool) = self.pool_for(name, false)? else {
            return Ok(0);
        };
        let conn = pool.acquire()?;
        let version: Option<i64> = conn
            .query_row("SELECT version FROM _idb_database WHERE id = 0", [], |row| row.get(0))
            .optional()
            .map_err(map_sql_err)?;
        pool.release(conn);
        Ok(version.unwrap_or(0) as u64)
    }

    async fn metadata(&self, name: &str) -> Result<DatabaseMetadata, BackendError> {
        let Some(pool) = self.pool_for(name, false)? else {
            return Ok(DatabaseMetadata {
                name: name.to_string(),
                version: 0,
                stores: Vec::new(),
                indexes: Vec::new(),
            });
        };
        let conn = pool.acquire()?;
        let version = conn
            .query_row("SELECT version FROM _idb_database WHERE id = 0", [], |row| row.get::<_, i64>(0))
            .optional()
            .map_err(map_sql_err)?
            .unwrap_or(0) as u64;

        let mut stores = Vec::new();
        {
            let mut stmt = conn
                .prepare("SELECT store_name, key_path, auto_increment, current_key FROM _idb_stores")
                .map_err(map_sql_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(StoreMetadata {
                        name: row.get(0)?,
                        key_path: text_to_keypath(row.get(1)?),
                        auto_increment: row.get::<_, i64>(2)? != 0,
                        current_key: row.get(3)?,
                    })
                })
                .map_err(map_sql_err)?;
            for row in rows {
                stores.push(row.map_err(map_sql_err)?);
            }
        }

        let mut indexes = Vec::new();
        {
            let mut stmt = conn
                .prepare("SELECT store_name, index_name, key_path, is_unique, multi_entry FROM _idb_indexes")
                .map_err(map_sql_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(IndexMetadata {
                        store_name: row.get(0)?,
                        name: row.get(1)?,
                        key_path: text_to_keypath(row.get(2)?),
                        unique: row.get::<_, i64>(3)? != 0,
                        multi_entry: row.get::<_, i64>(4)? != 0,
                    })
                })
                .map_err(map_sql_err)?;
            for row in rows {
                indexes.push(row.map_err(map_sql_err)?);
            }
        }

        pool.release(conn);
        Ok(DatabaseMetadata {
            name: name.to_string(),
            version,
            stores,
            indexes,
        })
    }

    async fn list_databases(&self) -> Result<Vec<(String, u64)>, BackendError> {
        let names: Vec<String> = match self.root.as_ref() {
            Root::Dir(dir) => {
                let mut names = Vec::new();
                let entries = match std::fs::read_dir(dir) {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                    Err(e) => return Err(BackendError::Io(e.to_string())),
                };
                for entry in entries {
                    let entry = entry.map_err(|e| BackendError::Io(e.to_string()))?;
                    let file_name = entry.file_name();
                    let Some(stem) = file_name.to_str().and_then(|n| n.strip_suffix(".sqlite")) else {
                        continue;
                    };
                    let Ok(name) = percent_decode_str(stem).decode_utf8() else {
                        continue;
                    };
                    names.push(name.into_owned());
                }
                names
            }
            Root::Memory => self.registry.lock().unwrap().pools.keys().cloned().collect(),
        };

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let version = self.committed_version(&name).await?;
            out.push((name, version));
        }
        Ok(out)
    }

    async fn delete_database(&self, name: &str) -> Result<(), BackendError> {
        self.registry.lock().unwrap().remove(name);
        if let Root::Dir(dir) = self.root.as_ref() {
            let path = dir.join(db_file_name(name));
            for candidate in [path.clone(), with_suffix(&path, "-wal"), with_suffix(&path, "-shm")] {
                match std::fs::remove_file(&candidate) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(BackendError::Io(e.to_string())),
                }
            }
        }
        Ok(())
    }

    async fn begin_transaction(
        &self,
        name: &str,
        _scope: &[String],
        mode: TxMode,
    ) -> Result<Self::Tx, BackendError> {
        let pool = self.pool_for(name, true)?.expect("pool_for(create = true) always returns Some");
        let conn = pool.acquire()?;
        conn.execute("INSERT OR IGNORE INTO _idb_database (id, version) VALUES (0, 0)", [])
            .map_err(map_sql_err)?;
        let begin_sql = match mode {
            TxMode::ReadOnly => "BEGIN DEFERRED",
            TxMode::ReadWrite | TxMode::VersionChange => "BEGIN IMMEDIATE",
        };
        conn.execute_batch(begin_sql).map_err(map_sql_err)?;
        Ok(SqliteTx {
            pool,
            conn: Arc::new(Mutex::new(Some(conn))),
            finished: false,
        })
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// A transaction against a [`SqliteBackend`].
///
/// `conn` becomes `None` once the transaction has committed or aborted; any
/// cursor still holding this `Arc` simply starts erring on `advance`.
pub struct SqliteTx {
    pool: Arc<ConnectionPool>,
    conn: Arc<Mutex<Option<Connection>>>,
    finished: bool,
}

impl SqliteTx {
    fn with_conn<R>(
        &self,
        f: impl FnOnce(&Connection) -> Result<R, BackendError>,
    ) -> Result<R, BackendError> {
        let guard = self.conn.lock().unwrap();
        let conn = guard.as_ref().ok_or_else(finished_err)?;
        f(conn)
    }

    /// Returns the underlying connection to the pool, unless a cursor opened
    /// from this transaction still holds a reference to it.
    fn release_connection(&mut self) {
        if let Some(conn) = self.conn.lock().unwrap().take() {
            self.pool.release(conn);
        }
    }
}

impl BackendTx for SqliteTx {
    fn create_object_store(
        &mut self,
        name: &str,
        key_path: KeyPath,
        auto_increment: bool,
    ) -> Result<(), BackendError> {
        self.with_conn(|conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO _idb_stores (store_name, key_path, auto_increment, current_key) \
                     VALUES (?1, ?2, ?3, 0.0)",
                    params![name, keypath_to_text(&key_path), auto_increment as i64],
                )
                .map_err(map_sql_err)?;
            if inserted == 0 {
                return Err(BackendError::Constraint(format!(
                    "object store {name:?} already exists"
                )));
            }
            Ok(())
        })
    }

    fn delete_object_store(&mut self, name: &str) -> Result<(), BackendError> {
        self.with_conn(|conn| {
            let deleted = conn
                .execute("DELETE FROM _idb_stores WHERE store_name = ?1", params![name])
                .map_err(map_sql_err)?;
            if deleted == 0 {
                return Err(BackendError::NotFound(format!("object store {name:?}")));
            }
            Ok(())
        })
    }

    fn rename_object_store(&mut self, name: &str, new_name: &str) -> Result<(), BackendError> {
        self.with_conn(|conn| {
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM _idb_stores WHERE store_name = ?1",
                    params![new_name],
                    |_| Ok(true),
                )
                .optional()
                .map_err(map_sql_err)?
                .unwrap_or(false);
            if exists {
                return Err(BackendError::Constraint(format!(
                    "object store {new_name:?} already exists"
                )));
            }
            let updated = conn
                .execute(
                    "UPDATE _idb_stores SET store_name = ?2 WHERE store_name = ?1",
                    params![name, new_name],
                )
                .map_err(map_sql_err)?;
            if updated == 0 {
                return Err(BackendError::NotFound(format!("object store {name:?}")));
            }
            conn.execute(
                "UPDATE _idb_indexes SET store_name = ?2 WHERE store_name = ?1",
                params![name, new_name],
            )
            .map_err(map_sql_err)?;
            conn.execute(
                "UPDATE _idb_records SET store_name = ?2 WHERE store_name = ?1",
                params![name, new_name],
            )
            .map_err(map_sql_err)?;
            conn.execute(
                "UPDATE _idb_index_entries SET store_name = ?2 WHERE store_name = ?1",
                params![name, new_name],
            )
            .map_err(map_sql_err)?;
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
        self.with_conn(|conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO _idb_indexes \
                     (store_name, index_name, key_path, is_unique, multi_entry) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![store, name, keypath_to_text(&key_path), unique as i64, multi_entry as i64],
                )
                .map_err(map_sql_err)?;
            if inserted == 0 {
                return Err(BackendError::Constraint(format!(
                    "index {name:?} already exists"
                )));
            }
            Ok(())
        })
    }

    fn delete_index(&mut self, store: &str, name: &str) -> Result<(), BackendError> {
        self.with_conn(|conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM _idb_indexes WHERE store_name = ?1 AND index_name = ?2",
                    params![store, name],
                )
                .map_err(map_sql_err)?;
            if deleted == 0 {
                return Err(BackendError::NotFound(format!("index {name:?}")));
            }
            Ok(())
        })
    }

    fn rename_index(&mut self, store: &str, name: &str, new_name: &str) -> Result<(), BackendError> {
        self.with_conn(|conn| {
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM _idb_indexes WHERE store_name = ?1 AND index_name = ?2",
                    params![store, new_name],
                    |_| Ok(true),
                )
                .optional()
                .map_err(map_sql_err)?
                .unwrap_or(false);
            if exists {
                return Err(BackendError::Constraint(format!(
                    "index {new_name:?} already exists"
                )));
            }
            let updated = conn
                .execute(
                    "UPDATE _idb_indexes SET index_name = ?3 WHERE store_name = ?1 AND index_name = ?2",
                    params![store, name, new_name],
                )
                .map_err(map_sql_err)?;
            if updated == 0 {
                return Err(BackendError::NotFound(format!("index {name:?}")));
            }
            conn.execute(
                "UPDATE _idb_index_entries SET index_name = ?3 WHERE store_name = ?1 AND index_name = ?2",
                params![store, name, new_name],
            )
            .map_err(map_sql_err)?;
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
        self.with_conn(|conn| {
            let unique: i64 = conn
                .query_row(
                    "SELECT is_unique FROM _idb_indexes WHERE store_name = ?1 AND index_name = ?2",
                    params![store, index],
                    |row| row.get(0),
                )
                .map_err(map_sql_err)?;
            if unique != 0 {
                let clashes: bool = conn
                    .query_row(
                        "SELECT 1 FROM _idb_index_entries \
                         WHERE store_name = ?1 AND index_name = ?2 AND index_key = ?3",
                        params![store, index, index_key],
                        |_| Ok(true),
                    )
                    .optional()
                    .map_err(map_sql_err)?
                    .unwrap_or(false);
                if clashes {
                    return Err(BackendError::Constraint(format!(
                        "unique index {index:?} already has an entry for this key"
                    )));
                }
            }
            conn.execute(
                "INSERT INTO _idb_index_entries (store_name, index_name, index_key, primary_key) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![store, index, index_key, primary_key],
            )
            .map_err(map_sql_err)?;
            Ok(())
        })
    }

    fn index_delete_for_primary_key(
        &mut self,
        store: &str,
        index: &str,
        primary_key: &[u8],
    ) -> Result<(), BackendError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM _idb_index_entries WHERE store_name = ?1 AND index_name = ?2 AND primary_key = ?3",
                params![store, index, primary_key],
            )
            .map_err(map_sql_err)?;
            Ok(())
        })
    }

    fn get(&mut self, store: &str, key: &[u8]) -> Result<Option<Vec<u8>>, BackendError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM _idb_records WHERE store_name = ?1 AND key = ?2",
                params![store, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_sql_err)
        })
    }

    fn get_all(
        &mut self,
        store: &str,
        range: Option<&KeyRange>,
        limit: Option<u32>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, BackendError> {
        self.with_conn(|conn| {
            let (clause, mut bind) = range_clause("key", range);
            let mut sql =
                format!("SELECT key, value FROM _idb_records WHERE store_name = ?1 {clause} ORDER BY key ASC");
            if let Some(limit) = limit {
                sql.push_str(&format!(" LIMIT {limit}"));
            }
            let mut stmt = conn.prepare(&sql).map_err(map_sql_err)?;
            let mut params: Vec<&dyn rusqlite::ToSql> = vec![&store];
            params.append(&mut bind);
            let rows = stmt
                .query_map(params.as_slice(), |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(map_sql_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(map_sql_err)
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
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO _idb_records (store_name, key, value) VALUES (?1, ?2, ?3) \
                 ON CONFLICT (store_name, key) DO UPDATE SET value = excluded.value",
                params![store, key, value],
            )
            .map_err(map_sql_err)?;
            Ok(())
        })
    }

    fn add(&mut self, store: &str, key: Vec<u8>, value: Vec<u8>) -> Result<(), BackendError> {
        self.with_conn(|conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO _idb_records (store_name, key, value) VALUES (?1, ?2, ?3)",
                    params![store, key, value],
                )
                .map_err(map_sql_err)?;
            if inserted == 0 {
                return Err(BackendError::Constraint("key already exists".into()));
            }
            Ok(())
        })
    }

    fn delete(&mut self, store: &str, range: &KeyRange) -> Result<(), BackendError> {
        self.with_conn(|conn| {
            let (clause, mut bind) = range_clause("key", Some(range));
            let sql = format!("DELETE FROM _idb_records WHERE store_name = ?1 {clause}");
            let mut params: Vec<&dyn rusqlite::ToSql> = vec![&store];
            params.append(&mut bind);
            conn.execute(&sql, params.as_slice()).map_err(map_sql_err)?;
            Ok(())
        })
    }

    fn clear(&mut self, store: &str) -> Result<(), BackendError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM _idb_records WHERE store_name = ?1", params![store])
                .map_err(map_sql_err)?;
            Ok(())
        })
    }

    fn count(&mut self, store: &str, range: Option<&KeyRange>) -> Result<u64, BackendError> {
        self.with_conn(|conn| {
            let (clause, mut bind) = range_clause("key", range);
            let sql = format!("SELECT COUNT(*) FROM _idb_records WHERE store_name = ?1 {clause}");
            let mut params: Vec<&dyn rusqlite::ToSql> = vec![&store];
            params.append(&mut bind);
            let count: i64 = conn
                .query_row(&sql, params.as_slice(), |row| row.get(0))
                .map_err(map_sql_err)?;
            Ok(count as u64)
        })
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
        self.with_conn(|conn| {
            let (clause, mut bind) = range_clause("index_key", Some(range));
            let sql = format!(
                "SELECT primary_key FROM _idb_index_entries \
                 WHERE store_name = ?1 AND index_name = ?2 {clause} \
                 ORDER BY index_key ASC, primary_key ASC LIMIT 1"
            );
            let mut params: Vec<&dyn rusqlite::ToSql> = vec![&store, &index];
            params.append(&mut bind);
            conn.query_row(&sql, params.as_slice(), |row| row.get(0))
                .optional()
                .map_err(map_sql_err)
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
            .map(|pk| self.get(store, &pk).map(|v| v.unwrap_or_default()))
            .collect()
    }

    fn index_get_all_keys(
        &mut self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
        limit: Option<u32>,
    ) -> Result<Vec<Vec<u8>>, BackendError> {
        self.with_conn(|conn| {
            let (clause, mut bind) = range_clause("index_key", range);
            let mut sql = format!(
                "SELECT primary_key FROM _idb_index_entries \
                 WHERE store_name = ?1 AND index_name = ?2 {clause} \
                 ORDER BY index_key ASC, primary_key ASC"
            );
            if let Some(limit) = limit {
                sql.push_str(&format!(" LIMIT {limit}"));
            }
            let mut stmt = conn.prepare(&sql).map_err(map_sql_err)?;
            let mut params: Vec<&dyn rusqlite::ToSql> = vec![&store, &index];
            params.append(&mut bind);
            let rows = stmt
                .query_map(params.as_slice(), |row| row.get(0))
                .map_err(map_sql_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(map_sql_err)
        })
    }

    fn index_count(
        &mut self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
    ) -> Result<u64, BackendError> {
        self.with_conn(|conn| {
            let (clause, mut bind) = range_clause("index_key", range);
            let sql = format!(
                "SELECT COUNT(*) FROM _idb_index_entries WHERE store_name = ?1 AND index_name = ?2 {clause}"
            );
            let mut params: Vec<&dyn rusqlite::ToSql> = vec![&store, &index];
            params.append(&mut bind);
            let count: i64 = conn
                .query_row(&sql, params.as_slice(), |row| row.get(0))
                .map_err(map_sql_err)?;
            Ok(count as u64)
        })
    }

    fn open_cursor(
        &mut self,
        store: &str,
        range: Option<&KeyRange>,
        direction: Direction,
    ) -> Result<Option<Box<dyn BackendCursor>>, BackendError> {
        SqliteCursor::open_store(self.conn.clone(), store.to_string(), range.cloned(), direction, true)
    }

    fn open_key_cursor(
        &mut self,
        store: &str,
        range: Option<&KeyRange>,
        direction: Direction,
    ) -> Result<Option<Box<dyn BackendCursor>>, BackendError> {
        SqliteCursor::open_store(self.conn.clone(), store.to_string(), range.cloned(), direction, false)
    }

    fn open_index_cursor(
        &mut self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
        direction: Direction,
    ) -> Result<Option<Box<dyn BackendCursor>>, BackendError> {
        SqliteCursor::open_index(
            self.conn.clone(),
            store.to_string(),
            index.to_string(),
            range.cloned(),
            direction,
            true,
        )
    }

    fn open_index_key_cursor(
        &mut self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
        direction: Direction,
    ) -> Result<Option<Box<dyn BackendCursor>>, BackendError> {
        SqliteCursor::open_index(
            self.conn.clone(),
            store.to_string(),
            index.to_string(),
            range.cloned(),
            direction,
            false,
        )
    }

    fn next_auto_increment_key(&mut self, store: &str) -> Result<f64, BackendError> {
        self.with_conn(|conn| {
            let current: f64 = conn
                .query_row(
                    "SELECT current_key FROM _idb_stores WHERE store_name = ?1",
                    params![store],
                    |row| row.get(0),
                )
                .map_err(map_sql_err)?;
            if current >= MAX_AUTO_INCREMENT {
                return Err(BackendError::GeneratorExhausted);
            }
            let next = current + 1.0;
            conn.execute(
                "UPDATE _idb_stores SET current_key = ?2 WHERE store_name = ?1",
                params![store, next],
            )
            .map_err(map_sql_err)?;
            Ok(next)
        })
    }

    fn maybe_update_key_generator(&mut self, store: &str, key: f64) -> Result<(), BackendError> {
        self.with_conn(|conn| {
            let current: f64 = conn
                .query_row(
                    "SELECT current_key FROM _idb_stores WHERE store_name = ?1",
                    params![store],
                    |row| row.get(0),
                )
                .map_err(map_sql_err)?;
            let candidate = (key.floor() + 1.0).min(MAX_AUTO_INCREMENT);
            if candidate > current {
                conn.execute(
                    "UPDATE _idb_stores SET current_key = ?2 WHERE store_name = ?1",
                    params![store, candidate],
                )
                .map_err(map_sql_err)?;
            }
            Ok(())
        })
    }

    fn commit(mut self: Box<Self>) -> Result<(), BackendError> {
        self.finished = true;
        self.with_conn(|conn| {
            let version: i64 = conn
                .query_row("SELECT version FROM _idb_database WHERE id = 0", [], |row| row.get(0))
                .map_err(map_sql_err)?;
            conn.execute("UPDATE _idb_database SET version = ?1 WHERE id = 0", params![version])
                .map_err(map_sql_err)?;
            conn.execute_batch("COMMIT").map_err(map_sql_err)
        })?;
        self.release_connection();
        Ok(())
    }

    fn abort(mut self: Box<Self>) -> Result<(), BackendError> {
        self.finished = true;
        self.with_conn(|conn| conn.execute_batch("ROLLBACK").map_err(map_sql_err))?;
        self.release_connection();
        Ok(())
    }
}

impl Drop for SqliteTx {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("sqlite transaction dropped without commit or abort");
        }
    }
}

/// Builds a `AND column <op> ?` clause (or the empty string) plus its bind
/// parameters for a key range. Returned parameters must be appended, in
/// order, right after the caller's own positional parameters.
fn range_clause<'a>(
    column: &'static str,
    range: Option<&'a KeyRange>,
) -> (String, Vec<&'a dyn rusqlite::ToSql>) {
    let Some(range) = range else {
        return (String::new(), Vec::new());
    };
    let mut clause = String::new();
    let mut bind: Vec<&dyn rusqlite::ToSql> = Vec::new();
    if let Some(lower) = range.lower() {
        let op = if range.lower_open() { ">" } else { ">=" };
        clause.push_str(&format!(" AND {column} {op} ?"));
        bind.push(lower);
    }
    if let Some(upper) = range.upper() {
        let op = if range.upper_open() { "<" } else { "<=" };
        clause.push_str(&format!(" AND {column} {op} ?"));
        bind.push(upper);
    }
    (clause, bind)
}

struct SqliteCursor {
    conn: Arc<Mutex<Option<Connection>>>,
    store: String,
    index: Option<String>,
    range: Option<KeyRange>,
    direction: Direction,
    with_value: bool,
    key: Vec<u8>,
    primary_key: Vec<u8>,
    value: Option<Vec<u8>>,
}

impl SqliteCursor {
    fn open_store(
        conn: Arc<Mutex<Option<Connection>>>,
        store: String,
        range: Option<KeyRange>,
        direction: Direction,
        with_value: bool,
    ) -> Result<Option<Box<dyn BackendCursor>>, BackendError> {
        let first = {
            let guard = conn.lock().unwrap();
            let conn = guard.as_ref().ok_or_else(finished_err)?;
            query_store_row(conn, &store, range.as_ref(), direction, None, with_value)?
        };
        Ok(first.map(|(key, value)| {
            Box::new(SqliteCursor {
                conn,
                store,
                index: None,
                range,
                direction,
                with_value,
                primary_key: key.clone(),
                key,
                value,
            }) as Box<dyn BackendCursor>
        }))
    }

    fn open_index(
        conn: Arc<Mutex<Option<Connection>>>,
        store: String,
        index: String,
        range: Option<KeyRange>,
        direction: Direction,
        with_value: bool,
    ) -> Result<Option<Box<dyn BackendCursor>>, BackendError> {
        let first = {
            let guard = conn.lock().unwrap();
            let conn = guard.as_ref().ok_or_else(finished_err)?;
            query_index_row(conn, &store, &index, range.as_ref(), direction, None, with_value)?
        };
        Ok(first.map(|(key, primary_key, value)| {
            Box::new(SqliteCursor {
                conn,
                store,
                index: Some(index),
                range,
                direction,
                with_value,
                key,
                primary_key,
                value,
            }) as Box<dyn BackendCursor>
        }))
    }
}

impl BackendCursor for SqliteCursor {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn primary_key(&self) -> &[u8] {
        &self.primary_key
    }

    fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    fn advance(&mut self) -> Result<bool, BackendError> {
        let guard = self.conn.lock().unwrap();
        let conn = guard.as_ref().ok_or_else(finished_err)?;
        let next = match &self.index {
            None => query_store_row(
                conn,
                &self.store,
                self.range.as_ref(),
                self.direction,
                Some(&self.key),
                self.with_value,
            )?
            .map(|(k, v)| (k.clone(), k, v)),
            Some(index) => query_index_row(
                conn,
                &self.store,
                index,
                self.range.as_ref(),
                self.direction,
                Some((&self.key, &self.primary_key)),
                self.with_value,
            )?,
        };
        match next {
            Some((key, primary_key, value)) => {
                self.key = key;
                self.primary_key = primary_key;
                self.value = value;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn query_store_row(
    conn: &Connection,
    store: &str,
    range: Option<&KeyRange>,
    direction: Direction,
    after: Option<&[u8]>,
    with_value: bool,
) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>, BackendError> {
    let (range_sql, mut range_bind) = range_clause("key", range);
    let (pos_op, order) = if direction.is_forward() {
        (">", "ASC")
    } else {
        ("<", "DESC")
    };
    let columns = if with_value { "key, value" } else { "key, NULL" };
    let mut sql = format!("SELECT {columns} FROM _idb_records WHERE store_name = ?1 {range_sql}");
    let mut bind: Vec<&dyn rusqlite::ToSql> = vec![&store];
    bind.append(&mut range_bind);
    if let Some(after) = after {
        sql.push_str(&format!(" AND key {pos_op} ?"));
        bind.push(&after);
    }
    sql.push_str(&format!(" ORDER BY key {order} LIMIT 1"));
    conn.query_row(&sql, bind.as_slice(), |row| Ok((row.get(0)?, row.get(1)?)))
        .optional()
        .map_err(map_sql_err)
}

#[allow(clippy::too_many_arguments)]
fn query_index_row(
    conn: &Connection,
    store: &str,
    index: &str,
    range: Option<&KeyRange>,
    direction: Direction,
    after: Option<(&[u8], &[u8])>,
    with_value: bool,
) -> Result<Option<(Vec<u8>, Vec<u8>, Option<Vec<u8>>)>, BackendError> {
    let (range_sql, mut range_bind) = range_clause("index_key", range);
    let (pos_op, order) = if direction.is_forward() {
        (">", "ASC")
    } else {
        ("<", "DESC")
    };
    let mut sql = format!(
        "SELECT index_key, primary_key FROM _idb_index_entries WHERE store_name = ?1 AND index_name = ?2 {range_sql}"
    );
    let mut bind: Vec<&dyn rusqlite::ToSql> = vec![&store, &index];
    bind.append(&mut range_bind);
    if let Some((after_key, after_primary)) = after {
        if direction.is_unique() {
            sql.push_str(&format!(" AND index_key {pos_op} ?"));
            bind.push(&after_key);
        } else {
            sql.push_str(&format!(
                " AND (index_key {pos_op} ? OR (index_key = ? AND primary_key {pos_op} ?))"
            ));
            bind.push(&after_key);
            bind.push(&after_key);
            bind.push(&after_primary);
        }
    }
    sql.push_str(&format!(" ORDER BY index_key {order}, primary_key {order} LIMIT 1"));
    let row: Option<(Vec<u8>, Vec<u8>)> = conn
        .query_row(&sql, bind.as_slice(), |row| Ok((row.get(0)?, row.get(1)?)))
        .optional()
        .map_err(map_sql_err)?;
    match row {
        None => Ok(None),
        Some((index_key, primary_key)) => {
            let value = if with_value {
                conn.query_row(
                    "SELECT value FROM _idb_records WHERE store_name = ?1 AND key = ?2",
                    params![store, primary_key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(map_sql_err)?
            } else {
                None
            };
            Ok(Some((index_key, primary_key, value)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idb_codec::Key;

    fn backend() -> SqliteBackend {
        SqliteBackend::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn it_inserts_and_reads_back_a_record() {
        let backend = backend();
        let mut tx = backend
            .begin_transaction("db", &[], TxMode::ReadWrite)
            .await
            .unwrap();
        tx.create_object_store("s", KeyPath::None, false).unwrap();
        tx.add("s", Key::Number(1.0).encode(), b"a".to_vec()).unwrap();
        let value = tx.get("s", &Key::Number(1.0).encode()).unwrap();
        assert_eq!(value, Some(b"a".to_vec()));
        Box::new(tx).commit().unwrap();
    }

    #[tokio::test]
    async fn abort_discards_every_write() {
        let backend = backend();
        let mut tx = backend
            .begin_transaction("db", &[], TxMode::ReadWrite)
            .await
            .unwrap();
        tx.create_object_store("s", KeyPath::None, false).unwrap();
        Box::new(tx).commit().unwrap();

        let mut tx = backend
            .begin_transaction("db", &[], TxMode::ReadWrite)
            .await
            .unwrap();
        tx.add("s", Key::Number(1.0).encode(), b"a".to_vec()).unwrap();
        Box::new(tx).abort().unwrap();

        let mut tx = backend
            .begin_transaction("db", &[], TxMode::ReadOnly)
            .await
            .unwrap();
        assert_eq!(tx.count("s", None).unwrap(), 0);
        Box::new(tx).abort().unwrap();
    }

    #[tokio::test]
    async fn a_live_cursor_walks_records_in_key_order() {
        let backend = backend();
        let mut tx = backend
            .begin_transaction("db", &[], TxMode::ReadWrite)
            .await
            .unwrap();
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

    #[tokio::test]
    async fn two_databases_in_the_same_directory_land_in_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::open(dir.path()).unwrap();

        let mut accounts = backend.begin_transaction("accounts", &[], TxMode::ReadWrite).await.unwrap();
        accounts.create_object_store("users", KeyPath::None, false).unwrap();
        accounts.add("users", Key::Number(1.0).encode(), b"alice".to_vec()).unwrap();
        Box::new(accounts).commit().unwrap();

        let mut billing = backend.begin_transaction("billing", &[], TxMode::ReadWrite).await.unwrap();
        billing.create_object_store("invoices", KeyPath::None, false).unwrap();
        Box::new(billing).commit().unwrap();

        assert!(dir.path().join("accounts.sqlite").exists());
        assert!(dir.path().join("billing.sqlite").exists());

        let mut invoices_tx = backend.begin_transaction("billing", &[], TxMode::ReadOnly).await.unwrap();
        // "users" only exists in accounts.sqlite; billing.sqlite has no rows for it at all.
        assert_eq!(invoices_tx.get("users", &Key::Number(1.0).encode()).unwrap(), None);
        Box::new(invoices_tx).abort().unwrap();

        let names: std::collections::HashSet<_> =
            backend.list_databases().await.unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, std::collections::HashSet::from(["accounts".to_string(), "billing".to_string()]));
    }

    #[tokio::test]
    async fn deleting_a_database_removes_its_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::open(dir.path()).unwrap();

        let tx = backend.begin_transaction("scratch", &[], TxMode::ReadWrite).await.unwrap();
        Box::new(tx).commit().unwrap();
        assert!(dir.path().join("scratch.sqlite").exists());

        backend.delete_database("scratch").await.unwrap();
        assert!(!dir.path().join("scratch.sqlite").exists());
        assert_eq!(backend.committed_version("scratch").await.unwrap(), 0);
    }
}
