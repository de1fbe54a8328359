#![warn(missing_docs)]

//! Storage backends for the database engine.
//!
//! This crate defines the [`Backend`]/[`BackendTx`] abstraction the rest of
//! the engine is built against, plus two interchangeable implementations:
//! [`memory::MemoryBackend`], a sorted-array in-memory backend good for
//! tests and ephemeral databases, and [`sqlite::SqliteBackend`], a durable
//! backend that keeps each logical database in its own SQLite file, opened
//! through a capped, LRU-evicted pool of per-database connection handles.
//!
//! Backends see only encoded bytes: a key is whatever
//! [`idb_codec::Key::encode`] produced, a value is whatever
//! [`idb_codec::Value::encode`] produced. Ordering and round-tripping are
//! the codecs' problem; a backend just needs `memcmp` order over keys.

mod error;
pub use error::*;

mod types;
pub use types::*;

mod backend;
pub use backend::*;

pub mod memory;
pub mod sqlite;
