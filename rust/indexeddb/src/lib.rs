#![warn(missing_docs)]

//! An embeddable, spec-conformant IndexedDB-compatible database engine.
//!
//! The engine is entirely synchronous at the backend layer
//! ([`idb_storage::BackendTx`] has no suspension points of its own);
//! asynchrony is modeled as *deferred delivery* on top of
//! [`idb_common::Scheduler`]. [`Connection::transaction`] runs one
//! scheduler task: the backend call behind every [`Request`] executes
//! immediately, but its result is only delivered (and the transaction only
//! auto-commits) once the task's microtask queue drains.
//!
//! [`Factory`] is the entry point: it opens or deletes named databases
//! against a [`idb_storage::Backend`], running schema upgrades inside a
//! version-change transaction and coordinating the `versionchange`/blocked
//! handshake against any other connections still open on an older version.
//! A [`Connection`] then hands out [`ObjectStore`]/[`Index`]/[`Cursor`]
//! handles scoped to each [`Transaction`] it opens.

mod connection;
pub use connection::*;

mod cursor;
pub use cursor::*;

mod error;
pub use error::*;

mod event;
pub use event::*;

mod factory;
pub use factory::*;

mod index;
pub use index::*;

mod request;
pub use request::*;

mod store;
pub use store::*;

mod transaction;
pub use transaction::*;
