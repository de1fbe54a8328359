//! The open/delete coordinator: version negotiation and the
//! blocked/versionchange/upgradeneeded choreography around opening and
//! deleting a database.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use idb_storage::{Backend, TxMode};

use crate::connection::Connection;
use crate::error::IdbError;
use crate::transaction::Transaction;

/// How long [`Factory::open`] waits for blocking connections to close before
/// giving up.
const BLOCKED_OPEN_TIMEOUT: Duration = Duration::from_millis(200);
const BLOCKED_OPEN_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Coordinates opening and deleting databases against one backend, tracking
/// every connection it has handed out so that a version upgrade can warn
/// (and, if they don't close, refuse to proceed past) connections still
/// open on an older schema version.
pub struct Factory<B: Backend> {
    backend: Arc<B>,
    runtime: Rc<tokio::runtime::Runtime>,
    connections: RefCell<HashMap<String, Vec<Connection<B>>>>,
}

impl<B: Backend + 'static> Factory<B>
where
    B::Tx: 'static,
{
    /// Builds a coordinator over `backend`, with its own current-thread
    /// runtime for bridging the backend's async, database-level calls
    /// (`committed_version`, `metadata`, `begin_transaction`, ...) into this
    /// otherwise synchronous engine.
    pub fn new(backend: Arc<B>) -> Result<Self, IdbError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .map_err(|err| IdbError::InvalidState(err.to_string()))?;
        Ok(Factory {
            backend,
            runtime: Rc::new(runtime),
            connections: RefCell::new(HashMap::new()),
        })
    }

    /// Opens `name` at `version` (or its current committed version if
    /// `None`, defaulting a brand-new database to version 1), running
    /// `on_upgrade_needed` inside a version-change transaction whenever the
    /// requested version is newer than what is committed.
    ///
    /// If other connections to `name` are still open on an older version,
    /// each is sent a `versionchange` event, and this call blocks until
    /// every one of them closes (a listener may call
    /// [`Connection::close`] synchronously in response, or later from a
    /// reentrant call on the same thread) before proceeding to the upgrade.
    /// If they never close, this gives up after
    /// [`BLOCKED_OPEN_TIMEOUT`] and fails with [`IdbError::InvalidState`].
    pub fn open(
        &self,
        name: &str,
        version: Option<u64>,
        on_upgrade_needed: impl FnOnce(&Transaction, u64, u64) -> Result<(), IdbError>,
    ) -> Result<Connection<B>, IdbError> {
        self.prune_closed(name);

        let current_version = self.runtime.block_on(self.backend.committed_version(name))?;
        let requested_version = version.unwrap_or_else(|| current_version.max(1));
        if requested_version < current_version {
            return Err(IdbError::Version(format!(
                "requested version {requested_version} is older than the committed version {current_version}"
            )));
        }

        if requested_version > current_version {
            self.wait_for_blockers_to_close(name, current_version, requested_version)?;
        }

        let metadata = self.runtime.block_on(self.backend.metadata(name))?;
        let connection = Connection::new(self.backend.clone(), self.runtime.clone(), name.to_string(), metadata);

        if requested_version > current_version {
            connection.transaction(&[], TxMode::VersionChange, |txn| {
                on_upgrade_needed(txn, current_version, requested_version)?;
                txn.with_metadata_mut(|meta| meta.version = requested_version);
                Ok(())
            })?;
        }

        self.connections
            .borrow_mut()
            .entry(name.to_string())
            .or_default()
            .push(connection.clone());
        Ok(connection)
    }

    /// Deletes `name` entirely. Refuses with [`IdbError::InvalidState`] if
    /// any connection to it is still open, matching `deleteDatabase`'s
    /// blocked semantics.
    pub fn delete(&self, name: &str) -> Result<(), IdbError> {
        self.prune_closed(name);
        let still_open = self
            .connections
            .borrow()
            .get(name)
            .map(|conns| conns.iter().any(|c| !c.is_closed()))
            .unwrap_or(false);
        if still_open {
            return Err(IdbError::InvalidState(format!(
                "delete of {name:?} is blocked by an open connection"
            )));
        }
        self.runtime.block_on(self.backend.delete_database(name))?;
        self.connections.borrow_mut().remove(name);
        Ok(())
    }

    /// Every database name and committed version known to this backend.
    pub fn list_databases(&self) -> Result<Vec<(String, u64)>, IdbError> {
        Ok(self.runtime.block_on(self.backend.list_databases())?)
    }

    /// Fires `versionchange` on every open connection to `name` and blocks
    /// until all of them close, polling [`Connection::is_closed`].
    fn wait_for_blockers_to_close(&self, name: &str, old_version: u64, new_version: u64) -> Result<(), IdbError> {
        let blockers: Vec<Connection<B>> = self.connections.borrow().get(name).cloned().unwrap_or_default();
        if blockers.is_empty() {
            return Ok(());
        }
        for conn in &blockers {
            conn.fire_version_change(old_version, new_version);
        }
        let deadline = Instant::now() + BLOCKED_OPEN_TIMEOUT;
        loop {
            let still_open = blockers.iter().filter(|c| !c.is_closed()).count();
            if still_open == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(IdbError::InvalidState(format!(
                    "open of {name:?} at version {new_version} timed out waiting for {still_open} other open connection(s) to close"
                )));
            }
            std::thread::sleep(BLOCKED_OPEN_POLL_INTERVAL);
        }
    }

    fn prune_closed(&self, name: &str) {
        if let Some(conns) = self.connections.borrow_mut().get_mut(name) {
            conns.retain(|c| !c.is_closed());
        }
    }
}
