//! A connection to one open database: schema cache, scheduler, and the
//! [`Connection::transaction`] entry point every store/index/cursor
//! operation is ultimately issued through.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use idb_common::Scheduler;
use idb_storage::{Backend, DatabaseMetadata, TxMode};

use crate::error::IdbError;
use crate::event::{Event, EventKind, EventTarget};
use crate::transaction::{Transaction, TxState};

/// An open handle to one named database.
///
/// Cheap to clone: every clone shares the same schema cache, scheduler, and
/// close flag. Obtained through [`crate::factory::Factory::open`], never
/// constructed directly.
pub struct Connection<B: Backend> {
    inner: Rc<ConnectionInner<B>>,
}

impl<B: Backend> Clone for Connection<B> {
    fn clone(&self) -> Self {
        Connection {
            inner: self.inner.clone(),
        }
    }
}

struct ConnectionInner<B: Backend> {
    backend: Arc<B>,
    runtime: Rc<tokio::runtime::Runtime>,
    name: String,
    metadata: RefCell<DatabaseMetadata>,
    scheduler: Rc<RefCell<Scheduler>>,
    events: Rc<EventTarget>,
    closed: Cell<bool>,
}

impl<B: Backend + 'static> Connection<B>
where
    B::Tx: 'static,
{
    pub(crate) fn new(
        backend: Arc<B>,
        runtime: Rc<tokio::runtime::Runtime>,
        name: String,
        metadata: DatabaseMetadata,
    ) -> Self {
        Connection {
            inner: Rc::new(ConnectionInner {
                backend,
                runtime,
                name,
                metadata: RefCell::new(metadata),
                scheduler: Rc::new(RefCell::new(Scheduler::new())),
                events: Rc::new(EventTarget::new()),
                closed: Cell::new(false),
            }),
        }
    }

    /// This connection's database name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The schema version currently in effect on this connection.
    pub fn version(&self) -> u64 {
        self.inner.metadata.borrow().version
    }

    /// The event target `versionchange` listeners register against.
    pub fn events(&self) -> &EventTarget {
        &self.inner.events
    }

    /// A cheap handle to this connection's event target, for a
    /// [`Transaction`] to keep as the next link in its
    /// request → transaction → database dispatch chain.
    pub(crate) fn events_handle(&self) -> Rc<EventTarget> {
        self.inner.events.clone()
    }

    /// Whether [`Self::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Closes this connection. Idempotent; does not affect a transaction
    /// already in flight on it.
    pub fn close(&self) {
        self.inner.closed.set(true);
    }

    /// Runs one transaction as a single scheduler task: opens a backend
    /// transaction over `store_names` (ignored for `VersionChange`, which
    /// always spans every store), runs `body` against it, then commits (or
    /// aborts, if `body` returned `Err` and the transaction is still active)
    /// before returning.
    pub fn transaction<R>(
        &self,
        store_names: &[&str],
        mode: TxMode,
        body: impl FnOnce(&Transaction) -> Result<R, IdbError>,
    ) -> Result<R, IdbError> {
        if self.inner.closed.get() {
            return Err(IdbError::InvalidState("connection is closed".into()));
        }

        let scope: Vec<String> = if mode == TxMode::VersionChange {
            self.inner
                .metadata
                .borrow()
                .stores
                .iter()
                .map(|s| s.name.clone())
                .collect()
        } else {
            let metadata = self.inner.metadata.borrow();
            for name in store_names {
                if metadata.store(name).is_none() {
                    return Err(IdbError::NotFound(format!("no object store named {name:?}")));
                }
            }
            store_names.iter().map(|s| s.to_string()).collect()
        };

        let backend_tx = self
            .inner
            .runtime
            .block_on(self.inner.backend.begin_transaction(&self.inner.name, &scope, mode))?;
        let txn = Transaction::new(
            Box::new(backend_tx),
            mode,
            scope,
            self.inner.metadata.borrow().clone(),
            self.inner.scheduler.clone(),
            self.events_handle(),
        );

        if mode == TxMode::VersionChange {
            let connection = self.clone();
            let txn_for_sync = txn.clone();
            txn.events().add_listener(EventKind::Complete, false, move |_event| {
                *connection.inner.metadata.borrow_mut() = txn_for_sync.metadata();
            });
        }

        let scheduler = self.inner.scheduler.clone();
        let txn_for_task = txn.clone();
        let body_result = scheduler.borrow_mut().run_task(move |_s| body(&txn_for_task));

        match &body_result {
            Ok(_) => txn.try_commit(),
            Err(_) => {
                if txn.state() == TxState::Active {
                    let _ = txn.abort();
                }
            }
        }
        body_result
    }

    pub(crate) fn fire_version_change(&self, old_version: u64, new_version: u64) {
        tracing::debug!(%old_version, %new_version, database = %self.inner.name, "dispatching versionchange");
        let event = Event::new(EventKind::VersionChange, false);
        EventTarget::dispatch_chain(&[self.inner.events.as_ref()], &event);
    }
}
