//! The request/transaction core: activation, auto-commit, abort rollback,
//! and holds.
//!
//! A transaction is live only while the task that created it is still
//! running, or a request issued on it is still pending. Every request
//! issued through [`Transaction::issue`] takes a hold for the lifetime of
//! its delivery microtask; once the last hold is released with the
//! transaction still [`TxState::Active`], it auto-commits.

use std::cell::RefCell;
use std::rc::Rc;

use idb_common::Scheduler;
use idb_codec::KeyPath;
use idb_storage::{BackendTx, DatabaseMetadata, StoreMetadata, TxMode};

use crate::error::IdbError;
use crate::event::{Event, EventKind, EventTarget};
use crate::index::Index;
use crate::request::{Request, RequestSource};
use crate::store::ObjectStore;

/// Where a transaction sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting new requests.
    Active,
    /// The initiating task and all holds have finished, but commit/abort
    /// has not yet run (a transitional state observed only mid-microtask).
    Inactive,
    /// Committed; every mutation is durable.
    Committed,
    /// Aborted; every mutation is undone.
    Aborted,
}

pub(crate) struct TransactionInner {
    pub(crate) backend_tx: Option<Box<dyn BackendTx>>,
    pub(crate) mode: TxMode,
    pub(crate) scope: Vec<String>,
    pub(crate) state: TxState,
    pub(crate) holds: usize,
    pub(crate) metadata: DatabaseMetadata,
    pub(crate) scheduler: Rc<RefCell<Scheduler>>,
    pub(crate) events: Rc<EventTarget>,
    /// The owning connection's event target, the next link in the
    /// request → transaction → database dispatch chain.
    pub(crate) connection_events: Rc<EventTarget>,
    pub(crate) pending_aborts: Vec<Rc<dyn Fn()>>,
    pub(crate) error: Option<IdbError>,
}

/// A handle to one transaction. Cheap to clone: every clone shares the same
/// underlying state.
#[derive(Clone)]
pub struct Transaction {
    pub(crate) inner: Rc<RefCell<TransactionInner>>,
}

impl Transaction {
    pub(crate) fn new(
        backend_tx: Box<dyn BackendTx>,
        mode: TxMode,
        scope: Vec<String>,
        metadata: DatabaseMetadata,
        scheduler: Rc<RefCell<Scheduler>>,
        connection_events: Rc<EventTarget>,
    ) -> Self {
        Transaction {
            inner: Rc::new(RefCell::new(TransactionInner {
                backend_tx: Some(backend_tx),
                mode,
                scope,
                state: TxState::Active,
                holds: 0,
                metadata,
                scheduler,
                events: Rc::new(EventTarget::new()),
                connection_events,
                pending_aborts: Vec::new(),
                error: None,
            })),
        }
    }

    /// The mode this transaction was opened in.
    pub fn mode(&self) -> TxMode {
        self.inner.borrow().mode
    }

    /// The current lifecycle state.
    pub fn state(&self) -> TxState {
        self.inner.borrow().state
    }

    /// The object store names this transaction may touch.
    pub fn scope(&self) -> Vec<String> {
        self.inner.borrow().scope.clone()
    }

    /// The event target `complete`/`abort` listeners register against.
    pub fn events(&self) -> std::cell::Ref<'_, EventTarget> {
        std::cell::Ref::map(self.inner.borrow(), |i| i.events.as_ref())
    }

    /// This transaction's own event target and its owning connection's, in
    /// outermost-ancestor-first order, for a caller (namely a
    /// [`Request`](crate::request::Request)) to extend into a full
    /// request → transaction → database dispatch chain.
    pub(crate) fn ancestor_events(&self) -> (Rc<EventTarget>, Rc<EventTarget>) {
        let inner = self.inner.borrow();
        (inner.connection_events.clone(), inner.events.clone())
    }

    /// Opens a handle to one of this transaction's in-scope object stores.
    pub fn object_store(&self, name: &str) -> Result<ObjectStore, IdbError> {
        let inner = self.inner.borrow();
        if inner.state != TxState::Active {
            return Err(IdbError::TransactionInactive);
        }
        if inner.mode != TxMode::VersionChange && !inner.scope.iter().any(|s| s == name) {
            return Err(IdbError::NotFound(format!(
                "object store {name:?} is not in this transaction's scope"
            )));
        }
        if inner.metadata.store(name).is_none() {
            return Err(IdbError::NotFound(format!("no object store named {name:?}")));
        }
        Ok(ObjectStore::new(self.clone(), name.to_string()))
    }

    /// Opens a handle to `index` on `store`, scoped to this transaction.
    pub fn index(&self, store: &str, index: &str) -> Result<Index, IdbError> {
        let object_store = self.object_store(store)?;
        object_store.index(index)
    }

    /// Registers a new, empty object store. Only valid on a version-change
    /// transaction.
    pub fn create_object_store(
        &self,
        name: &str,
        key_path: KeyPath,
        auto_increment: bool,
    ) -> Result<ObjectStore, IdbError> {
        if self.mode() != TxMode::VersionChange {
            return Err(IdbError::InvalidState(
                "object stores may only be created inside a version-change transaction".into(),
            ));
        }
        if self.inner.borrow().metadata.store(name).is_some() {
            return Err(IdbError::Constraint(format!(
                "an object store named {name:?} already exists"
            )));
        }
        let store_name = name.to_string();
        let path = key_path.clone();
        self.issue(RequestSource::Transaction, move |tx| {
            Ok(tx.create_object_store(&store_name, path.clone(), auto_increment)?)
        })?;
        self.with_metadata_mut(|meta| {
            meta.stores.push(StoreMetadata {
                name: name.to_string(),
                key_path,
                auto_increment,
                current_key: 1.0,
            });
        });
        self.object_store(name)
    }

    /// Deletes an object store and everything in it. Only valid on a
    /// version-change transaction.
    pub fn delete_object_store(&self, name: &str) -> Result<(), IdbError> {
        if self.mode() != TxMode::VersionChange {
            return Err(IdbError::InvalidState(
                "object stores may only be deleted inside a version-change transaction".into(),
            ));
        }
        let store_name = name.to_string();
        self.issue(RequestSource::Transaction, move |tx| Ok(tx.delete_object_store(&store_name)?))?;
        self.with_metadata_mut(|meta| {
            meta.stores.retain(|s| s.name != name);
            meta.indexes.retain(|i| i.store_name != name);
        });
        Ok(())
    }

    /// Renames an object store in place. Only valid on a version-change
    /// transaction.
    pub fn rename_object_store(&self, name: &str, new_name: &str) -> Result<(), IdbError> {
        if self.mode() != TxMode::VersionChange {
            return Err(IdbError::InvalidState(
                "object stores may only be renamed inside a version-change transaction".into(),
            ));
        }
        let store_name = name.to_string();
        let target_name = new_name.to_string();
        self.issue(RequestSource::Transaction, move |tx| {
            Ok(tx.rename_object_store(&store_name, &target_name)?)
        })?;
        self.with_metadata_mut(|meta| {
            if let Some(store) = meta.stores.iter_mut().find(|s| s.name == name) {
                store.name = new_name.to_string();
            }
            for index in meta.indexes.iter_mut().filter(|i| i.store_name == name) {
                index.store_name = new_name.to_string();
            }
        });
        Ok(())
    }

    pub(crate) fn metadata(&self) -> DatabaseMetadata {
        self.inner.borrow().metadata.clone()
    }

    pub(crate) fn with_metadata_mut<R>(&self, f: impl FnOnce(&mut DatabaseMetadata) -> R) -> R {
        f(&mut self.inner.borrow_mut().metadata)
    }

    /// Runs a synchronous, non-request backend call while checking this
    /// transaction is active. Used for cursor creation, whose result is
    /// itself the thing a later request iterates; the cursor's own
    /// `advance`/`continue` calls go through [`Self::issue`] like any other
    /// request.
    pub(crate) fn with_active_backend<R>(
        &self,
        f: impl FnOnce(&mut dyn BackendTx) -> Result<R, IdbError>,
    ) -> Result<R, IdbError> {
        let mut inner = self.inner.borrow_mut();
        if inner.state != TxState::Active {
            return Err(IdbError::TransactionInactive);
        }
        let backend_tx = inner
            .backend_tx
            .as_deref_mut()
            .expect("an active transaction always holds its backend handle");
        f(backend_tx)
    }

    /// Runs one backend operation against this transaction, synchronously
    /// executing it now and deferring delivery of its outcome (and the
    /// release of the hold it takes) to the next microtask drain.
    pub(crate) fn issue<T, F>(&self, source: RequestSource, f: F) -> Result<Request<T>, IdbError>
    where
        T: Clone + 'static,
        F: FnOnce(&mut dyn BackendTx) -> Result<T, IdbError>,
    {
        let outcome = {
            let mut inner = self.inner.borrow_mut();
            if inner.state != TxState::Active {
                return Err(IdbError::TransactionInactive);
            }
            let backend_tx = inner
                .backend_tx
                .as_deref_mut()
                .expect("an active transaction always holds its backend handle");
            f(backend_tx)
        };

        let request_failed = outcome.is_err();
        let request = Request::pending(outcome, source, self.clone());
        {
            let mut inner = self.inner.borrow_mut();
            inner.holds += 1;
            let abort_target = request.clone();
            inner
                .pending_aborts
                .push(Rc::new(move || abort_target.force_abort_outcome()));
        }

        let delivery_target = request.clone();
        let txn = self.clone();
        self.inner
            .borrow()
            .scheduler
            .borrow_mut()
            .enqueue_microtask(move |_scheduler| {
                delivery_target.deliver();
                // An unhandled request failure aborts the rest of the
                // transaction, same as an uncaught error event would.
                if request_failed {
                    let _ = txn.abort();
                } else {
                    txn.release_hold();
                }
            });

        Ok(request)
    }

    fn release_hold(&self) {
        let should_commit = {
            let mut inner = self.inner.borrow_mut();
            inner.holds = inner.holds.saturating_sub(1);
            inner.holds == 0 && inner.state == TxState::Active
        };
        if should_commit {
            self.try_commit();
        }
    }

    /// Commits if idle; called both when every hold has drained and right
    /// after the transaction is created, for the common case of a
    /// transaction that never issues a request at all.
    pub(crate) fn try_commit(&self) {
        let holds = self.inner.borrow().holds;
        if holds == 0 && self.inner.borrow().state == TxState::Active {
            self.commit();
        }
    }

    fn commit(&self) {
        let backend_tx = {
            let mut inner = self.inner.borrow_mut();
            inner.state = TxState::Committed;
            inner.backend_tx.take()
        };
        let Some(backend_tx) = backend_tx else {
            return;
        };
        match backend_tx.commit() {
            Ok(()) => {
                tracing::debug!("transaction committed");
                let event = Event::new(EventKind::Complete, false);
                let (connection_events, events) = self.ancestor_events();
                EventTarget::dispatch_chain(&[connection_events.as_ref(), events.as_ref()], &event);
            }
            Err(err) => {
                tracing::error!(%err, "transaction commit failed");
                self.inner.borrow_mut().state = TxState::Aborted;
                self.inner.borrow_mut().error = Some(IdbError::from(err));
                let event = Event::new(EventKind::Abort, true);
                let (connection_events, events) = self.ancestor_events();
                EventTarget::dispatch_chain(&[connection_events.as_ref(), events.as_ref()], &event);
            }
        }
    }

    /// Aborts this transaction: rolls back every mutation it made and fails
    /// every request still pending delivery with [`IdbError::Abort`].
    pub fn abort(&self) -> Result<(), IdbError> {
        let (backend_tx, pending) = {
            let mut inner = self.inner.borrow_mut();
            if inner.state != TxState::Active {
                return Err(IdbError::InvalidState(
                    "transaction has already committed or aborted".into(),
                ));
            }
            inner.state = TxState::Aborted;
            (inner.backend_tx.take(), std::mem::take(&mut inner.pending_aborts))
        };
        for mark_aborted in pending {
            mark_aborted();
        }
        if let Some(backend_tx) = backend_tx {
            backend_tx.abort()?;
        }
        tracing::debug!("transaction aborted");
        let event = Event::new(EventKind::Abort, true);
        let (connection_events, events) = self.ancestor_events();
        EventTarget::dispatch_chain(&[connection_events.as_ref(), events.as_ref()], &event);
        Ok(())
    }
}
