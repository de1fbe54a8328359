//! Requests: the asynchronous result of one operation against a
//! transaction.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::IdbError;
use crate::event::{Event, EventKind, EventTarget};
use crate::transaction::Transaction;

/// Where a request sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// The result is not yet available to listeners.
    Pending,
    /// The result (success or failure) has been delivered.
    Done,
}

/// What issued a request: an object store, an index, or a cursor walking
/// one of them, mirroring `source` on a DOM `IDBRequest`.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestSource {
    /// A schema operation issued directly against the transaction
    /// (`createObjectStore`/`deleteObjectStore` and the like), with no
    /// store/index/cursor handle of its own.
    Transaction,
    /// The named object store.
    Store(String),
    /// The named index on the named store.
    Index {
        /// The store the index is defined on.
        store: String,
        /// The index's name.
        index: String,
    },
    /// A cursor positioned over a store or an index.
    Cursor(Box<RequestSource>),
}

struct RequestInner<T> {
    state: ReadyState,
    outcome: Option<Result<T, IdbError>>,
    events: EventTarget,
    source: RequestSource,
    transaction: Transaction,
}

/// The result of one request issued against a store, index, or cursor.
///
/// A request's backend work has already run by the time it is constructed
/// (the engine has no suspension points of its own); what is actually
/// deferred is *delivery* — `result()`/`error()` read [`ReadyState::Pending`]
/// and `on_success`/`on_error` listeners stay unfired until the owning
/// transaction's microtask queue delivers this request's outcome.
pub struct Request<T> {
    inner: Rc<RefCell<RequestInner<T>>>,
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Request {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> Request<T> {
    pub(crate) fn pending(outcome: Result<T, IdbError>, source: RequestSource, transaction: Transaction) -> Self {
        Request {
            inner: Rc::new(RefCell::new(RequestInner {
                state: ReadyState::Pending,
                outcome: Some(outcome),
                events: EventTarget::new(),
                source,
                transaction,
            })),
        }
    }

    /// This request's readiness.
    pub fn ready_state(&self) -> ReadyState {
        self.inner.borrow().state
    }

    /// What issued this request.
    pub fn source(&self) -> RequestSource {
        self.inner.borrow().source.clone()
    }

    /// The transaction this request was issued on.
    pub fn transaction(&self) -> Transaction {
        self.inner.borrow().transaction.clone()
    }

    /// The delivered result, or `None` if still [`ReadyState::Pending`].
    pub fn result(&self) -> Option<Result<T, IdbError>> {
        let inner = self.inner.borrow();
        if inner.state == ReadyState::Pending {
            return None;
        }
        inner.outcome.clone()
    }

    /// Registers a listener for this request's success event.
    pub fn on_success(&self, f: impl Fn(&T) + 'static) {
        let inner = self.inner.clone();
        self.inner.borrow().events.add_listener(EventKind::Success, false, move |_event| {
            if let Some(Ok(value)) = inner.borrow().outcome.clone() {
                f(&value);
            }
        });
    }

    /// Registers a listener for this request's error event.
    pub fn on_error(&self, f: impl Fn(&IdbError) + 'static) {
        let inner = self.inner.clone();
        self.inner.borrow().events.add_listener(EventKind::Error, false, move |_event| {
            if let Some(Err(err)) = inner.borrow().outcome.clone() {
                f(&err);
            }
        });
    }

    /// Overrides a still-pending outcome with an abort error. Used when the
    /// owning transaction is aborted before this request's microtask runs:
    /// the backend work already executed, but nothing was ever committed,
    /// so the value this request would have delivered never really existed.
    pub(crate) fn force_abort_outcome(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.state == ReadyState::Pending {
            inner.outcome = Some(Err(IdbError::Abort));
        }
    }

    /// Marks this request `Done` and fires its success or error listeners.
    /// Called by the owning transaction when this request's microtask runs.
    ///
    /// A failed request's `error` event bubbles through the owning
    /// transaction and its connection, same as `success` fires only at the
    /// request itself: this is how a transaction- or connection-level
    /// listener observes a request failing without attaching to every
    /// request individually.
    pub(crate) fn deliver(&self) {
        let is_ok = {
            let mut inner = self.inner.borrow_mut();
            inner.state = ReadyState::Done;
            inner.outcome.as_ref().map(|o| o.is_ok()).unwrap_or(false)
        };
        let kind = if is_ok { EventKind::Success } else { EventKind::Error };
        let event = Event::new(kind, !is_ok);
        let (connection_events, transaction_events) = self.inner.borrow().transaction.ancestor_events();
        let events = &self.inner.borrow().events;
        EventTarget::dispatch_chain(&[connection_events.as_ref(), transaction_events.as_ref(), events], &event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idb_storage::memory::MemoryBackend;
    use idb_storage::{Backend, TxMode};

    fn test_transaction() -> Transaction {
        let backend = MemoryBackend::new();
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let backend_tx = runtime
            .block_on(backend.begin_transaction("db", &[], TxMode::VersionChange))
            .unwrap();
        Transaction::new(
            Box::new(backend_tx),
            TxMode::VersionChange,
            vec![],
            idb_storage::DatabaseMetadata::default(),
            Rc::new(RefCell::new(idb_common::Scheduler::new())),
            Rc::new(EventTarget::new()),
        )
    }

    fn pending<T: Clone + 'static>(outcome: Result<T, IdbError>) -> Request<T> {
        Request::pending(outcome, RequestSource::Store("widgets".into()), test_transaction())
    }

    #[test]
    fn a_fresh_request_is_pending_until_delivered() {
        let request: Request<u32> = pending(Ok(42));
        assert_eq!(request.ready_state(), ReadyState::Pending);
        assert_eq!(request.result(), None);
        request.deliver();
        assert_eq!(request.ready_state(), ReadyState::Done);
        assert_eq!(request.result(), Some(Ok(42)));
    }

    #[test]
    fn on_success_fires_with_the_delivered_value() {
        let request: Request<u32> = pending(Ok(7));
        let seen = Rc::new(RefCell::new(None));
        let seen_clone = seen.clone();
        request.on_success(move |v| *seen_clone.borrow_mut() = Some(*v));
        request.deliver();
        assert_eq!(*seen.borrow(), Some(7));
    }

    #[test]
    fn on_error_fires_with_the_delivered_error() {
        let request: Request<u32> = pending(Err(IdbError::NotFound("x".into())));
        let seen = Rc::new(RefCell::new(None));
        let seen_clone = seen.clone();
        request.on_error(move |e| *seen_clone.borrow_mut() = Some(e.clone()));
        request.deliver();
        assert_eq!(*seen.borrow(), Some(IdbError::NotFound("x".into())));
    }

    #[test]
    fn source_reports_what_issued_the_request() {
        let request: Request<u32> = pending(Ok(1));
        assert_eq!(request.source(), RequestSource::Store("widgets".into()));
    }

    #[test]
    fn a_failed_requests_error_event_bubbles_to_the_transaction() {
        let request: Request<u32> = pending(Err(IdbError::NotFound("x".into())));
        let transaction = request.transaction();
        let seen = Rc::new(RefCell::new(false));
        let seen_clone = seen.clone();
        transaction
            .events()
            .add_listener(EventKind::Error, false, move |_event| *seen_clone.borrow_mut() = true);
        request.deliver();
        assert!(*seen.borrow());
    }
}
