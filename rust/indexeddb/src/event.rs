//! A DOM-style event target: capture, target, and bubble phases, with
//! listener panics caught and logged rather than unwinding the dispatch.

use std::cell::{Cell, RefCell};
use std::panic::AssertUnwindSafe;
use std::rc::Rc;

/// The kind of event a request, transaction, or connection can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A request completed successfully.
    Success,
    /// A request failed.
    Error,
    /// An `open()` call needs a schema upgrade before it can proceed.
    UpgradeNeeded,
    /// An `open()`/`delete()` call is waiting on another connection to close.
    Blocked,
    /// Another connection is requesting a version change; this connection
    /// should close.
    VersionChange,
    /// A transaction committed.
    Complete,
    /// A transaction was aborted.
    Abort,
}

/// One dispatched event. Bubbling events can be stopped mid-flight by a
/// listener; `Complete`/`Abort`/`Success`/`Error` do not bubble past their
/// originating request or transaction target.
#[derive(Debug, Clone)]
pub struct Event {
    kind: EventKind,
    bubbles: bool,
    propagation_stopped: Rc<Cell<bool>>,
    immediate_stopped: Rc<Cell<bool>>,
}

impl Event {
    /// Builds a new event of `kind`. `bubbles` controls whether dispatch
    /// continues past the target phase into ancestor listeners.
    pub fn new(kind: EventKind, bubbles: bool) -> Self {
        Event {
            kind,
            bubbles,
            propagation_stopped: Rc::new(Cell::new(false)),
            immediate_stopped: Rc::new(Cell::new(false)),
        }
    }

    /// The event's kind.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Prevents the event from reaching any further ancestor in the bubble
    /// phase. Listeners still pending at the current target still run.
    pub fn stop_propagation(&self) {
        self.propagation_stopped.set(true);
    }

    /// Like [`Self::stop_propagation`], but also skips any remaining
    /// listener at the current target.
    pub fn stop_immediate_propagation(&self) {
        self.propagation_stopped.set(true);
        self.immediate_stopped.set(true);
    }
}

type Listener = Rc<dyn Fn(&Event)>;

/// A node in an event dispatch chain: owns its own capture- and bubble-phase
/// listeners, keyed by [`EventKind`].
#[derive(Default)]
pub struct EventTarget {
    capture: RefCell<Vec<(EventKind, Listener)>>,
    bubble: RefCell<Vec<(EventKind, Listener)>>,
}

impl EventTarget {
    /// Creates an empty event target.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. `capture` selects the capture phase (run while
    /// walking from the root towards the target) over the default bubble
    /// phase (run while walking from the target back up to the root, plus
    /// at the target itself).
    pub fn add_listener(&self, kind: EventKind, capture: bool, f: impl Fn(&Event) + 'static) {
        let list = if capture { &self.capture } else { &self.bubble };
        list.borrow_mut().push((kind, Rc::new(f)));
    }

    fn fire_phase(list: &RefCell<Vec<(EventKind, Listener)>>, kind: EventKind, event: &Event) {
        let listeners: Vec<Listener> = list
            .borrow()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, f)| f.clone())
            .collect();
        for listener in listeners {
            if event.immediate_stopped.get() {
                return;
            }
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| listener(event)));
            if let Err(panic) = result {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "listener panicked".into());
                tracing::error!(event = ?kind, %message, "event listener panicked; ignoring");
            }
        }
    }

    /// Dispatches `event` along `chain`, where `chain[0]` is the outermost
    /// ancestor and `chain.last()` is the event's target.
    ///
    /// Capture-phase listeners fire root-to-target (excluding the target
    /// itself), then both capture- and bubble-phase listeners fire at the
    /// target, then bubble-phase listeners fire target-to-root (excluding
    /// the target), stopping early if a listener calls
    /// [`Event::stop_propagation`]. A non-bubbling event only runs the
    /// target phase.
    pub fn dispatch_chain(chain: &[&EventTarget], event: &Event) {
        let Some((target, ancestors)) = chain.split_last() else {
            return;
        };

        for ancestor in ancestors {
            if event.propagation_stopped.get() {
                return;
            }
            Self::fire_phase(&ancestor.capture, event.kind, event);
        }

        Self::fire_phase(&target.capture, event.kind, event);
        if !event.immediate_stopped.get() {
            Self::fire_phase(&target.bubble, event.kind, event);
        }

        if !event.bubbles {
            return;
        }
        for ancestor in ancestors.iter().rev() {
            if event.propagation_stopped.get() {
                return;
            }
            Self::fire_phase(&ancestor.bubble, event.kind, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn it_fires_target_listeners() {
        let target = EventTarget::new();
        let seen = Rc::new(StdRefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        target.add_listener(EventKind::Success, false, move |_| {
            seen_clone.borrow_mut().push("success");
        });
        EventTarget::dispatch_chain(&[&target], &Event::new(EventKind::Success, false));
        assert_eq!(*seen.borrow(), vec!["success"]);
    }

    #[test]
    fn it_runs_capture_then_target_then_bubble_in_order() {
        let root = EventTarget::new();
        let target = EventTarget::new();
        let order = Rc::new(StdRefCell::new(Vec::new()));

        let o = order.clone();
        root.add_listener(EventKind::Complete, true, move |_| o.borrow_mut().push("root-capture"));
        let o = order.clone();
        target.add_listener(EventKind::Complete, false, move |_| o.borrow_mut().push("target"));
        let o = order.clone();
        root.add_listener(EventKind::Complete, false, move |_| o.borrow_mut().push("root-bubble"));

        EventTarget::dispatch_chain(&[&root, &target], &Event::new(EventKind::Complete, true));
        assert_eq!(*order.borrow(), vec!["root-capture", "target", "root-bubble"]);
    }

    #[test]
    fn stop_propagation_prevents_bubbling_past_the_target() {
        let root = EventTarget::new();
        let target = EventTarget::new();
        let seen = Rc::new(StdRefCell::new(Vec::new()));

        let s = seen.clone();
        target.add_listener(EventKind::Abort, false, move |event| {
            s.borrow_mut().push("target");
            event.stop_propagation();
        });
        let s = seen.clone();
        root.add_listener(EventKind::Abort, false, move |_| s.borrow_mut().push("root"));

        EventTarget::dispatch_chain(&[&root, &target], &Event::new(EventKind::Abort, true));
        assert_eq!(*seen.borrow(), vec!["target"]);
    }

    #[test]
    fn a_panicking_listener_does_not_stop_the_remaining_listeners() {
        let target = EventTarget::new();
        let seen = Rc::new(StdRefCell::new(Vec::new()));

        target.add_listener(EventKind::Error, false, |_| panic!("boom"));
        let s = seen.clone();
        target.add_listener(EventKind::Error, false, move |_| s.borrow_mut().push("second"));

        EventTarget::dispatch_chain(&[&target], &Event::new(EventKind::Error, false));
        assert_eq!(*seen.borrow(), vec!["second"]);
    }
}
