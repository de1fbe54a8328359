//! A deterministic, single-threaded task/microtask scheduler.
//!
//! The engine has no suspension points of its own: every backend call is
//! synchronous, and "asynchrony" is entirely a matter of when a result is
//! *delivered* relative to the task that requested it. This module makes
//! that scheduling model explicit and testable without depending on a host
//! event loop (tokio, a browser, etc).
//!
//! A **task** is one top-level entry into the scheduler. A **microtask** is
//! a closure queued during a task (or during another microtask) that runs
//! before [`Scheduler::run_task`] returns. This mirrors the task/microtask
//! split of the host environment the engine is modeled after: transaction
//! auto-commit, request delivery, and event dispatch are all expressed as
//! microtasks so their relative order is deterministic and reproducible in
//! tests.

use std::collections::VecDeque;

/// FIFO queue of pending microtasks plus a monotonic task counter.
///
/// Callers drive the engine exclusively through [`Scheduler::run_task`]; the
/// scheduler is otherwise `!Send`/`!Sync` by construction (it boxes
/// non-`Send` closures) and is meant to be owned by a single logical thread,
/// typically behind an `Rc<RefCell<_>>`.
#[derive(Default)]
pub struct Scheduler {
    microtasks: VecDeque<Box<dyn FnOnce(&mut Scheduler)>>,
    current_task: u64,
}

impl Scheduler {
    /// Creates a fresh scheduler with no pending work and task counter at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// The id of the task currently executing, or the most recently executed
    /// one if called between tasks. Transactions snapshot this value at
    /// creation time to know when their initiating task has ended.
    pub fn current_task(&self) -> u64 {
        self.current_task
    }

    /// Queues a closure to run before the current (or next) task returns.
    /// Microtasks queued while draining other microtasks are appended to the
    /// same drain pass, matching microtask-queue semantics.
    pub fn enqueue_microtask(&mut self, f: impl FnOnce(&mut Scheduler) + 'static) {
        self.microtasks.push_back(Box::new(f));
    }

    /// Runs `f` as a new task: bumps the task counter, invokes `f`, then
    /// drains every microtask queued during `f` (and any microtasks those
    /// microtasks queue in turn) before returning.
    pub fn run_task<F, R>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut Scheduler) -> R,
    {
        self.current_task += 1;
        let result = f(self);
        self.drain_microtasks();
        result
    }

    /// Whether there is pending microtask work. Exposed mainly for tests
    /// that assert the queue drains completely.
    pub fn is_idle(&self) -> bool {
        self.microtasks.is_empty()
    }

    fn drain_microtasks(&mut self) {
        while let Some(microtask) = self.microtasks.pop_front() {
            microtask(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn it_bumps_the_task_counter_per_run_task() {
        let mut scheduler = Scheduler::new();
        assert_eq!(scheduler.current_task(), 0);
        scheduler.run_task(|_| {});
        assert_eq!(scheduler.current_task(), 1);
        scheduler.run_task(|_| {});
        assert_eq!(scheduler.current_task(), 2);
    }

    #[test]
    fn it_drains_microtasks_before_run_task_returns() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut scheduler = Scheduler::new();

        let log_clone = log.clone();
        scheduler.run_task(move |s| {
            log_clone.borrow_mut().push("task");
            let log_inner = log_clone.clone();
            s.enqueue_microtask(move |_| log_inner.borrow_mut().push("microtask-1"));
        });

        assert_eq!(*log.borrow(), vec!["task", "microtask-1"]);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn it_drains_microtasks_queued_by_other_microtasks() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut scheduler = Scheduler::new();

        let log_clone = log.clone();
        scheduler.run_task(move |s| {
            let log_inner = log_clone.clone();
            s.enqueue_microtask(move |s2| {
                log_inner.borrow_mut().push("microtask-1");
                let log_inner2 = log_inner.clone();
                s2.enqueue_microtask(move |_| log_inner2.borrow_mut().push("microtask-2"));
            });
        });

        assert_eq!(*log.borrow(), vec!["microtask-1", "microtask-2"]);
    }
}
