//! Engine event listeners.
//!
//! Listeners observe the compilation lifecycle of call targets: queueing,
//! dequeueing, start, success, failure, deoptimization, invalidation.
//! Delivery is synchronous on the thread where the event happened, in
//! registration order. A panicking listener is logged and skipped; it
//! never takes down the engine or starves later listeners.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use ember_core::CompileError;

use crate::target::CallTarget;

// =============================================================================
// Listener Trait
// =============================================================================

/// Observer of per-target compilation events. All methods default to
/// no-ops; implement the ones you care about.
pub trait RuntimeListener: Send + Sync {
    /// A compile task for `_target` entered the queue.
    fn on_compilation_queued(&self, _target: &CallTarget) {}

    /// A queued task was removed before a worker picked it up.
    fn on_compilation_dequeued(&self, _target: &CallTarget, _reason: &str) {}

    /// A worker began compiling `_target`.
    fn on_compilation_started(&self, _target: &CallTarget) {}

    /// Compiled code was installed on `_target`.
    fn on_compilation_succeeded(&self, _target: &CallTarget) {}

    /// The backend reported an error for `_target`.
    fn on_compilation_failed(&self, _target: &CallTarget, _error: &CompileError) {}

    /// Compiled code bailed out back to the interpreter.
    fn on_deoptimized(&self, _target: &CallTarget) {}

    /// Installed code was discarded.
    fn on_invalidated(&self, _target: &CallTarget, _reason: &str) {}
}

// =============================================================================
// Listener Set
// =============================================================================

/// The engine's registered listeners.
pub(crate) struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn RuntimeListener>>>,
}

impl ListenerSet {
    pub(crate) fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, listener: Arc<dyn RuntimeListener>) {
        self.listeners.write().push(listener);
    }

    /// Remove a previously added listener. `true` if it was present.
    pub(crate) fn remove(&self, listener: &Arc<dyn RuntimeListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver one event to every listener in registration order.
    ///
    /// The set is snapshotted first so listeners may add or remove
    /// listeners from inside a callback without deadlocking.
    pub(crate) fn notify(&self, event: impl Fn(&dyn RuntimeListener)) {
        let snapshot: Vec<Arc<dyn RuntimeListener>> = self.listeners.read().clone();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| event(listener.as_ref()))).is_err() {
                log::error!("runtime listener panicked; continuing delivery");
            }
        }
    }
}

// =============================================================================
// Statistics Listener
// =============================================================================

/// A ready-made listener that counts every event it sees.
#[derive(Debug, Default)]
pub struct StatisticsListener {
    queued: AtomicU64,
    dequeued: AtomicU64,
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    deoptimized: AtomicU64,
    invalidated: AtomicU64,
}

impl StatisticsListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }
    pub fn dequeued(&self) -> u64 {
        self.dequeued.load(Ordering::Relaxed)
    }
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }
    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
    pub fn deoptimized(&self) -> u64 {
        self.deoptimized.load(Ordering::Relaxed)
    }
    pub fn invalidated(&self) -> u64 {
        self.invalidated.load(Ordering::Relaxed)
    }
}

impl RuntimeListener for StatisticsListener {
    fn on_compilation_queued(&self, _target: &CallTarget) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }
    fn on_compilation_dequeued(&self, _target: &CallTarget, _reason: &str) {
        self.dequeued.fetch_add(1, Ordering::Relaxed);
    }
    fn on_compilation_started(&self, _target: &CallTarget) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }
    fn on_compilation_succeeded(&self, _target: &CallTarget) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }
    fn on_compilation_failed(&self, _target: &CallTarget, _error: &CompileError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
    fn on_deoptimized(&self, _target: &CallTarget) {
        self.deoptimized.fetch_add(1, Ordering::Relaxed);
    }
    fn on_invalidated(&self, _target: &CallTarget, _reason: &str) {
        self.invalidated.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Tests
// =============================================================================
