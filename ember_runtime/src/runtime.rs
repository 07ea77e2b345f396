//! The engine: shared state plus the public handle.
//!
//! [`EngineShared`] is the single allocation every call target points back
//! to: options, compiler backend, inlining policy, listener set, target
//! registry and the compile queue. [`EngineRuntime`] is a cheap cloneable
//! handle around it.
//!
//! Worker threads hold the shared state alive, so an engine must be shut
//! down explicitly; dropping the last handle parks the workers but does
//! not stop them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ember_core::{CompileError, EngineOptions};

use crate::compiler::CompilerBackend;
use crate::inlining::{DefaultInliningPolicy, InliningPolicy};
use crate::listener::{ListenerSet, RuntimeListener};
use crate::queue::{self, CompileQueue, QueueStatsSnapshot};
use crate::registry::TargetRegistry;
use crate::target::{CallTarget, TargetId};
use crate::tree::ExecutableTree;

// =============================================================================
// Shared State
// =============================================================================

/// Everything a call target needs from its engine.
pub(crate) struct EngineShared {
    pub(crate) options: EngineOptions,
    pub(crate) backend: Arc<dyn CompilerBackend>,
    pub(crate) policy: Arc<dyn InliningPolicy>,
    pub(crate) listeners: ListenerSet,
    pub(crate) registry: TargetRegistry,
    pub(crate) queue: CompileQueue,
    next_id: AtomicU64,
}

impl EngineShared {
    /// Mint a target, wire it to this engine and register it.
    pub(crate) fn new_target(
        self: &Arc<Self>,
        name: String,
        tree: Arc<dyn ExecutableTree>,
        source: Option<Arc<CallTarget>>,
    ) -> Arc<CallTarget> {
        let id = TargetId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let target = CallTarget::new(Arc::clone(self), id, name, tree, source);
        self.registry.register(&target);
        target
    }
}

// =============================================================================
// Engine Runtime
// =============================================================================

/// Handle to a running engine.
///
/// Cloning shares the engine; the last handle does not stop it. Call
/// [`shutdown`](Self::shutdown) when done.
#[derive(Clone)]
pub struct EngineRuntime {
    shared: Arc<EngineShared>,
}

impl EngineRuntime {
    /// Start an engine with the default inlining policy.
    pub fn new(options: EngineOptions, backend: Arc<dyn CompilerBackend>) -> Self {
        Self::with_policy(options, backend, Arc::new(DefaultInliningPolicy::default()))
    }

    /// Start an engine with a custom inlining policy and spawn its
    /// compiler workers.
    pub fn with_policy(
        options: EngineOptions,
        backend: Arc<dyn CompilerBackend>,
        policy: Arc<dyn InliningPolicy>,
    ) -> Self {
        let threads = options.effective_compiler_threads();
        let shared = Arc::new(EngineShared {
            options,
            backend,
            policy,
            listeners: ListenerSet::new(),
            registry: TargetRegistry::new(),
            queue: CompileQueue::new(),
            next_id: AtomicU64::new(0),
        });
        queue::spawn_workers(&shared, threads);
        Self { shared }
    }

    /// Create a root call target for `tree`.
    pub fn create_target(
        &self,
        name: impl Into<String>,
        tree: Arc<dyn ExecutableTree>,
    ) -> Arc<CallTarget> {
        self.shared.new_target(name.into(), tree, None)
    }

    /// Submit a target for compilation regardless of hotness.
    ///
    /// Returns `Ok(true)` once the target has live compiled code; with
    /// background compilation the submission returns immediately and the
    /// result reports the state so far. The `Err` case only occurs for
    /// synchronous compilation with [`FailureAction::Throw`](ember_core::FailureAction::Throw).
    pub fn submit(&self, target: &Arc<CallTarget>) -> Result<bool, CompileError> {
        target.compile()
    }

    /// Wait for an in-flight compilation of `target` to settle.
    ///
    /// With `may_be_async` set and background compilation enabled this is
    /// a no-op; otherwise it blocks until the current task (if any) is
    /// done. Errors surface under the same rules as [`submit`](Self::submit).
    pub fn finish_compilation(
        &self,
        target: &Arc<CallTarget>,
        may_be_async: bool,
    ) -> Result<(), CompileError> {
        if may_be_async && self.shared.options.background_compilation {
            return Ok(());
        }
        match target.current_task() {
            Some(task) => target.finish_task(&task),
            None => Ok(()),
        }
    }

    /// Cancel the pending or running compilation of `target`, if any.
    /// `true` when a queued task was removed before a worker took it.
    pub fn cancel_compilation(&self, target: &Arc<CallTarget>, reason: &str) -> bool {
        target.cancel_compilation(reason)
    }

    pub fn add_listener(&self, listener: Arc<dyn RuntimeListener>) {
        self.shared.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn RuntimeListener>) -> bool {
        self.shared.listeners.remove(listener)
    }

    /// Every target created by this engine that is still alive.
    pub fn live_targets(&self) -> Vec<Arc<CallTarget>> {
        self.shared.registry.snapshot()
    }

    pub fn find_target(&self, id: TargetId) -> Option<Arc<CallTarget>> {
        self.shared.registry.get(id)
    }

    pub fn options(&self) -> &EngineOptions {
        &self.shared.options
    }

    /// Number of tasks currently waiting in the compile queue.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn queue_stats(&self) -> QueueStatsSnapshot {
        self.shared.queue.stats.snapshot()
    }

    /// Stop the queue, cancel everything still pending and join the
    /// workers. Targets stay callable in the interpreter afterwards.
    pub fn shutdown(&self) {
        self.shared.queue.shutdown_now();
        // Queued tasks were retired by the drain; tasks already running
        // only see their cancellation token.
        for target in self.shared.registry.snapshot() {
            target.cancel_compilation("engine shutdown");
        }
        self.shared.queue.join_workers();
    }
}

impl std::fmt::Debug for EngineRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntime")
            .field("targets", &self.shared.registry.len())
            .field("queued", &self.shared.queue.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
