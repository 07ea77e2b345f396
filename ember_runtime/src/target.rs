//! Call targets: the unit of profiling, compilation, and invalidation.
//!
//! A [`CallTarget`] wraps one executable tree together with its execution
//! profile and the machinery that moves it through the compilation
//! lifecycle:
//!
//! ```text
//! Interpreted --(hot)--> Queued --> Compiling --> Installed
//!      ^                   |            |             |
//!      |                (cancel)     (cancel/fail)    |
//!      +-------------------+------------+--(invalidate)
//! ```
//!
//! Installed code lives in a single slot guarded by a mutex, with an atomic
//! flag shadowing "is there code" for the fast path. Every installation
//! bumps a version counter; assumption-driven invalidation carries the
//! version it was registered for, so tearing down version N can never
//! destroy a newer installation.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use ember_core::{CompileError, EngineOptions, FailureAction, Value};

use crate::assumption::{Assumption, AssumptionDependent};
use crate::compiler::{CompiledArtifact, Deoptimization};
use crate::inlining::InliningPlanner;
use crate::profile::ExecutionProfile;
use crate::queue::{CompileTask, TaskOutcome};
use crate::runtime::EngineShared;
use crate::tree::{ExecutableTree, NodeCost};

/// Stable identity of a call target within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetId(pub u64);

const NODE_COUNT_UNKNOWN: i64 = -1;

// =============================================================================
// Installed Code
// =============================================================================

/// A compiled artifact bound to the target it was installed on.
///
/// The handle strongly owns the dependency records registered on
/// assumptions, while assumptions only hold them weakly. Dropping the
/// handle therefore retires its registrations: an invalidation that fires
/// afterwards finds nothing to notify.
pub struct InstalledCode {
    artifact: Box<dyn CompiledArtifact>,
    version: u64,
    dependencies: Mutex<Vec<Arc<CodeDependency>>>,
}

impl InstalledCode {
    fn new(artifact: Box<dyn CompiledArtifact>, version: u64) -> Self {
        Self {
            artifact,
            version,
            dependencies: Mutex::new(Vec::new()),
        }
    }

    /// Installation version, unique per target.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of assumption registrations kept alive by this handle.
    pub fn dependency_count(&self) -> usize {
        self.dependencies.lock().len()
    }

    /// Run the compiled code.
    pub fn execute(&self, args: &[Value]) -> Result<Value, Deoptimization> {
        self.artifact.execute(args)
    }

    fn retain_dependency(&self, dependency: Arc<CodeDependency>) {
        self.dependencies.lock().push(dependency);
    }
}

impl std::fmt::Debug for InstalledCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstalledCode")
            .field("version", &self.version)
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}

/// Links an assumption to one specific installation of one target.
pub(crate) struct CodeDependency {
    target: Weak<CallTarget>,
    code_version: u64,
}

impl AssumptionDependent for CodeDependency {
    fn on_assumption_invalidated(&self, assumption: &str, reason: &str) {
        if let Some(target) = self.target.upgrade() {
            target.invalidate_code_version(
                self.code_version,
                &format!("assumption '{assumption}' invalidated: {reason}"),
            );
        }
    }
}

// =============================================================================
// Call Target
// =============================================================================

/// One compilable unit: a tree, its profile, and its compilation state.
///
/// Targets are created through [`EngineRuntime::create_target`] and always
/// live behind an `Arc`. All entry points are safe to call from any number
/// of host threads.
///
/// [`EngineRuntime::create_target`]: crate::runtime::EngineRuntime::create_target
pub struct CallTarget {
    id: TargetId,
    name: String,
    tree: Arc<dyn ExecutableTree>,
    profile: ExecutionProfile,
    engine: Arc<EngineShared>,
    code: Mutex<Option<Arc<InstalledCode>>>,
    has_code: AtomicBool,
    code_version: AtomicU64,
    task: Mutex<Option<Arc<CompileTask>>>,
    rewriting_assumption: Mutex<Option<Arc<Assumption>>>,
    cached_node_count: AtomicI64,
    compilation_failed: AtomicBool,
    /// The target this one was split from, `None` for originals.
    source: Option<Arc<CallTarget>>,
}

impl CallTarget {
    pub(crate) fn new(
        engine: Arc<EngineShared>,
        id: TargetId,
        name: String,
        tree: Arc<dyn ExecutableTree>,
        source: Option<Arc<CallTarget>>,
    ) -> Arc<Self> {
        let target = Arc::new(Self {
            id,
            name,
            tree,
            profile: ExecutionProfile::new(),
            engine,
            code: Mutex::new(None),
            has_code: AtomicBool::new(false),
            code_version: AtomicU64::new(0),
            task: Mutex::new(None),
            rewriting_assumption: Mutex::new(None),
            cached_node_count: AtomicI64::new(NODE_COUNT_UNKNOWN),
            compilation_failed: AtomicBool::new(false),
            source,
        });
        // Adopt the tree's call sites so splitting can find the caller.
        for site in target.tree.direct_call_sites() {
            site.attach(&target);
        }
        target
    }

    // -------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------

    #[inline]
    pub fn id(&self) -> TargetId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn tree(&self) -> &Arc<dyn ExecutableTree> {
        &self.tree
    }

    #[inline]
    pub fn profile(&self) -> &ExecutionProfile {
        &self.profile
    }

    /// The engine configuration this target runs under.
    #[inline]
    pub fn engine_options(&self) -> &EngineOptions {
        &self.engine.options
    }

    pub(crate) fn engine(&self) -> &Arc<EngineShared> {
        &self.engine
    }

    /// The target this one was split from, if any.
    #[inline]
    pub fn source(&self) -> Option<&Arc<CallTarget>> {
        self.source.as_ref()
    }

    /// Whether this target is a split clone.
    #[inline]
    pub fn is_split(&self) -> bool {
        self.source.is_some()
    }

    /// True when `self` and `other` are the same target, one is a split of
    /// the other, or both are splits of the same original.
    pub fn is_same_or_split(self: &Arc<Self>, other: &Arc<CallTarget>) -> bool {
        if Arc::ptr_eq(self, other) {
            return true;
        }
        let self_source = self.source.as_ref();
        let other_source = other.source.as_ref();
        self_source.is_some_and(|s| Arc::ptr_eq(s, other))
            || other_source.is_some_and(|s| Arc::ptr_eq(s, self))
            || matches!((self_source, other_source), (Some(a), Some(b)) if Arc::ptr_eq(a, b))
    }

    // -------------------------------------------------------------------
    // Calling
    // -------------------------------------------------------------------

    /// Call through the generic entry point.
    pub fn call(self: &Arc<Self>, args: &[Value]) -> Value {
        self.profile.record_indirect_call();
        self.call_boundary(args)
    }

    /// Call from a direct call site.
    pub fn call_direct(self: &Arc<Self>, args: &[Value]) -> Value {
        self.profile.record_direct_call();
        self.call_boundary(args)
    }

    /// Execute on behalf of a caller that inlined this target: no hotness
    /// accounting and no compiled-code dispatch, but kind feedback still
    /// accumulates.
    pub fn call_inlined(self: &Arc<Self>, args: &[Value]) -> Value {
        self.profile.record_inlined_call();
        self.profile.profile_arguments(args);
        let result = self.tree.execute(args);
        self.profile.profile_return_value(&result);
        result
    }

    fn call_boundary(self: &Arc<Self>, args: &[Value]) -> Value {
        if let Some(value) = self.execute_compiled(args) {
            return value;
        }
        self.interpreter_call(args)
    }

    /// Dispatch to installed code; `None` when there is none or it asked
    /// to deoptimize.
    fn execute_compiled(self: &Arc<Self>, args: &[Value]) -> Option<Value> {
        let code = self.installed_code()?;
        match code.execute(args) {
            Ok(value) => Some(value),
            Err(deopt) => {
                self.profile.record_deopt();
                log::debug!("deoptimization in '{}': {}", self.name, deopt.reason);
                self.engine.listeners.notify(|l| l.on_deoptimized(self));
                None
            }
        }
    }

    fn interpreter_call(self: &Arc<Self>, args: &[Value]) -> Value {
        self.profile.record_interpreter_call();
        self.profile.profile_arguments(args);
        if self.should_compile() {
            // There is no error channel on the call path; a synchronous
            // failure surfaces through submit()/finish_compilation().
            let _ = self.compile();
            if let Some(value) = self.execute_compiled(args) {
                return value;
            }
        }
        let result = self.tree.execute(args);
        self.profile.profile_return_value(&result);
        result
    }

    // -------------------------------------------------------------------
    // Compilation
    // -------------------------------------------------------------------

    /// Whether this target is eligible to be submitted right now.
    pub fn should_compile(&self) -> bool {
        !self.is_valid()
            && !self.compilation_failed.load(Ordering::Relaxed)
            && self.profile.is_hot(&self.engine.options)
            && self.task.lock().is_none()
    }

    /// Submit this target for compilation.
    ///
    /// In background mode this returns as soon as the task is queued; in
    /// synchronous mode it blocks until the task finished. `Ok(true)` means
    /// compiled code is installed on return. A permanent failure is
    /// returned as `Err` only under [`FailureAction::Throw`] in synchronous
    /// mode; every other policy reports it through the profile, the
    /// listeners, and the failure latch.
    pub fn compile(self: &Arc<Self>) -> Result<bool, CompileError> {
        if self.is_valid() {
            return Ok(true);
        }
        if !self.accept_for_compilation() {
            return Ok(false);
        }

        let mut created = false;
        let task = match self.current_task() {
            Some(existing) => existing,
            None => {
                // Plan outside the slot lock; a losing racer discards its
                // plan and adopts the winner's task.
                let planner =
                    InliningPlanner::new(&self.engine.options, self.engine.policy.as_ref());
                let plan = planner.plan(self);
                let priority = u64::from(self.profile.call_and_loop_count());
                let mut slot = self.task.lock();
                match &*slot {
                    Some(existing) => existing.clone(),
                    None => {
                        // An empty slot can also mean an install completed
                        // while the plan was being built; only queue a new
                        // task if the target is still invalid.
                        if self.is_valid() {
                            return Ok(true);
                        }
                        let task = CompileTask::new(self, plan, priority);
                        *slot = Some(task.clone());
                        created = true;
                        task
                    }
                }
            }
        };

        if created {
            self.engine.listeners.notify(|l| l.on_compilation_queued(self));
            if let Err(err) = self.engine.queue.enqueue(task.clone()) {
                self.clear_task_if(&task);
                task.finish(TaskOutcome::Cancelled);
                self.engine
                    .listeners
                    .notify(|l| l.on_compilation_dequeued(self, "compile queue shut down"));
                log::debug!("submission of '{}' rejected: {err}", self.name);
                return Ok(false);
            }
        }

        if !self.engine.options.background_compilation {
            self.finish_task(&task)?;
        }
        Ok(self.is_valid())
    }

    /// Applies the failure latch and the compile-only filter.
    fn accept_for_compilation(&self) -> bool {
        if self.compilation_failed.load(Ordering::Relaxed) {
            return false;
        }
        match &self.engine.options.compile_only {
            Some(filter) if !filter.accepts(&self.name) => {
                self.compilation_failed.store(true, Ordering::Relaxed);
                log::debug!("'{}' excluded from compilation by filter", self.name);
                false
            }
            _ => true,
        }
    }

    /// Block until `task` reaches a terminal state, translating a permanent
    /// failure into an error under [`FailureAction::Throw`].
    pub(crate) fn finish_task(&self, task: &Arc<CompileTask>) -> Result<(), CompileError> {
        match task.wait_done() {
            TaskOutcome::Failed(err)
                if err.is_permanent()
                    && self.engine.options.failure_action == FailureAction::Throw =>
            {
                Err(err)
            }
            _ => Ok(()),
        }
    }

    /// Cancel the in-flight compilation, if any. Returns `true` when a
    /// queued task was removed before it started; a running task only has
    /// its cancel flag set and keeps its slot until the worker retires it.
    pub fn cancel_compilation(self: &Arc<Self>, reason: &str) -> bool {
        let Some(task) = self.current_task() else {
            return false;
        };
        if task.cancel() {
            self.clear_task_if(&task);
            self.engine
                .listeners
                .notify(|l| l.on_compilation_dequeued(self, reason));
            log::debug!("dequeued compilation of '{}': {reason}", self.name);
            true
        } else {
            false
        }
    }

    /// The task currently queued or running for this target.
    pub fn current_task(&self) -> Option<Arc<CompileTask>> {
        self.task.lock().clone()
    }

    pub(crate) fn clear_task_if(&self, task: &Arc<CompileTask>) {
        let mut slot = self.task.lock();
        if slot.as_ref().is_some_and(|t| Arc::ptr_eq(t, task)) {
            *slot = None;
        }
    }

    pub(crate) fn mark_compilation_failed(&self) {
        self.compilation_failed.store(true, Ordering::Relaxed);
    }

    /// Whether a permanent failure has latched this target out of
    /// compilation.
    #[inline]
    pub fn compilation_failed(&self) -> bool {
        self.compilation_failed.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------
    // Installed code
    // -------------------------------------------------------------------

    /// Whether compiled code is currently installed.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.has_code.load(Ordering::Acquire)
    }

    /// The installed code handle, if any.
    pub fn installed_code(&self) -> Option<Arc<InstalledCode>> {
        if !self.is_valid() {
            return None;
        }
        self.code.lock().clone()
    }

    /// Version of the most recent installation, 0 before the first.
    #[inline]
    pub fn code_version(&self) -> u64 {
        self.code_version.load(Ordering::Relaxed)
    }

    /// Install a freshly compiled artifact and register it on every
    /// assumption it depends on.
    ///
    /// The code is published before the registrations are made: an
    /// invalidation racing with installation carries this installation's
    /// version and tears it down through the normal path instead of being
    /// lost.
    pub(crate) fn install_code(
        self: &Arc<Self>,
        artifact: Box<dyn CompiledArtifact>,
        plan_assumptions: Vec<Arc<Assumption>>,
    ) {
        let mut assumptions = artifact.assumptions();
        assumptions.extend(plan_assumptions);

        let version = self.code_version.fetch_add(1, Ordering::Relaxed) + 1;
        let code = Arc::new(InstalledCode::new(artifact, version));
        {
            let mut slot = self.code.lock();
            *slot = Some(code.clone());
            self.has_code.store(true, Ordering::Release);
        }
        for assumption in assumptions {
            let dependency = Arc::new(CodeDependency {
                target: Arc::downgrade(self),
                code_version: version,
            });
            code.retain_dependency(dependency.clone());
            let weak: Weak<dyn AssumptionDependent> = Arc::<CodeDependency>::downgrade(&dependency);
            assumption.register_dependent(weak);
        }
        log::debug!("installed code v{version} for '{}'", self.name);
    }

    /// Throw away installed code and make the target re-earn its hotness.
    ///
    /// Also cancels an in-flight compilation. Returns `true` if code was
    /// removed or a task was dequeued.
    pub fn invalidate(self: &Arc<Self>, reason: &str) -> bool {
        self.invalidate_installation(None, reason)
    }

    /// Version-scoped invalidation used by assumption teardown. An event
    /// for an installation that has already been replaced is stale and is
    /// ignored.
    pub(crate) fn invalidate_code_version(self: &Arc<Self>, version: u64, reason: &str) {
        self.invalidate_installation(Some(version), reason);
    }

    fn invalidate_installation(self: &Arc<Self>, only_version: Option<u64>, reason: &str) -> bool {
        let removed = {
            let mut slot = self.code.lock();
            let matches = match (&*slot, only_version) {
                (Some(code), Some(version)) => code.version() == version,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if matches {
                self.has_code.store(false, Ordering::Release);
                slot.take()
            } else {
                None
            }
        };
        if only_version.is_some() && removed.is_none() {
            // Stale event for an installation that is already gone.
            return false;
        }
        let had_code = removed.is_some();
        drop(removed);
        if had_code {
            self.profile.reset_hotness();
            log::debug!("invalidated '{}': {reason}", self.name);
            self.engine.listeners.notify(|l| l.on_invalidated(self, reason));
        }
        let dequeued = self.cancel_compilation(reason);
        had_code || dequeued
    }

    // -------------------------------------------------------------------
    // Tree feedback
    // -------------------------------------------------------------------

    /// Report that the tree rewrote one of its nodes.
    ///
    /// Invalidates the node-rewriting assumption (tearing down every caller
    /// that inlined this target), drops this target's own code, clears the
    /// cached node count, and delays recompilation so the rewrite can be
    /// re-profiled.
    pub fn node_replaced(self: &Arc<Self>, reason: &str) {
        self.cached_node_count
            .store(NODE_COUNT_UNKNOWN, Ordering::Relaxed);
        let stale = {
            let mut slot = self.rewriting_assumption.lock();
            slot.take().map(|old| {
                *slot = Some(Arc::new(Assumption::new(rewriting_assumption_name(
                    &self.name,
                ))));
                old
            })
        };
        if let Some(old) = stale {
            old.invalidate(reason);
        }
        self.invalidate(&format!("node replaced: {reason}"));
        self.profile
            .delay_compilation(self.engine.options.replace_reprofile_count);
    }

    /// The assumption that this target's tree keeps its current shape.
    /// Created lazily; callers inlining this target register compiled code
    /// on it.
    pub fn node_rewriting_assumption(&self) -> Arc<Assumption> {
        let mut slot = self.rewriting_assumption.lock();
        slot.get_or_insert_with(|| Arc::new(Assumption::new(rewriting_assumption_name(&self.name))))
            .clone()
    }

    /// Non-trivial node count of the tree, cached until the next rewrite.
    pub fn non_trivial_node_count(&self) -> usize {
        let cached = self.cached_node_count.load(Ordering::Relaxed);
        if cached >= 0 {
            return cached as usize;
        }
        let count = self.tree.count_nodes(NodeCost::Monomorphic);
        self.cached_node_count.store(count as i64, Ordering::Relaxed);
        count
    }

    // -------------------------------------------------------------------
    // Splitting support
    // -------------------------------------------------------------------

    /// Clone this target for a private call site. Returns `None` when the
    /// target is itself a split (clones are never cloned again) or the
    /// tree does not support cloning.
    pub(crate) fn create_split(self: &Arc<Self>) -> Option<Arc<CallTarget>> {
        if self.is_split() || !self.tree.cloning_allowed() {
            return None;
        }
        let tree = self.tree.clone_uninitialized()?;
        let name = format!("{} <split>", self.name);
        Some(self.engine.new_target(name, tree, Some(self.clone())))
    }
}

fn rewriting_assumption_name(target: &str) -> String {
    format!("node rewriting of '{target}'")
}

impl std::fmt::Debug for CallTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallTarget")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("valid", &self.is_valid())
            .field("split", &self.is_split())
            .field("failed", &self.compilation_failed())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
