//! Shared test scaffolding: synthetic trees, scripted compiler backends,
//! and a listener that records everything it sees.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use ember_core::{CancellationToken, CompileError, EngineOptions, Value};

use crate::compiler::{CompiledArtifact, CompilerBackend, Deoptimization};
use crate::inlining::InliningPlan;
use crate::listener::RuntimeListener;
use crate::runtime::EngineRuntime;
use crate::target::CallTarget;
use crate::tree::{DirectCallSite, ExecutableTree, NodeCost};

// =============================================================================
// Engines
// =============================================================================

pub(crate) fn engine_with(
    options: EngineOptions,
    backend: impl CompilerBackend + 'static,
) -> EngineRuntime {
    EngineRuntime::new(options, Arc::new(backend))
}

/// Synchronous engine whose hotness thresholds are effectively unreachable,
/// for tests that drive targets by hand.
pub(crate) fn cold_engine() -> EngineRuntime {
    engine_with(
        EngineOptions {
            compile_threshold: 1_000_000,
            min_invoke_threshold: 1_000_000,
            ..EngineOptions::for_testing()
        },
        CountingBackend::new(),
    )
}

/// Synchronous engine that compiles on the second interpreter call.
pub(crate) fn hot_engine(backend: impl CompilerBackend + 'static) -> EngineRuntime {
    engine_with(EngineOptions::for_testing(), backend)
}

// =============================================================================
// Trees
// =============================================================================

/// Synthetic tree with a configurable node census and call site list.
pub(crate) struct StubTree {
    nodes: AtomicUsize,
    poly_nodes: usize,
    value: Value,
    sites: Mutex<Vec<Arc<DirectCallSite>>>,
    clonable: bool,
}

impl StubTree {
    fn build(nodes: usize, poly_nodes: usize, value: Value, clonable: bool) -> Arc<Self> {
        Arc::new(Self {
            nodes: AtomicUsize::new(nodes),
            poly_nodes,
            value,
            sites: Mutex::new(Vec::new()),
            clonable,
        })
    }

    /// Change the reported node count, as a node rewrite would.
    pub(crate) fn set_nodes(&self, nodes: usize) {
        self.nodes.store(nodes, Ordering::Relaxed);
    }

    /// Add a call site after construction. Sites pushed after the owning
    /// target exists are not adopted; attach them explicitly if the test
    /// needs an enclosing target.
    pub(crate) fn push_site(&self, site: Arc<DirectCallSite>) {
        self.sites.lock().push(site);
    }
}

impl ExecutableTree for StubTree {
    fn execute(&self, _args: &[Value]) -> Value {
        self.value.clone()
    }

    fn count_nodes(&self, at_least: NodeCost) -> usize {
        match at_least {
            NodeCost::Trivial | NodeCost::Monomorphic => self.nodes.load(Ordering::Relaxed),
            NodeCost::Polymorphic | NodeCost::Megamorphic => self.poly_nodes,
        }
    }

    fn direct_call_sites(&self) -> Vec<Arc<DirectCallSite>> {
        self.sites.lock().clone()
    }

    fn cloning_allowed(&self) -> bool {
        self.clonable
    }

    fn clone_uninitialized(&self) -> Option<Arc<dyn ExecutableTree>> {
        if !self.clonable {
            return None;
        }
        let clone = StubTree::build(
            self.nodes.load(Ordering::Relaxed),
            self.poly_nodes,
            self.value.clone(),
            true,
        );
        for site in self.sites.lock().iter() {
            clone.push_site(Arc::new(DirectCallSite::new(site.source_callee().clone())));
        }
        Some(clone)
    }
}

/// Tree with no call sites and only cheap nodes.
pub(crate) fn leaf_tree(nodes: usize, value: Value) -> Arc<StubTree> {
    StubTree::build(nodes, 0, value, true)
}

pub(crate) fn non_clonable_leaf(nodes: usize, value: Value) -> Arc<StubTree> {
    StubTree::build(nodes, 0, value, false)
}

/// Leaf whose census reports `poly_nodes` polymorphic-or-worse nodes.
pub(crate) fn poly_tree(nodes: usize, poly_nodes: usize, value: Value) -> Arc<StubTree> {
    StubTree::build(nodes, poly_nodes, value, true)
}

/// Tree with direct call sites baked in before the target adopts it.
pub(crate) fn calling_tree(
    nodes: usize,
    value: Value,
    sites: Vec<Arc<DirectCallSite>>,
) -> Arc<StubTree> {
    let tree = StubTree::build(nodes, 0, value, true);
    *tree.sites.lock() = sites;
    tree
}

/// Fresh call site dispatching to `target`.
pub(crate) fn site_to(target: &Arc<CallTarget>) -> Arc<DirectCallSite> {
    Arc::new(DirectCallSite::new(Arc::clone(target)))
}

// =============================================================================
// Artifacts
// =============================================================================

/// Compiled-code stand-in returning a fixed value.
pub(crate) struct StubArtifact {
    value: Value,
}

impl StubArtifact {
    pub(crate) fn new(value: Value) -> Self {
        Self { value }
    }
}

impl CompiledArtifact for StubArtifact {
    fn execute(&self, _args: &[Value]) -> Result<Value, Deoptimization> {
        Ok(self.value.clone())
    }
}

/// Compiled-code stand-in that deoptimizes on every call.
pub(crate) struct DeoptingArtifact;

impl CompiledArtifact for DeoptingArtifact {
    fn execute(&self, _args: &[Value]) -> Result<Value, Deoptimization> {
        Err(Deoptimization::new("synthetic guard failure"))
    }
}

// =============================================================================
// Backends
// =============================================================================

/// Backend that counts attempts and can be scripted per compile.
///
/// Clones share their state so a test can keep a handle after moving one
/// into the engine.
#[derive(Clone)]
pub(crate) struct CountingBackend {
    inner: Arc<CountingInner>,
}

struct CountingInner {
    compiles: AtomicUsize,
    delay: Option<Duration>,
    fallback: Value,
    script: Mutex<VecDeque<Result<Value, CompileError>>>,
}

impl CountingBackend {
    fn build(fallback: Value, delay: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(CountingInner {
                compiles: AtomicUsize::new(0),
                delay,
                fallback,
                script: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub(crate) fn new() -> Self {
        Self::build(Value::Null, None)
    }

    /// Every produced artifact returns `value`.
    pub(crate) fn returning(value: Value) -> Self {
        Self::build(value, None)
    }

    /// Play back `outcomes` one per compile, then fall back to `Ok(Null)`.
    pub(crate) fn scripted(outcomes: Vec<Result<Value, CompileError>>) -> Self {
        let backend = Self::new();
        *backend.inner.script.lock() = outcomes.into();
        backend
    }

    /// Sleep inside every compile, long enough for races to surface.
    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self::build(Value::Null, Some(delay))
    }

    pub(crate) fn compile_count(&self) -> usize {
        self.inner.compiles.load(Ordering::Relaxed)
    }
}

impl CompilerBackend for CountingBackend {
    fn compile(
        &self,
        _target: &Arc<CallTarget>,
        _plan: &InliningPlan,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn CompiledArtifact>, CompileError> {
        self.inner.compiles.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.inner.delay {
            std::thread::sleep(delay);
        }
        if cancel.is_cancelled() {
            return Err(CompileError::Cancelled);
        }
        match self.inner.script.lock().pop_front() {
            Some(Ok(value)) => Ok(Box::new(StubArtifact::new(value))),
            Some(Err(err)) => Err(err),
            None => Ok(Box::new(StubArtifact::new(self.inner.fallback.clone()))),
        }
    }
}

/// Backend that parks every compile until the test releases it or the
/// task's cancel token fires.
#[derive(Clone)]
pub(crate) struct BlockingBackend {
    inner: Arc<BlockingInner>,
}

struct BlockingInner {
    state: Mutex<BlockingState>,
    changed: Condvar,
}

#[derive(Default)]
struct BlockingState {
    started: usize,
    released: bool,
}

impl BlockingBackend {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(BlockingInner {
                state: Mutex::new(BlockingState::default()),
                changed: Condvar::new(),
            }),
        }
    }

    /// Let every current and future compile finish immediately.
    pub(crate) fn release_all(&self) {
        let mut state = self.inner.state.lock();
        state.released = true;
        self.inner.changed.notify_all();
    }

    /// Block until at least one compile has entered the backend.
    pub(crate) fn wait_for_compile_start(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.started == 0 {
            if self
                .inner
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                panic!("no compile started within {timeout:?}");
            }
        }
    }
}

impl CompilerBackend for BlockingBackend {
    fn compile(
        &self,
        _target: &Arc<CallTarget>,
        _plan: &InliningPlan,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn CompiledArtifact>, CompileError> {
        let mut state = self.inner.state.lock();
        state.started += 1;
        self.inner.changed.notify_all();
        loop {
            if state.released {
                return Ok(Box::new(StubArtifact::new(Value::Null)));
            }
            if cancel.is_cancelled() {
                return Err(CompileError::Cancelled);
            }
            // Wake periodically to poll the cancel flag.
            self.inner
                .changed
                .wait_for(&mut state, Duration::from_millis(1));
        }
    }
}

/// Backend that panics on its first compile and behaves afterwards.
pub(crate) struct PanickingBackend {
    remaining_panics: AtomicUsize,
}

impl PanickingBackend {
    pub(crate) fn once() -> Self {
        Self {
            remaining_panics: AtomicUsize::new(1),
        }
    }
}

impl CompilerBackend for PanickingBackend {
    fn compile(
        &self,
        _target: &Arc<CallTarget>,
        _plan: &InliningPlan,
        _cancel: &CancellationToken,
    ) -> Result<Box<dyn CompiledArtifact>, CompileError> {
        let hit = self
            .remaining_panics
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            panic!("scripted backend panic");
        }
        Ok(Box::new(StubArtifact::new(Value::Null)))
    }
}

// =============================================================================
// Listeners
// =============================================================================

/// One recorded listener callback, with the target's name unpacked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TestEvent {
    Queued(String),
    Dequeued(String, String),
    Started(String),
    Succeeded(String),
    Failed(String, String),
    Deoptimized(String),
    Invalidated(String, String),
}

/// Listener that records every event in arrival order.
#[derive(Default)]
pub(crate) struct CollectingListener {
    events: Mutex<Vec<TestEvent>>,
}

impl CollectingListener {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn has(&self, pred: impl Fn(&TestEvent) -> bool) -> bool {
        self.events.lock().iter().any(pred)
    }

    /// Project the recorded events through `f`, keeping the `Some`s.
    pub(crate) fn names<T>(&self, f: impl Fn(&TestEvent) -> Option<T>) -> Vec<T> {
        self.events.lock().iter().filter_map(f).collect()
    }

    fn record(&self, event: TestEvent) {
        self.events.lock().push(event);
    }
}

impl RuntimeListener for CollectingListener {
    fn on_compilation_queued(&self, target: &CallTarget) {
        self.record(TestEvent::Queued(target.name().to_owned()));
    }

    fn on_compilation_dequeued(&self, target: &CallTarget, reason: &str) {
        self.record(TestEvent::Dequeued(
            target.name().to_owned(),
            reason.to_owned(),
        ));
    }

    fn on_compilation_started(&self, target: &CallTarget) {
        self.record(TestEvent::Started(target.name().to_owned()));
    }

    fn on_compilation_succeeded(&self, target: &CallTarget) {
        self.record(TestEvent::Succeeded(target.name().to_owned()));
    }

    fn on_compilation_failed(&self, target: &CallTarget, error: &CompileError) {
        self.record(TestEvent::Failed(
            target.name().to_owned(),
            error.to_string(),
        ));
    }

    fn on_deoptimized(&self, target: &CallTarget) {
        self.record(TestEvent::Deoptimized(target.name().to_owned()));
    }

    fn on_invalidated(&self, target: &CallTarget, reason: &str) {
        self.record(TestEvent::Invalidated(
            target.name().to_owned(),
            reason.to_owned(),
        ));
    }
}
