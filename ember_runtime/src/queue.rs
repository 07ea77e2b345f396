//! The compile queue and its worker pool.
//!
//! Submissions become [`CompileTask`]s: one per target at a time, holding
//! the inlining plan computed at submission and a cooperative cancel
//! token. Tasks are ordered by priority (the target's combined hotness
//! counter at submission) with FIFO tie-breaking, and processed by a fixed
//! pool of worker threads.
//!
//! A task and its completion state are one allocation: there is no moment
//! where a task exists but its outcome cannot be awaited. Workers never
//! die on a failed job; backend errors and panics are caught at the job
//! boundary, routed through the failure policy, and recorded as the task
//! outcome.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use ember_core::{CancellationToken, CompileError, FailureAction};

use crate::inlining::InliningPlan;
use crate::runtime::EngineShared;
use crate::target::CallTarget;

// =============================================================================
// Compile Task
// =============================================================================

/// Scheduling state of a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    /// Waiting in the queue.
    Queued,
    /// A worker is compiling it.
    Running,
    /// Finished, one way or another.
    Done(TaskOutcome),
}

/// Terminal result of a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Compiled code was installed on the target.
    Installed,
    /// The backend reported an error.
    Failed(CompileError),
    /// Cancelled before or during compilation; treated as "no result".
    Cancelled,
}

/// One submission of one target.
///
/// Holds the target weakly: a task never keeps a dead target alive, and a
/// worker that pops a task for a dropped target retires it unrun.
pub struct CompileTask {
    target: Weak<CallTarget>,
    target_name: String,
    priority: u64,
    token: CancellationToken,
    plan: InliningPlan,
    state: Mutex<TaskState>,
    done: Condvar,
}

impl CompileTask {
    pub(crate) fn new(target: &Arc<CallTarget>, plan: InliningPlan, priority: u64) -> Arc<Self> {
        Arc::new(Self {
            target: Arc::downgrade(target),
            target_name: target.name().to_string(),
            priority,
            token: CancellationToken::new(),
            plan,
            state: Mutex::new(TaskState::Queued),
            done: Condvar::new(),
        })
    }

    /// The target this task compiles, if it is still alive.
    pub fn target(&self) -> Option<Arc<CallTarget>> {
        self.target.upgrade()
    }

    /// Name of the target, available even after the target died.
    #[inline]
    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Queue priority recorded at submission.
    #[inline]
    pub fn priority(&self) -> u64 {
        self.priority
    }

    /// The inlining plan computed at submission time.
    #[inline]
    pub fn plan(&self) -> &InliningPlan {
        &self.plan
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the cancel flag is set.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Current scheduling state.
    pub fn status(&self) -> TaskState {
        self.state.lock().clone()
    }

    /// Request cancellation.
    ///
    /// A queued task finishes as cancelled immediately and `true` is
    /// returned. A running task only has its flag set; the worker observes
    /// it and retires the task itself. Cancelling a finished task does
    /// nothing.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        match &*state {
            TaskState::Queued => {
                self.token.cancel();
                *state = TaskState::Done(TaskOutcome::Cancelled);
                self.done.notify_all();
                true
            }
            TaskState::Running => {
                self.token.cancel();
                false
            }
            TaskState::Done(_) => false,
        }
    }

    /// Block until the task is done and return its outcome.
    pub fn wait_done(&self) -> TaskOutcome {
        let mut state = self.state.lock();
        loop {
            if let TaskState::Done(outcome) = &*state {
                return outcome.clone();
            }
            self.done.wait(&mut state);
        }
    }

    /// Like [`wait_done`](Self::wait_done) with a timeout. `None` if the
    /// task is still pending when the timeout elapses.
    pub fn wait(&self, timeout: Duration) -> Option<TaskOutcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let TaskState::Done(outcome) = &*state {
                return Some(outcome.clone());
            }
            if self.done.wait_until(&mut state, deadline).timed_out() {
                return match &*state {
                    TaskState::Done(outcome) => Some(outcome.clone()),
                    _ => None,
                };
            }
        }
    }

    /// Worker-side transition Queued -> Running. `false` when the task was
    /// cancelled while waiting.
    pub(crate) fn start_running(&self) -> bool {
        let mut state = self.state.lock();
        match &*state {
            TaskState::Queued => {
                *state = TaskState::Running;
                true
            }
            _ => false,
        }
    }

    /// Record the terminal outcome and wake every waiter. First writer
    /// wins.
    pub(crate) fn finish(&self, outcome: TaskOutcome) {
        let mut state = self.state.lock();
        if !matches!(&*state, TaskState::Done(_)) {
            *state = TaskState::Done(outcome);
            self.done.notify_all();
        }
    }
}

impl std::fmt::Debug for CompileTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompileTask")
            .field("target", &self.target_name)
            .field("priority", &self.priority)
            .field("state", &self.status())
            .finish()
    }
}

// =============================================================================
// Queue
// =============================================================================

/// Priority queue of pending tasks plus the worker pool draining it.
pub(crate) struct CompileQueue {
    queue: Mutex<VecDeque<Arc<CompileTask>>>,
    available: Condvar,
    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) stats: QueueStats,
}

impl CompileQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            stats: QueueStats::default(),
        }
    }

    /// Insert by descending priority, FIFO among equal priorities.
    pub(crate) fn enqueue(&self, task: Arc<CompileTask>) -> Result<(), CompileError> {
        let mut queue = self.queue.lock();
        if self.shutdown.load(Ordering::Acquire) {
            self.stats.record_rejected();
            return Err(CompileError::QueueShutDown);
        }
        match queue.iter().position(|t| t.priority() < task.priority()) {
            Some(index) => queue.insert(index, task),
            None => queue.push_back(task),
        }
        self.stats.record_enqueued();
        self.available.notify_one();
        Ok(())
    }

    /// Block until a task is available. `None` means the queue shut down.
    fn next_task(&self) -> Option<Arc<CompileTask>> {
        let mut queue = self.queue.lock();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            if let Some(task) = queue.pop_front() {
                return Some(task);
            }
            self.available.wait(&mut queue);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Stop accepting work, retire everything still queued as cancelled,
    /// and wake the workers so they can exit.
    pub(crate) fn shutdown_now(&self) {
        let drained: Vec<Arc<CompileTask>> = {
            let mut queue = self.queue.lock();
            self.shutdown.store(true, Ordering::Release);
            queue.drain(..).collect()
        };
        for task in drained {
            self.stats.record_cancelled();
            if let Some(target) = task.target() {
                target.clear_task_if(&task);
            }
            task.finish(TaskOutcome::Cancelled);
        }
        self.available.notify_all();
    }

    /// Join every worker thread. Call after [`shutdown_now`](Self::shutdown_now).
    pub(crate) fn join_workers(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// Start `count` workers feeding from the shared queue.
pub(crate) fn spawn_workers(shared: &Arc<EngineShared>, count: usize) {
    let mut workers = shared.queue.workers.lock();
    for _ in 0..count {
        let shared = Arc::clone(shared);
        workers.push(std::thread::spawn(move || worker_loop(shared)));
    }
}

fn worker_loop(shared: Arc<EngineShared>) {
    while let Some(task) = shared.queue.next_task() {
        run_task(&shared, &task);
    }
}

/// Execute one task end to end: compile, route the result, retire the
/// task. Never panics out.
fn run_task(shared: &Arc<EngineShared>, task: &Arc<CompileTask>) {
    let Some(target) = task.target() else {
        shared.queue.stats.record_dead_target();
        task.finish(TaskOutcome::Cancelled);
        return;
    };
    if !task.start_running() {
        // Cancelled while queued; the canceller already reported it.
        shared.queue.stats.record_cancelled();
        target.clear_task_if(task);
        return;
    }
    shared
        .listeners
        .notify(|l| l.on_compilation_started(&target));

    // Consume a private copy of the plan with decisions that went stale
    // since submission demoted.
    let mut plan = task.plan().clone();
    plan.prune_stale();

    let result = catch_unwind(AssertUnwindSafe(|| {
        shared.backend.compile(&target, &plan, task.token())
    }))
    .unwrap_or_else(|_| {
        log::error!("compiler backend panicked on '{}'", target.name());
        Err(CompileError::permanent("compiler backend panicked"))
    });

    let outcome = match result {
        Ok(artifact) => {
            if task.is_cancelled() {
                // Too late to matter; drop the artifact on the floor.
                shared.queue.stats.record_cancelled();
                TaskOutcome::Cancelled
            } else {
                target.install_code(artifact, plan.inlined_assumptions());
                shared.queue.stats.record_installed();
                shared
                    .listeners
                    .notify(|l| l.on_compilation_succeeded(&target));
                TaskOutcome::Installed
            }
        }
        Err(CompileError::Cancelled) => {
            shared.queue.stats.record_cancelled();
            TaskOutcome::Cancelled
        }
        Err(err) => {
            shared.queue.stats.record_failed();
            shared
                .listeners
                .notify(|l| l.on_compilation_failed(&target, &err));
            if err.is_permanent() {
                target.profile().record_compile_failure();
                target.mark_compilation_failed();
                apply_failure_action(shared, &target, &err);
            } else {
                target
                    .profile()
                    .delay_compilation(shared.options.replace_reprofile_count);
                log::debug!("transient bailout on '{}': {err}", target.name());
            }
            TaskOutcome::Failed(err)
        }
    };

    // Free the slot before waking waiters so a finished target can be
    // resubmitted immediately.
    target.clear_task_if(task);
    task.finish(outcome);
}

fn apply_failure_action(shared: &Arc<EngineShared>, target: &Arc<CallTarget>, err: &CompileError) {
    match shared.options.failure_action {
        FailureAction::Silent => {}
        FailureAction::Print => {
            log::error!("compilation of '{}' failed: {err}", target.name());
        }
        FailureAction::Throw => {
            // The synchronous waiter receives the error from the outcome.
            log::debug!("compilation of '{}' failed: {err}", target.name());
        }
        FailureAction::Fatal => {
            log::error!("compilation of '{}' failed, terminating: {err}", target.name());
            std::process::exit(-1);
        }
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Monotone counters describing queue traffic.
#[derive(Debug, Default)]
pub(crate) struct QueueStats {
    enqueued: AtomicU64,
    installed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
    dead_targets: AtomicU64,
}

impl QueueStats {
    fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }
    fn record_installed(&self) {
        self.installed.fetch_add(1, Ordering::Relaxed);
    }
    fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
    fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }
    fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }
    fn record_dead_target(&self) {
        self.dead_targets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            installed: self.installed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dead_targets: self.dead_targets.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStatsSnapshot {
    /// Tasks accepted into the queue.
    pub enqueued: u64,
    /// Tasks that ended with code installed.
    pub installed: u64,
    /// Tasks that ended in a backend error.
    pub failed: u64,
    /// Tasks cancelled before or during compilation.
    pub cancelled: u64,
    /// Submissions rejected because the queue was shut down.
    pub rejected: u64,
    /// Tasks whose target died before a worker picked them up.
    pub dead_targets: u64,
}

// =============================================================================
// Tests
// =============================================================================
