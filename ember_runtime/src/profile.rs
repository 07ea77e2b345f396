//! Per-target execution feedback.
//!
//! Every call target owns an [`ExecutionProfile`]: a set of monotone
//! counters that drive the hotness decision, plus kind speculation for
//! arguments and return values. Counters are plain relaxed atomics; they
//! are statistics, not synchronization.
//!
//! Speculation follows a one-way lattice per slot:
//!
//! ```text
//! Unprofiled -> Speculated(kinds, assumption) -> Generic
//! ```
//!
//! Each transition out of `Speculated` invalidates the assumption that
//! guarded the superseded state, so compiled code that baked the old kinds
//! in is torn down with it.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use smallvec::SmallVec;

use ember_core::{EngineOptions, Value, ValueKind};

use crate::assumption::Assumption;

/// Argument lists longer than this are not worth speculating on.
pub const MAX_PROFILED_ARGS: usize = 64;

/// Speculated per-argument kinds. `None` marks a slot that has seen more
/// than one kind and was widened to generic.
pub type ArgumentKinds = SmallVec<[Option<ValueKind>; 8]>;

#[derive(Debug)]
enum SpeculationState<T> {
    Unprofiled,
    Speculated { kinds: T, assumption: Arc<Assumption> },
    Generic,
}

/// Counter baselines for the hotness window.
///
/// Counters never decrease, so "recent" activity is measured against a
/// baseline captured when the window was last restarted.
#[derive(Debug, Default)]
struct HotnessWindow {
    started: Option<Instant>,
    base_calls: u32,
    base_call_and_loop: u32,
}

// =============================================================================
// Execution Profile
// =============================================================================

/// Execution feedback for one call target.
#[derive(Debug)]
pub struct ExecutionProfile {
    interpreter_calls: AtomicU32,
    call_and_loop: AtomicU32,
    direct_calls: AtomicU64,
    indirect_calls: AtomicU64,
    inlined_calls: AtomicU64,
    loop_iterations: AtomicU64,
    compile_failures: AtomicU32,
    deopts: AtomicU32,
    /// Interpreter-call count the target must reach before it may be
    /// submitted (again). Raised after node rewrites and transient
    /// compiler bailouts.
    compile_floor: AtomicU32,
    window: Mutex<HotnessWindow>,
    arguments: Mutex<SpeculationState<ArgumentKinds>>,
    return_kind: Mutex<SpeculationState<ValueKind>>,
}

impl ExecutionProfile {
    pub fn new() -> Self {
        Self {
            interpreter_calls: AtomicU32::new(0),
            call_and_loop: AtomicU32::new(0),
            direct_calls: AtomicU64::new(0),
            indirect_calls: AtomicU64::new(0),
            inlined_calls: AtomicU64::new(0),
            loop_iterations: AtomicU64::new(0),
            compile_failures: AtomicU32::new(0),
            deopts: AtomicU32::new(0),
            compile_floor: AtomicU32::new(0),
            window: Mutex::new(HotnessWindow::default()),
            arguments: Mutex::new(SpeculationState::Unprofiled),
            return_kind: Mutex::new(SpeculationState::Unprofiled),
        }
    }

    // -------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------

    /// Record one interpreter entry. Returns the new call count.
    pub fn record_interpreter_call(&self) -> u32 {
        let calls = self.interpreter_calls.fetch_add(1, Ordering::Relaxed) + 1;
        self.call_and_loop.fetch_add(1, Ordering::Relaxed);
        if calls == 1 {
            self.window.lock().started = Some(Instant::now());
        }
        calls
    }

    /// Record back-edges reported by the interpreter. Loop iterations count
    /// toward the combined hotness counter, saturating instead of wrapping.
    pub fn record_loop_iterations(&self, iterations: u32) {
        self.loop_iterations
            .fetch_add(u64::from(iterations), Ordering::Relaxed);
        let _ = self
            .call_and_loop
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_add(iterations))
            });
    }

    /// Record a dispatch through a direct call site.
    #[inline]
    pub fn record_direct_call(&self) {
        self.direct_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dispatch through the generic entry point.
    #[inline]
    pub fn record_indirect_call(&self) {
        self.indirect_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an execution inlined into a compiling caller.
    #[inline]
    pub fn record_inlined_call(&self) {
        self.inlined_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a deoptimization of this target's compiled code.
    #[inline]
    pub fn record_deopt(&self) {
        self.deopts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a permanent compilation failure.
    #[inline]
    pub fn record_compile_failure(&self) {
        self.compile_failures.fetch_add(1, Ordering::Relaxed);
    }

    // -------------------------------------------------------------------
    // Hotness
    // -------------------------------------------------------------------

    /// Whether the target currently qualifies for compilation.
    ///
    /// All thresholds are measured against the current hotness window. A
    /// target that crossed the thresholds slower than `queue_delay` has its
    /// window restarted and must re-earn the counts; the counters themselves
    /// keep growing monotonically.
    pub fn is_hot(&self, options: &EngineOptions) -> bool {
        let calls = self.interpreter_calls.load(Ordering::Relaxed);
        if calls < options.min_invoke_threshold || calls < self.compile_floor.load(Ordering::Relaxed)
        {
            return false;
        }
        let call_and_loop = self.call_and_loop.load(Ordering::Relaxed);
        if call_and_loop < options.compile_threshold {
            return false;
        }

        let mut window = self.window.lock();
        let recent_calls = calls.saturating_sub(window.base_calls);
        let recent_call_and_loop = call_and_loop.saturating_sub(window.base_call_and_loop);
        if recent_calls < options.min_invoke_threshold
            || recent_call_and_loop < options.compile_threshold
        {
            return false;
        }
        if let Some(started) = window.started {
            if started.elapsed() > options.queue_delay {
                // Thresholds were reached, but too slowly to be worth
                // compiling yet. Restart the window.
                window.started = Some(Instant::now());
                window.base_calls = calls;
                window.base_call_and_loop = call_and_loop;
                return false;
            }
        }
        true
    }

    /// Require `additional_calls` more interpreter calls before the target
    /// qualifies for compilation again.
    pub fn delay_compilation(&self, additional_calls: u32) {
        let floor = self
            .interpreter_calls
            .load(Ordering::Relaxed)
            .saturating_add(additional_calls);
        self.compile_floor.store(floor, Ordering::Relaxed);
    }

    /// Reset the hotness counters so the target must re-prove itself.
    ///
    /// Clears interpreter calls, the combined counter, loop iterations, the
    /// compile floor and the window. Dispatch statistics, failure and
    /// deoptimization counts, and kind speculation all survive.
    pub fn reset_hotness(&self) {
        self.interpreter_calls.store(0, Ordering::Relaxed);
        self.call_and_loop.store(0, Ordering::Relaxed);
        self.loop_iterations.store(0, Ordering::Relaxed);
        self.compile_floor.store(0, Ordering::Relaxed);
        *self.window.lock() = HotnessWindow::default();
    }

    // -------------------------------------------------------------------
    // Kind speculation
    // -------------------------------------------------------------------

    /// Fold one observed argument list into the speculation lattice.
    pub fn profile_arguments(&self, args: &[Value]) {
        let mut stale: Option<Arc<Assumption>> = None;
        {
            let mut state = self.arguments.lock();
            if matches!(*state, SpeculationState::Generic) {
                return;
            }
            let next = match std::mem::replace(&mut *state, SpeculationState::Generic) {
                SpeculationState::Unprofiled => {
                    if args.len() > MAX_PROFILED_ARGS {
                        SpeculationState::Generic
                    } else {
                        SpeculationState::Speculated {
                            kinds: args.iter().map(|a| Some(a.kind())).collect(),
                            assumption: Arc::new(Assumption::new("profiled argument kinds")),
                        }
                    }
                }
                SpeculationState::Speculated {
                    mut kinds,
                    assumption,
                } => {
                    if args.len() != kinds.len() {
                        stale = Some(assumption);
                        SpeculationState::Generic
                    } else {
                        let mut widened = false;
                        for (slot, arg) in kinds.iter_mut().zip(args) {
                            if matches!(slot, Some(kind) if *kind != arg.kind()) {
                                *slot = None;
                                widened = true;
                            }
                        }
                        if !widened {
                            SpeculationState::Speculated { kinds, assumption }
                        } else {
                            stale = Some(assumption);
                            if kinds.iter().all(Option::is_none) {
                                SpeculationState::Generic
                            } else {
                                SpeculationState::Speculated {
                                    kinds,
                                    assumption: Arc::new(Assumption::new(
                                        "profiled argument kinds",
                                    )),
                                }
                            }
                        }
                    }
                }
                SpeculationState::Generic => SpeculationState::Generic,
            };
            *state = next;
        }
        if let Some(old) = stale {
            old.invalidate("argument kinds widened");
        }
    }

    /// Fold one observed return value into the speculation lattice.
    pub fn profile_return_value(&self, value: &Value) {
        let mut stale: Option<Arc<Assumption>> = None;
        {
            let mut state = self.return_kind.lock();
            match &*state {
                SpeculationState::Unprofiled => {
                    *state = SpeculationState::Speculated {
                        kinds: value.kind(),
                        assumption: Arc::new(Assumption::new("profiled return kind")),
                    };
                }
                SpeculationState::Speculated { kinds, assumption } => {
                    if *kinds != value.kind() {
                        stale = Some(assumption.clone());
                        *state = SpeculationState::Generic;
                    }
                }
                SpeculationState::Generic => {}
            }
        }
        if let Some(old) = stale {
            old.invalidate("return kind widened");
        }
    }

    /// The speculated argument kinds and their guard, if speculation is
    /// still live. A compiler consuming the kinds must register compiled
    /// code on the returned assumption.
    pub fn speculated_argument_kinds(&self) -> Option<(ArgumentKinds, Arc<Assumption>)> {
        match &*self.arguments.lock() {
            SpeculationState::Speculated { kinds, assumption } => {
                Some((kinds.clone(), assumption.clone()))
            }
            _ => None,
        }
    }

    /// The speculated return kind and its guard, if speculation is still
    /// live.
    pub fn speculated_return_kind(&self) -> Option<(ValueKind, Arc<Assumption>)> {
        match &*self.return_kind.lock() {
            SpeculationState::Speculated { kinds, assumption } => {
                Some((*kinds, assumption.clone()))
            }
            _ => None,
        }
    }

    // -------------------------------------------------------------------
    // Reading
    // -------------------------------------------------------------------

    #[inline]
    pub fn interpreter_call_count(&self) -> u32 {
        self.interpreter_calls.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn call_and_loop_count(&self) -> u32 {
        self.call_and_loop.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn deopt_count(&self) -> u32 {
        self.deopts.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn compile_failure_count(&self) -> u32 {
        self.compile_failures.load(Ordering::Relaxed)
    }

    /// Copy out all counters at once.
    pub fn snapshot(&self) -> ProfileSnapshot {
        ProfileSnapshot {
            interpreter_calls: self.interpreter_calls.load(Ordering::Relaxed),
            call_and_loop: self.call_and_loop.load(Ordering::Relaxed),
            direct_calls: self.direct_calls.load(Ordering::Relaxed),
            indirect_calls: self.indirect_calls.load(Ordering::Relaxed),
            inlined_calls: self.inlined_calls.load(Ordering::Relaxed),
            loop_iterations: self.loop_iterations.load(Ordering::Relaxed),
            compile_failures: self.compile_failures.load(Ordering::Relaxed),
            deopts: self.deopts.load(Ordering::Relaxed),
        }
    }
}

impl Default for ExecutionProfile {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of a profile's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProfileSnapshot {
    pub interpreter_calls: u32,
    pub call_and_loop: u32,
    pub direct_calls: u64,
    pub indirect_calls: u64,
    pub inlined_calls: u64,
    pub loop_iterations: u64,
    pub compile_failures: u32,
    pub deopts: u32,
}

// =============================================================================
// Tests
// =============================================================================
