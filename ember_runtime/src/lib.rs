//! # Ember Runtime
//!
//! Control plane for a self-optimizing execution engine. The crate owns the
//! machinery that decides *when* guest code is compiled, *what* gets inlined
//! or split in the process, and *how* optimized code is torn down again when
//! the speculation behind it stops holding.
//!
//! # Core Concepts
//!
//! - **Call targets**: The unit of compilation. Each [`CallTarget`] pairs an
//!   executable tree with an execution profile and at most one installed
//!   artifact, and routes every call to the best available tier.
//! - **Assumptions**: One-way boolean facts ([`Assumption`]) that optimized
//!   code is allowed to depend on. Invalidating an assumption tears down every
//!   dependent artifact exactly once.
//! - **Execution profiles**: Per-target counters and argument speculation
//!   ([`ExecutionProfile`]) feeding the hotness decision.
//! - **Compile queue**: A priority queue of [`CompileTask`]s drained by
//!   background workers with cooperative cancellation.
//! - **Inlining and splitting**: A budgeted inlining planner walks the direct
//!   call graph up front; the splitting strategy clones polymorphic callees
//!   per call site so their profiles re-specialize.
//!
//! # Tier Flow
//!
//! ```text
//!   interpreter call ──▶ profile ──▶ hot? ──▶ plan inlining ──▶ queue
//!                                                                 │
//!   compiled call ◀── install artifact ◀── compiler backend ◀── worker
//!        │
//!        ▼ (assumption invalidated / deopt)
//!   interpreter call
//! ```
//!
//! The engine is embedder-facing: guest language semantics live behind the
//! [`ExecutableTree`] and [`CompilerBackend`] traits supplied by the host.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod assumption;
pub mod compiler;
pub mod inlining;
pub mod listener;
pub mod profile;
pub mod queue;
mod registry;
pub mod runtime;
pub mod splitting;
pub mod target;
pub mod tree;

#[cfg(test)]
pub(crate) mod test_util;

// Re-export the primary API surface at the crate root.
pub use assumption::{Assumption, AssumptionDependent};
pub use compiler::{CompiledArtifact, CompilerBackend, Deoptimization};
pub use inlining::{
    DecisionProfile, DefaultInliningPolicy, InliningDecision, InliningPlan, InliningPlanner,
    InliningPolicy,
};
pub use listener::{RuntimeListener, StatisticsListener};
pub use profile::{ExecutionProfile, ProfileSnapshot};
pub use queue::{CompileTask, QueueStatsSnapshot, TaskOutcome, TaskState};
pub use runtime::EngineRuntime;
pub use target::{CallTarget, InstalledCode, TargetId};
pub use tree::{DirectCallSite, ExecutableTree, NodeCost};
