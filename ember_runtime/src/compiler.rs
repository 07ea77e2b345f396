//! The seam between the engine and an actual compiler.
//!
//! The engine decides *when* to compile; a [`CompilerBackend`] decides
//! *how*. Backends receive the target, the inlining plan computed at
//! submission time, and a cancellation token they are expected to poll at
//! convenient safepoints.

use std::sync::Arc;

use ember_core::{AssumptionInvalid, CancellationToken, CompileError, Value};

use crate::assumption::Assumption;
use crate::inlining::InliningPlan;
use crate::target::CallTarget;

/// A request from compiled code to resume in the interpreter.
///
/// Deoptimization is not an error condition for the caller: the engine
/// catches it at the call boundary and transparently re-executes the call
/// in the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deoptimization {
    /// Human-readable cause, for diagnostics.
    pub reason: String,
}

impl Deoptimization {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<AssumptionInvalid> for Deoptimization {
    fn from(err: AssumptionInvalid) -> Self {
        Deoptimization::new(err.to_string())
    }
}

impl std::fmt::Display for Deoptimization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "deoptimization: {}", self.reason)
    }
}

/// Machine code (or any stand-in for it) produced by a backend.
pub trait CompiledArtifact: Send + Sync {
    /// Execute the compiled code. `Err` requests deoptimization; the
    /// engine falls back to the interpreter and keeps the call alive.
    fn execute(&self, args: &[Value]) -> Result<Value, Deoptimization>;

    /// Assumptions this artifact baked in beyond the ones recorded in the
    /// inlining plan. They are registered against the installed code
    /// automatically.
    fn assumptions(&self) -> Vec<Arc<Assumption>> {
        Vec::new()
    }
}

/// A compiler, viewed from the engine.
///
/// `compile` runs on a compiler worker thread (or on the submitting thread
/// in synchronous mode) and must be safe to call from several workers at
/// once for different targets.
pub trait CompilerBackend: Send + Sync {
    /// Compile `target` according to `plan`.
    ///
    /// Backends should poll `cancel` between phases and bail out with
    /// [`CompileError::Cancelled`] when it fires; the engine also discards
    /// artifacts whose token fired during compilation.
    fn compile(
        &self,
        target: &Arc<CallTarget>,
        plan: &InliningPlan,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn CompiledArtifact>, CompileError>;
}
