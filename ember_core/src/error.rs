//! Error taxonomy for the compilation control plane.
//!
//! Three of the four conditions modeled here are not errors in the usual
//! sense: a transient bailout is retried, a cancellation is "no result",
//! and an invalid assumption is a control transfer back to the interpreter.
//! Only a permanent failure is ever surfaced to user code, and then only
//! under [`FailureAction::Throw`].

use thiserror::Error;

/// Why a compilation attempt did not produce installable code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The backend refused this attempt but a later one may succeed.
    /// Retried silently after a reprofiling delay.
    #[error("transient bailout: {reason}")]
    TransientBailout {
        /// Backend-supplied explanation.
        reason: String,
    },

    /// The target cannot be compiled. It is latched as failed and never
    /// resubmitted automatically.
    #[error("permanent compilation failure: {reason}")]
    PermanentFailure {
        /// Backend-supplied explanation.
        reason: String,
    },

    /// The cooperative cancel flag was observed mid-compile.
    #[error("compilation cancelled")]
    Cancelled,

    /// The compile queue rejected the submission because it is shut down.
    #[error("compile queue is shut down")]
    QueueShutDown,
}

impl CompileError {
    /// Whether this outcome latches the target as permanently failed.
    #[inline]
    pub fn is_permanent(&self) -> bool {
        matches!(self, CompileError::PermanentFailure { .. })
    }

    /// Builds a transient bailout with the given reason.
    pub fn bailout(reason: impl Into<String>) -> Self {
        CompileError::TransientBailout { reason: reason.into() }
    }

    /// Builds a permanent failure with the given reason.
    pub fn permanent(reason: impl Into<String>) -> Self {
        CompileError::PermanentFailure { reason: reason.into() }
    }
}

/// Signal that a speculative fact no longer holds.
///
/// Compiled code that checked a dead assumption converts this into a
/// deoptimization: control transfers back to the interpreter. It is never
/// reported to user code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("assumption '{name}' is no longer valid")]
pub struct AssumptionInvalid {
    /// Name of the assumption that failed the check.
    pub name: String,
}

/// What to do when a compilation fails permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureAction {
    /// Keep running interpreted; say nothing.
    #[default]
    Silent,
    /// Log the failure through the `log` facade.
    Print,
    /// Propagate the error to a synchronous waiter.
    Throw,
    /// Log and terminate the process. Diagnostic mode only.
    Fatal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanence() {
        assert!(CompileError::permanent("graph too large").is_permanent());
        assert!(!CompileError::bailout("not yet").is_permanent());
        assert!(!CompileError::Cancelled.is_permanent());
        assert!(!CompileError::QueueShutDown.is_permanent());
    }

    #[test]
    fn test_display() {
        let err = CompileError::bailout("loop not profiled");
        assert_eq!(err.to_string(), "transient bailout: loop not profiled");
        let gone = AssumptionInvalid { name: "int arithmetic".into() };
        assert_eq!(gone.to_string(), "assumption 'int arithmetic' is no longer valid");
    }

    #[test]
    fn test_default_action_is_silent() {
        assert_eq!(FailureAction::default(), FailureAction::Silent);
    }
}
