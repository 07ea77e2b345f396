//! Engine configuration.
//!
//! All knobs live in one plain struct so embedders can build, clone, and
//! tweak configurations without a builder ceremony. Defaults are tuned for
//! a long-running host; [`EngineOptions::for_testing`] produces a small,
//! synchronous configuration suitable for deterministic tests.

use std::time::Duration;

use crate::error::FailureAction;

/// Tunables for the compilation control plane.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Combined call + loop-iteration count a target must reach before it
    /// is considered hot.
    pub compile_threshold: u32,
    /// True invocations a target must reach regardless of loop count.
    /// Guards against compiling a function hot only through one long loop.
    pub min_invoke_threshold: u32,
    /// Maximum wall-clock window in which the thresholds must be reached.
    /// A target that takes longer restarts its hotness window: it is being
    /// called, but not at a rate worth compiling for.
    pub queue_delay: Duration,
    /// Submit compilations to background workers (`true`) or block the
    /// calling thread until the result is in (`false`).
    pub background_compilation: bool,
    /// Number of compile workers. `0` derives a count from the machine's
    /// available parallelism.
    pub compiler_threads: usize,
    /// Enable per-call-site splitting of polymorphic callees.
    pub splitting: bool,
    /// Non-trivial node ceiling above which a callee is never split.
    pub splitting_max_callee_size: usize,
    /// Enable the inlining planner. When off every plan is empty.
    pub inlining: bool,
    /// How many times the same callee may occur on the exploration stack
    /// before further descent counts as recursion.
    pub max_recursive_inlining: usize,
    /// Node budget for a compiled unit: the caller's own non-trivial nodes
    /// plus everything inlined into it.
    pub inlining_max_caller_size: usize,
    /// Extra interpreter calls required after a node replacement or a
    /// transient bailout before the target is compile-eligible again.
    pub replace_reprofile_count: u32,
    /// Policy applied when a compilation fails permanently.
    pub failure_action: FailureAction,
    /// Optional name-based eligibility filter.
    pub compile_only: Option<CompileFilter>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            compile_threshold: 1000,
            min_invoke_threshold: 3,
            queue_delay: Duration::from_secs(25),
            background_compilation: true,
            compiler_threads: 0,
            splitting: true,
            splitting_max_callee_size: 100,
            inlining: true,
            max_recursive_inlining: 2,
            inlining_max_caller_size: 2250,
            replace_reprofile_count: 3,
            failure_action: FailureAction::Silent,
            compile_only: None,
        }
    }
}

impl EngineOptions {
    /// Small synchronous configuration for deterministic tests: targets
    /// compile on the second call, on the calling thread, with one worker.
    pub fn for_testing() -> Self {
        EngineOptions {
            compile_threshold: 2,
            min_invoke_threshold: 1,
            queue_delay: Duration::from_secs(3600),
            background_compilation: false,
            compiler_threads: 1,
            ..EngineOptions::default()
        }
    }

    /// Resolves `compiler_threads`, mapping `0` to half the available
    /// parallelism (at least one worker).
    pub fn effective_compiler_threads(&self) -> usize {
        if self.compiler_threads != 0 {
            return self.compiler_threads;
        }
        std::thread::available_parallelism()
            .map(|n| (n.get() / 2).max(1))
            .unwrap_or(1)
    }
}

/// Name-based compilation eligibility filter.
///
/// The textual form is a comma-separated list of substrings; a `~` prefix
/// turns an entry into an exclusion. A name is accepted when it matches any
/// include (or the include list is empty) and matches no exclude.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileFilter {
    includes: Vec<String>,
    excludes: Vec<String>,
}

impl CompileFilter {
    /// Parses a filter from its textual form, e.g. `"fib,sort,~slowpath"`.
    pub fn parse(spec: &str) -> Self {
        let mut includes = Vec::new();
        let mut excludes = Vec::new();
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.strip_prefix('~') {
                Some(excluded) => excludes.push(excluded.to_string()),
                None => includes.push(part.to_string()),
            }
        }
        CompileFilter { includes, excludes }
    }

    /// Whether a target with this name may be compiled. Exclusion wins.
    pub fn accepts(&self, name: &str) -> bool {
        if self.excludes.iter().any(|e| name.contains(e.as_str())) {
            return false;
        }
        self.includes.is_empty() || self.includes.iter().any(|i| name.contains(i.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------
    // Options
    // -------------------------------------------------------------------

    #[test]
    fn test_default_options() {
        let opts = EngineOptions::default();
        assert_eq!(opts.compile_threshold, 1000);
        assert_eq!(opts.min_invoke_threshold, 3);
        assert!(opts.background_compilation);
        assert!(opts.splitting);
        assert!(opts.inlining);
        assert_eq!(opts.failure_action, FailureAction::Silent);
        assert!(opts.compile_only.is_none());
    }

    #[test]
    fn test_testing_options_are_synchronous() {
        let opts = EngineOptions::for_testing();
        assert!(!opts.background_compilation);
        assert_eq!(opts.compile_threshold, 2);
        assert_eq!(opts.effective_compiler_threads(), 1);
    }

    #[test]
    fn test_effective_threads_never_zero() {
        let mut opts = EngineOptions::default();
        opts.compiler_threads = 0;
        assert!(opts.effective_compiler_threads() >= 1);
        opts.compiler_threads = 3;
        assert_eq!(opts.effective_compiler_threads(), 3);
    }

    // -------------------------------------------------------------------
    // Filter
    // -------------------------------------------------------------------

    #[test]
    fn test_filter_parse() {
        let filter = CompileFilter::parse("fib, sort ,~slowpath");
        assert!(filter.accepts("fib"));
        assert!(filter.accepts("quick_sort"));
        assert!(!filter.accepts("fib_slowpath"));
        assert!(!filter.accepts("unrelated"));
    }

    #[test]
    fn test_empty_include_admits_everything() {
        let filter = CompileFilter::parse("~internal");
        assert!(filter.accepts("user_code"));
        assert!(!filter.accepts("internal_helper"));
        assert!(CompileFilter::default().accepts("anything"));
    }

    #[test]
    fn test_blank_entries_ignored() {
        let filter = CompileFilter::parse(" , ,fib,");
        assert!(filter.accepts("fib"));
        assert!(!filter.accepts("other"));
    }
}
