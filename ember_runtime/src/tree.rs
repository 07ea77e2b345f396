//! The boundary between the engine and guest-language trees.
//!
//! The engine never inspects tree internals. Everything it needs for
//! heuristics flows through [`ExecutableTree`]: an execute entry point, a
//! node-cost census, the list of direct call sites, and an optional
//! uninitialized-clone operation used by splitting.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use ember_core::Value;

use crate::splitting;
use crate::target::CallTarget;

// =============================================================================
// Node Cost
// =============================================================================

/// Cost class of a tree node, ordered from cheapest to most expensive.
///
/// The ordering is meaningful: `count_nodes(NodeCost::Monomorphic)` counts
/// every node whose class is `Monomorphic` or worse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeCost {
    /// Structural nodes that compile away entirely.
    Trivial,
    /// Nodes specialized to a single observed shape.
    Monomorphic,
    /// Nodes that have observed a small number of shapes.
    Polymorphic,
    /// Nodes that gave up on specialization.
    Megamorphic,
}

impl NodeCost {
    /// Whether this node contributes nothing to compiled code size.
    #[inline]
    pub fn is_trivial(self) -> bool {
        self == NodeCost::Trivial
    }
}

// =============================================================================
// Executable Tree
// =============================================================================

/// A guest-language function body, opaque to the engine.
///
/// Implementations must be thread-safe: the interpreter may execute the tree
/// on any number of host threads while compiler workers walk it for size and
/// call-site information.
pub trait ExecutableTree: Send + Sync {
    /// Execute the tree in the interpreter.
    fn execute(&self, args: &[Value]) -> Value;

    /// Count the nodes whose cost class is `at_least` or worse.
    fn count_nodes(&self, at_least: NodeCost) -> usize;

    /// The direct (statically known callee) call sites contained in this
    /// tree, in source order.
    fn direct_call_sites(&self) -> Vec<Arc<DirectCallSite>>;

    /// Whether the splitting strategy may clone this tree.
    fn cloning_allowed(&self) -> bool {
        false
    }

    /// Produce an uninitialized copy of this tree: same structure, with all
    /// profiling feedback discarded and fresh call sites pointing at the
    /// original callees. Returns `None` when the tree cannot be cloned.
    fn clone_uninitialized(&self) -> Option<Arc<dyn ExecutableTree>> {
        None
    }
}

// =============================================================================
// Direct Call Site
// =============================================================================

/// A call site whose callee is known statically.
///
/// A site starts out dispatching to its source callee. The splitting
/// strategy may later install a private clone of the callee; from then on
/// the site dispatches to the clone. The source callee never changes.
pub struct DirectCallSite {
    source_callee: Arc<CallTarget>,
    split_callee: Mutex<Option<Arc<CallTarget>>>,
    /// The target whose tree contains this site. Set once during adoption.
    enclosing: OnceLock<Weak<CallTarget>>,
    calls: AtomicU32,
}

impl DirectCallSite {
    /// Create a site dispatching to `callee`.
    pub fn new(callee: Arc<CallTarget>) -> Self {
        Self {
            source_callee: callee,
            split_callee: Mutex::new(None),
            enclosing: OnceLock::new(),
            calls: AtomicU32::new(0),
        }
    }

    /// Dispatch a call through this site.
    ///
    /// The second call through a site is the splitting decision point: by
    /// then the callee has one call's worth of feedback and a second caller
    /// is about to pollute it.
    pub fn call(&self, args: &[Value]) -> Value {
        let count = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if count == 2 {
            splitting::before_second_call(self);
        }
        self.current_callee().call_direct(args)
    }

    /// Number of calls dispatched through this site.
    #[inline]
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }

    /// The callee this site currently dispatches to: the split clone when
    /// one was installed, the source callee otherwise.
    pub fn current_callee(&self) -> Arc<CallTarget> {
        if let Some(split) = self.split_callee.lock().clone() {
            return split;
        }
        self.source_callee.clone()
    }

    /// The original callee this site was created with.
    #[inline]
    pub fn source_callee(&self) -> &Arc<CallTarget> {
        &self.source_callee
    }

    /// Whether a split clone has been installed.
    pub fn is_split(&self) -> bool {
        self.split_callee.lock().is_some()
    }

    /// Split this site unconditionally, bypassing the size and polymorphism
    /// heuristics. Returns `false` if the site is already split or the
    /// callee cannot be cloned.
    pub fn force_split(&self) -> bool {
        splitting::force_split(self)
    }

    /// Record the target whose tree adopted this site. Idempotent; only the
    /// first adoption sticks.
    pub(crate) fn attach(&self, enclosing: &Arc<CallTarget>) {
        let _ = self.enclosing.set(Arc::downgrade(enclosing));
    }

    /// The adopting target, if it is still alive.
    pub(crate) fn enclosing_target(&self) -> Option<Arc<CallTarget>> {
        self.enclosing.get().and_then(Weak::upgrade)
    }

    /// Installs a split clone. First writer wins; a racing second clone is
    /// dropped and reclaimed through the registry's weak entries.
    pub(crate) fn install_split(&self, clone: Arc<CallTarget>) {
        let mut slot = self.split_callee.lock();
        if slot.is_none() {
            *slot = Some(clone);
        }
    }
}

impl std::fmt::Debug for DirectCallSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectCallSite")
            .field("source_callee", &self.source_callee.name())
            .field("is_split", &self.is_split())
            .field("calls", &self.call_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{cold_engine, leaf_tree};

    #[test]
    fn test_node_cost_ordering() {
        assert!(NodeCost::Trivial < NodeCost::Monomorphic);
        assert!(NodeCost::Monomorphic < NodeCost::Polymorphic);
        assert!(NodeCost::Polymorphic < NodeCost::Megamorphic);
        assert!(NodeCost::Trivial.is_trivial());
        assert!(!NodeCost::Polymorphic.is_trivial());
    }

    #[test]
    fn test_site_counts_and_dispatches() {
        let engine = cold_engine();
        let callee = engine.create_target("callee", leaf_tree(5, Value::Int(7)));
        let site = DirectCallSite::new(callee.clone());

        assert_eq!(site.call_count(), 0);
        assert_eq!(site.call(&[]), Value::Int(7));
        assert_eq!(site.call(&[]), Value::Int(7));
        assert_eq!(site.call_count(), 2);
        assert_eq!(callee.profile().interpreter_call_count(), 2);
        engine.shutdown();
    }

    #[test]
    fn test_current_callee_prefers_split() {
        let engine = cold_engine();
        let a = engine.create_target("a", leaf_tree(5, Value::Int(1)));
        let b = engine.create_target("b", leaf_tree(5, Value::Int(2)));
        let site = DirectCallSite::new(a.clone());

        assert!(Arc::ptr_eq(&site.current_callee(), &a));
        site.install_split(b.clone());
        assert!(site.is_split());
        assert!(Arc::ptr_eq(&site.current_callee(), &b));
        assert!(Arc::ptr_eq(site.source_callee(), &a));
        assert_eq!(site.call(&[]), Value::Int(2));
        engine.shutdown();
    }
}
