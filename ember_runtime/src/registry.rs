//! Weak registry of every call target the engine created.
//!
//! The engine never keeps targets alive; callers own them. The registry
//! exists for introspection (enumerating live targets) and prunes dead
//! entries whenever it is walked.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::target::{CallTarget, TargetId};

pub(crate) struct TargetRegistry {
    targets: Mutex<FxHashMap<TargetId, Weak<CallTarget>>>,
}

impl TargetRegistry {
    pub(crate) fn new() -> Self {
        Self {
            targets: Mutex::new(FxHashMap::default()),
        }
    }

    pub(crate) fn register(&self, target: &Arc<CallTarget>) {
        self.targets
            .lock()
            .insert(target.id(), Arc::downgrade(target));
    }

    pub(crate) fn get(&self, id: TargetId) -> Option<Arc<CallTarget>> {
        self.targets.lock().get(&id).and_then(Weak::upgrade)
    }

    /// All currently live targets. Dead entries are dropped on the way.
    pub(crate) fn snapshot(&self) -> Vec<Arc<CallTarget>> {
        let mut targets = self.targets.lock();
        let mut live = Vec::with_capacity(targets.len());
        targets.retain(|_, weak| match weak.upgrade() {
            Some(target) => {
                live.push(target);
                true
            }
            None => false,
        });
        live
    }

    pub(crate) fn len(&self) -> usize {
        self.targets.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use ember_core::Value;

    #[test]
    fn test_snapshot_prunes_dead_targets() {
        let engine = cold_engine();
        let keep = engine.create_target("keep", leaf_tree(1, Value::Null));
        let registry = TargetRegistry::new();
        registry.register(&keep);
        {
            let drop_me = engine.create_target("drop", leaf_tree(1, Value::Null));
            registry.register(&drop_me);
            assert_eq!(registry.len(), 2);
        }

        let live = registry.snapshot();
        assert_eq!(live.len(), 1);
        assert!(Arc::ptr_eq(&live[0], &keep));
        assert_eq!(registry.len(), 1);

        assert!(registry.get(keep.id()).is_some());
        engine.shutdown();
    }
}
