//! Revocable facts that compiled code depends on.
//!
//! An [`Assumption`] is a one-way boolean: it starts valid and can only ever
//! become invalid. Compiled code registers itself as a dependent; when the
//! fact is revoked every dependent is notified exactly once. Registration
//! and invalidation are serialized on the dependent list, so a dependent
//! registered concurrently with `invalidate` is either notified by that
//! invalidation or rejected at registration time. No notification is lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

use parking_lot::Mutex;

use ember_core::AssumptionInvalid;

/// Something that must react when an assumption it depends on is revoked.
///
/// Dependents are held weakly. A dependent that has been dropped is skipped
/// during notification.
pub trait AssumptionDependent: Send + Sync {
    /// Called exactly once, from the invalidating thread, while the
    /// assumption's dependent list is locked. Implementations must not
    /// register new dependents on the same assumption from inside this
    /// callback.
    fn on_assumption_invalidated(&self, assumption: &str, reason: &str);
}

/// A named fact that holds until revoked.
#[derive(Debug)]
pub struct Assumption {
    name: Box<str>,
    valid: AtomicBool,
    dependents: Mutex<Vec<Weak<dyn AssumptionDependent>>>,
}

impl Assumption {
    /// Create a valid assumption. The name only shows up in diagnostics and
    /// error messages.
    pub fn new(name: impl Into<Box<str>>) -> Self {
        Self {
            name: name.into(),
            valid: AtomicBool::new(true),
            dependents: Mutex::new(Vec::new()),
        }
    }

    /// The diagnostic name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the fact still holds.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Fallible form of [`is_valid`](Self::is_valid) for speculation sites
    /// that want to propagate the failure.
    pub fn check(&self) -> Result<(), AssumptionInvalid> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(AssumptionInvalid {
                name: self.name.to_string(),
            })
        }
    }

    /// Register a dependent to be notified on invalidation.
    ///
    /// If the assumption is already invalid the dependent is notified
    /// immediately on the calling thread and a diagnostic is logged, so the
    /// caller cannot end up holding code pinned to a dead fact.
    pub fn register_dependent(&self, dependent: Weak<dyn AssumptionDependent>) {
        let mut dependents = self.dependents.lock();
        if !self.is_valid() {
            drop(dependents);
            log::debug!(
                "dependent registered on already-invalid assumption '{}'",
                self.name
            );
            if let Some(dependent) = dependent.upgrade() {
                dependent.on_assumption_invalidated(&self.name, "registered after invalidation");
            }
            return;
        }
        dependents.push(dependent);
    }

    /// Revoke the fact and notify every live dependent.
    ///
    /// Idempotent: only the first call flips the flag and performs the
    /// fan-out. The dependent list stays locked for the duration of the
    /// fan-out; the validity flag is flipped before the first callback runs,
    /// so a dependent that re-enters `invalidate` returns through the
    /// fast path instead of deadlocking.
    pub fn invalidate(&self, reason: &str) {
        if !self.is_valid() {
            return;
        }
        let mut dependents = self.dependents.lock();
        if self.valid.swap(false, Ordering::AcqRel) {
            log::trace!("assumption '{}' invalidated: {}", self.name, reason);
            for dependent in dependents.drain(..) {
                if let Some(dependent) = dependent.upgrade() {
                    dependent.on_assumption_invalidated(&self.name, reason);
                }
            }
        }
    }

    /// Number of dependents still alive. Prunes dropped entries as a side
    /// effect.
    pub fn dependent_count(&self) -> usize {
        let mut dependents = self.dependents.lock();
        dependents.retain(|d| d.strong_count() > 0);
        dependents.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
