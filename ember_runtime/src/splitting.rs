//! Per-call-site splitting of polymorphic callees.
//!
//! A callee shared by many call sites accumulates merged type feedback and
//! compiles conservatively. Splitting gives a call site a private,
//! uninitialized clone of the callee so the clone can re-specialize on
//! that site's values alone.
//!
//! The decision point is the second call through a site: by then the
//! callee has feedback from one caller and a second round is about to mix
//! into it. Clones are never split again, so every split target is one
//! step from an original and chains cannot form.

use crate::tree::{DirectCallSite, NodeCost};

/// Splitting hook invoked by a site on exactly its second call.
pub(crate) fn before_second_call(site: &DirectCallSite) {
    if should_split(site) {
        split(site);
    }
}

/// Whether the heuristics want a private callee copy for this site.
///
/// Requires a live enclosing target, splitting enabled, a clonable
/// not-yet-split callee smaller than `splitting_max_callee_size`, and a
/// site that is not (mutually) recursive. Callees with more than one
/// nested direct call must additionally show polymorphism, otherwise the
/// clone would only duplicate code without sharpening any feedback.
pub fn should_split(site: &DirectCallSite) -> bool {
    let Some(enclosing) = site.enclosing_target() else {
        return false;
    };
    let options = enclosing.engine_options();
    if !options.splitting || site.is_split() {
        return false;
    }
    let callee = site.source_callee();
    if callee.is_split() || !callee.tree().cloning_allowed() {
        return false;
    }
    if callee.non_trivial_node_count() >= options.splitting_max_callee_size {
        return false;
    }
    if enclosing.is_same_or_split(callee) {
        return false;
    }
    let nested_sites = callee.tree().direct_call_sites().len();
    nested_sites <= 1 || callee.tree().count_nodes(NodeCost::Polymorphic) > 0
}

/// Clone the callee and rebind the site to the clone.
pub(crate) fn split(site: &DirectCallSite) -> bool {
    match site.source_callee().create_split() {
        Some(clone) => {
            log::debug!(
                "split '{}' into '{}'",
                site.source_callee().name(),
                clone.name()
            );
            site.install_split(clone);
            true
        }
        None => false,
    }
}

/// Split regardless of size and polymorphism heuristics. Splitting must
/// still be enabled, the site not already split, and the callee clonable.
pub(crate) fn force_split(site: &DirectCallSite) -> bool {
    if site.is_split() {
        return false;
    }
    let callee = site.source_callee();
    if !callee.engine_options().splitting || callee.is_split() || !callee.tree().cloning_allowed()
    {
        return false;
    }
    split(site)
}

// =============================================================================
// Tests
// =============================================================================
