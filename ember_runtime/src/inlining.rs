//! Inlining plans: which callees a compilation should pull into the root.
//!
//! Planning happens in two phases over an explicit frame stack (the call
//! graph can be deeper than the native stack is worth betting on):
//!
//! 1. **Exploration.** Walk direct call sites depth-first. Descent into a
//!    callee is gated by an optimistic probe: the policy is asked whether
//!    the callee would be worth inlining at its own (not yet expanded)
//!    size. Recursion is cut off when the callee is the root itself, when
//!    the same callee already occurs more than `max_recursive_inlining`
//!    times on the stack, or at a hard depth ceiling.
//! 2. **Decision.** When a level is fully explored its decisions are
//!    sorted by score (descending, stable on discovery order) and accepted
//!    greedily against a running deep-node total seeded with the caller's
//!    own node count. Rejected decisions stay in the plan for diagnostics
//!    but their subtrees are discarded.
//!
//! A plan is a snapshot: it records the callee each site dispatched to at
//! planning time. Consumers call [`InliningPlan::prune_stale`] to demote
//! decisions whose site has been retargeted (by splitting or re-creation)
//! since.

use std::collections::VecDeque;
use std::sync::Arc;

use ember_core::EngineOptions;

use crate::assumption::Assumption;
use crate::target::CallTarget;
use crate::tree::DirectCallSite;

/// Hard ceiling on exploration depth.
pub const MAX_INLINE_DEPTH: usize = 15;

const REASON_RECURSIVE: &str = "recursive call";
const REASON_DEPTH: &str = "exploration depth limit";
const REASON_PROBE: &str = "optimistic size estimate rejected";
const REASON_POLICY: &str = "rejected by inlining policy";
const REASON_STALE: &str = "call site retargeted after planning";

// =============================================================================
// Policy
// =============================================================================

/// Everything a policy gets to see about one candidate call site.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionProfile {
    /// Non-trivial nodes of the callee itself.
    pub node_count: usize,
    /// Callee nodes plus the deep counts of everything inlined into it.
    /// Equal to `node_count` until the callee's own level is decided.
    pub deep_node_count: usize,
    /// Site call count relative to the caller's invocation count.
    pub frequency: f64,
    /// Exploration depth of the site, 1 for sites in the root.
    pub depth: usize,
    /// Whether descending here would recurse.
    pub recursive: bool,
}

/// Scoring and acceptance, pluggable per engine.
///
/// The exact coefficients are a tuning choice, not a correctness
/// requirement; the engine only relies on the contract that a recursive
/// profile is never worth inlining.
pub trait InliningPolicy: Send + Sync {
    /// Rank a candidate. Higher scores are considered first.
    fn score(&self, profile: &DecisionProfile) -> f64;

    /// Whether to inline a candidate, given the deep-node total already
    /// committed to the compilation unit.
    fn is_worth_inlining(
        &self,
        profile: &DecisionProfile,
        running_total: usize,
        options: &EngineOptions,
    ) -> bool;
}

/// Frequency-over-size heuristic.
#[derive(Debug, Clone)]
pub struct DefaultInliningPolicy {
    /// Minimum call frequency for non-trivial callees.
    pub min_frequency: f64,
    /// Deep node count below which a callee is inlined regardless of
    /// frequency.
    pub trivial_size: usize,
}

impl Default for DefaultInliningPolicy {
    fn default() -> Self {
        Self {
            min_frequency: 0.3,
            trivial_size: 10,
        }
    }
}

impl InliningPolicy for DefaultInliningPolicy {
    fn score(&self, profile: &DecisionProfile) -> f64 {
        profile.frequency / profile.deep_node_count.max(1) as f64
    }

    fn is_worth_inlining(
        &self,
        profile: &DecisionProfile,
        running_total: usize,
        options: &EngineOptions,
    ) -> bool {
        if profile.recursive {
            return false;
        }
        if running_total + profile.deep_node_count > options.inlining_max_caller_size {
            return false;
        }
        profile.frequency >= self.min_frequency || profile.deep_node_count <= self.trivial_size
    }
}

// =============================================================================
// Plan
// =============================================================================

/// One call site's fate in a plan.
#[derive(Debug, Clone)]
pub struct InliningDecision {
    site: Arc<DirectCallSite>,
    target: Arc<CallTarget>,
    profile: DecisionProfile,
    score: f64,
    is_inline: bool,
    reason: Option<&'static str>,
    children: Vec<InliningDecision>,
}

impl InliningDecision {
    /// Whether the callee is inlined into the compilation unit.
    #[inline]
    pub fn is_inline(&self) -> bool {
        self.is_inline
    }

    /// The call site this decision is about.
    #[inline]
    pub fn site(&self) -> &Arc<DirectCallSite> {
        &self.site
    }

    /// The callee recorded at planning time.
    #[inline]
    pub fn target(&self) -> &Arc<CallTarget> {
        &self.target
    }

    #[inline]
    pub fn profile(&self) -> &DecisionProfile {
        &self.profile
    }

    #[inline]
    pub fn score(&self) -> f64 {
        self.score
    }

    /// Why the decision is not an inline, when it is not.
    #[inline]
    pub fn reason(&self) -> Option<&'static str> {
        self.reason
    }

    /// Decisions for the callee's own call sites. Populated only for
    /// inlined decisions whose callee was explored.
    #[inline]
    pub fn children(&self) -> &[InliningDecision] {
        &self.children
    }
}

/// The inlining plan for one compilation of one root target.
#[derive(Debug, Clone)]
pub struct InliningPlan {
    root_name: String,
    decisions: Vec<InliningDecision>,
}

impl InliningPlan {
    /// Name of the target this plan was computed for.
    #[inline]
    pub fn root_name(&self) -> &str {
        &self.root_name
    }

    /// Top-level decisions, one per direct call site of the root.
    #[inline]
    pub fn decisions(&self) -> &[InliningDecision] {
        &self.decisions
    }

    /// Number of inlined call sites, transitively.
    pub fn inline_count(&self) -> usize {
        let mut count = 0;
        walk(&self.decisions, &mut |d| {
            if d.is_inline {
                count += 1;
            }
        });
        count
    }

    /// Every target inlined by this plan, pre-order.
    pub fn inlined_targets(&self) -> Vec<Arc<CallTarget>> {
        let mut targets = Vec::new();
        walk(&self.decisions, &mut |d| {
            if d.is_inline {
                targets.push(d.target.clone());
            }
        });
        targets
    }

    /// The node-rewriting assumptions of every inlined target. Code
    /// compiled from this plan must be registered on all of them.
    pub fn inlined_assumptions(&self) -> Vec<Arc<Assumption>> {
        self.inlined_targets()
            .iter()
            .map(|t| t.node_rewriting_assumption())
            .collect()
    }

    /// Find the decision made for a specific call site.
    pub fn decision_for(&self, site: &Arc<DirectCallSite>) -> Option<&InliningDecision> {
        fn find<'a>(
            decisions: &'a [InliningDecision],
            site: &Arc<DirectCallSite>,
        ) -> Option<&'a InliningDecision> {
            for decision in decisions {
                if Arc::ptr_eq(&decision.site, site) {
                    return Some(decision);
                }
                if let Some(found) = find(&decision.children, site) {
                    return Some(found);
                }
            }
            None
        }
        find(&self.decisions, site)
    }

    /// Demote every inlined decision whose site no longer dispatches to
    /// the callee recorded at planning time. Returns how many were
    /// demoted.
    pub(crate) fn prune_stale(&mut self) -> usize {
        fn prune(decisions: &mut [InliningDecision]) -> usize {
            let mut pruned = 0;
            for decision in decisions {
                if !decision.is_inline {
                    continue;
                }
                let current = decision.site.current_callee();
                if Arc::ptr_eq(&current, &decision.target) {
                    pruned += prune(&mut decision.children);
                } else {
                    log::debug!(
                        "dropping inline of '{}': site now dispatches to '{}'",
                        decision.target.name(),
                        current.name()
                    );
                    decision.is_inline = false;
                    decision.reason = Some(REASON_STALE);
                    decision.children.clear();
                    pruned += 1;
                }
            }
            pruned
        }
        prune(&mut self.decisions)
    }
}

fn walk<'a>(decisions: &'a [InliningDecision], f: &mut impl FnMut(&'a InliningDecision)) {
    for decision in decisions {
        f(decision);
        walk(&decision.children, f);
    }
}

// =============================================================================
// Planner
// =============================================================================

/// Exploration frame: one caller whose sites are being evaluated.
struct Frame {
    caller: Arc<CallTarget>,
    caller_calls: u32,
    own_count: usize,
    /// Non-trivial nodes committed along the exploration stack, including
    /// this caller. Feeds the optimistic probes below this frame.
    stack_count: usize,
    pending: VecDeque<Arc<DirectCallSite>>,
    explored: Vec<InliningDecision>,
    origin: Option<FrameOrigin>,
}

/// How a non-root frame was entered, kept to build its decision when the
/// frame collapses.
struct FrameOrigin {
    site: Arc<DirectCallSite>,
    callee: Arc<CallTarget>,
    frequency: f64,
    depth: usize,
}

/// Computes inlining plans for call targets.
pub struct InliningPlanner<'a> {
    options: &'a EngineOptions,
    policy: &'a dyn InliningPolicy,
}

impl<'a> InliningPlanner<'a> {
    pub fn new(options: &'a EngineOptions, policy: &'a dyn InliningPolicy) -> Self {
        Self { options, policy }
    }

    /// Build a plan for `root`. Empty when inlining is disabled or the
    /// root has no direct call sites.
    pub fn plan(&self, root: &Arc<CallTarget>) -> InliningPlan {
        let root_name = root.name().to_string();
        if !self.options.inlining {
            return InliningPlan {
                root_name,
                decisions: Vec::new(),
            };
        }
        InliningPlan {
            root_name,
            decisions: self.explore(root),
        }
    }

    fn explore(&self, root: &Arc<CallTarget>) -> Vec<InliningDecision> {
        let root_count = root.non_trivial_node_count();
        let mut frames = vec![Frame {
            caller: root.clone(),
            caller_calls: root.profile().interpreter_call_count(),
            own_count: root_count,
            stack_count: root_count,
            pending: root.tree().direct_call_sites().into(),
            explored: Vec::new(),
            origin: None,
        }];

        loop {
            if frames.last().map_or(true, |f| f.pending.is_empty()) {
                // The top frame is fully explored: decide its level and
                // fold it into a decision on the parent frame.
                let Some(frame) = frames.pop() else {
                    return Vec::new();
                };
                let decided = self.decide_level(frame.explored, frame.own_count);
                let Some(origin) = frame.origin else {
                    return decided;
                };
                let mut deep = frame.own_count;
                for child in &decided {
                    if child.is_inline {
                        deep += child.profile.deep_node_count;
                    }
                }
                let profile = DecisionProfile {
                    node_count: frame.own_count,
                    deep_node_count: deep,
                    frequency: origin.frequency,
                    depth: origin.depth,
                    recursive: false,
                };
                let decision = InliningDecision {
                    score: self.policy.score(&profile),
                    site: origin.site,
                    target: origin.callee,
                    profile,
                    is_inline: false,
                    reason: None,
                    children: decided,
                };
                match frames.last_mut() {
                    Some(parent) => parent.explored.push(decision),
                    None => return vec![decision],
                }
                continue;
            }

            let depth = frames.len();
            let (site, caller_calls, stack_count) = match frames.last_mut() {
                Some(top) => match top.pending.pop_front() {
                    Some(site) => (site, top.caller_calls, top.stack_count),
                    None => continue,
                },
                None => return Vec::new(),
            };

            let callee = site.current_callee();
            let frequency = f64::from(site.call_count().max(1)) / f64::from(caller_calls.max(1));
            let node_count = callee.non_trivial_node_count();
            // A call back to the root is recursive outright; any other
            // callee may repeat on the stack a bounded number of times.
            let recursive = callee.is_same_or_split(root)
                || frames
                    .iter()
                    .filter(|f| Arc::ptr_eq(&f.caller, &callee))
                    .count()
                    > self.options.max_recursive_inlining;
            let optimistic = DecisionProfile {
                node_count,
                deep_node_count: node_count,
                frequency,
                depth,
                recursive,
            };

            let mut reason = None;
            if recursive {
                reason = Some(REASON_RECURSIVE);
            } else if depth >= MAX_INLINE_DEPTH {
                reason = Some(REASON_DEPTH);
            } else if !self
                .policy
                .is_worth_inlining(&optimistic, stack_count, self.options)
            {
                reason = Some(REASON_PROBE);
            }

            let child_sites = if reason.is_none() {
                callee.tree().direct_call_sites()
            } else {
                Vec::new()
            };

            if reason.is_none() && !child_sites.is_empty() {
                frames.push(Frame {
                    caller_calls: callee.profile().interpreter_call_count(),
                    own_count: node_count,
                    stack_count: stack_count + node_count,
                    pending: child_sites.into(),
                    explored: Vec::new(),
                    origin: Some(FrameOrigin {
                        site,
                        callee: callee.clone(),
                        frequency,
                        depth,
                    }),
                    caller: callee,
                });
            } else {
                let leaf = InliningDecision {
                    score: self.policy.score(&optimistic),
                    site,
                    target: callee,
                    profile: optimistic,
                    is_inline: false,
                    reason,
                    children: Vec::new(),
                };
                if let Some(top) = frames.last_mut() {
                    top.explored.push(leaf);
                }
            }
        }
    }

    /// Sort one level by score and accept greedily under the deep-node
    /// budget. The running total starts at the caller's own node count;
    /// a candidate is accepted only if the policy passes *before* its
    /// deep count is added.
    fn decide_level(
        &self,
        mut decisions: Vec<InliningDecision>,
        caller_own_count: usize,
    ) -> Vec<InliningDecision> {
        decisions.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        let mut running_total = caller_own_count;
        for decision in &mut decisions {
            if decision.reason.is_none()
                && self
                    .policy
                    .is_worth_inlining(&decision.profile, running_total, self.options)
            {
                decision.is_inline = true;
                running_total += decision.profile.deep_node_count;
            } else {
                if decision.reason.is_none() {
                    decision.reason = Some(REASON_POLICY);
                }
                decision.children.clear();
            }
        }
        decisions
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use crate::runtime::EngineRuntime;
    use ember_core::Value;

    fn planner_engine(max_caller_size: usize) -> EngineRuntime {
        let options = ember_core::EngineOptions {
            compile_threshold: 1_000_000,
            min_invoke_threshold: 1_000_000,
            splitting: false,
            inlining_max_caller_size: max_caller_size,
            ..ember_core::EngineOptions::for_testing()
        };
        engine_with(options, CountingBackend::new())
    }

    fn plan_for(engine: &EngineRuntime, root: &Arc<CallTarget>) -> InliningPlan {
        let policy = DefaultInliningPolicy::default();
        InliningPlanner::new(engine.options(), &policy).plan(root)
    }

    // ------------------------------------------------------------------

    #[test]
    fn test_single_small_callee_is_inlined() {
        let engine = planner_engine(2250);
        let callee = engine.create_target("callee", leaf_tree(8, Value::Null));
        let site = site_to(&callee);
        let root = engine.create_target("root", calling_tree(10, Value::Null, vec![site.clone()]));

        let plan = plan_for(&engine, &root);
        assert_eq!(plan.decisions().len(), 1);
        let decision = &plan.decisions()[0];
        assert!(decision.is_inline());
        assert_eq!(decision.profile().node_count, 8);
        assert_eq!(decision.profile().deep_node_count, 8);
        assert_eq!(decision.profile().depth, 1);
        // No calls recorded anywhere: frequency falls back to 1.0.
        assert_eq!(decision.profile().frequency, 1.0);
        assert_eq!(plan.inline_count(), 1);
        engine.shutdown();
    }

    #[test]
    fn test_empty_plan_when_inlining_disabled() {
        let options = ember_core::EngineOptions {
            inlining: false,
            ..ember_core::EngineOptions::for_testing()
        };
        let engine = engine_with(options, CountingBackend::new());
        let callee = engine.create_target("callee", leaf_tree(5, Value::Null));
        let root =
            engine.create_target("root", calling_tree(10, Value::Null, vec![site_to(&callee)]));

        let plan = plan_for(&engine, &root);
        assert!(plan.decisions().is_empty());
        assert_eq!(plan.inline_count(), 0);
        engine.shutdown();
    }

    #[test]
    fn test_budget_accepts_best_scores_first() {
        let engine = planner_engine(60);
        let small = engine.create_target("small", leaf_tree(20, Value::Null));
        let medium = engine.create_target("medium", leaf_tree(30, Value::Null));
        let large = engine.create_target("large", leaf_tree(40, Value::Null));
        // Discovery order deliberately worst-first; scores must reorder.
        let site_l = site_to(&large);
        let site_m = site_to(&medium);
        let site_s = site_to(&small);
        let root = engine.create_target(
            "root",
            calling_tree(
                10,
                Value::Null,
                vec![site_l.clone(), site_m.clone(), site_s.clone()],
            ),
        );

        let plan = plan_for(&engine, &root);
        // small (10+20=30) and medium (30+30=60) fit; large would need 100.
        assert!(plan.decision_for(&site_s).unwrap().is_inline());
        assert!(plan.decision_for(&site_m).unwrap().is_inline());
        let rejected = plan.decision_for(&site_l).unwrap();
        assert!(!rejected.is_inline());
        assert_eq!(rejected.reason(), Some(REASON_POLICY));
        assert_eq!(plan.inline_count(), 2);
        engine.shutdown();
    }

    #[test]
    fn test_root_recursion_is_never_inlined() {
        let engine = planner_engine(2250);
        let tree = leaf_tree(5, Value::Null);
        let root = engine.create_target("root", tree.clone());
        let site = site_to(&root);
        tree.push_site(site.clone());
        site.attach(&root);

        let plan = plan_for(&engine, &root);
        let decision = plan.decision_for(&site).unwrap();
        assert!(!decision.is_inline());
        assert!(decision.profile().recursive);
        assert_eq!(decision.reason(), Some(REASON_RECURSIVE));
        engine.shutdown();
    }

    #[test]
    fn test_split_of_root_counts_as_root_recursion() {
        let engine = planner_engine(2250);
        let orig_tree = leaf_tree(5, Value::Null);
        let original = engine.create_target("orig", orig_tree.clone());
        let self_site = site_to(&original);
        orig_tree.push_site(self_site.clone());
        self_site.attach(&original);

        // The clone's fresh site still dispatches to the original, which
        // is "the root" as far as the split root is concerned.
        let split = original.create_split().unwrap();
        let plan = plan_for(&engine, &split);
        assert_eq!(plan.decisions().len(), 1);
        let decision = &plan.decisions()[0];
        assert!(decision.profile().recursive);
        assert_eq!(decision.reason(), Some(REASON_RECURSIVE));
        engine.shutdown();
    }

    #[test]
    fn test_self_recursive_chain_stops_at_occurrence_limit() {
        let engine = planner_engine(2250);
        let b_tree = leaf_tree(5, Value::Null);
        let b = engine.create_target("b", b_tree.clone());
        let b_site = site_to(&b);
        b_tree.push_site(b_site.clone());
        b_site.attach(&b);

        let root = engine.create_target("root", calling_tree(5, Value::Null, vec![site_to(&b)]));
        let plan = plan_for(&engine, &root);

        // max_recursive_inlining = 2: b may appear three times (one initial
        // descent plus two repeats); the fourth occurrence is rejected.
        assert_eq!(plan.inline_count(), 3);
        let mut depth = 0;
        let mut level = plan.decisions();
        while level.len() == 1 && level[0].is_inline() {
            depth += 1;
            level = level[0].children();
        }
        assert_eq!(depth, 3);
        assert_eq!(level.len(), 1);
        assert_eq!(level[0].reason(), Some(REASON_RECURSIVE));
        engine.shutdown();
    }

    #[test]
    fn test_depth_ceiling_bounds_exploration() {
        let engine = planner_engine(1_000_000);
        let mut next = engine.create_target("t20", leaf_tree(2, Value::Null));
        for i in (0..20).rev() {
            let tree = calling_tree(2, Value::Null, vec![site_to(&next)]);
            next = engine.create_target(format!("t{i}"), tree);
        }

        let plan = plan_for(&engine, &next);
        // Depths 1..=14 descend; the site evaluated at depth 15 is cut off.
        assert_eq!(plan.inline_count(), 14);
        let mut level = plan.decisions();
        let mut last_reason = None;
        while let Some(first) = level.first() {
            last_reason = first.reason();
            level = first.children();
        }
        assert_eq!(last_reason, Some(REASON_DEPTH));
        engine.shutdown();
    }

    #[test]
    fn test_probe_failure_skips_subtree() {
        let engine = planner_engine(60);
        let inner = engine.create_target("inner", leaf_tree(3, Value::Null));
        let huge_tree = calling_tree(100, Value::Null, vec![site_to(&inner)]);
        let huge = engine.create_target("huge", huge_tree);
        let site = site_to(&huge);
        let root = engine.create_target("root", calling_tree(10, Value::Null, vec![site.clone()]));

        let plan = plan_for(&engine, &root);
        let decision = plan.decision_for(&site).unwrap();
        assert!(!decision.is_inline());
        assert_eq!(decision.reason(), Some(REASON_PROBE));
        // The subtree was never explored.
        assert!(decision.children().is_empty());
        engine.shutdown();
    }

    #[test]
    fn test_nested_probe_uses_stack_budget() {
        let engine = planner_engine(60);
        let n = engine.create_target("n", leaf_tree(35, Value::Null));
        let n_site = site_to(&n);
        let m_tree = calling_tree(20, Value::Null, vec![n_site.clone()]);
        let m = engine.create_target("m", m_tree);
        let m_site = site_to(&m);
        let root =
            engine.create_target("root", calling_tree(10, Value::Null, vec![m_site.clone()]));

        let plan = plan_for(&engine, &root);
        // m fits (10+20), but n's probe runs against the committed stack
        // (10+20 already on it) and 30+35 blows the budget.
        let m_decision = plan.decision_for(&m_site).unwrap();
        assert!(m_decision.is_inline());
        assert_eq!(m_decision.profile().deep_node_count, 20);
        let n_decision = plan.decision_for(&n_site).unwrap();
        assert!(!n_decision.is_inline());
        assert_eq!(n_decision.reason(), Some(REASON_PROBE));
        engine.shutdown();
    }

    #[test]
    fn test_deep_counts_aggregate_through_accepted_children() {
        let engine = planner_engine(2250);
        let leaf = engine.create_target("leaf", leaf_tree(4, Value::Null));
        let mid_tree = calling_tree(6, Value::Null, vec![site_to(&leaf)]);
        let mid = engine.create_target("mid", mid_tree);
        let mid_site = site_to(&mid);
        let root =
            engine.create_target("root", calling_tree(10, Value::Null, vec![mid_site.clone()]));

        let plan = plan_for(&engine, &root);
        let decision = plan.decision_for(&mid_site).unwrap();
        assert!(decision.is_inline());
        assert_eq!(decision.profile().node_count, 6);
        assert_eq!(decision.profile().deep_node_count, 10);
        assert_eq!(plan.inline_count(), 2);
        assert_eq!(plan.inlined_targets().len(), 2);
        engine.shutdown();
    }

    #[test]
    fn test_frequency_reflects_call_counts() {
        let engine = planner_engine(2250);
        let callee = engine.create_target("callee", leaf_tree(50, Value::Null));
        let site = site_to(&callee);
        let root = engine.create_target("root", calling_tree(10, Value::Null, vec![site.clone()]));

        for _ in 0..10 {
            root.profile().record_interpreter_call();
        }
        site.call(&[]);
        site.call(&[]);

        let plan = plan_for(&engine, &root);
        let decision = plan.decision_for(&site).unwrap();
        assert!((decision.profile().frequency - 0.2).abs() < 1e-9);
        // 0.2 is under the frequency floor and 50 nodes is not trivial.
        assert!(!decision.is_inline());
        assert_eq!(decision.reason(), Some(REASON_PROBE));
        engine.shutdown();
    }

    #[test]
    fn test_prune_stale_demotes_retargeted_sites() {
        let engine = planner_engine(2250);
        let callee = engine.create_target("callee", leaf_tree(8, Value::Null));
        let site = site_to(&callee);
        let root = engine.create_target("root", calling_tree(10, Value::Null, vec![site.clone()]));

        let mut plan = plan_for(&engine, &root);
        assert!(plan.decision_for(&site).unwrap().is_inline());

        // The site is retargeted between planning and consumption.
        let replacement = engine.create_target("replacement", leaf_tree(8, Value::Null));
        site.install_split(replacement);

        assert_eq!(plan.prune_stale(), 1);
        let decision = plan.decision_for(&site).unwrap();
        assert!(!decision.is_inline());
        assert_eq!(decision.reason(), Some(REASON_STALE));
        assert_eq!(plan.inline_count(), 0);

        // Idempotent.
        assert_eq!(plan.prune_stale(), 0);
        engine.shutdown();
    }

    #[test]
    fn test_inlined_assumptions_cover_all_inlined_targets() {
        let engine = planner_engine(2250);
        let leaf = engine.create_target("leaf", leaf_tree(4, Value::Null));
        let mid = engine.create_target(
            "mid",
            calling_tree(6, Value::Null, vec![site_to(&leaf)]),
        );
        let root = engine.create_target(
            "root",
            calling_tree(10, Value::Null, vec![site_to(&mid)]),
        );

        let plan = plan_for(&engine, &root);
        let assumptions = plan.inlined_assumptions();
        assert_eq!(assumptions.len(), 2);
        assert!(assumptions
            .iter()
            .any(|a| Arc::ptr_eq(a, &mid.node_rewriting_assumption())));
        assert!(assumptions
            .iter()
            .any(|a| Arc::ptr_eq(a, &leaf.node_rewriting_assumption())));
        engine.shutdown();
    }
}
