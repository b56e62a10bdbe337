//! # Search Engine
//!
//! The engine drives one optimization from an operator tree to a physical plan.
//!
//! ## Flow
//!
//! 1. [`Engine::init`] inserts the query into a fresh memo and records the required
//!    properties of the result and the search stages to run.
//! 2. [`Engine::optimize`] runs every stage in order. A stage creates the root
//!    optimization context and hands a single `GroupOptimization` job to the scheduler.
//!    That job pulls in implementation, which pulls in exploration, so the whole search
//!    unfolds as jobs. Optimization stops early once a stage reaches its cost threshold.
//! 3. [`Engine::extract_plan`] walks the best cost contexts down from the root.
//!
//! ## Phase boundaries
//!
//! When exploration of the root group completes, no other job is running: every
//! outstanding job is an ancestor waiting on it. The engine uses that point to rehash the
//! memo, which finds groups made equal by earlier merges, and to derive statistics
//! ([`Engine::finalize_exploration`]). After each stage the group lifecycles restart for
//! the next one ([`Engine::finalize_search_stage`]).
//!
//! ## Pruning
//!
//! A plan never costs less than its children together. Once a context has a best plan,
//! an expression whose optimized children already cost more is dropped: the remaining
//! children are not optimized and the expression is never costed
//! ([`Engine::safe_to_prune`]).
//!
//! ## Plan enumeration
//!
//! Besides the best plan, every costed alternative below the root context can be counted
//! and rebuilt by rank ([`Engine::plan_count`], [`Engine::plan_by_rank`]); rank 0 is the
//! cheapest.
//!
//! ## Rule applications
//!
//! A rule fires on an expression only if the current stage allows it, the stage has not
//! timed out, its pattern matches, it was never applied to the expression before, and
//! the `max_iterations` budget is not spent. Per-rule counters and timings end up in
//! [`Diagnostics`].

use crate::catalog::Catalog;
use crate::context::{CostContext, OptimizationContext};
use crate::cost::{Cost, CostModel};
use crate::enforcement::{check_required_props, enforcing_types, PropertyEnforcement};
use crate::error::{OptimizerError, Result};
use crate::expr::{Operator, OperatorTree, PhysicalOp};
use crate::group_expression::{GroupExpression, OptimizationLevel};
use crate::jobs::group_optimization::GroupOptimizationJob;
use crate::jobs::JobFactory;
use crate::memo::{ExprId, GroupId, Memo, PlanNode};
use crate::pattern::matches_expr;
use crate::properties::PhysicalPropertySet;
use crate::rule::{Rule, RuleChild, RuleRegistry, RuleResult, RuleType};
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::stage::{default_stages, SearchStage};
use crate::stats::{DefaultStatsDerivation, Statistics, StatsDerivation};
use crate::tree_map::PlanTreeMap;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Configuration knobs for the search.
///
/// `max_iterations` is the primary safety valve against runaway rule application;
/// `max_memo_groups` bounds memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Upper bound on the number of groups the memo may contain.
    pub max_memo_groups: usize,
    /// Upper bound on the total number of rule applications.
    pub max_iterations: usize,
    /// Optional connector/source type name used to select connector-specific rules.
    pub source_type: Option<String>,
    /// Most worker threads a scheduler run may use.
    pub workers: usize,
    /// Worker threads a run starts with; more are added when the backlog grows.
    pub initial_workers: usize,
    /// Derive statistics for costing. Without them every group has placeholder statistics.
    pub derive_stats: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_memo_groups: 100_000,
            max_iterations: 1_000_000,
            source_type: None,
            workers: 4,
            initial_workers: 1,
            derive_stats: true,
        }
    }
}

/// The query to optimize: an operator tree and what its result must look like.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryContext {
    pub expr: OperatorTree,
    pub required: PhysicalPropertySet,
}

impl QueryContext {
    pub fn new(expr: OperatorTree, required: PhysicalPropertySet) -> Self {
        Self { expr, required }
    }
}

/// Counters of one rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct XformStats {
    /// Times the rule was applied.
    pub calls: u64,
    /// Alternatives the rule produced.
    pub results: u64,
    /// Alternatives that were new to the memo.
    pub inserted: u64,
    /// Time spent applying the rule and inserting its results.
    pub time: Duration,
}

impl XformStats {
    fn record(&mut self, results: usize, inserted: usize, elapsed: Duration) {
        self.calls += 1;
        self.results += results as u64;
        self.inserted += inserted as u64;
        self.time += elapsed;
    }
}

/// What an optimization did, for tests and explain output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    pub xforms: BTreeMap<String, XformStats>,
    pub scheduler: SchedulerStats,
    pub groups: usize,
    pub group_expressions: usize,
    pub duplicate_groups: usize,
    pub iterations: usize,
    /// Expressions dropped by cost-bound pruning.
    pub pruned: usize,
    /// Best cost found by each stage that ran.
    pub stage_costs: Vec<Option<Cost>>,
}

pub struct Engine {
    memo: Memo,
    rules: Arc<RuleRegistry>,
    cost_model: Arc<dyn CostModel>,
    stats_derivation: Arc<dyn StatsDerivation>,
    catalog: Arc<dyn Catalog>,
    config: SearchConfig,
    required: PhysicalPropertySet,
    stages: Vec<SearchStage>,
    current_stage: AtomicUsize,
    iterations: AtomicUsize,
    pruned: AtomicUsize,
    xform_stats: DashMap<String, XformStats>,
    scheduler_stats: Mutex<SchedulerStats>,
}

impl Engine {
    pub fn new(
        rules: Arc<RuleRegistry>,
        cost_model: Arc<dyn CostModel>,
        catalog: Arc<dyn Catalog>,
        config: SearchConfig,
    ) -> Self {
        Self {
            memo: Memo::with_max_groups(config.max_memo_groups),
            rules,
            cost_model,
            stats_derivation: Arc::new(DefaultStatsDerivation),
            catalog,
            config,
            required: PhysicalPropertySet::any(),
            stages: default_stages(),
            current_stage: AtomicUsize::new(0),
            iterations: AtomicUsize::new(0),
            pruned: AtomicUsize::new(0),
            xform_stats: DashMap::new(),
            scheduler_stats: Mutex::new(SchedulerStats::default()),
        }
    }

    /// Replace the default statistics derivation.
    pub fn with_stats_derivation(mut self, stats_derivation: Arc<dyn StatsDerivation>) -> Self {
        self.stats_derivation = stats_derivation;
        self
    }

    /// Load a query into a fresh memo. An empty stage list means [`default_stages`].
    pub fn init(&mut self, query: QueryContext, stages: Vec<SearchStage>) -> Result<GroupId> {
        let stages = if stages.is_empty() { default_stages() } else { stages };
        for stage in &stages {
            if let Some(unknown) = stage.xforms.names().find(|name| !self.rules.contains(name)) {
                return Err(OptimizerError::UnknownRule(unknown.to_string()));
            }
        }

        self.memo = Memo::with_max_groups(self.config.max_memo_groups);
        let root = self.memo.insert_tree(&query.expr)?;
        self.memo.set_root(root);
        self.required = query.required;
        self.stages = stages;
        self.current_stage.store(0, Ordering::Release);
        self.iterations.store(0, Ordering::Release);
        self.pruned.store(0, Ordering::Release);
        self.xform_stats.clear();
        debug!(
            root,
            groups = self.memo.num_groups(),
            stages = self.stages.len(),
            "engine initialized"
        );
        Ok(root)
    }

    /// Run every search stage. Returns the first error any job raised.
    pub fn optimize(&self) -> Result<()> {
        let root = self.memo.root().ok_or(OptimizerError::NotInitialized)?;
        debug!(root, groups = self.memo.num_groups(), exprs = self.memo.num_exprs(), "starting optimization");

        let scheduler = Scheduler::new(self.config.workers, self.config.initial_workers);
        let factory = JobFactory::new();
        for (index, stage) in self.stages.iter().enumerate() {
            if index > 0 && self.stages[index - 1].achieved_required_cost() {
                debug!(stage = index, "cost threshold reached, skipping remaining stages");
                break;
            }
            self.current_stage.store(index, Ordering::Release);
            stage.restart_timer();

            let root = self.memo.resolve(root);
            let oc = self.memo.insert_context(root, &self.required, index);
            debug!(stage = index, root, oc = oc.id, "starting search stage");

            scheduler.add(GroupOptimizationJob::create(&factory, oc.clone()), None);
            let result = scheduler.run(self, &factory);
            *self.scheduler_stats.lock() = scheduler.stats();
            if let Err(error) = result {
                self.memo.abandon_job_queues();
                return Err(error);
            }
            self.finalize_search_stage(&oc);
        }
        debug!(jobs = factory.jobs_created(), iterations = self.iterations(), "optimization finished");
        Ok(())
    }

    /// Cheapest plan for the root under the required properties, over all stages.
    pub fn extract_plan(&self) -> Result<PlanNode> {
        let root = self.memo.root().ok_or(OptimizerError::NotInitialized)?;
        self.memo.extract_plan(root, &self.required)
    }

    fn root_tree_map(&self) -> Result<PlanTreeMap> {
        let root = self.memo.root().ok_or(OptimizerError::NotInitialized)?;
        let oc = self.memo.best_context(root, &self.required)?;
        Ok(self.memo.build_tree_map(&oc))
    }

    /// Number of distinct plans recorded for the root context holding the best plan.
    pub fn plan_count(&self) -> Result<u64> {
        Ok(self.root_tree_map()?.plan_count())
    }

    /// Plan number `rank` among those counted by [`Engine::plan_count`].
    pub fn plan_by_rank(&self, rank: u64) -> Result<PlanNode> {
        self.root_tree_map()?.unrank(rank)
    }

    /// The `limit` cheapest-ranked plans of the root.
    pub fn enumerate_plans(&self, limit: usize) -> Result<Vec<PlanNode>> {
        let tree_map = self.root_tree_map()?;
        (0..tree_map.plan_count().min(limit as u64))
            .map(|rank| tree_map.unrank(rank))
            .collect()
    }

    pub fn memo(&self) -> &Memo {
        &self.memo
    }

    pub fn catalog(&self) -> &dyn Catalog {
        self.catalog.as_ref()
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn required(&self) -> &PhysicalPropertySet {
        &self.required
    }

    pub fn stages(&self) -> &[SearchStage] {
        &self.stages
    }

    pub fn current_stage_index(&self) -> usize {
        self.current_stage.load(Ordering::Acquire)
    }

    pub fn current_stage(&self) -> &SearchStage {
        &self.stages[self.current_stage_index()]
    }

    /// The current stage ran out of time: no new rule applications are scheduled.
    pub fn search_terminated(&self) -> bool {
        self.current_stage().timed_out()
    }

    /// Rule applications so far.
    pub fn iterations(&self) -> usize {
        self.iterations.load(Ordering::Acquire)
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            xforms: self
                .xform_stats
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
            scheduler: *self.scheduler_stats.lock(),
            groups: self.memo.num_groups(),
            group_expressions: self.memo.expression_count(),
            duplicate_groups: self.memo.duplicate_group_count(),
            iterations: self.iterations(),
            pruned: self.pruned.load(Ordering::Acquire),
            stage_costs: self.stages.iter().map(SearchStage::best_cost).collect(),
        }
    }

    fn consume_iteration(&self) -> bool {
        self.iterations
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.config.max_iterations).then_some(n + 1)
            })
            .is_ok()
    }

    /// Rules of `rule_type` to apply to `expr` now. Each returned rule is claimed on the
    /// expression and charged to the iteration budget.
    pub(crate) fn applicable_xforms(&self, expr: &GroupExpression, rule_type: RuleType) -> Vec<Arc<dyn Rule>> {
        if self.search_terminated() || self.iterations() >= self.config.max_iterations {
            return Vec::new();
        }
        let stage = self.current_stage();
        self.rules
            .rules_of_type(rule_type, self.config.source_type.as_deref())
            .into_iter()
            .filter(|rule| stage.xforms.contains(rule.name()))
            .filter(|rule| matches_expr(&self.memo, expr, &rule.pattern()))
            .filter(|rule| expr.try_mark_rule(rule.rule_hash()) && self.consume_iteration())
            .collect()
    }

    /// Insert the alternatives `rule` produced for `expr` into `expr`'s group. New
    /// sub-expressions get their own groups. Returns how many alternatives were new.
    pub fn insert_xform_result(
        &self,
        expr: &GroupExpression,
        rule: &dyn Rule,
        results: Vec<RuleResult>,
        started: Instant,
    ) -> Result<usize> {
        let level = rule.optimization_level();
        let target = self.memo.resolve(expr.group());
        let produced = results.len();
        let mut inserted = 0;
        for result in results {
            let (op, children) = match result {
                RuleResult::Substitution(op, children) => (op, children),
                RuleResult::NewChildren(op, children) => {
                    let children = children
                        .into_iter()
                        .map(|child| self.materialize(child, level))
                        .collect::<Result<Vec<_>>>()?;
                    (op, children)
                }
            };
            let outcome = self.memo.insert_expr(op, children, Some(target), level)?;
            if outcome.inserted {
                inserted += 1;
            } else if outcome.group != self.memo.resolve(target) {
                trace!(rule = rule.name(), group = target, found = outcome.group, "rule result found in another group");
            }
        }
        self.xform_stats
            .entry(rule.name().to_string())
            .or_default()
            .record(produced, inserted, started.elapsed());
        Ok(inserted)
    }

    fn materialize(&self, child: RuleChild, level: OptimizationLevel) -> Result<GroupId> {
        match child {
            RuleChild::Group(group) => Ok(group),
            RuleChild::NewExpr(op, children) => {
                let children = children
                    .into_iter()
                    .map(|child| self.materialize(child, level))
                    .collect::<Result<Vec<_>>>()?;
                Ok(self.memo.insert_expr(op, children, None, level)?.group)
            }
        }
    }

    /// Whether `expr` may be optimized for `required` at all. Only enforcers, the
    /// expressions whose child is their own group, are ever rejected.
    pub fn check_required_props(&self, expr: &GroupExpression, required: &PhysicalPropertySet) -> bool {
        let Some(op) = expr.op.as_physical() else {
            return false;
        };
        let group = self.memo.resolve(expr.group());
        let over_own_group = expr.children.iter().any(|child| self.memo.resolve(*child) == group);
        !over_own_group || check_required_props(op, required)
    }

    /// Classify each required property against what `op` delivers.
    pub fn check_enforced_props(
        &self,
        op: &PhysicalOp,
        required: &PhysicalPropertySet,
        delivered: &PhysicalPropertySet,
    ) -> PropertyEnforcement {
        enforcing_types(op, required, delivered)
    }

    /// Insert the enforcers `enforcement` calls for into `group`, each over the group
    /// itself. Nothing is added when a property is prohibited.
    pub(crate) fn add_enforcers(
        &self,
        group: GroupId,
        required: &PhysicalPropertySet,
        enforcement: &PropertyEnforcement,
    ) -> Result<Vec<ExprId>> {
        if enforcement.is_prohibited() {
            return Ok(Vec::new());
        }
        let group = self.memo.resolve(group);
        enforcement
            .enforcers(required)
            .into_iter()
            .map(|op| {
                let outcome = self
                    .memo
                    .insert_expr(Operator::Physical(op), vec![group], Some(group), OptimizationLevel::Low)?;
                if outcome.inserted {
                    trace!(group, expr = outcome.expr, "added enforcer");
                }
                Ok(outcome.expr)
            })
            .collect()
    }

    /// Whether an expression can be dropped from `oc`: the best plans of its children
    /// optimized so far already cost more than the context's best plan.
    pub fn safe_to_prune(&self, oc: &OptimizationContext, optimized_children: &[Arc<OptimizationContext>]) -> bool {
        let Some(best) = oc.best_cost() else {
            return false;
        };
        let lower_bound = Cost::new(
            optimized_children
                .iter()
                .filter_map(|child| child.best_cost())
                .map(|cost| cost.total)
                .sum(),
        );
        if lower_bound > best {
            self.pruned.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        false
    }

    /// Next lower optimization level, `None` once the lowest level is done.
    pub fn damp_level(&self, level: OptimizationLevel) -> Option<OptimizationLevel> {
        level.damp()
    }

    /// Statistics of `group`, derived on first use.
    pub fn derive_stats(&self, group: GroupId) -> Statistics {
        if !self.config.derive_stats {
            return Statistics::unknown();
        }
        self.memo.group(self.memo.resolve(group)).derive_stats_recursive(
            &self.memo,
            self.stats_derivation.as_ref(),
            self.catalog.as_ref(),
        )
    }

    /// Cost `expr` for `oc` on top of the best plans of `child_contexts`.
    pub(crate) fn compute_cost_context(
        &self,
        expr: &GroupExpression,
        oc: &OptimizationContext,
        child_contexts: Vec<Arc<OptimizationContext>>,
        delivered: PhysicalPropertySet,
    ) -> CostContext {
        let cost = match expr.op.as_physical() {
            Some(op) => {
                let input_stats: Vec<Statistics> = if expr.children.is_empty() {
                    vec![self.derive_stats(expr.group())]
                } else {
                    expr.children.iter().map(|child| self.derive_stats(*child)).collect()
                };
                let input_refs: Vec<&Statistics> = input_stats.iter().collect();
                let child_costs: Vec<Cost> = child_contexts
                    .iter()
                    .map(|child| child.best_cost().unwrap_or_else(Cost::infinite))
                    .collect();
                self.cost_model.compute_cost(op, &input_refs, &child_costs, &oc.required)
            }
            None => Cost::infinite(),
        };
        trace!(expr = expr.id, oc = oc.id, %cost, "costed expression");
        CostContext {
            expr: expr.id,
            context: oc.id,
            child_contexts,
            cost,
            delivered,
        }
    }

    /// Root exploration finished: rehash the memo and derive root statistics.
    /// Runs while no other job is active.
    pub(crate) fn finalize_exploration(&self) {
        let merged = self.memo.group_merge();
        if let Some(root) = self.memo.root() {
            self.derive_stats(root);
            self.memo.group(root).derive_properties(&self.memo, self.catalog.as_ref());
        }
        debug!(
            stage = self.current_stage_index(),
            merged,
            groups = self.memo.num_groups(),
            exprs = self.memo.expression_count(),
            "exploration finished"
        );
    }

    /// Root implementation finished.
    pub(crate) fn finalize_implementation(&self) {
        debug!(
            stage = self.current_stage_index(),
            exprs = self.memo.expression_count(),
            "implementation finished"
        );
        self.memo.trace();
    }

    /// Record the stage's best plan and restart group lifecycles for the next stage.
    pub(crate) fn finalize_search_stage(&self, root_oc: &OptimizationContext) {
        let stage = self.current_stage();
        match self.memo.extract_plan_from_context(root_oc) {
            Ok(plan) => {
                debug!(stage = self.current_stage_index(), cost = %plan.cost, elapsed = ?stage.elapsed(), "search stage finished");
                stage.set_best_plan(plan);
            }
            Err(_) => debug!(stage = self.current_stage_index(), elapsed = ?stage.elapsed(), "search stage found no plan"),
        }
        self.memo.reset_group_states();
        self.memo.reset_job_queues();
    }
}
