//! End-to-end search scenarios: single-rule plans, group merging, stage budgets,
//! property enforcement and failure propagation.

mod common;

use cascade_core::cost::DefaultCostModel;
use cascade_core::engine::{QueryContext, SearchConfig};
use cascade_core::error::OptimizerError;
use cascade_core::expr::*;
use cascade_core::properties::{PhysicalPropertySet, Rewindability};
use cascade_core::stage::{SearchStage, XformSet};
use common::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn predicate() -> Expr {
    Expr::binary(BinaryOp::Gt, Expr::column("orders", "o_orderdate"), Expr::literal(ScalarValue::Date(9000)))
}

fn stage(rules: &[&str], cost_threshold: f64) -> SearchStage {
    SearchStage::new(XformSet::only(rules.iter().copied()), u64::MAX, cost_threshold)
}

#[test]
fn test_select_over_get_yields_single_alternative() {
    init_tracing();
    let mut engine = engine_with(
        cascade_rules::default_rule_registry(),
        Arc::new(DefaultCostModel::default()),
        tpch_catalog(),
        SearchConfig::default(),
    );
    let tree = OperatorTree::filter(predicate(), scan("orders"));
    let root = engine
        .init(
            QueryContext::new(tree, PhysicalPropertySet::any()),
            vec![stage(&["ImplFilter", "ImplSeqScan"], 0.0)],
        )
        .unwrap();
    engine.optimize().unwrap();

    let plan = engine.extract_plan().unwrap();
    assert_eq!(plan.op, PhysicalOp::Filter { predicate: predicate() });
    assert_eq!(plan.children.len(), 1);
    assert!(matches!(plan.children[0].op, PhysicalOp::SeqScan { .. }));
    assert_eq!(plan.node_count(), 2);

    let memo = engine.memo();
    assert_eq!(memo.group(root).physical_exprs().len(), 1);
    assert_eq!(memo.exprs().iter().filter(|e| e.is_physical()).count(), 2);

    let diagnostics = engine.diagnostics();
    assert_eq!(diagnostics.xforms.keys().collect::<Vec<_>>(), vec!["ImplFilter", "ImplSeqScan"]);
    assert!(diagnostics.xforms.values().all(|x| x.calls == 1 && x.inserted == 1));
}

#[test]
fn test_identical_join_branches_share_one_group() {
    init_tracing();
    let cost_model = Arc::new(CountingCostModel::default());
    let stats = Arc::new(CountingStats::default());
    let mut engine = engine_with(
        cascade_rules::default_rule_registry(),
        cost_model.clone(),
        tpch_catalog(),
        SearchConfig {
            workers: 8,
            initial_workers: 4,
            ..SearchConfig::default()
        },
    )
    .with_stats_derivation(stats.clone());

    // the right branch is the commuted form of the left one
    let left = inner_join(equi("nation", "n_regionkey", "region", "r_regionkey"), scan("nation"), scan("region"));
    let right = inner_join(equi("region", "r_regionkey", "nation", "n_regionkey"), scan("region"), scan("nation"));
    let tree = OperatorTree::join(JoinType::Cross, Expr::literal(ScalarValue::Bool(true)), left, right);
    let root = engine
        .init(QueryContext::new(tree, PhysicalPropertySet::any()), vec![])
        .unwrap();
    engine.optimize().unwrap();

    let memo = engine.memo();
    let top = memo.expr(memo.group(root).logical_exprs()[0]);
    assert_eq!(memo.resolve(top.children[0]), memo.resolve(top.children[1]));
    assert!(engine.diagnostics().duplicate_groups >= 1);

    assert_eq!(stats.calls(), groups_with_stats(memo));
    assert_eq!(cost_model.calls(), total_cost_contexts(memo));
    let plan = engine.extract_plan().unwrap();
    assert_eq!(plan.children[0].group, plan.children[1].group);
}

#[test]
fn test_zero_time_threshold_returns_promptly() {
    init_tracing();
    let mut engine = engine_with(
        cascade_rules::default_rule_registry(),
        Arc::new(DefaultCostModel::default()),
        tpch_catalog(),
        SearchConfig::default(),
    );
    let tree = inner_join(
        equi("lineitem", "l_orderkey", "orders", "o_orderkey"),
        inner_join(equi("orders", "o_custkey", "customer", "c_custkey"), scan("orders"), scan("customer")),
        scan("lineitem"),
    );
    engine
        .init(
            QueryContext::new(tree, PhysicalPropertySet::any()),
            vec![SearchStage::new(XformSet::All, 0, 0.0)],
        )
        .unwrap();

    let started = Instant::now();
    engine.optimize().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(engine.iterations(), 0);
    assert!(matches!(engine.extract_plan(), Err(OptimizerError::NoPlanFound { .. })));
    assert!(engine.search_terminated());
}

#[test]
fn test_cost_threshold_skips_later_stages() {
    init_tracing();
    let mut engine = engine_with(
        cascade_rules::default_rule_registry(),
        Arc::new(DefaultCostModel::default()),
        tpch_catalog(),
        SearchConfig::default(),
    );
    let tree = inner_join(equi("nation", "n_regionkey", "region", "r_regionkey"), scan("nation"), scan("region"));
    let implement_only = stage(&["ImplSeqScan", "ImplHashJoin", "ImplNestedLoopJoin"], f64::MAX);
    engine
        .init(
            QueryContext::new(tree, PhysicalPropertySet::any()),
            vec![implement_only, SearchStage::unbounded()],
        )
        .unwrap();
    engine.optimize().unwrap();

    let diagnostics = engine.diagnostics();
    assert!(diagnostics.stage_costs[0].is_some());
    assert_eq!(diagnostics.stage_costs[1], None);
    assert!(!diagnostics.xforms.contains_key("JoinCommutativity"));
    assert_eq!(engine.current_stage_index(), 0);
}

#[test]
fn test_later_stage_never_loses_a_plan() {
    init_tracing();
    let mut engine = engine_with(
        cascade_rules::default_rule_registry(),
        Arc::new(DefaultCostModel::default()),
        tpch_catalog(),
        SearchConfig::default(),
    );
    let tree = inner_join(
        equi("supplier", "s_nationkey", "nation", "n_nationkey"),
        inner_join(equi("lineitem", "l_suppkey", "supplier", "s_suppkey"), scan("lineitem"), scan("supplier")),
        scan("nation"),
    );
    engine
        .init(
            QueryContext::new(tree, PhysicalPropertySet::any()),
            vec![
                stage(&["ImplSeqScan", "ImplNestedLoopJoin"], 0.0),
                SearchStage::unbounded(),
            ],
        )
        .unwrap();
    engine.optimize().unwrap();

    let costs = engine.diagnostics().stage_costs;
    let (first, second) = (costs[0].unwrap(), costs[1].unwrap());
    assert!(second.total <= first.total, "second stage {second} worse than first {first}");
    assert_eq!(engine.extract_plan().unwrap().cost, second);
    // implementation rules fire once per expression across both stages
    assert_eq!(engine.diagnostics().xforms["ImplSeqScan"].calls, 3);
}

#[test]
fn test_required_order_adds_sort_enforcer() {
    let order = vec![SortKey::asc(Expr::column("orders", "o_orderdate"))];
    let engine = optimize(
        scan("orders"),
        PhysicalPropertySet::with_sort(order.clone()),
        tpch_catalog(),
        SearchConfig::default(),
    );
    let plan = engine.extract_plan().unwrap();
    assert_eq!(plan.op, PhysicalOp::SortOp { order: order.clone() });
    assert!(matches!(plan.children[0].op, PhysicalOp::SeqScan { .. }));
    assert_eq!(plan.delivered.sort_order, Some(order));
    assert_eq!(plan.group, plan.children[0].group);
}

#[test]
fn test_explicit_order_by_needs_no_enforcer() {
    let order = vec![SortKey::asc(Expr::column("orders", "o_orderdate"))];
    let tree = OperatorTree::new(
        Operator::Logical(LogicalOp::Sort { order: order.clone() }),
        vec![OperatorTree::filter(predicate(), scan("orders"))],
    );
    let engine = optimize(tree, PhysicalPropertySet::any(), tpch_catalog(), SearchConfig::default());
    let plan = engine.extract_plan().unwrap();
    assert_eq!(plan.op, PhysicalOp::SortOp { order });
    assert_ne!(plan.group, plan.children[0].group);
    assert_eq!(plan.node_count(), 3);
}

#[test]
fn test_required_distribution_and_rewindability() {
    let required = PhysicalPropertySet {
        distribution: Some(Distribution::Single),
        rewindability: Some(Rewindability::Rewindable),
        ..PhysicalPropertySet::default()
    };
    let tree = inner_join(equi("nation", "n_regionkey", "region", "r_regionkey"), scan("nation"), scan("region"));
    let engine = optimize(tree, required.clone(), tpch_catalog(), SearchConfig::default());

    let plan = engine.extract_plan().unwrap();
    assert!(required.satisfied_by(&plan.delivered), "{plan}");
    assert!(plan.iter().iter().any(|n| matches!(n.op, PhysicalOp::Exchange { .. })));
}

#[test]
fn test_merge_join_inputs_get_sorted() {
    let tree = inner_join(equi("nation", "n_regionkey", "region", "r_regionkey"), scan("nation"), scan("region"));
    let engine = optimize(tree, PhysicalPropertySet::any(), tpch_catalog(), SearchConfig::default());

    let memo = engine.memo();
    let sorts = memo
        .exprs()
        .iter()
        .filter(|e| matches!(e.op, Operator::Physical(PhysicalOp::SortOp { .. })))
        .count();
    assert_eq!(sorts, 2, "one sort enforcer per merge join input");
    assert!(engine.extract_plan().is_ok());
}

#[test]
fn test_memo_exhaustion_aborts_optimization() {
    init_tracing();
    let mut engine = engine_with(
        cascade_rules::default_rule_registry(),
        Arc::new(DefaultCostModel::default()),
        tpch_catalog(),
        SearchConfig {
            max_memo_groups: 7,
            workers: 2,
            ..SearchConfig::default()
        },
    );
    let tree = inner_join(
        equi("customer", "c_nationkey", "nation", "n_nationkey"),
        inner_join(
            equi("orders", "o_custkey", "customer", "c_custkey"),
            inner_join(equi("lineitem", "l_orderkey", "orders", "o_orderkey"), scan("lineitem"), scan("orders")),
            scan("customer"),
        ),
        scan("nation"),
    );
    engine
        .init(QueryContext::new(tree, PhysicalPropertySet::any()), vec![])
        .unwrap();
    assert_eq!(engine.memo().num_groups(), 7);

    assert_eq!(engine.optimize(), Err(OptimizerError::MemoExhausted { limit: 7 }));
    assert_eq!(engine.memo().num_groups(), 7);
}

#[test]
fn test_iteration_budget_bounds_rule_applications() {
    let tree = inner_join(
        equi("orders", "o_custkey", "customer", "c_custkey"),
        inner_join(equi("lineitem", "l_orderkey", "orders", "o_orderkey"), scan("lineitem"), scan("orders")),
        scan("customer"),
    );
    let engine = optimize(
        tree,
        PhysicalPropertySet::any(),
        tpch_catalog(),
        SearchConfig {
            max_iterations: 5,
            ..SearchConfig::default()
        },
    );
    assert_eq!(engine.iterations(), 5);
    let calls: u64 = engine.diagnostics().xforms.values().map(|x| x.calls).sum();
    assert_eq!(calls, 5);
}

#[test]
fn test_unknown_source_uses_base_rules() {
    let engine = optimize(
        OperatorTree::filter(predicate(), scan("orders")),
        PhysicalPropertySet::any(),
        tpch_catalog(),
        SearchConfig {
            source_type: Some("hive".into()),
            ..SearchConfig::default()
        },
    );
    assert!(engine.extract_plan().is_ok());
}

#[test]
fn test_group_found_equal_during_optimization_is_folded() {
    let order = vec![SortKey::asc(Expr::column("nation", "n_regionkey"))];
    let sorted_nation = OperatorTree::new(
        Operator::Logical(LogicalOp::Sort { order: order.clone() }),
        vec![scan("nation")],
    );
    let tree = inner_join(
        equi("nation", "n_regionkey", "nation", "n_regionkey"),
        sorted_nation,
        scan("nation"),
    );
    let engine = optimize(tree, PhysicalPropertySet::any(), tpch_catalog(), SearchConfig::default());
    let memo = engine.memo();
    assert!(memo.duplicate_group_count() >= 1, "{memo}");

    for group in memo.groups().iter().filter(|g| g.is_duplicate()) {
        assert_eq!(group.expr_count(), 0, "group {} kept members after folding", group.id);
        assert_eq!(group.context_count(), 0, "group {} kept contexts after folding", group.id);
    }

    // the sort branch and the plain scan ended up in one group holding both members
    let root = memo.root().unwrap();
    let join = memo.expr(memo.group(root).logical_exprs()[0]);
    let scan_group = memo.resolve(join.children[1]);
    assert_eq!(memo.resolve(join.children[0]), scan_group);
    let members = memo.group(scan_group).logical_exprs();
    assert!(members
        .iter()
        .any(|id| matches!(memo.expr(*id).op, Operator::Logical(LogicalOp::Sort { .. }))));

    // the sorted request on the master was answered
    let sorted = memo.extract_plan(scan_group, &PhysicalPropertySet::with_sort(order.clone())).unwrap();
    assert_eq!(sorted.op, PhysicalOp::SortOp { order });
    assert!(matches!(sorted.children[0].op, PhysicalOp::SeqScan { .. }));
    assert!(engine.extract_plan().is_ok());
}

#[test]
fn test_costlier_alternatives_are_pruned_before_costing() {
    init_tracing();
    let cost_model = Arc::new(CountingCostModel::default());
    let mut engine = engine_with(
        cascade_rules::default_rule_registry(),
        cost_model.clone(),
        tpch_catalog(),
        SearchConfig::default(),
    );
    // sorting lineitem alone costs far more than hashing nation into it
    let tree = inner_join(equi("nation", "n_nationkey", "lineitem", "l_suppkey"), scan("nation"), scan("lineitem"));
    let root = engine
        .init(QueryContext::new(tree, PhysicalPropertySet::any()), vec![])
        .unwrap();
    engine.optimize().unwrap();

    let plan = engine.extract_plan().unwrap();
    assert!(matches!(plan.op, PhysicalOp::HashJoin { .. }), "{plan}");
    assert!(engine.diagnostics().pruned >= 2);

    let memo = engine.memo();
    let root_oc = memo.lookup_context(root, &PhysicalPropertySet::any(), 0).unwrap();
    let merge_joins: Vec<_> = memo
        .group(memo.resolve(root))
        .physical_exprs()
        .into_iter()
        .map(|id| memo.expr(id))
        .filter(|e| matches!(e.op, Operator::Physical(PhysicalOp::MergeJoin { .. })))
        .collect();
    assert!(!merge_joins.is_empty());
    for merge_join in &merge_joins {
        assert!(merge_join.cost_context(root_oc.id).is_none(), "merge join {} was costed", merge_join.id);
    }
    assert_eq!(cost_model.calls(), total_cost_contexts(memo));
}

#[test]
fn test_every_join_plan_can_be_enumerated() {
    init_tracing();
    let mut engine = engine_with(
        cascade_rules::default_rule_registry(),
        Arc::new(DefaultCostModel::default()),
        tpch_catalog(),
        SearchConfig::default(),
    );
    let tree = inner_join(equi("nation", "n_regionkey", "region", "r_regionkey"), scan("nation"), scan("region"));
    engine
        .init(
            QueryContext::new(tree, PhysicalPropertySet::any()),
            vec![stage(&["ImplSeqScan", "ImplHashJoin"], 0.0)],
        )
        .unwrap();
    engine.optimize().unwrap();

    // one hash join per build side over a single scan each
    assert_eq!(engine.plan_count().unwrap(), 2);
    let best = engine.plan_by_rank(0).unwrap();
    assert_eq!(best.cost, engine.extract_plan().unwrap().cost);
    let other = engine.plan_by_rank(1).unwrap();
    assert!(other.cost >= best.cost);
    match (&best.op, &other.op) {
        (
            PhysicalOp::HashJoin { build_side: first, .. },
            PhysicalOp::HashJoin { build_side: second, .. },
        ) => assert_ne!(first, second),
        ops => panic!("expected two hash joins, got {ops:?}"),
    }
    assert!(matches!(engine.plan_by_rank(2), Err(OptimizerError::NoPlanFound { .. })));
    assert_eq!(engine.enumerate_plans(10).unwrap().len(), 2);
}

#[test]
fn test_single_alternative_enumerates_one_plan() {
    init_tracing();
    let mut engine = engine_with(
        cascade_rules::default_rule_registry(),
        Arc::new(DefaultCostModel::default()),
        tpch_catalog(),
        SearchConfig::default(),
    );
    engine
        .init(
            QueryContext::new(OperatorTree::filter(predicate(), scan("orders")), PhysicalPropertySet::any()),
            vec![stage(&["ImplFilter", "ImplSeqScan"], 0.0)],
        )
        .unwrap();
    engine.optimize().unwrap();

    assert_eq!(engine.plan_count().unwrap(), 1);
    let plans = engine.enumerate_plans(5).unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].cost, engine.extract_plan().unwrap().cost);
    assert_eq!(plans[0].node_count(), 2);
}
