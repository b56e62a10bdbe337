//! Helpers shared by the integration tests.

#![allow(dead_code)]

use cascade_core::catalog::{Catalog, InMemoryCatalog};
use cascade_core::cost::{Cost, CostModel, DefaultCostModel};
use cascade_core::engine::{Engine, QueryContext, SearchConfig};
use cascade_core::expr::*;
use cascade_core::memo::Memo;
use cascade_core::properties::PhysicalPropertySet;
use cascade_core::rule::RuleRegistry;
use cascade_core::stage::SearchStage;
use cascade_core::stats::{ColumnStatistics, DefaultStatsDerivation, Statistics, StatsDerivation};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Install a test-friendly subscriber once; `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cascade_core=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub fn equi(lt: &str, lc: &str, rt: &str, rc: &str) -> Expr {
    Expr::equals(Expr::column(lt, lc), Expr::column(rt, rc))
}

pub fn scan(name: &str) -> OperatorTree {
    OperatorTree::scan(TableRef::new("tpch", name))
}

pub fn inner_join(condition: Expr, left: OperatorTree, right: OperatorTree) -> OperatorTree {
    OperatorTree::join(JoinType::Inner, condition, left, right)
}

/// Add a table with the given row count and column NDVs.
pub fn add_table(catalog: &mut InMemoryCatalog, name: &str, rows: f64, cols: &[(&str, f64)]) {
    let table = TableRef::new("tpch", name);
    let columns = cols
        .iter()
        .enumerate()
        .map(|(i, (col, _))| ColumnRef::new(name, *col, i as u32))
        .collect();
    let stats = cols.iter().fold(Statistics::new(rows, rows * 100.0), |stats, (col, ndv)| {
        stats.with_column(*col, ColumnStatistics::new(*ndv, 0.0))
    });
    catalog.add_table(&table, columns, stats);
}

/// TPC-H SF=1 tables used by the join tests.
pub fn tpch_catalog() -> InMemoryCatalog {
    let mut c = InMemoryCatalog::new();
    add_table(&mut c, "region", 5.0, &[("r_regionkey", 5.0), ("r_name", 5.0)]);
    add_table(
        &mut c,
        "nation",
        25.0,
        &[("n_nationkey", 25.0), ("n_regionkey", 5.0), ("n_name", 25.0)],
    );
    add_table(&mut c, "supplier", 10_000.0, &[("s_suppkey", 10_000.0), ("s_nationkey", 25.0)]);
    add_table(&mut c, "customer", 150_000.0, &[("c_custkey", 150_000.0), ("c_nationkey", 25.0)]);
    add_table(
        &mut c,
        "orders",
        1_500_000.0,
        &[("o_orderkey", 1_500_000.0), ("o_custkey", 150_000.0), ("o_orderdate", 2_500.0)],
    );
    add_table(
        &mut c,
        "lineitem",
        6_001_215.0,
        &[("l_orderkey", 1_500_000.0), ("l_suppkey", 10_000.0), ("l_discount", 11.0)],
    );
    add_table(
        &mut c,
        "part",
        200_000.0,
        &[("p_partkey", 200_000.0), ("p_size", 50.0), ("p_type", 150.0)],
    );
    add_table(
        &mut c,
        "partsupp",
        800_000.0,
        &[("ps_partkey", 200_000.0), ("ps_suppkey", 10_000.0)],
    );
    c
}

pub fn engine_with(
    rules: RuleRegistry,
    cost_model: Arc<dyn CostModel>,
    catalog: InMemoryCatalog,
    config: SearchConfig,
) -> Engine {
    Engine::new(Arc::new(rules), cost_model, Arc::new(catalog), config)
}

/// Optimize `tree` with the built-in rules and default stages.
pub fn optimize(tree: OperatorTree, required: PhysicalPropertySet, catalog: InMemoryCatalog, config: SearchConfig) -> Engine {
    init_tracing();
    let mut engine = engine_with(
        cascade_rules::default_rule_registry(),
        Arc::new(DefaultCostModel::default()),
        catalog,
        config,
    );
    engine
        .init(QueryContext::new(tree, required), Vec::<SearchStage>::new())
        .expect("init");
    engine.optimize().expect("optimize");
    engine
}

/// Cost model counting its invocations.
#[derive(Default)]
pub struct CountingCostModel {
    inner: DefaultCostModel,
    calls: AtomicUsize,
}

impl CountingCostModel {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CostModel for CountingCostModel {
    fn compute_cost(
        &self,
        op: &PhysicalOp,
        input_stats: &[&Statistics],
        children_costs: &[Cost],
        required_props: &PhysicalPropertySet,
    ) -> Cost {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.compute_cost(op, input_stats, children_costs, required_props)
    }
}

/// Statistics derivation counting its invocations.
#[derive(Default)]
pub struct CountingStats {
    calls: AtomicUsize,
}

impl CountingStats {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StatsDerivation for CountingStats {
    fn derive_stats(&self, op: &Operator, child_stats: &[&Statistics], catalog: &dyn Catalog) -> Statistics {
        self.calls.fetch_add(1, Ordering::SeqCst);
        DefaultStatsDerivation.derive_stats(op, child_stats, catalog)
    }
}

/// Cost contexts over every expression of the memo.
pub fn total_cost_contexts(memo: &Memo) -> usize {
    memo.exprs().iter().map(|e| e.cost_context_count()).sum()
}

/// Groups whose statistics were derived.
pub fn groups_with_stats(memo: &Memo) -> usize {
    memo.groups().iter().filter(|g| g.stats().is_some()).count()
}
