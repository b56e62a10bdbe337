//! # Operators and Expression Trees
//!
//! The optimizer's plan vocabulary in three layers:
//!
//! ## Scalar Expressions (`Expr`)
//! Row-level computations: column references, literals, comparisons, boolean logic and
//! function calls. Scalars are carried *inline* by the operators that use them (a
//! filter's predicate, a join's condition), so the memo never holds scalar groups.
//!
//! ## Logical and Physical Operators
//! `LogicalOp` says *what* to compute, `PhysicalOp` says *how*. Exploration rules rewrite
//! logical operators into equivalent logical operators; implementation rules map them to
//! physical ones. Three physical operators double as **enforcers**: `SortOp` (order),
//! `Exchange` (distribution) and `Spool` (rewindability).
//!
//! ## Operator Trees
//! `OperatorTree` is the input form of a query: an operator with owned children. The
//! memo flattens it bottom-up into groups (see `Memo::insert_tree`).

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Reference to a table in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Reference to a column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub name: String,
    pub index: u32,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, name: impl Into<String>, index: u32) -> Self {
        Self {
            table: Some(table.into()),
            name: name.into(),
            index,
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(t) => write!(f, "{}.{}", t, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Constant value. `Float64` is wrapped in `OrderedFloat` so operators stay `Eq + Hash`,
/// which the memo's expression table relies on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(OrderedFloat<f64>),
    Utf8(String),
    /// Days since 1970-01-01.
    Date(i32),
}

impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int64(a), Self::Int64(b)) => a == b,
            (Self::Float64(a), Self::Float64(b)) => a == b,
            (Self::Utf8(a), Self::Utf8(b)) => a == b,
            (Self::Date(a), Self::Date(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ScalarValue {}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Bool(v) => v.hash(state),
            Self::Int64(v) => v.hash(state),
            Self::Float64(v) => v.hash(state),
            Self::Utf8(v) => v.hash(state),
            Self::Date(v) => v.hash(state),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{}", v.0),
            Self::Utf8(v) => write!(f, "'{v}'"),
            Self::Date(v) => write!(f, "DATE({v})"),
        }
    }
}

/// Scalar expression tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    Column(ColumnRef),
    Literal(ScalarValue),
    BinaryOp {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    UnaryOp {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Function {
        name: String,
        args: Vec<Expr>,
    },
    /// Flat conjunction; nested ANDs are flattened by `conjuncts`.
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Expr {
    pub fn column(table: &str, name: &str) -> Self {
        Expr::Column(ColumnRef::new(table, name, 0))
    }

    pub fn literal(value: ScalarValue) -> Self {
        Expr::Literal(value)
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// `left = right`
    pub fn equals(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::Eq, left, right)
    }

    /// Return all column references in this expression.
    pub fn columns(&self) -> Vec<&ColumnRef> {
        let mut cols = Vec::new();
        self.collect_columns(&mut cols);
        cols
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a ColumnRef>) {
        match self {
            Expr::Column(c) => out.push(c),
            Expr::Literal(_) => {}
            Expr::BinaryOp { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Expr::UnaryOp { operand, .. } => operand.collect_columns(out),
            Expr::Function { args, .. } => args.iter().for_each(|a| a.collect_columns(out)),
            Expr::And(exprs) | Expr::Or(exprs) => exprs.iter().for_each(|e| e.collect_columns(out)),
        }
    }

    /// Flatten AND-chains: `A AND (B AND C)` yields `[A, B, C]`.
    pub fn conjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::And(exprs) => exprs.iter().flat_map(|e| e.conjuncts()).collect(),
            other => vec![other],
        }
    }

    /// Rebuild a predicate from conjuncts; `None` for an empty list.
    pub fn from_conjuncts(mut conjuncts: Vec<Expr>) -> Option<Expr> {
        match conjuncts.len() {
            0 => None,
            1 => conjuncts.pop(),
            _ => Some(Expr::And(conjuncts)),
        }
    }

    /// Equi-join column pairs (`a.x = b.y AND ...` yields `[(x, y)]`).
    pub fn equi_join_columns(&self) -> Vec<(&ColumnRef, &ColumnRef)> {
        self.conjuncts()
            .into_iter()
            .filter_map(|c| match c {
                Expr::BinaryOp {
                    op: BinaryOp::Eq,
                    left,
                    right,
                } => match (left.as_ref(), right.as_ref()) {
                    (Expr::Column(l), Expr::Column(r)) => Some((l, r)),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(c) => write!(f, "{c}"),
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::BinaryOp { op, left, right } => write!(f, "{left} {op} {right}"),
            Expr::UnaryOp { op, operand } => write!(f, "{op:?}({operand})"),
            Expr::Function { name, args } => {
                let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "{}({})", name, args.join(", "))
            }
            Expr::And(exprs) | Expr::Or(exprs) => {
                let sep = if matches!(self, Expr::And(_)) { " AND " } else { " OR " };
                let parts: Vec<String> = exprs.iter().map(|e| e.to_string()).collect();
                write!(f, "({})", parts.join(sep))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Add,
    Sub,
    Mul,
    Div,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
    IsNull,
    IsNotNull,
}

/// Join types. Only `Inner` and `Cross` are commutative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Semi,
    Anti,
    Cross,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggExpr {
    pub func: AggFunc,
    pub arg: Expr,
    pub distinct: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub expr: Expr,
    pub ascending: bool,
    pub nulls_first: bool,
}

impl SortKey {
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            ascending: true,
            nulls_first: false,
        }
    }
}

/// How rows are spread across the nodes executing a plan fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Distribution {
    /// All rows on one node.
    Single,
    /// Every row on every node.
    Broadcast,
    /// Hash-partitioned on the given expressions.
    Hash(Vec<Expr>),
    RoundRobin,
}

impl Distribution {
    /// Whether data distributed as `self` satisfies a `required` distribution.
    ///
    /// A replicated input satisfies any hashed requirement: every node already holds
    /// every row, so co-location holds trivially.
    pub fn satisfies(&self, required: &Distribution) -> bool {
        self == required || matches!((self, required), (Distribution::Broadcast, Distribution::Hash(_)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildSide {
    Left,
    Right,
}

/// Logical operators. Children are memo groups, not stored here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalOp {
    /// Leaf table access with optional pruned columns and pushed predicate.
    Scan {
        table: TableRef,
        columns: Vec<ColumnRef>,
        predicate: Option<Expr>,
    },
    Filter {
        predicate: Expr,
    },
    Project {
        exprs: Vec<Expr>,
        aliases: Vec<String>,
    },
    Join {
        join_type: JoinType,
        condition: Expr,
    },
    Aggregate {
        group_by: Vec<Expr>,
        aggregates: Vec<AggExpr>,
    },
    Sort {
        order: Vec<SortKey>,
    },
    Limit {
        offset: u64,
        count: u64,
    },
}

/// Physical operators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhysicalOp {
    /// Full table scan; the only scan strategy.
    SeqScan {
        table: TableRef,
        columns: Vec<ColumnRef>,
        predicate: Option<Expr>,
    },
    /// Row-by-row predicate evaluation; preserves every property of its input.
    Filter {
        predicate: Expr,
    },
    Projection {
        exprs: Vec<Expr>,
        aliases: Vec<String>,
    },
    Limit {
        offset: u64,
        count: u64,
    },
    /// Requires at least one equi-join predicate (or a cross join).
    HashJoin {
        join_type: JoinType,
        build_side: BuildSide,
        condition: Expr,
    },
    /// Requires both inputs sorted on the join keys.
    MergeJoin {
        join_type: JoinType,
        condition: Expr,
    },
    /// Universal fallback, O(n * m).
    NestedLoopJoin {
        join_type: JoinType,
        condition: Expr,
    },
    HashAggregate {
        group_by: Vec<Expr>,
        aggregates: Vec<AggExpr>,
    },
    /// Requires input sorted on the group-by keys.
    StreamAggregate {
        group_by: Vec<Expr>,
        aggregates: Vec<AggExpr>,
    },
    /// Sort enforcer.
    SortOp {
        order: Vec<SortKey>,
    },
    /// Distribution enforcer (shuffle).
    Exchange {
        distribution: Distribution,
    },
    /// Rewindability enforcer: materializes its input so it can be re-scanned.
    Spool,
}

impl PhysicalOp {
    /// Enforcers are the operators the optimizer adds on its own to satisfy a property.
    pub fn is_enforcer(&self) -> bool {
        matches!(
            self,
            PhysicalOp::SortOp { .. } | PhysicalOp::Exchange { .. } | PhysicalOp::Spool
        )
    }
}

/// Unified operator stored in the memo.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Logical(LogicalOp),
    Physical(PhysicalOp),
}

impl Operator {
    pub fn is_logical(&self) -> bool {
        matches!(self, Operator::Logical(_))
    }

    pub fn is_physical(&self) -> bool {
        matches!(self, Operator::Physical(_))
    }

    pub fn as_physical(&self) -> Option<&PhysicalOp> {
        match self {
            Operator::Physical(p) => Some(p),
            Operator::Logical(_) => None,
        }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Operator::Logical(l) => OpKind::Logical(l.kind()),
            Operator::Physical(p) => OpKind::Physical(p.kind()),
        }
    }

    /// Number of children the operator expects.
    pub fn arity(&self) -> usize {
        match self {
            Operator::Logical(LogicalOp::Scan { .. })
            | Operator::Physical(PhysicalOp::SeqScan { .. }) => 0,
            Operator::Logical(LogicalOp::Join { .. })
            | Operator::Physical(
                PhysicalOp::HashJoin { .. }
                | PhysicalOp::MergeJoin { .. }
                | PhysicalOp::NestedLoopJoin { .. },
            ) => 2,
            _ => 1,
        }
    }
}

/// Operator discriminant without data, used by pattern matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Logical(LogicalOpKind),
    Physical(PhysicalOpKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalOpKind {
    Scan,
    Filter,
    Project,
    Join,
    Aggregate,
    Sort,
    Limit,
}

impl LogicalOp {
    pub fn kind(&self) -> LogicalOpKind {
        match self {
            LogicalOp::Scan { .. } => LogicalOpKind::Scan,
            LogicalOp::Filter { .. } => LogicalOpKind::Filter,
            LogicalOp::Project { .. } => LogicalOpKind::Project,
            LogicalOp::Join { .. } => LogicalOpKind::Join,
            LogicalOp::Aggregate { .. } => LogicalOpKind::Aggregate,
            LogicalOp::Sort { .. } => LogicalOpKind::Sort,
            LogicalOp::Limit { .. } => LogicalOpKind::Limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhysicalOpKind {
    SeqScan,
    Filter,
    Projection,
    Limit,
    HashJoin,
    MergeJoin,
    NestedLoopJoin,
    HashAggregate,
    StreamAggregate,
    SortOp,
    Exchange,
    Spool,
}

impl PhysicalOp {
    pub fn kind(&self) -> PhysicalOpKind {
        match self {
            PhysicalOp::SeqScan { .. } => PhysicalOpKind::SeqScan,
            PhysicalOp::Filter { .. } => PhysicalOpKind::Filter,
            PhysicalOp::Projection { .. } => PhysicalOpKind::Projection,
            PhysicalOp::Limit { .. } => PhysicalOpKind::Limit,
            PhysicalOp::HashJoin { .. } => PhysicalOpKind::HashJoin,
            PhysicalOp::MergeJoin { .. } => PhysicalOpKind::MergeJoin,
            PhysicalOp::NestedLoopJoin { .. } => PhysicalOpKind::NestedLoopJoin,
            PhysicalOp::HashAggregate { .. } => PhysicalOpKind::HashAggregate,
            PhysicalOp::StreamAggregate { .. } => PhysicalOpKind::StreamAggregate,
            PhysicalOp::SortOp { .. } => PhysicalOpKind::SortOp,
            PhysicalOp::Exchange { .. } => PhysicalOpKind::Exchange,
            PhysicalOp::Spool => PhysicalOpKind::Spool,
        }
    }
}

impl fmt::Display for PhysicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysicalOp::SeqScan { table, predicate, .. } => match predicate {
                Some(p) => write!(f, "SeqScan({table}, {p})"),
                None => write!(f, "SeqScan({table})"),
            },
            PhysicalOp::Filter { predicate } => write!(f, "Filter({predicate})"),
            PhysicalOp::Projection { aliases, .. } => write!(f, "Projection({})", aliases.join(", ")),
            PhysicalOp::Limit { offset, count } => write!(f, "Limit({offset}, {count})"),
            PhysicalOp::HashJoin {
                join_type,
                build_side,
                condition,
            } => write!(f, "HashJoin[{join_type:?}, build={build_side:?}]({condition})"),
            PhysicalOp::MergeJoin { join_type, condition } => {
                write!(f, "MergeJoin[{join_type:?}]({condition})")
            }
            PhysicalOp::NestedLoopJoin { join_type, condition } => {
                write!(f, "NestedLoopJoin[{join_type:?}]({condition})")
            }
            PhysicalOp::HashAggregate { group_by, .. } => write!(f, "HashAggregate({} keys)", group_by.len()),
            PhysicalOp::StreamAggregate { group_by, .. } => {
                write!(f, "StreamAggregate({} keys)", group_by.len())
            }
            PhysicalOp::SortOp { order } => {
                let keys: Vec<String> = order.iter().map(|k| k.expr.to_string()).collect();
                write!(f, "Sort({})", keys.join(", "))
            }
            PhysicalOp::Exchange { distribution } => write!(f, "Exchange({distribution:?})"),
            PhysicalOp::Spool => write!(f, "Spool"),
        }
    }
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalOp::Scan { table, predicate, .. } => match predicate {
                Some(p) => write!(f, "Get({table}, {p})"),
                None => write!(f, "Get({table})"),
            },
            LogicalOp::Filter { predicate } => write!(f, "Select({predicate})"),
            LogicalOp::Project { aliases, .. } => write!(f, "Project({})", aliases.join(", ")),
            LogicalOp::Join { join_type, condition } => write!(f, "Join[{join_type:?}]({condition})"),
            LogicalOp::Aggregate { group_by, aggregates } => {
                write!(f, "Aggregate({} keys, {} aggs)", group_by.len(), aggregates.len())
            }
            LogicalOp::Sort { order } => write!(f, "OrderBy({} keys)", order.len()),
            LogicalOp::Limit { offset, count } => write!(f, "Limit({offset}, {count})"),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operator::Logical(l) => l.fmt(f),
            Operator::Physical(p) => p.fmt(f),
        }
    }
}

/// An operator with owned children: the input shape of a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperatorTree {
    pub op: Operator,
    pub children: Vec<OperatorTree>,
}

impl OperatorTree {
    pub fn new(op: Operator, children: Vec<OperatorTree>) -> Self {
        Self { op, children }
    }

    pub fn leaf(op: Operator) -> Self {
        Self {
            op,
            children: Vec::new(),
        }
    }

    pub fn scan(table: TableRef) -> Self {
        Self::leaf(Operator::Logical(LogicalOp::Scan {
            table,
            columns: Vec::new(),
            predicate: None,
        }))
    }

    pub fn filter(predicate: Expr, input: OperatorTree) -> Self {
        Self::new(Operator::Logical(LogicalOp::Filter { predicate }), vec![input])
    }

    pub fn join(join_type: JoinType, condition: Expr, left: OperatorTree, right: OperatorTree) -> Self {
        Self::new(
            Operator::Logical(LogicalOp::Join {
                join_type,
                condition,
            }),
            vec![left, right],
        )
    }

    /// Number of operator nodes in the tree.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(|c| c.size()).sum::<usize>()
    }
}
