//! Rule patterns.
//!
//! A rule declares the shape of the expression trees it rewrites as a [`Pattern`]. The
//! engine checks the pattern before handing an expression to `Rule::apply`, so rules
//! only see bindings they can use.
//!
//! Children of a group expression are groups, not expressions. A non-wildcard child
//! pattern therefore matches when *some* member of the (resolved) child group matches
//! it. Logical matchers only look at logical members and physical matchers only at
//! physical ones.

use crate::expr::{LogicalOpKind, Operator, PhysicalOpKind};
use crate::group_expression::GroupExpression;
use crate::memo::{ExprId, Memo};

#[derive(Debug, Clone)]
pub enum Pattern {
    /// An operator accepted by the matcher, with one pattern per child.
    Operator(OpMatcher, Vec<Pattern>),
    /// Any group.
    Any,
    /// An expression without children.
    Leaf,
}

#[derive(Debug, Clone)]
pub enum OpMatcher {
    LogicalOp(LogicalOpKind),
    PhysicalOp(PhysicalOpKind),
    AnyLogical,
    AnyPhysical,
}

impl OpMatcher {
    fn accepts(&self, op: &Operator) -> bool {
        match (self, op) {
            (OpMatcher::LogicalOp(kind), Operator::Logical(l)) => l.kind() == *kind,
            (OpMatcher::PhysicalOp(kind), Operator::Physical(p)) => p.kind() == *kind,
            (OpMatcher::AnyLogical, Operator::Logical(_)) | (OpMatcher::AnyPhysical, Operator::Physical(_)) => true,
            _ => false,
        }
    }

    fn is_logical(&self) -> bool {
        matches!(self, OpMatcher::LogicalOp(_) | OpMatcher::AnyLogical)
    }
}

impl Pattern {
    /// Logical operator of `kind` over `children`.
    pub fn logical(kind: LogicalOpKind, children: Vec<Pattern>) -> Self {
        Pattern::Operator(OpMatcher::LogicalOp(kind), children)
    }

    fn unary(kind: LogicalOpKind) -> Self {
        Self::logical(kind, vec![Pattern::Any])
    }

    pub fn scan() -> Self {
        Self::logical(LogicalOpKind::Scan, vec![])
    }

    pub fn filter() -> Self {
        Self::unary(LogicalOpKind::Filter)
    }

    pub fn project() -> Self {
        Self::unary(LogicalOpKind::Project)
    }

    pub fn aggregate() -> Self {
        Self::unary(LogicalOpKind::Aggregate)
    }

    pub fn sort() -> Self {
        Self::unary(LogicalOpKind::Sort)
    }

    pub fn limit() -> Self {
        Self::unary(LogicalOpKind::Limit)
    }

    pub fn join() -> Self {
        Self::logical(LogicalOpKind::Join, vec![Pattern::Any, Pattern::Any])
    }

    /// `(A ⋈ B) ⋈ C`
    pub fn join_join_left() -> Self {
        Self::logical(LogicalOpKind::Join, vec![Self::join(), Pattern::Any])
    }

    /// `Filter(A ⋈ B)`
    pub fn filter_join() -> Self {
        Self::logical(LogicalOpKind::Filter, vec![Self::join()])
    }

    /// `Project(Scan)`
    pub fn project_scan() -> Self {
        Self::logical(LogicalOpKind::Project, vec![Self::scan()])
    }
}

/// Whether memo expression `expr_id` matches `pattern`.
pub fn matches(memo: &Memo, expr_id: ExprId, pattern: &Pattern) -> bool {
    matches_expr(memo, &memo.expr(expr_id), pattern)
}

/// Whether `expr` matches `pattern`, looking through child groups.
pub fn matches_expr(memo: &Memo, expr: &GroupExpression, pattern: &Pattern) -> bool {
    let (matcher, child_patterns) = match pattern {
        Pattern::Any => return true,
        Pattern::Leaf => return expr.children.is_empty(),
        Pattern::Operator(matcher, children) => (matcher, children),
    };
    if !matcher.accepts(&expr.op) || expr.children.len() != child_patterns.len() {
        return false;
    }
    expr.children
        .iter()
        .zip(child_patterns)
        .all(|(child, child_pattern)| group_matches(memo, *child, child_pattern))
}

fn group_matches(memo: &Memo, group: crate::memo::GroupId, pattern: &Pattern) -> bool {
    let members = {
        let group = memo.group(memo.resolve(group));
        match pattern {
            Pattern::Any => return true,
            Pattern::Operator(matcher, _) if matcher.is_logical() => group.logical_exprs(),
            Pattern::Operator(..) => group.physical_exprs(),
            Pattern::Leaf => {
                let mut all = group.logical_exprs();
                all.extend(group.physical_exprs());
                all
            }
        }
    };
    members.into_iter().any(|id| matches(memo, id, pattern))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{Expr, JoinType, OperatorTree, TableRef};

    fn scan(name: &str) -> OperatorTree {
        OperatorTree::scan(TableRef::new("s", name))
    }

    fn join(l: OperatorTree, r: OperatorTree) -> OperatorTree {
        OperatorTree::join(JoinType::Inner, Expr::column("a", "x"), l, r)
    }

    fn root_expr(memo: &Memo, group: crate::memo::GroupId) -> ExprId {
        memo.group(group).logical_exprs()[0]
    }

    #[test]
    fn test_join_of_join_matches_left_deep_only() {
        let memo = Memo::new();
        let left_deep = memo.insert_tree(&join(join(scan("a"), scan("b")), scan("c"))).unwrap();
        let right_deep = memo.insert_tree(&join(scan("a"), join(scan("b"), scan("c")))).unwrap();
        assert!(matches(&memo, root_expr(&memo, left_deep), &Pattern::join_join_left()));
        assert!(!matches(&memo, root_expr(&memo, right_deep), &Pattern::join_join_left()));
        assert!(matches(&memo, root_expr(&memo, right_deep), &Pattern::join()));
    }

    #[test]
    fn test_leaf_and_kind_mismatch() {
        let memo = Memo::new();
        let g = memo.insert_tree(&scan("a")).unwrap();
        let id = root_expr(&memo, g);
        assert!(matches(&memo, id, &Pattern::Leaf));
        assert!(matches(&memo, id, &Pattern::scan()));
        assert!(!matches(&memo, id, &Pattern::filter()));
    }

    #[test]
    fn test_child_pattern_looks_through_duplicate_groups() {
        let memo = Memo::new();
        let a = memo.insert_tree(&scan("a")).unwrap();
        let b = memo.insert_tree(&scan("b")).unwrap();
        let filter = OperatorTree::filter(Expr::column("a", "x"), scan("b"));
        let top = memo.insert_tree(&filter).unwrap();
        memo.mark_duplicates(a, b);
        let id = root_expr(&memo, top);
        assert!(matches(&memo, id, &Pattern::logical(LogicalOpKind::Filter, vec![Pattern::scan()])));
        assert!(!matches(&memo, id, &Pattern::filter_join()));
    }
}
