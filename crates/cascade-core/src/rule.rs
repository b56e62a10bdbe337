//! # Rule System
//!
//! Rules (xforms) are the only way the search space grows after the initial insertion.
//!
//! ## Rule Types
//!
//! - **Transformation rules** (`RuleType::Transformation`) rewrite a logical operator
//!   into an equivalent logical operator, e.g. join commutativity (A JOIN B -> B JOIN A).
//!   They run during exploration.
//!
//! - **Implementation rules** (`RuleType::Implementation`) map a logical operator to one
//!   or more physical operators, e.g. a logical Join to a HashJoin or MergeJoin. They
//!   run during implementation.
//!
//! ## Pattern Matching
//!
//! Each rule declares a [`Pattern`]. A rule is only applied to expressions matching it.
//!
//! ## Rule Deduplication
//!
//! Each rule has a `rule_hash()` fingerprint. Every group expression remembers the
//! fingerprints already applied to it, so a rule fires at most once per expression, even
//! across search stages.
//!
//! ## Rule Registry
//!
//! The [`RuleRegistry`] holds the base rules plus connector-specific rule sets keyed by
//! source type (e.g. a Hive connector might add an `ImplHiveScan` rule). Rules are shared
//! as `Arc<dyn Rule>` because transformation jobs hold on to the rule they apply.

use crate::catalog::Catalog;
use crate::expr::Operator;
use crate::group_expression::{GroupExpression, OptimizationLevel};
use crate::memo::{GroupId, Memo};
use crate::pattern::Pattern;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Classification of optimization rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleType {
    /// Logical → Logical transformation (e.g., join commutativity).
    Transformation,
    /// Logical → Physical implementation (e.g., join → hash join).
    Implementation,
}

/// Context passed to rules during application.
pub struct OptContext<'a> {
    pub catalog: &'a dyn Catalog,
}

/// A child reference in a rule result: an existing group or a new sub-expression.
///
/// Join associativity is the typical user:
///
/// ```text
/// (A ⋈ B) ⋈ C  →  A ⋈ (B ⋈ C)
/// ```
///
/// needs a group for `B ⋈ C`, expressed as `RuleChild::NewExpr(Join, [Group(B), Group(C)])`.
/// The engine creates (or finds) that group when inserting the result.
#[derive(Debug, Clone)]
pub enum RuleChild {
    /// Reference to an existing group in the memo.
    Group(GroupId),
    /// A new sub-expression, placed in its own group unless an equal one already exists.
    NewExpr(Operator, Vec<RuleChild>),
}

/// Result of applying a rule to an expression. Both kinds land in the group of the
/// expression the rule was applied to.
#[derive(Debug, Clone)]
pub enum RuleResult {
    /// A new expression over existing child groups.
    Substitution(Operator, Vec<GroupId>),
    /// A new expression where some children are new sub-expressions.
    NewChildren(Operator, Vec<RuleChild>),
}

/// A rule transforms or implements expressions.
pub trait Rule: Send + Sync {
    /// Unique name of this rule. Search stages refer to rules by name.
    fn name(&self) -> &str;

    fn rule_type(&self) -> RuleType;

    /// Pattern that this rule matches against.
    fn pattern(&self) -> Pattern;

    /// Apply the rule to a matching expression.
    fn apply(&self, expr: &GroupExpression, memo: &Memo, ctx: &OptContext) -> Vec<RuleResult>;

    /// Level given to the expressions this rule produces. Group optimization costs
    /// `High` expressions before `Low` ones.
    fn optimization_level(&self) -> OptimizationLevel {
        OptimizationLevel::Low
    }

    /// Hash for fingerprinting (to avoid re-applying rules).
    fn rule_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.name().hash(&mut hasher);
        hasher.finish()
    }
}

/// A named set of rules (e.g., for a specific connector).
pub struct RuleSet {
    pub name: String,
    pub rules: Vec<Arc<dyn Rule>>,
}

/// Registry of optimization rules.
pub struct RuleRegistry {
    pub base_rules: Vec<Arc<dyn Rule>>,
    pub source_rules: HashMap<String, RuleSet>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self {
            base_rules: Vec::new(),
            source_rules: HashMap::new(),
        }
    }

    pub fn add_rule(&mut self, rule: Arc<dyn Rule>) {
        self.base_rules.push(rule);
    }

    pub fn add_source_rule_set(&mut self, name: impl Into<String>, rule_set: RuleSet) {
        self.source_rules.insert(name.into(), rule_set);
    }

    /// Get all active rules for a given source type.
    pub fn active_rules(&self, source: Option<&str>) -> Vec<Arc<dyn Rule>> {
        let mut rules: Vec<Arc<dyn Rule>> = self.base_rules.clone();
        if let Some(rs) = source.and_then(|s| self.source_rules.get(s)) {
            rules.extend(rs.rules.iter().cloned());
        }
        rules
    }

    /// Active rules of one type.
    pub fn rules_of_type(&self, rule_type: RuleType, source: Option<&str>) -> Vec<Arc<dyn Rule>> {
        self.active_rules(source)
            .into_iter()
            .filter(|r| r.rule_type() == rule_type)
            .collect()
    }

    pub fn transformation_rules(&self, source: Option<&str>) -> Vec<Arc<dyn Rule>> {
        self.rules_of_type(RuleType::Transformation, source)
    }

    pub fn implementation_rules(&self, source: Option<&str>) -> Vec<Arc<dyn Rule>> {
        self.rules_of_type(RuleType::Implementation, source)
    }

    /// Whether a rule of this name is registered, in the base rules or any rule set.
    pub fn contains(&self, name: &str) -> bool {
        self.base_rules
            .iter()
            .chain(self.source_rules.values().flat_map(|rs| rs.rules.iter()))
            .any(|r| r.name() == name)
    }

    pub fn len(&self) -> usize {
        self.base_rules.len() + self.source_rules.values().map(|rs| rs.rules.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
