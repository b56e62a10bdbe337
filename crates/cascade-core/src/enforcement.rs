//! # Property Enforcement
//!
//! After a physical group expression has been optimized for an optimization context, its
//! delivered properties are compared with the required ones, property by property. Each
//! comparison yields an [`EnforcingType`]:
//!
//! | type          | expression viable? | add enforcer? |
//! |---------------|--------------------|---------------|
//! | `Unnecessary` | yes                | no            |
//! | `Optional`    | yes                | yes           |
//! | `Required`    | no                 | yes           |
//! | `Prohibited`  | no                 | no            |
//!
//! An expression is viable for a context only if no property is `Prohibited` and every
//! property is `Optional` or `Unnecessary`. Enforcers (`SortOp`, `Exchange`, `Spool`) are
//! inserted into the same group with the group itself as their only child; the
//! requirement they pass down omits the property they enforce.

use crate::expr::{Distribution, PhysicalOp};
use crate::properties::PhysicalPropertySet;
use std::fmt;

/// How a single required property relates to an operator's delivered properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnforcingType {
    /// Delivered properties fall short; an enforcer must provide the property.
    Required,
    /// The operator satisfies the property but an enforced alternative is also worth costing.
    Optional,
    /// Neither the operator nor an enforcer on top of it may provide the property.
    Prohibited,
    /// The property is not required or already satisfied.
    Unnecessary,
}

impl EnforcingType {
    /// Whether an enforcer should be added on top of the expression.
    pub fn enforce(self) -> bool {
        matches!(self, EnforcingType::Optional | EnforcingType::Required)
    }

    /// Whether the expression itself may be costed for the context.
    pub fn optimize(self) -> bool {
        matches!(self, EnforcingType::Optional | EnforcingType::Unnecessary)
    }

    pub fn prohibited(self) -> bool {
        self == EnforcingType::Prohibited
    }
}

impl fmt::Display for EnforcingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnforcingType::Required => "required",
            EnforcingType::Optional => "optional",
            EnforcingType::Prohibited => "prohibited",
            EnforcingType::Unnecessary => "unnecessary",
        };
        f.write_str(s)
    }
}

/// Per-property enforcing types of one (expression, context) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyEnforcement {
    pub order: EnforcingType,
    pub distribution: EnforcingType,
    pub rewindability: EnforcingType,
    pub partition_propagation: EnforcingType,
}

impl PropertyEnforcement {
    fn all(&self) -> [EnforcingType; 4] {
        [
            self.order,
            self.distribution,
            self.rewindability,
            self.partition_propagation,
        ]
    }

    /// The expression can be costed for the context.
    pub fn is_viable(&self) -> bool {
        let all = self.all();
        !all.iter().any(|e| e.prohibited()) && all.iter().all(|e| e.optimize())
    }

    /// Some property rules out both the expression and any enforcer on top of it.
    pub fn is_prohibited(&self) -> bool {
        self.all().iter().any(|e| e.prohibited())
    }

    /// Enforcer operators to insert for the required properties.
    pub fn enforcers(&self, required: &PhysicalPropertySet) -> Vec<PhysicalOp> {
        let mut ops = Vec::new();
        if self.order.enforce() {
            if let Some(order) = &required.sort_order {
                ops.push(PhysicalOp::SortOp { order: order.clone() });
            }
        }
        if self.distribution.enforce() {
            if let Some(distribution) = &required.distribution {
                ops.push(PhysicalOp::Exchange {
                    distribution: distribution.clone(),
                });
            }
        }
        if self.rewindability.enforce() {
            ops.push(PhysicalOp::Spool);
        }
        ops
    }
}

fn is_pass_through(op: &PhysicalOp) -> bool {
    matches!(
        op,
        PhysicalOp::Filter { .. } | PhysicalOp::Projection { .. } | PhysicalOp::Limit { .. }
    )
}

fn order_enforcing_type(
    op: &PhysicalOp,
    required: &PhysicalPropertySet,
    delivered: &PhysicalPropertySet,
) -> EnforcingType {
    if !required.order_required() || required.order_satisfied_by(delivered) {
        return EnforcingType::Unnecessary;
    }
    match op {
        // a sort producing some other order, or a motion that destroys order
        PhysicalOp::SortOp { .. } | PhysicalOp::Exchange { .. } => EnforcingType::Prohibited,
        _ => EnforcingType::Required,
    }
}

fn distribution_enforcing_type(
    op: &PhysicalOp,
    required: &PhysicalPropertySet,
    delivered: &PhysicalPropertySet,
) -> EnforcingType {
    let Some(required_dist) = &required.distribution else {
        return EnforcingType::Unnecessary;
    };
    if let Some(delivered_dist) = &delivered.distribution {
        if delivered_dist == required_dist {
            return EnforcingType::Unnecessary;
        }
        if delivered_dist.satisfies(required_dist) {
            // replicated input satisfies a hashed requirement, a re-hash may still be cheaper
            return if matches!(delivered_dist, Distribution::Broadcast) && !is_pass_through(op) {
                EnforcingType::Optional
            } else {
                EnforcingType::Unnecessary
            };
        }
    }
    if matches!(op, PhysicalOp::Exchange { .. }) || required.partition_propagation_required() {
        return EnforcingType::Prohibited;
    }
    EnforcingType::Required
}

fn rewindability_enforcing_type(
    required: &PhysicalPropertySet,
    delivered: &PhysicalPropertySet,
) -> EnforcingType {
    if !required.rewindability_required() || required.rewindability_satisfied_by(delivered) {
        EnforcingType::Unnecessary
    } else {
        EnforcingType::Required
    }
}

fn partition_propagation_enforcing_type(
    op: &PhysicalOp,
    required: &PhysicalPropertySet,
) -> EnforcingType {
    if required.partition_propagation_required() && matches!(op, PhysicalOp::Exchange { .. }) {
        EnforcingType::Prohibited
    } else {
        EnforcingType::Unnecessary
    }
}

/// Classify every required property against what `op` delivers.
pub fn enforcing_types(
    op: &PhysicalOp,
    required: &PhysicalPropertySet,
    delivered: &PhysicalPropertySet,
) -> PropertyEnforcement {
    PropertyEnforcement {
        order: order_enforcing_type(op, required, delivered),
        distribution: distribution_enforcing_type(op, required, delivered),
        rewindability: rewindability_enforcing_type(required, delivered),
        partition_propagation: partition_propagation_enforcing_type(op, required),
    }
}

/// Whether `op` may be optimized for `required` at all.
///
/// Enforcers only make sense when the property they provide is actually requested.
/// This also cuts the self-reference an enforcer has on its own group.
pub fn check_required_props(op: &PhysicalOp, required: &PhysicalPropertySet) -> bool {
    match op {
        PhysicalOp::SortOp { order } => {
            required.order_required()
                && required.order_satisfied_by(&PhysicalPropertySet::with_sort(order.clone()))
        }
        PhysicalOp::Exchange { distribution } => {
            !required.partition_propagation_required()
                && required
                    .distribution
                    .as_ref()
                    .is_some_and(|d| distribution.satisfies(d))
        }
        PhysicalOp::Spool => required.rewindability_required(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{Expr, SortKey};
    use crate::properties::{PartitionPropagation, Rewindability};

    fn order_a() -> Vec<SortKey> {
        vec![SortKey::asc(Expr::column("t", "a"))]
    }

    fn scan() -> PhysicalOp {
        PhysicalOp::SeqScan {
            table: crate::expr::TableRef::new("s", "t"),
            columns: vec![],
            predicate: None,
        }
    }

    #[test]
    fn test_enforcing_type_predicates() {
        assert!(EnforcingType::Required.enforce());
        assert!(!EnforcingType::Required.optimize());
        assert!(EnforcingType::Optional.enforce() && EnforcingType::Optional.optimize());
        assert!(!EnforcingType::Prohibited.enforce() && !EnforcingType::Prohibited.optimize());
        assert!(EnforcingType::Unnecessary.optimize());
    }

    #[test]
    fn test_unsorted_scan_requires_sort_enforcer() {
        let required = PhysicalPropertySet::with_sort(order_a());
        let delivered = crate::properties::derive_delivered(&scan(), &[]);
        let epet = enforcing_types(&scan(), &required, &delivered);
        assert_eq!(epet.order, EnforcingType::Required);
        assert!(!epet.is_viable());
        assert_eq!(epet.enforcers(&required), vec![PhysicalOp::SortOp { order: order_a() }]);
    }

    #[test]
    fn test_exchange_prohibited_under_partition_propagation() {
        let required = PhysicalPropertySet {
            distribution: Some(Distribution::Single),
            partition_propagation: Some(PartitionPropagation::new([1])),
            ..PhysicalPropertySet::default()
        };
        let exchange = PhysicalOp::Exchange {
            distribution: Distribution::Single,
        };
        assert!(!check_required_props(&exchange, &required));
        let epet = enforcing_types(&scan(), &required, &PhysicalPropertySet::any());
        assert!(epet.distribution.prohibited());
        assert!(epet.enforcers(&required).is_empty());
    }

    #[test]
    fn test_enforcer_rejected_without_its_property() {
        let any = PhysicalPropertySet::any();
        assert!(!check_required_props(&PhysicalOp::SortOp { order: order_a() }, &any));
        assert!(!check_required_props(&PhysicalOp::Spool, &any));
        assert!(check_required_props(
            &PhysicalOp::Spool,
            &PhysicalPropertySet::with_rewindability(Rewindability::Rewindable)
        ));
    }

    #[test]
    fn test_sort_with_other_order_is_prohibited() {
        let required = PhysicalPropertySet::with_sort(order_a());
        let other = vec![SortKey::asc(Expr::column("t", "b"))];
        let op = PhysicalOp::SortOp { order: other.clone() };
        let delivered = PhysicalPropertySet::with_sort(other);
        assert!(enforcing_types(&op, &required, &delivered).order.prohibited());
    }
}
