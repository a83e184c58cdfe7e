//! Phase B — feasibility filter (spec.md §4.4).

use std::collections::HashMap;

use regex::Regex;

use crate::domain::models::{
    Constraint, ConstraintOperator, Node, NodeId, ResourceRequest, TaskGroup,
};

/// Resource usage accumulated against a node during this scheduling pass,
/// on top of whatever is already committed in the `StateStore` — the
/// "optimistic node view" the reconciler consults before the applier does
/// its own, authoritative check (spec.md §4.4 Phase B, §4.5).
#[derive(Debug, Default, Clone)]
pub struct OptimisticUsage(pub HashMap<NodeId, ResourceRequest>);

impl OptimisticUsage {
    #[must_use]
    pub fn used(&self, node_id: &NodeId) -> ResourceRequest {
        self.0.get(node_id).copied().unwrap_or(ResourceRequest {
            cpu_mhz: 0,
            memory_mb: 0,
            disk_mb: 0,
            network_ports: 0,
        })
    }

    pub fn reserve(&mut self, node_id: NodeId, want: ResourceRequest) {
        let entry = self.0.entry(node_id).or_insert(ResourceRequest {
            cpu_mhz: 0,
            memory_mb: 0,
            disk_mb: 0,
            network_ports: 0,
        });
        entry.cpu_mhz += want.cpu_mhz;
        entry.memory_mb += want.memory_mb;
        entry.disk_mb += want.disk_mb;
        entry.network_ports += want.network_ports;
    }
}

fn node_attr_value(node: &Node, l_target: &str) -> Option<String> {
    match l_target {
        "${node.class}" => Some(node.class.clone()),
        "${node.datacenter}" => Some(node.datacenter.clone()),
        "${node.id}" => Some(node.id.0.clone()),
        other => other
            .strip_prefix("${attr.")
            .and_then(|rest| rest.strip_suffix('}'))
            .and_then(|key| node.attributes.get(key).cloned()),
    }
}

fn eval_ordered(op: ConstraintOperator, lhs: &str, rhs: &str) -> bool {
    match (lhs.parse::<f64>(), rhs.parse::<f64>()) {
        (Ok(l), Ok(r)) => match op {
            ConstraintOperator::Gt => l > r,
            ConstraintOperator::Gte => l >= r,
            ConstraintOperator::Lt => l < r,
            ConstraintOperator::Lte => l <= r,
            _ => false,
        },
        _ => false,
    }
}

/// Evaluates a single hard constraint against a node. `distinct_hosts` and
/// `distinct_property` are handled by the caller because they need the
/// cohort of sibling placements, not just this node.
fn satisfies_attribute_constraint(node: &Node, constraint: &Constraint) -> bool {
    let Some(lhs) = node_attr_value(node, &constraint.l_target) else {
        return false;
    };
    match constraint.operator {
        ConstraintOperator::Eq => lhs == constraint.r_target,
        ConstraintOperator::NotEq => lhs != constraint.r_target,
        ConstraintOperator::Gt | ConstraintOperator::Gte | ConstraintOperator::Lt | ConstraintOperator::Lte => {
            eval_ordered(constraint.operator, &lhs, &constraint.r_target)
        }
        ConstraintOperator::Regexp => Regex::new(&constraint.r_target).is_ok_and(|re| re.is_match(&lhs)),
        ConstraintOperator::SetContains => constraint.r_target.split(',').any(|v| v.trim() == lhs),
        ConstraintOperator::Version => lhs == constraint.r_target,
        ConstraintOperator::DistinctHosts | ConstraintOperator::DistinctProperty => true,
    }
}

/// Nodes already hosting a non-terminal allocation of the same job+group,
/// for `distinct_hosts` / `distinct_property` enforcement.
pub struct PlacementCohort<'a> {
    pub occupied_nodes: &'a [NodeId],
    /// node attribute value -> count of placements already using it, for
    /// `distinct_property` (open question #3: canary allocations count).
    pub property_counts: &'a HashMap<String, u32>,
}

/// Returns the datacenter/eligibility/status/constraint/capacity-filtered
/// candidate nodes for one placement request.
#[must_use]
pub fn feasible_nodes<'a>(
    nodes: &'a [Node],
    datacenters: &[String],
    group: &TaskGroup,
    usage: &OptimisticUsage,
    cohort: &PlacementCohort<'_>,
) -> Vec<&'a Node> {
    nodes
        .iter()
        .filter(|n| datacenters.is_empty() || datacenters.contains(&n.datacenter))
        .filter(|n| n.is_schedulable())
        .filter(|n| !n.is_draining())
        .filter(|n| n.drivers.values().all(|h| h.healthy || !h.detected))
        .filter(|n| {
            group.constraints.iter().all(|c| match c.operator {
                ConstraintOperator::DistinctHosts => !cohort.occupied_nodes.contains(&n.id),
                ConstraintOperator::DistinctProperty => {
                    let Some(value) = node_attr_value(n, &c.l_target) else {
                        return true;
                    };
                    let limit: u32 = c.r_target.parse().unwrap_or(1);
                    cohort.property_counts.get(&value).copied().unwrap_or(0) < limit
                }
                _ => satisfies_attribute_constraint(n, c),
            })
        })
        .filter(|n| {
            let used = usage.used(&n.id);
            n.resources.fits(&n.reserved, &used, &group.resources)
        })
        .collect()
}
