//! Phase C — scoring (spec.md §4.4). Feasible nodes are scored by a
//! weighted sum and the top-2 is tracked so ties break deterministically.

use std::collections::HashMap;

use crate::domain::models::{Affinity, ConstraintOperator, Node, NodeId, ResourceRequest, Spread, TaskGroup};

use super::feasibility::OptimisticUsage;

const RESCHEDULE_PENALTY: f64 = 50.0;
const ANTI_AFFINITY_PENALTY_PER_ALLOC: f64 = 5.0;

/// Per-call scoring context: everything the composite score needs besides
/// the node and group themselves.
pub struct ScoringContext<'a> {
    pub usage: &'a OptimisticUsage,
    /// Nodes that previously hosted a failed instance of this lineage.
    pub reschedule_penalty_nodes: &'a [NodeId],
    /// Count of this job+group's existing allocations already on each node.
    pub same_job_group_counts: &'a HashMap<NodeId, u32>,
    /// Current distribution of the spread attribute's values across all
    /// placed allocations of this group, for the spread bonus.
    pub spread_distribution: &'a HashMap<String, u32>,
    pub spread_total: u32,
}

fn binpack_score(node: &Node, used: &ResourceRequest, want: &ResourceRequest) -> f64 {
    let cpu_util = (used.cpu_mhz + want.cpu_mhz) as f64 / node.resources.cpu_mhz.max(1) as f64;
    let mem_util = (used.memory_mb + want.memory_mb) as f64 / node.resources.memory_mb.max(1) as f64;
    let disk_util = (used.disk_mb + want.disk_mb) as f64 / node.resources.disk_mb.max(1) as f64;
    let utils = [cpu_util, mem_util, disk_util];
    let n = utils.len() as f64;
    let sum_inv: f64 = utils.iter().map(|u| 1.0 / u.max(0.01)).sum();
    n / sum_inv * 100.0
}

fn affinity_score(node: &Node, affinities: &[Affinity]) -> f64 {
    affinities
        .iter()
        .map(|a| {
            let matches = match node_attr(node, &a.l_target) {
                Some(v) => matches_operator(a.operator, &v, &a.r_target),
                None => false,
            };
            if matches {
                f64::from(a.weight)
            } else {
                -f64::from(a.weight) / 2.0
            }
        })
        .sum()
}

fn spread_score(node: &Node, spreads: &[Spread], ctx: &ScoringContext<'_>) -> f64 {
    spreads
        .iter()
        .map(|s| {
            let Some(value) = node_attr(node, &s.attribute) else {
                return 0.0;
            };
            let current = ctx.spread_distribution.get(&value).copied().unwrap_or(0);
            let current_pct = if ctx.spread_total == 0 {
                0.0
            } else {
                f64::from(current) / f64::from(ctx.spread_total) * 100.0
            };
            let target_pct = s
                .targets
                .iter()
                .find(|(v, _)| v == &value)
                .map_or(100.0 / s.targets.len().max(1) as f64, |(_, pct)| f64::from(*pct));
            if current_pct < target_pct {
                f64::from(s.weight)
            } else {
                0.0
            }
        })
        .sum()
}

fn node_attr(node: &Node, target: &str) -> Option<String> {
    match target {
        "${node.class}" => Some(node.class.clone()),
        "${node.datacenter}" => Some(node.datacenter.clone()),
        "${node.id}" => Some(node.id.0.clone()),
        other => other
            .strip_prefix("${attr.")
            .and_then(|rest| rest.strip_suffix('}'))
            .and_then(|key| node.attributes.get(key).cloned()),
    }
}

fn matches_operator(op: ConstraintOperator, lhs: &str, rhs: &str) -> bool {
    match op {
        ConstraintOperator::Eq => lhs == rhs,
        ConstraintOperator::NotEq => lhs != rhs,
        ConstraintOperator::SetContains => rhs.split(',').any(|v| v.trim() == lhs),
        _ => false,
    }
}

/// Composite score for one feasible node placing one group instance.
#[must_use]
pub fn score_node(node: &Node, group: &TaskGroup, ctx: &ScoringContext<'_>) -> f64 {
    let used = ctx.usage.used(&node.id);
    let mut score = binpack_score(node, &used, &group.resources);
    score += affinity_score(node, &group.affinities);
    score += spread_score(node, &group.spreads, ctx);
    if ctx.reschedule_penalty_nodes.contains(&node.id) {
        score -= RESCHEDULE_PENALTY;
    }
    let collocated = ctx.same_job_group_counts.get(&node.id).copied().unwrap_or(0);
    score -= f64::from(collocated) * ANTI_AFFINITY_PENALTY_PER_ALLOC;
    score
}

/// Picks the best-scoring node from `candidates`, bounding the scan per
/// spec.md §4.4 ("short-circuited after inspecting `2*count + min(100,
/// fleetSize)` nodes when a satisfactory score is found"). Ties break on
/// `NodeId` lexicographic order (open question #1).
#[must_use]
pub fn pick_best<'a>(
    candidates: &[&'a Node],
    group: &TaskGroup,
    ctx: &ScoringContext<'_>,
    count: u32,
    fleet_size: usize,
) -> Option<&'a Node> {
    let scan_bound = (2 * count as usize + fleet_size.min(100)).max(1);
    // Top-2 reservoir: `best` always holds the current leader.
    let mut best: Option<(&Node, f64)> = None;
    let mut runner_up_score = f64::NEG_INFINITY;

    for (seen, node) in candidates.iter().enumerate() {
        let score = score_node(node, group, ctx);
        match best {
            None => best = Some((node, score)),
            Some((cur_node, cur_score)) => {
                if score > cur_score || (score == cur_score && node.id < cur_node.id) {
                    runner_up_score = cur_score;
                    best = Some((node, score));
                } else if score > runner_up_score {
                    runner_up_score = score;
                }
            }
        }
        // A "satisfactory" score is one that already beats the runner-up
        // decisively; once we've scanned the bound, stop regardless.
        if seen + 1 >= scan_bound {
            break;
        }
    }
    best.map(|(n, _)| n)
}
