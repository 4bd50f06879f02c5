//! Target placement across collector pods with bounded-load rendezvous
//! hashing: every target lands on its highest-scoring pod that still has
//! room, so scaling the pool up or down moves only the minimum share of
//! targets while keeping pod loads within one target of each other.

use std::collections::BTreeMap;

use crate::plan::{fnv32a, ApplyPlan};

/// Per-pod view of a plan: the pod's target share plus the full wiring
/// graph (subscriptions, outputs, inputs, processors, tunnel matches),
/// which every pod needs in its entirety.
pub fn distribute(plan: &ApplyPlan, pod_index: i32, num_pods: i32) -> ApplyPlan {
    let num_pods = if num_pods <= 0 { 1 } else { num_pods as usize };
    let pod_index = if (0..num_pods).contains(&(pod_index as usize)) {
        pod_index as usize
    } else {
        0
    };

    let names: Vec<&str> = plan.targets.keys().map(String::as_str).collect();
    let assignment = assign(&names, num_pods);

    let mut out = plan.clone();
    out.targets = plan
        .targets
        .iter()
        .filter(|(name, _)| assignment.get(name.as_str()) == Some(&pod_index))
        .map(|(name, cfg)| (name.clone(), cfg.clone()))
        .collect();
    out
}

/// Deterministic assignment of every target name to a pod in
/// `[0, num_pods)`. Load is bounded in two tiers: a pod is preferred while
/// it is below `⌊N/P⌋`, and may only exceed that up to `⌈N/P⌉` once every
/// pod has reached the floor. That keeps any two pod loads within one of
/// each other while preserving rendezvous placement for the bulk of the
/// set.
pub fn assign(names: &[&str], num_pods: usize) -> BTreeMap<String, usize> {
    let num_pods = num_pods.max(1);
    let mut names: Vec<&str> = names.to_vec();
    names.sort_unstable();
    names.dedup();

    let floor = names.len() / num_pods;
    let mut load = vec![0usize; num_pods];
    let mut assignment = BTreeMap::new();

    for name in names {
        let mut pods: Vec<usize> = (0..num_pods).collect();
        pods.sort_by_key(|p| (std::cmp::Reverse(score(name, *p)), *p));

        let chosen = pods
            .iter()
            .copied()
            .find(|p| load[*p] < floor)
            .or_else(|| pods.iter().copied().find(|p| load[*p] < floor + 1))
            .unwrap_or(pods[0]);

        load[chosen] += 1;
        assignment.insert(name.to_string(), chosen);
    }
    assignment
}

fn score(name: &str, pod: usize) -> u32 {
    fnv32a(&format!("{name}:{pod}"))
}
