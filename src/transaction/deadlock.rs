use super::lock_manager::{LockManager, TxnId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{info, instrument};

/// How to pick which transaction in a detected cycle gets aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VictimSelectionPolicy {
    #[default]
    Youngest,
    Oldest,
}

/// Walks the lock manager's waits-for graph looking for cycles, and aborts
/// one transaction per cycle found.
///
/// Detection is rate-limited under normal operation (`detect`) since a full
/// graph walk on every lock wait would be wasteful contention; callers that
/// need an immediate, unconditional pass (e.g. right before a timeout would
/// otherwise fire) use `force_detect`.
pub struct DeadlockDetector {
    policy: VictimSelectionPolicy,
    min_interval: Duration,
    last_run: Mutex<Instant>,
}

impl DeadlockDetector {
    pub fn new(policy: VictimSelectionPolicy, min_interval: Duration) -> Self {
        Self { policy, min_interval, last_run: Mutex::new(Instant::now() - min_interval) }
    }

    pub fn detect(&self, lock_manager: &LockManager, start_times: &HashMap<TxnId, Instant>) -> Option<TxnId> {
        let mut last_run = self.last_run.lock();
        if last_run.elapsed() < self.min_interval {
            return None;
        }
        *last_run = Instant::now();
        drop(last_run);
        self.force_detect(lock_manager, start_times)
    }

    #[instrument(skip(self, lock_manager, start_times))]
    pub fn force_detect(&self, lock_manager: &LockManager, start_times: &HashMap<TxnId, Instant>) -> Option<TxnId> {
        let graph = lock_manager.waits_for_snapshot();
        let cycle = find_cycle(&graph)?;
        let victim = self.choose_victim(&cycle, start_times);
        info!(victim, cycle_len = cycle.len(), "deadlock detected, aborting victim");
        lock_manager.mark_aborted(victim);
        Some(victim)
    }

    fn choose_victim(&self, cycle: &[TxnId], start_times: &HashMap<TxnId, Instant>) -> TxnId {
        let default_time = Instant::now();
        match self.policy {
            VictimSelectionPolicy::Youngest => *cycle
                .iter()
                .max_by_key(|id| start_times.get(id).copied().unwrap_or(default_time))
                .unwrap(),
            VictimSelectionPolicy::Oldest => *cycle
                .iter()
                .min_by_key(|id| start_times.get(id).copied().unwrap_or(default_time))
                .unwrap(),
        }
    }
}

/// Depth-first search for a cycle in the waits-for graph. Returns the
/// member transaction ids of the first cycle found, if any.
fn find_cycle(graph: &HashMap<TxnId, HashSet<TxnId>>) -> Option<Vec<TxnId>> {
    let mut visited = HashSet::new();
    let mut stack_set = HashSet::new();
    let mut stack = Vec::new();

    for &start in graph.keys() {
        if visited.contains(&start) {
            continue;
        }
        if let Some(cycle) = dfs(start, graph, &mut visited, &mut stack_set, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

fn dfs(
    node: TxnId,
    graph: &HashMap<TxnId, HashSet<TxnId>>,
    visited: &mut HashSet<TxnId>,
    stack_set: &mut HashSet<TxnId>,
    stack: &mut Vec<TxnId>,
) -> Option<Vec<TxnId>> {
    visited.insert(node);
    stack_set.insert(node);
    stack.push(node);

    if let Some(edges) = graph.get(&node) {
        for &next in edges {
            if stack_set.contains(&next) {
                let start = stack.iter().position(|&id| id == next).unwrap();
                return Some(stack[start..].to_vec());
            }
            if !visited.contains(&next) {
                if let Some(cycle) = dfs(next, graph, visited, stack_set, stack) {
                    return Some(cycle);
                }
            }
        }
    }

    stack.pop();
    stack_set.remove(&node);
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_two_cycle() {
        let mut graph = HashMap::new();
        graph.insert(1, HashSet::from([2]));
        graph.insert(2, HashSet::from([1]));
        let cycle = find_cycle(&graph).unwrap();
        assert_eq!(cycle.len(), 2);
    }

    #[test]
    fn no_cycle_in_dag() {
        let mut graph = HashMap::new();
        graph.insert(1, HashSet::from([2]));
        graph.insert(2, HashSet::from([3]));
        assert!(find_cycle(&graph).is_none());
    }

    #[test]
    fn youngest_policy_picks_latest_start() {
        let detector = DeadlockDetector::new(VictimSelectionPolicy::Youngest, Duration::from_millis(0));
        let now = Instant::now();
        let mut times = HashMap::new();
        times.insert(1, now - Duration::from_secs(10));
        times.insert(2, now);
        assert_eq!(detector.choose_victim(&[1, 2], &times), 2);
    }
}
