use crate::error::{DbError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{instrument, trace};

pub type TxnId = u64;

/// A lockable resource: either a page or a whole collection (used for
/// schema-level operations like index creation/drop).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    Page(u32),
    Collection(String),
}

/// Hierarchical 2PL lock modes with the standard intent-lock compatibility
/// matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
    IntentShared,
    IntentExclusive,
    Update,
}

impl LockMode {
    pub fn is_compatible(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (IntentShared, IntentShared) => true,
            (IntentShared, IntentExclusive) => true,
            (IntentShared, Shared) => true,
            (IntentShared, Update) => true,
            (IntentShared, Exclusive) => false,

            (IntentExclusive, IntentShared) => true,
            (IntentExclusive, IntentExclusive) => true,
            (IntentExclusive, _) => false,

            (Shared, IntentShared) => true,
            (Shared, Shared) => true,
            (Shared, _) => false,

            (Update, IntentShared) => true,
            (Update, _) => false,

            (Exclusive, _) => false,
        }
    }
}

struct Grant {
    txn_id: TxnId,
    mode: LockMode,
}

struct ResourceState {
    grants: Vec<Grant>,
    waiters: Vec<TxnId>,
}

impl ResourceState {
    fn new() -> Self {
        Self { grants: Vec::new(), waiters: Vec::new() }
    }

    fn can_grant(&self, mode: LockMode, requester: TxnId) -> bool {
        self.grants
            .iter()
            .filter(|g| g.txn_id != requester)
            .all(|g| g.mode.is_compatible(mode) && mode.is_compatible(g.mode))
    }
}

pub struct LockHandle {
    pub resource: Resource,
    pub mode: LockMode,
    pub txn_id: TxnId,
}

struct Shared {
    table: HashMap<Resource, ResourceState>,
    /// Waits-for edges: txn -> set of txns it is blocked behind. Used by the
    /// deadlock detector.
    waits_for: HashMap<TxnId, HashSet<TxnId>>,
    aborted: HashSet<TxnId>,
}

/// Page/collection lock manager implementing hierarchical two-phase
/// locking. `acquire` blocks the calling thread (via a condvar) until the
/// lock is granted, the timeout elapses, or the manager marks the waiting
/// transaction a deadlock victim.
pub struct LockManager {
    state: Mutex<Shared>,
    condvar: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Shared {
                table: HashMap::new(),
                waits_for: HashMap::new(),
                aborted: HashSet::new(),
            }),
            condvar: Condvar::new(),
        }
    }

    #[instrument(skip(self))]
    pub fn acquire(&self, resource: Resource, mode: LockMode, txn_id: TxnId, timeout: Duration) -> Result<LockHandle> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock();
        loop {
            if guard.aborted.remove(&txn_id) {
                return Err(DbError::DeadlockAborted(txn_id));
            }
            let state = guard.table.entry(resource.clone()).or_insert_with(ResourceState::new);
            if let Some(existing) = state.grants.iter_mut().find(|g| g.txn_id == txn_id) {
                if existing.mode == mode || mode.is_compatible(existing.mode) {
                    existing.mode = upgrade(existing.mode, mode);
                    trace!(?resource, ?mode, txn_id, "lock already held, upgraded in place");
                    return Ok(LockHandle { resource, mode, txn_id });
                }
            }
            if state.can_grant(mode, txn_id) {
                state.grants.push(Grant { txn_id, mode });
                guard.waits_for.remove(&txn_id);
                return Ok(LockHandle { resource, mode, txn_id });
            }
            let blockers: HashSet<TxnId> = state
                .grants
                .iter()
                .filter(|g| g.txn_id != txn_id)
                .map(|g| g.txn_id)
                .collect();
            guard.waits_for.insert(txn_id, blockers);
            if !guard.table.get(&resource).unwrap().waiters.contains(&txn_id) {
                guard.table.get_mut(&resource).unwrap().waiters.push(txn_id);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.cleanup_waiter(&mut guard, &resource, txn_id);
                return Err(DbError::LockTimeout { resource: format!("{resource:?}") });
            }
            let result = self.condvar.wait_for(&mut guard, remaining);
            if result.timed_out() {
                self.cleanup_waiter(&mut guard, &resource, txn_id);
                return Err(DbError::LockTimeout { resource: format!("{resource:?}") });
            }
        }
    }

    fn cleanup_waiter(&self, guard: &mut Shared, resource: &Resource, txn_id: TxnId) {
        guard.waits_for.remove(&txn_id);
        if let Some(state) = guard.table.get_mut(resource) {
            state.waiters.retain(|id| *id != txn_id);
        }
    }

    pub fn release(&self, handle: LockHandle) {
        let mut guard = self.state.lock();
        if let Some(state) = guard.table.get_mut(&handle.resource) {
            state.grants.retain(|g| !(g.txn_id == handle.txn_id && g.mode == handle.mode));
        }
        self.condvar.notify_all();
    }

    #[instrument(skip(self))]
    pub fn release_all(&self, txn_id: TxnId) {
        let mut guard = self.state.lock();
        for state in guard.table.values_mut() {
            state.grants.retain(|g| g.txn_id != txn_id);
            state.waiters.retain(|id| *id != txn_id);
        }
        guard.waits_for.remove(&txn_id);
        for edges in guard.waits_for.values_mut() {
            edges.remove(&txn_id);
        }
        self.condvar.notify_all();
    }

    /// Snapshot of the waits-for graph, for the deadlock detector.
    pub(crate) fn waits_for_snapshot(&self) -> HashMap<TxnId, HashSet<TxnId>> {
        self.state.lock().waits_for.clone()
    }

    /// Marks `txn_id` as a deadlock victim; its next `acquire` call (or the
    /// one it's currently blocked in) returns `DeadlockAborted` and the
    /// waiter is woken immediately.
    pub(crate) fn mark_aborted(&self, txn_id: TxnId) {
        let mut guard = self.state.lock();
        guard.aborted.insert(txn_id);
        self.condvar.notify_all();
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

fn upgrade(current: LockMode, requested: LockMode) -> LockMode {
    use LockMode::*;
    match (current, requested) {
        (_, Exclusive) | (Exclusive, _) => Exclusive,
        (_, Update) | (Update, _) => Update,
        (IntentExclusive, _) | (_, IntentExclusive) => IntentExclusive,
        (Shared, _) | (_, Shared) => Shared,
        _ => IntentShared,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_locks_are_compatible() {
        let lm = LockManager::new();
        let a = lm.acquire(Resource::Page(1), LockMode::Shared, 1, Duration::from_millis(50)).unwrap();
        let b = lm.acquire(Resource::Page(1), LockMode::Shared, 2, Duration::from_millis(50)).unwrap();
        lm.release(a);
        lm.release(b);
    }

    #[test]
    fn exclusive_blocks_until_timeout() {
        let lm = LockManager::new();
        let _a = lm.acquire(Resource::Page(1), LockMode::Exclusive, 1, Duration::from_millis(50)).unwrap();
        let result = lm.acquire(Resource::Page(1), LockMode::Shared, 2, Duration::from_millis(20));
        assert!(matches!(result, Err(DbError::LockTimeout { .. })));
    }

    #[test]
    fn release_all_wakes_waiters() {
        let lm = std::sync::Arc::new(LockManager::new());
        let a = lm.acquire(Resource::Page(1), LockMode::Exclusive, 1, Duration::from_secs(5)).unwrap();
        let lm2 = lm.clone();
        let handle = std::thread::spawn(move || {
            lm2.acquire(Resource::Page(1), LockMode::Exclusive, 2, Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(20));
        lm.release(a);
        lm.release_all(1);
        let acquired = handle.join().unwrap();
        assert!(acquired.is_ok());
    }
}
