//! Per-key reader/writer locks and per-replica gates
//!
//! One lock per key, created on first use. Writers (2PC transactions) take it
//! exclusively, readers share it. Entries nobody holds are pruned as the table
//! grows.
//!
//! A replica holds at most one undecided operation, so the coordinator also
//! admits one transaction per replica at a time. Gates are always taken in
//! ascending node id order after the key lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{
    Mutex as AsyncMutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock,
};

/// Table size that triggers a sweep of idle locks.
const PRUNE_THRESHOLD: usize = 4096;

#[derive(Default)]
pub struct KeyLocks {
    table: Mutex<HashMap<Vec<u8>, Arc<RwLock<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &[u8]) -> Arc<RwLock<()>> {
        let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
        if table.len() >= PRUNE_THRESHOLD && !table.contains_key(key) {
            // Only the table holds a reference to an idle lock.
            table.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        table
            .entry(key.to_vec())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Exclusive access to `key` for the duration of a transaction.
    pub async fn write(&self, key: &[u8]) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(key).write_owned().await
    }

    /// Shared access to `key` for a read.
    pub async fn read(&self, key: &[u8]) -> OwnedRwLockReadGuard<()> {
        self.lock_for(key).read_owned().await
    }

    pub fn len(&self) -> usize {
        self.table.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One async gate per replica node id.
#[derive(Default)]
pub struct ReplicaGates {
    table: Mutex<HashMap<u64, Arc<AsyncMutex<()>>>>,
}

/// Gates held for one transaction, released on drop.
pub struct GateGuards(Vec<OwnedMutexGuard<()>>);

impl GateGuards {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl ReplicaGates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the gates of `nodes` in ascending id order. Duplicates are taken once.
    pub async fn acquire(&self, nodes: &[u64]) -> GateGuards {
        let mut ids = nodes.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let gates: Vec<Arc<AsyncMutex<()>>> = {
            let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
            ids.iter()
                .map(|id| table.entry(*id).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(gates.len());
        for gate in gates {
            guards.push(gate.lock_owned().await);
        }
        GateGuards(guards)
    }
}
