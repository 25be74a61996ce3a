//! Connection Table
//!
//! Per-pool sets of live client handles. Each pool owns one mutex; every
//! mutation of that pool's set (register, remove, drain, seal) happens under
//! it, so an eviction that snapshots-and-removes can never race a concurrent
//! connect. Operations on different pools never share a lock.
//!
//! A pool's set is *sealed* once its destroy has been committed: from then on
//! registrations are refused, which closes the window between "the table is
//! empty" and "the pool is gone".

use super::events::PoolEvent;
use super::pool_registry::PoolRecord;
use crate::domain::{ClientIdentity, HandleId, Permission, PoolUuid};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

// =============================================================================
// Connection Handle
// =============================================================================

/// One client's live membership in a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHandle {
    pub id: HandleId,
    pub pool: PoolUuid,
    pub client: ClientIdentity,
    pub permission: Permission,
    pub connected_at: DateTime<Utc>,
}

// =============================================================================
// Per-Pool Set
// =============================================================================

/// Handles of one pool in connection order
#[derive(Debug, Default)]
struct PoolConnections {
    handles: IndexMap<HandleId, ConnectionHandle>,
    sealed: bool,
}

type PoolSlot = Arc<Mutex<PoolConnections>>;

// =============================================================================
// Table Statistics
// =============================================================================

#[derive(Debug, Default)]
struct TableStats {
    live_handles: AtomicU64,
    registered: AtomicU64,
    removed: AtomicU64,
}

/// Snapshot of table statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableStatsSnapshot {
    pub open_pools: usize,
    pub live_handles: u64,
    pub registered: u64,
    pub removed: u64,
}

// =============================================================================
// Connection Table
// =============================================================================

/// Table of connected handles, one mutual-exclusion domain per pool
pub struct ConnectionTable {
    pools: DashMap<PoolUuid, PoolSlot>,
    /// Reverse index so a bare handle id can be resolved to its pool
    owners: DashMap<HandleId, PoolUuid>,
    stats: TableStats,
    event_sender: broadcast::Sender<PoolEvent>,
}

impl ConnectionTable {
    pub fn new(event_sender: broadcast::Sender<PoolEvent>) -> Arc<Self> {
        Arc::new(Self {
            pools: DashMap::new(),
            owners: DashMap::new(),
            stats: TableStats::default(),
            event_sender,
        })
    }

    /// Clone the pool's slot out of the map so no map guard is held while
    /// the pool mutex is taken.
    fn slot(&self, pool: &PoolUuid) -> Result<PoolSlot> {
        self.pools
            .get(pool)
            .map(|slot| slot.value().clone())
            .ok_or_else(|| Error::pool_not_found(pool))
    }

    /// Drop `removed` from the reverse index and the counters. Callers hold
    /// the pool's mutex so a handle is never subtracted before it was added.
    fn forget(&self, removed: &[ConnectionHandle]) {
        for handle in removed {
            self.owners.remove(&handle.id);
        }
        let n = removed.len() as u64;
        self.stats.live_handles.fetch_sub(n, Ordering::Relaxed);
        self.stats.removed.fetch_add(n, Ordering::Relaxed);
    }

    /// Start tracking a pool that just became Active
    pub fn open_pool(&self, pool: PoolUuid) {
        self.pools.entry(pool).or_default();
    }

    /// Stop tracking a destroyed pool
    pub fn close_pool(&self, pool: PoolUuid) {
        if let Some((_, slot)) = self.pools.remove(&pool) {
            let mut conns = slot.lock();
            let leftover: Vec<ConnectionHandle> = conns.handles.drain(..).map(|(_, h)| h).collect();
            self.forget(&leftover);
        }
    }

    /// Admit a client to `pool` after checking its access policy
    pub fn register(
        &self,
        pool: &PoolRecord,
        client: ClientIdentity,
        requested: Permission,
    ) -> Result<ConnectionHandle> {
        let permission = pool.access_policy().authorize(&client, requested)?;
        let slot = self.slot(&pool.uuid)?;

        let handle = ConnectionHandle {
            id: HandleId::new_v4(),
            pool: pool.uuid,
            client,
            permission,
            connected_at: Utc::now(),
        };

        {
            let mut conns = slot.lock();
            if conns.sealed {
                debug!(pool = %pool.uuid, "refusing connect to sealed pool");
                return Err(Error::pool_not_found(pool.uuid));
            }
            conns.handles.insert(handle.id, handle.clone());
            self.owners.insert(handle.id, pool.uuid);
            self.stats.live_handles.fetch_add(1, Ordering::Relaxed);
            self.stats.registered.fetch_add(1, Ordering::Relaxed);
        }

        let _ = self.event_sender.send(PoolEvent::HandleConnected {
            pool: handle.pool,
            handle: handle.id,
            client: handle.client.clone(),
            permission,
        });

        Ok(handle)
    }

    /// Remove a handle. Removing an absent handle is a successful no-op.
    pub fn remove(&self, handle: HandleId) -> Option<ConnectionHandle> {
        let pool = *self.owners.get(&handle)?;
        let slot = self.slot(&pool).ok()?;
        let removed = {
            let mut conns = slot.lock();
            let removed = conns.handles.shift_remove(&handle)?;
            self.forget(std::slice::from_ref(&removed));
            removed
        };

        let _ = self.event_sender.send(PoolEvent::HandleDisconnected {
            pool,
            handle: removed.id,
        });
        Some(removed)
    }

    /// Atomically select and remove every handle of `pool` matching `pred`
    pub fn drain_matching<F>(&self, pool: PoolUuid, pred: F) -> Result<Vec<ConnectionHandle>>
    where
        F: Fn(&ConnectionHandle) -> bool,
    {
        let slot = self.slot(&pool)?;
        let drained: Vec<ConnectionHandle> = {
            let mut conns = slot.lock();
            let targets: Vec<HandleId> = conns
                .handles
                .values()
                .filter(|h| pred(h))
                .map(|h| h.id)
                .collect();
            let drained: Vec<ConnectionHandle> = targets
                .iter()
                .filter_map(|id| conns.handles.shift_remove(id))
                .collect();
            self.forget(&drained);
            drained
        };
        Ok(drained)
    }

    /// Refuse further registrations on `pool`.
    ///
    /// Without `force` the pool must be empty (`PoolNotEmpty` otherwise and
    /// nothing changes). With `force` any handles still present are removed
    /// and returned so the caller can notify their owners.
    pub fn seal(&self, pool: PoolUuid, force: bool) -> Result<Vec<ConnectionHandle>> {
        let slot = self.slot(&pool)?;
        let drained: Vec<ConnectionHandle> = {
            let mut conns = slot.lock();
            if !force && !conns.handles.is_empty() {
                return Err(Error::PoolNotEmpty {
                    pool: pool.to_string(),
                    handles: conns.handles.len(),
                });
            }
            conns.sealed = true;
            let drained: Vec<ConnectionHandle> = conns.handles.drain(..).map(|(_, h)| h).collect();
            self.forget(&drained);
            drained
        };
        Ok(drained)
    }

    /// Re-admit registrations after an aborted destroy
    pub fn unseal(&self, pool: PoolUuid) -> Result<()> {
        self.slot(&pool)?.lock().sealed = false;
        Ok(())
    }

    /// Snapshot of the handles currently connected to `pool`
    pub fn all_for(&self, pool: PoolUuid) -> Result<Vec<ConnectionHandle>> {
        let slot = self.slot(&pool)?;
        let conns = slot.lock();
        Ok(conns.handles.values().cloned().collect())
    }

    /// Number of handles on `pool` (zero for an untracked pool)
    pub fn count(&self, pool: PoolUuid) -> usize {
        self.slot(&pool)
            .map(|slot| slot.lock().handles.len())
            .unwrap_or(0)
    }

    pub fn get(&self, handle: HandleId) -> Option<ConnectionHandle> {
        let pool = *self.owners.get(&handle)?;
        let slot = self.slot(&pool).ok()?;
        let conns = slot.lock();
        conns.handles.get(&handle).cloned()
    }

    pub fn contains(&self, handle: HandleId) -> bool {
        self.get(handle).is_some()
    }

    pub fn stats(&self) -> TableStatsSnapshot {
        TableStatsSnapshot {
            open_pools: self.pools.len(),
            live_handles: self.stats.live_handles.load(Ordering::Relaxed),
            registered: self.stats.registered.load(Ordering::Relaxed),
            removed: self.stats.removed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PoolMode, ServerGroup};
    use crate::membership::pool_registry::{PoolRegistry, PoolSpec};
    use assert_matches::assert_matches;

    fn setup() -> (Arc<PoolRegistry>, Arc<ConnectionTable>, PoolRecord) {
        let (tx, _) = broadcast::channel(64);
        let registry = PoolRegistry::with_events(tx.clone());
        let table = ConnectionTable::new(tx);
        let record = registry
            .create(PoolSpec {
                owner: ClientIdentity::new(1000, 1000),
                mode: PoolMode::new(0o731).unwrap(),
                size_bytes: 1 << 30,
                server_group: ServerGroup::new("daos_server").unwrap(),
            })
            .unwrap();
        let record = registry.activate(record.uuid).unwrap();
        table.open_pool(record.uuid);
        (registry, table, record)
    }

    fn owner() -> ClientIdentity {
        ClientIdentity::new(1000, 1000)
    }

    #[test]
    fn test_register_and_all_for() {
        let (_, table, pool) = setup();
        let a = table.register(&pool, owner(), Permission::ReadOnly).unwrap();
        let b = table.register(&pool, owner(), Permission::ReadWrite).unwrap();

        let all = table.all_for(pool.uuid).unwrap();
        assert_eq!(all.iter().map(|h| h.id).collect::<Vec<_>>(), vec![a.id, b.id]);
        assert_eq!(a.permission, Permission::ReadOnly);
        assert_eq!(table.count(pool.uuid), 2);
        assert_eq!(table.stats().live_handles, 2);
    }

    #[test]
    fn test_register_access_denied() {
        let (_, table, pool) = setup();
        let stranger = ClientIdentity::new(4242, 4242);
        assert_matches!(
            table.register(&pool, stranger, Permission::ReadOnly),
            Err(Error::AccessDenied { .. })
        );
        assert_eq!(table.count(pool.uuid), 0);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (_, table, pool) = setup();
        let h = table.register(&pool, owner(), Permission::ReadOnly).unwrap();

        assert!(table.remove(h.id).is_some());
        assert!(table.remove(h.id).is_none());
        assert!(table.remove(HandleId::new_v4()).is_none());
        assert_eq!(table.count(pool.uuid), 0);
        assert_eq!(table.stats().removed, 1);
    }

    #[test]
    fn test_drain_matching_only_takes_matches() {
        let (_, table, pool) = setup();
        let keep = table.register(&pool, owner(), Permission::ReadOnly).unwrap();
        let other = ClientIdentity::new(2000, 1000);
        let gone = table.register(&pool, other.clone(), Permission::ReadWrite).unwrap();

        let drained = table
            .drain_matching(pool.uuid, |h| h.client == other)
            .unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id, gone.id);
        assert!(table.contains(keep.id));
        assert!(!table.contains(gone.id));
    }

    #[test]
    fn test_seal_without_force_requires_empty() {
        let (_, table, pool) = setup();
        table.register(&pool, owner(), Permission::ReadOnly).unwrap();

        assert_matches!(
            table.seal(pool.uuid, false),
            Err(Error::PoolNotEmpty { handles: 1, .. })
        );
        // failed seal leaves the pool open
        assert!(table.register(&pool, owner(), Permission::ReadOnly).is_ok());

        let drained = table.seal(pool.uuid, true).unwrap();
        assert_eq!(drained.len(), 2);
        assert_matches!(
            table.register(&pool, owner(), Permission::ReadOnly),
            Err(Error::PoolNotFound { .. })
        );

        table.unseal(pool.uuid).unwrap();
        assert!(table.register(&pool, owner(), Permission::ReadOnly).is_ok());
    }

    #[test]
    fn test_close_pool_forgets_handles() {
        let (_, table, pool) = setup();
        let h = table.register(&pool, owner(), Permission::ReadOnly).unwrap();
        table.close_pool(pool.uuid);

        assert!(!table.contains(h.id));
        assert_matches!(table.all_for(pool.uuid), Err(Error::PoolNotFound { .. }));
        assert_eq!(table.stats().live_handles, 0);
    }

    #[test]
    fn test_concurrent_register_and_drain() {
        let (_, table, pool) = setup();
        let pool = Arc::new(pool);

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                let pool = pool.clone();
                std::thread::spawn(move || {
                    (0..200)
                        .map(|_| table.register(&pool, owner(), Permission::ReadOnly).unwrap().id)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut drained = Vec::new();
        for _ in 0..50 {
            drained.extend(table.drain_matching(pool.uuid, |_| true).unwrap());
        }

        let registered: Vec<HandleId> = writers.into_iter().flat_map(|w| w.join().unwrap()).collect();
        drained.extend(table.drain_matching(pool.uuid, |_| true).unwrap());

        // every handle was removed exactly once and none survived
        assert_eq!(drained.len(), registered.len());
        assert_eq!(table.count(pool.uuid), 0);
        assert_eq!(table.stats().live_handles, 0);
    }

    #[test]
    fn test_live_handle_count_never_wraps_under_contention() {
        let (_, table, pool) = setup();
        let pool = Arc::new(pool);
        let total = 4 * 500;

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        table.register(&pool, owner(), Permission::ReadOnly).unwrap();
                    }
                })
            })
            .collect();

        let drainer = {
            let table = table.clone();
            let pool = pool.clone();
            std::thread::spawn(move || {
                let mut drained = 0;
                while drained < total {
                    drained += table.drain_matching(pool.uuid, |_| true).unwrap().len();
                    assert!(table.stats().live_handles <= total as u64);
                }
            })
        };

        for _ in 0..2_000 {
            let live = table.stats().live_handles;
            assert!(live <= total as u64, "live handle count wrapped: {}", live);
        }

        for w in writers {
            w.join().unwrap();
        }
        drainer.join().unwrap();
        assert_eq!(table.stats().live_handles, 0);
        assert_eq!(table.stats().removed, total as u64);
    }
}
