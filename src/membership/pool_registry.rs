//! Sharded Pool Registry
//!
//! Maps pool UUIDs to pool metadata and lifecycle state. Records are spread
//! over a fixed number of `RwLock`-protected shards so lookups on unrelated
//! pools never contend.
//!
//! Destroyed pools stay behind as tombstones until [`PoolRegistry::collect_garbage`]
//! runs. A tombstone is invisible to every lookup but keeps its UUID reserved.

use super::access::AccessPolicy;
use super::events::PoolEvent;
use crate::domain::{ClientIdentity, PoolMode, PoolState, PoolUuid, ServerGroup};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

// =============================================================================
// Constants
// =============================================================================

/// Number of shards in the registry
pub const REGISTRY_SHARD_COUNT: usize = 64;

/// Default capacity of the event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

// =============================================================================
// Pool Spec & Record
// =============================================================================

/// Parameters of a pool to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSpec {
    pub owner: ClientIdentity,
    pub mode: PoolMode,
    pub size_bytes: u64,
    pub server_group: ServerGroup,
}

impl PoolSpec {
    pub fn validate(&self) -> Result<()> {
        self.owner.validate()?;
        if self.size_bytes == 0 {
            return Err(Error::InvalidParameter("pool size must be positive".into()));
        }
        Ok(())
    }
}

/// Registry entry for one pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRecord {
    pub uuid: PoolUuid,
    pub server_group: ServerGroup,
    pub owner_uid: u32,
    pub owner_gid: u32,
    pub mode: PoolMode,
    pub size_bytes: u64,
    pub state: PoolState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PoolRecord {
    fn new(uuid: PoolUuid, spec: PoolSpec) -> Self {
        let now = Utc::now();
        Self {
            uuid,
            server_group: spec.server_group,
            owner_uid: spec.owner.uid,
            owner_gid: spec.owner.gid,
            mode: spec.mode,
            size_bytes: spec.size_bytes,
            state: PoolState::Creating,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn access_policy(&self) -> AccessPolicy {
        AccessPolicy {
            pool: self.uuid,
            owner_uid: self.owner_uid,
            owner_gid: self.owner_gid,
            mode: self.mode,
        }
    }

    /// Reject anything but Active with `PoolNotFound`
    pub fn ensure_active(&self) -> Result<()> {
        if self.state != PoolState::Active {
            debug!(pool = %self.uuid, state = %self.state, "pool is not accepting operations");
            return Err(Error::pool_not_found(self.uuid));
        }
        Ok(())
    }

    fn transition(&mut self, next: PoolState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "pool {} cannot move from {} to {}",
                self.uuid, self.state, next
            )));
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

// =============================================================================
// Registry Shard
// =============================================================================

/// A single shard of the registry
struct RegistryShard {
    pools: RwLock<HashMap<PoolUuid, PoolRecord>>,
}

impl RegistryShard {
    fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Insert unless the UUID is already taken (live or tombstone)
    fn insert(&self, record: PoolRecord) -> bool {
        let mut pools = self.pools.write();
        if pools.contains_key(&record.uuid) {
            return false;
        }
        pools.insert(record.uuid, record);
        true
    }

    fn get(&self, uuid: &PoolUuid) -> Option<PoolRecord> {
        self.pools.read().get(uuid).cloned()
    }

    /// Apply a state change under the shard write lock
    fn update<F>(&self, uuid: &PoolUuid, f: F) -> Result<PoolRecord>
    where
        F: FnOnce(&mut PoolRecord) -> Result<()>,
    {
        let mut pools = self.pools.write();
        match pools.get_mut(uuid) {
            Some(record) if record.state != PoolState::Destroyed => {
                f(record)?;
                Ok(record.clone())
            }
            _ => Err(Error::pool_not_found(uuid)),
        }
    }

    fn remove_if<F>(&self, uuid: &PoolUuid, pred: F) -> Option<PoolRecord>
    where
        F: FnOnce(&PoolRecord) -> bool,
    {
        let mut pools = self.pools.write();
        if pools.get(uuid).map(pred).unwrap_or(false) {
            pools.remove(uuid)
        } else {
            None
        }
    }

    fn records(&self) -> Vec<PoolRecord> {
        self.pools.read().values().cloned().collect()
    }

    fn collect_tombstones(&self) -> usize {
        let mut pools = self.pools.write();
        let before = pools.len();
        pools.retain(|_, record| record.state != PoolState::Destroyed);
        before - pools.len()
    }
}

// =============================================================================
// Registry Statistics
// =============================================================================

#[derive(Debug, Default)]
struct RegistryStats {
    live_pools: AtomicU64,
    tombstones: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
}

/// Snapshot of registry statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStatsSnapshot {
    pub live_pools: u64,
    pub tombstones: u64,
    pub created: u64,
    pub destroyed: u64,
}

// =============================================================================
// Pool Registry
// =============================================================================

/// Sharded registry of pools
pub struct PoolRegistry {
    shards: Vec<RegistryShard>,
    stats: RegistryStats,
    event_sender: broadcast::Sender<PoolEvent>,
}

impl PoolRegistry {
    /// Create a registry with its own event channel
    pub fn new() -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self::with_events(event_sender)
    }

    /// Create a registry publishing on an existing event channel
    pub fn with_events(event_sender: broadcast::Sender<PoolEvent>) -> Arc<Self> {
        Arc::new(Self {
            shards: (0..REGISTRY_SHARD_COUNT).map(|_| RegistryShard::new()).collect(),
            stats: RegistryStats::default(),
            event_sender,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.event_sender.subscribe()
    }

    #[inline]
    fn shard(&self, uuid: &PoolUuid) -> &RegistryShard {
        &self.shards[uuid.shard_index(REGISTRY_SHARD_COUNT)]
    }

    /// Insert a new pool in the Creating state under a fresh UUID
    pub fn create(&self, spec: PoolSpec) -> Result<PoolRecord> {
        spec.validate()?;
        let size_bytes = spec.size_bytes;
        let server_group = spec.server_group.to_string();

        let record = loop {
            let record = PoolRecord::new(PoolUuid::new_v4(), spec.clone());
            if self.shard(&record.uuid).insert(record.clone()) {
                break record;
            }
        };

        self.stats.live_pools.fetch_add(1, Ordering::Relaxed);
        self.stats.created.fetch_add(1, Ordering::Relaxed);

        let _ = self.event_sender.send(PoolEvent::PoolCreated {
            pool: record.uuid,
            server_group,
            size_bytes,
        });

        Ok(record)
    }

    /// Creating -> Active
    pub fn activate(&self, uuid: PoolUuid) -> Result<PoolRecord> {
        let record = self
            .shard(&uuid)
            .update(&uuid, |r| r.transition(PoolState::Active))?;
        let _ = self.event_sender.send(PoolEvent::PoolActivated { pool: uuid });
        Ok(record)
    }

    /// Drop a record whose server-side allocation failed
    pub fn abort_create(&self, uuid: PoolUuid) -> bool {
        let removed = self
            .shard(&uuid)
            .remove_if(&uuid, |r| r.state == PoolState::Creating)
            .is_some();
        if removed {
            self.stats.live_pools.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Find a reachable pool and check it belongs to `group`.
    ///
    /// An unknown, still-creating or destroyed UUID is `PoolNotFound` whatever
    /// the group; only a visible pool can produce `ServerGroupMismatch`.
    pub fn lookup(&self, uuid: PoolUuid, group: &ServerGroup) -> Result<PoolRecord> {
        let record = self
            .shard(&uuid)
            .get(&uuid)
            .filter(|r| matches!(r.state, PoolState::Active | PoolState::Destroying))
            .ok_or_else(|| Error::pool_not_found(uuid))?;

        if &record.server_group != group {
            return Err(Error::ServerGroupMismatch {
                pool: uuid.to_string(),
                requested: group.to_string(),
                actual: record.server_group.to_string(),
            });
        }

        Ok(record)
    }

    /// Active -> Destroying. Only one caller can win this transition.
    pub fn mark_destroying(&self, uuid: PoolUuid) -> Result<PoolRecord> {
        let record = self.shard(&uuid).update(&uuid, |r| {
            if r.state != PoolState::Active {
                return Err(Error::pool_not_found(uuid));
            }
            r.transition(PoolState::Destroying)
        })?;
        let _ = self.event_sender.send(PoolEvent::PoolDestroying { pool: uuid });
        Ok(record)
    }

    /// Destroying -> Active after a failed destroy
    pub fn revert_destroying(&self, uuid: PoolUuid) -> Result<PoolRecord> {
        self.shard(&uuid).update(&uuid, |r| {
            if r.state != PoolState::Destroying {
                return Err(Error::pool_not_found(uuid));
            }
            r.transition(PoolState::Active)
        })
    }

    /// Destroying -> Destroyed (tombstone).
    ///
    /// `live_handles` is the pool's connection count at the time of the call;
    /// anything but zero is refused unless `force` is set.
    pub fn remove(&self, uuid: PoolUuid, live_handles: usize, force: bool) -> Result<()> {
        if live_handles > 0 && !force {
            return Err(Error::PoolNotEmpty {
                pool: uuid.to_string(),
                handles: live_handles,
            });
        }

        self.shard(&uuid)
            .update(&uuid, |r| r.transition(PoolState::Destroyed))?;

        self.stats.live_pools.fetch_sub(1, Ordering::Relaxed);
        self.stats.tombstones.fetch_add(1, Ordering::Relaxed);
        self.stats.destroyed.fetch_add(1, Ordering::Relaxed);

        let _ = self.event_sender.send(PoolEvent::PoolDestroyed { pool: uuid });
        Ok(())
    }

    /// Active pools of one server group
    pub fn list(&self, group: &ServerGroup) -> Vec<PoolRecord> {
        let mut pools: Vec<PoolRecord> = self
            .shards
            .iter()
            .flat_map(|shard| shard.records())
            .filter(|r| r.state == PoolState::Active && &r.server_group == group)
            .collect();
        pools.sort_by_key(|r| r.created_at);
        pools
    }

    /// Remove every tombstone
    pub fn collect_garbage(&self) -> usize {
        let collected: usize = self.shards.iter().map(|s| s.collect_tombstones()).sum();
        if collected > 0 {
            self.stats
                .tombstones
                .fetch_sub(collected as u64, Ordering::Relaxed);
            let _ = self
                .event_sender
                .send(PoolEvent::PoolsCollected { count: collected });
        }
        collected
    }

    pub fn stats(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            live_pools: self.stats.live_pools.load(Ordering::Relaxed),
            tombstones: self.stats.tombstones.load(Ordering::Relaxed),
            created: self.stats.created.load(Ordering::Relaxed),
            destroyed: self.stats.destroyed.load(Ordering::Relaxed),
        }
    }
}
