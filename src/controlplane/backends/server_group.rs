//! In-memory Server Group Adapter
//!
//! Tracks a fixed set of server groups and the pools allocated on each.
//! Groups can be marked unreachable and calls can be slowed down, which is
//! how the service's unreachable and timeout paths are exercised.

use crate::domain::ports::ServerGroupService;
use crate::domain::{PoolUuid, ServerGroup};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

// =============================================================================
// Group State
// =============================================================================

/// Internal tracking of one server group
#[derive(Debug, Clone, Default)]
struct GroupState {
    reachable: bool,
    /// Allocated pools and their size in bytes
    allocations: BTreeMap<PoolUuid, u64>,
}

// =============================================================================
// Static Server Groups
// =============================================================================

/// Server groups known from configuration
pub struct StaticServerGroups {
    groups: RwLock<HashMap<String, GroupState>>,
    latency: Option<Duration>,
}

impl StaticServerGroups {
    /// Create an adapter where every named group is reachable
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let groups = names
            .into_iter()
            .map(|name| {
                (
                    name.into(),
                    GroupState {
                        reachable: true,
                        ..Default::default()
                    },
                )
            })
            .collect();

        Self {
            groups: RwLock::new(groups),
            latency: None,
        }
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Flip a group's reachability
    pub async fn set_reachable(&self, name: &str, reachable: bool) {
        if let Some(state) = self.groups.write().await.get_mut(name) {
            info!(group = name, reachable, "server group reachability changed");
            state.reachable = reachable;
        }
    }

    /// Number of pools allocated on a group
    pub async fn allocation_count(&self, name: &str) -> usize {
        self.groups
            .read()
            .await
            .get(name)
            .map(|s| s.allocations.len())
            .unwrap_or(0)
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn unreachable(group: &ServerGroup) -> Error {
        Error::ServerGroupUnreachable {
            group: group.to_string(),
        }
    }
}

#[async_trait]
impl ServerGroupService for StaticServerGroups {
    async fn probe(&self, group: &ServerGroup) -> Result<()> {
        self.delay().await;
        match self.groups.read().await.get(group.as_str()) {
            Some(state) if state.reachable => Ok(()),
            _ => Err(Self::unreachable(group)),
        }
    }

    async fn allocate(&self, group: &ServerGroup, pool: PoolUuid, size_bytes: u64) -> Result<()> {
        self.delay().await;
        let mut groups = self.groups.write().await;
        let state = groups
            .get_mut(group.as_str())
            .filter(|s| s.reachable)
            .ok_or_else(|| Self::unreachable(group))?;

        debug!(%group, %pool, size_bytes, "allocating pool storage");
        state.allocations.insert(pool, size_bytes);
        Ok(())
    }

    async fn release(&self, group: &ServerGroup, pool: PoolUuid) -> Result<()> {
        self.delay().await;
        let mut groups = self.groups.write().await;
        let state = groups
            .get_mut(group.as_str())
            .filter(|s| s.reachable)
            .ok_or_else(|| Self::unreachable(group))?;

        if state.allocations.remove(&pool).is_none() {
            debug!(%group, %pool, "release of unallocated pool ignored");
        }
        Ok(())
    }
}
