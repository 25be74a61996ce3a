//! Pool Service
//!
//! Composes the pool registry, connection table and eviction coordinator
//! with a server-group backend:
//! - Pool creation and destruction, including forced destroy
//! - Connect, disconnect and handle validation
//! - Eviction, query and listing
//!
//! Server-group round trips are bounded by the configured RPC timeout. The
//! service never retries; see [`crate::retry`] for the caller-side helper.

use crate::config::ServiceConfig;
use crate::controlplane::backends::{NotifierFactory, StaticServerGroups};
use crate::domain::{
    ClientIdentity, EvictionNotifierRef, HandleId, Permission, PoolMode, PoolState, PoolUuid,
    RevocationReason, ServerGroup, ServerGroupServiceRef,
};
use crate::error::{Error, Result};
use crate::membership::{
    ConnectionHandle, ConnectionTable, EvictionCoordinator, EvictionReport, EvictionRequest,
    EvictionScope, PoolEvent, PoolRecord, PoolRegistry, PoolSpec,
};
use crate::metrics::ServiceMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

// =============================================================================
// Request & Info Types
// =============================================================================

/// Parameters of a create-pool call
#[derive(Debug, Clone)]
pub struct CreatePoolRequest {
    pub owner: ClientIdentity,
    pub mode: PoolMode,
    pub size_bytes: u64,
    pub server_group: ServerGroup,
    /// Opaque pass-through level, recorded in logs only
    pub level: u32,
}

/// Pool metadata as reported to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub uuid: PoolUuid,
    pub server_group: ServerGroup,
    pub owner_uid: u32,
    pub owner_gid: u32,
    pub mode: PoolMode,
    pub size_bytes: u64,
    pub state: PoolState,
    pub handles: usize,
    pub created_at: DateTime<Utc>,
}

impl PoolInfo {
    fn from_record(record: PoolRecord, handles: usize) -> Self {
        Self {
            uuid: record.uuid,
            server_group: record.server_group,
            owner_uid: record.owner_uid,
            owner_gid: record.owner_gid,
            mode: record.mode,
            size_bytes: record.size_bytes,
            state: record.state,
            handles,
            created_at: record.created_at,
        }
    }
}

/// Result of [`PoolService::connect_then_maybe_evict`]
#[derive(Debug)]
pub struct ConnectOutcome {
    pub handle: ConnectionHandle,
    pub eviction: Option<EvictionReport>,
}

/// Service-level counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub live_pools: u64,
    pub tombstones: u64,
    pub live_handles: u64,
    pub server_groups: Vec<String>,
}

// =============================================================================
// Pool Service
// =============================================================================

/// Pool lifecycle manager
pub struct PoolService {
    config: ServiceConfig,
    registry: Arc<PoolRegistry>,
    table: Arc<ConnectionTable>,
    coordinator: Arc<EvictionCoordinator>,
    groups: ServerGroupServiceRef,
    metrics: ServiceMetrics,
    event_sender: broadcast::Sender<PoolEvent>,
}

impl PoolService {
    /// Create a service on explicit backends
    pub fn new(
        config: ServiceConfig,
        groups: ServerGroupServiceRef,
        notifier: EvictionNotifierRef,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let (event_sender, _) = broadcast::channel(config.event_channel_capacity);
        let metrics = ServiceMetrics::new()?;
        let registry = PoolRegistry::with_events(event_sender.clone());
        let table = ConnectionTable::new(event_sender.clone());
        let coordinator = EvictionCoordinator::new(
            registry.clone(),
            table.clone(),
            notifier,
            config.notify_timeout(),
            metrics.clone(),
            event_sender.clone(),
        );

        Ok(Arc::new(Self {
            config,
            registry,
            table,
            coordinator,
            groups,
            metrics,
            event_sender,
        }))
    }

    /// Create a service with the static group table and the configured
    /// revocation transport
    pub fn from_config(config: ServiceConfig) -> Result<Arc<Self>> {
        let groups = Arc::new(StaticServerGroups::new(config.server_groups.clone()));
        let notifier = NotifierFactory::create(&config.notifier, config.notify_timeout())?;
        Self::new(config, groups, notifier)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.event_sender.subscribe()
    }

    /// Bound one server-group round trip by the RPC timeout
    async fn rpc<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let after = self.config.rpc_timeout();
        match tokio::time::timeout(after, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, ?after, "server group call timed out");
                Err(Error::Timeout {
                    operation: operation.to_string(),
                    after,
                })
            }
        }
    }

    /// Check every configured server group answers
    pub async fn probe_groups(&self) -> Result<()> {
        for name in &self.config.server_groups {
            let group = ServerGroup::new(name.as_str())?;
            self.rpc("probe", self.groups.probe(&group)).await?;
            debug!(%group, "server group reachable");
        }
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create a pool and return it once Active
    pub async fn create_pool(&self, request: CreatePoolRequest) -> Result<PoolInfo> {
        let spec = PoolSpec {
            owner: request.owner,
            mode: request.mode,
            size_bytes: request.size_bytes,
            server_group: request.server_group,
        };
        spec.validate()?;

        info!(
            group = %spec.server_group,
            owner = %spec.owner,
            mode = %spec.mode,
            size_bytes = spec.size_bytes,
            level = request.level,
            "Creating pool"
        );

        self.rpc("probe", self.groups.probe(&spec.server_group)).await?;
        let record = self.registry.create(spec)?;

        let allocated = self.rpc(
            "allocate",
            self.groups
                .allocate(&record.server_group, record.uuid, record.size_bytes),
        );
        if let Err(e) = allocated.await {
            warn!(pool = %record.uuid, "allocation failed, dropping pool record: {}", e);
            self.registry.abort_create(record.uuid);
            return Err(e);
        }

        // the connection set exists before the pool becomes visible
        self.table.open_pool(record.uuid);
        let record = match self.registry.activate(record.uuid) {
            Ok(record) => record,
            Err(e) => {
                self.table.close_pool(record.uuid);
                return Err(e);
            }
        };

        self.metrics.pools_created.inc();
        info!(pool = %record.uuid, "Pool created");
        Ok(PoolInfo::from_record(record, 0))
    }

    /// Destroy a pool.
    ///
    /// Without `force` the pool must have no connected handles. With `force`
    /// every handle is evicted first, and anything that connects in between
    /// is dropped when the connection set is sealed.
    pub async fn destroy(&self, uuid: PoolUuid, group: &ServerGroup, force: bool) -> Result<()> {
        let pool = self.registry.lookup(uuid, group)?;
        pool.ensure_active()?;
        info!(pool = %uuid, %group, force, "Destroying pool");

        if force {
            let outcome = self
                .coordinator
                .evict(EvictionRequest::all(uuid, group.clone()))
                .await?;
            debug!(handles = outcome.evicted.len(), "evicted before destroy");
        }

        self.registry.mark_destroying(uuid)?;

        let stragglers = match self.table.seal(uuid, force) {
            Ok(stragglers) => stragglers,
            Err(e) => {
                self.registry.revert_destroying(uuid)?;
                return Err(e);
            }
        };
        if !stragglers.is_empty() {
            debug!(handles = stragglers.len(), "dropping late connections");
            self.coordinator
                .dispatch(Uuid::new_v4(), &stragglers, RevocationReason::PoolDestroyed);
        }

        if let Err(e) = self
            .rpc("release", self.groups.release(&pool.server_group, uuid))
            .await
        {
            warn!(pool = %uuid, "release failed, pool stays active: {}", e);
            self.table.unseal(uuid)?;
            self.registry.revert_destroying(uuid)?;
            return Err(e);
        }

        self.registry.remove(uuid, self.table.count(uuid), force)?;
        self.table.close_pool(uuid);
        self.metrics.pools_destroyed.inc();

        info!(pool = %uuid, "Pool destroyed");
        Ok(())
    }

    /// Drop every destroyed pool record
    pub fn collect_garbage(&self) -> usize {
        let collected = self.registry.collect_garbage();
        if collected > 0 {
            info!(collected, "Collected destroyed pools");
        }
        collected
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Connect a client to an Active pool
    pub fn connect(
        &self,
        uuid: PoolUuid,
        group: &ServerGroup,
        client: ClientIdentity,
        permission: Permission,
    ) -> Result<ConnectionHandle> {
        let pool = self.registry.lookup(uuid, group)?;
        pool.ensure_active()?;

        let handle = self.table.register(&pool, client, permission)?;
        self.metrics.connections_opened.inc();
        info!(pool = %uuid, handle = %handle.id, client = %handle.client, %permission, "Client connected");
        Ok(handle)
    }

    /// Connect, then optionally run an eviction on the same pool
    pub async fn connect_then_maybe_evict(
        &self,
        uuid: PoolUuid,
        group: &ServerGroup,
        client: ClientIdentity,
        permission: Permission,
        evict: Option<EvictionScope>,
    ) -> Result<ConnectOutcome> {
        let handle = self.connect(uuid, group, client, permission)?;

        let eviction = match evict {
            Some(scope) => {
                let mut request = EvictionRequest::all(uuid, group.clone());
                request.scope = scope;
                Some(self.evict(request).await?)
            }
            None => None,
        };

        Ok(ConnectOutcome { handle, eviction })
    }

    /// Remove a client's own handle. Returns whether anything was removed.
    pub fn disconnect(&self, handle: HandleId) -> bool {
        match self.table.remove(handle) {
            Some(removed) => {
                info!(pool = %removed.pool, %handle, "Client disconnected");
                true
            }
            None => {
                debug!(%handle, "disconnect of absent handle");
                false
            }
        }
    }

    /// Check a handle is still connected
    pub fn validate(&self, handle: HandleId) -> Result<ConnectionHandle> {
        self.table.get(handle).ok_or_else(|| Error::HandleEvicted {
            handle: handle.to_string(),
        })
    }

    /// Evict handles and wait for the revocation fan-out to settle
    pub async fn evict(&self, request: EvictionRequest) -> Result<EvictionReport> {
        self.coordinator.evict_and_wait(request).await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn query(&self, uuid: PoolUuid, group: &ServerGroup) -> Result<PoolInfo> {
        let record = self.registry.lookup(uuid, group)?;
        let handles = self.table.count(uuid);
        Ok(PoolInfo::from_record(record, handles))
    }

    pub fn list_pools(&self, group: &ServerGroup) -> Vec<PoolInfo> {
        self.registry
            .list(group)
            .into_iter()
            .map(|record| {
                let handles = self.table.count(record.uuid);
                PoolInfo::from_record(record, handles)
            })
            .collect()
    }

    pub fn handles(&self, uuid: PoolUuid, group: &ServerGroup) -> Result<Vec<ConnectionHandle>> {
        self.registry.lookup(uuid, group)?;
        self.table.all_for(uuid)
    }

    pub fn status(&self) -> ServiceStatus {
        let registry = self.registry.stats();
        let table = self.table.stats();
        ServiceStatus {
            live_pools: registry.live_pools,
            tombstones: registry.tombstones,
            live_handles: table.live_handles,
            server_groups: self.config.server_groups.clone(),
        }
    }

    /// Prometheus text exposition with gauges refreshed from current state
    pub fn metrics_text(&self) -> Result<String> {
        let status = self.status();
        self.metrics.pools_live.set(status.live_pools as i64);
        self.metrics.handles_live.set(status.live_handles as i64);
        self.metrics.render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::{ChannelNotifier, NullNotifier};
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn group() -> ServerGroup {
        ServerGroup::new("daos_server").unwrap()
    }

    fn owner() -> ClientIdentity {
        ClientIdentity::new(1000, 1000)
    }

    fn create_request() -> CreatePoolRequest {
        CreatePoolRequest {
            owner: owner(),
            mode: PoolMode::new(0o731).unwrap(),
            size_bytes: 1 << 30,
            server_group: group(),
            level: 0,
        }
    }

    fn service_with(groups: Arc<StaticServerGroups>, config: ServiceConfig) -> Arc<PoolService> {
        PoolService::new(config, groups, Arc::new(NullNotifier)).unwrap()
    }

    fn service() -> (Arc<PoolService>, Arc<StaticServerGroups>) {
        let groups = Arc::new(StaticServerGroups::new(["daos_server"]));
        (service_with(groups.clone(), ServiceConfig::default()), groups)
    }

    #[tokio::test]
    async fn test_create_then_query_is_active() {
        let (svc, groups) = service();
        let pool = svc.create_pool(create_request()).await.unwrap();

        let info = svc.query(pool.uuid, &group()).unwrap();
        assert_eq!(info.state, PoolState::Active);
        assert_eq!(info.mode.bits(), 0o731);
        assert_eq!(info.owner_uid, 1000);
        assert_eq!(info.size_bytes, 1 << 30);
        assert_eq!(info.handles, 0);
        assert_eq!(groups.allocation_count("daos_server").await, 1);
    }

    #[tokio::test]
    async fn test_create_on_unknown_group_is_unreachable() {
        let (svc, _) = service();
        let mut request = create_request();
        request.server_group = ServerGroup::new("nowhere").unwrap();

        assert_matches!(
            svc.create_pool(request).await,
            Err(Error::ServerGroupUnreachable { .. })
        );
        assert_eq!(svc.status().live_pools, 0);
    }

    #[tokio::test]
    async fn test_create_invalid_size() {
        let (svc, _) = service();
        let mut request = create_request();
        request.size_bytes = 0;
        assert_matches!(svc.create_pool(request).await, Err(Error::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn test_slow_group_times_out() {
        let groups = Arc::new(StaticServerGroups::new(["daos_server"]).with_latency(Duration::from_millis(200)));
        let config = ServiceConfig {
            rpc_timeout_ms: 10,
            ..ServiceConfig::default()
        };
        let svc = service_with(groups, config);

        assert_matches!(
            svc.create_pool(create_request()).await,
            Err(Error::Timeout { operation, .. }) if operation == "probe"
        );
    }

    #[tokio::test]
    async fn test_connect_evict_destroy() {
        let (svc, groups) = service();
        let pool = svc.create_pool(create_request()).await.unwrap();

        let handle = svc
            .connect(pool.uuid, &group(), owner(), Permission::ReadOnly)
            .unwrap();
        assert_eq!(handle.permission, Permission::ReadOnly);
        assert_eq!(svc.query(pool.uuid, &group()).unwrap().handles, 1);

        let report = svc
            .evict(EvictionRequest::all(pool.uuid, group()))
            .await
            .unwrap();
        assert_eq!(report.evicted.len(), 1);
        assert_matches!(svc.validate(handle.id), Err(Error::HandleEvicted { .. }));

        svc.destroy(pool.uuid, &group(), false).await.unwrap();
        assert_matches!(svc.query(pool.uuid, &group()), Err(Error::PoolNotFound { .. }));
        assert_eq!(groups.allocation_count("daos_server").await, 0);
    }

    #[tokio::test]
    async fn test_destroy_without_force_requires_empty() {
        let (svc, _) = service();
        let pool = svc.create_pool(create_request()).await.unwrap();
        let handle = svc
            .connect(pool.uuid, &group(), owner(), Permission::ReadOnly)
            .unwrap();

        assert_matches!(
            svc.destroy(pool.uuid, &group(), false).await,
            Err(Error::PoolNotEmpty { handles: 1, .. })
        );
        // the failed destroy left the pool fully usable
        assert!(svc.validate(handle.id).is_ok());
        assert!(svc
            .connect(pool.uuid, &group(), owner(), Permission::ReadWrite)
            .is_ok());
        assert_eq!(svc.query(pool.uuid, &group()).unwrap().state, PoolState::Active);
    }

    #[tokio::test]
    async fn test_forced_destroy_revokes_handles() {
        let notifier = Arc::new(ChannelNotifier::new());
        let groups = Arc::new(StaticServerGroups::new(["daos_server"]));
        let svc = PoolService::new(ServiceConfig::default(), groups, notifier.clone()).unwrap();
        let mut inbox = notifier.subscribe(&owner());

        let pool = svc.create_pool(create_request()).await.unwrap();
        let handle = svc
            .connect(pool.uuid, &group(), owner(), Permission::ReadOnly)
            .unwrap();

        svc.destroy(pool.uuid, &group(), true).await.unwrap();
        assert_eq!(inbox.recv().await.unwrap().handle, handle.id);
        assert_matches!(svc.validate(handle.id), Err(Error::HandleEvicted { .. }));
        assert_matches!(
            svc.connect(pool.uuid, &group(), owner(), Permission::ReadOnly),
            Err(Error::PoolNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_failed_release_keeps_pool() {
        let (svc, groups) = service();
        let pool = svc.create_pool(create_request()).await.unwrap();
        groups.set_reachable("daos_server", false).await;

        assert_matches!(
            svc.destroy(pool.uuid, &group(), false).await,
            Err(Error::ServerGroupUnreachable { .. })
        );
        assert_eq!(svc.query(pool.uuid, &group()).unwrap().state, PoolState::Active);
        assert!(svc
            .connect(pool.uuid, &group(), owner(), Permission::ReadOnly)
            .is_ok());

        groups.set_reachable("daos_server", true).await;
        svc.destroy(pool.uuid, &group(), true).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_then_maybe_evict() {
        let (svc, _) = service();
        let pool = svc.create_pool(create_request()).await.unwrap();

        let kept = svc
            .connect_then_maybe_evict(pool.uuid, &group(), owner(), Permission::ReadOnly, None)
            .await
            .unwrap();
        assert!(kept.eviction.is_none());
        assert!(svc.validate(kept.handle.id).is_ok());

        let evicted = svc
            .connect_then_maybe_evict(
                pool.uuid,
                &group(),
                owner(),
                Permission::ReadOnly,
                Some(EvictionScope::All),
            )
            .await
            .unwrap();
        let report = evicted.eviction.unwrap();
        assert_eq!(report.evicted.len(), 2);
        assert!(svc.validate(evicted.handle.id).is_err());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (svc, _) = service();
        let pool = svc.create_pool(create_request()).await.unwrap();
        let handle = svc
            .connect(pool.uuid, &group(), owner(), Permission::ReadOnly)
            .unwrap();

        assert!(svc.disconnect(handle.id));
        assert!(!svc.disconnect(handle.id));
        assert_matches!(svc.validate(handle.id), Err(Error::HandleEvicted { .. }));
    }

    #[tokio::test]
    async fn test_list_handles_and_gc() {
        let (svc, _) = service();
        let a = svc.create_pool(create_request()).await.unwrap();
        let b = svc.create_pool(create_request()).await.unwrap();
        svc.connect(a.uuid, &group(), owner(), Permission::ReadOnly)
            .unwrap();

        let listed = svc.list_pools(&group());
        assert_eq!(listed.len(), 2);
        assert_eq!(svc.handles(a.uuid, &group()).unwrap().len(), 1);

        svc.destroy(b.uuid, &group(), false).await.unwrap();
        assert_eq!(svc.list_pools(&group()).len(), 1);
        assert_eq!(svc.status().tombstones, 1);
        assert_eq!(svc.collect_garbage(), 1);
        assert_eq!(svc.status().tombstones, 0);
    }

    #[tokio::test]
    async fn test_metrics_text_reports_live_gauges() {
        let (svc, _) = service();
        let pool = svc.create_pool(create_request()).await.unwrap();
        svc.connect(pool.uuid, &group(), owner(), Permission::ReadOnly)
            .unwrap();

        let text = svc.metrics_text().unwrap();
        assert!(text.contains("pool_membership_pools_live 1"));
        assert!(text.contains("pool_membership_handles_live 1"));
    }

    #[tokio::test]
    async fn test_probe_groups() {
        let (svc, groups) = service();
        svc.probe_groups().await.unwrap();
        groups.set_reachable("daos_server", false).await;
        assert!(svc.probe_groups().await.is_err());
    }
}
