//! Eviction Coordinator
//!
//! Processes eviction requests synchronously:
//!
//! ```text
//!   Received ──validate──► Validated ──remove──► Applied ──notify──► Acknowledged
//!       │
//!       └──────────────► Rejected
//! ```
//!
//! Removal is authoritative and happens inside the pool's critical section.
//! Revocation notices are sent afterwards from a spawned task bounded by a
//! deadline; a lost or late notice never restores a handle.

use super::connection_table::{ConnectionHandle, ConnectionTable};
use super::events::PoolEvent;
use super::pool_registry::PoolRegistry;
use crate::domain::{
    EvictionNotifierRef, HandleId, PoolUuid, Revocation, RevocationReason, ServerGroup,
};
use crate::error::{Error, Result};
use crate::metrics::ServiceMetrics;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

// =============================================================================
// Request Types
// =============================================================================

/// Which handles an eviction targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope")]
pub enum EvictionScope {
    /// Every handle on the pool
    All,
    /// One handle
    Handle { handle: HandleId },
    /// Every handle held by one uid/gid pair
    Client { uid: u32, gid: u32 },
}

impl EvictionScope {
    pub fn matches(&self, handle: &ConnectionHandle) -> bool {
        match self {
            EvictionScope::All => true,
            EvictionScope::Handle { handle: id } => handle.id == *id,
            EvictionScope::Client { uid, gid } => {
                handle.client.uid == *uid && handle.client.gid == *gid
            }
        }
    }
}

impl std::fmt::Display for EvictionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionScope::All => write!(f, "all"),
            EvictionScope::Handle { handle } => write!(f, "handle:{}", handle),
            EvictionScope::Client { uid, gid } => write!(f, "client:{}:{}", uid, gid),
        }
    }
}

/// A transient eviction command
#[derive(Debug, Clone)]
pub struct EvictionRequest {
    pub pool: PoolUuid,
    pub server_group: ServerGroup,
    pub scope: EvictionScope,
    /// Opaque pass-through level, recorded in logs only
    pub level: u32,
}

impl EvictionRequest {
    pub fn all(pool: PoolUuid, server_group: ServerGroup) -> Self {
        Self {
            pool,
            server_group,
            scope: EvictionScope::All,
            level: 0,
        }
    }

    pub fn handle(pool: PoolUuid, server_group: ServerGroup, handle: HandleId) -> Self {
        Self {
            pool,
            server_group,
            scope: EvictionScope::Handle { handle },
            level: 0,
        }
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }
}

// =============================================================================
// Request State Machine
// =============================================================================

/// Progress of one eviction request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionState {
    Received,
    Validated,
    Applied,
    Acknowledged,
    Rejected,
}

impl EvictionState {
    pub fn can_transition_to(&self, next: EvictionState) -> bool {
        matches!(
            (self, next),
            (EvictionState::Received, EvictionState::Validated)
                | (EvictionState::Received, EvictionState::Rejected)
                | (EvictionState::Validated, EvictionState::Applied)
                | (EvictionState::Validated, EvictionState::Rejected)
                | (EvictionState::Applied, EvictionState::Acknowledged)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EvictionState::Acknowledged | EvictionState::Rejected)
    }

    fn advance(&mut self, next: EvictionState) {
        debug_assert!(self.can_transition_to(next), "{:?} -> {:?}", self, next);
        debug!(from = ?*self, to = ?next, "eviction state");
        *self = next;
    }
}

// =============================================================================
// Notification Summary
// =============================================================================

/// How the revocation fan-out went
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSummary {
    pub delivered: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl NotificationSummary {
    pub fn total(&self) -> usize {
        self.delivered + self.failed + self.timed_out
    }
}

/// Final account of an eviction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionReport {
    pub request_id: Uuid,
    pub pool: PoolUuid,
    pub scope: EvictionScope,
    pub state: EvictionState,
    pub evicted: Vec<ConnectionHandle>,
    pub notifications: NotificationSummary,
}

/// An applied eviction whose notices may still be in flight
#[derive(Debug)]
pub struct EvictionOutcome {
    pub request_id: Uuid,
    pub pool: PoolUuid,
    pub scope: EvictionScope,
    pub state: EvictionState,
    pub evicted: Vec<ConnectionHandle>,
    notifications: JoinHandle<NotificationSummary>,
}

impl EvictionOutcome {
    /// True when nothing matched
    pub fn is_noop(&self) -> bool {
        self.evicted.is_empty()
    }

    /// Wait for the notification fan-out to finish or time out
    pub async fn acknowledged(self) -> EvictionReport {
        let mut state = self.state;
        let notifications = match self.notifications.await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(request_id = %self.request_id, "notification task failed: {}", e);
                NotificationSummary {
                    failed: self.evicted.len(),
                    ..Default::default()
                }
            }
        };
        state.advance(EvictionState::Acknowledged);

        EvictionReport {
            request_id: self.request_id,
            pool: self.pool,
            scope: self.scope,
            state,
            evicted: self.evicted,
            notifications,
        }
    }
}

// =============================================================================
// Eviction Coordinator
// =============================================================================

/// Validates eviction requests and applies them to the connection table
pub struct EvictionCoordinator {
    registry: Arc<PoolRegistry>,
    table: Arc<ConnectionTable>,
    notifier: EvictionNotifierRef,
    notify_timeout: Duration,
    metrics: ServiceMetrics,
    event_sender: broadcast::Sender<PoolEvent>,
}

impl EvictionCoordinator {
    pub fn new(
        registry: Arc<PoolRegistry>,
        table: Arc<ConnectionTable>,
        notifier: EvictionNotifierRef,
        notify_timeout: Duration,
        metrics: ServiceMetrics,
        event_sender: broadcast::Sender<PoolEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            table,
            notifier,
            notify_timeout,
            metrics,
            event_sender,
        })
    }

    /// Validate and apply an eviction. Returns once the targeted handles are
    /// out of the table; notices continue in the background.
    pub async fn evict(&self, request: EvictionRequest) -> Result<EvictionOutcome> {
        let request_id = Uuid::new_v4();
        let span = info_span!(
            "evict",
            pool = %request.pool,
            group = %request.server_group,
            %request_id,
        );
        self.evict_inner(request_id, request).instrument(span).await
    }

    /// [`evict`](Self::evict) and wait for acknowledgement
    pub async fn evict_and_wait(&self, request: EvictionRequest) -> Result<EvictionReport> {
        Ok(self.evict(request).await?.acknowledged().await)
    }

    async fn evict_inner(&self, request_id: Uuid, request: EvictionRequest) -> Result<EvictionOutcome> {
        let mut state = EvictionState::Received;
        self.metrics.evictions_requested.inc();
        info!(scope = %request.scope, level = request.level, "eviction received");

        let pool = match self.registry.lookup(request.pool, &request.server_group) {
            Ok(pool) => pool,
            Err(e) => return Err(self.reject(&mut state, e)),
        };
        state.advance(EvictionState::Validated);

        let scope = request.scope.clone();
        let evicted = match self.table.drain_matching(pool.uuid, |h| scope.matches(h)) {
            Ok(evicted) => evicted,
            Err(e) => return Err(self.reject(&mut state, e)),
        };
        state.advance(EvictionState::Applied);

        if evicted.is_empty() {
            info!("eviction matched no handles");
        } else {
            info!(handles = evicted.len(), "eviction applied");
            self.metrics.handles_evicted.inc_by(evicted.len() as u64);
            let _ = self.event_sender.send(PoolEvent::HandlesEvicted {
                pool: pool.uuid,
                request_id,
                handles: evicted.iter().map(|h| h.id).collect(),
            });
        }

        let notifications = self.dispatch(request_id, &evicted, RevocationReason::Evicted);

        Ok(EvictionOutcome {
            request_id,
            pool: pool.uuid,
            scope: request.scope,
            state,
            evicted,
            notifications,
        })
    }

    fn reject(&self, state: &mut EvictionState, err: Error) -> Error {
        state.advance(EvictionState::Rejected);
        warn!(kind = err.kind(), "eviction rejected: {}", err);
        self.metrics
            .evictions_rejected
            .with_label_values(&[err.kind()])
            .inc();
        err
    }

    /// Send revocations for `handles` from a background task.
    ///
    /// Every notice shares one deadline; whatever has not completed by then
    /// counts as timed out.
    pub fn dispatch(
        &self,
        request_id: Uuid,
        handles: &[ConnectionHandle],
        reason: RevocationReason,
    ) -> JoinHandle<NotificationSummary> {
        let revocations: Vec<Revocation> = handles
            .iter()
            .map(|h| Revocation {
                request_id,
                pool: h.pool,
                handle: h.id,
                client: h.client.clone(),
                reason,
                issued_at: Utc::now(),
            })
            .collect();

        let notifier = self.notifier.clone();
        let metrics = self.metrics.clone();
        let deadline = tokio::time::Instant::now() + self.notify_timeout;

        tokio::spawn(
            async move {
                let sends = revocations.iter().map(|revocation| {
                    let notifier = notifier.clone();
                    async move {
                        let result =
                            tokio::time::timeout_at(deadline, notifier.notify(revocation)).await;
                        (revocation.handle, result)
                    }
                });

                let mut summary = NotificationSummary::default();
                for (handle, result) in join_all(sends).await {
                    match result {
                        Ok(Ok(())) => summary.delivered += 1,
                        Ok(Err(e)) => {
                            warn!(%handle, transport = notifier.transport(), "revocation not delivered: {}", e);
                            metrics.notification_failures.with_label_values(&["failed"]).inc();
                            summary.failed += 1;
                        }
                        Err(_) => {
                            warn!(%handle, transport = notifier.transport(), "revocation timed out");
                            metrics.notification_failures.with_label_values(&["timed_out"]).inc();
                            summary.timed_out += 1;
                        }
                    }
                }
                debug!(?summary, "revocation fan-out finished");
                summary
            }
            .in_current_span(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::{ChannelNotifier, NullNotifier};
    use crate::domain::{ClientIdentity, EvictionNotifier, Permission, PoolMode};
    use crate::membership::pool_registry::{PoolRecord, PoolSpec};
    use assert_matches::assert_matches;
    use async_trait::async_trait;

    struct Fixture {
        registry: Arc<PoolRegistry>,
        table: Arc<ConnectionTable>,
        coordinator: Arc<EvictionCoordinator>,
        pool: PoolRecord,
        group: ServerGroup,
    }

    fn fixture(notifier: EvictionNotifierRef, notify_timeout: Duration) -> Fixture {
        let (tx, _) = broadcast::channel(64);
        let registry = PoolRegistry::with_events(tx.clone());
        let table = ConnectionTable::new(tx.clone());
        let group = ServerGroup::new("daos_server").unwrap();
        let created = registry
            .create(PoolSpec {
                owner: ClientIdentity::new(1000, 1000),
                mode: PoolMode::new(0o731).unwrap(),
                size_bytes: 1 << 30,
                server_group: group.clone(),
            })
            .unwrap();
        let pool = registry.activate(created.uuid).unwrap();
        table.open_pool(pool.uuid);

        let coordinator = EvictionCoordinator::new(
            registry.clone(),
            table.clone(),
            notifier,
            notify_timeout,
            ServiceMetrics::new().unwrap(),
            tx,
        );
        Fixture {
            registry,
            table,
            coordinator,
            pool,
            group,
        }
    }

    fn quiet() -> Fixture {
        fixture(Arc::new(NullNotifier), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_evict_empty_pool_is_noop_success() {
        let f = quiet();
        let report = f
            .coordinator
            .evict_and_wait(EvictionRequest::all(f.pool.uuid, f.group.clone()))
            .await
            .unwrap();
        assert_eq!(report.state, EvictionState::Acknowledged);
        assert!(report.evicted.is_empty());
        assert_eq!(report.notifications.total(), 0);
    }

    #[tokio::test]
    async fn test_evict_all_empties_table() {
        let f = quiet();
        let owner = ClientIdentity::new(1000, 1000);
        for _ in 0..3 {
            f.table.register(&f.pool, owner.clone(), Permission::ReadOnly).unwrap();
        }

        let outcome = f
            .coordinator
            .evict(EvictionRequest::all(f.pool.uuid, f.group.clone()))
            .await
            .unwrap();
        assert_eq!(outcome.state, EvictionState::Applied);
        assert_eq!(outcome.evicted.len(), 3);
        // removal is visible before acknowledgement
        assert_eq!(f.table.count(f.pool.uuid), 0);

        let report = outcome.acknowledged().await;
        assert_eq!(report.notifications.delivered, 3);
    }

    #[tokio::test]
    async fn test_evict_unknown_uuid_is_not_found() {
        let f = quiet();
        let bogus = PoolUuid::parse("44be6958-40f4-b6ed-a581-b461a4d4c570").unwrap();
        let wrong_group = ServerGroup::new("bogus_group").unwrap();

        for group in [f.group.clone(), wrong_group] {
            let result = f.coordinator.evict(EvictionRequest::all(bogus, group)).await;
            assert_matches!(result, Err(Error::PoolNotFound { .. }));
        }
    }

    #[tokio::test]
    async fn test_evict_wrong_group_is_mismatch_and_keeps_handles() {
        let f = quiet();
        let h = f
            .table
            .register(&f.pool, ClientIdentity::new(1000, 1000), Permission::ReadOnly)
            .unwrap();

        let wrong = ServerGroup::new("bogus_group").unwrap();
        let result = f.coordinator.evict(EvictionRequest::all(f.pool.uuid, wrong)).await;
        assert_matches!(result, Err(Error::ServerGroupMismatch { .. }));
        assert!(f.table.contains(h.id));
    }

    #[tokio::test]
    async fn test_evict_single_handle() {
        let f = quiet();
        let owner = ClientIdentity::new(1000, 1000);
        let a = f.table.register(&f.pool, owner.clone(), Permission::ReadOnly).unwrap();
        let b = f.table.register(&f.pool, owner, Permission::ReadOnly).unwrap();

        let report = f
            .coordinator
            .evict_and_wait(EvictionRequest::handle(f.pool.uuid, f.group.clone(), a.id))
            .await
            .unwrap();
        assert_eq!(report.evicted.len(), 1);
        assert!(!f.table.contains(a.id));
        assert!(f.table.contains(b.id));

        // evicting it again is a silent no-op
        let again = f
            .coordinator
            .evict(EvictionRequest::handle(f.pool.uuid, f.group.clone(), a.id))
            .await
            .unwrap();
        assert!(again.is_noop());
    }

    #[tokio::test]
    async fn test_evict_by_client() {
        let f = quiet();
        let owner = ClientIdentity::new(1000, 1000);
        let member = ClientIdentity::new(2000, 1000);
        f.table.register(&f.pool, owner, Permission::ReadOnly).unwrap();
        f.table.register(&f.pool, member.clone(), Permission::ReadWrite).unwrap();
        f.table.register(&f.pool, member, Permission::ReadWrite).unwrap();

        let mut request = EvictionRequest::all(f.pool.uuid, f.group.clone());
        request.scope = EvictionScope::Client { uid: 2000, gid: 1000 };
        let report = f.coordinator.evict_and_wait(request).await.unwrap();
        assert_eq!(report.evicted.len(), 2);
        assert_eq!(f.table.count(f.pool.uuid), 1);
    }

    #[tokio::test]
    async fn test_clients_receive_revocations() {
        let notifier = Arc::new(ChannelNotifier::new());
        let f = fixture(notifier.clone(), Duration::from_secs(1));
        let owner = ClientIdentity::new(1000, 1000);
        let mut inbox = notifier.subscribe(&owner);
        let h = f.table.register(&f.pool, owner, Permission::ReadOnly).unwrap();

        let report = f
            .coordinator
            .evict_and_wait(EvictionRequest::all(f.pool.uuid, f.group.clone()))
            .await
            .unwrap();
        assert_eq!(report.notifications.delivered, 1);

        let revocation = inbox.recv().await.unwrap();
        assert_eq!(revocation.handle, h.id);
        assert_eq!(revocation.reason, RevocationReason::Evicted);
        assert_eq!(revocation.request_id, report.request_id);
    }

    struct StalledNotifier;

    #[async_trait]
    impl EvictionNotifier for StalledNotifier {
        async fn notify(&self, _revocation: &Revocation) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        fn transport(&self) -> &str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn test_notification_timeout_does_not_roll_back() {
        let f = fixture(Arc::new(StalledNotifier), Duration::from_millis(20));
        let h = f
            .table
            .register(&f.pool, ClientIdentity::new(1000, 1000), Permission::ReadOnly)
            .unwrap();

        let report = f
            .coordinator
            .evict_and_wait(EvictionRequest::all(f.pool.uuid, f.group.clone()))
            .await
            .unwrap();
        assert_eq!(report.state, EvictionState::Acknowledged);
        assert_eq!(report.notifications.timed_out, 1);
        assert!(!f.table.contains(h.id));
    }

    #[tokio::test]
    async fn test_undeliverable_notice_counts_as_failed() {
        // nobody subscribed for this client
        let f = fixture(Arc::new(ChannelNotifier::new()), Duration::from_secs(1));
        f.table
            .register(&f.pool, ClientIdentity::new(1000, 1000), Permission::ReadOnly)
            .unwrap();

        let report = f
            .coordinator
            .evict_and_wait(EvictionRequest::all(f.pool.uuid, f.group.clone()))
            .await
            .unwrap();
        assert_eq!(report.notifications.failed, 1);
        assert_eq!(f.table.count(f.pool.uuid), 0);
    }

    #[tokio::test]
    async fn test_destroying_pool_can_still_be_evicted() {
        let f = quiet();
        f.table
            .register(&f.pool, ClientIdentity::new(1000, 1000), Permission::ReadOnly)
            .unwrap();
        f.registry.mark_destroying(f.pool.uuid).unwrap();

        let report = f
            .coordinator
            .evict_and_wait(EvictionRequest::all(f.pool.uuid, f.group.clone()))
            .await
            .unwrap();
        assert_eq!(report.evicted.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_and_evict_all() {
        let f = quiet();
        let pool = Arc::new(f.pool.clone());

        let connector = {
            let table = f.table.clone();
            let pool = pool.clone();
            tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..500 {
                    ids.push(
                        table
                            .register(&pool, ClientIdentity::new(1000, 1000), Permission::ReadOnly)
                            .unwrap()
                            .id,
                    );
                    tokio::task::yield_now().await;
                }
                ids
            })
        };

        let mut evicted = Vec::new();
        for _ in 0..20 {
            let report = f
                .coordinator
                .evict_and_wait(EvictionRequest::all(f.pool.uuid, f.group.clone()))
                .await
                .unwrap();
            // nothing the eviction reported survives it
            for h in &report.evicted {
                assert!(!f.table.contains(h.id));
            }
            evicted.extend(report.evicted);
        }

        let registered = connector.await.unwrap();
        let remaining = f.table.all_for(f.pool.uuid).unwrap();
        assert_eq!(evicted.len() + remaining.len(), registered.len());
    }

    #[test]
    fn test_state_machine_edges() {
        assert!(EvictionState::Received.can_transition_to(EvictionState::Validated));
        assert!(EvictionState::Received.can_transition_to(EvictionState::Rejected));
        assert!(!EvictionState::Applied.can_transition_to(EvictionState::Rejected));
        assert!(!EvictionState::Received.can_transition_to(EvictionState::Applied));
        assert!(EvictionState::Acknowledged.is_terminal());
        assert!(EvictionState::Rejected.is_terminal());
        assert!(!EvictionState::Applied.is_terminal());
    }
}
