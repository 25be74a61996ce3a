//! Domain Ports - Core trait definitions for the membership service
//!
//! These traits define the boundaries between the membership logic and the
//! storage servers and client transports it depends on. Adapters implement
//! these traits to provide concrete functionality.

use super::types::{ClientIdentity, HandleId, PoolUuid, ServerGroup};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

// =============================================================================
// Server Group Port
// =============================================================================

/// Port for the storage servers that back a pool
#[async_trait]
pub trait ServerGroupService: Send + Sync {
    /// Check that the named group can be contacted
    async fn probe(&self, group: &ServerGroup) -> Result<()>;

    /// Allocate server-side storage for a new pool
    async fn allocate(&self, group: &ServerGroup, pool: PoolUuid, size_bytes: u64) -> Result<()>;

    /// Release server-side storage of a destroyed pool
    async fn release(&self, group: &ServerGroup, pool: PoolUuid) -> Result<()>;
}

// =============================================================================
// Revocation Notification Port
// =============================================================================

/// Why a handle was revoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Evicted,
    PoolDestroyed,
}

/// Message telling a client its handle is gone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revocation {
    /// Eviction request that produced this revocation
    pub request_id: Uuid,
    pub pool: PoolUuid,
    pub handle: HandleId,
    pub client: ClientIdentity,
    pub reason: RevocationReason,
    pub issued_at: DateTime<Utc>,
}

/// Port for delivering revocations to clients
#[async_trait]
pub trait EvictionNotifier: Send + Sync {
    /// Deliver a single revocation
    async fn notify(&self, revocation: &Revocation) -> Result<()>;

    /// Transport name for logs
    fn transport(&self) -> &str;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ServerGroupServiceRef = Arc<dyn ServerGroupService>;
pub type EvictionNotifierRef = Arc<dyn EvictionNotifier>;
