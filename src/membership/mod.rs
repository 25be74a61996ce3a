//! Membership Module
//!
//! Pool registry, per-pool connection tables, access checks and the eviction
//! coordinator that ties them together.

pub mod access;
pub mod connection_table;
pub mod events;
pub mod eviction;
pub mod pool_registry;

pub use access::AccessPolicy;
pub use connection_table::{ConnectionHandle, ConnectionTable, TableStatsSnapshot};
pub use events::PoolEvent;
pub use eviction::{
    EvictionCoordinator, EvictionOutcome, EvictionReport, EvictionRequest, EvictionScope,
    EvictionState, NotificationSummary,
};
pub use pool_registry::{PoolRecord, PoolRegistry, PoolSpec, RegistryStatsSnapshot};
