//! Pool Membership - Storage Pool Connection & Eviction Service
//!
//! Tracks which clients hold live handles on which storage pools, and lets
//! an administrator revoke them: one handle, every handle of a client, or
//! every handle on the pool, including as the first step of a forced destroy.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              Pool Service                                    │
//! │                 (create / connect / evict / destroy / query)                 │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │    REST API     │  │    Eviction     │  │      Identity & Access      │  │
//! │  │   (axum/CLI)    │  │   Coordinator   │  │     (owner/group/other)     │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                   │
//! │           └────────────────────┼─────────────────────────┘                   │
//! │                                │                                             │
//! │          ┌─────────────────────┴──────────────────────┐                      │
//! │          │  Pool Registry (64-way sharded)            │                      │
//! │          │  Connection Table (one lock per pool)      │                      │
//! │          └────────────────────────────────────────────┘                      │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                              Adapters                                        │
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │      Server Groups          │  │     Revocation Transports           │   │
//! │  │   (allocate / release)      │  │   (channel / webhook / null)        │   │
//! │  └─────────────────────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Pool service, adapters, REST API and client
//! - [`membership`]: Registry, connection table, access checks and eviction
//! - [`domain`]: Core domain types and ports
//! - [`config`]: Service configuration
//! - [`error`]: Error types and handling

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod membership;
pub mod metrics;
pub mod retry;

// Re-export commonly used types
pub use controlplane::{
    ApiServer, ApiServerConfig, ChannelNotifier, CreatePoolRequest, NotifierFactory,
    NullNotifier, PoolClient, PoolInfo, PoolService, RestRouter, StaticServerGroups,
    WebhookNotifier,
};

pub use config::{NotifierConfig, ServiceConfig, DEFAULT_SERVER_GROUP};

pub use domain::{
    parse_size, ClientIdentity, EvictionNotifier, HandleId, Permission, PoolMode, PoolState,
    PoolUuid, Revocation, RevocationReason, ServerGroup, ServerGroupService,
};

pub use error::{Error, ErrorAction, Result};

pub use membership::{
    ConnectionHandle, ConnectionTable, EvictionCoordinator, EvictionReport, EvictionRequest,
    EvictionScope, EvictionState, PoolEvent, PoolRegistry,
};

pub use metrics::ServiceMetrics;
pub use retry::{retry_with_backoff, RetryPolicy};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
