//! Pool Events
//!
//! Events emitted by the pool registry and connection table for external
//! consumers to react to pool lifecycle and membership changes.

use crate::domain::{ClientIdentity, HandleId, Permission, PoolUuid};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted by the membership layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PoolEvent {
    /// A pool record was inserted in the Creating state
    PoolCreated {
        pool: PoolUuid,
        server_group: String,
        size_bytes: u64,
    },

    /// Server-side allocation finished and the pool is usable
    PoolActivated { pool: PoolUuid },

    /// Destroy was accepted; no new connections are admitted
    PoolDestroying { pool: PoolUuid },

    /// Destroy finished; the record is now a tombstone
    PoolDestroyed { pool: PoolUuid },

    /// Tombstones were removed from the registry
    PoolsCollected { count: usize },

    /// A client connected
    HandleConnected {
        pool: PoolUuid,
        handle: HandleId,
        client: ClientIdentity,
        permission: Permission,
    },

    /// A client disconnected on its own
    HandleDisconnected { pool: PoolUuid, handle: HandleId },

    /// Handles were removed by an eviction request
    HandlesEvicted {
        pool: PoolUuid,
        request_id: Uuid,
        handles: Vec<HandleId>,
    },
}

impl PoolEvent {
    /// Get the pool this event concerns, if any
    pub fn pool(&self) -> Option<PoolUuid> {
        match self {
            PoolEvent::PoolCreated { pool, .. } => Some(*pool),
            PoolEvent::PoolActivated { pool } => Some(*pool),
            PoolEvent::PoolDestroying { pool } => Some(*pool),
            PoolEvent::PoolDestroyed { pool } => Some(*pool),
            PoolEvent::PoolsCollected { .. } => None,
            PoolEvent::HandleConnected { pool, .. } => Some(*pool),
            PoolEvent::HandleDisconnected { pool, .. } => Some(*pool),
            PoolEvent::HandlesEvicted { pool, .. } => Some(*pool),
        }
    }

    /// Check if this is a membership (handle-level) event
    pub fn is_membership_event(&self) -> bool {
        matches!(
            self,
            PoolEvent::HandleConnected { .. }
                | PoolEvent::HandleDisconnected { .. }
                | PoolEvent::HandlesEvicted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_pool() {
        let pool = PoolUuid::new_v4();
        let event = PoolEvent::PoolActivated { pool };
        assert_eq!(event.pool(), Some(pool));
        assert!(!event.is_membership_event());

        let event = PoolEvent::PoolsCollected { count: 3 };
        assert_eq!(event.pool(), None);
    }

    #[test]
    fn test_membership_event() {
        let event = PoolEvent::HandlesEvicted {
            pool: PoolUuid::new_v4(),
            request_id: Uuid::new_v4(),
            handles: vec![HandleId::new_v4()],
        };
        assert!(event.is_membership_event());
    }
}
