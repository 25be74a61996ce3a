//! Identity & Access
//!
//! Checks a caller's identity and requested permission against a pool's
//! owner, group and mode bits. The first matching class decides: an owner is
//! judged by the owner triad only, even when the group triad is wider.

use crate::domain::{AccessClass, ClientIdentity, Permission, PoolMode, PoolUuid};
use crate::error::{Error, Result};

/// Access-control metadata of one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessPolicy {
    pub pool: PoolUuid,
    pub owner_uid: u32,
    pub owner_gid: u32,
    pub mode: PoolMode,
}

impl AccessPolicy {
    pub fn class_for(&self, who: &ClientIdentity) -> AccessClass {
        if who.uid == self.owner_uid {
            AccessClass::Owner
        } else if who.gid == self.owner_gid {
            AccessClass::Group
        } else {
            AccessClass::Other
        }
    }

    /// Permission granted to `who` for `requested`, or `AccessDenied`
    pub fn authorize(&self, who: &ClientIdentity, requested: Permission) -> Result<Permission> {
        who.validate()?;
        let triad = self.mode.triad(self.class_for(who));
        if triad & requested.mode_bit() == 0 {
            return Err(Error::AccessDenied {
                pool: self.pool.to_string(),
                uid: who.uid,
                gid: who.gid,
                requested: requested.to_string(),
            });
        }
        Ok(requested)
    }
}
