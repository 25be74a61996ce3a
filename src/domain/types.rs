//! Core value types shared by every layer of the service

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Longest server group name accepted
pub const MAX_GROUP_NAME_LEN: usize = 64;

// =============================================================================
// Pool UUID
// =============================================================================

/// Immutable 128-bit pool identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolUuid(Uuid);

impl PoolUuid {
    /// Allocate a fresh random identifier
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a hyphenated or 32-digit simple UUID string
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| Error::InvalidParameter(format!("malformed pool uuid {:?}: {}", s, e)))
    }

    /// Resolve a caller-supplied pool identifier on a lookup path.
    ///
    /// A string that is not a UUID cannot name any registered pool, so it
    /// fails with `PoolNotFound` rather than `InvalidParameter`.
    pub fn address(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| Error::pool_not_found(s.trim()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Shard index for a table with `shards` buckets
    #[inline]
    pub fn shard_index(&self, shards: usize) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.0.hash(&mut hasher);
        (hasher.finish() as usize) % shards
    }
}

impl From<Uuid> for PoolUuid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::str::FromStr for PoolUuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for PoolUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

// =============================================================================
// Handle ID
// =============================================================================

/// Identifier of one connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(Uuid);

impl HandleId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| Error::InvalidParameter(format!("malformed handle id {:?}: {}", s, e)))
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

// =============================================================================
// Server Group
// =============================================================================

/// Name of a cluster of cooperating storage servers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerGroup(String);

impl ServerGroup {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidParameter("server group name is empty".into()));
        }
        if name.len() > MAX_GROUP_NAME_LEN {
            return Err(Error::InvalidParameter(format!(
                "server group name longer than {} bytes",
                MAX_GROUP_NAME_LEN
            )));
        }
        if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(Error::InvalidParameter(format!(
                "server group name {:?} contains whitespace",
                name
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ServerGroup {
    type Error = Error;

    fn try_from(name: String) -> Result<Self> {
        Self::new(name)
    }
}

impl From<ServerGroup> for String {
    fn from(group: ServerGroup) -> Self {
        group.0
    }
}

impl std::fmt::Display for ServerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Pool Mode
// =============================================================================

/// Which triad of the mode bits applies to a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessClass {
    Owner,
    Group,
    Other,
}

/// Unix-style permission bits of a pool (owner/group/other triads)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct PoolMode(u32);

impl PoolMode {
    pub const MAX: u32 = 0o777;

    pub fn new(bits: u32) -> Result<Self> {
        if bits > Self::MAX {
            return Err(Error::InvalidParameter(format!(
                "mode {:o} has bits outside 0777",
                bits
            )));
        }
        Ok(Self(bits))
    }

    /// Parse an octal string such as "0731" or "731"
    pub fn parse_octal(s: &str) -> Result<Self> {
        let digits = s.trim().trim_start_matches("0o");
        let bits = u32::from_str_radix(digits, 8)
            .map_err(|_| Error::InvalidParameter(format!("mode {:?} is not octal", s)))?;
        Self::new(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// The three rwx bits of one access class
    pub fn triad(&self, class: AccessClass) -> u32 {
        match class {
            AccessClass::Owner => (self.0 >> 6) & 0o7,
            AccessClass::Group => (self.0 >> 3) & 0o7,
            AccessClass::Other => self.0 & 0o7,
        }
    }
}

impl TryFrom<u32> for PoolMode {
    type Error = Error;

    fn try_from(bits: u32) -> Result<Self> {
        Self::new(bits)
    }
}

impl From<PoolMode> for u32 {
    fn from(mode: PoolMode) -> Self {
        mode.0
    }
}

impl std::fmt::Display for PoolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

// =============================================================================
// Connect Permission
// =============================================================================

/// Connection permission level, ordered from weakest to strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "rw")]
    ReadWrite,
    #[serde(rename = "ex")]
    Exclusive,
}

impl Permission {
    /// Mode bit that must be present in the caller's triad
    pub fn mode_bit(&self) -> u32 {
        match self {
            Permission::ReadOnly => 0o4,
            Permission::ReadWrite => 0o2,
            Permission::Exclusive => 0o1,
        }
    }
}

impl std::str::FromStr for Permission {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ro" | "r" | "readonly" => Ok(Permission::ReadOnly),
            "rw" | "w" | "readwrite" => Ok(Permission::ReadWrite),
            "ex" | "x" | "exclusive" => Ok(Permission::Exclusive),
            other => Err(Error::InvalidParameter(format!(
                "unknown permission {:?}, expected ro, rw or ex",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Permission::ReadOnly => write!(f, "ro"),
            Permission::ReadWrite => write!(f, "rw"),
            Permission::Exclusive => write!(f, "ex"),
        }
    }
}

// =============================================================================
// Client Identity
// =============================================================================

/// The `(uid_t)-1` sentinel is never a valid identity
const INVALID_ID: u32 = u32::MAX;

/// Who is asking
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub uid: u32,
    pub gid: u32,
    /// Optional session label distinguishing processes of one user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl ClientIdentity {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            session: None,
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.uid == INVALID_ID {
            return Err(Error::InvalidParameter("uid -1 is not a valid identity".into()));
        }
        if self.gid == INVALID_ID {
            return Err(Error::InvalidParameter("gid -1 is not a valid identity".into()));
        }
        Ok(())
    }
}

impl std::fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.session {
            Some(session) => write!(f, "{}:{}@{}", self.uid, self.gid, session),
            None => write!(f, "{}:{}", self.uid, self.gid),
        }
    }
}

// =============================================================================
// Pool State
// =============================================================================

/// Lifecycle state of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    Creating,
    Active,
    Destroying,
    Destroyed,
}

impl PoolState {
    pub fn can_transition_to(&self, next: PoolState) -> bool {
        matches!(
            (self, next),
            (PoolState::Creating, PoolState::Active)
                | (PoolState::Active, PoolState::Destroying)
                | (PoolState::Destroying, PoolState::Active)
                | (PoolState::Destroying, PoolState::Destroyed)
        )
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolState::Creating => write!(f, "creating"),
            PoolState::Active => write!(f, "active"),
            PoolState::Destroying => write!(f, "destroying"),
            PoolState::Destroyed => write!(f, "destroyed"),
        }
    }
}

// =============================================================================
// Size Parsing
// =============================================================================

/// Parse a size string (e.g., "1gb", "512M", "1Ti") to bytes
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::CapacityParse("empty size string".into()));
    }

    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    let num_str = &s[..num_end];
    let unit_str = s[num_end..].trim();

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid number: {:?}", num_str)))?;

    let multiplier: u64 = match unit_str.to_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KI" | "KIB" => 1 << 10,
        "M" | "MB" | "MI" | "MIB" => 1 << 20,
        "G" | "GB" | "GI" | "GIB" => 1 << 30,
        "T" | "TB" | "TI" | "TIB" => 1 << 40,
        "P" | "PB" | "PI" | "PIB" => 1 << 50,
        _ => return Err(Error::CapacityParse(format!("unknown unit: {:?}", unit_str))),
    };

    let bytes = (num * multiplier as f64) as u64;
    if bytes == 0 {
        return Err(Error::InvalidParameter(format!("size {:?} must be positive", s)));
    }
    Ok(bytes)
}
