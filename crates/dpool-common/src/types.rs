//! Core type definitions for dpool
//!
//! This module defines the replica identifier, the replica lifecycle,
//! sticky pins and the file attributes mirrored from the namespace.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as unix milliseconds
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Globally unique file identifier assigned by the namespace
///
/// The textual form is 1-64 hexadecimal characters. Lower-case input is
/// accepted and normalised to upper case so that on-disk names are stable.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ReplicaId(String);

impl ReplicaId {
    /// Maximum length of a replica id
    pub const MAX_LEN: usize = 64;

    /// Create a new replica id (validates the hexadecimal form)
    pub fn new(id: impl Into<String>) -> Result<Self, ReplicaIdError> {
        let mut id = id.into();
        Self::validate(&id)?;
        id.make_ascii_uppercase();
        Ok(Self(id))
    }

    /// Get the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), ReplicaIdError> {
        if id.is_empty() {
            return Err(ReplicaIdError::Empty);
        }
        if id.len() > Self::MAX_LEN {
            return Err(ReplicaIdError::TooLong(id.len()));
        }
        if let Some(c) = id.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(ReplicaIdError::InvalidChar(c));
        }
        Ok(())
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaId({})", self.0)
    }
}

impl FromStr for ReplicaId {
    type Err = ReplicaIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ReplicaId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Errors that can occur when parsing a replica id
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicaIdError {
    #[error("replica id must not be empty")]
    Empty,
    #[error("replica id must be at most 64 characters, got {0}")]
    TooLong(usize),
    #[error("replica id contains non-hexadecimal character: {0:?}")]
    InvalidChar(char),
}

/// Lifecycle state of a replica
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ReplicaState {
    /// Entry created, no data transfer started yet
    #[display("NEW")]
    New,
    /// Being written by a client
    #[display("FROM_CLIENT")]
    FromClient,
    /// Being staged from the nearline store
    #[display("FROM_STORE")]
    FromStore,
    /// Complete and safely duplicated elsewhere; evictable
    #[display("CACHED")]
    Cached,
    /// Complete but not yet flushed; must not be evicted
    #[display("PRECIOUS")]
    Precious,
    /// Known to be damaged
    #[display("BROKEN")]
    Broken,
    /// Logically deleted
    #[display("REMOVED")]
    Removed,
}

impl ReplicaState {
    /// Check whether a transition from `self` to `next` is allowed
    ///
    /// Transitions only move forward through the lifecycle, except that a
    /// broken replica may be healed back to a complete state. Re-setting the
    /// current state is always allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ReplicaState::{Broken, Cached, FromClient, FromStore, New, Precious, Removed};

        if self as u8 == next as u8 {
            return true;
        }
        match self {
            New => !matches!(next, New),
            FromClient | FromStore => matches!(next, Cached | Precious | Broken | Removed),
            Cached | Precious | Broken => matches!(next, Cached | Precious | Broken | Removed),
            Removed => false,
        }
    }

    /// Whether the replica content is complete on disk
    #[must_use]
    pub const fn is_complete(self) -> bool {
        matches!(self, Self::Cached | Self::Precious | Self::Broken)
    }

    /// Whether a transfer into the pool is (or was) in progress
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::New | Self::FromClient | Self::FromStore)
    }
}

/// Expiration of a sticky record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expiry {
    /// Pin never expires
    Never,
    /// Pin expires at the given unix time (milliseconds)
    At(u64),
}

impl Expiry {
    /// Expiry `millis` milliseconds from now
    #[must_use]
    pub fn after_millis(millis: u64) -> Self {
        Self::At(now_millis().saturating_add(millis))
    }

    /// Whether the expiry lies at or before `now`
    #[must_use]
    pub const fn is_expired_at(self, now: u64) -> bool {
        match self {
            Self::Never => false,
            Self::At(at) => at <= now,
        }
    }

    /// Finite expiration instant, if any
    #[must_use]
    pub const fn instant(self) -> Option<u64> {
        match self {
            Self::Never => None,
            Self::At(at) => Some(at),
        }
    }
}

impl fmt::Display for Expiry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => write!(f, "never"),
            Self::At(at) => write!(f, "{at}"),
        }
    }
}

/// Named pin preventing a replica from being evicted
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StickyRecord {
    /// Owner of the pin; at most one record per owner
    pub owner: String,
    /// When the pin lapses
    pub expire: Expiry,
}

impl StickyRecord {
    /// Owner used for pins placed by the pool itself
    pub const SYSTEM_OWNER: &'static str = "system";

    /// Create a new sticky record
    pub fn new(owner: impl Into<String>, expire: Expiry) -> Self {
        Self {
            owner: owner.into(),
            expire,
        }
    }

    /// Infinite pin owned by the pool itself
    #[must_use]
    pub fn system() -> Self {
        Self::new(Self::SYSTEM_OWNER, Expiry::Never)
    }

    /// Whether the record still pins the replica at `now`
    #[must_use]
    pub const fn is_valid_at(&self, now: u64) -> bool {
        !self.expire.is_expired_at(now)
    }

    /// Whether the record still pins the replica
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(now_millis())
    }
}

/// Retention policy of a file as recorded by the namespace
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum RetentionPolicy {
    /// A copy must exist on the nearline store
    #[display("CUSTODIAL")]
    Custodial,
    /// Output data that may be lost
    #[display("OUTPUT")]
    Output,
    /// Disk-only replica
    #[default]
    #[display("REPLICA")]
    Replica,
}

/// Access latency of a file as recorded by the namespace
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum AccessLatency {
    /// Must stay readable from disk at all times
    #[display("ONLINE")]
    Online,
    /// May be staged on demand
    #[default]
    #[display("NEARLINE")]
    Nearline,
}

/// File attributes persisted in the storage-info file of a replica
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    /// File size in bytes
    pub size: u64,
    /// Storage class (e.g. `exp:raw@osm`)
    pub storage_class: String,
    /// Locations of copies on the nearline store
    pub locations: Vec<String>,
    /// Retention policy
    pub retention_policy: RetentionPolicy,
    /// Access latency
    pub access_latency: AccessLatency,
    /// Checksum in `type:value` form, if known
    pub checksum: Option<String>,
}

impl FileAttributes {
    /// Whether at least one nearline copy is known
    #[must_use]
    pub fn is_stored(&self) -> bool {
        !self.locations.is_empty()
    }

    /// State a complete replica with these attributes should be in
    ///
    /// Custodial files without a nearline copy must not be evicted.
    #[must_use]
    pub fn completed_state(&self) -> ReplicaState {
        if self.retention_policy == RetentionPolicy::Custodial && !self.is_stored() {
            ReplicaState::Precious
        } else {
            ReplicaState::Cached
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_id_normalised() {
        let id = ReplicaId::new("00a1ff").unwrap();
        assert_eq!(id.as_str(), "00A1FF");
        assert_eq!(id, "00A1FF".parse().unwrap());
    }

    #[test]
    fn test_replica_id_validation() {
        assert_eq!(ReplicaId::new(""), Err(ReplicaIdError::Empty));
        assert_eq!(ReplicaId::new("SI-0001"), Err(ReplicaIdError::InvalidChar('S')));
        assert_eq!(
            ReplicaId::new("0001.tmp"),
            Err(ReplicaIdError::InvalidChar('.'))
        );
        assert!(matches!(
            ReplicaId::new("0".repeat(65)),
            Err(ReplicaIdError::TooLong(65))
        ));
    }

    #[test]
    fn test_state_transitions() {
        use ReplicaState::*;

        assert!(New.can_transition_to(Cached));
        assert!(FromClient.can_transition_to(Precious));
        assert!(Precious.can_transition_to(Cached));
        assert!(Broken.can_transition_to(Cached));
        assert!(Cached.can_transition_to(Cached));

        assert!(!Cached.can_transition_to(New));
        assert!(!Cached.can_transition_to(FromClient));
        assert!(!FromStore.can_transition_to(FromClient));
        assert!(!Removed.can_transition_to(Cached));
    }

    #[test]
    fn test_sticky_validity() {
        assert!(StickyRecord::system().is_valid_at(u64::MAX));
        let record = StickyRecord::new("pin", Expiry::At(1000));
        assert!(record.is_valid_at(999));
        assert!(!record.is_valid_at(1000));
        assert!(!record.is_valid_at(2000));
    }

    #[test]
    fn test_completed_state() {
        let mut attrs = FileAttributes {
            retention_policy: RetentionPolicy::Custodial,
            ..Default::default()
        };
        assert_eq!(attrs.completed_state(), ReplicaState::Precious);

        attrs.locations.push("osm://tape/0001".into());
        assert_eq!(attrs.completed_state(), ReplicaState::Cached);

        attrs.retention_policy = RetentionPolicy::Replica;
        attrs.locations.clear();
        assert_eq!(attrs.completed_state(), ReplicaState::Cached);
    }
}
