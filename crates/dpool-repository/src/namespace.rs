//! Boundary to the authoritative namespace service
//!
//! The healer reconciles local bookkeeping against the namespace through
//! this trait. Calls may block for as long as the implementation's own
//! contract allows.

use dpool_common::{FileAttributes, NamespaceError, ReplicaId};

/// Handle to the namespace service
pub trait NamespaceHandle: Send + Sync {
    /// Fetch the current attributes of a file
    fn get_attributes(&self, id: &ReplicaId) -> Result<FileAttributes, NamespaceError>;

    /// Correct the size recorded for a file
    fn set_size(&self, id: &ReplicaId, size: u64) -> Result<(), NamespaceError>;

    /// Register this pool as holding a replica of the file
    fn add_cache_location(&self, id: &ReplicaId) -> Result<(), NamespaceError>;
}
