//! dpool Repository - Pool metadata and recovery engine
//!
//! This crate keeps the per-replica bookkeeping of a storage pool:
//! - Directory layout of control, storage-info and data files
//! - Persisted lifecycle state and sticky records per replica
//! - In-memory replica handles with per-entry locking
//! - Repair of damaged or incomplete replicas against the namespace
//! - Background expiration of time-limited sticky records

pub mod entry;
pub mod healer;
pub mod layout;
pub mod namespace;
mod persist;
pub mod state;
pub mod sticky;
pub mod store;

// Re-exports
pub use entry::{EntrySnapshot, RepositoryEntry, StickyListener};
pub use healer::{EntryHealer, HealerStats};
pub use layout::{DirectoryLayout, ReplicaPaths};
pub use namespace::NamespaceHandle;
pub use state::{ControlRecord, EntryState};
pub use sticky::{StickyExpirationScheduler, StickyStats};
pub use store::{EntryLookup, MetadataStore, MetadataStoreStats};
