//! Repair of replicas that fail to load
//!
//! Each load failure maps to one repair action:
//!
//! | Condition                      | Action                                        |
//! |--------------------------------|-----------------------------------------------|
//! | control file missing/corrupt   | rebuild state from namespace attributes       |
//! | storage info missing/corrupt   | refetch attributes, fix sizes, rewrite        |
//! | size mismatch                  | refetch attributes, fix sizes, rewrite        |
//! | partial write from client      | keep data as CACHED + system pin + error flag |
//! | partial write from store       | destroy, the nearline copy is authoritative   |
//! | data file missing              | destroy                                       |
//! | interrupted removal            | destroy                                       |
//!
//! Repairs are idempotent, so a crash in the middle of one is healed by
//! running it again. Attempts per load are bounded; once exhausted the entry
//! is reported as unloadable.

use crate::entry::{LoadError, RepositoryEntry, StickyListener, write_storage_info};
use crate::layout::{DirectoryLayout, ReplicaPaths};
use crate::namespace::NamespaceHandle;
use crate::persist::remove_if_exists;
use crate::state::{ControlRecord, EntryState};
use crate::store::EntryLookup;
use dpool_common::{
    AccessLatency, Error, ReplicaId, ReplicaState, RepositoryConfig, Result,
    StickyRecord, now_millis,
};
use std::fs;
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;
use tracing::{debug, debug_span, info, warn};

/// Healer statistics
#[derive(Debug, Default)]
pub struct HealerStats {
    /// Repair actions performed
    pub repairs: AtomicU64,
    /// Replicas whose files were deleted
    pub destroyed: AtomicU64,
    /// Loads given up on
    pub unrecoverable: AtomicU64,
}

/// Outcome of one repair action
enum Repair {
    /// Files were fixed; load again
    Retry,
    /// Replica files were deleted
    Destroyed,
}

/// Reconciles unloadable entries with the namespace
pub struct EntryHealer {
    namespace: Arc<dyn NamespaceHandle>,
    max_repair_attempts: usize,
    sync: bool,
    stats: HealerStats,
}

impl EntryHealer {
    pub fn new(namespace: Arc<dyn NamespaceHandle>, config: &RepositoryConfig) -> Self {
        Self {
            namespace,
            max_repair_attempts: config.max_repair_attempts,
            sync: config.sync_writes,
            stats: HealerStats::default(),
        }
    }

    pub fn stats(&self) -> &HealerStats {
        &self.stats
    }

    /// Load `id`, repairing its files where possible
    ///
    /// Namespace failures other than `NotFound` and I/O failures while
    /// repairing are returned as errors; a `NotFound` from the namespace
    /// means the replica is an orphan and its files are destroyed.
    pub(crate) fn load(
        &self,
        layout: &DirectoryLayout,
        id: &ReplicaId,
        listener: Option<&Arc<dyn StickyListener>>,
    ) -> Result<EntryLookup> {
        let _span = debug_span!("load", replica = %id).entered();
        let paths = layout.paths_for(id);
        let mut repairs = 0;

        loop {
            let condition =
                match RepositoryEntry::load(id.clone(), paths.clone(), self.sync, listener.cloned())
                {
                    Ok(entry) => return Ok(EntryLookup::Found(Arc::new(entry))),
                    Err(LoadError::Io(e)) => {
                        warn!("Failed to load {}: {}", id, e);
                        self.stats.unrecoverable.fetch_add(1, Ordering::Relaxed);
                        return Ok(EntryLookup::Unloadable(e.to_string()));
                    }
                    Err(condition) => condition,
                };

            if repairs >= self.max_repair_attempts {
                warn!(
                    "Giving up on {} after {} repair attempts: {}",
                    id, repairs, condition
                );
                self.stats.unrecoverable.fetch_add(1, Ordering::Relaxed);
                return Ok(EntryLookup::Unloadable(format!(
                    "{condition} (after {repairs} repair attempts)"
                )));
            }
            repairs += 1;
            self.stats.repairs.fetch_add(1, Ordering::Relaxed);
            info!("Repairing {}: {}", id, condition);

            match self.repair(layout, id, &paths, &condition) {
                Ok(Repair::Retry) => {}
                Ok(Repair::Destroyed) => return Ok(EntryLookup::NotFound),
                Err(e) if e.is_namespace_not_found() => {
                    warn!("{} no longer exists in the namespace; removing replica", id);
                    self.destroy(layout, id);
                    return Ok(EntryLookup::NotFound);
                }
                Err(e) => {
                    warn!("Failed to repair {}: {}", id, e);
                    return Err(e);
                }
            }
        }
    }

    fn repair(
        &self,
        layout: &DirectoryLayout,
        id: &ReplicaId,
        paths: &ReplicaPaths,
        condition: &LoadError,
    ) -> Result<Repair> {
        match condition {
            LoadError::StateNotFound => self.rebuild_control(layout, id, paths),
            LoadError::StorageInfoCorrupted | LoadError::SizeMismatch { .. } => {
                self.rebuild_storage_info(layout, id, paths)
            }
            LoadError::PartialFromClient => self.recover_client_upload(id, paths),
            LoadError::PartialFromStore => {
                info!("Removing incomplete stage of {}", id);
                self.destroy(layout, id);
                Ok(Repair::Destroyed)
            }
            LoadError::DataFileMissing => {
                warn!("Data file of {} is missing; removing replica", id);
                self.destroy(layout, id);
                Ok(Repair::Destroyed)
            }
            LoadError::RemovedLeftover => {
                debug!("Finishing interrupted removal of {}", id);
                self.destroy(layout, id);
                Ok(Repair::Destroyed)
            }
            LoadError::Io(e) => Err(Error::illegal_state(format!("not repairable: {e}"))),
        }
    }

    /// Recreate a lost control file from namespace attributes
    fn rebuild_control(
        &self,
        layout: &DirectoryLayout,
        id: &ReplicaId,
        paths: &ReplicaPaths,
    ) -> Result<Repair> {
        let attrs = self.namespace.get_attributes(id)?;
        let Some(data) = data_file_info(paths)? else {
            warn!("Data file of {} is missing; removing replica", id);
            self.destroy(layout, id);
            return Ok(Repair::Destroyed);
        };

        let mut sticky = Vec::new();
        if attrs.access_latency == AccessLatency::Online {
            sticky.push(StickyRecord::system());
        }
        let record = ControlRecord {
            state: attrs.completed_state(),
            sticky,
            created_at: data.modified,
            size: data.len,
            error: false,
        };

        info!("Recovering state of {} as {}", id, record.state);
        EntryState::create(&paths.control, &paths.control_temp, self.sync, record)?;
        Ok(Repair::Retry)
    }

    /// Replace damaged storage info with namespace attributes
    ///
    /// The old file stays in place until the namespace has answered, so an
    /// unreachable namespace leaves the replica indexed.
    fn rebuild_storage_info(
        &self,
        layout: &DirectoryLayout,
        id: &ReplicaId,
        paths: &ReplicaPaths,
    ) -> Result<Repair> {
        let mut attrs = self.namespace.get_attributes(id)?;
        remove_storage_info(paths)?;

        let Some(data) = data_file_info(paths)? else {
            warn!("Data file of {} is missing; removing replica", id);
            self.destroy(layout, id);
            return Ok(Repair::Destroyed);
        };

        if attrs.size != data.len {
            warn!(
                "Namespace records {} bytes for {} but the data file holds {}; correcting namespace",
                attrs.size, id, data.len
            );
            self.namespace.set_size(id, data.len)?;
            attrs.size = data.len;
        }

        write_storage_info(paths, &attrs, self.sync)?;
        self.fix_control_size(paths, data.len)?;
        Ok(Repair::Retry)
    }

    /// Keep the data of an interrupted client upload
    ///
    /// The replica becomes CACHED, pinned by the system and flagged with an
    /// error so that an operator can decide what to do with it.
    fn recover_client_upload(&self, id: &ReplicaId, paths: &ReplicaPaths) -> Result<Repair> {
        let mut attrs = self.namespace.get_attributes(id)?;

        let len = match data_file_info(paths)? {
            Some(data) => data.len,
            None => {
                fs::File::create(&paths.data).map_err(|e| {
                    Error::io(format!("failed to create {}", paths.data.display()), e)
                })?;
                0
            }
        };

        self.namespace.add_cache_location(id)?;

        attrs.size = len;
        write_storage_info(paths, &attrs, self.sync)?;

        let created_at = EntryState::open(&paths.control, &paths.control_temp, self.sync)
            .map_or_else(|_| now_millis(), |state| state.creation_time());
        let record = ControlRecord {
            state: ReplicaState::Cached,
            sticky: vec![StickyRecord::system()],
            created_at,
            size: len,
            error: true,
        };
        EntryState::create(&paths.control, &paths.control_temp, self.sync, record)?;

        warn!(
            "Recovered incomplete upload of {} ({} bytes); marked as pinned with error",
            id, len
        );
        Ok(Repair::Retry)
    }

    /// Align the size in an existing control file with the data file
    fn fix_control_size(&self, paths: &ReplicaPaths, len: u64) -> Result<()> {
        match EntryState::open(&paths.control, &paths.control_temp, self.sync) {
            Ok(mut state) => state.set_size(len),
            // A broken control file is repaired by its own attempt
            Err(_) => Ok(()),
        }
    }

    fn destroy(&self, layout: &DirectoryLayout, id: &ReplicaId) {
        layout.destroy(id);
        self.stats.destroyed.fetch_add(1, Ordering::Relaxed);
    }
}

struct DataFileInfo {
    len: u64,
    modified: u64,
}

fn data_file_info(paths: &ReplicaPaths) -> Result<Option<DataFileInfo>> {
    match fs::metadata(&paths.data) {
        Ok(meta) => {
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or_else(now_millis, |d| d.as_millis() as u64);
            Ok(Some(DataFileInfo {
                len: meta.len(),
                modified,
            }))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io(
            format!("failed to stat data file {}", paths.data.display()),
            e,
        )),
    }
}

fn remove_storage_info(paths: &ReplicaPaths) -> Result<()> {
    remove_if_exists(&paths.storage_info).map_err(|e| {
        Error::io(
            format!("failed to remove storage info {}", paths.storage_info.display()),
            e,
        )
    })?;
    Ok(())
}
