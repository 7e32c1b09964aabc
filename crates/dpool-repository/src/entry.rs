//! In-memory handle of one replica
//!
//! A [`RepositoryEntry`] combines the persisted [`EntryState`] with the
//! storage info, the link count and the access time of the data file. All
//! accessors take the entry's own lock, so at most one mutation per replica
//! is in flight while different replicas never contend.

use crate::layout::ReplicaPaths;
use crate::persist::{BlobFormat, remove_if_exists, write_atomically};
use crate::state::{ControlRecord, EntryState};
use dpool_common::{
    Error, Expiry, FileAttributes, ReplicaId, ReplicaState, Result, StickyRecord, now_millis,
};
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const STORAGE_INFO_FORMAT: BlobFormat = BlobFormat {
    magic: 0x4450_5349, // "DPSI"
    version: 1,
};

/// Observer of sticky records accepted by an entry
pub trait StickyListener: Send + Sync {
    fn sticky_added(&self, id: &ReplicaId, record: &StickyRecord);
}

/// Reasons an entry fails to load from disk
#[derive(Debug, thiserror::Error)]
pub(crate) enum LoadError {
    #[error("control file missing or unreadable")]
    StateNotFound,

    #[error("storage info missing or unreadable")]
    StorageInfoCorrupted,

    #[error(
        "size mismatch: storage info records {recorded} bytes, control file {control} bytes, data file holds {actual} bytes"
    )]
    SizeMismatch {
        recorded: u64,
        control: u64,
        actual: u64,
    },

    #[error("incomplete transfer from client")]
    PartialFromClient,

    #[error("incomplete transfer from nearline store")]
    PartialFromStore,

    #[error("data file missing")]
    DataFileMissing,

    #[error("interrupted removal")]
    RemovedLeftover,

    #[error(transparent)]
    Io(Error),
}

/// Consistent copy of an entry's bookkeeping
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub id: ReplicaId,
    pub state: ReplicaState,
    pub size: u64,
    pub link_count: u32,
    pub creation_time: u64,
    pub last_access_time: u64,
    pub attributes: Option<FileAttributes>,
    pub sticky: Vec<StickyRecord>,
    pub error: bool,
}

struct EntryInner {
    state: EntryState,
    link_count: u32,
    last_access: u64,
    attributes: Option<FileAttributes>,
}

/// Handle of one replica held by the pool
pub struct RepositoryEntry {
    id: ReplicaId,
    paths: ReplicaPaths,
    sync: bool,
    inner: Mutex<EntryInner>,
    listener: Option<Arc<dyn StickyListener>>,
}

impl RepositoryEntry {
    /// Create an entry with a fresh control file and no storage info
    pub(crate) fn create(
        id: ReplicaId,
        paths: ReplicaPaths,
        sync: bool,
        record: ControlRecord,
        listener: Option<Arc<dyn StickyListener>>,
    ) -> Result<Self> {
        let state = EntryState::create(&paths.control, &paths.control_temp, sync, record)?;
        let last_access = state.creation_time();
        Ok(Self {
            id,
            paths,
            sync,
            inner: Mutex::new(EntryInner {
                state,
                link_count: 0,
                last_access,
                attributes: None,
            }),
            listener,
        })
    }

    /// Create an entry whose bookkeeping is copied from `template`
    pub(crate) fn copy_of(
        id: ReplicaId,
        paths: ReplicaPaths,
        sync: bool,
        template: &Self,
        listener: Option<Arc<dyn StickyListener>>,
    ) -> Result<Self> {
        let source = template.inner.lock();
        // Storage info last: it marks the replica as existing
        let state =
            EntryState::copy_from(&paths.control, &paths.control_temp, sync, &source.state)?;
        if let Some(attrs) = &source.attributes {
            write_storage_info(&paths, attrs, sync)?;
        }

        Ok(Self {
            id,
            paths,
            sync,
            inner: Mutex::new(EntryInner {
                state,
                link_count: source.link_count,
                last_access: source.last_access,
                attributes: source.attributes.clone(),
            }),
            listener,
        })
    }

    /// Load an entry from its files
    ///
    /// Checks run in a fixed order: control file, lifecycle state, storage
    /// info, data file, sizes. The first failing check is reported.
    pub(crate) fn load(
        id: ReplicaId,
        paths: ReplicaPaths,
        sync: bool,
        listener: Option<Arc<dyn StickyListener>>,
    ) -> std::result::Result<Self, LoadError> {
        let state = match EntryState::open(&paths.control, &paths.control_temp, sync) {
            Ok(state) => state,
            Err(e) if is_missing_or_corrupt(&e) => return Err(LoadError::StateNotFound),
            Err(e) => {
                return Err(LoadError::Io(Error::io(
                    format!("failed to read control file {}", paths.control.display()),
                    e,
                )));
            }
        };

        match state.state() {
            ReplicaState::New | ReplicaState::FromClient => {
                return Err(LoadError::PartialFromClient);
            }
            ReplicaState::FromStore => return Err(LoadError::PartialFromStore),
            ReplicaState::Removed => return Err(LoadError::RemovedLeftover),
            ReplicaState::Cached | ReplicaState::Precious | ReplicaState::Broken => {}
        }

        let attributes = match read_storage_info(&paths.storage_info) {
            Ok(attrs) => attrs,
            Err(e) if is_missing_or_corrupt(&e) => return Err(LoadError::StorageInfoCorrupted),
            Err(e) => {
                return Err(LoadError::Io(Error::io(
                    format!("failed to read storage info {}", paths.storage_info.display()),
                    e,
                )));
            }
        };

        let meta = match fs::metadata(&paths.data) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(LoadError::DataFileMissing),
            Err(e) => {
                return Err(LoadError::Io(Error::io(
                    format!("failed to stat data file {}", paths.data.display()),
                    e,
                )));
            }
        };

        let actual = meta.len();
        if attributes.size != actual || state.size() != actual {
            return Err(LoadError::SizeMismatch {
                recorded: attributes.size,
                control: state.size(),
                actual,
            });
        }

        let last_access = meta
            .modified()
            .map_or_else(|_| state.creation_time(), to_millis);

        Ok(Self {
            id,
            paths,
            sync,
            inner: Mutex::new(EntryInner {
                state,
                link_count: 0,
                last_access,
                attributes: Some(attributes),
            }),
            listener,
        })
    }

    pub fn id(&self) -> &ReplicaId {
        &self.id
    }

    /// Path of the replica content
    pub fn data_file(&self) -> &Path {
        &self.paths.data
    }

    pub fn state(&self) -> ReplicaState {
        self.inner.lock().state.state()
    }

    /// Change the lifecycle state; durable before returning
    pub fn set_state(&self, state: ReplicaState) -> Result<()> {
        self.inner.lock().state.set_state(state)
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().state.size()
    }

    /// Record the replica size; negative sizes are rejected
    pub fn set_size(&self, size: i64) -> Result<()> {
        let size = u64::try_from(size)
            .map_err(|_| Error::invalid_argument(format!("negative size: {size}")))?;
        self.inner.lock().state.set_size(size)
    }

    pub fn creation_time(&self) -> u64 {
        self.inner.lock().state.creation_time()
    }

    pub fn last_access_time(&self) -> u64 {
        self.inner.lock().last_access
    }

    /// Create the data file if needed and mark the replica as just accessed
    pub fn touch(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state.ensure_attached()?;
        let context = || format!("failed to touch {}", self.paths.data.display());

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.paths.data)
            .map_err(|e| Error::io(context(), e))?;
        let now = SystemTime::now();
        file.set_modified(now).map_err(|e| Error::io(context(), e))?;

        inner.last_access = to_millis(now);
        Ok(())
    }

    pub fn file_attributes(&self) -> Option<FileAttributes> {
        self.inner.lock().attributes.clone()
    }

    /// Persist new storage info atomically, or remove it with `None`
    pub fn set_file_attributes(&self, attributes: Option<FileAttributes>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state.ensure_attached()?;
        match &attributes {
            Some(attrs) => write_storage_info(&self.paths, attrs, self.sync)?,
            None => {
                remove_if_exists(&self.paths.storage_info).map_err(|e| {
                    Error::io(
                        format!(
                            "failed to remove storage info {}",
                            self.paths.storage_info.display()
                        ),
                        e,
                    )
                })?;
            }
        }
        inner.attributes = attributes;
        Ok(())
    }

    pub fn link_count(&self) -> u32 {
        self.inner.lock().link_count
    }

    /// Register one more user of the replica; returns the new count
    pub fn increment_link_count(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.link_count = inner.link_count.saturating_add(1);
        inner.link_count
    }

    /// Release one user of the replica; returns the new count
    pub fn decrement_link_count(&self) -> Result<u32> {
        let mut inner = self.inner.lock();
        inner.link_count = inner.link_count.checked_sub(1).ok_or_else(|| {
            Error::illegal_state(format!("link count of {} is already zero", self.id))
        })?;
        Ok(inner.link_count)
    }

    pub fn is_sticky(&self) -> bool {
        self.inner.lock().state.is_sticky()
    }

    pub fn sticky_records(&self) -> Vec<StickyRecord> {
        self.inner.lock().state.sticky_records()
    }

    /// Pin or unpin the replica on behalf of `owner`
    ///
    /// See [`EntryState::set_sticky`] for the refusal rule.
    pub fn set_sticky(&self, owner: &str, expire: Expiry, overwrite: bool) -> Result<bool> {
        let accepted = self
            .inner
            .lock()
            .state
            .set_sticky(owner, expire, overwrite)?;

        if accepted && expire.instant().is_some() {
            if let Some(listener) = &self.listener {
                listener.sticky_added(&self.id, &StickyRecord::new(owner, expire));
            }
        }
        Ok(accepted)
    }

    pub fn remove_expired_sticky_flags(&self) -> Result<Vec<StickyRecord>> {
        self.inner.lock().state.remove_expired_sticky_flags()
    }

    /// Whether the replica was recovered from an incomplete transfer
    pub fn has_error(&self) -> bool {
        self.inner.lock().state.has_error()
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        let inner = self.inner.lock();
        let record = inner.state.record();
        EntrySnapshot {
            id: self.id.clone(),
            state: record.state,
            size: record.size,
            link_count: inner.link_count,
            creation_time: record.created_at,
            last_access_time: inner.last_access,
            attributes: inner.attributes.clone(),
            sticky: record.sticky.clone(),
            error: record.error,
        }
    }

    /// Detach the handle after its files were removed from disk
    pub(crate) fn mark_removed(&self) {
        self.inner.lock().state.detach();
    }
}

impl std::fmt::Debug for RepositoryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryEntry")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Atomically replace the storage-info file of a replica
pub(crate) fn write_storage_info(
    paths: &ReplicaPaths,
    attrs: &FileAttributes,
    sync: bool,
) -> Result<()> {
    let context = || {
        format!(
            "failed to write storage info {}",
            paths.storage_info.display()
        )
    };
    let data = STORAGE_INFO_FORMAT
        .encode(attrs)
        .map_err(|e| Error::io(context(), e))?;
    write_atomically(&paths.storage_info, &paths.storage_info_temp, &data, sync)
        .map_err(|e| Error::io(context(), e))
}

pub(crate) fn read_storage_info(path: &Path) -> io::Result<FileAttributes> {
    STORAGE_INFO_FORMAT.read_from(path)
}

fn is_missing_or_corrupt(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::NotFound | ErrorKind::InvalidData | ErrorKind::UnexpectedEof
    )
}

fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map_or_else(|_| now_millis(), |d| d.as_millis() as u64)
}
