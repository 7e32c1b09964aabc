//! Persisted replica state and sticky records
//!
//! An [`EntryState`] owns the control file of one replica. Every mutation is
//! applied to a copy of the record, written through the atomic temp-file
//! routine and only then committed in memory, so the in-memory value never
//! diverges from what a reload would read.

use crate::persist::{BlobFormat, write_atomically};
use dpool_common::{Error, Expiry, ReplicaState, Result, StickyRecord, now_millis};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

const CONTROL_FORMAT: BlobFormat = BlobFormat {
    magic: 0x4450_4354, // "DPCT"
    version: 1,
};

/// Contents of a control file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRecord {
    pub state: ReplicaState,
    pub sticky: Vec<StickyRecord>,
    /// Creation time (unix millis)
    pub created_at: u64,
    /// Replica size in bytes
    pub size: u64,
    /// Set when the replica was recovered from an incomplete transfer
    pub error: bool,
}

impl ControlRecord {
    /// Record of a replica whose write is just beginning
    #[must_use]
    pub fn new_entry() -> Self {
        Self {
            state: ReplicaState::New,
            sticky: Vec::new(),
            created_at: now_millis(),
            size: 0,
            error: false,
        }
    }
}

/// State machine and sticky-record set backed by one control file
#[derive(Debug)]
pub struct EntryState {
    path: PathBuf,
    temp: PathBuf,
    sync: bool,
    record: ControlRecord,
    detached: bool,
}

impl EntryState {
    /// Parse an existing control file
    ///
    /// A missing file surfaces as `NotFound`, a damaged one as `InvalidData`.
    pub fn open(path: &Path, temp: &Path, sync: bool) -> io::Result<Self> {
        let record = CONTROL_FORMAT.read_from(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            temp: temp.to_path_buf(),
            sync,
            record,
            detached: false,
        })
    }

    /// Write a fresh control file with `record`, replacing any existing one
    pub fn create(path: &Path, temp: &Path, sync: bool, record: ControlRecord) -> Result<Self> {
        let state = Self {
            path: path.to_path_buf(),
            temp: temp.to_path_buf(),
            sync,
            record,
            detached: false,
        };
        state.write(&state.record)?;
        Ok(state)
    }

    /// Copy-initialise a new control file from another entry's loaded state
    pub fn copy_from(path: &Path, temp: &Path, sync: bool, other: &Self) -> Result<Self> {
        Self::create(path, temp, sync, other.record.clone())
    }

    pub fn record(&self) -> &ControlRecord {
        &self.record
    }

    pub fn state(&self) -> ReplicaState {
        self.record.state
    }

    /// Change the state, persisting before returning
    pub fn set_state(&mut self, state: ReplicaState) -> Result<()> {
        let current = self.record.state;
        if !current.can_transition_to(state) {
            return Err(Error::IllegalTransition {
                from: current,
                to: state,
            });
        }
        if current == state {
            return Ok(());
        }
        self.update(|record| record.state = state)
    }

    pub fn creation_time(&self) -> u64 {
        self.record.created_at
    }

    pub fn size(&self) -> u64 {
        self.record.size
    }

    pub fn set_size(&mut self, size: u64) -> Result<()> {
        if self.record.size == size {
            return Ok(());
        }
        self.update(|record| record.size = size)
    }

    pub fn has_error(&self) -> bool {
        self.record.error
    }

    /// Whether any sticky record still pins the replica
    pub fn is_sticky(&self) -> bool {
        let now = now_millis();
        self.record.sticky.iter().any(|r| r.is_valid_at(now))
    }

    /// Snapshot of the sticky records
    pub fn sticky_records(&self) -> Vec<StickyRecord> {
        self.record.sticky.clone()
    }

    /// Add, replace or drop the sticky record of `owner`
    ///
    /// Without `overwrite`, an unexpired record of the same owner refuses the
    /// call. An expiry that already lies in the past removes the owner's
    /// record. Returns whether the call was accepted.
    pub fn set_sticky(&mut self, owner: &str, expire: Expiry, overwrite: bool) -> Result<bool> {
        let now = now_millis();
        let existing = self.record.sticky.iter().position(|r| r.owner == owner);

        if let Some(pos) = existing {
            if !overwrite && self.record.sticky[pos].is_valid_at(now) {
                return Ok(false);
            }
            if self.record.sticky[pos].expire == expire {
                return Ok(true);
            }
        }

        let unpin = expire.is_expired_at(now);
        if unpin && existing.is_none() {
            return Ok(true);
        }

        self.update(|record| {
            record.sticky.retain(|r| r.owner != owner);
            if !unpin {
                record.sticky.push(StickyRecord::new(owner, expire));
            }
        })?;
        Ok(true)
    }

    /// Drop every record whose expiry has passed and return the dropped ones
    pub fn remove_expired_sticky_flags(&mut self) -> Result<Vec<StickyRecord>> {
        let now = now_millis();
        let (expired, kept): (Vec<_>, Vec<_>) = self
            .record
            .sticky
            .iter()
            .cloned()
            .partition(|r| r.expire.is_expired_at(now));

        if expired.is_empty() {
            return Ok(expired);
        }
        self.update(|record| record.sticky = kept)?;
        Ok(expired)
    }

    /// Mark the state as removed after its files were deleted
    ///
    /// Nothing is written; later mutations fail instead of resurrecting the
    /// control file.
    pub(crate) fn detach(&mut self) {
        self.record.state = ReplicaState::Removed;
        self.detached = true;
    }

    /// Fail if the entry's files were removed
    pub(crate) fn ensure_attached(&self) -> Result<()> {
        if self.detached {
            return Err(Error::illegal_state(format!(
                "control file {} belongs to a removed entry",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn update<F>(&mut self, change: F) -> Result<()>
    where
        F: FnOnce(&mut ControlRecord),
    {
        self.ensure_attached()?;
        let mut record = self.record.clone();
        change(&mut record);
        self.write(&record)?;
        self.record = record;
        Ok(())
    }

    fn write(&self, record: &ControlRecord) -> Result<()> {
        let context = || format!("failed to write control file {}", self.path.display());
        let data = CONTROL_FORMAT
            .encode(record)
            .map_err(|e| Error::io(context(), e))?;
        write_atomically(&self.path, &self.temp, &data, self.sync)
            .map_err(|e| Error::io(context(), e))
    }
}
