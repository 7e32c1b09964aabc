//! On-disk layout of a pool repository
//!
//! ```text
//! <base>/control/<id>               state + sticky records
//! <base>/control/SI-<id>            storage info (existence marker)
//! <base>/data/<id>                  replica content
//! <base>/control/.repository_is_ok  liveness marker
//! ```
//!
//! Temp files written during atomic updates carry a `.tmp` suffix and are
//! never reported as replicas.

use crate::persist::remove_if_exists;
use dpool_common::{Error, ReplicaId, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Name of the control directory under the pool base
pub const CONTROL_DIR: &str = "control";
/// Name of the data directory under the pool base
pub const DATA_DIR: &str = "data";
/// File name prefix of storage-info files
pub const STORAGE_INFO_PREFIX: &str = "SI-";
/// Suffix of temp files used for atomic writes
pub const TEMP_SUFFIX: &str = ".tmp";
/// Name of the liveness marker in the control directory
pub const OK_MARKER: &str = ".repository_is_ok";

/// All paths belonging to one replica
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaPaths {
    pub data: PathBuf,
    pub control: PathBuf,
    pub control_temp: PathBuf,
    pub storage_info: PathBuf,
    pub storage_info_temp: PathBuf,
}

/// Maps replica ids to file paths below a pool base directory
#[derive(Clone, Debug)]
pub struct DirectoryLayout {
    base: PathBuf,
    control: PathBuf,
    data: PathBuf,
}

impl DirectoryLayout {
    /// Open the layout of an existing pool
    ///
    /// Fails if the base, control or data directory is missing or is not a
    /// directory.
    pub fn open(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        let control = base.join(CONTROL_DIR);
        let data = base.join(DATA_DIR);

        check_dir(&base)?;
        check_dir(&control)?;
        check_dir(&data)?;

        Ok(Self {
            base,
            control,
            data,
        })
    }

    /// Create the directory tree of a fresh pool (idempotent) and open it
    pub fn create(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref();
        for dir in [base.join(CONTROL_DIR), base.join(DATA_DIR)] {
            fs::create_dir_all(&dir).map_err(|e| {
                Error::io(format!("failed to create directory {}", dir.display()), e)
            })?;
        }
        Self::open(base)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn control_dir(&self) -> &Path {
        &self.control
    }

    pub fn data_dir(&self) -> &Path {
        &self.data
    }

    /// Path of the replica content
    pub fn data_file_for(&self, id: &ReplicaId) -> PathBuf {
        self.data.join(id.as_str())
    }

    /// Path of the control file holding state and sticky records
    pub fn control_file_for(&self, id: &ReplicaId) -> PathBuf {
        self.control.join(id.as_str())
    }

    /// Path of the storage-info file
    pub fn storage_info_file_for(&self, id: &ReplicaId) -> PathBuf {
        self.control
            .join(format!("{STORAGE_INFO_PREFIX}{}", id.as_str()))
    }

    pub fn control_temp_file_for(&self, id: &ReplicaId) -> PathBuf {
        self.control.join(format!("{}{TEMP_SUFFIX}", id.as_str()))
    }

    pub fn storage_info_temp_file_for(&self, id: &ReplicaId) -> PathBuf {
        self.control
            .join(format!("{STORAGE_INFO_PREFIX}{}{TEMP_SUFFIX}", id.as_str()))
    }

    /// All paths of a replica
    pub fn paths_for(&self, id: &ReplicaId) -> ReplicaPaths {
        ReplicaPaths {
            data: self.data_file_for(id),
            control: self.control_file_for(id),
            control_temp: self.control_temp_file_for(id),
            storage_info: self.storage_info_file_for(id),
            storage_info_temp: self.storage_info_temp_file_for(id),
        }
    }

    /// Path of the liveness marker
    pub fn marker_file(&self) -> PathBuf {
        self.control.join(OK_MARKER)
    }

    /// Replica ids observable from file names in the data directory
    pub fn list(&self) -> Result<BTreeSet<ReplicaId>> {
        scan_ids(&self.data, |name| Some(name))
    }

    /// Replica ids with a storage-info file
    pub(crate) fn storage_info_ids(&self) -> Result<BTreeSet<ReplicaId>> {
        scan_ids(&self.control, |name| name.strip_prefix(STORAGE_INFO_PREFIX))
    }

    /// Best-effort removal of every file belonging to a replica
    ///
    /// Missing files are not errors; other failures are logged and skipped.
    pub fn destroy(&self, id: &ReplicaId) {
        let paths = self.paths_for(id);
        for path in [
            &paths.data,
            &paths.storage_info,
            &paths.storage_info_temp,
            &paths.control,
            &paths.control_temp,
        ] {
            if let Err(e) = remove_if_exists(path) {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
        debug!("Destroyed replica {}", id);
    }
}

fn check_dir(path: &Path) -> Result<()> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(Error::NotADirectory(path.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::DirectoryNotFound(path.to_path_buf()))
        }
        Err(e) => Err(Error::io(format!("failed to stat {}", path.display()), e)),
    }
}

/// Collect replica ids from the file names of `dir`
///
/// `extract` maps a file name to the candidate id part; temp files and names
/// that are not valid ids are skipped.
fn scan_ids<F>(dir: &Path, extract: F) -> Result<BTreeSet<ReplicaId>>
where
    F: for<'a> Fn(&'a str) -> Option<&'a str>,
{
    let entries = fs::read_dir(dir)
        .map_err(|e| Error::io(format!("failed to list {}", dir.display()), e))?;

    let mut ids = BTreeSet::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| Error::io(format!("failed to list {}", dir.display()), e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.ends_with(TEMP_SUFFIX) {
            continue;
        }
        if let Some(id) = extract(name).and_then(|candidate| ReplicaId::new(candidate).ok()) {
            ids.insert(id);
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn id(s: &str) -> ReplicaId {
        ReplicaId::new(s).unwrap()
    }

    #[test]
    fn test_open_requires_directories() {
        let dir = tempdir().unwrap();

        assert!(matches!(
            DirectoryLayout::open(dir.path()),
            Err(Error::DirectoryNotFound(_))
        ));

        fs::create_dir(dir.path().join(CONTROL_DIR)).unwrap();
        fs::write(dir.path().join(DATA_DIR), b"not a dir").unwrap();
        assert!(matches!(
            DirectoryLayout::open(dir.path()),
            Err(Error::NotADirectory(_))
        ));
    }

    #[test]
    fn test_path_derivation() {
        let dir = tempdir().unwrap();
        let layout = DirectoryLayout::create(dir.path()).unwrap();
        let id = id("00ab");

        assert_eq!(layout.data_file_for(&id), dir.path().join("data/00AB"));
        assert_eq!(layout.control_file_for(&id), dir.path().join("control/00AB"));
        assert_eq!(
            layout.storage_info_file_for(&id),
            dir.path().join("control/SI-00AB")
        );
        assert_eq!(
            layout.storage_info_temp_file_for(&id),
            dir.path().join("control/SI-00AB.tmp")
        );
    }

    #[test]
    fn test_list_and_storage_info_ids() {
        let dir = tempdir().unwrap();
        let layout = DirectoryLayout::create(dir.path()).unwrap();

        fs::write(layout.data_file_for(&id("01")), b"x").unwrap();
        fs::write(layout.data_file_for(&id("02")), b"x").unwrap();
        fs::write(layout.data_dir().join("garbage.txt"), b"x").unwrap();

        fs::write(layout.storage_info_file_for(&id("02")), b"x").unwrap();
        fs::write(layout.storage_info_temp_file_for(&id("03")), b"x").unwrap();
        fs::write(layout.control_file_for(&id("04")), b"x").unwrap();
        fs::write(layout.marker_file(), b"").unwrap();

        let listed: Vec<_> = layout.list().unwrap().into_iter().collect();
        assert_eq!(listed, vec![id("01"), id("02")]);

        let indexed: Vec<_> = layout.storage_info_ids().unwrap().into_iter().collect();
        assert_eq!(indexed, vec![id("02")]);
    }

    #[test]
    fn test_destroy_is_best_effort() {
        let dir = tempdir().unwrap();
        let layout = DirectoryLayout::create(dir.path()).unwrap();
        let id = id("0A");

        fs::write(layout.data_file_for(&id), b"data").unwrap();
        fs::write(layout.storage_info_file_for(&id), b"si").unwrap();

        layout.destroy(&id);
        layout.destroy(&id);

        assert!(!layout.data_file_for(&id).exists());
        assert!(!layout.storage_info_file_for(&id).exists());
        assert!(!layout.control_file_for(&id).exists());
    }
}
