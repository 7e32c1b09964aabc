//! Pool-wide metadata store
//!
//! The store owns the directory layout, the healer and the sticky
//! expiration scheduler. Loaded entries are cached in a concurrent map so
//! that every caller of [`MetadataStore::get`] shares one handle per replica;
//! first loads of the same replica are serialised by a striped lock.

use crate::entry::{RepositoryEntry, StickyListener};
use crate::healer::EntryHealer;
use crate::layout::DirectoryLayout;
use crate::namespace::NamespaceHandle;
use crate::persist::remove_if_exists;
use crate::state::ControlRecord;
use crate::sticky::{EntryMap, StickyExpirationScheduler};
use dpool_common::{Error, ReplicaId, RepositoryConfig, Result};
use dashmap::DashMap;
use nix::sys::statvfs::{Statvfs, statvfs};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File};
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

const LOAD_LOCK_STRIPES: u64 = 64;

/// Result of looking up a replica
#[derive(Clone, Debug)]
pub enum EntryLookup {
    /// No replica with this id exists in the pool
    NotFound,
    /// Files exist but could not be loaded or repaired
    Unloadable(String),
    /// The replica was loaded, possibly after repair
    Found(Arc<RepositoryEntry>),
}

impl EntryLookup {
    #[must_use]
    pub fn found(self) -> Option<Arc<RepositoryEntry>> {
        match self {
            Self::Found(entry) => Some(entry),
            Self::NotFound | Self::Unloadable(_) => None,
        }
    }

    #[must_use]
    pub const fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

#[derive(Debug, Default)]
struct StoreCounters {
    loads: AtomicU64,
    cache_hits: AtomicU64,
    created: AtomicU64,
    removed: AtomicU64,
}

/// Metadata store statistics
#[derive(Debug, Clone, Default)]
pub struct MetadataStoreStats {
    /// Entries currently loaded
    pub loaded_entries: usize,
    /// Loads from disk
    pub loads: u64,
    /// Lookups answered from the loaded entries
    pub cache_hits: u64,
    /// Entries created
    pub created: u64,
    /// Entries removed
    pub removed: u64,
    /// Repair actions performed by the healer
    pub repairs: u64,
    /// Replicas destroyed by the healer
    pub destroyed: u64,
    /// Loads given up on
    pub unrecoverable: u64,
    /// Sticky expirations waiting for their deadline
    pub sticky_pending: usize,
    /// Sticky records removed on expiry
    pub sticky_expired: u64,
}

/// Metadata store of one pool
pub struct MetadataStore {
    layout: DirectoryLayout,
    config: RepositoryConfig,
    healer: EntryHealer,
    entries: Arc<EntryMap>,
    load_locks: Vec<Mutex<()>>,
    probe_lock: Mutex<()>,
    sticky: Option<Arc<StickyExpirationScheduler>>,
    counters: StoreCounters,
}

impl MetadataStore {
    /// Open the store of an existing pool directory
    pub fn open(config: RepositoryConfig, namespace: Arc<dyn NamespaceHandle>) -> Result<Self> {
        let layout = DirectoryLayout::open(&config.base_dir)?;
        Self::with_layout(layout, config, namespace)
    }

    /// Open the store, creating the pool directories when missing
    pub fn init(config: RepositoryConfig, namespace: Arc<dyn NamespaceHandle>) -> Result<Self> {
        let layout = DirectoryLayout::create(&config.base_dir)?;
        Self::with_layout(layout, config, namespace)
    }

    fn with_layout(
        layout: DirectoryLayout,
        config: RepositoryConfig,
        namespace: Arc<dyn NamespaceHandle>,
    ) -> Result<Self> {
        let entries: Arc<EntryMap> = Arc::new(DashMap::new());
        let sticky = if config.sticky.enabled {
            Some(StickyExpirationScheduler::start(
                Arc::downgrade(&entries),
                &config.sticky,
            )?)
        } else {
            None
        };

        let store = Self {
            healer: EntryHealer::new(namespace, &config),
            layout,
            config,
            entries,
            load_locks: (0..LOAD_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            probe_lock: Mutex::new(()),
            sticky,
            counters: StoreCounters::default(),
        };

        info!("Opened pool metadata store at {:?}", store.layout.base_dir());
        Ok(store)
    }

    pub fn layout(&self) -> &DirectoryLayout {
        &self.layout
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// Ids of all replicas with a storage-info file
    pub fn index(&self) -> Result<BTreeSet<ReplicaId>> {
        self.layout.storage_info_ids()
    }

    /// Create a new entry in state NEW
    ///
    /// Fails with `DuplicateEntry` when a healthy entry already exists. A
    /// stale control file left without storage info is replaced.
    pub fn create(&self, id: ReplicaId) -> Result<Arc<RepositoryEntry>> {
        self.ensure_absent(&id)?;

        let _guard = self.load_lock(&id).lock();
        if self.entries.contains_key(&id) {
            return Err(Error::DuplicateEntry(id));
        }
        let paths = self.layout.paths_for(&id);
        remove_stale_control(&paths.control)?;

        let entry = Arc::new(RepositoryEntry::create(
            id.clone(),
            paths,
            self.config.sync_writes,
            ControlRecord::new_entry(),
            self.listener(),
        )?);
        self.entries.insert(id.clone(), Arc::clone(&entry));
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!("Created entry {}", id);
        Ok(entry)
    }

    /// Create a new entry whose bookkeeping is copied from `template`
    pub fn create_from(
        &self,
        id: ReplicaId,
        template: &RepositoryEntry,
    ) -> Result<Arc<RepositoryEntry>> {
        self.ensure_absent(&id)?;

        let _guard = self.load_lock(&id).lock();
        if self.entries.contains_key(&id) {
            return Err(Error::DuplicateEntry(id));
        }
        let paths = self.layout.paths_for(&id);
        remove_stale_control(&paths.control)?;

        let entry = Arc::new(RepositoryEntry::copy_of(
            id.clone(),
            paths,
            self.config.sync_writes,
            template,
            self.listener(),
        )?);
        self.schedule_expirations(&entry);
        self.entries.insert(id.clone(), Arc::clone(&entry));
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!("Created entry {} from {}", id, template.id());
        Ok(entry)
    }

    /// Look up a replica, loading and repairing it on first access
    ///
    /// Namespace failures other than `NotFound` surface as errors; the
    /// lookup can be retried once the namespace is reachable again.
    pub fn get(&self, id: &ReplicaId) -> Result<EntryLookup> {
        if let Some(entry) = self.loaded(id) {
            return Ok(EntryLookup::Found(entry));
        }

        let _guard = self.load_lock(id).lock();
        if let Some(entry) = self.loaded(id) {
            return Ok(EntryLookup::Found(entry));
        }

        let storage_info = self.layout.storage_info_file_for(id);
        let exists = storage_info.try_exists().map_err(|e| {
            Error::io(
                format!("failed to check storage info {}", storage_info.display()),
                e,
            )
        })?;
        if !exists {
            return Ok(EntryLookup::NotFound);
        }

        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        let listener = self.listener();
        let lookup = self.healer.load(&self.layout, id, listener.as_ref())?;

        if let EntryLookup::Found(entry) = &lookup {
            match entry.remove_expired_sticky_flags() {
                Ok(expired) if !expired.is_empty() => {
                    debug!("Dropped {} expired sticky flags of {}", expired.len(), id);
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to drop expired sticky flags of {}: {}", id, e),
            }
            self.schedule_expirations(entry);
            self.entries.insert(id.clone(), Arc::clone(entry));
        }
        Ok(lookup)
    }

    /// Delete the control and storage-info files of a replica
    ///
    /// Removing an absent replica succeeds. A loaded handle is detached and
    /// rejects further updates.
    pub fn remove(&self, id: &ReplicaId) -> Result<()> {
        let _guard = self.load_lock(id).lock();
        if let Some((_, entry)) = self.entries.remove(id) {
            entry.mark_removed();
        }

        let paths = self.layout.paths_for(id);
        // Storage info first: without it the replica no longer exists
        for path in [&paths.storage_info, &paths.control] {
            remove_if_exists(path)
                .map_err(|e| Error::io(format!("failed to remove {}", path.display()), e))?;
        }

        self.counters.removed.fetch_add(1, Ordering::Relaxed);
        debug!("Removed entry {}", id);
        Ok(())
    }

    /// Probe that the control directory accepts writes
    pub fn is_ok(&self) -> bool {
        let _guard = self.probe_lock.lock();
        let marker = self.layout.marker_file();

        if let Err(e) = File::create(&marker) {
            warn!("Failed to create {}: {}", marker.display(), e);
            return false;
        }
        if let Err(e) = fs::remove_file(&marker) {
            warn!("Failed to remove {}: {}", marker.display(), e);
            return false;
        }
        true
    }

    /// Bytes available to unprivileged users on the pool volume
    pub fn free_space(&self) -> Result<u64> {
        let stat = self.statvfs()?;
        Ok(u64::from(stat.blocks_available()) * u64::from(stat.fragment_size()))
    }

    /// Total size of the pool volume in bytes
    pub fn total_space(&self) -> Result<u64> {
        let stat = self.statvfs()?;
        Ok(u64::from(stat.blocks()) * u64::from(stat.fragment_size()))
    }

    pub fn stats(&self) -> MetadataStoreStats {
        let healer = self.healer.stats();
        let (sticky_pending, sticky_expired) = self.sticky.as_ref().map_or((0, 0), |s| {
            (s.pending(), s.stats().expired.load(Ordering::Relaxed))
        });
        MetadataStoreStats {
            loaded_entries: self.entries.len(),
            loads: self.counters.loads.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            created: self.counters.created.load(Ordering::Relaxed),
            removed: self.counters.removed.load(Ordering::Relaxed),
            repairs: healer.repairs.load(Ordering::Relaxed),
            destroyed: healer.destroyed.load(Ordering::Relaxed),
            unrecoverable: healer.unrecoverable.load(Ordering::Relaxed),
            sticky_pending,
            sticky_expired,
        }
    }

    /// Stop the sticky expiration scheduler
    pub fn shutdown(&self) {
        if let Some(sticky) = &self.sticky {
            sticky.shutdown();
        }
    }

    fn loaded(&self, id: &ReplicaId) -> Option<Arc<RepositoryEntry>> {
        let entry = self.entries.get(id).map(|e| Arc::clone(e.value()))?;
        self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    fn ensure_absent(&self, id: &ReplicaId) -> Result<()> {
        match self.get(id)? {
            EntryLookup::NotFound => Ok(()),
            EntryLookup::Found(_) => Err(Error::DuplicateEntry(id.clone())),
            EntryLookup::Unloadable(reason) => Err(Error::illegal_state(format!(
                "replica {id} exists but cannot be loaded: {reason}"
            ))),
        }
    }

    fn listener(&self) -> Option<Arc<dyn StickyListener>> {
        self.sticky
            .as_ref()
            .map(|s| Arc::clone(s) as Arc<dyn StickyListener>)
    }

    fn schedule_expirations(&self, entry: &RepositoryEntry) {
        if let Some(sticky) = &self.sticky {
            for record in entry.sticky_records() {
                sticky.add(entry.id().clone(), record);
            }
        }
    }

    fn load_lock(&self, id: &ReplicaId) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let stripe = usize::try_from(hasher.finish() % LOAD_LOCK_STRIPES).unwrap_or_default();
        &self.load_locks[stripe]
    }

    fn statvfs(&self) -> Result<Statvfs> {
        let base = self.layout.base_dir();
        statvfs(base).map_err(|e| {
            Error::io(
                format!("failed to stat volume of {}", base.display()),
                io::Error::from(e),
            )
        })
    }
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("base_dir", &self.layout.base_dir())
            .field("loaded_entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl Drop for MetadataStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn remove_stale_control(path: &std::path::Path) -> Result<()> {
    if remove_if_exists(path)
        .map_err(|e| Error::io(format!("failed to remove {}", path.display()), e))?
    {
        debug!("Removed stale control file {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::write_storage_info;
    use crate::namespace::mock::MockNamespace;
    use crate::state::EntryState;
    use dpool_common::{
        AccessLatency, Expiry, FileAttributes, NamespaceError, ReplicaState, StickyConfig,
        StickyRecord,
    };
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    fn config(dir: &TempDir) -> RepositoryConfig {
        RepositoryConfig {
            base_dir: dir.path().to_path_buf(),
            sync_writes: false,
            max_repair_attempts: 2,
            sticky: StickyConfig {
                enabled: true,
                workers: 1,
                clock_shift_ms: 20,
            },
        }
    }

    fn open(dir: &TempDir, namespace: &Arc<MockNamespace>) -> MetadataStore {
        MetadataStore::init(config(dir), namespace.clone()).unwrap()
    }

    fn id(n: u32) -> ReplicaId {
        ReplicaId::new(format!("{n:024X}")).unwrap()
    }

    fn attrs(size: u64) -> FileAttributes {
        FileAttributes {
            size,
            storage_class: "test:default@osm".into(),
            checksum: Some("1:deadbeef".into()),
            ..Default::default()
        }
    }

    /// Write a replica the way a completed upload leaves it
    fn store_replica(store: &MetadataStore, id: &ReplicaId, data: &[u8]) -> Arc<RepositoryEntry> {
        let entry = store.create(id.clone()).unwrap();
        fs::write(entry.data_file(), data).unwrap();
        entry.set_state(ReplicaState::FromClient).unwrap();
        entry.set_file_attributes(Some(attrs(data.len() as u64))).unwrap();
        entry.set_size(data.len() as i64).unwrap();
        entry.set_state(ReplicaState::Cached).unwrap();
        entry
    }

    #[test]
    fn test_open_requires_directories() {
        let dir = tempdir().unwrap();
        let namespace: Arc<dyn NamespaceHandle> = Arc::new(MockNamespace::new());
        let err = MetadataStore::open(config(&dir), namespace).unwrap_err();
        assert!(matches!(err, Error::DirectoryNotFound(_)));
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let dir = tempdir().unwrap();
        let store = open(&dir, &Arc::new(MockNamespace::new()));
        assert!(store.get(&id(1)).unwrap().is_not_found());
    }

    #[test]
    fn test_create_and_get_share_handle() {
        let dir = tempdir().unwrap();
        let store = open(&dir, &Arc::new(MockNamespace::new()));

        let entry = store_replica(&store, &id(1), b"hello");
        let found = store.get(&id(1)).unwrap().found().unwrap();
        assert!(Arc::ptr_eq(&entry, &found));
        assert_eq!(store.index().unwrap().into_iter().collect::<Vec<_>>(), vec![id(1)]);
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let dir = tempdir().unwrap();
        let store = open(&dir, &Arc::new(MockNamespace::new()));
        store_replica(&store, &id(1), b"hello");

        let err = store.create(id(1)).unwrap_err();
        assert!(matches!(err, Error::DuplicateEntry(ref dup) if *dup == id(1)));
    }

    #[test]
    fn test_create_replaces_stale_control_file() {
        let dir = tempdir().unwrap();
        let store = open(&dir, &Arc::new(MockNamespace::new()));
        let paths = store.layout().paths_for(&id(2));
        let stale = ControlRecord {
            state: ReplicaState::Precious,
            ..ControlRecord::new_entry()
        };
        EntryState::create(&paths.control, &paths.control_temp, false, stale).unwrap();

        let entry = store.create(id(2)).unwrap();
        assert_eq!(entry.state(), ReplicaState::New);
        let reread = EntryState::open(&paths.control, &paths.control_temp, false).unwrap();
        assert_eq!(reread.state(), ReplicaState::New);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = open(&dir, &Arc::new(MockNamespace::new()));
        let entry = store_replica(&store, &id(3), b"data");

        store.remove(&id(3)).unwrap();
        store.remove(&id(3)).unwrap();
        store.remove(&id(4)).unwrap();

        assert!(store.get(&id(3)).unwrap().is_not_found());
        assert!(!store.layout().control_file_for(&id(3)).exists());
        assert!(matches!(
            entry.set_sticky("pin", Expiry::Never, true),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn test_removed_handle_cannot_resurrect_replica() {
        let dir = tempdir().unwrap();
        let namespace = Arc::new(MockNamespace::new());
        namespace.insert(&id(14), attrs(4));
        {
            let store = open(&dir, &namespace);
            let entry = store_replica(&store, &id(14), b"data");
            store.remove(&id(14)).unwrap();

            assert!(matches!(
                entry.set_file_attributes(Some(attrs(4))),
                Err(Error::IllegalState(_))
            ));
            assert!(store.index().unwrap().is_empty());
        }

        let store = open(&dir, &namespace);
        assert!(store.get(&id(14)).unwrap().is_not_found());
    }

    #[test]
    fn test_size_mismatch_retried_after_namespace_returns() {
        let dir = tempdir().unwrap();
        let namespace = Arc::new(MockNamespace::new());
        {
            let store = open(&dir, &namespace);
            store_replica(&store, &id(15), b"1234");
        }
        let layout = DirectoryLayout::open(dir.path()).unwrap();
        fs::write(layout.data_file_for(&id(15)), b"123456").unwrap();
        namespace.insert(&id(15), attrs(6));
        namespace.set_unavailable(true);

        let store = open(&dir, &namespace);
        assert!(matches!(
            store.get(&id(15)),
            Err(Error::Namespace(NamespaceError::Unavailable(_)))
        ));
        assert!(store.index().unwrap().contains(&id(15)));

        namespace.set_unavailable(false);
        let entry = store.get(&id(15)).unwrap().found().unwrap();
        assert_eq!(entry.size(), 6);
        assert_eq!(entry.file_attributes(), Some(attrs(6)));
    }

    #[test]
    fn test_attributes_survive_reopen() {
        let dir = tempdir().unwrap();
        let namespace = Arc::new(MockNamespace::new());
        {
            let store = open(&dir, &namespace);
            let entry = store_replica(&store, &id(5), b"0123456789");
            entry.set_sticky("system", Expiry::Never, true).unwrap();
        }

        let store = open(&dir, &namespace);
        let entry = store.get(&id(5)).unwrap().found().unwrap();
        assert_eq!(entry.file_attributes(), Some(attrs(10)));
        assert_eq!(entry.state(), ReplicaState::Cached);
        assert_eq!(entry.size(), 10);
        assert_eq!(entry.sticky_records(), vec![StickyRecord::system()]);
        assert_eq!(entry.link_count(), 0);
        assert_eq!(store.stats().repairs, 0);
    }

    #[test]
    fn test_stray_temp_file_ignored() {
        let dir = tempdir().unwrap();
        let namespace = Arc::new(MockNamespace::new());
        {
            let store = open(&dir, &namespace);
            store_replica(&store, &id(6), b"abc");
        }
        // Crash between writing and renaming new storage info
        let layout = DirectoryLayout::open(dir.path()).unwrap();
        fs::write(layout.storage_info_temp_file_for(&id(6)), b"half written").unwrap();
        fs::write(layout.control_temp_file_for(&id(6)), b"half").unwrap();

        let store = open(&dir, &namespace);
        assert_eq!(store.index().unwrap().len(), 1);
        let entry = store.get(&id(6)).unwrap().found().unwrap();
        assert_eq!(entry.file_attributes(), Some(attrs(3)));
        assert_eq!(store.stats().repairs, 0);
    }

    #[test]
    fn test_missing_control_file_healed_on_get() {
        let dir = tempdir().unwrap();
        let namespace = Arc::new(MockNamespace::new());
        {
            let store = open(&dir, &namespace);
            store_replica(&store, &id(7), b"0123456789");
        }
        let layout = DirectoryLayout::open(dir.path()).unwrap();
        fs::remove_file(layout.control_file_for(&id(7))).unwrap();
        namespace.insert(
            &id(7),
            FileAttributes {
                access_latency: AccessLatency::Online,
                ..attrs(10)
            },
        );

        let store = open(&dir, &namespace);
        let entry = store.get(&id(7)).unwrap().found().unwrap();
        assert_eq!(entry.state(), ReplicaState::Cached);
        assert_eq!(entry.sticky_records(), vec![StickyRecord::system()]);
        assert_eq!(store.stats().repairs, 1);
    }

    #[test]
    fn test_orphan_destroyed_on_get() {
        let dir = tempdir().unwrap();
        let namespace = Arc::new(MockNamespace::new());
        let store = open(&dir, &namespace);
        let paths = store.layout().paths_for(&id(8));
        fs::write(&paths.data, b"orphan").unwrap();
        write_storage_info(&paths, &attrs(6), false).unwrap();

        assert!(store.get(&id(8)).unwrap().is_not_found());
        assert!(!paths.data.exists());
        assert!(!paths.storage_info.exists());
        assert!(store.index().unwrap().is_empty());
        assert_eq!(store.stats().destroyed, 1);
    }

    #[test]
    fn test_create_from_copies_bookkeeping() {
        let dir = tempdir().unwrap();
        let store = open(&dir, &Arc::new(MockNamespace::new()));
        let template = store_replica(&store, &id(9), b"payload");
        template.set_sticky("system", Expiry::Never, true).unwrap();

        let copy = store.create_from(id(10), &template).unwrap();
        assert_eq!(copy.state(), ReplicaState::Cached);
        assert_eq!(copy.size(), 7);
        assert_eq!(copy.file_attributes(), Some(attrs(7)));
        assert_eq!(copy.sticky_records(), vec![StickyRecord::system()]);
        assert_eq!(copy.creation_time(), template.creation_time());
        assert!(store.index().unwrap().contains(&id(10)));

        assert!(matches!(
            store.create_from(id(9), &template),
            Err(Error::DuplicateEntry(_))
        ));
    }

    #[test]
    fn test_expired_sticky_dropped_on_load() {
        let dir = tempdir().unwrap();
        let namespace = Arc::new(MockNamespace::new());
        {
            let store = open(&dir, &namespace);
            let entry = store_replica(&store, &id(11), b"x");
            entry.set_sticky("short", Expiry::after_millis(30), true).unwrap();
            entry.set_sticky("system", Expiry::Never, true).unwrap();
            store.shutdown();
        }
        std::thread::sleep(Duration::from_millis(60));

        let store = open(&dir, &namespace);
        let entry = store.get(&id(11)).unwrap().found().unwrap();
        assert_eq!(entry.sticky_records(), vec![StickyRecord::system()]);
    }

    #[test]
    fn test_sticky_expiry_scheduled_on_load() {
        let dir = tempdir().unwrap();
        let namespace = Arc::new(MockNamespace::new());
        {
            let store = open(&dir, &namespace);
            let entry = store_replica(&store, &id(12), b"x");
            entry
                .set_sticky("pin", Expiry::after_millis(60_000), true)
                .unwrap();
        }

        let store = open(&dir, &namespace);
        store.get(&id(12)).unwrap().found().unwrap();
        assert_eq!(store.stats().sticky_pending, 1);
    }

    #[test]
    fn test_is_ok() {
        let dir = tempdir().unwrap();
        let store = open(&dir, &Arc::new(MockNamespace::new()));
        assert!(store.is_ok());
        assert!(!store.layout().marker_file().exists());

        fs::remove_dir_all(store.layout().control_dir()).unwrap();
        assert!(!store.is_ok());
    }

    #[test]
    fn test_space() {
        let dir = tempdir().unwrap();
        let store = open(&dir, &Arc::new(MockNamespace::new()));
        let total = store.total_space().unwrap();
        assert!(total > 0);
        assert!(store.free_space().unwrap() <= total);
    }

    #[test]
    fn test_stats_count_loads_and_hits() {
        let dir = tempdir().unwrap();
        let namespace = Arc::new(MockNamespace::new());
        {
            let store = open(&dir, &namespace);
            store_replica(&store, &id(13), b"abc");
        }
        let store = open(&dir, &namespace);
        store.get(&id(13)).unwrap();
        store.get(&id(13)).unwrap();

        let stats = store.stats();
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.loaded_entries, 1);
    }
}
