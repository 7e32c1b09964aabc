//! Background expiration of sticky records
//!
//! A scheduling thread sleeps until the earliest finite expiry in its queue
//! and hands the replica to a small worker pool, which prunes the expired
//! records of the live entry. Expirations that prune nothing while the record
//! is still present are retried after a clock-shift delay.

use crate::entry::{RepositoryEntry, StickyListener};
use dpool_common::{Error, ReplicaId, Result, StickyConfig, StickyRecord, now_millis};
use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, debug_span, info, warn};

/// Loaded entries, keyed by replica id
pub(crate) type EntryMap = DashMap<ReplicaId, Arc<RepositoryEntry>>;

/// Scheduler statistics
#[derive(Debug, Default)]
pub struct StickyStats {
    /// Expirations queued
    pub scheduled: AtomicU64,
    /// Sticky records removed by workers
    pub expired: AtomicU64,
    /// Expirations retried after the clock-shift delay
    pub requeued: AtomicU64,
    /// Expirations that failed with an error
    pub failed: AtomicU64,
}

/// One queued expiration
#[derive(Debug)]
struct Expiration {
    deadline: u64,
    seq: u64,
    id: ReplicaId,
    record: StickyRecord,
}

impl PartialEq for Expiration {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Expiration {}

impl PartialOrd for Expiration {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Expiration {
    // Reversed so the max-heap pops the earliest deadline first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Expiration>,
    next_seq: u64,
}

/// State shared with the scheduling and worker threads
struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
    shutdown: AtomicBool,
    clock_shift: Duration,
    stats: StickyStats,
}

impl Shared {
    fn push(&self, id: ReplicaId, record: StickyRecord, deadline: u64) -> bool {
        let mut queue = self.queue.lock();
        if self.shutdown.load(Ordering::Acquire) {
            return false;
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        let earliest = queue.heap.peek().is_none_or(|head| deadline < head.deadline);
        queue.heap.push(Expiration {
            deadline,
            seq,
            id,
            record,
        });
        if earliest {
            self.wakeup.notify_one();
        }
        true
    }
}

/// Clears sticky records once their expiry has passed
pub struct StickyExpirationScheduler {
    shared: Arc<Shared>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl StickyExpirationScheduler {
    /// Start the scheduling thread and `config.workers` worker threads
    pub(crate) fn start(entries: Weak<EntryMap>, config: &StickyConfig) -> Result<Arc<Self>> {
        if config.workers == 0 {
            return Err(Error::Configuration(
                "sticky scheduler needs at least one worker".into(),
            ));
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
            clock_shift: config.clock_shift(),
            stats: StickyStats::default(),
        });
        let (tx, rx) = crossbeam_channel::unbounded();

        let scheduler = Self {
            shared: Arc::clone(&shared),
            scheduler: Mutex::new(None),
            workers: Mutex::new(Vec::with_capacity(config.workers)),
        };

        // The scheduling thread owns the only sender, so workers exit once it stops
        let scheduler_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("sticky-scheduler".into())
            .spawn(move || run_scheduler(&scheduler_shared, tx))
            .map_err(|e| Error::io("failed to spawn sticky scheduler", e))?;
        *scheduler.scheduler.lock() = Some(handle);

        for n in 0..config.workers {
            let shared = Arc::clone(&shared);
            let rx: Receiver<Expiration> = rx.clone();
            let entries = entries.clone();
            let handle = thread::Builder::new()
                .name(format!("sticky-worker-{n}"))
                .spawn(move || run_worker(&shared, &entries, &rx))
                .map_err(|e| Error::io("failed to spawn sticky worker", e))?;
            scheduler.workers.lock().push(handle);
        }

        info!(
            "Sticky expiration scheduler started with {} workers",
            config.workers
        );
        Ok(Arc::new(scheduler))
    }

    /// Queue the expiration of `record` on replica `id`
    ///
    /// Records that never expire, have already expired, or arrive after
    /// shutdown are ignored. Returns whether the record was queued.
    pub fn add(&self, id: ReplicaId, record: StickyRecord) -> bool {
        let Some(deadline) = record.expire.instant() else {
            return false;
        };
        if deadline <= now_millis() {
            return false;
        }
        let queued = self.shared.push(id, record, deadline);
        if queued {
            self.shared.stats.scheduled.fetch_add(1, Ordering::Relaxed);
        }
        queued
    }

    /// Number of expirations waiting for their deadline
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }

    pub fn stats(&self) -> &StickyStats {
        &self.shared.stats
    }

    /// Stop dispatching and wait for dispatched expirations to finish
    pub fn shutdown(&self) {
        {
            let _queue = self.shared.queue.lock();
            self.shared.shutdown.store(true, Ordering::Release);
            self.shared.wakeup.notify_all();
        }

        let current = thread::current().id();
        if let Some(handle) = self.scheduler.lock().take() {
            if handle.thread().id() != current && handle.join().is_err() {
                warn!("Sticky scheduler thread panicked");
            }
        }
        for handle in self.workers.lock().drain(..) {
            if handle.thread().id() != current && handle.join().is_err() {
                warn!("Sticky worker thread panicked");
            }
        }
    }
}

impl StickyListener for StickyExpirationScheduler {
    fn sticky_added(&self, id: &ReplicaId, record: &StickyRecord) {
        self.add(id.clone(), record.clone());
    }
}

impl Drop for StickyExpirationScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_scheduler(shared: &Shared, tx: Sender<Expiration>) {
    debug!("Sticky scheduler thread started");
    let mut queue = shared.queue.lock();

    while !shared.shutdown.load(Ordering::Acquire) {
        let now = now_millis();
        match queue.heap.peek().map(|head| head.deadline) {
            None => shared.wakeup.wait(&mut queue),
            Some(deadline) if deadline > now => {
                shared
                    .wakeup
                    .wait_for(&mut queue, Duration::from_millis(deadline - now));
            }
            Some(_) => {
                if let Some(expiration) = queue.heap.pop() {
                    if tx.send(expiration).is_err() {
                        break;
                    }
                }
            }
        }
    }

    let dropped = queue.heap.len();
    drop(queue);
    drop(tx);
    debug!(
        "Sticky scheduler thread stopped ({} expirations not dispatched)",
        dropped
    );
}

fn run_worker(shared: &Shared, entries: &Weak<EntryMap>, rx: &Receiver<Expiration>) {
    for expiration in rx {
        let Some(map) = entries.upgrade() else {
            break;
        };
        let entry = map.get(&expiration.id).map(|e| Arc::clone(e.value()));
        drop(map);

        match entry {
            Some(entry) => expire(shared, &entry, expiration),
            None => debug!(
                "Skipping sticky expiration of {}: entry not loaded",
                expiration.id
            ),
        }
    }
}

fn expire(shared: &Shared, entry: &RepositoryEntry, expiration: Expiration) {
    let _span = debug_span!("expire", replica = %expiration.id).entered();
    match entry.remove_expired_sticky_flags() {
        Ok(removed) if !removed.is_empty() => {
            shared
                .stats
                .expired
                .fetch_add(removed.len() as u64, Ordering::Relaxed);
            for record in &removed {
                debug!("Sticky flag {} of {} expired", record.owner, entry.id());
            }
        }
        Ok(_) => {
            if entry.sticky_records().contains(&expiration.record) {
                requeue(shared, expiration);
            }
        }
        Err(e) => {
            warn!(
                "Failed to expire sticky flags of {}: {}",
                expiration.id, e
            );
            shared.stats.failed.fetch_add(1, Ordering::Relaxed);
            requeue(shared, expiration);
        }
    }
}

fn requeue(shared: &Shared, expiration: Expiration) {
    let shift = u64::try_from(shared.clock_shift.as_millis()).unwrap_or(u64::MAX);
    let deadline = now_millis().saturating_add(shift);
    if shared.push(expiration.id, expiration.record, deadline) {
        shared.stats.requeued.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::DirectoryLayout;
    use crate::state::ControlRecord;
    use dpool_common::{Expiry, ReplicaState};
    use tempfile::tempdir;

    fn config() -> StickyConfig {
        StickyConfig {
            enabled: true,
            workers: 2,
            clock_shift_ms: 20,
        }
    }

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        done()
    }

    #[test]
    fn test_expiration_order() {
        let mut heap = BinaryHeap::new();
        for (deadline, seq) in [(30, 0), (10, 1), (20, 2), (10, 3)] {
            heap.push(Expiration {
                deadline,
                seq,
                id: ReplicaId::new("01").unwrap(),
                record: StickyRecord::new("o", Expiry::At(deadline)),
            });
        }
        let order: Vec<_> = std::iter::from_fn(|| heap.pop())
            .map(|e| (e.deadline, e.seq))
            .collect();
        assert_eq!(order, vec![(10, 1), (10, 3), (20, 2), (30, 0)]);
    }

    #[test]
    fn test_sticky_record_expires_in_background() {
        let dir = tempdir().unwrap();
        let layout = DirectoryLayout::create(dir.path()).unwrap();
        let entries: Arc<EntryMap> = Arc::new(DashMap::new());
        let scheduler = StickyExpirationScheduler::start(Arc::downgrade(&entries), &config())
            .unwrap();

        let id = ReplicaId::new("00A1").unwrap();
        let record = ControlRecord {
            state: ReplicaState::Cached,
            ..ControlRecord::new_entry()
        };
        let listener: Arc<dyn StickyListener> = scheduler.clone();
        let entry = Arc::new(
            RepositoryEntry::create(
                id.clone(),
                layout.paths_for(&id),
                false,
                record,
                Some(listener),
            )
            .unwrap(),
        );
        entries.insert(id.clone(), Arc::clone(&entry));

        assert!(
            entry
                .set_sticky("owner", Expiry::after_millis(100), true)
                .unwrap()
        );
        assert!(entry.is_sticky());
        assert_eq!(scheduler.pending(), 1);

        thread::sleep(Duration::from_millis(150));
        assert!(wait_until(Duration::from_secs(2), || entry
            .sticky_records()
            .is_empty()));
        assert!(!entry.is_sticky());
        assert_eq!(scheduler.stats().expired.load(Ordering::Relaxed), 1);

        scheduler.shutdown();
    }

    #[test]
    fn test_add_ignores_infinite_and_past_expiry() {
        let entries: Arc<EntryMap> = Arc::new(DashMap::new());
        let scheduler = StickyExpirationScheduler::start(Arc::downgrade(&entries), &config())
            .unwrap();
        let id = ReplicaId::new("0B").unwrap();

        assert!(!scheduler.add(id.clone(), StickyRecord::system()));
        assert!(!scheduler.add(id.clone(), StickyRecord::new("o", Expiry::At(1))));
        assert!(scheduler.add(id, StickyRecord::new("o", Expiry::after_millis(60_000))));
        assert_eq!(scheduler.pending(), 1);

        scheduler.shutdown();
    }

    #[test]
    fn test_missing_entry_tolerated() {
        let entries: Arc<EntryMap> = Arc::new(DashMap::new());
        let scheduler = StickyExpirationScheduler::start(Arc::downgrade(&entries), &config())
            .unwrap();

        let id = ReplicaId::new("0C").unwrap();
        assert!(scheduler.add(id, StickyRecord::new("o", Expiry::after_millis(20))));
        assert!(wait_until(Duration::from_secs(2), || scheduler.pending() == 0));
        assert_eq!(scheduler.stats().requeued.load(Ordering::Relaxed), 0);

        scheduler.shutdown();
    }

    #[test]
    fn test_shutdown_stops_dispatch() {
        let entries: Arc<EntryMap> = Arc::new(DashMap::new());
        let scheduler = StickyExpirationScheduler::start(Arc::downgrade(&entries), &config())
            .unwrap();
        let id = ReplicaId::new("0D").unwrap();
        assert!(scheduler.add(
            id.clone(),
            StickyRecord::new("o", Expiry::after_millis(60_000))
        ));

        scheduler.shutdown();
        scheduler.shutdown();
        assert!(!scheduler.add(id, StickyRecord::new("o", Expiry::after_millis(60_000))));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let entries: Arc<EntryMap> = Arc::new(DashMap::new());
        let config = StickyConfig {
            workers: 0,
            ..config()
        };
        assert!(matches!(
            StickyExpirationScheduler::start(Arc::downgrade(&entries), &config),
            Err(Error::Configuration(_))
        ));
    }
}
