//! The queue handle: creating or loading a queue directory, enqueueing, syncing.
//!
//! ## Locks
//!
//! Three mutexes guard the moving parts, always taken in this order:
//!
//! 1. the enqueue lock ([`Enqueuer`]),
//! 2. the persist lock ([`Persister`]),
//! 3. the in-queue publication lock (with its condition variable).
//!
//! The published persist cursors and published persister stats are leaf locks, held only to
//! copy a value in or out.
//!
//! [`Queue::sync_when_ready`] waits on the publication lock alone, so an enqueuer that needs an
//! inline persist is never stuck behind a waiting background sync.

use crate::chunks::ChunkStore;
use crate::commit::CommitRecord;
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::formats::{slots_for, CHUNKS_FILE, MAX_MESSAGE_SIZE, STATE_FILE, WAL_FILE};
use crate::inqueue::{Enqueuer, EnqueuerStats, InQueueCursors, SlotRing};
use crate::persister::{PersistCursors, Persister, PersisterStats};
use crate::reader::Reader;
use crate::storage::{Directory, FsDirectory, QueueFile};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// Cursor snapshots shared with readers and the background sync.
pub(crate) struct Published {
    pub(crate) in_queue: Mutex<InQueueCursors>,
    pub(crate) in_queue_cond: Condvar,
    pub(crate) persist: Mutex<PersistCursors>,
    pub(crate) persister_stats: Mutex<PersisterStats>,
}

impl Published {
    pub(crate) fn new(in_queue: InQueueCursors, persist: PersistCursors) -> Self {
        Self {
            in_queue: Mutex::new(in_queue),
            in_queue_cond: Condvar::new(),
            persist: Mutex::new(persist),
            persister_stats: Mutex::new(PersisterStats::default()),
        }
    }
}

/// Combined statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Enqueuer side.
    pub enqueuer: EnqueuerStats,
    /// Persister side (as of the last commit or background sync).
    pub persister: PersisterStats,
}

/// The durable message range, as of the last commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistInfo {
    /// One past the last durable message.
    pub wal_msn: u64,
    /// One past the last message in the chunk store.
    pub cks_msn: u64,
    /// Oldest chunk still readable.
    pub cks_discard_csn: u64,
}

impl From<PersistCursors> for PersistInfo {
    fn from(c: PersistCursors) -> Self {
        Self {
            wal_msn: c.wal_msn.value(),
            cks_msn: c.cks_msn.value(),
            cks_discard_csn: c.cks_discard_csn.value(),
        }
    }
}

/// A persistent message queue rooted in one directory.
///
/// One writer enqueues; any number of [`Reader`]s read concurrently. Enqueued messages become
/// durable (and visible to readers) at the next [`sync`](Self::sync), background sync, or
/// inline persist of a full ring.
///
/// **Dropping a `Queue` does not sync.** Messages enqueued since the last sync are lost, as
/// they would be in a crash, and a warning is logged with their count. Use
/// [`close`](Self::close) to shut down with a final sync.
pub struct Queue {
    dir: Arc<dyn Directory>,
    config: QueueConfig,
    pub(crate) slots: SlotRing,
    pub(crate) store: Arc<ChunkStore>,
    pub(crate) enqueuer: Mutex<Enqueuer>,
    persister: Mutex<Persister>,
    pub(crate) published: Published,
}

impl Queue {
    /// Open the queue at `path`, creating it if the directory does not exist.
    pub fn open(path: impl AsRef<Path>, config: &QueueConfig) -> QueueResult<Self> {
        Self::open_in(Arc::new(FsDirectory::new(path.as_ref())), config)
    }

    /// Open the queue stored in `dir`, creating it if the directory does not exist.
    pub fn open_in(dir: Arc<dyn Directory>, config: &QueueConfig) -> QueueResult<Self> {
        config.validate()?;
        if dir.root_exists() {
            Self::load(dir, config)
        } else {
            Self::create(dir, config)
        }
    }

    fn create(dir: Arc<dyn Directory>, config: &QueueConfig) -> QueueResult<Self> {
        let chunk_bytes = config.resolved_chunk_store_size()?;
        dir.create_root()?;
        let wal = dir.create_file(WAL_FILE, config.slots_size_bytes())?;
        let chunks = dir.create_file(CHUNKS_FILE, chunk_bytes)?;
        let state = dir.create_file(STATE_FILE, CommitRecord::SIZE as u64)?;
        wal.sync()?;

        let slots = SlotRing::new(config.slot_count)?;
        let store = Arc::new(ChunkStore::new(chunks, chunk_bytes)?);
        let cursors = PersistCursors::default();
        let published = Published::new(InQueueCursors::default(), cursors);
        let mut persister =
            Persister::new(wal, state, store.clone(), cursors, config.slot_count)?;
        persister.commit(&published)?;
        dir.sync_root()?;

        log::info!(
            "created queue at {}: {} slots, {} chunks",
            dir.location(),
            config.slot_count,
            store.chunk_count()
        );
        Ok(Self {
            enqueuer: Mutex::new(Enqueuer::new(InQueueCursors::default(), config.slot_count)),
            persister: Mutex::new(persister),
            dir,
            config: config.clone(),
            slots,
            store,
            published,
        })
    }

    fn load(dir: Arc<dyn Directory>, config: &QueueConfig) -> QueueResult<Self> {
        let state = dir.open_file(STATE_FILE)?;
        let mut image = [0u8; CommitRecord::SIZE];
        state.read_exact_at(&mut image, 0)?;
        let mut rec = CommitRecord::decode(&image)?;
        if rec.reconcile_wal() {
            log::warn!(
                "{}: wal was behind the chunk store; wal cursors reset to ssn {} msn {}",
                dir.location(),
                rec.wal_ssn,
                rec.wal_msn
            );
        }
        rec.validate()?;

        let wal = dir.open_file(WAL_FILE)?;
        check_size(wal.as_ref(), WAL_FILE, rec.slotsfile_size_bytes)?;
        let mut slots = SlotRing::new(rec.inqueue_slotcount)?;
        slots.load_from(wal.as_ref())?;

        let chunks = dir.open_file(CHUNKS_FILE)?;
        check_size(chunks.as_ref(), CHUNKS_FILE, rec.chunkfile_size_bytes)?;
        let store = Arc::new(ChunkStore::new(chunks, rec.chunkfile_size_bytes)?);

        if config.slot_count != rec.inqueue_slotcount {
            log::warn!(
                "configured slot_count {} differs from stored {}; using the stored value",
                config.slot_count,
                rec.inqueue_slotcount
            );
        }
        if config.resolved_chunk_store_size()? != rec.chunkfile_size_bytes {
            log::warn!(
                "configured chunk store size differs from stored {}; using the stored value",
                rec.chunkfile_size_bytes
            );
        }

        let cursors = PersistCursors::from_commit(&rec);
        let ic = InQueueCursors {
            msn: rec.wal_msn,
            ssn_mem: rec.wal_ssn,
            msn_disk: rec.cks_msn,
            ssn_disk: rec.cks_ssn,
        };
        let persister = Persister::new(wal, state, store.clone(), cursors, rec.inqueue_slotcount)?;
        log::info!(
            "loaded queue at {}: msn {}..{} durable, chunks {}..{}",
            dir.location(),
            rec.cks_msn,
            rec.wal_msn,
            rec.cks_discard_csn,
            rec.cks_csn
        );
        Ok(Self {
            enqueuer: Mutex::new(Enqueuer::new(ic, rec.inqueue_slotcount)),
            persister: Mutex::new(persister),
            published: Published::new(ic, cursors),
            config: QueueConfig {
                slot_count: rec.inqueue_slotcount,
                chunk_store_size: rec.chunkfile_size_bytes,
                ..config.clone()
            },
            dir,
            slots,
            store,
        })
    }

    /// The effective configuration (stored sizes win over configured ones on load).
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append one message. Returns its MSN.
    ///
    /// Blocks for an inline persist only when the slot ring is full.
    pub fn enqueue(&self, data: &[u8]) -> QueueResult<u64> {
        if data.is_empty() {
            return Err(QueueError::InvalidArgument("empty message".into()));
        }
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(QueueError::InvalidArgument(format!(
                "message of {} bytes exceeds the maximum of {MAX_MESSAGE_SIZE}",
                data.len()
            )));
        }
        let slot_count = self.slots.slot_count();
        let mut enq = self.enqueuer.lock();
        let next = enq.cursors.ssn_mem + slots_for(data.len() as u64);

        // A full ring, or one past the watermark, looks at the persister's published
        // position so the crossing test in `serialize` sees current occupancy.
        // `idle`: everything enqueued so far is already in the WAL.
        let mut idle = false;
        if !enq.has_room_until(next) || enq.at_watermark() {
            let p = self.persist_cursors();
            enq.refresh_disk(p.cks_ssn, p.cks_msn);
            idle = p.wal_ssn == enq.cursors.ssn_mem;
        }
        if !enq.has_room_until(next) {
            enq.stats.buffer_full_count += 1;
            let ssn_mem = enq.cursors.ssn_mem;
            let mut persister = self.persister.lock();
            persister.make_room(&self.slots, &self.published, next - slot_count, ssn_mem)?;
            let c = persister.cursors();
            drop(persister);
            enq.refresh_disk(c.cks_ssn, c.cks_msn);
            idle = c.wal_ssn == enq.cursors.ssn_mem;
            if !enq.has_room_until(next) {
                return Err(QueueError::InvalidState(format!(
                    "no room in the slot ring after persisting to ssn {}",
                    c.cks_ssn
                )));
            }
        }

        let msn = enq.cursors.msn;
        let crossed = enq.serialize(&self.slots, data);
        // Wake a background sync when the ring becomes ready for it: the watermark was
        // crossed, or new data arrived in a ring that was already past it.
        let wake = crossed || (idle && enq.at_watermark());
        *self.published.in_queue.lock() = enq.cursors;
        if wake {
            self.published.in_queue_cond.notify_one();
        }
        Ok(msn.value())
    }

    /// Make every message enqueued so far durable and visible to readers.
    pub fn sync(&self) -> QueueResult<()> {
        let mut persister = self.persister.lock();
        let ssn_mem = self.published.in_queue.lock().ssn_mem;
        persister.persist(&self.slots, &self.published, ssn_mem, ssn_mem)
    }

    /// Wait until half the ring is occupied or the configured sync wait elapses, then sync.
    ///
    /// Occupancy is `ssn_mem - cks_ssn`: slots whose messages are not in the chunk store yet.
    /// A ring with nothing new since the last persist is not ready, however full.
    pub fn sync_when_ready(&self) -> QueueResult<()> {
        let watermark = self.slots.slot_count() / 2;
        let deadline = Instant::now() + self.config.sync_wait();
        let mut wakeups = 0;
        {
            let mut ic = self.published.in_queue.lock();
            loop {
                let p = self.persist_cursors();
                if ic.ssn_mem - p.cks_ssn >= watermark && ic.ssn_mem != p.wal_ssn {
                    break;
                }
                if self
                    .published
                    .in_queue_cond
                    .wait_until(&mut ic, deadline)
                    .timed_out()
                {
                    break;
                }
                wakeups += 1;
            }
        }

        let mut persister = self.persister.lock();
        persister.stats.wakeups += wakeups;
        let ssn_mem = self.published.in_queue.lock().ssn_mem;
        persister.persist(&self.slots, &self.published, ssn_mem, ssn_mem)?;
        persister.stats.num_async_flushes += 1;
        *self.published.persister_stats.lock() = persister.stats;
        Ok(())
    }

    /// Enqueuer and persister statistics.
    pub fn stats(&self) -> QueueStats {
        let enqueuer = self.enqueuer.lock().stats;
        let persister = *self.published.persister_stats.lock();
        QueueStats {
            enqueuer,
            persister,
        }
    }

    /// The durable message range.
    pub fn persist_info(&self) -> PersistInfo {
        (*self.published.persist.lock()).into()
    }

    /// A new reader positioned at the current end of the queue.
    pub fn reader(&self) -> Reader<'_> {
        Reader::new(self)
    }

    /// Sync and release the queue.
    pub fn close(self) -> QueueResult<()> {
        self.sync()?;
        log::info!("closed queue at {}", self.dir.location());
        Ok(())
    }

    pub(crate) fn persist_cursors(&self) -> PersistCursors {
        *self.published.persist.lock()
    }

    /// Messages enqueued but not yet durable.
    pub fn unsynced_messages(&self) -> u64 {
        let msn = self.published.in_queue.lock().msn;
        msn - self.persist_cursors().wal_msn
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        let lost = self.unsynced_messages();
        if lost > 0 {
            log::warn!(
                "queue at {} dropped with {lost} unsynced messages; use close() to keep them",
                self.dir.location()
            );
        }
    }
}

fn check_size(file: &dyn QueueFile, name: &str, expected: u64) -> QueueResult<()> {
    let actual = file.size_bytes()?;
    if actual != expected {
        return Err(QueueError::Format(format!(
            "{name} is {actual} bytes, commit record expects {expected}"
        )));
    }
    Ok(())
}

/// A background thread that runs [`Queue::sync_when_ready`] in a loop.
pub struct SyncWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<QueueResult<()>>>,
}

impl SyncWorker {
    /// Start syncing `queue` in the background.
    pub fn spawn(queue: Arc<Queue>) -> QueueResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::Builder::new()
            .name("pmq-sync".into())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    if let Err(e) = queue.sync_when_ready() {
                        log::error!("background sync stopped: {e}");
                        return Err(e);
                    }
                }
                Ok(())
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and return the error that ended it early, if any.
    pub fn stop(mut self) -> QueueResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> QueueResult<()> {
        self.stop.store(true, Ordering::Release);
        match self.handle.take() {
            Some(h) => h
                .join()
                .map_err(|_| QueueError::InvalidState("sync thread panicked".into()))?,
            None => Ok(()),
        }
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("sync worker: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_CHUNK_STORE_SIZE;
    use crate::storage::MemoryDirectory;

    fn small() -> QueueConfig {
        QueueConfig::default()
            .with_chunk_store_size(MIN_CHUNK_STORE_SIZE)
            .with_slot_count(1024)
            .with_sync_wait_ms(5)
    }

    #[test]
    fn create_writes_an_initial_commit() {
        let dir = MemoryDirectory::new();
        let q = Queue::open_in(Arc::new(dir.clone()), &small()).unwrap();
        assert_eq!(q.persist_info(), PersistInfo::default());
        drop(q);
        dir.simulate_power_loss();
        let q = Queue::open_in(Arc::new(dir), &small()).unwrap();
        assert_eq!(q.persist_info(), PersistInfo::default());
    }

    #[test]
    fn enqueue_rejects_empty_and_oversized_messages() {
        let q = Queue::open_in(Arc::new(MemoryDirectory::new()), &small()).unwrap();
        assert!(matches!(q.enqueue(b""), Err(QueueError::InvalidArgument(_))));
        assert!(matches!(
            q.enqueue(&vec![0u8; MAX_MESSAGE_SIZE + 1]),
            Err(QueueError::InvalidArgument(_))
        ));
        assert_eq!(q.enqueue(&vec![0u8; MAX_MESSAGE_SIZE]).unwrap(), 0);
        assert_eq!(q.enqueue(b"x").unwrap(), 1);
    }

    #[test]
    fn full_ring_persists_inline() {
        let q = Queue::open_in(Arc::new(MemoryDirectory::new()), &small()).unwrap();
        let msg = vec![3u8; 10 * 112];
        for _ in 0..300 {
            q.enqueue(&msg).unwrap();
        }
        let stats = q.stats();
        assert_eq!(stats.enqueuer.total_messages_enqueued, 300);
        assert!(stats.enqueuer.buffer_full_count > 0);
        assert!(q.persist_info().cks_msn > 0);
    }

    #[test]
    fn sync_when_ready_times_out_and_persists() {
        let q = Queue::open_in(Arc::new(MemoryDirectory::new()), &small()).unwrap();
        q.enqueue(b"hello").unwrap();
        q.sync_when_ready().unwrap();
        assert_eq!(q.persist_info().wal_msn, 1);
        let s = q.stats().persister;
        assert_eq!(s.num_async_flushes, 1);
        assert_eq!(s.wakeups, 0);
    }

    #[test]
    fn loading_prefers_stored_sizes() {
        let dir = MemoryDirectory::new();
        Queue::open_in(Arc::new(dir.clone()), &small())
            .unwrap()
            .close()
            .unwrap();
        let q = Queue::open_in(Arc::new(dir), &small().with_slot_count(4096)).unwrap();
        assert_eq!(q.config().slot_count, 1024);
    }
}
