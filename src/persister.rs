//! The persister: compaction of slots into chunks, the WAL tail and the commit record.
//!
//! One `persist` call runs four steps, each of which only advances the in-memory cursors after
//! its I/O succeeded:
//!
//! 1. compact leader slots `[cq_ssn, max)` into the open chunk buffer,
//! 2. write finished chunk buffers `[cks_csn, cq_csn)` to the chunk store,
//! 3. write the slots `[wal_ssn, target)` that are not in the chunk store to the WAL and fsync,
//! 4. commit: fsync the chunk store, then rewrite and fsync the commit record.
//!
//! Readers and the enqueuer only ever see cursors published by step 4, so everything they
//! observe is durable.
//!
//! Any failure poisons the persister. The on-disk state is still the last commit, so the
//! queue recovers by reopening.

use crate::chunks::{ChunkQueue, ChunkStore, CHUNK_BUFFERS};
use crate::commit::CommitRecord;
use crate::error::{QueueError, QueueResult};
use crate::formats::{slots_for, MAX_MESSAGE_SIZE, SLOT_SIZE};
use crate::inqueue::SlotRing;
use crate::queue::Published;
use crate::seqnum::{Csn, Msn, Ssn};
use crate::storage::QueueFile;
use serde::Serialize;
use std::sync::Arc;

/// Persister-owned cursors, as recorded in the commit record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistCursors {
    /// Next SSN to be flushed to the WAL.
    pub wal_ssn: Ssn,
    /// MSN corresponding to `wal_ssn`.
    pub wal_msn: Msn,
    /// Next CSN to be written to the chunk store.
    pub cks_csn: Csn,
    /// First MSN not in the chunk store.
    pub cks_msn: Msn,
    /// First SSN not in the chunk store.
    pub cks_ssn: Ssn,
    /// Oldest chunk not discarded.
    pub cks_discard_csn: Csn,
}

impl PersistCursors {
    pub(crate) fn from_commit(rec: &CommitRecord) -> Self {
        Self {
            wal_ssn: rec.wal_ssn,
            wal_msn: rec.wal_msn,
            cks_csn: rec.cks_csn,
            cks_msn: rec.cks_msn,
            cks_ssn: rec.cks_ssn,
            cks_discard_csn: rec.cks_discard_csn,
        }
    }

    /// The WAL only covers slots not yet in the chunk store.
    pub(crate) fn reset_wal_if_behind(&mut self) {
        if self.wal_ssn.lt(self.cks_ssn) {
            self.wal_ssn = self.cks_ssn;
            self.wal_msn = self.cks_msn;
        }
    }
}

/// Persister statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersisterStats {
    /// WAL write+fsync rounds.
    pub wal_flushes: u64,
    /// Bytes written to the WAL.
    pub wal_flush_bytes: u64,
    /// `fsync` calls on any queue file.
    pub fsync_calls: u64,
    /// Background sync wakeups before the wait timed out.
    pub wakeups: u64,
    /// Background syncs that ran a persist.
    pub num_async_flushes: u64,
    /// Chunks written to the chunk store.
    pub chunks_written: u64,
    /// Chunks given up by advancing the discard cursor.
    pub chunks_discarded: u64,
}

/// State guarded by the persist lock.
pub(crate) struct Persister {
    wal: Arc<dyn QueueFile>,
    state: Arc<dyn QueueFile>,
    store: Arc<ChunkStore>,
    queue: ChunkQueue,
    cursors: PersistCursors,
    committed: Option<PersistCursors>,
    pub(crate) stats: PersisterStats,
    slot_count: u64,
    poisoned: bool,
    // Staging for one compacted message and for WAL ranges.
    msg_buf: Vec<u8>,
    wal_buf: Vec<u8>,
}

impl Persister {
    /// A persister resuming from `cursors` (zero for a new queue, the commit record on load).
    pub(crate) fn new(
        wal: Arc<dyn QueueFile>,
        state: Arc<dyn QueueFile>,
        store: Arc<ChunkStore>,
        cursors: PersistCursors,
        slot_count: u64,
    ) -> QueueResult<Self> {
        let mut queue = ChunkQueue::new(cursors.cks_csn, cursors.cks_msn, cursors.cks_ssn)?;
        queue.begin_current();
        Ok(Self {
            wal,
            state,
            store,
            queue,
            cursors,
            committed: None,
            stats: PersisterStats::default(),
            slot_count,
            poisoned: false,
            msg_buf: Vec::new(),
            wal_buf: Vec::new(),
        })
    }

    pub(crate) fn cursors(&self) -> PersistCursors {
        self.cursors
    }

    /// Make slots up to `target` durable, compacting at most up to `max`.
    ///
    /// `max` must be a message boundary no later than the published `ssn_mem`; `target <= max`.
    pub(crate) fn persist(
        &mut self,
        slots: &SlotRing,
        published: &Published,
        target: Ssn,
        max: Ssn,
    ) -> QueueResult<()> {
        self.run(slots, published, target, max, false)
    }

    /// Like [`persist`](Self::persist), but also moves `cks_ssn` to at least `target` so that
    /// the enqueuer can reuse the ring slots below it, finalizing the open chunk if needed.
    pub(crate) fn make_room(
        &mut self,
        slots: &SlotRing,
        published: &Published,
        target: Ssn,
        max: Ssn,
    ) -> QueueResult<()> {
        self.run(slots, published, target, max, true)
    }

    fn run(
        &mut self,
        slots: &SlotRing,
        published: &Published,
        target: Ssn,
        max: Ssn,
        need_room: bool,
    ) -> QueueResult<()> {
        if self.poisoned {
            return Err(QueueError::InvalidState(
                "persister failed earlier; reopen the queue to recover".into(),
            ));
        }
        let res = self.persist_steps(slots, published, target, max, need_room);
        if let Err(e) = &res {
            log::error!("persist to ssn {target} failed: {e}");
            self.poisoned = true;
        }
        res
    }

    fn persist_steps(
        &mut self,
        slots: &SlotRing,
        published: &Published,
        target: Ssn,
        max: Ssn,
        need_room: bool,
    ) -> QueueResult<()> {
        self.compact(slots, published, max)?;
        self.persist_finished_chunk_buffers(published)?;
        if need_room && self.cursors.cks_ssn.lt(target) && self.queue.msg_count() > 0 {
            log::debug!(
                "finalizing chunk {} early: cks_ssn {} < target {target}",
                self.queue.cq_csn,
                self.cursors.cks_ssn
            );
            self.switch_to_next_chunk_buffer(published)?;
            self.persist_finished_chunk_buffers(published)?;
        }
        self.persist_unpersisted_slots(slots, target)?;
        if self.committed == Some(self.cursors) {
            publish_stats(published, self.stats);
            return Ok(());
        }
        self.commit(published)
    }

    fn compact(&mut self, slots: &SlotRing, published: &Published, max: Ssn) -> QueueResult<()> {
        while self.queue.cq_ssn.lt(max) {
            let ssn = self.queue.cq_ssn;
            // `[cq_ssn, max)` lies outside the enqueuer's write window.
            let hdr = slots.header(ssn);
            if !hdr.is_leader() {
                return Err(QueueError::integrity(format!(
                    "slot {ssn} is not a leader slot (flags {:#x})",
                    hdr.flags
                )));
            }
            let size = hdr.msgsize as usize;
            if size == 0 || size > MAX_MESSAGE_SIZE {
                return Err(QueueError::integrity(format!(
                    "slot {ssn} has invalid message size {size}"
                )));
            }
            let nslots = slots_for(size as u64);
            if nslots > max - ssn {
                return Err(QueueError::integrity(format!(
                    "message at slot {ssn} needs {nslots} slots, only {} enqueued",
                    max - ssn
                )));
            }
            if !self.queue.fits(size) {
                self.switch_to_next_chunk_buffer(published)?;
            }
            self.msg_buf.resize(size, 0);
            slots.copy_message(ssn, &mut self.msg_buf);
            self.queue.append_message(&self.msg_buf, nslots)?;
        }
        Ok(())
    }

    fn switch_to_next_chunk_buffer(&mut self, published: &Published) -> QueueResult<()> {
        self.queue.finalize_current()?;
        self.queue.cq_csn += 1;
        if self.queue.cq_csn - self.cursors.cks_csn >= CHUNK_BUFFERS {
            self.persist_finished_chunk_buffers(published)?;
        }
        self.queue.begin_current();
        Ok(())
    }

    fn persist_finished_chunk_buffers(&mut self, published: &Published) -> QueueResult<()> {
        while self.cursors.cks_csn.lt(self.queue.cq_csn) {
            let csn = self.cursors.cks_csn;
            if csn - self.cursors.cks_discard_csn >= self.store.chunk_count() {
                // Writing `csn` would overwrite the oldest chunk the last commit still covers.
                self.commit(published)?;
                if csn - self.cursors.cks_discard_csn >= self.store.chunk_count() {
                    return Err(QueueError::InvalidState(format!(
                        "chunk store full at csn {csn}"
                    )));
                }
            }
            let cb = self.queue.buffer(csn);
            self.store.write_chunk(csn, cb.data.as_slice())?;
            self.cursors.cks_csn = csn + 1;
            self.cursors.cks_msn = cb.last_msn;
            self.cursors.cks_ssn = cb.last_ssn;
            self.stats.chunks_written += 1;
        }
        Ok(())
    }

    fn persist_unpersisted_slots(&mut self, slots: &SlotRing, target: Ssn) -> QueueResult<()> {
        self.cursors.reset_wal_if_behind();
        let from = self.cursors.wal_ssn;
        if !from.lt(target) {
            return Ok(());
        }
        let count = target - from;
        if count > self.slot_count {
            return Err(QueueError::integrity(format!(
                "wal range {from}..{target} exceeds the slot ring"
            )));
        }
        let start = slots.index_of(from);
        let first = (count as usize).min(slots.slot_count() as usize - start);
        self.write_wal_range(slots, start, first)?;
        if first < count as usize {
            self.write_wal_range(slots, 0, count as usize - first)?;
        }
        self.wal.sync()?;
        self.stats.fsync_calls += 1;
        self.stats.wal_flushes += 1;
        self.stats.wal_flush_bytes += count * SLOT_SIZE as u64;

        let leaders = (0..count)
            .filter(|i| slots.header(from + *i).is_leader())
            .count() as u64;
        self.cursors.wal_ssn = target;
        self.cursors.wal_msn += leaders;
        Ok(())
    }

    fn write_wal_range(
        &mut self,
        slots: &SlotRing,
        start: usize,
        count: usize,
    ) -> QueueResult<()> {
        self.wal_buf.clear();
        slots
            .copy_range(start, count, &mut self.wal_buf)
            .ok_or_else(|| {
                QueueError::InvalidState(format!("slot range {start}+{count} leaves the ring"))
            })?;
        self.wal.write_all_at(&self.wal_buf, (start * SLOT_SIZE) as u64)
    }

    /// Make the chunk store durable, rewrite the commit record and publish the new cursors.
    pub(crate) fn commit(&mut self, published: &Published) -> QueueResult<()> {
        self.store.sync()?;
        self.stats.fsync_calls += 1;
        self.cursors.reset_wal_if_behind();

        let old_discard = self.cursors.cks_discard_csn;
        let discard = self.store.next_discard(self.cursors.cks_csn, old_discard);
        let rec = CommitRecord {
            inqueue_slotcount: self.slot_count,
            slotsfile_size_bytes: self.slot_count * SLOT_SIZE as u64,
            wal_ssn: self.cursors.wal_ssn,
            wal_msn: self.cursors.wal_msn,
            chunkfile_size_bytes: self.store.capacity_bytes(),
            cks_csn: self.cursors.cks_csn,
            cks_msn: self.cursors.cks_msn,
            cks_ssn: self.cursors.cks_ssn,
            cks_discard_csn: discard,
        };
        self.state.write_all_at(&rec.encode()?, 0)?;
        self.state.sync()?;
        self.stats.fsync_calls += 1;

        if discard != old_discard {
            log::debug!("discarded chunks {old_discard}..{discard}");
            self.stats.chunks_discarded += discard - old_discard;
        }
        self.cursors.cks_discard_csn = discard;
        self.committed = Some(self.cursors);

        *published.persist.lock() = self.cursors;
        publish_stats(published, self.stats);
        Ok(())
    }
}

fn publish_stats(published: &Published, stats: PersisterStats) {
    *published.persister_stats.lock() = stats;
}
