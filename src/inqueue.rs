//! The in-memory slot ring and the enqueuer's private state.
//!
//! Every message enters the queue here: it is cut into `SLOT_PAYLOAD`-sized pieces, each
//! stored in one 128-byte slot of a power-of-two ring indexed by SSN.
//!
//! ## Sharing protocol
//!
//! Each slot sits behind its own lock, held only while one slot is copied in or out. Which
//! slots hold valid data is decided by the cursors:
//!
//! - the **enqueuer** writes slots `[ssn_mem, ssn_disk + slot_count)` while holding the
//!   enqueue lock; `ssn_disk` is a (possibly stale, never ahead) copy of the persister's
//!   `cks_ssn`,
//! - the **persister** reads slots in `[cks_ssn, published ssn_mem)` while holding the persist
//!   lock,
//! - **readers** read slots in `[ssn_disk, wal_ssn)` while holding the enqueue lock.
//!
//! The enqueuer's write window only ever covers ring positions whose previous contents are
//! below `ssn_disk`, so nobody reads a slot that is being rewritten for a newer message.

use crate::error::{QueueError, QueueResult};
use crate::formats::{SlotHeader, SLOT_HEADER_SIZE, SLOT_LEADER_FLAG, SLOT_PAYLOAD, SLOT_SIZE};
use crate::seqnum::{Msn, RingBuffer, SlotTag, Ssn};
use crate::storage::QueueFile;
use parking_lot::RwLock;
use serde::Serialize;

/// Fixed-size ring of slots, shared according to the protocol in the module docs.
pub(crate) struct SlotRing {
    ring: RingBuffer<SlotTag, RwLock<[u8; SLOT_SIZE]>>,
}

impl SlotRing {
    /// Allocate a zeroed ring of `slot_count` slots (a power of two).
    pub(crate) fn new(slot_count: u64) -> QueueResult<Self> {
        let n = usize::try_from(slot_count)
            .map_err(|_| QueueError::InvalidConfig(format!("slot_count too large: {slot_count}")))?;
        let ring = RingBuffer::from_fn(n, |_| RwLock::new([0u8; SLOT_SIZE])).ok_or_else(|| {
            QueueError::InvalidConfig(format!("slot_count must be a power of two: {slot_count}"))
        })?;
        Ok(Self { ring })
    }

    pub(crate) fn slot_count(&self) -> u64 {
        self.ring.slot_count()
    }

    pub(crate) fn index_of(&self, ssn: Ssn) -> usize {
        self.ring.index_of(ssn)
    }

    /// Fill the whole ring from `file` (the WAL), before the ring is shared.
    pub(crate) fn load_from(&mut self, file: &dyn QueueFile) -> QueueResult<()> {
        const BATCH: usize = 512;
        let total = self.ring.as_slice().len();
        let mut buf = vec![0u8; BATCH * SLOT_SIZE];
        let mut start = 0usize;
        while start < total {
            let n = BATCH.min(total - start);
            let bytes = &mut buf[..n * SLOT_SIZE];
            file.read_exact_at(bytes, (start * SLOT_SIZE) as u64)?;
            for (i, src) in bytes.chunks_exact(SLOT_SIZE).enumerate() {
                let ssn = Ssn::new((start + i) as u64);
                self.ring.get_mut(ssn).get_mut().copy_from_slice(src);
            }
            start += n;
        }
        Ok(())
    }

    /// Decoded header of slot `ssn`.
    pub(crate) fn header(&self, ssn: Ssn) -> SlotHeader {
        SlotHeader::read_from(&self.ring.get(ssn).read())
    }

    /// Copy the message starting at leader slot `ssn` into `dst`, whose length is the
    /// message size.
    pub(crate) fn copy_message(&self, ssn: Ssn, dst: &mut [u8]) {
        for (i, piece) in dst.chunks_mut(SLOT_PAYLOAD).enumerate() {
            let slot = self.ring.get(ssn + i as u64).read();
            piece.copy_from_slice(&slot[SLOT_HEADER_SIZE..SLOT_HEADER_SIZE + piece.len()]);
        }
    }

    /// Overwrite slot `ssn` with `hdr` and `piece`, zeroing the rest of the payload.
    pub(crate) fn write_slot(&self, ssn: Ssn, hdr: SlotHeader, piece: &[u8]) {
        let mut slot = self.ring.get(ssn).write();
        hdr.write_to(&mut slot);
        let payload = &mut slot[SLOT_HEADER_SIZE..];
        payload[..piece.len()].copy_from_slice(piece);
        payload[piece.len()..].fill(0);
    }

    /// Append the raw bytes of `count` slots starting at ring index `start` to `out`, for
    /// writing to the WAL.
    ///
    /// Returns `None` if the range leaves the ring.
    pub(crate) fn copy_range(&self, start: usize, count: usize, out: &mut Vec<u8>) -> Option<()> {
        let cells = self.ring.as_slice().get(start..start.checked_add(count)?)?;
        out.reserve(count * SLOT_SIZE);
        for cell in cells {
            out.extend_from_slice(&cell.read()[..]);
        }
        Some(())
    }

    #[cfg(test)]
    pub(crate) fn update(&self, ssn: Ssn, f: impl FnOnce(&mut [u8; SLOT_SIZE])) {
        f(&mut *self.ring.get(ssn).write());
    }
}

/// Enqueuer-owned cursors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InQueueCursors {
    /// Next MSN to be enqueued.
    pub msn: Msn,
    /// Next SSN to be written in the ring.
    pub ssn_mem: Ssn,
    /// Cached copy of the persister's `cks_msn`.
    pub msn_disk: Msn,
    /// Cached copy of the persister's `cks_ssn`.
    pub ssn_disk: Ssn,
}

impl InQueueCursors {
    /// Slots in use (`ssn_mem - ssn_disk`).
    pub fn fill(&self) -> u64 {
        self.ssn_mem - self.ssn_disk
    }
}

/// Enqueuer statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnqueuerStats {
    /// Messages accepted.
    pub total_messages_enqueued: u64,
    /// Payload bytes accepted.
    pub total_bytes_enqueued: u64,
    /// Times an enqueue found the ring full and had to persist inline.
    pub buffer_full_count: u64,
}

/// State guarded by the enqueue lock.
pub(crate) struct Enqueuer {
    pub(crate) cursors: InQueueCursors,
    pub(crate) stats: EnqueuerStats,
    slot_count: u64,
    watermark: u64,
}

impl Enqueuer {
    pub(crate) fn new(cursors: InQueueCursors, slot_count: u64) -> Self {
        Self {
            cursors,
            stats: EnqueuerStats::default(),
            slot_count,
            watermark: slot_count / 2,
        }
    }

    /// Whether the ring can take slots up to (excluding) `next_ssn_mem`.
    pub(crate) fn has_room_until(&self, next_ssn_mem: Ssn) -> bool {
        next_ssn_mem - self.cursors.ssn_disk <= self.slot_count
    }

    /// Adopt a newer view of the persister's chunk-store position.
    pub(crate) fn refresh_disk(&mut self, cks_ssn: Ssn, cks_msn: Msn) {
        self.cursors.ssn_disk = cks_ssn;
        self.cursors.msn_disk = cks_msn;
    }

    /// Whether the fill level, as last seen by the enqueuer, is at or above the watermark.
    pub(crate) fn at_watermark(&self) -> bool {
        self.cursors.fill() >= self.watermark
    }

    /// Write `data` into the ring at `ssn_mem` and advance the cursors.
    ///
    /// The caller holds the enqueue lock and has made room for `slots_for(data.len())` slots.
    /// Returns whether the fill level just crossed the persist watermark.
    pub(crate) fn serialize(&mut self, slots: &SlotRing, data: &[u8]) -> bool {
        let old_fill = self.cursors.fill();
        let total = data.len();
        let mut ssn = self.cursors.ssn_mem;
        let mut flags = SLOT_LEADER_FLAG;

        for (i, piece) in data.chunks(SLOT_PAYLOAD).enumerate() {
            let hdr = SlotHeader {
                flags,
                msgsize: (total - i * SLOT_PAYLOAD) as u32,
            };
            slots.write_slot(ssn, hdr, piece);
            ssn += 1;
            flags = 0;
        }

        self.cursors.ssn_mem = ssn;
        self.cursors.msn += 1;
        self.stats.total_messages_enqueued += 1;
        self.stats.total_bytes_enqueued += total as u64;

        let new_fill = self.cursors.fill();
        debug_assert!(new_fill <= self.slot_count);
        old_fill < self.watermark && new_fill >= self.watermark
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::slots_for;

    #[test]
    fn serialize_writes_remaining_size_per_slot() {
        let ring = SlotRing::new(16).unwrap();
        let mut enq = Enqueuer::new(InQueueCursors::default(), 16);
        let data: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        assert!(enq.has_room_until(enq.cursors.ssn_mem + slots_for(250)));
        enq.serialize(&ring, &data);

        assert_eq!(enq.cursors.ssn_mem, Ssn::new(3));
        assert_eq!(enq.cursors.msn, Msn::new(1));
        let sizes: Vec<(bool, u32)> = (0..3)
            .map(|i| {
                let h = ring.header(Ssn::new(i));
                (h.is_leader(), h.msgsize)
            })
            .collect();
        assert_eq!(sizes, vec![(true, 250), (false, 138), (false, 26)]);

        let mut back = vec![0u8; 250];
        ring.copy_message(Ssn::new(0), &mut back);
        assert_eq!(back, data);

        let mut raw = Vec::new();
        ring.copy_range(2, 1, &mut raw).unwrap();
        assert_eq!(&raw[SLOT_HEADER_SIZE..SLOT_HEADER_SIZE + 26], &data[224..]);
        assert!(raw[SLOT_HEADER_SIZE + 26..].iter().all(|b| *b == 0));
    }

    #[test]
    fn watermark_crossing_is_reported_once() {
        let ring = SlotRing::new(8).unwrap();
        let mut enq = Enqueuer::new(InQueueCursors::default(), 8);
        assert!(!enq.serialize(&ring, &[1u8; 200]));
        assert!(enq.serialize(&ring, &[2u8; 200]));
        assert!(!enq.serialize(&ring, &[3u8; 10]));
        assert_eq!(enq.cursors.fill(), 5);
        assert_eq!(enq.stats.total_bytes_enqueued, 410);
    }

    #[test]
    fn refreshed_disk_cursor_rearms_the_watermark() {
        let ring = SlotRing::new(8).unwrap();
        let mut enq = Enqueuer::new(InQueueCursors::default(), 8);
        assert!(enq.serialize(&ring, &[1u8; 500]));
        assert!(enq.at_watermark());
        enq.refresh_disk(Ssn::new(5), Msn::new(1));
        assert!(!enq.at_watermark());
        assert!(enq.serialize(&ring, &[2u8; 500]));
    }

    #[test]
    fn room_check_uses_cached_disk_cursor() {
        let mut enq = Enqueuer::new(InQueueCursors::default(), 8);
        enq.cursors.ssn_mem = Ssn::new(8);
        assert!(!enq.has_room_until(Ssn::new(9)));
        enq.refresh_disk(Ssn::new(1), Msn::new(1));
        assert!(enq.has_room_until(Ssn::new(9)));
    }

    #[test]
    fn copy_range_covers_contiguous_slots() {
        let ring = SlotRing::new(4).unwrap();
        let mut enq = Enqueuer::new(InQueueCursors::default(), 4);
        enq.serialize(&ring, &[7u8; 120]);
        let mut bytes = Vec::new();
        ring.copy_range(0, 2, &mut bytes).unwrap();
        assert_eq!(bytes.len(), 2 * SLOT_SIZE);
        assert_eq!(bytes[SLOT_HEADER_SIZE], 7);
        assert_eq!(bytes[SLOT_SIZE + 4], 8);
        assert!(ring.copy_range(3, 2, &mut bytes).is_none());
    }
}
