//! Chunk buffers, the chunk queue that fills them, and the on-disk chunk store.
//!
//! ## Public invariants
//!
//! - A message is packed into exactly one chunk. Before appending, [`ChunkQueue::fits`] checks
//!   that the message bytes plus the grown offset table still fit `CHUNK_SIZE`; if not, the
//!   current buffer is finalized and the message goes to the next one.
//! - Finalizing writes the header, zeroes the gap between the last message and the offset table,
//!   and places `msgcount + 1` offsets so that the table ends exactly at `CHUNK_SIZE`.
//! - Chunk `csn` lives at byte `(csn & (chunk_count - 1)) << CHUNK_SHIFT` of `chunks.dat`.

use crate::buffer::ByteBuf;
use crate::error::{QueueError, QueueResult};
use crate::formats::{
    ChunkHeader, CHUNK_HEADER_SIZE, CHUNK_OFFSET_SIZE, CHUNK_SHIFT, CHUNK_SIZE,
};
use crate::seqnum::{mask_power_of_2, ChunkTag, Csn, Msn, RingBuffer, Ssn};
use crate::storage::QueueFile;
use std::sync::Arc;

/// Number of in-memory chunk buffers.
pub const CHUNK_BUFFERS: u64 = 2;

/// Chunks kept below capacity after a discard.
const DISCARD_LOW_MARGIN: u64 = 512;
/// Chunks below capacity at which discarding starts.
const DISCARD_HIGH_MARGIN: u64 = 256;

/// One in-memory chunk image plus the cursors it covers.
pub(crate) struct ChunkBuffer {
    pub(crate) data: ByteBuf,
    /// First MSN in this chunk.
    pub(crate) msn: Msn,
    /// First SSN compacted into this chunk.
    pub(crate) ssn: Ssn,
    /// MSN after the last message (set when finalized).
    pub(crate) last_msn: Msn,
    /// SSN after the last compacted slot (set when finalized).
    pub(crate) last_ssn: Ssn,
}

impl Default for ChunkBuffer {
    fn default() -> Self {
        Self {
            data: ByteBuf::zeroed(CHUNK_SIZE),
            msn: Msn::default(),
            ssn: Ssn::default(),
            last_msn: Msn::default(),
            last_ssn: Ssn::default(),
        }
    }
}

/// The two chunk buffers and the cursors of the one currently being filled.
pub(crate) struct ChunkQueue {
    buffers: RingBuffer<ChunkTag, ChunkBuffer>,
    /// CSN of the buffer being filled.
    pub(crate) cq_csn: Csn,
    /// Next MSN to be compacted.
    pub(crate) cq_msn: Msn,
    /// Next SSN to be compacted.
    pub(crate) cq_ssn: Ssn,
    /// Offsets of the current buffer; `offsets.len() == msg_count + 1`.
    offsets: Vec<u16>,
}

impl ChunkQueue {
    /// A queue whose next chunk is `csn`, starting at `msn`/`ssn`. Call
    /// [`begin_current`](Self::begin_current) before appending.
    pub(crate) fn new(csn: Csn, msn: Msn, ssn: Ssn) -> QueueResult<Self> {
        let buffers = RingBuffer::with_capacity(CHUNK_BUFFERS as usize)
            .ok_or_else(|| QueueError::InvalidState("chunk buffer pool".into()))?;
        Ok(Self {
            buffers,
            cq_csn: csn,
            cq_msn: msn,
            cq_ssn: ssn,
            offsets: Vec::with_capacity(CHUNK_SIZE / 3),
        })
    }

    /// Messages in the current buffer.
    pub(crate) fn msg_count(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Reset the buffer for `cq_csn` to start at the current cursors.
    ///
    /// The caller makes sure the buffer previously stored under this ring index is on disk.
    pub(crate) fn begin_current(&mut self) {
        let (msn, ssn) = (self.cq_msn, self.cq_ssn);
        let cb = self.buffers.get_mut(self.cq_csn);
        cb.msn = msn;
        cb.ssn = ssn;
        cb.last_msn = Msn::default();
        cb.last_ssn = Ssn::default();
        self.offsets.clear();
        self.offsets.push(CHUNK_HEADER_SIZE as u16);
    }

    /// Whether a message of `size` bytes fits the current buffer.
    pub(crate) fn fits(&self, size: usize) -> bool {
        let count = self.msg_count();
        let table_off = CHUNK_SIZE.saturating_sub((count + 2) * CHUNK_OFFSET_SIZE);
        let end = self.end_offset() + size;
        end <= table_off
    }

    fn end_offset(&self) -> usize {
        self.offsets
            .last()
            .map(|o| *o as usize)
            .unwrap_or(CHUNK_HEADER_SIZE)
    }

    /// Append one message that spanned `nslots` slots.
    ///
    /// The caller has checked [`fits`](Self::fits).
    pub(crate) fn append_message(&mut self, data: &[u8], nslots: u64) -> QueueResult<()> {
        let off = self.end_offset();
        let cb = self.buffers.get_mut(self.cq_csn);
        if !cb.data.copy_in(off, data) {
            return Err(QueueError::InvalidState(format!(
                "message of {} bytes overflows chunk buffer at offset {off}",
                data.len()
            )));
        }
        self.offsets.push((off + data.len()) as u16);
        self.cq_ssn += nslots;
        self.cq_msn += 1;
        Ok(())
    }

    /// Write header, gap and offset table of the current buffer and record its end cursors.
    pub(crate) fn finalize_current(&mut self) -> QueueResult<()> {
        let count = self.msg_count();
        let table_bytes = self.offsets.len() * CHUNK_OFFSET_SIZE;
        let table_off = CHUNK_SIZE - table_bytes;
        let end = self.end_offset();
        let (cq_msn, cq_ssn) = (self.cq_msn, self.cq_ssn);
        let cb = self.buffers.get_mut(self.cq_csn);
        debug_assert_eq!(cq_msn - cb.msn, count as u64);

        cb.last_msn = cq_msn;
        cb.last_ssn = cq_ssn;

        let hdr = ChunkHeader {
            msn: cb.msn.value(),
            msgcount: count as u16,
            msgoffsets_off: table_off as u16,
        };
        let mut w = cb
            .data
            .get_mut(0..ChunkHeader::SIZE)
            .ok_or_else(|| QueueError::InvalidState("chunk buffer too small".into()))?;
        hdr.write(&mut w)?;

        if !cb.data.zero_range(end..table_off) {
            return Err(QueueError::InvalidState(format!(
                "chunk gap {end}..{table_off} is invalid"
            )));
        }
        for (i, o) in self.offsets.iter().enumerate() {
            let at = table_off + i * CHUNK_OFFSET_SIZE;
            if !cb.data.write_u16_le(at, *o) {
                return Err(QueueError::InvalidState(format!(
                    "offset table entry {i} at {at} is outside the chunk"
                )));
            }
        }
        log::debug!(
            "finalized chunk {}: msn {}..{}, {} messages",
            self.cq_csn,
            cb.msn,
            cb.last_msn,
            count
        );
        Ok(())
    }

    /// The buffer for `csn`.
    pub(crate) fn buffer(&self, csn: Csn) -> &ChunkBuffer {
        self.buffers.get(csn)
    }
}

/// The on-disk ring of chunks.
pub struct ChunkStore {
    file: Arc<dyn QueueFile>,
    capacity_bytes: u64,
    chunk_count: u64,
    mask: u64,
    low_watermark: u64,
    high_watermark: u64,
}

impl ChunkStore {
    /// Wrap `file`, which must be `capacity_bytes` long (a power of two, at least 64 MiB).
    pub(crate) fn new(file: Arc<dyn QueueFile>, capacity_bytes: u64) -> QueueResult<Self> {
        if !capacity_bytes.is_power_of_two() || capacity_bytes < crate::config::MIN_CHUNK_STORE_SIZE
        {
            return Err(QueueError::InvalidConfig(format!(
                "chunk store size {capacity_bytes} is not a power of two >= 64 MiB"
            )));
        }
        let chunk_count = capacity_bytes >> CHUNK_SHIFT;
        Ok(Self {
            file,
            capacity_bytes,
            chunk_count,
            mask: mask_power_of_2(chunk_count),
            low_watermark: chunk_count - DISCARD_LOW_MARGIN,
            high_watermark: chunk_count - DISCARD_HIGH_MARGIN,
        })
    }

    /// Size of `chunks.dat`.
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Number of chunks in the ring.
    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    /// Chunks kept after a discard.
    pub fn low_watermark(&self) -> u64 {
        self.low_watermark
    }

    /// Chunk occupancy at which a commit discards.
    pub fn high_watermark(&self) -> u64 {
        self.high_watermark
    }

    fn offset_of(&self, csn: Csn) -> u64 {
        (csn.value() & self.mask) << CHUNK_SHIFT
    }

    /// The discard cursor the next commit should record.
    pub fn next_discard(&self, cks_csn: Csn, discard: Csn) -> Csn {
        if cks_csn - discard < self.high_watermark {
            return discard;
        }
        cks_csn - self.low_watermark
    }

    pub(crate) fn write_chunk(&self, csn: Csn, image: &[u8]) -> QueueResult<()> {
        debug_assert_eq!(image.len(), CHUNK_SIZE);
        self.file.write_all_at(image, self.offset_of(csn))
    }

    pub(crate) fn read_chunk(&self, csn: Csn, out: &mut ByteBuf) -> QueueResult<()> {
        self.file.read_exact_at(out.as_mut_slice(), self.offset_of(csn))
    }

    /// Read only the header of chunk `csn`.
    pub(crate) fn read_header(&self, csn: Csn) -> QueueResult<ChunkHeader> {
        let mut buf = [0u8; ChunkHeader::SIZE];
        self.file.read_exact_at(&mut buf, self.offset_of(csn))?;
        ChunkHeader::parse(&buf)
    }

    pub(crate) fn sync(&self) -> QueueResult<()> {
        self.file.sync()
    }
}
