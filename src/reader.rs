//! Readers: independent cursors over the durable part of a queue.
//!
//! A reader is in one of two modes:
//!
//! - **chunk mode**: it holds a private copy of one chunk and walks its offset table,
//! - **slots mode**: it walks leader slots of the in-memory ring between the chunk store and the
//!   WAL cursor, briefly taking the enqueue lock for every message so that the slot cannot be
//!   recycled while it is copied.
//!
//! Only messages below the published `wal_msn` are visible. Old chunks may be discarded (and
//! overwritten) at any time; a reader that falls behind gets [`QueueError::OutOfBounds`] and
//! must re-seek. Integrity and I/O errors are sticky until the next successful seek.

use crate::buffer::ByteBuf;
use crate::error::{QueueError, QueueResult};
use crate::formats::{
    ChunkHeader, CHUNK_HEADER_SIZE, CHUNK_OFFSET_SIZE, CHUNK_SIZE, MAX_MESSAGE_SIZE,
};
use crate::persister::PersistCursors;
use crate::queue::{PersistInfo, Queue};
use crate::seqnum::{Csn, Msn, Ssn};

/// Result of a successful [`Reader::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A message of this many bytes was copied and the reader advanced.
    Message(usize),
    /// The reader is at the durable end of the queue.
    EndOfData,
    /// The buffer is too small; nothing was consumed.
    BufferTooSmall {
        /// Size of the next message.
        required: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Chunks,
    Slots,
}

/// A cursor reading messages back from a [`Queue`].
pub struct Reader<'q> {
    queue: &'q Queue,
    msn: Msn,
    cursors: PersistCursors,
    mode: Mode,
    chunk: ByteBuf,
    chunk_loaded: bool,
    csn: Csn,
    hdr: ChunkHeader,
    ssn: Ssn,
    error: Option<QueueError>,
}

fn out_of_bounds(msn: Msn) -> QueueError {
    QueueError::OutOfBounds { msn: msn.value() }
}

/// MSN continuity between two chunk headers: adjacent chunks must be contiguous, others ordered.
fn check_chunk_msns(a_csn: Csn, a: &ChunkHeader, b_csn: Csn, b: &ChunkHeader) -> QueueResult<()> {
    let ((lo_csn, lo), (hi_csn, hi)) = if a_csn.lt(b_csn) {
        ((a_csn, a), (b_csn, b))
    } else {
        ((b_csn, b), (a_csn, a))
    };
    let lo_end = Msn::new(lo.end_msn());
    let hi_start = Msn::new(hi.msn);
    let ok = if hi_csn - lo_csn == 1 {
        lo_end == hi_start
    } else {
        lo_end.le(hi_start)
    };
    if ok {
        return Ok(());
    }
    Err(QueueError::integrity(format!(
        "msn discontinuity: chunk {lo_csn} ends at {lo_end}, chunk {hi_csn} starts at {hi_start}"
    )))
}

impl<'q> Reader<'q> {
    pub(crate) fn new(queue: &'q Queue) -> Self {
        let cursors = queue.persist_cursors();
        let mut r = Self {
            queue,
            msn: cursors.wal_msn,
            cursors,
            mode: Mode::Slots,
            chunk: ByteBuf::zeroed(CHUNK_SIZE),
            chunk_loaded: false,
            csn: Csn::default(),
            hdr: ChunkHeader::default(),
            ssn: Ssn::default(),
            error: None,
        };
        // A failure stays recorded and is returned by the next read.
        let _ = r.seek_to_current();
        r
    }

    /// MSN of the next message to be read.
    pub fn current_msn(&self) -> u64 {
        self.msn.value()
    }

    /// The queue's durable range.
    pub fn persist_info(&self) -> PersistInfo {
        self.queue.persist_info()
    }

    /// Whether the reader has consumed every durable message.
    pub fn is_eof(&mut self) -> bool {
        self.refresh();
        !self.msn.lt(self.cursors.wal_msn)
    }

    /// Position at the durable end of the queue.
    pub fn seek_to_current(&mut self) -> QueueResult<()> {
        self.seek(|r| {
            r.refresh();
            let msn = r.cursors.wal_msn;
            r.locate(msn)
        })
    }

    /// Position at the oldest message that has not been discarded.
    pub fn seek_to_oldest(&mut self) -> QueueResult<()> {
        self.seek(|r| {
            r.refresh();
            let p = r.cursors;
            if p.cks_csn == p.cks_discard_csn {
                return r.locate(p.cks_msn);
            }
            if r.load_chunk_at(p.cks_discard_csn)? {
                r.mode = Mode::Chunks;
                Ok(())
            } else {
                Err(out_of_bounds(p.cks_msn))
            }
        })
    }

    /// Position at message `msn`.
    pub fn seek_to_msg(&mut self, msn: u64) -> QueueResult<()> {
        let msn = Msn::new(msn);
        self.seek(|r| r.locate(msn))
    }

    fn seek(&mut self, f: impl FnOnce(&mut Self) -> QueueResult<()>) -> QueueResult<()> {
        self.error = None;
        let res = f(self);
        if let Err(e) = &res {
            self.error = Some(e.duplicate());
        }
        res
    }

    /// MSN of the oldest readable message, without moving the reader.
    pub fn oldest_msn(&self) -> QueueResult<u64> {
        let p = self.queue.persist_cursors();
        let mut d = 0u64;
        loop {
            let csn = p.cks_discard_csn + d;
            if !csn.lt(p.cks_csn) {
                return Ok(p.cks_msn.value());
            }
            let hdr = self.queue.store.read_header(csn)?;
            if !csn.lt(self.queue.persist_cursors().cks_discard_csn) {
                hdr.validate(csn.value())?;
                return Ok(hdr.msn);
            }
            d = if d == 0 { 1 } else { d * 2 };
        }
    }

    /// Read the next message into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> QueueResult<ReadOutcome> {
        if let Some(e) = &self.error {
            return Err(e.duplicate());
        }
        let res = self.read_next(buf);
        if let Err(e) = &res {
            if matches!(e, QueueError::Integrity(_) | QueueError::Io(_)) {
                self.error = Some(e.duplicate());
            }
        }
        res
    }

    /// Read the next message into `buf`, growing it as needed. On success `buf` holds exactly
    /// the message.
    pub fn read_vec(&mut self, buf: &mut Vec<u8>) -> QueueResult<ReadOutcome> {
        buf.resize(buf.capacity(), 0);
        loop {
            match self.read(buf)? {
                ReadOutcome::BufferTooSmall { required } => buf.resize(required, 0),
                ReadOutcome::Message(n) => {
                    buf.truncate(n);
                    return Ok(ReadOutcome::Message(n));
                }
                ReadOutcome::EndOfData => {
                    buf.clear();
                    return Ok(ReadOutcome::EndOfData);
                }
            }
        }
    }

    fn refresh(&mut self) {
        self.cursors = self.queue.persist_cursors();
    }

    fn read_next(&mut self, buf: &mut [u8]) -> QueueResult<ReadOutcome> {
        self.refresh();
        if self.msn == self.cursors.wal_msn {
            return Ok(ReadOutcome::EndOfData);
        }
        if self.cursors.wal_msn.lt(self.msn) {
            return Err(out_of_bounds(self.msn));
        }
        // A second round only happens after a re-seek.
        for _ in 0..2 {
            let step = match self.mode {
                Mode::Chunks => self.read_from_chunk(buf)?,
                Mode::Slots => self.read_from_slots(buf)?,
            };
            if let Some(outcome) = step {
                return Ok(outcome);
            }
            let msn = self.msn;
            self.locate(msn)?;
        }
        // Still moving under us: the caller re-seeks.
        Err(out_of_bounds(self.msn))
    }

    /// `None` asks the caller to re-seek.
    fn read_from_chunk(&mut self, buf: &mut [u8]) -> QueueResult<Option<ReadOutcome>> {
        if !self.chunk_loaded {
            return Ok(None);
        }
        if self.msn == Msn::new(self.hdr.end_msn()) {
            let (prev_csn, prev) = (self.csn, self.hdr);
            let msn = self.msn;
            if !self.load_chunk_at(prev_csn + 1)? {
                // The rest is only in the slot ring.
                self.msn = msn;
                return Ok(None);
            }
            check_chunk_msns(prev_csn, &prev, self.csn, &self.hdr)?;
        }

        let index = (self.msn - Msn::new(self.hdr.msn)) as usize;
        if index >= self.hdr.msgcount as usize {
            return Err(QueueError::integrity(format!(
                "message {} is not in chunk {} ({} + {})",
                self.msn, self.csn, self.hdr.msn, self.hdr.msgcount
            )));
        }
        let table = self.hdr.msgoffsets_off as usize;
        let at = |i: usize| self.chunk.read_u16_le(table + i * CHUNK_OFFSET_SIZE);
        let (start, end) = match (at(index), at(index + 1)) {
            (Some(s), Some(e)) => (s as usize, e as usize),
            _ => {
                return Err(QueueError::integrity(format!(
                    "chunk {}: offset table entry {index} out of range",
                    self.csn
                )))
            }
        };
        if start < CHUNK_HEADER_SIZE || end <= start || end > table {
            return Err(QueueError::integrity(format!(
                "chunk {}: invalid offsets {start}..{end} for message {}",
                self.csn, self.msn
            )));
        }
        let len = end - start;
        let Some(dst) = buf.get_mut(..len) else {
            return Ok(Some(ReadOutcome::BufferTooSmall { required: len }));
        };
        let src = self
            .chunk
            .get(start..end)
            .ok_or_else(|| QueueError::integrity("offsets past the chunk end"))?;
        dst.copy_from_slice(src);
        self.msn += 1;
        Ok(Some(ReadOutcome::Message(len)))
    }

    /// `None` asks the caller to re-seek.
    fn read_from_slots(&mut self, buf: &mut [u8]) -> QueueResult<Option<ReadOutcome>> {
        let p = self.cursors;
        if self.ssn == p.wal_ssn {
            return Ok(Some(ReadOutcome::EndOfData));
        }
        if p.wal_ssn.lt(self.ssn) {
            return Err(out_of_bounds(self.msn));
        }
        let slots = &self.queue.slots;
        let enq = self.queue.enqueuer.lock();
        if enq.cursors.ssn_disk.gt(self.ssn) {
            // The slot may already be recycled; the message is in the chunk store by now.
            drop(enq);
            return Ok(None);
        }
        // The enqueue lock is held and `ssn >= ssn_disk`: these slots cannot be recycled now.
        let hdr = slots.header(self.ssn);
        if !hdr.is_leader() {
            return Err(QueueError::integrity(format!(
                "slot {} is not a leader slot",
                self.ssn
            )));
        }
        let size = hdr.msgsize as usize;
        if size == 0 || size > MAX_MESSAGE_SIZE {
            return Err(QueueError::integrity(format!(
                "slot {} has invalid message size {size}",
                self.ssn
            )));
        }
        let nslots = hdr.nslots();
        if nslots > p.wal_ssn - self.ssn {
            return Err(QueueError::integrity(format!(
                "message at slot {} runs past the wal cursor {}",
                self.ssn, p.wal_ssn
            )));
        }
        let Some(dst) = buf.get_mut(..size) else {
            return Ok(Some(ReadOutcome::BufferTooSmall { required: size }));
        };
        slots.copy_message(self.ssn, dst);
        drop(enq);
        self.ssn += nslots;
        self.msn += 1;
        Ok(Some(ReadOutcome::Message(size)))
    }

    /// Find `msn` in the slot ring or the chunk store.
    fn locate(&mut self, msn: Msn) -> QueueResult<()> {
        self.refresh();
        self.msn = msn;
        if self.cursors.wal_msn.lt(msn) {
            return Err(out_of_bounds(msn));
        }
        if !msn.lt(self.cursors.cks_msn) {
            if self.seek_in_slots(msn)? {
                return Ok(());
            }
            self.refresh();
        }
        self.seek_in_chunks(msn)
    }

    /// Walk leader slots up to `msn`. `false` if the slot ring no longer (or not yet)
    /// holds it.
    fn seek_in_slots(&mut self, msn: Msn) -> QueueResult<bool> {
        let slots = &self.queue.slots;
        let enq = self.queue.enqueuer.lock();
        let ic = enq.cursors;
        let p = self.queue.persist_cursors();
        if !msn.in_range(ic.msn_disk, ic.msn) || !p.wal_msn.in_range(msn, ic.msn) {
            return Ok(false);
        }
        let (mut ssn, mut m) = (ic.ssn_disk, ic.msn_disk);
        while m != msn {
            if !ssn.lt(p.wal_ssn) {
                return Err(QueueError::integrity(format!(
                    "slot walk to message {msn} passed the wal cursor {} at slot {ssn}",
                    p.wal_ssn
                )));
            }
            let hdr = slots.header(ssn);
            if !hdr.is_leader() || hdr.msgsize == 0 {
                return Err(QueueError::integrity(format!(
                    "slot {ssn} is not a valid leader slot during seek"
                )));
            }
            ssn += hdr.nslots();
            m += 1;
        }
        drop(enq);
        self.cursors = p;
        self.mode = Mode::Slots;
        self.ssn = ssn;
        self.msn = msn;
        self.chunk_loaded = false;
        Ok(true)
    }

    /// Binary search for `msn` over `[cks_discard_csn, cks_csn - 1]`.
    fn seek_in_chunks(&mut self, msn: Msn) -> QueueResult<()> {
        let p = self.cursors;
        if p.cks_csn == p.cks_discard_csn {
            return Err(out_of_bounds(msn));
        }
        let (mut lo, mut hi) = (p.cks_discard_csn, p.cks_csn - 1);
        let mut prev: Option<(Csn, ChunkHeader)> = None;
        loop {
            let csn = lo + (hi - lo) / 2;
            match self.load_chunk_at(csn) {
                Ok(true) => {}
                Ok(false) => return Err(out_of_bounds(msn)),
                Err(e) if e.is_out_of_bounds() => {
                    // Discarded under us: everything up to here is gone.
                    if csn == hi {
                        return Err(out_of_bounds(msn));
                    }
                    lo = csn + 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
            let hdr = self.hdr;
            if let Some((pcsn, phdr)) = prev {
                check_chunk_msns(pcsn, &phdr, csn, &hdr)?;
            }
            prev = Some((csn, hdr));

            if msn.lt(Msn::new(hdr.msn)) {
                if csn == lo {
                    return Err(out_of_bounds(msn));
                }
                hi = csn - 1;
            } else if !msn.lt(Msn::new(hdr.end_msn())) {
                if csn == hi {
                    return Err(out_of_bounds(msn));
                }
                lo = csn + 1;
            } else {
                self.mode = Mode::Chunks;
                self.msn = msn;
                return Ok(());
            }
        }
    }

    /// Copy chunk `csn` and make it current. `false` if it is not in the chunk store yet.
    fn load_chunk_at(&mut self, csn: Csn) -> QueueResult<bool> {
        if !csn.lt(self.cursors.cks_csn) {
            return Ok(false);
        }
        self.chunk_loaded = false;
        self.queue.store.read_chunk(csn, &mut self.chunk)?;
        self.refresh();
        if csn.lt(self.cursors.cks_discard_csn) {
            return Err(out_of_bounds(self.msn));
        }
        let hdr = ChunkHeader::parse(self.chunk.as_slice())?;
        hdr.validate(csn.value())?;
        self.csn = csn;
        self.hdr = hdr;
        self.msn = Msn::new(hdr.msn);
        self.chunk_loaded = true;
        Ok(true)
    }
}
