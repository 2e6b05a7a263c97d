//! The commit record: the queue's single recovery anchor.
//!
//! `state.dat` holds exactly one record, rewritten in place (positional write at offset 0,
//! then `fsync`) on every commit.
//!
//! ## Public invariants (must not change without a format bump)
//!
//! - **Layout** (little-endian): `[STATE_MAGIC][FORMAT_VERSION:u32][inqueue_slotcount]
//!   [slotsfile_size_bytes][wal_ssn][wal_msn][chunkfile_size_bytes][cks_csn][cks_msn][cks_ssn]
//!   [cks_discard_csn]` (all `u64`), then `crc32:u32` over the first 80 bytes, zero padded to
//!   [`CommitRecord::SIZE`].
//! - **Ordering**: `cks_discard_csn <= cks_csn`, `cks_ssn <= wal_ssn`, `cks_msn <= wal_msn`
//!   (wraparound-safe).
//! - **Sizes**: the chunk file is a power-of-two multiple of `CHUNK_SIZE` no smaller than
//!   [`crate::config::MIN_CHUNK_STORE_SIZE`]; the slots file is `inqueue_slotcount * SLOT_SIZE`;
//!   cursor distances never exceed the capacity of the file they index.

use crate::config::MIN_CHUNK_STORE_SIZE;
use crate::error::{QueueError, QueueResult};
use crate::formats::{CHUNK_SIZE, FORMAT_VERSION, SLOT_SIZE, STATE_MAGIC};
use crate::seqnum::{Csn, Msn, Ssn};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Durable snapshot of all file sizes and persister cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitRecord {
    /// Number of slots in the in-memory ring.
    pub inqueue_slotcount: u64,
    /// Size of `wal.dat`.
    pub slotsfile_size_bytes: u64,
    /// Next SSN to be flushed to the WAL.
    pub wal_ssn: Ssn,
    /// MSN corresponding to `wal_ssn`.
    pub wal_msn: Msn,
    /// Size of `chunks.dat`.
    pub chunkfile_size_bytes: u64,
    /// Next CSN to be written to the chunk store.
    pub cks_csn: Csn,
    /// First MSN not yet in the chunk store.
    pub cks_msn: Msn,
    /// First SSN not yet in the chunk store.
    pub cks_ssn: Ssn,
    /// Oldest CSN that has not been discarded.
    pub cks_discard_csn: Csn,
}

const CRC_OFFSET: usize = 4 + 4 + 9 * 8;

impl CommitRecord {
    /// Number of bytes in the serialized record (and in `state.dat`).
    pub const SIZE: usize = 128;

    /// Serialize to a fixed-size image.
    pub fn encode(&self) -> QueueResult<[u8; Self::SIZE]> {
        let mut out = [0u8; Self::SIZE];
        {
            let mut w: &mut [u8] = &mut out[..CRC_OFFSET];
            self.write_fields(&mut w)?;
        }
        let crc = crc32fast::hash(&out[..CRC_OFFSET]);
        (&mut out[CRC_OFFSET..CRC_OFFSET + 4]).write_u32::<LittleEndian>(crc)?;
        Ok(out)
    }

    fn write_fields<W: Write>(&self, w: &mut W) -> QueueResult<()> {
        w.write_all(&STATE_MAGIC)?;
        w.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        w.write_u64::<LittleEndian>(self.inqueue_slotcount)?;
        w.write_u64::<LittleEndian>(self.slotsfile_size_bytes)?;
        w.write_u64::<LittleEndian>(self.wal_ssn.value())?;
        w.write_u64::<LittleEndian>(self.wal_msn.value())?;
        w.write_u64::<LittleEndian>(self.chunkfile_size_bytes)?;
        w.write_u64::<LittleEndian>(self.cks_csn.value())?;
        w.write_u64::<LittleEndian>(self.cks_msn.value())?;
        w.write_u64::<LittleEndian>(self.cks_ssn.value())?;
        w.write_u64::<LittleEndian>(self.cks_discard_csn.value())?;
        Ok(())
    }

    /// Parse and checksum-verify a record image.
    pub fn decode(bytes: &[u8]) -> QueueResult<Self> {
        if bytes.len() < Self::SIZE {
            return Err(QueueError::Format(format!(
                "state record too short: {} bytes",
                bytes.len()
            )));
        }
        let mut r = &bytes[..CRC_OFFSET];
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != STATE_MAGIC {
            return Err(QueueError::Format("invalid state file magic".into()));
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(QueueError::Format(format!(
                "state file version mismatch: {version} (expected {FORMAT_VERSION})"
            )));
        }
        let expected = (&bytes[CRC_OFFSET..CRC_OFFSET + 4]).read_u32::<LittleEndian>()?;
        let actual = crc32fast::hash(&bytes[..CRC_OFFSET]);
        if expected != actual {
            return Err(QueueError::CrcMismatch { expected, actual });
        }
        Ok(Self {
            inqueue_slotcount: r.read_u64::<LittleEndian>()?,
            slotsfile_size_bytes: r.read_u64::<LittleEndian>()?,
            wal_ssn: Ssn::new(r.read_u64::<LittleEndian>()?),
            wal_msn: Msn::new(r.read_u64::<LittleEndian>()?),
            chunkfile_size_bytes: r.read_u64::<LittleEndian>()?,
            cks_csn: Csn::new(r.read_u64::<LittleEndian>()?),
            cks_msn: Msn::new(r.read_u64::<LittleEndian>()?),
            cks_ssn: Ssn::new(r.read_u64::<LittleEndian>()?),
            cks_discard_csn: Csn::new(r.read_u64::<LittleEndian>()?),
        })
    }

    /// If the chunk store got ahead of the WAL, move the WAL's valid range up to the chunk
    /// cursor. Returns whether anything changed.
    ///
    /// Only distances within the slot ring are treated as "ahead"; anything larger is left
    /// for [`validate`](Self::validate) to reject.
    pub fn reconcile_wal(&mut self) -> bool {
        if self.wal_ssn.lt(self.cks_ssn) && self.cks_ssn - self.wal_ssn <= self.inqueue_slotcount
        {
            self.wal_ssn = self.cks_ssn;
            self.wal_msn = self.cks_msn;
            return true;
        }
        false
    }

    /// Check internal consistency: cursor ordering and file sizes.
    pub fn validate(&self) -> QueueResult<()> {
        check_order(
            self.cks_discard_csn.value(),
            self.cks_csn.value(),
            "cks_discard_csn",
            "cks_csn",
        )?;
        check_order(self.cks_ssn.value(), self.wal_ssn.value(), "cks_ssn", "wal_ssn")?;
        check_order(self.cks_msn.value(), self.wal_msn.value(), "cks_msn", "wal_msn")?;

        let chunk_bytes = self.chunkfile_size_bytes;
        if chunk_bytes % CHUNK_SIZE as u64 != 0
            || !chunk_bytes.is_power_of_two()
            || chunk_bytes < MIN_CHUNK_STORE_SIZE
        {
            return Err(QueueError::Format(format!(
                "invalid chunk file size {chunk_bytes}: must be a power of two multiple of \
                 {CHUNK_SIZE} and at least {MIN_CHUNK_STORE_SIZE}"
            )));
        }
        let chunk_count = chunk_bytes / CHUNK_SIZE as u64;
        if self.cks_csn - self.cks_discard_csn > chunk_count {
            return Err(QueueError::integrity(format!(
                "chunk cursors {}..{} span more than the {chunk_count} chunks in the store",
                self.cks_discard_csn, self.cks_csn
            )));
        }

        let slot_bytes = self.slotsfile_size_bytes;
        if slot_bytes % SLOT_SIZE as u64 != 0
            || !self.inqueue_slotcount.is_power_of_two()
            || self.inqueue_slotcount.checked_mul(SLOT_SIZE as u64) != Some(slot_bytes)
        {
            return Err(QueueError::Format(format!(
                "invalid slots file size {slot_bytes} for {} slots",
                self.inqueue_slotcount
            )));
        }
        if self.wal_ssn - self.cks_ssn > self.inqueue_slotcount {
            return Err(QueueError::integrity(format!(
                "slot cursors {}..{} span more than the {} slots in the WAL",
                self.cks_ssn, self.wal_ssn, self.inqueue_slotcount
            )));
        }
        Ok(())
    }
}

fn check_order(lo: u64, hi: u64, name_lo: &str, name_hi: &str) -> QueueResult<()> {
    if crate::seqnum::sn64_le(lo, hi) {
        return Ok(());
    }
    Err(QueueError::integrity(format!(
        "state file expects {name_lo} <= {name_hi}, found {lo} > {hi}"
    )))
}
