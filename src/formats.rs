//! On-disk layout constants and the slot / chunk header codecs.
//!
//! ## Public invariants (must not change without a format bump)
//!
//! - **Slot**: `SLOT_SIZE` bytes, `[flags:u32][msgsize:u32][pad:u32][pad:u32][payload]`
//!   (little-endian). `flags & SLOT_LEADER_FLAG` marks the first slot of a message. `msgsize`
//!   is the number of message bytes remaining *from this slot onward*, so only the leader
//!   carries the full size.
//! - **Chunk**: `CHUNK_SIZE` bytes, `[msn:u64][msgcount:u16][msgoffsets_off:u16][pad:u32]`,
//!   then packed message bytes from offset `CHUNK_HEADER_SIZE`, then `msgcount + 1` `u16`
//!   offsets ending exactly at `CHUNK_SIZE`.
//! - Headers are encoded and decoded explicitly; buffers are never reinterpreted in place.

use crate::error::{QueueError, QueueResult};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Size of one slot in the in-memory ring and in `wal.dat`.
pub const SLOT_SIZE: usize = 128;
/// Size of the slot header.
pub const SLOT_HEADER_SIZE: usize = 16;
/// Payload bytes per slot.
pub const SLOT_PAYLOAD: usize = SLOT_SIZE - SLOT_HEADER_SIZE;
/// Leader bit in the slot flags.
pub const SLOT_LEADER_FLAG: u32 = 1;

/// log2 of the chunk size.
pub const CHUNK_SHIFT: u32 = 16;
/// Size of one chunk.
pub const CHUNK_SIZE: usize = 1 << CHUNK_SHIFT;
/// Size of the chunk header.
pub const CHUNK_HEADER_SIZE: usize = 16;
/// Size of one entry of the chunk offset table.
pub const CHUNK_OFFSET_SIZE: usize = 2;

/// Largest message that fits a chunk on its own (header plus a two-entry offset table).
pub const MAX_MESSAGE_SIZE: usize = CHUNK_SIZE - CHUNK_HEADER_SIZE - 2 * CHUNK_OFFSET_SIZE;

/// Name of the slots file (the WAL tail).
pub const WAL_FILE: &str = "wal.dat";
/// Name of the chunk store file.
pub const CHUNKS_FILE: &str = "chunks.dat";
/// Name of the state file holding the commit record.
pub const STATE_FILE: &str = "state.dat";

/// Magic bytes of the commit record.
pub const STATE_MAGIC: [u8; 4] = *b"PMQS";
/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Number of slots needed for a message of `size` bytes.
#[inline]
pub fn slots_for(size: u64) -> u64 {
    size.div_ceil(SLOT_PAYLOAD as u64)
}

/// Decoded slot header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotHeader {
    /// Slot flags (`SLOT_LEADER_FLAG`).
    pub flags: u32,
    /// Message bytes remaining from this slot onward.
    pub msgsize: u32,
}

impl SlotHeader {
    /// Whether this is the first slot of a message.
    #[inline]
    pub fn is_leader(&self) -> bool {
        self.flags & SLOT_LEADER_FLAG != 0
    }

    /// Number of slots spanned from here to the end of the message.
    #[inline]
    pub fn nslots(&self) -> u64 {
        slots_for(self.msgsize as u64)
    }

    /// Encode into the first `SLOT_HEADER_SIZE` bytes of `slot`.
    pub fn write_to(&self, slot: &mut [u8; SLOT_SIZE]) {
        LittleEndian::write_u32(&mut slot[0..4], self.flags);
        LittleEndian::write_u32(&mut slot[4..8], self.msgsize);
        slot[8..SLOT_HEADER_SIZE].fill(0);
    }

    /// Decode from the first `SLOT_HEADER_SIZE` bytes of `slot`.
    pub fn read_from(slot: &[u8; SLOT_SIZE]) -> Self {
        Self {
            flags: LittleEndian::read_u32(&slot[0..4]),
            msgsize: LittleEndian::read_u32(&slot[4..8]),
        }
    }
}

/// Decoded chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkHeader {
    /// MSN of the first message in the chunk.
    pub msn: u64,
    /// Number of messages in the chunk.
    pub msgcount: u16,
    /// Byte offset of the offset table.
    pub msgoffsets_off: u16,
}

impl ChunkHeader {
    /// Number of bytes in the serialized header.
    pub const SIZE: usize = CHUNK_HEADER_SIZE;

    /// Write the header to a stream.
    pub fn write<W: Write>(&self, w: &mut W) -> QueueResult<()> {
        w.write_u64::<LittleEndian>(self.msn)?;
        w.write_u16::<LittleEndian>(self.msgcount)?;
        w.write_u16::<LittleEndian>(self.msgoffsets_off)?;
        w.write_u32::<LittleEndian>(0)?;
        Ok(())
    }

    /// Read the header from a stream.
    pub fn read<R: Read + ?Sized>(r: &mut R) -> QueueResult<Self> {
        let msn = r.read_u64::<LittleEndian>()?;
        let msgcount = r.read_u16::<LittleEndian>()?;
        let msgoffsets_off = r.read_u16::<LittleEndian>()?;
        let _pad = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            msn,
            msgcount,
            msgoffsets_off,
        })
    }

    /// Decode from the start of a chunk image.
    pub fn parse(chunk: &[u8]) -> QueueResult<Self> {
        let mut r = chunk
            .get(..Self::SIZE)
            .ok_or_else(|| QueueError::integrity("chunk shorter than its header"))?;
        Self::read(&mut r)
    }

    /// Check that the header describes a usable chunk.
    ///
    /// `csn` is only used for the error message.
    pub fn validate(&self, csn: u64) -> QueueResult<()> {
        if self.msgcount == 0 {
            return Err(QueueError::integrity(format!(
                "chunk {csn}: msgcount is 0"
            )));
        }
        let off_end =
            self.msgoffsets_off as usize + (self.msgcount as usize + 1) * CHUNK_OFFSET_SIZE;
        if off_end > CHUNK_SIZE {
            return Err(QueueError::integrity(format!(
                "chunk {csn}: offset table exceeds chunk size (msgcount {}, msgoffsets_off {})",
                self.msgcount, self.msgoffsets_off
            )));
        }
        Ok(())
    }

    /// MSN one past the last message in this chunk.
    #[inline]
    pub fn end_msn(&self) -> u64 {
        self.msn.wrapping_add(self.msgcount as u64)
    }
}
