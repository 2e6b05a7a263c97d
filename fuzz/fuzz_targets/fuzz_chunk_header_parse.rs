#![no_main]

use libfuzzer_sys::fuzz_target;
use pmq::formats::{ChunkHeader, SlotHeader};

/// byte 0..8: csn, rest: chunk (or slot) bytes.
fuzz_target!(|data: &[u8]| {
    if data.len() < 8 {
        return;
    }
    let mut csn = [0u8; 8];
    csn.copy_from_slice(&data[..8]);
    let body = &data[8..];
    if let Ok(hdr) = ChunkHeader::parse(body) {
        if hdr.validate(u64::from_le_bytes(csn)).is_ok() {
            let _ = hdr.end_msn();
        }
    }
    if let Some(slot) = body.get(..pmq::formats::SLOT_SIZE) {
        let mut s = [0u8; pmq::formats::SLOT_SIZE];
        s.copy_from_slice(slot);
        let h = SlotHeader::read_from(&s);
        let _ = (h.is_leader(), h.nslots());
    }
});
