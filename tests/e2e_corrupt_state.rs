//! Corruption of the commit record and of chunk data.

mod support;

use pmq::formats::{CHUNKS_FILE, STATE_FILE};
use pmq::storage::Directory;
use pmq::{MemoryDirectory, Queue, QueueError};
use std::sync::Arc;
use support::{drain, payload, small_config};

fn queue_with_data(dir: &MemoryDirectory) -> Queue {
    let q = Queue::open_in(Arc::new(dir.clone()), &small_config()).unwrap();
    for i in 0..40 {
        q.enqueue(&payload(i, 6_000)).unwrap();
    }
    q.sync().unwrap();
    q
}

#[test]
fn flipped_bit_in_the_commit_record_is_rejected() {
    let dir = MemoryDirectory::new();
    drop(queue_with_data(&dir));
    dir.poke(STATE_FILE, 40, &[0xFF]).unwrap();
    let err = Queue::open_in(Arc::new(dir), &small_config()).err().unwrap();
    assert!(matches!(err, QueueError::CrcMismatch { .. }), "{err}");
}

#[test]
fn wrong_magic_is_a_format_error() {
    let dir = MemoryDirectory::new();
    drop(queue_with_data(&dir));
    dir.poke(STATE_FILE, 0, b"XXXX").unwrap();
    let err = Queue::open_in(Arc::new(dir), &small_config()).err().unwrap();
    assert!(matches!(err, QueueError::Format(_)), "{err}");
}

#[test]
fn corrupt_chunk_header_is_a_sticky_integrity_error() {
    let dir = MemoryDirectory::new();
    let q = queue_with_data(&dir);
    let info = q.persist_info();
    assert!(info.cks_msn > 0 && info.cks_msn < 40);

    // msgcount of chunk 0 := 0
    dir.poke(CHUNKS_FILE, 8, &[0, 0]).unwrap();

    let mut r = q.reader();
    let err = r.seek_to_oldest().unwrap_err();
    assert!(err.is_integrity(), "{err}");
    assert!(r.read(&mut [0u8; 64]).unwrap_err().is_integrity());
    assert!(r.read(&mut [0u8; 64]).unwrap_err().is_integrity());

    // A successful seek clears it.
    r.seek_to_msg(info.cks_msn).unwrap();
    let rest = drain(&mut r);
    assert_eq!(rest.len() as u64, 40 - info.cks_msn);
    assert_eq!(rest[0], payload(info.cks_msn, 6_000));
}

#[test]
fn corrupt_offset_table_is_detected_on_read() {
    let dir = MemoryDirectory::new();
    let q = queue_with_data(&dir);

    let f = dir.open_file(CHUNKS_FILE).unwrap();
    let mut hdr = [0u8; 16];
    f.read_exact_at(&mut hdr, 0).unwrap();
    let table = u16::from_le_bytes([hdr[10], hdr[11]]) as u64;
    // offsets[1] := 8, below the header.
    dir.poke(CHUNKS_FILE, table + 2, &8u16.to_le_bytes()).unwrap();

    let mut r = q.reader();
    r.seek_to_oldest().unwrap();
    let err = r.read(&mut vec![0u8; 65_536]).unwrap_err();
    assert!(err.is_integrity(), "{err}");
}
