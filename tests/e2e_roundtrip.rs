//! End-to-end round trip through a filesystem-backed queue.

mod support;

use pmq::{Queue, QueueError, ReadOutcome};
use support::{drain, payload, small_config};

#[test]
fn messages_of_every_slot_span_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let q = Queue::open(tmp.path().join("q"), &small_config()).unwrap();

    // Sizes around slot and chunk boundaries.
    let sizes = [
        1usize, 111, 112, 113, 224, 225, 1000, 4096, 30_000, 65_516, 7, 65_000, 12,
    ];
    let msgs: Vec<Vec<u8>> = sizes
        .iter()
        .enumerate()
        .map(|(i, n)| payload(i as u64, *n))
        .collect();
    for (i, m) in msgs.iter().enumerate() {
        assert_eq!(q.enqueue(m).unwrap(), i as u64);
    }
    q.sync().unwrap();

    let mut r = q.reader();
    r.seek_to_oldest().unwrap();
    assert_eq!(drain(&mut r), msgs);
    assert!(r.is_eof());
    assert_eq!(r.current_msn(), msgs.len() as u64);
}

#[test]
fn seek_to_msg_lands_on_each_message() {
    let tmp = tempfile::tempdir().unwrap();
    let q = Queue::open(tmp.path().join("q"), &small_config()).unwrap();
    let msgs: Vec<Vec<u8>> = (0..120u64)
        .map(|i| payload(i, 900 + (i as usize * 131) % 3000))
        .collect();
    for m in &msgs {
        q.enqueue(m).unwrap();
    }
    q.sync().unwrap();
    let info = q.persist_info();
    assert!(info.cks_msn > 0, "some messages must be in the chunk store");

    let mut r = q.reader();
    let mut buf = Vec::new();
    for msn in (0..120u64).rev().step_by(7) {
        r.seek_to_msg(msn).unwrap();
        let want = &msgs[msn as usize];
        assert_eq!(r.read_vec(&mut buf).unwrap(), ReadOutcome::Message(want.len()));
        assert_eq!(&buf, want);
    }

    r.seek_to_msg(120).unwrap();
    assert_eq!(r.read_vec(&mut buf).unwrap(), ReadOutcome::EndOfData);
    assert!(matches!(
        r.seek_to_msg(121),
        Err(QueueError::OutOfBounds { msn: 121 })
    ));
}

#[test]
fn small_buffer_does_not_consume_in_chunk_mode() {
    let tmp = tempfile::tempdir().unwrap();
    let q = Queue::open(tmp.path().join("q"), &small_config()).unwrap();
    for i in 0..30u64 {
        q.enqueue(&payload(i, 8_000)).unwrap();
    }
    q.sync().unwrap();
    assert!(q.persist_info().cks_msn > 1);

    let mut r = q.reader();
    r.seek_to_oldest().unwrap();
    let mut tiny = [0u8; 100];
    assert_eq!(
        r.read(&mut tiny).unwrap(),
        ReadOutcome::BufferTooSmall { required: 8_000 }
    );
    assert_eq!(r.current_msn(), 0);
    let mut big = vec![0u8; 10_000];
    assert_eq!(r.read(&mut big).unwrap(), ReadOutcome::Message(8_000));
    assert_eq!(&big[..8_000], &payload(0, 8_000)[..]);
}

#[test]
fn new_reader_starts_at_the_end() {
    let tmp = tempfile::tempdir().unwrap();
    let q = Queue::open(tmp.path().join("q"), &small_config()).unwrap();
    q.enqueue(b"old").unwrap();
    q.sync().unwrap();

    let mut r = q.reader();
    assert!(r.is_eof());
    q.enqueue(b"new").unwrap();
    assert!(r.is_eof());
    q.sync().unwrap();
    assert!(!r.is_eof());
    assert_eq!(drain(&mut r), vec![b"new".to_vec()]);
    assert_eq!(r.persist_info().wal_msn, 2);
}
