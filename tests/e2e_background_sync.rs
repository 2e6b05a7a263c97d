//! `sync_when_ready` wakes on the watermark instead of sleeping out its wait, and never holds
//! up the enqueuer while it waits.

mod support;

use pmq::{MemoryDirectory, Queue};
use std::sync::Arc;
use std::time::{Duration, Instant};
use support::small_config;

const LONG_WAIT_MS: u64 = 3_000;
const WELL_BEFORE: Duration = Duration::from_millis(1_500);

fn queue() -> Queue {
    let cfg = small_config().with_sync_wait_ms(LONG_WAIT_MS);
    Queue::open_in(Arc::new(MemoryDirectory::new()), &cfg).unwrap()
}

/// One slot per message.
fn burst(q: &Queue, n: usize) {
    for _ in 0..n {
        q.enqueue(&[0x42u8; 100]).unwrap();
    }
}

#[test]
fn crossing_the_watermark_wakes_a_waiting_sync() {
    support::init_logging();
    let q = queue();

    let waited = std::thread::scope(|s| {
        let waiter = s.spawn(|| {
            let t = Instant::now();
            q.sync_when_ready().unwrap();
            t.elapsed()
        });
        std::thread::sleep(Duration::from_millis(100));
        burst(&q, 600);
        waiter.join().unwrap()
    });

    assert!(waited < WELL_BEFORE, "sync_when_ready took {waited:?}");
    let stats = q.stats().persister;
    assert_eq!(stats.num_async_flushes, 1);
    assert!(q.persist_info().wal_msn >= 512);
}

#[test]
fn new_data_in_an_already_full_ring_wakes_a_waiting_sync() {
    let q = queue();
    // 600 of 1024 slots in use, all of it in the WAL and none in the chunk store.
    burst(&q, 600);
    q.sync().unwrap();
    assert_eq!(q.persist_info().cks_msn, 0);

    let (waited, enqueued_in) = std::thread::scope(|s| {
        let waiter = s.spawn(|| {
            let t = Instant::now();
            q.sync_when_ready().unwrap();
            t.elapsed()
        });
        std::thread::sleep(Duration::from_millis(100));
        let t = Instant::now();
        // Fills the ring: the last of these persists inline.
        burst(&q, 600);
        let enqueued_in = t.elapsed();
        (waiter.join().unwrap(), enqueued_in)
    });

    assert!(waited < WELL_BEFORE, "sync_when_ready took {waited:?}");
    assert!(enqueued_in < WELL_BEFORE, "enqueue stalled for {enqueued_in:?}");
    assert!(q.stats().enqueuer.buffer_full_count >= 1);
    q.sync().unwrap();
    assert_eq!(q.persist_info().wal_msn, 1_200);
}

#[test]
fn idle_ring_waits_for_the_timeout() {
    let cfg = small_config().with_sync_wait_ms(50);
    let q = Queue::open_in(Arc::new(MemoryDirectory::new()), &cfg).unwrap();
    burst(&q, 600);
    q.sync().unwrap();

    // Past the watermark but nothing new: no busy loop.
    let t = Instant::now();
    q.sync_when_ready().unwrap();
    assert!(t.elapsed() >= Duration::from_millis(40));
    assert_eq!(q.stats().persister.wakeups, 0);
}
