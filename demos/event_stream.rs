//! Minimal producer/consumer example for `pmq`.
//!
//! A producer thread enqueues events while a background sync worker makes them durable; the
//! main thread tails the queue with a reader. Afterwards the queue is reopened and read from
//! the oldest message to show the data survived.
//!
//! Run:
//! `RUST_LOG=pmq=debug cargo run --example event_stream`

use pmq::{Queue, QueueConfig, ReadOutcome, SyncWorker};
use std::sync::Arc;
use std::time::Duration;

const EVENTS: u64 = 5_000;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("events");
    let config = QueueConfig::default()
        .with_chunk_store_size(pmq::config::MIN_CHUNK_STORE_SIZE)
        .with_slot_count(4096)
        .with_sync_wait_ms(10);

    let queue = Arc::new(Queue::open(&path, &config)?);
    let worker = SyncWorker::spawn(queue.clone())?;

    let consumed = std::thread::scope(|s| -> Result<u64, pmq::QueueError> {
        let producer = queue.clone();
        let handle = s.spawn(move || -> Result<(), pmq::QueueError> {
            for i in 0..EVENTS {
                let event = format!("event {i}: temperature={}", 20 + i % 7);
                producer.enqueue(event.as_bytes())?;
            }
            Ok(())
        });

        let mut reader = queue.reader();
        reader.seek_to_oldest()?;
        let mut buf = Vec::new();
        let mut seen = 0u64;
        while seen < EVENTS {
            match reader.read_vec(&mut buf)? {
                ReadOutcome::Message(_) => {
                    if seen % 1000 == 0 {
                        println!("{}", String::from_utf8_lossy(&buf));
                    }
                    seen += 1;
                }
                ReadOutcome::EndOfData => std::thread::sleep(Duration::from_millis(5)),
                ReadOutcome::BufferTooSmall { .. } => unreachable!("read_vec grows the buffer"),
            }
        }
        handle
            .join()
            .map_err(|_| pmq::QueueError::InvalidState("producer panicked".into()))??;
        Ok(seen)
    })?;

    worker.stop()?;
    let stats = queue.stats();
    println!("consumed {consumed} events");
    println!(
        "enqueued {} messages, {} WAL flushes, {} chunks written",
        stats.enqueuer.total_messages_enqueued, stats.persister.wal_flushes, stats.persister.chunks_written
    );
    match Arc::try_unwrap(queue) {
        Ok(q) => q.close()?,
        Err(_) => return Err("queue still shared".into()),
    }

    let queue = Queue::open(&path, &config)?;
    let mut reader = queue.reader();
    reader.seek_to_oldest()?;
    let mut buf = Vec::new();
    let mut n = 0u64;
    while let ReadOutcome::Message(_) = reader.read_vec(&mut buf)? {
        n += 1;
    }
    println!("after reopen: {n} events, persist info {:?}", queue.persist_info());
    Ok(())
}
