//! Shared helpers for integration tests.

#![allow(dead_code)]

mod faulty_directory;
mod read_hook_directory;

pub use faulty_directory::{FaultConfig, FaultyDirectory};
pub use read_hook_directory::ReadHookDirectory;

use pmq::{QueueConfig, ReadOutcome, Reader};

/// Route `log` output through the test harness (`RUST_LOG=pmq=debug` to see it).
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Smallest accepted geometry: 64 MiB chunk store, 1024-slot ring.
pub fn small_config() -> QueueConfig {
    QueueConfig::default()
        .with_chunk_store_size(pmq::config::MIN_CHUNK_STORE_SIZE)
        .with_slot_count(pmq::config::MIN_SLOT_COUNT)
        .with_sync_wait_ms(5)
}

/// Read messages until end of data.
pub fn drain(r: &mut Reader<'_>) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = Vec::new();
    while let ReadOutcome::Message(_) = r.read_vec(&mut buf).unwrap() {
        out.push(buf.clone());
    }
    out
}

/// Deterministic message body for `msn`, `len` bytes.
pub fn payload(msn: u64, len: usize) -> Vec<u8> {
    let mut v = Vec::with_capacity(len);
    let mut x = msn.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    for _ in 0..len {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        v.push(x as u8);
    }
    v
}
