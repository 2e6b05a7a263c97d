//! Queue configuration.
//!
//! Sizes only matter when a queue is created. When an existing queue is loaded, the sizes
//! recorded in its commit record win and a differing configuration is reported with a warning.

use crate::error::{QueueError, QueueResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest accepted chunk store.
pub const MIN_CHUNK_STORE_SIZE: u64 = 64 * 1024 * 1024;
/// Chunk store size used when the configured size is 0.
pub const DEFAULT_CHUNK_STORE_SIZE: u64 = 1024 * 1024 * 1024;
/// Default number of slots in the in-memory ring (64 MiB of slots).
pub const DEFAULT_SLOT_COUNT: u64 = 512 * 1024;
/// Smallest accepted slot ring. Must hold at least one maximum-size message.
pub const MIN_SLOT_COUNT: u64 = 1024;
/// Default upper bound for one background sync wait.
pub const DEFAULT_SYNC_WAIT_MS: u64 = 50;

/// Configuration for creating or loading a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Chunk store size in bytes. `0` selects the default (1 GiB); other values must be at
    /// least 64 MiB and are rounded up to a power of two.
    pub chunk_store_size: u64,
    /// Number of 128-byte slots in the in-memory ring (and the WAL file). Power of two.
    pub slot_count: u64,
    /// How long a background sync waits for the ring to fill before persisting anyway.
    pub sync_wait_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            chunk_store_size: 0,
            slot_count: DEFAULT_SLOT_COUNT,
            sync_wait_ms: DEFAULT_SYNC_WAIT_MS,
        }
    }
}

impl QueueConfig {
    /// Set the chunk store size.
    pub fn with_chunk_store_size(mut self, bytes: u64) -> Self {
        self.chunk_store_size = bytes;
        self
    }

    /// Set the slot ring size.
    pub fn with_slot_count(mut self, slots: u64) -> Self {
        self.slot_count = slots;
        self
    }

    /// Set the background sync wait.
    pub fn with_sync_wait_ms(mut self, ms: u64) -> Self {
        self.sync_wait_ms = ms;
        self
    }

    /// Check the parts of the configuration that are not adjusted automatically.
    pub fn validate(&self) -> QueueResult<()> {
        if !self.slot_count.is_power_of_two() || self.slot_count < MIN_SLOT_COUNT {
            return Err(QueueError::InvalidConfig(format!(
                "slot_count must be a power of two >= {MIN_SLOT_COUNT}, got {}",
                self.slot_count
            )));
        }
        if self.slot_count > u64::MAX / 4 {
            return Err(QueueError::InvalidConfig(format!(
                "slot_count too large: {}",
                self.slot_count
            )));
        }
        self.resolved_chunk_store_size().map(|_| ())
    }

    /// The chunk store size a new queue will be created with.
    pub fn resolved_chunk_store_size(&self) -> QueueResult<u64> {
        let requested = match self.chunk_store_size {
            0 => DEFAULT_CHUNK_STORE_SIZE,
            n => n,
        };
        if requested < MIN_CHUNK_STORE_SIZE {
            return Err(QueueError::InvalidConfig(format!(
                "chunk_store_size must be at least {MIN_CHUNK_STORE_SIZE} bytes, got {requested}"
            )));
        }
        if requested.is_power_of_two() {
            return Ok(requested);
        }
        let rounded = requested.checked_next_power_of_two().ok_or_else(|| {
            QueueError::InvalidConfig(format!("chunk_store_size too large: {requested}"))
        })?;
        log::warn!("chunk_store_size {requested} is not a power of 2: rounded up to {rounded}");
        Ok(rounded)
    }

    /// Bytes of the slot ring and of `wal.dat`.
    pub fn slots_size_bytes(&self) -> u64 {
        self.slot_count * crate::formats::SLOT_SIZE as u64
    }

    /// Background sync wait as a `Duration`.
    pub fn sync_wait(&self) -> Duration {
        Duration::from_millis(self.sync_wait_ms)
    }
}
