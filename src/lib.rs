//! `pmq`: a persistent message queue.
//!
//! Scope:
//! - single-writer enqueue into a fixed-size in-memory slot ring (`inqueue`)
//! - compaction of slots into 64 KiB chunks stored in a cyclic chunk file (`chunks`,
//!   `persister`)
//! - a WAL holding the slots not yet compacted, and a checksummed commit record (`commit`)
//! - readers that seek by message number and survive concurrent discard (`reader`)
//!
//! Non-goal: replication, quota policy, any network or CLI surface.
//!
//! ## Contract (what you can rely on)
//!
//! - **Durability**: after [`Queue::sync`] (or a background sync) returns, every message
//!   enqueued before the call survives a crash or power loss, and is readable after reopening.
//! - **Visibility**: readers only ever see durable messages, and see them in enqueue order.
//! - **Discard**: the chunk file is a ring. Once it fills up, the oldest chunks are discarded;
//!   a reader positioned on discarded data gets [`QueueError::OutOfBounds`], never stale bytes.
//! - **Corruption**: damage to chunk headers, offset tables or slot framing surfaces as
//!   [`QueueError::Integrity`], distinct from [`QueueError::Io`].
//!
//! ## Files
//!
//! A queue directory contains `wal.dat` (the slot ring image), `chunks.dat` (the chunk ring)
//! and `state.dat` (one [`commit::CommitRecord`]). All three are allocated when the queue is
//! created and never change size.

pub mod buffer;
pub mod chunks;
pub mod commit;
pub mod config;
pub mod error;
pub mod formats;
pub mod inqueue;
pub mod persister;
pub mod queue;
pub mod reader;
pub mod seqnum;
pub mod storage;

pub use config::QueueConfig;
pub use error::{QueueError, QueueResult};
pub use inqueue::EnqueuerStats;
pub use persister::PersisterStats;
pub use queue::{PersistInfo, Queue, QueueStats, SyncWorker};
pub use reader::{ReadOutcome, Reader};
pub use storage::{Directory, FsDirectory, MemoryDirectory};
