//! Filesystem-backed `Directory` wrapper with targeted fault injection.
//!
//! Important: this file lives under `tests/support/` so it is **not** compiled as a standalone
//! integration test target.

use pmq::storage::{Directory, FsDirectory, QueueFile};
use pmq::QueueResult;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Fault-injection configuration for queue files.
#[derive(Default)]
pub struct FaultConfig {
    /// Fail `sync` on `chunks.dat`.
    pub fail_chunk_sync: bool,
    /// Fail `sync` on `wal.dat`.
    pub fail_wal_sync: bool,
    /// Fail positional writes to `state.dat`.
    pub fail_state_write: bool,
    /// Count of sync calls attempted against any file.
    pub sync_calls: usize,
}

/// A filesystem-backed `Directory` wrapper with targeted fault injection.
pub struct FaultyDirectory {
    inner: FsDirectory,
    cfg: Arc<Mutex<FaultConfig>>,
}

impl FaultyDirectory {
    /// Wrap an existing `FsDirectory`.
    pub fn new(inner: FsDirectory) -> Self {
        Self {
            inner,
            cfg: Arc::new(Mutex::new(FaultConfig::default())),
        }
    }

    /// Access the shared fault config (for toggling failpoints and reading counters).
    pub fn cfg(&self) -> Arc<Mutex<FaultConfig>> {
        self.cfg.clone()
    }

    fn wrap(&self, name: &str, file: Arc<dyn QueueFile>) -> Arc<dyn QueueFile> {
        Arc::new(FaultyFile {
            name: name.to_string(),
            inner: file,
            cfg: self.cfg.clone(),
        })
    }
}

impl Directory for FaultyDirectory {
    fn root_exists(&self) -> bool {
        self.inner.root_exists()
    }

    fn create_root(&self) -> QueueResult<()> {
        self.inner.create_root()
    }

    fn create_file(&self, name: &str, len: u64) -> QueueResult<Arc<dyn QueueFile>> {
        let f = self.inner.create_file(name, len)?;
        Ok(self.wrap(name, f))
    }

    fn open_file(&self, name: &str) -> QueueResult<Arc<dyn QueueFile>> {
        let f = self.inner.open_file(name)?;
        Ok(self.wrap(name, f))
    }

    fn sync_root(&self) -> QueueResult<()> {
        self.inner.sync_root()
    }

    fn location(&self) -> String {
        format!("faulty:{}", self.inner.location())
    }

    fn file_path(&self, name: &str) -> Option<PathBuf> {
        self.inner.file_path(name)
    }
}

struct FaultyFile {
    name: String,
    inner: Arc<dyn QueueFile>,
    cfg: Arc<Mutex<FaultConfig>>,
}

impl QueueFile for FaultyFile {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> QueueResult<()> {
        self.inner.read_exact_at(buf, offset)
    }

    fn write_all_at(&self, buf: &[u8], offset: u64) -> QueueResult<()> {
        let cfg = self.cfg.lock().unwrap();
        if cfg.fail_state_write && self.name == "state.dat" {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure").into());
        }
        drop(cfg);
        self.inner.write_all_at(buf, offset)
    }

    fn sync(&self) -> QueueResult<()> {
        let mut cfg = self.cfg.lock().unwrap();
        cfg.sync_calls += 1;
        let fail = match self.name.as_str() {
            "chunks.dat" => cfg.fail_chunk_sync,
            "wal.dat" => cfg.fail_wal_sync,
            _ => false,
        };
        if fail {
            return Err(io::Error::new(io::ErrorKind::Other, "injected sync failure").into());
        }
        drop(cfg);
        self.inner.sync()
    }

    fn size_bytes(&self) -> QueueResult<u64> {
        self.inner.size_bytes()
    }
}
