//! In-memory `Directory` wrapper that runs a one-shot hook inside a read of one file.
//!
//! Lets a test change the queue (enqueue, sync, discard) at the exact moment a reader is
//! copying a chunk, without threads or timing.

use pmq::storage::{Directory, MemoryDirectory, QueueFile};
use pmq::QueueResult;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Shared {
    hook: Option<Hook>,
    reads: Vec<u64>,
}

/// Wraps a `MemoryDirectory`; reads of `file` are recorded and may trigger the armed hook.
#[derive(Clone)]
pub struct ReadHookDirectory {
    inner: MemoryDirectory,
    file: &'static str,
    shared: Arc<Mutex<Shared>>,
}

impl ReadHookDirectory {
    pub fn new(inner: MemoryDirectory, file: &'static str) -> Self {
        Self {
            inner,
            file,
            shared: Arc::default(),
        }
    }

    /// Run `hook` at the start of the next read of the watched file.
    pub fn arm(&self, hook: impl FnOnce() + Send + 'static) {
        let mut sh = self.shared.lock().unwrap();
        sh.hook = Some(Box::new(hook));
        sh.reads.clear();
    }

    /// Offsets of the watched file's reads since the last `arm`.
    pub fn reads(&self) -> Vec<u64> {
        self.shared.lock().unwrap().reads.clone()
    }

    fn wrap(&self, name: &str, file: Arc<dyn QueueFile>) -> Arc<dyn QueueFile> {
        if name != self.file {
            return file;
        }
        Arc::new(HookedFile {
            inner: file,
            shared: self.shared.clone(),
        })
    }
}

impl Directory for ReadHookDirectory {
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
        format!("hooked:{}", self.inner.location())
    }

    fn file_path(&self, name: &str) -> Option<PathBuf> {
        self.inner.file_path(name)
    }
}

struct HookedFile {
    inner: Arc<dyn QueueFile>,
    shared: Arc<Mutex<Shared>>,
}

impl QueueFile for HookedFile {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> QueueResult<()> {
        let hook = {
            let mut sh = self.shared.lock().unwrap();
            sh.reads.push(offset);
            sh.hook.take()
        };
        if let Some(hook) = hook {
            hook();
        }
        self.inner.read_exact_at(buf, offset)
    }

    fn write_all_at(&self, buf: &[u8], offset: u64) -> QueueResult<()> {
        self.inner.write_all_at(buf, offset)
    }

    fn sync(&self) -> QueueResult<()> {
        self.inner.sync()
    }

    fn size_bytes(&self) -> QueueResult<u64> {
        self.inner.size_bytes()
    }
}
