//! Storage abstraction for the queue's three files.
//!
//! Vocabulary note:
//! - A queue directory holds a fixed set of fixed-size files. They are created once, zero
//!   filled, and afterwards only rewritten in place with positional writes.
//! - A positional write is **not** durable. Stable-storage durability requires an explicit
//!   [`QueueFile::sync`]; a freshly created file name additionally requires
//!   [`Directory::sync_root`].
//!
//! Two backends:
//! - [`FsDirectory`]: a real directory (positional I/O via the platform `FileExt`, `sync_all`).
//! - [`MemoryDirectory`]: in-memory files that remember which bytes were written since the
//!   last sync, so tests can simulate a power loss with
//!   [`MemoryDirectory::simulate_power_loss`].

use crate::error::{QueueError, QueueResult};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A fixed-size file addressed by byte offset.
///
/// All methods take `&self`: the persister writes while readers read the same file.
pub trait QueueFile: Send + Sync {
    /// Fill `buf` from `offset`. Short reads are errors.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> QueueResult<()>;
    /// Write all of `buf` at `offset`.
    fn write_all_at(&self, buf: &[u8], offset: u64) -> QueueResult<()>;
    /// Make previous writes durable.
    fn sync(&self) -> QueueResult<()>;
    /// Current file size in bytes.
    fn size_bytes(&self) -> QueueResult<u64>;
}

/// Trait for queue-directory storage backends.
pub trait Directory: Send + Sync {
    /// Whether the queue directory itself exists.
    fn root_exists(&self) -> bool;
    /// Create the queue directory. Fails if it already exists.
    fn create_root(&self) -> QueueResult<()>;
    /// Create a new zero-filled file of `len` bytes. Fails if it already exists.
    fn create_file(&self, name: &str, len: u64) -> QueueResult<Arc<dyn QueueFile>>;
    /// Open an existing file for reading and writing.
    fn open_file(&self, name: &str) -> QueueResult<Arc<dyn QueueFile>>;
    /// Make file creations inside the directory durable.
    fn sync_root(&self) -> QueueResult<()>;
    /// Human-readable location, for logs.
    fn location(&self) -> String;
    /// Optional filesystem path for backends that support it.
    fn file_path(&self, name: &str) -> Option<PathBuf>;
}

#[cfg(not(any(unix, windows)))]
compile_error!("pmq needs positional file I/O (unix or windows)");

/// `fsync` a directory so that entries created inside it survive power loss.
///
/// Windows cannot open a directory as a file; NTFS journals the new entries instead.
pub fn sync_dir(path: &Path) -> QueueResult<()> {
    #[cfg(unix)]
    {
        let f = std::fs::File::open(path)?;
        f.sync_all()?;
    }
    #[cfg(windows)]
    let _ = path;
    Ok(())
}

/// Filesystem-backed `Directory` rooted at a local path.
///
/// Unlike a general-purpose directory wrapper, `new` does not create anything: whether the
/// root exists decides between creating a fresh queue and loading an existing one.
pub struct FsDirectory {
    root: PathBuf,
}

impl FsDirectory {
    /// Describe the queue directory at `root` (which may not exist yet).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The queue directory path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Directory for FsDirectory {
    fn root_exists(&self) -> bool {
        self.root.is_dir()
    }

    fn create_root(&self) -> QueueResult<()> {
        let mut builder = std::fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o750);
        }
        builder.create(&self.root)?;
        Ok(())
    }

    fn create_file(&self, name: &str, len: u64) -> QueueResult<Arc<dyn QueueFile>> {
        let mut opts = std::fs::OpenOptions::new();
        opts.read(true).write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o644);
        }
        let file = opts.open(self.resolve_path(name))?;
        file.set_len(len)?;
        Ok(Arc::new(FsFile { file }))
    }

    fn open_file(&self, name: &str) -> QueueResult<Arc<dyn QueueFile>> {
        let full_path = self.resolve_path(name);
        if !full_path.exists() {
            return Err(QueueError::MissingPath(full_path));
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&full_path)?;
        if !file.metadata()?.is_file() {
            return Err(QueueError::Format(format!(
                "{} is not a regular file",
                full_path.display()
            )));
        }
        Ok(Arc::new(FsFile { file }))
    }

    fn sync_root(&self) -> QueueResult<()> {
        sync_dir(&self.root)
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }

    fn file_path(&self, name: &str) -> Option<PathBuf> {
        Some(self.resolve_path(name))
    }
}

struct FsFile {
    file: std::fs::File,
}

impl FsFile {
    #[cfg(unix)]
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(unix)]
    fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)
    }

    #[cfg(windows)]
    fn pread(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match self.file.seek_read(buf, offset)? {
                0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                n => {
                    let rest = buf;
                    buf = &mut rest[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(())
    }

    #[cfg(windows)]
    fn pwrite(&self, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match self.file.seek_write(buf, offset)? {
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(())
    }
}

impl QueueFile for FsFile {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> QueueResult<()> {
        self.pread(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, buf: &[u8], offset: u64) -> QueueResult<()> {
        self.pwrite(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> QueueResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn size_bytes(&self) -> QueueResult<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// In-memory `Directory` used for tests.
///
/// Clones share the same files. Writes are applied immediately (so readers see them) and
/// also recorded in a per-file undo log until the next `sync`; creations are pending until the
/// next `sync_root`.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    root: bool,
    files: HashMap<String, Arc<MemoryFile>>,
    unsynced_names: HashSet<String>,
}

impl MemoryDirectory {
    /// Create an empty in-memory directory (the queue root does not exist yet).
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything that was not made durable.
    ///
    /// Files whose creation was never followed by `sync_root` disappear; every other file loses
    /// the writes made since its last `sync`. Handles held by a queue still point at the same
    /// files, so drop the queue before reopening.
    pub fn simulate_power_loss(&self) {
        let mut st = self.state.lock();
        let lost: Vec<String> = st.unsynced_names.drain().collect();
        for name in lost {
            st.files.remove(&name);
        }
        for f in st.files.values() {
            f.roll_back();
        }
    }

    /// Overwrite bytes of an existing file directly (corruption injection for tests).
    pub fn poke(&self, name: &str, offset: u64, bytes: &[u8]) -> QueueResult<()> {
        let file = self.open_file(name)?;
        file.write_all_at(bytes, offset)?;
        file.sync()
    }
}

impl Directory for MemoryDirectory {
    fn root_exists(&self) -> bool {
        self.state.lock().root
    }

    fn create_root(&self) -> QueueResult<()> {
        let mut st = self.state.lock();
        if st.root {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "queue root exists").into());
        }
        st.root = true;
        Ok(())
    }

    fn create_file(&self, name: &str, len: u64) -> QueueResult<Arc<dyn QueueFile>> {
        let mut st = self.state.lock();
        if !st.root {
            return Err(io::Error::new(io::ErrorKind::NotFound, "queue root missing").into());
        }
        if st.files.contains_key(name) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, name.to_string()).into());
        }
        let len = usize::try_from(len)
            .map_err(|_| QueueError::InvalidConfig(format!("file too large: {len}")))?;
        let file = Arc::new(MemoryFile {
            inner: Mutex::new(MemoryFileState {
                data: vec![0u8; len],
                undo: Vec::new(),
            }),
        });
        st.files.insert(name.to_string(), file.clone());
        st.unsynced_names.insert(name.to_string());
        Ok(file as Arc<dyn QueueFile>)
    }

    fn open_file(&self, name: &str) -> QueueResult<Arc<dyn QueueFile>> {
        let st = self.state.lock();
        match st.files.get(name) {
            Some(f) => Ok(f.clone() as Arc<dyn QueueFile>),
            None => Err(QueueError::MissingPath(PathBuf::from(name))),
        }
    }

    fn sync_root(&self) -> QueueResult<()> {
        self.state.lock().unsynced_names.clear();
        Ok(())
    }

    fn location(&self) -> String {
        "<memory>".to_string()
    }

    fn file_path(&self, _name: &str) -> Option<PathBuf> {
        None
    }
}

struct MemoryFile {
    inner: Mutex<MemoryFileState>,
}

struct MemoryFileState {
    data: Vec<u8>,
    /// `(offset, previous bytes)` for every write since the last sync, oldest first.
    undo: Vec<(usize, Vec<u8>)>,
}

impl MemoryFile {
    fn roll_back(&self) {
        let mut st = self.inner.lock();
        let undo = std::mem::take(&mut st.undo);
        for (off, old) in undo.into_iter().rev() {
            st.data[off..off + old.len()].copy_from_slice(&old);
        }
    }
}

fn range_of(offset: u64, len: usize, file_len: usize) -> io::Result<std::ops::Range<usize>> {
    let start = usize::try_from(offset)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
    match start.checked_add(len) {
        Some(end) if end <= file_len => Ok(start..end),
        _ => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "access past end of file",
        )),
    }
}

impl QueueFile for MemoryFile {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> QueueResult<()> {
        let st = self.inner.lock();
        let r = range_of(offset, buf.len(), st.data.len())?;
        buf.copy_from_slice(&st.data[r]);
        Ok(())
    }

    fn write_all_at(&self, buf: &[u8], offset: u64) -> QueueResult<()> {
        let mut st = self.inner.lock();
        let r = range_of(offset, buf.len(), st.data.len())?;
        let old = st.data[r.clone()].to_vec();
        st.undo.push((r.start, old));
        st.data[r].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> QueueResult<()> {
        self.inner.lock().undo.clear();
        Ok(())
    }

    fn size_bytes(&self) -> QueueResult<u64> {
        Ok(self.inner.lock().data.len() as u64)
    }
}
