//! Storage backend abstraction
//!
//! A backend stores the obfuscated, encrypted tree for one share. Paths
//! handed to a backend are always already obfuscated and relative to the
//! share root ("/" separated, leading slash). The engine never assumes a
//! backend preserves names: a sync layer underneath may rename entries at
//! any time, which the obfuscation layer handles via conflict resolution.

use crate::error::Result;
use std::fs::{self, File, FileTimes, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::PathBuf;
use std::time::SystemTime;
use tracing::debug;

/// Backend-level metadata for a single entry
#[derive(Debug, Clone)]
pub struct EntryMeta {
    /// Stored size in bytes (ciphertext size for files)
    pub len: u64,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub modified: SystemTime,
    pub accessed: SystemTime,
    pub mode: u32,
}

/// Random-access handle to one stored object
pub trait BackendFile: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;
    fn set_len(&self, len: u64) -> Result<()>;
    fn len(&self) -> Result<u64>;
    fn flush(&self) -> Result<()>;
}

/// One share's storage
pub trait Backend: Send + Sync {
    fn exists(&self, rel: &str) -> bool;
    fn metadata(&self, rel: &str) -> Result<EntryMeta>;
    /// Entry names directly under `rel`, unordered
    fn list(&self, rel: &str) -> Result<Vec<String>>;
    fn create(&self, rel: &str) -> Result<Box<dyn BackendFile>>;
    fn open(&self, rel: &str, write: bool) -> Result<Box<dyn BackendFile>>;
    fn create_dir(&self, rel: &str) -> Result<()>;
    fn remove_dir(&self, rel: &str) -> Result<()>;
    fn remove_file(&self, rel: &str) -> Result<()>;
    fn rename(&self, from: &str, to: &str) -> Result<()>;
    fn symlink(&self, rel: &str, target: &str) -> Result<()>;
    fn read_link(&self, rel: &str) -> Result<String>;
    fn set_mode(&self, rel: &str, mode: u32) -> Result<()>;
    fn set_times(&self, rel: &str, accessed: SystemTime, modified: SystemTime) -> Result<()>;
    /// Human-readable location for logs and status output
    fn location(&self) -> String;
}

/// Backend over a directory on the local filesystem. This is also what a
/// cloud-synced share looks like from the engine's side: the sync client
/// owns the directory, we own the bytes inside it.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Open a backend rooted at `root`, creating the directory if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "opened local backend");
        Ok(LocalBackend { root })
    }

    fn full(&self, rel: &str) -> PathBuf {
        self.root.join(rel.trim_start_matches('/'))
    }
}

fn meta_from(md: &fs::Metadata) -> EntryMeta {
    EntryMeta {
        len: md.len(),
        is_dir: md.is_dir(),
        is_symlink: md.file_type().is_symlink(),
        modified: md.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        accessed: md.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
        mode: md.permissions().mode(),
    }
}

impl Backend for LocalBackend {
    fn exists(&self, rel: &str) -> bool {
        self.full(rel).symlink_metadata().is_ok()
    }

    fn metadata(&self, rel: &str) -> Result<EntryMeta> {
        let md = self.full(rel).symlink_metadata()?;
        Ok(meta_from(&md))
    }

    fn list(&self, rel: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.full(rel))? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn create(&self, rel: &str) -> Result<Box<dyn BackendFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.full(rel))?;
        Ok(Box::new(LocalFile { file }))
    }

    fn open(&self, rel: &str, write: bool) -> Result<Box<dyn BackendFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(write)
            .open(self.full(rel))?;
        Ok(Box::new(LocalFile { file }))
    }

    fn create_dir(&self, rel: &str) -> Result<()> {
        fs::create_dir(self.full(rel))?;
        Ok(())
    }

    fn remove_dir(&self, rel: &str) -> Result<()> {
        fs::remove_dir(self.full(rel))?;
        Ok(())
    }

    fn remove_file(&self, rel: &str) -> Result<()> {
        fs::remove_file(self.full(rel))?;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.full(from), self.full(to))?;
        Ok(())
    }

    fn symlink(&self, rel: &str, target: &str) -> Result<()> {
        std::os::unix::fs::symlink(target, self.full(rel))?;
        Ok(())
    }

    fn read_link(&self, rel: &str) -> Result<String> {
        let target = fs::read_link(self.full(rel))?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn set_mode(&self, rel: &str, mode: u32) -> Result<()> {
        fs::set_permissions(self.full(rel), fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    fn set_times(&self, rel: &str, accessed: SystemTime, modified: SystemTime) -> Result<()> {
        // futimens works on a read-only descriptor
        let file = File::open(self.full(rel))?;
        file.set_times(FileTimes::new().set_accessed(accessed).set_modified(modified))?;
        Ok(())
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

struct LocalFile {
    file: File,
}

impl BackendFile for LocalFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        loop {
            match self.file.read_at(buf, offset) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        Ok(self.file.write_at(buf, offset)?)
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
