//! Open-file sessions
//!
//! The driver adapter speaks in numeric handles; this layer maps them onto
//! sessions over shared open files. All sessions for the same virtual path
//! share a single decrypted [`CryptoFile`] instance, so concurrent handles
//! observe each other's writes and a truncate through one handle is
//! immediately visible through the others.

use crate::config::DeletePolicy;
use crate::error::{Error, Result};
use crate::vfs::file::plaintext_len;
use crate::vfs::{CryptoFile, RootVolume, Share, VirtualNode, VolumeCapacity};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Entry kind as reported to the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// Attributes of one virtual node. Sizes are plaintext sizes.
#[derive(Debug, Clone)]
pub struct Attr {
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub mtime: SystemTime,
    pub atime: SystemTime,
}

/// One directory listing entry, already deobfuscated
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

struct PathState {
    /// Global virtual path, e.g. `/docs/a.txt`
    virt: String,
    /// Obfuscated share-relative backend path
    backend: String,
}

/// The single decrypted instance of one open file
struct OpenFile {
    share: Arc<Share>,
    paths: Mutex<PathState>,
    content: Mutex<CryptoFile>,
    writable: bool,
    delete_on_close: AtomicBool,
}

struct OpenEntry {
    file: Arc<OpenFile>,
    sessions: usize,
}

struct Session {
    file: Arc<OpenFile>,
    readonly: bool,
}

/// The filesystem engine behind the driver adapter. Paths are global
/// virtual paths; all name translation happens behind this interface.
pub struct Engine {
    root: Arc<RootVolume>,
    user: Option<String>,
    delete_policy: DeletePolicy,
    sessions: Mutex<HashMap<u64, Session>>,
    open_files: Mutex<HashMap<String, OpenEntry>>,
    next_handle: AtomicU64,
}

impl Engine {
    pub fn new(root: Arc<RootVolume>, user: Option<String>, delete_policy: DeletePolicy) -> Self {
        Engine {
            root,
            user,
            delete_policy,
            sessions: Mutex::new(HashMap::new()),
            open_files: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn root(&self) -> &RootVolume {
        &self.root
    }

    fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    fn new_session(&self, file: Arc<OpenFile>, readonly: bool) -> u64 {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.sessions
            .lock()
            .insert(handle, Session { file, readonly });
        handle
    }

    fn session_file(&self, handle: u64) -> Result<(Arc<OpenFile>, bool)> {
        let sessions = self.sessions.lock();
        let Some(session) = sessions.get(&handle) else {
            // A handle the driver never got, or released twice: a
            // bookkeeping bug on the caller's side, worth shouting about
            warn!(handle, "operation on unknown handle");
            return Err(Error::HandleNotFound(handle));
        };
        Ok((session.file.clone(), session.readonly))
    }

    /// Create a new encrypted file and open a writable session on it
    pub fn create(&self, virtual_path: &str) -> Result<u64> {
        let mut open_files = self.open_files.lock();
        if open_files.contains_key(virtual_path) {
            return Err(Error::AlreadyExists(virtual_path.to_string()));
        }

        let (share, backend_path) = self.root.obfuscate_path(self.user(), virtual_path, true)?;
        let raw = share.backend().create(&backend_path).map_err(|e| match e {
            Error::Io(source) => Error::CreateFailed {
                path: virtual_path.to_string(),
                source,
            },
            other => other,
        })?;
        let latest = share.latest_key()?;
        let content = CryptoFile::create(raw, &latest)?;
        debug!(path = virtual_path, version = latest.version, "created file");

        let file = Arc::new(OpenFile {
            share,
            paths: Mutex::new(PathState {
                virt: virtual_path.to_string(),
                backend: backend_path,
            }),
            content: Mutex::new(content),
            writable: true,
            delete_on_close: AtomicBool::new(false),
        });
        open_files.insert(
            virtual_path.to_string(),
            OpenEntry {
                file: file.clone(),
                sessions: 1,
            },
        );
        drop(open_files);
        Ok(self.new_session(file, false))
    }

    /// Open an existing file. If the path already has a live decrypted
    /// instance, the new session shares it.
    pub fn open(&self, virtual_path: &str, write: bool) -> Result<u64> {
        let mut open_files = self.open_files.lock();
        if let Some(entry) = open_files.get_mut(virtual_path) {
            if write && !entry.file.writable {
                return Err(Error::Io(ErrorKind::PermissionDenied.into()));
            }
            entry.sessions += 1;
            let file = entry.file.clone();
            drop(open_files);
            return Ok(self.new_session(file, !write));
        }

        let (share, backend_path) = self.root.obfuscate_path(self.user(), virtual_path, false)?;
        // Prefer a writable descriptor so a later write-open can share it
        let (raw, writable) = match share.backend().open(&backend_path, true) {
            Ok(raw) => (raw, true),
            Err(e) if !write => {
                debug!(path = virtual_path, error = %e, "writable open failed, retrying read-only");
                (share.backend().open(&backend_path, false)?, false)
            }
            Err(e) => return Err(e),
        };
        let content = CryptoFile::open(raw, |version| share.keys().key(version))?;

        let file = Arc::new(OpenFile {
            share,
            paths: Mutex::new(PathState {
                virt: virtual_path.to_string(),
                backend: backend_path,
            }),
            content: Mutex::new(content),
            writable,
            delete_on_close: AtomicBool::new(false),
        });
        open_files.insert(
            virtual_path.to_string(),
            OpenEntry {
                file: file.clone(),
                sessions: 1,
            },
        );
        drop(open_files);
        Ok(self.new_session(file, !write))
    }

    pub fn read(&self, handle: u64, buf: &mut [u8], offset: u64) -> Result<usize> {
        let (file, _) = self.session_file(handle)?;
        let mut content = file.content.lock();
        content.read_at(buf, offset)
    }

    pub fn write(&self, handle: u64, data: &[u8], offset: u64) -> Result<usize> {
        let (file, readonly) = self.session_file(handle)?;
        if readonly {
            return Err(Error::ReadOnlyHandle(handle));
        }
        let mut content = file.content.lock();
        content.write_at(data, offset)
    }

    pub fn flush(&self, handle: u64) -> Result<()> {
        let (file, _) = self.session_file(handle)?;
        let mut content = file.content.lock();
        content.flush()
    }

    /// Close a session. The decrypted instance is dropped with the last
    /// session; a pending delete-on-close fires at that point.
    pub fn release(&self, handle: u64) -> Result<()> {
        let Some(session) = self.sessions.lock().remove(&handle) else {
            warn!(handle, "release of unknown handle");
            return Err(Error::HandleNotFound(handle));
        };

        let virt = session.file.paths.lock().virt.clone();
        let mut open_files = self.open_files.lock();
        let Some(entry) = open_files.get_mut(&virt) else {
            // Instance already retired by a rename-over; nothing to track
            return Ok(());
        };
        if !Arc::ptr_eq(&entry.file, &session.file) {
            // The path was reused by a newer instance after this one was
            // retired; its bookkeeping is not ours to touch
            return Ok(());
        }
        entry.sessions -= 1;
        if entry.sessions > 0 {
            return Ok(());
        }
        let entry = open_files
            .remove(&virt)
            .ok_or_else(|| Error::HandleNotFound(handle))?;
        drop(open_files);

        entry.file.content.lock().flush()?;
        if entry.file.delete_on_close.load(Ordering::Acquire) {
            let backend_path = entry.file.paths.lock().backend.clone();
            debug!(path = %virt, "deleting on last close");
            entry.file.share.backend().remove_file(&backend_path)?;
        }
        Ok(())
    }

    /// Truncate by path. Routed through the live decrypted instance when
    /// one exists, so open handles observe the new length.
    pub fn truncate(&self, virtual_path: &str, size: u64) -> Result<()> {
        let open_files = self.open_files.lock();
        if let Some(entry) = open_files.get(virtual_path) {
            if !entry.file.writable {
                return Err(Error::Io(ErrorKind::PermissionDenied.into()));
            }
            let file = entry.file.clone();
            drop(open_files);
            return file.content.lock().set_len(size);
        }
        drop(open_files);

        let (share, backend_path) = self.root.obfuscate_path(self.user(), virtual_path, false)?;
        let raw = share.backend().open(&backend_path, true)?;
        let mut content = CryptoFile::open(raw, |version| share.keys().key(version))?;
        content.set_len(size)?;
        content.flush()
    }

    pub fn getattr(&self, virtual_path: &str) -> Result<Attr> {
        match self.root.node_for(self.user(), virtual_path)? {
            VirtualNode::Root => Ok(synthetic_dir_attr()),
            VirtualNode::Entry { share, rel } => {
                if rel == "/" {
                    return Ok(synthetic_dir_attr());
                }
                let backend_path = share.obfuscate(&rel, false)?;
                let meta = share.backend().metadata(&backend_path)?;
                let kind = kind_of(meta.is_dir, meta.is_symlink);
                let size = match kind {
                    EntryKind::File => match self.open_files.lock().get(virtual_path) {
                        Some(entry) => entry.file.content.lock().len()?,
                        None => plaintext_len(meta.len),
                    },
                    _ => meta.len,
                };
                Ok(Attr {
                    kind,
                    size,
                    mode: meta.mode,
                    mtime: meta.modified,
                    atime: meta.accessed,
                })
            }
        }
    }

    pub fn exists(&self, virtual_path: &str) -> bool {
        match self.root.node_for(self.user(), virtual_path) {
            Ok(VirtualNode::Root) => true,
            Ok(VirtualNode::Entry { share, rel }) => {
                if rel == "/" {
                    return true;
                }
                match share.obfuscate(&rel, false) {
                    Ok(backend_path) => share.backend().exists(&backend_path),
                    Err(_) => false,
                }
            }
            Err(_) => false,
        }
    }

    /// List a virtual directory. Unresolvable entries (foreign files the
    /// backend dropped in, unrecoverable conflict copies) are skipped with
    /// a warning rather than failing the whole listing.
    pub fn readdir(&self, virtual_path: &str) -> Result<Vec<DirEntry>> {
        let (share, rel) = match self.root.node_for(self.user(), virtual_path)? {
            VirtualNode::Root => {
                return Ok(self
                    .root
                    .share_names(self.user())
                    .into_iter()
                    .map(|name| DirEntry {
                        name,
                        kind: EntryKind::Directory,
                    })
                    .collect());
            }
            VirtualNode::Entry { share, rel } => (share, rel),
        };

        let backend_dir = share.obfuscate(&rel, false)?;
        if !share.backend().metadata(&backend_dir)?.is_dir {
            return Err(Error::NotADirectory(virtual_path.to_string()));
        }

        let mut entries = Vec::new();
        for name in share.backend().list(&backend_dir)? {
            // The metadata subtree and anything else dotted is backend
            // bookkeeping, invisible in the virtual tree
            if name.starts_with('.') {
                continue;
            }
            let child_backend = join_path(&backend_dir, &name);
            let (child_virt, resolved_backend) =
                match self.root.deobfuscate_path(&share, &child_backend) {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(share = share.name(), entry = %name, error = %e,
                              "skipping unresolvable directory entry");
                        continue;
                    }
                };
            let meta = match share.backend().metadata(&resolved_backend) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(share = share.name(), entry = %name, error = %e,
                          "skipping unreadable directory entry");
                    continue;
                }
            };
            let plain_name = match child_virt.rsplit('/').next() {
                Some(last) if !last.is_empty() => last.to_string(),
                _ => continue,
            };
            entries.push(DirEntry {
                name: plain_name,
                kind: kind_of(meta.is_dir, meta.is_symlink),
            });
        }
        Ok(entries)
    }

    pub fn mkdir(&self, virtual_path: &str, mode: u32) -> Result<()> {
        let (share, backend_path) = self.root.obfuscate_path(self.user(), virtual_path, true)?;
        share.backend().create_dir(&backend_path)?;
        share.backend().set_mode(&backend_path, mode)?;
        Ok(())
    }

    pub fn rmdir(&self, virtual_path: &str) -> Result<()> {
        match self.root.node_for(self.user(), virtual_path)? {
            VirtualNode::Root => Err(Error::DeleteFailed("cannot remove the root".into())),
            VirtualNode::Entry { share, rel } => {
                if rel == "/" {
                    return Err(Error::DeleteFailed(format!(
                        "'{}' is a share root; detach the share instead",
                        share.name()
                    )));
                }
                let backend_path = share.obfuscate(&rel, false)?;
                share.backend().remove_dir(&backend_path)
            }
        }
    }

    /// Remove a file. With [`DeletePolicy::OnClose`] and live sessions, the
    /// backend entry survives until the last session closes.
    pub fn unlink(&self, virtual_path: &str) -> Result<()> {
        let open_files = self.open_files.lock();
        if let Some(entry) = open_files.get(virtual_path) {
            match self.delete_policy {
                DeletePolicy::OnClose => {
                    entry.file.delete_on_close.store(true, Ordering::Release);
                    debug!(path = virtual_path, "delete deferred to last close");
                    return Ok(());
                }
                DeletePolicy::Immediate => {
                    let backend_path = entry.file.paths.lock().backend.clone();
                    let share = entry.file.share.clone();
                    drop(open_files);
                    return share.backend().remove_file(&backend_path);
                }
            }
        }
        drop(open_files);

        let (share, backend_path) = self.root.obfuscate_path(self.user(), virtual_path, false)?;
        share.backend().remove_file(&backend_path)
    }

    /// Rename within one share. A live decrypted instance follows the
    /// rename: its sessions keep working under the new name.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let share = self.root.resolve_share(self.user(), from)?;
        let to_share = self.root.resolve_share(self.user(), to)?;
        if share.name() != to_share.name() {
            return Err(Error::CrossShare(format!("{from} -> {to}")));
        }

        let mut open_files = self.open_files.lock();
        if let Some(doomed) = open_files.get(to) {
            if !doomed.file.writable {
                return Err(Error::RenameFailed(format!(
                    "destination '{to}' is open read-only"
                )));
            }
            // Rename-over while open: retire the replaced instance. Its
            // live sessions keep reading the orphaned backing file, the
            // same as rename-over of an open descriptor.
            if let Some(entry) = open_files.remove(to) {
                if let Err(e) = entry.file.content.lock().flush() {
                    warn!(path = to, error = %e, "flush of replaced instance failed");
                }
            }
        }

        let backend_from = share.obfuscate(share.strip(from), false)?;
        let backend_to = share.obfuscate(share.strip(to), true)?;
        share.backend().rename(&backend_from, &backend_to)?;

        if let Some(entry) = open_files.remove(from) {
            {
                let mut paths = entry.file.paths.lock();
                paths.virt = to.to_string();
                paths.backend = backend_to.clone();
            }
            open_files.insert(to.to_string(), entry);
        }
        info!(%from, %to, "renamed");
        Ok(())
    }

    /// Create a symlink. The target must be an absolute virtual path in
    /// the same share; its stored form is obfuscated like any other path.
    pub fn symlink(&self, link_path: &str, target: &str) -> Result<()> {
        let share = self.root.resolve_share(self.user(), link_path)?;
        let target_share = self.root.resolve_share(self.user(), target)?;
        if share.name() != target_share.name() {
            return Err(Error::CrossShare(format!("{link_path} -> {target}")));
        }
        let backend_link = share.obfuscate(share.strip(link_path), true)?;
        let backend_target = share.obfuscate(share.strip(target), true)?;
        share.backend().symlink(&backend_link, &backend_target)
    }

    /// Read a symlink target back as an absolute virtual path
    pub fn readlink(&self, virtual_path: &str) -> Result<String> {
        let share = self.root.resolve_share(self.user(), virtual_path)?;
        let backend_path = share.obfuscate(share.strip(virtual_path), false)?;
        let backend_target = share.backend().read_link(&backend_path)?;
        let rel = share.deobfuscate(&backend_target)?;
        Ok(format!("/{}{}", share.name(), rel))
    }

    pub fn set_mode(&self, virtual_path: &str, mode: u32) -> Result<()> {
        let (share, backend_path) = self.root.obfuscate_path(self.user(), virtual_path, false)?;
        share.backend().set_mode(&backend_path, mode)
    }

    pub fn set_times(
        &self,
        virtual_path: &str,
        accessed: SystemTime,
        modified: SystemTime,
    ) -> Result<()> {
        let (share, backend_path) = self.root.obfuscate_path(self.user(), virtual_path, false)?;
        share.backend().set_times(&backend_path, accessed, modified)
    }

    pub fn capacity(&self) -> VolumeCapacity {
        self.root.capacity()
    }

    /// Flush everything that is still open. Failures are logged and do not
    /// stop the remaining files from being flushed.
    pub fn shutdown(&self) {
        let mut open_files = self.open_files.lock();
        for (virt, entry) in open_files.drain() {
            if let Err(e) = entry.file.content.lock().flush() {
                warn!(path = %virt, error = %e, "flush on shutdown failed");
            }
        }
        let count = self.sessions.lock().drain().count();
        if count > 0 {
            info!(sessions = count, "dropped sessions on shutdown");
        }
    }

    #[cfg(test)]
    fn open_session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

fn kind_of(is_dir: bool, is_symlink: bool) -> EntryKind {
    if is_symlink {
        EntryKind::Symlink
    } else if is_dir {
        EntryKind::Directory
    } else {
        EntryKind::File
    }
}

fn synthetic_dir_attr() -> Attr {
    Attr {
        kind: EntryKind::Directory,
        size: 0,
        mode: 0o755,
        mtime: SystemTime::now(),
        atime: SystemTime::now(),
    }
}

fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}
