//! FUSE adapter
//!
//! Thin translation layer between the kernel's inode-and-handle protocol
//! and the path-based [`Engine`]. All naming, crypto and session logic
//! lives behind the engine; this module only maps inodes to virtual paths
//! and engine errors to errnos.

mod inode;

pub use inode::{InodeTable, ROOT_INO};

use crate::config::MountConfig;
use crate::error::Error;
use crate::session::{Attr, Engine, EntryKind};
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

const TTL: Duration = Duration::from_secs(1);

const BLOCK_SIZE: u32 = 4096;

pub struct ShroudFs {
    engine: Arc<Engine>,
    inodes: InodeTable,
    mount: MountConfig,
}

impl ShroudFs {
    pub fn new(engine: Arc<Engine>, mount: MountConfig) -> Self {
        ShroudFs {
            engine,
            inodes: InodeTable::new(),
            mount,
        }
    }

    /// Virtual path of a directory entry, from its parent inode and name
    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let parent_path = self.inodes.path_of(parent)?;
        let name = name.to_str()?;
        Some(if parent_path == "/" {
            format!("/{name}")
        } else {
            format!("{parent_path}/{name}")
        })
    }

    fn fuse_attr(&self, ino: u64, attr: &Attr) -> FileAttr {
        let kind = match attr.kind {
            EntryKind::File => FileType::RegularFile,
            EntryKind::Directory => FileType::Directory,
            EntryKind::Symlink => FileType::Symlink,
        };
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.mtime,
            crtime: attr.mtime,
            kind,
            perm: (attr.mode & 0o7777) as u16,
            nlink: if attr.kind == EntryKind::Directory { 2 } else { 1 },
            uid: self.mount.uid,
            gid: self.mount.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}

fn time_or_now(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl Filesystem for ShroudFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.engine.getattr(&path) {
            Ok(attr) => {
                let ino = self.inodes.ino_for(&path);
                reply.entry(&TTL, &self.fuse_attr(ino, &attr), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.engine.getattr(&path) {
            Ok(attr) => reply.attr(&TTL, &self.fuse_attr(ino, &attr)),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if let Some(size) = size {
            if let Err(e) = self.engine.truncate(&path, size) {
                reply.error(e.errno());
                return;
            }
        }
        if let Some(mode) = mode {
            if let Err(e) = self.engine.set_mode(&path, mode) {
                reply.error(e.errno());
                return;
            }
        }
        if atime.is_some() || mtime.is_some() {
            let current = match self.engine.getattr(&path) {
                Ok(attr) => attr,
                Err(e) => {
                    reply.error(e.errno());
                    return;
                }
            };
            let accessed = atime.map(time_or_now).unwrap_or(current.atime);
            let modified = mtime.map(time_or_now).unwrap_or(current.mtime);
            if let Err(e) = self.engine.set_times(&path, accessed, modified) {
                reply.error(e.errno());
                return;
            }
        }
        match self.engine.getattr(&path) {
            Ok(attr) => reply.attr(&TTL, &self.fuse_attr(ino, &attr)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.engine.readlink(&path) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        if let Err(e) = self.engine.mkdir(&path, mode) {
            reply.error(e.errno());
            return;
        }
        match self.engine.getattr(&path) {
            Ok(attr) => {
                let ino = self.inodes.ino_for(&path);
                reply.entry(&TTL, &self.fuse_attr(ino, &attr), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.engine.unlink(&path) {
            Ok(()) => {
                self.inodes.forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.engine.rmdir(&path) {
            Ok(()) => {
                self.inodes.forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, link_name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(target) = target.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        if let Err(e) = self.engine.symlink(&path, target) {
            reply.error(e.errno());
            return;
        }
        match self.engine.getattr(&path) {
            Ok(attr) => {
                let ino = self.inodes.ino_for(&path);
                reply.entry(&TTL, &self.fuse_attr(ino, &attr), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(from), Some(to)) = (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.engine.rename(&from, &to) {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let accmode = flags & libc::O_ACCMODE;
        let write = accmode == libc::O_WRONLY || accmode == libc::O_RDWR;

        let handle = match self.engine.open(&path, write) {
            Ok(handle) => handle,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        if flags & libc::O_TRUNC != 0 {
            if let Err(e) = self.engine.truncate(&path, 0) {
                let _ = self.engine.release(handle);
                reply.error(e.errno());
                return;
            }
        }
        debug!(%path, handle, write, "opened");
        reply.opened(handle, 0);
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let handle = match self.engine.create(&path) {
            Ok(handle) => handle,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        if let Err(e) = self.engine.set_mode(&path, mode & 0o7777) {
            debug!(%path, error = %e, "chmod after create failed");
        }
        match self.engine.getattr(&path) {
            Ok(attr) => {
                let ino = self.inodes.ino_for(&path);
                reply.created(&TTL, &self.fuse_attr(ino, &attr), 0, handle, 0);
            }
            Err(e) => {
                let _ = self.engine.release(handle);
                reply.error(e.errno());
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let mut buf = vec![0u8; size as usize];
        match self.engine.read(fh, &mut buf, offset.max(0) as u64) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.engine.write(fh, data, offset.max(0) as u64) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.engine.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.engine.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.engine.release(fh) {
            Ok(()) => reply.ok(),
            // A stale handle at release is not worth failing close(2) over
            Err(Error::HandleNotFound(_)) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let listing = match self.engine.readdir(&path) {
            Ok(listing) => listing,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (ino, FileType::Directory, "..".to_string()),
        ];
        for entry in listing {
            let child = if path == "/" {
                format!("/{}", entry.name)
            } else {
                format!("{path}/{}", entry.name)
            };
            let kind = match entry.kind {
                EntryKind::File => FileType::RegularFile,
                EntryKind::Directory => FileType::Directory,
                EntryKind::Symlink => FileType::Symlink,
            };
            entries.push((self.inodes.ino_for(&child), kind, entry.name));
        }

        for (i, (child_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*child_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn access(&mut self, _req: &Request, ino: u64, _mask: i32, reply: ReplyEmpty) {
        match self.inodes.path_of(ino) {
            Some(path) if self.engine.exists(&path) => reply.ok(),
            _ => reply.error(libc::ENOENT),
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        let capacity = self.engine.capacity();
        let blocks = capacity.total_bytes / BLOCK_SIZE as u64;
        let free = capacity.free_bytes / BLOCK_SIZE as u64;
        reply.statfs(blocks, free, free, 0, 0, BLOCK_SIZE, 255, BLOCK_SIZE);
    }

    fn destroy(&mut self) {
        info!("unmounting, flushing open files");
        self.engine.shutdown();
    }
}
