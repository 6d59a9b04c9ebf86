//! Inode bookkeeping for the FUSE adapter
//!
//! The engine speaks virtual paths; the kernel speaks inode numbers. This
//! table owns the mapping. Numbers are allocated on first lookup and stay
//! stable until the path is forgotten or renamed.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// The root directory's inode number, fixed by the FUSE protocol
pub const ROOT_INO: u64 = 1;

pub struct InodeTable {
    next_ino: AtomicU64,
    paths: RwLock<HashMap<u64, String>>,
    inos: RwLock<HashMap<String, u64>>,
}

impl InodeTable {
    pub fn new() -> Self {
        let table = InodeTable {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            paths: RwLock::new(HashMap::new()),
            inos: RwLock::new(HashMap::new()),
        };
        table.paths.write().insert(ROOT_INO, "/".to_string());
        table.inos.write().insert("/".to_string(), ROOT_INO);
        table
    }

    /// Inode number for a virtual path, allocating one on first sight
    pub fn ino_for(&self, path: &str) -> u64 {
        if let Some(ino) = self.inos.read().get(path) {
            return *ino;
        }
        let mut inos = self.inos.write();
        // Raced allocation: check again under the write lock
        if let Some(ino) = inos.get(path) {
            return *ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        inos.insert(path.to_string(), ino);
        self.paths.write().insert(ino, path.to_string());
        ino
    }

    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.paths.read().get(&ino).cloned()
    }

    /// Drop the mapping for a removed path
    pub fn forget_path(&self, path: &str) {
        if let Some(ino) = self.inos.write().remove(path) {
            self.paths.write().remove(&ino);
        }
    }

    /// Move a mapping to a new path, keeping the inode number. Any mapping
    /// previously at the destination is dropped.
    pub fn rename(&self, from: &str, to: &str) {
        let mut inos = self.inos.write();
        let mut paths = self.paths.write();
        if let Some(stale) = inos.remove(to) {
            paths.remove(&stale);
        }
        if let Some(ino) = inos.remove(from) {
            inos.insert(to.to_string(), ino);
            paths.insert(ino, to.to_string());
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
