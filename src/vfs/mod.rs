//! Virtual filesystem core
//!
//! The root volume multiplexes a flat virtual namespace over any number of
//! attached shares: `/` lists share names, everything below `/name` belongs
//! to the share called `name`. Shares can be grouped per user for
//! multi-user hosts; single-user mounts register everything under `None`.

pub mod file;
pub mod share;

pub use file::{plaintext_len, CryptoFile};
pub use share::Share;

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reported volume capacity. Backends rarely expose meaningful quota
/// numbers, so statfs answers come from fixed values instead.
#[derive(Debug, Clone, Copy)]
pub struct VolumeCapacity {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl Default for VolumeCapacity {
    fn default() -> Self {
        VolumeCapacity {
            total_bytes: 100 * 1024 * 1024 * 1024,
            free_bytes: 50 * 1024 * 1024 * 1024,
        }
    }
}

/// What a virtual path resolves to
pub enum VirtualNode {
    /// The synthetic root directory
    Root,
    /// A node inside one share, with its share-relative path
    Entry { share: Arc<Share>, rel: String },
}

/// The share multiplexer
pub struct RootVolume {
    shares: RwLock<HashMap<Option<String>, Vec<Arc<Share>>>>,
    capacity: VolumeCapacity,
}

impl RootVolume {
    pub fn new(capacity: VolumeCapacity) -> Self {
        RootVolume {
            shares: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> VolumeCapacity {
        self.capacity
    }

    /// Register a share for a user. Replacing an already-registered name
    /// drops the incoming share's caches, so stale name mappings from a
    /// previous attachment cannot leak into the new one.
    pub fn register(&self, user: Option<&str>, share: Arc<Share>) {
        let mut shares = self.shares.write();
        let list = shares.entry(user.map(String::from)).or_default();
        if let Some(pos) = list.iter().position(|s| s.name() == share.name()) {
            info!(share = share.name(), "replacing registered share");
            share.clear_caches();
            list[pos] = share;
        } else {
            list.push(share);
        }
    }

    /// Remount/refresh check: is a share of this name already registered
    /// with a different backing location? Callers re-register (replacing
    /// the stale attachment) only when this returns true; an unchanged
    /// share keeps its warm caches.
    pub fn exists_and_changed(&self, user: Option<&str>, incoming: &Share) -> bool {
        let shares = self.shares.read();
        shares
            .get(&user.map(String::from))
            .and_then(|list| list.iter().find(|s| s.name() == incoming.name()))
            .is_some_and(|current| {
                current.backend().location() != incoming.backend().location()
            })
    }

    /// Detach a share by name. Returns false if no such share is registered.
    pub fn remove(&self, user: Option<&str>, name: &str) -> bool {
        let mut shares = self.shares.write();
        let Some(list) = shares.get_mut(&user.map(String::from)) else {
            return false;
        };
        match list.iter().position(|s| s.name() == name) {
            Some(pos) => {
                let share = list.remove(pos);
                share.clear_caches();
                info!(share = name, "removed share");
                true
            }
            None => false,
        }
    }

    /// Names of all shares visible to a user, for listing `/`
    pub fn share_names(&self, user: Option<&str>) -> Vec<String> {
        let shares = self.shares.read();
        shares
            .get(&user.map(String::from))
            .map(|list| list.iter().map(|s| s.name().to_string()).collect())
            .unwrap_or_default()
    }

    pub fn share_by_name(&self, user: Option<&str>, name: &str) -> Option<Arc<Share>> {
        let shares = self.shares.read();
        shares
            .get(&user.map(String::from))?
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    /// Resolve a global virtual path to the root or to a share entry
    pub fn node_for(&self, user: Option<&str>, virtual_path: &str) -> Result<VirtualNode> {
        if virtual_path == "/" || virtual_path.is_empty() {
            return Ok(VirtualNode::Root);
        }
        let share = self.resolve_share(user, virtual_path)?;
        let rel = share.strip(virtual_path).to_string();
        Ok(VirtualNode::Entry { share, rel })
    }

    /// The share containing a virtual path
    pub fn resolve_share(&self, user: Option<&str>, virtual_path: &str) -> Result<Arc<Share>> {
        let shares = self.shares.read();
        shares
            .get(&user.map(String::from))
            .and_then(|list| list.iter().find(|s| s.contains(virtual_path)).cloned())
            .ok_or_else(|| Error::ShareNotFound(virtual_path.to_string()))
    }

    /// Translate a global virtual path into `(share, backend_path)`
    pub fn obfuscate_path(
        &self,
        user: Option<&str>,
        virtual_path: &str,
        create_ivs: bool,
    ) -> Result<(Arc<Share>, String)> {
        let share = self.resolve_share(user, virtual_path)?;
        let backend_path = share.obfuscate(share.strip(virtual_path), create_ivs)?;
        Ok((share, backend_path))
    }

    /// Translate a backend path back into a share-relative virtual path.
    ///
    /// When the final segment no longer matches any IV pool entry, the
    /// backend has conflict-renamed it. Resolution is attempted once: the
    /// recovered plaintext plus the marker gets a fresh obfuscated name,
    /// the backend entry is renamed to it, and the renamed path is what
    /// gets deobfuscated. The returned backend path therefore may differ
    /// from the one passed in.
    pub fn deobfuscate_path(
        &self,
        share: &Share,
        backend_path: &str,
    ) -> Result<(String, String)> {
        match share.deobfuscate(backend_path) {
            Ok(virt) => Ok((virt, backend_path.to_string())),
            Err(e) if e.is_missing_iv() => {
                let proposal = share
                    .resolve_conflict(backend_path)?
                    .ok_or(e)?;
                debug!(
                    share = share.name(),
                    from = backend_path,
                    to = %proposal,
                    "renaming conflict copy to indexed name"
                );
                if let Err(rename_err) = share.backend().rename(backend_path, &proposal) {
                    warn!(
                        share = share.name(),
                        from = backend_path,
                        error = %rename_err,
                        "conflict rename failed"
                    );
                    return Err(rename_err);
                }
                let virt = share.deobfuscate(&proposal)?;
                Ok((virt, proposal))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::share::test_support::local_share;
    use super::*;
    use tempfile::TempDir;

    fn volume_with(shares: &[(&str, &TempDir)]) -> RootVolume {
        let volume = RootVolume::new(VolumeCapacity::default());
        for (name, dir) in shares {
            volume.register(None, local_share(name, dir.path()));
        }
        volume
    }

    #[test]
    fn test_routing_honors_share_boundaries() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let volume = volume_with(&[("docs", &a), ("docs2", &b)]);

        assert_eq!(
            volume.resolve_share(None, "/docs/x.txt").unwrap().name(),
            "docs"
        );
        assert_eq!(
            volume.resolve_share(None, "/docs2/x.txt").unwrap().name(),
            "docs2"
        );
        assert!(matches!(
            volume.resolve_share(None, "/nosuch/x.txt"),
            Err(Error::ShareNotFound(_))
        ));
        assert!(matches!(
            volume.node_for(None, "/").unwrap(),
            VirtualNode::Root
        ));
    }

    #[test]
    fn test_users_see_only_their_shares() {
        let a = TempDir::new().unwrap();
        let volume = RootVolume::new(VolumeCapacity::default());
        volume.register(Some("alice"), local_share("docs", a.path()));

        assert_eq!(volume.share_names(Some("alice")), vec!["docs"]);
        assert!(volume.share_names(Some("bob")).is_empty());
        assert!(volume.resolve_share(None, "/docs/x").is_err());
    }

    #[test]
    fn test_exists_and_changed_detects_moved_backing() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let volume = volume_with(&[("docs", &a)]);

        // Same name, same backing: nothing to replace
        let same = local_share("docs", a.path());
        assert!(!volume.exists_and_changed(None, &same));

        // Same name, relocated backing: stale registration must go
        let moved = local_share("docs", b.path());
        assert!(volume.exists_and_changed(None, &moved));

        // Unknown name: nothing registered, so nothing changed
        let fresh = local_share("pics", b.path());
        assert!(!volume.exists_and_changed(None, &fresh));
    }

    #[test]
    fn test_remove_share() {
        let a = TempDir::new().unwrap();
        let volume = volume_with(&[("docs", &a)]);
        assert!(volume.remove(None, "docs"));
        assert!(!volume.remove(None, "docs"));
        assert!(volume.share_names(None).is_empty());
    }

    #[test]
    fn test_reregistered_share_starts_cold() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let volume = volume_with(&[("docs", &a)]);

        let (_, old_backend) = volume
            .obfuscate_path(None, "/docs/notes.txt", true)
            .unwrap();

        // Same name, different backing root and keys
        volume.register(None, local_share("docs", b.path()));
        let share = volume.share_by_name(None, "docs").unwrap();
        assert_eq!(share.backend().location(), b.path().display().to_string());

        // The old backend name must not resolve through any leftover
        // cache of the previous attachment
        assert!(matches!(
            volume.deobfuscate_path(&share, &old_backend),
            Err(Error::MissingIv { .. })
        ));
    }

    #[test]
    fn test_obfuscate_round_trip_through_volume() {
        let a = TempDir::new().unwrap();
        let volume = volume_with(&[("docs", &a)]);

        let (share, backend_path) = volume
            .obfuscate_path(None, "/docs/projects/plan.md", true)
            .unwrap();
        let (virt, same) = volume.deobfuscate_path(&share, &backend_path).unwrap();
        assert_eq!(virt, "/projects/plan.md");
        assert_eq!(same, backend_path);
    }

    #[test]
    fn test_conflict_rename_side_effect() {
        let a = TempDir::new().unwrap();
        let volume = volume_with(&[("docs", &a)]);
        let share = volume.share_by_name(None, "docs").unwrap();

        // A file the backend later conflict-renamed
        let original = volume
            .obfuscate_path(None, "/docs/budget.xlsx", true)
            .unwrap()
            .1;
        share.backend().create(&original).unwrap();
        let renamed = format!("{original} (conflicted copy)");
        share.backend().rename(&original, &renamed).unwrap();

        let (virt, new_backend) = volume.deobfuscate_path(&share, &renamed).unwrap();
        assert_eq!(virt, "/budget.xlsx (conflicted copy)");
        // Entry was renamed on the backend to its indexed name
        assert_ne!(new_backend, renamed);
        assert!(share.backend().exists(&new_backend));
        assert!(!share.backend().exists(&renamed));
    }
}
