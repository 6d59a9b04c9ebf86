//! One attached share
//!
//! A share binds together a name, a storage backend, the key registry for
//! that share and the per-share obfuscator. Virtual paths inside a share
//! are always relative to the share root; stripping the share name off the
//! global virtual path happens here and nowhere else.

use crate::backend::Backend;
use crate::config::ObfuscationConfig;
use crate::crypto::SymmetricKey;
use crate::error::Result;
use crate::keys::{DeviceKeys, KeyVolume, ShareKey, ShareKeyRing};
use crate::obfuscate::{IvPool, Obfuscator};
use std::sync::Arc;
use tracing::info;

pub struct Share {
    name: String,
    backend: Arc<dyn Backend>,
    keys: ShareKeyRing,
    obfuscation_key: SymmetricKey,
    obfuscator: Obfuscator,
}

impl Share {
    /// Attach a share: unwrap its obfuscation key and wire up the
    /// obfuscator over the given IV pool.
    pub fn attach(
        name: impl Into<String>,
        backend: Arc<dyn Backend>,
        pool: Box<dyn IvPool>,
        volume: Arc<dyn KeyVolume>,
        device: Arc<dyn DeviceKeys>,
        obf: &ObfuscationConfig,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        let keys = ShareKeyRing::new(volume, device);
        let obfuscation_key = keys.obfuscation_key()?;
        let obfuscator = Obfuscator::new(
            name.clone(),
            pool,
            obf.name_cache_entries,
            obf.conflict_rule,
        );
        info!(share = %name, backend = %backend.location(), "attached share");
        Ok(Arc::new(Share {
            name,
            backend,
            keys,
            obfuscation_key,
            obfuscator,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn keys(&self) -> &ShareKeyRing {
        &self.keys
    }

    /// Newest key generation, used for sealing newly created files
    pub fn latest_key(&self) -> Result<ShareKey> {
        self.keys.latest()
    }

    /// Whether a global virtual path falls inside this share. Matching is
    /// boundary-exact: `/docs2` does not belong to the share `docs`.
    pub fn contains(&self, virtual_path: &str) -> bool {
        let Some(rest) = virtual_path.strip_prefix('/') else {
            return false;
        };
        match rest.strip_prefix(&self.name) {
            Some("") => true,
            Some(tail) => tail.starts_with('/'),
            None => false,
        }
    }

    /// Strip the share name off a global virtual path. Returns the
    /// share-relative path, `/` for the share root itself.
    pub fn strip<'a>(&self, virtual_path: &'a str) -> &'a str {
        debug_assert!(self.contains(virtual_path));
        let rel = &virtual_path[1 + self.name.len()..];
        if rel.is_empty() {
            "/"
        } else {
            rel
        }
    }

    /// Obfuscate a share-relative path into its backend form
    pub fn obfuscate(&self, rel: &str, create_ivs: bool) -> Result<String> {
        self.obfuscator
            .obfuscate_path(rel, &self.obfuscation_key, create_ivs)
    }

    /// Deobfuscate a backend path back into its share-relative form
    pub fn deobfuscate(&self, backend_path: &str) -> Result<String> {
        self.obfuscator
            .deobfuscate_path(backend_path, &self.obfuscation_key)
    }

    /// Deobfuscate a single directory entry name
    pub fn deobfuscate_entry(&self, entry: &str) -> Result<String> {
        self.obfuscator
            .deobfuscate(entry, &self.obfuscation_key)
    }

    /// Propose a replacement backend path for a conflict-renamed entry.
    /// See [`Obfuscator::resolve_conflict_candidate`].
    pub fn resolve_conflict(&self, backend_path: &str) -> Result<Option<String>> {
        self.obfuscator
            .resolve_conflict_candidate(backend_path, &self.obfuscation_key)
    }

    /// Drop name caches, e.g. when the share is re-registered
    pub fn clear_caches(&self) {
        self.obfuscator.clear_caches();
    }
}

impl std::fmt::Debug for Share {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Share")
            .field("name", &self.name)
            .field("backend", &self.backend.location())
            .finish()
    }
}
