//! Path segment obfuscation
//!
//! Obfuscation is a deterministic, keyed transformation of one path segment
//! at a time: the same plaintext under the same key always yields the same
//! backend name, so concurrent writers agree on backend paths without
//! coordination. Determinism comes from the content-addressed IV; the IV is
//! recoverable for readers through the per-share IV pool.
//!
//! A segment may come back from the backend with a conflict marker appended
//! ("xyz (conflicted copy ...)"). Such a name no longer matches any IV pool
//! entry; [`Obfuscator::resolve_conflict_candidate`] recovers the plaintext
//! of the prefix and proposes a properly obfuscated replacement name.

mod ivpool;

pub use ivpool::{DirIvPool, IvPool, MemIvPool, ENTRY_LEN, IV_POOL_DIR, METADATA_DIR};

use crate::cache::BoundedMap;
use crate::crypto::{self, SymmetricKey};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// How to recognize a backend's conflict-copy marker inside a renamed
/// segment. Tied to the backend's renaming convention, so it is selected by
/// configuration rather than hard-coded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictRule {
    /// Everything after the first whitespace run is the marker; the first
    /// token is the original obfuscated name. Matches the observed
    /// "<name> (user's conflicted copy ...)" convention.
    #[default]
    WhitespaceSuffix,
}

impl ConflictRule {
    /// Split a conflicting segment into `(ciphertext_candidate, marker)`.
    /// The marker retains its leading whitespace so it can be re-appended
    /// to the recovered plaintext verbatim.
    pub fn split<'a>(&self, segment: &'a str) -> Option<(&'a str, &'a str)> {
        match self {
            ConflictRule::WhitespaceSuffix => {
                let idx = segment.find(char::is_whitespace)?;
                if idx == 0 || idx == segment.len() {
                    return None;
                }
                Some((&segment[..idx], &segment[idx..]))
            }
        }
    }
}

struct NameCaches {
    /// plaintext segment -> obfuscated segment
    obfuscated: BoundedMap<String, String>,
    /// obfuscated segment -> plaintext segment
    deobfuscated: BoundedMap<String, String>,
}

/// Per-share segment obfuscator: cipher state, name caches and the IV pool
pub struct Obfuscator {
    share_name: String,
    pool: Box<dyn IvPool>,
    caches: Mutex<NameCaches>,
    conflict_rule: ConflictRule,
}

impl Obfuscator {
    pub fn new(
        share_name: impl Into<String>,
        pool: Box<dyn IvPool>,
        name_cache_capacity: usize,
        conflict_rule: ConflictRule,
    ) -> Self {
        Obfuscator {
            share_name: share_name.into(),
            pool,
            caches: Mutex::new(NameCaches {
                obfuscated: BoundedMap::new(name_cache_capacity),
                deobfuscated: BoundedMap::new(name_cache_capacity),
            }),
            conflict_rule,
        }
    }

    /// Obfuscate one path segment.
    ///
    /// With `create_iv` the IV pool entry is durably written first and the
    /// result is cached; without it the ciphertext is computed but neither
    /// indexed nor cached. That form is only good for existence probes,
    /// not for names that must later be deobfuscated.
    pub fn obfuscate(&self, segment: &str, key: &SymmetricKey, create_iv: bool) -> Result<String> {
        if let Some(hit) = self.caches.lock().obfuscated.get(&segment.to_string()) {
            return Ok(hit.clone());
        }

        let iv = crypto::derive_iv(segment, key);
        let ciphertext = crypto::encrypt_segment(segment, key, &iv)?;
        let obfuscated = crypto::encode_segment(&ciphertext);

        if create_iv {
            let lookup = crypto::to_hex(&crypto::lookup_hash(&obfuscated, key));
            self.pool.insert(&lookup, &iv)?;
            // Cache only once the IV entry exists on the backend
            self.caches
                .lock()
                .obfuscated
                .insert(segment.to_string(), obfuscated.clone());
        }

        debug!(share = %self.share_name, %segment, %obfuscated, create_iv, "obfuscated segment");
        Ok(obfuscated)
    }

    /// Deobfuscate one path segment. A miss in the IV pool cache triggers a
    /// single full re-scan before the miss is surfaced as
    /// [`Error::MissingIv`], which is the expected signal for a
    /// backend-renamed conflict copy, not necessarily an error.
    pub fn deobfuscate(&self, segment: &str, key: &SymmetricKey) -> Result<String> {
        if let Some(hit) = self.caches.lock().deobfuscated.get(&segment.to_string()) {
            return Ok(hit.clone());
        }

        let lookup = crypto::to_hex(&crypto::lookup_hash(segment, key));
        let iv = match self.pool.cached_iv(&lookup) {
            Some(iv) => iv,
            None => {
                self.pool.fetch()?;
                // The re-scan goes through the bounded cache, which may
                // already have evicted this entry again on a large share;
                // the backing store has the final word.
                let recovered = match self.pool.cached_iv(&lookup) {
                    Some(iv) => Some(iv),
                    None => self.pool.stored_iv(&lookup)?,
                };
                recovered.ok_or_else(|| {
                    debug!(share = %self.share_name, %segment, %lookup, "no IV for segment");
                    Error::MissingIv { lookup: lookup.clone() }
                })?
            }
        };

        let ciphertext = crypto::decode_segment(segment)?;
        let plaintext = crypto::decrypt_segment(&ciphertext, key, &iv)?;

        let mut caches = self.caches.lock();
        caches
            .deobfuscated
            .insert(segment.to_string(), plaintext.clone());
        caches
            .obfuscated
            .insert(plaintext.clone(), segment.to_string());
        Ok(plaintext)
    }

    /// Obfuscate every component of a `/`-separated path. The bare
    /// separator is the identity; obfuscation never spans segments.
    pub fn obfuscate_path(&self, path: &str, key: &SymmetricKey, create_ivs: bool) -> Result<String> {
        if is_root(path) {
            return Ok("/".to_string());
        }
        let mut out = String::new();
        for segment in segments(path) {
            out.push('/');
            out.push_str(&self.obfuscate(segment, key, create_ivs)?);
        }
        Ok(out)
    }

    /// Deobfuscate every component of a `/`-separated path
    pub fn deobfuscate_path(&self, path: &str, key: &SymmetricKey) -> Result<String> {
        if is_root(path) {
            return Ok("/".to_string());
        }
        let mut out = String::new();
        for segment in segments(path) {
            out.push('/');
            out.push_str(&self.deobfuscate(segment, key)?);
        }
        Ok(out)
    }

    /// Attempt conflict-copy recovery for a path whose final segment failed
    /// deobfuscation. On success returns a proposed replacement path whose
    /// final segment is the obfuscation (with IV entry created) of
    /// `recovered_plaintext + conflict_marker`; the caller is responsible
    /// for renaming the backend file. `None` means the segment does not
    /// look like a conflict copy, and callers must treat that as a hard
    /// failure, not retry.
    pub fn resolve_conflict_candidate(
        &self,
        path: &str,
        key: &SymmetricKey,
    ) -> Result<Option<String>> {
        if is_root(path) {
            return Ok(None);
        }
        let parts: Vec<&str> = segments(path).collect();
        let conflicting = parts[parts.len() - 1];

        let (candidate, marker) = match self.conflict_rule.split(conflicting) {
            Some(split) => split,
            None => {
                warn!(share = %self.share_name, segment = %conflicting,
                      "no conflict marker found in segment");
                return Ok(None);
            }
        };

        let recovered = match self.deobfuscate(candidate, key) {
            Ok(name) => name,
            Err(Error::MissingIv { .. }) => {
                warn!(share = %self.share_name, %candidate,
                      "conflict prefix has no IV entry either; giving up");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        // Fold the backend's marker into the plaintext and index the
        // result up front, so the renamed file deobfuscates cleanly.
        let resolved = format!("{recovered}{marker}");
        let obfuscated = self.obfuscate(&resolved, key, true)?;
        debug!(share = %self.share_name, %resolved, %obfuscated, "resolved conflict copy");

        let mut proposal = String::new();
        for parent in &parts[..parts.len() - 1] {
            proposal.push('/');
            proposal.push_str(parent);
        }
        proposal.push('/');
        proposal.push_str(&obfuscated);
        Ok(Some(proposal))
    }

    /// Drop both name caches. The IV pool is untouched; it is backend state.
    pub fn clear_caches(&self) {
        let mut caches = self.caches.lock();
        caches.obfuscated.clear();
        caches.deobfuscated.clear();
    }
}

fn is_root(path: &str) -> bool {
    path.is_empty() || path.chars().all(|c| c == '/')
}

/// Non-empty components of a `/`-separated path
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{BLOCK_SIZE, LOOKUP_HASH_SIZE};
    use tempfile::TempDir;

    fn mem_obfuscator() -> Obfuscator {
        Obfuscator::new(
            "docs",
            Box::new(MemIvPool::new()),
            1024,
            ConflictRule::default(),
        )
    }

    #[test]
    fn test_round_trip() {
        let ob = mem_obfuscator();
        let key = SymmetricKey::generate();

        for name in ["report.txt", "ä ö ü 漢字.bin", "a", "x".repeat(255).as_str()] {
            let ct = ob.obfuscate(name, &key, true).unwrap();
            assert_eq!(ob.deobfuscate(&ct, &key).unwrap(), name);
        }
    }

    #[test]
    fn test_deterministic_across_cache_clears() {
        let ob = mem_obfuscator();
        let key = SymmetricKey::generate();

        let first = ob.obfuscate("report.txt", &key, true).unwrap();
        ob.clear_caches();
        let second = ob.obfuscate("report.txt", &key, true).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_index_entry_is_unrecoverable() {
        let ob = mem_obfuscator();
        let key = SymmetricKey::generate();

        let ct = ob.obfuscate("probe-only.txt", &key, false).unwrap();
        ob.clear_caches();
        match ob.deobfuscate(&ct, &key) {
            Err(Error::MissingIv { lookup }) => {
                assert_eq!(lookup.len(), 2 * LOOKUP_HASH_SIZE);
            }
            other => panic!("expected MissingIv, got {other:?}"),
        }
    }

    #[test]
    fn test_probe_obfuscation_is_not_cached() {
        let ob = mem_obfuscator();
        let key = SymmetricKey::generate();

        let probe = ob.obfuscate("later.txt", &key, false).unwrap();
        // The probe must not have seeded the cache; the indexed call has
        // to write the IV entry itself.
        let indexed = ob.obfuscate("later.txt", &key, true).unwrap();
        assert_eq!(probe, indexed);
        assert_eq!(ob.deobfuscate(&indexed, &key).unwrap(), "later.txt");
    }

    #[test]
    fn test_path_obfuscation_is_per_segment() {
        let ob = mem_obfuscator();
        let key = SymmetricKey::generate();

        let obf_file = ob.obfuscate_path("/projects/report.txt", &key, true).unwrap();
        let obf_dir = ob.obfuscate_path("/projects", &key, true).unwrap();
        assert!(obf_file.starts_with(&obf_dir));
        assert_eq!(
            ob.deobfuscate_path(&obf_file, &key).unwrap(),
            "/projects/report.txt"
        );
        assert_eq!(ob.obfuscate_path("/", &key, true).unwrap(), "/");
    }

    #[test]
    fn test_conflict_resolution_round_trip() {
        let ob = mem_obfuscator();
        let key = SymmetricKey::generate();

        let ct = ob.obfuscate("budget.xlsx", &key, true).unwrap();
        let renamed = format!("{ct} (conflicted copy 2015-03-02)");

        let proposal = ob
            .resolve_conflict_candidate(&format!("/{renamed}"), &key)
            .unwrap()
            .expect("conflict should be resolvable");

        let final_segment = proposal.rsplit('/').next().unwrap();
        assert_eq!(
            ob.deobfuscate(final_segment, &key).unwrap(),
            "budget.xlsx (conflicted copy 2015-03-02)"
        );
    }

    #[test]
    fn test_conflict_resolution_requires_marker_and_known_prefix() {
        let ob = mem_obfuscator();
        let key = SymmetricKey::generate();

        // No whitespace at all: nothing to split on
        assert_eq!(
            ob.resolve_conflict_candidate("/nowhitespace", &key).unwrap(),
            None
        );

        // Marker present but the prefix was never indexed
        assert_eq!(
            ob.resolve_conflict_candidate("/bm9pZA (conflicted copy)", &key)
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_deobfuscation_survives_pool_cache_pressure() {
        // More indexed segments than the pool cache holds: the re-scan
        // alone cannot keep them all resident, so lookups must fall back
        // to the marker files on disk.
        let tmp = TempDir::new().unwrap();
        let pool = DirIvPool::open(tmp.path(), 1).unwrap();
        let ob = Obfuscator::new("docs", Box::new(pool), 1024, ConflictRule::default());
        let key = SymmetricKey::generate();

        let first = ob.obfuscate("first.txt", &key, true).unwrap();
        let second = ob.obfuscate("second.txt", &key, true).unwrap();
        ob.clear_caches();

        assert_eq!(ob.deobfuscate(&first, &key).unwrap(), "first.txt");
        assert_eq!(ob.deobfuscate(&second, &key).unwrap(), "second.txt");
    }

    #[test]
    fn test_backend_name_shape_and_iv_entry_layout() {
        let tmp = TempDir::new().unwrap();
        let pool = DirIvPool::open(tmp.path(), 128).unwrap();
        let ob = Obfuscator::new("docs", Box::new(pool), 1024, ConflictRule::default());
        let key = SymmetricKey::generate();

        let ct = ob.obfuscate("report.txt", &key, true).unwrap();
        // Stream cipher: ciphertext bytes == plaintext bytes, base64 grows
        // them by 4/3 without padding.
        assert_eq!(ct.len(), ("report.txt".len() * 4 + 2) / 3);
        assert!(!ct.contains('=') && !ct.contains('+') && !ct.contains('/'));

        // Exactly one pool entry of 2*20 + 2*16 hex characters, under the
        // fan-out directory matching the lookup hash's first digit.
        let lookup = crate::crypto::to_hex(&crate::crypto::lookup_hash(&ct, &key));
        let subdir = tmp
            .path()
            .join(METADATA_DIR)
            .join(IV_POOL_DIR)
            .join(&lookup[..1]);
        let names: Vec<String> = std::fs::read_dir(&subdir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].len(), 2 * LOOKUP_HASH_SIZE + 2 * BLOCK_SIZE);
        assert!(names[0].starts_with(&lookup));
    }
}
