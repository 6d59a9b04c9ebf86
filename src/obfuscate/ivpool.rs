//! IV pool: the persisted index that maps a ciphertext-derived lookup hash
//! to the IV needed to decrypt that ciphertext.
//!
//! Each entry is a zero-length marker file whose *name* carries all the
//! information: `hex(lookup_hash) || hex(iv)`, stored under a fan-out
//! subdirectory named after the first hex digit of the lookup hash, inside
//! the share's reserved metadata subtree. Presence of the file is the
//! record; it is written exactly once per distinct obfuscated segment and
//! never updated.

use crate::cache::BoundedMap;
use crate::crypto::{BLOCK_SIZE, LOOKUP_HASH_SIZE};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Reserved per-share metadata subtree. Hidden from directory listings.
pub const METADATA_DIR: &str = ".shroud";

/// IV pool directory inside the metadata subtree
pub const IV_POOL_DIR: &str = "ivpool";

/// Entry names are fixed-length: hex lookup hash followed by hex IV
pub const ENTRY_LEN: usize = 2 * LOOKUP_HASH_SIZE + 2 * BLOCK_SIZE;

const HEX_DIGITS: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F',
];

/// Storage for IV pool entries. Selected per share at construction time;
/// the directory-backed variant is the normal one, the in-memory variant
/// backs tests and hosts without a writable metadata subtree.
pub trait IvPool: Send + Sync {
    /// Look up an IV in the in-memory cache only
    fn cached_iv(&self, lookup: &str) -> Option<[u8; BLOCK_SIZE]>;

    /// Re-read the backing store into the cache. Called once per
    /// deobfuscation miss before the miss becomes a `MissingIv`.
    fn fetch(&self) -> Result<()>;

    /// Look up an IV directly in the backing store, bypassing the cache.
    /// The cache is bounded, so an entry evicted from it may still exist
    /// on the backend; the backend is authoritative.
    fn stored_iv(&self, lookup: &str) -> Result<Option<[u8; BLOCK_SIZE]>>;

    /// Durably record `(lookup, iv)` and only then cache it. A cache entry
    /// whose index write did not complete would make the name
    /// undecryptable later with no way to recover.
    fn insert(&self, lookup: &str, iv: &[u8; BLOCK_SIZE]) -> Result<()>;
}

/// Split a well-formed entry name into `(lookup_hex, iv_bytes)`
fn split_entry(name: &str) -> Option<(String, [u8; BLOCK_SIZE])> {
    if name.len() != ENTRY_LEN {
        return None;
    }
    let (lookup, iv_hex) = name.split_at(2 * LOOKUP_HASH_SIZE);
    let iv_vec = crate::crypto::from_hex(iv_hex).ok()?;
    let mut iv = [0u8; BLOCK_SIZE];
    iv.copy_from_slice(&iv_vec);
    Some((lookup.to_ascii_uppercase(), iv))
}

/// Directory-backed IV pool
pub struct DirIvPool {
    /// `<share root>/.shroud/ivpool`
    dir: PathBuf,
    cache: Mutex<BoundedMap<String, [u8; BLOCK_SIZE]>>,
}

impl DirIvPool {
    /// Open (creating fan-out subdirectories if needed) the pool under the
    /// share's backend root.
    pub fn open(share_root: &Path, cache_capacity: usize) -> Result<Self> {
        let dir = share_root.join(METADATA_DIR).join(IV_POOL_DIR);
        for digit in HEX_DIGITS {
            fs::create_dir_all(dir.join(digit.to_string()))?;
        }
        Ok(DirIvPool {
            dir,
            cache: Mutex::new(BoundedMap::new(cache_capacity)),
        })
    }

    fn subdir_for(&self, lookup: &str) -> PathBuf {
        let first = lookup
            .chars()
            .next()
            .unwrap_or('0')
            .to_ascii_uppercase();
        self.dir.join(first.to_string())
    }

    /// An entry longer than the fixed length means the backend renamed the
    /// sidecar itself (its own conflict handling). The valid entry is the
    /// fixed-length prefix; restore it and drop the rest.
    fn repair_entry(&self, subdir: &Path, name: &str) -> Option<(String, [u8; BLOCK_SIZE])> {
        warn!("invalid IV entry length for '{name}', attempting repair");
        if name.len() < ENTRY_LEN {
            error!("cannot repair short IV entry '{name}'");
            return None;
        }
        let prefix = &name[..ENTRY_LEN];
        let parsed = split_entry(prefix)?;

        let valid = subdir.join(prefix);
        let damaged = subdir.join(name);
        let outcome = if valid.exists() {
            fs::remove_file(&damaged)
        } else {
            fs::rename(&damaged, &valid)
        };
        if let Err(e) = outcome {
            error!("unable to repair IV entry '{name}': {e}");
        }
        Some(parsed)
    }
}

impl IvPool for DirIvPool {
    fn cached_iv(&self, lookup: &str) -> Option<[u8; BLOCK_SIZE]> {
        self.cache.lock().get(&lookup.to_ascii_uppercase()).copied()
    }

    fn fetch(&self) -> Result<()> {
        debug!("re-scanning IV pool at {}", self.dir.display());
        let mut fresh: HashMap<String, [u8; BLOCK_SIZE]> = HashMap::new();

        for digit in HEX_DIGITS {
            let subdir = self.dir.join(digit.to_string());
            let entries = match fs::read_dir(&subdir) {
                Ok(e) => e,
                Err(e) => {
                    error!("cannot read IV pool subdir {}: {e}", subdir.display());
                    continue;
                }
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                let parsed = if name.len() == ENTRY_LEN {
                    split_entry(&name)
                } else {
                    self.repair_entry(&subdir, &name)
                };
                match parsed {
                    Some((lookup, iv)) => {
                        if let Some(old) = fresh.insert(lookup.clone(), iv) {
                            if old != iv {
                                error!(
                                    "duplicate lookup value {lookup} with differing IVs; \
                                     keeping the newest"
                                );
                            }
                        }
                    }
                    None => error!("unreadable IV entry '{name}'"),
                }
            }
        }

        let mut cache = self.cache.lock();
        cache.clear();
        for (lookup, iv) in fresh {
            cache.insert(lookup, iv);
        }
        Ok(())
    }

    fn stored_iv(&self, lookup: &str) -> Result<Option<[u8; BLOCK_SIZE]>> {
        let lookup = lookup.to_ascii_uppercase();
        let subdir = self.subdir_for(&lookup);
        for entry in fs::read_dir(&subdir)?.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&lookup) {
                continue;
            }
            let parsed = if name.len() == ENTRY_LEN {
                split_entry(&name)
            } else {
                self.repair_entry(&subdir, &name)
            };
            if let Some((found, iv)) = parsed {
                if found == lookup {
                    self.cache.lock().insert(found, iv);
                    return Ok(Some(iv));
                }
            }
        }
        Ok(None)
    }

    fn insert(&self, lookup: &str, iv: &[u8; BLOCK_SIZE]) -> Result<()> {
        let lookup = lookup.to_ascii_uppercase();
        let name = format!("{lookup}{}", crate::crypto::to_hex(iv));
        debug_assert_eq!(name.len(), ENTRY_LEN);

        let path = self.subdir_for(&lookup).join(&name);
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| {
                Error::Obfuscation(format!("unable to create IV entry '{name}': {e}"))
            })?;

        // Cache only after the durable write succeeded
        self.cache.lock().insert(lookup, *iv);
        Ok(())
    }
}

/// In-memory IV pool. There is no backing store, so `fetch` is a no-op and
/// anything not inserted during this process lifetime is unrecoverable.
#[derive(Default)]
pub struct MemIvPool {
    entries: Mutex<HashMap<String, [u8; BLOCK_SIZE]>>,
}

impl MemIvPool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IvPool for MemIvPool {
    fn cached_iv(&self, lookup: &str) -> Option<[u8; BLOCK_SIZE]> {
        self.entries.lock().get(&lookup.to_ascii_uppercase()).copied()
    }

    fn fetch(&self) -> Result<()> {
        Ok(())
    }

    fn stored_iv(&self, lookup: &str) -> Result<Option<[u8; BLOCK_SIZE]>> {
        Ok(self.cached_iv(lookup))
    }

    fn insert(&self, lookup: &str, iv: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.entries
            .lock()
            .insert(lookup.to_ascii_uppercase(), *iv);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry_name(lookup_byte: u8, iv_byte: u8) -> (String, [u8; BLOCK_SIZE]) {
        let lookup = crate::crypto::to_hex(&[lookup_byte; LOOKUP_HASH_SIZE]);
        let iv = [iv_byte; BLOCK_SIZE];
        (lookup, iv)
    }

    #[test]
    fn test_insert_creates_fixed_length_marker() {
        let tmp = TempDir::new().unwrap();
        let pool = DirIvPool::open(tmp.path(), 128).unwrap();

        let (lookup, iv) = entry_name(0xAB, 0x01);
        pool.insert(&lookup, &iv).unwrap();

        let subdir = tmp.path().join(METADATA_DIR).join(IV_POOL_DIR).join("A");
        let names: Vec<String> = fs::read_dir(&subdir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].len(), ENTRY_LEN);
        assert_eq!(fs::metadata(subdir.join(&names[0])).unwrap().len(), 0);
    }

    #[test]
    fn test_fetch_recovers_entries_from_disk() {
        let tmp = TempDir::new().unwrap();
        let (lookup, iv) = entry_name(0x3C, 0x7F);
        {
            let pool = DirIvPool::open(tmp.path(), 128).unwrap();
            pool.insert(&lookup, &iv).unwrap();
        }

        // Fresh pool instance: cold cache until fetch
        let pool = DirIvPool::open(tmp.path(), 128).unwrap();
        assert_eq!(pool.cached_iv(&lookup), None);
        pool.fetch().unwrap();
        assert_eq!(pool.cached_iv(&lookup), Some(iv));
    }

    #[test]
    fn test_fetch_repairs_conflict_renamed_entry() {
        let tmp = TempDir::new().unwrap();
        let pool = DirIvPool::open(tmp.path(), 128).unwrap();

        let (lookup, iv) = entry_name(0x11, 0x22);
        let valid_name = format!("{lookup}{}", crate::crypto::to_hex(&iv));
        let damaged_name = format!("{valid_name} (conflicted copy)");
        let subdir = tmp.path().join(METADATA_DIR).join(IV_POOL_DIR).join("1");
        fs::write(subdir.join(&damaged_name), b"").unwrap();

        pool.fetch().unwrap();
        assert_eq!(pool.cached_iv(&lookup), Some(iv));
        assert!(subdir.join(&valid_name).exists());
        assert!(!subdir.join(&damaged_name).exists());
    }

    #[test]
    fn test_cache_eviction_does_not_lose_disk_entries() {
        let tmp = TempDir::new().unwrap();
        let pool = DirIvPool::open(tmp.path(), 1).unwrap();

        let (first, iv1) = entry_name(0xAA, 0x01);
        let (second, iv2) = entry_name(0xBB, 0x02);
        pool.insert(&first, &iv1).unwrap();
        pool.insert(&second, &iv2).unwrap();

        // The second insert evicted the first from the cache, but the
        // marker file is still there and the probe warms the cache again
        assert_eq!(pool.cached_iv(&first), None);
        assert_eq!(pool.stored_iv(&first).unwrap(), Some(iv1));
        assert_eq!(pool.cached_iv(&first), Some(iv1));

        let (absent, _) = entry_name(0xCC, 0x03);
        assert_eq!(pool.stored_iv(&absent).unwrap(), None);
    }

    #[test]
    fn test_mem_pool_fetch_is_noop() {
        let pool = MemIvPool::new();
        let (lookup, iv) = entry_name(0x55, 0x66);
        assert_eq!(pool.cached_iv(&lookup), None);
        pool.insert(&lookup, &iv).unwrap();
        pool.fetch().unwrap();
        assert_eq!(pool.cached_iv(&lookup), Some(iv));
    }
}
