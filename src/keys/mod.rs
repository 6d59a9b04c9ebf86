//! Share key management
//!
//! Each share carries a generation-versioned file-encryption key plus one
//! fixed obfuscation key. Encrypted key material lives in a key-metadata
//! volume on the backend ([`KeyVolume`]); only the paired device key can
//! unwrap it ([`DeviceKeys`]). Unwrapped keys are cached per version and
//! never re-resolved: key material for a published version is immutable
//! backend history.

use crate::crypto::SymmetricKey;
use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::debug;

/// Initial capacity of the per-share version cache
const KEY_CACHE_INITIAL: usize = 20;

/// Growth step when a version beyond the current capacity is requested
const KEY_CACHE_GROWTH: usize = 10;

/// One resolved share key generation
#[derive(Clone)]
pub struct ShareKey {
    pub version: u32,
    pub key: SymmetricKey,
}

/// Key material as stored on the backend: wrapped for one device
#[derive(Clone)]
pub struct EncryptedShareKey {
    pub version: u32,
    pub ciphertext: Vec<u8>,
}

/// The backend's key-metadata volume, consumed as a black box. The volume
/// instance is already scoped to one device's public key.
pub trait KeyVolume: Send + Sync {
    /// Wrapped share key for an exact version
    fn encrypted_share_key(&self, version: u32) -> Result<EncryptedShareKey>;

    /// Wrapped share key for the newest version
    fn latest_encrypted_share_key(&self) -> Result<EncryptedShareKey>;

    /// Wrapped obfuscation key (fixed for the share's lifetime)
    fn encrypted_obfuscation_key(&self) -> Result<Vec<u8>>;
}

/// This device's asymmetric key pair, consumed as a black box
pub trait DeviceKeys: Send + Sync {
    /// Unwrap key material wrapped for this device. Failure is terminal:
    /// retrying cannot change an asymmetric-decryption outcome.
    fn unwrap_key(&self, ciphertext: &[u8]) -> Result<SymmetricKey>;
}

/// Per-share key registry with a growable, write-once version cache
pub struct ShareKeyRing {
    volume: Arc<dyn KeyVolume>,
    device: Arc<dyn DeviceKeys>,
    cache: Mutex<Vec<Option<ShareKey>>>,
}

impl ShareKeyRing {
    pub fn new(volume: Arc<dyn KeyVolume>, device: Arc<dyn DeviceKeys>) -> Self {
        ShareKeyRing {
            volume,
            device,
            cache: Mutex::new(vec![None; KEY_CACHE_INITIAL]),
        }
    }

    /// Resolve the share key for an exact version, e.g. the version read
    /// from an encrypted file's header.
    pub fn key(&self, version: u32) -> Result<SymmetricKey> {
        let mut cache = self.cache.lock();
        grow_to_fit(&mut cache, version);
        if let Some(hit) = &cache[version as usize] {
            return Ok(hit.key.clone());
        }

        debug!(version, "resolving share key from key volume");
        let wrapped = self.volume.encrypted_share_key(version)?;
        let key = self.device.unwrap_key(&wrapped.ciphertext)?;
        cache[version as usize] = Some(ShareKey {
            version: wrapped.version,
            key: key.clone(),
        });
        Ok(key)
    }

    /// Resolve the newest key generation. Callers creating a new file must
    /// use this rather than a fixed version, so new content is always
    /// sealed under the current key.
    pub fn latest(&self) -> Result<ShareKey> {
        let wrapped = self.volume.latest_encrypted_share_key()?;

        let mut cache = self.cache.lock();
        grow_to_fit(&mut cache, wrapped.version);
        if let Some(hit) = &cache[wrapped.version as usize] {
            return Ok(hit.clone());
        }

        debug!(version = wrapped.version, "resolving latest share key");
        let key = self.device.unwrap_key(&wrapped.ciphertext)?;
        let share_key = ShareKey {
            version: wrapped.version,
            key,
        };
        cache[wrapped.version as usize] = Some(share_key.clone());
        Ok(share_key)
    }

    /// Unwrap the share's obfuscation key
    pub fn obfuscation_key(&self) -> Result<SymmetricKey> {
        let wrapped = self.volume.encrypted_obfuscation_key()?;
        self.device.unwrap_key(&wrapped)
    }
}

fn grow_to_fit(cache: &mut Vec<Option<ShareKey>>, version: u32) {
    while cache.len() <= version as usize {
        cache.extend(std::iter::repeat(None).take(KEY_CACHE_GROWTH));
    }
}

/// Device keys whose wrapping is the identity transform. Stands in for the
/// platform keystore on local mounts and in tests, where key files are
/// already protected by filesystem permissions.
pub struct PlainDeviceKeys;

impl DeviceKeys for PlainDeviceKeys {
    fn unwrap_key(&self, ciphertext: &[u8]) -> Result<SymmetricKey> {
        SymmetricKey::from_bytes(ciphertext)
            .map_err(|_| Error::KeyUnwrap("malformed key material".into()))
    }
}

/// In-memory key volume with support for rotation. Used by tests and by
/// local mounts whose keys are loaded from a key file.
pub struct StaticKeyVolume {
    obfuscation_key: Vec<u8>,
    versions: RwLock<Vec<Vec<u8>>>,
}

impl StaticKeyVolume {
    pub fn new(obfuscation_key: Vec<u8>, initial_share_key: Vec<u8>) -> Self {
        StaticKeyVolume {
            obfuscation_key,
            versions: RwLock::new(vec![initial_share_key]),
        }
    }

    pub fn with_versions(obfuscation_key: Vec<u8>, versions: Vec<Vec<u8>>) -> Result<Self> {
        if versions.is_empty() {
            return Err(Error::Config("key volume needs at least one share key".into()));
        }
        Ok(StaticKeyVolume {
            obfuscation_key,
            versions: RwLock::new(versions),
        })
    }

    /// Publish a new key generation. Returns the new latest version.
    pub fn rotate(&self, new_key: Vec<u8>) -> u32 {
        let mut versions = self.versions.write();
        versions.push(new_key);
        (versions.len() - 1) as u32
    }
}

impl KeyVolume for StaticKeyVolume {
    fn encrypted_share_key(&self, version: u32) -> Result<EncryptedShareKey> {
        let versions = self.versions.read();
        let ciphertext = versions
            .get(version as usize)
            .cloned()
            .ok_or_else(|| Error::KeyNotFound(format!("no share key version {version}")))?;
        Ok(EncryptedShareKey { version, ciphertext })
    }

    fn latest_encrypted_share_key(&self) -> Result<EncryptedShareKey> {
        let versions = self.versions.read();
        let version = (versions.len() - 1) as u32;
        Ok(EncryptedShareKey {
            version,
            ciphertext: versions[version as usize].clone(),
        })
    }

    fn encrypted_obfuscation_key(&self) -> Result<Vec<u8>> {
        Ok(self.obfuscation_key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SYMMETRIC_KEY_SIZE;

    fn key_bytes(fill: u8) -> Vec<u8> {
        vec![fill; SYMMETRIC_KEY_SIZE]
    }

    fn ring_over(volume: Arc<StaticKeyVolume>) -> ShareKeyRing {
        ShareKeyRing::new(volume, Arc::new(PlainDeviceKeys))
    }

    #[test]
    fn test_latest_is_stable_without_rotation() {
        let volume = Arc::new(StaticKeyVolume::new(key_bytes(0xA0), key_bytes(1)));
        let ring = ring_over(volume);

        let first = ring.latest().unwrap();
        let second = ring.latest().unwrap();
        assert_eq!(first.version, second.version);
        assert_eq!(first.key, second.key);
    }

    #[test]
    fn test_rotation_is_monotonic_and_history_stays_resolvable() {
        let volume = Arc::new(StaticKeyVolume::new(key_bytes(0xA0), key_bytes(1)));
        let ring = ring_over(volume.clone());

        let before = ring.latest().unwrap();
        let rotated_to = volume.rotate(key_bytes(2));
        let after = ring.latest().unwrap();

        assert!(after.version > before.version);
        assert_eq!(after.version, rotated_to);
        // Old generation still resolves, to its original key material
        assert_eq!(ring.key(before.version).unwrap(), before.key);
        assert_ne!(after.key, before.key);
    }

    #[test]
    fn test_version_cache_grows_past_initial_capacity() {
        let versions: Vec<Vec<u8>> = (0..64).map(|i| key_bytes(i as u8 + 1)).collect();
        let volume =
            Arc::new(StaticKeyVolume::with_versions(key_bytes(0xA0), versions).unwrap());
        let ring = ring_over(volume);

        assert_eq!(
            ring.key(63).unwrap(),
            SymmetricKey::from_bytes(&key_bytes(64)).unwrap()
        );
        assert_eq!(
            ring.key(0).unwrap(),
            SymmetricKey::from_bytes(&key_bytes(1)).unwrap()
        );
    }

    #[test]
    fn test_unknown_version_fails() {
        let volume = Arc::new(StaticKeyVolume::new(key_bytes(0xA0), key_bytes(1)));
        let ring = ring_over(volume);
        assert!(matches!(ring.key(7), Err(Error::KeyNotFound(_))));
    }

    #[test]
    fn test_malformed_key_material_is_terminal() {
        let volume = Arc::new(StaticKeyVolume::new(key_bytes(0xA0), vec![1, 2, 3]));
        let ring = ring_over(volume);
        assert!(matches!(ring.latest(), Err(Error::KeyUnwrap(_))));
    }
}
