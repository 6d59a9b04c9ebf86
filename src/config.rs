//! Configuration management for ShroudFS

use crate::crypto::SymmetricKey;
use crate::error::{Error, Result};
use crate::obfuscate::ConflictRule;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default plaintext-name cache entries per share
pub const DEFAULT_NAME_CACHE_ENTRIES: usize = 8192;

/// Default cached IV pool entries per share. Sized so the cache covers
/// whole shares in practice; entries past it are still served from the
/// pool's marker files, just slower.
pub const DEFAULT_IV_CACHE_ENTRIES: usize = 204_800;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Mount configuration
    pub mount: MountConfig,

    /// Filename obfuscation configuration
    pub obfuscation: ObfuscationConfig,

    /// Reported volume capacity
    pub volume: VolumeConfig,

    /// Shares attached at mount time
    pub shares: Vec<ShareConfig>,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Mount point path
    pub mount_point: PathBuf,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Allow root to access the mount
    pub allow_root: bool,

    /// When a deleted file is still open, remove it now or on last close
    pub delete_policy: DeletePolicy,

    /// Default file permissions
    pub default_file_mode: u32,

    /// Default directory permissions
    pub default_dir_mode: u32,

    /// UID for files
    pub uid: u32,

    /// GID for files
    pub gid: u32,
}

/// Filename obfuscation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObfuscationConfig {
    /// Plaintext/obfuscated name cache entries per share (0 disables)
    pub name_cache_entries: usize,

    /// Cached IV pool entries per share (0 disables)
    pub iv_pool_cache_entries: usize,

    /// How the backend marks conflict copies
    pub conflict_rule: ConflictRule,
}

/// Reported volume capacity. Backends rarely expose quota numbers, so
/// statfs answers come from these values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// One share attachment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareConfig {
    /// Share name as it appears under the mount root
    pub name: String,

    /// Backend directory holding the obfuscated tree
    pub backend_root: PathBuf,

    /// Key file for this share
    pub key_file: PathBuf,
}

/// Behavior for unlinking a file that still has open sessions
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Remove the backend entry immediately; open sessions keep their
    /// descriptor until close
    Immediate,
    /// Keep the backend entry until the last session closes
    #[default]
    OnClose,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: PathBuf::from("/mnt/shroudfs"),
            allow_other: false,
            allow_root: false,
            delete_policy: DeletePolicy::default(),
            default_file_mode: 0o644,
            default_dir_mode: 0o755,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        ObfuscationConfig {
            name_cache_entries: DEFAULT_NAME_CACHE_ENTRIES,
            iv_pool_cache_entries: DEFAULT_IV_CACHE_ENTRIES,
            conflict_rule: ConflictRule::default(),
        }
    }
}

impl Default for VolumeConfig {
    fn default() -> Self {
        VolumeConfig {
            total_bytes: 100 * 1024 * 1024 * 1024,
            free_bytes: 50 * 1024 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;

        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config file: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.shares.is_empty() {
            return Err(Error::Config("at least one share is required".to_string()));
        }

        let mut names: Vec<&str> = self.shares.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.shares.len() {
            return Err(Error::Config("share names must be unique".to_string()));
        }

        for share in &self.shares {
            if share.name.is_empty() || share.name.contains('/') {
                return Err(Error::Config(format!(
                    "invalid share name '{}'",
                    share.name
                )));
            }
        }

        if self.volume.free_bytes > self.volume.total_bytes {
            return Err(Error::Config(
                "volume free_bytes exceeds total_bytes".to_string(),
            ));
        }

        Ok(())
    }
}

/// On-disk key material for one share. Protected by file permissions; a
/// platform keystore can stand in by implementing the key traits instead.
#[derive(Debug, Serialize, Deserialize)]
pub struct ShareKeyFile {
    /// Fixed obfuscation key
    #[serde(with = "hex_serde")]
    pub obfuscation_key: Vec<u8>,

    /// Share key generations, index = version
    pub share_keys: Vec<HexKey>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HexKey(#[serde(with = "hex_serde")] pub Vec<u8>);

impl ShareKeyFile {
    /// Generate fresh key material for a new share
    pub fn generate() -> Self {
        ShareKeyFile {
            obfuscation_key: SymmetricKey::generate().as_bytes().to_vec(),
            share_keys: vec![HexKey(SymmetricKey::generate().as_bytes().to_vec())],
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read key file: {}", e)))?;
        let keys: ShareKeyFile = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse key file: {}", e)))?;
        if keys.share_keys.is_empty() {
            return Err(Error::Config(
                "key file holds no share key generations".to_string(),
            ));
        }
        Ok(keys)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize key file: {}", e)))?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("failed to write key file: {}", e)))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path.as_ref(), std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

/// Hex serialization for byte arrays
mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn one_share() -> Config {
        Config {
            shares: vec![ShareConfig {
                name: "docs".to_string(),
                backend_root: PathBuf::from("/tmp/docs"),
                key_file: PathBuf::from("/tmp/docs.keys"),
            }],
            ..Config::default()
        }
    }

    #[test]
    fn test_config_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let config = one_share();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.shares.len(), 1);
        assert_eq!(loaded.shares[0].name, "docs");
        assert_eq!(loaded.mount.delete_policy, DeletePolicy::OnClose);
    }

    #[test]
    fn test_validation_rejects_bad_configs() {
        assert!(Config::default().validate().is_err());

        let mut dup = one_share();
        dup.shares.push(dup.shares[0].clone());
        assert!(dup.validate().is_err());

        let mut slash = one_share();
        slash.shares[0].name = "a/b".to_string();
        assert!(slash.validate().is_err());
    }

    #[test]
    fn test_key_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("share.keys");
        let keys = ShareKeyFile::generate();
        keys.save(&path).unwrap();

        let loaded = ShareKeyFile::load(&path).unwrap();
        assert_eq!(loaded.obfuscation_key, keys.obfuscation_key);
        assert_eq!(loaded.share_keys.len(), 1);
        assert_eq!(loaded.share_keys[0].0.len(), 32);
    }
}
