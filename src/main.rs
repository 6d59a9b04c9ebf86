//! ShroudFS - client-side encrypting filesystem with obfuscated filenames
//!
//! Usage:
//!   shroudfs init                       - Write a starter configuration
//!   shroudfs keygen <key_file>          - Generate key material for a share
//!   shroudfs rotate <key_file>          - Publish a new share key generation
//!   shroudfs mount <mount_point>        - Mount the virtual filesystem
//!   shroudfs status                     - Show configuration and share health

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shroudfs::{
    backend::LocalBackend,
    config::{Config, ShareConfig, ShareKeyFile},
    fs::ShroudFs,
    keys::{PlainDeviceKeys, StaticKeyVolume},
    obfuscate::DirIvPool,
    session::Engine,
    vfs::{RootVolume, Share, VolumeCapacity},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shroudfs")]
#[command(version)]
#[command(about = "Client-side encrypting virtual filesystem with obfuscated filenames")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/shroudfs/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter configuration with one share
    Init {
        /// Backend directory for the first share
        #[arg(long)]
        backend_root: PathBuf,

        /// Name of the first share
        #[arg(long, default_value = "share")]
        share_name: String,
    },

    /// Generate key material for a share
    Keygen {
        /// Key file to write
        key_file: PathBuf,
    },

    /// Publish a new share key generation in a key file
    Rotate {
        /// Key file to rotate
        key_file: PathBuf,
    },

    /// Mount the virtual filesystem
    Mount {
        /// Mount point directory
        mount_point: PathBuf,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Unmount a mount point
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// Show configuration and share health
    Status,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let config_path = expand_tilde(&cli.config);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Init {
            backend_root,
            share_name,
        } => cmd_init(config_path, backend_root, share_name),
        Commands::Keygen { key_file } => cmd_keygen(&key_file),
        Commands::Rotate { key_file } => cmd_rotate(&key_file),
        Commands::Mount {
            mount_point,
            allow_other,
        } => cmd_mount(config_path, &mount_point, allow_other),
        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),
        Commands::Status => cmd_status(config_path),
    }
}

fn cmd_init(config_path: &Path, backend_root: PathBuf, share_name: String) -> Result<()> {
    let key_file = backend_root.join(format!("{share_name}.keys"));

    let mut config = Config::default();
    config.shares.push(ShareConfig {
        name: share_name.clone(),
        backend_root: backend_root.clone(),
        key_file: key_file.clone(),
    });

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::create_dir_all(&backend_root)?;

    ShareKeyFile::generate()
        .save(&key_file)
        .context("writing key file")?;
    config.save(config_path).context("writing configuration")?;

    info!("Configuration saved to {:?}", config_path);
    info!("Key material for '{}' saved to {:?}", share_name, key_file);
    info!("Mount with 'shroudfs mount <mount_point>'");
    Ok(())
}

fn cmd_keygen(key_file: &Path) -> Result<()> {
    if key_file.exists() {
        anyhow::bail!("refusing to overwrite existing key file {key_file:?}");
    }
    ShareKeyFile::generate()
        .save(key_file)
        .context("writing key file")?;
    info!("Key material saved to {:?}", key_file);
    Ok(())
}

fn cmd_rotate(key_file: &Path) -> Result<()> {
    let mut keys = ShareKeyFile::load(key_file).context("loading key file")?;
    keys.share_keys.push(shroudfs::config::HexKey(
        shroudfs::crypto::SymmetricKey::generate().as_bytes().to_vec(),
    ));
    keys.save(key_file).context("writing key file")?;
    info!(
        "Rotated {:?}: latest share key version is now {}",
        key_file,
        keys.share_keys.len() - 1
    );
    Ok(())
}

fn attach_shares(config: &Config, root: &RootVolume) -> Result<()> {
    for share_cfg in &config.shares {
        let keys = ShareKeyFile::load(&share_cfg.key_file)
            .with_context(|| format!("loading keys for share '{}'", share_cfg.name))?;
        let backend = Arc::new(
            LocalBackend::open(&share_cfg.backend_root)
                .with_context(|| format!("opening backend for share '{}'", share_cfg.name))?,
        );
        let pool = DirIvPool::open(
            &share_cfg.backend_root,
            config.obfuscation.iv_pool_cache_entries,
        )
        .with_context(|| format!("opening IV pool for share '{}'", share_cfg.name))?;
        let volume = Arc::new(StaticKeyVolume::with_versions(
            keys.obfuscation_key,
            keys.share_keys.into_iter().map(|k| k.0).collect(),
        )?);
        let share = Share::attach(
            share_cfg.name.clone(),
            backend,
            Box::new(pool),
            volume,
            Arc::new(PlainDeviceKeys),
            &config.obfuscation,
        )
        .with_context(|| format!("attaching share '{}'", share_cfg.name))?;
        root.register(None, share);
    }
    Ok(())
}

fn cmd_mount(config_path: &Path, mount_point: &Path, allow_other: bool) -> Result<()> {
    let mut config = Config::load(config_path).context("loading configuration")?;
    config.mount.mount_point = mount_point.to_path_buf();
    config.mount.allow_other = allow_other;

    let root = Arc::new(RootVolume::new(VolumeCapacity {
        total_bytes: config.volume.total_bytes,
        free_bytes: config.volume.free_bytes,
    }));
    attach_shares(&config, &root)?;

    let engine = Arc::new(Engine::new(root, None, config.mount.delete_policy));
    let fs = ShroudFs::new(engine, config.mount.clone());

    std::fs::create_dir_all(mount_point)?;
    info!("Mounting at {:?}", mount_point);

    let mut options = vec![
        fuser::MountOption::FSName("shroudfs".to_string()),
        fuser::MountOption::DefaultPermissions,
        fuser::MountOption::AutoUnmount,
    ];
    if config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }
    if config.mount.allow_root {
        options.push(fuser::MountOption::AllowRoot);
    }

    fuser::mount2(fs, mount_point, &options).context("mount failed")?;
    Ok(())
}

fn cmd_unmount(mount_point: &Path) -> Result<()> {
    info!("Unmounting {:?}...", mount_point);

    #[cfg(target_os = "linux")]
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .output()?;

    #[cfg(target_os = "macos")]
    let output = std::process::Command::new("umount")
        .arg(mount_point)
        .output()?;

    if output.status.success() {
        info!("Unmounted successfully");
        Ok(())
    } else {
        anyhow::bail!(
            "failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
}

fn cmd_status(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path).context("loading configuration")?;

    println!("ShroudFS Status");
    println!("===============");
    println!();
    println!("Configuration: {:?}", config_path);
    println!("Mount point: {:?}", config.mount.mount_point);
    println!("Delete policy: {:?}", config.mount.delete_policy);
    println!();

    for share in &config.shares {
        let backend_ok = share.backend_root.is_dir();
        let keys = ShareKeyFile::load(&share.key_file);
        let key_state = match &keys {
            Ok(k) => format!("{} generation(s)", k.share_keys.len()),
            Err(e) => format!("UNREADABLE ({e})"),
        };
        println!(
            "Share '{}': backend {:?} [{}], keys {}",
            share.name,
            share.backend_root,
            if backend_ok { "ok" } else { "MISSING" },
            key_state
        );
    }
    Ok(())
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if path.starts_with("~") {
        if let Some(home) = dirs::home_dir() {
            if let Ok(rest) = path.strip_prefix("~") {
                return home.join(rest);
            }
        }
    }
    path.to_path_buf()
}
