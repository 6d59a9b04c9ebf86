//! ShroudFS - client-side encrypting virtual filesystem
//!
//! Presents plaintext names and content through a FUSE mount while the
//! backing store only ever sees obfuscated names and sealed bytes. Any
//! directory a sync client replicates can serve as a backend; the engine
//! tolerates the renames such clients perform on conflicting files.

pub mod backend;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod keys;
pub mod obfuscate;
pub mod session;
pub mod vfs;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::session::Engine;
    pub use crate::vfs::{RootVolume, Share};
}
