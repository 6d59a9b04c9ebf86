//! Error types for shroudfs
//!
//! Every failure an OS filesystem driver can observe maps onto one of these
//! variants, and from there onto a single errno via [`Error::errno`]. No raw
//! panics or backtraces may escape through a driver callback.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Path does not belong to any attached share
    #[error("no attached share contains '{0}'")]
    ShareNotFound(String),

    /// No IV recorded for an obfuscated segment. Recoverable only through
    /// conflict resolution; the lookup hash is carried for diagnostics.
    #[error("no IV recorded for lookup hash {lookup}")]
    MissingIv { lookup: String },

    /// Cipher or digest failure while transforming a path segment
    #[error("obfuscation failed: {0}")]
    Obfuscation(String),

    /// No key material exists for the requested share or version
    #[error("share key not found: {0}")]
    KeyNotFound(String),

    /// Device key cannot unwrap the share key. Terminal for the share:
    /// retrying cannot change an asymmetric-decryption outcome.
    #[error("device is not authorized for this share: {0}")]
    KeyUnwrap(String),

    /// Stale or double-released handle from the driver layer
    #[error("no open session for handle {0}")]
    HandleNotFound(u64),

    /// Write attempted through a read-only session
    #[error("handle {0} is read-only")]
    ReadOnlyHandle(u64),

    /// Backend file creation failed (missing parent, permissions, quota)
    #[error("create failed at '{path}': {source}")]
    CreateFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("delete failed: {0}")]
    DeleteFailed(String),

    #[error("rename failed: {0}")]
    RenameFailed(String),

    /// Rename or symlink whose endpoints live in different shares
    #[error("operation crosses share boundaries: {0}")]
    CrossShare(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Encrypted file header is missing or malformed
    #[error("bad encrypted file format: {0}")]
    BadFileFormat(String),

    /// Content authentication or sealing failure
    #[error("content crypto failure: {0}")]
    Crypto(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map to the host errno vocabulary. The FUSE adapter is the only
    /// consumer; engine code matches on variants instead.
    pub fn errno(&self) -> i32 {
        match self {
            Error::ShareNotFound(_) => libc::ENOENT,
            // Unresolved conflicts surface as "no such file"
            Error::MissingIv { .. } => libc::ENOENT,
            Error::Obfuscation(_) => libc::EIO,
            Error::KeyNotFound(_) | Error::KeyUnwrap(_) => libc::EACCES,
            Error::HandleNotFound(_) | Error::ReadOnlyHandle(_) => libc::EBADF,
            // Keeps the backend's own code, e.g. ENOENT when the parent
            // directory is gone
            Error::CreateFailed { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            Error::DeleteFailed(_) => libc::EIO,
            Error::RenameFailed(_) => libc::EACCES,
            Error::CrossShare(_) => libc::EXDEV,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::BadFileFormat(_) | Error::Crypto(_) => libc::EIO,
            Error::Config(_) => libc::EINVAL,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// True if the error may be recoverable through filename conflict
    /// resolution (backend renamed the file on its own initiative).
    pub fn is_missing_iv(&self) -> bool {
        matches!(self, Error::MissingIv { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::ShareNotFound("x".into()).errno(), libc::ENOENT);
        assert_eq!(
            Error::MissingIv { lookup: "ab".into() }.errno(),
            libc::ENOENT
        );
        assert_eq!(Error::HandleNotFound(7).errno(), libc::EBADF);
        assert_eq!(Error::KeyUnwrap("revoked".into()).errno(), libc::EACCES);
        assert_eq!(Error::CrossShare("a -> b".into()).errno(), libc::EXDEV);
        let source = std::io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(
            Error::CreateFailed { path: "/x".into(), source }.errno(),
            libc::ENOENT
        );
    }

    #[test]
    fn test_io_errno_passthrough() {
        let io = std::io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(Error::Io(io).errno(), libc::ENOSPC);
    }
}
