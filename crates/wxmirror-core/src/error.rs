use std::path::PathBuf;

use thiserror::Error;

use crate::account::Platform;

/// Error taxonomy shared by every wxmirror crate.
#[derive(Debug, Error)]
pub enum Error {
    /// No decryptor or key extractor exists for this platform/version pair.
    #[error("no support for {platform} format version {version}")]
    PlatformUnsupported { platform: Platform, version: u8 },

    /// The selected account has no live process behind it.
    #[error("messenger account is offline")]
    ProcessOffline,

    /// A process we expected to find (or open) is not running. Distinguishes
    /// absence from a permissions failure, which surfaces as `Io`.
    #[error("process not running: {0}")]
    ProcessNotRunning(String),

    /// Key extraction ran to completion without producing a usable key.
    #[error("no valid key was recovered")]
    NoValidKey,

    /// Page 1 failed HMAC verification: the key does not match the file.
    #[error("key does not match this database")]
    InvalidKey,

    /// The input already starts with the SQLite magic. The caller is
    /// expected to copy the bytes verbatim.
    #[error("file is already a plain sqlite database")]
    AlreadyDecrypted,

    #[error("template trailer bytes disagree with the jpeg tail")]
    XorKeyMismatch,

    #[error("no template carries an oracle ciphertext block")]
    NoOracle,

    #[error("no *_t.dat templates under the cache directory")]
    NoTemplates,

    #[error("messenger cache directory not found")]
    NoCache,

    #[error("no aes key candidate verified against process memory")]
    NoMatchInMemory,

    #[error("file group not found: {0}")]
    FileGroupNotFound(String),

    #[error("no db files under {} matching {pattern}: {cause}", .root.display())]
    DbFileNotFound {
        root: PathBuf,
        pattern: String,
        cause: String,
    },

    #[error("failed to replace {} after retries", .0.display())]
    SwapFailed(PathBuf),

    #[error("operation canceled or deadline exceeded")]
    Canceled,

    /// Malformed on-disk data (truncated container, bad padding, unknown
    /// image signature, ...).
    #[error("malformed input: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
