//! Core primitives for mirroring a desktop messenger's encrypted local state:
//! key recovery from the running process, the SQLCipher-style page decryptor,
//! and the image cache (`.dat`) decoder.
//!
//! The long-running watch/replace machinery lives in `wxmirror-db`; this crate
//! is the blocking, dependency-light layer underneath it.

pub mod account;
pub mod cancel;
pub mod dat;
pub mod decrypt;
pub mod error;
pub mod keys;
pub mod platform;

pub use error::{Error, Result};
