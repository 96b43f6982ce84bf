//! The live mirroring layer: a debounced recursive file monitor, a
//! read-only SQLite connection manager with an atomic swap protocol, the
//! decrypt service gluing the two around `wxmirror-core`'s page decryptor,
//! and the stable [`datasource::DataSource`] facade the query layer consumes.

pub mod datasource;
pub mod dbm;
pub mod monitor;
pub mod service;

pub use wxmirror_core::{Error, Result};
