//! Host-process primitives: enumeration, launch/kill, registry lookup, and
//! remote memory reads.
//!
//! The real implementation is Windows-only; other hosts compile stubs that
//! report nothing running, mirroring how the extractors degrade on platforms
//! without a live messenger process.

use std::path::PathBuf;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::*;

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub exe_path: PathBuf,
}

/// One committed, readable region of a remote process.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: usize,
    pub size: usize,
}

#[cfg(not(windows))]
mod stub {
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use crate::error::{Error, Result};

    use super::{MemoryRegion, ProcessInfo};

    pub fn list_processes() -> Result<Vec<ProcessInfo>> {
        Ok(Vec::new())
    }

    pub fn find_pids_by_name(_name: &str) -> Result<Vec<u32>> {
        Ok(Vec::new())
    }

    pub fn is_process_running(_name: &str) -> bool {
        false
    }

    pub fn kill_processes(_names: &[&str]) {}

    pub fn launch_detached(path: &Path) -> Result<()> {
        Err(Error::ProcessNotRunning(path.display().to_string()))
    }

    pub fn wait_for_process(_names: &[&str], _timeout: Duration) -> Option<u32> {
        None
    }

    pub fn messenger_install_path() -> Option<PathBuf> {
        None
    }

    /// Remote-memory handle stub; opening always fails.
    pub struct ProcessMemory;

    impl ProcessMemory {
        pub fn open(pid: u32) -> Result<Self> {
            Err(Error::ProcessNotRunning(format!("pid {pid}")))
        }

        pub fn regions(&self) -> Vec<MemoryRegion> {
            Vec::new()
        }

        pub fn read_chunk(&self, _base: usize, _size: usize) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }
}

#[cfg(not(windows))]
pub use stub::*;
