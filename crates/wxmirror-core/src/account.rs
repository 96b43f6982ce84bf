//! Logged-in messenger accounts discovered from running processes.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::keys::imgkey;
use crate::platform;

/// Process names the messenger runs under, newest generation first.
pub const MESSENGER_EXES: &[&str] = &["Weixin.exe", "WeChat.exe"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    Darwin,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Windows => write!(f, "windows"),
            Platform::Darwin => write!(f, "darwin"),
        }
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "windows" | "win" => Ok(Platform::Windows),
            "darwin" | "macos" | "mac" => Ok(Platform::Darwin),
            other => Err(Error::Malformed(format!("unknown platform: {other}"))),
        }
    }
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::Darwin
        } else {
            Platform::Windows
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Online,
    Offline,
}

/// One logged-in user of the messenger. Discovered by process enumeration;
/// invalidated when the backing process exits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub pid: u32,
    pub exe_path: PathBuf,
    pub platform: Platform,
    /// Major on-disk format generation, 3 or 4.
    pub version: u8,
    pub full_version: String,
    pub name: String,
    /// Source data directory (encrypted databases and media cache).
    pub data_dir: PathBuf,
    /// Decrypted mirror output, once configured.
    pub work_dir: Option<PathBuf>,
    pub status: AccountStatus,
    pub data_key: Option<String>,
    pub image_key: Option<String>,
}

impl Account {
    /// Whether the backing process is still alive.
    pub fn refresh_status(&mut self) {
        let alive = platform::find_pids_by_name(&exe_name(&self.exe_path))
            .map(|pids| pids.contains(&self.pid))
            .unwrap_or(false);
        self.status = if alive {
            AccountStatus::Online
        } else {
            AccountStatus::Offline
        };
    }
}

fn exe_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Major format version from the executable name: the rebranded `Weixin.exe`
/// is the v4 client, the legacy `WeChat.exe` is v3.
fn version_for_exe(name: &str) -> (u8, &'static str) {
    if name.eq_ignore_ascii_case("Weixin.exe") {
        (4, "4.0")
    } else {
        (3, "3.9")
    }
}

/// Enumerate running messenger processes and build one [`Account`] per match.
///
/// The data directory is auto-detected from the user profile cache tree; an
/// account with no detectable cache still comes back (with an empty data dir)
/// so the caller can supply one manually.
pub fn discover() -> Result<Vec<Account>> {
    let mut accounts = Vec::new();
    let cache_dirs = imgkey::find_cache_dirs().unwrap_or_default();

    for proc in platform::list_processes()? {
        if !MESSENGER_EXES
            .iter()
            .any(|n| n.eq_ignore_ascii_case(&proc.name))
        {
            continue;
        }
        let (version, full_version) = version_for_exe(&proc.name);
        let data_dir = cache_dirs.first().cloned().unwrap_or_default();
        let name = data_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| proc.name.clone());
        accounts.push(Account {
            pid: proc.pid,
            exe_path: proc.exe_path,
            platform: Platform::current(),
            version,
            full_version: full_version.to_string(),
            name,
            data_dir,
            work_dir: None,
            status: AccountStatus::Online,
            data_key: None,
            image_key: None,
        });
    }

    Ok(accounts)
}
