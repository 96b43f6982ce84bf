//! v4 database-key extraction through the auxiliary hook module.
//!
//! Full protocol: kill any running messenger, relaunch it from the
//! discovered install path, wait for the process, give the UI a moment,
//! attach the hook, then poll for the captured key while draining progress
//! messages. With a caller-supplied pid the kill/launch/wait phase is
//! skipped and the hook attaches directly.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::account::MESSENGER_EXES;
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::keys::hook::{HookLibrary, KeyHook, StatusLevel};
use crate::platform;

pub const DEFAULT_HOOK_MODULE: &str = "wx_key.dll";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

const PROCESS_WAIT: Duration = Duration::from_secs(15);
const UI_SETTLE: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const STATUS_DRAIN_MAX: usize = 10;

#[derive(Debug, Clone)]
pub struct DbKeyOptions {
    /// Attach to this pid instead of restarting the messenger.
    pub pid: Option<u32>,
    pub timeout: Duration,
    pub module_path: PathBuf,
}

impl Default for DbKeyOptions {
    fn default() -> Self {
        Self {
            pid: None,
            timeout: DEFAULT_TIMEOUT,
            module_path: PathBuf::from(DEFAULT_HOOK_MODULE),
        }
    }
}

/// Recover the v4 database key as 64 hex characters.
pub fn extract_data_key(opts: &DbKeyOptions, cancel: &CancelToken) -> Result<String> {
    let mut hook = HookLibrary::load(&opts.module_path)?;

    let pid = match opts.pid {
        Some(pid) => pid,
        None => {
            let pid = relaunch_messenger(cancel)?;
            // Let the login window come up before hooking.
            std::thread::sleep(UI_SETTLE);
            pid
        }
    };

    poll_for_key(&mut hook, pid, opts.timeout, cancel)
}

fn relaunch_messenger(cancel: &CancelToken) -> Result<u32> {
    if MESSENGER_EXES.iter().any(|n| platform::is_process_running(n)) {
        info!("messenger is running, restarting it to capture the key");
        platform::kill_processes(MESSENGER_EXES);
        std::thread::sleep(Duration::from_secs(2));
    }
    if cancel.is_canceled() {
        return Err(Error::Canceled);
    }

    let exe = platform::messenger_install_path()
        .ok_or_else(|| Error::ProcessNotRunning("messenger install path not found".into()))?;
    info!(exe = %exe.display(), "launching messenger");
    platform::launch_detached(&exe)?;

    platform::wait_for_process(MESSENGER_EXES, PROCESS_WAIT)
        .ok_or_else(|| Error::ProcessNotRunning("messenger did not appear after launch".into()))
}

/// Attach and poll. `CleanupHook` runs exactly once on every exit path.
pub(crate) fn poll_for_key(
    hook: &mut dyn KeyHook,
    pid: u32,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<String> {
    if !hook.initialize(pid) {
        drain_status(hook);
        let msg = hook.last_error();
        warn!(pid, error = %msg, "hook initialization failed");
        return Err(Error::NoValidKey);
    }
    drain_status(hook);
    info!(pid, "hook attached, waiting for the key (log in if prompted)");

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cancel.is_canceled() {
            hook.cleanup();
            return Err(Error::Canceled);
        }
        drain_status(hook);

        if let Some(key) = hook.poll_key() {
            hook.cleanup();
            if !is_hex_key(&key) {
                warn!(len = key.len(), "hook produced a non-hex key, discarding");
                return Err(Error::NoValidKey);
            }
            info!("database key captured");
            return Ok(key);
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    hook.cleanup();
    warn!(timeout = ?timeout, "timed out waiting for the database key");
    Err(Error::NoValidKey)
}

fn drain_status(hook: &mut dyn KeyHook) {
    for _ in 0..STATUS_DRAIN_MAX {
        let Some((msg, level)) = hook.status_message() else {
            break;
        };
        match level {
            StatusLevel::Warn => warn!("{} {}", level.prefix(), msg),
            _ => debug!("{} {}", level.prefix(), msg),
        }
    }
}

/// A usable database key is exactly 64 hex characters (32 bytes).
fn is_hex_key(key: &str) -> bool {
    key.len() == 64 && key.bytes().all(|b| b.is_ascii_hexdigit())
}
