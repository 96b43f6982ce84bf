//! Recovery of the database key and the image AES key from a running
//! messenger process.
//!
//! The v4 database key comes out of an auxiliary native module hooked into
//! the target process; the image key and the v3 database key are found by
//! scanning process memory against known-plaintext oracles.

pub mod dbkey;
pub mod hook;
pub mod imgkey;
pub mod v3;

use std::time::Duration;

use tracing::{error, warn};

use crate::account::{Account, AccountStatus};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};

/// Outer deadline for the hook-based database key; leaves headroom over the
/// 60-second inner polling window.
pub const DB_KEY_DEADLINE: Duration = Duration::from_secs(90);
/// Outer deadline for the image-key memory scan.
pub const IMAGE_KEY_DEADLINE: Duration = Duration::from_secs(60);

/// Both keys for one account: the database key as hex, the image key as the
/// 16-character AES-128 secret, plus the recovered cache XOR key.
#[derive(Debug, Clone)]
pub struct RecoveredKeys {
    pub data_key: Option<String>,
    pub image_key: Option<String>,
    pub xor_key: Option<u8>,
}

/// Run a blocking extraction step on its own thread with an outer deadline.
/// On timeout the worker's token is canceled and the call reports
/// [`Error::Canceled`]; the worker notices at its next poll and unwinds.
fn with_deadline<T: Send + 'static>(
    deadline: Duration,
    worker_cancel: CancelToken,
    work: impl FnOnce(CancelToken) -> Result<T> + Send + 'static,
) -> Result<T> {
    let (tx, rx) = std::sync::mpsc::channel();
    let thread_cancel = worker_cancel.clone();
    std::thread::spawn(move || {
        let _ = tx.send(work(thread_cancel));
    });
    match rx.recv_timeout(deadline) {
        Ok(result) => result,
        Err(_) => {
            worker_cancel.cancel();
            Err(Error::Canceled)
        }
    }
}

/// Run the full v4 extraction for `account`: hook-based database key first,
/// then the memory-scan image key. Either half may fail independently; the
/// call only errors when neither produced anything.
pub fn extract_v4(
    account: &Account,
    opts: &dbkey::DbKeyOptions,
    cancel: &CancelToken,
) -> Result<RecoveredKeys> {
    if account.status == AccountStatus::Offline {
        return Err(Error::ProcessOffline);
    }
    if cancel.is_canceled() {
        return Err(Error::Canceled);
    }

    // Each phase runs under its own child token so an outer timeout on one
    // phase does not cancel the next.
    let db_opts = opts.clone();
    let data_key = match with_deadline(DB_KEY_DEADLINE, CancelToken::new(), move |token| {
        dbkey::extract_data_key(&db_opts, &token)
    }) {
        Ok(key) => Some(key),
        Err(e) => {
            error!(error = %e, "database key extraction failed, continuing with image key");
            None
        }
    };

    if cancel.is_canceled() {
        return Err(Error::Canceled);
    }
    let pid = account.pid;
    let cache_dir = if account.data_dir.as_os_str().is_empty() {
        None
    } else {
        Some(account.data_dir.clone())
    };
    let image = with_deadline(IMAGE_KEY_DEADLINE, CancelToken::new(), move |token| {
        imgkey::extract_image_key(pid, cache_dir.as_deref(), &token)
    });
    let (image_key, xor_key) = match image {
        Ok(res) => (Some(res.aes_key), Some(res.xor_key)),
        Err(e) => {
            warn!(error = %e, "image key extraction failed");
            (None, None)
        }
    };

    if data_key.is_none() && image_key.is_none() {
        return Err(Error::NoValidKey);
    }
    Ok(RecoveredKeys {
        data_key,
        image_key,
        xor_key,
    })
}
