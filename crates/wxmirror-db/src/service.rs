//! The decrypt service: glues the file monitor, the page decryptor, and the
//! DB manager's swap protocol into one live pipeline.
//!
//! Every Create/Write/Rename on a source database (or its `-wal` sibling)
//! updates the per-path debounce state; one debouncer thread per pending
//! path waits for quiescence and then re-decrypts the file into the work
//! directory, swapping the mirror atomically underneath active readers.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use wxmirror_core::account::Platform;
use wxmirror_core::decrypt::PageDecryptor;
use wxmirror_core::{Error, Result};

use crate::dbm::DbControl;
use crate::monitor::{FileEvent, FileGroup, FileMonitor, FileOp};

/// Quiet interval that ends a write burst.
pub const DEBOUNCE_TIME: Duration = Duration::from_secs(1);
/// Upper bound on how long a busy path can postpone its decryption.
pub const MAX_WAIT_TIME: Duration = Duration::from_secs(10);

const SWAP_PRELUDE: Duration = Duration::from_millis(100);
const SWAP_RETRIES: usize = 5;
const SWAP_BACKOFF: Duration = Duration::from_millis(200);

const LIVE_PATTERN: &str = r".*\.db(-wal)?$";
const BULK_PATTERN: &str = r".*\.db$";
const BLACKLIST: &[&str] = &["fts"];

#[derive(Debug, Clone)]
pub struct DecryptConfig {
    /// Database key, 64 hex characters.
    pub data_key: String,
    pub data_dir: PathBuf,
    pub work_dir: PathBuf,
    pub platform: Platform,
    pub version: u8,
}

#[derive(Default)]
struct DebounceState {
    last_events: HashMap<PathBuf, Instant>,
    pending: HashSet<PathBuf>,
}

struct ServiceInner {
    conf: DecryptConfig,
    key: Vec<u8>,
    state: Mutex<DebounceState>,
    control: RwLock<Option<Arc<dyn DbControl>>>,
    runs: AtomicUsize,
}

pub struct DecryptService {
    inner: Arc<ServiceInner>,
    monitor: Mutex<Option<FileMonitor>>,
}

impl DecryptService {
    pub fn new(conf: DecryptConfig) -> Result<Self> {
        // Validate the pair up front so a bad config fails loudly.
        PageDecryptor::new(conf.platform, conf.version)?;
        let key = hex::decode(&conf.data_key)?;
        Ok(Self {
            inner: Arc::new(ServiceInner {
                conf,
                key,
                state: Mutex::new(DebounceState::default()),
                control: RwLock::new(None),
                runs: AtomicUsize::new(0),
            }),
            monitor: Mutex::new(None),
        })
    }

    /// Attach the swap-protocol controller (normally the DB manager of the
    /// active datasource).
    pub fn set_db_control(&self, control: Arc<dyn DbControl>) {
        *self.inner.control.write() = Some(control);
    }

    /// Completed `decrypt_db_file` runs, for status reporting.
    pub fn runs(&self) -> usize {
        self.inner.runs.load(Ordering::SeqCst)
    }

    /// Start watching the source tree; every matching change re-runs the
    /// decryption pipeline for the touched file after the debounce interval.
    pub fn start_auto_decrypt(&self) -> Result<()> {
        let mut slot = self.monitor.lock();
        if slot.is_some() {
            return Ok(());
        }
        info!(data_dir = %self.inner.conf.data_dir.display(), "starting auto decrypt");

        let group = Arc::new(FileGroup::new(
            "source",
            &self.inner.conf.data_dir,
            LIVE_PATTERN,
            BLACKLIST,
        )?);
        let weak: Weak<ServiceInner> = Arc::downgrade(&self.inner);
        group.add_callback(Arc::new(move |ev| {
            if let Some(inner) = weak.upgrade() {
                if let Some(target) = inner.note_event(ev) {
                    let worker = Arc::clone(&inner);
                    std::thread::spawn(move || worker.wait_and_process(target));
                }
            }
            Ok(())
        }));

        let monitor = FileMonitor::new();
        monitor.add_group(group);
        monitor.start()?;
        *slot = Some(monitor);
        Ok(())
    }

    pub fn stop_auto_decrypt(&self) {
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.stop();
        }
    }

    /// Decrypt one source database into its mirror and swap it in. Shared by
    /// the live watcher and the bulk pipeline.
    pub fn decrypt_db_file(&self, src: &Path) -> Result<()> {
        self.inner.decrypt_db_file(src)
    }

    /// One-shot bulk mode: decrypt every matching database under the data
    /// directory, continuing past individual failures.
    pub fn decrypt_db_files(&self) -> Result<usize> {
        let group = FileGroup::new("bulk", &self.inner.conf.data_dir, BULK_PATTERN, BLACKLIST)?;
        let files = group.list()?;
        info!(count = files.len(), "bulk decrypting");

        let mut ok = 0usize;
        for file in files {
            match self.inner.decrypt_db_file(&file) {
                Ok(()) => ok += 1,
                Err(e) => {
                    debug!(path = %file.display(), error = %e, "skipping file");
                }
            }
        }
        Ok(ok)
    }
}

impl Drop for DecryptService {
    fn drop(&mut self) {
        self.stop_auto_decrypt();
    }
}

impl ServiceInner {
    /// Debounce step 1: record the event; the caller spawns a debouncer when
    /// this returns a path that nobody owns yet.
    fn note_event(&self, event: &FileEvent) -> Option<PathBuf> {
        if !matches!(event.op, FileOp::Create | FileOp::Write | FileOp::Rename) {
            return None;
        }

        // WAL activity targets the main database file.
        let target = match event.path.to_str() {
            Some(s) if s.ends_with("-wal") => PathBuf::from(&s[..s.len() - 4]),
            _ => event.path.clone(),
        };

        let mut state = self.state.lock();
        state.last_events.insert(target.clone(), Instant::now());
        state.pending.insert(target.clone()).then_some(target)
    }

    /// Debounce step 2: sleep until the path has been quiet for
    /// [`DEBOUNCE_TIME`], or [`MAX_WAIT_TIME`] has passed since the burst
    /// began. This thread is the only writer that clears the pending flag.
    fn wait_and_process(&self, target: PathBuf) {
        let start = Instant::now();
        loop {
            std::thread::sleep(DEBOUNCE_TIME);

            let fire = {
                let mut state = self.state.lock();
                let last = state.last_events.get(&target).copied().unwrap_or(start);
                if last.elapsed() >= DEBOUNCE_TIME || start.elapsed() >= MAX_WAIT_TIME {
                    state.pending.remove(&target);
                    true
                } else {
                    false
                }
            };

            if fire {
                debug!(path = %target.display(), "debounce settled, decrypting");
                if let Err(e) = self.decrypt_db_file(&target) {
                    warn!(path = %target.display(), error = %e, "decrypt failed");
                }
                return;
            }
        }
    }

    fn decrypt_db_file(&self, src: &Path) -> Result<()> {
        let decryptor = PageDecryptor::new(self.conf.platform, self.conf.version)?;

        let rel = src
            .strip_prefix(&self.conf.data_dir)
            .map_err(|_| Error::Malformed(format!("{} is outside the data dir", src.display())))?;
        let dst = self.conf.work_dir.join(rel);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = {
            let mut os = dst.clone().into_os_string();
            os.push(".tmp");
            PathBuf::from(os)
        };

        let write_result = (|| -> Result<()> {
            let file = std::fs::File::create(&tmp)?;
            let mut out = std::io::BufWriter::new(file);
            decryptor.decrypt_file(src, &self.key, &mut out)?;
            out.flush()?;
            Ok(())
        })();

        match write_result {
            Ok(()) => {}
            Err(Error::AlreadyDecrypted) => {
                // Mandated copy semantics: the mirror is always present even
                // when the source never was encrypted.
                std::fs::copy(src, &tmp)?;
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                return Err(e);
            }
        }

        // The mirror must be treated as checkpointed; stale WAL/SHM siblings
        // would be read by SQLite and corrupt results.
        remove_wal_siblings(&dst);
        self.replace_db(&tmp, &dst)?;
        remove_wal_siblings(&dst);

        self.runs.fetch_add(1, Ordering::SeqCst);
        info!(mirror = %dst.display(), "mirror refreshed");
        Ok(())
    }

    /// The swap: lock out new openers, close the pooled handle, give the OS
    /// a moment to release it, then rename with retries.
    fn replace_db(&self, tmp: &Path, dst: &Path) -> Result<()> {
        let control = self.control.read().clone();
        if let Some(ctrl) = &control {
            ctrl.lock_db(dst);
            ctrl.close_db(dst);
            std::thread::sleep(SWAP_PRELUDE);
        }

        let mut result = Err(Error::SwapFailed(dst.to_path_buf()));
        for attempt in 0..SWAP_RETRIES {
            match std::fs::rename(tmp, dst) {
                Ok(()) => {
                    result = Ok(());
                    break;
                }
                Err(e) => {
                    debug!(attempt, error = %e, "rename failed");
                    if e.kind() == std::io::ErrorKind::PermissionDenied {
                        let _ = std::fs::remove_file(dst);
                    }
                    std::thread::sleep(SWAP_BACKOFF);
                }
            }
        }

        if let Some(ctrl) = &control {
            ctrl.unlock_db(dst);
        }
        result
    }
}

fn remove_wal_siblings(db: &Path) {
    for suffix in ["-wal", "-shm"] {
        let mut os = db.to_path_buf().into_os_string();
        os.push(suffix);
        let sibling = PathBuf::from(os);
        match std::fs::remove_file(&sibling) {
            Ok(()) => debug!(path = %sibling.display(), "removed residual"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %sibling.display(), error = %e, "cannot remove residual"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation_rejects_bad_inputs() {
        let conf = DecryptConfig {
            data_key: "zz".into(),
            data_dir: PathBuf::from("/src"),
            work_dir: PathBuf::from("/dst"),
            platform: Platform::Windows,
            version: 4,
        };
        assert!(DecryptService::new(conf).is_err());

        let conf = DecryptConfig {
            data_key: "00".repeat(32),
            data_dir: PathBuf::from("/src"),
            work_dir: PathBuf::from("/dst"),
            platform: Platform::Windows,
            version: 9,
        };
        assert!(matches!(
            DecryptService::new(conf),
            Err(Error::PlatformUnsupported { .. })
        ));
    }

    #[test]
    fn wal_siblings_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("m.db");
        std::fs::write(&db, b"db").unwrap();
        std::fs::write(dir.path().join("m.db-wal"), b"wal").unwrap();
        std::fs::write(dir.path().join("m.db-shm"), b"shm").unwrap();

        remove_wal_siblings(&db);
        assert!(db.exists());
        assert!(!dir.path().join("m.db-wal").exists());
        assert!(!dir.path().join("m.db-shm").exists());
    }

    #[test]
    fn wal_events_retarget_and_burst_spawns_one_debouncer() {
        let service = DecryptService::new(DecryptConfig {
            data_key: "00".repeat(32),
            data_dir: PathBuf::from("/src"),
            work_dir: PathBuf::from("/dst"),
            platform: Platform::Windows,
            version: 4,
        })
        .unwrap();
        let inner = &service.inner;

        let wal_event = FileEvent {
            path: PathBuf::from("/src/a.db-wal"),
            op: FileOp::Write,
        };
        // First event claims the path.
        assert_eq!(inner.note_event(&wal_event), Some(PathBuf::from("/src/a.db")));
        // Further events within the burst only refresh the timestamp.
        assert_eq!(inner.note_event(&wal_event), None);
        let db_event = FileEvent {
            path: PathBuf::from("/src/a.db"),
            op: FileOp::Create,
        };
        assert_eq!(inner.note_event(&db_event), None);

        // Remove events never trigger.
        let rm = FileEvent {
            path: PathBuf::from("/src/b.db"),
            op: FileOp::Remove,
        };
        assert_eq!(inner.note_event(&rm), None);
    }
}
