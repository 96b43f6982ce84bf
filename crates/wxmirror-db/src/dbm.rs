//! Read-only SQLite connection management over the decrypted mirrors, with
//! the lock/close/replace protocol the decrypt service swaps files through.
//!
//! Connections live in per-path slots (`Arc<Mutex<Option<Connection>>>`).
//! `close_db` takes the handle out of the slot and drops it synchronously,
//! which is what releases the OS file lock on Windows; readers that still
//! hold the slot simply reopen on their next use. Windows opens use
//! `immutable=1&mode=ro` URIs and are never cached, so every close promptly
//! releases the handle. The path-lock set lives under its own mutex,
//! separate from the connection cache, so the swap path never holds both.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, OpenFlags};
use tracing::debug;

use wxmirror_core::{Error, Result};

use crate::monitor::{Callback, FileEvent, FileGroup, FileMonitor, FileOp};

const LOCK_POLL: Duration = Duration::from_millis(100);
const EVICT_DELAY: Duration = Duration::from_secs(5);

type Slot = Arc<Mutex<Option<Connection>>>;

/// Case-insensitive (on Windows), slash-normalized key for the cache and
/// lock maps.
fn norm_key(path: &Path) -> String {
    let s = path.to_string_lossy().replace('\\', "/");
    if cfg!(windows) {
        s.to_lowercase()
    } else {
        s
    }
}

fn open_readonly(path: &Path) -> Result<Connection> {
    if cfg!(windows) {
        // immutable=1 lets the reader coexist with the source process's
        // exclusive locks without copying the file.
        let uri = format!(
            "file:{}?immutable=1&mode=ro",
            path.to_string_lossy().replace('\\', "/")
        );
        Ok(Connection::open_with_flags(
            uri,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
        )?)
    } else {
        Ok(Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?)
    }
}

/// A pooled read-only handle for one mirror path. Cloneable; the underlying
/// connection opens lazily and reopens transparently after an eviction.
#[derive(Clone)]
pub struct DbConn {
    path: PathBuf,
    slot: Slot,
}

impl DbConn {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the connection, opening it first if the slot is
    /// empty. The slot mutex serializes readers with `close_db`.
    pub fn with<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut guard = self.slot.lock();
        if guard.is_none() {
            *guard = Some(open_readonly(&self.path)?);
        }
        let Some(conn) = guard.as_ref() else {
            return Err(Error::Malformed("connection slot empty after open".into()));
        };
        Ok(f(conn)?)
    }
}

type ConnMap = Arc<RwLock<HashMap<String, Slot>>>;

pub struct DbManager {
    root: PathBuf,
    monitor: FileMonitor,
    groups: RwLock<HashMap<String, Arc<FileGroup>>>,
    group_paths: RwLock<HashMap<String, Vec<PathBuf>>>,
    conns: ConnMap,
    locks: Mutex<HashSet<String>>,
}

impl DbManager {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            monitor: FileMonitor::new(),
            groups: RwLock::new(HashMap::new()),
            group_paths: RwLock::new(HashMap::new()),
            conns: Arc::new(RwLock::new(HashMap::new())),
            locks: Mutex::new(HashSet::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Register a pattern group under the watch root. The manager installs
    /// its own eviction callback so changed files are reopened fresh.
    pub fn add_group(&self, name: &str, pattern: &str, blacklist: &[&str]) -> Result<()> {
        let group = Arc::new(FileGroup::new(name, &self.root, pattern, blacklist)?);
        let conns = Arc::clone(&self.conns);
        group.add_callback(Arc::new(move |ev| {
            evict_on_change(&conns, ev);
            Ok(())
        }));
        self.monitor.add_group(group.clone());
        self.groups.write().insert(name.to_string(), group);
        Ok(())
    }

    /// Attach an external callback to a registered group.
    pub fn set_callback(&self, name: &str, cb: Callback) -> Result<()> {
        let groups = self.groups.read();
        let group = groups
            .get(name)
            .ok_or_else(|| Error::FileGroupNotFound(name.to_string()))?;
        group.add_callback(cb);
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        self.monitor.start()
    }

    pub fn stop(&self) {
        self.monitor.stop();
    }

    /// Paths currently backing a group, listed once and cached.
    pub fn group_paths(&self, name: &str) -> Result<Vec<PathBuf>> {
        if let Some(paths) = self.group_paths.read().get(name) {
            return Ok(paths.clone());
        }
        let group = {
            let groups = self.groups.read();
            groups
                .get(name)
                .cloned()
                .ok_or_else(|| Error::FileGroupNotFound(name.to_string()))?
        };
        let paths = group.list().map_err(|e| Error::DbFileNotFound {
            root: self.root.clone(),
            pattern: group.pattern_str().to_string(),
            cause: e.to_string(),
        })?;
        if paths.is_empty() {
            return Err(Error::DbFileNotFound {
                root: self.root.clone(),
                pattern: group.pattern_str().to_string(),
                cause: "no matches".into(),
            });
        }
        self.group_paths
            .write()
            .insert(name.to_string(), paths.clone());
        Ok(paths)
    }

    /// Pooled connections to every file of a group.
    pub fn get_dbs(&self, name: &str) -> Result<Vec<DbConn>> {
        self.group_paths(name)?
            .into_iter()
            .map(|p| self.open_db(&p))
            .collect()
    }

    /// A read-only connection for one path. Blocks (in 100 ms steps) while
    /// the path is locked by a swap.
    pub fn open_db(&self, path: &Path) -> Result<DbConn> {
        let key = norm_key(path);
        loop {
            if !self.locks.lock().contains(&key) {
                break;
            }
            std::thread::sleep(LOCK_POLL);
        }

        if cfg!(windows) {
            // Pool limit 1, no caching: the handle dies with the DbConn and
            // the OS lock is released as soon as the caller is done.
            return Ok(DbConn {
                path: path.to_path_buf(),
                slot: Arc::new(Mutex::new(None)),
            });
        }

        let slot = {
            let mut conns = self.conns.write();
            conns.entry(key).or_default().clone()
        };
        Ok(DbConn {
            path: path.to_path_buf(),
            slot,
        })
    }

    /// Synchronously close any cached connection to `path`.
    pub fn close_db(&self, path: &Path) {
        let slot = self.conns.write().remove(&norm_key(path));
        if let Some(slot) = slot {
            let dropped = slot.lock().take();
            if dropped.is_some() {
                debug!(path = %path.display(), "connection closed");
            }
        }
    }

    /// Mark `path` closed-to-openers; new [`open_db`](Self::open_db) calls
    /// block until [`unlock_db`](Self::unlock_db).
    pub fn lock_db(&self, path: &Path) {
        self.locks.lock().insert(norm_key(path));
    }

    pub fn unlock_db(&self, path: &Path) {
        self.locks.lock().remove(&norm_key(path));
    }

    /// Drop every cached connection and stop watching.
    pub fn close(&self) {
        let slots: Vec<Slot> = self.conns.write().drain().map(|(_, s)| s).collect();
        for slot in slots {
            let _ = slot.lock().take();
        }
        self.monitor.stop();
    }
}

/// Create/Write/Rename on a source file evicts its cached handle so the
/// next open observes fresh content. The actual close happens lazily.
fn evict_on_change(conns: &ConnMap, event: &FileEvent) {
    if !matches!(event.op, FileOp::Create | FileOp::Write | FileOp::Rename) {
        return;
    }
    let slot = conns.write().remove(&norm_key(&event.path));
    if let Some(slot) = slot {
        std::thread::spawn(move || {
            std::thread::sleep(EVICT_DELAY);
            let _ = slot.lock().take();
        });
    }
}

impl Drop for DbManager {
    fn drop(&mut self) {
        let slots: Vec<Slot> = self.conns.write().drain().map(|(_, s)| s).collect();
        for slot in slots {
            let _ = slot.lock().take();
        }
    }
}

/// Swap-protocol surface the decrypt service drives. Separate from the full
/// manager so the service can run against any datasource implementation.
pub trait DbControl: Send + Sync {
    fn lock_db(&self, path: &Path);
    fn unlock_db(&self, path: &Path);
    fn close_db(&self, path: &Path);
}

impl DbControl for DbManager {
    fn lock_db(&self, path: &Path) {
        DbManager::lock_db(self, path)
    }

    fn unlock_db(&self, path: &Path) {
        DbManager::unlock_db(self, path)
    }

    fn close_db(&self, path: &Path) {
        DbManager::close_db(self, path)
    }
}
