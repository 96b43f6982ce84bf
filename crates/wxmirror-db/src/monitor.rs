//! Recursive filesystem watching parametrized by pattern groups.
//!
//! A [`FileGroup`] names a root, a path regex, and a blacklist; callbacks
//! registered on the group fire for every matching event. The
//! [`FileMonitor`] owns one `notify` watcher and bridges its events over a
//! channel into a dedicated dispatch thread, so callbacks never run on the
//! watcher's internal thread.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tracing::{debug, error, warn};
use walkdir::WalkDir;

use wxmirror_core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOp {
    Create,
    Write,
    Remove,
    Rename,
}

#[derive(Debug, Clone)]
pub struct FileEvent {
    pub path: PathBuf,
    pub op: FileOp,
}

pub type Callback = Arc<dyn Fn(&FileEvent) -> Result<()> + Send + Sync>;

/// Forward-slashed string form used for pattern and blacklist matching, so
/// the same regexes work on both host platforms.
fn slashed(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

pub struct FileGroup {
    name: String,
    root: PathBuf,
    pattern: Regex,
    pattern_str: String,
    blacklist: Vec<String>,
    callbacks: Mutex<Vec<Callback>>,
}

impl FileGroup {
    pub fn new(name: &str, root: &Path, pattern: &str, blacklist: &[&str]) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            root: root.to_path_buf(),
            pattern: Regex::new(pattern)?,
            pattern_str: pattern.to_string(),
            blacklist: blacklist.iter().map(|s| s.to_string()).collect(),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pattern_str(&self) -> &str {
        &self.pattern_str
    }

    /// A path belongs to the group when it sits under the root, matches the
    /// pattern, and contains none of the blacklist fragments.
    pub fn matches(&self, path: &Path) -> bool {
        if !path.starts_with(&self.root) {
            return false;
        }
        let text = slashed(path);
        if self.blacklist.iter().any(|b| text.contains(b.as_str())) {
            return false;
        }
        self.pattern.is_match(&text)
    }

    /// One-shot traversal of the root for currently matching files.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
            if entry.file_type().is_file() && self.matches(entry.path()) {
                out.push(entry.into_path());
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn add_callback(&self, cb: Callback) {
        self.callbacks.lock().push(cb);
    }

    fn dispatch(&self, event: &FileEvent) {
        let callbacks = self.callbacks.lock().clone();
        for cb in callbacks {
            if let Err(e) = cb(event) {
                warn!(group = %self.name, path = %event.path.display(), error = %e,
                      "file group callback failed");
            }
        }
    }
}

enum BridgeMsg {
    Event(notify::Result<Event>),
    Stop,
}

struct MonitorRuntime {
    // Held so the OS watches stay registered until stop().
    _watcher: RecommendedWatcher,
    tx: mpsc::Sender<BridgeMsg>,
    handle: JoinHandle<()>,
}

/// Recursive watcher fanning classified events out to registered groups.
#[derive(Default)]
pub struct FileMonitor {
    groups: RwLock<Vec<Arc<FileGroup>>>,
    runtime: Mutex<Option<MonitorRuntime>>,
}

impl FileMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a group. Groups added after [`start`](Self::start) are not
    /// watched until the monitor restarts.
    pub fn add_group(&self, group: Arc<FileGroup>) {
        self.groups.write().push(group);
    }

    pub fn groups(&self) -> Vec<Arc<FileGroup>> {
        self.groups.read().clone()
    }

    pub fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel::<BridgeMsg>();
        let event_tx = tx.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = event_tx.send(BridgeMsg::Event(res));
            },
            Config::default(),
        )
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;

        let groups = self.groups();
        let mut roots: Vec<PathBuf> = groups.iter().map(|g| g.root().to_path_buf()).collect();
        roots.sort();
        roots.dedup();
        for root in &roots {
            if root.exists() {
                watcher
                    .watch(root, RecursiveMode::Recursive)
                    .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
                debug!(root = %root.display(), "watching");
            } else {
                warn!(root = %root.display(), "watch root does not exist");
            }
        }

        let handle = std::thread::Builder::new()
            .name("file-monitor".into())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        BridgeMsg::Stop => return,
                        BridgeMsg::Event(Ok(event)) => {
                            for fe in classify(&event) {
                                for group in &groups {
                                    if group.matches(&fe.path) {
                                        group.dispatch(&fe);
                                    }
                                }
                            }
                        }
                        BridgeMsg::Event(Err(e)) => {
                            error!(error = %e, "watcher error");
                        }
                    }
                }
            })?;

        *runtime = Some(MonitorRuntime {
            _watcher: watcher,
            tx,
            handle,
        });
        Ok(())
    }

    pub fn stop(&self) {
        let Some(rt) = self.runtime.lock().take() else {
            return;
        };
        let _ = rt.tx.send(BridgeMsg::Stop);
        drop(rt._watcher);
        let _ = rt.handle.join();
    }
}

impl Drop for FileMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn classify(event: &Event) -> Vec<FileEvent> {
    let op = match &event.kind {
        EventKind::Create(_) => FileOp::Create,
        EventKind::Remove(_) => FileOp::Remove,
        EventKind::Modify(ModifyKind::Name(_)) => FileOp::Rename,
        EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Modify(_) => FileOp::Write,
        _ => return Vec::new(),
    };
    event
        .paths
        .iter()
        .map(|p| FileEvent {
            path: p.clone(),
            op,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_matches_pattern_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let group = FileGroup::new("db", dir.path(), r".*\.db$", &["fts"]).unwrap();

        assert!(group.matches(&dir.path().join("a/Msg0.db")));
        assert!(!group.matches(&dir.path().join("a/Msg0.db-wal")));
        assert!(!group.matches(&dir.path().join("a/fts/index.db")));
        assert!(!group.matches(Path::new("/elsewhere/Msg0.db")));
    }

    #[test]
    fn wal_suffix_pattern_matches_both() {
        let dir = tempfile::tempdir().unwrap();
        let group = FileGroup::new("db", dir.path(), r".*\.db(-wal)?$", &["fts"]).unwrap();

        assert!(group.matches(&dir.path().join("x.db")));
        assert!(group.matches(&dir.path().join("x.db-wal")));
        assert!(!group.matches(&dir.path().join("x.db-shm")));
    }

    #[test]
    fn list_walks_recursively_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/fts")).unwrap();
        std::fs::write(dir.path().join("one.db"), b"x").unwrap();
        std::fs::write(dir.path().join("sub/two.db"), b"x").unwrap();
        std::fs::write(dir.path().join("sub/fts/three.db"), b"x").unwrap();
        std::fs::write(dir.path().join("sub/readme.txt"), b"x").unwrap();

        let group = FileGroup::new("db", dir.path(), r".*\.db$", &["fts"]).unwrap();
        let files = group.list().unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|p| p.extension().unwrap() == "db"));
    }

    #[test]
    fn monitor_dispatches_to_matching_group() {
        let dir = tempfile::tempdir().unwrap();
        let group = Arc::new(FileGroup::new("db", dir.path(), r".*\.db$", &[]).unwrap());

        let seen = Arc::new(Mutex::new(Vec::<PathBuf>::new()));
        let sink = seen.clone();
        group.add_callback(Arc::new(move |ev| {
            sink.lock().push(ev.path.clone());
            Ok(())
        }));

        let monitor = FileMonitor::new();
        monitor.add_group(group);
        monitor.start().unwrap();

        std::fs::write(dir.path().join("hit.db"), b"data").unwrap();
        std::fs::write(dir.path().join("miss.txt"), b"data").unwrap();

        // Give the watcher a moment to deliver.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if !seen.lock().is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        monitor.stop();

        let paths = seen.lock();
        assert!(!paths.is_empty(), "expected at least one event");
        assert!(paths.iter().all(|p| p.extension().unwrap() == "db"));
    }
}
