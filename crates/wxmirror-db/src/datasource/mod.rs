//! The stable interface the query layer consumes, dispatched over the
//! supported `(platform, version)` schema pairs.

pub mod model;

mod darwin_v3;
mod v4;
mod windows_v3;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};

use wxmirror_core::account::Platform;
use wxmirror_core::{dat, Error, Result};

use crate::dbm::DbManager;
use crate::monitor::Callback;

pub use model::{ChatRoom, Contact, Media, Message, Session};

/// Read-only view over one account's decrypted mirrors.
///
/// `limit == 0` means unlimited. Time bounds are inclusive.
pub trait DataSource: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn get_messages(
        &self,
        start: DateTime<Local>,
        end: DateTime<Local>,
        talker: &str,
        sender: &str,
        keyword: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>>;

    fn get_contacts(&self, key: &str, limit: usize, offset: usize) -> Result<Vec<Contact>>;

    fn get_chat_rooms(&self, key: &str, limit: usize, offset: usize) -> Result<Vec<ChatRoom>>;

    fn get_sessions(&self, key: &str, limit: usize, offset: usize) -> Result<Vec<Session>>;

    fn get_media(&self, media_type: &str, key: &str) -> Result<Media>;

    fn set_callback(&self, group: &str, cb: Callback) -> Result<()>;

    fn close_db(&self, path: &Path);

    fn lock_db(&self, path: &Path);

    fn unlock_db(&self, path: &Path);

    fn close(&self);
}

/// Build the datasource for a mirror tree.
pub fn new_data_source(
    work_dir: &Path,
    platform: Platform,
    version: u8,
) -> Result<Box<dyn DataSource>> {
    match (platform, version) {
        (_, 4) => Ok(Box::new(v4::V4DataSource::new(work_dir)?)),
        (Platform::Windows, 3) => Ok(Box::new(windows_v3::WindowsV3DataSource::new(work_dir)?)),
        (Platform::Darwin, 3) => Ok(Box::new(darwin_v3::DarwinV3DataSource::new(work_dir)?)),
        (platform, version) => Err(Error::PlatformUnsupported { platform, version }),
    }
}

/// Shared plumbing: the manager plus the behavior every schema delegates
/// unchanged.
pub(crate) struct SourceBase {
    pub dbm: Arc<DbManager>,
    pub root: PathBuf,
}

impl SourceBase {
    pub fn new(root: &Path) -> Self {
        Self {
            dbm: Arc::new(DbManager::new(root)),
            root: root.to_path_buf(),
        }
    }

    pub fn set_callback(&self, group: &str, cb: Callback) -> Result<()> {
        self.dbm.set_callback(group, cb)
    }

    pub fn close_db(&self, path: &Path) {
        self.dbm.close_db(path)
    }

    pub fn lock_db(&self, path: &Path) {
        self.dbm.lock_db(path)
    }

    pub fn unlock_db(&self, path: &Path) {
        self.dbm.unlock_db(path)
    }

    pub fn close(&self) {
        self.dbm.close()
    }

    /// Resolve a cache container by key (absolute, or relative to the
    /// datasource root) and decode it to standard image bytes.
    pub fn media(&self, media_type: &str, key: &str) -> Result<Media> {
        let candidate = PathBuf::from(key);
        let path = if candidate.is_absolute() {
            candidate
        } else {
            self.root.join(&candidate)
        };
        if !path.is_file() {
            return Err(Error::Malformed(format!("no media at {}", path.display())));
        }
        let raw = std::fs::read(&path)?;
        let (data, ext) = dat::dat_to_image(&raw)?;
        Ok(Media {
            media_type: media_type.to_string(),
            key: key.to_string(),
            path: path.display().to_string(),
            ext: ext.to_string(),
            data,
        })
    }
}

/// Apply `offset`/`limit` pagination after cross-database merge sorting.
pub(crate) fn paginate<T>(mut items: Vec<T>, limit: usize, offset: usize) -> Vec<T> {
    if offset >= items.len() {
        return Vec::new();
    }
    items.drain(..offset);
    if limit > 0 && items.len() > limit {
        items.truncate(limit);
    }
    items
}

/// Split a comma-separated filter into trimmed, non-empty entries.
pub(crate) fn split_filter(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_bounds() {
        let items = vec![1, 2, 3, 4, 5];
        assert_eq!(paginate(items.clone(), 2, 1), vec![2, 3]);
        assert_eq!(paginate(items.clone(), 0, 3), vec![4, 5]);
        assert_eq!(paginate(items.clone(), 10, 10), Vec::<i32>::new());
    }

    #[test]
    fn filters_split_on_commas() {
        assert_eq!(split_filter("a, b,,c"), vec!["a", "b", "c"]);
        assert!(split_filter("").is_empty());
    }

    #[test]
    fn unsupported_pair_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            new_data_source(dir.path(), Platform::Windows, 2),
            Err(Error::PlatformUnsupported { .. })
        ));
    }
}
