//! Datasource over the v4 mirror schema (`db_storage/` tree): per-talker
//! `Msg_<md5>` tables keyed through `Name2Id`, a `contact`/`chat_room` pair,
//! and `SessionTable`.

use std::path::Path;

use chrono::{DateTime, Local};
use md5::{Digest, Md5};
use rusqlite::Connection;
use tracing::debug;

use wxmirror_core::Result;

use crate::monitor::Callback;

use super::model::{local_time, summary_placeholder};
use super::{paginate, split_filter, ChatRoom, Contact, DataSource, Media, Message, Session, SourceBase};

const GROUP_MESSAGE: &str = "message";
const GROUP_CONTACT: &str = "contact";
const GROUP_SESSION: &str = "session";

pub(crate) struct V4DataSource {
    base: SourceBase,
}

impl V4DataSource {
    pub fn new(work_dir: &Path) -> Result<Self> {
        let base = SourceBase::new(work_dir);
        base.dbm
            .add_group(GROUP_MESSAGE, r"(?i).*message.*\.db$", &["fts"])?;
        base.dbm
            .add_group(GROUP_CONTACT, r"(?i).*contact\.db$", &["fts"])?;
        base.dbm
            .add_group(GROUP_SESSION, r"(?i).*session\.db$", &["fts"])?;
        base.dbm.start()?;
        Ok(Self { base })
    }
}

/// Per-talker message tables are named `Msg_` plus the md5 of the talker id.
fn talker_table(talker: &str) -> String {
    let digest = Md5::digest(talker.as_bytes());
    format!("Msg_{}", hex::encode(digest))
}

fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

fn all_msg_tables(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'Msg#_%' ESCAPE '#'",
    )?;
    let names = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

/// `Name2Id` maps the per-database sender index back to a user id; index 1
/// is the account itself.
fn sender_name(conn: &Connection, id: i64) -> String {
    conn.query_row(
        "SELECT user_name FROM Name2Id WHERE rowid = ?1",
        [id],
        |r| r.get::<_, String>(0),
    )
    .unwrap_or_default()
}

impl DataSource for V4DataSource {
    fn get_messages(
        &self,
        start: DateTime<Local>,
        end: DateTime<Local>,
        talker: &str,
        sender: &str,
        keyword: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>> {
        let talkers = split_filter(talker);
        let senders = split_filter(sender);
        let (start_ts, end_ts) = (start.timestamp(), end.timestamp());

        let mut out: Vec<Message> = Vec::new();
        for conn in self.base.dbm.get_dbs(GROUP_MESSAGE)? {
            let rows = conn.with(|c| {
                // (table, talker-id) pairs to visit in this database.
                let tables: Vec<(String, String)> = if talkers.is_empty() {
                    all_msg_tables(c)?
                        .into_iter()
                        .map(|t| (t, String::new()))
                        .collect()
                } else {
                    let mut found = Vec::new();
                    for t in &talkers {
                        let table = talker_table(t);
                        if table_exists(c, &table)? {
                            found.push((table, t.clone()));
                        }
                    }
                    found
                };

                let mut collected = Vec::new();
                for (table, talker_id) in tables {
                    let sql = format!(
                        "SELECT local_id, local_type, real_sender_id, create_time, \
                         message_content FROM {table} \
                         WHERE create_time >= ?1 AND create_time <= ?2 \
                         ORDER BY sort_seq"
                    );
                    let mut stmt = c.prepare(&sql)?;
                    let mapped = stmt.query_map([start_ts, end_ts], |r| {
                        Ok((
                            r.get::<_, i64>(0)?,
                            r.get::<_, i64>(1)?,
                            r.get::<_, i64>(2)?,
                            r.get::<_, i64>(3)?,
                            r.get::<_, String>(4)?,
                        ))
                    })?;
                    for row in mapped {
                        let (local_id, local_type, sender_id, create_time, content) = row?;
                        collected.push(Message {
                            seq: local_id,
                            time: local_time(create_time),
                            talker: talker_id.clone(),
                            is_chat_room: super::model::is_chat_room_id(&talker_id),
                            sender: sender_name(c, sender_id),
                            is_self: sender_id == 1,
                            msg_type: local_type,
                            sub_type: 0,
                            content,
                        });
                    }
                }
                Ok(collected)
            })?;
            out.extend(rows);
        }

        if !keyword.is_empty() {
            out.retain(|m| m.content.contains(keyword));
        }
        if !senders.is_empty() {
            out.retain(|m| senders.iter().any(|s| s == &m.sender));
        }
        out.sort_by_key(|m| m.time);
        Ok(paginate(out, limit, offset))
    }

    fn get_contacts(&self, key: &str, limit: usize, offset: usize) -> Result<Vec<Contact>> {
        let mut out = Vec::new();
        for conn in self.base.dbm.get_dbs(GROUP_CONTACT)? {
            let rows = conn.with(|c| {
                if !table_exists(c, "contact")? {
                    return Ok(Vec::new());
                }
                let mut stmt = c.prepare(
                    "SELECT username, alias, remark, nick_name FROM contact \
                     WHERE ?1 = '' OR username LIKE ?2 OR alias LIKE ?2 \
                        OR remark LIKE ?2 OR nick_name LIKE ?2 \
                     ORDER BY username",
                )?;
                let pattern = format!("%{key}%");
                let mapped = stmt.query_map([key, pattern.as_str()], |r| {
                    Ok(Contact {
                        user_name: r.get(0)?,
                        alias: r.get(1)?,
                        remark: r.get(2)?,
                        nick_name: r.get(3)?,
                    })
                })?;
                mapped.collect::<rusqlite::Result<Vec<_>>>()
            })?;
            out.extend(rows);
        }
        out.sort_by(|a, b| a.user_name.cmp(&b.user_name));
        Ok(paginate(out, limit, offset))
    }

    fn get_chat_rooms(&self, key: &str, limit: usize, offset: usize) -> Result<Vec<ChatRoom>> {
        let mut out = Vec::new();
        for conn in self.base.dbm.get_dbs(GROUP_CONTACT)? {
            let rows = conn.with(|c| {
                if !table_exists(c, "chat_room")? {
                    return Ok(Vec::new());
                }
                let mut stmt = c.prepare(
                    "SELECT username, owner FROM chat_room \
                     WHERE ?1 = '' OR username LIKE ?2 ORDER BY username",
                )?;
                let pattern = format!("%{key}%");
                let mapped = stmt.query_map([key, pattern.as_str()], |r| {
                    Ok(ChatRoom {
                        name: r.get(0)?,
                        owner: r.get(1)?,
                        users: Vec::new(),
                    })
                })?;
                mapped.collect::<rusqlite::Result<Vec<_>>>()
            })?;
            out.extend(rows);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(paginate(out, limit, offset))
    }

    fn get_sessions(&self, key: &str, limit: usize, offset: usize) -> Result<Vec<Session>> {
        let mut out = Vec::new();
        for conn in self.base.dbm.get_dbs(GROUP_SESSION)? {
            let rows = conn.with(|c| {
                if !table_exists(c, "SessionTable")? {
                    return Ok(Vec::new());
                }
                let mut stmt = c.prepare(
                    "SELECT username, summary, last_timestamp, last_sender_display_name, \
                     last_msg_type, last_msg_sub_type FROM SessionTable \
                     WHERE ?1 = '' OR username LIKE ?2 \
                     ORDER BY last_timestamp DESC",
                )?;
                let pattern = format!("%{key}%");
                let mapped = stmt.query_map([key, pattern.as_str()], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, i64>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, i64>(4)?,
                        r.get::<_, i64>(5)?,
                    ))
                })?;
                let mut sessions = Vec::new();
                for row in mapped {
                    let (username, summary, last_ts, display, msg_type, sub_type) = row?;
                    let content = if summary.is_empty() {
                        summary_placeholder(msg_type, sub_type).to_string()
                    } else {
                        summary
                    };
                    let nick_name = if display.is_empty() {
                        username.clone()
                    } else {
                        display
                    };
                    sessions.push(Session {
                        user_name: username,
                        n_order: last_ts,
                        nick_name,
                        content,
                        n_time: local_time(last_ts),
                    });
                }
                Ok(sessions)
            })?;
            out.extend(rows);
        }
        out.sort_by_key(|s| std::cmp::Reverse(s.n_order));
        debug!(count = out.len(), "sessions collected");
        Ok(paginate(out, limit, offset))
    }

    fn get_media(&self, media_type: &str, key: &str) -> Result<Media> {
        self.base.media(media_type, key)
    }

    fn set_callback(&self, group: &str, cb: Callback) -> Result<()> {
        self.base.set_callback(group, cb)
    }

    fn close_db(&self, path: &Path) {
        self.base.close_db(path)
    }

    fn lock_db(&self, path: &Path) {
        self.base.lock_db(path)
    }

    fn unlock_db(&self, path: &Path) {
        self.base.unlock_db(path)
    }

    fn close(&self) {
        self.base.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn talker_table_is_md5_suffixed() {
        // md5("wxid_demo") is stable; spot-check the prefix and length.
        let table = talker_table("wxid_demo");
        assert!(table.starts_with("Msg_"));
        assert_eq!(table.len(), 4 + 32);
        assert_eq!(table, talker_table("wxid_demo"));
        assert_ne!(table, talker_table("other"));
    }
}
