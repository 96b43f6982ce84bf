//! Datasource over the macOS v3 schema: per-talker `Chat_<md5>` tables in
//! `msg_*.db` shards, the `wccontact_new2.db` contact store, and
//! `SessionAbstract`.

use std::path::Path;

use chrono::{DateTime, Local};
use md5::{Digest, Md5};
use rusqlite::Connection;

use wxmirror_core::Result;

use crate::monitor::Callback;

use super::model::local_time;
use super::{paginate, split_filter, ChatRoom, Contact, DataSource, Media, Message, Session, SourceBase};

const GROUP_MESSAGE: &str = "message";
const GROUP_CONTACT: &str = "contact";
const GROUP_SESSION: &str = "session";

pub(crate) struct DarwinV3DataSource {
    base: SourceBase,
}

impl DarwinV3DataSource {
    pub fn new(work_dir: &Path) -> Result<Self> {
        let base = SourceBase::new(work_dir);
        base.dbm
            .add_group(GROUP_MESSAGE, r"(?i).*msg_[0-9]+\.db$", &["fts"])?;
        base.dbm
            .add_group(GROUP_CONTACT, r"(?i).*wccontact_new2\.db$", &["fts"])?;
        base.dbm
            .add_group(GROUP_SESSION, r"(?i).*session[^/\\]*\.db$", &["fts"])?;
        base.dbm.start()?;
        Ok(Self { base })
    }
}

fn chat_table(talker: &str) -> String {
    let digest = Md5::digest(talker.as_bytes());
    format!("Chat_{}", hex::encode(digest))
}

fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

fn all_chat_tables(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'Chat#_%' ESCAPE '#'",
    )?;
    let names = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>();
    names
}

impl DataSource for DarwinV3DataSource {
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
                let tables: Vec<(String, String)> = if talkers.is_empty() {
                    all_chat_tables(c)?
                        .into_iter()
                        .map(|t| (t, String::new()))
                        .collect()
                } else {
                    let mut found = Vec::new();
                    for t in &talkers {
                        let table = chat_table(t);
                        if table_exists(c, &table)? {
                            found.push((table, t.clone()));
                        }
                    }
                    found
                };

                let mut collected = Vec::new();
                for (table, talker_id) in tables {
                    let sql = format!(
                        "SELECT mesLocalID, messageType, mesDes, msgCreateTime, msgContent \
                         FROM {table} \
                         WHERE msgCreateTime >= ?1 AND msgCreateTime <= ?2 \
                         ORDER BY msgCreateTime",
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
                        let (local_id, msg_type, des, create_time, mut content) = row?;
                        let is_chat_room = super::model::is_chat_room_id(&talker_id);
                        // Incoming group messages carry the sender before the
                        // first `:\n`.
                        let mut sender_id = String::new();
                        if des != 0 {
                            if is_chat_room {
                                if let Some((head, rest)) = content.split_once(":\n") {
                                    sender_id = head.to_string();
                                    content = rest.to_string();
                                }
                            } else {
                                sender_id = talker_id.clone();
                            }
                        }
                        collected.push(Message {
                            seq: local_id,
                            time: local_time(create_time),
                            talker: talker_id.clone(),
                            is_chat_room,
                            sender: sender_id,
                            is_self: des == 0,
                            msg_type,
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
                if !table_exists(c, "WCContact")? {
                    return Ok(Vec::new());
                }
                let mut stmt = c.prepare(
                    "SELECT m_nsUsrName, m_nsAliasName, m_nsRemark, nickname FROM WCContact \
                     WHERE ?1 = '' OR m_nsUsrName LIKE ?2 OR m_nsAliasName LIKE ?2 \
                        OR m_nsRemark LIKE ?2 OR nickname LIKE ?2 \
                     ORDER BY m_nsUsrName",
                )?;
                let pattern = format!("%{key}%");
                let mapped = stmt.query_map([key, pattern.as_str()], |r| {
                    Ok(Contact {
                        user_name: r.get(0)?,
                        alias: r.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        remark: r.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        nick_name: r.get::<_, Option<String>>(3)?.unwrap_or_default(),
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
        // No dedicated chatroom store in this schema; group ids live in the
        // contact table with the @chatroom suffix.
        let rooms = self
            .get_contacts(key, 0, 0)?
            .into_iter()
            .filter(|c| super::model::is_chat_room_id(&c.user_name))
            .map(|c| ChatRoom {
                name: c.user_name,
                owner: String::new(),
                users: Vec::new(),
            })
            .collect();
        Ok(paginate(rooms, limit, offset))
    }

    fn get_sessions(&self, key: &str, limit: usize, offset: usize) -> Result<Vec<Session>> {
        let mut out = Vec::new();
        for conn in self.base.dbm.get_dbs(GROUP_SESSION)? {
            let rows = conn.with(|c| {
                if !table_exists(c, "SessionAbstract")? {
                    return Ok(Vec::new());
                }
                let mut stmt = c.prepare(
                    "SELECT m_nsUserName, m_uLastTime FROM SessionAbstract \
                     WHERE ?1 = '' OR m_nsUserName LIKE ?2 \
                     ORDER BY m_uLastTime DESC",
                )?;
                let pattern = format!("%{key}%");
                let mapped = stmt.query_map([key, pattern.as_str()], |r| {
                    let user_name: String = r.get(0)?;
                    let last_time: i64 = r.get(1)?;
                    Ok(Session {
                        nick_name: user_name.clone(),
                        user_name,
                        n_order: last_time,
                        content: String::new(),
                        n_time: local_time(last_time),
                    })
                })?;
                mapped.collect::<rusqlite::Result<Vec<_>>>()
            })?;
            out.extend(rows);
        }
        out.sort_by_key(|s| std::cmp::Reverse(s.n_order));
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
