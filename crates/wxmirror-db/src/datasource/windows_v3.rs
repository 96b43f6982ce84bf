//! Datasource over the legacy Windows v3 schema: `Multi/MSG*.db` message
//! shards plus the `MicroMsg.db` contact/chatroom/session catalog.

use std::path::Path;

use chrono::{DateTime, Local};
use rusqlite::Connection;

use wxmirror_core::Result;

use crate::monitor::Callback;

use super::model::local_time;
use super::{paginate, split_filter, ChatRoom, Contact, DataSource, Media, Message, Session, SourceBase};

const GROUP_MESSAGE: &str = "message";
const GROUP_MICROMSG: &str = "micromsg";

pub(crate) struct WindowsV3DataSource {
    base: SourceBase,
}

impl WindowsV3DataSource {
    pub fn new(work_dir: &Path) -> Result<Self> {
        let base = SourceBase::new(work_dir);
        base.dbm
            .add_group(GROUP_MESSAGE, r"(?i).*Multi[/\\]MSG[0-9]*\.db$", &["fts"])?;
        base.dbm
            .add_group(GROUP_MICROMSG, r"(?i).*MicroMsg\.db$", &["fts"])?;
        base.dbm.start()?;
        Ok(Self { base })
    }
}

fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

impl DataSource for WindowsV3DataSource {
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
                if !table_exists(c, "MSG")? {
                    return Ok(Vec::new());
                }
                let mut stmt = c.prepare(
                    "SELECT Sequence, Type, SubType, IsSender, CreateTime, StrTalker, StrContent \
                     FROM MSG WHERE CreateTime >= ?1 AND CreateTime <= ?2 ORDER BY Sequence",
                )?;
                let mapped = stmt.query_map([start_ts, end_ts], |r| {
                    Ok(Message {
                        seq: r.get(0)?,
                        msg_type: r.get(1)?,
                        sub_type: r.get(2)?,
                        is_self: r.get::<_, i64>(3)? != 0,
                        time: local_time(r.get(4)?),
                        talker: r.get(5)?,
                        is_chat_room: false,
                        sender: String::new(),
                        content: r.get(6)?,
                    })
                })?;
                mapped.collect::<rusqlite::Result<Vec<_>>>()
            })?;
            out.extend(rows);
        }

        for m in &mut out {
            m.is_chat_room = super::model::is_chat_room_id(&m.talker);
            // In a group chat the sender id is prefixed to the content as
            // `wxid:\n`; direct chats carry the talker itself.
            if m.is_chat_room {
                if let Some((head, rest)) = m.content.split_once(":\n") {
                    if !head.contains(' ') {
                        m.sender = head.to_string();
                        m.content = rest.to_string();
                    }
                }
            } else if !m.is_self {
                m.sender = m.talker.clone();
            }
        }

        if !talkers.is_empty() {
            out.retain(|m| talkers.iter().any(|t| t == &m.talker));
        }
        if !senders.is_empty() {
            out.retain(|m| senders.iter().any(|s| s == &m.sender));
        }
        if !keyword.is_empty() {
            out.retain(|m| m.content.contains(keyword));
        }
        out.sort_by_key(|m| m.time);
        Ok(paginate(out, limit, offset))
    }

    fn get_contacts(&self, key: &str, limit: usize, offset: usize) -> Result<Vec<Contact>> {
        let mut out = Vec::new();
        for conn in self.base.dbm.get_dbs(GROUP_MICROMSG)? {
            let rows = conn.with(|c| {
                if !table_exists(c, "Contact")? {
                    return Ok(Vec::new());
                }
                let mut stmt = c.prepare(
                    "SELECT UserName, Alias, Remark, NickName FROM Contact \
                     WHERE ?1 = '' OR UserName LIKE ?2 OR Alias LIKE ?2 \
                        OR Remark LIKE ?2 OR NickName LIKE ?2 \
                     ORDER BY UserName",
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
        let mut out = Vec::new();
        for conn in self.base.dbm.get_dbs(GROUP_MICROMSG)? {
            let rows = conn.with(|c| {
                if !table_exists(c, "ChatRoom")? {
                    return Ok(Vec::new());
                }
                let mut stmt = c.prepare(
                    "SELECT ChatRoomName, Reserved2, UserNameList FROM ChatRoom \
                     WHERE ?1 = '' OR ChatRoomName LIKE ?2 ORDER BY ChatRoomName",
                )?;
                let pattern = format!("%{key}%");
                let mapped = stmt.query_map([key, pattern.as_str()], |r| {
                    let users_raw: Option<String> = r.get(2)?;
                    Ok(ChatRoom {
                        name: r.get(0)?,
                        owner: r.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        users: users_raw
                            .unwrap_or_default()
                            .split('^')
                            .filter(|s| !s.is_empty())
                            .map(|s| s.trim_matches('G').to_string())
                            .collect(),
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
        for conn in self.base.dbm.get_dbs(GROUP_MICROMSG)? {
            let rows = conn.with(|c| {
                if !table_exists(c, "Session")? {
                    return Ok(Vec::new());
                }
                let mut stmt = c.prepare(
                    "SELECT strUsrName, nOrder, strNickName, strContent, nTime FROM Session \
                     WHERE ?1 = '' OR strUsrName LIKE ?2 OR strNickName LIKE ?2 \
                     ORDER BY nOrder DESC",
                )?;
                let pattern = format!("%{key}%");
                let mapped = stmt.query_map([key, pattern.as_str()], |r| {
                    Ok(Session {
                        user_name: r.get(0)?,
                        n_order: r.get(1)?,
                        nick_name: r.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        content: r.get::<_, Option<String>>(3)?.unwrap_or_default(),
                        n_time: local_time(r.get(4)?),
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
