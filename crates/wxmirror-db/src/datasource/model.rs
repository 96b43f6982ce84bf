//! Business entities returned by the datasource facade, serialized for the
//! query layer.

use chrono::{DateTime, Local};
use serde::Serialize;

pub(crate) mod time_format {
    use chrono::{DateTime, Local};
    use serde::Serializer;

    pub fn serialize<S: Serializer>(t: &DateTime<Local>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format("%Y-%m-%d %H:%M:%S").to_string())
    }
}

pub(crate) fn local_time(secs: i64) -> DateTime<Local> {
    DateTime::from_timestamp(secs, 0)
        .unwrap_or(DateTime::UNIX_EPOCH)
        .with_timezone(&Local)
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub seq: i64,
    #[serde(with = "time_format")]
    pub time: DateTime<Local>,
    pub talker: String,
    pub is_chat_room: bool,
    pub sender: String,
    pub is_self: bool,
    #[serde(rename = "type")]
    pub msg_type: i64,
    pub sub_type: i64,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Contact {
    pub user_name: String,
    pub alias: String,
    pub remark: String,
    pub nick_name: String,
}

impl Contact {
    /// Remark wins over nickname wins over the raw id.
    pub fn display_name(&self) -> &str {
        if !self.remark.is_empty() {
            &self.remark
        } else if !self.nick_name.is_empty() {
            &self.nick_name
        } else {
            &self.user_name
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRoom {
    pub name: String,
    pub owner: String,
    pub users: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub user_name: String,
    pub n_order: i64,
    pub nick_name: String,
    pub content: String,
    #[serde(with = "time_format")]
    pub n_time: DateTime<Local>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Media {
    pub media_type: String,
    pub key: String,
    pub path: String,
    pub ext: String,
    #[serde(skip)]
    pub data: Vec<u8>,
}

// Message type constants shared by the v3/v4 schemas.
pub const MSG_TYPE_TEXT: i64 = 1;
pub const MSG_TYPE_IMAGE: i64 = 3;
pub const MSG_TYPE_VOICE: i64 = 34;
pub const MSG_TYPE_CARD: i64 = 42;
pub const MSG_TYPE_VIDEO: i64 = 43;
pub const MSG_TYPE_ANIMATION: i64 = 47;
pub const MSG_TYPE_LOCATION: i64 = 48;
pub const MSG_TYPE_SHARE: i64 = 49;
pub const MSG_TYPE_VOIP: i64 = 50;
pub const MSG_TYPE_SYSTEM: i64 = 10000;

pub const MSG_SUB_TYPE_FILE: i64 = 6;
pub const MSG_SUB_TYPE_LINK: i64 = 5;
pub const MSG_SUB_TYPE_MINI_PROGRAM: i64 = 33;

/// Placeholder session text when the last message carries no summary.
pub fn summary_placeholder(msg_type: i64, sub_type: i64) -> &'static str {
    match msg_type {
        MSG_TYPE_IMAGE => "[Image]",
        MSG_TYPE_VOICE => "[Voice]",
        MSG_TYPE_VIDEO => "[Video]",
        MSG_TYPE_LOCATION => "[Location]",
        MSG_TYPE_ANIMATION => "[Sticker]",
        MSG_TYPE_VOIP => "[Voice Call]",
        MSG_TYPE_CARD => "[Contact Card]",
        MSG_TYPE_SHARE => match sub_type {
            MSG_SUB_TYPE_FILE => "[File]",
            MSG_SUB_TYPE_LINK => "[Link]",
            MSG_SUB_TYPE_MINI_PROGRAM => "[Mini Program]",
            _ => "[Share]",
        },
        MSG_TYPE_SYSTEM => "[System]",
        _ => "",
    }
}

pub fn is_chat_room_id(id: &str) -> bool {
    id.ends_with("@chatroom")
}
