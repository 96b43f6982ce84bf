//! Integration tests for the datasource facade over fixture mirror trees.

use std::path::Path;

use chrono::{DateTime, Local};
use md5::{Digest, Md5};
use rusqlite::Connection;

use wxmirror_core::account::Platform;
use wxmirror_db::datasource::new_data_source;

fn t(secs: i64) -> DateTime<Local> {
    DateTime::from_timestamp(secs, 0).unwrap().with_timezone(&Local)
}

fn msg_table(talker: &str) -> String {
    format!("Msg_{}", hex::encode(Md5::digest(talker.as_bytes())))
}

/// Build a v4-shaped mirror tree under `root`.
fn v4_fixture(root: &Path) {
    let msg_dir = root.join("db_storage").join("message");
    std::fs::create_dir_all(&msg_dir).unwrap();

    let conn = Connection::open(msg_dir.join("message_0.db")).unwrap();
    conn.execute_batch("CREATE TABLE Name2Id (user_name TEXT)").unwrap();
    conn.execute("INSERT INTO Name2Id (user_name) VALUES (?1)", ["wxid_self"]).unwrap();
    conn.execute("INSERT INTO Name2Id (user_name) VALUES (?1)", ["wxid_friend"]).unwrap();

    for talker in ["wxid_friend", "777@chatroom"] {
        let table = msg_table(talker);
        conn.execute_batch(&format!(
            "CREATE TABLE {table} (
                local_id INTEGER PRIMARY KEY,
                local_type INTEGER,
                real_sender_id INTEGER,
                create_time INTEGER,
                message_content TEXT,
                sort_seq INTEGER
            )"
        ))
        .unwrap();
    }

    let friend = msg_table("wxid_friend");
    conn.execute(
        &format!(
            "INSERT INTO {friend} (local_id, local_type, real_sender_id, create_time, message_content, sort_seq) \
             VALUES (1, 1, 1, 1000, 'hello there', 1), (2, 1, 2, 2000, 'general kenobi', 2)"
        ),
        [],
    )
    .unwrap();
    let room = msg_table("777@chatroom");
    conn.execute(
        &format!(
            "INSERT INTO {room} (local_id, local_type, real_sender_id, create_time, message_content, sort_seq) \
             VALUES (1, 1, 2, 1500, 'room chatter', 1)"
        ),
        [],
    )
    .unwrap();

    let contact_dir = root.join("db_storage").join("contact");
    std::fs::create_dir_all(&contact_dir).unwrap();
    let conn = Connection::open(contact_dir.join("contact.db")).unwrap();
    conn.execute_batch(
        "CREATE TABLE contact (username TEXT, alias TEXT, remark TEXT, nick_name TEXT);
         CREATE TABLE chat_room (username TEXT, owner TEXT);",
    )
    .unwrap();
    conn.execute(
        "INSERT INTO contact (username, alias, remark, nick_name) VALUES
         ('wxid_friend', 'kenobi', 'General', 'Obi-Wan'),
         ('wxid_other', '', '', 'Grievous')",
        [],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO chat_room (username, owner) VALUES ('777@chatroom', 'wxid_friend')",
        [],
    )
    .unwrap();

    let session_dir = root.join("db_storage").join("session");
    std::fs::create_dir_all(&session_dir).unwrap();
    let conn = Connection::open(session_dir.join("session.db")).unwrap();
    conn.execute_batch(
        "CREATE TABLE SessionTable (
            username TEXT PRIMARY KEY,
            summary TEXT,
            last_timestamp INTEGER,
            last_sender_display_name TEXT,
            last_msg_type INTEGER,
            last_msg_sub_type INTEGER
        )",
    )
    .unwrap();
    conn.execute(
        "INSERT INTO SessionTable VALUES
         ('wxid_friend', 'general kenobi', 2000, 'Obi-Wan', 1, 0),
         ('777@chatroom', '', 1500, '', 3, 0)",
        [],
    )
    .unwrap();
}

#[test]
fn v4_messages_with_filters() {
    let dir = tempfile::tempdir().unwrap();
    v4_fixture(dir.path());
    let ds = new_data_source(dir.path(), Platform::Windows, 4).unwrap();

    // Everything in range, ordered by time.
    let all = ds.get_messages(t(0), t(10_000), "", "", "", 0, 0).unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.windows(2).all(|w| w[0].time <= w[1].time));

    // Talker filter resolves the md5 table.
    let friend = ds
        .get_messages(t(0), t(10_000), "wxid_friend", "", "", 0, 0)
        .unwrap();
    assert_eq!(friend.len(), 2);
    assert!(friend.iter().all(|m| m.talker == "wxid_friend"));
    assert!(!friend[0].is_chat_room);
    assert!(friend[0].is_self, "Name2Id index 1 is the account itself");
    assert_eq!(friend[1].sender, "wxid_friend");

    // Chatroom talkers are flagged.
    let room = ds
        .get_messages(t(0), t(10_000), "777@chatroom", "", "", 0, 0)
        .unwrap();
    assert_eq!(room.len(), 1);
    assert!(room[0].is_chat_room);

    // Keyword and time-range filters.
    let hits = ds
        .get_messages(t(0), t(10_000), "", "", "kenobi", 0, 0)
        .unwrap();
    assert_eq!(hits.len(), 1);
    let early = ds.get_messages(t(0), t(1200), "", "", "", 0, 0).unwrap();
    assert_eq!(early.len(), 1);

    // Sender filter.
    let from_friend = ds
        .get_messages(t(0), t(10_000), "", "wxid_friend", "", 0, 0)
        .unwrap();
    assert_eq!(from_friend.len(), 2);

    // Pagination.
    let page = ds.get_messages(t(0), t(10_000), "", "", "", 1, 1).unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].content, "room chatter");
    ds.close();
}

#[test]
fn v4_contacts_chatrooms_sessions() {
    let dir = tempfile::tempdir().unwrap();
    v4_fixture(dir.path());
    let ds = new_data_source(dir.path(), Platform::Windows, 4).unwrap();

    let contacts = ds.get_contacts("", 0, 0).unwrap();
    assert_eq!(contacts.len(), 2);
    let hit = ds.get_contacts("Obi", 0, 0).unwrap();
    assert_eq!(hit.len(), 1);
    assert_eq!(hit[0].user_name, "wxid_friend");
    assert_eq!(hit[0].display_name(), "General");

    let rooms = ds.get_chat_rooms("", 0, 0).unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].owner, "wxid_friend");

    let sessions = ds.get_sessions("", 0, 0).unwrap();
    assert_eq!(sessions.len(), 2);
    // Newest first; the empty image summary gets a placeholder.
    assert_eq!(sessions[0].user_name, "wxid_friend");
    assert_eq!(sessions[1].content, "[Image]");
    ds.close();
}

#[test]
fn v4_media_decodes_cache_containers() {
    let dir = tempfile::tempdir().unwrap();
    v4_fixture(dir.path());
    let ds = new_data_source(dir.path(), Platform::Windows, 4).unwrap();

    // v3-style XOR container resolving relative to the mirror root.
    let jpeg = [0xFFu8, 0xD8, 0xFF, 0xE0, 0x01, 0x02];
    let enc: Vec<u8> = jpeg.iter().map(|b| b ^ 0x42).collect();
    std::fs::write(dir.path().join("thumb.dat"), &enc).unwrap();

    let media = ds.get_media("image", "thumb.dat").unwrap();
    assert_eq!(media.ext, "jpg");
    assert_eq!(media.data, jpeg);

    assert!(ds.get_media("image", "missing.dat").is_err());
    ds.close();
}

#[test]
fn v4_facade_lock_and_callback_surface() {
    let dir = tempfile::tempdir().unwrap();
    v4_fixture(dir.path());
    let ds = new_data_source(dir.path(), Platform::Windows, 4).unwrap();

    // Unknown group is a configuration error.
    let cb: wxmirror_db::monitor::Callback = std::sync::Arc::new(|_| Ok(()));
    assert!(ds.set_callback("nope", cb.clone()).is_err());
    assert!(ds.set_callback("message", cb).is_ok());

    // Lock/unlock round-trips without deadlocking the facade.
    let p = dir.path().join("db_storage/session/session.db");
    ds.lock_db(&p);
    ds.unlock_db(&p);
    ds.close_db(&p);
    ds.close();
}

#[test]
fn windows_v3_schema_queries() {
    let dir = tempfile::tempdir().unwrap();
    let multi = dir.path().join("Msg").join("Multi");
    std::fs::create_dir_all(&multi).unwrap();

    let conn = Connection::open(multi.join("MSG0.db")).unwrap();
    conn.execute_batch(
        "CREATE TABLE MSG (
            localId INTEGER PRIMARY KEY,
            Sequence INTEGER,
            Type INTEGER,
            SubType INTEGER,
            IsSender INTEGER,
            CreateTime INTEGER,
            StrTalker TEXT,
            StrContent TEXT
        )",
    )
    .unwrap();
    conn.execute_batch(
        "INSERT INTO MSG (Sequence, Type, SubType, IsSender, CreateTime, StrTalker, StrContent) VALUES
         (1, 1, 0, 1, 1000, 'wxid_friend', 'hi'),
         (2, 1, 0, 0, 2000, 'wxid_friend', 'hello back'),
         (3, 1, 0, 0, 3000, '42@chatroom', 'wxid_friend:\nin the room')",
    )
    .unwrap();

    let conn = Connection::open(dir.path().join("MicroMsg.db")).unwrap();
    conn.execute_batch(
        "CREATE TABLE Contact (UserName TEXT, Alias TEXT, Remark TEXT, NickName TEXT);
         CREATE TABLE ChatRoom (ChatRoomName TEXT, Reserved2 TEXT, UserNameList TEXT);
         CREATE TABLE Session (strUsrName TEXT, nOrder INTEGER, strNickName TEXT, strContent TEXT, nTime INTEGER);",
    )
    .unwrap();
    conn.execute_batch(
        "INSERT INTO Contact VALUES ('wxid_friend', 'ally', 'Friend', 'F');
         INSERT INTO ChatRoom VALUES ('42@chatroom', 'wxid_friend', 'wxid_friend^Gwxid_other');
         INSERT INTO Session VALUES ('wxid_friend', 5, 'Friend', 'hello back', 2000);",
    )
    .unwrap();

    let ds = new_data_source(dir.path(), Platform::Windows, 3).unwrap();

    let all = ds.get_messages(t(0), t(10_000), "", "", "", 0, 0).unwrap();
    assert_eq!(all.len(), 3);

    let mine = ds
        .get_messages(t(0), t(10_000), "wxid_friend", "", "", 0, 0)
        .unwrap();
    assert_eq!(mine.len(), 2);
    assert!(mine[0].is_self);
    assert_eq!(mine[1].sender, "wxid_friend");

    // Group message sender is split from the content prefix.
    let room = ds
        .get_messages(t(0), t(10_000), "42@chatroom", "", "", 0, 0)
        .unwrap();
    assert_eq!(room.len(), 1);
    assert_eq!(room[0].sender, "wxid_friend");
    assert_eq!(room[0].content, "in the room");

    let contacts = ds.get_contacts("Friend", 0, 0).unwrap();
    assert_eq!(contacts.len(), 1);

    let rooms = ds.get_chat_rooms("", 0, 0).unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].users.len(), 2);

    let sessions = ds.get_sessions("", 0, 0).unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].content, "hello back");
    ds.close();
}

#[test]
fn darwin_v3_schema_queries() {
    let dir = tempfile::tempdir().unwrap();

    let conn = Connection::open(dir.path().join("msg_0.db")).unwrap();
    let chat = format!("Chat_{}", hex::encode(Md5::digest(b"wxid_friend")));
    conn.execute_batch(&format!(
        "CREATE TABLE {chat} (
            mesLocalID INTEGER PRIMARY KEY,
            messageType INTEGER,
            mesDes INTEGER,
            msgCreateTime INTEGER,
            msgContent TEXT
        )"
    ))
    .unwrap();
    conn.execute_batch(&format!(
        "INSERT INTO {chat} (messageType, mesDes, msgCreateTime, msgContent) VALUES
         (1, 0, 1000, 'out'),
         (1, 1, 2000, 'in')"
    ))
    .unwrap();

    let conn = Connection::open(dir.path().join("session_new.db")).unwrap();
    conn.execute_batch(
        "CREATE TABLE SessionAbstract (m_nsUserName TEXT PRIMARY KEY, m_uLastTime INTEGER)",
    )
    .unwrap();
    conn.execute_batch(
        "INSERT INTO SessionAbstract VALUES ('wxid_friend', 2000), ('55@chatroom', 1000)",
    )
    .unwrap();

    let conn = Connection::open(dir.path().join("wccontact_new2.db")).unwrap();
    conn.execute_batch(
        "CREATE TABLE WCContact (m_nsUsrName TEXT, m_nsAliasName TEXT, m_nsRemark TEXT, nickname TEXT)",
    )
    .unwrap();
    conn.execute_batch(
        "INSERT INTO WCContact VALUES
         ('wxid_friend', '', 'Mate', 'M'),
         ('55@chatroom', '', '', 'The Room')",
    )
    .unwrap();

    let ds = new_data_source(dir.path(), Platform::Darwin, 3).unwrap();

    let msgs = ds
        .get_messages(t(0), t(10_000), "wxid_friend", "", "", 0, 0)
        .unwrap();
    assert_eq!(msgs.len(), 2);
    assert!(msgs[0].is_self);
    assert!(!msgs[1].is_self);
    assert_eq!(msgs[1].sender, "wxid_friend");

    let sessions = ds.get_sessions("", 0, 0).unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].user_name, "wxid_friend");

    let rooms = ds.get_chat_rooms("", 0, 0).unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].name, "55@chatroom");
    ds.close();
}
