use actix::prelude::*;
use rusqlite::{params, Connection};

use crate::session::UserId;
use crate::utils::now_ms;

/// Worker threads backing the store, each owning one connection. Store
/// calls may block the issuing thread, never an actor arbiter.
pub const STORE_POOL_SIZE: usize = 10;

/// How many persisted items are replayed to a reconnecting chat session.
pub const REPLAY_LIMIT: u32 = 10;

/// One connection to the durable store. The engine only depends on the
/// narrow operation set below; everything else about the schema belongs to
/// the external API.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        migrate(&conn)?;
        Ok(Self { conn })
    }
}

impl Actor for Store {
    type Context = SyncContext<Self>;
}

/// Start the bounded worker pool. Migration is idempotent and runs per
/// connection, so workers can come up in any order.
pub fn start(path: String) -> rusqlite::Result<Addr<Store>> {
    // Fail fast on an unopenable database before any worker thread spawns.
    Store::open(&path)?;
    Ok(SyncArbiter::start(STORE_POOL_SIZE, move || {
        match Store::open(&path) {
            Ok(store) => store,
            Err(err) => {
                // Unrecoverable: the path worked moments ago. Let the
                // supervisor restart the process.
                log::error!("store worker failed to open {path}: {err}");
                std::process::exit(1);
            }
        }
    }))
}

#[cfg(test)]
pub fn start_in_memory() -> Addr<Store> {
    // A single worker so every message sees the same in-memory database.
    SyncArbiter::start(1, || {
        Store::open(":memory:").expect("in-memory store must open")
    })
}

pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY,
            username TEXT NOT NULL,
            is_online INTEGER NOT NULL DEFAULT 0,
            last_seen INTEGER
        );

        CREATE TABLE IF NOT EXISTS chat_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sender_id INTEGER NOT NULL,
            receiver_id INTEGER NOT NULL,
            message TEXT NOT NULL,
            is_read INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_chat_messages_unread
            ON chat_messages(receiver_id, is_read, created_at);

        CREATE TABLE IF NOT EXISTS friends (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            friend_id INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_friends_pending
            ON friends(friend_id, status);

        CREATE TABLE IF NOT EXISTS watch_parties (
            room_code TEXT PRIMARY KEY,
            video_current_time REAL NOT NULL DEFAULT 0,
            is_playing INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS watch_party_participants (
            room_code TEXT NOT NULL,
            user_id INTEGER NOT NULL,
            last_seen INTEGER NOT NULL,
            PRIMARY KEY (room_code, user_id)
        );",
    )
}

/// An unread direct message joined to its sender's username.
#[derive(Debug, Clone)]
pub struct StoredDirectMessage {
    pub id: i64,
    pub sender_id: UserId,
    pub sender_username: String,
    pub message: String,
    pub timestamp: i64,
}

/// A pending friendship request joined to its requester's username.
#[derive(Debug, Clone)]
pub struct StoredFriendRequest {
    pub id: i64,
    pub sender_id: UserId,
    pub sender_username: String,
    pub timestamp: i64,
}

pub fn set_online(
    conn: &Connection,
    user_id: UserId,
    username: &str,
    online: bool,
    now: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO users (id, username, is_online, last_seen)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
             username = excluded.username,
             is_online = excluded.is_online,
             last_seen = excluded.last_seen",
        params![user_id, username, online as i64, now],
    )?;
    Ok(())
}

pub fn insert_direct_message(
    conn: &Connection,
    sender_id: UserId,
    receiver_id: UserId,
    message: &str,
    now: i64,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO chat_messages (sender_id, receiver_id, message, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![sender_id, receiver_id, message, now],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn unread_messages(
    conn: &Connection,
    receiver_id: UserId,
) -> rusqlite::Result<Vec<StoredDirectMessage>> {
    let mut stmt = conn.prepare(
        "SELECT m.id, m.sender_id, u.username, m.message, m.created_at
         FROM chat_messages m
         JOIN users u ON u.id = m.sender_id
         WHERE m.receiver_id = ?1 AND m.is_read = 0
         ORDER BY m.created_at DESC, m.id DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![receiver_id, REPLAY_LIMIT], |row| {
        Ok(StoredDirectMessage {
            id: row.get(0)?,
            sender_id: row.get(1)?,
            sender_username: row.get(2)?,
            message: row.get(3)?,
            timestamp: row.get(4)?,
        })
    })?;
    rows.collect()
}

/// Mark replayed messages as delivered so the next connect does not hand
/// them out again.
pub fn mark_read(conn: &Connection, ids: &[i64]) -> rusqlite::Result<()> {
    for id in ids {
        conn.execute("UPDATE chat_messages SET is_read = 1 WHERE id = ?1", [id])?;
    }
    Ok(())
}

pub fn pending_friend_requests(
    conn: &Connection,
    user_id: UserId,
) -> rusqlite::Result<Vec<StoredFriendRequest>> {
    let mut stmt = conn.prepare(
        "SELECT f.id, f.user_id, u.username, f.created_at
         FROM friends f
         JOIN users u ON u.id = f.user_id
         WHERE f.friend_id = ?1 AND f.status = 'pending'
         ORDER BY f.created_at DESC, f.id DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![user_id, REPLAY_LIMIT], |row| {
        Ok(StoredFriendRequest {
            id: row.get(0)?,
            sender_id: row.get(1)?,
            sender_username: row.get(2)?,
            timestamp: row.get(3)?,
        })
    })?;
    rows.collect()
}

pub fn persist_playback(
    conn: &Connection,
    room_code: &str,
    current_time: f64,
    is_playing: bool,
    now: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO watch_parties (room_code, video_current_time, is_playing, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(room_code) DO UPDATE SET
             video_current_time = excluded.video_current_time,
             is_playing = excluded.is_playing,
             updated_at = excluded.updated_at",
        params![room_code, current_time, is_playing as i64, now],
    )?;
    Ok(())
}

pub fn touch_participant(
    conn: &Connection,
    room_code: &str,
    user_id: UserId,
    now: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO watch_party_participants (room_code, user_id, last_seen)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(room_code, user_id) DO UPDATE SET
             last_seen = excluded.last_seen",
        params![room_code, user_id, now],
    )?;
    Ok(())
}

/// Online/offline transition for a user. Fire-and-forget; failures are
/// logged and the presence registry keeps its in-memory truth.
#[derive(Message)]
#[rtype(result = "()")]
pub struct SetOnline {
    pub user_id: UserId,
    pub username: String,
    pub online: bool,
}

impl Handler<SetOnline> for Store {
    type Result = ();
    fn handle(&mut self, msg: SetOnline, _: &mut Self::Context) -> Self::Result {
        if let Err(err) = set_online(&self.conn, msg.user_id, &msg.username, msg.online, now_ms()) {
            log::error!(
                "failed to record online={} for user {}: {err}",
                msg.online,
                msg.user_id
            );
        }
    }
}

/// Persist one direct message, returning the store-assigned id.
#[derive(Message)]
#[rtype(result = "rusqlite::Result<i64>")]
pub struct InsertDirectMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub message: String,
}

impl Handler<InsertDirectMessage> for Store {
    type Result = rusqlite::Result<i64>;
    fn handle(&mut self, msg: InsertDirectMessage, _: &mut Self::Context) -> Self::Result {
        insert_direct_message(
            &self.conn,
            msg.sender_id,
            msg.receiver_id,
            &msg.message,
            now_ms(),
        )
    }
}

#[derive(Message)]
#[rtype(result = "rusqlite::Result<Vec<StoredDirectMessage>>")]
pub struct UnreadMessages {
    pub receiver_id: UserId,
}

impl Handler<UnreadMessages> for Store {
    type Result = rusqlite::Result<Vec<StoredDirectMessage>>;
    fn handle(&mut self, msg: UnreadMessages, _: &mut Self::Context) -> Self::Result {
        unread_messages(&self.conn, msg.receiver_id)
    }
}

/// Fire-and-forget acknowledgement of a finished replay.
#[derive(Message)]
#[rtype(result = "()")]
pub struct MarkRead {
    pub ids: Vec<i64>,
}

impl Handler<MarkRead> for Store {
    type Result = ();
    fn handle(&mut self, msg: MarkRead, _: &mut Self::Context) -> Self::Result {
        if let Err(err) = mark_read(&self.conn, &msg.ids) {
            log::error!("failed to mark {} messages read: {err}", msg.ids.len());
        }
    }
}

#[derive(Message)]
#[rtype(result = "rusqlite::Result<Vec<StoredFriendRequest>>")]
pub struct PendingFriendRequests {
    pub user_id: UserId,
}

impl Handler<PendingFriendRequests> for Store {
    type Result = rusqlite::Result<Vec<StoredFriendRequest>>;
    fn handle(&mut self, msg: PendingFriendRequests, _: &mut Self::Context) -> Self::Result {
        pending_friend_requests(&self.conn, msg.user_id)
    }
}

/// Debounced playback snapshot for a room. Last-writer-wins.
#[derive(Message)]
#[rtype(result = "()")]
pub struct PersistPlayback {
    pub room_code: String,
    pub current_time: f64,
    pub is_playing: bool,
}

impl Handler<PersistPlayback> for Store {
    type Result = ();
    fn handle(&mut self, msg: PersistPlayback, _: &mut Self::Context) -> Self::Result {
        if let Err(err) = persist_playback(
            &self.conn,
            &msg.room_code,
            msg.current_time,
            msg.is_playing,
            now_ms(),
        ) {
            log::error!("failed to persist playback for {}: {err}", msg.room_code);
        }
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct TouchParticipant {
    pub room_code: String,
    pub user_id: UserId,
}

impl Handler<TouchParticipant> for Store {
    type Result = ();
    fn handle(&mut self, msg: TouchParticipant, _: &mut Self::Context) -> Self::Result {
        if let Err(err) = touch_participant(&self.conn, &msg.room_code, msg.user_id, now_ms()) {
            log::error!(
                "failed to touch participant {} in {}: {err}",
                msg.user_id,
                msg.room_code
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn
    }

    #[test]
    fn set_online_upserts_and_transitions() {
        let conn = test_conn();
        set_online(&conn, 1, "Alice", true, 100).unwrap();
        set_online(&conn, 1, "Alice", false, 200).unwrap();
        let (online, last_seen): (i64, i64) = conn
            .query_row(
                "SELECT is_online, last_seen FROM users WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(online, 0);
        assert_eq!(last_seen, 200);
    }

    #[test]
    fn unread_messages_newest_first_capped_at_ten() {
        let conn = test_conn();
        set_online(&conn, 1, "Alice", true, 0).unwrap();
        for i in 0..12i64 {
            insert_direct_message(&conn, 1, 2, &format!("m{i}"), 1000 + i).unwrap();
        }
        let unread = unread_messages(&conn, 2).unwrap();
        assert_eq!(unread.len(), REPLAY_LIMIT as usize);
        assert_eq!(unread[0].message, "m11");
        assert_eq!(unread[0].sender_username, "Alice");
        assert!(unread.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }

    #[test]
    fn unread_messages_skip_read_rows() {
        let conn = test_conn();
        set_online(&conn, 1, "Alice", true, 0).unwrap();
        let id = insert_direct_message(&conn, 1, 2, "seen", 10).unwrap();
        insert_direct_message(&conn, 1, 2, "fresh", 20).unwrap();
        mark_read(&conn, &[id]).unwrap();
        let unread = unread_messages(&conn, 2).unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].message, "fresh");
    }

    #[test]
    fn replayed_messages_are_not_replayed_twice() {
        let conn = test_conn();
        set_online(&conn, 1, "Alice", true, 0).unwrap();
        insert_direct_message(&conn, 1, 2, "m1", 10).unwrap();
        insert_direct_message(&conn, 1, 2, "m2", 20).unwrap();
        let first_replay = unread_messages(&conn, 2).unwrap();
        assert_eq!(first_replay.len(), 2);
        let ids: Vec<i64> = first_replay.iter().map(|m| m.id).collect();
        mark_read(&conn, &ids).unwrap();
        assert!(unread_messages(&conn, 2).unwrap().is_empty());
    }

    #[test]
    fn pending_requests_filter_on_status_and_target() {
        let conn = test_conn();
        set_online(&conn, 1, "Alice", true, 0).unwrap();
        set_online(&conn, 3, "Carla", true, 0).unwrap();
        conn.execute(
            "INSERT INTO friends (user_id, friend_id, status, created_at) VALUES
             (1, 2, 'pending', 10), (3, 2, 'accepted', 20), (1, 9, 'pending', 30)",
            [],
        )
        .unwrap();
        let pending = pending_friend_requests(&conn, 2).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sender_id, 1);
        assert_eq!(pending[0].sender_username, "Alice");
    }

    #[test]
    fn playback_upsert_is_last_writer_wins() {
        let conn = test_conn();
        persist_playback(&conn, "ABC", 10.0, true, 100).unwrap();
        persist_playback(&conn, "ABC", 42.5, false, 200).unwrap();
        let (time, playing): (f64, i64) = conn
            .query_row(
                "SELECT video_current_time, is_playing FROM watch_parties WHERE room_code = 'ABC'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(time, 42.5);
        assert_eq!(playing, 0);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM watch_parties", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn touch_participant_upserts_last_seen() {
        let conn = test_conn();
        touch_participant(&conn, "ABC", 1, 100).unwrap();
        touch_participant(&conn, "ABC", 1, 300).unwrap();
        let last_seen: i64 = conn
            .query_row(
                "SELECT last_seen FROM watch_party_participants
                 WHERE room_code = 'ABC' AND user_id = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(last_seen, 300);
    }
}
