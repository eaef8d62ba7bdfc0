use actix::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use actor::{AddParticipant, CloseRoom, Room, RoomConfig};

use crate::session::{Kick, SerializedMessage, SessionId, UserId};
use crate::store::Store;
use crate::utils::{new_fast_hashmap, now_ms};

pub mod actor;

/// Room codes are case-normalized to upper-case at the gateway, so `abc`
/// and `ABC` name the same room.
pub type RoomCode = Arc<str>;

pub const DEFAULT_MAX_PARTICIPANTS: usize = 10;

/// Sweep cadence of the registry reaper.
const REAP_INTERVAL: Duration = Duration::from_secs(60);
/// Backstop: the sweeper closes rooms that stay empty this long even if
/// their own deferred check never fired.
const EMPTY_ROOM_MAX_AGE: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    RoomNotFound,
    RoomFull,
    PrivateRoom,
    Internal,
}

impl JoinError {
    pub fn message(self) -> &'static str {
        match self {
            Self::RoomNotFound => "Sala no encontrada",
            Self::RoomFull => "La sala está llena",
            Self::PrivateRoom => "Esta sala es privada. Necesitas una invitación.",
            Self::Internal => "Error interno del servidor",
        }
    }
}

/// Registry metadata mirrored out of each room via [`RoomStatus`] updates.
/// Feeds `/public-rooms` and the reaper without querying room actors.
struct RoomEntry {
    addr: Addr<Room>,
    name: String,
    host_username: String,
    video_id: Option<String>,
    max_participants: usize,
    is_private: bool,
    created_at: i64,
    participant_count: usize,
    empty_since: Option<Instant>,
}

/// Owns the set of active rooms, keyed by room code, plus the gauge of
/// live watch-party connections.
pub struct RoomManager {
    rooms: ahash::HashMap<RoomCode, RoomEntry>,
    connections: usize,
    store: Addr<Store>,
}

impl RoomManager {
    pub fn new(store: Addr<Store>) -> Self {
        Self {
            rooms: new_fast_hashmap(1 << 10),
            connections: 0,
            store,
        }
    }

    fn spawn_room(&mut self, msg: &JoinRoom, manager: Addr<Self>) -> Addr<Room> {
        let name = msg
            .room_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("Sala de {}", msg.username));
        let max_participants = msg
            .max_participants
            .unwrap_or(DEFAULT_MAX_PARTICIPANTS)
            .max(1);
        let addr = Room::new(
            RoomConfig {
                code: msg.code.clone(),
                name: name.clone(),
                video_id: msg.video_id.clone(),
                max_participants,
                is_private: msg.is_private,
                host_user_id: msg.user_id,
                host_username: msg.username.clone(),
            },
            manager,
            self.store.clone(),
        )
        .start();
        self.rooms.insert(
            msg.code.clone(),
            RoomEntry {
                addr: addr.clone(),
                name,
                host_username: msg.username.clone(),
                video_id: msg.video_id.clone(),
                max_participants,
                is_private: msg.is_private,
                created_at: now_ms(),
                participant_count: 0,
                empty_since: Some(Instant::now()),
            },
        );
        log::info!("room {} created by {} ({})", msg.code, msg.username, msg.user_id);
        addr
    }
}

impl Actor for RoomManager {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.run_interval(REAP_INTERVAL, |act, _| {
            act.rooms.retain(|code, entry| {
                if !entry.addr.connected() {
                    log::debug!("reaping dead room {code}");
                    return false;
                }
                if entry
                    .empty_since
                    .map_or(false, |since| since.elapsed() >= EMPTY_ROOM_MAX_AGE)
                {
                    log::info!("reaping room {code}, empty past the idle threshold");
                    entry.addr.do_send(CloseRoom);
                    return false;
                }
                true
            });
        });
    }
}

/// Join (and lazily create, when `create` is set) a room. The room code
/// arrives upper-cased from the gateway. Responds with the room's address
/// for subsequent commands, or a typed refusal.
#[derive(Message)]
#[rtype(result = "Result<Addr<Room>, JoinError>")]
pub struct JoinRoom {
    pub code: RoomCode,
    pub user_id: UserId,
    pub username: String,
    pub session_id: SessionId,
    pub recipient: Recipient<SerializedMessage>,
    pub kick: Recipient<Kick>,
    pub create: bool,
    pub room_name: Option<String>,
    pub video_id: Option<String>,
    pub max_participants: Option<usize>,
    pub is_private: bool,
}

impl Handler<JoinRoom> for RoomManager {
    type Result = ResponseActFuture<Self, Result<Addr<Room>, JoinError>>;

    fn handle(&mut self, msg: JoinRoom, ctx: &mut Self::Context) -> Self::Result {
        // A room whose actor died between sweeps is as good as absent.
        if self
            .rooms
            .get(&msg.code)
            .map_or(false, |entry| !entry.addr.connected())
        {
            self.rooms.remove(&msg.code);
        }
        let addr = match self.rooms.get(&msg.code) {
            Some(entry) => entry.addr.clone(),
            None if msg.create => self.spawn_room(&msg, ctx.address()),
            None => return Box::pin(actix::fut::ready(Err(JoinError::RoomNotFound))),
        };
        let request = AddParticipant {
            user_id: msg.user_id,
            username: msg.username,
            session_id: msg.session_id,
            recipient: msg.recipient,
            kick: msg.kick,
            claims_create: msg.create,
        };
        Box::pin(addr.send(request).into_actor(self).map(move |res, _, _| {
            match res {
                Ok(Ok(())) => Ok(addr),
                Ok(Err(err)) => Err(err),
                Err(err) => {
                    log::error!("room mailbox error during join: {err}");
                    Err(JoinError::Internal)
                }
            }
        }))
    }
}

/// Periodic mirror of a room's registry-visible state.
#[derive(Message)]
#[rtype(result = "()")]
pub struct RoomStatus {
    pub code: RoomCode,
    pub participant_count: usize,
    pub host_username: String,
}

impl Handler<RoomStatus> for RoomManager {
    type Result = ();
    fn handle(&mut self, msg: RoomStatus, _: &mut Self::Context) {
        if let Some(entry) = self.rooms.get_mut(&msg.code) {
            entry.participant_count = msg.participant_count;
            entry.host_username = msg.host_username;
            if msg.participant_count == 0 {
                if entry.empty_since.is_none() {
                    entry.empty_since = Some(Instant::now());
                }
            } else {
                entry.empty_since = None;
            }
        }
    }
}

/// Sent by a room as it stops, regardless of why.
#[derive(Message)]
#[rtype(result = "()")]
pub struct RoomClosed(pub RoomCode);

impl Handler<RoomClosed> for RoomManager {
    type Result = ();
    fn handle(&mut self, msg: RoomClosed, _: &mut Self::Context) {
        self.rooms.remove(&msg.0);
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Connect;

impl Handler<Connect> for RoomManager {
    type Result = ();
    fn handle(&mut self, _: Connect, _: &mut Self::Context) {
        self.connections += 1;
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Disconnect;

impl Handler<Disconnect> for RoomManager {
    type Result = ();
    fn handle(&mut self, _: Disconnect, _: &mut Self::Context) {
        self.connections = self.connections.saturating_sub(1);
    }
}

#[derive(MessageResponse)]
pub struct ServerStats {
    pub rooms: usize,
    pub connections: usize,
}

#[derive(Message)]
#[rtype(result = "ServerStats")]
pub struct Stats;

impl Handler<Stats> for RoomManager {
    type Result = ServerStats;
    fn handle(&mut self, _: Stats, _: &mut Self::Context) -> Self::Result {
        ServerStats {
            rooms: self.rooms.len(),
            connections: self.connections,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PublicRoomInfo {
    pub room_code: RoomCode,
    pub room_name: String,
    pub host_username: String,
    pub participant_count: usize,
    pub max_participants: usize,
    pub video_id: Option<String>,
    pub created_at: i64,
}

#[derive(MessageResponse)]
pub struct PublicRoomList(pub Vec<PublicRoomInfo>);

/// Listing of joinable rooms: not private, at least one participant.
#[derive(Message)]
#[rtype(result = "PublicRoomList")]
pub struct PublicRooms;

impl Handler<PublicRooms> for RoomManager {
    type Result = PublicRoomList;
    fn handle(&mut self, _: PublicRooms, _: &mut Self::Context) -> Self::Result {
        PublicRoomList(
            self.rooms
                .iter()
                .filter(|(_, entry)| !entry.is_private && entry.participant_count >= 1)
                .map(|(code, entry)| PublicRoomInfo {
                    room_code: code.clone(),
                    room_name: entry.name.clone(),
                    host_username: entry.host_username.clone(),
                    participant_count: entry.participant_count,
                    max_participants: entry.max_participants,
                    video_id: entry.video_id.clone(),
                    created_at: entry.created_at,
                })
                .collect(),
        )
    }
}
