use actix::prelude::*;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::{JoinError, RoomClosed, RoomCode, RoomManager, RoomStatus};
use crate::session::message::{
    ChatEntry, ParticipantInfo, PlaybackEntry, PlaybackEventKind, ServerMessage,
    WatchClientMessage,
};
use crate::session::{frame, Kick, SerializedMessage, SessionId, UserId};
use crate::store::{PersistPlayback, Store, TouchParticipant};
use crate::utils::{new_fast_hashmap, now_ms};

/// Bounded room chat history, oldest entries evicted first.
pub const CHAT_HISTORY_LIMIT: usize = 200;
/// How much of the chat history a joining client gets replayed.
pub const CHAT_REPLAY_LIMIT: usize = 50;
/// Bounded playback event history.
pub const PLAYBACK_HISTORY_LIMIT: usize = 50;

/// A room that loses its last participant is deleted after this grace
/// period unless someone joins back in the meantime.
const EMPTY_ROOM_GRACE: Duration = Duration::from_secs(300);
/// Playback positions are persisted at most this often per room; the
/// in-memory state always updates immediately.
const PLAYBACK_PERSIST_INTERVAL: Duration = Duration::from_secs(1);

const ERR_NOT_HOST: &str = "Solo el anfitrión puede realizar esta acción";
const ERR_EMPTY_MESSAGE: &str = "El mensaje no puede estar vacío";
const ERR_TARGET_NOT_IN_ROOM: &str = "El usuario no está en la sala";
const ERR_REMOVE_SELF: &str = "No puedes eliminarte a ti mismo";
const KICK_REASON: &str = "Has sido eliminado de la sala";

pub struct Participant {
    pub recipient: Recipient<SerializedMessage>,
    pub kick: Recipient<Kick>,
    pub session_id: SessionId,
    pub username: String,
    pub joined_at: i64,
    pub last_seen: i64,
    pub is_host: bool,
}

pub struct RoomConfig {
    pub code: RoomCode,
    pub name: String,
    pub video_id: Option<String>,
    pub max_participants: usize,
    pub is_private: bool,
    pub host_user_id: UserId,
    pub host_username: String,
}

/// Per-room state machine. The actor mailbox is the single-writer
/// discipline: every mutation and every broadcast for this room goes
/// through it in one total order.
pub struct Room {
    id: u64,
    code: RoomCode,
    name: String,
    host_user_id: UserId,
    host_username: String,
    video_id: Option<String>,
    max_participants: usize,
    is_private: bool,
    current_time: f64,
    is_playing: bool,
    participants: ahash::HashMap<UserId, Participant>,
    messages: VecDeque<ChatEntry>,
    playback_history: VecDeque<PlaybackEntry>,
    next_message_id: u64,
    manager: Addr<RoomManager>,
    store: Addr<Store>,
    empty_check: Option<SpawnHandle>,
    last_persist: Option<Instant>,
}

impl Room {
    pub fn new(config: RoomConfig, manager: Addr<RoomManager>, store: Addr<Store>) -> Self {
        let RoomConfig {
            code,
            name,
            video_id,
            max_participants,
            is_private,
            host_user_id,
            host_username,
        } = config;
        Self {
            id: fastrand::u64(..),
            code,
            name,
            host_user_id,
            host_username,
            video_id,
            max_participants,
            is_private,
            current_time: 0.0,
            is_playing: false,
            participants: new_fast_hashmap(max_participants),
            messages: VecDeque::with_capacity(64),
            playback_history: VecDeque::with_capacity(PLAYBACK_HISTORY_LIMIT),
            next_message_id: 0,
            manager,
            store,
            empty_check: None,
            last_persist: None,
        }
    }

    /// Fan one frame out to every open participant session, optionally
    /// skipping one user. The frame is serialized once; send failures are
    /// swallowed and the reaper collects the dead session.
    fn broadcast(&self, msg: &ServerMessage, exclude: Option<UserId>) {
        let Some(frame) = frame(msg) else { return };
        for (user_id, participant) in &self.participants {
            if exclude == Some(*user_id) {
                continue;
            }
            participant
                .recipient
                .do_send(SerializedMessage(frame.clone()));
        }
    }

    fn send_to(&self, user_id: UserId, msg: &ServerMessage) {
        if let Some(participant) = self.participants.get(&user_id) {
            if let Some(frame) = frame(msg) {
                participant.recipient.do_send(SerializedMessage(frame));
            }
        }
    }

    fn send_error(&self, user_id: UserId, message: &str) {
        self.send_to(
            user_id,
            &ServerMessage::Error {
                message: message.to_string(),
            },
        );
    }

    fn system_broadcast(&self, message: String) {
        self.broadcast(
            &ServerMessage::SystemMessage {
                message,
                timestamp: now_ms(),
            },
            None,
        );
    }

    fn participants_info(&self) -> Vec<ParticipantInfo> {
        let mut info: Vec<ParticipantInfo> = self
            .participants
            .iter()
            .map(|(user_id, p)| ParticipantInfo {
                user_id: *user_id,
                username: p.username.clone(),
                is_host: p.is_host,
                joined_at: p.joined_at,
                last_seen: p.last_seen,
            })
            .collect();
        info.sort_by_key(|p| (p.joined_at, p.user_id));
        info
    }

    fn participants_update(&self) {
        self.broadcast(
            &ServerMessage::ParticipantsUpdate {
                participants: self.participants_info(),
            },
            None,
        );
    }

    fn playback_sync(&self) -> ServerMessage {
        ServerMessage::PlaybackSync {
            current_time: self.current_time,
            is_playing: self.is_playing,
            timestamp: now_ms(),
        }
    }

    fn notify_status(&self) {
        self.manager.do_send(RoomStatus {
            code: self.code.clone(),
            participant_count: self.participants.len(),
            host_username: self.host_username.clone(),
        });
    }

    fn chat_message(&mut self, user_id: UserId, message: String) {
        let body = message.trim();
        if body.is_empty() {
            self.send_error(user_id, ERR_EMPTY_MESSAGE);
            return;
        }
        let username = match self.participants.get(&user_id) {
            Some(p) => p.username.clone(),
            None => return,
        };
        self.next_message_id += 1;
        let entry = ChatEntry {
            id: self.next_message_id,
            user_id,
            username,
            message: body.to_string(),
            timestamp: now_ms(),
        };
        self.messages.push_back(entry.clone());
        if self.messages.len() > CHAT_HISTORY_LIMIT {
            self.messages.pop_front();
        }
        // The sender receives its own message back so every client observes
        // the authoritative order.
        self.broadcast(&ServerMessage::ChatMessage(entry), None);
    }

    fn playback_update(
        &mut self,
        user_id: UserId,
        current_time: f64,
        is_playing: bool,
        kind: Option<PlaybackEventKind>,
    ) {
        self.current_time = if current_time.is_finite() {
            current_time.max(0.0)
        } else {
            0.0
        };
        self.is_playing = is_playing;
        let entry = PlaybackEntry {
            user_id,
            current_time: self.current_time,
            is_playing,
            event_type: kind.unwrap_or(PlaybackEventKind::Update),
            timestamp: now_ms(),
        };
        self.playback_history.push_back(entry.clone());
        if self.playback_history.len() > PLAYBACK_HISTORY_LIMIT {
            self.playback_history.pop_front();
        }
        self.broadcast(&ServerMessage::PlaybackUpdate(entry), Some(user_id));
        let due = self
            .last_persist
            .map_or(true, |at| at.elapsed() >= PLAYBACK_PERSIST_INTERVAL);
        if due {
            self.last_persist = Some(Instant::now());
            self.store.do_send(PersistPlayback {
                room_code: self.code.to_string(),
                current_time: self.current_time,
                is_playing: self.is_playing,
            });
        }
    }

    fn invite_user(&self, sender: UserId, username: String) {
        if sender != self.host_user_id {
            self.send_error(sender, ERR_NOT_HOST);
            return;
        }
        self.broadcast(
            &ServerMessage::InvitationSent {
                username,
                invited_by: self.host_username.clone(),
                timestamp: now_ms(),
            },
            None,
        );
    }

    fn remove_participant(&mut self, sender: UserId, target: UserId, ctx: &mut Context<Self>) {
        if sender != self.host_user_id {
            self.send_error(sender, ERR_NOT_HOST);
            return;
        }
        if target == sender {
            self.send_error(sender, ERR_REMOVE_SELF);
            return;
        }
        let Some(participant) = self.participants.get(&target) else {
            self.send_error(sender, ERR_TARGET_NOT_IN_ROOM);
            return;
        };
        let username = participant.username.clone();
        participant.kick.do_send(Kick {
            reason: KICK_REASON.to_string(),
        });
        self.system_broadcast(format!("{username} fue eliminado de la sala"));
        self.remove(target, None, ctx);
    }

    fn promote_to_cohost(&self, sender: UserId, target: UserId) {
        if sender != self.host_user_id {
            self.send_error(sender, ERR_NOT_HOST);
            return;
        }
        let Some(participant) = self.participants.get(&target) else {
            self.send_error(sender, ERR_TARGET_NOT_IN_ROOM);
            return;
        };
        // Informational only: authority stays with the single host.
        self.system_broadcast(format!("{} ahora es coanfitrión", participant.username));
    }

    fn transfer_host(&mut self, sender: UserId, target: UserId) {
        if sender != self.host_user_id {
            self.send_error(sender, ERR_NOT_HOST);
            return;
        }
        if !self.participants.contains_key(&target) {
            self.send_error(sender, ERR_TARGET_NOT_IN_ROOM);
            return;
        }
        if target == sender {
            return;
        }
        if let Some(old) = self.participants.get_mut(&sender) {
            old.is_host = false;
        }
        if let Some(new) = self.participants.get_mut(&target) {
            new.is_host = true;
            self.host_user_id = target;
            self.host_username = new.username.clone();
        }
        self.system_broadcast(format!("{} es ahora el anfitrión", self.host_username));
        self.participants_update();
        self.notify_status();
    }

    /// Take a participant out of the room: announce, run host succession,
    /// and arm the deferred eviction check when the room goes empty. A
    /// `session_id` restricts removal to that exact connection so a stale
    /// disconnect cannot evict a rejoined user.
    fn remove(&mut self, user_id: UserId, session_id: Option<SessionId>, ctx: &mut Context<Self>) {
        let matches = self
            .participants
            .get(&user_id)
            .map_or(false, |p| session_id.map_or(true, |sid| p.session_id == sid));
        if !matches {
            return;
        }
        let Some(entry) = self.participants.remove(&user_id) else {
            return;
        };
        self.broadcast(
            &ServerMessage::UserLeft {
                user_id,
                username: entry.username,
                timestamp: now_ms(),
            },
            None,
        );
        if entry.is_host && !self.participants.is_empty() {
            self.promote_successor();
        }
        self.participants_update();
        self.notify_status();
        if self.participants.is_empty() {
            self.schedule_empty_check(ctx);
        }
    }

    /// Deterministic host succession: earliest join wins, ties broken by
    /// user id.
    fn promote_successor(&mut self) {
        let successor = self
            .participants
            .iter()
            .min_by_key(|(user_id, p)| (p.joined_at, **user_id))
            .map(|(user_id, _)| *user_id);
        let Some(user_id) = successor else { return };
        if let Some(p) = self.participants.get_mut(&user_id) {
            p.is_host = true;
            self.host_user_id = user_id;
            self.host_username = p.username.clone();
        }
        self.system_broadcast(format!("{} es ahora el anfitrión", self.host_username));
    }

    fn schedule_empty_check(&mut self, ctx: &mut Context<Self>) {
        let handle = ctx.run_later(EMPTY_ROOM_GRACE, |room, ctx| {
            room.empty_check = None;
            if room.participants.is_empty() {
                log::info!("room {} empty past grace period, closing", room.code);
                ctx.stop();
            }
        });
        if let Some(old) = self.empty_check.replace(handle) {
            ctx.cancel_future(old);
        }
    }
}

impl Actor for Room {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        log::info!("room {} ({}) started", self.code, self.id);
        // Covers rooms that are created but never joined.
        self.schedule_empty_check(ctx);
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        log::info!("room {} stopped", self.code);
        self.manager.do_send(RoomClosed(self.code.clone()));
    }
}

#[derive(Message)]
#[rtype(result = "Result<(), JoinError>")]
pub struct AddParticipant {
    pub user_id: UserId,
    pub username: String,
    pub session_id: SessionId,
    pub recipient: Recipient<SerializedMessage>,
    pub kick: Recipient<Kick>,
    /// The join frame carried `create: true`. On an existing private room
    /// this doubles as the invitation claim.
    pub claims_create: bool,
}

impl Handler<AddParticipant> for Room {
    type Result = Result<(), JoinError>;

    fn handle(&mut self, msg: AddParticipant, ctx: &mut Self::Context) -> Self::Result {
        let rejoin = self.participants.contains_key(&msg.user_id);
        if !rejoin {
            if self.participants.len() >= self.max_participants {
                return Err(JoinError::RoomFull);
            }
            if self.is_private && !msg.claims_create {
                return Err(JoinError::PrivateRoom);
            }
        }
        if let Some(handle) = self.empty_check.take() {
            ctx.cancel_future(handle);
        }
        let now = now_ms();
        let (joined_at, is_host) = match self.participants.get(&msg.user_id) {
            // Same user, fresh connection: replace the transport, keep the seat.
            Some(existing) => (existing.joined_at, existing.is_host),
            None => (now, self.participants.is_empty()),
        };
        if is_host {
            self.host_user_id = msg.user_id;
            self.host_username = msg.username.clone();
        }
        self.participants.insert(
            msg.user_id,
            Participant {
                recipient: msg.recipient,
                kick: msg.kick,
                session_id: msg.session_id,
                username: msg.username.clone(),
                joined_at,
                last_seen: now,
                is_host,
            },
        );
        self.send_to(
            msg.user_id,
            &ServerMessage::RoomJoined {
                room_code: self.code.clone(),
                room_name: self.name.clone(),
                video_id: self.video_id.clone(),
                is_host,
                host_username: self.host_username.clone(),
                current_time: self.current_time,
                is_playing: self.is_playing,
                max_participants: self.max_participants,
                timestamp: now,
            },
        );
        if !rejoin {
            self.broadcast(
                &ServerMessage::UserJoined {
                    user_id: msg.user_id,
                    username: msg.username,
                    timestamp: now,
                },
                Some(msg.user_id),
            );
        }
        self.participants_update();
        let replay = self
            .messages
            .iter()
            .skip(self.messages.len().saturating_sub(CHAT_REPLAY_LIMIT))
            .cloned()
            .collect();
        self.send_to(msg.user_id, &ServerMessage::ChatHistory { messages: replay });
        self.send_to(msg.user_id, &self.playback_sync());
        self.store.do_send(TouchParticipant {
            room_code: self.code.to_string(),
            user_id: msg.user_id,
        });
        self.notify_status();
        Ok(())
    }
}

/// A client command forwarded by its session. Senders that are not (or no
/// longer) participants are ignored.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Command {
    pub user_id: UserId,
    pub msg: WatchClientMessage,
}

impl Handler<Command> for Room {
    type Result = ();

    fn handle(&mut self, Command { user_id, msg }: Command, ctx: &mut Self::Context) {
        let Some(participant) = self.participants.get_mut(&user_id) else {
            log::debug!("dropping command from non-participant {user_id} in {}", self.code);
            return;
        };
        participant.last_seen = now_ms();
        match msg {
            WatchClientMessage::ChatMessage { message } => self.chat_message(user_id, message),
            WatchClientMessage::PlaybackUpdate {
                current_time,
                is_playing,
                event_type,
            } => self.playback_update(user_id, current_time, is_playing, event_type),
            WatchClientMessage::SyncRequest => self.send_to(user_id, &self.playback_sync()),
            WatchClientMessage::ParticipantsRequest => self.send_to(
                user_id,
                &ServerMessage::ParticipantsList {
                    participants: self.participants_info(),
                },
            ),
            WatchClientMessage::InviteUser { username } => self.invite_user(user_id, username),
            WatchClientMessage::RemoveParticipant { user_id: target } => {
                self.remove_participant(user_id, target, ctx)
            }
            WatchClientMessage::PromoteToCohost { user_id: target } => {
                self.promote_to_cohost(user_id, target)
            }
            WatchClientMessage::TransferHost { user_id: target } => {
                self.transfer_host(user_id, target)
            }
            WatchClientMessage::Leave => self.remove(user_id, None, ctx),
            // Resolved at the session layer; nothing to do here.
            WatchClientMessage::Join { .. } | WatchClientMessage::Ping => {}
        }
    }
}

/// Teardown notice from a closing session. Carries the session id so a
/// reconnect that already replaced this seat is left alone.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Leave {
    pub user_id: UserId,
    pub session_id: SessionId,
}

impl Handler<Leave> for Room {
    type Result = ();
    fn handle(&mut self, msg: Leave, ctx: &mut Self::Context) {
        self.remove(msg.user_id, Some(msg.session_id), ctx);
    }
}

/// Reaper backstop. Only honored while the room is actually empty.
#[derive(Message)]
#[rtype(result = "()")]
pub struct CloseRoom;

impl Handler<CloseRoom> for Room {
    type Result = ();
    fn handle(&mut self, _: CloseRoom, ctx: &mut Self::Context) {
        if self.participants.is_empty() {
            ctx.stop();
        }
    }
}
