use actix::prelude::*;
use actix_web_actors::ws::{self, CloseCode, CloseReason, ProtocolError, WebsocketContext};
use std::time::Instant;

use super::message::{is_known_watch_type, ServerMessage, WatchClientMessage};
use super::{
    frame, Kick, SerializedMessage, SessionId, UserId, CLIENT_TIMEOUT, HEARTBEAT_INTERVAL,
};
use crate::room::actor::{Command, Leave, Room};
use crate::room::{Connect, Disconnect, JoinRoom, RoomCode, RoomManager};
use crate::utils::{next_session_id, now_ms};

const ERR_INVALID_JSON: &str = "JSON inválido";
const ERR_INVALID_MESSAGE: &str = "Mensaje inválido";
const ERR_ALREADY_IN_ROOM: &str = "Ya estás en una sala";
const ERR_NOT_IN_ROOM: &str = "Únete a una sala primero";

/// One watch-party connection. Parses frames, keeps the heartbeat, and
/// relays commands to the room the client joined.
pub struct Session {
    session_id: SessionId,
    user_id: UserId,
    username: String,
    room_code: RoomCode,
    hb: Instant,
    manager: Addr<RoomManager>,
    room: Option<Addr<Room>>,
}

impl Session {
    pub fn new(user_id: UserId, username: String, room_code: RoomCode, manager: Addr<RoomManager>) -> Self {
        Self {
            session_id: next_session_id(),
            user_id,
            username,
            room_code,
            hb: Instant::now(),
            manager,
            room: None,
        }
    }

    /// Probe the peer every [HEARTBEAT_INTERVAL]. Two missed probes and the
    /// session is terminated; teardown then runs through [Actor::stopped].
    fn heartbeat(&self, ctx: &mut <Self as Actor>::Context) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                log::info!("session {} missed its heartbeat, closing", act.session_id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn send_error(&self, message: &str, ctx: &mut <Self as Actor>::Context) {
        if let Some(frame) = frame(&ServerMessage::Error {
            message: message.to_string(),
        }) {
            ctx.text(frame);
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut <Self as Actor>::Context) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                log::warn!("session {}: malformed frame: {err}", self.session_id);
                self.send_error(ERR_INVALID_JSON, ctx);
                return;
            }
        };
        let Some(kind) = value.get("type").and_then(|t| t.as_str()).map(str::to_owned) else {
            self.send_error(ERR_INVALID_JSON, ctx);
            return;
        };
        match serde_json::from_value::<WatchClientMessage>(value) {
            Ok(msg) => self.handle_message(msg, ctx),
            Err(err) if is_known_watch_type(&kind) => {
                log::warn!("session {}: bad {kind} frame: {err}", self.session_id);
                self.send_error(ERR_INVALID_MESSAGE, ctx);
            }
            Err(_) => log::debug!("session {}: ignoring unknown type {kind:?}", self.session_id),
        }
    }

    fn join_room(&mut self, msg: WatchClientMessage, ctx: &mut <Self as Actor>::Context) {
        let WatchClientMessage::Join {
            create,
            room_name,
            video_id,
            max_participants,
            is_private,
        } = msg
        else {
            return;
        };
        if self.room.is_some() {
            self.send_error(ERR_ALREADY_IN_ROOM, ctx);
            return;
        }
        let request = JoinRoom {
            code: self.room_code.clone(),
            user_id: self.user_id,
            username: self.username.clone(),
            session_id: self.session_id,
            recipient: ctx.address().recipient(),
            kick: ctx.address().recipient(),
            create,
            room_name,
            video_id,
            max_participants,
            is_private,
        };
        self.manager
            .send(request)
            .into_actor(self)
            .then(|res, act, ctx| {
                match res {
                    Ok(Ok(room)) => act.room = Some(room),
                    Ok(Err(err)) => act.send_error(err.message(), ctx),
                    Err(err) => {
                        log::error!("registry mailbox error during join: {err}");
                        act.send_error(crate::room::JoinError::Internal.message(), ctx);
                    }
                }
                actix::fut::ready(())
            })
            .wait(ctx);
    }

    fn handle_message(&mut self, msg: WatchClientMessage, ctx: &mut <Self as Actor>::Context) {
        match msg {
            msg @ WatchClientMessage::Join { .. } => self.join_room(msg, ctx),
            WatchClientMessage::Ping => {
                self.hb = Instant::now();
                if let Some(frame) = frame(&ServerMessage::Pong {
                    timestamp: now_ms(),
                }) {
                    ctx.text(frame);
                }
            }
            WatchClientMessage::Leave => {
                if let Some(room) = self.room.take() {
                    room.do_send(Leave {
                        user_id: self.user_id,
                        session_id: self.session_id,
                    });
                }
            }
            msg => match &self.room {
                Some(room) => room.do_send(Command {
                    user_id: self.user_id,
                    msg,
                }),
                None => self.send_error(ERR_NOT_IN_ROOM, ctx),
            },
        }
    }
}

impl Actor for Session {
    type Context = WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.heartbeat(ctx);
        self.manager.do_send(Connect);
        if let Some(frame) = frame(&ServerMessage::Connected {
            session_id: self.session_id,
            timestamp: now_ms(),
        }) {
            ctx.text(frame);
        }
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        // Runs on every exit path: voluntary leave, transport error, kick,
        // heartbeat death. The room ignores stale leaves after a rejoin.
        if let Some(room) = self.room.take() {
            room.do_send(Leave {
                user_id: self.user_id,
                session_id: self.session_id,
            });
        }
        self.manager.do_send(Disconnect);
    }
}

impl StreamHandler<Result<ws::Message, ProtocolError>> for Session {
    fn handle(&mut self, item: Result<ws::Message, ProtocolError>, ctx: &mut Self::Context) {
        match item {
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Ping(bytes)) => {
                self.hb = Instant::now();
                ctx.pong(&bytes);
            }
            Ok(ws::Message::Pong(_)) => self.hb = Instant::now(),
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => {}
            Err(err) => {
                log::warn!("session {} transport error: {err}", self.session_id);
                ctx.stop();
            }
        }
    }
}

impl Handler<SerializedMessage> for Session {
    type Result = ();
    fn handle(&mut self, msg: SerializedMessage, ctx: &mut Self::Context) -> Self::Result {
        ctx.text(msg.0);
    }
}

impl Handler<Kick> for Session {
    type Result = ();
    fn handle(&mut self, msg: Kick, ctx: &mut Self::Context) -> Self::Result {
        // The room already dropped this participant; skip the stale leave.
        self.room = None;
        ctx.close(Some(CloseReason {
            code: CloseCode::Normal,
            description: Some(msg.reason),
        }));
        ctx.stop();
    }
}
