use actix::prelude::*;
use actix_web_actors::ws::{self, ProtocolError, WebsocketContext};
use std::time::Instant;

use super::{ChatServer, Connect, Disconnect, NotifyFriendRequest, NotifyFriendResponse, SendPrivate};
use crate::session::message::{is_known_chat_type, ChatClientMessage, ServerMessage};
use crate::session::{frame, SerializedMessage, SessionId, UserId, CLIENT_TIMEOUT, HEARTBEAT_INTERVAL};
use crate::store::{MarkRead, PendingFriendRequests, Store, UnreadMessages};
use crate::utils::{next_session_id, now_ms};

const ERR_INVALID_JSON: &str = "JSON inválido";
const ERR_INVALID_MESSAGE: &str = "Mensaje inválido";
const ERR_EMPTY_MESSAGE: &str = "El mensaje no puede estar vacío";

/// One private-chat connection. Attaches to the presence registry and
/// replays pending items before any live traffic reaches the client.
pub struct ChatSession {
    session_id: SessionId,
    user_id: UserId,
    username: String,
    hb: Instant,
    server: Addr<ChatServer>,
    store: Addr<Store>,
}

impl ChatSession {
    pub fn new(user_id: UserId, username: String, server: Addr<ChatServer>, store: Addr<Store>) -> Self {
        Self {
            session_id: next_session_id(),
            user_id,
            username,
            hb: Instant::now(),
            server,
            store,
        }
    }

    fn heartbeat(&self, ctx: &mut <Self as Actor>::Context) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                log::info!("chat session {} missed its heartbeat, closing", act.session_id);
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

    /// Best-effort replay of offline traffic: unread direct messages first
    /// (newest-first, original timestamps), then pending friendship
    /// requests. `wait` keeps the mailbox parked so nothing live overtakes
    /// the replay; a store failure only costs the replay itself.
    fn replay_pending(&self, ctx: &mut <Self as Actor>::Context) {
        self.store
            .send(UnreadMessages {
                receiver_id: self.user_id,
            })
            .into_actor(self)
            .then(|res, act, ctx| {
                match res {
                    Ok(Ok(messages)) => {
                        let mut delivered = Vec::with_capacity(messages.len());
                        for m in messages {
                            delivered.push(m.id);
                            if let Some(frame) = frame(&ServerMessage::PrivateMessage {
                                id: Some(m.id),
                                from: m.sender_id,
                                from_username: m.sender_username,
                                message: m.message,
                                timestamp: m.timestamp,
                            }) {
                                ctx.text(frame);
                            }
                        }
                        // Replayed rows are acknowledged so the next connect
                        // starts from a clean slate.
                        if !delivered.is_empty() {
                            act.store.do_send(MarkRead { ids: delivered });
                        }
                    }
                    Ok(Err(err)) => {
                        log::error!("unread replay failed for user {}: {err}", act.user_id)
                    }
                    Err(err) => log::error!("store unavailable for replay: {err}"),
                }
                actix::fut::ready(())
            })
            .wait(ctx);
        self.store
            .send(PendingFriendRequests {
                user_id: self.user_id,
            })
            .into_actor(self)
            .then(|res, act, ctx| {
                match res {
                    Ok(Ok(requests)) => {
                        for r in requests {
                            if let Some(frame) = frame(&ServerMessage::FriendRequest {
                                request_id: Some(r.id),
                                from: r.sender_id,
                                from_username: r.sender_username,
                                timestamp: r.timestamp,
                            }) {
                                ctx.text(frame);
                            }
                        }
                    }
                    Ok(Err(err)) => {
                        log::error!("request replay failed for user {}: {err}", act.user_id)
                    }
                    Err(err) => log::error!("store unavailable for replay: {err}"),
                }
                actix::fut::ready(())
            })
            .wait(ctx);
    }

    fn handle_text(&mut self, text: &str, ctx: &mut <Self as Actor>::Context) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                log::warn!("chat session {}: malformed frame: {err}", self.session_id);
                self.send_error(ERR_INVALID_JSON, ctx);
                return;
            }
        };
        let Some(kind) = value.get("type").and_then(|t| t.as_str()).map(str::to_owned) else {
            self.send_error(ERR_INVALID_JSON, ctx);
            return;
        };
        match serde_json::from_value::<ChatClientMessage>(value) {
            Ok(msg) => self.handle_message(msg, ctx),
            Err(err) if is_known_chat_type(&kind) => {
                log::warn!("chat session {}: bad {kind} frame: {err}", self.session_id);
                self.send_error(ERR_INVALID_MESSAGE, ctx);
            }
            Err(_) => log::debug!(
                "chat session {}: ignoring unknown type {kind:?}",
                self.session_id
            ),
        }
    }

    fn handle_message(&mut self, msg: ChatClientMessage, ctx: &mut <Self as Actor>::Context) {
        match msg {
            ChatClientMessage::PrivateMessage { to, message, .. } => {
                let body = message.trim();
                if body.is_empty() {
                    self.send_error(ERR_EMPTY_MESSAGE, ctx);
                    return;
                }
                self.server.do_send(SendPrivate {
                    from: self.user_id,
                    from_username: self.username.clone(),
                    to,
                    message: body.to_string(),
                });
            }
            ChatClientMessage::FriendRequest { to } => {
                self.server.do_send(NotifyFriendRequest {
                    from: self.user_id,
                    from_username: self.username.clone(),
                    to,
                });
            }
            ChatClientMessage::FriendRequestResponse {
                request_id,
                originator,
                status,
            } => {
                self.server.do_send(NotifyFriendResponse {
                    request_id,
                    originator,
                    status,
                });
            }
            ChatClientMessage::Ping => {
                self.hb = Instant::now();
                if let Some(frame) = frame(&ServerMessage::Pong {
                    timestamp: now_ms(),
                }) {
                    ctx.text(frame);
                }
            }
        }
    }
}

impl Actor for ChatSession {
    type Context = WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.heartbeat(ctx);
        if let Some(frame) = frame(&ServerMessage::Connected {
            session_id: self.session_id,
            timestamp: now_ms(),
        }) {
            ctx.text(frame);
        }
        self.server.do_send(Connect {
            user_id: self.user_id,
            username: self.username.clone(),
            session_id: self.session_id,
            recipient: ctx.address().recipient(),
        });
        self.replay_pending(ctx);
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        self.server.do_send(Disconnect {
            user_id: self.user_id,
            session_id: self.session_id,
        });
    }
}

impl StreamHandler<Result<ws::Message, ProtocolError>> for ChatSession {
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
                log::warn!("chat session {} transport error: {err}", self.session_id);
                ctx.stop();
            }
        }
    }
}

impl Handler<SerializedMessage> for ChatSession {
    type Result = ();
    fn handle(&mut self, msg: SerializedMessage, ctx: &mut Self::Context) -> Self::Result {
        ctx.text(msg.0);
    }
}
