use actix::prelude::*;
use std::time::Duration;

use crate::session::message::ServerMessage;
use crate::session::{frame, SerializedMessage, SessionId, UserId};
use crate::store::{InsertDirectMessage, SetOnline, Store};
use crate::utils::{new_fast_hashmap, now_ms};

pub mod actor;

/// Sweep cadence for dead chat sessions.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

struct OnlineUser {
    username: String,
    sessions: ahash::HashMap<SessionId, Recipient<SerializedMessage>>,
}

/// Presence registry and direct-messaging pipeline. A user is online iff it
/// has at least one live session; the store mirrors that transition with
/// eventual consistency.
pub struct ChatServer {
    online: ahash::HashMap<UserId, OnlineUser>,
    store: Addr<Store>,
}

impl ChatServer {
    pub fn new(store: Addr<Store>) -> Self {
        Self {
            online: new_fast_hashmap(1 << 10),
            store,
        }
    }

    /// Deliver one frame to every session of a user. Returns false when the
    /// user has no live session.
    fn push_to(&self, user_id: UserId, msg: &ServerMessage) -> bool {
        let Some(user) = self.online.get(&user_id) else {
            return false;
        };
        if let Some(frame) = frame(msg) {
            for recipient in user.sessions.values() {
                recipient.do_send(SerializedMessage(frame.clone()));
            }
        }
        true
    }

    fn reap(&mut self) {
        let mut went_offline = Vec::new();
        self.online.retain(|user_id, user| {
            user.sessions.retain(|_, recipient| recipient.connected());
            if user.sessions.is_empty() {
                went_offline.push((*user_id, user.username.clone()));
                false
            } else {
                true
            }
        });
        for (user_id, username) in went_offline {
            log::info!("reaped last dead session of user {user_id}");
            self.store.do_send(SetOnline {
                user_id,
                username,
                online: false,
            });
        }
    }
}

impl Actor for ChatServer {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.run_interval(REAP_INTERVAL, |act, _| act.reap());
    }
}

/// Attach a freshly accepted chat session to its user.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Connect {
    pub user_id: UserId,
    pub username: String,
    pub session_id: SessionId,
    pub recipient: Recipient<SerializedMessage>,
}

impl Handler<Connect> for ChatServer {
    type Result = ();
    fn handle(&mut self, msg: Connect, _: &mut Self::Context) {
        let user = self.online.entry(msg.user_id).or_insert_with(|| {
            log::debug!("user {} came online", msg.user_id);
            OnlineUser {
                username: msg.username.clone(),
                sessions: new_fast_hashmap(2),
            }
        });
        let first = user.sessions.is_empty();
        user.username = msg.username.clone();
        user.sessions.insert(msg.session_id, msg.recipient);
        if first {
            self.store.do_send(SetOnline {
                user_id: msg.user_id,
                username: msg.username,
                online: true,
            });
        }
    }
}

/// Detach a closing session; the user goes offline with its last one.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Disconnect {
    pub user_id: UserId,
    pub session_id: SessionId,
}

impl Handler<Disconnect> for ChatServer {
    type Result = ();
    fn handle(&mut self, msg: Disconnect, _: &mut Self::Context) {
        let Some(user) = self.online.get_mut(&msg.user_id) else {
            return;
        };
        user.sessions.remove(&msg.session_id);
        if user.sessions.is_empty() {
            let username = user.username.clone();
            self.online.remove(&msg.user_id);
            log::debug!("user {} went offline", msg.user_id);
            self.store.do_send(SetOnline {
                user_id: msg.user_id,
                username,
                online: false,
            });
        }
    }
}

#[derive(Message)]
#[rtype(result = "bool")]
pub struct IsOnline(pub UserId);

impl Handler<IsOnline> for ChatServer {
    type Result = bool;
    fn handle(&mut self, msg: IsOnline, _: &mut Self::Context) -> Self::Result {
        self.online.contains_key(&msg.0)
    }
}

#[derive(Message)]
#[rtype(result = "usize")]
pub struct SessionCount(pub UserId);

impl Handler<SessionCount> for ChatServer {
    type Result = usize;
    fn handle(&mut self, msg: SessionCount, _: &mut Self::Context) -> Self::Result {
        self.online.get(&msg.0).map_or(0, |user| user.sessions.len())
    }
}

/// Number of distinct online users, for the health endpoint.
#[derive(Message)]
#[rtype(result = "usize")]
pub struct OnlineCount;

impl Handler<OnlineCount> for ChatServer {
    type Result = usize;
    fn handle(&mut self, _: OnlineCount, _: &mut Self::Context) -> Self::Result {
        self.online.len()
    }
}

/// Persist one direct message, then deliver it to the receiver's sessions
/// if any are live. Persistence failure degrades to live-only delivery.
#[derive(Message)]
#[rtype(result = "()")]
pub struct SendPrivate {
    pub from: UserId,
    pub from_username: String,
    pub to: UserId,
    pub message: String,
}

impl Handler<SendPrivate> for ChatServer {
    type Result = ();
    fn handle(&mut self, msg: SendPrivate, ctx: &mut Self::Context) {
        let insert = InsertDirectMessage {
            sender_id: msg.from,
            receiver_id: msg.to,
            message: msg.message.clone(),
        };
        // The registry keeps draining its mailbox while the store call is
        // in flight; delivery re-enters the actor with a fresh view.
        let fut = self
            .store
            .send(insert)
            .into_actor(self)
            .map(move |res, act, _| {
                let id = match res {
                    Ok(Ok(id)) => Some(id),
                    Ok(Err(err)) => {
                        log::error!("failed to persist direct message: {err}");
                        None
                    }
                    Err(err) => {
                        log::error!("store unavailable: {err}");
                        None
                    }
                };
                let delivered = act.push_to(
                    msg.to,
                    &ServerMessage::PrivateMessage {
                        id,
                        from: msg.from,
                        from_username: msg.from_username,
                        message: msg.message,
                        timestamp: now_ms(),
                    },
                );
                if !delivered {
                    // Offline receiver: the message waits in the store for
                    // the on-connect replay.
                    log::debug!("user {} offline, queued message for replay", msg.to);
                }
            });
        ctx.spawn(fut);
    }
}

/// Live notification of a new friendship request. The request row itself is
/// persisted by the external API.
#[derive(Message)]
#[rtype(result = "()")]
pub struct NotifyFriendRequest {
    pub from: UserId,
    pub from_username: String,
    pub to: UserId,
}

impl Handler<NotifyFriendRequest> for ChatServer {
    type Result = ();
    fn handle(&mut self, msg: NotifyFriendRequest, _: &mut Self::Context) {
        self.push_to(
            msg.to,
            &ServerMessage::FriendRequest {
                request_id: None,
                from: msg.from,
                from_username: msg.from_username,
                timestamp: now_ms(),
            },
        );
    }
}

/// Live notification of a request's resolution, pushed to its originator.
#[derive(Message)]
#[rtype(result = "()")]
pub struct NotifyFriendResponse {
    pub request_id: i64,
    pub originator: UserId,
    pub status: String,
}

impl Handler<NotifyFriendResponse> for ChatServer {
    type Result = ();
    fn handle(&mut self, msg: NotifyFriendResponse, _: &mut Self::Context) {
        self.push_to(
            msg.originator,
            &ServerMessage::FriendRequestResponse {
                request_id: msg.request_id,
                status: msg.status,
                timestamp: now_ms(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recorder {
        frames: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    impl Actor for Recorder {
        type Context = Context<Self>;
    }

    impl Handler<SerializedMessage> for Recorder {
        type Result = ();
        fn handle(&mut self, msg: SerializedMessage, _: &mut Context<Self>) {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&msg.0) {
                self.frames.lock().unwrap().push(value);
            }
        }
    }

    #[derive(Message)]
    #[rtype(result = "()")]
    struct Flush;

    impl Handler<Flush> for Recorder {
        type Result = ();
        fn handle(&mut self, _: Flush, _: &mut Context<Self>) {}
    }

    struct Peer {
        addr: Addr<Recorder>,
        frames: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    impl Peer {
        fn new() -> Self {
            let frames = Arc::new(Mutex::new(Vec::new()));
            let addr = Recorder {
                frames: frames.clone(),
            }
            .start();
            Self { addr, frames }
        }

        async fn drain(&self) -> Vec<serde_json::Value> {
            self.addr.send(Flush).await.unwrap();
            self.frames.lock().unwrap().drain(..).collect()
        }
    }

    fn connect(peer: &Peer, user_id: UserId, username: &str, session_id: SessionId) -> Connect {
        Connect {
            user_id,
            username: username.to_string(),
            session_id,
            recipient: peer.addr.clone().recipient(),
        }
    }

    #[actix_rt::test]
    async fn presence_follows_session_count() {
        let server = ChatServer::new(crate::store::start_in_memory()).start();
        let a = Peer::new();
        let b = Peer::new();
        server.send(connect(&a, 1, "Alice", 11)).await.unwrap();
        server.send(connect(&b, 1, "Alice", 12)).await.unwrap();
        assert!(server.send(IsOnline(1)).await.unwrap());
        assert_eq!(server.send(SessionCount(1)).await.unwrap(), 2);

        server
            .send(Disconnect {
                user_id: 1,
                session_id: 11,
            })
            .await
            .unwrap();
        assert!(server.send(IsOnline(1)).await.unwrap());

        server
            .send(Disconnect {
                user_id: 1,
                session_id: 12,
            })
            .await
            .unwrap();
        assert!(!server.send(IsOnline(1)).await.unwrap());
        assert_eq!(server.send(OnlineCount).await.unwrap(), 0);
    }

    #[actix_rt::test]
    async fn private_message_reaches_every_receiver_session() {
        let server = ChatServer::new(crate::store::start_in_memory()).start();
        let sender = Peer::new();
        let tab_one = Peer::new();
        let tab_two = Peer::new();
        server.send(connect(&sender, 1, "Alice", 11)).await.unwrap();
        server.send(connect(&tab_one, 2, "Bob", 21)).await.unwrap();
        server.send(connect(&tab_two, 2, "Bob", 22)).await.unwrap();

        server
            .send(SendPrivate {
                from: 1,
                from_username: "Alice".to_string(),
                to: 2,
                message: "hola".to_string(),
            })
            .await
            .unwrap();
        // Delivery happens after the store round-trip resolves.
        actix_rt::time::sleep(std::time::Duration::from_millis(200)).await;

        for peer in [&tab_one, &tab_two] {
            let frames = peer.drain().await;
            let delivered = frames
                .iter()
                .find(|frame| frame["type"] == "private_message")
                .expect("receiver session got the message");
            assert_eq!(delivered["from"], 1);
            assert_eq!(delivered["from_username"], "Alice");
            assert_eq!(delivered["message"], "hola");
            assert!(delivered["id"].as_i64().is_some());
        }
        // The sender's own session hears nothing.
        assert!(sender.drain().await.is_empty());
    }

    #[actix_rt::test]
    async fn friend_notifications_target_the_right_user() {
        let server = ChatServer::new(crate::store::start_in_memory()).start();
        let bob = Peer::new();
        server.send(connect(&bob, 2, "Bob", 21)).await.unwrap();

        server
            .send(NotifyFriendRequest {
                from: 1,
                from_username: "Alice".to_string(),
                to: 2,
            })
            .await
            .unwrap();
        let frames = bob.drain().await;
        let request = frames
            .iter()
            .find(|frame| frame["type"] == "friend_request")
            .expect("target is notified");
        assert_eq!(request["from"], 1);
        assert!(request.get("request_id").is_none());

        server
            .send(NotifyFriendResponse {
                request_id: 7,
                originator: 2,
                status: "accepted".to_string(),
            })
            .await
            .unwrap();
        let frames = bob.drain().await;
        let response = frames
            .iter()
            .find(|frame| frame["type"] == "friend_request_response")
            .expect("originator is notified");
        assert_eq!(response["request_id"], 7);
        assert_eq!(response["status"], "accepted");
    }
}
