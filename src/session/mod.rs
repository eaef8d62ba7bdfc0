use actix::{Actor, ActorContext, Message, StreamHandler};
use actix_web_actors::ws::{self, CloseCode, CloseReason, ProtocolError, WebsocketContext};
use bytestring::ByteString;
use std::time::Duration;

use message::ServerMessage;

pub mod actor;
pub mod message;

/// Persistent user identity, assigned by the external account system.
pub type UserId = i64;
/// Transient id of one live connection. Not persisted.
pub type SessionId = u64;

/// How often the server probes a client with a transport-level ping.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// A client silent for this long (two missed probes) is terminated.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

pub const DEFAULT_USERNAME: &str = "Anónimo";

/// One outbound frame, serialized once and shared across every recipient of
/// a broadcast.
#[derive(Message, Clone)]
#[rtype(result = "()")]
pub struct SerializedMessage(pub ByteString);

/// Forced termination of a session by a room (host removal). Closes the
/// transport with a normal status and a human-readable reason so clients can
/// tell a kick from a network drop.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Kick {
    pub reason: String,
}

/// Serialize a frame for fan-out. Failures are logged and the frame is
/// dropped; they never take the session down.
pub fn frame(msg: &ServerMessage) -> Option<ByteString> {
    match serde_json::to_string(msg) {
        Ok(text) => Some(ByteString::from(text)),
        Err(err) => {
            log::error!("error serializing frame: {err}");
            None
        }
    }
}

/// Stand-in actor for connections that fail query validation. The handshake
/// is completed so the policy-violation close code and reason actually reach
/// the client, then the session ends immediately.
pub struct Reject {
    reason: String,
}

impl Reject {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Actor for Reject {
    type Context = WebsocketContext<Self>;
    fn started(&mut self, ctx: &mut Self::Context) {
        log::warn!("rejecting connection: {}", self.reason);
        ctx.close(Some(CloseReason {
            code: CloseCode::Policy,
            description: Some(self.reason.clone()),
        }));
        ctx.stop();
    }
}

impl StreamHandler<Result<ws::Message, ProtocolError>> for Reject {
    fn handle(&mut self, _: Result<ws::Message, ProtocolError>, _: &mut Self::Context) {}
}
