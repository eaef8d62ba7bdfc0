use serde::{Deserialize, Serialize};

use crate::room::RoomCode;
use crate::session::UserId;

/// Messages accepted on the watch-party endpoint.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchClientMessage {
    Join {
        #[serde(default)]
        create: bool,
        #[serde(default)]
        room_name: Option<String>,
        #[serde(default)]
        video_id: Option<String>,
        #[serde(default)]
        max_participants: Option<usize>,
        #[serde(default)]
        is_private: bool,
    },
    ChatMessage {
        message: String,
    },
    PlaybackUpdate {
        current_time: f64,
        is_playing: bool,
        #[serde(default)]
        event_type: Option<PlaybackEventKind>,
    },
    ParticipantsRequest,
    SyncRequest,
    InviteUser {
        username: String,
    },
    RemoveParticipant {
        user_id: UserId,
    },
    PromoteToCohost {
        user_id: UserId,
    },
    TransferHost {
        user_id: UserId,
    },
    Leave,
    Ping,
}

/// Messages accepted on the private-chat endpoint.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatClientMessage {
    PrivateMessage {
        to: UserId,
        message: String,
        /// Client-side send time; informational only, the server stamps its
        /// own clock on delivery.
        #[serde(default)]
        timestamp: Option<i64>,
    },
    FriendRequest {
        to: UserId,
    },
    FriendRequestResponse {
        request_id: i64,
        originator: UserId,
        status: String,
    },
    Ping,
}

const WATCH_TYPES: &[&str] = &[
    "join",
    "chat_message",
    "playback_update",
    "participants_request",
    "sync_request",
    "invite_user",
    "remove_participant",
    "promote_to_cohost",
    "transfer_host",
    "leave",
    "ping",
];

const CHAT_TYPES: &[&str] = &[
    "private_message",
    "friend_request",
    "friend_request_response",
    "ping",
];

/// Whether `kind` names a watch-party command at all. Known types with bad
/// fields earn the sender a protocol error; unknown types are dropped.
pub fn is_known_watch_type(kind: &str) -> bool {
    WATCH_TYPES.contains(&kind)
}

pub fn is_known_chat_type(kind: &str) -> bool {
    CHAT_TYPES.contains(&kind)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackEventKind {
    Play,
    Pause,
    Seek,
    Update,
}

/// One entry of a room's bounded chat history. Immutable once appended.
#[derive(Debug, Clone, Serialize)]
pub struct ChatEntry {
    pub id: u64,
    pub user_id: UserId,
    pub username: String,
    pub message: String,
    pub timestamp: i64,
}

/// One entry of a room's bounded playback history. Immutable.
#[derive(Debug, Clone, Serialize)]
pub struct PlaybackEntry {
    pub user_id: UserId,
    pub current_time: f64,
    pub is_playing: bool,
    pub event_type: PlaybackEventKind,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantInfo {
    pub user_id: UserId,
    pub username: String,
    pub is_host: bool,
    pub joined_at: i64,
    pub last_seen: i64,
}

/// Every frame the server emits, across both endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        session_id: u64,
        timestamp: i64,
    },
    RoomJoined {
        room_code: RoomCode,
        room_name: String,
        video_id: Option<String>,
        is_host: bool,
        host_username: String,
        current_time: f64,
        is_playing: bool,
        max_participants: usize,
        timestamp: i64,
    },
    UserJoined {
        user_id: UserId,
        username: String,
        timestamp: i64,
    },
    UserLeft {
        user_id: UserId,
        username: String,
        timestamp: i64,
    },
    ParticipantsUpdate {
        participants: Vec<ParticipantInfo>,
    },
    ParticipantsList {
        participants: Vec<ParticipantInfo>,
    },
    ChatMessage(ChatEntry),
    ChatHistory {
        messages: Vec<ChatEntry>,
    },
    PlaybackUpdate(PlaybackEntry),
    PlaybackSync {
        current_time: f64,
        is_playing: bool,
        timestamp: i64,
    },
    InvitationSent {
        username: String,
        invited_by: String,
        timestamp: i64,
    },
    SystemMessage {
        message: String,
        timestamp: i64,
    },
    Error {
        message: String,
    },
    Pong {
        timestamp: i64,
    },
    PrivateMessage {
        /// Store-assigned id; absent when persistence failed and delivery
        /// degraded to live-only.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<i64>,
        from: UserId,
        from_username: String,
        message: String,
        timestamp: i64,
    },
    FriendRequest {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<i64>,
        from: UserId,
        from_username: String,
        timestamp: i64,
    },
    FriendRequestResponse {
        request_id: i64,
        status: String,
        timestamp: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn join_frame_parses_with_defaults() {
        let msg: WatchClientMessage = serde_json::from_str(r#"{"type":"join"}"#).unwrap();
        match msg {
            WatchClientMessage::Join {
                create,
                max_participants,
                is_private,
                ..
            } => {
                assert!(!create);
                assert!(max_participants.is_none());
                assert!(!is_private);
            }
            other => panic!("parsed wrong variant: {other:?}"),
        }
    }

    #[test]
    fn playback_update_frame_parses() {
        let msg: WatchClientMessage = serde_json::from_str(
            r#"{"type":"playback_update","current_time":42.0,"is_playing":true,"event_type":"play"}"#,
        )
        .unwrap();
        match msg {
            WatchClientMessage::PlaybackUpdate {
                current_time,
                is_playing,
                event_type,
            } => {
                assert_eq!(current_time, 42.0);
                assert!(is_playing);
                assert_eq!(event_type, Some(PlaybackEventKind::Play));
            }
            other => panic!("parsed wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_distinguished_from_known() {
        assert!(is_known_watch_type("chat_message"));
        assert!(!is_known_watch_type("dance"));
        assert!(is_known_chat_type("private_message"));
        assert!(!is_known_chat_type("join"));
    }

    #[test]
    fn chat_message_frame_serializes_flat() {
        let frame = ServerMessage::ChatMessage(ChatEntry {
            id: 1,
            user_id: 2,
            username: "Bob".to_string(),
            message: "hello".to_string(),
            timestamp: 1700000000000,
        });
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert_eq!(value["type"], "chat_message");
        assert_eq!(value["id"], 1);
        assert_eq!(value["user_id"], 2);
        assert_eq!(value["username"], "Bob");
        assert_eq!(value["message"], "hello");
    }

    #[test]
    fn room_joined_frame_uses_snake_case_tag() {
        let frame = ServerMessage::RoomJoined {
            room_code: Arc::from("ABC"),
            room_name: "Sala de Alice".to_string(),
            video_id: Some("vX".to_string()),
            is_host: true,
            host_username: "Alice".to_string(),
            current_time: 0.0,
            is_playing: false,
            max_participants: 10,
            timestamp: 0,
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert_eq!(value["type"], "room_joined");
        assert_eq!(value["room_code"], "ABC");
        assert_eq!(value["is_host"], true);
    }

    #[test]
    fn private_message_omits_missing_store_id() {
        let frame = ServerMessage::PrivateMessage {
            id: None,
            from: 7,
            from_username: "Carla".to_string(),
            message: "hola".to_string(),
            timestamp: 5,
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert!(value.get("id").is_none());
        assert_eq!(value["type"], "private_message");
    }
}
