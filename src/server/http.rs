use actix::{Actor, Addr};
use actix_web::{
    web::{get, Data, Payload, Query},
    App, HttpRequest, HttpResponse, HttpServer,
};
use actix_web_actors::ws;
use serde::Deserialize;
use std::sync::Arc;

use crate::chat::actor::ChatSession;
use crate::chat::{ChatServer, OnlineCount};
use crate::config::Config;
use crate::room::{PublicRoomList, PublicRooms, RoomCode, RoomManager, Stats};
use crate::session::actor::Session;
use crate::session::{Reject, UserId, DEFAULT_USERNAME};
use crate::store::{self, Store};

const CORS_ALLOW_ALL: (&str, &str) = ("Access-Control-Allow-Origin", "*");

pub struct AppState {
    pub rooms: Addr<RoomManager>,
    pub chat: Addr<ChatServer>,
    pub store: Addr<Store>,
}

#[derive(Deserialize)]
struct WatchQuery {
    room: Option<String>,
    user: Option<String>,
    username: Option<String>,
}

#[derive(Deserialize)]
struct ChatQuery {
    user: Option<String>,
    username: Option<String>,
}

/// Query values arrive percent-decoded from the extractor. A missing or
/// unusable identity still completes the websocket handshake, then closes
/// with a policy-violation code and a readable reason.
fn parse_user(raw: Option<&str>) -> Result<UserId, &'static str> {
    let raw = raw.ok_or("Falta el parámetro user")?;
    raw.trim().parse().map_err(|_| "Parámetro user inválido")
}

async fn watch_party(
    req: HttpRequest,
    payload: Payload,
    state: Data<AppState>,
    query: Query<WatchQuery>,
) -> actix_web::Result<HttpResponse> {
    let query = query.into_inner();
    let user_id = match parse_user(query.user.as_deref()) {
        Ok(user_id) => user_id,
        Err(reason) => return ws::start(Reject::new(reason), &req, payload),
    };
    let Some(room) = query.room.filter(|room| !room.trim().is_empty()) else {
        return ws::start(Reject::new("Falta el parámetro room"), &req, payload);
    };
    let room_code: RoomCode = Arc::from(room.trim().to_uppercase());
    let username = query
        .username
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_USERNAME.to_string());
    ws::start(
        Session::new(user_id, username, room_code, state.rooms.clone()),
        &req,
        payload,
    )
}

async fn chat(
    req: HttpRequest,
    payload: Payload,
    state: Data<AppState>,
    query: Query<ChatQuery>,
) -> actix_web::Result<HttpResponse> {
    let query = query.into_inner();
    let user_id = match parse_user(query.user.as_deref()) {
        Ok(user_id) => user_id,
        Err(reason) => return ws::start(Reject::new(reason), &req, payload),
    };
    let username = query
        .username
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_USERNAME.to_string());
    ws::start(
        ChatSession::new(user_id, username, state.chat.clone(), state.store.clone()),
        &req,
        payload,
    )
}

async fn health(state: Data<AppState>) -> HttpResponse {
    let stats = state.rooms.send(Stats).await;
    let online = state.chat.send(OnlineCount).await;
    match (stats, online) {
        (Ok(stats), Ok(online)) => HttpResponse::Ok().insert_header(CORS_ALLOW_ALL).json(
            serde_json::json!({
                "status": "ok",
                "rooms": stats.rooms,
                "connections": stats.connections,
                "online": online,
            }),
        ),
        (stats, online) => {
            log::error!("health check failed: rooms={:?} chat={:?}", stats.is_err(), online.is_err());
            HttpResponse::InternalServerError().json(serde_json::json!({ "status": "error" }))
        }
    }
}

async fn public_rooms(state: Data<AppState>) -> HttpResponse {
    match state.rooms.send(PublicRooms).await {
        Ok(PublicRoomList(rooms)) => HttpResponse::Ok()
            .insert_header(CORS_ALLOW_ALL)
            .json(serde_json::json!({ "success": true, "rooms": rooms })),
        Err(err) => {
            log::error!("public rooms listing failed: {err}");
            HttpResponse::InternalServerError()
                .json(serde_json::json!({ "success": false, "rooms": [] }))
        }
    }
}

pub async fn start() -> std::io::Result<()> {
    let config = Config::from_env();
    if let Some(parent) = std::path::Path::new(&config.database_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let store = store::start(config.database_path.clone()).map_err(|err| {
        std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("failed to open store at {}: {err}", config.database_path),
        )
    })?;
    let rooms = RoomManager::new(store.clone()).start();
    let chat_server = ChatServer::new(store.clone()).start();
    let state = Data::new(AppState {
        rooms,
        chat: chat_server,
        store,
    });
    log::info!("listening on {}:{}", config.host, config.port);
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/watch-party", get().to(watch_party))
            .route("/chat", get().to(chat))
            .route("/health", get().to(health))
            .route("/public-rooms", get().to(public_rooms))
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test as aweb_test;
    use awc::ws::{CloseCode as WsCloseCode, Frame, Message as WsMessage};
    use futures_util::{SinkExt as _, Stream, StreamExt as _};

    use crate::store::{InsertDirectMessage, SetOnline};

    fn test_state() -> Data<AppState> {
        let store = store::start_in_memory();
        let rooms = RoomManager::new(store.clone()).start();
        let chat = ChatServer::new(store.clone()).start();
        Data::new(AppState { rooms, chat, store })
    }

    fn spawn_server(state: Data<AppState>) -> actix_test::TestServer {
        actix_test::start(move || {
            App::new()
                .app_data(state.clone())
                .route("/watch-party", get().to(watch_party))
                .route("/chat", get().to(chat))
        })
    }

    /// Next text frame as JSON, skipping transport pings.
    async fn next_json<S>(ws: &mut S) -> serde_json::Value
    where
        S: Stream<Item = Result<Frame, awc::error::WsProtocolError>> + Unpin,
    {
        loop {
            match ws.next().await.expect("connection closed early").unwrap() {
                Frame::Text(bytes) => return serde_json::from_slice(&bytes).unwrap(),
                Frame::Ping(_) | Frame::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[test]
    fn parse_user_validates_presence_and_digits() {
        assert_eq!(parse_user(Some("7")), Ok(7));
        assert_eq!(parse_user(Some(" 7 ")), Ok(7));
        assert_eq!(parse_user(None), Err("Falta el parámetro user"));
        assert_eq!(parse_user(Some("alice")), Err("Parámetro user inválido"));
        assert_eq!(parse_user(Some("")), Err("Parámetro user inválido"));
    }

    #[actix_rt::test]
    async fn missing_user_closes_with_policy_violation() {
        let mut srv = spawn_server(test_state());
        let mut ws = srv.ws_at("/watch-party?username=Alice").await.unwrap();
        match ws.next().await.unwrap().unwrap() {
            Frame::Close(Some(reason)) => {
                assert_eq!(reason.code, WsCloseCode::Policy);
                assert_eq!(reason.description.as_deref(), Some("Falta el parámetro user"));
            }
            other => panic!("expected policy close, got {other:?}"),
        }
    }

    #[actix_rt::test]
    async fn watch_session_survives_bad_frames() {
        let mut srv = spawn_server(test_state());
        let mut ws = srv
            .ws_at("/watch-party?room=abc&user=1&username=Alice")
            .await
            .unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "connected");

        ws.send(WsMessage::Text("not json".into())).await.unwrap();
        let error = next_json(&mut ws).await;
        assert_eq!(error["type"], "error");
        assert_eq!(error["message"], "JSON inválido");

        // Unknown types are dropped without a reply; the session stays up,
        // so the next answered frame is the pong.
        ws.send(WsMessage::Text(r#"{"type":"dance"}"#.into()))
            .await
            .unwrap();
        ws.send(WsMessage::Text(r#"{"type":"ping"}"#.into()))
            .await
            .unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "pong");
    }

    #[actix_rt::test]
    async fn chat_session_flags_known_frames_with_bad_fields() {
        let mut srv = spawn_server(test_state());
        let mut ws = srv.ws_at("/chat?user=1&username=Alice").await.unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "connected");

        ws.send(WsMessage::Text(r#"{"type":"private_message"}"#.into()))
            .await
            .unwrap();
        let error = next_json(&mut ws).await;
        assert_eq!(error["type"], "error");
        assert_eq!(error["message"], "Mensaje inválido");

        ws.send(WsMessage::Text("{{{".into())).await.unwrap();
        let error = next_json(&mut ws).await;
        assert_eq!(error["type"], "error");
        assert_eq!(error["message"], "JSON inválido");
    }

    #[actix_rt::test]
    async fn unread_replay_delivers_once_newest_first() {
        let state = test_state();
        let store = state.store.clone();
        store
            .send(SetOnline {
                user_id: 1,
                username: "Alice".to_string(),
                online: false,
            })
            .await
            .unwrap();
        let first = store
            .send(InsertDirectMessage {
                sender_id: 1,
                receiver_id: 2,
                message: "m1".to_string(),
            })
            .await
            .unwrap()
            .unwrap();
        let second = store
            .send(InsertDirectMessage {
                sender_id: 1,
                receiver_id: 2,
                message: "m2".to_string(),
            })
            .await
            .unwrap()
            .unwrap();

        let mut srv = spawn_server(state);
        let mut ws = srv.ws_at("/chat?user=2&username=Bob").await.unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "connected");
        let newest = next_json(&mut ws).await;
        assert_eq!(newest["type"], "private_message");
        assert_eq!(newest["id"], second);
        assert_eq!(newest["message"], "m2");
        assert_eq!(newest["from_username"], "Alice");
        let older = next_json(&mut ws).await;
        assert_eq!(older["id"], first);
        assert_eq!(older["message"], "m1");
        assert!(older["timestamp"].as_i64().unwrap() <= newest["timestamp"].as_i64().unwrap());
        drop(ws);

        // The replay marked both rows read, so a reconnect delivers nothing:
        // the next frame after connected is the answered pong.
        let mut ws = srv.ws_at("/chat?user=2&username=Bob").await.unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "connected");
        ws.send(WsMessage::Text(r#"{"type":"ping"}"#.into()))
            .await
            .unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "pong");
    }

    #[actix_rt::test]
    async fn health_reports_gauges() {
        let app = aweb_test::init_service(
            App::new()
                .app_data(test_state())
                .route("/health", get().to(health)),
        )
        .await;
        let resp =
            aweb_test::call_service(&app, aweb_test::TestRequest::get().uri("/health").to_request()).await;
        assert!(resp.status().is_success());
        let body: serde_json::Value = aweb_test::read_body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["rooms"], 0);
        assert_eq!(body["connections"], 0);
        assert_eq!(body["online"], 0);
    }

    #[actix_rt::test]
    async fn public_rooms_is_empty_and_cors_open() {
        let app = aweb_test::init_service(
            App::new()
                .app_data(test_state())
                .route("/public-rooms", get().to(public_rooms)),
        )
        .await;
        let resp = aweb_test::call_service(
            &app,
            aweb_test::TestRequest::get().uri("/public-rooms").to_request(),
        )
        .await;
        assert!(resp.status().is_success());
        assert_eq!(
            resp.headers()
                .get("Access-Control-Allow-Origin")
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );
        let body: serde_json::Value = aweb_test::read_body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["rooms"].as_array().unwrap().len(), 0);
    }
}
