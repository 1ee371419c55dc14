use std::collections::HashMap;
use std::path::PathBuf;

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, Request, State,
    },
    handler::HandlerWithoutStateExt,
    http::{header, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use relay_common::{
    ClientEvent, LedResponse, OkResponse, PostLogRequest, PushEvent, SetLedRequest,
    SetLedResponse, ROUTE_GET, ROUTE_LOG, ROUTE_LOGS, ROUTE_SET, ROUTE_STATUS, ROUTE_WS,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};
use tracing::{debug, info, warn};

use crate::relay::Relay;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn default_web_root() -> PathBuf {
    PathBuf::from(format!("{}/web", env!("CARGO_MANIFEST_DIR")))
}

pub fn router(relay: Relay, web_root: PathBuf) -> Router {
    let dashboard = ServeDir::new(web_root)
        .call_fallback_on_method_not_allowed(true)
        .not_found_service(handle_not_found.into_service());

    Router::new()
        .route(ROUTE_SET, post(handle_set_led))
        .route(ROUTE_GET, get(handle_get_led))
        .route(ROUTE_LOG, post(handle_post_log))
        .route(ROUTE_LOGS, get(handle_get_logs))
        .route(ROUTE_STATUS, get(handle_get_status))
        .route(ROUTE_WS, get(handle_ws_upgrade))
        .method_not_allowed_fallback(handle_method_not_allowed)
        .fallback_service(dashboard)
        .layer(middleware::from_fn(answer_options))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE]),
        )
        .with_state(relay)
}

async fn handle_set_led(
    State(relay): State<Relay>,
    payload: Result<Json<SetLedRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_body("state", &rejection),
    };

    match relay.set_led(&request.state, Utc::now()).await {
        Ok(state) => Json(SetLedResponse { ok: true, state }).into_response(),
        Err(err) => {
            warn!("failed to set led state: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to update led state")
        }
    }
}

async fn handle_get_led(State(relay): State<Relay>) -> Response {
    match relay.get_led(Utc::now()).await {
        Ok(led) => Json(LedResponse { led }).into_response(),
        Err(err) => {
            warn!("failed to read led state: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read led state")
        }
    }
}

async fn handle_post_log(
    State(relay): State<Relay>,
    payload: Result<Json<PostLogRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_body("msg", &rejection),
    };

    match relay.post_log(&request.msg, Utc::now()).await {
        Ok(_) => Json(OkResponse { ok: true }).into_response(),
        Err(err) => {
            warn!("failed to append device log: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store log entry")
        }
    }
}

async fn handle_get_logs(
    State(relay): State<Relay>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let limit = match params.get("limit") {
        None => None,
        Some(value) => match value.parse::<usize>() {
            Ok(limit) => Some(limit),
            Err(_) => return error_response(StatusCode::BAD_REQUEST, "Invalid 'limit' parameter"),
        },
    };

    match relay.logs(limit).await {
        Ok(logs) => Json(logs).into_response(),
        Err(err) => {
            warn!("failed to read logs: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read logs")
        }
    }
}

async fn handle_get_status(State(relay): State<Relay>) -> Response {
    match relay.status(Utc::now()).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => {
            warn!("failed to derive status: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read status")
        }
    }
}

async fn handle_ws_upgrade(State(relay): State<Relay>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, relay))
}

async fn handle_ws_connection(socket: WebSocket, relay: Relay) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before the snapshot so nothing published in between is lost.
    let mut events = relay.subscribe();
    info!(observers = relay.observer_count(), "Push observer connected");

    let snapshot = match relay.connect_snapshot(Utc::now()).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!("failed to build connect snapshot: {err}");
            return;
        }
    };
    for event in &snapshot {
        if send_event(&mut sender, event).await.is_err() {
            debug!("Failed to send connect snapshot, client disconnected");
            return;
        }
    }

    loop {
        tokio::select! {
            result = events.recv() => {
                match result {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            debug!("Failed to push event, client disconnected");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Push observer lagged, catching up");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if ClientEvent::parse(text.as_str()) != Some(ClientEvent::Refresh) {
                            debug!("Ignoring unknown push channel message");
                            continue;
                        }
                        match relay.status(Utc::now()).await {
                            Ok(status) => {
                                if send_event(&mut sender, &PushEvent::Status(status)).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => warn!("failed to derive status for refresh: {err}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Client closed push channel");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket receive error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    info!(
        observers = relay.observer_count().saturating_sub(1),
        "Push observer disconnected"
    );
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &PushEvent,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).map_err(axum::Error::new)?;
    sender.send(Message::Text(json.into())).await
}

/// Any OPTIONS request is a successful no-op; CORS headers are added outside.
async fn answer_options(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }
    next.run(request).await
}

async fn handle_not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn handle_method_not_allowed() -> Response {
    error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
}

fn bad_body(field: &str, rejection: &JsonRejection) -> Response {
    debug!(field, "rejected request body: {}", rejection.body_text());
    error_response(
        StatusCode::BAD_REQUEST,
        &format!("Missing or invalid '{field}': {}", rejection.body_text()),
    )
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::HeaderMap;
    use relay_common::{LogSource, RelayConfig};
    use serde_json::{json, Value};
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tower::ServiceExt;

    use super::*;
    use crate::store::Store;

    fn relay() -> Relay {
        Relay::new(Store::in_memory(500), RelayConfig::default())
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, HeaderMap, Value) {
        let mut request = axum::http::Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };

        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::String(
                String::from_utf8_lossy(&bytes).into_owned(),
            ))
        };
        (status, headers, value)
    }

    #[tokio::test]
    async fn set_then_get_then_logs() {
        let app = router(relay(), default_web_root());

        let (status, _, body) =
            call(&app, Method::POST, "/set", Some(json!({ "state": "on" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true, "state": "on" }));

        let (status, _, body) = call(&app, Method::GET, "/get", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "led": "on" }));

        let (_, _, body) = call(&app, Method::GET, "/logs", None).await;
        let last = body.as_array().unwrap().last().unwrap().clone();
        assert_eq!(last["source"], "WEB");
        let msg = last["msg"].as_str().unwrap();
        assert!(msg.contains("off") && msg.contains("on"));
    }

    #[tokio::test]
    async fn device_log_appears_in_logs() {
        let app = router(relay(), default_web_root());

        let (status, _, body) =
            call(&app, Method::POST, "/log", Some(json!({ "msg": "boot" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true }));

        let (_, _, body) = call(&app, Method::GET, "/logs", None).await;
        let entries = body.as_array().unwrap();
        assert!(entries
            .iter()
            .any(|entry| entry["source"] == "ESP" && entry["msg"] == "boot"));
    }

    #[tokio::test]
    async fn status_reflects_device_polls() {
        let app = router(relay(), default_web_root());

        let (status, _, body) = call(&app, Method::GET, "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["online"], false);
        assert_eq!(body["ledState"], "off");
        assert_eq!(body["lastSeen"], Value::Null);
        assert!(body["serverTime"].is_string());

        call(&app, Method::GET, "/get", None).await;
        let (_, _, body) = call(&app, Method::GET, "/status", None).await;
        assert_eq!(body["online"], true);
        assert!(body["lastSeen"].is_string());
    }

    #[tokio::test]
    async fn logs_limit_is_applied() {
        let app = router(relay(), default_web_root());
        for msg in ["a", "b", "c"] {
            call(&app, Method::POST, "/log", Some(json!({ "msg": msg }))).await;
        }

        let (_, _, body) = call(&app, Method::GET, "/logs?limit=2", None).await;
        let messages: Vec<_> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["msg"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(messages, vec!["b", "c"]);

        let (status, _, body) = call(&app, Method::GET, "/logs?limit=lots", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn options_is_an_empty_ok_with_cors() {
        let app = router(relay(), default_web_root());

        let (status, headers, body) = call(&app, Method::OPTIONS, "/set", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Null);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[tokio::test]
    async fn preflight_allows_content_type() {
        let app = router(relay(), default_web_root());
        let request = axum::http::Request::builder()
            .method(Method::OPTIONS)
            .uri("/set")
            .header(header::ORIGIN, "http://dashboard.local")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let allowed = response.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS]
            .to_str()
            .unwrap()
            .to_ascii_lowercase();
        assert!(allowed.contains("content-type"));
    }

    #[tokio::test]
    async fn responses_carry_cors_origin() {
        let app = router(relay(), default_web_root());

        let (_, headers, _) = call(&app, Method::GET, "/get", None).await;
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[tokio::test]
    async fn unmatched_route_is_json_not_found() {
        let app = router(relay(), default_web_root());

        let (status, _, body) = call(&app, Method::GET, "/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "error": "Not found" }));

        let (status, _, body) = call(&app, Method::POST, "/nope", Some(json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "error": "Not found" }));
    }

    #[tokio::test]
    async fn wrong_method_is_rejected() {
        let app = router(relay(), default_web_root());

        let (status, _, body) = call(&app, Method::POST, "/get", None).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body, json!({ "error": "Method not allowed" }));
    }

    #[tokio::test]
    async fn malformed_body_is_a_bad_request() {
        let app = router(relay(), default_web_root());

        let (status, _, body) = call(&app, Method::POST, "/set", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("'state'"));

        let (status, _, body) =
            call(&app, Method::POST, "/log", Some(json!({ "msg": 42 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("'msg'"));

        let (_, _, body) = call(&app, Method::GET, "/get", None).await;
        assert_eq!(body, json!({ "led": "off" }));
    }

    #[tokio::test]
    async fn failed_store_write_is_a_server_error() {
        let dir = std::env::temp_dir().join(format!("led-relay-http-500-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let store = Store::open(&dir, 500).await.unwrap();
        let app = router(Relay::new(store, RelayConfig::default()), default_web_root());

        // A plain file where the data directory should be makes every write fail.
        std::fs::write(&dir, "not a directory").unwrap();

        let (status, _, body) =
            call(&app, Method::POST, "/set", Some(json!({ "state": "on" }))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({ "error": "Failed to update led state" }));

        let (status, _, body) =
            call(&app, Method::POST, "/log", Some(json!({ "msg": "boot" }))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({ "error": "Failed to store log entry" }));

        let _ = std::fs::remove_file(&dir);
    }

    #[tokio::test]
    async fn root_serves_dashboard() {
        let app = router(relay(), default_web_root());
        let request = axum::http::Request::builder()
            .uri("/")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("<html"));
    }

    async fn next_event<S>(ws: &mut S) -> PushEvent
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("push event timed out")
            .expect("push channel closed")
            .expect("push channel error");
        serde_json::from_str(message.to_text().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn push_observer_gets_snapshot_refresh_and_live_events() {
        let relay = relay();
        relay
            .record(LogSource::Srv, "Server started", Utc::now())
            .await
            .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(relay.clone(), default_web_root());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();

        assert!(matches!(next_event(&mut ws).await, PushEvent::Status(s) if !s.online));
        assert!(matches!(
            next_event(&mut ws).await,
            PushEvent::Logs(logs) if logs.len() == 1 && logs[0].msg == "Server started"
        ));

        ws.send(WsMessage::Text("refresh".into())).await.unwrap();
        assert!(matches!(next_event(&mut ws).await, PushEvent::Status(_)));

        relay.post_log("boot", Utc::now()).await.unwrap();
        assert!(matches!(
            next_event(&mut ws).await,
            PushEvent::Logs(logs) if logs.last().map(|entry| entry.msg.as_str()) == Some("boot")
        ));
        assert!(matches!(next_event(&mut ws).await, PushEvent::Status(s) if s.online));
    }
}
