use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use odo::kernel::event::{ActiveTrack, EventNotification, EventType, ListeningRecord};
use odo::services::api::{ApiClient, ApiError, Credentials, DeviceInfo, ListeningSubmission};

#[derive(Debug, Clone)]
struct Call {
    path: String,
    auth: Option<String>,
    session: Option<String>,
    body: Value,
}

#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Recorder {
    fn push(&self, path: &str, headers: &HeaderMap, body: Value) {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
        self.calls.lock().unwrap().push(Call {
            path: path.to_string(),
            auth: header("authorization"),
            session: header("x-session-id"),
            body,
        });
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

async fn on_event(State(rec): State<Recorder>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    rec.push("/api/listening/event", &headers, body);
    Json(json!({"ok": true}))
}

async fn on_submit(State(rec): State<Recorder>, headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let failing = body["youtube_id"] == "bad";
    rec.push("/api/listening", &headers, body);
    if failing {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "boom"})))
    } else {
        (StatusCode::OK, Json(json!({"history_id": 77})))
    }
}

async fn on_session(State(rec): State<Recorder>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    rec.push("/api/extention/session", &headers, body);
    Json(json!({"sessionId": "s-1"}))
}

async fn on_verify(Path(id): Path<String>) -> Json<Value> {
    Json(json!({"inPlaylist": id == "good"}))
}

async fn on_recommended() -> Json<Value> {
    Json(json!({"playlists": [{"youtube_playlist_id": "PLrec", "title": "Rec"}]}))
}

async fn on_root() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn expired() -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "session_expired", "message": "Logged in elsewhere", "ip_conflict": true})),
    )
}

async fn unauthorized() -> (StatusCode, Json<Value>) {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid_token"})))
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn happy_server() -> (String, Recorder) {
    let rec = Recorder::default();
    let router = Router::new()
        .route("/api", get(on_root))
        .route("/api/listening/event", post(on_event))
        .route("/api/listening", post(on_submit))
        .route("/api/extention/session", post(on_session))
        .route("/api/track/verify/:id", get(on_verify))
        .route("/api/playlists/recommended", get(on_recommended))
        .with_state(rec.clone());
    (serve(router).await, rec)
}

fn client(base: &str) -> ApiClient {
    ApiClient::new(base, Duration::from_secs(5))
}

fn creds(session: Option<&str>) -> Credentials {
    Credentials {
        token: "tok".to_string(),
        session_id: session.map(str::to_string),
    }
}

fn record(id: &str) -> ListeningRecord {
    let started_at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
    ListeningRecord {
        track: ActiveTrack {
            external_id: id.to_string(),
            title: "Title".to_string(),
            artist: "Artist".to_string(),
            playlist_id: Some("PL1".to_string()),
            started_at,
            url: String::new(),
            duration_seconds: Some(200),
        },
        actual_duration_seconds: 61.5,
        ended_at_iso: "2024-05-01T09:01:01.500Z".to_string(),
        is_complete: false,
        history_id: None,
        record_id: Some(format!("odo-x-{}-1714554000000", id)),
    }
}

fn event(event_type: EventType) -> EventNotification {
    EventNotification {
        youtube_track_id: "vidA".to_string(),
        youtube_playlist_id: None,
        title: "Title".to_string(),
        artist: "Artist".to_string(),
        event_type,
        track_position_seconds: 12,
        duration_seconds: 30,
        player_timestamp: "2024-05-01T09:00:30.000Z".to_string(),
        history_id: None,
        url: "https://music.youtube.com/watch?v=vidA".to_string(),
    }
}

#[tokio::test]
async fn test_event_carries_auth_headers_and_body() {
    let (base, rec) = happy_server().await;
    client(&base).post_event(&creds(Some("sess")), &event(EventType::Pause)).await.unwrap();

    let calls = rec.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].auth.as_deref(), Some("Bearer tok"));
    assert_eq!(calls[0].session.as_deref(), Some("sess"));
    assert_eq!(calls[0].body["event_type"], "pause");
    assert_eq!(calls[0].body["track_position_seconds"], 12);
    assert!(calls[0].body.get("history_id").is_none());
}

#[tokio::test]
async fn test_session_header_omitted_without_session() {
    let (base, rec) = happy_server().await;
    client(&base).post_event(&creds(None), &event(EventType::Start)).await.unwrap();
    assert_eq!(rec.calls()[0].session, None);
}

#[tokio::test]
async fn test_beacon_sends_no_headers() {
    let (base, rec) = happy_server().await;
    client(&base).send_beacon(&event(EventType::Close)).await.unwrap();
    let calls = rec.calls();
    assert_eq!(calls[0].auth, None);
    assert_eq!(calls[0].session, None);
    assert_eq!(calls[0].body["event_type"], "close");
}

#[tokio::test]
async fn test_submission_returns_history_id() {
    let (base, rec) = happy_server().await;
    let r = record("vidA");
    let submission = ListeningSubmission::from_record(&r, r.record_id.as_deref().unwrap());
    let id = client(&base).submit_listening(&creds(None), &submission).await.unwrap();
    assert_eq!(id.as_deref(), Some("77"));

    let body = &rec.calls()[0].body;
    assert_eq!(body["youtube_id"], "vidA");
    assert_eq!(body["play_start_time"], "2024-05-01T09:00:00.000Z");
    assert_eq!(body["actual_duration_seconds"], 61.5);
    assert_eq!(body["youtube_playlist_id"], "PL1");
    assert_eq!(body["client_id"], "odo-x-vidA-1714554000000");
}

#[tokio::test]
async fn test_create_session() {
    let (base, rec) = happy_server().await;
    let device = DeviceInfo {
        screen_width: 1920,
        screen_height: 1080,
        user_agent: "test".to_string(),
        platform: "linux".to_string(),
        language: "en-US".to_string(),
    };
    let id = client(&base).create_session("tok", &device).await.unwrap();
    assert_eq!(id, "s-1");

    let call = &rec.calls()[0];
    assert_eq!(call.auth.as_deref(), Some("Bearer tok"));
    assert_eq!(call.body["device_info"]["screenWidth"], 1920);
}

#[tokio::test]
async fn test_track_verification_and_recommendation() {
    let (base, _rec) = happy_server().await;
    let api = client(&base);
    assert!(api.verify_track(&creds(None), "good").await.unwrap());
    assert!(!api.verify_track(&creds(None), "bad").await.unwrap());

    let playlist = api.recommended_playlist(&creds(None)).await.unwrap().unwrap();
    assert_eq!(playlist.url(), "https://music.youtube.com/playlist?list=PLrec");
}

#[tokio::test]
async fn test_connection_check() {
    let (base, _rec) = happy_server().await;
    let body = client(&base).test_connection().await.unwrap();
    assert_eq!(body["status"], "ok");

    let err = client("http://127.0.0.1:1").test_connection().await.unwrap_err();
    assert!(matches!(err, ApiError::Network(_)));
}

#[tokio::test]
async fn test_session_expiry_is_recognized() {
    let base = serve(Router::new().fallback(expired)).await;
    let err = client(&base)
        .post_event(&creds(Some("sess")), &event(EventType::Update))
        .await
        .unwrap_err();
    match err {
        ApiError::SessionExpired { message, ip_conflict } => {
            assert_eq!(message, "Logged in elsewhere");
            assert!(ip_conflict);
        }
        other => panic!("expected session expiry, got {:?}", other),
    }
}

#[tokio::test]
async fn test_other_unauthorized_is_a_status_error() {
    let base = serve(Router::new().fallback(unauthorized)).await;
    let err = client(&base)
        .post_event(&creds(None), &event(EventType::Update))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Status(401)));
    assert!(!err.is_session_expired());
}

#[tokio::test]
async fn test_pending_sync_keeps_failures() {
    let (base, rec) = happy_server().await;
    let pending = vec![record("a"), record("bad"), record("c")];
    let report = client(&base).sync_pending(&creds(None), &pending, "odo-x").await;

    assert_eq!(report.delivered, vec![record("a").key(), record("c").key()]);
    assert_eq!(report.remaining, 1);
    assert!(!report.stopped_by_auth);
    assert_eq!(rec.calls().len(), 3);
}

#[tokio::test]
async fn test_pending_sync_stops_on_auth_failure() {
    let base = serve(Router::new().fallback(expired)).await;
    let pending = vec![record("a"), record("b")];
    let report = client(&base).sync_pending(&creds(None), &pending, "odo-x").await;
    assert!(report.delivered.is_empty());
    assert_eq!(report.remaining, 2);
    assert!(report.stopped_by_auth);
}
