use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kernel::event::ListeningRecord;
use crate::kernel::time::iso;

/// Bearer token plus the optional `X-Session-ID`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub session_id: Option<String>,
}

/// Body of `POST /api/listening`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListeningSubmission {
    pub youtube_id: String,
    pub title: String,
    pub artist: String,
    pub duration_seconds: u64,
    pub play_start_time: String,
    pub play_end_time: String,
    pub actual_duration_seconds: f64,
    pub is_complete: bool,
    pub youtube_playlist_id: Option<String>,
    pub client_id: String,
}

impl ListeningSubmission {
    pub fn from_record(record: &ListeningRecord, record_id: &str) -> Self {
        Self {
            youtube_id: record.track.external_id.clone(),
            title: record.track.title.clone(),
            artist: record.track.artist.clone(),
            duration_seconds: record.track.duration_seconds.unwrap_or(0),
            play_start_time: iso(record.track.started_at),
            play_end_time: record.ended_at_iso.clone(),
            actual_duration_seconds: record.actual_duration_seconds,
            is_complete: record.is_complete,
            youtube_playlist_id: record.track.playlist_id.clone(),
            client_id: record_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitResponse {
    #[serde(default)]
    pub history_id: Option<Value>,
}

impl SubmitResponse {
    /// The server may send the id as a number or a string.
    pub fn history_id(&self) -> Option<String> {
        match self.history_id.as_ref()? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Device fingerprint sent when opening a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub screen_width: u32,
    pub screen_height: u32,
    pub user_agent: String,
    pub platform: String,
    pub language: String,
}

impl DeviceInfo {
    /// Fingerprint of the host this process runs on.
    pub fn current() -> Self {
        let language = std::env::var("LANG")
            .ok()
            .and_then(|l| l.split('.').next().map(|s| s.replace('_', "-")))
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| "en-US".to_string());
        Self {
            screen_width: 0,
            screen_height: 0,
            user_agent: format!("odo/{}", env!("CARGO_PKG_VERSION")),
            platform: std::env::consts::OS.to_string(),
            language,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SessionRequest<'a> {
    pub device_info: &'a DeviceInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SessionResponse {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct VerifyResponse {
    #[serde(rename = "inPlaylist", default)]
    pub in_playlist: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendedPlaylist {
    pub youtube_playlist_id: String,
    #[serde(default)]
    pub title: String,
}

impl RecommendedPlaylist {
    pub fn url(&self) -> String {
        format!("https://music.youtube.com/playlist?list={}", self.youtube_playlist_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RecommendedResponse {
    #[serde(default)]
    pub playlists: Vec<RecommendedPlaylist>,
}

/// Error body the server sends with a 401.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub ip_conflict: Option<bool>,
}
