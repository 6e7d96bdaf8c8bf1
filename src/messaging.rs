use serde::{Deserialize, Serialize};

use crate::kernel::event::{ActiveTrack, ListeningRecord};
use crate::store::DayStats;

/// Requests accepted from the embedding surface (popup, background worker,
/// stdin). Tagged by `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Request {
    UpdateToken {
        token: String,
        #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    ClearSession,
    UpdateDevMode {
        enabled: bool,
    },
    GetServerUrl,
    UpdateEarnings {
        #[serde(default)]
        count: usize,
    },
    CloseTab,
    GetTrackHistory,
    SetDebugMode {
        enabled: bool,
    },
    CheckConnection,
    ForceCheckState,
    #[serde(rename = "logDOMState")]
    LogDomState,
    ResetState,
    ClearHistory,
    SyncPendingTracks,
}

impl Request {
    pub fn action(&self) -> &'static str {
        match self {
            Request::UpdateToken { .. } => "updateToken",
            Request::ClearSession => "clearSession",
            Request::UpdateDevMode { .. } => "updateDevMode",
            Request::GetServerUrl => "getServerUrl",
            Request::UpdateEarnings { .. } => "updateEarnings",
            Request::CloseTab => "closeTab",
            Request::GetTrackHistory => "getTrackHistory",
            Request::SetDebugMode { .. } => "setDebugMode",
            Request::CheckConnection => "checkConnection",
            Request::ForceCheckState => "forceCheckState",
            Request::LogDomState => "logDOMState",
            Request::ResetState => "resetState",
            Request::ClearHistory => "clearHistory",
            Request::SyncPendingTracks => "syncPendingTracks",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Checking,
    Logging,
    Reset,
    Cleared,
    Syncing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackHistoryResponse {
    pub track_history: Vec<ListeningRecord>,
    pub today_stats: DayStats,
    pub is_playing: bool,
    pub current_track: Option<ActiveTrack>,
    pub playback_start_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    ServerUrl {
        #[serde(rename = "serverUrl")]
        server_url: String,
    },
    TrackHistory(Box<TrackHistoryResponse>),
    Status { status: Status },
    Error { error: String },
}

impl Response {
    pub fn status(status: Status) -> Self {
        Response::Status { status }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error { error: message.into() }
    }
}
