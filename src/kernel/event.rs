use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::time::iso;

pub const UNKNOWN_TRACK: &str = "unknown track";
pub const UNKNOWN_ARTIST: &str = "unknown artist";

/// One detection pass's view of the now-playing track. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub title: String,
    pub artist: String,
    pub external_id: String,
    pub playlist_id: Option<String>,
}

impl TrackSnapshot {
    /// Title+artist key used to tell tracks apart across cycles.
    pub fn identity(&self) -> String {
        track_identity(&self.title, &self.artist)
    }

    /// False for a detection miss: empty title or the unknown-track sentinel.
    pub fn has_title(&self) -> bool {
        !self.title.trim().is_empty() && self.title != UNKNOWN_TRACK
    }

    pub fn artist_unknown(&self) -> bool {
        is_unknown_artist(&self.artist)
    }
}

pub fn track_identity(title: &str, artist: &str) -> String {
    format!("{}-{}", title, artist)
}

pub fn is_unknown_artist(artist: &str) -> bool {
    artist.trim().is_empty() || artist == UNKNOWN_ARTIST
}

/// What the page's media element reports, when there is one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct MediaState {
    pub current_time: f64,
    /// `None` while the element has not loaded metadata yet.
    pub duration: Option<f64>,
    pub paused: bool,
}

impl MediaState {
    pub fn position_secs(&self) -> u64 {
        whole_secs(self.current_time)
    }

    pub fn duration_secs(&self) -> Option<u64> {
        self.duration.filter(|d| d.is_finite() && *d > 0.0).map(whole_secs)
    }
}

pub(crate) fn whole_secs(v: f64) -> u64 {
    if v.is_finite() && v > 0.0 {
        v.floor() as u64
    } else {
        0
    }
}

/// Input of one check cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub snapshot: TrackSnapshot,
    /// Independently observed play/pause flag.
    pub is_playing: bool,
    pub media: Option<MediaState>,
    pub url: String,
}

/// The track the tracker currently considers playing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTrack {
    pub external_id: String,
    pub title: String,
    pub artist: String,
    pub playlist_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub url: String,
    pub duration_seconds: Option<u64>,
}

impl ActiveTrack {
    pub fn from_snapshot(
        snapshot: &TrackSnapshot,
        started_at: DateTime<Utc>,
        url: &str,
        media: Option<&MediaState>,
    ) -> Self {
        Self {
            external_id: snapshot.external_id.clone(),
            title: snapshot.title.clone(),
            artist: snapshot.artist.clone(),
            playlist_id: snapshot.playlist_id.clone(),
            started_at,
            url: url.to_string(),
            duration_seconds: media.and_then(|m| m.duration_secs()),
        }
    }

    pub fn identity(&self) -> String {
        track_identity(&self.title, &self.artist)
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            external_id: self.external_id.clone(),
            started_at: iso(self.started_at),
        }
    }
}

/// Accrued-time checkpoint held while a track is paused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PausedSnapshot {
    pub track_identity: String,
    pub track: ActiveTrack,
    pub accumulated_play_seconds: f64,
    pub paused_at_iso: String,
}

/// The finalized outcome of one playback session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListeningRecord {
    #[serde(flatten)]
    pub track: ActiveTrack,
    pub actual_duration_seconds: f64,
    pub ended_at_iso: String,
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
}

impl ListeningRecord {
    pub fn key(&self) -> RecordKey {
        self.track.key()
    }

    pub fn started_on(&self) -> chrono::NaiveDate {
        self.track.started_at.date_naive()
    }
}

/// Duplicate-suppression key: the exact (external id, start time) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub external_id: String,
    pub started_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Start,
    Pause,
    Resume,
    Seek,
    Finish,
    Skip,
    Close,
    Update,
    SessionExpired,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Start => "start",
            EventType::Pause => "pause",
            EventType::Resume => "resume",
            EventType::Seek => "seek",
            EventType::Finish => "finish",
            EventType::Skip => "skip",
            EventType::Close => "close",
            EventType::Update => "update",
            EventType::SessionExpired => "session_expired",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of `POST /api/listening/event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventNotification {
    pub youtube_track_id: String,
    pub youtube_playlist_id: Option<String>,
    pub title: String,
    pub artist: String,
    pub event_type: EventType,
    pub track_position_seconds: u64,
    pub duration_seconds: u64,
    pub player_timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_id: Option<String>,
    pub url: String,
}
