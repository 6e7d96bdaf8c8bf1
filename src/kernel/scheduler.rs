use chrono::{DateTime, Utc};

use super::event::{whole_secs, ActiveTrack, EventNotification, EventType, ListeningRecord, MediaState};
use super::time::iso;

/// Work the tracker asks the driver to carry out. The tracker itself never
/// touches the network, the store or timers.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    /// Fire-and-forget event notification.
    Report(EventNotification),
    /// Header-less delivery that may outlive page teardown (`close`).
    Beacon(EventNotification),
    /// Persist the full record server-side.
    Submit(ListeningRecord),
    /// Append to the bounded local history.
    AppendHistory(ListeningRecord),
    /// Re-run detection for `external_id` after the retry delay.
    ScheduleArtistRetry { external_id: String, attempt: u32 },
    /// Ask the server whether the track counts toward rewards.
    VerifyTrack { external_id: String },
    /// Evaluate another cycle right away.
    Recheck,
}

impl SideEffect {
    pub fn event_type(&self) -> Option<EventType> {
        match self {
            SideEffect::Report(n) | SideEffect::Beacon(n) => Some(n.event_type),
            _ => None,
        }
    }
}

pub struct Scheduler;

impl Scheduler {
    /// Pure projection: track + context -> notification body.
    ///
    /// `accrued` is the play time of the current session; it becomes
    /// `duration_seconds` for every event except `start`, which reports the
    /// track length instead.
    pub fn notification(
        event_type: EventType,
        track: &ActiveTrack,
        accrued: Option<f64>,
        media: Option<&MediaState>,
        fallback_position: u64,
        history_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> EventNotification {
        let position = media.map(|m| m.position_secs()).unwrap_or(fallback_position);

        let duration = match accrued {
            Some(secs) if event_type != EventType::Start => whole_secs(secs),
            _ => track
                .duration_seconds
                .or_else(|| media.and_then(|m| m.duration_secs()))
                .unwrap_or(0),
        };

        EventNotification {
            youtube_track_id: track.external_id.clone(),
            youtube_playlist_id: track.playlist_id.clone(),
            title: track.title.clone(),
            artist: track.artist.clone(),
            event_type,
            track_position_seconds: position,
            duration_seconds: duration,
            player_timestamp: iso(now),
            history_id: history_id.map(str::to_string),
            url: track.url.clone(),
        }
    }

    /// Wrap a notification in the delivery mechanism its type needs.
    pub fn deliver(notification: EventNotification) -> SideEffect {
        if notification.event_type == EventType::Close {
            SideEffect::Beacon(notification)
        } else {
            SideEffect::Report(notification)
        }
    }
}
