use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use super::event::{
    ActiveTrack, EventType, ListeningRecord, MediaState, Observation, RecordKey, TrackSnapshot,
};
use super::scheduler::{Scheduler, SideEffect};
use super::state::{PendingStart, Phase, Playback, SessionState, StateDelta};
use super::time::{iso, Cycle};

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Playing with no transition for this long is treated as a missed pause.
    pub stale_after: Duration,
    /// Sessions shorter than this produce no record.
    pub min_listen_secs: f64,
    pub artist_retry_limit: u32,
    pub history_cap: usize,
    pub seek_threshold_progress: u64,
    pub seek_threshold_poll: u64,
    pub min_update_gap: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::minutes(5),
            min_listen_secs: 3.0,
            artist_retry_limit: 5,
            history_cap: 1000,
            seek_threshold_progress: 3,
            seek_threshold_poll: 5,
            min_update_gap: Duration::seconds(3),
        }
    }
}

/// Where a playback position reading came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekSource {
    /// Progress-bar / time-info DOM mutation.
    ProgressBar,
    /// Periodic position poll.
    PositionPoll,
    /// Media `timeupdate`: records the position, never reports a seek.
    TimeUpdate,
}

/// Completion rule: more than 90% played, or less than 10 seconds left.
/// An unknown, zero or non-finite duration is never complete.
pub fn is_complete(position: f64, duration: Option<f64>) -> bool {
    match duration {
        Some(d) if d.is_finite() && d > 0.0 => position / d > 0.9 || d - position < 10.0,
        _ => false,
    }
}

/// Read-only view for status queries.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerStatus {
    pub phase: Phase,
    pub is_playing: bool,
    pub current_track: Option<ActiveTrack>,
    pub playback_since: Option<DateTime<Utc>>,
    pub accrued_secs: f64,
}

/// Playback session tracker.
///
/// Each call takes `now` explicitly and returns the side effects the driver
/// must perform. Nothing in here awaits, sleeps or does I/O.
pub struct Tracker {
    pub state: SessionState,
    pub cycle: Cycle,
    config: TrackerConfig,
}

impl Tracker {
    pub fn new(config: TrackerConfig, now: DateTime<Utc>) -> Self {
        Self {
            state: SessionState::new(now, config.history_cap),
            cycle: Cycle::new(),
            config,
        }
    }

    /// Load finished-record keys from persisted history for duplicate checks.
    pub fn seed_history<'a>(&mut self, records: impl IntoIterator<Item = &'a ListeningRecord>) {
        for record in records {
            self.state.finished.insert(record.key());
        }
    }

    pub fn forget_history(&mut self) {
        self.state.finished.clear();
    }

    pub fn status(&self, now: DateTime<Utc>) -> TrackerStatus {
        TrackerStatus {
            phase: self.state.phase(),
            is_playing: self.state.is_playing(),
            current_track: self.state.active_track().cloned(),
            playback_since: self.state.playback_since(),
            accrued_secs: self.state.accrued_secs(now),
        }
    }

    /// One check cycle. Emits at most one event notification.
    pub fn check(&mut self, obs: &Observation, now: DateTime<Utc>) -> Vec<SideEffect> {
        self.cycle = self.cycle.next();

        if self.state.is_playing() && now - self.state.last_state_change > self.config.stale_after {
            info!("No state change for {}s, forcing not-playing", self.config.stale_after.num_seconds());
            self.state.reduce(StateDelta::ForcedPause { at: now });
        }

        if !obs.snapshot.has_title() {
            debug!("No track detected, skipping cycle {}", self.cycle.frame);
            return Vec::new();
        }

        let identity = obs.snapshot.identity();
        let playing = obs.is_playing;

        if let Some(pending) = self.state.pending_start.clone() {
            if playing
                && self.state.phase() == Phase::Idle
                && pending.snapshot.identity() == identity
            {
                let effects = self.start(obs, pending.detected_at, now);
                self.observe(identity, playing);
                return effects;
            }
            debug!("Dropping deferred start of '{}'", pending.snapshot.title);
            self.state.reduce(StateDelta::PendingStartDropped);
        }

        if self.state.last_identity.as_deref() == Some(identity.as_str())
            && self.state.last_playing == playing
        {
            debug!("Same track, same playing flag, nothing to do");
            return Vec::new();
        }

        let effects = match (self.state.playback.clone(), playing) {
            (Playback::Paused(paused), true) => {
                if paused.track_identity == identity {
                    self.resume(obs, now)
                } else {
                    info!("Track changed while paused, discarding '{}'", paused.track.title);
                    self.state.reduce(StateDelta::Ended);
                    self.start(obs, now, now)
                }
            }
            (Playback::Paused(paused), false) => {
                if paused.track_identity == identity {
                    Vec::new()
                } else {
                    self.finish(EventType::Finish, obs.media.as_ref(), now)
                }
            }
            (Playback::Playing { track, .. }, false) => {
                if track.identity() == identity {
                    self.pause(obs, now)
                } else {
                    self.finish(EventType::Finish, obs.media.as_ref(), now)
                }
            }
            (Playback::Playing { track, .. }, true) => {
                if track.identity() == identity {
                    Vec::new()
                } else {
                    info!("Track change: '{}' -> '{}'", track.title, obs.snapshot.title);
                    let mut effects = self.finish(EventType::Skip, obs.media.as_ref(), now);
                    self.state.reduce(StateDelta::TrackChangeDeferred(PendingStart {
                        snapshot: obs.snapshot.clone(),
                        detected_at: now,
                    }));
                    effects.push(SideEffect::Recheck);
                    effects
                }
            }
            (Playback::Idle, true) => self.start(obs, now, now),
            (Playback::Idle, false) => Vec::new(),
        };

        self.observe(identity, playing);
        effects
    }

    /// Re-detection for a track whose artist was unknown at start. Patches the
    /// active track in place; emits no event.
    pub fn retry_artist(&mut self, external_id: &str, snapshot: &TrackSnapshot) -> Vec<SideEffect> {
        let matches = self
            .state
            .active_track()
            .map(|t| t.external_id == external_id && t.title == snapshot.title)
            .unwrap_or(false);
        if !matches {
            debug!("Artist retry for {} no longer applies", external_id);
            return Vec::new();
        }

        if !snapshot.artist_unknown() {
            info!("Artist resolved on retry: {}", snapshot.artist);
            self.state.reduce(StateDelta::ArtistPatched {
                artist: snapshot.artist.clone(),
            });
            self.state.reduce(StateDelta::ArtistRetryCleared {
                external_id: external_id.to_string(),
            });
            return Vec::new();
        }

        self.schedule_artist_retry(external_id).into_iter().collect()
    }

    /// Position reading from one of the seek heuristics.
    pub fn observe_position(&mut self, position: u64, source: SeekSource, media: Option<&MediaState>, now: DateTime<Utc>) -> Vec<SideEffect> {
        if !self.state.is_playing() {
            return Vec::new();
        }

        let threshold = match source {
            SeekSource::ProgressBar => self.config.seek_threshold_progress,
            SeekSource::PositionPoll => self.config.seek_threshold_poll,
            SeekSource::TimeUpdate => {
                self.state.reduce(StateDelta::PositionObserved(position));
                return Vec::new();
            }
        };

        let previous = self.state.position;
        self.state.reduce(StateDelta::PositionObserved(position));
        if position.abs_diff(previous) <= threshold {
            return Vec::new();
        }

        info!("Seek detected: {} -> {}", previous, position);
        self.state.reduce(StateDelta::UpdateSent(now));
        self.notify(EventType::Seek, media, now).into_iter().collect()
    }

    /// Periodic progress notification while playing.
    pub fn periodic_update(&mut self, media: Option<&MediaState>, now: DateTime<Utc>) -> Vec<SideEffect> {
        if !self.state.is_playing() {
            return Vec::new();
        }
        if let Some(last) = self.state.last_update_sent {
            if now - last <= self.config.min_update_gap {
                return Vec::new();
            }
        }
        self.state.reduce(StateDelta::UpdateSent(now));
        self.notify(EventType::Update, media, now).into_iter().collect()
    }

    /// Page hidden: report progress, keep tracking.
    pub fn visibility_hidden(&mut self, media: Option<&MediaState>, now: DateTime<Utc>) -> Vec<SideEffect> {
        if !self.state.is_playing() {
            return Vec::new();
        }
        self.state.reduce(StateDelta::UpdateSent(now));
        self.notify(EventType::Update, media, now).into_iter().collect()
    }

    /// Page teardown: finish whatever is active with reason `close`.
    pub fn close(&mut self, media: Option<&MediaState>, now: DateTime<Utc>) -> Vec<SideEffect> {
        let effects = self.finish(EventType::Close, media, now);
        self.state.reduce(StateDelta::Forgotten);
        effects
    }

    /// Drop all tracking state. A playing track gets a `close` notification
    /// but no record.
    pub fn reset(&mut self, media: Option<&MediaState>, now: DateTime<Utc>) -> Vec<SideEffect> {
        let effects = if self.state.is_playing() {
            self.notify(EventType::Close, media, now).into_iter().collect()
        } else {
            Vec::new()
        };
        self.state.reduce(StateDelta::Reset { at: now });
        info!("All tracking state reset");
        effects
    }

    /// Authentication expired: tell the server for the current track, then
    /// reset.
    pub fn session_expired(&mut self, media: Option<&MediaState>, now: DateTime<Utc>) -> Vec<SideEffect> {
        let mut effects: Vec<SideEffect> = self
            .notify(EventType::SessionExpired, media, now)
            .into_iter()
            .collect();
        effects.extend(self.reset(media, now));
        effects
    }

    /// Attach a record id returned by a submission to later notifications.
    /// Applies only when no reset happened since the submission was issued
    /// and the record's track is still the active one.
    pub fn capture_history_id(&mut self, epoch: u64, key: &RecordKey, history_id: String) -> bool {
        if epoch != self.state.epoch {
            debug!("Discarding history id from epoch {} (now {})", epoch, self.state.epoch);
            return false;
        }
        let current = self.state.active_track().map(|t| t.key() == *key).unwrap_or(false);
        if !current {
            debug!("History id {} belongs to a track that is no longer active", history_id);
            return false;
        }
        self.state.reduce(StateDelta::HistoryIdCaptured {
            key: key.clone(),
            id: history_id,
        });
        true
    }

    fn observe(&mut self, identity: String, is_playing: bool) {
        self.state.reduce(StateDelta::Observed { identity, is_playing });
    }

    fn start(&mut self, obs: &Observation, started_at: DateTime<Utc>, now: DateTime<Utc>) -> Vec<SideEffect> {
        let track = ActiveTrack::from_snapshot(&obs.snapshot, started_at, &obs.url, obs.media.as_ref());
        let position = obs.media.map(|m| m.position_secs()).unwrap_or(0);

        info!("Playback started: {} - {} ({})", track.title, track.artist, track.external_id);
        self.state.reduce(StateDelta::PositionObserved(position));
        self.state.reduce(StateDelta::Started {
            track: track.clone(),
            at: started_at,
        });

        let notification = Scheduler::notification(
            EventType::Start,
            &track,
            None,
            obs.media.as_ref(),
            position,
            self.state.current_history_id(),
            now,
        );

        let mut effects = vec![
            Scheduler::deliver(notification),
            SideEffect::VerifyTrack {
                external_id: track.external_id.clone(),
            },
        ];

        if obs.snapshot.artist_unknown() && !track.external_id.is_empty() {
            effects.extend(self.schedule_artist_retry(&track.external_id));
        } else {
            self.state.reduce(StateDelta::ArtistRetryCleared {
                external_id: track.external_id.clone(),
            });
        }
        effects
    }

    fn pause(&mut self, obs: &Observation, now: DateTime<Utc>) -> Vec<SideEffect> {
        let accrued = self.state.accrued_secs(now);
        self.state.reduce(StateDelta::Paused { at: now });
        info!("Paused after {:.1}s", accrued);
        self.notify(EventType::Pause, obs.media.as_ref(), now).into_iter().collect()
    }

    fn resume(&mut self, obs: &Observation, now: DateTime<Utc>) -> Vec<SideEffect> {
        self.state.reduce(StateDelta::Resumed { at: now });
        info!("Resumed with {:.1}s already accrued", self.state.accrued_secs(now));
        self.notify(EventType::Resume, obs.media.as_ref(), now).into_iter().collect()
    }

    /// End the active session. A record is produced only when enough time
    /// accrued and the (external id, start) pair was not finished before.
    fn finish(&mut self, reason: EventType, media: Option<&MediaState>, now: DateTime<Utc>) -> Vec<SideEffect> {
        let Some(track) = self.state.active_track().cloned() else {
            return Vec::new();
        };
        let accrued = self.state.accrued_secs(now);
        let position = media.map(|m| m.position_secs()).unwrap_or(self.state.position);
        let history_id = self.state.current_history_id().map(str::to_string);
        self.state.reduce(StateDelta::Ended);

        if accrued < self.config.min_listen_secs {
            debug!("Play time too short ({:.1}s), not recording '{}'", accrued, track.title);
            return Vec::new();
        }

        let complete = media
            .map(|m| is_complete(position as f64, m.duration))
            .unwrap_or(false);

        let mut track = track;
        if track.duration_seconds.is_none() {
            track.duration_seconds = media.and_then(|m| m.duration_secs());
        }

        let record = ListeningRecord {
            track,
            actual_duration_seconds: accrued,
            ended_at_iso: iso(now),
            is_complete: complete,
            history_id: None,
            record_id: None,
        };

        let key = record.key();
        if self.state.finished.contains(&key) {
            info!("Duplicate finish for {} at {}, ignoring", key.external_id, key.started_at);
            return Vec::new();
        }
        self.state.reduce(StateDelta::RecordFinished(key));

        info!(
            "Track {}: {} - {}, {:.1}s, complete: {}",
            reason, record.track.title, record.track.artist, accrued, complete
        );

        let notification = Scheduler::notification(
            reason,
            &record.track,
            Some(accrued),
            media,
            position,
            history_id.as_deref(),
            now,
        );

        vec![
            Scheduler::deliver(notification),
            SideEffect::Submit(record.clone()),
            SideEffect::AppendHistory(record),
        ]
    }

    fn notify(&self, event_type: EventType, media: Option<&MediaState>, now: DateTime<Utc>) -> Option<SideEffect> {
        let track = self.state.active_track()?;
        let accrued = match self.state.playback {
            Playback::Idle => None,
            _ => Some(self.state.accrued_secs(now)),
        };
        let notification = Scheduler::notification(
            event_type,
            track,
            accrued,
            media,
            self.state.position,
            self.state.current_history_id(),
            now,
        );
        Some(Scheduler::deliver(notification))
    }

    fn schedule_artist_retry(&mut self, external_id: &str) -> Option<SideEffect> {
        let attempts = self.state.retry_attempts.get(external_id).copied().unwrap_or(0);
        if attempts >= self.config.artist_retry_limit {
            debug!("Artist retries exhausted for {}", external_id);
            return None;
        }
        self.state.reduce(StateDelta::ArtistRetryCounted {
            external_id: external_id.to_string(),
        });
        info!("Artist unknown, retry {} scheduled for {}", attempts + 1, external_id);
        Some(SideEffect::ScheduleArtistRetry {
            external_id: external_id.to_string(),
            attempt: attempts + 1,
        })
    }
}
