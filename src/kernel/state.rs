use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};

use super::event::{ActiveTrack, PausedSnapshot, RecordKey, TrackSnapshot};
use super::time::{elapsed_secs, iso};

/// Playback phase. Holding the track inside the variant keeps at most one
/// active track and one paused snapshot alive, and never for two different
/// identities.
#[derive(Debug, Clone, PartialEq)]
pub enum Playback {
    Idle,
    /// `since` is the accrual reference: accrued = now - since.
    Playing { track: ActiveTrack, since: DateTime<Utc> },
    Paused(PausedSnapshot),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Playing,
    Paused,
}

/// A track change seen while playing. Its `start` is emitted by the next
/// cycle so that a single cycle reports one event.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingStart {
    pub snapshot: TrackSnapshot,
    pub detected_at: DateTime<Utc>,
}

/// Strict state delta. All mutation of [`SessionState`] goes through `reduce`.
#[derive(Debug, Clone)]
pub enum StateDelta {
    Started { track: ActiveTrack, at: DateTime<Utc> },
    Paused { at: DateTime<Utc> },
    Resumed { at: DateTime<Utc> },
    /// Forced pause from the stale-state valve. Does not count as a transition.
    ForcedPause { at: DateTime<Utc> },
    Ended,
    /// Ended by page teardown: also forget the last observation so a page
    /// that keeps running starts over cleanly.
    Forgotten,
    Observed { identity: String, is_playing: bool },
    TrackChangeDeferred(PendingStart),
    PendingStartDropped,
    ArtistPatched { artist: String },
    PositionObserved(u64),
    UpdateSent(DateTime<Utc>),
    RecordFinished(RecordKey),
    ArtistRetryCounted { external_id: String },
    ArtistRetryCleared { external_id: String },
    HistoryIdCaptured { key: RecordKey, id: String },
    Reset { at: DateTime<Utc> },
}

/// Bounded set of finished-record keys, oldest evicted first.
#[derive(Debug, Clone)]
pub struct RecentKeys {
    order: VecDeque<RecordKey>,
    set: HashSet<RecordKey>,
    cap: usize,
}

impl RecentKeys {
    pub fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(cap.min(1024)),
            set: HashSet::new(),
            cap,
        }
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.set.contains(key)
    }

    pub fn insert(&mut self, key: RecordKey) -> bool {
        if self.set.contains(&key) {
            return false;
        }
        if self.cap > 0 && self.order.len() >= self.cap {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        self.set.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.set.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// The single explicit session-state object owned by the tracker.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub playback: Playback,
    /// Identity and playing flag of the last evaluated cycle.
    pub last_identity: Option<String>,
    pub last_playing: bool,
    pub last_state_change: DateTime<Utc>,
    pub position: u64,
    pub last_update_sent: Option<DateTime<Utc>>,
    pub pending_start: Option<PendingStart>,
    pub retry_attempts: HashMap<String, u32>,
    pub finished: RecentKeys,
    /// Server record id, bound to the record it was issued for.
    pub history_id: Option<(RecordKey, String)>,
    /// Bumped on every reset; late async results carrying an older epoch are
    /// not applied.
    pub epoch: u64,
}

impl SessionState {
    pub fn new(now: DateTime<Utc>, history_cap: usize) -> Self {
        Self {
            playback: Playback::Idle,
            last_identity: None,
            last_playing: false,
            last_state_change: now,
            position: 0,
            last_update_sent: None,
            pending_start: None,
            retry_attempts: HashMap::new(),
            finished: RecentKeys::new(history_cap),
            history_id: None,
            epoch: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        match self.playback {
            Playback::Idle => Phase::Idle,
            Playback::Playing { .. } => Phase::Playing,
            Playback::Paused(_) => Phase::Paused,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.phase() == Phase::Playing
    }

    /// The active track, whether playing or paused.
    pub fn active_track(&self) -> Option<&ActiveTrack> {
        match &self.playback {
            Playback::Idle => None,
            Playback::Playing { track, .. } => Some(track),
            Playback::Paused(p) => Some(&p.track),
        }
    }

    /// The captured history id, while the track it belongs to is active.
    pub fn current_history_id(&self) -> Option<&str> {
        let (key, id) = self.history_id.as_ref()?;
        let active = self.active_track()?;
        (active.key() == *key).then_some(id.as_str())
    }

    pub fn paused_snapshot(&self) -> Option<&PausedSnapshot> {
        match &self.playback {
            Playback::Paused(p) => Some(p),
            _ => None,
        }
    }

    /// Accrual reference of the playing track, if any.
    pub fn playback_since(&self) -> Option<DateTime<Utc>> {
        match &self.playback {
            Playback::Playing { since, .. } => Some(*since),
            _ => None,
        }
    }

    /// Seconds of play accrued by the current session at `now`.
    pub fn accrued_secs(&self, now: DateTime<Utc>) -> f64 {
        match &self.playback {
            Playback::Idle => 0.0,
            Playback::Playing { since, .. } => elapsed_secs(*since, now),
            Playback::Paused(p) => p.accumulated_play_seconds,
        }
    }

    fn pause_at(&mut self, at: DateTime<Utc>) {
        let accrued = self.accrued_secs(at);
        let previous = std::mem::replace(&mut self.playback, Playback::Idle);
        self.playback = match previous {
            Playback::Playing { track, .. } => Playback::Paused(PausedSnapshot {
                track_identity: track.identity(),
                track,
                accumulated_play_seconds: accrued,
                paused_at_iso: iso(at),
            }),
            other => other,
        };
        self.last_state_change = at;
    }

    /// Pure reduction: State + Delta -> Mutated State
    pub fn reduce(&mut self, delta: StateDelta) {
        match delta {
            StateDelta::Started { track, at } => {
                self.playback = Playback::Playing { track, since: at };
                self.pending_start = None;
                self.history_id = None;
                self.last_state_change = at;
            }
            StateDelta::Paused { at } => self.pause_at(at),
            StateDelta::ForcedPause { at } => {
                self.last_playing = false;
                self.pause_at(at);
            }
            StateDelta::Resumed { at } => {
                let previous = std::mem::replace(&mut self.playback, Playback::Idle);
                self.playback = match previous {
                    Playback::Paused(p) => {
                        let since = at - Duration::milliseconds((p.accumulated_play_seconds * 1000.0) as i64);
                        Playback::Playing { track: p.track, since }
                    }
                    other => other,
                };
                self.last_state_change = at;
            }
            StateDelta::Ended => {
                self.playback = Playback::Idle;
            }
            StateDelta::Forgotten => {
                self.playback = Playback::Idle;
                self.last_identity = None;
                self.last_playing = false;
                self.pending_start = None;
            }
            StateDelta::Observed { identity, is_playing } => {
                self.last_identity = Some(identity);
                self.last_playing = is_playing;
            }
            StateDelta::TrackChangeDeferred(pending) => {
                self.last_state_change = pending.detected_at;
                self.pending_start = Some(pending);
            }
            StateDelta::PendingStartDropped => {
                self.pending_start = None;
            }
            StateDelta::ArtistPatched { artist } => {
                match &mut self.playback {
                    Playback::Playing { track, .. } => {
                        track.artist = artist;
                        self.last_identity = Some(track.identity());
                    }
                    Playback::Paused(p) => {
                        p.track.artist = artist;
                        p.track_identity = p.track.identity();
                        self.last_identity = Some(p.track_identity.clone());
                    }
                    Playback::Idle => {}
                }
            }
            StateDelta::PositionObserved(pos) => {
                self.position = pos;
            }
            StateDelta::UpdateSent(at) => {
                self.last_update_sent = Some(at);
            }
            StateDelta::RecordFinished(key) => {
                self.finished.insert(key);
            }
            StateDelta::ArtistRetryCounted { external_id } => {
                *self.retry_attempts.entry(external_id).or_insert(0) += 1;
            }
            StateDelta::ArtistRetryCleared { external_id } => {
                self.retry_attempts.insert(external_id, 0);
            }
            StateDelta::HistoryIdCaptured { key, id } => {
                self.history_id = Some((key, id));
            }
            StateDelta::Reset { at } => {
                self.playback = Playback::Idle;
                self.last_identity = None;
                self.last_playing = false;
                self.last_state_change = at;
                self.position = 0;
                self.last_update_sent = None;
                self.pending_start = None;
                self.history_id = None;
                self.epoch += 1;
            }
        }
    }
}
