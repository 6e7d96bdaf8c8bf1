use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::detector::{PageSource, PageState, TrackDetector};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::kernel::event::{ListeningRecord, MediaState};
use crate::kernel::guard::CycleGate;
use crate::kernel::scheduler::SideEffect;
use crate::kernel::time::{iso, Clock};
use crate::kernel::tracker::{SeekSource, Tracker};
use crate::messaging::{Request, Response, Status, TrackHistoryResponse};
use crate::services::api::{ApiClient, Credentials, DeviceInfo};
use crate::store::{KeyValueStore, LocalState, StoreError};

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

/// Wall clock for real deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("a check cycle is already running")]
    Busy,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// What the embedding surface feeds the runtime.
pub enum Input {
    /// Fresh page content. Counts as a DOM mutation.
    Page(Box<dyn PageSource>),
    /// Progress bar / time label changed; carries the displayed position.
    Progress(u64),
    /// Media element `timeupdate`.
    TimeUpdate(f64),
    Hidden,
    Unload,
    Message(Request, oneshot::Sender<Response>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ExpiryAction {
    Relogin,
    /// Another tab or device holds the session.
    CloseDuplicateTab,
}

/// User-facing notices for the embedding surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "notice", rename_all = "camelCase")]
pub enum Notice {
    SessionExpired { message: String, action: ExpiryAction },
    TrackNotApproved { external_id: String, playlist_url: Option<String> },
    /// Tracks listened today.
    Badge { count: usize },
    CloseTab,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Initial,
    Poll,
    Mutation,
    Recheck,
    Forced,
}

#[derive(Debug, Clone, PartialEq)]
enum Timer {
    Check(Trigger),
    Debounced(u64),
    ArtistRetry(String),
    SyncPending,
}

/// Cloneable handle to a running [`Runtime`].
#[derive(Clone)]
pub struct RuntimeHandle {
    inputs: mpsc::Sender<Input>,
    shutdown: CancellationToken,
}

impl RuntimeHandle {
    pub async fn send(&self, input: Input) -> bool {
        self.inputs.send(input).await.is_ok()
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, request: Request) -> Option<Response> {
        let (tx, rx) = oneshot::channel();
        self.inputs.send(Input::Message(request, tx)).await.ok()?;
        rx.await.ok()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

type DebugHook = Box<dyn Fn(bool) + Send>;

/// The async driver. Owns the tracker and the store; everything reaches it
/// through channels, so state is only ever touched from this loop.
pub struct Runtime<S: KeyValueStore + 'static> {
    settings: Settings,
    detector: TrackDetector,
    tracker: Tracker,
    store: LocalState<S>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    gate: CycleGate,
    page: Box<dyn PageSource>,
    mutation_gen: u64,
    expiry_notified: bool,
    input_tx: mpsc::Sender<Input>,
    input_rx: mpsc::Receiver<Input>,
    outcome_rx: mpsc::Receiver<DispatchOutcome>,
    timer_tx: mpsc::UnboundedSender<Timer>,
    timer_rx: mpsc::UnboundedReceiver<Timer>,
    notice_tx: mpsc::UnboundedSender<Notice>,
    notice_rx: Option<mpsc::UnboundedReceiver<Notice>>,
    on_debug_mode: Option<DebugHook>,
    shutdown: CancellationToken,
}

impl<S: KeyValueStore + 'static> Runtime<S> {
    pub fn new(settings: Settings, store: LocalState<S>, clock: Arc<dyn Clock>) -> Result<Self, CycleError> {
        settings.validate().map_err(CycleError::Config)?;
        let detector = TrackDetector::new(settings.detector.clone()).map_err(|e| CycleError::Config(e.to_string()))?;

        let now = clock.now();
        let mut tracker = Tracker::new(settings.tracker_config(), now);
        let history = store.history();
        tracker.seed_history(history.iter());
        info!("Loaded {} history records", history.len());

        let api = ApiClient::new(settings.server_url(store.dev_mode()), settings.request_timeout());
        let (outcome_tx, outcome_rx) = mpsc::channel(100);
        let (input_tx, input_rx) = mpsc::channel(100);
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        Ok(Self {
            settings,
            detector,
            tracker,
            store,
            dispatcher: Dispatcher::new(api, outcome_tx),
            clock,
            gate: CycleGate::new(),
            page: Box::new(PageState::default()),
            mutation_gen: 0,
            expiry_notified: false,
            input_tx,
            input_rx,
            outcome_rx,
            timer_tx,
            timer_rx,
            notice_tx,
            notice_rx: Some(notice_rx),
            on_debug_mode: None,
            shutdown: CancellationToken::new(),
        })
    }

    /// Called with the new flag whenever `setDebugMode` arrives.
    pub fn with_debug_hook(mut self, hook: impl Fn(bool) + Send + 'static) -> Self {
        self.on_debug_mode = Some(Box::new(hook));
        self
    }

    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            inputs: self.input_tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// The notice stream. Available once.
    pub fn take_notices(&mut self) -> Option<mpsc::UnboundedReceiver<Notice>> {
        self.notice_rx.take()
    }

    pub async fn run(mut self) -> Result<(), CycleError> {
        let t = self.settings.tracking.clone();
        info!("Tracking runtime started against {}", self.dispatcher.api().base_url());

        self.bootstrap();
        self.schedule(Duration::from_millis(t.initial_check_delay_ms), Timer::Check(Trigger::Initial));

        let mut poll = ticker(Duration::from_millis(t.poll_interval_ms));
        let mut position = ticker(Duration::from_millis(t.position_poll_ms.max(1)));
        let mut update = ticker(Duration::from_millis(t.update_interval_ms.max(1)));
        let mut idle_reset = ticker(Duration::from_secs(t.idle_reset_interval_secs.max(1)));
        let mut pending_sync = ticker(Duration::from_secs(t.pending_sync_interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                input = self.input_rx.recv() => match input {
                    Some(input) => isolate("input", self.on_input(input)),
                    None => break,
                },
                Some(outcome) = self.outcome_rx.recv() => isolate("outcome", self.on_outcome(outcome)),
                Some(timer) = self.timer_rx.recv() => isolate("timer", self.on_timer(timer)),
                _ = poll.tick() => self.guarded_cycle(Trigger::Poll),
                _ = position.tick() => isolate("position poll", self.poll_position()),
                _ = update.tick() => isolate("periodic update", self.periodic_update()),
                _ = idle_reset.tick() => isolate("idle reset", self.idle_reset()),
                _ = pending_sync.tick() => self.sync_pending(),
            }
        }

        self.finish_up().await
    }

    fn bootstrap(&mut self) {
        if let Some(token) = self.store.token() {
            if self.store.session_id().is_none() {
                info!("No session id stored, opening a session");
                self.dispatcher.create_session(token, DeviceInfo::current());
            }
        } else {
            info!("No auth token stored; events will not be reported");
        }
        self.check_connection();

        let today = self.clock.now().date_naive();
        let _ = self.notice_tx.send(Notice::Badge {
            count: self.store.today_stats(today).tracks,
        });

        if !self.store.pending().is_empty() {
            self.schedule(
                Duration::from_millis(self.settings.tracking.pending_sync_delay_ms),
                Timer::SyncPending,
            );
        }
    }

    async fn finish_up(&mut self) -> Result<(), CycleError> {
        let now = self.clock.now();
        let media = self.media();
        let effects = self.tracker.close(media.as_ref(), now);
        let result = self.execute(effects, now);

        let unfinished = self.dispatcher.drain(SHUTDOWN_DRAIN).await;
        while let Ok(outcome) = self.outcome_rx.try_recv() {
            isolate("outcome", self.on_outcome(outcome));
        }
        for record in unfinished {
            info!("Submission for {} still in flight, queueing it", record.track.external_id);
            self.store.queue_pending(record)?;
        }
        info!("Tracking runtime stopped");
        result
    }

    fn on_input(&mut self, input: Input) -> Result<(), CycleError> {
        let now = self.clock.now();
        match input {
            Input::Page(page) => {
                self.page = page;
                self.page_mutated();
            }
            Input::Progress(position) => {
                let media = self.media();
                let effects = self
                    .tracker
                    .observe_position(position, SeekSource::ProgressBar, media.as_ref(), now);
                self.execute(effects, now)?;
            }
            Input::TimeUpdate(current_time) => {
                let media = self.media();
                let position = MediaState {
                    current_time,
                    ..media.unwrap_or_default()
                }
                .position_secs();
                self.tracker
                    .observe_position(position, SeekSource::TimeUpdate, media.as_ref(), now);
            }
            Input::Hidden => {
                let media = self.media();
                let effects = self.tracker.visibility_hidden(media.as_ref(), now);
                self.execute(effects, now)?;
            }
            Input::Unload => {
                info!("Page unloading");
                let media = self.media();
                let effects = self.tracker.close(media.as_ref(), now);
                self.execute(effects, now)?;
            }
            Input::Message(request, reply) => {
                debug!("Message received: {}", request.action());
                let response = self.on_request(request, now).unwrap_or_else(|e| {
                    error!("Request failed: {}", e);
                    Response::error(e.to_string())
                });
                let _ = reply.send(response);
            }
        }
        Ok(())
    }

    fn on_request(&mut self, request: Request, now: DateTime<Utc>) -> Result<Response, CycleError> {
        let response = match request {
            Request::UpdateToken { token, session_id } => {
                self.store.set_token(&token, session_id.as_deref())?;
                self.expiry_notified = false;
                if session_id.is_none() && self.store.session_id().is_none() {
                    self.dispatcher.create_session(token, DeviceInfo::current());
                }
                info!("Auth token updated");
                Response::status(Status::Ok)
            }
            Request::ClearSession => {
                self.store.clear_session()?;
                Response::status(Status::Ok)
            }
            Request::UpdateDevMode { enabled } => {
                self.store.set_dev_mode(enabled)?;
                let url = self.settings.server_url(enabled).to_string();
                self.dispatcher.set_base_url(&url);
                info!("Dev mode {}", if enabled { "on" } else { "off" });
                Response::status(Status::Ok)
            }
            Request::GetServerUrl => Response::ServerUrl {
                server_url: self.settings.server_url(self.store.dev_mode()).to_string(),
            },
            Request::UpdateEarnings { count } => {
                let _ = self.notice_tx.send(Notice::Badge { count });
                Response::status(Status::Ok)
            }
            Request::CloseTab => {
                let _ = self.notice_tx.send(Notice::CloseTab);
                Response::status(Status::Ok)
            }
            Request::GetTrackHistory => {
                let status = self.tracker.status(now);
                Response::TrackHistory(Box::new(TrackHistoryResponse {
                    track_history: self.store.history(),
                    today_stats: self.store.today_stats(now.date_naive()),
                    is_playing: status.is_playing,
                    current_track: status.current_track,
                    playback_start_time: status.playback_since.map(iso),
                }))
            }
            Request::SetDebugMode { enabled } => {
                self.store.set_debug_mode(enabled)?;
                if let Some(hook) = &self.on_debug_mode {
                    hook(enabled);
                }
                info!("Debug mode {}", if enabled { "on" } else { "off" });
                Response::status(Status::Ok)
            }
            Request::CheckConnection => {
                self.check_connection();
                Response::status(Status::Checking)
            }
            Request::ForceCheckState => {
                self.log_page();
                self.guarded_cycle(Trigger::Forced);
                Response::status(Status::Checking)
            }
            Request::LogDomState => {
                self.log_page();
                Response::status(Status::Logging)
            }
            Request::ResetState => {
                let media = self.media();
                let effects = self.tracker.reset(media.as_ref(), now);
                self.execute(effects, now)?;
                Response::status(Status::Reset)
            }
            Request::ClearHistory => {
                self.store.clear_history()?;
                self.tracker.forget_history();
                info!("Track history cleared");
                Response::status(Status::Cleared)
            }
            Request::SyncPendingTracks => {
                self.sync_pending();
                Response::status(Status::Syncing)
            }
        };
        Ok(response)
    }

    fn on_outcome(&mut self, outcome: DispatchOutcome) -> Result<(), CycleError> {
        match outcome {
            DispatchOutcome::SessionExpired { message, ip_conflict } => {
                self.session_expired(message, ip_conflict)?;
            }
            DispatchOutcome::Submitted { key, history_id, epoch } => {
                if let Some(id) = history_id {
                    self.store.set_history_id(&key, &id)?;
                    if self.tracker.capture_history_id(epoch, &key, id.clone()) {
                        debug!("Correlating further events with history id {}", id);
                    }
                }
            }
            DispatchOutcome::SubmitFailed { record, reason } => {
                info!("Queueing {} for later delivery ({})", record.track.external_id, reason);
                if self.store.queue_pending(record)? {
                    self.schedule(
                        Duration::from_millis(self.settings.tracking.pending_sync_delay_ms),
                        Timer::SyncPending,
                    );
                }
            }
            DispatchOutcome::TrackVerified {
                external_id,
                approved,
                recommended,
            } => {
                if approved {
                    debug!("Track {} is approved", external_id);
                } else {
                    info!("Track {} is not in an approved playlist", external_id);
                    let _ = self.notice_tx.send(Notice::TrackNotApproved {
                        external_id,
                        playlist_url: recommended.map(|p| p.url()),
                    });
                }
            }
            DispatchOutcome::SessionCreated(id) => {
                info!("Session opened: {}", id);
                self.store.set_session_id(&id)?;
            }
            DispatchOutcome::SessionFailed(reason) => warn!("Could not open a session: {}", reason),
            DispatchOutcome::PendingSynced(report) => {
                let remaining = self.store.remove_pending(&report.delivered)?;
                info!(
                    "Pending sync delivered {} record(s), {} still queued",
                    report.delivered.len(),
                    remaining
                );
            }
        }
        Ok(())
    }

    fn on_timer(&mut self, timer: Timer) -> Result<(), CycleError> {
        match timer {
            Timer::Check(trigger) => self.guarded_cycle(trigger),
            Timer::Debounced(gen) => {
                if gen != self.mutation_gen {
                    return Ok(());
                }
                self.guarded_cycle(Trigger::Mutation);
                let debounce = self.settings.tracking.debounce_ms;
                for delay in self.settings.tracking.recheck_delays_ms.clone() {
                    self.schedule(
                        Duration::from_millis(delay.saturating_sub(debounce)),
                        Timer::Check(Trigger::Recheck),
                    );
                }
            }
            Timer::ArtistRetry(external_id) => {
                let now = self.clock.now();
                let snapshot = self.detector.detect(self.page.as_ref(), now);
                let effects = self.tracker.retry_artist(&external_id, &snapshot);
                self.execute(effects, now)?;
            }
            Timer::SyncPending => self.sync_pending(),
        }
        Ok(())
    }

    /// One check cycle behind the reentrancy gate. Failures are logged and
    /// do not stop the loop.
    fn guarded_cycle(&mut self, trigger: Trigger) {
        match self.cycle(trigger) {
            Ok(()) => {}
            Err(CycleError::Busy) => debug!("Check already running, {:?} trigger dropped", trigger),
            Err(e) => error!("Check cycle ({:?}) failed: {}", trigger, e),
        }
    }

    fn cycle(&mut self, trigger: Trigger) -> Result<(), CycleError> {
        let _guard = self.gate.try_enter().ok_or(CycleError::Busy)?;
        let now = self.clock.now();
        let observation = self.detector.observe(self.page.as_ref(), now);
        debug!(
            "{:?} check: '{}' by '{}', playing: {}",
            trigger, observation.snapshot.title, observation.snapshot.artist, observation.is_playing
        );
        let effects = self.tracker.check(&observation, now);
        self.execute(effects, now)
    }

    fn execute(&mut self, effects: Vec<SideEffect>, now: DateTime<Utc>) -> Result<(), CycleError> {
        for effect in effects {
            match effect {
                SideEffect::Report(event) => self.dispatcher.report(self.credentials(), event),
                SideEffect::Beacon(event) => self.dispatcher.beacon(event),
                SideEffect::Submit(record) => {
                    let client_id = self.store.client_id()?;
                    let record = stamp_record_id(record, &client_id);
                    let epoch = self.tracker.state.epoch;
                    let creds = self.credentials();
                    self.dispatcher.submit(creds, record, client_id, epoch);
                }
                SideEffect::AppendHistory(record) => {
                    let client_id = self.store.client_id()?;
                    let count = self.store.append_history(stamp_record_id(record, &client_id))?;
                    debug!("History now holds {} records", count);
                    let today = self.store.today_stats(now.date_naive());
                    let _ = self.notice_tx.send(Notice::Badge { count: today.tracks });
                }
                SideEffect::ScheduleArtistRetry { external_id, attempt } => {
                    debug!("Artist retry {} for {}", attempt, external_id);
                    self.schedule(
                        Duration::from_millis(self.settings.tracking.artist_retry_delay_ms),
                        Timer::ArtistRetry(external_id),
                    );
                }
                SideEffect::VerifyTrack { external_id } => self.dispatcher.verify(self.credentials(), external_id),
                SideEffect::Recheck => {
                    let _ = self.timer_tx.send(Timer::Check(Trigger::Recheck));
                }
            }
        }
        Ok(())
    }

    fn session_expired(&mut self, message: String, ip_conflict: bool) -> Result<(), CycleError> {
        let now = self.clock.now();
        let media = self.media();
        let effects = self.tracker.session_expired(media.as_ref(), now);
        self.execute(effects, now)?;
        self.store.clear_session()?;

        if !self.expiry_notified {
            self.expiry_notified = true;
            let action = if ip_conflict {
                ExpiryAction::CloseDuplicateTab
            } else {
                ExpiryAction::Relogin
            };
            warn!("Session expired: {}", message);
            let _ = self.notice_tx.send(Notice::SessionExpired { message, action });
        }
        Ok(())
    }

    fn poll_position(&mut self) -> Result<(), CycleError> {
        if !self.tracker.state.is_playing() {
            return Ok(());
        }
        let Some(media) = self.media() else {
            return Ok(());
        };
        let now = self.clock.now();
        let effects = self
            .tracker
            .observe_position(media.position_secs(), SeekSource::PositionPoll, Some(&media), now);
        self.execute(effects, now)
    }

    fn periodic_update(&mut self) -> Result<(), CycleError> {
        let now = self.clock.now();
        let media = self.media();
        let effects = self.tracker.periodic_update(media.as_ref(), now);
        self.execute(effects, now)
    }

    fn idle_reset(&mut self) -> Result<(), CycleError> {
        if self.tracker.state.is_playing() {
            return Ok(());
        }
        let now = self.clock.now();
        info!("Idle, resetting tracking state");
        let effects = self.tracker.reset(None, now);
        self.execute(effects, now)
    }

    fn sync_pending(&mut self) {
        let client_id = match self.store.client_id() {
            Ok(id) => id,
            Err(e) => {
                warn!("No client id, pending sync skipped: {}", e);
                return;
            }
        };
        self.dispatcher
            .sync_pending(self.credentials(), self.store.pending(), client_id);
    }

    fn check_connection(&self) {
        let api = self.dispatcher.api().clone();
        tokio::spawn(async move {
            match api.test_connection().await {
                Ok(body) => info!("Server reachable at {}: {}", api.base_url(), body),
                Err(e) => warn!("Server unreachable at {}: {}", api.base_url(), e),
            }
        });
    }

    fn log_page(&self) {
        let report = self.detector.report(self.page.as_ref());
        info!("Player bar present: {}", report.player_bar);
        info!("Title selector hits: {:?}", report.title_hits);
        info!("Artist selector hits: {:?}", report.artist_hits);
        info!("Document title: {}", report.document_title);
        info!("Media session: {:?}", report.media_session);
        info!("Play button label: {:?}", report.play_button_label);
        info!("Media element playing: {:?}", report.media_playing);
        info!("URL: {} (video id {:?})", report.url, report.url_video_id);
    }

    fn page_mutated(&mut self) {
        self.mutation_gen += 1;
        self.schedule(
            Duration::from_millis(self.settings.tracking.debounce_ms),
            Timer::Debounced(self.mutation_gen),
        );
    }

    fn schedule(&self, after: Duration, timer: Timer) {
        let tx = self.timer_tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    let _ = tx.send(timer);
                }
            }
        });
    }

    fn media(&self) -> Option<MediaState> {
        self.detector.media_state(self.page.as_ref())
    }

    fn credentials(&self) -> Option<Credentials> {
        self.store.token().map(|token| Credentials {
            token,
            session_id: self.store.session_id(),
        })
    }
}

/// `<clientId>-<externalId>-<start millis>`. Keyed on the start time so the
/// history entry and the submission carry the same id.
fn stamp_record_id(mut record: ListeningRecord, client_id: &str) -> ListeningRecord {
    if record.record_id.is_none() {
        record.record_id = Some(format!(
            "{}-{}-{}",
            client_id,
            record.track.external_id,
            record.track.started_at.timestamp_millis()
        ));
    }
    record
}

fn isolate(what: &str, result: Result<(), CycleError>) {
    if let Err(e) = result {
        error!("Handling {} failed: {}", what, e);
    }
}

/// Interval whose first tick is one period from now.
fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}
