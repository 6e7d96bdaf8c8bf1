use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::kernel::event::{EventNotification, ListeningRecord, RecordKey};
use crate::kernel::guard::CycleGate;
use crate::services::api::{
    ApiClient, ApiError, Credentials, DeviceInfo, ListeningSubmission, RecommendedPlaylist, SyncReport,
};

/// Results of detached network work. The driver applies them; tasks never
/// touch tracker or store state themselves.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    SessionExpired {
        message: String,
        ip_conflict: bool,
    },
    Submitted {
        key: RecordKey,
        history_id: Option<String>,
        /// Tracker epoch when the submission was issued.
        epoch: u64,
    },
    /// The record goes to the pending queue.
    SubmitFailed {
        record: ListeningRecord,
        reason: String,
    },
    TrackVerified {
        external_id: String,
        approved: bool,
        recommended: Option<RecommendedPlaylist>,
    },
    SessionCreated(String),
    SessionFailed(String),
    PendingSynced(SyncReport),
}

/// A submission task and the record it carries, kept so shutdown can queue
/// the record if the task never finishes.
struct InFlightSubmit {
    record: ListeningRecord,
    handle: JoinHandle<()>,
}

pub struct Dispatcher {
    api: ApiClient,
    tx: mpsc::Sender<DispatchOutcome>,
    beacons: Vec<JoinHandle<()>>,
    submits: Vec<InFlightSubmit>,
    verify_gate: CycleGate,
    sync_gate: CycleGate,
}

impl Dispatcher {
    pub fn new(api: ApiClient, tx: mpsc::Sender<DispatchOutcome>) -> Self {
        Self {
            api,
            tx,
            beacons: Vec::new(),
            submits: Vec::new(),
            verify_gate: CycleGate::new(),
            sync_gate: CycleGate::new(),
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Point subsequent requests at another server (dev mode toggle).
    pub fn set_base_url(&mut self, base_url: &str) {
        if self.api.base_url() != base_url {
            info!("Server URL now {}", base_url);
            self.api = self.api.with_base_url(base_url);
        }
    }

    /// Fire-and-forget event notification. Failures are logged and dropped;
    /// only auth expiry is reported back.
    pub fn report(&self, creds: Option<Credentials>, event: EventNotification) {
        let Some(creds) = creds else {
            debug!("No token, {} event not sent", event.event_type);
            return;
        };
        let api = self.api.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            match api.post_event(&creds, &event).await {
                Ok(()) => {}
                Err(ApiError::SessionExpired { message, ip_conflict }) => {
                    warn!("Session expired while reporting {}", event.event_type);
                    let _ = tx.send(DispatchOutcome::SessionExpired { message, ip_conflict }).await;
                }
                Err(e) => warn!("Event {} not delivered: {}", event.event_type, e),
            }
        });
    }

    /// Header-less delivery for teardown. The handle is kept so shutdown can
    /// give it a bounded chance to finish.
    pub fn beacon(&mut self, event: EventNotification) {
        let api = self.api.clone();
        self.beacons.retain(|h| !h.is_finished());
        self.beacons.push(tokio::spawn(async move {
            if let Err(e) = api.send_beacon(&event).await {
                warn!("Beacon for {} failed: {}", event.youtube_track_id, e);
            }
        }));
    }

    /// Persist a finished record. A failure comes back as `SubmitFailed` so
    /// the driver can queue the record.
    pub fn submit(&mut self, creds: Option<Credentials>, record: ListeningRecord, client_id: String, epoch: u64) {
        self.submits.retain(|s| !s.handle.is_finished());
        let tx = self.tx.clone();
        let kept = record.clone();
        let Some(creds) = creds else {
            let handle = tokio::spawn(async move {
                let _ = tx
                    .send(DispatchOutcome::SubmitFailed {
                        record,
                        reason: ApiError::NotAuthenticated.to_string(),
                    })
                    .await;
            });
            self.submits.push(InFlightSubmit { record: kept, handle });
            return;
        };
        let api = self.api.clone();
        let handle = tokio::spawn(async move {
            let record_id = record.record_id.clone().unwrap_or(client_id);
            let submission = ListeningSubmission::from_record(&record, &record_id);
            let outcome = match api.submit_listening(&creds, &submission).await {
                Ok(history_id) => {
                    info!("Listening record saved for {}", record.track.external_id);
                    DispatchOutcome::Submitted {
                        key: record.key(),
                        history_id,
                        epoch,
                    }
                }
                Err(e) => {
                    warn!("Listening record for {} not saved: {}", record.track.external_id, e);
                    if let ApiError::SessionExpired { message, ip_conflict } = &e {
                        let _ = tx
                            .send(DispatchOutcome::SessionExpired {
                                message: message.clone(),
                                ip_conflict: *ip_conflict,
                            })
                            .await;
                    }
                    DispatchOutcome::SubmitFailed {
                        record,
                        reason: e.to_string(),
                    }
                }
            };
            let _ = tx.send(outcome).await;
        });
        self.submits.push(InFlightSubmit { record: kept, handle });
    }

    /// One approval check at a time; a request while one is running is
    /// dropped.
    pub fn verify(&self, creds: Option<Credentials>, external_id: String) {
        let Some(creds) = creds else {
            return;
        };
        let Some(guard) = self.verify_gate.try_enter() else {
            debug!("Track check already running, skipping {}", external_id);
            return;
        };
        let api = self.api.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let approved = match api.verify_track(&creds, &external_id).await {
                Ok(approved) => approved,
                Err(e) => {
                    debug!("Track check for {} failed: {}", external_id, e);
                    return;
                }
            };
            let recommended = if approved {
                None
            } else {
                match api.recommended_playlist(&creds).await {
                    Ok(playlist) => playlist,
                    Err(e) => {
                        debug!("No recommended playlist: {}", e);
                        None
                    }
                }
            };
            let _ = tx
                .send(DispatchOutcome::TrackVerified {
                    external_id,
                    approved,
                    recommended,
                })
                .await;
        });
    }

    pub fn create_session(&self, token: String, device: DeviceInfo) {
        let api = self.api.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = match api.create_session(&token, &device).await {
                Ok(id) => DispatchOutcome::SessionCreated(id),
                Err(e) => DispatchOutcome::SessionFailed(e.to_string()),
            };
            let _ = tx.send(outcome).await;
        });
    }

    /// Replay the offline queue. Skipped when a pass is already running.
    pub fn sync_pending(&self, creds: Option<Credentials>, pending: Vec<ListeningRecord>, client_id: String) {
        let Some(creds) = creds else {
            debug!("No token, pending sync skipped");
            return;
        };
        if pending.is_empty() {
            return;
        }
        let Some(guard) = self.sync_gate.try_enter() else {
            debug!("Pending sync already running");
            return;
        };
        let api = self.api.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _guard = guard;
            info!("Syncing {} pending records", pending.len());
            let report = api.sync_pending(&creds, &pending, &client_id).await;
            let _ = tx.send(DispatchOutcome::PendingSynced(report)).await;
        });
    }

    /// Wait up to `bound` for outstanding beacons and submissions. Tasks
    /// still running afterwards are aborted; the records of aborted
    /// submissions are returned so the caller can queue them.
    pub async fn drain(&mut self, bound: Duration) -> Vec<ListeningRecord> {
        let beacons = std::mem::take(&mut self.beacons);
        let mut submits = std::mem::take(&mut self.submits);
        if beacons.is_empty() && submits.is_empty() {
            return Vec::new();
        }

        let wait = async {
            for handle in beacons {
                let _ = handle.await;
            }
            for submit in submits.iter_mut() {
                let _ = (&mut submit.handle).await;
            }
        };
        if tokio::time::timeout(bound, wait).await.is_err() {
            warn!("Gave up on in-flight deliveries after {:?}", bound);
        }

        submits
            .into_iter()
            .filter(|s| !s.handle.is_finished())
            .map(|s| {
                s.handle.abort();
                s.record
            })
            .collect()
    }
}
