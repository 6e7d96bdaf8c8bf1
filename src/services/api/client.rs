use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use super::types::{
    Credentials, DeviceInfo, ErrorBody, ListeningSubmission, RecommendedPlaylist,
    RecommendedResponse, SessionRequest, SessionResponse, SubmitResponse, VerifyResponse,
};
use crate::kernel::event::{EventNotification, ListeningRecord, RecordKey};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server responded with status {0}")]
    Status(u16),
    #[error("session expired: {message}")]
    SessionExpired { message: String, ip_conflict: bool },
    #[error("unexpected response body: {0}")]
    Decode(String),
    #[error("no auth token stored")]
    NotAuthenticated,
}

impl ApiError {
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ApiError::SessionExpired { .. })
    }
}

/// Outcome of replaying the offline queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub delivered: Vec<RecordKey>,
    pub remaining: usize,
    /// Set when a 401 stopped the replay early.
    pub stopped_by_auth: bool,
}

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Same connection pool, different server.
    pub fn with_base_url(&self, base_url: impl Into<String>) -> Self {
        Self {
            client: self.client.clone(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: RequestBuilder, creds: &Credentials) -> RequestBuilder {
        let builder = builder.bearer_auth(&creds.token);
        match creds.session_id.as_deref() {
            Some(id) if !id.is_empty() => builder.header("X-Session-ID", id),
            _ => builder,
        }
    }

    /// Map non-2xx responses to errors. A 401 carrying
    /// `{"error": "session_expired"}` becomes [`ApiError::SessionExpired`].
    async fn check(response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED {
            let body: ErrorBody = response.json().await.unwrap_or_default();
            if body.error.as_deref() == Some("session_expired") {
                return Err(ApiError::SessionExpired {
                    message: body
                        .message
                        .unwrap_or_else(|| "Your session has expired.".to_string()),
                    ip_conflict: body.ip_conflict.unwrap_or(false),
                });
            }
        }
        Err(ApiError::Status(status.as_u16()))
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// `POST /api/listening/event`.
    pub async fn post_event(&self, creds: &Credentials, event: &EventNotification) -> Result<(), ApiError> {
        let request = self.client.post(self.url("/api/listening/event")).json(event);
        let response = self.authorized(request, creds).send().await?;
        Self::check(response).await?;
        debug!("Event {} delivered for {}", event.event_type, event.youtube_track_id);
        Ok(())
    }

    /// Unload-safe variant of [`post_event`](Self::post_event): no auth
    /// headers, the caller does not wait for an answer.
    pub async fn send_beacon(&self, event: &EventNotification) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url("/api/listening/event"))
            .json(event)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// `POST /api/listening`. Returns the server's history id, if any.
    pub async fn submit_listening(&self, creds: &Credentials, submission: &ListeningSubmission) -> Result<Option<String>, ApiError> {
        let request = self.client.post(self.url("/api/listening")).json(submission);
        let response = Self::check(self.authorized(request, creds).send().await?).await?;
        let body: SubmitResponse = Self::decode(response).await.unwrap_or_else(|e| {
            warn!("Submission accepted but body unreadable: {}", e);
            SubmitResponse::default()
        });
        Ok(body.history_id())
    }

    /// `POST /api/extention/session`. Returns the new session id.
    pub async fn create_session(&self, token: &str, device: &DeviceInfo) -> Result<String, ApiError> {
        let response = self
            .client
            .post(self.url("/api/extention/session"))
            .bearer_auth(token)
            .json(&SessionRequest { device_info: device })
            .send()
            .await?;
        let body: SessionResponse = Self::decode(Self::check(response).await?).await?;
        match body.session_id.filter(|s| !s.is_empty()) {
            Some(id) => Ok(id),
            None => Err(ApiError::Decode(
                body.error.unwrap_or_else(|| "missing sessionId".to_string()),
            )),
        }
    }

    /// `GET /api/track/verify/{id}`.
    pub async fn verify_track(&self, creds: &Credentials, external_id: &str) -> Result<bool, ApiError> {
        let request = self
            .client
            .get(self.url(&format!("/api/track/verify/{}", external_id)));
        let response = Self::check(self.authorized(request, creds).send().await?).await?;
        let body: VerifyResponse = Self::decode(response).await?;
        Ok(body.in_playlist)
    }

    /// `GET /api/playlists/recommended`. First entry, if any.
    pub async fn recommended_playlist(&self, creds: &Credentials) -> Result<Option<RecommendedPlaylist>, ApiError> {
        let request = self.client.get(self.url("/api/playlists/recommended"));
        let response = Self::check(self.authorized(request, creds).send().await?).await?;
        let body: RecommendedResponse = Self::decode(response).await?;
        Ok(body.playlists.into_iter().next())
    }

    /// `GET /api`. Any 2xx counts as reachable.
    pub async fn test_connection(&self) -> Result<Value, ApiError> {
        let response = Self::check(self.client.get(self.url("/api")).send().await?).await?;
        Ok(Self::decode(response).await.unwrap_or(Value::Null))
    }

    /// Replay queued records in order. Stops at the first 401; other
    /// failures leave that record queued and move on.
    pub async fn sync_pending(&self, creds: &Credentials, pending: &[ListeningRecord], client_id: &str) -> SyncReport {
        let mut report = SyncReport::default();
        for record in pending {
            let record_id = record
                .record_id
                .clone()
                .unwrap_or_else(|| client_id.to_string());
            let submission = ListeningSubmission::from_record(record, &record_id);
            match self.submit_listening(creds, &submission).await {
                Ok(_) => report.delivered.push(record.key()),
                Err(ApiError::SessionExpired { .. }) | Err(ApiError::Status(401)) => {
                    warn!("Pending sync stopped: not authorized");
                    report.stopped_by_auth = true;
                    break;
                }
                Err(e) => warn!("Pending record {} not delivered: {}", record.track.external_id, e),
            }
        }
        report.remaining = pending.len() - report.delivered.len();
        report
    }
}
