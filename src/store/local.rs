use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use super::kv::{KeyValueStore, StoreError};
use crate::kernel::event::{ListeningRecord, RecordKey};

pub const TOKEN: &str = "token";
pub const SESSION_ID: &str = "sessionId";
pub const DEV_MODE: &str = "dev_mode";
pub const DEBUG_MODE: &str = "debugMode";
pub const HISTORY: &str = "history";
pub const PENDING: &str = "pending";
pub const DARK_MODE: &str = "darkMode";
pub const CLIENT_ID: &str = "clientId";

pub const HISTORY_LIMIT: usize = 1000;

/// Listening totals for one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DayStats {
    pub minutes: u64,
    pub tracks: usize,
}

pub fn day_stats(records: &[ListeningRecord], day: NaiveDate) -> DayStats {
    records
        .iter()
        .filter(|r| r.started_on() == day)
        .fold(DayStats::default(), |acc, r| DayStats {
            minutes: acc.minutes + (r.actual_duration_seconds.max(0.0) / 60.0).floor() as u64,
            tracks: acc.tracks + 1,
        })
}

/// Typed view over the persisted key/value state.
pub struct LocalState<S: KeyValueStore> {
    store: S,
    history_limit: usize,
}

impl<S: KeyValueStore> LocalState<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            history_limit: HISTORY_LIMIT,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.store.get(key)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Ignoring unreadable '{}' entry: {}", key, e);
                None
            }
        }
    }

    fn write<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StoreError> {
        let value: Value = serde_json::to_value(value)?;
        self.store.set(key, value)
    }

    pub fn token(&self) -> Option<String> {
        self.read::<String>(TOKEN).filter(|t| !t.is_empty())
    }

    pub fn set_token(&mut self, token: &str, session_id: Option<&str>) -> Result<(), StoreError> {
        self.write(TOKEN, &token)?;
        if let Some(id) = session_id {
            self.write(SESSION_ID, &id)?;
        }
        Ok(())
    }

    pub fn session_id(&self) -> Option<String> {
        self.read::<String>(SESSION_ID).filter(|s| !s.is_empty())
    }

    pub fn set_session_id(&mut self, id: &str) -> Result<(), StoreError> {
        self.write(SESSION_ID, &id)
    }

    pub fn clear_session(&mut self) -> Result<(), StoreError> {
        self.store.remove(SESSION_ID)
    }

    pub fn dev_mode(&self) -> bool {
        self.read(DEV_MODE).unwrap_or(false)
    }

    pub fn set_dev_mode(&mut self, enabled: bool) -> Result<(), StoreError> {
        self.write(DEV_MODE, &enabled)
    }

    pub fn debug_mode(&self) -> Option<bool> {
        self.read(DEBUG_MODE)
    }

    pub fn set_debug_mode(&mut self, enabled: bool) -> Result<(), StoreError> {
        self.write(DEBUG_MODE, &enabled)
    }

    pub fn dark_mode(&self) -> bool {
        self.read(DARK_MODE).unwrap_or(false)
    }

    pub fn set_dark_mode(&mut self, enabled: bool) -> Result<(), StoreError> {
        self.write(DARK_MODE, &enabled)
    }

    /// Persistent per-install id, created on first use.
    pub fn client_id(&mut self) -> Result<String, StoreError> {
        if let Some(id) = self.read::<String>(CLIENT_ID).filter(|s| !s.is_empty()) {
            return Ok(id);
        }
        let id = format!("odo-{}", Uuid::new_v4());
        self.write(CLIENT_ID, &id)?;
        info!("Generated client id {}", id);
        Ok(id)
    }

    pub fn history(&self) -> Vec<ListeningRecord> {
        self.read(HISTORY).unwrap_or_default()
    }

    /// Append and keep only the most recent entries. Returns the new length.
    pub fn append_history(&mut self, record: ListeningRecord) -> Result<usize, StoreError> {
        let mut history = self.history();
        history.push(record);
        if history.len() > self.history_limit {
            let excess = history.len() - self.history_limit;
            history.drain(..excess);
        }
        self.write(HISTORY, &history)?;
        Ok(history.len())
    }

    /// Attach a server record id to the matching history entry.
    pub fn set_history_id(&mut self, key: &RecordKey, history_id: &str) -> Result<bool, StoreError> {
        let mut history = self.history();
        let Some(entry) = history.iter_mut().rev().find(|r| &r.key() == key) else {
            return Ok(false);
        };
        entry.history_id = Some(history_id.to_string());
        self.write(HISTORY, &history)?;
        Ok(true)
    }

    pub fn clear_history(&mut self) -> Result<(), StoreError> {
        self.write(HISTORY, &Vec::<ListeningRecord>::new())
    }

    pub fn pending(&self) -> Vec<ListeningRecord> {
        self.read(PENDING).unwrap_or_default()
    }

    /// Queue an undelivered record. A record with the same (external id,
    /// start time) already queued is not added again.
    pub fn queue_pending(&mut self, record: ListeningRecord) -> Result<bool, StoreError> {
        let mut pending = self.pending();
        let key = record.key();
        if pending.iter().any(|r| r.key() == key) {
            info!("Already pending: {} at {}", key.external_id, key.started_at);
            return Ok(false);
        }
        pending.push(record);
        self.write(PENDING, &pending)?;
        Ok(true)
    }

    pub fn remove_pending(&mut self, delivered: &[RecordKey]) -> Result<usize, StoreError> {
        let mut pending = self.pending();
        pending.retain(|r| !delivered.contains(&r.key()));
        self.write(PENDING, &pending)?;
        Ok(pending.len())
    }

    pub fn today_stats(&self, today: NaiveDate) -> DayStats {
        day_stats(&self.history(), today)
    }
}
