//! Call-history recording.
//!
//! Entries use the relay's log shape verbatim (`user`/`type`/`status`
//! field names, `M:SS` duration strings) so the HTTP backend talks to
//! the relay's `/history/{init_data}` endpoint without translation and
//! the file backend stays interchangeable with it.

use crate::call::session::{CallOutcome, CallSession};
use crate::types::{CallDirection, MediaKind, PeerInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;

/// The relay keeps at most this many entries per room; the file backend
/// applies the same cap.
pub const MAX_HISTORY_ENTRIES: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history server returned status {0}")]
    Status(u16),
    #[error("history request failed: {0}")]
    Http(String),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("history task failed: {0}")]
    Join(String),
}

/// One concluded call, newest first in every listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(rename = "user")]
    pub peer: PeerInfo,
    #[serde(rename = "type")]
    pub media: MediaKind,
    pub direction: CallDirection,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "status")]
    pub outcome: CallOutcome,
    #[serde(with = "duration_str", default)]
    pub duration: Option<i64>,
}

impl HistoryEntry {
    /// Captures a finished session. Returns `None` while the session has
    /// not reached its terminal phase yet.
    pub fn from_session(session: &CallSession) -> Option<Self> {
        let outcome = session.outcome()?;
        Some(Self {
            peer: session.peer.clone(),
            media: session.media,
            direction: session.direction,
            timestamp: session.started_at,
            outcome,
            duration: session.duration_secs(),
        })
    }
}

/// Durations travel as `M:SS` strings (`67` seconds is `"1:07"`),
/// matching what call UIs render directly.
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(total_secs: i64) -> String {
        let total_secs = total_secs.max(0);
        format!("{}:{:02}", total_secs / 60, total_secs % 60)
    }

    pub fn parse(text: &str) -> Result<i64, String> {
        let (minutes, seconds) = text
            .split_once(':')
            .ok_or_else(|| format!("bad duration {text:?}"))?;
        let minutes: i64 = minutes
            .parse()
            .map_err(|_| format!("bad duration {text:?}"))?;
        let seconds: i64 = seconds
            .parse()
            .map_err(|_| format!("bad duration {text:?}"))?;
        if !(0..60).contains(&seconds) || minutes < 0 {
            return Err(format!("bad duration {text:?}"));
        }
        Ok(minutes * 60 + seconds)
    }

    pub fn serialize<S: Serializer>(secs: &Option<i64>, s: S) -> Result<S::Ok, S::Error> {
        match secs {
            Some(total) => s.serialize_some(&format(*total)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw {
            None => Ok(None),
            Some(text) => parse(&text).map(Some).map_err(serde::de::Error::custom),
        }
    }
}

/// Where concluded calls get written and read back.
#[async_trait]
pub trait HistoryBackend: Send + Sync {
    async fn append(&self, entry: &HistoryEntry) -> Result<(), HistoryError>;
    async fn list(&self) -> Result<Vec<HistoryEntry>, HistoryError>;
}

fn map_ureq(e: ureq::Error) -> HistoryError {
    match e {
        ureq::Error::StatusCode(code) => HistoryError::Status(code),
        other => HistoryError::Http(other.to_string()),
    }
}

/// Relay-hosted history. The relay owns ordering and the entry cap; we
/// just post entries and read the list back.
pub struct HttpHistoryStore {
    endpoint: String,
}

impl HttpHistoryStore {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl HistoryBackend for HttpHistoryStore {
    async fn append(&self, entry: &HistoryEntry) -> Result<(), HistoryError> {
        let url = self.endpoint.clone();
        let body = serde_json::to_vec(entry)?;
        tokio::task::spawn_blocking(move || {
            let resp = ureq::post(&url)
                .header("Content-Type", "application/json")
                .send(&body[..])
                .map_err(map_ureq)?;
            if !resp.status().is_success() {
                return Err(HistoryError::Status(resp.status().as_u16()));
            }
            Ok(())
        })
        .await
        .map_err(|e| HistoryError::Join(e.to_string()))?
    }

    async fn list(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        let url = self.endpoint.clone();
        let bytes = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, HistoryError> {
            let resp = ureq::get(&url).call().map_err(map_ureq)?;
            if !resp.status().is_success() {
                return Err(HistoryError::Status(resp.status().as_u16()));
            }
            resp.into_body().read_to_vec().map_err(map_ureq)
        })
        .await
        .map_err(|e| HistoryError::Join(e.to_string()))??;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Local JSON file, for rooms the relay keeps no history for. Newest
/// entry first, capped like the relay's own log.
pub struct FileHistoryStore {
    path: PathBuf,
}

impl FileHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_all(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl HistoryBackend for FileHistoryStore {
    async fn append(&self, entry: &HistoryEntry) -> Result<(), HistoryError> {
        let mut entries = self.read_all().await?;
        entries.insert(0, entry.clone());
        entries.truncate(MAX_HISTORY_ENTRIES);
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.path, serde_json::to_vec_pretty(&entries)?).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        self.read_all().await
    }
}

/// Fire-and-forget recording wrapper; call teardown never waits on
/// history I/O.
#[derive(Clone)]
pub struct HistoryRecorder {
    backend: Arc<dyn HistoryBackend>,
}

impl HistoryRecorder {
    pub fn new(backend: Arc<dyn HistoryBackend>) -> Self {
        Self { backend }
    }

    pub fn record(&self, session: &CallSession) {
        let Some(entry) = HistoryEntry::from_session(session) else {
            warn!(target: "History", "Refusing to record a call that has not ended");
            return;
        };
        let backend = self.backend.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.append(&entry).await {
                warn!(target: "History", "Could not record call: {e}");
            }
        });
    }

    pub async fn list(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        self.backend.list().await
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryHistory {
        pub entries: Mutex<Vec<HistoryEntry>>,
        pub fail_appends: bool,
    }

    impl MemoryHistory {
        pub fn recorded(&self) -> Vec<HistoryEntry> {
            self.entries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HistoryBackend for MemoryHistory {
        async fn append(&self, entry: &HistoryEntry) -> Result<(), HistoryError> {
            if self.fail_appends {
                return Err(HistoryError::Http("scripted failure".to_string()));
            }
            self.entries.lock().unwrap().insert(0, entry.clone());
            Ok(())
        }

        async fn list(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
            Ok(self.recorded())
        }
    }
}
