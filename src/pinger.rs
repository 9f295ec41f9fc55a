//! Liveness beacon.
//!
//! A ping is a notifications fetch scoped to this install. Besides telling
//! the tracker the app is alive, it returns every update since the last
//! successful ping.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::LAST_PING_FILE_NAME;
use crate::event::{EventBus, JmcEvent};
use crate::transport::{Transport, TransportError};

#[derive(Clone)]
pub struct Pinger {
    transport: Transport,
    bus: EventBus,
    project: String,
    uuid: String,
    last_success: Arc<Mutex<Option<DateTime<Utc>>>>,
    state_file: Option<PathBuf>,
}

impl Pinger {
    pub fn new(transport: Transport, bus: EventBus) -> Self {
        let identity = transport.identity();
        let project = identity.project.clone();
        let uuid = identity.uuid.clone();
        Self {
            transport,
            bus,
            project,
            uuid,
            last_success: Arc::new(Mutex::new(None)),
            state_file: None,
        }
    }

    /// Persists the last successful ping time in `dir` and resumes from the
    /// value stored there. An unreadable file counts as "never pinged".
    pub fn with_state_dir(mut self, dir: &Path) -> Self {
        let path = dir.join(LAST_PING_FILE_NAME);
        let restored = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single());
        if let Some(at) = restored {
            tracing::debug!(%at, "resuming from last successful ping");
        }
        self.last_success = Arc::new(Mutex::new(restored));
        self.state_file = Some(path);
        self
    }

    /// Install identifier sent with every ping.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Time of the last ping the tracker answered.
    pub fn last_successful_ping(&self) -> Option<DateTime<Utc>> {
        *self.last_success.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Query parameters for the next ping.
    pub fn ping_params(&self) -> BTreeMap<String, String> {
        let since = self
            .last_successful_ping()
            .map(|at| at.timestamp_millis())
            .unwrap_or(0);
        BTreeMap::from([
            ("project".to_string(), self.project.clone()),
            ("uuid".to_string(), self.uuid.clone()),
            ("sinceMillis".to_string(), since.to_string()),
        ])
    }

    /// Sends one ping and returns the raw update body.
    pub async fn ping(&self) -> Result<String, TransportError> {
        let started = Utc::now();
        let body = self.transport.fetch_notifications(&self.ping_params()).await?;

        *self.last_success.lock().unwrap_or_else(PoisonError::into_inner) = Some(started);
        if let Some(path) = &self.state_file {
            if let Err(e) = std::fs::write(path, started.timestamp_millis().to_string()) {
                tracing::warn!(path = %path.display(), "failed to persist ping time: {e}");
            }
        }
        self.bus.publish(JmcEvent::LastSuccessfulPing { at: started });
        tracing::debug!(bytes = body.len(), "ping succeeded");

        Ok(body)
    }
}
