//! Broadcast events.
//!
//! Components signal each other through named events on an [`EventBus`].
//! Names are stable strings so hosts can route them into their own
//! notification systems.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// New comments arrived on issues raised from this install.
pub const RECEIVED_COMMENTS: &str = "JMCReceivedCommentsNotification";

/// The pinger reached the tracker.
pub const LAST_SUCCESSFUL_PING_TIME: &str = "JMCLastSuccessfulPingTime";

/// An issue was created from this install.
pub const NEW_ISSUE_CREATED: &str = "JMCNewIssueCreated";

const EVENT_CAPACITY: usize = 64;

/// Events published by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum JmcEvent {
    CommentsReceived {
        /// Localized banner text
        message: String,
        issue_keys: Vec<String>,
        comment_count: usize,
    },
    LastSuccessfulPing {
        at: DateTime<Utc>,
    },
    NewIssueCreated {
        issue_key: Option<String>,
        /// Raw server response
        response: String,
    },
}

impl JmcEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CommentsReceived { .. } => RECEIVED_COMMENTS,
            Self::LastSuccessfulPing { .. } => LAST_SUCCESSFUL_PING_TIME,
            Self::NewIssueCreated { .. } => NEW_ISSUE_CREATED,
        }
    }
}

/// Fan-out channel for [`JmcEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JmcEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JmcEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, event: JmcEvent) {
        let name = event.name();
        match self.tx.send(event) {
            Ok(receivers) => tracing::trace!(event = name, receivers, "event published"),
            Err(_) => tracing::trace!(event = name, "event dropped, no subscribers"),
        }
    }
}
