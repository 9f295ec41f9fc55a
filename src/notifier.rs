//! Update polling.
//!
//! The notifier pings the tracker on an interval, stores the issues and
//! comments it gets back, and announces new replies on the event bus.

use serde::Deserialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::event::{EventBus, JmcEvent};
use crate::localization::Localizer;
use crate::pinger::Pinger;
use crate::storage::{IssueStore, StoredComment, StoredIssue};
use crate::transport::TransportError;

/// Body of the updates endpoint.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct IssueUpdates {
    pub since_millis: i64,
    pub issues_with_comments: Vec<IssueWithComments>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct IssueWithComments {
    pub key: String,
    pub summary: Option<String>,
    pub status: Option<String>,
    pub description: Option<String>,
    pub date_created: i64,
    pub date_updated: i64,
    pub has_updates: bool,
    pub comments: Vec<RemoteComment>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteComment {
    pub username: String,
    pub text: String,
    pub date: i64,
    pub system_user: bool,
}

impl IssueUpdates {
    /// Parses an updates body. An empty body means "nothing new".
    pub fn parse(body: &str) -> Result<Self, TransportError> {
        if body.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(body)
            .map_err(|e| TransportError::MalformedResponse(format!("invalid updates body: {e}")))
    }
}

/// What one poll brought in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub message: String,
    pub issue_keys: Vec<String>,
    pub comment_count: usize,
}

#[derive(Debug, Default)]
struct NotifierState {
    last: Option<Notification>,
}

#[derive(Clone)]
pub struct Notifier {
    pinger: Pinger,
    store: Arc<tokio::sync::Mutex<IssueStore>>,
    bus: EventBus,
    localizer: Arc<Localizer>,
    locale: String,
    state: Arc<Mutex<NotifierState>>,
}

impl Notifier {
    pub fn new(
        pinger: Pinger,
        store: Arc<tokio::sync::Mutex<IssueStore>>,
        bus: EventBus,
        localizer: Arc<Localizer>,
        locale: impl Into<String>,
    ) -> Self {
        Self {
            pinger,
            store,
            bus,
            localizer,
            locale: locale.into(),
            state: Arc::new(Mutex::new(NotifierState::default())),
        }
    }

    pub fn pinger(&self) -> &Pinger {
        &self.pinger
    }

    /// Most recent notification, if any poll produced one.
    pub fn last_notification(&self) -> Option<Notification> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last
            .clone()
    }

    /// Issues with replies the user has not opened yet.
    pub async fn unread_count(&self) -> rusqlite::Result<i64> {
        self.store.lock().await.unread_count()
    }

    /// Polls once. Returns a notification when new comments arrived.
    pub async fn poll_once(&self) -> Result<Option<Notification>, TransportError> {
        let body = self.pinger.ping().await?;
        let updates = IssueUpdates::parse(&body)?;

        let mut new_comments: Vec<(String, String)> = Vec::new();
        {
            let store = self.store.lock().await;
            for issue in &updates.issues_with_comments {
                if issue.key.is_empty() {
                    continue;
                }
                let mut fresh = 0;
                let mut echoed = 0;
                for comment in &issue.comments {
                    let stored = StoredComment {
                        id: 0,
                        issue_key: issue.key.clone(),
                        author: comment.username.clone(),
                        body: comment.text.clone(),
                        date: comment.date,
                        system_user: comment.system_user,
                    };
                    match store.insert_comment(&stored) {
                        Ok(Some(_)) => {
                            // Our own reply coming back replaces the local copy.
                            let own = store
                                .remove_local_comment(&issue.key, self.pinger.uuid(), &comment.text)
                                .unwrap_or_else(|e| {
                                    tracing::warn!(issue = %issue.key, "failed to match local comment: {e}");
                                    false
                                });
                            if own {
                                echoed += 1;
                            } else {
                                fresh += 1;
                                new_comments.push((issue.key.clone(), comment.username.clone()));
                            }
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!(issue = %issue.key, "failed to store comment: {e}"),
                    }
                }

                let record = StoredIssue {
                    key: issue.key.clone(),
                    summary: issue.summary.clone(),
                    status: issue.status.clone(),
                    description: issue.description.clone(),
                    date_created: issue.date_created,
                    date_updated: issue.date_updated,
                    has_updates: fresh > 0 || (issue.has_updates && echoed == 0),
                };
                if let Err(e) = store.upsert_issue(&record) {
                    tracing::warn!(issue = %issue.key, "failed to store issue: {e}");
                }
            }
        }

        if new_comments.is_empty() {
            return Ok(None);
        }

        let notification = self.build_notification(&new_comments);
        tracing::info!(
            comments = notification.comment_count,
            issues = notification.issue_keys.len(),
            "new replies received"
        );

        self.state.lock().unwrap_or_else(PoisonError::into_inner).last = Some(notification.clone());
        self.bus.publish(JmcEvent::CommentsReceived {
            message: notification.message.clone(),
            issue_keys: notification.issue_keys.clone(),
            comment_count: notification.comment_count,
        });

        Ok(Some(notification))
    }

    fn build_notification(&self, new_comments: &[(String, String)]) -> Notification {
        let mut issue_keys: Vec<String> = new_comments.iter().map(|(key, _)| key.clone()).collect();
        issue_keys.dedup();

        let message = match new_comments {
            [(issue, author)] => self.localizer.format(
                "notification.single",
                &self.locale,
                &[("author", author.as_str()), ("issue", issue.as_str())],
            ),
            _ => {
                let count = new_comments.len().to_string();
                let issues = issue_keys.len().to_string();
                self.localizer.format(
                    "notification.multiple",
                    &self.locale,
                    &[("count", count.as_str()), ("issues", issues.as_str())],
                )
            }
        };

        Notification {
            message,
            issue_keys,
            comment_count: new_comments.len(),
        }
    }

    /// Polls every `interval` until `cancel` fires. Failures are logged and
    /// the loop keeps going.
    pub fn spawn(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let notifier = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = notifier.poll_once().await {
                            tracing::warn!(kind = ?err.kind(), "notification poll failed: {err}");
                        }
                    }
                }
            }
            tracing::debug!("notifier stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JmcConfig;
    use crate::event::RECEIVED_COMMENTS;
    use crate::transport::{Transport, TransportErrorKind};
    use std::collections::BTreeMap;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const UPDATES: &str = r#"{
        "sinceMillis": 1700000000000,
        "issuesWithComments": [
            {
                "key": "APP-1",
                "summary": "Crash on launch",
                "status": "Open",
                "dateCreated": 1690000000000,
                "dateUpdated": 1700000000000,
                "hasUpdates": true,
                "comments": [
                    {"username": "support", "text": "Which device?", "date": 1695000000000, "systemUser": true}
                ]
            },
            {
                "key": "APP-2",
                "summary": "Typo",
                "dateCreated": 1690000000000,
                "dateUpdated": 1690000000000,
                "comments": []
            }
        ]
    }"#;

    async fn notifier_for(body: ResponseTemplate) -> (Notifier, EventBus, MockServer) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(body)
            .mount(&server)
            .await;

        let config = JmcConfig::new(server.uri(), "APP").resolve().unwrap();
        let transport = Transport::new(&config, BTreeMap::new());
        let bus = EventBus::new();
        let pinger = Pinger::new(transport, bus.clone());
        let store = Arc::new(tokio::sync::Mutex::new(IssueStore::open_in_memory().unwrap()));
        let notifier = Notifier::new(pinger, store, bus.clone(), Arc::new(Localizer::builtin()), "en");
        (notifier, bus, server)
    }

    #[test]
    fn parse_accepts_empty_body() {
        assert_eq!(IssueUpdates::parse("  ").unwrap(), IssueUpdates::default());
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = IssueUpdates::parse("<html>").unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::MalformedResponse);
    }

    #[tokio::test]
    async fn poll_stores_updates_and_notifies_once() {
        let (notifier, bus, _server) =
            notifier_for(ResponseTemplate::new(200).set_body_string(UPDATES)).await;
        let mut rx = bus.subscribe();

        let notification = notifier.poll_once().await.unwrap().unwrap();
        assert_eq!(notification.message, "support replied to APP-1");
        assert_eq!(notification.issue_keys, vec!["APP-1".to_string()]);
        assert_eq!(notifier.unread_count().await.unwrap(), 1);
        assert_eq!(notifier.last_notification(), Some(notification));

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert!(names.contains(&RECEIVED_COMMENTS));

        // Same comments again: nothing new.
        assert!(notifier.poll_once().await.unwrap().is_none());
        assert_eq!(notifier.store.lock().await.count().unwrap(), 2);
    }

    #[tokio::test]
    async fn malformed_body_is_reported() {
        let (notifier, _, _server) =
            notifier_for(ResponseTemplate::new(200).set_body_string("not json")).await;
        let err = notifier.poll_once().await.unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::MalformedResponse);
    }

    #[tokio::test]
    async fn spawned_loop_stops_on_cancel() {
        let (notifier, _, _server) =
            notifier_for(ResponseTemplate::new(200).set_body_string("{}")).await;
        let cancel = CancellationToken::new();
        let handle = notifier.spawn(Duration::from_millis(20), cancel.clone());

        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(notifier.pinger().last_successful_ping().is_some());
    }
}
