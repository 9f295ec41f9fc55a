//! The client facade.
//!
//! [`Jmc`] owns the resolved configuration and every component built from
//! it. It is an ordinary value handed to whoever needs it; hosts that want a
//! single process-wide instance can [`install`](Jmc::install) one.

use chrono::Utc;
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, Configuration, JmcConfig};
use crate::crash::{install_panic_hook, CrashError, CrashReportCache, CrashSendSummary, CrashSender};
use crate::event::{EventBus, JmcEvent};
use crate::issue::{Attachment, AttachmentKind, CreatedIssue, IssueReport, IssueType};
use crate::localization::Localizer;
use crate::notifier::Notifier;
use crate::pinger::Pinger;
use crate::storage::{IssueStore, StoredComment, StoredIssue, DATABASE_FILE_NAME};
use crate::transport::{Transport, TransportError};
use crate::views::{IssueComposer, IssueInbox};

static INSTANCE: Lazy<RwLock<Option<Jmc>>> = Lazy::new(|| RwLock::new(None));

/// Facade errors.
#[derive(Debug, Error)]
pub enum JmcError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Issue store failed: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Crash(#[from] CrashError),

    #[error("I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} attachments are disabled")]
    FeatureDisabled(&'static str),

    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

/// Host-supplied data attached to every report.
///
/// Every method has a default, so hosts implement only what they need.
pub trait CustomDataSource: Send + Sync {
    /// Overrides the configured project key.
    fn project(&self) -> Option<String> {
        None
    }

    fn custom_fields(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn payload(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Tracker issue-type name for `issue_type`.
    fn issue_type_name(&self, _issue_type: IssueType) -> Option<String> {
        None
    }

    /// Extra attachment added to every report, e.g. an app log.
    fn attachment(&self) -> Option<Attachment> {
        None
    }
}

/// What the user entered in the issue composer.
#[derive(Debug, Clone)]
pub struct IssueDraft {
    pub issue_type: IssueType,
    pub description: String,
    pub attachments: Vec<Attachment>,
}

impl IssueDraft {
    pub fn feedback(description: impl Into<String>) -> Self {
        Self {
            issue_type: IssueType::Feedback,
            description: description.into(),
            attachments: Vec::new(),
        }
    }
}

/// Result of a successful submission.
#[derive(Debug, Clone)]
pub struct SubmittedIssue {
    /// Raw server response
    pub response: String,
    /// Parsed issue, when the server answered with one
    pub issue: Option<CreatedIssue>,
}

struct JmcInner {
    config: Configuration,
    data_source: Option<Arc<dyn CustomDataSource>>,
    metadata: BTreeMap<String, String>,
    transport: Transport,
    notifier: Notifier,
    crash_sender: Option<CrashSender>,
    store: Arc<tokio::sync::Mutex<IssueStore>>,
    bus: EventBus,
    localizer: Arc<Localizer>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

/// Handle to a configured client. Clones share the same state.
#[derive(Clone)]
pub struct Jmc {
    inner: Arc<JmcInner>,
}

impl Jmc {
    /// Resolves `config` and builds every component bound to it.
    pub fn configure(
        config: JmcConfig,
        data_source: Option<Arc<dyn CustomDataSource>>,
    ) -> Result<Self, JmcError> {
        let mut config = config.resolve()?;
        if let Some(project) = data_source.as_ref().and_then(|ds| ds.project()) {
            config.project = project;
        }

        let mut localizer = Localizer::builtin();
        if let Some(dir) = &config.strings_dir {
            let loaded = localizer.load_dir(dir)?;
            tracing::debug!(dir = %dir.display(), tables = loaded, "loaded string tables");
        }
        let localizer = Arc::new(localizer);

        let store = match &config.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                IssueStore::open(dir.join(DATABASE_FILE_NAME))?
            }
            None => IssueStore::open_in_memory()?,
        };
        let store = Arc::new(tokio::sync::Mutex::new(store));

        let metadata = build_metadata(&config);
        let transport = Transport::new(&config, metadata.clone());
        let bus = EventBus::new();
        let mut pinger = Pinger::new(transport.clone(), bus.clone());
        if let Some(dir) = &config.data_dir {
            pinger = pinger.with_state_dir(dir);
        }
        let notifier = Notifier::new(
            pinger,
            store.clone(),
            bus.clone(),
            localizer.clone(),
            config.locale.clone(),
        );
        let crash_sender = match &config.crash_dir {
            Some(dir) => Some(CrashSender::new(transport.clone(), CrashReportCache::new(dir)?)),
            None => None,
        };

        tracing::info!(
            base_url = %config.base_url,
            project = %config.project,
            uuid = %config.uuid,
            "jmc configured"
        );

        Ok(Self {
            inner: Arc::new(JmcInner {
                config,
                data_source,
                metadata,
                transport,
                notifier,
                crash_sender,
                store,
                bus,
                localizer,
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
        })
    }

    /// Makes `jmc` the process-wide instance and returns the previous one.
    pub fn install(jmc: Jmc) -> Option<Jmc> {
        INSTANCE
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(jmc)
    }

    /// The process-wide instance, if one was installed.
    pub fn instance() -> Option<Jmc> {
        INSTANCE.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Configures and installs a new process-wide instance. The previous
    /// instance, if any, is shut down.
    pub fn configure_shared(
        config: JmcConfig,
        data_source: Option<Arc<dyn CustomDataSource>>,
    ) -> Result<Self, JmcError> {
        let jmc = Self::configure(config, data_source)?;
        if let Some(previous) = Self::install(jmc.clone()) {
            previous.shutdown();
        }
        Ok(jmc)
    }

    pub fn configuration(&self) -> &Configuration {
        &self.inner.config
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.inner.metadata
    }

    pub fn project(&self) -> &str {
        &self.inner.config.project
    }

    pub fn app_name(&self) -> &str {
        &self.inner.config.app_name
    }

    pub fn uuid(&self) -> String {
        self.inner.config.uuid.to_string()
    }

    pub fn is_photos_enabled(&self) -> bool {
        self.inner.config.photos_enabled
    }

    pub fn is_voice_enabled(&self) -> bool {
        self.inner.config.voice_enabled
    }

    /// Display name for an issue type: the configured override, then the
    /// data source, then `default_name`.
    pub fn issue_type_name_for(&self, issue_type: IssueType, default_name: &str) -> String {
        if let Some(name) = self.inner.config.issue_type_names.get(&issue_type) {
            return name.clone();
        }
        self.inner
            .data_source
            .as_ref()
            .and_then(|ds| ds.issue_type_name(issue_type))
            .unwrap_or_else(|| default_name.to_string())
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn localizer(&self) -> &Localizer {
        &self.inner.localizer
    }

    pub fn locale(&self) -> &str {
        &self.inner.config.locale
    }

    pub(crate) fn store(&self) -> &Arc<tokio::sync::Mutex<IssueStore>> {
        &self.inner.store
    }

    /// The create-issue view model.
    pub fn issue_composer(&self) -> IssueComposer {
        IssueComposer::new(self.clone())
    }

    /// The issue-list view model.
    pub fn issue_inbox(&self) -> IssueInbox {
        IssueInbox::new(self.clone())
    }

    /// Checks an attachment against the photo and voice flags.
    pub fn check_attachment(&self, attachment: &Attachment) -> Result<(), JmcError> {
        match attachment.kind {
            AttachmentKind::Image if !self.is_photos_enabled() => Err(JmcError::FeatureDisabled("photo")),
            AttachmentKind::Recording if !self.is_voice_enabled() => Err(JmcError::FeatureDisabled("voice")),
            _ => Ok(()),
        }
    }

    /// Builds the report sent for `draft`, merging in the data source.
    pub fn build_report(&self, draft: IssueDraft) -> Result<IssueReport, JmcError> {
        for attachment in &draft.attachments {
            self.check_attachment(attachment)?;
        }

        let mut report = IssueReport::new(draft.description);
        report.attachments = draft.attachments;
        if let Some(ds) = &self.inner.data_source {
            report.custom_fields = ds.custom_fields();
            report.payload = ds.payload();
            if let Some(extra) = ds.attachment() {
                report.attachments.push(extra);
            }
        }

        let type_name = self.issue_type_name_for(draft.issue_type, draft.issue_type.default_name());
        report.payload.insert("type".to_string(), type_name);
        Ok(report)
    }

    /// Submits an issue and records it in the local inbox.
    pub async fn submit_issue(&self, draft: IssueDraft) -> Result<SubmittedIssue, JmcError> {
        let report = self.build_report(draft)?;
        let response = self.inner.transport.create_issue(&report).await?;
        let issue = CreatedIssue::parse(&response);

        if let Some(created) = &issue {
            let now = Utc::now().timestamp_millis();
            let record = StoredIssue {
                key: created.key.clone(),
                summary: created.summary.clone().or_else(|| summary_line(&report.description)),
                status: created.status.clone(),
                description: Some(report.description.clone()),
                date_created: created.date_created.unwrap_or(now),
                date_updated: created.date_updated.unwrap_or(now),
                has_updates: false,
            };
            self.inner.store.lock().await.upsert_issue(&record)?;
        }

        tracing::info!(
            issue = issue.as_ref().map(|i| i.key.as_str()).unwrap_or("<unparsed>"),
            "issue created"
        );
        self.inner.bus.publish(JmcEvent::NewIssueCreated {
            issue_key: issue.as_ref().map(|i| i.key.clone()),
            response: response.clone(),
        });

        Ok(SubmittedIssue { response, issue })
    }

    /// Adds a comment and records it in the local inbox.
    pub async fn add_comment(&self, issue_key: &str, text: &str) -> Result<String, JmcError> {
        let response = self.inner.transport.add_comment(issue_key, text).await?;

        let comment = StoredComment {
            id: 0,
            issue_key: issue_key.trim().to_string(),
            author: self.uuid(),
            body: text.to_string(),
            date: Utc::now().timestamp_millis(),
            system_user: false,
        };
        self.inner.store.lock().await.insert_comment(&comment)?;

        Ok(response)
    }

    /// Queues a crash log for the next flush.
    pub fn queue_crash(&self, log: &str) -> Result<std::path::PathBuf, JmcError> {
        let sender = self
            .inner
            .crash_sender
            .as_ref()
            .ok_or(JmcError::NotConfigured("crash_dir"))?;
        Ok(sender.cache().store(log)?)
    }

    /// Queues every future panic in the crash directory.
    pub fn install_panic_hook(&self) -> Result<(), JmcError> {
        let sender = self
            .inner
            .crash_sender
            .as_ref()
            .ok_or(JmcError::NotConfigured("crash_dir"))?;
        install_panic_hook(sender.cache().clone());
        Ok(())
    }

    /// Sends queued crash logs. Without a crash directory there is nothing
    /// to send.
    pub async fn send_crash_reports(&self) -> Result<CrashSendSummary, JmcError> {
        let Some(sender) = &self.inner.crash_sender else {
            return Ok(CrashSendSummary::default());
        };
        let type_name = self.issue_type_name_for(IssueType::Crash, IssueType::Crash.default_name());
        let custom_fields = self
            .inner
            .data_source
            .as_ref()
            .map(|ds| ds.custom_fields())
            .unwrap_or_default();
        Ok(sender.send_pending(&type_name, &custom_fields).await?)
    }

    /// Starts notification polling and flushes queued crash logs once.
    /// Later calls do nothing. Outside a tokio runtime nothing is started.
    pub fn start(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("jmc not started: no tokio runtime");
            return;
        };
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner
            .notifier
            .spawn(self.inner.config.poll_interval, self.inner.shutdown.clone());

        if self.inner.crash_sender.is_some() {
            let jmc = self.clone();
            handle.spawn(async move {
                match jmc.send_crash_reports().await {
                    Ok(summary) if !summary.sent.is_empty() || !summary.failed.is_empty() => {
                        tracing::info!(
                            sent = summary.sent.len(),
                            failed = summary.failed.len(),
                            "crash queue flushed"
                        )
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!("crash queue flush failed: {err}"),
                }
            });
        }
    }

    /// Stops polling and cancels every in-flight request.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.transport.cancel_all();
    }
}

fn build_metadata(config: &Configuration) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("appName".to_string(), config.app_name.clone()),
        ("appVersion".to_string(), config.app_version.clone()),
        ("uuid".to_string(), config.uuid.to_string()),
        ("systemName".to_string(), std::env::consts::OS.to_string()),
        ("arch".to_string(), std::env::consts::ARCH.to_string()),
        ("locale".to_string(), config.locale.clone()),
        ("sdkVersion".to_string(), env!("CARGO_PKG_VERSION").to_string()),
    ])
}

fn summary_line(description: &str) -> Option<String> {
    description
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.chars().take(80).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NEW_ISSUE_CREATED;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct TestSource;

    impl CustomDataSource for TestSource {
        fn custom_fields(&self) -> BTreeMap<String, String> {
            BTreeMap::from([("build".to_string(), "142".to_string())])
        }

        fn issue_type_name(&self, issue_type: IssueType) -> Option<String> {
            (issue_type == IssueType::Crash).then(|| "Defect".to_string())
        }
    }

    fn configure(base_url: &str) -> Jmc {
        Jmc::configure(JmcConfig::new(base_url, "APP"), None).unwrap()
    }

    #[test]
    fn accessors_reflect_configuration() {
        let mut config = JmcConfig::new("https://example.atlassian.net/", "APP");
        config.app_name = "Angry Nerds".into();
        config.voice_enabled = false;
        let jmc = Jmc::configure(config, None).unwrap();

        assert_eq!(jmc.project(), "APP");
        assert_eq!(jmc.app_name(), "Angry Nerds");
        assert!(jmc.is_photos_enabled());
        assert!(!jmc.is_voice_enabled());
        assert_eq!(jmc.metadata().get("appName").map(String::as_str), Some("Angry Nerds"));
        assert_eq!(jmc.metadata().get("uuid"), Some(&jmc.uuid()));
    }

    #[test]
    fn issue_type_name_uses_override_then_default() {
        let jmc = configure("https://example.atlassian.net/");
        assert_eq!(jmc.issue_type_name_for(IssueType::Feedback, "Bug"), "Bug");

        let mut config = JmcConfig::new("https://example.atlassian.net/", "APP");
        config.issue_type_names.insert("feedback".into(), "Improvement".into());
        let jmc = Jmc::configure(config, None).unwrap();
        assert_eq!(jmc.issue_type_name_for(IssueType::Feedback, "Bug"), "Improvement");
        assert_eq!(jmc.issue_type_name_for(IssueType::Crash, "Crash"), "Crash");
    }

    #[test]
    fn data_source_names_apply_below_config() {
        let jmc = Jmc::configure(
            JmcConfig::new("https://example.atlassian.net/", "APP"),
            Some(Arc::new(TestSource)),
        )
        .unwrap();
        assert_eq!(jmc.issue_type_name_for(IssueType::Crash, "Crash"), "Defect");
        assert_eq!(jmc.issue_type_name_for(IssueType::Feedback, "Bug"), "Bug");
    }

    #[test]
    fn disabled_photos_reject_images() {
        let mut config = JmcConfig::new("https://example.atlassian.net/", "APP");
        config.photos_enabled = false;
        let jmc = Jmc::configure(config, None).unwrap();

        let mut draft = IssueDraft::feedback("see screenshot");
        draft.attachments.push(Attachment::png(vec![1]));
        assert!(matches!(jmc.build_report(draft), Err(JmcError::FeatureDisabled("photo"))));
    }

    #[test]
    fn build_report_merges_data_source() {
        let jmc = Jmc::configure(
            JmcConfig::new("https://example.atlassian.net/", "APP"),
            Some(Arc::new(TestSource)),
        )
        .unwrap();

        let report = jmc.build_report(IssueDraft::feedback("hello")).unwrap();
        assert_eq!(report.payload.get("type").map(String::as_str), Some("Bug"));
        assert_eq!(report.custom_fields.get("build").map(String::as_str), Some("142"));
    }

    #[tokio::test]
    async fn submit_issue_records_and_announces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/jconnect/latest/issue/create"))
            .and(query_param("type", "Bug"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"key":"APP-5","status":"Open","dateCreated":1700000000000}"#),
            )
            .mount(&server)
            .await;

        let jmc = configure(&server.uri());
        let mut rx = jmc.events().subscribe();

        let mut draft = IssueDraft::feedback("Crash on launch");
        draft.attachments.push(Attachment::png(vec![1, 2]));
        let submitted = jmc.submit_issue(draft).await.unwrap();

        assert_eq!(submitted.issue.as_ref().map(|i| i.key.as_str()), Some("APP-5"));
        assert_eq!(rx.recv().await.unwrap().name(), NEW_ISSUE_CREATED);

        let stored = jmc.store().lock().await.get_issue("APP-5").unwrap().unwrap();
        assert_eq!(stored.summary.as_deref(), Some("Crash on launch"));
        assert_eq!(stored.date_created, 1700000000000);
    }

    #[tokio::test]
    async fn submit_issue_surfaces_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let jmc = configure(&server.uri());
        let err = jmc.submit_issue(IssueDraft::feedback("x")).await.unwrap_err();
        assert!(matches!(err, JmcError::Transport(TransportError::Server { .. })));
    }

    #[tokio::test]
    async fn add_comment_is_stored_locally() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/jconnect/latest/issue/comment/APP-5"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let jmc = configure(&server.uri());
        assert_eq!(jmc.add_comment("APP-5", "more detail").await.unwrap(), "ok");

        let comments = jmc.store().lock().await.comments_for("APP-5").unwrap();
        assert_eq!(comments.len(), 1);
        assert!(!comments[0].system_user);
    }

    #[tokio::test]
    async fn own_comment_echo_is_not_a_new_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/jconnect/latest/issue/comment/APP-5"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/jconnect/latest/issue/updates"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"issuesWithComments":[{"key":"APP-5","hasUpdates":true,"dateCreated":1,"dateUpdated":2,
                    "comments":[{"username":"jiraconnect","text":"more detail","date":1700000000000}]}]}"#,
            ))
            .mount(&server)
            .await;

        let jmc = configure(&server.uri());
        jmc.add_comment("APP-5", "more detail").await.unwrap();

        assert!(jmc.notifier().poll_once().await.unwrap().is_none());
        let comments = jmc.store().lock().await.comments_for("APP-5").unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].author, "jiraconnect");
        assert_eq!(jmc.notifier().unread_count().await.unwrap(), 0);

        // A second poll with the same body stays quiet.
        assert!(jmc.notifier().poll_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn crash_reports_need_a_crash_dir() {
        let jmc = configure("https://example.atlassian.net/");
        assert!(matches!(jmc.queue_crash("boom"), Err(JmcError::NotConfigured("crash_dir"))));
        let summary = jmc.send_crash_reports().await.unwrap();
        assert!(summary.sent.is_empty());
    }

    #[tokio::test]
    async fn crash_reports_use_crash_type_name() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(query_param("type", "Defect"))
            .and(query_param("build", "142"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"key":"APP-6"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut config = JmcConfig::new(server.uri(), "APP");
        config.crash_dir = Some(dir.path().join("crashes"));
        let jmc = Jmc::configure(config, Some(Arc::new(TestSource))).unwrap();

        jmc.queue_crash("EXC_BAD_ACCESS").unwrap();
        let summary = jmc.send_crash_reports().await.unwrap();
        assert_eq!(summary.sent.len(), 1);
    }

    #[test]
    fn start_without_runtime_is_a_no_op() {
        let jmc = configure("https://example.atlassian.net/");
        jmc.start();
        assert!(!jmc.inner.started.load(Ordering::SeqCst));
        jmc.shutdown();
    }

    #[tokio::test]
    async fn start_runs_once() {
        let jmc = configure("http://127.0.0.1:9/");
        jmc.start();
        jmc.start();
        assert!(jmc.inner.started.load(Ordering::SeqCst));
        jmc.shutdown();
    }

    #[test]
    fn configure_shared_replaces_instance() {
        let first = Jmc::configure_shared(JmcConfig::new("https://one.example.com", "ONE"), None).unwrap();
        let second = Jmc::configure_shared(JmcConfig::new("https://two.example.com", "TWO"), None).unwrap();

        let current = Jmc::instance().unwrap();
        assert_eq!(current.project(), "TWO");
        assert_eq!(second.project(), "TWO");
        assert!(first.inner.shutdown.is_cancelled());
    }

    #[test]
    fn data_dir_persists_inbox_and_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = JmcConfig::new("https://example.atlassian.net/", "APP");
        config.data_dir = Some(dir.path().to_path_buf());

        let first = Jmc::configure(config.clone(), None).unwrap();
        let second = Jmc::configure(config, None).unwrap();

        assert_eq!(first.uuid(), second.uuid());
        assert!(dir.path().join(DATABASE_FILE_NAME).exists());
    }
}
