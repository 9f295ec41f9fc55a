//! Headless view models for the issue composer and the issue inbox.
//!
//! They hold the state a UI needs and route every action through the
//! [`Jmc`] that created them.

use crate::issue::{Attachment, AttachmentKind, IssueType};
use crate::session::{IssueDraft, Jmc, JmcError, SubmittedIssue};
use crate::storage::{StoredComment, StoredIssue};

/// State of the "create issue" screen.
pub struct IssueComposer {
    jmc: Jmc,
    draft: IssueDraft,
}

impl IssueComposer {
    pub(crate) fn new(jmc: Jmc) -> Self {
        Self {
            jmc,
            draft: IssueDraft::feedback(""),
        }
    }

    pub fn title(&self) -> String {
        self.jmc.localizer().lookup("composer.title", self.jmc.locale())
    }

    pub fn send_label(&self) -> String {
        self.jmc.localizer().lookup("composer.send", self.jmc.locale())
    }

    pub fn can_attach_photos(&self) -> bool {
        self.jmc.is_photos_enabled()
    }

    pub fn can_record_voice(&self) -> bool {
        self.jmc.is_voice_enabled()
    }

    pub fn issue_type(&self) -> IssueType {
        self.draft.issue_type
    }

    pub fn set_issue_type(&mut self, issue_type: IssueType) {
        self.draft.issue_type = issue_type;
    }

    pub fn description(&self) -> &str {
        &self.draft.description
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.draft.description = description.into();
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.draft.attachments
    }

    /// Adds an attachment unless its feature is disabled. The error carries
    /// a localized reason.
    pub fn attach(&mut self, attachment: Attachment) -> Result<(), String> {
        self.jmc.check_attachment(&attachment).map_err(|_| {
            let key = match attachment.kind {
                AttachmentKind::Recording => "composer.voice.disabled",
                _ => "composer.photos.disabled",
            };
            self.jmc.localizer().lookup(key, self.jmc.locale())
        })?;
        self.draft.attachments.push(attachment);
        Ok(())
    }

    pub fn remove_attachment(&mut self, index: usize) -> Option<Attachment> {
        (index < self.draft.attachments.len()).then(|| self.draft.attachments.remove(index))
    }

    /// Sends the draft. On failure the draft is kept so the user can retry.
    pub async fn submit(&mut self) -> Result<SubmittedIssue, JmcError> {
        let submitted = self.jmc.submit_issue(self.draft.clone()).await?;
        self.draft = IssueDraft::feedback("");
        Ok(submitted)
    }

    /// Localized text for a failed submission.
    pub fn error_message(&self, err: &JmcError) -> String {
        match err {
            JmcError::Transport(transport) => self
                .jmc
                .localizer()
                .error_message(transport.kind(), self.jmc.locale()),
            other => other.to_string(),
        }
    }
}

/// An issue with its comment thread.
#[derive(Debug, Clone)]
pub struct IssueThread {
    pub issue: StoredIssue,
    pub comments: Vec<StoredComment>,
}

/// State of the "your feedback" list.
pub struct IssueInbox {
    jmc: Jmc,
}

impl IssueInbox {
    pub(crate) fn new(jmc: Jmc) -> Self {
        Self { jmc }
    }

    pub fn title(&self) -> String {
        self.jmc.localizer().lookup("inbox.title", self.jmc.locale())
    }

    /// Most recently updated issues first.
    pub async fn issues(&self, limit: usize) -> Result<Vec<StoredIssue>, JmcError> {
        Ok(self.jmc.store().lock().await.list_issues(limit)?)
    }

    /// Text shown when the list is empty, or the unread badge otherwise.
    pub async fn status_line(&self) -> Result<String, JmcError> {
        let store = self.jmc.store().lock().await;
        let localizer = self.jmc.localizer();
        if store.count()? == 0 {
            return Ok(localizer.lookup("inbox.empty", self.jmc.locale()));
        }
        let unread = store.unread_count()?.to_string();
        Ok(localizer.format("inbox.unread", self.jmc.locale(), &[("count", unread.as_str())]))
    }

    pub async fn unread_count(&self) -> Result<i64, JmcError> {
        Ok(self.jmc.store().lock().await.unread_count()?)
    }

    /// Loads an issue and its comments and marks it read.
    pub async fn open(&self, key: &str) -> Result<Option<IssueThread>, JmcError> {
        let store = self.jmc.store().lock().await;
        let Some(issue) = store.get_issue(key)? else {
            return Ok(None);
        };
        let comments = store.comments_for(key)?;
        store.mark_read(key)?;
        Ok(Some(IssueThread { issue, comments }))
    }

    pub async fn reply(&self, key: &str, text: &str) -> Result<String, JmcError> {
        self.jmc.add_comment(key, text).await
    }
}
