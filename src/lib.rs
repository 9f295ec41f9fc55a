//! JMC - issue and crash reporting client for JIRA Connect
//!
//! Lets an application file issues (with screenshots, voice notes and other
//! attachments) into a JIRA project, comment on them, poll for replies and
//! flush queued crash logs.
//!
//! # Features
//!
//! - Multipart issue creation with custom fields and payload
//! - Awaitable requests or fire-and-forget dispatch with a completion listener
//! - Reply polling with a local SQLite inbox
//! - Crash log queue with gzip for large logs
//! - Localized user-facing strings
//!
//! # Example
//!
//! ```rust,no_run
//! use jmc::{Attachment, IssueDraft, Jmc, JmcConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let jmc = Jmc::configure(JmcConfig::new("https://example.atlassian.net", "APP"), None)?;
//!     jmc.start();
//!
//!     let mut draft = IssueDraft::feedback("The login button does nothing");
//!     draft.attachments.push(Attachment::png(std::fs::read("screen.png")?));
//!     let created = jmc.submit_issue(draft).await?;
//!     println!("{}", created.response);
//!
//!     jmc.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! Query strings are built with [`encode_parameters`]:
//!
//! ```
//! let query = jmc::encode_parameters([("type", "Bug"), ("summary", "a&b")]);
//! assert_eq!(query, "type=Bug&summary=a%26b");
//! ```

pub mod compression;
pub mod config;
pub mod crash;
pub mod encoder;
pub mod event;
pub mod issue;
pub mod localization;
pub mod notifier;
pub mod pinger;
pub mod session;
pub mod storage;
pub mod transport;
pub mod views;

pub use compression::{compress_bytes, decompress_bytes, maybe_compress, should_compress, DEFAULT_THRESHOLD};
pub use config::{ConfigError, Configuration, JmcConfig};
pub use crash::{install_panic_hook, CrashReportCache, CrashSendSummary, CrashSender};
pub use encoder::{decode_parameters, encode_parameters, EncodeError, FormPart, FormRequest};
pub use event::{EventBus, JmcEvent, LAST_SUCCESSFUL_PING_TIME, NEW_ISSUE_CREATED, RECEIVED_COMMENTS};
pub use issue::{Attachment, AttachmentKind, CreatedIssue, IssueReport, IssueType};
pub use localization::{Localizer, StringTable};
pub use notifier::{IssueUpdates, Notification, Notifier};
pub use pinger::Pinger;
pub use session::{CustomDataSource, IssueDraft, Jmc, JmcError, SubmittedIssue};
pub use storage::{IssueStore, StoredComment, StoredIssue};
pub use transport::{
    Completion, Operation, OutgoingRequest, RequestId, Transport, TransportError, TransportErrorKind,
    TransportListener,
};
pub use views::{IssueComposer, IssueInbox, IssueThread};
