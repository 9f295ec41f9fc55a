//! Transport layer for issue and comment delivery.
//!
//! Owns the outbound calls to the three JIRA Connect REST endpoints:
//!
//! | Operation | Method | Path |
//! |-----------|--------|------|
//! | Create issue | POST (multipart) | `rest/jconnect/latest/issue/create?<params>` |
//! | Add comment | POST (form) | `rest/jconnect/latest/issue/comment/<issueKey>` |
//! | Fetch notifications | GET | `rest/jconnect/latest/issue/updates?<params>` |
//!
//! # Delivery
//!
//! Every operation produces exactly one `Result<String, TransportError>`.
//! Callers either await it directly (`create_issue`, `add_comment`,
//! `fetch_notifications`) or [`dispatch`](Transport::dispatch) a built
//! request and receive a [`Completion`] on the registered
//! [`TransportListener`].
//!
//! The listener is looked up when the request finishes, not when it starts:
//! replacing the listener mid-flight redirects the completion to the new
//! one. Completions carry the [`RequestId`] returned by `dispatch`, so
//! concurrent requests never need to be told apart by arrival order.

use reqwest::{Method, StatusCode, Url};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Configuration;
use crate::encoder::{encode_parameters, populate_common_fields, ClientIdentity, EncodeError, FormRequest};
use crate::issue::IssueReport;

/// Path template for issue creation; the encoded query follows the `?`.
pub const CREATE_ISSUE_PATH: &str = "rest/jconnect/latest/issue/create";

/// Path prefix for comments; the issue key is appended as the last segment.
pub const CREATE_COMMENT_PATH: &str = "rest/jconnect/latest/issue/comment";

/// Path template for notification polling.
pub const NOTIFICATIONS_PATH: &str = "rest/jconnect/latest/issue/updates";

const USER_AGENT: &str = concat!("jmc/", env!("CARGO_PKG_VERSION"));

/// Failure classes reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Connectivity,
    Server,
    Cancelled,
    MalformedResponse,
    InvalidRequest,
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connectivity(#[source] reqwest::Error),

    #[error("Server returned {status}: {body}")]
    Server { status: StatusCode, body: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    pub fn kind(&self) -> TransportErrorKind {
        match self {
            Self::Connectivity(_) => TransportErrorKind::Connectivity,
            Self::Server { .. } => TransportErrorKind::Server,
            Self::Cancelled => TransportErrorKind::Cancelled,
            Self::MalformedResponse(_) => TransportErrorKind::MalformedResponse,
            Self::InvalidRequest(_) => TransportErrorKind::InvalidRequest,
        }
    }

    /// Maps a reqwest failure onto the transport taxonomy.
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_builder() {
            Self::InvalidRequest(err.to_string())
        } else if err.is_body() || err.is_decode() {
            Self::MalformedResponse(err.to_string())
        } else {
            Self::Connectivity(err)
        }
    }
}

impl From<EncodeError> for TransportError {
    fn from(err: EncodeError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

/// The three operations the transport knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateIssue,
    AddComment,
    FetchNotifications,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CreateIssue => "create-issue",
            Self::AddComment => "add-comment",
            Self::FetchNotifications => "fetch-notifications",
        })
    }
}

/// Identifier handed out by [`Transport::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Body of an outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Empty,
    /// `application/x-www-form-urlencoded` fields.
    Form(Vec<(String, String)>),
    Multipart(FormRequest),
}

/// A fully built request, ready to be sent once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRequest {
    pub operation: Operation,
    pub method: Method,
    /// Path relative to the base URL, including the query string.
    pub path: String,
    pub body: RequestBody,
}

/// Terminal outcome of a dispatched request.
#[derive(Debug)]
pub struct Completion {
    pub request_id: RequestId,
    pub operation: Operation,
    pub result: Result<String, TransportError>,
}

/// Receives the completion of every dispatched request.
pub trait TransportListener: Send + Sync {
    fn on_completion(&self, completion: Completion);
}

impl<F> TransportListener for F
where
    F: Fn(Completion) + Send + Sync,
{
    fn on_completion(&self, completion: Completion) {
        self(completion)
    }
}

type ListenerSlot = Arc<RwLock<Option<Arc<dyn TransportListener>>>>;

/// HTTP transport bound to one tracker instance.
#[derive(Clone)]
pub struct Transport {
    client: reqwest::Client,
    base_url: Url,
    identity: Arc<ClientIdentity>,
    listener: ListenerSlot,
    cancel: Arc<Mutex<CancellationToken>>,
}

impl Transport {
    /// Creates a transport for the given configuration.
    pub fn new(config: &Configuration, metadata: BTreeMap<String, String>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: config.base_url.clone(),
            identity: Arc::new(ClientIdentity {
                project: config.project.clone(),
                uuid: config.uuid.to_string(),
                metadata,
            }),
            listener: Arc::new(RwLock::new(None)),
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Builds the multipart create-issue request.
    pub fn build_create_issue(&self, report: &IssueReport) -> Result<OutgoingRequest, TransportError> {
        let mut form = FormRequest::new();
        let mut params = BTreeMap::new();
        populate_common_fields(&self.identity, report, &mut form, &mut params)?;

        Ok(OutgoingRequest {
            operation: Operation::CreateIssue,
            method: Method::POST,
            path: format!("{}?{}", CREATE_ISSUE_PATH, encode_parameters(&params)),
            body: RequestBody::Multipart(form),
        })
    }

    /// Builds the add-comment request. The issue key is percent-encoded
    /// into the last path segment.
    pub fn build_add_comment(&self, issue_key: &str, comment: &str) -> Result<OutgoingRequest, TransportError> {
        let issue_key = issue_key.trim();
        if issue_key.is_empty() {
            return Err(TransportError::InvalidRequest("issue key is empty".into()));
        }

        Ok(OutgoingRequest {
            operation: Operation::AddComment,
            method: Method::POST,
            path: format!("{}/{}", CREATE_COMMENT_PATH, urlencoding::encode(issue_key)),
            body: RequestBody::Form(vec![
                ("comment".to_string(), comment.to_string()),
                ("uuid".to_string(), self.identity.uuid.clone()),
            ]),
        })
    }

    /// Builds the notifications poll. An empty parameter set still keeps the
    /// trailing `?` of the path template.
    pub fn build_fetch_notifications(&self, params: &BTreeMap<String, String>) -> OutgoingRequest {
        OutgoingRequest {
            operation: Operation::FetchNotifications,
            method: Method::GET,
            path: format!("{}?{}", NOTIFICATIONS_PATH, encode_parameters(params)),
            body: RequestBody::Empty,
        }
    }

    pub async fn create_issue(&self, report: &IssueReport) -> Result<String, TransportError> {
        let request = self.build_create_issue(report)?;
        self.execute(request).await
    }

    pub async fn add_comment(&self, issue_key: &str, comment: &str) -> Result<String, TransportError> {
        let request = self.build_add_comment(issue_key, comment)?;
        self.execute(request).await
    }

    pub async fn fetch_notifications(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<String, TransportError> {
        self.execute(self.build_fetch_notifications(params)).await
    }

    /// Sends a request and returns the raw response body.
    ///
    /// Non-2xx statuses map to [`TransportError::Server`]; bodies that are not
    /// UTF-8 map to [`TransportError::MalformedResponse`].
    pub async fn execute(&self, request: OutgoingRequest) -> Result<String, TransportError> {
        self.execute_with(self.current_token(), request).await
    }

    /// Sends `request`, aborting when `token` is cancelled.
    async fn execute_with(
        &self,
        token: CancellationToken,
        request: OutgoingRequest,
    ) -> Result<String, TransportError> {
        let operation = request.operation;

        tokio::select! {
            _ = token.cancelled() => {
                tracing::debug!(%operation, "request cancelled");
                Err(TransportError::Cancelled)
            }
            result = self.send(request) => result,
        }
    }

    async fn send(&self, request: OutgoingRequest) -> Result<String, TransportError> {
        let url = self
            .base_url
            .join(&request.path)
            .map_err(|e| TransportError::InvalidRequest(format!("{}: {e}", request.path)))?;

        tracing::debug!(operation = %request.operation, %url, "sending request");

        let builder = self.client.request(request.method, url);
        let builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Form(fields) => builder.header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(encode_parameters(fields)),
            RequestBody::Multipart(form) => builder.multipart(form.into_multipart()?),
        };

        let response = builder.send().await.map_err(TransportError::from_reqwest)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(TransportError::from_reqwest)?;

        if !status.is_success() {
            return Err(TransportError::Server {
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        String::from_utf8(bytes.to_vec())
            .map_err(|e| TransportError::MalformedResponse(format!("response is not UTF-8: {e}")))
    }

    /// Registers the listener for dispatched requests, replacing any
    /// previous one. In-flight requests complete to the new listener.
    pub fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    pub fn clear_listener(&self) {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Sends `request` on a background task and reports the outcome to the
    /// listener registered when it finishes.
    ///
    /// The request belongs to the cancellation generation current at the
    /// time of the call. Outside a tokio runtime nothing is sent and the
    /// completion carries [`TransportError::InvalidRequest`].
    pub fn dispatch(&self, request: OutgoingRequest) -> RequestId {
        let request_id = RequestId::new();
        let operation = request.operation;

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.deliver(Completion {
                request_id,
                operation,
                result: Err(TransportError::InvalidRequest("no tokio runtime".into())),
            });
            return request_id;
        };

        tracing::debug!(%request_id, %operation, "dispatching request");

        let token = self.current_token();
        let transport = self.clone();
        handle.spawn(async move {
            let result = transport.execute_with(token, request).await;
            transport.deliver(Completion {
                request_id,
                operation,
                result,
            });
        });

        request_id
    }

    fn deliver(&self, completion: Completion) {
        let listener = self
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match listener {
            Some(listener) => listener.on_completion(completion),
            None => match &completion.result {
                Ok(body) => tracing::debug!(
                    request_id = %completion.request_id,
                    operation = %completion.operation,
                    bytes = body.len(),
                    "request finished with no listener"
                ),
                Err(err) => tracing::warn!(
                    request_id = %completion.request_id,
                    operation = %completion.operation,
                    kind = ?err.kind(),
                    "request failed with no listener: {err}"
                ),
            },
        }
    }

    /// Cancels every request currently in flight. Each one completes with
    /// [`TransportError::Cancelled`]; requests started afterwards are unaffected.
    pub fn cancel_all(&self) {
        let mut guard = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::replace(&mut *guard, CancellationToken::new());
        previous.cancel();
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
