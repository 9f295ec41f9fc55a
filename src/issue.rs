//! Issue report types.
//!
//! An [`IssueReport`] is built per user submission and consumed by exactly
//! one transport call. Attachments carry their own part name and MIME type so
//! the encoder can lay them out without knowing where they came from.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Kind of issue a report is filed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueType {
    /// Automatically collected crash report.
    Crash,
    /// User feedback entered through the issue composer.
    Feedback,
}

impl IssueType {
    /// Lowercase identifier used in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crash => "crash",
            Self::Feedback => "feedback",
        }
    }

    /// Display name used when neither the configuration nor the data source
    /// provide one.
    pub fn default_name(&self) -> &'static str {
        match self {
            Self::Crash => "Crash",
            Self::Feedback => "Bug",
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "crash" => Ok(Self::Crash),
            "feedback" | "bug" => Ok(Self::Feedback),
            other => Err(format!("unknown issue type '{other}'")),
        }
    }
}

/// What an attachment holds. Images and recordings are gated by the
/// photo and voice feature flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    Recording,
    File,
}

/// A binary attachment sent as one multipart file part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub kind: AttachmentKind,
    /// Base name of the multipart field (the index is appended for
    /// generated names).
    pub field: String,
    /// Explicit file name. When `None` a name is generated from the field,
    /// the attachment index and the extension.
    pub file_name: Option<String>,
    pub extension: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    /// PNG screenshot.
    pub fn png(data: Vec<u8>) -> Self {
        Self::image(data, "image/png")
    }

    /// Image with an explicit MIME type; the extension is derived from it.
    pub fn image(data: Vec<u8>, content_type: impl Into<String>) -> Self {
        let content_type = content_type.into();
        let extension = match content_type.as_str() {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/gif" => "gif",
            "image/heic" => "heic",
            other => mime_guess::get_mime_extensions_str(other)
                .and_then(|exts| exts.first().copied())
                .unwrap_or("png"),
        };
        Self {
            kind: AttachmentKind::Image,
            field: "screenshot".into(),
            file_name: None,
            extension: extension.into(),
            content_type,
            data,
        }
    }

    /// Voice recording.
    pub fn recording(data: Vec<u8>) -> Self {
        Self {
            kind: AttachmentKind::Recording,
            field: "recording".into(),
            file_name: None,
            extension: "aac".into(),
            content_type: "audio/aac".into(),
            data,
        }
    }

    /// Arbitrary file with a fixed name.
    pub fn file(
        field: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        let file_name = file_name.into();
        let extension = Path::new(&file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_string();
        Self {
            kind: AttachmentKind::File,
            field: field.into(),
            file_name: Some(file_name),
            extension,
            content_type: content_type.into(),
            data,
        }
    }

    /// Reads an attachment from disk, guessing its MIME type from the
    /// extension. Images are classified as [`AttachmentKind::Image`].
    pub fn from_path<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let content_type = mime.essence_str().to_string();

        if mime.type_() == mime_guess::mime::IMAGE {
            return Ok(Self::image(data, content_type));
        }
        if mime.type_() == mime_guess::mime::AUDIO {
            let mut recording = Self::recording(data);
            recording.content_type = content_type;
            return Ok(recording);
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("attachment.bin")
            .to_string();
        Ok(Self::file("attachment", file_name, content_type, data))
    }

    /// Multipart field name for the attachment at `index`.
    pub fn part_name(&self, index: usize) -> String {
        format!("{}-{}", self.field, index)
    }

    /// File name sent with the part at `index`.
    pub fn file_name_at(&self, index: usize) -> String {
        match &self.file_name {
            Some(name) => name.clone(),
            None => format!("{}-{}.{}", self.field, index, self.extension),
        }
    }
}

/// A user submission, consumed by a single create-issue call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueReport {
    pub description: String,
    pub attachments: Vec<Attachment>,
    /// Payload fields such as the issue type or priority.
    pub payload: BTreeMap<String, String>,
    pub custom_fields: BTreeMap<String, String>,
}

impl IssueReport {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_custom_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_fields.insert(key.into(), value.into());
        self
    }
}

/// Issue summary as returned by the create-issue endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CreatedIssue {
    pub key: String,
    pub summary: Option<String>,
    pub status: Option<String>,
    pub description: Option<String>,
    pub date_created: Option<i64>,
    pub date_updated: Option<i64>,
}

impl CreatedIssue {
    /// Parses the create-issue response. Servers that answer with plain text
    /// yield `None`; the raw body is still handed to the caller.
    pub fn parse(body: &str) -> Option<Self> {
        serde_json::from_str::<CreatedIssue>(body)
            .ok()
            .filter(|issue| !issue.key.is_empty())
    }
}
