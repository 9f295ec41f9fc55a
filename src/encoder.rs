//! Request encoding.
//!
//! Builds the query string and the multipart body for outgoing requests.
//!
//! # Query strings
//!
//! Every key and value is percent-encoded; only the unreserved characters
//! `A-Z a-z 0-9 - _ . ~` pass through unchanged. Pairs are joined with `=`
//! and `&`:
//!
//! ```text
//! {"summary": "a&b", "type": "Bug"} → summary=a%26b&type=Bug
//! ```
//!
//! # Multipart bodies
//!
//! A [`FormRequest`] is an ordered list of text and file parts. It stays
//! inspectable until [`FormRequest::into_multipart`] hands it to reqwest.

use reqwest::multipart::{Form, Part};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::issue::IssueReport;

/// Encoding errors.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Invalid percent-encoding in '{0}'")]
    InvalidEscape(String),

    #[error("Invalid content type '{content_type}': {source}")]
    InvalidContentType {
        content_type: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("JSON serialization failed: {0}")]
    JsonFailed(#[from] serde_json::Error),
}

/// Encodes parameters into a query-string fragment.
///
/// Iteration order of the input is preserved, so a `BTreeMap` gives a
/// deterministic string. An empty input yields an empty string.
///
/// # Example
///
/// ```
/// use std::collections::BTreeMap;
/// use jmc::encode_parameters;
///
/// let mut params = BTreeMap::new();
/// params.insert("type", "Bug");
/// params.insert("summary", "a & b");
/// assert_eq!(encode_parameters(&params), "summary=a%20%26%20b&type=Bug");
/// ```
pub fn encode_parameters<I, K, V>(parameters: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    parameters
        .into_iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                urlencoding::encode(key.as_ref()),
                urlencoding::encode(value.as_ref())
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Decodes a query-string fragment produced by [`encode_parameters`].
///
/// A pair without `=` decodes to an empty value.
pub fn decode_parameters(query: &str) -> Result<Vec<(String, String)>, EncodeError> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            Ok((decode_component(key)?, decode_component(value)?))
        })
        .collect()
}

fn decode_component(component: &str) -> Result<String, EncodeError> {
    urlencoding::decode(component)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| EncodeError::InvalidEscape(component.to_string()))
}

/// One part of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        content_type: String,
        data: Vec<u8>,
    },
}

impl FormPart {
    pub fn name(&self) -> &str {
        match self {
            Self::Text { name, .. } | Self::File { name, .. } => name,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Self::File { .. })
    }
}

/// Mutable multipart request body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormRequest {
    parts: Vec<FormPart>,
}

impl FormRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_text(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.parts.push(FormPart::Text {
            name: name.into(),
            value: value.into(),
        });
    }

    pub fn add_file(
        &mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) {
        self.parts.push(FormPart::File {
            name: name.into(),
            file_name: file_name.into(),
            content_type: content_type.into(),
            data,
        });
    }

    pub fn parts(&self) -> &[FormPart] {
        &self.parts
    }

    /// Value of the first text part called `name`.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.parts.iter().find_map(|part| match part {
            FormPart::Text { name: n, value } if n == name => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn file_parts(&self) -> impl Iterator<Item = &FormPart> {
        self.parts.iter().filter(|part| part.is_file())
    }

    /// Converts into a reqwest multipart form, preserving part order.
    pub fn into_multipart(self) -> Result<Form, EncodeError> {
        let mut form = Form::new();
        for part in self.parts {
            form = match part {
                FormPart::Text { name, value } => form.text(name, value),
                FormPart::File {
                    name,
                    file_name,
                    content_type,
                    data,
                } => {
                    let part = Part::bytes(data)
                        .file_name(file_name)
                        .mime_str(&content_type)
                        .map_err(|source| EncodeError::InvalidContentType {
                            content_type: content_type.clone(),
                            source,
                        })?;
                    form.part(name, part)
                }
            };
        }
        Ok(form)
    }
}

/// Identity fields attached to every issue report.
#[derive(Debug, Clone, Default)]
pub struct ClientIdentity {
    pub project: String,
    pub uuid: String,
    pub metadata: BTreeMap<String, String>,
}

/// Writes the fields shared by every issue submission onto `form`, and
/// merges payload and custom fields into the query `params`.
///
/// Text parts are always written, including empty ones. Each attachment
/// becomes exactly one file part with a name derived from its index.
/// On key collisions payload entries win over custom fields.
pub fn populate_common_fields(
    identity: &ClientIdentity,
    report: &IssueReport,
    form: &mut FormRequest,
    params: &mut BTreeMap<String, String>,
) -> Result<(), EncodeError> {
    form.add_text("description", report.description.as_str());
    form.add_text("project", identity.project.as_str());
    form.add_text("uuid", identity.uuid.as_str());
    form.add_text("payload", serde_json::to_string(&report.payload)?);
    form.add_text("customfields", serde_json::to_string(&report.custom_fields)?);
    form.add_text("metadata", serde_json::to_string(&identity.metadata)?);

    for (index, attachment) in report.attachments.iter().enumerate() {
        form.add_file(
            attachment.part_name(index),
            attachment.file_name_at(index),
            attachment.content_type.as_str(),
            attachment.data.clone(),
        );
    }

    for (key, value) in &report.custom_fields {
        params.insert(key.clone(), value.clone());
    }
    for (key, value) in &report.payload {
        params.insert(key.clone(), value.clone());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::Attachment;
    use std::collections::HashSet;

    fn identity() -> ClientIdentity {
        ClientIdentity {
            project: "APP".into(),
            uuid: "1234".into(),
            metadata: BTreeMap::from([("os".to_string(), "linux".to_string())]),
        }
    }

    #[test]
    fn empty_parameters_encode_to_empty_string() {
        let params: BTreeMap<String, String> = BTreeMap::new();
        assert_eq!(encode_parameters(&params), "");
    }

    #[test]
    fn reserved_characters_are_escaped() {
        let params = BTreeMap::from([("q", "a&b=c?d#e f")]);
        let encoded = encode_parameters(&params);

        assert_eq!(encoded, "q=a%26b%3Dc%3Fd%23e%20f");
        assert_eq!(encoded.matches('&').count(), 0);
        assert_eq!(encoded.matches('=').count(), 1);
    }

    #[test]
    fn decode_recovers_reserved_and_non_ascii_pairs() {
        let params = BTreeMap::from([
            ("key with space".to_string(), "value & more".to_string()),
            ("a=b".to_string(), "c=d".to_string()),
            ("ünïcødé".to_string(), "日本語 テキスト".to_string()),
            ("plus".to_string(), "1+1".to_string()),
            ("empty".to_string(), String::new()),
        ]);

        let decoded = decode_parameters(&encode_parameters(&params)).unwrap();
        let decoded: BTreeMap<String, String> = decoded.into_iter().collect();

        assert_eq!(decoded, params);
    }

    #[test]
    fn encoding_is_deterministic() {
        let params = BTreeMap::from([("b", "2"), ("a", "1"), ("c", "3")]);
        assert_eq!(encode_parameters(&params), "a=1&b=2&c=3");
        assert_eq!(encode_parameters(&params), encode_parameters(&params));
    }

    #[test]
    fn decode_rejects_invalid_utf8_escape() {
        assert!(matches!(
            decode_parameters("k=%FF"),
            Err(EncodeError::InvalidEscape(_))
        ));
    }

    #[test]
    fn zero_attachments_produce_only_text_parts() {
        let report = IssueReport::new("Crash on launch").with_payload("type", "Bug");
        let mut form = FormRequest::new();
        let mut params = BTreeMap::new();

        populate_common_fields(&identity(), &report, &mut form, &mut params).unwrap();

        assert_eq!(form.file_parts().count(), 0);
        assert_eq!(form.text("description"), Some("Crash on launch"));
        assert_eq!(form.text("project"), Some("APP"));
        assert_eq!(form.text("uuid"), Some("1234"));
        assert_eq!(form.text("payload"), Some(r#"{"type":"Bug"}"#));
        assert_eq!(form.text("customfields"), Some("{}"));
        assert_eq!(form.text("metadata"), Some(r#"{"os":"linux"}"#));
    }

    #[test]
    fn each_image_becomes_one_distinct_file_part() {
        let report = IssueReport::new("three shots")
            .with_attachment(Attachment::png(vec![1]))
            .with_attachment(Attachment::png(vec![2]))
            .with_attachment(Attachment::image(vec![3], "image/jpeg"));
        let mut form = FormRequest::new();
        let mut params = BTreeMap::new();

        populate_common_fields(&identity(), &report, &mut form, &mut params).unwrap();

        let names: HashSet<String> = form
            .file_parts()
            .map(|part| match part {
                FormPart::File { file_name, content_type, .. } => {
                    assert!(content_type.starts_with("image/"));
                    file_name.clone()
                }
                FormPart::Text { .. } => unreachable!(),
            })
            .collect();
        assert_eq!(form.file_parts().count(), 3);
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn empty_values_are_kept_and_payload_wins() {
        let report = IssueReport::new("")
            .with_payload("priority", "")
            .with_payload("type", "Bug")
            .with_custom_field("type", "Task")
            .with_custom_field("build", "42");
        let mut form = FormRequest::new();
        let mut params = BTreeMap::new();

        populate_common_fields(&identity(), &report, &mut form, &mut params).unwrap();

        assert_eq!(form.text("description"), Some(""));
        assert_eq!(params.get("priority").map(String::as_str), Some(""));
        assert_eq!(params.get("type").map(String::as_str), Some("Bug"));
        assert_eq!(params.get("build").map(String::as_str), Some("42"));
    }

    #[test]
    fn into_multipart_rejects_bad_content_type() {
        let mut form = FormRequest::new();
        form.add_file("f", "f.bin", "not a mime type", vec![0]);
        assert!(matches!(
            form.into_multipart(),
            Err(EncodeError::InvalidContentType { .. })
        ));
    }
}
