//! Client configuration.
//!
//! [`JmcConfig`] is what hosts write (in code or as TOML). It is resolved
//! once into an immutable [`Configuration`] that the facade owns for its
//! whole lifetime.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::issue::IssueType;

/// File, inside the data directory, that holds the per-install identifier.
pub const UUID_FILE_NAME: &str = "jmc-uuid";

/// File, inside the data directory, that holds the last successful ping
/// time in milliseconds.
pub const LAST_PING_FILE_NAME: &str = "jmc-last-ping";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid base URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid uuid '{0}'")]
    InvalidUuid(String),

    #[error("Unknown issue type in issue_type_names: {0}")]
    UnknownIssueType(String),
}

/// User-facing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JmcConfig {
    /// Base URL of the tracker instance, e.g. `https://example.atlassian.net/`
    pub base_url: String,
    /// Project key issues are filed under
    pub project: String,
    /// Application name reported with every issue
    pub app_name: String,
    /// Application version reported with every issue
    pub app_version: String,
    /// Fixed per-install identifier; generated and persisted when absent
    pub uuid: Option<String>,
    pub photos_enabled: bool,
    pub voice_enabled: bool,
    /// Display-name overrides keyed by `crash` / `feedback`
    pub issue_type_names: BTreeMap<String, String>,
    /// Locale used for notification messages
    pub locale: String,
    /// Seconds between notification polls
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Directory for the issue inbox database and the install identifier.
    /// Without it both live in memory only.
    pub data_dir: Option<PathBuf>,
    /// Directory holding crash logs waiting to be sent
    pub crash_dir: Option<PathBuf>,
    /// Directory of extra `<locale>.strings` tables
    pub strings_dir: Option<PathBuf>,
}

impl Default for JmcConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            project: String::new(),
            app_name: "Unknown".into(),
            app_version: "0.0.0".into(),
            uuid: None,
            photos_enabled: true,
            voice_enabled: true,
            issue_type_names: BTreeMap::new(),
            locale: "en".into(),
            poll_interval_secs: 60,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            data_dir: None,
            crash_dir: None,
            strings_dir: None,
        }
    }
}

impl JmcConfig {
    /// Convenience constructor for the two settings every host must supply.
    pub fn new(base_url: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            project: project.into(),
            ..Default::default()
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Validates the settings and produces the immutable configuration.
    ///
    /// The per-install identifier is taken from `uuid` if set, otherwise read
    /// from (or written to) `<data_dir>/jmc-uuid`, otherwise generated.
    pub fn resolve(self) -> Result<Configuration, ConfigError> {
        let base_url = normalize_base_url(&self.base_url)?;

        let project = self.project.trim().to_string();
        if project.is_empty() {
            return Err(ConfigError::Missing("project"));
        }

        let uuid = match (&self.uuid, &self.data_dir) {
            (Some(raw), _) => {
                Uuid::parse_str(raw.trim()).map_err(|_| ConfigError::InvalidUuid(raw.clone()))?
            }
            (None, Some(dir)) => load_or_create_uuid(dir)?,
            (None, None) => Uuid::new_v4(),
        };

        let mut issue_type_names = BTreeMap::new();
        for (key, name) in self.issue_type_names {
            let issue_type = key
                .parse::<IssueType>()
                .map_err(|_| ConfigError::UnknownIssueType(key.clone()))?;
            issue_type_names.insert(issue_type, name);
        }

        Ok(Configuration {
            base_url,
            project,
            app_name: self.app_name,
            app_version: self.app_version,
            uuid,
            photos_enabled: self.photos_enabled,
            voice_enabled: self.voice_enabled,
            issue_type_names,
            locale: self.locale,
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            data_dir: self.data_dir,
            crash_dir: self.crash_dir,
            strings_dir: self.strings_dir,
        })
    }
}

/// Resolved, immutable configuration.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub base_url: Url,
    pub project: String,
    pub app_name: String,
    pub app_version: String,
    pub uuid: Uuid,
    pub photos_enabled: bool,
    pub voice_enabled: bool,
    pub issue_type_names: BTreeMap<IssueType, String>,
    pub locale: String,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub data_dir: Option<PathBuf>,
    pub crash_dir: Option<PathBuf>,
    pub strings_dir: Option<PathBuf>,
}

/// Parses the base URL and makes sure it ends with `/` so relative REST
/// paths are appended instead of replacing the last path segment.
pub fn normalize_base_url(raw: &str) -> Result<Url, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ConfigError::Missing("base_url"));
    }
    let with_slash = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    let url = Url::parse(&with_slash).map_err(|e| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    Ok(url)
}

/// Reads the install identifier from `dir`, creating it on first use.
pub fn load_or_create_uuid(dir: &Path) -> Result<Uuid, ConfigError> {
    let path = dir.join(UUID_FILE_NAME);
    if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        return Uuid::parse_str(raw.trim()).map_err(|_| ConfigError::InvalidUuid(raw));
    }

    std::fs::create_dir_all(dir)?;
    let uuid = Uuid::new_v4();
    std::fs::write(&path, uuid.to_string())?;
    tracing::debug!(path = %path.display(), "created install identifier");
    Ok(uuid)
}
