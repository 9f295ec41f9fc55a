//! Crash report queue and sender.
//!
//! Crash logs are written to a local directory when they are captured and
//! submitted as issues the next time the client is online. A log stays on
//! disk until the tracker accepted it.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::compression::{maybe_compress, CompressionError, DEFAULT_THRESHOLD};
use crate::issue::{Attachment, IssueReport};
use crate::transport::{Transport, TransportError};

const CRASH_FILE_PREFIX: &str = "crash-";
const CRASH_FILE_EXTENSION: &str = "log";

/// Maximum characters of the first log line used as the issue description.
const MAX_SUMMARY_CHARS: usize = 200;

/// Crash queue errors.
#[derive(Debug, Error)]
pub enum CrashError {
    #[error("Crash cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Compression(#[from] CompressionError),
}

/// Directory of crash logs waiting to be sent.
#[derive(Debug, Clone)]
pub struct CrashReportCache {
    path: PathBuf,
}

impl CrashReportCache {
    /// Creates a new cache at the specified directory.
    pub fn new<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    /// Returns the cache directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queues a crash log. The file is named after the log's fingerprint,
    /// so storing the same crash twice keeps a single entry.
    pub fn store(&self, log: &str) -> std::io::Result<PathBuf> {
        let name = format!(
            "{}{}.{}",
            CRASH_FILE_PREFIX,
            &fingerprint(log)[..16],
            CRASH_FILE_EXTENSION
        );
        let path = self.path.join(name);
        if !path.exists() {
            std::fs::write(&path, log)?;
        }
        Ok(path)
    }

    /// Pending crash logs, oldest first.
    pub fn pending(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let path = entry.path();
            let is_crash = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(CRASH_FILE_PREFIX))
                && path.extension().and_then(|e| e.to_str()) == Some(CRASH_FILE_EXTENSION);
            if is_crash {
                let modified = entry.metadata()?.modified()?;
                entries.push((modified, path));
            }
        }
        entries.sort();
        Ok(entries.into_iter().map(|(_, path)| path).collect())
    }

    pub fn remove(&self, path: &Path) -> std::io::Result<()> {
        std::fs::remove_file(path)
    }
}

/// Installs a panic hook that queues every panic in `cache`.
///
/// The message, location and a captured backtrace are written as one log.
/// The previously installed hook still runs afterwards.
pub fn install_panic_hook(cache: CrashReportCache) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let thread = std::thread::current();
        let backtrace = std::backtrace::Backtrace::force_capture();
        let log = format!(
            "{info}\nthread: {}\n\n{backtrace}",
            thread.name().unwrap_or("<unnamed>")
        );
        match cache.store(&log) {
            Ok(path) => tracing::error!(path = %path.display(), "panic captured"),
            Err(err) => tracing::error!("failed to queue panic: {err}"),
        }
        previous(info);
    }));
}

/// Hex SHA-256 of a crash log.
pub fn fingerprint(log: &str) -> String {
    hex::encode(Sha256::digest(log.as_bytes()))
}

/// Outcome of one flush of the crash queue.
#[derive(Debug, Default)]
pub struct CrashSendSummary {
    /// Raw server responses of the accepted reports.
    pub sent: Vec<String>,
    /// Logs that stayed queued, with the reason.
    pub failed: Vec<(PathBuf, TransportError)>,
}

/// Submits queued crash logs through the transport.
#[derive(Clone)]
pub struct CrashSender {
    transport: Transport,
    cache: CrashReportCache,
    compress_threshold: usize,
}

impl CrashSender {
    pub fn new(transport: Transport, cache: CrashReportCache) -> Self {
        Self {
            transport,
            cache,
            compress_threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn with_compress_threshold(mut self, threshold: usize) -> Self {
        self.compress_threshold = threshold;
        self
    }

    pub fn cache(&self) -> &CrashReportCache {
        &self.cache
    }

    /// Builds the issue report for one crash log.
    pub fn build_report(
        &self,
        log: &str,
        type_name: &str,
        custom_fields: &BTreeMap<String, String>,
    ) -> Result<IssueReport, CrashError> {
        let (data, compressed) = maybe_compress(log.as_bytes(), self.compress_threshold)?;
        let attachment = if compressed {
            Attachment::file("crash", "crash-report.txt.gz", "application/gzip", data)
        } else {
            Attachment::file("crash", "crash-report.txt", "text/plain", data)
        };

        let mut report = IssueReport::new(crash_summary(log))
            .with_attachment(attachment)
            .with_payload("type", type_name);
        report.custom_fields = custom_fields.clone();
        Ok(report)
    }

    /// Sends every queued log. Accepted logs are removed from the cache;
    /// rejected ones stay for the next flush.
    pub async fn send_pending(
        &self,
        type_name: &str,
        custom_fields: &BTreeMap<String, String>,
    ) -> Result<CrashSendSummary, CrashError> {
        let mut summary = CrashSendSummary::default();

        for path in self.cache.pending()? {
            let log = std::fs::read_to_string(&path)?;
            let report = self.build_report(&log, type_name, custom_fields)?;

            match self.transport.create_issue(&report).await {
                Ok(body) => {
                    self.cache.remove(&path)?;
                    tracing::info!(path = %path.display(), "crash report sent");
                    summary.sent.push(body);
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), "crash report not sent: {err}");
                    summary.failed.push((path, err));
                }
            }
        }

        Ok(summary)
    }
}

/// First non-empty line of the log, truncated.
fn crash_summary(log: &str) -> String {
    let first = log
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("Crash report");
    let truncated: String = first.chars().take(MAX_SUMMARY_CHARS).collect();
    format!("Crash: {truncated}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::decompress_text;
    use crate::config::JmcConfig;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sender_for(base_url: &str, dir: &Path) -> CrashSender {
        let config = JmcConfig::new(base_url, "APP").resolve().unwrap();
        let transport = Transport::new(&config, BTreeMap::new());
        CrashSender::new(transport, CrashReportCache::new(dir).unwrap())
    }

    #[test]
    fn store_deduplicates_by_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CrashReportCache::new(dir.path()).unwrap();

        let a = cache.store("SIGSEGV in main").unwrap();
        let b = cache.store("SIGSEGV in main").unwrap();
        cache.store("SIGABRT in worker").unwrap();

        assert_eq!(a, b);
        assert_eq!(cache.pending().unwrap().len(), 2);
    }

    #[test]
    fn pending_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CrashReportCache::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        cache.store("boom").unwrap();

        assert_eq!(cache.pending().unwrap().len(), 1);
    }

    #[test]
    fn panic_hook_queues_the_panic() {
        // Puts the default hook back when the test ends. `take_hook` may
        // not be called while unwinding.
        struct RestoreHook;
        impl Drop for RestoreHook {
            fn drop(&mut self) {
                if !std::thread::panicking() {
                    drop(std::panic::take_hook());
                }
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let cache = CrashReportCache::new(dir.path()).unwrap();
        let _restore = RestoreHook;
        install_panic_hook(cache.clone());

        let result = std::thread::Builder::new()
            .name("worker".into())
            .spawn(|| panic!("disk full"))
            .unwrap()
            .join();
        assert!(result.is_err());

        let logs: Vec<String> = cache
            .pending()
            .unwrap()
            .iter()
            .map(|p| std::fs::read_to_string(p).unwrap())
            .collect();
        assert!(logs.iter().any(|log| log.contains("disk full") && log.contains("thread: worker")));
    }

    #[test]
    fn summary_uses_first_line() {
        assert_eq!(crash_summary("\n  EXC_BAD_ACCESS  \nframe 0"), "Crash: EXC_BAD_ACCESS");
        assert_eq!(crash_summary(""), "Crash: Crash report");
    }

    #[test]
    fn large_logs_are_attached_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let sender = sender_for("https://example.com", dir.path()).with_compress_threshold(10);

        let log = "Thread 0 crashed with a very long trace";
        let report = sender.build_report(log, "Crash", &BTreeMap::new()).unwrap();

        let attachment = &report.attachments[0];
        assert_eq!(attachment.file_name_at(0), "crash-report.txt.gz");
        assert_eq!(decompress_text(&attachment.data).unwrap(), log);
        assert_eq!(report.payload.get("type").map(String::as_str), Some("Crash"));
    }

    #[tokio::test]
    async fn sent_logs_are_removed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/jconnect/latest/issue/create"))
            .and(query_param("type", "Crash"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"key":"APP-9"}"#))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let sender = sender_for(&server.uri(), dir.path());
        sender.cache().store("crash one").unwrap();
        sender.cache().store("crash two").unwrap();

        let summary = sender.send_pending("Crash", &BTreeMap::new()).await.unwrap();

        assert_eq!(summary.sent.len(), 2);
        assert!(summary.failed.is_empty());
        assert!(sender.cache().pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_logs_stay_queued() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let sender = sender_for(&server.uri(), dir.path());
        sender.cache().store("crash").unwrap();

        let summary = sender.send_pending("Crash", &BTreeMap::new()).await.unwrap();

        assert!(summary.sent.is_empty());
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(sender.cache().pending().unwrap().len(), 1);
    }
}
