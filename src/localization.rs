//! String-table localization.
//!
//! Tables use the Apple `.strings` syntax:
//!
//! ```text
//! /* comment */
//! "inbox.title" = "Your Feedback";
//! ```
//!
//! Lookups fall back from the requested locale (`de-AT`) to its language
//! (`de`), then to the default locale, and finally to the key itself.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;

use crate::transport::TransportErrorKind;

static ENTRY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^\s*"((?:[^"\\]|\\.)*)"\s*=\s*"((?:[^"\\]|\\.)*)"\s*;"#)
        .expect("invalid strings-table regex")
});

static PLACEHOLDER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("invalid placeholder regex"));

const BUILTIN_EN: &str = include_str!("../locales/en.strings");

/// One locale's key/value table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringTable {
    entries: HashMap<String, String>,
}

impl StringTable {
    /// Parses `.strings` content. Lines that are not entries are ignored.
    pub fn parse(content: &str) -> Self {
        let entries = ENTRY_REGEX
            .captures_iter(content)
            .map(|caps| (unescape(&caps[1]), unescape(&caps[2])))
            .collect();
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Looks up user-facing strings by key and locale.
#[derive(Debug, Clone)]
pub struct Localizer {
    default_locale: String,
    tables: HashMap<String, StringTable>,
}

impl Default for Localizer {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Localizer {
    /// An empty localizer; every lookup returns the key.
    pub fn new(default_locale: impl Into<String>) -> Self {
        Self {
            default_locale: normalize_locale(&default_locale.into()),
            tables: HashMap::new(),
        }
    }

    /// English strings shipped with the crate.
    pub fn builtin() -> Self {
        let mut localizer = Self::new("en");
        localizer.add_table("en", StringTable::parse(BUILTIN_EN));
        localizer
    }

    /// Adds a table, merging over any existing entries for the locale.
    pub fn add_table(&mut self, locale: &str, table: StringTable) {
        let entry = self.tables.entry(normalize_locale(locale)).or_default();
        entry.entries.extend(table.entries);
    }

    /// Loads every `<locale>.strings` file in `dir`. Returns how many tables
    /// were added.
    pub fn load_dir(&mut self, dir: &Path) -> std::io::Result<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("strings") {
                continue;
            }
            let Some(locale) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let content = std::fs::read_to_string(&path)?;
            self.add_table(locale, StringTable::parse(&content));
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn default_locale(&self) -> &str {
        &self.default_locale
    }

    /// Resolves `key` for `locale`, returning the key when no table has it.
    pub fn lookup(&self, key: &str, locale: &str) -> String {
        let locale = normalize_locale(locale);
        let language = locale.split('-').next().unwrap_or(&locale).to_string();

        [locale.as_str(), language.as_str(), self.default_locale.as_str()]
            .iter()
            .filter_map(|candidate| self.tables.get(*candidate))
            .find_map(|table| table.get(key))
            .map(str::to_string)
            .unwrap_or_else(|| key.to_string())
    }

    /// Resolves `key` and replaces `{name}` placeholders from `args`.
    /// Unknown placeholders are left as they are.
    pub fn format(&self, key: &str, locale: &str, args: &[(&str, &str)]) -> String {
        let template = self.lookup(key, locale);
        PLACEHOLDER_REGEX
            .replace_all(&template, |caps: &regex::Captures<'_>| {
                let name = &caps[1];
                args.iter()
                    .find(|(arg, _)| *arg == name)
                    .map(|(_, value)| value.to_string())
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    /// User-facing message for a transport failure class.
    pub fn error_message(&self, kind: TransportErrorKind, locale: &str) -> String {
        let key = match kind {
            TransportErrorKind::Connectivity => "error.connectivity",
            TransportErrorKind::Server => "error.server",
            TransportErrorKind::Cancelled => "error.cancelled",
            TransportErrorKind::MalformedResponse => "error.malformed",
            TransportErrorKind::InvalidRequest => "error.invalid",
        };
        self.lookup(key, locale)
    }
}

/// `de_AT` and `DE-at` both become `de-at`.
fn normalize_locale(locale: &str) -> String {
    locale.trim().replace('_', "-").to_lowercase()
}
