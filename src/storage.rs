//! SQLite storage for the issue inbox.
//!
//! Keeps the issues this install has raised and the comments on them, so the
//! issue list can be shown offline and new replies can be counted.

use rusqlite::{params, Connection, OptionalExtension, Result, Row};
use serde::Serialize;
use std::path::Path;

/// Database file name inside the data directory.
pub const DATABASE_FILE_NAME: &str = "jmc-issues.db";

/// An issue raised from this install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredIssue {
    pub key: String,
    pub summary: Option<String>,
    pub status: Option<String>,
    pub description: Option<String>,
    pub date_created: i64,
    pub date_updated: i64,
    /// Set when comments arrived that the user has not seen yet.
    pub has_updates: bool,
}

/// A comment on a stored issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredComment {
    pub id: i64,
    pub issue_key: String,
    pub author: String,
    pub body: String,
    pub date: i64,
    /// Comments written by the tracker rather than by this install's user.
    pub system_user: bool,
}

/// SQLite-backed issue inbox.
pub struct IssueStore {
    conn: Connection,
}

impl IssueStore {
    /// Opens or creates an inbox database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Opens an in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS issues (
                key TEXT PRIMARY KEY NOT NULL,
                summary TEXT,
                status TEXT,
                description TEXT,
                date_created INTEGER NOT NULL,
                date_updated INTEGER NOT NULL,
                has_updates INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS comments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                issue_key TEXT NOT NULL,
                author TEXT NOT NULL,
                body TEXT NOT NULL,
                date INTEGER NOT NULL,
                system_user INTEGER NOT NULL DEFAULT 0,
                UNIQUE (issue_key, author, date, body)
            );

            CREATE INDEX IF NOT EXISTS idx_issues_updated ON issues(date_updated DESC);
            CREATE INDEX IF NOT EXISTS idx_comments_issue ON comments(issue_key, date);
            ",
        )
    }

    /// Inserts an issue or refreshes its summary, status and update time.
    /// The unread flag is only ever raised here, never cleared.
    pub fn upsert_issue(&self, issue: &StoredIssue) -> Result<()> {
        self.conn.execute(
            "INSERT INTO issues (
                key, summary, status, description, date_created, date_updated, has_updates
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(key) DO UPDATE SET
                summary = COALESCE(excluded.summary, issues.summary),
                status = COALESCE(excluded.status, issues.status),
                description = COALESCE(excluded.description, issues.description),
                date_updated = MAX(issues.date_updated, excluded.date_updated),
                has_updates = MAX(issues.has_updates, excluded.has_updates)",
            params![
                issue.key,
                issue.summary,
                issue.status,
                issue.description,
                issue.date_created,
                issue.date_updated,
                issue.has_updates,
            ],
        )?;
        Ok(())
    }

    /// Inserts a comment. Returns the row ID, or `None` if the same comment
    /// was already stored.
    pub fn insert_comment(&self, comment: &StoredComment) -> Result<Option<i64>> {
        let result = self.conn.execute(
            "INSERT OR IGNORE INTO comments (issue_key, author, body, date, system_user)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                comment.issue_key,
                comment.author,
                comment.body,
                comment.date,
                comment.system_user,
            ],
        )?;

        if result == 0 {
            Ok(None)
        } else {
            Ok(Some(self.conn.last_insert_rowid()))
        }
    }

    /// Issues ordered by most recent update.
    pub fn list_issues(&self, limit: usize) -> Result<Vec<StoredIssue>> {
        let mut stmt = self.conn.prepare(
            "SELECT key, summary, status, description, date_created, date_updated, has_updates
             FROM issues
             ORDER BY date_updated DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], issue_from_row)?;
        rows.collect()
    }

    pub fn get_issue(&self, key: &str) -> Result<Option<StoredIssue>> {
        self.conn
            .query_row(
                "SELECT key, summary, status, description, date_created, date_updated, has_updates
                 FROM issues WHERE key = ?1",
                [key],
                issue_from_row,
            )
            .optional()
    }

    /// Comments on an issue, oldest first.
    pub fn comments_for(&self, issue_key: &str) -> Result<Vec<StoredComment>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, issue_key, author, body, date, system_user
             FROM comments
             WHERE issue_key = ?1
             ORDER BY date ASC, id ASC",
        )?;

        let rows = stmt.query_map([issue_key], |row| {
            Ok(StoredComment {
                id: row.get(0)?,
                issue_key: row.get(1)?,
                author: row.get(2)?,
                body: row.get(3)?,
                date: row.get(4)?,
                system_user: row.get(5)?,
            })
        })?;

        rows.collect()
    }

    /// Removes the oldest locally written comment by `author` with this
    /// body, once the server has echoed it back. Returns whether one was
    /// removed.
    pub fn remove_local_comment(&self, issue_key: &str, author: &str, body: &str) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM comments WHERE id = (
                SELECT id FROM comments
                WHERE issue_key = ?1 AND author = ?2 AND body = ?3
                ORDER BY date ASC, id ASC
                LIMIT 1
            )",
            params![issue_key, author, body],
        )?;
        Ok(removed > 0)
    }

    /// Clears the unread flag. Returns false if the issue is unknown.
    pub fn mark_read(&self, key: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("UPDATE issues SET has_updates = 0 WHERE key = ?1", [key])?;
        Ok(changed > 0)
    }

    /// Number of issues with unread comments.
    pub fn unread_count(&self) -> Result<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM issues WHERE has_updates = 1",
            [],
            |row| row.get(0),
        )
    }

    pub fn count(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM issues", [], |row| row.get(0))
    }
}

fn issue_from_row(row: &Row<'_>) -> Result<StoredIssue> {
    Ok(StoredIssue {
        key: row.get(0)?,
        summary: row.get(1)?,
        status: row.get(2)?,
        description: row.get(3)?,
        date_created: row.get(4)?,
        date_updated: row.get(5)?,
        has_updates: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(key: &str, updated: i64, has_updates: bool) -> StoredIssue {
        StoredIssue {
            key: key.to_string(),
            summary: Some(format!("summary of {key}")),
            status: Some("Open".to_string()),
            description: None,
            date_created: 1000,
            date_updated: updated,
            has_updates,
        }
    }

    fn comment(key: &str, body: &str, date: i64) -> StoredComment {
        StoredComment {
            id: 0,
            issue_key: key.to_string(),
            author: "support".to_string(),
            body: body.to_string(),
            date,
            system_user: true,
        }
    }

    #[test]
    fn test_upsert_and_list() {
        let store = IssueStore::open_in_memory().unwrap();
        store.upsert_issue(&issue("APP-1", 1000, false)).unwrap();
        store.upsert_issue(&issue("APP-2", 2000, false)).unwrap();

        let issues = store.list_issues(10).unwrap();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].key, "APP-2");
    }

    #[test]
    fn test_upsert_keeps_known_fields() {
        let store = IssueStore::open_in_memory().unwrap();
        store.upsert_issue(&issue("APP-1", 1000, true)).unwrap();

        let mut refresh = issue("APP-1", 500, false);
        refresh.summary = None;
        refresh.status = Some("Resolved".to_string());
        store.upsert_issue(&refresh).unwrap();

        let stored = store.get_issue("APP-1").unwrap().unwrap();
        assert_eq!(stored.summary.as_deref(), Some("summary of APP-1"));
        assert_eq!(stored.status.as_deref(), Some("Resolved"));
        assert_eq!(stored.date_updated, 1000);
        assert!(stored.has_updates);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_duplicate_comment_prevention() {
        let store = IssueStore::open_in_memory().unwrap();
        store.upsert_issue(&issue("APP-1", 1000, false)).unwrap();

        let first = store.insert_comment(&comment("APP-1", "looking into it", 1100)).unwrap();
        let again = store.insert_comment(&comment("APP-1", "looking into it", 1100)).unwrap();
        store.insert_comment(&comment("APP-1", "fixed", 1200)).unwrap();

        assert!(first.is_some());
        assert!(again.is_none());
        let comments = store.comments_for("APP-1").unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[1].body, "fixed");
    }

    #[test]
    fn test_remove_local_comment() {
        let store = IssueStore::open_in_memory().unwrap();
        let mut local = comment("APP-1", "more detail", 1000);
        local.author = "install-1".to_string();
        local.system_user = false;
        store.insert_comment(&local).unwrap();
        store.insert_comment(&comment("APP-1", "more detail", 2000)).unwrap();

        assert!(store.remove_local_comment("APP-1", "install-1", "more detail").unwrap());
        assert!(!store.remove_local_comment("APP-1", "install-1", "more detail").unwrap());

        let remaining = store.comments_for("APP-1").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].author, "support");
    }

    #[test]
    fn test_unread_tracking() {
        let store = IssueStore::open_in_memory().unwrap();
        store.upsert_issue(&issue("APP-1", 1000, true)).unwrap();
        store.upsert_issue(&issue("APP-2", 1000, true)).unwrap();
        assert_eq!(store.unread_count().unwrap(), 2);

        assert!(store.mark_read("APP-1").unwrap());
        assert!(!store.mark_read("APP-404").unwrap());
        assert_eq!(store.unread_count().unwrap(), 1);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DATABASE_FILE_NAME);
        {
            let store = IssueStore::open(&path).unwrap();
            store.upsert_issue(&issue("APP-1", 1000, false)).unwrap();
        }
        let reopened = IssueStore::open(&path).unwrap();
        assert_eq!(reopened.count().unwrap(), 1);
    }
}
