use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use rusqlite::{params, Connection, OptionalExtension};

use crate::generate::Article;
use crate::identity::{CorrelationKey, MessageKey};
use crate::mail::{MailMessage, SavedAttachment};

/// Processing state of a message record. Transitions are monotonic:
/// NEW -> GENERATED -> PUBLISHED, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageStatus {
    New,
    Generated,
    Published,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::New => "NEW",
            MessageStatus::Generated => "GENERATED",
            MessageStatus::Published => "PUBLISHED",
        }
    }

    /// Whether moving to `next` respects the monotonic transition table.
    pub fn can_advance_to(&self, next: MessageStatus) -> bool {
        next >= *self
    }
}

impl FromStr for MessageStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NEW" => Ok(MessageStatus::New),
            "GENERATED" => Ok(MessageStatus::Generated),
            "PUBLISHED" => Ok(MessageStatus::Published),
            other => Err(anyhow::anyhow!("unknown message status: {}", other)),
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A monitored IMAP account with its sync cursor.
#[derive(Debug, Clone)]
pub struct MailboxRecord {
    pub email_address: String,
    pub password: String,
    pub imap_server: String,
    pub imap_port: u16,
    pub enabled: bool,
    pub last_uid_checked: u32,
}

/// A persisted message.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub key: MessageKey,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub date: DateTime<Local>,
    pub body: String,
    pub imap_uid: u32,
    pub status: MessageStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct AttachmentRecord {
    pub id: i64,
    pub filename: String,
    pub filepath: PathBuf,
    pub content_type: String,
}

#[derive(Debug, Clone)]
pub struct ArticleRecord {
    pub id: i64,
    pub storage_key: String,
    pub title: String,
    pub article: Article,
    pub published: bool,
    pub cms_url: Option<String>,
}

/// Where an already-processed copy of a logical message lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedElsewhere {
    pub storage_key: String,
    pub account: String,
    pub status: MessageStatus,
    pub subject: String,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub total_messages: usize,
    pub new_messages: usize,
    pub generated: usize,
    pub published: usize,
    pub published_articles: usize,
    pub attachments: usize,
}

/// Persists, per account, the highest UID already incorporated into local
/// state. Monotonicity of writes is the sync engine's contract, not the
/// store's.
pub trait CursorStore {
    /// Stored watermark, 0 for unknown accounts.
    fn last_uid(&self, account: &str) -> u32;
    fn set_last_uid(&self, account: &str, uid: u32) -> Result<()>;
}

/// SQLite-backed store for mailboxes, messages, attachments and articles.
///
/// Local state is a projection of the mail server: records whose backing
/// message disappears are physically removed by `reconcile`.
pub struct RecordStore {
    conn: Connection,
}

impl RecordStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory: {:?}", parent))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database: {:?}", db_path))?;
        let store = RecordStore { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = RecordStore {
            conn: Connection::open_in_memory()?,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    #[cfg(test)]
    pub(crate) fn run_sql(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS mailboxes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email_address TEXT UNIQUE NOT NULL,
                password TEXT NOT NULL,
                imap_server TEXT NOT NULL,
                imap_port INTEGER NOT NULL DEFAULT 993,
                enabled BOOLEAN NOT NULL DEFAULT 1,
                last_uid_checked INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                storage_key TEXT PRIMARY KEY,
                correlation_key TEXT NOT NULL,
                mailbox_account TEXT NOT NULL,
                sender TEXT NOT NULL,
                recipient TEXT NOT NULL,
                subject TEXT NOT NULL,
                date TEXT NOT NULL,
                body TEXT NOT NULL,
                imap_uid INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'NEW',
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS attachments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                storage_key TEXT NOT NULL,
                filename TEXT NOT NULL,
                filepath TEXT NOT NULL,
                content_type TEXT NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (storage_key) REFERENCES messages(storage_key)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                storage_key TEXT UNIQUE NOT NULL,
                title TEXT NOT NULL,
                json_data TEXT NOT NULL,
                published BOOLEAN NOT NULL DEFAULT 0,
                cms_url TEXT,
                generated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                published_at TIMESTAMP,
                FOREIGN KEY (storage_key) REFERENCES messages(storage_key)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(status)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_correlation ON messages(correlation_key)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_account ON messages(mailbox_account)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(storage_key)",
            [],
        )?;

        Ok(())
    }

    // ===== messages =====

    /// Insert a newly observed message, or touch its update timestamp when
    /// the storage key already exists. Repeated delivery of the same message
    /// never duplicates or rewrites stored content. Returns true on insert.
    pub fn upsert_message(&self, message: &MailMessage) -> Result<bool> {
        let storage_key = message.key.storage_key();
        let exists: Option<String> = self
            .conn
            .query_row(
                "SELECT storage_key FROM messages WHERE storage_key = ?1",
                params![storage_key],
                |row| row.get(0),
            )
            .optional()?;

        if exists.is_some() {
            log::debug!("duplicate message ignored: {}", storage_key);
            self.conn.execute(
                "UPDATE messages SET updated_at = CURRENT_TIMESTAMP WHERE storage_key = ?1",
                params![storage_key],
            )?;
            return Ok(false);
        }

        log::info!("storing new message: {} ({})", storage_key, message.subject);
        self.conn.execute(
            "INSERT INTO messages (
                storage_key, correlation_key, mailbox_account, sender, recipient,
                subject, date, body, imap_uid
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                storage_key,
                message.key.correlation.to_string(),
                message.key.account,
                message.sender,
                message.recipient,
                message.subject,
                message.date.to_rfc3339(),
                message.body,
                message.uid,
            ],
        )?;
        self.insert_attachments(&storage_key, &message.attachments)?;
        Ok(true)
    }

    /// Attach files to a message, skipping filenames already recorded for it.
    pub fn insert_attachments(
        &self,
        storage_key: &str,
        attachments: &[SavedAttachment],
    ) -> Result<()> {
        for attachment in attachments {
            let exists: Option<i64> = self
                .conn
                .query_row(
                    "SELECT id FROM attachments WHERE storage_key = ?1 AND filename = ?2",
                    params![storage_key, attachment.filename],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                self.conn.execute(
                    "INSERT INTO attachments (storage_key, filename, filepath, content_type)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        storage_key,
                        attachment.filename,
                        attachment.path.to_string_lossy(),
                        attachment.content_type,
                    ],
                )?;
            }
        }
        Ok(())
    }

    /// Advance a message's status. Returns false when the record has
    /// vanished; callers must treat that as "abort this pipeline step".
    /// A regressive transition is refused and leaves the row untouched.
    pub fn set_status(&self, key: &MessageKey, status: MessageStatus) -> Result<bool> {
        let storage_key = key.storage_key();
        let current: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM messages WHERE storage_key = ?1",
                params![storage_key],
                |row| row.get(0),
            )
            .optional()?;

        let current = match current {
            Some(raw) => raw.parse::<MessageStatus>()?,
            None => return Ok(false),
        };
        if !current.can_advance_to(status) {
            log::warn!(
                "refusing status regression {} -> {} for {}",
                current,
                status,
                storage_key
            );
            return Ok(true);
        }

        self.conn.execute(
            "UPDATE messages SET status = ?1, updated_at = CURRENT_TIMESTAMP
             WHERE storage_key = ?2",
            params![status.as_str(), storage_key],
        )?;
        Ok(true)
    }

    pub fn message(&self, key: &MessageKey) -> Result<Option<MessageRecord>> {
        self.message_by_storage_key(&key.storage_key())
    }

    pub fn message_by_storage_key(&self, storage_key: &str) -> Result<Option<MessageRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT storage_key, sender, recipient, subject, date, body, imap_uid,
                        status, created_at, updated_at
                 FROM messages WHERE storage_key = ?1",
                params![storage_key],
                Self::row_to_message,
            )
            .optional()?;
        record.transpose()
    }

    fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Result<MessageRecord>> {
        let storage_key: String = row.get(0)?;
        let date_raw: String = row.get(4)?;
        let status_raw: String = row.get(7)?;
        Ok((|| {
            let key = MessageKey::parse(&storage_key)
                .with_context(|| format!("malformed storage key: {}", storage_key))?;
            Ok(MessageRecord {
                key,
                sender: row.get(1)?,
                recipient: row.get(2)?,
                subject: row.get(3)?,
                date: DateTime::parse_from_rfc3339(&date_raw)
                    .map(|d| d.with_timezone(&Local))
                    .unwrap_or_else(|_| Local::now()),
                body: row.get(5)?,
                imap_uid: row.get(6)?,
                status: status_raw.parse()?,
                created_at: row.get(8)?,
                updated_at: row.get(9)?,
            })
        })())
    }

    pub fn recent_messages(
        &self,
        limit: usize,
        status: Option<MessageStatus>,
    ) -> Result<Vec<MessageRecord>> {
        let mut sql = String::from(
            "SELECT storage_key, sender, recipient, subject, date, body, imap_uid,
                    status, created_at, updated_at
             FROM messages",
        );
        if status.is_some() {
            sql.push_str(" WHERE status = ?1");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ");
        sql.push_str(&limit.to_string());

        let mut stmt = self.conn.prepare(&sql)?;
        let rows: Vec<rusqlite::Result<Result<MessageRecord>>> = match status {
            Some(s) => stmt
                .query_map(params![s.as_str()], Self::row_to_message)?
                .collect(),
            None => stmt.query_map([], Self::row_to_message)?.collect(),
        };
        let mut records = Vec::new();
        for row in rows {
            records.push(row??);
        }
        Ok(records)
    }

    pub fn attachments_for(&self, storage_key: &str) -> Result<Vec<AttachmentRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, filename, filepath, content_type FROM attachments
             WHERE storage_key = ?1",
        )?;
        let rows = stmt.query_map(params![storage_key], |row| {
            Ok(AttachmentRecord {
                id: row.get(0)?,
                filename: row.get(1)?,
                filepath: PathBuf::from(row.get::<_, String>(2)?),
                content_type: row.get(3)?,
            })
        })?;
        let mut attachments = Vec::new();
        for row in rows {
            attachments.push(row?);
        }
        Ok(attachments)
    }

    /// Any record for the same logical message already at GENERATED or
    /// PUBLISHED, regardless of which account it arrived on.
    pub fn find_processed_by_correlation(
        &self,
        correlation: &CorrelationKey,
    ) -> Result<Option<ProcessedElsewhere>> {
        let found = self
            .conn
            .query_row(
                "SELECT storage_key, mailbox_account, status, subject FROM messages
                 WHERE correlation_key = ?1 AND status IN ('GENERATED', 'PUBLISHED')
                 LIMIT 1",
                params![correlation.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        match found {
            Some((storage_key, account, status, subject)) => Ok(Some(ProcessedElsewhere {
                storage_key,
                account,
                status: status.parse()?,
                subject,
            })),
            None => Ok(None),
        }
    }

    // ===== articles =====

    /// Upsert the generated article for a message and advance its status to
    /// GENERATED in one transaction. Returns false when the message record
    /// has vanished.
    pub fn save_article(&self, key: &MessageKey, article: &Article) -> Result<bool> {
        let storage_key = key.storage_key();
        let tx = self.conn.unchecked_transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM messages WHERE storage_key = ?1",
                params![storage_key],
                |row| row.get(0),
            )
            .optional()?;
        let current = match current {
            Some(raw) => raw.parse::<MessageStatus>()?,
            None => return Ok(false),
        };

        tx.execute(
            "INSERT INTO articles (storage_key, title, json_data)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(storage_key) DO UPDATE SET
                title = excluded.title,
                json_data = excluded.json_data,
                generated_at = CURRENT_TIMESTAMP",
            params![storage_key, article.title, serde_json::to_string(article)?],
        )?;
        if current.can_advance_to(MessageStatus::Generated) {
            tx.execute(
                "UPDATE messages SET status = 'GENERATED', updated_at = CURRENT_TIMESTAMP
                 WHERE storage_key = ?1",
                params![storage_key],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    /// Mark the article published and the message PUBLISHED as a single
    /// logical unit; no observable state has one without the other.
    /// Returns false when either row has vanished.
    pub fn mark_published(&self, key: &MessageKey, url: Option<&str>) -> Result<bool> {
        let storage_key = key.storage_key();
        let tx = self.conn.unchecked_transaction()?;

        let articles = tx.execute(
            "UPDATE articles
             SET published = 1, cms_url = ?1, published_at = CURRENT_TIMESTAMP
             WHERE storage_key = ?2",
            params![url, storage_key],
        )?;
        let messages = tx.execute(
            "UPDATE messages SET status = 'PUBLISHED', updated_at = CURRENT_TIMESTAMP
             WHERE storage_key = ?1",
            params![storage_key],
        )?;

        if articles == 0 || messages == 0 {
            // One side vanished; leave both untouched.
            return Ok(false);
        }
        tx.commit()?;
        Ok(true)
    }

    pub fn article(&self, key: &MessageKey) -> Result<Option<ArticleRecord>> {
        let found = self
            .conn
            .query_row(
                "SELECT id, storage_key, title, json_data, published, cms_url
                 FROM articles WHERE storage_key = ?1",
                params![key.storage_key()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?;
        match found {
            Some((id, storage_key, title, json_data, published, cms_url)) => {
                Ok(Some(ArticleRecord {
                    id,
                    storage_key,
                    title,
                    article: serde_json::from_str(&json_data)?,
                    published,
                    cms_url,
                }))
            }
            None => Ok(None),
        }
    }

    // ===== reconciliation =====

    /// Storage keys and IMAP UIDs of every record for one account, used to
    /// build the live set during reconciliation.
    pub fn messages_for_account(&self, account: &str) -> Result<Vec<(String, u32)>> {
        let mut stmt = self.conn.prepare(
            "SELECT storage_key, imap_uid FROM messages WHERE mailbox_account = ?1",
        )?;
        let rows = stmt.query_map(params![account], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Delete every local record for `account` whose storage key is not in
    /// the authoritative live set, cascading to attachments (their backing
    /// files included) and articles. The server is the source of truth for
    /// existence. Returns the number of messages deleted.
    pub fn reconcile(&self, account: &str, live_keys: &HashSet<String>) -> Result<usize> {
        let locals = self.messages_for_account(account)?;
        let to_delete: Vec<String> = locals
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| !live_keys.contains(key))
            .collect();

        let tx = self.conn.unchecked_transaction()?;
        for storage_key in &to_delete {
            Self::delete_record_cascade(&tx, storage_key)?;
        }
        tx.commit()?;

        if !to_delete.is_empty() {
            log::info!(
                "reconciliation for {}: deleted {} records no longer on the server",
                account,
                to_delete.len()
            );
        }
        Ok(to_delete.len())
    }

    /// Remove records sharing (subject, date, sender), keeping the first of
    /// each group. Covers messages delivered twice with distinct
    /// Message-IDs. Returns the number removed.
    pub fn remove_duplicates(&self) -> Result<usize> {
        let mut stmt = self.conn.prepare(
            "SELECT GROUP_CONCAT(storage_key) FROM messages
             GROUP BY subject, date, sender
             HAVING COUNT(*) > 1",
        )?;
        let groups: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        let mut removed = 0;
        let tx = self.conn.unchecked_transaction()?;
        for group in groups {
            for storage_key in group.split(',').skip(1) {
                Self::delete_record_cascade(&tx, storage_key)?;
                removed += 1;
                log::info!("removed duplicate record: {}", storage_key);
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    /// Delete one message row together with its attachments (backing files
    /// included) and article. File removal failures are logged, never fatal.
    fn delete_record_cascade(conn: &Connection, storage_key: &str) -> Result<()> {
        let mut stmt = conn.prepare("SELECT filepath FROM attachments WHERE storage_key = ?1")?;
        let paths: Vec<String> = stmt
            .query_map(params![storage_key], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        for path in paths {
            let path = Path::new(&path);
            if path.exists() {
                if let Err(e) = fs::remove_file(path) {
                    log::error!("could not delete attachment file {:?}: {}", path, e);
                } else {
                    log::info!("deleted attachment file {:?}", path);
                }
            }
        }

        conn.execute(
            "DELETE FROM attachments WHERE storage_key = ?1",
            params![storage_key],
        )?;
        conn.execute(
            "DELETE FROM articles WHERE storage_key = ?1",
            params![storage_key],
        )?;
        conn.execute(
            "DELETE FROM messages WHERE storage_key = ?1",
            params![storage_key],
        )?;
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        stats.total_messages =
            self.conn
                .query_row("SELECT COUNT(*) FROM messages", [], |row| {
                    row.get::<_, i64>(0)
                })? as usize;

        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM messages GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match status.parse::<MessageStatus>() {
                Ok(MessageStatus::New) => stats.new_messages = count as usize,
                Ok(MessageStatus::Generated) => stats.generated = count as usize,
                Ok(MessageStatus::Published) => stats.published = count as usize,
                Err(e) => log::warn!("{}", e),
            }
        }

        stats.published_articles = self.conn.query_row(
            "SELECT COUNT(*) FROM articles WHERE published = 1",
            [],
            |row| row.get::<_, i64>(0),
        )? as usize;
        stats.attachments =
            self.conn
                .query_row("SELECT COUNT(*) FROM attachments", [], |row| {
                    row.get::<_, i64>(0)
                })? as usize;
        Ok(stats)
    }

    // ===== mailboxes =====

    pub fn add_mailbox(&self, mailbox: &MailboxRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO mailboxes (email_address, password, imap_server, imap_port, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(email_address) DO UPDATE SET
                password = excluded.password,
                imap_server = excluded.imap_server,
                imap_port = excluded.imap_port,
                enabled = excluded.enabled",
            params![
                mailbox.email_address,
                mailbox.password,
                mailbox.imap_server,
                mailbox.imap_port,
                mailbox.enabled,
            ],
        )?;
        log::info!("mailbox saved: {}", mailbox.email_address);
        Ok(())
    }

    pub fn mailboxes(&self, only_enabled: bool) -> Result<Vec<MailboxRecord>> {
        let sql = if only_enabled {
            "SELECT email_address, password, imap_server, imap_port, enabled, last_uid_checked
             FROM mailboxes WHERE enabled = 1"
        } else {
            "SELECT email_address, password, imap_server, imap_port, enabled, last_uid_checked
             FROM mailboxes"
        };
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(MailboxRecord {
                email_address: row.get(0)?,
                password: row.get(1)?,
                imap_server: row.get(2)?,
                imap_port: row.get(3)?,
                enabled: row.get(4)?,
                last_uid_checked: row.get(5)?,
            })
        })?;
        let mut mailboxes = Vec::new();
        for row in rows {
            mailboxes.push(row?);
        }
        Ok(mailboxes)
    }

    /// Mailbox rows are removed on request, but their historical message
    /// records persist.
    pub fn remove_mailbox(&self, email_address: &str) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM mailboxes WHERE email_address = ?1",
            params![email_address],
        )?;
        Ok(removed > 0)
    }

    pub fn set_mailbox_enabled(&self, email_address: &str, enabled: bool) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE mailboxes SET enabled = ?1 WHERE email_address = ?2",
            params![enabled, email_address],
        )?;
        Ok(changed > 0)
    }
}

impl CursorStore for RecordStore {
    fn last_uid(&self, account: &str) -> u32 {
        self.conn
            .query_row(
                "SELECT last_uid_checked FROM mailboxes WHERE email_address = ?1",
                params![account],
                |row| row.get(0),
            )
            .optional()
            .ok()
            .flatten()
            .unwrap_or(0)
    }

    fn set_last_uid(&self, account: &str, uid: u32) -> Result<()> {
        self.conn.execute(
            "UPDATE mailboxes SET last_uid_checked = ?1 WHERE email_address = ?2",
            params![uid, account],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::CorrelationKey;

    fn message(account: &str, message_id: &str, uid: u32) -> MailMessage {
        MailMessage {
            key: MessageKey::new(account, CorrelationKey::resolve(Some(message_id), uid)),
            uid,
            sender: "Press Office <redazione@esempio.it>".to_string(),
            recipient: account.to_string(),
            subject: format!("subject for {}", message_id),
            date: Local::now(),
            body: "press release body".to_string(),
            attachments: Vec::new(),
        }
    }

    fn article(title: &str) -> Article {
        Article {
            kind: "Spotlight".to_string(),
            category: "Attualità".to_string(),
            title: title.to_string(),
            subtitle: String::new(),
            lead: String::new(),
            sections: vec!["body".to_string()],
            image: None,
        }
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = RecordStore::open_in_memory().unwrap();
        let msg = message("a@voce.it", "<m1@x>", 10);
        assert!(store.upsert_message(&msg).unwrap());
        assert!(!store.upsert_message(&msg).unwrap());
        assert_eq!(store.stats().unwrap().total_messages, 1);
    }

    #[test]
    fn test_set_status_absent_key_returns_false() {
        let store = RecordStore::open_in_memory().unwrap();
        let key = MessageKey::new("a@voce.it", CorrelationKey::MessageId("ghost@x".into()));
        assert!(!store.set_status(&key, MessageStatus::Generated).unwrap());
    }

    #[test]
    fn test_status_never_regresses() {
        let store = RecordStore::open_in_memory().unwrap();
        let msg = message("a@voce.it", "<m1@x>", 10);
        store.upsert_message(&msg).unwrap();
        store.save_article(&msg.key, &article("t")).unwrap();
        store.mark_published(&msg.key, Some("https://cms/1")).unwrap();

        assert!(store.set_status(&msg.key, MessageStatus::New).unwrap());
        assert!(store.set_status(&msg.key, MessageStatus::Generated).unwrap());
        let record = store.message(&msg.key).unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Published);
    }

    #[test]
    fn test_save_article_sets_generated() {
        let store = RecordStore::open_in_memory().unwrap();
        let msg = message("a@voce.it", "<m1@x>", 10);
        store.upsert_message(&msg).unwrap();
        assert!(store.save_article(&msg.key, &article("Titolo")).unwrap());

        let record = store.message(&msg.key).unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Generated);
        let stored = store.article(&msg.key).unwrap().unwrap();
        assert_eq!(stored.title, "Titolo");
        assert!(!stored.published);
    }

    #[test]
    fn test_save_article_for_vanished_message() {
        let store = RecordStore::open_in_memory().unwrap();
        let key = MessageKey::new("a@voce.it", CorrelationKey::MessageId("ghost@x".into()));
        assert!(!store.save_article(&key, &article("t")).unwrap());
    }

    #[test]
    fn test_mark_published_updates_both_or_neither() {
        let store = RecordStore::open_in_memory().unwrap();
        let msg = message("a@voce.it", "<m1@x>", 10);
        store.upsert_message(&msg).unwrap();

        // No article yet: nothing must change.
        assert!(!store.mark_published(&msg.key, Some("https://cms/1")).unwrap());
        let record = store.message(&msg.key).unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::New);

        store.save_article(&msg.key, &article("t")).unwrap();
        assert!(store.mark_published(&msg.key, Some("https://cms/1")).unwrap());
        let record = store.message(&msg.key).unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Published);
        let stored = store.article(&msg.key).unwrap().unwrap();
        assert!(stored.published);
        assert_eq!(stored.cms_url.as_deref(), Some("https://cms/1"));
    }

    #[test]
    fn test_find_processed_by_correlation_across_accounts() {
        let store = RecordStore::open_in_memory().unwrap();
        let first = message("first@voce.it", "<m1@x>", 10);
        store.upsert_message(&first).unwrap();

        // Still NEW: not reported as processed.
        assert!(store
            .find_processed_by_correlation(&first.key.correlation)
            .unwrap()
            .is_none());

        store.save_article(&first.key, &article("t")).unwrap();
        let second = message("second@voce.it", "<m1@x>", 90);
        let found = store
            .find_processed_by_correlation(&second.key.correlation)
            .unwrap()
            .unwrap();
        assert_eq!(found.account, "first@voce.it");
        assert_eq!(found.status, MessageStatus::Generated);
    }

    #[test]
    fn test_reconcile_deletes_missing_records_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("foto.jpg");
        fs::write(&file_path, b"jpeg").unwrap();

        let store = RecordStore::open_in_memory().unwrap();
        let keep_a = message("a@voce.it", "<x@x>", 1);
        let keep_b = message("a@voce.it", "<y@x>", 2);
        let mut gone = message("a@voce.it", "<z@x>", 3);
        gone.attachments.push(SavedAttachment {
            filename: "foto.jpg".to_string(),
            path: file_path.clone(),
            content_type: "image/jpeg".to_string(),
        });
        for msg in [&keep_a, &keep_b, &gone] {
            store.upsert_message(msg).unwrap();
        }
        store.save_article(&gone.key, &article("doomed")).unwrap();

        let live: HashSet<String> =
            [keep_a.key.storage_key(), keep_b.key.storage_key()].into();
        assert_eq!(store.reconcile("a@voce.it", &live).unwrap(), 1);

        assert!(store.message(&keep_a.key).unwrap().is_some());
        assert!(store.message(&keep_b.key).unwrap().is_some());
        assert!(store.message(&gone.key).unwrap().is_none());
        assert!(store.article(&gone.key).unwrap().is_none());
        assert!(store.attachments_for(&gone.key.storage_key()).unwrap().is_empty());
        assert!(!file_path.exists());
    }

    #[test]
    fn test_reconcile_is_scoped_to_one_account() {
        let store = RecordStore::open_in_memory().unwrap();
        let mine = message("a@voce.it", "<m@x>", 1);
        let other = message("b@voce.it", "<n@x>", 1);
        store.upsert_message(&mine).unwrap();
        store.upsert_message(&other).unwrap();

        assert_eq!(store.reconcile("a@voce.it", &HashSet::new()).unwrap(), 1);
        assert!(store.message(&mine.key).unwrap().is_none());
        assert!(store.message(&other.key).unwrap().is_some());
    }

    #[test]
    fn test_remove_duplicates_keeps_first() {
        let store = RecordStore::open_in_memory().unwrap();
        let date = Local::now();
        let mut first = message("a@voce.it", "<m1@x>", 1);
        let mut second = message("a@voce.it", "<m2@x>", 2);
        first.subject = "same".to_string();
        second.subject = "same".to_string();
        first.date = date;
        second.date = date;
        store.upsert_message(&first).unwrap();
        store.upsert_message(&second).unwrap();

        assert_eq!(store.remove_duplicates().unwrap(), 1);
        assert_eq!(store.stats().unwrap().total_messages, 1);
    }

    #[test]
    fn test_remove_duplicates_deletes_backing_files() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("copia.jpg");
        fs::write(&file_path, b"jpeg").unwrap();

        let store = RecordStore::open_in_memory().unwrap();
        let date = Local::now();
        let mut first = message("a@voce.it", "<m1@x>", 1);
        let mut second = message("a@voce.it", "<m2@x>", 2);
        first.subject = "same".to_string();
        second.subject = "same".to_string();
        first.date = date;
        second.date = date;
        second.attachments.push(SavedAttachment {
            filename: "copia.jpg".to_string(),
            path: file_path.clone(),
            content_type: "image/jpeg".to_string(),
        });
        store.upsert_message(&first).unwrap();
        store.upsert_message(&second).unwrap();

        assert_eq!(store.remove_duplicates().unwrap(), 1);
        assert!(store
            .attachments_for(&second.key.storage_key())
            .unwrap()
            .is_empty());
        assert!(!file_path.exists());
    }

    #[test]
    fn test_cursor_store_defaults_and_updates() {
        let store = RecordStore::open_in_memory().unwrap();
        assert_eq!(store.last_uid("unknown@voce.it"), 0);

        store
            .add_mailbox(&MailboxRecord {
                email_address: "a@voce.it".to_string(),
                password: "secret".to_string(),
                imap_server: "imap.register.it".to_string(),
                imap_port: 993,
                enabled: true,
                last_uid_checked: 0,
            })
            .unwrap();
        store.set_last_uid("a@voce.it", 105).unwrap();
        assert_eq!(store.last_uid("a@voce.it"), 105);
    }

    #[test]
    fn test_mailbox_lifecycle() {
        let store = RecordStore::open_in_memory().unwrap();
        store
            .add_mailbox(&MailboxRecord {
                email_address: "a@voce.it".to_string(),
                password: "secret".to_string(),
                imap_server: "imap.register.it".to_string(),
                imap_port: 993,
                enabled: true,
                last_uid_checked: 0,
            })
            .unwrap();
        assert_eq!(store.mailboxes(true).unwrap().len(), 1);

        store.set_mailbox_enabled("a@voce.it", false).unwrap();
        assert!(store.mailboxes(true).unwrap().is_empty());
        assert_eq!(store.mailboxes(false).unwrap().len(), 1);

        assert!(store.remove_mailbox("a@voce.it").unwrap());
        assert!(store.mailboxes(false).unwrap().is_empty());
    }
}
