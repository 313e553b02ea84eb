use std::collections::HashSet;
use std::fs;
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use imap::Session;
use native_tls::{TlsConnector, TlsStream};
use thiserror::Error;

use crate::identity::{CorrelationKey, MessageKey};

#[derive(Error, Debug)]
pub enum MailError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("authentication failed for {account}: {reason}")]
    Auth { account: String, reason: String },

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("not connected")]
    NotConnected,
}

/// Counters reported by the server for the selected mailbox, obtained from
/// SELECT without transferring any message bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct MailboxStatus {
    pub exists: u32,
    pub unseen: u32,
    /// Next UID the server will assign. 0 when the server did not report it.
    pub uid_next: u32,
}

/// An attachment already written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedAttachment {
    pub filename: String,
    pub path: PathBuf,
    pub content_type: String,
}

/// A message fetched from the server, parsed and identified.
#[derive(Debug, Clone)]
pub struct MailMessage {
    pub key: MessageKey,
    pub uid: u32,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub date: DateTime<Local>,
    pub body: String,
    pub attachments: Vec<SavedAttachment>,
}

impl MailMessage {
    /// Bare address portion of the sender, extracted from
    /// `Display Name <user@host>` forms.
    pub fn sender_address(&self) -> String {
        match (self.sender.find('<'), self.sender.find('>')) {
            (Some(start), Some(end)) if start < end => {
                self.sender[start + 1..end].trim().to_string()
            }
            _ => self.sender.trim().to_string(),
        }
    }
}

/// One authenticated connection to one account's INBOX.
///
/// Operations may be retried by the caller after a fresh `connect()`; the
/// session itself never retries.
pub trait MailSession {
    fn status(&mut self) -> Result<MailboxStatus, MailError>;

    /// Full messages whose UID is >= `from_uid`. Servers answer a `N:*`
    /// range with the highest-UID message even when its UID is below N, so
    /// results are filtered to the requested range.
    fn fetch_range(&mut self, from_uid: u32, only_unseen: bool)
        -> Result<Vec<MailMessage>, MailError>;

    /// The most recent `limit` messages regardless of any cursor.
    fn fetch_all(&mut self, limit: usize) -> Result<Vec<MailMessage>, MailError>;

    /// All UIDs currently present on the server, for reconciliation.
    fn uid_set(&mut self) -> Result<HashSet<u32>, MailError>;

    /// Release the session. Idempotent.
    fn disconnect(&mut self);
}

type TlsSession = Session<TlsStream<TcpStream>>;

/// IMAP-over-TLS implementation of `MailSession`, fixed to INBOX.
pub struct ImapMailbox {
    account: String,
    server: String,
    port: u16,
    password: String,
    attachments_dir: PathBuf,
    download_attachments: bool,
    session: Option<TlsSession>,
}

impl ImapMailbox {
    pub fn new(
        account: impl Into<String>,
        server: impl Into<String>,
        port: u16,
        password: impl Into<String>,
        attachments_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            account: account.into(),
            server: server.into(),
            port,
            password: password.into(),
            attachments_dir: attachments_dir.into(),
            download_attachments: true,
            session: None,
        }
    }

    pub fn download_attachments(mut self, enabled: bool) -> Self {
        self.download_attachments = enabled;
        self
    }

    pub fn connect(&mut self) -> Result<(), MailError> {
        log::debug!("connecting to {}:{} as {}", self.server, self.port, self.account);
        let tls = TlsConnector::builder().build()?;
        let client = imap::connect((self.server.as_str(), self.port), &self.server, &tls)
            .map_err(|e| MailError::Connection(e.to_string()))?;
        let session = client
            .login(&self.account, &self.password)
            .map_err(|(e, _)| MailError::Auth {
                account: self.account.clone(),
                reason: e.to_string(),
            })?;
        self.session = Some(session);
        log::info!("connected and authenticated as {}", self.account);
        Ok(())
    }

    fn session(&mut self) -> Result<&mut TlsSession, MailError> {
        if self.session.is_none() {
            self.connect()?;
        }
        self.session.as_mut().ok_or(MailError::NotConnected)
    }

    /// SELECT INBOX and return its counters.
    fn select_inbox(&mut self) -> Result<MailboxStatus, MailError> {
        let session = self.session()?;
        let mailbox = session
            .select("INBOX")
            .map_err(|e| MailError::Connection(e.to_string()))?;
        Ok(MailboxStatus {
            exists: mailbox.exists,
            unseen: mailbox.unseen.unwrap_or(0),
            uid_next: mailbox.uid_next.unwrap_or(0),
        })
    }

    fn parse_fetched(
        &self,
        raw: &[u8],
        uid: u32,
    ) -> Result<MailMessage, MailError> {
        parse_message(
            raw,
            &self.account,
            uid,
            &self.attachments_dir,
            self.download_attachments,
        )
    }

    fn fetch_uids(&mut self, uids: &[u32]) -> Result<Vec<MailMessage>, MailError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let sequence = uids
            .iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let fetches = self
            .session()?
            .uid_fetch(sequence, "(RFC822 UID)")
            .map_err(|e| MailError::Connection(e.to_string()))?;

        let mut messages = Vec::new();
        for fetch in fetches.iter() {
            let uid = match fetch.uid {
                Some(uid) => uid,
                None => continue,
            };
            let raw = match fetch.body() {
                Some(raw) => raw,
                None => continue,
            };
            match self.parse_fetched(raw, uid) {
                Ok(message) => messages.push(message),
                Err(e) => log::error!("failed to parse message UID {}: {}", uid, e),
            }
        }
        Ok(messages)
    }
}

impl MailSession for ImapMailbox {
    fn status(&mut self) -> Result<MailboxStatus, MailError> {
        self.select_inbox()
    }

    fn fetch_range(
        &mut self,
        from_uid: u32,
        only_unseen: bool,
    ) -> Result<Vec<MailMessage>, MailError> {
        self.select_inbox()?;
        let query = if only_unseen {
            format!("UID {}:* UNSEEN", from_uid)
        } else {
            format!("UID {}:*", from_uid)
        };
        let found = self
            .session()?
            .uid_search(&query)
            .map_err(|e| MailError::Connection(e.to_string()))?;

        let mut uids: Vec<u32> = found.into_iter().filter(|&u| u >= from_uid).collect();
        uids.sort_unstable();
        log::debug!("{}: {} messages match UID >= {}", self.account, uids.len(), from_uid);
        self.fetch_uids(&uids)
    }

    fn fetch_all(&mut self, limit: usize) -> Result<Vec<MailMessage>, MailError> {
        let status = self.select_inbox()?;
        if status.exists == 0 {
            return Ok(Vec::new());
        }
        let count = (limit as u32).min(status.exists).max(1);
        let start = status.exists - count + 1;
        let sequence = format!("{}:{}", start, status.exists);

        let fetches = self
            .session()?
            .fetch(sequence, "(RFC822 UID)")
            .map_err(|e| MailError::Connection(e.to_string()))?;

        let mut messages = Vec::new();
        for fetch in fetches.iter() {
            let uid = match fetch.uid {
                Some(uid) => uid,
                None => continue,
            };
            let raw = match fetch.body() {
                Some(raw) => raw,
                None => continue,
            };
            match self.parse_fetched(raw, uid) {
                Ok(message) => messages.push(message),
                Err(e) => log::error!("failed to parse message UID {}: {}", uid, e),
            }
        }
        Ok(messages)
    }

    fn uid_set(&mut self) -> Result<HashSet<u32>, MailError> {
        self.select_inbox()?;
        self.session()?
            .uid_search("ALL")
            .map_err(|e| MailError::Connection(e.to_string()))
    }

    fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.logout() {
                log::debug!("logout for {} failed: {}", self.account, e);
            }
        }
    }
}

impl Drop for ImapMailbox {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Parse a raw RFC822 message into a `MailMessage`, assigning its identity
/// and saving image attachments to disk.
pub fn parse_message(
    raw: &[u8],
    account: &str,
    uid: u32,
    attachments_dir: &Path,
    download_attachments: bool,
) -> Result<MailMessage, MailError> {
    let parsed = mail_parser::Message::parse(raw)
        .ok_or_else(|| MailError::Parse(format!("unparsable message, UID {}", uid)))?;

    let message_id = header_text(&parsed, "Message-ID");
    let correlation = CorrelationKey::resolve(message_id.as_deref(), uid);
    let key = MessageKey::new(account, correlation);

    let subject = parsed.subject().unwrap_or_default().to_string();
    let sender = address_header(parsed.from())
        .or_else(|| header_text(&parsed, "From"))
        .unwrap_or_default();
    let recipient = address_header(parsed.to())
        .or_else(|| header_text(&parsed, "To"))
        .unwrap_or_default();

    let date = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now)
        .with_timezone(&Local);

    // Prefer the plain-text body; fall back to HTML like the original feed
    // (press releases are frequently HTML-only).
    let body = parsed
        .body_text(0)
        .map(|t| t.to_string())
        .or_else(|| parsed.body_html(0).map(|h| h.to_string()))
        .unwrap_or_default();

    let attachments = if download_attachments {
        save_image_attachments(&parsed, attachments_dir)
    } else {
        Vec::new()
    };

    Ok(MailMessage {
        key,
        uid,
        sender,
        recipient,
        subject,
        date,
        body,
        attachments,
    })
}

/// First text value of a named header.
fn header_text(parsed: &mail_parser::Message, name: &str) -> Option<String> {
    for header in parsed.headers() {
        if header.name().eq_ignore_ascii_case(name) {
            if let Some(text) = header.value().as_text_ref() {
                return Some(text.trim().to_string());
            }
        }
    }
    None
}

/// Render an address header as `Name <addr>` (or bare addr), joining lists
/// with commas.
fn address_header(value: &mail_parser::HeaderValue) -> Option<String> {
    fn render(addr: &mail_parser::Addr) -> String {
        let name = addr.name.as_deref().unwrap_or("");
        let address = addr.address.as_deref().unwrap_or("");
        if name.is_empty() {
            address.to_string()
        } else {
            format!("{} <{}>", name, address)
        }
    }

    match value {
        mail_parser::HeaderValue::Address(addr) => Some(render(addr)),
        mail_parser::HeaderValue::AddressList(addrs) => {
            let rendered: Vec<String> = addrs.iter().map(render).collect();
            if rendered.is_empty() {
                None
            } else {
                Some(rendered.join(", "))
            }
        }
        _ => None,
    }
}

/// Decode image attachments and write them under `dir`. Only images are
/// kept, matching the original feed (article cover photos). Failures are
/// logged and skipped.
fn save_image_attachments(parsed: &mail_parser::Message, dir: &Path) -> Vec<SavedAttachment> {
    let mut saved = Vec::new();

    for part in parsed.parts.iter() {
        let mut content_type = String::new();
        let mut filename: Option<String> = None;
        let mut marked_attachment = false;

        for header in &part.headers {
            match &header.value {
                mail_parser::HeaderValue::ContentType(ct) => {
                    content_type = match ct.subtype() {
                        Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                        None => ct.ctype().to_string(),
                    };
                    if filename.is_none() {
                        if let Some(name) = ct.attribute("name") {
                            filename = Some(name.to_string());
                        }
                    }
                }
                mail_parser::HeaderValue::Text(text) => {
                    let header_name = format!("{:?}", header.name).to_lowercase();
                    if header_name.contains("contentdisposition") {
                        let value = text.as_ref();
                        if value.contains("attachment") || value.contains("inline") {
                            marked_attachment = true;
                        }
                        if filename.is_none() {
                            filename = parse_disposition_filename(value);
                        }
                    }
                }
                _ => {}
            }
        }

        if !content_type.starts_with("image/") {
            continue;
        }
        if !marked_attachment && filename.is_none() {
            continue;
        }

        let data = match &part.body {
            mail_parser::PartType::Binary(bytes) => bytes.to_vec(),
            mail_parser::PartType::InlineBinary(bytes) => bytes.to_vec(),
            _ => continue,
        };
        if data.is_empty() {
            continue;
        }

        let filename = filename.unwrap_or_else(|| {
            let extension = content_type.split('/').last().unwrap_or("bin");
            format!("image_{}.{}", Local::now().format("%Y%m%d_%H%M%S"), extension)
        });
        // Drop any path components a hostile sender may have put in the name.
        let filename = filename
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&filename)
            .to_string();

        if let Err(e) = fs::create_dir_all(dir) {
            log::error!("could not create attachments dir {:?}: {}", dir, e);
            continue;
        }
        let path = dir.join(&filename);
        match fs::write(&path, &data) {
            Ok(()) => {
                log::info!("saved attachment {:?} ({} bytes)", path, data.len());
                saved.push(SavedAttachment {
                    filename,
                    path,
                    content_type,
                });
            }
            Err(e) => log::error!("could not save attachment {:?}: {}", path, e),
        }
    }

    saved
}

/// Extract `filename=` (quoted or bare) from a Content-Disposition value.
fn parse_disposition_filename(value: &str) -> Option<String> {
    let start = value.find("filename=")? + "filename=".len();
    let rest = value[start..].trim_start_matches(['"', '\'']);
    let end = rest
        .find(['"', '\'', ';'])
        .unwrap_or(rest.len());
    let name = rest[..end].trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"Message-ID: <press-1@agency.example>\r\n\
From: \"Press Office\" <redazione@esempio.it>\r\n\
To: posta@voce.it\r\n\
Subject: Nuova mostra al museo\r\n\
Date: Mon, 6 Jan 2025 10:00:00 +0100\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Il museo inaugura una nuova mostra.\r\n";

    #[test]
    fn test_parse_message_assigns_identity() {
        let dir = std::env::temp_dir();
        let msg = parse_message(SAMPLE, "posta@voce.it", 101, &dir, false).unwrap();
        assert_eq!(msg.key.storage_key(), "posta@voce.it:press-1@agency.example");
        assert!(!msg.key.correlation.is_degraded());
        assert_eq!(msg.uid, 101);
        assert_eq!(msg.subject, "Nuova mostra al museo");
        assert_eq!(msg.sender, "Press Office <redazione@esempio.it>");
        assert!(msg.body.contains("nuova mostra"));
    }

    #[test]
    fn test_parse_message_without_message_id_degrades() {
        let raw = b"From: a@b.it\r\nSubject: x\r\n\r\nbody\r\n";
        let dir = std::env::temp_dir();
        let msg = parse_message(raw, "posta@voce.it", 7, &dir, false).unwrap();
        assert_eq!(msg.key.storage_key(), "posta@voce.it:imap_7");
        assert!(msg.key.correlation.is_degraded());
    }

    #[test]
    fn test_sender_address_extraction() {
        let dir = std::env::temp_dir();
        let msg = parse_message(SAMPLE, "posta@voce.it", 1, &dir, false).unwrap();
        assert_eq!(msg.sender_address(), "redazione@esempio.it");
    }

    #[test]
    fn test_disposition_filename() {
        assert_eq!(
            parse_disposition_filename("attachment; filename=\"foto.jpg\""),
            Some("foto.jpg".to_string())
        );
        assert_eq!(
            parse_disposition_filename("inline; filename=cover.png; size=100"),
            Some("cover.png".to_string())
        );
        assert_eq!(parse_disposition_filename("attachment"), None);
    }
}
