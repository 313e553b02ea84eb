use std::fmt;

/// Identity shared by copies of the same logical message delivered to
/// several monitored mailboxes.
///
/// The strong form is the RFC 5322 Message-ID header (angle brackets
/// stripped). When a message carries no Message-ID we fall back to the IMAP
/// UID observed at fetch time; that key is weaker (not stable across a
/// re-fetch) and is only used so the message can still be stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    MessageId(String),
    ImapUid(u32),
}

impl CorrelationKey {
    /// Build a correlation key from a raw Message-ID header value, falling
    /// back to the IMAP UID when the header is missing or empty.
    pub fn resolve(message_id: Option<&str>, uid: u32) -> Self {
        match message_id {
            Some(raw) => {
                let trimmed = raw.trim().trim_matches(|c| c == '<' || c == '>').trim();
                if trimmed.is_empty() {
                    log::warn!("empty Message-ID header, falling back to IMAP UID {}", uid);
                    CorrelationKey::ImapUid(uid)
                } else {
                    CorrelationKey::MessageId(trimmed.to_string())
                }
            }
            None => {
                log::warn!("no Message-ID header, falling back to IMAP UID {}", uid);
                CorrelationKey::ImapUid(uid)
            }
        }
    }

    /// True when this key was derived from the IMAP UID instead of a
    /// Message-ID header.
    pub fn is_degraded(&self) -> bool {
        matches!(self, CorrelationKey::ImapUid(_))
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationKey::MessageId(id) => write!(f, "{}", id),
            CorrelationKey::ImapUid(uid) => write!(f, "imap_{}", uid),
        }
    }
}

/// Per-account-unique identity of a stored message: the mailbox account it
/// arrived on plus the cross-account correlation key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub account: String,
    pub correlation: CorrelationKey,
}

impl MessageKey {
    pub fn new(account: impl Into<String>, correlation: CorrelationKey) -> Self {
        Self {
            account: account.into(),
            correlation,
        }
    }

    /// Primary key used in the record store, rendered as
    /// `account:message-id` (or `account:imap_<uid>` in degraded mode).
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.account, self.correlation)
    }

    /// Parse a storage key back into its parts. The account portion is
    /// everything before the first colon; Message-IDs themselves may
    /// contain colons.
    ///
    /// The rendered form is ambiguous for a Message-ID that itself looks
    /// like `imap_<digits>`: it parses back as a degraded UID key. Real
    /// Message-IDs contain an `@`, so this stays theoretical, and both
    /// forms keep correlating equal keys with themselves.
    pub fn parse(storage_key: &str) -> Option<Self> {
        let (account, rest) = storage_key.split_once(':')?;
        if account.is_empty() || rest.is_empty() {
            return None;
        }
        let correlation = match rest.strip_prefix("imap_") {
            Some(uid) => match uid.parse() {
                Ok(uid) => CorrelationKey::ImapUid(uid),
                // "imap_" prefix but not a number: treat as a message id
                Err(_) => CorrelationKey::MessageId(rest.to_string()),
            },
            None => CorrelationKey::MessageId(rest.to_string()),
        };
        Some(Self::new(account, correlation))
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_strips_angle_brackets() {
        let key = CorrelationKey::resolve(Some("<abc@mail.example.com>"), 42);
        assert_eq!(key, CorrelationKey::MessageId("abc@mail.example.com".to_string()));
        assert!(!key.is_degraded());
    }

    #[test]
    fn test_resolve_trims_whitespace() {
        let key = CorrelationKey::resolve(Some("  <id-1@host> "), 7);
        assert_eq!(key, CorrelationKey::MessageId("id-1@host".to_string()));
    }

    #[test]
    fn test_resolve_falls_back_to_uid() {
        assert_eq!(CorrelationKey::resolve(None, 42), CorrelationKey::ImapUid(42));
        assert_eq!(CorrelationKey::resolve(Some(""), 42), CorrelationKey::ImapUid(42));
        assert_eq!(CorrelationKey::resolve(Some("<>"), 42), CorrelationKey::ImapUid(42));
        assert!(CorrelationKey::resolve(None, 42).is_degraded());
    }

    #[test]
    fn test_storage_key_format() {
        let key = MessageKey::new("posta@voce.it", CorrelationKey::MessageId("abc@x".into()));
        assert_eq!(key.storage_key(), "posta@voce.it:abc@x");

        let weak = MessageKey::new("posta@voce.it", CorrelationKey::ImapUid(264846));
        assert_eq!(weak.storage_key(), "posta@voce.it:imap_264846");
    }

    #[test]
    fn test_parse_round_trip() {
        let strong = MessageKey::new("a@b.it", CorrelationKey::MessageId("id:with:colons@x".into()));
        assert_eq!(MessageKey::parse(&strong.storage_key()), Some(strong));

        let weak = MessageKey::new("a@b.it", CorrelationKey::ImapUid(9));
        assert_eq!(MessageKey::parse(&weak.storage_key()), Some(weak));

        assert_eq!(MessageKey::parse("no-colon"), None);
        assert_eq!(MessageKey::parse(":empty-account"), None);
    }

    #[test]
    fn test_parse_reads_uid_like_message_ids_as_degraded() {
        let odd = MessageKey::new("a@b.it", CorrelationKey::MessageId("imap_123".into()));
        assert_eq!(
            MessageKey::parse(&odd.storage_key()),
            Some(MessageKey::new("a@b.it", CorrelationKey::ImapUid(123)))
        );
    }

    #[test]
    fn test_same_message_two_accounts_share_correlation() {
        let a = MessageKey::new("first@voce.it", CorrelationKey::resolve(Some("<m@x>"), 1));
        let b = MessageKey::new("second@voce.it", CorrelationKey::resolve(Some("<m@x>"), 900));
        assert_ne!(a.storage_key(), b.storage_key());
        assert_eq!(a.correlation, b.correlation);
    }
}
