use std::collections::HashSet;

use crate::mail::{MailError, MailMessage, MailSession};
use crate::store::{CursorStore, RecordStore};

/// Outcome of one multi-account sync pass.
///
/// Cursor updates are returned rather than applied: the caller must persist
/// the new message records first and only then write the cursors, so a crash
/// in between re-delivers messages instead of losing them.
#[derive(Default)]
pub struct SyncReport {
    pub new_messages: Vec<MailMessage>,
    pub cursor_updates: Vec<(String, u32)>,
    pub issues: Vec<AccountIssue>,
}

/// A per-account failure. The pass continues for the other accounts.
pub struct AccountIssue {
    pub account: String,
    /// Authentication failures mean the mailbox should be shown as offline
    /// and not retried faster than the regular poll.
    pub offline: bool,
    pub error: MailError,
}

/// Incremental UID-based synchronization over any number of accounts.
///
/// Per account and pass: read the stored watermark, skip the fetch entirely
/// when the server's UIDNEXT shows nothing new, otherwise fetch everything
/// above the watermark and report the highest UID seen as the new cursor.
/// A set of storage keys already materialized during this process's lifetime
/// filters re-deliveries before they reach the caller.
pub struct SyncEngine {
    only_unseen: bool,
    seen: HashSet<String>,
}

impl SyncEngine {
    pub fn new() -> Self {
        Self {
            only_unseen: false,
            seen: HashSet::new(),
        }
    }

    pub fn only_unseen(mut self, enabled: bool) -> Self {
        self.only_unseen = enabled;
        self
    }

    /// Drop a storage key from the session seen-set so a later pass can
    /// deliver the message again. Called when persisting it failed.
    pub fn forget(&mut self, storage_key: &str) {
        self.seen.remove(storage_key);
    }

    /// Sync every account once. Account failures are collected, never
    /// propagated.
    pub fn run_pass(
        &mut self,
        sessions: &mut [(String, Box<dyn MailSession>)],
        cursors: &dyn CursorStore,
    ) -> SyncReport {
        let mut report = SyncReport::default();
        for (account, session) in sessions.iter_mut() {
            if let Err(error) = self.sync_account(account, session.as_mut(), cursors, &mut report)
            {
                let offline = matches!(error, MailError::Auth { .. });
                if offline {
                    log::warn!("mailbox offline (authentication failed): {}", account);
                } else {
                    log::error!("sync failed for {}: {}", account, error);
                }
                report.issues.push(AccountIssue {
                    account: account.clone(),
                    offline,
                    error,
                });
            }
        }
        report
    }

    pub fn sync_account(
        &mut self,
        account: &str,
        session: &mut dyn MailSession,
        cursors: &dyn CursorStore,
        report: &mut SyncReport,
    ) -> Result<(), MailError> {
        let watermark = cursors.last_uid(account);
        let status = session.status()?;

        // UIDNEXT is the UID the next message will get, so the newest
        // existing message has UIDNEXT-1. At or past it, nothing to fetch.
        if watermark > 0 && status.uid_next > 0 && watermark >= status.uid_next - 1 {
            log::debug!(
                "{}: up to date (cursor {}, uidnext {})",
                account,
                watermark,
                status.uid_next
            );
            return Ok(());
        }

        let from_uid = watermark.saturating_add(1);
        let fetched = session.fetch_range(from_uid, self.only_unseen)?;
        log::info!("{}: fetched {} messages above UID {}", account, fetched.len(), watermark);

        let mut max_uid = watermark;
        let mut fresh = 0;
        for message in fetched {
            max_uid = max_uid.max(message.uid);
            let storage_key = message.key.storage_key();
            if !self.seen.insert(storage_key.clone()) {
                log::debug!("{}: already materialized this session: {}", account, storage_key);
                continue;
            }
            fresh += 1;
            report.new_messages.push(message);
        }

        if max_uid > watermark {
            report.cursor_updates.push((account.to_string(), max_uid));
        } else if status.uid_next > 0 && status.uid_next - 1 > watermark {
            // Nothing came back for a gap the server says is populated
            // (expunged messages, UNSEEN filter). Move the cursor anyway so
            // the next pass does not rescan the same exhausted range.
            report
                .cursor_updates
                .push((account.to_string(), status.uid_next - 1));
        }

        if fresh > 0 {
            log::info!("{}: {} new messages", account, fresh);
        }
        Ok(())
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Delete local records whose backing message no longer exists on the
/// server. Returns how many were removed.
pub fn reconcile_account(
    store: &RecordStore,
    account: &str,
    session: &mut dyn MailSession,
) -> anyhow::Result<usize> {
    let live_uids = session.uid_set()?;
    let live_keys: HashSet<String> = store
        .messages_for_account(account)?
        .into_iter()
        .filter(|(_, uid)| live_uids.contains(uid))
        .map(|(key, _)| key)
        .collect();
    store.reconcile(account, &live_keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{CorrelationKey, MessageKey};
    use crate::mail::MailboxStatus;
    use chrono::Local;
    use std::sync::Mutex;

    struct MockSession {
        status: MailboxStatus,
        messages: Vec<MailMessage>,
        fetch_calls: usize,
        fail_auth: bool,
    }

    impl MockSession {
        fn new(uid_next: u32, messages: Vec<MailMessage>) -> Self {
            Self {
                status: MailboxStatus {
                    exists: messages.len() as u32,
                    unseen: 0,
                    uid_next,
                },
                messages,
                fetch_calls: 0,
                fail_auth: false,
            }
        }
    }

    impl MailSession for MockSession {
        fn status(&mut self) -> Result<MailboxStatus, MailError> {
            if self.fail_auth {
                return Err(MailError::Auth {
                    account: "broken@voce.it".to_string(),
                    reason: "bad password".to_string(),
                });
            }
            Ok(self.status)
        }

        fn fetch_range(
            &mut self,
            from_uid: u32,
            _only_unseen: bool,
        ) -> Result<Vec<MailMessage>, MailError> {
            self.fetch_calls += 1;
            Ok(self
                .messages
                .iter()
                .filter(|m| m.uid >= from_uid)
                .cloned()
                .collect())
        }

        fn fetch_all(&mut self, limit: usize) -> Result<Vec<MailMessage>, MailError> {
            Ok(self.messages.iter().rev().take(limit).cloned().collect())
        }

        fn uid_set(&mut self) -> Result<HashSet<u32>, MailError> {
            Ok(self.messages.iter().map(|m| m.uid).collect())
        }

        fn disconnect(&mut self) {}
    }

    #[derive(Default)]
    struct MemoryCursors {
        cursors: Mutex<std::collections::HashMap<String, u32>>,
    }

    impl MemoryCursors {
        fn with(account: &str, uid: u32) -> Self {
            let cursors = MemoryCursors::default();
            cursors.set_last_uid(account, uid).unwrap();
            cursors
        }
    }

    impl CursorStore for MemoryCursors {
        fn last_uid(&self, account: &str) -> u32 {
            *self.cursors.lock().unwrap().get(account).unwrap_or(&0)
        }

        fn set_last_uid(&self, account: &str, uid: u32) -> anyhow::Result<()> {
            self.cursors.lock().unwrap().insert(account.to_string(), uid);
            Ok(())
        }
    }

    fn message(account: &str, message_id: &str, uid: u32) -> MailMessage {
        MailMessage {
            key: MessageKey::new(account, CorrelationKey::resolve(Some(message_id), uid)),
            uid,
            sender: "Ufficio Stampa <stampa@comune.carpi.mo.it>".to_string(),
            recipient: account.to_string(),
            subject: "comunicato".to_string(),
            date: Local::now(),
            body: "testo".to_string(),
            attachments: Vec::new(),
        }
    }

    #[test]
    fn test_fast_path_skips_fetch_when_nothing_new() {
        let mut engine = SyncEngine::new();
        let cursors = MemoryCursors::with("a@voce.it", 105);
        let mut session = MockSession::new(106, vec![message("a@voce.it", "<old@x>", 105)]);

        let mut report = SyncReport::default();
        engine
            .sync_account("a@voce.it", &mut session, &cursors, &mut report)
            .unwrap();

        assert_eq!(session.fetch_calls, 0);
        assert!(report.new_messages.is_empty());
        assert!(report.cursor_updates.is_empty());
    }

    #[test]
    fn test_new_messages_advance_cursor_to_max_uid() {
        let mut engine = SyncEngine::new();
        let cursors = MemoryCursors::with("a@voce.it", 100);
        let mut session = MockSession::new(111, vec![
            message("a@voce.it", "<m1@x>", 103),
            message("a@voce.it", "<m2@x>", 110),
        ]);

        let mut report = SyncReport::default();
        engine
            .sync_account("a@voce.it", &mut session, &cursors, &mut report)
            .unwrap();

        assert_eq!(report.new_messages.len(), 2);
        assert_eq!(report.cursor_updates, vec![("a@voce.it".to_string(), 110)]);
    }

    #[test]
    fn test_empty_fetch_advances_cursor_past_exhausted_gap() {
        let mut engine = SyncEngine::new();
        let cursors = MemoryCursors::with("a@voce.it", 100);
        // Server says messages exist up to UID 119 but none match the fetch
        // (expunged or already seen).
        let mut session = MockSession::new(120, Vec::new());

        let mut report = SyncReport::default();
        engine
            .sync_account("a@voce.it", &mut session, &cursors, &mut report)
            .unwrap();

        assert!(report.new_messages.is_empty());
        assert_eq!(report.cursor_updates, vec![("a@voce.it".to_string(), 119)]);
    }

    #[test]
    fn test_cold_start_fetches_from_uid_one() {
        let mut engine = SyncEngine::new();
        let cursors = MemoryCursors::default();
        let mut session = MockSession::new(3, vec![
            message("a@voce.it", "<m1@x>", 1),
            message("a@voce.it", "<m2@x>", 2),
        ]);

        let mut report = SyncReport::default();
        engine
            .sync_account("a@voce.it", &mut session, &cursors, &mut report)
            .unwrap();

        assert_eq!(report.new_messages.len(), 2);
        assert_eq!(report.cursor_updates, vec![("a@voce.it".to_string(), 2)]);
    }

    #[test]
    fn test_redelivery_within_session_is_filtered_silently() {
        let mut engine = SyncEngine::new();
        let cursors = MemoryCursors::default();
        let mut session = MockSession::new(2, vec![message("a@voce.it", "<m1@x>", 1)]);

        let mut report = SyncReport::default();
        engine
            .sync_account("a@voce.it", &mut session, &cursors, &mut report)
            .unwrap();
        assert_eq!(report.new_messages.len(), 1);

        // Cursor was never persisted (simulating a crash before the write):
        // the next pass re-fetches, but the session seen-set filters it.
        let mut report = SyncReport::default();
        engine
            .sync_account("a@voce.it", &mut session, &cursors, &mut report)
            .unwrap();
        assert!(report.new_messages.is_empty());
        // The cursor still advances so the gap is not rescanned forever.
        assert_eq!(report.cursor_updates, vec![("a@voce.it".to_string(), 1)]);
    }

    #[test]
    fn test_forget_allows_redelivery_on_the_next_pass() {
        let mut engine = SyncEngine::new();
        let cursors = MemoryCursors::default();
        let mut session = MockSession::new(2, vec![message("a@voce.it", "<m1@x>", 1)]);

        let mut report = SyncReport::default();
        engine
            .sync_account("a@voce.it", &mut session, &cursors, &mut report)
            .unwrap();
        assert_eq!(report.new_messages.len(), 1);

        // The caller could not persist the message and forgets it; with the
        // cursor also held back, the next pass delivers it again.
        engine.forget(&report.new_messages[0].key.storage_key());
        let mut report = SyncReport::default();
        engine
            .sync_account("a@voce.it", &mut session, &cursors, &mut report)
            .unwrap();
        assert_eq!(report.new_messages.len(), 1);
    }

    #[test]
    fn test_account_failure_does_not_abort_the_pass() {
        let mut engine = SyncEngine::new();
        let cursors = MemoryCursors::default();

        let mut broken = MockSession::new(1, Vec::new());
        broken.fail_auth = true;
        let healthy = MockSession::new(2, vec![message("b@voce.it", "<m1@x>", 1)]);

        let mut sessions: Vec<(String, Box<dyn MailSession>)> = vec![
            ("broken@voce.it".to_string(), Box::new(broken)),
            ("b@voce.it".to_string(), Box::new(healthy)),
        ];
        let report = engine.run_pass(&mut sessions, &cursors);

        assert_eq!(report.new_messages.len(), 1);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].account, "broken@voce.it");
        assert!(report.issues[0].offline);
    }
}
