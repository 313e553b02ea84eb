use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::locks::ProcessingLocks;
use crate::mail::{ImapMailbox, MailMessage, MailSession};
use crate::pipeline::{Orchestrator, PipelineError, TriggerOutcome};
use crate::store::{CursorStore, RecordStore};
use crate::sync::{reconcile_account, SyncEngine, SyncReport};

/// Sweep the lock manager every N passes.
const SWEEP_EVERY_PASSES: u64 = 5;
/// Reconcile local records against the servers every N passes.
const RECONCILE_EVERY_PASSES: u64 = 20;

/// Long-running polling service: a sync worker thread feeds newly observed
/// messages over a channel to the control loop, which hands each one to the
/// orchestrator on its own thread. Every thread opens its own database
/// connection.
pub struct Daemon {
    config: Config,
    orchestrator: Arc<Orchestrator>,
    running: Arc<AtomicBool>,
}

impl Daemon {
    pub fn new(config: Config, orchestrator: Orchestrator) -> Self {
        Self {
            config,
            orchestrator: Arc::new(orchestrator),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Clearing the returned flag stops the poll loop after the current
    /// pass; `run` then returns.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// One sync pass with inline (sequential) pipeline dispatch. Used by
    /// `run --once`.
    pub fn run_once(&self) -> Result<()> {
        let store = RecordStore::open(&self.config.database_path())?;
        let mut engine = SyncEngine::new().only_unseen(self.config.only_unseen);
        let locks = Arc::clone(self.orchestrator.locks());

        let fresh = sync_cycle(&self.config, &store, &mut engine, &locks)?;
        log::info!("sync pass complete, {} new messages", fresh.len());
        for message in fresh {
            self.dispatch_outcome(&store, &message);
        }
        Ok(())
    }

    /// Poll until the shutdown flag is cleared. Blocks the calling thread.
    pub fn run(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel::<MailMessage>();

        let worker = self.start_sync_worker(Arc::clone(&self.running), tx)?;

        // Ends when the worker drops its sender, either on shutdown or
        // because it could not start.
        for message in rx {
            let orchestrator = Arc::clone(&self.orchestrator);
            let db_path = self.config.database_path();
            thread::spawn(move || {
                let store = match RecordStore::open(&db_path) {
                    Ok(store) => store,
                    Err(e) => {
                        log::error!("pipeline thread could not open the database: {}", e);
                        return;
                    }
                };
                if let Some(result) = orchestrator.handle_new_message(&store, &message) {
                    log_outcome(&message, result);
                }
            });
        }

        worker
            .join()
            .map_err(|_| anyhow::anyhow!("sync worker panicked"))?;
        Ok(())
    }

    fn start_sync_worker(
        &self,
        running: Arc<AtomicBool>,
        tx: mpsc::Sender<MailMessage>,
    ) -> Result<thread::JoinHandle<()>> {
        let config = self.config.clone();
        let locks = Arc::clone(self.orchestrator.locks());

        let handle = thread::spawn(move || {
            log::info!(
                "sync worker started, polling every {}s",
                config.poll_interval_secs
            );
            let store = match RecordStore::open(&config.database_path()) {
                Ok(store) => store,
                Err(e) => {
                    log::error!("sync worker could not open the database: {}", e);
                    return;
                }
            };
            let mut engine = SyncEngine::new().only_unseen(config.only_unseen);
            let mut passes: u64 = 0;

            while running.load(Ordering::Relaxed) {
                passes += 1;
                match sync_cycle(&config, &store, &mut engine, &locks) {
                    Ok(fresh) => {
                        for message in fresh {
                            if tx.send(message).is_err() {
                                log::warn!("control loop gone, stopping sync worker");
                                return;
                            }
                        }
                    }
                    Err(e) => log::error!("sync pass failed: {:#}", e),
                }

                if passes % SWEEP_EVERY_PASSES == 0 {
                    locks.sweep();
                }
                if passes % RECONCILE_EVERY_PASSES == 0 {
                    reconcile_all(&config, &store);
                }

                // Sleep in short slices so shutdown is prompt.
                let mut remaining = config.poll_interval_secs;
                while remaining > 0 && running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_secs(1));
                    remaining -= 1;
                }
            }
            log::info!("sync worker stopped");
        });
        Ok(handle)
    }

    fn dispatch_outcome(&self, store: &RecordStore, message: &MailMessage) {
        if let Some(result) = self.orchestrator.handle_new_message(store, message) {
            log_outcome(message, result);
        }
    }
}

/// One full pass: sync every enabled mailbox, persist the new records, then
/// write the cursors, then return the messages for dispatch. The order is
/// load-bearing: a crash after persisting but before the cursor write only
/// causes a re-delivery that the store's upsert absorbs.
fn sync_cycle(
    config: &Config,
    store: &RecordStore,
    engine: &mut SyncEngine,
    locks: &ProcessingLocks,
) -> Result<Vec<MailMessage>> {
    let mut sessions = open_sessions(config, store)?;
    if sessions.is_empty() {
        log::debug!("no enabled mailboxes, nothing to sync");
        return Ok(Vec::new());
    }

    let report = engine.run_pass(&mut sessions, store);
    Ok(persist_and_advance(store, engine, locks, report))
}

/// Persist the fetched records, then write the cursors. A message whose
/// upsert failed is forgotten by the engine and caps its account's cursor
/// just below its UID, so the next pass fetches it again instead of marking
/// it seen unrecorded.
fn persist_and_advance(
    store: &RecordStore,
    engine: &mut SyncEngine,
    locks: &ProcessingLocks,
    report: SyncReport,
) -> Vec<MailMessage> {
    let mut fresh = Vec::new();
    let mut first_failed: HashMap<String, u32> = HashMap::new();
    for message in report.new_messages {
        match store.upsert_message(&message) {
            Ok(true) => {
                locks.note_materialized(&message.key.storage_key(), &message.key.correlation);
                fresh.push(message);
            }
            Ok(false) => {
                // Known from a previous run; re-delivery, not news.
            }
            Err(e) => {
                log::error!("could not persist {}: {}", message.key, e);
                engine.forget(&message.key.storage_key());
                let entry = first_failed
                    .entry(message.key.account.clone())
                    .or_insert(message.uid);
                *entry = (*entry).min(message.uid);
            }
        }
    }

    for (account, uid) in report.cursor_updates {
        let uid = match first_failed.get(&account) {
            Some(&failed) if failed <= uid => failed - 1,
            _ => uid,
        };
        if let Err(e) = store.set_last_uid(&account, uid) {
            log::error!("could not persist cursor {} for {}: {}", uid, account, e);
        }
    }
    fresh
}

/// One connected session per enabled mailbox.
pub fn open_sessions(
    config: &Config,
    store: &RecordStore,
) -> Result<Vec<(String, Box<dyn MailSession>)>> {
    let mailboxes = store
        .mailboxes(true)
        .context("could not list enabled mailboxes")?;
    let mut sessions: Vec<(String, Box<dyn MailSession>)> = Vec::with_capacity(mailboxes.len());
    for mailbox in mailboxes {
        let session = ImapMailbox::new(
            &mailbox.email_address,
            &mailbox.imap_server,
            mailbox.imap_port,
            &mailbox.password,
            config.attachments_dir(),
        );
        sessions.push((mailbox.email_address, Box::new(session)));
    }
    Ok(sessions)
}

/// Server-is-truth cleanup across every enabled mailbox. Account failures
/// are logged and skipped.
pub fn reconcile_all(config: &Config, store: &RecordStore) {
    let mailboxes = match store.mailboxes(true) {
        Ok(mailboxes) => mailboxes,
        Err(e) => {
            log::error!("could not list mailboxes for reconciliation: {}", e);
            return;
        }
    };
    for mailbox in mailboxes {
        let mut session = ImapMailbox::new(
            &mailbox.email_address,
            &mailbox.imap_server,
            mailbox.imap_port,
            &mailbox.password,
            config.attachments_dir(),
        );
        match reconcile_account(store, &mailbox.email_address, &mut session) {
            Ok(0) => {}
            Ok(deleted) => log::info!(
                "reconciliation removed {} records for {}",
                deleted,
                mailbox.email_address
            ),
            Err(e) => log::error!("reconciliation failed for {}: {:#}", mailbox.email_address, e),
        }
    }
}

fn log_outcome(message: &MailMessage, result: Result<TriggerOutcome, PipelineError>) {
    match result {
        Ok(TriggerOutcome::Completed { published }) => {
            log::info!(
                "pipeline completed for {} (published: {})",
                message.key,
                published
            );
        }
        Ok(TriggerOutcome::SkippedInFlight) => {
            log::debug!("pipeline already running for {}", message.key);
        }
        Ok(TriggerOutcome::SkippedAlreadyProcessed { account, status }) => {
            log::info!(
                "{} already {} on {}, skipped",
                message.key,
                status,
                account
            );
        }
        Err(e) => log::error!("pipeline failed for {}: {}", message.key, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::{GenerationMode, LlmGenerator, LlmProvider};
    use crate::identity::{CorrelationKey, MessageKey};
    use crate::notify::{NotificationsConfig, Notifier};
    use crate::publish::CmsClient;
    use crate::store::MailboxRecord;
    use chrono::Local;

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

    fn mailbox(store: &RecordStore, account: &str, cursor: u32) {
        store
            .add_mailbox(&MailboxRecord {
                email_address: account.to_string(),
                password: "secret".to_string(),
                imap_server: "imap.register.it".to_string(),
                imap_port: 993,
                enabled: true,
                last_uid_checked: 0,
            })
            .unwrap();
        store.set_last_uid(account, cursor).unwrap();
    }

    #[test]
    fn test_cursor_advances_after_successful_persist() {
        let store = RecordStore::open_in_memory().unwrap();
        mailbox(&store, "a@voce.it", 100);
        let locks = ProcessingLocks::new();
        let mut engine = SyncEngine::new();

        let mut report = SyncReport::default();
        report.new_messages.push(message("a@voce.it", "<m1@x>", 105));
        report.cursor_updates.push(("a@voce.it".to_string(), 105));

        let fresh = persist_and_advance(&store, &mut engine, &locks, report);
        assert_eq!(fresh.len(), 1);
        assert_eq!(store.last_uid("a@voce.it"), 105);
    }

    #[test]
    fn test_failed_persist_holds_cursor_below_the_lost_message() {
        let store = RecordStore::open_in_memory().unwrap();
        mailbox(&store, "a@voce.it", 100);
        let locks = ProcessingLocks::new();
        let mut engine = SyncEngine::new();

        let mut report = SyncReport::default();
        report.new_messages.push(message("a@voce.it", "<m1@x>", 105));
        report.new_messages.push(message("a@voce.it", "<m2@x>", 110));
        report.cursor_updates.push(("a@voce.it".to_string(), 110));

        // Every upsert now fails.
        store.run_sql("DROP TABLE messages").unwrap();
        let fresh = persist_and_advance(&store, &mut engine, &locks, report);

        assert!(fresh.is_empty());
        // Held just below the first failed UID so the next fetch returns it.
        assert_eq!(store.last_uid("a@voce.it"), 104);
    }

    #[test]
    fn test_failed_persist_does_not_hold_back_other_accounts() {
        let store = RecordStore::open_in_memory().unwrap();
        mailbox(&store, "a@voce.it", 100);
        mailbox(&store, "b@voce.it", 200);
        let locks = ProcessingLocks::new();
        let mut engine = SyncEngine::new();

        let mut report = SyncReport::default();
        report.new_messages.push(message("a@voce.it", "<m1@x>", 105));
        report.cursor_updates.push(("a@voce.it".to_string(), 105));
        report.cursor_updates.push(("b@voce.it".to_string(), 210));

        store.run_sql("DROP TABLE messages").unwrap();
        persist_and_advance(&store, &mut engine, &locks, report);

        assert_eq!(store.last_uid("a@voce.it"), 104);
        assert_eq!(store.last_uid("b@voce.it"), 210);
    }

    #[test]
    fn test_shutdown_handle_stops_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.database_path = dir.path().join("n.db").to_string_lossy().into_owned();
        config.attachments_dir = dir.path().join("att").to_string_lossy().into_owned();
        config.poll_interval_secs = 1;

        let orchestrator = Orchestrator::new(
            Arc::new(ProcessingLocks::new()),
            Box::new(LlmGenerator::new(LlmProvider::Ollama, None, None, None)),
            Box::new(CmsClient::new("http://localhost", "user", "pw")),
            Notifier::new(NotificationsConfig::default()),
            Vec::new(),
            GenerationMode::Full,
        );
        let daemon = Daemon::new(config, orchestrator);
        let shutdown = daemon.shutdown_handle();

        let handle = thread::spawn(move || daemon.run());
        thread::sleep(Duration::from_millis(200));
        shutdown.store(false, Ordering::Relaxed);
        handle.join().unwrap().unwrap();
    }
}
