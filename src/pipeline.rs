use std::sync::Arc;

use thiserror::Error;

use crate::generate::{ArticleGenerator, GenerateError, GenerationMode};
use crate::identity::{CorrelationKey, MessageKey};
use crate::locks::ProcessingLocks;
use crate::mail::MailMessage;
use crate::notify::{Notifier, PublishedNotice};
use crate::publish::{PublishError, Publisher};
use crate::store::{MessageStatus, RecordStore};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("article generation failed: {0}")]
    Generation(#[from] GenerateError),

    #[error("publication failed: {0}")]
    Publication(#[from] PublishError),

    /// A store write hit a record that no longer exists; a reconciliation
    /// ran between materialization and processing. The step is aborted and
    /// the lock released.
    #[error("record vanished during processing: {0}")]
    RecordVanished(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// What a trigger attempt did. Skips are normal operation, not errors.
#[derive(Debug)]
pub enum TriggerOutcome {
    Completed { published: bool },
    /// A run for this correlation key is already executing.
    SkippedInFlight,
    /// The same logical message was already processed, possibly under a
    /// different account.
    SkippedAlreadyProcessed {
        account: String,
        status: MessageStatus,
    },
}

/// Releases the in-flight mark on every exit path, error paths included.
struct LockGuard<'a> {
    locks: &'a ProcessingLocks,
    key: CorrelationKey,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.key);
    }
}

/// Drives messages through generation and publication.
///
/// The record store is passed per call rather than owned: worker threads
/// each open their own database connection. Locks and collaborators are
/// shared across threads.
pub struct Orchestrator {
    locks: Arc<ProcessingLocks>,
    generator: Box<dyn ArticleGenerator>,
    publisher: Box<dyn Publisher>,
    notifier: Notifier,
    monitored_senders: Vec<String>,
    auto_mode: GenerationMode,
}

impl Orchestrator {
    pub fn new(
        locks: Arc<ProcessingLocks>,
        generator: Box<dyn ArticleGenerator>,
        publisher: Box<dyn Publisher>,
        notifier: Notifier,
        monitored_senders: Vec<String>,
        auto_mode: GenerationMode,
    ) -> Self {
        Self {
            locks,
            generator,
            publisher,
            notifier,
            monitored_senders: monitored_senders
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect(),
            auto_mode,
        }
    }

    pub fn locks(&self) -> &Arc<ProcessingLocks> {
        &self.locks
    }

    /// Whether a newly observed message should be processed without user
    /// action.
    pub fn is_monitored_sender(&self, message: &MailMessage) -> bool {
        let address = message.sender_address().to_lowercase();
        self.monitored_senders.iter().any(|s| s == &address)
    }

    /// Auto-trigger entry point for a newly materialized message. Returns
    /// None when the sender is not monitored.
    pub fn handle_new_message(
        &self,
        store: &RecordStore,
        message: &MailMessage,
    ) -> Option<Result<TriggerOutcome, PipelineError>> {
        if !self.is_monitored_sender(message) {
            log::debug!(
                "sender not monitored, no auto processing: {}",
                message.sender_address()
            );
            return None;
        }
        log::info!(
            "monitored sender {}, auto-processing {}",
            message.sender_address(),
            message.key
        );
        Some(self.process(store, &message.key, self.auto_mode, true))
    }

    /// Run the pipeline for one message: generate, persist the article, and
    /// when `auto_publish` is set, publish and notify.
    ///
    /// Dedup order: the in-flight lock first, then the correlation-key store
    /// lookup (processed elsewhere wins). On any failure the status is left
    /// where it was and the lock is released.
    pub fn process(
        &self,
        store: &RecordStore,
        key: &MessageKey,
        mode: GenerationMode,
        auto_publish: bool,
    ) -> Result<TriggerOutcome, PipelineError> {
        if !self.locks.try_acquire(&key.correlation) {
            log::debug!("skipping {}: pipeline already in flight", key);
            return Ok(TriggerOutcome::SkippedInFlight);
        }
        let _guard = LockGuard {
            locks: &self.locks,
            key: key.correlation.clone(),
        };

        if let Some(found) = store.find_processed_by_correlation(&key.correlation)? {
            if found.storage_key != key.storage_key() {
                log::info!(
                    "skipping {}: already {} on {}",
                    key,
                    found.status,
                    found.account
                );
                return Ok(TriggerOutcome::SkippedAlreadyProcessed {
                    account: found.account,
                    status: found.status,
                });
            }
        }

        let storage_key = key.storage_key();
        let record = store
            .message(key)?
            .ok_or_else(|| PipelineError::RecordVanished(storage_key.clone()))?;

        if auto_publish {
            self.locks.queue_auto_publish(&storage_key);
        }

        let article =
            self.generator
                .generate(&record.body, &record.subject, &record.sender, mode)?;
        log::info!("article generated for {}: '{}'", key, article.title);

        if !store.save_article(key, &article)? {
            log::error!("message {} vanished while saving its article", key);
            return Err(PipelineError::RecordVanished(storage_key));
        }

        let mut published = false;
        if self.locks.take_auto_publish(&storage_key) {
            self.publish(store, key)?;
            published = true;
        }
        Ok(TriggerOutcome::Completed { published })
    }

    /// Publish an already generated article and record the transition. The
    /// caller is expected to hold the in-flight lock when running inside a
    /// pipeline; manual re-triggers after a publish failure call this
    /// directly.
    pub fn publish(&self, store: &RecordStore, key: &MessageKey) -> Result<(), PipelineError> {
        let storage_key = key.storage_key();
        let stored = store
            .article(key)?
            .ok_or_else(|| PipelineError::RecordVanished(storage_key.clone()))?;
        let record = store
            .message(key)?
            .ok_or_else(|| PipelineError::RecordVanished(storage_key.clone()))?;

        let result = self.publisher.publish(&stored.article)?;
        if !result.success {
            return Err(PipelineError::Publication(PublishError::Rejected(format!(
                "CMS did not accept '{}' (landed on {})",
                stored.title,
                result.url.as_deref().unwrap_or("-")
            ))));
        }

        let mut photos_uploaded = 0;
        if let Some(article_id) = result.id.as_deref() {
            let attachments = store.attachments_for(&storage_key)?;
            let paths: Vec<&std::path::Path> =
                attachments.iter().map(|a| a.filepath.as_path()).collect();
            if !paths.is_empty() {
                match self.publisher.upload_assets(article_id, &paths) {
                    Ok(count) => photos_uploaded = count,
                    Err(e) => log::error!("asset upload for {} failed: {}", key, e),
                }
            }
        }

        if !store.mark_published(key, result.url.as_deref())? {
            log::error!("message {} vanished while marking it published", key);
            return Err(PipelineError::RecordVanished(storage_key));
        }
        log::info!(
            "published {}: {}",
            key,
            result.url.as_deref().unwrap_or("(no URL reported)")
        );

        self.notifier.notify_published(&PublishedNotice {
            title: stored.title,
            category: stored.article.category.clone(),
            url: result.url,
            article_id: result.id,
            photos_uploaded,
            email_subject: record.subject,
            email_sender: record.sender,
        });
        Ok(())
    }
}
