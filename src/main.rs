use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use newsdesk::config::{default_config_path, AutoMode, Config};
use newsdesk::credentials::Secrets;
use newsdesk::daemon::{reconcile_all, Daemon};
use newsdesk::generate::{GenerationMode, LlmGenerator, LlmProvider};
use newsdesk::identity::MessageKey;
use newsdesk::locks::ProcessingLocks;
use newsdesk::mail::{ImapMailbox, MailSession};
use newsdesk::notify::Notifier;
use newsdesk::pipeline::{Orchestrator, TriggerOutcome};
use newsdesk::publish::CmsClient;
use newsdesk::store::{MailboxRecord, MessageStatus, RecordStore};
use newsdesk::sync::reconcile_account;

/// Turns incoming press-release mail into published CMS articles
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to config file
    #[clap(short, long, default_value_t = default_config_path())]
    config: String,

    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Poll the configured mailboxes and process new messages
    Run {
        /// Do a single sync pass instead of polling forever
        #[clap(long)]
        once: bool,
    },

    /// Add or update a monitored mailbox
    AddMailbox {
        /// Email address (also the IMAP username)
        #[clap(short, long)]
        email: String,

        /// IMAP password; falls back to the keyring, then NEWSDESK_IMAP_PASSWORD
        #[clap(short, long)]
        password: Option<String>,

        /// IMAP server address
        #[clap(long)]
        server: Option<String>,

        /// IMAP server port
        #[clap(long)]
        port: Option<u16>,

        /// Add the mailbox without enabling it
        #[clap(long)]
        disabled: bool,
    },

    /// List monitored mailboxes
    ListMailboxes,

    /// Remove a mailbox (its stored messages are kept)
    RemoveMailbox {
        email: String,
    },

    /// Enable or disable a mailbox without removing it
    SetMailboxEnabled {
        email: String,
        #[clap(value_parser = clap::value_parser!(bool))]
        enabled: bool,
    },

    /// List recently stored messages
    ListMessages {
        /// Show at most this many
        #[clap(short, long, default_value = "20")]
        limit: usize,

        /// Filter by status (NEW, GENERATED, PUBLISHED)
        #[clap(short, long)]
        status: Option<String>,

        /// Peek at this mailbox on the server instead of the local store
        #[clap(long, conflicts_with = "status")]
        remote: Option<String>,
    },

    /// Run the pipeline for one stored message
    Process {
        /// Storage key, as printed by list-messages
        storage_key: String,

        /// Publish after generating
        #[clap(long)]
        publish: bool,

        /// Lay out the existing text instead of rewriting it
        #[clap(long)]
        format_only: bool,
    },

    /// Publish an already generated article without regenerating it
    Publish {
        /// Storage key of a message in the GENERATED state
        storage_key: String,
    },

    /// Delete local records no longer present on the mail servers
    Reconcile {
        /// Only reconcile this mailbox
        #[clap(short, long)]
        account: Option<String>,
    },

    /// Remove records duplicated across subject, date and sender
    Dedupe,

    /// Show message and article counters
    Stats,

    /// Send a test notification
    NotifyTest {
        /// "email", "telegram" or "all"
        #[clap(default_value = "all")]
        channel: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let config_path = shellexpand::tilde(&args.config).into_owned();
    let config = Config::load(&config_path)
        .with_context(|| format!("could not load config from {}", config_path))?;
    let secrets = Secrets::new();

    match args.command {
        Commands::Run { once } => {
            let daemon = Daemon::new(config.clone(), build_orchestrator(&config, &secrets)?);
            if once {
                daemon.run_once()
            } else {
                daemon.run()
            }
        }

        Commands::AddMailbox {
            email,
            password,
            server,
            port,
            disabled,
        } => {
            let password = match password {
                Some(given) => {
                    if let Err(e) = secrets.store("imap", &email, &given) {
                        log::debug!("could not save the password to the keyring: {}", e);
                    }
                    given
                }
                None => secrets
                    .resolve("", "imap", &email, "NEWSDESK_IMAP_PASSWORD")
                    .context("no password given and none found in keyring or environment")?,
            };
            let store = RecordStore::open(&config.database_path())?;
            store.add_mailbox(&MailboxRecord {
                email_address: email.clone(),
                password,
                imap_server: server.unwrap_or_else(|| config.default_imap_server.clone()),
                imap_port: port.unwrap_or(config.default_imap_port),
                enabled: !disabled,
                last_uid_checked: 0,
            })?;
            println!("Mailbox {} saved.", email);
            Ok(())
        }

        Commands::ListMailboxes => {
            let store = RecordStore::open(&config.database_path())?;
            let mailboxes = store.mailboxes(false)?;
            if mailboxes.is_empty() {
                println!("No mailboxes configured.");
                return Ok(());
            }
            for mailbox in mailboxes {
                println!(
                    "{} {}:{} (cursor {}){}",
                    mailbox.email_address,
                    mailbox.imap_server,
                    mailbox.imap_port,
                    mailbox.last_uid_checked,
                    if mailbox.enabled { "" } else { " [disabled]" },
                );
            }
            Ok(())
        }

        Commands::RemoveMailbox { email } => {
            let store = RecordStore::open(&config.database_path())?;
            if store.remove_mailbox(&email)? {
                if let Err(e) = secrets.delete("imap", &email) {
                    log::debug!("could not remove the keyring entry: {}", e);
                }
                println!("Mailbox {} removed.", email);
            } else {
                println!("No mailbox named {}.", email);
            }
            Ok(())
        }

        Commands::SetMailboxEnabled { email, enabled } => {
            let store = RecordStore::open(&config.database_path())?;
            if store.set_mailbox_enabled(&email, enabled)? {
                println!(
                    "Mailbox {} {}.",
                    email,
                    if enabled { "enabled" } else { "disabled" }
                );
            } else {
                println!("No mailbox named {}.", email);
            }
            Ok(())
        }

        Commands::ListMessages {
            limit,
            status,
            remote,
        } => {
            if let Some(email) = remote {
                return list_remote_messages(&config, &email, limit);
            }
            let status = status
                .map(|s| s.to_uppercase().parse::<MessageStatus>())
                .transpose()?;
            let store = RecordStore::open(&config.database_path())?;
            for record in store.recent_messages(limit, status)? {
                println!(
                    "[{}] {}  {}  {}",
                    record.status,
                    record.date.format("%Y-%m-%d %H:%M"),
                    record.key.storage_key(),
                    record.subject,
                );
            }
            Ok(())
        }

        Commands::Process {
            storage_key,
            publish,
            format_only,
        } => {
            let key = MessageKey::parse(&storage_key)
                .with_context(|| format!("malformed storage key: {}", storage_key))?;
            let mode = if format_only {
                GenerationMode::FormatOnly
            } else {
                GenerationMode::Full
            };
            let store = RecordStore::open(&config.database_path())?;
            let orchestrator = build_orchestrator(&config, &secrets)?;

            match orchestrator.process(&store, &key, mode, publish)? {
                TriggerOutcome::Completed { published } => {
                    println!(
                        "Done: article generated{}.",
                        if published { " and published" } else { "" }
                    );
                }
                TriggerOutcome::SkippedInFlight => {
                    println!("Skipped: a run for this message is already executing.");
                }
                TriggerOutcome::SkippedAlreadyProcessed { account, status } => {
                    println!("Skipped: already {} on {}.", status, account);
                }
            }
            Ok(())
        }

        Commands::Publish { storage_key } => {
            let key = MessageKey::parse(&storage_key)
                .with_context(|| format!("malformed storage key: {}", storage_key))?;
            let store = RecordStore::open(&config.database_path())?;
            let orchestrator = build_orchestrator(&config, &secrets)?;
            orchestrator.publish(&store, &key)?;
            println!("Article published.");
            Ok(())
        }

        Commands::Reconcile { account } => {
            let store = RecordStore::open(&config.database_path())?;
            match account {
                Some(email) => {
                    let mailbox = store
                        .mailboxes(false)?
                        .into_iter()
                        .find(|m| m.email_address == email)
                        .with_context(|| format!("no mailbox named {}", email))?;
                    let mut session = ImapMailbox::new(
                        &mailbox.email_address,
                        &mailbox.imap_server,
                        mailbox.imap_port,
                        &mailbox.password,
                        config.attachments_dir(),
                    );
                    let removed = reconcile_account(&store, &email, &mut session)?;
                    println!("Removed {} records for {}.", removed, email);
                }
                None => {
                    reconcile_all(&config, &store);
                    println!("Reconciliation complete.");
                }
            }
            Ok(())
        }

        Commands::Dedupe => {
            let store = RecordStore::open(&config.database_path())?;
            let removed = store.remove_duplicates()?;
            println!("Removed {} duplicate records.", removed);
            Ok(())
        }

        Commands::Stats => {
            let store = RecordStore::open(&config.database_path())?;
            let stats = store.stats()?;
            println!("Messages:           {}", stats.total_messages);
            println!("  NEW:              {}", stats.new_messages);
            println!("  GENERATED:        {}", stats.generated);
            println!("  PUBLISHED:        {}", stats.published);
            println!("Published articles: {}", stats.published_articles);
            println!("Attachments:        {}", stats.attachments);
            Ok(())
        }

        Commands::NotifyTest { channel } => {
            let notifier = Notifier::new(config.notifications.clone());
            match channel.as_str() {
                "email" => {
                    notifier.send_test_email()?;
                    println!("Test email sent.");
                }
                "telegram" => {
                    let sent = notifier.send_test_telegram()?;
                    println!("Test message sent to {} Telegram chats.", sent);
                }
                _ => {
                    match notifier.send_test_email() {
                        Ok(()) => println!("Test email sent."),
                        Err(e) => println!("Email test failed: {}", e),
                    }
                    match notifier.send_test_telegram() {
                        Ok(sent) => println!("Test message sent to {} Telegram chats.", sent),
                        Err(e) => println!("Telegram test failed: {}", e),
                    }
                }
            }
            Ok(())
        }
    }
}

/// Fetch the newest messages straight from the server, bypassing the local
/// store and the sync cursor.
fn list_remote_messages(config: &Config, email: &str, limit: usize) -> Result<()> {
    let store = RecordStore::open(&config.database_path())?;
    let mailbox = store
        .mailboxes(false)?
        .into_iter()
        .find(|m| m.email_address == email)
        .with_context(|| format!("no mailbox named {}", email))?;

    let mut session = ImapMailbox::new(
        &mailbox.email_address,
        &mailbox.imap_server,
        mailbox.imap_port,
        &mailbox.password,
        config.attachments_dir(),
    )
    .download_attachments(false);
    for message in session.fetch_all(limit)? {
        println!(
            "[UID {}] {}  {}  {}",
            message.uid,
            message.date.format("%Y-%m-%d %H:%M"),
            message.sender,
            message.subject,
        );
    }
    Ok(())
}

fn build_orchestrator(config: &Config, secrets: &Secrets) -> Result<Orchestrator> {
    let provider: LlmProvider = config.generator.provider.parse()?;
    let generator = LlmGenerator::new(
        provider,
        secrets.resolve(
            &config.generator.api_key,
            "llm",
            &config.generator.provider,
            provider.api_key_env(),
        ),
        (!config.generator.model.is_empty()).then(|| config.generator.model.clone()),
        (!config.generator.ollama_url.is_empty()).then(|| config.generator.ollama_url.clone()),
    );

    let cms_password = secrets
        .resolve(&config.cms.password, "cms", &config.cms.username, "CMS_PASSWORD")
        .unwrap_or_default();
    let publisher = CmsClient::new(&config.cms.base_url, &config.cms.username, &cms_password);

    let auto_mode = match config.auto_mode {
        AutoMode::Llm => GenerationMode::Full,
        AutoMode::FormatOnly => GenerationMode::FormatOnly,
    };

    Ok(Orchestrator::new(
        std::sync::Arc::new(ProcessingLocks::new()),
        Box::new(generator),
        Box::new(publisher),
        Notifier::new(config.notifications.clone()),
        config.monitored_senders.clone(),
        auto_mode,
    ))
}
