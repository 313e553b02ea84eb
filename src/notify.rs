use std::time::Duration;

use chrono::Local;
use lettre::message::{MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Message, SmtpTransport, Transport};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Outbound notification settings, embedded in the main config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub email: EmailNotifyConfig,
    #[serde(default)]
    pub telegram: TelegramNotifyConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailNotifyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub smtp_server: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_username: String,
    #[serde(default)]
    pub smtp_password: String,
    #[serde(default)]
    pub from_email: String,
    #[serde(default)]
    pub to_emails: Vec<String>,
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramNotifyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_ids: Vec<String>,
}

/// What gets announced after a successful publication.
#[derive(Debug, Clone, Default)]
pub struct PublishedNotice {
    pub title: String,
    pub category: String,
    pub url: Option<String>,
    pub article_id: Option<String>,
    pub photos_uploaded: usize,
    pub email_subject: String,
    pub email_sender: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyOutcome {
    pub email_sent: bool,
    pub telegram_sent: bool,
}

/// Sends publication notices over SMTP and the Telegram bot API. Delivery
/// failures are logged and reflected in the outcome; they never fail the
/// pipeline that triggered them.
pub struct Notifier {
    config: NotificationsConfig,
    http: reqwest::blocking::Client,
}

impl Notifier {
    pub fn new(config: NotificationsConfig) -> Self {
        Self {
            config,
            http: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::blocking::Client::new()),
        }
    }

    pub fn notify_published(&self, notice: &PublishedNotice) -> NotifyOutcome {
        let mut outcome = NotifyOutcome::default();

        if self.config.email.enabled {
            match self.send_email(notice) {
                Ok(()) => {
                    log::info!("publication notice emailed for '{}'", notice.title);
                    outcome.email_sent = true;
                }
                Err(e) => log::error!("email notification failed: {}", e),
            }
        }
        if self.config.telegram.enabled {
            match self.send_telegram(&telegram_message(notice)) {
                Ok(sent) => {
                    log::info!("publication notice sent to {} Telegram chats", sent);
                    outcome.telegram_sent = sent > 0;
                }
                Err(e) => log::error!("telegram notification failed: {}", e),
            }
        }
        outcome
    }

    /// Send a test message to verify the email settings.
    pub fn send_test_email(&self) -> anyhow::Result<()> {
        let notice = PublishedNotice {
            title: "Notifica di prova".to_string(),
            category: "Test".to_string(),
            url: Some("https://example.com/test".to_string()),
            article_id: Some("TEST-123".to_string()),
            photos_uploaded: 0,
            email_subject: "Oggetto di prova".to_string(),
            email_sender: "test@example.com".to_string(),
        };
        self.send_email(&notice)
    }

    /// Send a test message to verify the Telegram settings.
    pub fn send_test_telegram(&self) -> anyhow::Result<usize> {
        let message = format!(
            "Notifica di prova\n\nLe notifiche Telegram sono configurate correttamente.\n{}",
            Local::now().format("%d/%m/%Y %H:%M:%S")
        );
        self.send_telegram(&message)
    }

    fn send_email(&self, notice: &PublishedNotice) -> anyhow::Result<()> {
        let cfg = &self.config.email;
        if cfg.smtp_server.is_empty()
            || cfg.smtp_username.is_empty()
            || cfg.from_email.is_empty()
            || cfg.to_emails.is_empty()
        {
            anyhow::bail!("email notification settings are incomplete");
        }

        let mut builder = Message::builder()
            .subject(format!("Articolo pubblicato: {}", notice.title))
            .from(cfg.from_email.parse()?);
        for to in &cfg.to_emails {
            builder = builder.to(to.parse()?);
        }
        let message = builder.multipart(
            MultiPart::alternative()
                .singlepart(SinglePart::plain(plain_body(notice)))
                .singlepart(SinglePart::html(html_body(notice))),
        )?;

        let creds = Credentials::new(cfg.smtp_username.clone(), cfg.smtp_password.clone());
        let tls_params = TlsParameters::new(cfg.smtp_server.clone())?;
        let relay = SmtpTransport::relay(&cfg.smtp_server)?
            .credentials(creds)
            .port(cfg.smtp_port);
        let mailer = match cfg.smtp_port {
            465 => relay.tls(Tls::Wrapper(tls_params)).build(),
            25 => relay.tls(Tls::Opportunistic(tls_params)).build(),
            _ => relay.tls(Tls::Required(tls_params)).build(),
        };

        mailer.send(&message)?;
        Ok(())
    }

    fn send_telegram(&self, text: &str) -> anyhow::Result<usize> {
        let cfg = &self.config.telegram;
        if cfg.bot_token.is_empty() || cfg.chat_ids.is_empty() {
            anyhow::bail!("telegram notification settings are incomplete");
        }

        let url = format!("https://api.telegram.org/bot{}/sendMessage", cfg.bot_token);
        let mut sent = 0;
        for chat_id in &cfg.chat_ids {
            let result = self
                .http
                .post(&url)
                .json(&json!({
                    "chat_id": chat_id,
                    "text": text,
                    "parse_mode": "Markdown",
                    "disable_web_page_preview": false
                }))
                .send()
                .and_then(|r| r.error_for_status());
            match result {
                Ok(_) => sent += 1,
                Err(e) => log::error!("telegram send to chat {} failed: {}", chat_id, e),
            }
        }
        Ok(sent)
    }
}

fn plain_body(notice: &PublishedNotice) -> String {
    format!(
        "ARTICOLO PUBBLICATO AUTOMATICAMENTE\n\n\
         Titolo: {}\n\
         Categoria: {}\n\
         URL: {}\n\
         ID articolo: {}\n\
         Foto caricate: {}\n\n\
         Email originale:\n\
         Da: {}\n\
         Oggetto: {}\n\n\
         Data: {}",
        notice.title,
        notice.category,
        notice.url.as_deref().unwrap_or("-"),
        notice.article_id.as_deref().unwrap_or("-"),
        notice.photos_uploaded,
        notice.email_sender,
        notice.email_subject,
        Local::now().format("%d/%m/%Y %H:%M:%S"),
    )
}

fn html_body(notice: &PublishedNotice) -> String {
    let url = notice.url.as_deref().unwrap_or("#");
    format!(
        "<html><body style=\"font-family: Arial, sans-serif;\">\
         <h2>Articolo pubblicato automaticamente</h2>\
         <p><strong>Titolo:</strong> {}</p>\
         <p><strong>Categoria:</strong> {}</p>\
         <p><strong>URL:</strong> <a href=\"{url}\">{url}</a></p>\
         <p><strong>ID articolo:</strong> {}</p>\
         <p><strong>Foto caricate:</strong> {}</p>\
         <p><strong>Email originale:</strong><br>Da: {}<br>Oggetto: {}</p>\
         <p><small>{}</small></p>\
         </body></html>",
        notice.title,
        notice.category,
        notice.article_id.as_deref().unwrap_or("-"),
        notice.photos_uploaded,
        notice.email_sender,
        notice.email_subject,
        Local::now().format("%d/%m/%Y %H:%M:%S"),
        url = url,
    )
}

fn telegram_message(notice: &PublishedNotice) -> String {
    format!(
        "*Articolo pubblicato*\n\n\
         *{}*\n\n\
         Categoria: {}\n\
         ID: {}\n\
         Foto: {}\n\n\
         [Visualizza articolo]({})\n\n\
         Da: {}\n\
         {}",
        notice.title,
        notice.category,
        notice.article_id.as_deref().unwrap_or("-"),
        notice.photos_uploaded,
        notice.url.as_deref().unwrap_or("#"),
        notice.email_sender,
        Local::now().format("%d/%m/%Y %H:%M"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice() -> PublishedNotice {
        PublishedNotice {
            title: "Nuovo reparto al Ramazzini".to_string(),
            category: "Sanità".to_string(),
            url: Some("https://www.voce.it/spotlight/42".to_string()),
            article_id: Some("42".to_string()),
            photos_uploaded: 2,
            email_subject: "Comunicato stampa".to_string(),
            email_sender: "ufficio@ausl.mo.it".to_string(),
        }
    }

    #[test]
    fn test_disabled_channels_send_nothing() {
        let notifier = Notifier::new(NotificationsConfig::default());
        let outcome = notifier.notify_published(&notice());
        assert_eq!(outcome, NotifyOutcome::default());
    }

    #[test]
    fn test_incomplete_email_config_is_an_error_not_a_panic() {
        let notifier = Notifier::new(NotificationsConfig::default());
        assert!(notifier.send_test_email().is_err());
        assert!(notifier.send_test_telegram().is_err());
    }

    #[test]
    fn test_telegram_message_contains_essentials() {
        let text = telegram_message(&notice());
        assert!(text.contains("Nuovo reparto al Ramazzini"));
        assert!(text.contains("https://www.voce.it/spotlight/42"));
        assert!(text.contains("ufficio@ausl.mo.it"));
    }

    #[test]
    fn test_plain_body_handles_missing_url() {
        let mut n = notice();
        n.url = None;
        n.article_id = None;
        let body = plain_body(&n);
        assert!(body.contains("URL: -"));
        assert!(body.contains("ID articolo: -"));
    }
}
