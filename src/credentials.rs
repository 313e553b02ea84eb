use anyhow::{Context, Result};
use keyring::{Entry, Error as KeyringError};

/// Secret storage backed by the system keyring.
///
/// Lookup order for every secret: explicit config value, keyring entry,
/// environment variable. A daemon box without a keyring service still works
/// through the environment.
#[derive(Clone)]
pub struct Secrets {
    service: String,
}

impl Secrets {
    pub fn new() -> Self {
        Self {
            service: "newsdesk".to_string(),
        }
    }

    fn entry(&self, kind: &str, account: &str) -> Result<Entry> {
        let service = format!("{}-{}", self.service, kind);
        Entry::new(&service, account).context("Failed to create keyring entry")
    }

    /// Store a secret in the keyring, e.g. kind "imap" or "cms".
    pub fn store(&self, kind: &str, account: &str, secret: &str) -> Result<()> {
        self.entry(kind, account)?
            .set_password(secret)
            .context("Failed to store secret in keyring")?;
        log::debug!("secret stored for {} ({})", account, kind);
        Ok(())
    }

    pub fn get(&self, kind: &str, account: &str) -> Result<Option<String>> {
        match self.entry(kind, account)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(KeyringError::NoEntry) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("Failed to read secret: {}", e)),
        }
    }

    pub fn delete(&self, kind: &str, account: &str) -> Result<()> {
        match self.entry(kind, account)?.delete_password() {
            Ok(()) | Err(KeyringError::NoEntry) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("Failed to delete secret: {}", e)),
        }
    }

    /// Resolve a secret: the configured value wins, then the keyring, then
    /// `env_var`.
    pub fn resolve(
        &self,
        configured: &str,
        kind: &str,
        account: &str,
        env_var: &str,
    ) -> Option<String> {
        if !configured.is_empty() {
            return Some(configured.to_string());
        }
        match self.get(kind, account) {
            Ok(Some(secret)) => return Some(secret),
            Ok(None) => {}
            Err(e) => log::debug!("keyring unavailable for {} ({}): {}", account, kind, e),
        }
        if env_var.is_empty() {
            return None;
        }
        std::env::var(env_var).ok().filter(|v| !v.is_empty())
    }
}

impl Default for Secrets {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_value_wins() {
        let secrets = Secrets::new();
        let resolved = secrets.resolve("from-config", "cms", "redazione", "NEWSDESK_TEST_UNSET");
        assert_eq!(resolved.as_deref(), Some("from-config"));
    }

    #[test]
    fn test_env_fallback() {
        let secrets = Secrets::new();
        std::env::set_var("NEWSDESK_TEST_CMS_PW", "from-env");
        let resolved = secrets.resolve("", "cms", "no-such-account", "NEWSDESK_TEST_CMS_PW");
        assert_eq!(resolved.as_deref(), Some("from-env"));
        std::env::remove_var("NEWSDESK_TEST_CMS_PW");
    }
}
