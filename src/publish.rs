use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::generate::Article;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("HTTP error talking to the CMS: {0}")]
    Http(#[from] reqwest::Error),
    #[error("CMS login failed for {username}")]
    Login { username: String },
    #[error("CMS rejected the article: {0}")]
    Rejected(String),
    #[error("asset file unreadable: {0}")]
    Asset(#[from] std::io::Error),
}

/// Outcome of a publish call. The orchestrator only transitions a message to
/// PUBLISHED when `success` is true.
#[derive(Debug, Clone, Default)]
pub struct PublishResult {
    pub success: bool,
    pub url: Option<String>,
    pub id: Option<String>,
}

/// External publisher contract.
pub trait Publisher: Send + Sync {
    fn publish(&self, article: &Article) -> Result<PublishResult, PublishError>;

    /// Upload image files for an already-created article. Returns how many
    /// uploaded; individual failures are logged and skipped.
    fn upload_assets(&self, article_id: &str, paths: &[&Path]) -> Result<usize, PublishError>;
}

/// CMS category names to their numeric form values. Territorio has no
/// section of its own and lands in Attualità.
fn category_value(category: &str) -> &'static str {
    match category {
        "Scuola" => "1",
        "Sanità" => "3",
        "Economia" => "5",
        "Attualità" => "7",
        "Sport" => "8",
        "Cultura" => "19",
        "Sociale" => "28",
        "Moda" => "29",
        "Ambiente" => "48",
        "Territorio" => "7",
        _ => "7",
    }
}

/// Article kinds to their CMS admin section.
fn section_path(kind: &str) -> &'static str {
    match kind {
        "Apertura" => "admin/apertura/",
        "In Evidenza" => "admin/in_evidenza/",
        _ => "admin/spotlight/",
    }
}

/// Publishes articles through the CMS admin forms over plain HTTP. The
/// session cookie from login is carried by the client's cookie store.
pub struct CmsClient {
    base_url: String,
    username: String,
    password: String,
    client: reqwest::blocking::Client,
}

impl CmsClient {
    pub fn new(base_url: &str, username: &str, password: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            client: reqwest::blocking::Client::builder()
                .cookie_store(true)
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| reqwest::blocking::Client::new()),
        }
    }

    fn login(&self) -> Result<(), PublishError> {
        let response = self
            .client
            .post(format!("{}/admin/login.php", self.base_url))
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()?
            .error_for_status()?;

        // The login form echoes itself back on bad credentials.
        let final_url = response.url().to_string();
        let body = response.text()?;
        if body.contains("name=\"password\"") && !final_url.contains("index.php") {
            return Err(PublishError::Login {
                username: self.username.clone(),
            });
        }
        log::debug!("CMS login ok, landed on {}", final_url);
        Ok(())
    }
}

impl Publisher for CmsClient {
    fn publish(&self, article: &Article) -> Result<PublishResult, PublishError> {
        self.login()?;

        let section = section_path(&article.kind);
        let mut sections = article.sections.iter();
        let testo = sections.next().map(String::as_str).unwrap_or("");
        let testo2 = sections.next().map(String::as_str).unwrap_or("");
        let testo3 = sections.next().map(String::as_str).unwrap_or("");

        log::info!("publishing '{}' to {}", article.title, section);
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, section))
            .form(&[
                ("categoria", category_value(&article.category)),
                ("titolo", article.title.as_str()),
                ("sottotitolo", article.subtitle.as_str()),
                ("occhiello", article.lead.as_str()),
                ("testo", testo),
                ("testo2", testo2),
                ("testo3", testo3),
                ("visibile", "1"),
                ("salva", "Salva"),
            ])
            .send()?
            .error_for_status()?;

        // The CMS redirects back to the section listing on success.
        let final_url = response.url().to_string();
        if final_url.contains("spotlight")
            || final_url.contains("apertura")
            || final_url.contains("in_evidenza")
        {
            let id = response
                .url()
                .query_pairs()
                .find(|(k, _)| k == "id")
                .map(|(_, v)| v.into_owned());
            Ok(PublishResult {
                success: true,
                url: Some(final_url),
                id,
            })
        } else {
            Ok(PublishResult {
                success: false,
                url: Some(final_url),
                id: None,
            })
        }
    }

    fn upload_assets(&self, article_id: &str, paths: &[&Path]) -> Result<usize, PublishError> {
        let mut uploaded = 0;
        for path in paths {
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "allegato".to_string());
            let bytes = match std::fs::read(path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::error!("skipping unreadable asset {:?}: {}", path, e);
                    continue;
                }
            };
            let form = reqwest::blocking::multipart::Form::new()
                .text("articolo_id", article_id.to_string())
                .part(
                    "immagine",
                    reqwest::blocking::multipart::Part::bytes(bytes).file_name(filename.clone()),
                );
            let result = self
                .client
                .post(format!("{}/admin/upload.php", self.base_url))
                .multipart(form)
                .send()
                .and_then(|r| r.error_for_status());
            match result {
                Ok(_) => {
                    log::info!("uploaded asset {} for article {}", filename, article_id);
                    uploaded += 1;
                }
                Err(e) => log::error!("asset upload failed for {:?}: {}", path, e),
            }
        }
        Ok(uploaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_mapping() {
        assert_eq!(category_value("Sanità"), "3");
        assert_eq!(category_value("Territorio"), "7");
        assert_eq!(category_value("qualcosa di nuovo"), "7");
    }

    #[test]
    fn test_section_for_kind() {
        assert_eq!(section_path("Spotlight"), "admin/spotlight/");
        assert_eq!(section_path("In Evidenza"), "admin/in_evidenza/");
        assert_eq!(section_path(""), "admin/spotlight/");
    }
}
