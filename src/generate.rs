use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GenerateError {
    #[error("HTTP error talking to {provider}: {source}")]
    Http {
        provider: LlmProvider,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider} returned an unusable response: {reason}")]
    Provider {
        provider: LlmProvider,
        reason: String,
    },
    #[error("no API key configured for {0}")]
    MissingApiKey(LlmProvider),
}

/// Structured article produced by the generator. Field names on the wire
/// match the CMS layout (Italian), the Rust names do not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    #[serde(rename = "tipo")]
    pub kind: String,
    #[serde(rename = "categoria")]
    pub category: String,
    #[serde(rename = "titolo")]
    pub title: String,
    #[serde(rename = "sottotitolo", default)]
    pub subtitle: String,
    #[serde(rename = "occhiello", default)]
    pub lead: String,
    #[serde(rename = "contenuto")]
    pub sections: Vec<String>,
    #[serde(rename = "immagine", default)]
    pub image: Option<String>,
}

impl Article {
    /// Normalize generator output: between one and three non-empty body
    /// sections, defaults for missing classification fields.
    fn normalized(mut self) -> Self {
        self.sections.retain(|s| !s.trim().is_empty());
        self.sections.truncate(MAX_SECTIONS);
        if self.sections.is_empty() {
            self.sections.push("Contenuto non disponibile".to_string());
        }
        if self.kind.is_empty() {
            self.kind = DEFAULT_KIND.to_string();
        }
        if self.category.is_empty() {
            self.category = DEFAULT_CATEGORY.to_string();
        }
        if self.title.is_empty() {
            self.title = "Articolo senza titolo".to_string();
        }
        self
    }
}

const MAX_SECTIONS: usize = 3;
const DEFAULT_KIND: &str = "Spotlight";
const DEFAULT_CATEGORY: &str = "Attualità";

/// Whether the generator should write a full article or only lay out the
/// text it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    Full,
    FormatOnly,
}

/// External article generator contract. Transport failures are errors;
/// a malformed model response is never an error, it degrades to a fallback
/// article carrying the raw text.
pub trait ArticleGenerator: Send + Sync {
    fn generate(
        &self,
        body: &str,
        subject: &str,
        sender: &str,
        mode: GenerationMode,
    ) -> Result<Article, GenerateError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
}

impl LlmProvider {
    pub fn api_key_env(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "OPENAI_API_KEY",
            LlmProvider::Anthropic => "ANTHROPIC_API_KEY",
            LlmProvider::Ollama => "",
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "gpt-4o",
            LlmProvider::Anthropic => "claude-3-5-sonnet-20241022",
            LlmProvider::Ollama => "llama3.1",
        }
    }
}

impl FromStr for LlmProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(LlmProvider::OpenAi),
            "anthropic" => Ok(LlmProvider::Anthropic),
            "ollama" => Ok(LlmProvider::Ollama),
            other => Err(anyhow::anyhow!("unknown LLM provider: {}", other)),
        }
    }
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmProvider::OpenAi => write!(f, "openai"),
            LlmProvider::Anthropic => write!(f, "anthropic"),
            LlmProvider::Ollama => write!(f, "ollama"),
        }
    }
}

/// Generator backed by a hosted or local LLM over HTTP.
pub struct LlmGenerator {
    provider: LlmProvider,
    api_key: Option<String>,
    model: String,
    ollama_url: String,
    client: reqwest::blocking::Client,
}

impl LlmGenerator {
    pub fn new(
        provider: LlmProvider,
        api_key: Option<String>,
        model: Option<String>,
        ollama_url: Option<String>,
    ) -> Self {
        let api_key = api_key.or_else(|| match provider {
            LlmProvider::Ollama => None,
            _ => std::env::var(provider.api_key_env()).ok(),
        });
        Self {
            provider,
            api_key,
            model: model.unwrap_or_else(|| provider.default_model().to_string()),
            ollama_url: ollama_url.unwrap_or_else(|| "http://localhost:11434".to_string()),
            client: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(180))
                .build()
                .unwrap_or_else(|_| reqwest::blocking::Client::new()),
        }
    }

    fn api_key(&self) -> Result<&str, GenerateError> {
        self.api_key
            .as_deref()
            .ok_or(GenerateError::MissingApiKey(self.provider))
    }

    fn complete(&self, prompt: &str) -> Result<String, GenerateError> {
        let http = |source| GenerateError::Http {
            provider: self.provider,
            source,
        };
        let provider_err = |reason: String| GenerateError::Provider {
            provider: self.provider,
            reason,
        };

        match self.provider {
            LlmProvider::OpenAi => {
                let response = self
                    .client
                    .post("https://api.openai.com/v1/chat/completions")
                    .bearer_auth(self.api_key()?)
                    .json(&json!({
                        "model": self.model,
                        "messages": [
                            {"role": "system", "content": SYSTEM_PROMPT},
                            {"role": "user", "content": prompt}
                        ],
                        "temperature": 0.7,
                        "max_tokens": 10000
                    }))
                    .send()
                    .map_err(http)?
                    .error_for_status()
                    .map_err(http)?;
                let body: Value = response.json().map_err(http)?;
                body["choices"][0]["message"]["content"]
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| provider_err("no completion in response".to_string()))
            }
            LlmProvider::Anthropic => {
                let response = self
                    .client
                    .post("https://api.anthropic.com/v1/messages")
                    .header("x-api-key", self.api_key()?)
                    .header("anthropic-version", "2023-06-01")
                    .json(&json!({
                        "model": self.model,
                        "max_tokens": 10000,
                        "temperature": 0.7,
                        "system": SYSTEM_PROMPT,
                        "messages": [{"role": "user", "content": prompt}]
                    }))
                    .send()
                    .map_err(http)?
                    .error_for_status()
                    .map_err(http)?;
                let body: Value = response.json().map_err(http)?;
                body["content"][0]["text"]
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| provider_err("no completion in response".to_string()))
            }
            LlmProvider::Ollama => {
                let response = self
                    .client
                    .post(format!("{}/api/generate", self.ollama_url))
                    .json(&json!({
                        "model": self.model,
                        "prompt": format!("{}\n\n{}", SYSTEM_PROMPT, prompt),
                        "stream": false
                    }))
                    .send()
                    .map_err(http)?
                    .error_for_status()
                    .map_err(http)?;
                let body: Value = response.json().map_err(http)?;
                body["response"]
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| provider_err("no completion in response".to_string()))
            }
        }
    }
}

impl ArticleGenerator for LlmGenerator {
    fn generate(
        &self,
        body: &str,
        subject: &str,
        sender: &str,
        mode: GenerationMode,
    ) -> Result<Article, GenerateError> {
        let prompt = match mode {
            GenerationMode::Full => full_prompt(body, subject, sender),
            GenerationMode::FormatOnly => format_only_prompt(body, subject, sender),
        };
        log::info!(
            "generating article via {} ({}), mode {:?}",
            self.provider,
            self.model,
            mode
        );
        let raw = self.complete(&prompt)?;
        Ok(parse_article(&raw))
    }
}

const SYSTEM_PROMPT: &str =
    "Sei un giornalista professionista esperto nella scrittura di articoli.";

const OUTPUT_FORMAT: &str = r#"FORMATO OUTPUT - IMPORTANTE:
Restituisci SOLO un oggetto JSON valido con questa struttura (non aggiungere testo prima o dopo il JSON):

{
  "tipo": "Spotlight",
  "categoria": "una tra: Scuola, Sanità, Economia, Attualità, Cultura, Ambiente, Moda, Sociale, Sport, Territorio",
  "titolo": "titolo principale accattivante",
  "sottotitolo": "sottotitolo che amplia il titolo",
  "occhiello": "breve frase introduttiva che anticipa il tema (massimo 10 parole)",
  "contenuto": [
    "prima parte con lead giornalistico (chi, cosa, quando, dove, perché)",
    "seconda parte con sviluppo della notizia (opzionale se email breve)",
    "terza parte con conclusione e dettagli finali (opzionale se email breve)"
  ],
  "immagine": ""
}"#;

fn full_prompt(body: &str, subject: &str, sender: &str) -> String {
    format!(
        r#"Sei un giornalista professionista. Il tuo compito è trasformare il contenuto di questa email in un articolo giornalistico ben strutturato.

INFORMAZIONI EMAIL:
- Mittente: {sender}
- Oggetto: {subject}

CONTENUTO EMAIL:
{body}

ISTRUZIONI:
1. Analizza il contenuto dell'email e identifica le informazioni chiave
2. Scrivi un articolo giornalistico professionale con uno stile oggettivo
3. Usa un linguaggio chiaro e accessibile, diviso in paragrafi ben strutturati
4. Scegli la categoria più appropriata tra: Scuola, Sanità, Economia, Attualità, Cultura, Ambiente, Moda, Sociale, Sport, Territorio
5. I lettori sono di Carpi (Modena): evita specificazioni ovvie sui luoghi locali

{output_format}

REGOLE OBBLIGATORIE:
- OGNI paragrafo di "contenuto" deve contenere MINIMO 200 e MASSIMO 350 parole
- Primo paragrafo: lead giornalistico con le 5W e contesto immediato
- Secondo paragrafo: sviluppo approfondito con tutti i dettagli, citazioni e dati dell'email
- Terzo paragrafo: conclusioni, implicazioni e chiusura professionale
- Usa TUTTE le informazioni dell'email senza tralasciare nulla
- I paragrafi separano banner pubblicitari nel CMS, quindi devono reggersi da soli

Genera l'articolo in formato JSON:"#,
        sender = sender,
        subject = subject,
        body = body,
        output_format = OUTPUT_FORMAT,
    )
}

fn format_only_prompt(body: &str, subject: &str, sender: &str) -> String {
    format!(
        r#"Sei un impaginatore di redazione. Il testo di questa email è già scritto nella forma in cui va pubblicato: NON riscriverlo, NON riassumerlo, NON aggiungere contenuto.

INFORMAZIONI EMAIL:
- Mittente: {sender}
- Oggetto: {subject}

CONTENUTO EMAIL:
{body}

ISTRUZIONI:
1. Suddividi il testo esistente in al massimo tre paragrafi equilibrati, rispettando l'ordine originale
2. Ricava titolo, sottotitolo e occhiello dal testo stesso (l'oggetto dell'email è un buon candidato per il titolo)
3. Correggi solo refusi evidenti e spaziature, nient'altro
4. Scegli la categoria più appropriata tra: Scuola, Sanità, Economia, Attualità, Cultura, Ambiente, Moda, Sociale, Sport, Territorio

{output_format}

Impagina il testo in formato JSON:"#,
        sender = sender,
        subject = subject,
        body = body,
        output_format = OUTPUT_FORMAT,
    )
}

/// Parse the model's reply into an `Article`. Markdown code fences are
/// tolerated; anything that still fails to parse becomes a fallback article
/// wrapping the raw reply so a bad model day never drops a message.
pub fn parse_article(raw: &str) -> Article {
    let mut cleaned = raw.trim();
    if let Some(rest) = cleaned.strip_prefix("```json") {
        cleaned = rest;
    } else if let Some(rest) = cleaned.strip_prefix("```") {
        cleaned = rest;
    }
    if let Some(rest) = cleaned.strip_suffix("```") {
        cleaned = rest;
    }
    let cleaned = cleaned.trim();

    match serde_json::from_str::<Article>(cleaned) {
        Ok(article) => article.normalized(),
        Err(e) => {
            log::warn!("unparsable generator response, using fallback article: {}", e);
            Article {
                kind: DEFAULT_KIND.to_string(),
                category: DEFAULT_CATEGORY.to_string(),
                title: "Articolo generato".to_string(),
                subtitle: String::new(),
                lead: String::new(),
                sections: vec![raw.to_string()],
                image: None,
            }
            .normalized()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let raw = r#"{"tipo":"Spotlight","categoria":"Sanità","titolo":"Nuovo reparto",
            "sottotitolo":"st","occhiello":"oc","contenuto":["uno","due"],"immagine":""}"#;
        let article = parse_article(raw);
        assert_eq!(article.category, "Sanità");
        assert_eq!(article.title, "Nuovo reparto");
        assert_eq!(article.sections, vec!["uno", "due"]);
    }

    #[test]
    fn test_parse_strips_markdown_fences() {
        let raw = "```json\n{\"tipo\":\"Spotlight\",\"categoria\":\"Cultura\",\
                   \"titolo\":\"T\",\"contenuto\":[\"p\"]}\n```";
        let article = parse_article(raw);
        assert_eq!(article.category, "Cultura");
        assert_eq!(article.sections, vec!["p"]);
    }

    #[test]
    fn test_sections_clamped_to_three_and_empties_dropped() {
        let raw = r#"{"tipo":"Spotlight","categoria":"Attualità","titolo":"T",
            "contenuto":["a","  ","b","c","d"]}"#;
        let article = parse_article(raw);
        assert_eq!(article.sections, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_unparsable_reply_becomes_fallback() {
        let article = parse_article("Sorry, I cannot produce JSON today.");
        assert_eq!(article.kind, "Spotlight");
        assert_eq!(article.category, "Attualità");
        assert_eq!(article.title, "Articolo generato");
        assert_eq!(article.sections.len(), 1);
        assert!(article.sections[0].contains("cannot produce"));
    }

    #[test]
    fn test_missing_fields_get_defaults() {
        let article = parse_article(r#"{"tipo":"","categoria":"","titolo":"","contenuto":[]}"#);
        assert_eq!(article.kind, "Spotlight");
        assert_eq!(article.category, "Attualità");
        assert_eq!(article.title, "Articolo senza titolo");
        assert_eq!(article.sections, vec!["Contenuto non disponibile"]);
    }

    #[test]
    fn test_wire_names_are_italian() {
        let article = parse_article(
            r#"{"tipo":"Spotlight","categoria":"Sport","titolo":"T","contenuto":["p"]}"#,
        );
        let wire = serde_json::to_value(&article).unwrap();
        assert!(wire.get("titolo").is_some());
        assert!(wire.get("title").is_none());
    }
}
