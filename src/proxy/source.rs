//! Link source module for loading connection links
//!
//! Links come from local files, raw text, or subscription URLs. Subscription
//! bodies are often a base64 encoded link list, so text without any
//! recognizable link is decoded and searched again.

use crate::proxy::parser::LinkParser;
use crate::Result;
use anyhow::Context;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use reqwest::Client;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Default timeout for subscription requests in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default user agent for subscription requests
const DEFAULT_USER_AGENT: &str = concat!("link-probe/", env!("CARGO_PKG_VERSION"));

/// Result of loading a single source
#[derive(Debug, Clone)]
pub struct SourceResult {
    /// The source that was loaded
    pub source: String,
    /// Links found in the source
    pub links: Vec<String>,
    /// Error message if loading failed
    pub error: Option<String>,
}

impl SourceResult {
    pub fn success(source: String, links: Vec<String>) -> Self {
        Self {
            source,
            links,
            error: None,
        }
    }

    pub fn failure(source: String, error: String) -> Self {
        Self {
            source,
            links: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Configuration for subscription requests
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl SourceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// Loader for connection links from files, text and subscriptions
pub struct SourceLoader {
    client: Client,
}

impl SourceLoader {
    /// Create a new loader with default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(SourceConfig::default())
    }

    /// Create a new loader with custom configuration
    pub fn with_config(config: SourceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self { client })
    }

    /// Read links from a local file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        Ok(Self::from_text(&content))
    }

    /// Find links in raw text, falling back to a base64 decoded body
    ///
    /// Duplicates are dropped, first occurrence order is kept.
    pub fn from_text(content: &str) -> Vec<String> {
        let mut links = LinkParser::extract_links(content);

        if links.is_empty() {
            if let Some(decoded) = decode_base64(content) {
                debug!("Source content decoded as base64");
                links = LinkParser::extract_links(&decoded);
            }
        }

        let mut seen = HashSet::new();
        links.retain(|link| seen.insert(link.clone()));
        links
    }

    /// Fetch links from a subscription URL
    pub async fn fetch(&self, url: &str) -> Result<Vec<String>> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let content = response.text().await?;
        Ok(Self::from_text(&content))
    }

    /// Fetch multiple subscription URLs, returning results for each
    pub async fn fetch_with_results(&self, urls: &[String]) -> Vec<SourceResult> {
        let mut results = Vec::new();

        for url in urls {
            let result = match self.fetch(url).await {
                Ok(links) => SourceResult::success(url.clone(), links),
                Err(e) => SourceResult::failure(url.clone(), e.to_string()),
            };
            results.push(result);
        }

        results
    }
}

/// Decode text as base64 in any of the common alphabets
fn decode_base64(content: &str) -> Option<String> {
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }

    [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(&compact).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINK_A: &str = "vless://abc@a.example.com:443?type=tcp#A";
    const LINK_B: &str = "vless://abc@b.example.com:443";

    #[test]
    fn test_source_config_builder() {
        let config = SourceConfig::new()
            .with_timeout(Duration::from_secs(5))
            .with_user_agent("Custom Agent".to_string());
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.user_agent, "Custom Agent");
        assert!(SourceConfig::default().user_agent.starts_with("link-probe/"));
    }

    #[test]
    fn test_source_result() {
        let result = SourceResult::success("sub".to_string(), vec![LINK_A.to_string()]);
        assert!(result.is_success());
        assert_eq!(result.links.len(), 1);

        let result = SourceResult::failure("sub".to_string(), "HTTP 404".to_string());
        assert!(!result.is_success());
        assert!(result.links.is_empty());
    }

    #[test]
    fn test_from_text_plain() {
        let content = format!("{}\n\n# comment\n{}\n{}\n", LINK_A, LINK_B, LINK_A);
        let links = SourceLoader::from_text(&content);
        assert_eq!(links, vec![LINK_A.to_string(), LINK_B.to_string()]);
    }

    #[test]
    fn test_from_text_base64() {
        let body = STANDARD.encode(format!("{}\n{}\n", LINK_A, LINK_B));
        let links = SourceLoader::from_text(&body);
        assert_eq!(links.len(), 2);

        let body = URL_SAFE_NO_PAD.encode(LINK_B);
        assert_eq!(SourceLoader::from_text(&body), vec![LINK_B.to_string()]);
    }

    #[test]
    fn test_from_text_without_links() {
        assert!(SourceLoader::from_text("nothing to see here").is_empty());
        assert!(SourceLoader::from_text("").is_empty());
    }

    #[test]
    fn test_from_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::write(file.path(), format!("{}\n{}\n", LINK_A, LINK_B)).unwrap();
        let links = SourceLoader::from_file(file.path()).unwrap();
        assert_eq!(links.len(), 2);

        assert!(SourceLoader::from_file("/nonexistent/links.txt").is_err());
    }
}
