//! Query resolution: turning a text query into candidate image URLs.
//!
//! Resolution lives outside the acquisition pipeline proper. The pipeline only depends on the
//! [`Resolver`] trait; [`SearchPageResolver`] is the stock implementation that reads the result
//! metadata embedded in an image-search results page.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Url};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error types for query resolution
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Search page returned HTTP {0}")]
    Status(u16),
}

/// Result type for resolution operations
pub type ResolveResult<T> = Result<T, ResolveError>;

/// Maps a query to the locators of its image results.
pub trait Resolver {
    fn resolve(&self, query: &str) -> impl Future<Output = ResolveResult<Vec<String>>> + Send;
}

const SEARCH_URL: &str = "https://www.google.com/search";

// Classic result markup: JSON metadata blobs with the original image URL under "ou".
static OU_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""ou"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("valid regex")
});

// Newer markup: ["<url>",<height>,<width>] triples inside inline scripts.
static URL_TRIPLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\["(https?://[^"]+)",\d+,\d+\]"#).expect("valid regex")
});

/// Resolves queries by fetching the image-search results page over HTTP.
pub struct SearchPageResolver {
    client: Client,
    base_url: String,
}

impl SearchPageResolver {
    pub fn new(user_agent: &str, timeout: Duration) -> ResolveResult<Self> {
        Self::with_base_url(user_agent, timeout, SEARCH_URL)
    }

    pub fn with_base_url(user_agent: &str, timeout: Duration, base_url: &str) -> ResolveResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
        })
    }
}

impl Resolver for SearchPageResolver {
    async fn resolve(&self, query: &str) -> ResolveResult<Vec<String>> {
        info!("Getting image URLs for \"{}\".", query);

        let response = self
            .client
            .get(&self.base_url)
            .query(&[("tbm", "isch"), ("q", query)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ResolveError::Status(response.status().as_u16()));
        }

        let page = response.text().await?;
        let urls = extract_image_urls(&page);
        debug!(query, count = urls.len(), "Extracted image URLs");
        Ok(urls)
    }
}

/// Pulls original-image URLs out of a results page, in page order.
///
/// Duplicates are kept: the pipeline deduplicates by content, not by address.
pub fn extract_image_urls(page: &str) -> Vec<String> {
    let from_metadata: Vec<String> = OU_FIELD
        .captures_iter(page)
        .filter_map(|caps| caps.get(1))
        .map(|m| unescape_json_string(m.as_str()))
        .filter(|url| !url.trim().is_empty())
        .collect();

    if !from_metadata.is_empty() {
        return from_metadata;
    }

    URL_TRIPLE
        .captures_iter(page)
        .filter_map(|caps| caps.get(1))
        .map(|m| unescape_json_string(m.as_str()))
        .filter(|url| !is_search_host(url))
        .collect()
}

/// Thumbnails and links back to the search engine itself. Unparsable URLs are dropped too.
fn is_search_host(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return true;
    };
    match parsed.host_str() {
        Some(host) => ["gstatic.com", "google.com"]
            .iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{}", domain))),
        None => true,
    }
}

fn unescape_json_string(raw: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{}\"", raw)).unwrap_or_else(|_| raw.to_string())
}

/// Resolves every query in order and concatenates the results.
///
/// A query that fails to resolve is logged and contributes no locators.
pub async fn resolve_all<R: Resolver>(resolver: &R, queries: &[String]) -> Vec<String> {
    let mut locators = Vec::new();
    for query in queries {
        match resolver.resolve(query).await {
            Ok(urls) => locators.extend(urls),
            Err(e) => warn!("Failed to resolve \"{}\": {}", query, e),
        }
    }
    info!("Total image URLs: {}", locators.len());
    locators
}

/// Reads a list of locators, one per line. Blank lines and `#` comments are skipped.
pub fn read_url_list(path: &Path) -> ResolveResult<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_lines(&content))
}

/// Same line format as [`read_url_list`]; also used for query files.
pub fn parse_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
