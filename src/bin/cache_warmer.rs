//! Cache warmer
//!
//! Replays a JSON array of image URLs against a running cache so the first
//! real client sees a hit. Redirects are followed, so an ingested image is
//! fetched again from its public URL.
//!
//! # Usage
//! ```bash
//! cache-warmer [file_paths.json] [delay_ms]
//! ```

use anyhow::Context;
use reqwest::redirect::Policy;
use reqwest::Client;
use std::env;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_URL_FILE: &str = "file_paths.json";
const DEFAULT_DELAY_MS: u64 = 1000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut args = env::args().skip(1);
    let url_file = args.next().unwrap_or_else(|| DEFAULT_URL_FILE.to_string());
    let delay = match args.next() {
        Some(ms) => Duration::from_millis(
            ms.parse()
                .with_context(|| format!("Invalid delay '{}'", ms))?,
        ),
        None => Duration::from_millis(DEFAULT_DELAY_MS),
    };

    let urls = read_urls(&url_file)?;
    info!("Found {} URLs in {}", urls.len(), url_file);

    let client = Client::builder()
        .redirect(Policy::limited(10))
        .timeout(Duration::from_secs(60))
        .build()
        .context("Failed to create HTTP client")?;

    let mut failures = 0usize;
    for (i, url) in urls.iter().enumerate() {
        info!("Request {}/{}: {}", i + 1, urls.len(), url);
        match warm(&client, url).await {
            Ok(status) => info!("Response: status={}", status),
            Err(e) => {
                failures += 1;
                warn!("Request failed for {}: {:#}", url, e);
            }
        }

        if i + 1 < urls.len() {
            tokio::time::sleep(delay).await;
        }
    }

    info!(
        "All requests completed: {} succeeded, {} failed",
        urls.len() - failures,
        failures
    );
    Ok(())
}

/// Load the URL list; the file must hold a JSON array of strings
fn read_urls<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<String>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_urls(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn parse_urls(content: &str) -> anyhow::Result<Vec<String>> {
    let urls: Vec<String> = serde_json::from_str(content)?;
    Ok(urls
        .into_iter()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .collect())
}

/// GET a URL, draining the body so the whole response passes through the cache
async fn warm(client: &Client, url: &str) -> anyhow::Result<reqwest::StatusCode> {
    let response = client.get(url).send().await?;
    let status = response.status();
    response.bytes().await?;
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_urls_skips_blank_entries() {
        let urls = parse_urls(r#"["https://a.example/cat.jpg", "  ", " https://a.example/dog.png "]"#)
            .unwrap();
        assert_eq!(
            urls,
            vec!["https://a.example/cat.jpg", "https://a.example/dog.png"]
        );
    }

    #[test]
    fn test_parse_urls_rejects_non_array() {
        assert!(parse_urls(r#"{"url": "https://a.example/cat.jpg"}"#).is_err());
    }
}
