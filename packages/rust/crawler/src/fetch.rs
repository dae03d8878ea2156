//! HTTP fetching shared by discovery crawl and extraction.

use std::time::Duration;

use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use sitekb_discovery::guarded_redirect_policy;
use sitekb_shared::{Result, SiteKbError};
use url::Url;

/// User-Agent string for crawl requests.
const USER_AGENT: &str = concat!("SiteKB/", env!("CARGO_PKG_VERSION"));

/// Pages larger than this are not parsed (10 MB).
const MAX_PAGE_SIZE: u64 = 10 * 1024 * 1024;

/// A successfully fetched HTML page.
#[derive(Debug, Clone)]
pub struct FetchedHtml {
    /// URL after redirects.
    pub final_url: Url,
    pub body: String,
}

/// Build the crawl client.
///
/// Redirects follow [`guarded_redirect_policy`]: bounded, and never into
/// private address space unless the original request already targeted it.
pub fn build_client(request_timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(guarded_redirect_policy())
        .timeout(Duration::from_secs(request_timeout_secs.max(1)))
        .build()
        .map_err(|e| SiteKbError::Network(format!("failed to build HTTP client: {e}")))
}

/// GET `url` and return the body if the response is 2xx HTML.
pub async fn fetch_html(client: &Client, url: &Url) -> Result<FetchedHtml> {
    let response = client
        .get(url.as_str())
        .send()
        .await
        .map_err(|e| SiteKbError::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(SiteKbError::Network(format!("{url}: HTTP {status}")));
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    if !is_html(&content_type) {
        return Err(SiteKbError::Network(format!(
            "{url}: not HTML (content-type {content_type:?})"
        )));
    }

    if let Some(len) = response.content_length() {
        if len > MAX_PAGE_SIZE {
            return Err(SiteKbError::Network(format!(
                "{url}: page too large ({len} bytes, max {MAX_PAGE_SIZE})"
            )));
        }
    }

    let final_url = response.url().clone();
    let body = response
        .text()
        .await
        .map_err(|e| SiteKbError::Network(format!("{url}: body read failed: {e}")))?;

    Ok(FetchedHtml { final_url, body })
}

fn is_html(content_type: &str) -> bool {
    content_type.starts_with("text/html") || content_type.starts_with("application/xhtml+xml")
}
