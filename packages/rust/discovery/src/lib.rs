//! Seed discovery for a site crawl.
//!
//! Before the link-following crawl starts, SiteKB looks for machine-readable
//! listings of the site's pages: `robots.txt` (for `Sitemap:` lines and
//! disallow rules), sitemaps at well-known locations (including sitemap
//! indexes), and RSS/Atom feeds (well-known paths plus feeds advertised in the
//! root page's `<head>`). Every source is best-effort: a missing or malformed
//! listing is logged and skipped, never fatal.

mod feed;
mod robots;
mod sitemap;

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use reqwest::redirect::Policy;
use sitekb_shared::{Result, SiteKbError, allowed_from, parse_normalized};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

pub use feed::{feed_links_from_html, parse_feed};
pub use robots::{RobotsRules, parse_robots};
pub use sitemap::{SitemapDoc, parse_sitemap};

/// Maximum number of redirects to follow for listing requests.
const MAX_REDIRECTS: usize = 5;

/// Default timeout in seconds for each listing request.
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Maximum response size we consider valid (10 MB).
const MAX_RESPONSE_SIZE: u64 = 10 * 1024 * 1024;

/// How deep nested sitemap indexes are followed.
const MAX_SITEMAP_NESTING: u32 = 2;

/// User-Agent string for discovery requests.
const USER_AGENT: &str = concat!("SiteKB/", env!("CARGO_PKG_VERSION"));

/// Well-known sitemap locations, relative to the root URL.
const SITEMAP_PATHS: &[&str] = &[
    "sitemap.xml",
    "sitemap_index.xml",
    "sitemap/sitemap.xml",
    "sitemap-index.xml",
];

/// Well-known feed locations, relative to the root URL.
const FEED_PATHS: &[&str] = &[
    "feed",
    "rss",
    "rss.xml",
    "feed.xml",
    "index.xml",
    "atom.xml",
    "blog/rss.xml",
    "blog/index.xml",
];

// ---------------------------------------------------------------------------
// Options / results
// ---------------------------------------------------------------------------

/// Configuration for seed discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Timeout for each HTTP request in seconds.
    pub timeout_secs: u64,
    /// Upper bound on page URLs collected from sitemaps.
    pub max_sitemap_urls: usize,
    /// Upper bound on sitemap documents fetched (indexes included).
    pub max_sitemap_fetches: usize,
    /// Parse `Disallow` rules from robots.txt.
    pub respect_robots_txt: bool,
    /// Budget for the whole seed phase. Listings still outstanding when it
    /// runs out are abandoned and the seeds gathered so far are kept.
    pub deadline: Option<Duration>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_sitemap_urls: 50_000,
            max_sitemap_fetches: 32,
            respect_robots_txt: true,
            deadline: None,
        }
    }
}

/// Seeds found before crawling, each list deduplicated and in discovery order.
#[derive(Debug, Clone, Default)]
pub struct SeedSet {
    /// Page URLs listed in sitemaps.
    pub sitemap: Vec<Url>,
    /// Page URLs listed in feeds.
    pub feed: Vec<Url>,
    /// robots.txt rules; permissive when robots.txt is missing or ignored.
    pub robots: RobotsRules,
    /// The seed phase ran out of time before every listing was read.
    pub timed_out: bool,
}

impl SeedSet {
    pub fn len(&self) -> usize {
        self.sitemap.len() + self.feed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sitemap.is_empty() && self.feed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

/// Collect sitemap and feed seeds plus robots rules for `root`.
///
/// Only fails when the root URL itself is unusable or the HTTP client cannot
/// be built; every individual listing failure degrades to "no seeds". When
/// [`DiscoveryOptions::deadline`] elapses the seeds found so far are
/// returned with `timed_out` set.
#[instrument(skip_all, fields(root = %root))]
pub async fn discover_seeds(root: &Url, opts: &DiscoveryOptions) -> Result<SeedSet> {
    if root.host_str().is_none() {
        return Err(SiteKbError::validation(format!("URL has no host: {root}")));
    }
    let client = build_client(opts)?;
    let deadline = opts.deadline.map(|budget| Instant::now() + budget);

    let mut robots = within(deadline, fetch_robots(&client, root))
        .await
        .unwrap_or_default();

    let mut sitemap = Vec::new();
    let mut feed = Vec::new();
    let finished = within(deadline, async {
        tokio::join!(
            collect_sitemap_urls(&client, root, sitemap_locations(root, &robots), opts, &mut sitemap),
            collect_feed_urls(&client, root, &mut feed),
        )
    })
    .await
    .is_some();

    let timed_out = !finished;
    if timed_out {
        warn!(
            sitemap = sitemap.len(),
            feed = feed.len(),
            "seed discovery deadline reached, keeping partial seeds"
        );
    }

    if !opts.respect_robots_txt {
        // Keep the advertised sitemaps, drop the access rules.
        robots = RobotsRules {
            sitemaps: std::mem::take(&mut robots.sitemaps),
            ..RobotsRules::default()
        };
    }

    info!(
        sitemap = sitemap.len(),
        feed = feed.len(),
        robots_rules = robots.has_rules(),
        timed_out,
        "seed discovery complete"
    );

    Ok(SeedSet {
        sitemap,
        feed,
        robots,
        timed_out,
    })
}

/// Run `fut` to completion, or until `deadline` when one is set.
async fn within<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut).await.ok(),
        None => Some(fut.await),
    }
}

async fn fetch_robots(client: &Client, root: &Url) -> RobotsRules {
    let Ok(robots_url) = root.join("/robots.txt") else {
        return RobotsRules::default();
    };
    match fetch_text(client, &robots_url).await {
        Ok(body) => parse_robots(&body, root),
        Err(e) => {
            debug!(error = %e, "robots.txt unavailable");
            RobotsRules::default()
        }
    }
}

/// Sitemaps advertised by robots.txt, then the well-known locations.
/// Advertised locations pointing at internal hosts are dropped unless the
/// root itself is internal.
fn sitemap_locations(root: &Url, robots: &RobotsRules) -> Vec<Url> {
    let mut locations: Vec<Url> = robots
        .sitemaps
        .iter()
        .filter(|url| listing_allowed(root, url))
        .cloned()
        .collect();
    for url in candidate_urls(root, SITEMAP_PATHS) {
        if !locations.contains(&url) {
            locations.push(url);
        }
    }
    locations
}

fn listing_allowed(root: &Url, url: &Url) -> bool {
    let allowed = allowed_from(root, url);
    if !allowed {
        debug!(listing = %url, "listing on an internal host skipped");
    }
    allowed
}

// ---------------------------------------------------------------------------
// Sitemaps
// ---------------------------------------------------------------------------

/// Pages listed by the sitemaps at `locations`, appended to `pages` as they
/// are parsed so that an abandoned walk keeps what it found.
async fn collect_sitemap_urls(
    client: &Client,
    root: &Url,
    locations: Vec<Url>,
    opts: &DiscoveryOptions,
    pages: &mut Vec<Url>,
) {
    let mut queue: VecDeque<(Url, u32)> = locations.into_iter().map(|u| (u, 0)).collect();
    let mut fetched: HashSet<Url> = HashSet::new();
    let mut seen: HashSet<Url> = HashSet::new();

    while let Some((location, nesting)) = queue.pop_front() {
        if fetched.len() >= opts.max_sitemap_fetches || pages.len() >= opts.max_sitemap_urls {
            break;
        }
        if !fetched.insert(location.clone()) {
            continue;
        }

        let body = match fetch_text(client, &location).await {
            Ok(body) => body,
            Err(e) => {
                debug!(sitemap = %location, error = %e, "sitemap unavailable");
                continue;
            }
        };

        match parse_sitemap(&body) {
            Ok(SitemapDoc::UrlSet(locs)) => {
                debug!(sitemap = %location, count = locs.len(), "sitemap parsed");
                for loc in locs {
                    if pages.len() >= opts.max_sitemap_urls {
                        break;
                    }
                    if let Some(url) = parse_normalized(&loc) {
                        if seen.insert(url.clone()) {
                            pages.push(url);
                        }
                    }
                }
            }
            Ok(SitemapDoc::Index(children)) => {
                if nesting >= MAX_SITEMAP_NESTING {
                    debug!(sitemap = %location, "sitemap index nested too deep, skipping");
                    continue;
                }
                for child in children {
                    if let Ok(url) = location.join(child.trim()) {
                        if listing_allowed(root, &url) {
                            queue.push_back((url, nesting + 1));
                        }
                    }
                }
            }
            Err(e) => debug!(sitemap = %location, error = %e, "not a sitemap"),
        }
    }
}

// ---------------------------------------------------------------------------
// Feeds
// ---------------------------------------------------------------------------

/// Pages listed by the site's feeds, appended to `pages` as each feed is
/// parsed.
async fn collect_feed_urls(client: &Client, root: &Url, pages: &mut Vec<Url>) {
    let root_html = match fetch_text(client, root).await {
        Ok(html) => Some(html),
        Err(e) => {
            debug!(error = %e, "root page unavailable for feed autodiscovery");
            None
        }
    };

    let mut seen: HashSet<Url> = HashSet::new();
    for feed_url in feed_locations(root, root_html.as_deref()) {
        let body = match fetch_text(client, &feed_url).await {
            Ok(body) => body,
            Err(e) => {
                debug!(feed = %feed_url, error = %e, "feed unavailable");
                continue;
            }
        };
        match parse_feed(&body, &feed_url) {
            Ok(links) => {
                debug!(feed = %feed_url, count = links.len(), "feed parsed");
                for link in links {
                    if seen.insert(link.clone()) {
                        pages.push(link);
                    }
                }
            }
            Err(e) => debug!(feed = %feed_url, error = %e, "not a feed"),
        }
    }
}

/// Well-known feed paths, then feeds advertised in the root page's `<head>`.
fn feed_locations(root: &Url, root_html: Option<&str>) -> Vec<Url> {
    let mut feeds = candidate_urls(root, FEED_PATHS);
    if let Some(html) = root_html {
        for advertised in feed_links_from_html(html, root) {
            if listing_allowed(root, &advertised) && !feeds.contains(&advertised) {
                feeds.push(advertised);
            }
        }
    }
    feeds
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Resolve well-known relative paths against the root URL (treated as a
/// directory) and against the origin, deduplicated in that order.
fn candidate_urls(root: &Url, paths: &[&str]) -> Vec<Url> {
    let mut base = root.clone();
    base.set_query(None);
    base.set_fragment(None);
    if !base.path().ends_with('/') {
        let dir = format!("{}/", base.path());
        base.set_path(&dir);
    }

    let origin = root.join("/").ok();

    let mut out: Vec<Url> = Vec::new();
    for dir in std::iter::once(&base).chain(origin.as_ref()) {
        for path in paths {
            if let Ok(url) = dir.join(path) {
                if !out.contains(&url) {
                    out.push(url);
                }
            }
        }
    }
    out
}

/// Redirect policy for every SiteKB client: at most `MAX_REDIRECTS` hops,
/// and never from a public URL into private address space.
pub fn guarded_redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        let allowed = match attempt.previous().first() {
            Some(origin) => allowed_from(origin, attempt.url()),
            None => true,
        };
        if allowed {
            attempt.follow()
        } else {
            attempt.error("redirect to private address blocked")
        }
    })
}

/// Build a reqwest client with appropriate settings.
fn build_client(opts: &DiscoveryOptions) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(guarded_redirect_policy())
        .timeout(Duration::from_secs(opts.timeout_secs.max(1)))
        .build()
        .map_err(|e| SiteKbError::Network(format!("failed to build HTTP client: {e}")))
}

/// Fetch a URL as text, rejecting non-2xx and oversized responses.
async fn fetch_text(client: &Client, url: &Url) -> Result<String> {
    let response = client
        .get(url.as_str())
        .send()
        .await
        .map_err(|e| SiteKbError::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(SiteKbError::Network(format!("{url}: HTTP {status}")));
    }

    if let Some(len) = response.content_length() {
        if len > MAX_RESPONSE_SIZE {
            return Err(SiteKbError::validation(format!(
                "{url}: response too large ({len} bytes, max {MAX_RESPONSE_SIZE})"
            )));
        }
    }

    response
        .text()
        .await
        .map_err(|e| SiteKbError::Network(format!("{url}: failed to read body: {e}")))
}
