//! Bounded, concurrent breadth-first URL discovery.
//!
//! The frontier is seeded with sitemap URLs, then feed URLs, then the root.
//! Each wave takes up to `concurrency` targets off the frontier, fetches them
//! in parallel behind a semaphore, and then processes the results in spawn
//! order, so the accepted list depends only on the frontier, never on which
//! request finished first.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use reqwest::Client;
use scraper::{Html, Selector};
use sitekb_discovery::SeedSet;
use sitekb_shared::{CrawlConfig, CrawlTarget, DiscoveredVia, Result, resolve_link};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::fetch::{build_client, fetch_html};
use crate::scope::CrawlScope;

static LINK_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("valid selector"));

// ---------------------------------------------------------------------------
// CrawlReport
// ---------------------------------------------------------------------------

/// Outcome of a discovery crawl.
#[derive(Debug, Clone)]
pub struct CrawlReport {
    /// Accepted targets in frontier order, at most `max_pages`.
    pub targets: Vec<CrawlTarget>,
    /// Pages fetched successfully (accepted or merely traversed).
    pub pages_fetched: usize,
    /// Targets skipped before fetching (robots.txt).
    pub pages_skipped: usize,
    /// Failed fetches as (URL, error message).
    pub errors: Vec<(String, String)>,
    /// The overall deadline elapsed before the frontier was exhausted.
    pub timed_out: bool,
    pub duration: Duration,
}

// ---------------------------------------------------------------------------
// Crawl state
// ---------------------------------------------------------------------------

/// Mutable state of one crawl. Only the aggregation step in
/// [`Crawler::crawl`] touches it.
#[derive(Debug, Default)]
struct CrawlState {
    frontier: VecDeque<CrawlTarget>,
    visited: HashSet<String>,
    accepted: Vec<CrawlTarget>,
    pages_fetched: usize,
    pages_skipped: usize,
    errors: Vec<(String, String)>,
}

impl CrawlState {
    /// Enqueue `target` unless its URL was seen before. First discovery wins.
    fn enqueue(&mut self, target: CrawlTarget) -> bool {
        if self.visited.insert(target.key().to_string()) {
            self.frontier.push_back(target);
            true
        } else {
            false
        }
    }
}

/// What a worker hands back for one target.
struct Visit {
    final_url: Url,
    links: Vec<Url>,
}

// ---------------------------------------------------------------------------
// Crawler
// ---------------------------------------------------------------------------

/// Concurrent, scope-aware crawler producing the list of pages to extract.
pub struct Crawler {
    config: CrawlConfig,
    client: Client,
}

impl Crawler {
    /// Create a new crawler with the given configuration.
    pub fn new(config: CrawlConfig) -> Result<Self> {
        let client = build_client(config.request_timeout_secs)?;
        Ok(Self { config, client })
    }

    /// Crawl from `root`, seeded with discovered sitemap and feed URLs.
    ///
    /// Never fails on individual pages; fetch errors are collected in the
    /// report. When `timeout_secs` elapses, outstanding fetches are aborted
    /// and the targets accepted so far are returned.
    pub async fn crawl(&self, root: &Url, seeds: &SeedSet) -> Result<CrawlReport> {
        let budget = Duration::from_secs(self.config.timeout_secs.max(1));
        self.crawl_within(root, seeds, budget).await
    }

    /// [`Crawler::crawl`] bounded by `budget` instead of `timeout_secs`, for
    /// callers that already spent part of the overall deadline.
    #[instrument(skip_all, fields(root = %root, budget_ms = budget.as_millis()))]
    pub async fn crawl_within(
        &self,
        root: &Url,
        seeds: &SeedSet,
        budget: Duration,
    ) -> Result<CrawlReport> {
        let start = Instant::now();
        let scope = CrawlScope::new(root, &self.config);
        let mut state = CrawlState::default();

        let seeded = seeds
            .sitemap
            .iter()
            .map(|u| (u, DiscoveredVia::Sitemap))
            .chain(seeds.feed.iter().map(|u| (u, DiscoveredVia::Feed)))
            .chain(std::iter::once((root, DiscoveredVia::Link)));
        for (url, via) in seeded {
            if scope.may_fetch(url) {
                state.enqueue(CrawlTarget::new(url, 0, via));
            }
        }

        info!(
            seeds = state.frontier.len(),
            max_pages = self.config.max_pages,
            max_depth = self.config.max_depth,
            concurrency = self.config.concurrency,
            "starting crawl"
        );

        let timed_out = tokio::time::timeout(budget, self.run(&mut state, &scope, seeds))
            .await
            .is_err();
        if timed_out {
            warn!(
                accepted = state.accepted.len(),
                "crawl deadline reached, returning partial results"
            );
        }

        let report = CrawlReport {
            targets: state.accepted,
            pages_fetched: state.pages_fetched,
            pages_skipped: state.pages_skipped,
            errors: state.errors,
            timed_out,
            duration: start.elapsed(),
        };

        info!(
            accepted = report.targets.len(),
            fetched = report.pages_fetched,
            skipped = report.pages_skipped,
            errors = report.errors.len(),
            duration_ms = report.duration.as_millis(),
            "crawl completed"
        );

        Ok(report)
    }

    async fn run(&self, state: &mut CrawlState, scope: &CrawlScope, seeds: &SeedSet) {
        let max_pages = self.config.max_pages;
        let pool = (self.config.concurrency as usize).max(1);
        let semaphore = Arc::new(Semaphore::new(pool));

        // Waves stay pool-sized near the cap; `absorb` stops accepting at
        // `max_pages`, so at most one wave of surplus fetches is spent.
        while !state.frontier.is_empty() && state.accepted.len() < max_pages {
            let wave_len = state.frontier.len().min(pool);

            let mut wave: Vec<CrawlTarget> = Vec::with_capacity(wave_len);
            for target in state.frontier.drain(..wave_len) {
                if self.config.respect_robots_txt && !seeds.robots.allows_url(&target.url) {
                    debug!(url = %target.url, "disallowed by robots.txt");
                    state.pages_skipped += 1;
                    continue;
                }
                wave.push(target);
            }

            // Tasks are aborted if this future is dropped at the deadline.
            let mut tasks = JoinSet::new();
            for (index, target) in wave.iter().enumerate() {
                let client = self.client.clone();
                let sem = Arc::clone(&semaphore);
                let url = target.url.clone();
                let rate_limit = self.config.rate_limit_ms;

                tasks.spawn(async move {
                    let Ok(_permit) = sem.acquire_owned().await else {
                        return (index, Err("semaphore closed".to_string()));
                    };
                    if rate_limit > 0 {
                        tokio::time::sleep(Duration::from_millis(rate_limit)).await;
                    }
                    (index, visit(&client, &url).await.map_err(|e| e.to_string()))
                });
            }

            let mut results: Vec<Option<std::result::Result<Visit, String>>> =
                (0..wave.len()).map(|_| None).collect();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((index, outcome)) => results[index] = Some(outcome),
                    Err(e) => warn!(error = %e, "crawl task failed"),
                }
            }

            // Aggregate in spawn order.
            for (target, outcome) in wave.into_iter().zip(results) {
                match outcome {
                    Some(Ok(visit)) => self.absorb(state, scope, target, visit),
                    Some(Err(message)) => {
                        debug!(url = %target.url, error = %message, "fetch failed");
                        state.errors.push((target.url.to_string(), message));
                    }
                    None => state
                        .errors
                        .push((target.url.to_string(), "task panicked".to_string())),
                }
            }
        }
    }

    /// Fold one successful visit into the crawl state.
    fn absorb(&self, state: &mut CrawlState, scope: &CrawlScope, target: CrawlTarget, visit: Visit) {
        state.pages_fetched += 1;

        // A redirect off-site means the page is not ours.
        if !scope.may_fetch(&visit.final_url) {
            debug!(url = %target.url, final_url = %visit.final_url, "redirected out of scope");
            return;
        }

        if target.depth < self.config.max_depth {
            for link in visit.links {
                if scope.may_fetch(&link) {
                    state.enqueue(CrawlTarget::new(&link, target.depth + 1, DiscoveredVia::Link));
                }
            }
        }

        if scope.accepts(&target.url) && state.accepted.len() < self.config.max_pages {
            debug!(url = %target.url, via = %target.discovered_via, depth = target.depth, "accepted");
            state.accepted.push(target);
        }
    }
}

/// Fetch one page and collect its outgoing links.
async fn visit(client: &Client, url: &Url) -> Result<Visit> {
    let page = fetch_html(client, url).await?;
    let links = extract_links(&page.body, &page.final_url);
    Ok(Visit {
        final_url: page.final_url,
        links,
    })
}

/// Extract all navigable links from a document, resolved and normalized, in
/// document order without duplicates.
pub fn extract_links(html: &str, base_url: &Url) -> Vec<Url> {
    let doc = Html::parse_document(html);
    let mut seen = HashSet::new();
    doc.select(&LINK_SELECTOR)
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| resolve_link(base_url, href))
        .filter(|url| seen.insert(url.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitekb_discovery::parse_robots;

    fn html_page(body: &str) -> wiremock::ResponseTemplate {
        wiremock::ResponseTemplate::new(200)
            .set_body_raw(format!("<html><body>{body}</body></html>"), "text/html")
    }

    async fn mount(server: &wiremock::MockServer, at: &str, response: wiremock::ResponseTemplate) {
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path(at))
            .respond_with(response)
            .mount(server)
            .await;
    }

    fn config() -> CrawlConfig {
        CrawlConfig {
            max_pages: 50,
            concurrency: 4,
            max_depth: 3,
            timeout_secs: 30,
            request_timeout_secs: 5,
            ..CrawlConfig::default()
        }
    }

    fn paths(report: &CrawlReport) -> Vec<String> {
        report.targets.iter().map(|t| t.url.path().to_string()).collect()
    }

    #[test]
    fn extract_links_resolves_and_dedups() {
        let base = Url::parse("https://ex.com/blog/").unwrap();
        let html = r##"<a href="post-1">1</a><a href="/about/">About</a><a href="post-1#c">again</a>
            <a href="#top">top</a><a href="mailto:x@ex.com">mail</a>"##;
        let links = extract_links(html, &base);
        let links: Vec<&str> = links.iter().map(Url::as_str).collect();
        assert_eq!(links, ["https://ex.com/blog/post-1", "https://ex.com/about"]);
    }

    #[test]
    fn state_first_discovery_wins() {
        let url = Url::parse("https://ex.com/a").unwrap();
        let mut state = CrawlState::default();
        assert!(state.enqueue(CrawlTarget::new(&url, 0, DiscoveredVia::Sitemap)));
        assert!(!state.enqueue(CrawlTarget::new(&url, 1, DiscoveredVia::Link)));
        assert_eq!(state.frontier.len(), 1);
        assert_eq!(state.frontier[0].discovered_via, DiscoveredVia::Sitemap);
    }

    #[tokio::test]
    async fn bfs_follows_links_in_order() {
        let server = wiremock::MockServer::start().await;
        mount(&server, "/", html_page(r#"<a href="/b">b</a><a href="/a">a</a>"#)).await;
        mount(&server, "/a", html_page(r#"<a href="/c">c</a>"#)).await;
        mount(&server, "/b", html_page(r#"<a href="/a">a</a>"#)).await;
        mount(&server, "/c", html_page("leaf")).await;

        let root = Url::parse(&server.uri()).unwrap();
        let crawler = Crawler::new(config()).unwrap();
        let report = crawler.crawl(&root, &SeedSet::default()).await.unwrap();

        assert_eq!(paths(&report), ["/", "/b", "/a", "/c"]);
        assert!(report.targets.iter().all(|t| t.discovered_via == DiscoveredVia::Link));
        assert_eq!(report.targets[3].depth, 2);
    }

    #[tokio::test]
    async fn max_pages_caps_output() {
        let server = wiremock::MockServer::start().await;
        let links: String = (0..20).map(|i| format!(r#"<a href="/p{i}">{i}</a>"#)).collect();
        mount(&server, "/", html_page(&links)).await;
        for i in 0..20 {
            mount(&server, &format!("/p{i}"), html_page("page")).await;
        }

        let root = Url::parse(&server.uri()).unwrap();
        let crawler = Crawler::new(CrawlConfig {
            max_pages: 5,
            ..config()
        })
        .unwrap();
        let report = crawler.crawl(&root, &SeedSet::default()).await.unwrap();

        assert_eq!(paths(&report), ["/", "/p0", "/p1", "/p2", "/p3"]);
    }

    #[tokio::test]
    async fn waves_stay_full_when_includes_reject_most_pages() {
        let server = wiremock::MockServer::start().await;
        let links: String = (0..8).map(|i| format!(r#"<a href="/p{i}">{i}</a>"#)).collect();
        mount(&server, "/", html_page(&format!(r#"{links}<a href="/blog/x">x</a>"#))).await;
        for i in 0..8 {
            mount(
                &server,
                &format!("/p{i}"),
                html_page("filler").set_delay(Duration::from_millis(300)),
            )
            .await;
        }
        mount(&server, "/blog/x", html_page("post")).await;

        let root = Url::parse(&server.uri()).unwrap();
        let crawler = Crawler::new(CrawlConfig {
            max_pages: 1,
            concurrency: 8,
            include_patterns: vec!["/blog/".into()],
            ..config()
        })
        .unwrap();
        let start = Instant::now();
        let report = crawler.crawl(&root, &SeedSet::default()).await.unwrap();

        assert_eq!(paths(&report), ["/blog/x"]);
        // Eight delayed pages in one wave, not eight serial waves.
        assert!(start.elapsed() < Duration::from_millis(1500), "took {:?}", start.elapsed());
    }

    #[tokio::test]
    async fn crawl_within_uses_the_given_budget() {
        let server = wiremock::MockServer::start().await;
        mount(&server, "/", html_page("slow").set_delay(Duration::from_secs(5))).await;

        let root = Url::parse(&server.uri()).unwrap();
        let crawler = Crawler::new(config()).unwrap();
        let start = Instant::now();
        let report = crawler
            .crawl_within(&root, &SeedSet::default(), Duration::from_millis(200))
            .await
            .unwrap();

        assert!(report.timed_out);
        assert!(report.targets.is_empty());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn depth_limit_stops_link_following() {
        let server = wiremock::MockServer::start().await;
        mount(&server, "/", html_page(r#"<a href="/one">1</a>"#)).await;
        mount(&server, "/one", html_page(r#"<a href="/two">2</a>"#)).await;
        mount(&server, "/two", html_page("deep")).await;

        let root = Url::parse(&server.uri()).unwrap();
        let crawler = Crawler::new(CrawlConfig {
            max_depth: 1,
            ..config()
        })
        .unwrap();
        let report = crawler.crawl(&root, &SeedSet::default()).await.unwrap();
        assert_eq!(paths(&report), ["/", "/one"]);
    }

    #[tokio::test]
    async fn seeds_come_first_and_keep_their_origin() {
        let server = wiremock::MockServer::start().await;
        let base = Url::parse(&server.uri()).unwrap();
        mount(&server, "/", html_page(r#"<a href="/from-sitemap">dup</a><a href="/linked">l</a>"#))
            .await;
        mount(&server, "/from-sitemap", html_page("s")).await;
        mount(&server, "/from-feed", html_page("f")).await;
        mount(&server, "/linked", html_page("l")).await;

        let seeds = SeedSet {
            sitemap: vec![base.join("/from-sitemap").unwrap(), Url::parse("https://elsewhere.org/x").unwrap()],
            feed: vec![base.join("/from-feed").unwrap(), base.join("/from-sitemap").unwrap()],
            ..SeedSet::default()
        };
        let crawler = Crawler::new(config()).unwrap();
        let report = crawler.crawl(&base, &seeds).await.unwrap();

        let got: Vec<(String, DiscoveredVia)> = report
            .targets
            .iter()
            .map(|t| (t.url.path().to_string(), t.discovered_via))
            .collect();
        assert_eq!(
            got,
            [
                ("/from-sitemap".to_string(), DiscoveredVia::Sitemap),
                ("/from-feed".to_string(), DiscoveredVia::Feed),
                ("/".to_string(), DiscoveredVia::Link),
                ("/linked".to_string(), DiscoveredVia::Link),
            ]
        );
    }

    #[tokio::test]
    async fn failed_and_non_html_pages_are_not_accepted() {
        let server = wiremock::MockServer::start().await;
        mount(
            &server,
            "/",
            html_page(r#"<a href="/missing">m</a><a href="/data">d</a><a href="/ok">ok</a>"#),
        )
        .await;
        mount(
            &server,
            "/data",
            wiremock::ResponseTemplate::new(200).set_body_raw("{}", "application/json"),
        )
        .await;
        mount(&server, "/ok", html_page("fine")).await;

        let root = Url::parse(&server.uri()).unwrap();
        let report = Crawler::new(config())
            .unwrap()
            .crawl(&root, &SeedSet::default())
            .await
            .unwrap();

        assert_eq!(paths(&report), ["/", "/ok"]);
        assert_eq!(report.errors.len(), 2);
    }

    #[tokio::test]
    async fn include_patterns_gate_output_not_traversal() {
        let server = wiremock::MockServer::start().await;
        mount(&server, "/", html_page(r#"<a href="/archive">archive</a>"#)).await;
        mount(&server, "/archive", html_page(r#"<a href="/blog/deep-post">post</a>"#)).await;
        mount(&server, "/blog/deep-post", html_page("content")).await;

        let root = Url::parse(&server.uri()).unwrap();
        let crawler = Crawler::new(CrawlConfig {
            include_patterns: vec!["/blog/".into()],
            ..config()
        })
        .unwrap();
        let report = crawler.crawl(&root, &SeedSet::default()).await.unwrap();
        assert_eq!(paths(&report), ["/blog/deep-post"]);
    }

    #[tokio::test]
    async fn excluded_urls_are_never_fetched() {
        let server = wiremock::MockServer::start().await;
        mount(&server, "/", html_page(r#"<a href="/blog/drafts/x">d</a><a href="/blog/ok">o</a>"#))
            .await;
        mount(&server, "/blog/ok", html_page("ok")).await;
        wiremock::Mock::given(wiremock::matchers::path("/blog/drafts/x"))
            .respond_with(html_page("secret"))
            .expect(0)
            .mount(&server)
            .await;

        let root = Url::parse(&server.uri()).unwrap();
        let crawler = Crawler::new(CrawlConfig {
            include_patterns: vec!["/blog/".into()],
            exclude_patterns: vec!["/drafts/".into()],
            ..config()
        })
        .unwrap();
        let report = crawler.crawl(&root, &SeedSet::default()).await.unwrap();
        assert_eq!(paths(&report), ["/blog/ok"]);
    }

    #[tokio::test]
    async fn robots_disallow_is_honored() {
        let server = wiremock::MockServer::start().await;
        let root = Url::parse(&server.uri()).unwrap();
        mount(&server, "/", html_page(r#"<a href="/private/x">p</a><a href="/public">o</a>"#)).await;
        mount(&server, "/public", html_page("ok")).await;
        mount(&server, "/private/x", html_page("no")).await;

        let seeds = SeedSet {
            robots: parse_robots("User-agent: *\nDisallow: /private\n", &root),
            ..SeedSet::default()
        };
        let report = Crawler::new(config()).unwrap().crawl(&root, &seeds).await.unwrap();
        assert_eq!(paths(&report), ["/", "/public"]);
        assert_eq!(report.pages_skipped, 1);
    }

    #[tokio::test]
    async fn deadline_returns_partial_results() {
        let server = wiremock::MockServer::start().await;
        mount(&server, "/", html_page(r#"<a href="/slow">s</a>"#)).await;
        mount(
            &server,
            "/slow",
            html_page("slow").set_delay(Duration::from_secs(5)),
        )
        .await;

        let root = Url::parse(&server.uri()).unwrap();
        let crawler = Crawler::new(CrawlConfig {
            timeout_secs: 1,
            request_timeout_secs: 10,
            ..config()
        })
        .unwrap();
        let report = crawler.crawl(&root, &SeedSet::default()).await.unwrap();
        assert!(report.timed_out);
        assert_eq!(paths(&report), ["/"]);
    }
}
