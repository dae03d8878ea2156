//! End-to-end pipeline: root URL → discovery → extraction → corpus → index.

use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};
use url::Url;

use sitekb_crawler::{CrawlReport, Crawler, ExtractReport, Extractor};
use sitekb_discovery::{DiscoveryOptions, discover_seeds};
use sitekb_shared::{Corpus, CrawlConfig, IndexConfig, KbManifest, Result, SiteKbError};
use sitekb_storage::KbStore;

use crate::indexer;
use crate::providers::EmbeddingProvider;

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called after each target is extracted (or dropped).
    fn page_extracted(&self, url: &str, current: usize, total: usize);
    /// Called after each embedding batch.
    fn batch_embedded(&self, current: usize, total: usize);
    /// Called once with a one-line summary when a run completes.
    fn done(&self, summary: &str);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn page_extracted(&self, _url: &str, _current: usize, _total: usize) {}
    fn batch_embedded(&self, _current: usize, _total: usize) {}
    fn done(&self, _summary: &str) {}
}

/// Result of [`scrape`].
#[derive(Debug)]
pub struct ScrapeOutcome {
    pub corpus: Corpus,
    pub crawl: CrawlReport,
    pub extract: ExtractReport,
    pub elapsed: Duration,
}

/// Discover candidate pages under `root`.
///
/// Seeds come from robots.txt, sitemaps and feeds; the bounded crawl then
/// returns at most `max_pages` accepted targets in frontier order. Both
/// phases share one `timeout_secs` deadline.
#[instrument(skip_all, fields(url = %root))]
pub async fn discover(root: &Url, config: &CrawlConfig) -> Result<CrawlReport> {
    let start = Instant::now();
    let overall = Duration::from_secs(config.timeout_secs.max(1));
    let opts = DiscoveryOptions {
        timeout_secs: config.request_timeout_secs,
        respect_robots_txt: config.respect_robots_txt,
        deadline: Some(overall),
        ..DiscoveryOptions::default()
    };
    let seeds = discover_seeds(root, &opts).await?;
    if seeds.is_empty() {
        debug!("no sitemap or feed seeds, crawling from the root only");
    } else {
        info!(
            seeds = seeds.len(),
            sitemap = seeds.sitemap.len(),
            feed = seeds.feed.len(),
            "seeds discovered"
        );
    }

    let remaining = overall.saturating_sub(start.elapsed());
    let mut report = Crawler::new(config.clone())?
        .crawl_within(root, &seeds, remaining)
        .await?;
    report.timed_out |= seeds.timed_out;
    report.duration = start.elapsed();
    Ok(report)
}

/// Discover and extract `root` into a corpus.
///
/// Zero usable records is [`SiteKbError::NothingExtracted`].
#[instrument(skip_all, fields(url = %root))]
pub async fn scrape(
    root: &Url,
    config: &CrawlConfig,
    progress: &dyn ProgressReporter,
) -> Result<ScrapeOutcome> {
    let start = Instant::now();

    progress.phase("Discovering pages");
    let crawl = discover(root, config).await?;
    if crawl.timed_out {
        warn!(accepted = crawl.targets.len(), "discovery hit the overall timeout");
    }

    progress.phase("Extracting content");
    let extractor = Extractor::new(config)?;
    let extract = extractor
        .extract(&crawl.targets, |url, current, total| {
            progress.page_extracted(url, current, total)
        })
        .await;

    let site = root.to_string();
    if extract.records.is_empty() {
        return Err(SiteKbError::NothingExtracted { site });
    }

    let corpus = Corpus::new(site, extract.records.clone());
    let elapsed = start.elapsed();
    progress.done(&format!(
        "{} pages extracted from {} discovered ({} dropped)",
        corpus.len(),
        crawl.targets.len(),
        extract.dropped.len()
    ));
    info!(
        records = corpus.len(),
        discovered = crawl.targets.len(),
        dropped = extract.dropped.len(),
        elapsed_ms = elapsed.as_millis(),
        "scrape complete"
    );

    Ok(ScrapeOutcome {
        corpus,
        crawl,
        extract,
        elapsed,
    })
}

/// Scrape `root` and append the records to the knowledge base in `store`.
#[instrument(skip_all, fields(url = %root))]
pub async fn scrape_and_append(
    root: &Url,
    crawl_config: &CrawlConfig,
    index_config: &IndexConfig,
    store: &KbStore,
    provider: &dyn EmbeddingProvider,
    progress: &dyn ProgressReporter,
) -> Result<(ScrapeOutcome, KbManifest)> {
    let outcome = scrape(root, crawl_config, progress).await?;

    progress.phase("Embedding and indexing");
    let manifest = indexer::append_and_commit(
        store,
        provider,
        index_config,
        &outcome.corpus.site,
        outcome.corpus.items.clone(),
        progress,
    )
    .await?;

    progress.done(&format!(
        "knowledge base now holds {} records (generation {})",
        manifest.item_count, manifest.generation
    ));
    Ok((outcome, manifest))
}
