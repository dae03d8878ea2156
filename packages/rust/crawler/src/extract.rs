//! Fetch accepted targets and turn them into page records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use sitekb_markdown::{ExtractOptions, extract_document};
use sitekb_shared::{CrawlConfig, CrawlTarget, PageRecord, Result, SiteKbError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::fetch::{build_client, fetch_html};

/// Outcome of extracting a list of targets.
#[derive(Debug, Clone, Default)]
pub struct ExtractReport {
    /// Records in target order; a repeated `source_url` replaces the earlier
    /// record in place.
    pub records: Vec<PageRecord>,
    /// Targets that produced no record, as (URL, reason).
    pub dropped: Vec<(String, String)>,
    /// Dropped because the content was below the minimum length.
    pub too_short: usize,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Fetches pages through the bounded pool and extracts them.
pub struct Extractor {
    client: Client,
    concurrency: usize,
    rate_limit_ms: u64,
    timeout: Duration,
    options: ExtractOptions,
}

impl Extractor {
    pub fn new(config: &CrawlConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.request_timeout_secs)?,
            concurrency: (config.concurrency as usize).max(1),
            rate_limit_ms: config.rate_limit_ms,
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            options: ExtractOptions {
                min_content_chars: config.min_content_chars,
            },
        })
    }

    /// Extract every target, one attempt each. Failures are recorded in
    /// [`ExtractReport::dropped`], never returned as errors.
    ///
    /// `progress` is called after each target with (url, done, total).
    #[instrument(skip_all, fields(targets = targets.len()))]
    pub async fn extract(
        &self,
        targets: &[CrawlTarget],
        mut progress: impl FnMut(&str, usize, usize),
    ) -> ExtractReport {
        let start = Instant::now();
        let mut report = ExtractReport::default();
        let mut positions: HashMap<String, usize> = HashMap::new();

        let run = async {
            let semaphore = Arc::new(Semaphore::new(self.concurrency));
            let mut done = 0;

            for wave in targets.chunks(self.concurrency) {
                let mut tasks = JoinSet::new();
                for (index, target) in wave.iter().enumerate() {
                    let client = self.client.clone();
                    let sem = Arc::clone(&semaphore);
                    let url = target.url.clone();
                    let options = self.options.clone();
                    let rate_limit = self.rate_limit_ms;

                    tasks.spawn(async move {
                        let Ok(_permit) = sem.acquire_owned().await else {
                            return (index, Err(SiteKbError::Network("semaphore closed".into())));
                        };
                        if rate_limit > 0 {
                            tokio::time::sleep(Duration::from_millis(rate_limit)).await;
                        }
                        let outcome = match fetch_html(&client, &url).await {
                            Ok(page) => extract_document(&page.body, &page.final_url, &options)
                                .map(|p| p.into_record()),
                            Err(e) => Err(e),
                        };
                        (index, outcome)
                    });
                }

                let mut results: Vec<Option<Result<PageRecord>>> =
                    (0..wave.len()).map(|_| None).collect();
                while let Some(joined) = tasks.join_next().await {
                    match joined {
                        Ok((index, outcome)) => results[index] = Some(outcome),
                        Err(e) => warn!(error = %e, "extraction task failed"),
                    }
                }

                // Aggregate in spawn order.
                for (target, outcome) in wave.iter().zip(results) {
                    done += 1;
                    let url = target.url.as_str();
                    match outcome {
                        Some(Ok(record)) => {
                            absorb_record(&mut report.records, &mut positions, record);
                        }
                        Some(Err(e)) => {
                            if matches!(e, SiteKbError::ContentTooShort { .. }) {
                                report.too_short += 1;
                            }
                            if e.is_recoverable() {
                                debug!(url, error = %e, "page dropped");
                            } else {
                                warn!(url, error = %e, "page dropped");
                            }
                            report.dropped.push((url.to_string(), e.to_string()));
                        }
                        None => report.dropped.push((url.to_string(), "task panicked".into())),
                    }
                    progress(url, done, targets.len());
                }
            }
        };

        let timed_out = tokio::time::timeout(self.timeout, run).await.is_err();
        report.timed_out = timed_out;
        if timed_out {
            warn!(records = report.records.len(), "extraction deadline reached, returning partial results");
        }
        report.duration = start.elapsed();

        info!(
            records = report.records.len(),
            dropped = report.dropped.len(),
            too_short = report.too_short,
            duration_ms = report.duration.as_millis(),
            "extraction completed"
        );

        report
    }
}

/// Append `record`, or replace the earlier record with the same source URL.
fn absorb_record(
    records: &mut Vec<PageRecord>,
    positions: &mut HashMap<String, usize>,
    record: PageRecord,
) {
    match positions.get(&record.source_url) {
        Some(&at) => {
            debug!(url = %record.source_url, "duplicate source_url, keeping latest");
            records[at] = record;
        }
        None => {
            positions.insert(record.source_url.clone(), records.len());
            records.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitekb_shared::{ContentType, DiscoveredVia};
    use url::Url;

    fn long_article(title: &str) -> String {
        let para = "This paragraph has enough words to count as real article content. ".repeat(5);
        format!(
            "<html><head><title>{title}</title></head><body><nav>Menu</nav>\
             <article><h1>{title}</h1><p>{para}</p></article></body></html>"
        )
    }

    async fn mount_html(server: &wiremock::MockServer, at: &str, body: String) {
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path(at))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_raw(body, "text/html"))
            .mount(server)
            .await;
    }

    fn targets(base: &Url, paths: &[&str]) -> Vec<CrawlTarget> {
        paths
            .iter()
            .map(|p| CrawlTarget::new(&base.join(p).unwrap(), 0, DiscoveredVia::Sitemap))
            .collect()
    }

    fn config() -> CrawlConfig {
        CrawlConfig {
            concurrency: 2,
            request_timeout_secs: 5,
            timeout_secs: 30,
            ..CrawlConfig::default()
        }
    }

    #[test]
    fn duplicate_source_url_replaced_in_place() {
        let rec = |url: &str, title: &str| PageRecord {
            title: title.into(),
            content: "body".into(),
            content_type: ContentType::Other,
            source_url: url.into(),
        };
        let mut records = Vec::new();
        let mut positions = HashMap::new();
        absorb_record(&mut records, &mut positions, rec("https://ex.com/a", "first"));
        absorb_record(&mut records, &mut positions, rec("https://ex.com/b", "b"));
        absorb_record(&mut records, &mut positions, rec("https://ex.com/a", "second"));

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].title, "second");
        assert_eq!(records[1].title, "b");
    }

    #[tokio::test]
    async fn extracts_in_target_order_and_drops_short_pages() {
        let server = wiremock::MockServer::start().await;
        let base = Url::parse(&server.uri()).unwrap();
        mount_html(&server, "/blog/one", long_article("One")).await;
        mount_html(&server, "/blog/two", long_article("Two")).await;
        mount_html(
            &server,
            "/blog/stub",
            "<html><body><main><p>Coming soon.</p></main></body></html>".into(),
        )
        .await;
        mount_html(&server, "/blog/three", long_article("Three")).await;

        let extractor = Extractor::new(&config()).unwrap();
        let list = targets(&base, &["/blog/one", "/blog/two", "/blog/stub", "/blog/three", "/gone"]);
        let mut calls = Vec::new();
        let report = extractor
            .extract(&list, |_, done, total| calls.push((done, total)))
            .await;

        let titles: Vec<&str> = report.records.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, ["One", "Two", "Three"]);
        assert!(report.records.iter().all(|r| r.content_type == ContentType::Blog));
        assert!(report.records.iter().all(|r| !r.content.contains("Menu")));
        assert_eq!(report.too_short, 1);
        assert_eq!(report.dropped.len(), 2);
        assert_eq!(calls.last(), Some(&(5, 5)));
    }

    #[tokio::test]
    async fn canonical_duplicates_collapse() {
        let server = wiremock::MockServer::start().await;
        let base = Url::parse(&server.uri()).unwrap();
        let with_canonical = |title: &str| {
            long_article(title).replace(
                "<head>",
                &format!(r#"<head><link rel="canonical" href="{}/post">"#, server.uri()),
            )
        };
        mount_html(&server, "/post", with_canonical("Original")).await;
        mount_html(&server, "/post-amp", with_canonical("Amp copy")).await;

        let extractor = Extractor::new(&config()).unwrap();
        let report = extractor
            .extract(&targets(&base, &["/post", "/post-amp"]), |_, _, _| {})
            .await;

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].title, "Amp copy");
        assert!(report.records[0].source_url.ends_with("/post"));
    }
}
