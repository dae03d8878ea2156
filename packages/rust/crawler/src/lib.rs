//! Same-site crawling and page extraction.
//!
//! - [`engine`] discovers candidate URLs breadth-first from the discovery seeds
//! - [`extract`] fetches accepted targets and converts them to page records
//! - [`scope`] decides what may be fetched and what is returned
//! - [`fetch`] holds the shared HTTP client and HTML fetch

pub mod engine;
pub mod extract;
pub mod fetch;
pub mod scope;

pub use engine::{CrawlReport, Crawler, extract_links};
pub use extract::{ExtractReport, Extractor};
pub use fetch::{FetchedHtml, build_client, fetch_html};
pub use scope::{CrawlScope, compile_pattern};
