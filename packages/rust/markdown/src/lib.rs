//! HTML page → clean Markdown record.
//!
//! [`extract_document`] is a pure function over one fetched page: it strips
//! boilerplate, picks the main content container, converts it to Markdown
//! with `htmd`, runs the cleanup passes, and derives the title, canonical URL
//! and content type. The same input always produces byte-identical output.

mod classify;
mod cleanup;
mod readability;

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use sitekb_shared::{ContentType, PageRecord, Result, SiteKbError, normalize_url, same_site};
use tracing::{debug, instrument};
use url::Url;

pub use classify::{Classification, classify};

/// Tags `htmd` must never emit, even if they survive readability.
const SKIP_TAGS: &[&str] = &["script", "style", "nav", "iframe", "noscript", "svg", "form"];

static OG_TITLE: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"meta[property="og:title"][content]"#).expect("valid selector")
});
static TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("head title, title").expect("valid selector"));
static H1: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1").expect("valid selector"));
static CANONICAL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"link[rel~="canonical"][href]"#).expect("valid selector")
});
static TABLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table").expect("valid selector"));
static TR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").expect("valid selector"));
static TH: LazyLock<Selector> = LazyLock::new(|| Selector::parse("th").expect("valid selector"));
static TD: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").expect("valid selector"));

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Options for [`extract_document`].
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Pages whose Markdown body is shorter than this (in chars) are rejected.
    pub min_content_chars: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            min_content_chars: 200,
        }
    }
}

/// One successfully extracted page.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedPage {
    pub title: String,
    /// Cleaned Markdown body.
    pub content: String,
    pub classification: Classification,
    /// Canonical URL (same-site `rel=canonical`, else the fetched URL).
    pub source_url: Url,
}

impl ExtractedPage {
    pub fn content_type(&self) -> ContentType {
        self.classification.content_type
    }

    pub fn into_record(self) -> PageRecord {
        PageRecord {
            title: self.title,
            content: self.content,
            content_type: self.classification.content_type,
            source_url: self.source_url.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Extract a page record from raw HTML fetched from `url` (the final URL
/// after redirects).
///
/// Fails with [`SiteKbError::ContentTooShort`] when the cleaned body is
/// shorter than `opts.min_content_chars`.
#[instrument(skip_all, fields(url = %url))]
pub fn extract_document(html: &str, url: &Url, opts: &ExtractOptions) -> Result<ExtractedPage> {
    let mut doc = Html::parse_document(html);

    // Metadata is read before boilerplate removal detaches anything.
    let title = page_title(&doc).unwrap_or_else(|| url.to_string());
    let source_url = canonical_url(&doc, url);
    let classification = classify(url, &doc);

    readability::strip_boilerplate(&mut doc);
    let content_html = readability::main_content(&doc)
        .map(|el| el.inner_html())
        .unwrap_or_default();

    let content = convert(&content_html, Some(url))?;
    let len = content.trim().chars().count();

    debug!(
        title = %title,
        chars = len,
        content_type = %classification.content_type,
        confidence = classification.confidence,
        "page extracted"
    );

    if len < opts.min_content_chars {
        return Err(SiteKbError::ContentTooShort {
            url: url.to_string(),
            len,
            min: opts.min_content_chars,
        });
    }

    Ok(ExtractedPage {
        title,
        content,
        classification,
        source_url,
    })
}

/// Convert an HTML fragment to cleaned Markdown. Relative links are
/// resolved against `base_url` when given.
pub fn convert(content_html: &str, base_url: Option<&Url>) -> Result<String> {
    let content_html = preprocess_tables(content_html);

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(SKIP_TAGS.to_vec())
        .build();

    let raw_markdown = converter
        .convert(&content_html)
        .map_err(|e| SiteKbError::Conversion(format!("htmd conversion failed: {e}")))?;

    Ok(cleanup::run_pipeline(&raw_markdown, base_url))
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// `og:title`, then `<title>`, then the first `<h1>`.
fn page_title(doc: &Html) -> Option<String> {
    let og = doc
        .select(&OG_TITLE)
        .filter_map(|m| m.value().attr("content"))
        .map(collapse_whitespace)
        .find(|t| !t.is_empty());

    og.or_else(|| first_text(doc, &TITLE))
        .or_else(|| first_text(doc, &H1))
}

fn first_text(doc: &Html, selector: &Selector) -> Option<String> {
    doc.select(selector)
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .find(|t| !t.is_empty())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A same-site `<link rel="canonical">` wins over the fetched URL.
fn canonical_url(doc: &Html, url: &Url) -> Url {
    doc.select(&CANONICAL)
        .filter_map(|link| link.value().attr("href"))
        .filter_map(|href| url.join(href.trim()).ok())
        .find(|canonical| {
            matches!(canonical.scheme(), "http" | "https") && same_site(url, canonical)
        })
        .map(|canonical| normalize_url(&canonical))
        .unwrap_or_else(|| normalize_url(url))
}

// ---------------------------------------------------------------------------
// Table pre-processing
// ---------------------------------------------------------------------------

/// Replace `<table>` elements with Markdown tables before `htmd` runs.
///
/// `htmd` 0.1 doesn't convert tables, so each one is rendered here and
/// spliced back in as a paragraph whose rows are separated by `<br>`.
fn preprocess_tables(html: &str) -> String {
    let doc = Html::parse_fragment(html);
    let mut result = html.to_string();

    for table in doc.root_element().select(&TABLE) {
        // nested tables are flattened into their outer table's cells
        if table
            .ancestors()
            .any(|n| n.value().as_element().is_some_and(|e| e.name() == "table"))
        {
            continue;
        }
        let rendered = table_to_markdown(&table);
        result = result.replacen(&table.html(), &rendered, 1);
    }

    result
}

fn table_to_markdown(table: &ElementRef<'_>) -> String {
    let cell_text = |cell: ElementRef<'_>| {
        collapse_whitespace(&cell.text().collect::<String>()).replace('|', "\\|")
    };

    let mut rows: Vec<Vec<String>> = Vec::new();
    for tr in table.select(&TR) {
        let headers: Vec<String> = tr.select(&TH).map(cell_text).collect();
        if !headers.is_empty() && rows.is_empty() {
            rows.push(headers);
            continue;
        }
        let cells: Vec<String> = tr.select(&TD).map(cell_text).collect();
        if !cells.is_empty() {
            rows.push(cells);
        }
    }

    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    if width == 0 {
        return String::new();
    }
    for row in &mut rows {
        row.resize(width, String::new());
    }

    // Without a <th> row the first data row doubles as the header.
    let mut lines = vec![render_row(&rows[0]), render_row(&vec!["---".to_string(); width])];
    lines.extend(rows[1..].iter().map(|row| render_row(row)));

    format!("<p>{}</p>", lines.join("<br>"))
}

fn render_row(cells: &[String]) -> String {
    let escaped: Vec<String> = cells.iter().map(|c| escape_html(c)).collect();
    format!("| {} |", escaped.join(" | "))
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
