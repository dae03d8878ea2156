//! Core domain types for SiteKB knowledge bases.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

use crate::error::{Result, SiteKbError};

/// Current schema version for the generation manifest format.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// CrawlTarget
// ---------------------------------------------------------------------------

/// How a crawl target was first found. Declaration order is precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveredVia {
    Sitemap,
    Feed,
    Link,
}

impl fmt::Display for DiscoveredVia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sitemap => "sitemap",
            Self::Feed => "feed",
            Self::Link => "link",
        };
        f.write_str(s)
    }
}

/// A candidate page produced by discovery. Identity is the normalized URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlTarget {
    /// Normalized URL (see [`crate::urls::normalize_url`]).
    pub url: Url,
    /// BFS depth; sitemap/feed seeds and the root are depth 0.
    pub depth: u32,
    /// First signal that produced this URL.
    pub discovered_via: DiscoveredVia,
}

impl CrawlTarget {
    /// Create a target, normalizing the URL.
    pub fn new(url: &Url, depth: u32, discovered_via: DiscoveredVia) -> Self {
        Self {
            url: crate::urls::normalize_url(url),
            depth,
            discovered_via,
        }
    }

    /// Dedup key.
    pub fn key(&self) -> &str {
        self.url.as_str()
    }
}

// ---------------------------------------------------------------------------
// PageRecord
// ---------------------------------------------------------------------------

/// Classified kind of an extracted page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Blog,
    PodcastTranscript,
    CallTranscript,
    LinkedinPost,
    RedditComment,
    Book,
    #[default]
    Other,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blog => "blog",
            Self::PodcastTranscript => "podcast_transcript",
            Self::CallTranscript => "call_transcript",
            Self::LinkedinPost => "linkedin_post",
            Self::RedditComment => "reddit_comment",
            Self::Book => "book",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One extracted page in the corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRecord {
    pub title: String,
    /// Markdown body, non-empty and de-boilerplated.
    pub content: String,
    pub content_type: ContentType,
    /// Canonical URL of the page; unique within one crawl run.
    pub source_url: String,
}

// ---------------------------------------------------------------------------
// Corpus
// ---------------------------------------------------------------------------

/// The interchange document between extraction and indexing.
///
/// Serialized as `{ "site": ..., "items": [...] }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Corpus {
    pub site: String,
    #[serde(default)]
    pub items: Vec<PageRecord>,
}

impl Corpus {
    pub fn new(site: impl Into<String>, items: Vec<PageRecord>) -> Self {
        Self {
            site: site.into(),
            items,
        }
    }

    /// Parse a corpus JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| SiteKbError::parse(format!("invalid corpus JSON: {e}")))
    }

    /// Serialize to pretty JSON (the on-disk form).
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SiteKbError::parse(format!("failed to serialize corpus: {e}")))
    }

    /// SHA-256 of the serialized corpus, used to pair a corpus with its index.
    pub fn sha256(&self) -> Result<String> {
        let json = self.to_json()?;
        Ok(sha256_hex(json.as_bytes()))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Hex-encoded SHA-256 of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// IndexEntry / KnowledgeBase
// ---------------------------------------------------------------------------

/// A corpus record paired with its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    /// Corpus position; stable within one generation.
    pub entry_id: u64,
    pub record: PageRecord,
    pub embedding: Vec<f32>,
}

/// Records and their vectors, kept in lockstep.
///
/// Entries are stored in corpus order and `entries[i].entry_id == i`, so the
/// corpus is always exactly `entries.iter().map(|e| &e.record)`.
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeBase {
    pub site: String,
    entries: Vec<IndexEntry>,
}

impl KnowledgeBase {
    /// An empty knowledge base for `site`.
    pub fn empty(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            entries: Vec::new(),
        }
    }

    /// Pair records with embeddings position by position.
    pub fn from_parts(
        site: impl Into<String>,
        records: Vec<PageRecord>,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<Self> {
        let mut kb = Self::empty(site);
        kb.extend(records, embeddings)?;
        Ok(kb)
    }

    /// Append records with their embeddings, continuing entry ids.
    pub fn extend(&mut self, records: Vec<PageRecord>, embeddings: Vec<Vec<f32>>) -> Result<()> {
        if records.len() != embeddings.len() {
            return Err(SiteKbError::consistency(format!(
                "{} records but {} embeddings",
                records.len(),
                embeddings.len()
            )));
        }

        let expected_dims = self.dimensions().or_else(|| embeddings.first().map(Vec::len));
        if let Some(dims) = expected_dims {
            if let Some(bad) = embeddings.iter().find(|e| e.len() != dims) {
                return Err(SiteKbError::consistency(format!(
                    "embedding dimension mismatch: expected {dims}, got {}",
                    bad.len()
                )));
            }
        }

        let start = self.entries.len() as u64;
        self.entries.extend(
            records
                .into_iter()
                .zip(embeddings)
                .enumerate()
                .map(|(i, (record, embedding))| IndexEntry {
                    entry_id: start + i as u64,
                    record,
                    embedding,
                }),
        );
        Ok(())
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Records in corpus order.
    pub fn records(&self) -> impl Iterator<Item = &PageRecord> {
        self.entries.iter().map(|e| &e.record)
    }

    /// The corpus document this knowledge base was built from.
    pub fn corpus(&self) -> Corpus {
        Corpus::new(self.site.clone(), self.records().cloned().collect())
    }

    /// Vector dimensionality, `None` when empty.
    pub fn dimensions(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// A retrieval request. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub text: String,
    pub top_k: usize,
}

impl Query {
    pub fn new(text: impl Into<String>, top_k: usize) -> Result<Self> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(SiteKbError::validation("query text is empty"));
        }
        if top_k == 0 {
            return Err(SiteKbError::validation("top_k must be at least 1"));
        }
        Ok(Self { text, top_k })
    }
}

// ---------------------------------------------------------------------------
// Generations
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper naming one immutable on-disk generation (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationId(pub Uuid);

impl GenerationId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for GenerationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for GenerationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

/// The `manifest.json` written into each generation directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KbManifest {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    pub generation: GenerationId,
    /// Root URL the corpus was scraped from.
    pub site: String,
    pub created_at: DateTime<Utc>,
    pub item_count: usize,
    /// Embedding dimensionality (`0` for an empty index).
    pub dimensions: usize,
    pub embedding_model: String,
    /// SHA-256 of `corpus.json` as written.
    pub corpus_sha256: String,
    /// Tool version that wrote this generation.
    pub tool_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: usize) -> PageRecord {
        PageRecord {
            title: format!("Post {n}"),
            content: format!("Body of post {n}"),
            content_type: ContentType::Blog,
            source_url: format!("https://ex.com/blog/{n}"),
        }
    }

    #[test]
    fn content_type_serializes_snake_case() {
        let json = serde_json::to_string(&ContentType::PodcastTranscript).unwrap();
        assert_eq!(json, "\"podcast_transcript\"");
        let parsed: ContentType = serde_json::from_str("\"reddit_comment\"").unwrap();
        assert_eq!(parsed, ContentType::RedditComment);
    }

    #[test]
    fn corpus_fixture_round_trips() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../../fixtures/json/corpus.fixture.json");
        let original = std::fs::read_to_string(path).expect("read fixture");

        let corpus = Corpus::from_json(&original).unwrap();
        assert_eq!(corpus.site, "https://ex.com/blog");
        assert_eq!(corpus.len(), 3);

        let reserialized = corpus.to_json().unwrap();
        let reparsed = Corpus::from_json(&reserialized).unwrap();
        assert_eq!(reparsed, corpus);

        let a: serde_json::Value = serde_json::from_str(&original).unwrap();
        let b: serde_json::Value = serde_json::from_str(&reserialized).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn corpus_rejects_unknown_content_type() {
        let json = r#"{"site":"s","items":[{"title":"t","content":"c","content_type":"video","source_url":"u"}]}"#;
        assert!(Corpus::from_json(json).is_err());
    }

    #[test]
    fn knowledge_base_assigns_positional_ids() {
        let mut kb =
            KnowledgeBase::from_parts("s", vec![record(0), record(1)], vec![vec![1.0, 0.0]; 2])
                .unwrap();
        kb.extend(vec![record(2)], vec![vec![0.0, 1.0]]).unwrap();

        let ids: Vec<u64> = kb.entries().iter().map(|e| e.entry_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(kb.corpus().items[2], record(2));
        assert_eq!(kb.dimensions(), Some(2));
    }

    #[test]
    fn knowledge_base_rejects_mismatched_lengths() {
        let err = KnowledgeBase::from_parts("s", vec![record(0)], vec![]).unwrap_err();
        assert!(matches!(err, SiteKbError::Consistency { .. }));
    }

    #[test]
    fn knowledge_base_rejects_dimension_drift() {
        let mut kb = KnowledgeBase::from_parts("s", vec![record(0)], vec![vec![1.0; 3]]).unwrap();
        let err = kb.extend(vec![record(1)], vec![vec![1.0; 4]]).unwrap_err();
        assert!(matches!(err, SiteKbError::Consistency { .. }));
        assert_eq!(kb.len(), 1);
    }

    #[test]
    fn query_validation() {
        assert!(Query::new("what is rust?", 0).is_err());
        assert!(Query::new("   ", 3).is_err());
        assert_eq!(Query::new("q", 2).unwrap().top_k, 2);
    }

    #[test]
    fn generation_id_roundtrip() {
        let id = GenerationId::new();
        let parsed: GenerationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn discovered_via_precedence() {
        assert!(DiscoveredVia::Sitemap < DiscoveredVia::Feed);
        assert!(DiscoveredVia::Feed < DiscoveredVia::Link);
    }
}
