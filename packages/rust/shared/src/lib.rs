//! Shared types, error model, and configuration for SiteKB.
//!
//! This crate is the foundation depended on by all other SiteKB crates.
//! It provides:
//! - [`SiteKbError`]: the unified error type
//! - Domain types ([`CrawlTarget`], [`PageRecord`], [`Corpus`], [`KnowledgeBase`], [`Query`])
//! - URL normalization ([`normalize_url`])
//! - Configuration ([`AppConfig`], [`CrawlConfig`], [`IndexConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;
pub mod urls;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CrawlConfig, CrawlPoliciesConfig, DefaultsConfig, EmbeddingSettings,
    GenerationSettings, IndexConfig, RetrievalSettings, config_dir, config_file_path,
    expand_home, init_config, load_config, load_config_from, read_api_key,
};
pub use error::{Result, SiteKbError};
pub use types::{
    CURRENT_SCHEMA_VERSION, ContentType, Corpus, CrawlTarget, DiscoveredVia, GenerationId,
    IndexEntry, KbManifest, KnowledgeBase, PageRecord, Query, sha256_hex,
};
pub use urls::{
    allowed_from, bare_host, is_ssrf_target, normalize_url, parse_normalized, resolve_link,
    same_site,
};
