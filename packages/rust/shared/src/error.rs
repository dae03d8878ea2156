//! Error types for SiteKB.
//!
//! Library crates use [`SiteKbError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all SiteKB operations.
#[derive(Debug, thiserror::Error)]
pub enum SiteKbError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error during discovery or extraction.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed sitemap, feed, HTML, or corpus document.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Extracted content was below the minimum length (boilerplate-only page).
    #[error("content too short at {url}: {len} chars (minimum {min})")]
    ContentTooShort { url: String, len: usize, min: usize },

    /// Embedding or answer-generation provider failure.
    #[error("provider error: {0}")]
    Provider(String),

    /// Corpus and index disagree; the knowledge base must not be used.
    #[error("consistency error: {message}")]
    Consistency { message: String },

    /// A run finished without a single usable record.
    #[error("nothing extracted from {site}")]
    NothingExtracted { site: String },

    /// Knowledge base storage error (index database, generation publish).
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad query, dimension mismatch, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// HTML-to-Markdown conversion error.
    #[error("conversion error: {0}")]
    Conversion(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SiteKbError>;

impl SiteKbError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a consistency error from any displayable message.
    pub fn consistency(msg: impl Into<String>) -> Self {
        Self::Consistency {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the failure is local to one URL and the run should continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Parse { .. } | Self::ContentTooShort { .. }
        )
    }
}
