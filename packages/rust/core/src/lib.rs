//! Core pipeline orchestration and domain logic for SiteKB.
//!
//! This crate ties together discovery, extraction, embedding and retrieval
//! into end-to-end workflows (e.g. [`pipeline::scrape`],
//! [`indexer::build_and_commit`], [`retriever::retrieve`]).

pub mod indexer;
pub mod pipeline;
pub mod providers;
pub mod retriever;

pub use indexer::{Indexer, append_and_commit, build_and_commit};
pub use pipeline::{ProgressReporter, ScrapeOutcome, SilentProgress, discover, scrape};
pub use providers::{
    AnthropicGenerator, EmbeddingProvider, GenerationOptions, GenerationProvider, HttpEmbedder,
    RetryPolicy, embed_with_retry,
};
pub use retriever::{Answer, ContextBudget, RetrievedRecord, answer, assemble_context, retrieve};
