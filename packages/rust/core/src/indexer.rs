//! Index builder: embed records in batches and persist a new generation.
//!
//! Every vector is computed before anything is written, so a build that
//! fails part way leaves the published knowledge base exactly as it was.

use sitekb_shared::{
    Corpus, IndexConfig, KbManifest, KnowledgeBase, PageRecord, Result, SiteKbError,
};
use sitekb_storage::KbStore;
use tracing::{info, instrument};

use crate::pipeline::ProgressReporter;
use crate::providers::{EmbeddingProvider, RetryPolicy, embed_with_retry};

/// Text embedded for one record: title and body, truncated to `max_chars`.
pub fn embedding_text(record: &PageRecord, max_chars: usize) -> String {
    let text = format!("{}\n\n{}", record.title, record.content);
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text,
    }
}

/// Batched embedding with retry.
pub struct Indexer<'a> {
    provider: &'a dyn EmbeddingProvider,
    config: IndexConfig,
}

impl<'a> Indexer<'a> {
    pub fn new(provider: &'a dyn EmbeddingProvider, config: IndexConfig) -> Self {
        Self { provider, config }
    }

    /// Build a knowledge base from scratch. Zero records is
    /// [`SiteKbError::NothingExtracted`].
    #[instrument(skip_all, fields(site = %site, records = records.len()))]
    pub async fn build(
        &self,
        site: &str,
        records: Vec<PageRecord>,
        progress: &dyn ProgressReporter,
    ) -> Result<KnowledgeBase> {
        if records.is_empty() {
            return Err(SiteKbError::NothingExtracted {
                site: site.to_string(),
            });
        }
        let embeddings = self.embed_records(&records, None, progress).await?;
        KnowledgeBase::from_parts(site, records, embeddings)
    }

    /// Return `kb` extended with `records`; ids continue from `kb.len()` and
    /// vectors must match the existing dimensionality.
    #[instrument(skip_all, fields(existing = kb.len(), records = records.len()))]
    pub async fn append(
        &self,
        kb: &KnowledgeBase,
        records: Vec<PageRecord>,
        progress: &dyn ProgressReporter,
    ) -> Result<KnowledgeBase> {
        let embeddings = self
            .embed_records(&records, kb.dimensions(), progress)
            .await?;
        let mut next = kb.clone();
        next.extend(records, embeddings)?;
        Ok(next)
    }

    async fn embed_records(
        &self,
        records: &[PageRecord],
        expected_dims: Option<usize>,
        progress: &dyn ProgressReporter,
    ) -> Result<Vec<Vec<f32>>> {
        let texts: Vec<String> = records
            .iter()
            .map(|r| embedding_text(r, self.config.max_input_chars))
            .collect();

        let batch_size = self.config.batch_size.max(1);
        let total_batches = texts.len().div_ceil(batch_size);
        let mut dims = expected_dims;
        let mut out = Vec::with_capacity(texts.len());
        let retry = RetryPolicy::from(&self.config);

        for (batch, chunk) in texts.chunks(batch_size).enumerate() {
            let label = format!("batch {}", batch + 1);
            let vectors = embed_with_retry(self.provider, chunk, &retry, &label).await?;

            for v in &vectors {
                match dims {
                    None => dims = Some(v.len()),
                    Some(d) if d != v.len() => {
                        return Err(SiteKbError::consistency(format!(
                            "embedding dimension mismatch: expected {d}, got {}",
                            v.len()
                        )));
                    }
                    Some(_) => {}
                }
            }
            out.extend(vectors);
            progress.batch_embedded(batch + 1, total_batches);
        }

        info!(vectors = out.len(), batches = total_batches, "embedding complete");
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Persisted build / append
// ---------------------------------------------------------------------------

/// Rebuild the knowledge base in `store` from `corpus` and publish it.
#[instrument(skip_all, fields(site = %corpus.site, items = corpus.len()))]
pub async fn build_and_commit(
    store: &KbStore,
    provider: &dyn EmbeddingProvider,
    config: &IndexConfig,
    corpus: Corpus,
    progress: &dyn ProgressReporter,
) -> Result<KbManifest> {
    let lock = store.lock()?;
    let kb = Indexer::new(provider, config.clone())
        .build(&corpus.site, corpus.items, progress)
        .await?;
    store
        .commit(&lock, &kb, provider.model(), config.keep_generations)
        .await
}

/// Append `records` to the published knowledge base (or start one for
/// `site` if none exists) and publish the result.
#[instrument(skip_all, fields(site = %site, records = records.len()))]
pub async fn append_and_commit(
    store: &KbStore,
    provider: &dyn EmbeddingProvider,
    config: &IndexConfig,
    site: &str,
    records: Vec<PageRecord>,
    progress: &dyn ProgressReporter,
) -> Result<KbManifest> {
    if records.is_empty() {
        return Err(SiteKbError::NothingExtracted {
            site: site.to_string(),
        });
    }

    let lock = store.lock()?;
    let existing = match store.load().await? {
        Some(stored) => {
            if stored.manifest.embedding_model != provider.model() {
                return Err(SiteKbError::consistency(format!(
                    "knowledge base was embedded with {}, not {}",
                    stored.manifest.embedding_model,
                    provider.model()
                )));
            }
            stored.kb
        }
        None => KnowledgeBase::empty(site),
    };

    let kb = Indexer::new(provider, config.clone())
        .append(&existing, records, progress)
        .await?;
    store
        .commit(&lock, &kb, provider.model(), config.keep_generations)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SilentProgress;
    use async_trait::async_trait;
    use sitekb_shared::ContentType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Deterministic fake: vector is (len, vowel count, 1.0) padded to
    /// `dims`. Fails every call numbered in `fail_on` (1-based).
    struct FakeEmbedder {
        calls: AtomicUsize,
        fail_on: Vec<usize>,
        dims: usize,
    }

    impl FakeEmbedder {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on: Vec::new(),
                dims: 3,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FakeEmbedder {
        fn model(&self) -> &str {
            "fake"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on.contains(&call) {
                return Err(SiteKbError::Provider(format!("call {call} refused")));
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let vowels = t.chars().filter(|c| "aeiou".contains(*c)).count();
                    let mut v = vec![t.len() as f32, vowels as f32, 1.0];
                    v.resize(self.dims, 0.5);
                    v
                })
                .collect())
        }
    }

    fn records(n: usize) -> Vec<PageRecord> {
        (0..n)
            .map(|i| PageRecord {
                title: format!("Post {i}"),
                content: format!("Body text number {i}"),
                content_type: ContentType::Blog,
                source_url: format!("https://ex.com/p/{i}"),
            })
            .collect()
    }

    fn config(batch_size: usize) -> IndexConfig {
        IndexConfig {
            batch_size,
            max_attempts: 2,
            backoff_ms: 1,
            request_timeout_secs: 5,
            max_input_chars: 8000,
            keep_generations: 2,
        }
    }

    fn temp_store() -> KbStore {
        let dir = std::env::temp_dir().join(format!("sitekb_indexer_{}", Uuid::now_v7()));
        KbStore::open(&dir).unwrap()
    }

    #[test]
    fn embedding_text_truncates_on_char_boundary() {
        let record = PageRecord {
            title: "Café".into(),
            content: "ünïcödé".into(),
            content_type: ContentType::Other,
            source_url: "https://ex.com".into(),
        };
        assert_eq!(embedding_text(&record, 5), "Café\n");
        assert_eq!(embedding_text(&record, 1000), "Café\n\nünïcödé");
    }

    #[tokio::test]
    async fn build_batches_and_assigns_positions() {
        let provider = FakeEmbedder::new();
        let kb = Indexer::new(&provider, config(2))
            .build("https://ex.com", records(5), &SilentProgress)
            .await
            .unwrap();

        assert_eq!(provider.calls(), 3);
        assert_eq!(kb.len(), 5);
        for (i, entry) in kb.entries().iter().enumerate() {
            assert_eq!(entry.entry_id, i as u64);
            assert_eq!(entry.record.source_url, format!("https://ex.com/p/{i}"));
        }
    }

    #[tokio::test]
    async fn build_from_nothing_is_nothing_extracted() {
        let provider = FakeEmbedder::new();
        let err = Indexer::new(&provider, config(2))
            .build("https://ex.com", Vec::new(), &SilentProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, SiteKbError::NothingExtracted { .. }));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let provider = FakeEmbedder {
            fail_on: vec![1],
            ..FakeEmbedder::new()
        };
        let kb = Indexer::new(&provider, config(10))
            .build("https://ex.com", records(3), &SilentProgress)
            .await
            .unwrap();
        assert_eq!(kb.len(), 3);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn append_continues_ids() {
        let provider = FakeEmbedder::new();
        let indexer = Indexer::new(&provider, config(4));
        let kb = indexer
            .build("https://ex.com", records(2), &SilentProgress)
            .await
            .unwrap();
        let extra = records(4).split_off(2);
        let grown = indexer.append(&kb, extra, &SilentProgress).await.unwrap();

        assert_eq!(kb.len(), 2);
        assert_eq!(grown.len(), 4);
        assert_eq!(grown.entries()[3].entry_id, 3);
        assert_eq!(grown.entries()[3].record.source_url, "https://ex.com/p/3");
    }

    #[tokio::test]
    async fn append_rejects_dimension_change() {
        let provider = FakeEmbedder::new();
        let kb = Indexer::new(&provider, config(4))
            .build("https://ex.com", records(2), &SilentProgress)
            .await
            .unwrap();

        let wider = FakeEmbedder {
            dims: 5,
            ..FakeEmbedder::new()
        };
        let err = Indexer::new(&wider, config(4))
            .append(&kb, records(1), &SilentProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, SiteKbError::Consistency { .. }));
        assert!(err.to_string().contains("dimension mismatch"));
    }

    #[tokio::test]
    async fn failed_build_leaves_published_kb_unchanged() {
        let store = temp_store();
        let good = FakeEmbedder::new();
        let published = build_and_commit(
            &store,
            &good,
            &config(2),
            Corpus::new("https://ex.com", records(3)),
            &SilentProgress,
        )
        .await
        .unwrap();

        // three batches of two; the second fails on both attempts
        let flaky = FakeEmbedder {
            fail_on: vec![2, 3],
            ..FakeEmbedder::new()
        };
        let err = build_and_commit(
            &store,
            &flaky,
            &config(2),
            Corpus::new("https://ex.com", records(6)),
            &SilentProgress,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SiteKbError::Provider(_)));
        assert!(err.to_string().contains("batch 2"));
        assert_eq!(flaky.calls(), 3);

        assert_eq!(store.current().unwrap(), Some(published.generation.clone()));
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.kb.len(), 3);
        assert_eq!(store.status().unwrap().generations.len(), 1);
        assert!(!store.status().unwrap().locked);
    }

    #[tokio::test]
    async fn append_and_commit_rejects_other_model() {
        struct OtherModel(FakeEmbedder);

        #[async_trait]
        impl EmbeddingProvider for OtherModel {
            fn model(&self) -> &str {
                "other"
            }

            async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
                self.0.embed(texts).await
            }
        }

        let store = temp_store();
        let published = append_and_commit(
            &store,
            &FakeEmbedder::new(),
            &config(8),
            "https://ex.com",
            records(2),
            &SilentProgress,
        )
        .await
        .unwrap();

        let other = OtherModel(FakeEmbedder::new());
        let err = append_and_commit(&store, &other, &config(8), "https://ex.com", records(1), &SilentProgress)
            .await
            .unwrap_err();

        assert!(matches!(err, SiteKbError::Consistency { .. }));
        assert!(err.to_string().contains("embedded with fake"));
        assert_eq!(other.0.calls(), 0);
        assert_eq!(store.current().unwrap(), Some(published.generation));
        assert_eq!(store.load().await.unwrap().unwrap().kb.len(), 2);
        assert!(!store.status().unwrap().locked);
    }

    #[tokio::test]
    async fn append_and_commit_starts_empty_kb() {
        let store = temp_store();
        let provider = FakeEmbedder::new();
        append_and_commit(&store, &provider, &config(8), "https://ex.com", records(2), &SilentProgress)
            .await
            .unwrap();
        let manifest = append_and_commit(
            &store,
            &provider,
            &config(8),
            "https://ex.com",
            records(1),
            &SilentProgress,
        )
        .await
        .unwrap();

        assert_eq!(manifest.item_count, 3);
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.kb.entries()[2].entry_id, 2);
        assert_eq!(loaded.kb.entries()[2].record.source_url, "https://ex.com/p/0");
    }
}
