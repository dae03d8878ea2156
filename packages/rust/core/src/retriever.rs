//! Top-k retrieval by exact cosine similarity, context assembly and answering.

use sitekb_shared::{KnowledgeBase, PageRecord, Query, Result, RetrievalSettings, SiteKbError};
use tracing::{debug, instrument};

use crate::providers::{
    EmbeddingProvider, GenerationOptions, GenerationProvider, RetryPolicy, embed_with_retry,
};

/// A retrieved record with its similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedRecord {
    pub entry_id: u64,
    pub record: PageRecord,
    pub score: f32,
}

/// Limits for [`assemble_context`], in chars.
#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    pub total_chars: usize,
    pub per_record_chars: usize,
}

impl From<&RetrievalSettings> for ContextBudget {
    fn from(settings: &RetrievalSettings) -> Self {
        Self {
            total_chars: settings.context_budget_chars,
            per_record_chars: settings.per_record_chars,
        }
    }
}

/// An answer and the sources it was given.
#[derive(Debug, Clone)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<String>,
}

/// Cosine similarity; `0.0` when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// The `top_k` records most similar to the query, best first. Ties keep
/// corpus order. An empty knowledge base yields nothing without calling the
/// provider. The query is embedded under the same retry policy as indexing.
#[instrument(skip_all, fields(top_k = query.top_k, entries = kb.len()))]
pub async fn retrieve(
    kb: &KnowledgeBase,
    query: &Query,
    provider: &dyn EmbeddingProvider,
    retry: &RetryPolicy,
) -> Result<Vec<RetrievedRecord>> {
    if kb.is_empty() {
        return Ok(Vec::new());
    }

    let mut vectors =
        embed_with_retry(provider, std::slice::from_ref(&query.text), retry, "query").await?;
    let query_vector = match vectors.pop() {
        Some(v) if vectors.is_empty() => v,
        _ => {
            return Err(SiteKbError::Provider(
                "expected exactly one query embedding".into(),
            ));
        }
    };
    if Some(query_vector.len()) != kb.dimensions() {
        return Err(SiteKbError::consistency(format!(
            "query embedding has {} dimensions, index has {}",
            query_vector.len(),
            kb.dimensions().unwrap_or(0)
        )));
    }

    let mut scored: Vec<(u64, f32)> = kb
        .entries()
        .iter()
        .map(|e| (e.entry_id, cosine_similarity(&query_vector, &e.embedding)))
        .collect();
    scored.sort_by(|a, b| rank(b.1).total_cmp(&rank(a.1)).then(a.0.cmp(&b.0)));
    scored.truncate(query.top_k);

    let entries = kb.entries();
    let results: Vec<RetrievedRecord> = scored
        .into_iter()
        .map(|(id, score)| RetrievedRecord {
            entry_id: id,
            record: entries[id as usize].record.clone(),
            score,
        })
        .collect();
    debug!(
        results = results.len(),
        best = results.first().map(|r| r.score),
        "retrieval complete"
    );
    Ok(results)
}

// NaN sorts below every real score.
fn rank(score: f32) -> f32 {
    if score.is_nan() { f32::NEG_INFINITY } else { score }
}

/// Render results as numbered source blocks within `budget`.
///
/// Each record's content is cut at a char boundary to
/// `per_record_chars`; blocks are added in order until the next one would
/// push the total past `total_chars`. A first block that alone exceeds the
/// budget is cut to fit.
pub fn assemble_context(results: &[RetrievedRecord], budget: ContextBudget) -> String {
    render_context(results, budget).0
}

/// The context string and how many leading results made it in.
fn render_context(results: &[RetrievedRecord], budget: ContextBudget) -> (String, usize) {
    const SEPARATOR: &str = "\n\n";

    let mut out = String::new();
    let mut used = 0usize;
    let mut included = 0usize;

    for (i, result) in results.iter().enumerate() {
        let content = truncate_chars(result.record.content.trim(), budget.per_record_chars);
        let block = format!(
            "[{}] {}\nSource: {}\n\n{}",
            i + 1,
            result.record.title,
            result.record.source_url,
            content
        );
        let block_chars = block.chars().count();
        let sep_chars = if out.is_empty() { 0 } else { SEPARATOR.len() };

        if used + sep_chars + block_chars > budget.total_chars {
            if out.is_empty() {
                out.push_str(truncate_chars(&block, budget.total_chars));
                included = 1;
            }
            break;
        }
        if sep_chars > 0 {
            out.push_str(SEPARATOR);
        }
        out.push_str(&block);
        used += sep_chars + block_chars;
        included += 1;
    }
    (out, included)
}

/// Longest prefix of `s` with at most `max` chars.
fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((cut, _)) => &s[..cut],
        None => s,
    }
}

/// Ask `generator` to answer `question` from `results`.
///
/// With no results the generator is not called and a fixed reply is returned.
#[instrument(skip_all, fields(results = results.len()))]
pub async fn answer(
    question: &str,
    results: &[RetrievedRecord],
    generator: &dyn GenerationProvider,
    options: &GenerationOptions,
    budget: ContextBudget,
) -> Result<Answer> {
    if results.is_empty() {
        return Ok(Answer {
            text: "The knowledge base has no content relevant to this question.".into(),
            sources: Vec::new(),
        });
    }

    let (context, included) = render_context(results, budget);
    let text = generator.generate(&context, question, options).await?;
    Ok(Answer {
        text,
        sources: results[..included]
            .iter()
            .map(|r| r.record.source_url.clone())
            .collect(),
    })
}
