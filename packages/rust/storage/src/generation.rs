//! Writing and verified reading of one generation directory.
//!
//! A generation is the immutable triple `corpus.json`, `index.db` and
//! `manifest.json`. It is written under a temporary name and renamed into
//! place only once all three files are complete.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sitekb_shared::{
    CURRENT_SCHEMA_VERSION, Corpus, GenerationId, KbManifest, KnowledgeBase, Result, SiteKbError,
    sha256_hex,
};
use tracing::{debug, instrument};

use crate::index_db::IndexDb;

pub const CORPUS_FILE: &str = "corpus.json";
pub const INDEX_FILE: &str = "index.db";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Prefix of generation directories still being written.
pub(crate) const PENDING_PREFIX: &str = ".pending-";

/// Write `kb` as a new generation under `generations_dir` and return its
/// manifest. On error the partial directory is removed.
#[instrument(skip_all, fields(items = kb.len()))]
pub(crate) async fn write_generation(
    generations_dir: &Path,
    kb: &KnowledgeBase,
    embedding_model: &str,
) -> Result<KbManifest> {
    let id = GenerationId::new();
    let pending = generations_dir.join(format!("{PENDING_PREFIX}{id}"));
    let final_dir = generations_dir.join(id.to_string());

    let result = write_files(&pending, &id, kb, embedding_model).await;
    let manifest = match result {
        Ok(m) => m,
        Err(e) => {
            let _ = fs::remove_dir_all(&pending);
            return Err(e);
        }
    };

    fs::rename(&pending, &final_dir).map_err(|e| {
        let _ = fs::remove_dir_all(&pending);
        SiteKbError::io(&final_dir, e)
    })?;
    debug!(generation = %id, "generation written");
    Ok(manifest)
}

async fn write_files(
    dir: &Path,
    id: &GenerationId,
    kb: &KnowledgeBase,
    embedding_model: &str,
) -> Result<KbManifest> {
    fs::create_dir_all(dir).map_err(|e| SiteKbError::io(dir, e))?;

    let corpus_json = kb.corpus().to_json()?;
    let corpus_path = dir.join(CORPUS_FILE);
    fs::write(&corpus_path, &corpus_json).map_err(|e| SiteKbError::io(&corpus_path, e))?;

    let index = IndexDb::create(&dir.join(INDEX_FILE)).await?;
    index.write_entries(kb.entries()).await?;
    drop(index);

    let manifest = KbManifest {
        schema_version: CURRENT_SCHEMA_VERSION,
        generation: id.clone(),
        site: kb.site.clone(),
        created_at: Utc::now(),
        item_count: kb.len(),
        dimensions: kb.dimensions().unwrap_or(0),
        embedding_model: embedding_model.to_string(),
        corpus_sha256: sha256_hex(corpus_json.as_bytes()),
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let manifest_json = serde_json::to_string_pretty(&manifest)
        .map_err(|e| SiteKbError::parse(format!("failed to serialize manifest: {e}")))?;
    let manifest_path = dir.join(MANIFEST_FILE);
    fs::write(&manifest_path, manifest_json).map_err(|e| SiteKbError::io(&manifest_path, e))?;

    Ok(manifest)
}

/// Read a generation's manifest only.
pub(crate) fn read_manifest(dir: &Path) -> Result<KbManifest> {
    let path = dir.join(MANIFEST_FILE);
    let json = fs::read_to_string(&path).map_err(|e| SiteKbError::io(&path, e))?;
    serde_json::from_str(&json)
        .map_err(|e| SiteKbError::consistency(format!("invalid manifest {}: {e}", path.display())))
}

/// Load a generation, verifying that corpus, index and manifest agree.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub(crate) async fn read_generation(dir: &Path) -> Result<(KnowledgeBase, KbManifest)> {
    let manifest = read_manifest(dir)?;

    if manifest.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(SiteKbError::consistency(format!(
            "generation {} has schema version {}, newer than supported {}",
            manifest.generation, manifest.schema_version, CURRENT_SCHEMA_VERSION
        )));
    }

    let corpus_path = dir.join(CORPUS_FILE);
    let corpus_json =
        fs::read_to_string(&corpus_path).map_err(|e| SiteKbError::io(&corpus_path, e))?;
    let hash = sha256_hex(corpus_json.as_bytes());
    if hash != manifest.corpus_sha256 {
        return Err(SiteKbError::consistency(format!(
            "corpus hash {hash} does not match manifest {}",
            manifest.corpus_sha256
        )));
    }

    let corpus = Corpus::from_json(&corpus_json)?;
    if corpus.len() != manifest.item_count {
        return Err(SiteKbError::consistency(format!(
            "corpus has {} items, manifest says {}",
            corpus.len(),
            manifest.item_count
        )));
    }
    if corpus.site != manifest.site {
        return Err(SiteKbError::consistency(format!(
            "corpus site {} differs from manifest site {}",
            corpus.site, manifest.site
        )));
    }

    let index = IndexDb::open_existing(&dir.join(INDEX_FILE)).await?;
    let rows = index.read_entries().await?;
    if rows.len() != corpus.len() {
        return Err(SiteKbError::consistency(format!(
            "index has {} entries, corpus has {} items",
            rows.len(),
            corpus.len()
        )));
    }

    let mut embeddings = Vec::with_capacity(rows.len());
    for (position, (row, record)) in rows.into_iter().zip(&corpus.items).enumerate() {
        if row.entry_id != position as u64 {
            return Err(SiteKbError::consistency(format!(
                "entry id {} at position {position}",
                row.entry_id
            )));
        }
        if row.source_url != record.source_url {
            return Err(SiteKbError::consistency(format!(
                "entry {position} is {} but corpus item is {}",
                row.source_url, record.source_url
            )));
        }
        if row.embedding.len() != manifest.dimensions {
            return Err(SiteKbError::consistency(format!(
                "entry {position} has {} dimensions, manifest says {}",
                row.embedding.len(),
                manifest.dimensions
            )));
        }
        embeddings.push(row.embedding);
    }

    let kb = KnowledgeBase::from_parts(corpus.site, corpus.items, embeddings)?;
    Ok((kb, manifest))
}

/// Completed generation directories, oldest first.
pub(crate) fn list_generations(generations_dir: &Path) -> Result<Vec<(GenerationId, PathBuf)>> {
    if !generations_dir.is_dir() {
        return Ok(Vec::new());
    }

    let entries =
        fs::read_dir(generations_dir).map_err(|e| SiteKbError::io(generations_dir, e))?;
    let mut out: Vec<(GenerationId, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name();
            let id = name.to_str()?.parse::<GenerationId>().ok()?;
            Some((id, entry.path()))
        })
        .collect();
    // UUID v7 sorts by creation time.
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}
