//! Generation-based on-disk knowledge base store (libSQL index).
//!
//! ```text
//! <kb>/
//! ├── CURRENT              # id of the published generation
//! ├── .lock                # present while a writer is active
//! └── generations/<id>/    # corpus.json, index.db, manifest.json
//! ```
//!
//! **Access rules:**
//! - Writers take the [`KbLock`], write a complete generation, then publish it
//!   by atomically replacing `CURRENT` via [`KbStore::commit`]
//! - Readers only follow `CURRENT`, so they never see a partial generation

pub mod generation;
pub mod index_db;
pub mod lock;
mod migrations;

use std::fs;
use std::path::{Path, PathBuf};

use sitekb_shared::{GenerationId, KbManifest, KnowledgeBase, Result, SiteKbError};
use tracing::{info, instrument, warn};

pub use generation::{CORPUS_FILE, INDEX_FILE, MANIFEST_FILE};
pub use index_db::{IndexDb, StoredVector};
pub use lock::{KbLock, LOCK_FILE};

/// Name of the pointer file holding the published generation id.
pub const CURRENT_FILE: &str = "CURRENT";
const GENERATIONS_DIR: &str = "generations";

/// A verified, loaded knowledge base and the manifest it was loaded from.
#[derive(Debug, Clone)]
pub struct StoredKb {
    pub kb: KnowledgeBase,
    pub manifest: KbManifest,
}

/// Summary of a KB directory for `status` output.
#[derive(Debug, Clone)]
pub struct KbStatus {
    pub root: PathBuf,
    /// Manifest of the published generation, if any.
    pub current: Option<KbManifest>,
    /// Completed generations on disk, oldest first.
    pub generations: Vec<GenerationId>,
    pub locked: bool,
}

/// Handle on one KB directory.
#[derive(Debug, Clone)]
pub struct KbStore {
    root: PathBuf,
}

impl KbStore {
    /// Open (creating if needed) the KB directory at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let generations = root.join(GENERATIONS_DIR);
        fs::create_dir_all(&generations).map_err(|e| SiteKbError::io(&generations, e))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn generations_dir(&self) -> PathBuf {
        self.root.join(GENERATIONS_DIR)
    }

    /// Take the exclusive writer lock.
    pub fn lock(&self) -> Result<KbLock> {
        KbLock::acquire(&self.root)
    }

    /// The published generation id, `None` for a KB never committed to.
    pub fn current(&self) -> Result<Option<GenerationId>> {
        let path = self.root.join(CURRENT_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SiteKbError::io(&path, e)),
        };
        raw.parse::<GenerationId>().map(Some).map_err(|e| {
            SiteKbError::consistency(format!("{} is corrupt: {e}", path.display()))
        })
    }

    /// Load and verify the published generation. `None` when nothing has
    /// been committed yet.
    #[instrument(skip_all, fields(root = %self.root.display()))]
    pub async fn load(&self) -> Result<Option<StoredKb>> {
        let Some(id) = self.current()? else {
            return Ok(None);
        };
        let dir = self.generations_dir().join(id.to_string());
        if !dir.is_dir() {
            return Err(SiteKbError::consistency(format!(
                "CURRENT names generation {id} but {} does not exist",
                dir.display()
            )));
        }

        let (kb, manifest) = generation::read_generation(&dir).await?;
        if manifest.generation != id {
            return Err(SiteKbError::consistency(format!(
                "manifest in {} names generation {}",
                dir.display(),
                manifest.generation
            )));
        }
        info!(generation = %id, items = kb.len(), "knowledge base loaded");
        Ok(Some(StoredKb { kb, manifest }))
    }

    /// Write `kb` as a new generation, publish it, and prune old generations
    /// down to `keep`. `CURRENT` is only replaced once the generation is
    /// complete on disk.
    #[instrument(skip_all, fields(root = %self.root.display(), items = kb.len()))]
    pub async fn commit(
        &self,
        lock: &KbLock,
        kb: &KnowledgeBase,
        embedding_model: &str,
        keep: usize,
    ) -> Result<KbManifest> {
        self.check_lock(lock)?;

        let manifest =
            generation::write_generation(&self.generations_dir(), kb, embedding_model).await?;
        self.publish(&manifest.generation)?;
        info!(generation = %manifest.generation, items = manifest.item_count, "generation published");

        if let Err(e) = self.prune(lock, keep) {
            warn!(error = %e, "pruning old generations failed");
        }
        Ok(manifest)
    }

    /// Delete all but the newest `keep` generations (never the published
    /// one) and any leftover partial writes. Returns the number removed.
    pub fn prune(&self, lock: &KbLock, keep: usize) -> Result<usize> {
        self.check_lock(lock)?;
        let current = self.current()?;
        let generations = generation::list_generations(&self.generations_dir())?;
        let cutoff = generations.len().saturating_sub(keep.max(1));

        let mut removed = 0;
        for (id, dir) in &generations[..cutoff] {
            if Some(id) == current.as_ref() {
                continue;
            }
            fs::remove_dir_all(dir).map_err(|e| SiteKbError::io(dir, e))?;
            removed += 1;
        }

        let leftovers = fs::read_dir(self.generations_dir())
            .map_err(|e| SiteKbError::io(self.generations_dir(), e))?;
        for entry in leftovers.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(generation::PENDING_PREFIX) {
                fs::remove_dir_all(entry.path()).map_err(|e| SiteKbError::io(entry.path(), e))?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "pruned generations");
        }
        Ok(removed)
    }

    pub fn status(&self) -> Result<KbStatus> {
        let current = match self.current()? {
            Some(id) => Some(generation::read_manifest(
                &self.generations_dir().join(id.to_string()),
            )?),
            None => None,
        };
        let generations = generation::list_generations(&self.generations_dir())?
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        Ok(KbStatus {
            root: self.root.clone(),
            current,
            generations,
            locked: self.root.join(LOCK_FILE).exists(),
        })
    }

    /// Atomically point `CURRENT` at `id`.
    fn publish(&self, id: &GenerationId) -> Result<()> {
        let tmp = self.root.join(format!("{CURRENT_FILE}.tmp"));
        let target = self.root.join(CURRENT_FILE);
        fs::write(&tmp, id.to_string()).map_err(|e| SiteKbError::io(&tmp, e))?;
        fs::rename(&tmp, &target).map_err(|e| SiteKbError::io(&target, e))
    }

    fn check_lock(&self, lock: &KbLock) -> Result<()> {
        if lock.path() != self.root.join(LOCK_FILE) {
            return Err(SiteKbError::Storage(format!(
                "lock {} does not belong to {}",
                lock.path().display(),
                self.root.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitekb_shared::{ContentType, PageRecord};
    use uuid::Uuid;

    fn temp_store() -> KbStore {
        let dir = std::env::temp_dir().join(format!("sitekb_kb_{}", Uuid::now_v7()));
        KbStore::open(&dir).expect("open store")
    }

    fn sample_kb(n: usize) -> KnowledgeBase {
        let records = (0..n)
            .map(|i| PageRecord {
                title: format!("Post {i}"),
                content: format!("Content of post {i}"),
                content_type: ContentType::Blog,
                source_url: format!("https://ex.com/blog/{i}"),
            })
            .collect();
        let embeddings = (0..n).map(|i| vec![i as f32, 1.0, -0.5]).collect();
        KnowledgeBase::from_parts("https://ex.com", records, embeddings).unwrap()
    }

    fn current_dir(store: &KbStore) -> PathBuf {
        let id = store.current().unwrap().unwrap();
        store.generations_dir().join(id.to_string())
    }

    #[tokio::test]
    async fn empty_store_loads_nothing() {
        let store = temp_store();
        assert!(store.current().unwrap().is_none());
        assert!(store.load().await.unwrap().is_none());
        let status = store.status().unwrap();
        assert!(status.current.is_none());
        assert!(status.generations.is_empty());
        assert!(!status.locked);
    }

    #[tokio::test]
    async fn commit_then_load_round_trips() {
        let store = temp_store();
        let kb = sample_kb(3);
        let lock = store.lock().unwrap();
        let manifest = store.commit(&lock, &kb, "test-model", 2).await.expect("commit");
        drop(lock);

        assert_eq!(manifest.item_count, 3);
        assert_eq!(manifest.dimensions, 3);
        assert_eq!(store.current().unwrap(), Some(manifest.generation.clone()));

        let loaded = store.load().await.unwrap().expect("published kb");
        assert_eq!(loaded.kb, kb);
        assert_eq!(loaded.manifest, manifest);
    }

    #[tokio::test]
    async fn tampered_corpus_is_rejected() {
        let store = temp_store();
        let lock = store.lock().unwrap();
        store.commit(&lock, &sample_kb(2), "m", 2).await.unwrap();

        let corpus_path = current_dir(&store).join(CORPUS_FILE);
        let mut json = fs::read_to_string(&corpus_path).unwrap();
        json = json.replace("Post 1", "Post one");
        fs::write(&corpus_path, json).unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, SiteKbError::Consistency { .. }), "{err}");
    }

    #[tokio::test]
    async fn index_with_missing_rows_is_rejected() {
        let store = temp_store();
        let lock = store.lock().unwrap();
        store.commit(&lock, &sample_kb(2), "m", 2).await.unwrap();

        // replace the index with one holding a single row
        let index_path = current_dir(&store).join(INDEX_FILE);
        fs::remove_file(&index_path).unwrap();
        let db = IndexDb::create(&index_path).await.unwrap();
        db.write_entries(&sample_kb(1).entries().to_vec()).await.unwrap();
        drop(db);

        let err = store.load().await.unwrap_err();
        assert!(err.to_string().contains("index has 1 entries"), "{err}");
    }

    #[tokio::test]
    async fn commit_requires_own_lock() {
        let store = temp_store();
        let other = temp_store();
        let foreign = other.lock().unwrap();
        let err = store.commit(&foreign, &sample_kb(1), "m", 2).await.unwrap_err();
        assert!(err.to_string().contains("does not belong"));
        assert!(store.current().unwrap().is_none());
    }

    #[tokio::test]
    async fn prune_keeps_newest_and_removes_pending() {
        let store = temp_store();
        let lock = store.lock().unwrap();
        for n in 1..=4 {
            store.commit(&lock, &sample_kb(n), "m", 10).await.unwrap();
        }
        let pending = store.generations_dir().join(format!("{}x", generation::PENDING_PREFIX));
        fs::create_dir_all(&pending).unwrap();

        let removed = store.prune(&lock, 2).unwrap();
        assert_eq!(removed, 3);
        assert!(!pending.exists());

        let status = store.status().unwrap();
        assert_eq!(status.generations.len(), 2);
        assert!(status.locked);
        let current = status.current.unwrap();
        assert_eq!(current.item_count, 4);
        assert_eq!(status.generations.last(), Some(&current.generation));
    }

    #[tokio::test]
    async fn partial_write_is_invisible_to_readers() {
        let store = temp_store();
        let lock = store.lock().unwrap();
        let published = store.commit(&lock, &sample_kb(2), "m", 2).await.unwrap();

        // a crashed writer leaves a pending directory behind
        let pending = store
            .generations_dir()
            .join(format!("{}{}", generation::PENDING_PREFIX, GenerationId::new()));
        fs::create_dir_all(&pending).unwrap();
        fs::write(pending.join(CORPUS_FILE), "{}").unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.manifest.generation, published.generation);
        assert_eq!(store.status().unwrap().generations.len(), 1);
    }
}
