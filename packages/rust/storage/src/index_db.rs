//! libSQL-backed vector table for one generation.
//!
//! The database holds only what is needed to pair vectors with the corpus:
//! the entry id (corpus position), the record's source URL and the embedding.

use std::path::Path;

use libsql::{Connection, Database, params};
use sitekb_shared::{IndexEntry, Result, SiteKbError};
use tracing::info;

use crate::migrations;

/// One row of the `entries` table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredVector {
    pub entry_id: u64,
    pub source_url: String,
    pub embedding: Vec<f32>,
}

/// Handle on a generation's `index.db`.
pub struct IndexDb {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl IndexDb {
    /// Create (or open) the database at `path` and apply migrations.
    pub async fn create(path: &Path) -> Result<Self> {
        let index = Self::connect(path).await?;
        index.run_migrations().await?;
        Ok(index)
    }

    /// Open an existing database. A missing file is a consistency error, not
    /// an empty index.
    pub async fn open_existing(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(SiteKbError::consistency(format!(
                "index database missing: {}",
                path.display()
            )));
        }
        Self::connect(path).await
    }

    async fn connect(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| SiteKbError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| SiteKbError::Storage(e.to_string()))?;

        Ok(Self { db, conn })
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        SiteKbError::Storage(format!("migration v{} failed: {e}", migration.version))
                    })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    async fn schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // table doesn't exist yet
        }
    }

    /// Insert all entries in one transaction.
    pub async fn write_entries(&self, entries: &[IndexEntry]) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| SiteKbError::Storage(e.to_string()))?;

        for entry in entries {
            tx.execute(
                "INSERT INTO entries (entry_id, source_url, embedding) VALUES (?1, ?2, ?3)",
                params![
                    entry.entry_id as i64,
                    entry.record.source_url.as_str(),
                    encode_vector(&entry.embedding)
                ],
            )
            .await
            .map_err(|e| {
                SiteKbError::Storage(format!("insert entry {} failed: {e}", entry.entry_id))
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| SiteKbError::Storage(e.to_string()))?;
        Ok(())
    }

    /// All rows ordered by entry id.
    pub async fn read_entries(&self) -> Result<Vec<StoredVector>> {
        let mut rows = self
            .conn
            .query(
                "SELECT entry_id, source_url, embedding FROM entries ORDER BY entry_id",
                params![],
            )
            .await
            .map_err(|e| SiteKbError::Storage(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| SiteKbError::Storage(e.to_string()))?
        {
            let entry_id: i64 = row.get(0).map_err(|e| SiteKbError::Storage(e.to_string()))?;
            let source_url: String = row.get(1).map_err(|e| SiteKbError::Storage(e.to_string()))?;
            let blob: Vec<u8> = row.get(2).map_err(|e| SiteKbError::Storage(e.to_string()))?;

            let entry_id = u64::try_from(entry_id).map_err(|_| {
                SiteKbError::consistency(format!("negative entry id {entry_id} in index"))
            })?;
            out.push(StoredVector {
                entry_id,
                source_url,
                embedding: decode_vector(&blob)?,
            });
        }
        Ok(out)
    }

    /// Number of rows in the entries table.
    pub async fn count(&self) -> Result<usize> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM entries", params![])
            .await
            .map_err(|e| SiteKbError::Storage(e.to_string()))?;

        match rows.next().await.map_err(|e| SiteKbError::Storage(e.to_string()))? {
            Some(row) => {
                let n: i64 = row.get(0).map_err(|e| SiteKbError::Storage(e.to_string()))?;
                Ok(n.max(0) as usize)
            }
            None => Ok(0),
        }
    }
}

fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(SiteKbError::consistency(format!(
            "embedding blob of {} bytes is not a whole number of f32 values",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitekb_shared::{ContentType, PageRecord};
    use uuid::Uuid;

    fn temp_db() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("sitekb_index_{}.db", Uuid::now_v7()))
    }

    fn entry(id: u64, embedding: Vec<f32>) -> IndexEntry {
        IndexEntry {
            entry_id: id,
            record: PageRecord {
                title: format!("Post {id}"),
                content: "body".into(),
                content_type: ContentType::Blog,
                source_url: format!("https://ex.com/{id}"),
            },
            embedding,
        }
    }

    #[test]
    fn vector_blob_encoding() {
        let v = vec![0.5f32, -1.25, f32::MAX, 0.0];
        assert_eq!(decode_vector(&encode_vector(&v)).unwrap(), v);
        assert!(decode_vector(&[0, 1, 2]).is_err());
    }

    #[tokio::test]
    async fn create_write_and_read_back() {
        let path = temp_db();
        let db = IndexDb::create(&path).await.expect("create");
        db.write_entries(&[entry(0, vec![1.0, 0.0]), entry(1, vec![0.0, 1.0])])
            .await
            .expect("write");
        assert_eq!(db.count().await.unwrap(), 2);
        drop(db);

        let db = IndexDb::open_existing(&path).await.expect("reopen");
        let rows = db.read_entries().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].entry_id, 1);
        assert_eq!(rows[1].source_url, "https://ex.com/1");
        assert_eq!(rows[1].embedding, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let path = temp_db();
        let _db = IndexDb::create(&path).await.unwrap();
        let db2 = IndexDb::create(&path).await.expect("second open");
        assert_eq!(db2.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_entry_id_rolls_back() {
        let path = temp_db();
        let db = IndexDb::create(&path).await.unwrap();
        let result = db
            .write_entries(&[entry(0, vec![1.0]), entry(0, vec![2.0])])
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn missing_file_is_consistency_error() {
        let err = IndexDb::open_existing(&temp_db()).await.err().unwrap();
        assert!(matches!(err, SiteKbError::Consistency { .. }));
    }
}
