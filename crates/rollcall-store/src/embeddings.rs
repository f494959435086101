//! Per-student embedding galleries.
//!
//! Vectors are stored as little-endian `f32` blobs. Every vector in the
//! store has the same dimensionality, fixed when the store is constructed.

use crate::db::{now_rfc3339, Database};
use crate::error::{Result, StoreError};
use rollcall_core::{Embedding, Gallery};
use rusqlite::{params, Transaction};

#[derive(Clone)]
pub struct EmbeddingStore {
    db: Database,
    dim: usize,
}

impl EmbeddingStore {
    pub fn new(db: Database, dim: usize) -> Self {
        Self { db, dim }
    }

    pub fn dimensions(&self) -> usize {
        self.dim
    }

    /// Append vectors to a student's gallery; returns the new gallery size.
    ///
    /// Nothing is written if any vector has the wrong length.
    pub async fn enroll(&self, student_id: &str, embeddings: &[Embedding]) -> Result<u32> {
        self.write_gallery(student_id, embeddings, false).await
    }

    /// Replace a student's gallery in one transaction. Readers see either
    /// the old gallery or the new one, never an empty intermediate.
    pub async fn replace(&self, student_id: &str, embeddings: &[Embedding]) -> Result<u32> {
        self.write_gallery(student_id, embeddings, true).await
    }

    /// Snapshot of one student's gallery, in enrollment order.
    pub async fn gallery_for(&self, student_id: &str) -> Result<Vec<Embedding>> {
        let student_id = student_id.to_string();
        let dim = self.dim;
        self.db
            .call("gallery_for", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT vector FROM embeddings WHERE student_id = ?1 ORDER BY id",
                )?;
                let blobs = stmt
                    .query_map([&student_id], |row| row.get::<_, Vec<u8>>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                blobs.iter().map(|b| decode_vector(b, dim)).collect()
            })
            .await
    }

    /// Snapshot of every gallery, ordered by student id.
    pub async fn all_galleries(&self) -> Result<Vec<Gallery>> {
        let dim = self.dim;
        self.db
            .call("all_galleries", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT student_id, vector FROM embeddings ORDER BY student_id, id",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                let mut galleries: Vec<Gallery> = Vec::new();
                for (student_id, blob) in rows {
                    let embedding = decode_vector(&blob, dim)?;
                    match galleries.last_mut() {
                        Some(g) if g.student_id == student_id => g.embeddings.push(embedding),
                        _ => galleries.push(Gallery {
                            student_id,
                            embeddings: vec![embedding],
                        }),
                    }
                }
                Ok(galleries)
            })
            .await
    }

    /// Remove every embedding for a student. Idempotent.
    pub async fn clear(&self, student_id: &str) -> Result<()> {
        let student = student_id.to_string();
        self.db
            .call("clear_gallery", move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM embeddings WHERE student_id = ?1", [&student])?;
                tx.execute(
                    "UPDATE students SET enrollment_count = 0 WHERE student_id = ?1",
                    [&student],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        tracing::info!(student_id, "gallery cleared");
        Ok(())
    }

    async fn write_gallery(
        &self,
        student_id: &str,
        embeddings: &[Embedding],
        replace: bool,
    ) -> Result<u32> {
        if student_id.is_empty() {
            return Err(StoreError::StudentNotFound(String::new()));
        }
        if let Some(bad) = embeddings.iter().find(|e| e.dim() != self.dim) {
            return Err(StoreError::InvalidVector {
                expected: self.dim,
                actual: bad.dim(),
            });
        }

        let student = student_id.to_string();
        let blobs: Vec<Vec<u8>> = embeddings.iter().map(|e| encode_vector(&e.values)).collect();
        let dim = self.dim as i64;

        let total = self
            .db
            .call("write_gallery", move |conn| {
                let tx = conn.transaction()?;
                let total = write_gallery_tx(&tx, &student, &blobs, dim, replace)?;
                tx.commit()?;
                Ok(total)
            })
            .await?;

        tracing::info!(
            student_id,
            added = embeddings.len(),
            total,
            replace,
            "gallery updated"
        );
        Ok(total)
    }
}

fn write_gallery_tx(
    tx: &Transaction<'_>,
    student_id: &str,
    blobs: &[Vec<u8>],
    dim: i64,
    replace: bool,
) -> Result<u32> {
    let exists: bool = tx.query_row(
        "SELECT EXISTS (SELECT 1 FROM students WHERE student_id = ?1)",
        [student_id],
        |r| r.get(0),
    )?;
    if !exists {
        return Err(StoreError::StudentNotFound(student_id.to_string()));
    }

    if replace {
        tx.execute("DELETE FROM embeddings WHERE student_id = ?1", [student_id])?;
    }

    let captured_at = now_rfc3339();
    {
        let mut stmt = tx.prepare(
            "INSERT INTO embeddings (student_id, dim, vector, captured_at) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for blob in blobs {
            stmt.execute(params![student_id, dim, blob, captured_at])?;
        }
    }

    let total: u32 = tx.query_row(
        "SELECT COUNT(*) FROM embeddings WHERE student_id = ?1",
        [student_id],
        |r| r.get(0),
    )?;
    tx.execute(
        "UPDATE students SET enrollment_count = ?2 WHERE student_id = ?1",
        params![student_id, total],
    )?;
    Ok(total)
}

fn encode_vector(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(values));
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn decode_vector(blob: &[u8], dim: usize) -> Result<Embedding> {
    if blob.len() != dim * std::mem::size_of::<f32>() {
        return Err(StoreError::InvalidDbValue(format!(
            "embedding blob is {} bytes, expected {}",
            blob.len(),
            dim * std::mem::size_of::<f32>()
        )));
    }
    let values = blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(Embedding::new(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::students::StudentDirectory;

    async fn store_with(students: &[&str]) -> (EmbeddingStore, StudentDirectory) {
        let db = Database::open_in_memory().await.unwrap();
        let dir = StudentDirectory::new(db.clone());
        for id in students {
            dir.add(id, &format!("Student {id}"), &format!("{id}@u.edu")).await.unwrap();
        }
        (EmbeddingStore::new(db, 3), dir)
    }

    fn e(v: [f32; 3]) -> Embedding {
        Embedding::new(v.to_vec())
    }

    #[tokio::test]
    async fn test_enroll_returns_running_total() {
        let (store, dir) = store_with(&["S1"]).await;
        assert_eq!(store.enroll("S1", &[e([1.0, 0.0, 0.0])]).await.unwrap(), 1);
        assert_eq!(
            store.enroll("S1", &[e([0.0, 1.0, 0.0]), e([0.0, 0.0, 1.0])]).await.unwrap(),
            3
        );
        assert_eq!(dir.get("S1").await.unwrap().unwrap().enrollment_count, 3);
    }

    #[tokio::test]
    async fn test_gallery_preserves_vectors_and_order() {
        let (store, _) = store_with(&["S1"]).await;
        let vectors = [e([0.25, -0.5, 1.5]), e([3.0, 2.0, 1.0])];
        store.enroll("S1", &vectors).await.unwrap();
        assert_eq!(store.gallery_for("S1").await.unwrap(), vectors.to_vec());
    }

    #[tokio::test]
    async fn test_unknown_student_has_empty_gallery() {
        let (store, _) = store_with(&[]).await;
        assert!(store.gallery_for("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejects_whole_batch() {
        let (store, _) = store_with(&["S1"]).await;
        let err = store
            .enroll("S1", &[e([1.0, 0.0, 0.0]), Embedding::new(vec![1.0, 0.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidVector { expected: 3, actual: 2 }));
        assert!(store.gallery_for("S1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enroll_requires_registered_student() {
        let (store, _) = store_with(&[]).await;
        let err = store.enroll("ghost", &[e([1.0, 0.0, 0.0])]).await.unwrap_err();
        assert!(matches!(err, StoreError::StudentNotFound(_)));
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let (store, dir) = store_with(&["S1"]).await;
        store.enroll("S1", &[e([1.0, 0.0, 0.0])]).await.unwrap();
        store.clear("S1").await.unwrap();
        store.clear("S1").await.unwrap();
        store.clear("never-enrolled").await.unwrap();
        assert!(store.gallery_for("S1").await.unwrap().is_empty());
        assert_eq!(dir.get("S1").await.unwrap().unwrap().enrollment_count, 0);
    }

    #[tokio::test]
    async fn test_replace_swaps_gallery() {
        let (store, _) = store_with(&["S1"]).await;
        store.enroll("S1", &[e([1.0, 0.0, 0.0]), e([0.0, 1.0, 0.0])]).await.unwrap();
        let total = store.replace("S1", &[e([0.0, 0.0, 1.0])]).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(store.gallery_for("S1").await.unwrap(), vec![e([0.0, 0.0, 1.0])]);
    }

    #[tokio::test]
    async fn test_all_galleries_grouped_by_student() {
        let (store, _) = store_with(&["S2", "S1"]).await;
        store.enroll("S2", &[e([0.0, 1.0, 0.0])]).await.unwrap();
        store.enroll("S1", &[e([1.0, 0.0, 0.0]), e([1.0, 1.0, 0.0])]).await.unwrap();

        let galleries = store.all_galleries().await.unwrap();
        assert_eq!(galleries.len(), 2);
        assert_eq!(galleries[0].student_id, "S1");
        assert_eq!(galleries[0].embeddings.len(), 2);
        assert_eq!(galleries[1].student_id, "S2");
    }

    #[tokio::test]
    async fn test_galleries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.db");
        {
            let db = Database::open(&path).await.unwrap();
            StudentDirectory::new(db.clone()).add("S1", "A", "a@u.edu").await.unwrap();
            EmbeddingStore::new(db, 3).enroll("S1", &[e([0.5, 0.5, 0.0])]).await.unwrap();
        }
        let db = Database::open(&path).await.unwrap();
        let gallery = EmbeddingStore::new(db, 3).gallery_for("S1").await.unwrap();
        assert_eq!(gallery, vec![e([0.5, 0.5, 0.0])]);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert!(decode_vector(&[0u8; 8], 3).is_err());
        let blob = encode_vector(&[1.0, 2.0, 3.0]);
        assert_eq!(decode_vector(&blob, 3).unwrap().values, vec![1.0, 2.0, 3.0]);
    }
}
