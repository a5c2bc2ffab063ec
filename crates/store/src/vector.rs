//! Dense-vector index — redb sidecar with a brute-force in-memory fallback.
//!
//! The sidecar lives at `<vector_dir>/vectors.redb` and maps item id →
//! bincode-encoded `Vec<f32>`. When no directory is configured (or the file
//! cannot be opened) vectors live in a process-local map instead; every
//! retrieval API behaves identically in either mode.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use redb::{Database as RedbDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::{debug, warn};

use crate::error::{EngramError, Result};

/// `item id (str) → bincode(Vec<f32>)`.
const VECTORS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("vectors");

enum Backend {
    Disk(RedbDatabase),
    Memory(HashMap<String, Vec<f32>>),
}

pub struct VectorIndex {
    backend: Mutex<Backend>,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let on_disk = matches!(*self.backend.lock().expect("vector mutex poisoned"), Backend::Disk(_));
        f.debug_struct("VectorIndex").field("on_disk", &on_disk).finish()
    }
}

impl VectorIndex {
    /// Open the sidecar under `dir`, or fall back to the in-memory backend
    /// when `dir` is `None` or the sidecar cannot be opened. Never fails.
    pub fn open(dir: Option<&Path>) -> Self {
        let backend = match dir {
            Some(dir) => match Self::open_disk(dir) {
                Ok(db) => Backend::Disk(db),
                Err(err) => {
                    warn!(?err, dir = %dir.display(), "vector sidecar unavailable — using in-memory index");
                    Backend::Memory(HashMap::new())
                }
            },
            None => Backend::Memory(HashMap::new()),
        };
        Self {
            backend: Mutex::new(backend),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            backend: Mutex::new(Backend::Memory(HashMap::new())),
        }
    }

    fn open_disk(dir: &Path) -> Result<RedbDatabase> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("vectors.redb");
        let db = RedbDatabase::create(&path)
            .map_err(|e| EngramError::Migration(format!("opening vector sidecar: {e}")))?;
        let tx = db
            .begin_write()
            .map_err(|e| EngramError::StorageConflict(e.to_string()))?;
        tx.open_table(VECTORS_TABLE)
            .map_err(|e| EngramError::StorageConflict(e.to_string()))?;
        tx.commit()
            .map_err(|e| EngramError::StorageConflict(e.to_string()))?;
        debug!(path = %path.display(), "vector sidecar open");
        Ok(db)
    }

    pub fn upsert(&self, id: &str, vector: &[f32]) -> Result<()> {
        let mut backend = self.backend.lock().expect("vector mutex poisoned");
        match &mut *backend {
            Backend::Disk(db) => {
                let bytes = bincode::serde::encode_to_vec(vector, bincode::config::standard())
                    .map_err(|e| EngramError::ExtractorMalformed(e.to_string()))?;
                let tx = db
                    .begin_write()
                    .map_err(|e| EngramError::StorageConflict(e.to_string()))?;
                {
                    let mut table = tx
                        .open_table(VECTORS_TABLE)
                        .map_err(|e| EngramError::StorageConflict(e.to_string()))?;
                    table
                        .insert(id, bytes.as_slice())
                        .map_err(|e| EngramError::StorageConflict(e.to_string()))?;
                }
                tx.commit()
                    .map_err(|e| EngramError::StorageConflict(e.to_string()))?;
            }
            Backend::Memory(map) => {
                map.insert(id.to_string(), vector.to_vec());
            }
        }
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let mut backend = self.backend.lock().expect("vector mutex poisoned");
        match &mut *backend {
            Backend::Disk(db) => {
                let tx = db
                    .begin_write()
                    .map_err(|e| EngramError::StorageConflict(e.to_string()))?;
                {
                    let mut table = tx
                        .open_table(VECTORS_TABLE)
                        .map_err(|e| EngramError::StorageConflict(e.to_string()))?;
                    table
                        .remove(id)
                        .map_err(|e| EngramError::StorageConflict(e.to_string()))?;
                }
                tx.commit()
                    .map_err(|e| EngramError::StorageConflict(e.to_string()))?;
            }
            Backend::Memory(map) => {
                map.remove(id);
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        let backend = self.backend.lock().expect("vector mutex poisoned");
        match &*backend {
            Backend::Disk(db) => db
                .begin_read()
                .ok()
                .and_then(|tx| tx.open_table(VECTORS_TABLE).ok())
                .and_then(|t| t.len().ok())
                .unwrap_or(0) as usize,
            Backend::Memory(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Brute-force cosine top-k. Returns `(item id, similarity)` sorted by
    /// descending similarity; items with non-positive similarity are dropped.
    pub fn top_k(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        if query.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let backend = self.backend.lock().expect("vector mutex poisoned");
        let mut scored: Vec<(String, f32)> = match &*backend {
            Backend::Disk(db) => {
                let tx = db
                    .begin_read()
                    .map_err(|e| EngramError::StorageConflict(e.to_string()))?;
                let table = tx
                    .open_table(VECTORS_TABLE)
                    .map_err(|e| EngramError::StorageConflict(e.to_string()))?;
                let mut out = Vec::new();
                for item in table
                    .iter()
                    .map_err(|e| EngramError::StorageConflict(e.to_string()))?
                {
                    let (key, value) =
                        item.map_err(|e| EngramError::StorageConflict(e.to_string()))?;
                    let (vector, _): (Vec<f32>, usize) = bincode::serde::decode_from_slice(
                        value.value(),
                        bincode::config::standard(),
                    )
                    .map_err(|e| EngramError::ExtractorMalformed(e.to_string()))?;
                    let sim = cosine_similarity(query, &vector);
                    if sim > 0.0 {
                        out.push((key.value().to_string(), sim));
                    }
                }
                out
            }
            Backend::Memory(map) => map
                .iter()
                .map(|(id, v)| (id.clone(), cosine_similarity(query, v)))
                .filter(|(_, sim)| *sim > 0.0)
                .collect(),
        };

        scored.sort_by(|(_, a), (_, b)| b.total_cmp(a));
        scored.truncate(k);
        Ok(scored)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_backend_ranks_by_similarity() {
        let index = VectorIndex::in_memory();
        index.upsert("close", &[0.9, 0.1, 0.0]).unwrap();
        index.upsert("far", &[0.0, 0.0, 1.0]).unwrap();
        let hits = index.top_k(&[1.0, 0.0, 0.0], 5).unwrap();
        assert_eq!(hits.len(), 1, "orthogonal vector should be dropped");
        assert_eq!(hits[0].0, "close");
    }

    #[test]
    fn disk_backend_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let index = VectorIndex::open(Some(dir.path()));
        index.upsert("a", &[1.0, 0.0]).unwrap();
        index.upsert("b", &[0.7, 0.7]).unwrap();
        assert_eq!(index.len(), 2);
        let hits = index.top_k(&[1.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].0, "a");
        index.remove("a").unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn unopenable_dir_falls_back_to_memory() {
        // A path under a file cannot be created as a directory.
        let file = tempfile::NamedTempFile::new().unwrap();
        let bad_dir = file.path().join("sub");
        let index = VectorIndex::open(Some(&bad_dir));
        index.upsert("x", &[1.0]).unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
