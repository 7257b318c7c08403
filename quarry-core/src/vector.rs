//! Nearest-neighbour index over chunk embeddings

use crate::safety::write_atomic;
use crate::{QuarryError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Vector index keyed by the dense per-project `vector_id`.
pub trait VectorIndex: Send {
    fn dimension(&self) -> usize;

    /// Replace the whole contents. Vectors of the wrong dimension are rejected.
    fn rebuild(&mut self, vectors: Vec<(i64, Vec<f32>)>) -> Result<()>;

    /// Top `k` by cosine similarity, best first.
    fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub vector_id: i64,
    pub score: f32,
}

/// Brute-force cosine index persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatVectorIndex {
    dimension: usize,
    entries: Vec<(i64, Vec<f32>)>,
}

impl FlatVectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            entries: Vec::new(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(self)?;
        write_atomic(path, &json)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }

    pub fn ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.entries.iter().map(|(id, _)| *id)
    }
}

impl VectorIndex for FlatVectorIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn rebuild(&mut self, vectors: Vec<(i64, Vec<f32>)>) -> Result<()> {
        if let Some((id, v)) = vectors.iter().find(|(_, v)| v.len() != self.dimension) {
            return Err(QuarryError::InvalidRequest(format!(
                "vector {id} has dimension {}, index expects {}",
                v.len(),
                self.dimension
            )));
        }
        self.entries = vectors
            .into_iter()
            .map(|(id, v)| (id, normalize(v)))
            .collect();
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        if query.len() != self.dimension || k == 0 {
            return Vec::new();
        }
        let query = normalize(query.to_vec());
        let mut hits: Vec<SearchHit> = self
            .entries
            .iter()
            .map(|(id, v)| SearchHit {
                vector_id: *id,
                score: dot(&query, v),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        hits
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = dot(&v, &v).sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Little-endian f32 bytes, the `chunks.embedding_vector` format.
pub fn encode_vector(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

pub fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_orders_by_cosine() {
        let mut index = FlatVectorIndex::new(2);
        index
            .rebuild(vec![(0, vec![1.0, 0.0]), (1, vec![0.0, 1.0]), (2, vec![1.0, 1.0])])
            .unwrap();

        let hits = index.search(&[1.0, 0.1], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].vector_id, 0);
        assert_eq!(hits[1].vector_id, 2);
    }

    #[test]
    fn rebuild_rejects_wrong_dimension() {
        let mut index = FlatVectorIndex::new(3);
        assert!(index.rebuild(vec![(0, vec![1.0, 2.0])]).is_err());
        assert!(index.is_empty());
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("vectors").join("p.json");
        let mut index = FlatVectorIndex::new(2);
        index.rebuild(vec![(0, vec![3.0, 4.0])]).unwrap();
        index.save(&path).unwrap();

        let loaded = FlatVectorIndex::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.ids().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn blob_encoding_is_little_endian_f32() {
        let bytes = encode_vector(&[1.0, -2.5]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
        assert_eq!(decode_vector(&bytes).unwrap(), vec![1.0, -2.5]);
        assert!(decode_vector(&bytes[..3]).is_none());
    }
}
