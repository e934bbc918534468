pub mod builder;
pub mod store;

use crate::embedding::{EmbeddingError, cosine_similarity};
use crate::schema::ElementKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub use builder::build;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index file {path} is missing")]
    MissingFile { path: PathBuf },
    #[error("could not read or write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("index file {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} index belongs to build {found}, manifest says {expected}")]
    VersionMismatch {
        kind: &'static str,
        expected: String,
        found: String,
    },
    #[error("{kind} index has {vectors} vectors but {ids} identifiers")]
    CountMismatch {
        kind: &'static str,
        vectors: usize,
        ids: usize,
    },
    #[error("{kind} index contains a vector of dimension {found}, expected {expected}")]
    DimensionMismatch {
        kind: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("index was built for a different schema; rebuild it")]
    SchemaChanged,
    #[error("index was built with embedding model {built}, but {configured} is configured")]
    ModelMismatch { built: String, configured: String },
    #[error("{kind} index entry '{identifier}' no longer exists in the schema")]
    StaleIdentifier {
        kind: &'static str,
        identifier: String,
    },
    #[error("failed to embed schema elements: {0}")]
    Embedding(#[from] EmbeddingError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildInfo {
    pub build_id: String,
    pub schema_fingerprint: String,
    pub embedding_model: String,
    pub dimensions: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredHit {
    pub identifier: String,
    pub score: f32,
}

/// Vectors for one kind of schema element, positionally aligned with
/// their identifiers. Immutable once built or loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    kind: ElementKind,
    ids: Vec<String>,
    vectors: Vec<Vec<f32>>,
}

impl VectorIndex {
    pub fn new(kind: ElementKind, ids: Vec<String>, vectors: Vec<Vec<f32>>) -> Self {
        Self { kind, ids, vectors }
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn vectors(&self) -> &[Vec<f32>] {
        &self.vectors
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Exact nearest-neighbour search. Equal scores are ordered by
    /// identifier so the same query always yields the same list.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<ScoredHit> {
        let mut hits: Vec<ScoredHit> = self
            .ids
            .iter()
            .zip(&self.vectors)
            .map(|(id, vector)| ScoredHit {
                identifier: id.clone(),
                score: cosine_similarity(query, vector),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        hits.truncate(k);
        hits
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaIndex {
    pub build: BuildInfo,
    pub tables: VectorIndex,
    pub columns: VectorIndex,
    pub values: VectorIndex,
    pub relationships: VectorIndex,
}

impl SchemaIndex {
    pub fn get(&self, kind: ElementKind) -> &VectorIndex {
        match kind {
            ElementKind::Table => &self.tables,
            ElementKind::Column => &self.columns,
            ElementKind::Value => &self.values,
            ElementKind::Relationship => &self.relationships,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_orders_by_score_then_identifier() {
        let index = VectorIndex::new(
            ElementKind::Column,
            vec!["b.x".into(), "a.x".into(), "c.y".into()],
            vec![vec![1.0, 0.0], vec![1.0, 0.0], vec![0.6, 0.8]],
        );

        let hits = index.search(&[1.0, 0.0], 2);
        let ids: Vec<&str> = hits.iter().map(|h| h.identifier.as_str()).collect();
        assert_eq!(ids, vec!["a.x", "b.x"]);
        assert!(hits[0].score > 0.99);
    }

    #[test]
    fn k_larger_than_index_returns_everything() {
        let index = VectorIndex::new(
            ElementKind::Table,
            vec!["t".into()],
            vec![vec![0.0, 1.0]],
        );
        assert_eq!(index.search(&[0.0, 1.0], 10).len(), 1);
    }
}
