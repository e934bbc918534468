use super::{BuildInfo, IndexError, SchemaIndex, VectorIndex};
use crate::embedding::Embedder;
use crate::schema::{ElementKind, SchemaMetadata};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::info;

/// Embeds every schema element and assembles the four per-kind indexes.
pub async fn build(
    metadata: &SchemaMetadata,
    embedder: &dyn Embedder,
) -> Result<SchemaIndex, IndexError> {
    let elements = metadata.elements();
    let model = embedder.model_id();
    info!(
        "Building schema index over {} elements with {}",
        elements.len(),
        model
    );

    let mut dimensions = None;
    let mut built = Vec::with_capacity(ElementKind::ALL.len());

    for kind in ElementKind::ALL {
        let (ids, texts): (Vec<String>, Vec<String>) = elements
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| (e.identifier.clone(), e.text.clone()))
            .unzip();

        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            embedder.embed_batch(&texts).await?
        };

        for vector in &vectors {
            let expected = *dimensions.get_or_insert(vector.len());
            if vector.len() != expected {
                return Err(IndexError::DimensionMismatch {
                    kind: kind.as_str(),
                    expected,
                    found: vector.len(),
                });
            }
        }

        if vectors.len() != ids.len() {
            return Err(IndexError::CountMismatch {
                kind: kind.as_str(),
                vectors: vectors.len(),
                ids: ids.len(),
            });
        }

        info!("Embedded {} {} elements", ids.len(), kind.as_str());
        built.push(VectorIndex::new(kind, ids, vectors));
    }

    let dimensions = dimensions.unwrap_or(0);
    let schema_fingerprint = metadata.fingerprint();
    let build_id = build_id(&schema_fingerprint, &model, dimensions);

    let mut built = built.into_iter();
    let mut next = |kind: ElementKind| {
        built
            .next()
            .unwrap_or_else(|| VectorIndex::new(kind, Vec::new(), Vec::new()))
    };

    Ok(SchemaIndex {
        tables: next(ElementKind::Table),
        columns: next(ElementKind::Column),
        values: next(ElementKind::Value),
        relationships: next(ElementKind::Relationship),
        build: BuildInfo {
            build_id,
            schema_fingerprint,
            embedding_model: model,
            dimensions,
            created_at: Utc::now(),
        },
    })
}

pub fn build_id(schema_fingerprint: &str, model: &str, dimensions: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(schema_fingerprint.as_bytes());
    hasher.update(b"\n");
    hasher.update(model.as_bytes());
    hasher.update(b"\n");
    hasher.update(dimensions.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::providers::local::LocalEmbedder;
    use crate::schema::banking;

    #[tokio::test]
    async fn every_element_is_indexed_once() {
        let metadata = banking::metadata();
        let embedder = LocalEmbedder::new(64).unwrap();
        let index = build(&metadata, &embedder).await.unwrap();

        let elements = metadata.elements();
        for kind in ElementKind::ALL {
            let expected = elements.iter().filter(|e| e.kind == kind).count();
            assert_eq!(index.get(kind).len(), expected);
            assert_eq!(index.get(kind).kind(), kind);
        }
        assert_eq!(index.build.dimensions, 64);
        assert_eq!(index.build.embedding_model, "local-hashing-64");
        assert_eq!(index.build.schema_fingerprint, metadata.fingerprint());
    }

    #[tokio::test]
    async fn build_id_is_reproducible() {
        let metadata = banking::metadata();
        let embedder = LocalEmbedder::new(32).unwrap();
        let first = build(&metadata, &embedder).await.unwrap();
        let second = build(&metadata, &embedder).await.unwrap();
        assert_eq!(first.build.build_id, second.build.build_id);
        assert_eq!(first.columns, second.columns);
    }
}
