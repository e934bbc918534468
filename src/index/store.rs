//! On-disk layout of a schema index:
//!
//! ```text
//! <dir>/manifest.json
//! <dir>/<kind>.vectors.json   {build_id, dimensions, vectors}
//! <dir>/<kind>.ids.json       {build_id, ids}
//! ```
//!
//! The id file is the positional map from vector row to schema identifier.

use super::{BuildInfo, IndexError, SchemaIndex, VectorIndex};
use crate::schema::{ElementKind, SchemaMetadata};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const MANIFEST: &str = "manifest.json";

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    #[serde(flatten)]
    build: BuildInfo,
    counts: BTreeMap<ElementKind, usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VectorsFile {
    build_id: String,
    dimensions: usize,
    vectors: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IdsFile {
    build_id: String,
    ids: Vec<String>,
}

fn vectors_path(dir: &Path, kind: ElementKind) -> PathBuf {
    dir.join(format!("{}.vectors.json", kind.as_str()))
}

fn ids_path(dir: &Path, kind: ElementKind) -> PathBuf {
    dir.join(format!("{}.ids.json", kind.as_str()))
}

pub fn save(index: &SchemaIndex, dir: &Path) -> Result<(), IndexError> {
    fs::create_dir_all(dir).map_err(|source| IndexError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let build_id = &index.build.build_id;
    for kind in ElementKind::ALL {
        let vectors = index.get(kind);
        write_json(
            &vectors_path(dir, kind),
            &VectorsFile {
                build_id: build_id.clone(),
                dimensions: index.build.dimensions,
                vectors: vectors.vectors().to_vec(),
            },
        )?;
        write_json(
            &ids_path(dir, kind),
            &IdsFile {
                build_id: build_id.clone(),
                ids: vectors.ids().to_vec(),
            },
        )?;
    }

    // Manifest last: a crash mid-save leaves files that fail the build id check.
    let counts = ElementKind::ALL
        .iter()
        .map(|kind| (*kind, index.get(*kind).len()))
        .collect();
    write_json(
        &dir.join(MANIFEST),
        &Manifest {
            build: index.build.clone(),
            counts,
        },
    )?;

    info!("Saved schema index {} to {}", build_id, dir.display());
    Ok(())
}

/// Loads and cross-checks an index against the current schema metadata.
/// `expected_model`, when given, must match the model the index was built with.
pub fn load(
    dir: &Path,
    metadata: &SchemaMetadata,
    expected_model: Option<&str>,
) -> Result<SchemaIndex, IndexError> {
    let manifest: Manifest = read_json(&dir.join(MANIFEST))?;
    let build = manifest.build;
    debug!("Loading schema index {} from {}", build.build_id, dir.display());

    if let Some(configured) = expected_model {
        if configured != build.embedding_model {
            return Err(IndexError::ModelMismatch {
                built: build.embedding_model,
                configured: configured.to_string(),
            });
        }
    }

    if build.schema_fingerprint != metadata.fingerprint() {
        return Err(IndexError::SchemaChanged);
    }

    let mut loaded = Vec::with_capacity(ElementKind::ALL.len());
    for kind in ElementKind::ALL {
        let name = kind.as_str();
        let vectors: VectorsFile = read_json(&vectors_path(dir, kind))?;
        let ids: IdsFile = read_json(&ids_path(dir, kind))?;

        for found in [&vectors.build_id, &ids.build_id] {
            if *found != build.build_id {
                return Err(IndexError::VersionMismatch {
                    kind: name,
                    expected: build.build_id.clone(),
                    found: found.clone(),
                });
            }
        }

        if vectors.vectors.len() != ids.ids.len() {
            return Err(IndexError::CountMismatch {
                kind: name,
                vectors: vectors.vectors.len(),
                ids: ids.ids.len(),
            });
        }

        if let Some(bad) = vectors
            .vectors
            .iter()
            .map(Vec::len)
            .chain(std::iter::once(vectors.dimensions))
            .find(|d| *d != build.dimensions)
        {
            return Err(IndexError::DimensionMismatch {
                kind: name,
                expected: build.dimensions,
                found: bad,
            });
        }

        if let Some(stale) = ids.ids.iter().find(|id| !metadata.resolves(kind, id)) {
            return Err(IndexError::StaleIdentifier {
                kind: name,
                identifier: stale.clone(),
            });
        }

        loaded.push(VectorIndex::new(kind, ids.ids, vectors.vectors));
    }

    let mut loaded = loaded.into_iter();
    let mut next = |kind: ElementKind| {
        loaded
            .next()
            .unwrap_or_else(|| VectorIndex::new(kind, Vec::new(), Vec::new()))
    };

    info!(
        "Loaded schema index {} ({} dims, model {})",
        build.build_id, build.dimensions, build.embedding_model
    );

    Ok(SchemaIndex {
        tables: next(ElementKind::Table),
        columns: next(ElementKind::Column),
        values: next(ElementKind::Value),
        relationships: next(ElementKind::Relationship),
        build,
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), IndexError> {
    let io_err = |source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = fs::File::create(path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value).map_err(|source| IndexError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;
    writer.flush().map_err(io_err)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, IndexError> {
    if !path.exists() {
        return Err(IndexError::MissingFile {
            path: path.to_path_buf(),
        });
    }
    let file = fs::File::open(path).map_err(|source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| IndexError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}
