//! Loading bank data into DuckDB: empty tables from the schema metadata,
//! or tables straight from CSV exports.

pub mod csv;

use crate::schema::SchemaMetadata;
use duckdb::Connection;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

pub use csv::CsvLoader;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),
    #[error("cannot derive a table name from {0}")]
    TableName(PathBuf),
}

/// Creates every table described in the metadata that does not exist yet.
pub fn create_tables(conn: &Connection, metadata: &SchemaMetadata) -> Result<usize, IngestError> {
    let statements = metadata.create_table_statements();
    for statement in &statements {
        conn.execute_batch(statement)?;
    }
    info!("Ensured {} tables exist", statements.len());
    Ok(statements.len())
}
