use super::IngestError;
use duckdb::Connection;
use std::path::Path;
use tracing::{debug, info};

/// Loads CSV exports into tables named after the files, letting DuckDB
/// infer column types.
pub struct CsvLoader<'a> {
    conn: &'a Connection,
}

impl<'a> CsvLoader<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Loads every `*.csv` in `dir`, in file name order. Returns each table
    /// with its row count.
    pub fn load_dir(&self, dir: &Path) -> Result<Vec<(String, usize)>, IngestError> {
        let entries = std::fs::read_dir(dir).map_err(|source| IngestError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| IngestError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            let is_csv = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
            if is_csv && path.is_file() {
                files.push(path);
            }
        }
        files.sort();

        info!("Loading {} CSV files from {}", files.len(), dir.display());
        files.iter().map(|path| self.load_file(path)).collect()
    }

    /// Replaces the table for one file. Column names are lower-cased.
    pub fn load_file(&self, path: &Path) -> Result<(String, usize), IngestError> {
        let table = table_name(path).ok_or_else(|| IngestError::TableName(path.to_path_buf()))?;
        let source = path.to_string_lossy().replace('\'', "''");

        debug!("Loading {} into {}", path.display(), table);
        self.conn.execute_batch(&format!(
            "CREATE OR REPLACE TABLE \"{}\" AS SELECT * FROM read_csv_auto('{}', normalize_names = true)",
            table, source
        ))?;

        let rows: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\"", table),
            [],
            |row| row.get(0),
        )?;
        info!("Loaded {} rows into {}", rows, table);
        Ok((table, rows.max(0) as usize))
    }
}

/// `Loan-Payments.csv` -> `loanpayments`
fn table_name(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let name: String = stem
        .chars()
        .filter(|c| *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    (!name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
        .then_some(name)
}
