use crate::schema::SchemaMetadata;
use duckdb::Connection;
use tracing::{debug, warn};

/// Tables of the main schema as DuckDB reports them.
pub fn live_tables(conn: &Connection) -> Result<Vec<String>, duckdb::Error> {
    let mut stmt = conn.prepare(
        "SELECT table_name FROM information_schema.tables \
         WHERE table_schema = 'main' ORDER BY table_name",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    rows.collect()
}

/// Tables described in the metadata that the database does not have.
/// Questions about them will fail at execution, so startup only warns.
pub fn missing_tables(
    conn: &Connection,
    metadata: &SchemaMetadata,
) -> Result<Vec<String>, duckdb::Error> {
    let live = live_tables(conn)?;
    debug!("Database has {} tables", live.len());

    let missing = metadata
        .tables
        .iter()
        .filter(|t| !live.iter().any(|l| l.eq_ignore_ascii_case(&t.name)))
        .map(|t| t.name.clone())
        .collect::<Vec<_>>();
    for table in &missing {
        warn!("Table {} is described in the schema metadata but missing from the database", table);
    }
    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::banking;

    #[test]
    fn reports_tables_the_database_lacks() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE customers (customer_id INTEGER); CREATE TABLE Branches (branch_id INTEGER);")
            .unwrap();

        let missing = missing_tables(&conn, &banking::metadata()).unwrap();
        assert_eq!(missing.len(), 10);
        assert!(!missing.contains(&"customers".to_string()));
        assert!(!missing.contains(&"branches".to_string()));
        assert!(missing.contains(&"loan_types".to_string()));
    }
}
