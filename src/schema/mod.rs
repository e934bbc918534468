pub mod banking;
pub mod synonyms;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use synonyms::SynonymMap;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("could not read schema metadata {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("schema metadata is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("schema metadata is inconsistent: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub possible_values: Vec<String>,
    /// synonym -> canonical value
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub value_mappings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub columns: Vec<ColumnMetadata>,
}

impl TableMetadata {
    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relationship {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
    #[serde(default)]
    pub description: String,
}

impl Relationship {
    pub fn identifier(&self) -> String {
        format!(
            "{}.{}->{}.{}",
            self.from_table, self.from_column, self.to_table, self.to_column
        )
    }

    pub fn join_hint(&self) -> String {
        format!(
            "{}.{} = {}.{}",
            self.from_table, self.from_column, self.to_table, self.to_column
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaMetadata {
    pub tables: Vec<TableMetadata>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Table,
    Column,
    Value,
    Relationship,
}

impl ElementKind {
    pub const ALL: [ElementKind; 4] = [
        ElementKind::Table,
        ElementKind::Column,
        ElementKind::Value,
        ElementKind::Relationship,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Table => "table",
            ElementKind::Column => "column",
            ElementKind::Value => "value",
            ElementKind::Relationship => "relationship",
        }
    }
}

/// One indexable unit of schema knowledge.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaElement {
    pub kind: ElementKind,
    pub identifier: String,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

impl SchemaMetadata {
    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let raw = std::fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, SchemaError> {
        let metadata: SchemaMetadata = serde_json::from_str(raw)?;
        metadata.check()?;
        Ok(metadata)
    }

    fn check(&self) -> Result<(), SchemaError> {
        if self.tables.is_empty() {
            return Err(SchemaError::Invalid("no tables defined".to_string()));
        }

        let mut seen = HashSet::new();
        for table in &self.tables {
            if !seen.insert(table.name.to_lowercase()) {
                return Err(SchemaError::Invalid(format!(
                    "table '{}' is defined twice",
                    table.name
                )));
            }
            let mut columns = HashSet::new();
            for column in &table.columns {
                if !columns.insert(column.name.to_lowercase()) {
                    return Err(SchemaError::Invalid(format!(
                        "column '{}.{}' is defined twice",
                        table.name, column.name
                    )));
                }
            }
        }

        for rel in &self.relationships {
            if !self.has_column(&rel.from_table, &rel.from_column)
                || !self.has_column(&rel.to_table, &rel.to_column)
            {
                return Err(SchemaError::Invalid(format!(
                    "relationship {} references an unknown column",
                    rel.identifier()
                )));
            }
        }

        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<&TableMetadata> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&ColumnMetadata> {
        self.table(table).and_then(|t| t.column(column))
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.column(table, column).is_some()
    }

    pub fn column_names(&self, table: &str) -> Vec<&str> {
        self.table(table)
            .map(|t| t.columns.iter().map(|c| c.name.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn synonym_map(&self) -> SynonymMap {
        SynonymMap::from_metadata(self)
    }

    /// Relationships whose two endpoints both lie in `tables`.
    pub fn relationships_between<'a>(&'a self, tables: &[String]) -> Vec<&'a Relationship> {
        let within = |name: &str| tables.iter().any(|t| t.eq_ignore_ascii_case(name));
        self.relationships
            .iter()
            .filter(|r| within(&r.from_table) && within(&r.to_table))
            .collect()
    }

    /// SHA-256 over the canonical JSON form; changes whenever any table,
    /// column, value list or relationship changes.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(canonical.as_bytes()))
    }

    /// Whether an index identifier of the given kind still names something
    /// in this schema.
    pub fn resolves(&self, kind: ElementKind, identifier: &str) -> bool {
        match kind {
            ElementKind::Table => self.has_table(identifier),
            ElementKind::Column => identifier
                .split_once('.')
                .is_some_and(|(t, c)| self.has_column(t, c)),
            ElementKind::Value => parse_value_identifier(identifier).is_some_and(
                |(t, c, v)| {
                    self.column(t, c)
                        .is_some_and(|col| col.possible_values.iter().any(|p| p == v))
                },
            ),
            ElementKind::Relationship => self
                .relationships
                .iter()
                .any(|r| r.identifier() == identifier),
        }
    }

    /// Derives every indexable element. The order is stable for a given
    /// metadata file, which keeps index builds reproducible.
    pub fn elements(&self) -> Vec<SchemaElement> {
        let mut elements = Vec::new();

        for table in &self.tables {
            let columns = table
                .columns
                .iter()
                .map(|c| format!("{} ({})", c.name, c.description))
                .collect::<Vec<_>>()
                .join(", ");
            elements.push(SchemaElement {
                kind: ElementKind::Table,
                identifier: table.name.clone(),
                text: format!(
                    "Table: {}. Description: {} Columns: {}",
                    table.name, table.description, columns
                ),
                metadata: BTreeMap::from([("table".to_string(), table.name.clone())]),
            });
        }

        for table in &self.tables {
            for column in &table.columns {
                elements.push(SchemaElement {
                    kind: ElementKind::Column,
                    identifier: format!("{}.{}", table.name, column.name),
                    text: format!(
                        "{}.{} ({}): {}",
                        table.name, column.name, column.data_type, column.description
                    ),
                    metadata: BTreeMap::from([
                        ("table".to_string(), table.name.clone()),
                        ("column".to_string(), column.name.clone()),
                        ("type".to_string(), column.data_type.clone()),
                    ]),
                });
            }
        }

        for table in &self.tables {
            for column in &table.columns {
                for value in &column.possible_values {
                    let synonyms = column
                        .value_mappings
                        .iter()
                        .filter(|(_, canonical)| *canonical == value)
                        .map(|(synonym, _)| synonym.as_str())
                        .collect::<Vec<_>>();
                    let mut text = format!(
                        "{}.{} = '{}': {}",
                        table.name, column.name, value, column.description
                    );
                    if !synonyms.is_empty() {
                        text.push_str(&format!(". Also called: {}", synonyms.join(", ")));
                    }
                    elements.push(SchemaElement {
                        kind: ElementKind::Value,
                        identifier: format!("{}.{}={}", table.name, column.name, value),
                        text,
                        metadata: BTreeMap::from([
                            ("table".to_string(), table.name.clone()),
                            ("column".to_string(), column.name.clone()),
                            ("value".to_string(), value.clone()),
                        ]),
                    });
                }
            }
        }

        for rel in &self.relationships {
            elements.push(SchemaElement {
                kind: ElementKind::Relationship,
                identifier: rel.identifier(),
                text: format!(
                    "Relationship: {}.{} -> {}.{}. {}",
                    rel.from_table, rel.from_column, rel.to_table, rel.to_column, rel.description
                ),
                metadata: BTreeMap::from([
                    ("from_table".to_string(), rel.from_table.clone()),
                    ("from_column".to_string(), rel.from_column.clone()),
                    ("to_table".to_string(), rel.to_table.clone()),
                    ("to_column".to_string(), rel.to_column.clone()),
                ]),
            });
        }

        elements
    }

    /// DDL for empty tables matching the metadata.
    pub fn create_table_statements(&self) -> Vec<String> {
        self.tables
            .iter()
            .map(|table| {
                let columns = table
                    .columns
                    .iter()
                    .map(|c| format!("\"{}\" {}", c.name, c.data_type))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("CREATE TABLE IF NOT EXISTS \"{}\" ({})", table.name, columns)
            })
            .collect()
    }
}

/// Splits `table.column=value`.
pub fn parse_value_identifier(identifier: &str) -> Option<(&str, &str, &str)> {
    let (qualified, value) = identifier.split_once('=')?;
    let (table, column) = qualified.split_once('.')?;
    Some((table, column, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_ignore_case() {
        let schema = banking::metadata();
        assert!(schema.has_table("Customers"));
        assert!(schema.has_column("LOANS", "Loan_Id"));
        assert!(!schema.has_column("loans", "branch_id"));
        assert_eq!(
            schema.column_names("loan_types"),
            vec!["loan_type_id", "loan_type", "interest_rate", "description"]
        );
    }

    #[test]
    fn elements_cover_every_kind_and_resolve() {
        let schema = banking::metadata();
        let elements = schema.elements();

        for kind in ElementKind::ALL {
            assert!(elements.iter().any(|e| e.kind == kind), "no {:?}", kind);
        }
        for element in &elements {
            assert!(
                schema.resolves(element.kind, &element.identifier),
                "{} does not resolve",
                element.identifier
            );
        }

        let phone = elements
            .iter()
            .find(|e| e.identifier == "customers.phone_number")
            .unwrap();
        assert_eq!(
            phone.text,
            "customers.phone_number (VARCHAR): Customer phone number"
        );

        let savings = elements
            .iter()
            .find(|e| e.identifier == "account_types.account_type_name=Savings")
            .unwrap();
        assert!(savings.text.contains("savings account"));
    }

    #[test]
    fn fingerprint_tracks_content() {
        let schema = banking::metadata();
        let mut changed = schema.clone();
        changed.tables[0].columns.pop();

        assert_eq!(schema.fingerprint(), banking::metadata().fingerprint());
        assert_ne!(schema.fingerprint(), changed.fingerprint());
    }

    #[test]
    fn dangling_relationship_is_rejected() {
        let raw = r#"{
            "tables": [{"name": "a", "columns": [{"name": "id", "type": "INTEGER"}]}],
            "relationships": [{"from_table": "a", "from_column": "id", "to_table": "b", "to_column": "id"}]
        }"#;
        assert!(matches!(
            SchemaMetadata::from_json(raw),
            Err(SchemaError::Invalid(_))
        ));
    }

    #[test]
    fn ddl_quotes_identifiers() {
        let schema = banking::metadata();
        let ddl = schema.create_table_statements();
        assert_eq!(ddl.len(), schema.tables.len());
        assert!(ddl[0].starts_with("CREATE TABLE IF NOT EXISTS \"customers\" (\"customer_id\" INTEGER"));
    }
}
