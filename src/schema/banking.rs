//! The banking schema the service ships with.

use super::{SchemaError, SchemaMetadata};

const BANKING_SCHEMA: &str = include_str!("../../assets/banking_schema.json");

/// Parses the built-in banking schema metadata.
pub fn load() -> Result<SchemaMetadata, SchemaError> {
    SchemaMetadata::from_json(BANKING_SCHEMA)
}

#[cfg(test)]
pub fn metadata() -> SchemaMetadata {
    load().expect("built-in banking schema must parse")
}
