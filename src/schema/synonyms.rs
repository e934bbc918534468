use super::SchemaMetadata;
use std::collections::HashMap;

/// Categorical vocabulary per `(table, column)`: lower-cased synonym or
/// canonical spelling -> canonical value.
#[derive(Debug, Clone, Default)]
pub struct SynonymMap {
    entries: HashMap<(String, String), HashMap<String, String>>,
}

impl SynonymMap {
    pub fn from_metadata(metadata: &SchemaMetadata) -> Self {
        let mut entries = HashMap::new();

        for table in &metadata.tables {
            for column in &table.columns {
                if column.possible_values.is_empty() && column.value_mappings.is_empty() {
                    continue;
                }

                let mut vocabulary = HashMap::new();
                for value in &column.possible_values {
                    vocabulary.insert(value.to_lowercase(), value.clone());
                }
                for (synonym, canonical) in &column.value_mappings {
                    vocabulary.insert(synonym.to_lowercase(), canonical.clone());
                }

                entries.insert(
                    (table.name.to_lowercase(), column.name.to_lowercase()),
                    vocabulary,
                );
            }
        }

        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.entries
            .contains_key(&(table.to_lowercase(), column.to_lowercase()))
    }

    /// Canonical value for `literal`, matched case-insensitively.
    pub fn canonical(&self, table: &str, column: &str, literal: &str) -> Option<&str> {
        self.entries
            .get(&(table.to_lowercase(), column.to_lowercase()))
            .and_then(|vocabulary| vocabulary.get(&literal.trim().to_lowercase()))
            .map(String::as_str)
    }

    /// Tables that own a column with the given name and a vocabulary.
    pub fn tables_with_column(&self, column: &str) -> Vec<&str> {
        let column = column.to_lowercase();
        let mut tables = self
            .entries
            .keys()
            .filter(|(_, c)| *c == column)
            .map(|(t, _)| t.as_str())
            .collect::<Vec<_>>();
        tables.sort_unstable();
        tables
    }
}

#[cfg(test)]
mod tests {
    use crate::schema::banking;

    #[test]
    fn synonyms_and_canonical_spellings_resolve() {
        let map = banking::metadata().synonym_map();

        assert_eq!(
            map.canonical("account_types", "account_type_name", "Savings Account"),
            Some("Savings")
        );
        assert_eq!(
            map.canonical("account_types", "account_type_name", "savings"),
            Some("Savings")
        );
        assert_eq!(map.canonical("loan_types", "loan_type", "mortgage"), Some("Home"));
        assert_eq!(map.canonical("loan_types", "loan_type", "yacht"), None);
        assert!(!map.has_column("customers", "city"));
    }

    #[test]
    fn status_exists_on_two_tables() {
        let map = banking::metadata().synonym_map();
        assert_eq!(map.tables_with_column("status"), vec!["accounts", "loans"]);
    }
}
