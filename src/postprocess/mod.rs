pub mod fixups;
pub mod identifiers;
pub mod synonyms;

use crate::config::PostProcessConfig;
use crate::schema::{SchemaMetadata, SynonymMap};
use crate::sql::{self, SqlTokens};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use fixups::Fixup;
pub use identifiers::ColumnMatcher;

#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    pub sql: String,
    pub applied: Vec<&'static str>,
}

/// Tables a statement reads from, keyed by the names it uses for them.
#[derive(Debug, Default)]
pub(crate) struct QueryTables {
    /// lower-cased alias or table name -> schema table, `None` for CTEs,
    /// derived tables and unknown tables.
    names: HashMap<String, Option<String>>,
    /// Schema tables in order of first reference.
    tables: Vec<String>,
}

impl QueryTables {
    pub(crate) fn from_tokens(tokens: &SqlTokens, metadata: &SchemaMetadata) -> Self {
        let mut query = Self::default();

        for table_ref in tokens.table_references() {
            let schema_table = table_ref
                .table
                .as_deref()
                .and_then(|name| metadata.table(name))
                .map(|t| t.name.clone());

            if let Some(name) = &table_ref.table {
                query
                    .names
                    .insert(name.to_lowercase(), schema_table.clone());
            }
            if let Some(alias) = &table_ref.alias {
                query
                    .names
                    .insert(alias.to_lowercase(), schema_table.clone());
            }
            if let Some(table) = schema_table {
                if !query.tables.contains(&table) {
                    query.tables.push(table);
                }
            }
        }
        query
    }

    /// Schema table behind an alias or table name.
    pub(crate) fn resolve(&self, qualifier: &str) -> Option<&str> {
        self.names
            .get(&qualifier.to_lowercase())
            .and_then(|t| t.as_deref())
    }

    /// Whether the statement uses `name` as a table name or alias.
    pub(crate) fn is_name(&self, name: &str) -> bool {
        self.names.contains_key(&name.to_lowercase())
    }

    pub(crate) fn tables(&self) -> &[String] {
        &self.tables
    }
}

/// Deterministic SQL corrections applied between generation and validation.
pub struct PostProcessor {
    metadata: Arc<SchemaMetadata>,
    synonyms: Arc<SynonymMap>,
    matcher: ColumnMatcher,
    config: PostProcessConfig,
    fixups: Vec<Box<dyn Fixup>>,
}

impl PostProcessor {
    pub fn new(
        metadata: Arc<SchemaMetadata>,
        synonyms: Arc<SynonymMap>,
        matcher: ColumnMatcher,
        config: PostProcessConfig,
    ) -> Self {
        Self {
            metadata,
            synonyms,
            matcher,
            config,
            fixups: fixups::default_fixups(),
        }
    }

    /// Runs identifier repair, synonym normalization and the structural
    /// fixups in that order. A step whose output no longer parses is
    /// discarded when its input did parse.
    pub fn correct(&self, sql: &str, relevant_tables: &[String], question: &str) -> Correction {
        let unchanged = || Correction {
            sql: sql.to_string(),
            applied: Vec::new(),
        };

        if sql.trim().is_empty() {
            return unchanged();
        }

        let mut tokens = match SqlTokens::parse(sql) {
            Ok(tokens) => tokens,
            Err(e) => {
                debug!("Skipping post-processing, SQL does not tokenize: {}", e);
                return unchanged();
            }
        };
        let checked = sql::parses_as_query(sql);
        let mut applied = Vec::new();

        let mut candidate = tokens.clone();
        let repairs = identifiers::repair(
            &mut candidate,
            relevant_tables,
            &self.metadata,
            &self.config,
            &self.matcher,
        );
        if !repairs.is_empty() && self.accept("identifier_repair", &candidate, checked) {
            info!("Repaired identifiers: {}", repairs.join(", "));
            tokens = candidate;
            applied.push("identifier_repair");
        }

        let mut candidate = tokens.clone();
        let normalized = synonyms::normalize(
            &mut candidate,
            relevant_tables,
            &self.metadata,
            &self.synonyms,
        );
        if !normalized.is_empty() && self.accept("synonym_normalization", &candidate, checked) {
            info!("Normalized literals: {}", normalized.join(", "));
            tokens = candidate;
            applied.push("synonym_normalization");
        }

        for fixup in &self.fixups {
            if !fixup.applies(question, &self.metadata, &tokens) {
                continue;
            }
            let mut candidate = tokens.clone();
            if fixup.apply(&mut candidate) && self.accept(fixup.name(), &candidate, checked) {
                info!("Applied fixup {}", fixup.name());
                tokens = candidate;
                applied.push(fixup.name());
            }
        }

        if applied.is_empty() {
            return unchanged();
        }
        Correction {
            sql: tokens.render(),
            applied,
        }
    }

    fn accept(&self, step: &str, candidate: &SqlTokens, checked: bool) -> bool {
        if !checked || sql::parses_as_query(&candidate.render()) {
            return true;
        }
        warn!("Discarding {} because the result no longer parses", step);
        false
    }
}
