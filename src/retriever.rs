use crate::config::RetrievalConfig;
use crate::embedding::{Embedder, EmbeddingError};
use crate::index::{ScoredHit, SchemaIndex};
use crate::schema::{SchemaMetadata, parse_value_identifier};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("schema index unavailable: {0}")]
    Configuration(String),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueHint {
    pub table: String,
    pub column: String,
    pub value: String,
    pub synonyms: Vec<String>,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationshipHint {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
    pub description: String,
    pub score: f32,
}

/// The slice of the schema judged relevant to one question.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchemaContext {
    pub tables: Vec<String>,
    /// `table.column`
    pub columns: Vec<String>,
    pub values: Vec<ValueHint>,
    pub relationships: Vec<RelationshipHint>,
    pub scores: BTreeMap<String, f32>,
}

impl SchemaContext {
    /// Renders the context as prompt text: every column of each relevant
    /// table, the categorical vocabulary, then join hints.
    pub fn describe(&self, metadata: &SchemaMetadata) -> String {
        let mut out = String::new();

        for name in &self.tables {
            let Some(table) = metadata.table(name) else {
                continue;
            };
            let _ = writeln!(out, "Table: {}", table.name);
            if !table.description.is_empty() {
                let _ = writeln!(out, "  Description: {}", table.description);
            }
            let _ = writeln!(out, "  Columns:");
            for column in &table.columns {
                let _ = write!(
                    out,
                    "  - {} ({}): {}",
                    column.name, column.data_type, column.description
                );
                if !column.possible_values.is_empty() {
                    let _ = write!(
                        out,
                        ". Possible values: {}",
                        column.possible_values.join(", ")
                    );
                }
                if !column.value_mappings.is_empty() {
                    let mappings = column
                        .value_mappings
                        .iter()
                        .map(|(synonym, canonical)| format!("'{}' means '{}'", synonym, canonical))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let _ = write!(out, ". Synonyms: {}", mappings);
                }
                out.push('\n');
            }
        }

        if !self.values.is_empty() {
            let _ = writeln!(out, "Relevant Values:");
            for hint in &self.values {
                let _ = write!(out, "- {}.{} = '{}'", hint.table, hint.column, hint.value);
                if !hint.synonyms.is_empty() {
                    let _ = write!(out, " (also called: {})", hint.synonyms.join(", "));
                }
                out.push('\n');
            }
        }

        let mut joins: Vec<(String, String)> = self
            .relationships
            .iter()
            .map(|r| {
                (
                    format!(
                        "{}.{} = {}.{}",
                        r.from_table, r.from_column, r.to_table, r.to_column
                    ),
                    r.description.clone(),
                )
            })
            .collect();
        for rel in metadata.relationships_between(&self.tables) {
            let hint = rel.join_hint();
            if !joins.iter().any(|(existing, _)| *existing == hint) {
                joins.push((hint, rel.description.clone()));
            }
        }
        if !joins.is_empty() {
            let _ = writeln!(out, "Join Hints:");
            for (hint, description) in joins {
                if description.is_empty() {
                    let _ = writeln!(out, "- JOIN ON {}", hint);
                } else {
                    let _ = writeln!(out, "- JOIN ON {} ({})", hint, description);
                }
            }
        }

        out
    }
}

pub struct Retriever {
    index: Result<Arc<SchemaIndex>, String>,
    embedder: Arc<dyn Embedder>,
    metadata: Arc<SchemaMetadata>,
    config: RetrievalConfig,
}

impl Retriever {
    /// `index` carries the load error when the index could not be opened;
    /// every retrieval then fails with a configuration error.
    pub fn new(
        index: Result<Arc<SchemaIndex>, String>,
        embedder: Arc<dyn Embedder>,
        metadata: Arc<SchemaMetadata>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            metadata,
            config,
        }
    }

    /// Why the index could not be loaded, if it could not.
    pub fn unavailable(&self) -> Option<&str> {
        self.index.as_ref().err().map(String::as_str)
    }

    pub async fn retrieve_schema_context(
        &self,
        query: &str,
    ) -> Result<SchemaContext, RetrievalError> {
        let index = self
            .index
            .as_ref()
            .map_err(|reason| RetrievalError::Configuration(reason.clone()))?;

        let embedding = self.embedder.embed(query).await?;
        if embedding.len() != index.build.dimensions {
            return Err(RetrievalError::Configuration(format!(
                "query embedding has {} dimensions but the index has {}",
                embedding.len(),
                index.build.dimensions
            )));
        }

        let mut context = SchemaContext::default();

        let table_hits = index.tables.search(&embedding, self.config.table_top_k);
        let column_hits = index.columns.search(&embedding, self.config.column_top_k);

        for hit in &table_hits {
            push_unique(&mut context.tables, &hit.identifier);
        }
        for hit in &column_hits {
            context.columns.push(hit.identifier.clone());
            if let Some((table, _)) = hit.identifier.split_once('.') {
                push_unique(&mut context.tables, table);
            }
        }
        record_scores(&mut context.scores, &table_hits);
        record_scores(&mut context.scores, &column_hits);

        if self.config.use_values {
            let value_hits = index.values.search(&embedding, self.config.value_top_k);
            for hit in &value_hits {
                if let Some(hint) = self.value_hint(hit) {
                    context.values.push(hint);
                }
            }
            record_scores(&mut context.scores, &value_hits);
        }

        if self.config.use_relationships {
            let relationship_hits = index
                .relationships
                .search(&embedding, self.config.relationship_top_k);
            for hit in &relationship_hits {
                if let Some(hint) = self.relationship_hint(hit) {
                    context.relationships.push(hint);
                }
            }
            record_scores(&mut context.scores, &relationship_hits);
        }

        info!(
            "Retrieved {} tables, {} columns, {} values, {} relationships",
            context.tables.len(),
            context.columns.len(),
            context.values.len(),
            context.relationships.len()
        );
        debug!("Relevant tables: {:?}", context.tables);

        Ok(context)
    }

    pub fn metadata(&self) -> &SchemaMetadata {
        &self.metadata
    }

    fn value_hint(&self, hit: &ScoredHit) -> Option<ValueHint> {
        let (table, column, value) = parse_value_identifier(&hit.identifier)?;
        let metadata = self.metadata.column(table, column)?;
        let synonyms = metadata
            .value_mappings
            .iter()
            .filter(|(_, canonical)| canonical.as_str() == value)
            .map(|(synonym, _)| synonym.clone())
            .collect();

        Some(ValueHint {
            table: table.to_string(),
            column: column.to_string(),
            value: value.to_string(),
            synonyms,
            score: hit.score,
        })
    }

    fn relationship_hint(&self, hit: &ScoredHit) -> Option<RelationshipHint> {
        let rel = self
            .metadata
            .relationships
            .iter()
            .find(|r| r.identifier() == hit.identifier)?;

        Some(RelationshipHint {
            from_table: rel.from_table.clone(),
            from_column: rel.from_column.clone(),
            to_table: rel.to_table.clone(),
            to_column: rel.to_column.clone(),
            description: rel.description.clone(),
            score: hit.score,
        })
    }
}

fn push_unique(list: &mut Vec<String>, item: &str) {
    if !list.iter().any(|existing| existing == item) {
        list.push(item.to_string());
    }
}

fn record_scores(scores: &mut BTreeMap<String, f32>, hits: &[ScoredHit]) {
    for hit in hits {
        scores.insert(hit.identifier.clone(), hit.score);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[tokio::test]
    async fn same_question_gives_same_context() {
        let retriever = testing::retriever().await;
        let first = retriever
            .retrieve_schema_context("Which customers have a savings account?")
            .await
            .unwrap();
        let second = retriever
            .retrieve_schema_context("Which customers have a savings account?")
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn phone_number_question_finds_the_customer_column() {
        let retriever = testing::retriever().await;
        let context = retriever
            .retrieve_schema_context("List all customers and their phone numbers.")
            .await
            .unwrap();

        assert!(context.tables.iter().any(|t| t == "customers"));
        assert!(context.columns.iter().any(|c| c == "customers.phone_number"));
        assert!(context.columns.len() <= 8);
        assert!(context.scores.contains_key("customers.phone_number"));
    }

    #[tokio::test]
    async fn tables_of_retrieved_columns_are_included() {
        let retriever = testing::retriever().await;
        let context = retriever
            .retrieve_schema_context("total loan payment amount per loan")
            .await
            .unwrap();

        for column in &context.columns {
            let (table, _) = column.split_once('.').unwrap();
            assert!(context.tables.iter().any(|t| t == table), "{} missing", table);
        }
    }

    #[tokio::test]
    async fn missing_index_is_a_configuration_error() {
        let retriever = Retriever::new(
            Err("index directory data/index has no manifest".to_string()),
            Arc::new(testing::local_embedder()),
            Arc::new(crate::schema::banking::metadata()),
            RetrievalConfig::default(),
        );
        let err = retriever.retrieve_schema_context("anything").await.unwrap_err();
        assert!(matches!(err, RetrievalError::Configuration(_)));
    }

    #[tokio::test]
    async fn embedding_failure_is_surfaced() {
        let index = testing::schema_index().await;
        let retriever = Retriever::new(
            Ok(Arc::new(index)),
            Arc::new(testing::FailingEmbedder),
            Arc::new(crate::schema::banking::metadata()),
            RetrievalConfig::default(),
        );
        let err = retriever.retrieve_schema_context("anything").await.unwrap_err();
        assert!(matches!(err, RetrievalError::Embedding(_)));
    }

    #[tokio::test]
    async fn description_lists_columns_values_and_joins() {
        let metadata = crate::schema::banking::metadata();
        let context = SchemaContext {
            tables: vec!["accounts".into(), "account_types".into()],
            columns: vec!["account_types.account_type_name".into()],
            ..SchemaContext::default()
        };

        let text = context.describe(&metadata);
        assert!(text.contains("Table: accounts"));
        assert!(text.contains("- balance (DECIMAL(14,2)): Current account balance"));
        assert!(text.contains("Possible values: Savings, Checking, Fixed Deposit, Current"));
        assert!(text.contains("'savings account' means 'Savings'"));
        assert!(text.contains(
            "JOIN ON accounts.account_type_id = account_types.account_type_id"
        ));
        assert!(!text.contains("Table: customers"));
    }
}
