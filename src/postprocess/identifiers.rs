use super::QueryTables;
use crate::config::PostProcessConfig;
use crate::embedding::providers::local::LocalEmbedder;
use crate::embedding::{EmbeddingError, cosine_similarity};
use crate::schema::SchemaMetadata;
use crate::sql::{SqlTokens, tokens};
use sqlparser::tokenizer::Token;
use std::collections::HashMap;

const LEXICAL_DIMENSIONS: usize = 2048;

pub type EmbedFn = Box<dyn Fn(&str) -> Vec<f32> + Send + Sync>;

/// Column names of every table, embedded once at startup, for nearest-name
/// lookups of identifiers the model got wrong.
pub struct ColumnMatcher {
    embed: EmbedFn,
    columns: HashMap<String, Vec<(String, Vec<f32>)>>,
}

impl ColumnMatcher {
    pub fn build(metadata: &SchemaMetadata, embed: EmbedFn) -> Self {
        let columns = metadata
            .tables
            .iter()
            .map(|table| {
                let embedded = table
                    .columns
                    .iter()
                    .map(|c| (c.name.clone(), embed(&c.name)))
                    .collect();
                (table.name.to_lowercase(), embedded)
            })
            .collect();
        Self { embed, columns }
    }

    /// Matcher over the offline hashing embedder.
    pub fn lexical(metadata: &SchemaMetadata) -> Result<Self, EmbeddingError> {
        let embedder = LocalEmbedder::new(LEXICAL_DIMENSIONS)?;
        Ok(Self::build(
            metadata,
            Box::new(move |text| embedder.embed_text(text)),
        ))
    }

    /// Most similar column of `table` at or above `threshold`. Ties go to
    /// the column declared first.
    pub fn nearest(&self, table: &str, identifier: &str, threshold: f32) -> Option<(&str, f32)> {
        let query = (self.embed)(identifier);
        let mut best: Option<(&str, f32)> = None;
        for (name, vector) in self.columns.get(&table.to_lowercase())? {
            let score = cosine_similarity(&query, vector);
            if score >= threshold && best.is_none_or(|(_, s)| score > s) {
                best = Some((name.as_str(), score));
            }
        }
        best
    }
}

fn mapped<'a>(config: &'a PostProcessConfig, table: &str, column: &str) -> Option<&'a str> {
    config
        .column_mappings
        .iter()
        .find(|(t, _)| t.eq_ignore_ascii_case(table))
        .and_then(|(_, columns)| {
            columns
                .iter()
                .find(|(wrong, _)| wrong.eq_ignore_ascii_case(column))
        })
        .map(|(_, right)| right.as_str())
}

/// Rewrites column identifiers that do not exist in the tables they can
/// refer to. Returns one `old -> new` entry per rewritten token.
pub(crate) fn repair(
    statement: &mut SqlTokens,
    relevant_tables: &[String],
    metadata: &SchemaMetadata,
    config: &PostProcessConfig,
    matcher: &ColumnMatcher,
) -> Vec<String> {
    let query = QueryTables::from_tokens(statement, metadata);
    let declared = statement.declared_names();

    let relevant: Vec<String> = relevant_tables
        .iter()
        .filter_map(|t| metadata.table(t))
        .map(|t| t.name.clone())
        .collect();
    let mut known = query.tables().to_vec();
    for table in &relevant {
        if !known.contains(table) {
            known.push(table.clone());
        }
    }
    // A bare column can only come from a table the statement reads.
    let candidates = if query.tables().is_empty() {
        relevant
    } else {
        query.tables().to_vec()
    };

    let lookup = |table: &str, column: &str| -> Option<String> {
        if let Some(right) = mapped(config, table, column) {
            return Some(right.to_string());
        }
        matcher
            .nearest(table, column, config.similarity_threshold)
            .map(|(name, _)| name.to_string())
    };

    let mut repairs = Vec::new();
    for i in 0..statement.len() {
        let Some(word) = statement.word(i) else {
            continue;
        };
        if word.quote_style.is_some()
            || statement.is_reserved(i)
            || statement.is_function_call(i)
        {
            continue;
        }
        let name = word.value.clone();

        let prev = statement.prev_significant(i);
        let prev_token = prev.and_then(|p| statement.token(p));
        if matches!(prev_token, Some(Token::DoubleColon))
            || prev.is_some_and(|p| statement.is_keyword(p, "AS"))
        {
            continue;
        }
        // Qualifiers are resolved together with the column after them.
        if statement
            .next_significant(i)
            .is_some_and(|n| statement.token(n) == Some(&Token::Period))
        {
            continue;
        }

        let replacement = if matches!(prev_token, Some(Token::Period)) {
            let Some(qualifier) = prev
                .and_then(|p| statement.prev_significant(p))
                .and_then(|q| statement.word(q))
            else {
                continue;
            };
            let Some(table) = query.resolve(&qualifier.value) else {
                continue;
            };
            if metadata.has_column(table, &name) {
                continue;
            }
            lookup(table, &name)
        } else {
            if query.is_name(&name) || declared.contains(&name.to_lowercase()) {
                continue;
            }
            if known.iter().any(|t| metadata.has_column(t, &name)) {
                continue;
            }
            candidates
                .iter()
                .find_map(|t| mapped(config, t, &name).map(str::to_string))
                .or_else(|| {
                    candidates
                        .iter()
                        .filter_map(|t| {
                            matcher.nearest(t, &name, config.similarity_threshold)
                        })
                        .fold(None, |best: Option<(&str, f32)>, hit| match best {
                            Some((_, s)) if s >= hit.1 => best,
                            _ => Some(hit),
                        })
                        .map(|(column, _)| column.to_string())
                })
        };

        if let Some(column) = replacement {
            if !column.eq_ignore_ascii_case(&name) {
                repairs.push(format!("{} -> {}", name, column));
                statement.set(i, tokens::word(&column));
            }
        }
    }
    repairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::banking;

    fn run(sql: &str, relevant: &[&str]) -> (String, Vec<String>) {
        let metadata = banking::metadata();
        let matcher = ColumnMatcher::lexical(&metadata).unwrap();
        let relevant: Vec<String> = relevant.iter().map(|s| s.to_string()).collect();
        let mut statement = SqlTokens::parse(sql).unwrap();
        let repairs = repair(
            &mut statement,
            &relevant,
            &metadata,
            &PostProcessConfig::default(),
            &matcher,
        );
        (statement.render(), repairs)
    }

    /// Embeds a handful of names onto fixed axes so similarity is exact.
    fn axis_matcher(metadata: &SchemaMetadata) -> ColumnMatcher {
        ColumnMatcher::build(
            metadata,
            Box::new(|text| match text {
                "branch_name" | "branch_title" => vec![1.0, 0.0, 0.0],
                "city" | "town" => vec![0.0, 1.0, 0.0],
                "halfway" => vec![0.6, 0.8, 0.0],
                _ => vec![0.0, 0.0, 1.0],
            }),
        )
    }

    #[test]
    fn configured_mapping_applies_to_bare_and_qualified_columns() {
        let (sql, repairs) = run("SELECT loan_type_name FROM loan_types", &["loan_types"]);
        assert_eq!(sql, "SELECT loan_type FROM loan_types");
        assert_eq!(repairs, vec!["loan_type_name -> loan_type"]);

        let (sql, _) = run(
            "SELECT lt.loan_type_name, COUNT(*) FROM loans l JOIN loan_types lt ON l.loan_type_id = lt.loan_type_id GROUP BY lt.loan_type_name",
            &["loans", "loan_types"],
        );
        assert_eq!(
            sql,
            "SELECT lt.loan_type, COUNT(*) FROM loans l JOIN loan_types lt ON l.loan_type_id = lt.loan_type_id GROUP BY lt.loan_type"
        );
    }

    #[test]
    fn nearest_column_uses_the_threshold() {
        let metadata = banking::metadata();
        let matcher = axis_matcher(&metadata);

        assert_eq!(
            matcher.nearest("branches", "branch_title", 0.7).map(|(c, _)| c),
            Some("branch_name")
        );
        assert_eq!(
            matcher.nearest("branches", "town", 0.7).map(|(c, _)| c),
            Some("city")
        );
        // cos = 0.8 against city, 0.6 against branch_name
        assert_eq!(
            matcher.nearest("branches", "halfway", 0.7).map(|(c, _)| c),
            Some("city")
        );
        assert_eq!(matcher.nearest("branches", "halfway", 0.9), None);
        assert_eq!(matcher.nearest("no_such_table", "town", 0.1), None);
    }

    #[test]
    fn similarity_repair_on_qualified_column() {
        let metadata = banking::metadata();
        let matcher = axis_matcher(&metadata);
        let mut statement = SqlTokens::parse("SELECT b.branch_title FROM branches b").unwrap();
        let repairs = repair(
            &mut statement,
            &["branches".to_string()],
            &metadata,
            &PostProcessConfig::default(),
            &matcher,
        );
        assert_eq!(statement.render(), "SELECT b.branch_name FROM branches b");
        assert_eq!(repairs.len(), 1);
    }

    #[test]
    fn aliases_functions_tables_and_literals_are_left_alone() {
        let sql = "SELECT c.first_name, COUNT(a.account_id) AS total_accounts \
                   FROM customers c JOIN accounts a ON c.customer_id = a.customer_id \
                   WHERE c.city = 'loan_type_name' \
                   GROUP BY c.first_name ORDER BY total_accounts DESC";
        let (out, repairs) = run(sql, &["customers", "accounts"]);
        assert_eq!(out, sql);
        assert!(repairs.is_empty());
    }

    #[test]
    fn output_names_without_as_are_not_repaired() {
        let sql = "SELECT branch_id, SUM(balance) total_balance FROM accounts \
                   GROUP BY branch_id ORDER BY total_balance DESC;";
        let (out, repairs) = run(sql, &["accounts", "customers", "loans"]);
        assert_eq!(out, sql);
        assert!(repairs.is_empty());

        let sql = "SELECT c.city hometown, COUNT(*) n FROM customers c GROUP BY hometown HAVING n > 1";
        let (out, repairs) = run(sql, &["customers"]);
        assert_eq!(out, sql);
        assert!(repairs.is_empty());
    }

    #[test]
    fn unknown_qualifiers_are_skipped() {
        let sql = "WITH totals AS (SELECT customer_id, SUM(loan_amount) AS total FROM loans GROUP BY customer_id) \
                   SELECT t.loan_type_name FROM totals t";
        let (out, repairs) = run(sql, &["loans", "loan_types"]);
        assert_eq!(out, sql);
        assert!(repairs.is_empty());
    }

    #[test]
    fn cast_targets_are_not_columns() {
        let sql = "SELECT start_date::timestamp FROM loans";
        let (out, _) = run(sql, &["loans"]);
        assert_eq!(out, sql);
    }
}
