use super::QueryTables;
use crate::schema::{SchemaMetadata, SynonymMap};
use crate::sql::SqlTokens;
use sqlparser::tokenizer::Token;

/// Replaces categorical literals compared against a column with a synonym
/// vocabulary (`col = 'x'`, `col ILIKE 'x'`, `col IN ('x', 'y')`) by their
/// canonical spelling. Literals the vocabulary does not know are kept.
pub(crate) fn normalize(
    statement: &mut SqlTokens,
    relevant_tables: &[String],
    metadata: &SchemaMetadata,
    synonyms: &SynonymMap,
) -> Vec<String> {
    if synonyms.is_empty() {
        return Vec::new();
    }

    let query = QueryTables::from_tokens(statement, metadata);
    let mut scope = query.tables().to_vec();
    for table in relevant_tables {
        if !scope.iter().any(|t| t.eq_ignore_ascii_case(table)) {
            scope.push(table.clone());
        }
    }

    let mut changes = Vec::new();
    for i in 0..statement.len() {
        let Some(word) = statement.word(i) else {
            continue;
        };
        if word.quote_style.is_some() {
            continue;
        }
        let column = word.value.clone();

        let Some(op) = statement.next_significant(i) else {
            continue;
        };
        let literals = match statement.token(op) {
            Some(Token::Eq) => literal_at(statement, op).into_iter().collect(),
            _ if statement.is_keyword(op, "ILIKE") => {
                literal_at(statement, op).into_iter().collect()
            }
            _ if statement.is_keyword(op, "IN") => in_list(statement, op),
            _ => Vec::new(),
        };
        if literals.is_empty() {
            continue;
        }

        let Some(table) = owning_table(statement, i, &column, &query, &scope, synonyms) else {
            continue;
        };

        for at in literals {
            let Some(Token::SingleQuotedString(literal)) = statement.token(at) else {
                continue;
            };
            let Some(canonical) = synonyms.canonical(&table, &column, literal) else {
                continue;
            };
            if canonical != literal {
                changes.push(format!("{}.{}: '{}' -> '{}'", table, column, literal, canonical));
                let canonical = canonical.to_string();
                statement.set(at, Token::SingleQuotedString(canonical));
            }
        }
    }
    changes
}

fn literal_at(statement: &SqlTokens, op: usize) -> Option<usize> {
    statement
        .next_significant(op)
        .filter(|&j| matches!(statement.token(j), Some(Token::SingleQuotedString(_))))
}

fn in_list(statement: &SqlTokens, op: usize) -> Vec<usize> {
    let Some(open) = statement.next_significant(op) else {
        return Vec::new();
    };
    let Some(close) = statement.matching_paren(open) else {
        return Vec::new();
    };
    let items: Vec<usize> = (open + 1..close)
        .filter(|&j| statement.is_significant(j))
        .filter(|&j| !matches!(statement.token(j), Some(Token::Comma)))
        .collect();
    // Only plain literal lists; a subquery or expression is left alone.
    if items
        .iter()
        .all(|&j| matches!(statement.token(j), Some(Token::SingleQuotedString(_))))
    {
        items
    } else {
        Vec::new()
    }
}

/// Table that owns the column at `i`: the resolved qualifier when there is
/// one, else the single in-scope table with that vocabulary column.
fn owning_table(
    statement: &SqlTokens,
    i: usize,
    column: &str,
    query: &QueryTables,
    scope: &[String],
    synonyms: &SynonymMap,
) -> Option<String> {
    let prev = statement.prev_significant(i);
    if prev.is_some_and(|p| statement.token(p) == Some(&Token::Period)) {
        let qualifier = prev
            .and_then(|p| statement.prev_significant(p))
            .and_then(|q| statement.word(q))?;
        let table = query.resolve(&qualifier.value)?;
        return synonyms
            .has_column(table, column)
            .then(|| table.to_string());
    }

    let owners = synonyms
        .tables_with_column(column)
        .into_iter()
        .filter(|owner| scope.iter().any(|t| t.eq_ignore_ascii_case(owner)))
        .collect::<Vec<_>>();
    match owners.as_slice() {
        [table] => Some(table.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::banking;

    fn run(sql: &str, relevant: &[&str]) -> String {
        let metadata = banking::metadata();
        let synonyms = metadata.synonym_map();
        let relevant: Vec<String> = relevant.iter().map(|s| s.to_string()).collect();
        let mut statement = SqlTokens::parse(sql).unwrap();
        normalize(&mut statement, &relevant, &metadata, &synonyms);
        statement.render()
    }

    #[test]
    fn equality_and_ilike_literals_are_canonicalised() {
        assert_eq!(
            run(
                "SELECT COUNT(*) FROM loans l JOIN loan_types lt ON l.loan_type_id = lt.loan_type_id WHERE lt.loan_type = 'mortgage'",
                &["loans", "loan_types"],
            ),
            "SELECT COUNT(*) FROM loans l JOIN loan_types lt ON l.loan_type_id = lt.loan_type_id WHERE lt.loan_type = 'Home'"
        );
        assert_eq!(
            run(
                "SELECT * FROM account_types WHERE account_type_name ILIKE 'savings account'",
                &["account_types"],
            ),
            "SELECT * FROM account_types WHERE account_type_name ILIKE 'Savings'"
        );
    }

    #[test]
    fn in_lists_are_canonicalised() {
        assert_eq!(
            run(
                "SELECT * FROM loan_types WHERE loan_type IN ('mortgage', 'car loan')",
                &["loan_types"],
            ),
            "SELECT * FROM loan_types WHERE loan_type IN ('Home', 'Auto')"
        );
    }

    #[test]
    fn unknown_literals_and_wildcards_are_untouched() {
        let sql = "SELECT * FROM loan_types WHERE loan_type = 'yacht' OR loan_type ILIKE '%home%'";
        assert_eq!(run(sql, &["loan_types"]), sql);
    }

    #[test]
    fn ambiguous_bare_column_is_untouched() {
        // status has a vocabulary on both accounts and loans
        let sql = "SELECT * FROM accounts a JOIN loans l ON a.account_id = l.account_id WHERE status = 'active'";
        assert_eq!(run(sql, &["accounts", "loans"]), sql);
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = run(
            "SELECT * FROM loan_types WHERE loan_type = 'MORTGAGE'",
            &["loan_types"],
        );
        assert_eq!(once, "SELECT * FROM loan_types WHERE loan_type = 'Home'");
        assert_eq!(run(&once, &["loan_types"]), once);
    }
}
