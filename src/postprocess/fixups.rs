use crate::schema::SchemaMetadata;
use crate::sql::tokens::{self, SqlTokens, TableRef};
use sqlparser::tokenizer::Token;

/// A named structural rewrite for a query shape the model is known to get
/// wrong. `apply` returns false and leaves the statement alone when the
/// expected structure is not there.
pub trait Fixup: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies(&self, question: &str, metadata: &SchemaMetadata, statement: &SqlTokens) -> bool;

    fn apply(&self, statement: &mut SqlTokens) -> bool;
}

/// Fixups in the order they run.
pub fn default_fixups() -> Vec<Box<dyn Fixup>> {
    vec![Box::new(PerLoanGrouping), Box::new(BranchLoansViaAccounts)]
}

fn refers_to(table_ref: &TableRef, table: &str) -> bool {
    table_ref
        .table
        .as_deref()
        .is_some_and(|t| t.eq_ignore_ascii_case(table))
}

fn name_used_for(refs: &[TableRef], table: &str) -> Option<String> {
    refs.iter()
        .find(|r| refers_to(r, table))
        .and_then(|r| r.alias.clone().or_else(|| r.table.clone()))
}

fn mentions_loan_id(statement: &SqlTokens, range: std::ops::Range<usize>) -> bool {
    range
        .into_iter()
        .any(|j| statement.word(j).is_some_and(|w| w.value.eq_ignore_ascii_case("loan_id")))
}

/// "More than one payment on a single loan": grouping by customer alone
/// merges payments across loans, so `loan_id` joins the grouping key.
pub struct PerLoanGrouping;

impl Fixup for PerLoanGrouping {
    fn name(&self) -> &'static str {
        "per_loan_grouping"
    }

    fn applies(&self, question: &str, _metadata: &SchemaMetadata, statement: &SqlTokens) -> bool {
        let q = question.to_lowercase();
        let repeated = ["more than one payment", "more than 1 payment", "multiple payments"]
            .iter()
            .any(|p| q.contains(p));
        let single = ["single loan", "same loan"].iter().any(|p| q.contains(p));
        repeated && single && statement.find_top_level(&["GROUP", "BY"]).is_some()
    }

    fn apply(&self, statement: &mut SqlTokens) -> bool {
        let refs = statement.table_references();
        let Some(qualifier) =
            name_used_for(&refs, "loans").or_else(|| name_used_for(&refs, "loan_payments"))
        else {
            return false;
        };

        let Some(group) = statement.find_top_level(&["GROUP", "BY"]) else {
            return false;
        };
        let end = statement.trim_end(group..statement.clause_end(group)).end;
        if mentions_loan_id(statement, group..end) {
            return false;
        }

        let key = tokens::column_ref(Some(&qualifier), "loan_id");
        let mut grouping = vec![Token::Comma, tokens::space()];
        grouping.extend(key.iter().cloned());
        statement.insert(end, grouping);

        let Some(select) = statement.find_top_level(&["SELECT"]) else {
            return true;
        };
        let from = statement
            .find_top_level(&["FROM"])
            .unwrap_or(statement.len());
        if !mentions_loan_id(statement, select..from) {
            let mut at = select;
            if let Some(next) = statement.next_significant(select) {
                if statement.is_keyword(next, "DISTINCT") {
                    at = next;
                }
            }
            let mut projection = vec![tokens::space()];
            projection.extend(key);
            projection.push(Token::Comma);
            statement.insert(at + 1, projection);
        }
        true
    }
}

/// Loans carry no branch; they reach one through their account.
pub struct BranchLoansViaAccounts;

impl BranchLoansViaAccounts {
    /// Finds `JOIN loans <alias> ON <x>.branch_id = <y>.branch_id` and
    /// returns the token range, the loans alias and the branch-side
    /// qualifier.
    fn find_join(statement: &SqlTokens) -> Option<(std::ops::Range<usize>, String, String)> {
        for join in 0..statement.len() {
            if !statement.is_keyword(join, "JOIN") {
                continue;
            }
            let Some(table) = statement.next_significant(join) else {
                continue;
            };
            if !statement.is_keyword(table, "loans") {
                continue;
            }

            let mut at = statement.next_significant(table)?;
            if statement.is_keyword(at, "AS") {
                at = statement.next_significant(at)?;
            }
            let alias = if statement.is_keyword(at, "ON") {
                "loans".to_string()
            } else {
                let Some(word) = statement.word(at) else {
                    continue;
                };
                let alias = word.value.clone();
                at = statement.next_significant(at)?;
                alias
            };
            if !statement.is_keyword(at, "ON") {
                continue;
            }

            let Some((left, after_left)) = branch_column(statement, at) else {
                continue;
            };
            let Some(eq) = statement.next_significant(after_left) else {
                continue;
            };
            if statement.token(eq) != Some(&Token::Eq) {
                continue;
            }
            let Some((right, end)) = branch_column(statement, eq) else {
                continue;
            };

            let other = if left.eq_ignore_ascii_case(&alias) {
                right
            } else if right.eq_ignore_ascii_case(&alias) {
                left
            } else {
                continue;
            };
            return Some((join..end + 1, alias, other));
        }
        None
    }
}

/// `<qualifier>.branch_id` after token `at`; returns the qualifier and the
/// index of the column token.
fn branch_column(statement: &SqlTokens, at: usize) -> Option<(String, usize)> {
    let qualifier = statement.next_significant(at)?;
    let dot = statement.next_significant(qualifier)?;
    let column = statement.next_significant(dot)?;
    if statement.token(dot) != Some(&Token::Period) || !statement.is_keyword(column, "branch_id") {
        return None;
    }
    Some((statement.word(qualifier)?.value.clone(), column))
}

impl Fixup for BranchLoansViaAccounts {
    fn name(&self) -> &'static str {
        "branch_loans_via_accounts"
    }

    fn applies(&self, question: &str, metadata: &SchemaMetadata, _statement: &SqlTokens) -> bool {
        let q = question.to_lowercase();
        let topic = q.contains("loan") && q.contains("branch");
        let trend = ["trend", "issu", "month", "over time"]
            .iter()
            .any(|p| q.contains(p));
        let schema = !metadata.has_column("loans", "branch_id")
            && metadata.has_column("loans", "account_id")
            && metadata.has_column("accounts", "account_id")
            && metadata.has_column("accounts", "branch_id");
        topic && trend && schema
    }

    fn apply(&self, statement: &mut SqlTokens) -> bool {
        let Some((range, loans, branch)) = Self::find_join(statement) else {
            return false;
        };

        let taken: Vec<String> = statement
            .table_references()
            .into_iter()
            .flat_map(|r| [r.table, r.alias])
            .flatten()
            .map(|n| n.to_lowercase())
            .collect();
        let account = if taken.iter().any(|n| n == "a") {
            "loan_acct"
        } else {
            "a"
        };

        let loans_ref = if loans.eq_ignore_ascii_case("loans") {
            loans.clone()
        } else {
            format!("loans {loans}")
        };
        let rewritten = format!(
            "JOIN accounts {account} ON {branch}.branch_id = {account}.branch_id \
             JOIN {loans_ref} ON {account}.account_id = {loans}.account_id"
        );
        let Ok(replacement) = SqlTokens::parse(&rewritten) else {
            return false;
        };
        statement.splice(range, replacement.tokens().to_vec());
        true
    }
}
