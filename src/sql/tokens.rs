use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer, TokenizerError, Whitespace, Word};
use std::collections::HashSet;
use std::fmt::Write;
use std::ops::Range;

/// Words that end a table reference; anything else after a table name is
/// taken as its alias.
const NOT_AN_ALIAS: [&str; 30] = [
    "ON", "USING", "WHERE", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "OUTER", "CROSS",
    "NATURAL", "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "UNION", "EXCEPT", "INTERSECT",
    "WINDOW", "QUALIFY", "AS", "SELECT", "FROM", "WITH", "LATERAL", "POSITIONAL", "ANTI",
    "SEMI", "FETCH",
];

/// Words that can sit directly before `(` without being a function call.
const NOT_A_FUNCTION: [&str; 14] = [
    "IN", "EXISTS", "AS", "FROM", "JOIN", "ANY", "ALL", "SOME", "ON", "AND", "OR", "NOT",
    "LATERAL", "USING",
];

/// Words that start a top-level clause of a SELECT statement.
const CLAUSE_STARTS: [&str; 14] = [
    "SELECT", "FROM", "WHERE", "GROUP", "HAVING", "ORDER", "LIMIT", "OFFSET", "QUALIFY",
    "WINDOW", "UNION", "EXCEPT", "INTERSECT", "FETCH",
];

/// Words after which the next word is still part of the same select item.
const NOT_AN_EXPRESSION_END: [&str; 19] = [
    "SELECT", "DISTINCT", "ALL", "AS", "AND", "OR", "NOT", "IS", "LIKE", "ILIKE", "IN",
    "BETWEEN", "CASE", "WHEN", "THEN", "ELSE", "INTERVAL", "ON", "TOP",
];

/// Words that end a select item without naming it.
const NOT_AN_OUTPUT_NAME: [&str; 6] = ["NULL", "TRUE", "FALSE", "END", "ASC", "DESC"];

/// A table named in a FROM or JOIN clause. Derived tables have no name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub table: Option<String>,
    pub alias: Option<String>,
}

/// A SQL text as a token stream that renders back to equivalent SQL.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlTokens {
    tokens: Vec<Token>,
}

impl SqlTokens {
    pub fn parse(sql: &str) -> Result<Self, TokenizerError> {
        let dialect = GenericDialect {};
        let tokens = Tokenizer::new(&dialect, sql).tokenize()?;
        Ok(Self { tokens })
    }

    pub fn render(&self) -> String {
        render_tokens(&self.tokens)
    }

    /// The statement without surrounding whitespace, comments and `;`
    /// terminators, ready to be embedded in a larger query.
    pub fn statement_body(&self) -> String {
        let end = (0..self.tokens.len())
            .rev()
            .find(|&i| self.is_significant(i) && self.tokens[i] != Token::SemiColon)
            .map_or(0, |i| i + 1);
        let start = self.first_significant().unwrap_or(end).min(end);
        render_tokens(&self.tokens[start..end])
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn token(&self, i: usize) -> Option<&Token> {
        self.tokens.get(i)
    }

    pub fn set(&mut self, i: usize, token: Token) {
        if let Some(slot) = self.tokens.get_mut(i) {
            *slot = token;
        }
    }

    pub fn word(&self, i: usize) -> Option<&Word> {
        match self.tokens.get(i) {
            Some(Token::Word(w)) => Some(w),
            _ => None,
        }
    }

    /// Unquoted word matching `keyword`, ignoring case.
    pub fn is_keyword(&self, i: usize, keyword: &str) -> bool {
        self.word(i)
            .is_some_and(|w| w.quote_style.is_none() && w.value.eq_ignore_ascii_case(keyword))
    }

    fn is_any_keyword(&self, i: usize, keywords: &[&str]) -> bool {
        keywords.iter().any(|k| self.is_keyword(i, k))
    }

    /// Unquoted word the tokenizer recognised as a SQL keyword.
    pub fn is_reserved(&self, i: usize) -> bool {
        self.word(i)
            .is_some_and(|w| w.quote_style.is_none() && w.keyword != Keyword::NoKeyword)
    }

    pub fn is_significant(&self, i: usize) -> bool {
        !matches!(self.tokens.get(i), Some(Token::Whitespace(_)) | None)
    }

    pub fn next_significant(&self, i: usize) -> Option<usize> {
        (i + 1..self.tokens.len()).find(|&j| self.is_significant(j))
    }

    pub fn prev_significant(&self, i: usize) -> Option<usize> {
        (0..i).rev().find(|&j| self.is_significant(j))
    }

    pub fn first_significant(&self) -> Option<usize> {
        (0..self.tokens.len()).find(|&j| self.is_significant(j))
    }

    /// Upper-cased first word of the statement.
    pub fn first_keyword(&self) -> Option<String> {
        let first = self.first_significant()?;
        self.word(first)
            .filter(|w| w.quote_style.is_none())
            .map(|w| w.value.to_uppercase())
    }

    /// Parenthesis depth of every token; a paren itself has the outer depth.
    pub fn depths(&self) -> Vec<usize> {
        let mut depth = 0usize;
        self.tokens
            .iter()
            .map(|token| match token {
                Token::LParen => {
                    depth += 1;
                    depth - 1
                }
                Token::RParen => {
                    depth = depth.saturating_sub(1);
                    depth
                }
                _ => depth,
            })
            .collect()
    }

    pub fn matching_paren(&self, open: usize) -> Option<usize> {
        if self.tokens.get(open) != Some(&Token::LParen) {
            return None;
        }
        let mut depth = 0usize;
        for (j, token) in self.tokens.iter().enumerate().skip(open) {
            match token {
                Token::LParen => depth += 1,
                Token::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(j);
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// A word directly followed by `(` that is not a subquery or list opener.
    pub fn is_function_call(&self, i: usize) -> bool {
        self.word(i).is_some()
            && !self.is_any_keyword(i, &NOT_A_FUNCTION)
            && self
                .next_significant(i)
                .is_some_and(|j| self.tokens[j] == Token::LParen)
    }

    /// Index of the first top-level occurrence of a keyword sequence such
    /// as `["GROUP", "BY"]`.
    pub fn find_top_level(&self, sequence: &[&str]) -> Option<usize> {
        let depths = self.depths();
        let (first, rest) = sequence.split_first()?;

        'outer: for i in 0..self.tokens.len() {
            if depths[i] != 0 || !self.is_keyword(i, first) {
                continue;
            }
            let mut at = i;
            for keyword in rest {
                match self.next_significant(at) {
                    Some(j) if self.is_keyword(j, keyword) => at = j,
                    _ => continue 'outer,
                }
            }
            return Some(i);
        }
        None
    }

    /// End (exclusive) of the top-level clause starting at `start`: the next
    /// top-level clause keyword, a `;`, or the end of the statement.
    pub fn clause_end(&self, start: usize) -> usize {
        let depths = self.depths();
        let mut i = self.next_significant(start).unwrap_or(self.tokens.len());
        // Skip the BY of GROUP BY / ORDER BY.
        if self.is_keyword(start, "GROUP") || self.is_keyword(start, "ORDER") {
            i = self
                .next_significant(i)
                .unwrap_or(self.tokens.len());
        }
        while i < self.tokens.len() {
            if depths[i] == 0
                && (self.tokens[i] == Token::SemiColon || self.is_any_keyword(i, &CLAUSE_STARTS))
            {
                return i;
            }
            i += 1;
        }
        self.tokens.len()
    }

    /// Trims whitespace off the end of a range.
    pub fn trim_end(&self, range: Range<usize>) -> Range<usize> {
        let mut end = range.end;
        while end > range.start && !self.is_significant(end - 1) {
            end -= 1;
        }
        range.start..end
    }

    pub fn splice(&mut self, range: Range<usize>, replacement: Vec<Token>) {
        self.tokens.splice(range, replacement);
    }

    pub fn insert(&mut self, at: usize, tokens: Vec<Token>) {
        self.splice(at..at, tokens);
    }

    /// Number of non-empty statements separated by top-level semicolons.
    pub fn statement_count(&self) -> usize {
        let depths = self.depths();
        let mut count = 0;
        let mut in_statement = false;
        for (i, token) in self.tokens.iter().enumerate() {
            match token {
                Token::SemiColon if depths[i] == 0 => in_statement = false,
                Token::Whitespace(_) => {}
                _ if !in_statement => {
                    in_statement = true;
                    count += 1;
                }
                _ => {}
            }
        }
        count
    }

    /// Every table reference in FROM and JOIN clauses, at any depth.
    /// FROM inside function calls such as `EXTRACT(YEAR FROM d)` is skipped.
    pub fn table_references(&self) -> Vec<TableRef> {
        let function_parens = self.function_parens();
        let depths = self.depths();
        let mut refs = Vec::new();

        for i in 0..self.tokens.len() {
            let is_from = self.is_keyword(i, "FROM");
            if !is_from && !self.is_keyword(i, "JOIN") {
                continue;
            }
            if is_from && depths[i] > 0 && function_parens.contains(&self.enclosing_paren(i)) {
                continue;
            }

            let mut at = i;
            loop {
                let Some((table_ref, end)) = self.table_reference_at(at) else {
                    break;
                };
                refs.push(table_ref);
                // FROM a, b
                match self.next_significant(end) {
                    Some(j) if is_from && self.tokens[j] == Token::Comma => at = j,
                    _ => break,
                }
            }
        }
        refs
    }

    /// Parses the reference after token `at`; returns it with the index of
    /// its last token.
    fn table_reference_at(&self, at: usize) -> Option<(TableRef, usize)> {
        let start = self.next_significant(at)?;
        let (table, mut end) = match &self.tokens[start] {
            Token::LParen => (None, self.matching_paren(start)?),
            Token::Word(_) => {
                let mut last = start;
                // schema.table
                while let Some(dot) = self.next_significant(last) {
                    if self.tokens[dot] != Token::Period {
                        break;
                    }
                    match self.next_significant(dot) {
                        Some(next) if self.word(next).is_some() => last = next,
                        _ => break,
                    }
                }
                (self.word(last).map(|w| w.value.clone()), last)
            }
            _ => return None,
        };

        let mut alias = None;
        if let Some(next) = self.next_significant(end) {
            if self.is_keyword(next, "AS") {
                if let Some(name) = self.next_significant(next).filter(|&n| self.word(n).is_some()) {
                    alias = self.word(name).map(|w| w.value.clone());
                    end = name;
                }
            } else if self.word(next).is_some() && !self.is_any_keyword(next, &NOT_AN_ALIAS) {
                alias = self.word(next).map(|w| w.value.clone());
                end = next;
            }
        }

        Some((TableRef { table, alias }, end))
    }

    fn enclosing_paren(&self, i: usize) -> usize {
        let mut depth = 0usize;
        for j in (0..i).rev() {
            match self.tokens[j] {
                Token::RParen => depth += 1,
                Token::LParen if depth == 0 => return j,
                Token::LParen => depth -= 1,
                _ => {}
            }
        }
        usize::MAX
    }

    fn function_parens(&self) -> HashSet<usize> {
        (0..self.tokens.len())
            .filter(|&i| self.is_function_call(i))
            .filter_map(|i| self.next_significant(i))
            .collect()
    }

    /// Names the statement introduces, lower-cased: anything after AS
    /// (column aliases, table aliases, cast targets), CTE names, table
    /// aliases written without AS and select items named without AS.
    pub fn declared_names(&self) -> HashSet<String> {
        let mut names: HashSet<String> = self.implicit_aliases().into_iter().collect();
        names.extend(
            self.table_references()
                .into_iter()
                .filter_map(|r| r.alias)
                .map(|a| a.to_lowercase()),
        );
        for i in 0..self.tokens.len() {
            if !self.is_keyword(i, "AS") {
                continue;
            }
            if let Some(next) = self.next_significant(i) {
                if let Some(w) = self.word(next) {
                    names.insert(w.value.to_lowercase());
                } else if self.tokens[next] == Token::LParen {
                    // name AS ( ... ) in a WITH clause
                    if let Some(w) = self.prev_significant(i).and_then(|p| self.word(p)) {
                        names.insert(w.value.to_lowercase());
                    }
                }
            }
        }
        names
    }

    /// Output names written without AS, such as `SUM(balance) total`.
    fn implicit_aliases(&self) -> Vec<String> {
        let depths = self.depths();
        let mut names = Vec::new();

        for select in 0..self.tokens.len() {
            if !self.is_keyword(select, "SELECT") {
                continue;
            }
            let depth = depths[select];
            let mut item = Vec::new();
            for j in select + 1..=self.tokens.len() {
                let at_end = j == self.tokens.len()
                    || depths[j] < depth
                    || (depths[j] == depth
                        && (self.tokens[j] == Token::SemiColon
                            || self.is_any_keyword(j, &CLAUSE_STARTS)));
                let at_comma = !at_end && depths[j] == depth && self.tokens[j] == Token::Comma;

                if at_end || at_comma {
                    if let Some(name) = self.trailing_alias(&item) {
                        names.push(name);
                    }
                    item.clear();
                    if at_end {
                        break;
                    }
                } else if self.is_significant(j) {
                    item.push(j);
                }
            }
        }
        names
    }

    /// The last word of a select item when it follows a complete expression.
    fn trailing_alias(&self, item: &[usize]) -> Option<String> {
        let [.., prev, last] = item else {
            return None;
        };
        let name = self.word(*last)?;
        if name.quote_style.is_none() && self.is_any_keyword(*last, &NOT_AN_OUTPUT_NAME) {
            return None;
        }
        let ends_expression = match &self.tokens[*prev] {
            Token::RParen | Token::Number(..) | Token::SingleQuotedString(_) => true,
            Token::Word(_) => {
                self.is_keyword(*prev, "END") || !self.is_any_keyword(*prev, &NOT_AN_EXPRESSION_END)
            }
            _ => false,
        };
        ends_expression.then(|| name.value.to_lowercase())
    }
}

fn render_tokens(tokens: &[Token]) -> String {
    let mut out = String::new();
    for token in tokens {
        match token {
            Token::SingleQuotedString(s) => {
                out.push('\'');
                out.push_str(&s.replace('\'', "''"));
                out.push('\'');
            }
            other => {
                let _ = write!(out, "{}", other);
            }
        }
    }
    out
}

pub fn word(value: &str) -> Token {
    Token::make_word(value, None)
}

pub fn space() -> Token {
    Token::Whitespace(Whitespace::Space)
}

/// `qualifier.column`, or just `column` without a qualifier.
pub fn column_ref(qualifier: Option<&str>, column: &str) -> Vec<Token> {
    match qualifier {
        Some(q) => vec![word(q), Token::Period, word(column)],
        None => vec![word(column)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_round_trips_text() {
        let sql = "SELECT c.first_name, 'O''Brien' AS x\nFROM customers c -- note\nWHERE c.city = 'New York';";
        let tokens = SqlTokens::parse(sql).unwrap();
        assert_eq!(tokens.render(), sql);
    }

    #[test]
    fn first_keyword_skips_leading_whitespace() {
        let tokens = SqlTokens::parse("  \n with x as (select 1) select * from x").unwrap();
        assert_eq!(tokens.first_keyword().as_deref(), Some("WITH"));
    }

    #[test]
    fn statements_are_counted_at_top_level() {
        assert_eq!(SqlTokens::parse("SELECT 1;").unwrap().statement_count(), 1);
        assert_eq!(SqlTokens::parse("SELECT 1; ").unwrap().statement_count(), 1);
        assert_eq!(
            SqlTokens::parse("SELECT 1; DROP TABLE x;").unwrap().statement_count(),
            2
        );
        assert_eq!(
            SqlTokens::parse("SELECT ';' FROM t").unwrap().statement_count(),
            1
        );
    }

    #[test]
    fn table_references_with_and_without_aliases() {
        let tokens = SqlTokens::parse(
            "SELECT * FROM loan_payments lp JOIN loans AS l ON lp.loan_id = l.loan_id \
             LEFT JOIN main.loan_types lt ON l.loan_type_id = lt.loan_type_id, branches \
             WHERE EXTRACT(YEAR FROM lp.payment_date) = 2024",
        )
        .unwrap();

        let refs = tokens.table_references();
        let pairs: Vec<(Option<&str>, Option<&str>)> = refs
            .iter()
            .map(|r| (r.table.as_deref(), r.alias.as_deref()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                (Some("loan_payments"), Some("lp")),
                (Some("loans"), Some("l")),
                (Some("loan_types"), Some("lt")),
            ]
        );
    }

    #[test]
    fn comma_separated_from_list_and_derived_tables() {
        let tokens = SqlTokens::parse(
            "SELECT * FROM customers c, accounts a, (SELECT 1 AS one) ranked WHERE c.customer_id = a.customer_id",
        )
        .unwrap();
        let refs = tokens.table_references();
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[1].alias.as_deref(), Some("a"));
        assert_eq!(refs[2].table, None);
        assert_eq!(refs[2].alias.as_deref(), Some("ranked"));
    }

    #[test]
    fn group_by_clause_bounds() {
        let tokens = SqlTokens::parse(
            "SELECT a, COUNT(*) FROM t GROUP BY a, (b) HAVING COUNT(*) > 1 ORDER BY a",
        )
        .unwrap();
        let start = tokens.find_top_level(&["GROUP", "BY"]).unwrap();
        let end = tokens.clause_end(start);
        assert!(tokens.is_keyword(end, "HAVING"));
        let range = tokens.trim_end(start..end);
        let clause = SqlTokens {
            tokens: tokens.tokens()[range].to_vec(),
        };
        assert_eq!(clause.render(), "GROUP BY a, (b)");
    }

    #[test]
    fn nested_group_by_is_not_top_level() {
        let tokens = SqlTokens::parse(
            "SELECT * FROM (SELECT a FROM t GROUP BY a) x",
        )
        .unwrap();
        assert_eq!(tokens.find_top_level(&["GROUP", "BY"]), None);
    }

    #[test]
    fn declared_names_include_aliases_and_ctes() {
        let tokens = SqlTokens::parse(
            "WITH monthly AS (SELECT SUM(amount) AS total FROM t) SELECT total FROM monthly AS m",
        )
        .unwrap();
        let names = tokens.declared_names();
        for name in ["monthly", "total", "m"] {
            assert!(names.contains(name), "{} missing", name);
        }
    }

    #[test]
    fn select_items_named_without_as_are_declared() {
        let tokens = SqlTokens::parse(
            "SELECT branch_id, SUM(balance) total_balance, c.city town, \
             CASE WHEN balance > 0 THEN 'yes' ELSE 'no' END funded \
             FROM accounts a JOIN customers c ON a.customer_id = c.customer_id \
             GROUP BY branch_id ORDER BY total_balance DESC",
        )
        .unwrap();
        let names = tokens.declared_names();
        for name in ["total_balance", "town", "funded", "a", "c"] {
            assert!(names.contains(name), "{} missing", name);
        }
        for column in ["branch_id", "balance", "city"] {
            assert!(!names.contains(column), "{} declared", column);
        }
    }

    #[test]
    fn distinct_and_null_checks_are_not_aliases() {
        let tokens =
            SqlTokens::parse("SELECT DISTINCT city, phone_number IS NULL FROM customers").unwrap();
        let names = tokens.declared_names();
        assert!(!names.contains("city"));
        assert!(!names.contains("null"));
    }

    #[test]
    fn statement_body_drops_terminator_and_trailing_comments() {
        let tokens = SqlTokens::parse(
            "  SELECT first_name FROM customers; -- all customers\n/* done */ ;\n",
        )
        .unwrap();
        assert_eq!(tokens.statement_body(), "SELECT first_name FROM customers");

        let tokens = SqlTokens::parse("SELECT ';' AS semi -- keep\nFROM t").unwrap();
        assert_eq!(tokens.statement_body(), "SELECT ';' AS semi -- keep\nFROM t");
    }

    #[test]
    fn function_calls_are_recognised() {
        let tokens = SqlTokens::parse("SELECT COUNT(x) FROM t WHERE y IN (1)").unwrap();
        let count = (0..tokens.len()).find(|&i| tokens.is_keyword(i, "COUNT")).unwrap();
        let in_kw = (0..tokens.len()).find(|&i| tokens.is_keyword(i, "IN")).unwrap();
        assert!(tokens.is_function_call(count));
        assert!(!tokens.is_function_call(in_kw));
    }
}
