pub mod tokens;

use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

pub use tokens::{SqlTokens, TableRef};

/// True when `sql` parses as exactly one query statement.
pub fn parses_as_query(sql: &str) -> bool {
    match Parser::parse_sql(&GenericDialect {}, sql) {
        Ok(statements) => {
            statements.len() == 1 && matches!(statements[0], Statement::Query(_))
        }
        Err(_) => false,
    }
}

/// Parser error message for `sql`, if it fails to parse.
pub fn parse_error(sql: &str) -> Option<String> {
    Parser::parse_sql(&GenericDialect {}, sql)
        .err()
        .map(|e| e.to_string())
}
