pub mod catalog;
pub mod db_pool;
pub mod engine;

pub use db_pool::{DbPool, DuckDbConnectionManager, create_pool};
pub use engine::{DuckDbEngine, ExecutionError, QueryResult, SqlEngine};
