pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod pipeline;
pub mod postprocess;
pub mod prompt;
pub mod retriever;
pub mod schema;
pub mod sql;
pub mod util;
pub mod validator;
pub mod web;

#[cfg(test)]
pub mod testing;
