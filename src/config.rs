use clap::{Parser, Subcommand};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub connection_string: String,
    pub pool_size: usize,
    pub read_only: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection_string: "bank.duckdb".to_string(),
            pool_size: 5,
            read_only: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: String, // "remote" or "ollama"
    pub model: String,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: "ollama".to_string(),
            model: "llama3".to_string(),
            api_key: None,
            api_url: None,
            temperature: 0.0,
            max_tokens: 512,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub backend: String, // "local", "remote" or "ollama"
    pub model: String,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    /// Vector width of the local hashing embedder; remote models report their own.
    pub dimensions: usize,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: "local".to_string(),
            model: "hashing-trigram".to_string(),
            api_key: None,
            api_url: None,
            dimensions: 1024,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub column_top_k: usize,
    pub table_top_k: usize,
    pub value_top_k: usize,
    pub relationship_top_k: usize,
    pub use_values: bool,
    pub use_relationships: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            column_top_k: 8,
            table_top_k: 4,
            value_top_k: 5,
            relationship_top_k: 5,
            use_values: true,
            use_relationships: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PromptConfig {
    pub max_examples: usize,
    pub max_context_chars: usize,
    pub max_prompt_chars: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            max_examples: 24,
            max_context_chars: 12_000,
            max_prompt_chars: 24_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PostProcessConfig {
    pub similarity_threshold: f32,
    /// table -> (wrong column name -> real column name)
    pub column_mappings: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        let mut loan_types = BTreeMap::new();
        loan_types.insert("loan_type_name".to_string(), "loan_type".to_string());
        let mut column_mappings = BTreeMap::new();
        column_mappings.insert("loan_types".to_string(), loan_types);

        Self {
            similarity_threshold: 0.7,
            column_mappings,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SafetyConfig {
    pub forbidden_sql_keywords: Vec<String>,
    pub destructive_intent_words: Vec<String>,
    pub max_result_rows: usize,
    pub query_timeout_secs: u64,
    pub semantic_overlap_min_ratio: f32,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        let words = |list: &[&str]| list.iter().map(|w| w.to_string()).collect::<Vec<_>>();
        Self {
            forbidden_sql_keywords: words(&[
                "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "CREATE", "GRANT",
                "REVOKE",
            ]),
            destructive_intent_words: words(&[
                "delete", "update", "remove", "insert", "drop", "alter", "truncate", "create",
                "grant", "revoke", "erase",
            ]),
            max_result_rows: 1000,
            query_timeout_secs: 30,
            semantic_overlap_min_ratio: 0.2,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PathsConfig {
    /// Schema metadata JSON; the built-in banking schema is used when unset.
    pub schema_metadata: Option<String>,
    pub index_dir: String,
    pub few_shot_examples: Option<String>,
    pub audit_log: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            schema_metadata: None,
            index_dir: "index".to_string(),
            few_shot_examples: None,
            audit_log: "logs/interactions.jsonl".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub prompt: PromptConfig,
    pub postprocess: PostProcessConfig,
    pub safety: SafetyConfig,
    pub paths: PathsConfig,
    pub logging: LoggingConfig,
    pub data_dir: String,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Directory for data storage
    #[arg(long, global = true)]
    pub data_dir: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the HTTP API (default)
    Serve,
    /// Embed the schema metadata and write the vector index
    BuildIndex,
    /// Create empty tables for every table in the schema metadata
    InitDb,
    /// Load every CSV file in a directory into DuckDB tables
    LoadCsv {
        /// Directory containing the CSV files
        dir: PathBuf,
    },
    /// Answer a single question and print the result
    Ask {
        question: String,

        /// Print the generated SQL as well
        #[arg(long)]
        show_sql: bool,

        /// Ask the model for business insights on the result
        #[arg(long)]
        insights: bool,
    },
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config_builder = Config::builder();

        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            let default_locations = [
                "config.toml",
                "config/config.toml",
                "/etc/bank-sql-agent/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        config_builder = config_builder.add_source(
            Environment::with_prefix("BANKSQL")
                .prefix_separator("__")
                .separator("__"),
        );

        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }
        if let Some(data_dir) = &args.data_dir {
            config.data_dir = data_dir.clone();
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that would make the pipeline unsafe or useless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        let top_k = [
            ("retrieval.column_top_k", self.retrieval.column_top_k),
            ("retrieval.table_top_k", self.retrieval.table_top_k),
            ("retrieval.value_top_k", self.retrieval.value_top_k),
            ("retrieval.relationship_top_k", self.retrieval.relationship_top_k),
        ];
        for (key, value) in top_k {
            if value == 0 {
                problems.push(format!("{} must be positive", key));
            }
        }

        if !(0.0..=1.0).contains(&self.postprocess.similarity_threshold) {
            problems.push("postprocess.similarity_threshold must be within [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&self.safety.semantic_overlap_min_ratio) {
            problems.push("safety.semantic_overlap_min_ratio must be within [0, 1]".to_string());
        }
        if self.safety.forbidden_sql_keywords.is_empty() {
            problems.push("safety.forbidden_sql_keywords must not be empty".to_string());
        }
        if self.safety.max_result_rows == 0 {
            problems.push("safety.max_result_rows must be positive".to_string());
        }
        if self.safety.query_timeout_secs == 0 {
            problems.push("safety.query_timeout_secs must be positive".to_string());
        }
        if self.llm.timeout_secs == 0 || self.embedding.timeout_secs == 0 {
            problems.push("llm and embedding timeouts must be positive".to_string());
        }
        if self.database.pool_size == 0 {
            problems.push("database.pool_size must be positive".to_string());
        }
        if self.prompt.max_prompt_chars == 0 || self.prompt.max_context_chars == 0 {
            problems.push("prompt size limits must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Message(problems.join("; ")))
        }
    }

    /// Relative paths are taken to live under `data_dir`.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.data_dir).join(path)
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve_path(&self.database.connection_string)
    }

    pub fn index_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.index_dir)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.audit_log)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            web: WebConfig::default(),
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            prompt: PromptConfig::default(),
            postprocess: PostProcessConfig::default(),
            safety: SafetyConfig::default(),
            paths: PathsConfig::default(),
            logging: LoggingConfig::default(),
            data_dir: "data".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args_for(path: &Path) -> CliArgs {
        CliArgs {
            config: Some(path.to_path_buf()),
            host: None,
            port: Some(8088),
            data_dir: None,
            command: None,
        }
    }

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.safety.max_result_rows, 1000);
        assert_eq!(
            config.postprocess.column_mappings["loan_types"]["loan_type_name"],
            "loan_type"
        );
    }

    #[test]
    fn partial_file_keeps_section_defaults_and_cli_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "data_dir = \"/srv/bank\"\n[llm]\nmodel = \"sqlcoder\"\n[retrieval]\ncolumn_top_k = 3"
        )
        .unwrap();

        let config = AppConfig::new(&args_for(file.path())).unwrap();
        assert_eq!(config.llm.model, "sqlcoder");
        assert_eq!(config.llm.backend, "ollama");
        assert_eq!(config.retrieval.column_top_k, 3);
        assert_eq!(config.retrieval.table_top_k, 4);
        assert_eq!(config.web.port, 8088);
        assert_eq!(config.database_path(), PathBuf::from("/srv/bank/bank.duckdb"));
    }

    #[test]
    fn zero_row_cap_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[safety]\nmax_result_rows = 0").unwrap();

        let err = AppConfig::new(&args_for(file.path())).unwrap_err();
        assert!(err.to_string().contains("max_result_rows"));
    }

    #[test]
    fn threshold_outside_unit_interval_is_rejected() {
        let mut config = AppConfig::default();
        config.postprocess.similarity_threshold = 1.5;
        assert!(config.validate().is_err());
    }
}
