use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use bank_sql_agent::config::{AppConfig, CliArgs, Command};
use bank_sql_agent::context::{self, AppContext};
use bank_sql_agent::ingest::{self, CsvLoader};
use bank_sql_agent::util::logging::init_tracing;
use bank_sql_agent::web::{self, state::AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration
    let config = AppConfig::new(&args).context("Failed to load configuration")?;
    init_tracing(config.logging.json);

    // Ensure data directory exists
    let data_dir = Path::new(&config.data_dir);
    if !data_dir.exists() {
        info!("Creating data directory: {}", config.data_dir);
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    }

    match args.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::BuildIndex => {
            let build = context::build_index(&config)
                .await
                .context("Failed to build the schema index")?;
            println!(
                "Built index {} with {} ({} dimensions) in {}",
                build.build_id,
                build.embedding_model,
                build.dimensions,
                config.index_dir().display()
            );
            Ok(())
        }
        Command::InitDb => {
            let conn = open_writable(&config)?;
            let metadata = context::load_metadata(&config)?;
            let count = ingest::create_tables(&conn, &metadata)?;
            println!("{} tables ready in {}", count, config.database_path().display());
            Ok(())
        }
        Command::LoadCsv { dir } => {
            let conn = open_writable(&config)?;
            let loaded = CsvLoader::new(&conn)
                .load_dir(&dir)
                .with_context(|| format!("Failed to load CSV files from {}", dir.display()))?;
            for (table, rows) in loaded {
                println!("{}: {} rows", table, rows);
            }
            Ok(())
        }
        Command::Ask {
            question,
            show_sql,
            insights,
        } => {
            let context = AppContext::initialize(config)
                .await
                .context("Failed to start")?;
            let state = context.pipeline.run(&question, None).await;
            if show_sql && !state.generated_sql.is_empty() {
                println!("{}\n", state.generated_sql);
            }
            println!("{}", state.final_output);

            if let (true, Some(result)) = (insights, &state.query_result) {
                let text = context
                    .analyst
                    .insights(&question, result)
                    .await
                    .context("Failed to get insights")?;
                println!("\nInsights:\n{}", text);
            }
            context.pipeline.flush_audit().await;
            Ok(())
        }
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    let web_config = config.web.clone();
    let context = AppContext::initialize(config)
        .await
        .context("Failed to start")?;
    let app_state = Arc::new(AppState::from_context(&context));

    info!("Starting bank-sql-agent on {}:{}", web_config.host, web_config.port);
    web::run_server(web_config, app_state)
        .await
        .context("Server error")?;
    context.pipeline.flush_audit().await;
    info!("Server stopped gracefully");
    Ok(())
}

fn open_writable(config: &AppConfig) -> Result<duckdb::Connection> {
    let path = config.database_path();
    duckdb::Connection::open(&path)
        .with_context(|| format!("Failed to open database {}", path.display()))
}
