//! sqlgate MCP Server with OpenAI integration
//!
//! Model Context Protocol server that answers natural language questions
//! through approved SQL templates or validated generation, and executes the
//! result against DuckDB.

use async_openai::config::OpenAIConfig;
use rust_mcp_sdk::mcp_server::{hyper_server, HyperServerOptions};
use sqlgate_catalog::{ChainRegistry, TemplateCatalog};
use sqlgate_duck::{DuckExecutor, ExecutionBudget};
use sqlgate_orchestrator::Orchestrator;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

mod catalog;
mod config;
mod llm;
mod logging;
mod mcp;

use catalog::{DatabaseSchema, SchemaDiscovery};
use config::Config;

const CONFIG_PATH: &str = "config.yaml";

fn load_config() -> anyhow::Result<Config> {
    let path = std::env::var("SQLGATE_CONFIG").unwrap_or_else(|_| CONFIG_PATH.to_string());
    if Path::new(&path).exists() {
        Ok(Config::load(&path)?)
    } else {
        Ok(Config::from_env()?)
    }
}

fn load_templates(path: Option<&str>) -> anyhow::Result<TemplateCatalog> {
    let Some(path) = path.filter(|p| Path::new(p).exists()) else {
        warn!(path = ?path, "Template catalog not found; every question goes through full generation");
        return Ok(TemplateCatalog::new());
    };

    let (catalog, report) = TemplateCatalog::load(path)?;
    if report.loaded == 0 {
        warn!(path, skipped = report.skipped.len(), "Template catalog has no usable entries");
    }
    Ok(catalog)
}

fn load_chains(path: Option<&str>) -> anyhow::Result<ChainRegistry> {
    match path {
        Some(path) => {
            let chains = ChainRegistry::load(path)?;
            info!(path, chains = chains.len(), "Composition chains loaded");
            Ok(chains)
        }
        None => Ok(ChainRegistry::builtin()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = load_config()?;
    logging::init(&config.logging);

    // Open the database the validated SQL runs against
    let executor = match config.execution.database.as_deref() {
        Some(path) => DuckExecutor::open(path)?,
        None => DuckExecutor::open_in_memory()?,
    }
    .with_budget(ExecutionBudget {
        max_time_ms: config.execution.max_time_ms,
        max_memory_mb: config.execution.max_memory_mb,
        max_rows: config.execution.max_rows,
    })?;

    let schema = Arc::new(executor.with_connection(DatabaseSchema::from_connection)??);
    let fields = schema.schema_catalog();
    info!(tables = schema.tables.len(), fields = fields.len(), "Schema catalog ready");

    let templates = load_templates(config.catalog.templates.as_deref())?;
    let chains = load_chains(config.catalog.chains.as_deref())?;

    // Create OpenAI client
    let api_key = Config::openai_api_key()?;
    let openai_client = async_openai::Client::with_config(OpenAIConfig::new().with_api_key(api_key));
    info!(model = %config.generation.model, "Using OpenAI model");

    let orchestrator = Orchestrator::new(
        Arc::new(templates),
        Arc::new(fields),
        Arc::new(SchemaDiscovery::new(Arc::clone(&schema))),
        Arc::new(llm::OpenAiGeneration::new(openai_client, config.generation.clone())),
        Arc::new(executor),
    )
    .with_chains(Arc::new(chains))
    .with_config(config.routing.clone());

    // Create MCP server handler
    let handler = mcp::SqlgateServerHandler::new(Arc::new(orchestrator), schema);
    let server_info = mcp::SqlgateServerHandler::server_info();

    info!("Starting sqlgate MCP server on {}:{}", config.server.host, config.server.port);
    info!("Protocol: MCP with SSE (Server-Sent Events) support");

    // Create MCP server with SSE support
    let server = hyper_server::create_server(
        server_info,
        handler,
        HyperServerOptions {
            host: config.server.host.clone(),
            port: config.server.port,
            sse_support: true,
            ..Default::default()
        },
    );

    server
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server failed: {}", e))?;

    Ok(())
}
