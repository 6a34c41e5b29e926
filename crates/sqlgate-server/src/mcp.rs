//! MCP (Model Context Protocol) server implementation

use async_trait::async_trait;
use rust_mcp_schema::{
    schema_utils::CallToolError, CallToolRequest, CallToolResult, ContentBlock, Implementation,
    InitializeResult, ListToolsRequest, ListToolsResult, RpcError, ServerCapabilities,
    ServerCapabilitiesTools, TextContent, Tool, ToolInputSchema, LATEST_PROTOCOL_VERSION,
};
use rust_mcp_sdk::{mcp_server::ServerHandler, McpServer};
use serde_json::{json, Map, Value};
use sqlgate_guardrail::{validate_sql, Expectations, ResidualFilter};
use sqlgate_orchestrator::{
    AskRequest, ClarificationReply, OrchestrationError, Orchestrator, Question,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog::DatabaseSchema;

/// sqlgate MCP Server Handler
pub struct SqlgateServerHandler {
    orchestrator: Arc<Orchestrator>,
    schema: Arc<DatabaseSchema>,
}

impl SqlgateServerHandler {
    pub fn new(orchestrator: Arc<Orchestrator>, schema: Arc<DatabaseSchema>) -> Self {
        Self { orchestrator, schema }
    }

    /// Create server initialization details
    pub fn server_info() -> InitializeResult {
        InitializeResult {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ServerCapabilitiesTools {
                    list_changed: None,
                }),
                ..Default::default()
            },
            server_info: Implementation {
                name: "sqlgate-server".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: Some("sqlgate Natural Language to SQL Server".to_string()),
            },
            instructions: Some(
                "sqlgate Server - Natural language questions answered through approved templates \
                 or validated SQL generation. Use 'ask' to answer a question, 'validate_sql' to \
                 check arbitrary SQL, and 'catalog' to inspect the database."
                    .to_string(),
            ),
            meta: None,
        }
    }

    /// Define available MCP tools
    pub fn tools() -> Vec<Tool> {
        let mut tools = Vec::new();

        // Ask tool
        {
            let mut properties = HashMap::new();
            properties.insert(
                "question".to_string(),
                property("string", "Natural language question (e.g., 'patients with 30% area reduction at 12 weeks')"),
            );
            properties.insert(
                "customer_id".to_string(),
                property("string", "Customer whose dataset the question is scoped to"),
            );
            properties.insert(
                "clarification".to_string(),
                property(
                    "object",
                    "Reply to a previous clarification: the returned filter_state plus answers keyed by clarification id",
                ),
            );

            tools.push(Tool {
                name: "ask".to_string(),
                description: Some(
                    "Answer a natural language question. Routes to an approved template when one matches, \
                     otherwise generates SQL from discovered context. SQL is validated before execution. \
                     Returns the SQL, validation, results, trace, and any clarification needed."
                        .to_string(),
                ),
                input_schema: ToolInputSchema::new(
                    vec!["question".to_string(), "customer_id".to_string()],
                    Some(properties),
                ),
                title: None,
                annotations: None,
                meta: None,
                output_schema: None,
            });
        }

        // Validate tool
        {
            let mut properties = HashMap::new();
            properties.insert("sql".to_string(), property("string", "SQL statement to check"));
            properties.insert(
                "filters".to_string(),
                property("array", "Optional filters the SQL must preserve, as {field, operator, value}"),
            );

            tools.push(Tool {
                name: "validate_sql".to_string(),
                description: Some(
                    "Check SQL for structural correctness (GROUP BY, ORDER BY, aggregate placement). \
                     When filters are given, also checks they are preserved in WHERE clauses."
                        .to_string(),
                ),
                input_schema: ToolInputSchema::new(vec!["sql".to_string()], Some(properties)),
                title: None,
                annotations: None,
                meta: None,
                output_schema: None,
            });
        }

        // Catalog tool
        tools.push(Tool {
            name: "catalog".to_string(),
            description: Some(
                "Get database catalog information including all tables, their columns, column types, \
                 and allowed values for enum-like columns. Returns JSONL with one table per line."
                    .to_string(),
            ),
            input_schema: ToolInputSchema::new(vec![], Some(HashMap::new())),
            title: None,
            annotations: None,
            meta: None,
            output_schema: None,
        });

        tools
    }
}

fn property(kind: &str, description: &str) -> Map<String, Value> {
    let mut prop = Map::new();
    prop.insert("type".to_string(), Value::String(kind.to_string()));
    prop.insert("description".to_string(), Value::String(description.to_string()));
    prop
}

fn text_result(text: String, is_error: bool) -> CallToolResult {
    CallToolResult {
        content: vec![ContentBlock::TextContent(TextContent::new(text, None, None))],
        is_error: is_error.then_some(true),
        meta: None,
        structured_content: None,
    }
}

fn to_pretty(value: &impl serde::Serialize) -> Result<String, CallToolError> {
    serde_json::to_string_pretty(value).map_err(|e| {
        error!("Failed to serialize response: {}", e);
        CallToolError::from_message(format!("Failed to serialize response: {}", e))
    })
}

/// Parse `ask` arguments into a request
pub fn ask_request(args: &Map<String, Value>) -> Result<AskRequest, CallToolError> {
    let question = args
        .get("question")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CallToolError::from_message("Missing required argument: question"))?;
    let customer_id = args
        .get("customer_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CallToolError::from_message("Missing required argument: customer_id"))?;

    let mut request = AskRequest::new(Question::new(question, customer_id));
    if let Some(reply) = args.get("clarification").filter(|v| !v.is_null()) {
        let reply: ClarificationReply = serde_json::from_value(reply.clone())
            .map_err(|e| CallToolError::from_message(format!("Invalid clarification payload: {}", e)))?;
        request = request.with_clarification(reply);
    }
    Ok(request)
}

/// Error body carrying the stage and the trace collected before the failure
pub fn error_body(err: &OrchestrationError) -> Value {
    let mut body = json!({
        "error": err.to_string(),
        "stage": err.stage(),
        "trace": err.trace(),
    });
    if let Some(validation) = err.validation() {
        body["validation"] = json!(validation);
    }
    body
}

/// Structural report for bare SQL; the full guardrail verdict when filters are supplied
pub fn validation_body(args: &Map<String, Value>) -> Result<Value, CallToolError> {
    let sql = args
        .get("sql")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CallToolError::from_message("Missing required argument: sql"))?;

    let filters: Vec<ResidualFilter> = match args.get("filters").filter(|v| !v.is_null()) {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| CallToolError::from_message(format!("Invalid filters: {}", e)))?,
        None => Vec::new(),
    };

    if filters.is_empty() {
        return Ok(json!(sqlgate_sql::validate(sql)));
    }
    let expectations = Expectations {
        filters: &filters,
        ..Default::default()
    };
    Ok(json!(validate_sql(sql, &expectations)))
}

#[async_trait]
impl ServerHandler for SqlgateServerHandler {
    async fn handle_list_tools_request(
        &self,
        _request: ListToolsRequest,
        _runtime: Arc<dyn McpServer>,
    ) -> std::result::Result<ListToolsResult, RpcError> {
        info!("Listing available tools");

        Ok(ListToolsResult {
            tools: Self::tools(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn handle_call_tool_request(
        &self,
        request: CallToolRequest,
        _runtime: Arc<dyn McpServer>,
    ) -> std::result::Result<CallToolResult, CallToolError> {
        info!("Tool called: {}", request.params.name);
        let args = request.params.arguments.clone().unwrap_or_default();

        match request.params.name.as_str() {
            "ask" => self.handle_ask_tool(&args).await,
            "validate_sql" => {
                let body = validation_body(&args)?;
                Ok(text_result(to_pretty(&body)?, false))
            }
            "catalog" => self.handle_catalog_tool(),
            _ => Err(CallToolError::unknown_tool(request.params.name.clone())),
        }
    }
}

impl SqlgateServerHandler {
    async fn handle_ask_tool(&self, args: &Map<String, Value>) -> std::result::Result<CallToolResult, CallToolError> {
        let request = ask_request(args)?;
        info!(
            customer_id = %request.question.customer_id,
            round_trip = request.clarification.is_some(),
            "Answering question: {}",
            request.question.text
        );

        match self.orchestrator.ask(request, CancellationToken::new()).await {
            Ok(result) => {
                info!(
                    request_id = %result.request_id,
                    mode = ?result.mode,
                    requires_clarification = result.requires_clarification,
                    rows = result.result.as_ref().map(|r| r.row_count).unwrap_or(0),
                    "Question answered"
                );
                Ok(text_result(to_pretty(&result)?, false))
            }
            Err(err) => {
                warn!(stage = %err.stage(), "Question failed: {}", err);
                Ok(text_result(to_pretty(&error_body(&err))?, true))
            }
        }
    }

    fn handle_catalog_tool(&self) -> std::result::Result<CallToolResult, CallToolError> {
        // Convert to JSONL format (one table per line)
        let mut jsonl_lines = Vec::with_capacity(self.schema.tables.len());
        for table in &self.schema.tables {
            let table_json = serde_json::to_string(table).map_err(|e| {
                error!("Failed to serialize table: {}", e);
                CallToolError::from_message(format!("Failed to serialize table: {}", e))
            })?;
            jsonl_lines.push(table_json);
        }

        let summary = format!(
            "Database Catalog: {} tables\n\nTables: {}\n\nJSONL Output:\n{}",
            self.schema.tables.len(),
            self.schema.tables.iter().map(|t| t.name.as_str()).collect::<Vec<_>>().join(", "),
            jsonl_lines.join("\n")
        );
        Ok(text_result(summary, false))
    }
}
