//! DuckDB executor for validated SQL

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime};
use duckdb::types::{TimeUnit, Value as DuckValue};
use duckdb::{Connection, InterruptHandle};
use serde_json::{Number, Value};
use sqlgate_orchestrator::{CollaboratorError, QueryExecutor, QueryResult};
use sqlgate_sql::{strip_comments, tokenize, TokenKind};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("Query timeout")]
    Timeout,

    #[error("Only read-only SELECT statements are executed")]
    NotReadOnly,

    #[error("Connection lock poisoned")]
    Poisoned,

    #[error("Execution task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionBudget {
    pub max_time_ms: Option<u64>,
    pub max_memory_mb: Option<u64>,
    pub max_rows: Option<usize>,
}

/// Hand-off between a blocking query and the timeout waiting on it
#[derive(Default)]
struct QueryGuard {
    state: Mutex<GuardState>,
}

#[derive(Default)]
struct GuardState {
    abandoned: bool,
    interrupt: Option<Arc<InterruptHandle>>,
}

impl QueryGuard {
    /// Register the connection about to run the query. False once the caller
    /// has given up, in which case the query must not start.
    fn begin(&self, conn: &Connection) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.abandoned {
            return false;
        }
        state.interrupt = Some(conn.interrupt_handle());
        true
    }

    fn finish(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.interrupt = None;
        }
    }

    /// Stop the query if it is running, or keep it from starting
    fn abandon(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.abandoned = true;
            if let Some(handle) = state.interrupt.take() {
                handle.interrupt();
            }
        }
    }
}

/// The single path SQL takes to DuckDB. The connection is shared behind a
/// mutex and driven from the blocking pool.
#[derive(Clone)]
pub struct DuckExecutor {
    conn: Arc<Mutex<Connection>>,
    budget: ExecutionBudget,
}

impl DuckExecutor {
    pub fn open_in_memory() -> Result<Self, ExecutionError> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, ExecutionError> {
        let path = path.as_ref();
        info!(database = %path.display(), "Opening DuckDB database");
        Ok(Self::from_connection(Connection::open(path)?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            budget: ExecutionBudget::default(),
        }
    }

    pub fn with_budget(mut self, budget: ExecutionBudget) -> Result<Self, ExecutionError> {
        if let Some(max_memory_mb) = budget.max_memory_mb {
            let pragma = format!("PRAGMA memory_limit='{}MB'", max_memory_mb);
            self.with_connection(|conn| conn.execute_batch(&pragma))??;
        }
        self.budget = budget;
        Ok(self)
    }

    pub fn budget(&self) -> ExecutionBudget {
        self.budget
    }

    /// Run `f` against the locked connection
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> T) -> Result<T, ExecutionError> {
        let conn = self.conn.lock().map_err(|_| ExecutionError::Poisoned)?;
        Ok(f(&conn))
    }

    /// Execute one read-only statement on the calling thread
    pub fn execute(&self, sql: &str) -> Result<QueryResult, ExecutionError> {
        self.execute_guarded(sql, &QueryGuard::default())
    }

    fn execute_guarded(&self, sql: &str, guard: &QueryGuard) -> Result<QueryResult, ExecutionError> {
        ensure_read_only(sql)?;
        let conn = self.conn.lock().map_err(|_| ExecutionError::Poisoned)?;
        if !guard.begin(&conn) {
            return Err(ExecutionError::Timeout);
        }
        let result = run_query(&conn, sql, self.budget.max_rows);
        guard.finish();
        result
    }
}

#[async_trait]
impl QueryExecutor for DuckExecutor {
    async fn execute_query(&self, customer_id: &str, sql: &str) -> Result<QueryResult, CollaboratorError> {
        let executor = self.clone();
        let statement = sql.to_string();
        let guard = Arc::new(QueryGuard::default());
        let task_guard = Arc::clone(&guard);
        let task = tokio::task::spawn_blocking(move || executor.execute_guarded(&statement, &task_guard));

        let joined = match self.budget.max_time_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), task).await {
                Ok(joined) => joined,
                Err(_) => {
                    // Free the connection for the next request
                    guard.abandon();
                    return Err(to_collaborator(ExecutionError::Timeout));
                }
            },
            None => task.await,
        };
        let result = joined
            .map_err(|e| to_collaborator(ExecutionError::Task(e.to_string())))?
            .map_err(to_collaborator)?;

        info!(customer_id, rows = result.row_count, "Query executed");
        Ok(result)
    }
}

fn to_collaborator(error: ExecutionError) -> CollaboratorError {
    warn!(error = %error, "DuckDB execution failed");
    match error {
        ExecutionError::Database(e) => CollaboratorError::Request(e.to_string()),
        other => CollaboratorError::Request(other.to_string()),
    }
}

/// Accept a single SELECT or WITH statement. Quotes and comments are lexed
/// first, so only a top-level `;` ends the statement and only trailing ones
/// are allowed.
fn ensure_read_only(sql: &str) -> Result<(), ExecutionError> {
    let lexed = tokenize(&strip_comments(sql));
    if !lexed.is_well_formed() {
        return Err(ExecutionError::NotReadOnly);
    }

    let tokens = &lexed.tokens;
    let first = tokens.iter().find(|t| t.kind != TokenKind::LParen);
    if !first.is_some_and(|t| t.is_keyword("SELECT") || t.is_keyword("WITH")) {
        return Err(ExecutionError::NotReadOnly);
    }

    let end = tokens
        .iter()
        .position(|t| t.kind == TokenKind::Semicolon)
        .unwrap_or(tokens.len());
    if tokens[end..].iter().any(|t| t.kind != TokenKind::Semicolon) {
        return Err(ExecutionError::NotReadOnly);
    }
    Ok(())
}

fn run_query(conn: &Connection, sql: &str, max_rows: Option<usize>) -> Result<QueryResult, ExecutionError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;

    let columns: Vec<String> = rows
        .as_ref()
        .map(|s| s.column_names().into_iter().map(|n| n.to_string()).collect())
        .unwrap_or_default();

    let mut result_rows = Vec::new();
    while let Some(row) = rows.next()? {
        if let Some(max_rows) = max_rows {
            if result_rows.len() >= max_rows {
                return Err(ExecutionError::BudgetExceeded(format!(
                    "Max rows ({}) exceeded",
                    max_rows
                )));
            }
        }
        let mut json_row = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            let value: DuckValue = row.get(idx)?;
            json_row.push(to_json(value));
        }
        result_rows.push(json_row);
    }

    debug!(columns = columns.len(), rows = result_rows.len(), "Rows collected");
    Ok(QueryResult {
        row_count: result_rows.len(),
        columns,
        rows: result_rows,
    })
}

fn micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn to_json(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(i) => Value::from(i),
        DuckValue::SmallInt(i) => Value::from(i),
        DuckValue::Int(i) => Value::from(i),
        DuckValue::BigInt(i) => Value::from(i),
        DuckValue::HugeInt(i) => i64::try_from(i)
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(i.to_string())),
        DuckValue::UTinyInt(i) => Value::from(i),
        DuckValue::USmallInt(i) => Value::from(i),
        DuckValue::UInt(i) => Value::from(i),
        DuckValue::UBigInt(i) => Value::from(i),
        DuckValue::Float(f) => float(f64::from(f)),
        DuckValue::Double(f) => float(f),
        DuckValue::Decimal(d) => d
            .to_string()
            .parse::<f64>()
            .map(float)
            .unwrap_or_else(|_| Value::String(d.to_string())),
        DuckValue::Text(s) | DuckValue::Enum(s) => Value::String(s),
        DuckValue::Blob(b) => Value::String(format!("<blob {} bytes>", b.len())),
        DuckValue::Date32(days) => NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(i64::from(days))))
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null),
        DuckValue::Timestamp(unit, value) => DateTime::from_timestamp_micros(micros(unit, value))
            .map(|ts| Value::String(ts.naive_utc().format("%Y-%m-%d %H:%M:%S%.f").to_string()))
            .unwrap_or(Value::Null),
        DuckValue::Time64(unit, value) => {
            let us = micros(unit, value);
            let secs = u32::try_from(us / 1_000_000).unwrap_or(0);
            let nanos = u32::try_from((us % 1_000_000) * 1_000).unwrap_or(0);
            NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
                .map(|t| Value::String(t.format("%H:%M:%S%.f").to_string()))
                .unwrap_or(Value::Null)
        }
        DuckValue::List(items) | DuckValue::Array(items) => {
            Value::Array(items.into_iter().map(to_json).collect())
        }
        other => Value::String(format!("{other:?}")),
    }
}
