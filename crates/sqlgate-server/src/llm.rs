//! OpenAI-backed generation collaborator: SQL, placeholder values and residual filters

use crate::config::GenerationConfig;
use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, ResponseFormat,
    },
    Client,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;
use sqlgate_catalog::Template;
use sqlgate_guardrail::MergedFilterState;
use sqlgate_orchestrator::{
    CollaboratorError, GenerationRequest, GenerationResponse, GenerationService, PlaceholderFill,
    Question, ResidualExtraction,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SQL_PROMPT: &str = r#"You write DuckDB SQL for analytical questions about clinical data.

Reply with ONE JSON object and nothing else, in one of two shapes:

{"sql": "<statement>", "confidence": <0..1>, "assumptions": ["..."]}
{"clarification_needed": "<question for the user>", "options": ["..."], "reasoning": "<why>"}

Rules:
1. A single read-only SELECT (CTEs allowed). Never modify data.
2. Every filter listed under "filters" MUST appear in a WHERE clause as `column <op> value`.
3. When a "template" is given, adapt its SQL rather than starting over; keep its placeholder values.
4. When "snippets" are given with composition_mode "chain", build the query from them in the order given and keep their output column names.
5. With GROUP BY, ORDER BY may only use grouped expressions, their aliases, aggregate aliases or positions.
6. Never nest aggregates (no COUNT(MAX(x))).
7. Ask for clarification rather than guessing when a term cannot be mapped to a column.
"#;

const FILL_PROMPT: &str = r#"You extract placeholder values for a SQL template from a question.

Reply with ONE JSON object and nothing else:
{"values": {"<placeholder>": <value>}, "confidence": <0..1>, "missing": ["<placeholder with no value in the question>"]}

Use the declared type of each placeholder: numbers as JSON numbers, dates as "YYYY-MM-DD", booleans as true/false.
Only use placeholder names that are declared."#;

const EXTRACT_PROMPT: &str = r#"You find constraints in a question that are not already captured by the known filters.

Reply with ONE JSON object and nothing else:
{"filters": [{"field": "<column>", "operator": "=|!=|>|>=|<|<=|IN|NOT IN|LIKE|BETWEEN|IS NULL|IS NOT NULL", "value": <value>, "required": true, "confidence": <0..1>, "original_text": "<phrase from the question>"}],
 "suggestions": [{"original_text": "<phrase>", "options": [{"label": "<meaning>", "filter": {<filter as above>}}]}]}

Give a low confidence when the phrase could mean several things and list the readings under "suggestions".
Return empty arrays when nothing is left over."#;

pub struct OpenAiGeneration {
    client: Client<OpenAIConfig>,
    config: GenerationConfig,
}

impl OpenAiGeneration {
    pub fn new(client: Client<OpenAIConfig>, config: GenerationConfig) -> Self {
        Self { client, config }
    }

    /// Chat until the reply parses as `T` and passes `check`, feeding each
    /// problem back to the model. After the last attempt a reply that parsed
    /// is returned even if `check` still objects.
    async fn complete_json<T, F>(
        &self,
        system: &str,
        user: String,
        cancel: &CancellationToken,
        check: F,
    ) -> Result<T, CollaboratorError>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> Result<(), String>,
    {
        let max_retries = self.config.max_retries.max(1);
        let mut messages = vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system)
                    .build()
                    .map_err(request_error)?,
            ),
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user)
                    .build()
                    .map_err(request_error)?,
            ),
        ];

        let mut last_error = String::from("no attempt made");
        for attempt in 1..=max_retries {
            if cancel.is_cancelled() {
                return Err(CollaboratorError::Cancelled);
            }

            let request = CreateChatCompletionRequestArgs::default()
                .model(self.config.model.as_str())
                .messages(messages.clone())
                .temperature(self.config.temperature)
                .response_format(ResponseFormat::JsonObject)
                .build()
                .map_err(request_error)?;

            let chat = self.client.chat();
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(CollaboratorError::Cancelled),
                response = chat.create(request) => response.map_err(request_error)?,
            };

            let content = response
                .choices
                .first()
                .and_then(|choice| choice.message.content.clone())
                .ok_or_else(|| CollaboratorError::InvalidResponse("No response from OpenAI".to_string()))?;
            debug!(attempt, content = %content, "LLM response");

            let feedback = match parse_reply::<T>(&content) {
                Ok(value) => match check(&value) {
                    Ok(()) => return Ok(value),
                    Err(problem) if attempt == max_retries => {
                        warn!(attempt, problem = %problem, "Returning reply that still fails checks");
                        return Ok(value);
                    }
                    Err(problem) => format!("Error: {problem}. Please fix this and reply again with JSON only."),
                },
                Err(e) => {
                    last_error = e.clone();
                    format!(
                        "Error: failed to parse your reply as the requested JSON ({e}). \
                         Reply again with ONE JSON object and no markdown."
                    )
                }
            };
            warn!(attempt, "Reply rejected, sending feedback to LLM");

            messages.push(ChatCompletionRequestMessage::Assistant(
                ChatCompletionRequestAssistantMessageArgs::default()
                    .content(content)
                    .build()
                    .map_err(request_error)?,
            ));
            messages.push(ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(feedback)
                    .build()
                    .map_err(request_error)?,
            ));
        }

        Err(CollaboratorError::InvalidResponse(format!(
            "Failed to parse reply after {max_retries} attempts: {last_error}"
        )))
    }
}

fn request_error(e: impl std::fmt::Display) -> CollaboratorError {
    CollaboratorError::Request(e.to_string())
}

/// The JSON object in a reply, tolerating markdown fences and surrounding prose
pub fn extract_json(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (end > start).then(|| &content[start..=end])
}

fn parse_reply<T: DeserializeOwned>(content: &str) -> Result<T, String> {
    let body = extract_json(content).ok_or_else(|| "no JSON object found".to_string())?;
    serde_json::from_str(body).map_err(|e| e.to_string())
}

/// Problems worth sending back before the guardrails see the SQL
pub fn review_generation(response: &GenerationResponse, request: &GenerationRequest) -> Result<(), String> {
    let GenerationResponse::Sql { sql, .. } = response else {
        return Ok(());
    };
    let report = sqlgate_sql::validate(sql);
    let mut problems: Vec<String> = report
        .errors
        .iter()
        .map(|e| match &e.suggestion {
            Some(s) => format!("{}: {} ({s})", e.kind, e.message),
            None => format!("{}: {}", e.kind, e.message),
        })
        .collect();

    for filter in &request.filters {
        if filter.required && !sqlgate_guardrail::filter_preserved(filter, &report.all_where_clauses) {
            problems.push(format!(
                "required filter {} {} {} is missing from the WHERE clause",
                filter.field, filter.operator, filter.value
            ));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems.join("; "))
    }
}

pub fn generation_prompt(request: &GenerationRequest) -> String {
    let payload = json!({
        "question": request.question.text,
        "template": request.template,
        "snippets": request.snippets,
        "composition_mode": request.composition_mode,
        "filters": request.filters,
        "context": request.context,
        "clarifications": request.clarifications,
    });
    serde_json::to_string_pretty(&payload).unwrap_or_else(|_| request.question.text.clone())
}

pub fn fill_prompt(question: &Question, template: &Template) -> String {
    let payload = json!({
        "question": question.text,
        "template": template.name,
        "sql": template.sql,
        "placeholders": template.placeholders,
    });
    serde_json::to_string_pretty(&payload).unwrap_or_else(|_| question.text.clone())
}

pub fn extraction_prompt(question: &Question, known: &MergedFilterState) -> String {
    let payload = json!({
        "question": question.text,
        "known_filters": known.entries().iter().map(|m| &m.filter).collect::<Vec<_>>(),
    });
    serde_json::to_string_pretty(&payload).unwrap_or_else(|_| question.text.clone())
}

#[async_trait]
impl GenerationService for OpenAiGeneration {
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse, CollaboratorError> {
        info!(
            customer_id = %request.question.customer_id,
            template = request.template.as_ref().map(|t| t.id.as_str()).unwrap_or("-"),
            filters = request.filters.len(),
            "Generating SQL"
        );
        self.complete_json(SQL_PROMPT, generation_prompt(request), cancel, |response| {
            review_generation(response, request)
        })
        .await
    }

    async fn fill_placeholders(
        &self,
        question: &Question,
        template: &Template,
        cancel: &CancellationToken,
    ) -> Result<PlaceholderFill, CollaboratorError> {
        let mut fill: PlaceholderFill = self
            .complete_json(FILL_PROMPT, fill_prompt(question, template), cancel, |fill: &PlaceholderFill| {
                match fill.values.keys().find(|name| template.placeholder(name).is_none()) {
                    Some(name) => Err(format!("'{name}' is not a declared placeholder")),
                    None => Ok(()),
                }
            })
            .await?;
        fill.values.retain(|name, _| template.placeholder(name).is_some());
        Ok(fill)
    }

    async fn extract_filters(
        &self,
        question: &Question,
        known: &MergedFilterState,
        cancel: &CancellationToken,
    ) -> Result<ResidualExtraction, CollaboratorError> {
        self.complete_json(
            EXTRACT_PROMPT,
            extraction_prompt(question, known),
            cancel,
            |_: &ResidualExtraction| Ok(()),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlgate_guardrail::{FilterOperator, ResidualFilter};

    fn request(filters: Vec<ResidualFilter>) -> GenerationRequest {
        GenerationRequest {
            question: Question::new("Show patients with 30% area reduction at 12 weeks", "acme"),
            context: None,
            template: None,
            snippets: vec![],
            composition_mode: None,
            filters,
            clarifications: vec![],
        }
    }

    #[test]
    fn test_extract_json_from_fenced_reply() {
        let reply = "Here you go:\n```json\n{\"sql\": \"SELECT 1\", \"confidence\": 0.8}\n```";
        assert_eq!(extract_json(reply), Some("{\"sql\": \"SELECT 1\", \"confidence\": 0.8}"));
        assert_eq!(extract_json("no json"), None);

        let parsed: GenerationResponse = parse_reply(reply).unwrap();
        assert!(matches!(parsed, GenerationResponse::Sql { confidence, .. } if confidence == 0.8));
    }

    #[test]
    fn test_review_reports_structure_and_dropped_filters() {
        let req = request(vec![ResidualFilter::new("weeks", FilterOperator::Eq, json!(12))]);

        let broken = GenerationResponse::Sql {
            sql: "SELECT region, COUNT(*) FROM t GROUP BY region ORDER BY status".to_string(),
            confidence: 0.7,
            assumptions: vec![],
        };
        let problems = review_generation(&broken, &req).unwrap_err();
        assert!(problems.contains("GROUP_BY_VIOLATION"));
        assert!(problems.contains("weeks"));

        let fine = GenerationResponse::Sql {
            sql: "SELECT patient_id FROM wound_area WHERE weeks = 12".to_string(),
            confidence: 0.9,
            assumptions: vec![],
        };
        assert!(review_generation(&fine, &req).is_ok());
    }

    #[test]
    fn test_prompts_carry_filters_and_placeholders() {
        let req = request(vec![ResidualFilter::new("patient_tier", FilterOperator::Eq, json!("premium"))]);
        let prompt = generation_prompt(&req);
        assert!(prompt.contains("patient_tier"));
        assert!(prompt.contains("30% area reduction"));
        assert!(SQL_PROMPT.contains("WHERE"));
    }
}
