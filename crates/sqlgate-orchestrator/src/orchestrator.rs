//! Question routing state machine
//!
//! `matching -> {template_execute | discovery} -> generation -> validation -> execution`,
//! ending in a result, a clarification request, or a typed error carrying the trace.

use crate::clarification::{
    apply_answers, request_for_unresolved, request_from_generation, ClarificationReply,
    ClarificationRequest,
};
use crate::config::OrchestratorConfig;
use crate::error::{CollaboratorError, Failure, OrchestrationError};
use crate::services::{DiscoveryService, GenerationService, QueryExecutor};
use crate::trace::{Stage, StepStatus, StepTimer, Trace};
use crate::types::{
    CompositionMode, ContextBundle, GenerationRequest, GenerationResponse, QueryResult, Question,
    SnippetReference, TemplateReference,
};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use sqlgate_catalog::{
    supports_composition, CatalogEntry, ChainRegistry, Snippet, TemplateCatalog, TemplateScorer,
};
use sqlgate_guardrail::{
    validate_composition, validate_filter, validate_sql, Expectations, FilterIssue,
    FilterOperator, FilterSource, MergedFilterState, ResidualFilter, SchemaCatalog, Severity,
    SqlValidationResult,
};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    TemplateReference,
    SnippetComposition,
    FullGeneration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: Question,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<ClarificationReply>,
}

impl AskRequest {
    pub fn new(question: Question) -> Self {
        Self {
            question,
            clarification: None,
        }
    }

    pub fn with_clarification(mut self, reply: ClarificationReply) -> Self {
        self.clarification = Some(reply);
        self
    }
}

/// Externally visible outcome of one question
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub request_id: Uuid,
    pub mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composition_mode: Option<CompositionMode>,
    pub trace: Trace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<SqlValidationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<QueryResult>,
    pub requires_clarification: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<ClarificationRequest>,
    pub filter_state: MergedFilterState,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

struct TemplateSelection {
    entry: CatalogEntry,
    score: f64,
}

struct GenerationPlan {
    context: Option<ContextBundle>,
    template: Option<TemplateReference>,
    snippets: Vec<Snippet>,
    composition_warnings: Vec<String>,
    token: CancellationToken,
}

struct Candidate {
    sql: String,
    filters: Vec<ResidualFilter>,
    snippets: Vec<Snippet>,
    snippets_required: bool,
    composition_warnings: Vec<String>,
}

struct Completion {
    sql: String,
    validation: SqlValidationResult,
    rows: QueryResult,
}

enum Outcome {
    Clarification(ClarificationRequest),
    Done(Completion),
}

enum State {
    Matching,
    TemplateExecute(TemplateSelection),
    Discovery,
    Generation(GenerationPlan),
    Validation(Candidate),
    Execution(Candidate, SqlValidationResult),
    Finished(Outcome),
}

impl State {
    fn stage(&self) -> Stage {
        match self {
            State::Matching => Stage::Matching,
            State::TemplateExecute(_) => Stage::TemplateExecute,
            State::Discovery => Stage::Discovery,
            State::Generation(_) => Stage::Generation,
            State::Validation(_) => Stage::Validation,
            State::Execution(..) => Stage::Execution,
            State::Finished(Outcome::Clarification(_)) => Stage::Clarification,
            State::Finished(Outcome::Done(_)) => Stage::Execution,
        }
    }

    fn is_finished(&self) -> bool {
        matches!(self, State::Finished(_))
    }
}

struct Transition {
    next: State,
    status: StepStatus,
    detail: Option<String>,
    skipped: Option<(Stage, String)>,
}

impl Transition {
    fn to(next: State, detail: impl Into<String>) -> Self {
        Self {
            next,
            status: StepStatus::Completed,
            detail: Some(detail.into()),
            skipped: None,
        }
    }

    fn degraded(mut self) -> Self {
        self.status = StepStatus::Degraded;
        self
    }

    fn skipping(mut self, stage: Stage, detail: impl Into<String>) -> Self {
        self.skipped = Some((stage, detail.into()));
        self
    }
}

/// Per-request working state
struct Run {
    request_id: Uuid,
    question: Question,
    reply: Option<ClarificationReply>,
    round_trip: bool,
    trace: Trace,
    filter_state: MergedFilterState,
    mode: ExecutionMode,
    template_id: Option<String>,
    composition_mode: Option<CompositionMode>,
    assumptions: Vec<String>,
    warnings: Vec<String>,
    notes: Vec<String>,
    confidence: Option<f64>,
}

impl Run {
    fn new(request: AskRequest) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            round_trip: request.clarification.is_some(),
            question: request.question,
            reply: request.clarification,
            trace: Trace::default(),
            filter_state: MergedFilterState::new(),
            mode: ExecutionMode::FullGeneration,
            template_id: None,
            composition_mode: None,
            assumptions: Vec::new(),
            warnings: Vec::new(),
            notes: Vec::new(),
            confidence: None,
        }
    }

    fn into_result(self) -> OrchestrationResult {
        OrchestrationResult {
            request_id: self.request_id,
            mode: self.mode,
            template_id: self.template_id,
            composition_mode: self.composition_mode,
            trace: self.trace,
            sql: None,
            validation: None,
            result: None,
            requires_clarification: false,
            clarification: None,
            filter_state: self.filter_state,
            assumptions: self.assumptions,
            warnings: self.warnings,
            confidence: self.confidence,
        }
    }
}

pub struct Orchestrator {
    catalog: Arc<TemplateCatalog>,
    chains: Arc<ChainRegistry>,
    schema: Arc<dyn SchemaCatalog>,
    discovery: Arc<dyn DiscoveryService>,
    generation: Arc<dyn GenerationService>,
    executor: Arc<dyn QueryExecutor>,
    scorer: TemplateScorer,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<TemplateCatalog>,
        schema: Arc<dyn SchemaCatalog>,
        discovery: Arc<dyn DiscoveryService>,
        generation: Arc<dyn GenerationService>,
        executor: Arc<dyn QueryExecutor>,
    ) -> Self {
        Self {
            catalog,
            chains: Arc::new(ChainRegistry::builtin()),
            schema,
            discovery,
            generation,
            executor,
            scorer: TemplateScorer::default(),
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_chains(mut self, chains: Arc<ChainRegistry>) -> Self {
        self.chains = chains;
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_scorer(mut self, scorer: TemplateScorer) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Answer one question. `cancel` is checked at every stage boundary; a
    /// token cancelled up front fails before any collaborator is called.
    pub async fn ask(
        &self,
        request: AskRequest,
        cancel: CancellationToken,
    ) -> Result<OrchestrationResult, OrchestrationError> {
        let mut run = Run::new(request);
        info!(
            request_id = %run.request_id,
            customer_id = %run.question.customer_id,
            round_trip = run.round_trip,
            "Question received"
        );

        // Work for the discovery/full-generation path; cancelled once the template path commits
        let expensive = cancel.child_token();
        let mut state = State::Matching;

        loop {
            let stage = state.stage();
            if !state.is_finished() && cancel.is_cancelled() {
                return Err(self.fail(run, StepTimer::start(stage), Failure::Cancelled(stage)));
            }

            let timer = StepTimer::start(stage);
            let current = match state {
                State::Finished(outcome) => return Ok(self.finish(run, timer, outcome)),
                current => current,
            };

            // A panicking collaborator fails this question, not the caller
            let outcome = match AssertUnwindSafe(self.step(&mut run, current, &cancel, &expensive))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic) => Err(Failure::Internal {
                    stage,
                    message: format!("stage panicked: {}", panic_message(panic.as_ref())),
                }),
            };

            match outcome {
                Ok(transition) => {
                    debug!(request_id = %run.request_id, stage = %stage, "Stage completed");
                    run.trace.record(timer, transition.status, transition.detail);
                    if let Some((skipped, detail)) = transition.skipped {
                        run.trace.skip(skipped, detail);
                    }
                    state = transition.next;
                }
                Err(failure) => return Err(self.fail(run, timer, failure)),
            }
        }
    }

    async fn step(
        &self,
        run: &mut Run,
        state: State,
        cancel: &CancellationToken,
        expensive: &CancellationToken,
    ) -> Result<Transition, Failure> {
        match state {
            State::Matching => Ok(self.run_matching(run)),
            State::TemplateExecute(selection) => self.run_template(run, selection, cancel, expensive).await,
            State::Discovery => self.run_discovery(run, expensive).await,
            State::Generation(plan) => self.run_generation(run, plan).await,
            State::Validation(candidate) => self.run_validation(candidate),
            State::Execution(candidate, validation) => self.run_execution(run, candidate, validation).await,
            State::Finished(_) => Err(Failure::Internal {
                stage: Stage::Execution,
                message: "finished question stepped again".to_string(),
            }),
        }
    }

    fn fail(&self, mut run: Run, timer: StepTimer, failure: Failure) -> OrchestrationError {
        error!(
            request_id = %run.request_id,
            stage = %failure.stage(),
            error = %failure,
            "Orchestration failed"
        );
        run.trace.record(timer, StepStatus::Failed, Some(failure.to_string()));
        failure.into_error(run.trace)
    }

    fn finish(&self, mut run: Run, timer: StepTimer, outcome: Outcome) -> OrchestrationResult {
        match outcome {
            Outcome::Clarification(request) => {
                run.trace.record(
                    timer,
                    StepStatus::Completed,
                    Some(format!("{} clarification(s) requested", request.entries.len())),
                );
                info!(
                    request_id = %run.request_id,
                    entries = request.entries.len(),
                    "Clarification required"
                );
                let mut result = run.into_result();
                result.requires_clarification = true;
                result.clarification = Some(request);
                result
            }
            Outcome::Done(done) => {
                info!(
                    request_id = %run.request_id,
                    verdict = %done.validation.verdict,
                    rows = done.rows.row_count,
                    "Question answered"
                );
                let mut result = run.into_result();
                result.sql = Some(done.sql);
                result.validation = Some(done.validation);
                result.result = Some(done.rows);
                result
            }
        }
    }

    fn run_matching(&self, run: &mut Run) -> Transition {
        if let Some(reply) = run.reply.take() {
            let timer = StepTimer::start(Stage::Clarification);
            run.filter_state = reply.filter_state;
            run.notes = apply_answers(&mut run.filter_state, &reply.answers);
            run.trace.record(
                timer,
                StepStatus::Completed,
                Some(format!("{} answer(s) merged", reply.answers.len())),
            );
        }

        let ranked = self.scorer.rank(&run.question.text, self.catalog.approved());
        let Some(best) = ranked.first() else {
            return Transition::to(State::Discovery, "no approved template matched");
        };

        let template = best.template();
        let is_fragment = best.entry.is_snippet()
            || template
                .tags
                .iter()
                .any(|t| t.eq_ignore_ascii_case("fragment") || t.eq_ignore_ascii_case("snippet"));
        let threshold = if is_fragment {
            self.config.snippet_threshold
        } else {
            self.config.template_threshold
        };

        info!(
            request_id = %run.request_id,
            template_id = %template.id,
            score = best.score,
            threshold,
            "Best template match"
        );

        if best.score < threshold {
            return Transition::to(
                State::Discovery,
                format!("best template {} scored {:.2} below {:.2}", template.id, best.score, threshold),
            );
        }
        if !self.config.allows_intent(&template.intent) {
            return Transition::to(
                State::Discovery,
                format!("template {} intent {} is not allowed", template.id, template.intent),
            );
        }

        run.template_id = Some(template.id.clone());
        let detail = format!("template {} scored {:.2}", template.id, best.score);
        Transition::to(
            State::TemplateExecute(TemplateSelection {
                entry: best.entry.clone(),
                score: best.score,
            }),
            detail,
        )
    }

    async fn run_template(
        &self,
        run: &mut Run,
        selection: TemplateSelection,
        cancel: &CancellationToken,
        expensive: &CancellationToken,
    ) -> Result<Transition, Failure> {
        let template = selection.entry.template();

        let fill = match self
            .generation
            .fill_placeholders(&run.question, template, expensive)
            .await
        {
            Ok(fill) => fill,
            Err(CollaboratorError::Cancelled) => return Err(Failure::Cancelled(Stage::TemplateExecute)),
            Err(e) => {
                warn!(template_id = %template.id, error = %e, "Placeholder fill failed");
                run.template_id = None;
                return Ok(Transition::to(
                    State::Discovery,
                    format!("placeholder fill failed ({e}); falling back to full generation"),
                )
                .degraded());
            }
        };

        // The template path is committed from here on
        expensive.cancel();

        for (name, value) in &fill.values {
            let filter = ResidualFilter {
                field: name.clone(),
                operator: FilterOperator::Eq,
                value: value.clone(),
                required: true,
                confidence: fill.confidence,
                original_text: String::new(),
            };
            run.filter_state.add(filter, FilterSource::TemplatePlaceholder, true);
        }
        if !fill.missing.is_empty() {
            run.assumptions.push(format!(
                "No value found for placeholder(s): {}",
                fill.missing.join(", ")
            ));
        }

        let sql = match template.render(&fill.values) {
            Ok(sql) => sql,
            Err(e) => {
                run.assumptions.push(format!("Template used unrendered: {e}"));
                template.sql.clone()
            }
        };
        let reference = TemplateReference {
            id: template.id.clone(),
            version: template.version,
            name: template.name.clone(),
            intent: template.intent.clone(),
            sql,
            placeholder_values: fill.values.clone(),
        };

        if !supports_composition(&template.intent) {
            run.mode = ExecutionMode::TemplateReference;
            let plan = GenerationPlan {
                context: None,
                template: Some(reference),
                snippets: Vec::new(),
                composition_warnings: Vec::new(),
                token: cancel.clone(),
            };
            return Ok(Transition::to(
                State::Generation(plan),
                format!("template {} used as reference (score {:.2})", template.id, selection.score),
            )
            .skipping(Stage::Discovery, "template path selected"));
        }

        let snippets = self.match_snippets(&run.question.text, &template.intent);
        let user_tokens: Vec<String> = fill.values.keys().cloned().collect();
        let (mode, composition_warnings) = if snippets.is_empty() {
            (CompositionMode::TemplateOnly, Vec::new())
        } else {
            let refs: Vec<&Snippet> = snippets.iter().collect();
            let report = validate_composition(
                &refs,
                &template.intent,
                self.chains.for_intent(&template.intent),
                &user_tokens,
            );
            if report.valid {
                (CompositionMode::Chain, Vec::new())
            } else {
                let warnings = report
                    .violations
                    .iter()
                    .map(|v| match &v.suggestion {
                        Some(s) => format!("{} ({s})", v.message),
                        None => v.message.clone(),
                    })
                    .collect();
                (CompositionMode::Guided, warnings)
            }
        };
        run.composition_mode = Some(mode);
        run.mode = match mode {
            CompositionMode::TemplateOnly => ExecutionMode::TemplateReference,
            CompositionMode::Chain | CompositionMode::Guided => ExecutionMode::SnippetComposition,
        };
        debug!(mode = ?mode, snippets = snippets.len(), "Composition mode selected");

        let suggestions = if run.round_trip {
            Vec::new()
        } else {
            let extraction = self
                .generation
                .extract_filters(&run.question, &run.filter_state, cancel)
                .await
                .map_err(|source| match source {
                    CollaboratorError::Cancelled => Failure::Cancelled(Stage::TemplateExecute),
                    source => Failure::Collaborator {
                        stage: Stage::TemplateExecute,
                        service: "filter extraction",
                        source,
                    },
                })?;
            for filter in extraction.filters {
                run.filter_state.add(filter, FilterSource::ResidualExtraction, false);
            }
            extraction.suggestions
        };

        if cancel.is_cancelled() {
            return Err(Failure::Cancelled(Stage::TemplateExecute));
        }

        let unresolved = self.validate_unresolved(run, Stage::TemplateExecute)?;
        if !unresolved.is_empty() {
            let request = request_for_unresolved(&mut run.filter_state, &unresolved, &suggestions);
            return Ok(Transition::to(
                State::Finished(Outcome::Clarification(request)),
                format!("{} filter(s) unresolved", unresolved.len()),
            )
            .skipping(Stage::Discovery, "template path selected"));
        }

        let plan = GenerationPlan {
            context: None,
            template: Some(reference),
            snippets,
            composition_warnings,
            token: cancel.clone(),
        };
        Ok(Transition::to(
            State::Generation(plan),
            format!("template {} with {:?} composition", template.id, mode),
        )
        .skipping(Stage::Discovery, "template path selected"))
    }

    async fn run_discovery(
        &self,
        run: &mut Run,
        expensive: &CancellationToken,
    ) -> Result<Transition, Failure> {
        run.mode = ExecutionMode::FullGeneration;
        run.template_id = None;

        let (context, degraded) = match self.discovery.discover(&run.question, expensive).await {
            Ok(context) => (context, None),
            Err(CollaboratorError::Cancelled) => return Err(Failure::Cancelled(Stage::Discovery)),
            Err(e) => {
                warn!(customer_id = %run.question.customer_id, error = %e, "Discovery failed; using minimal context");
                (
                    ContextBundle::minimal(run.question.customer_id.clone()),
                    Some(format!("discovery failed ({e}); minimal context used")),
                )
            }
        };
        if expensive.is_cancelled() {
            return Err(Failure::Cancelled(Stage::Discovery));
        }

        for filter in &context.intent.filters {
            run.filter_state.add(filter.clone(), FilterSource::SemanticMapping, true);
        }

        let unresolved = self.validate_unresolved(run, Stage::Discovery)?;
        if !unresolved.is_empty() {
            let request = request_for_unresolved(&mut run.filter_state, &unresolved, &[]);
            return Ok(Transition::to(
                State::Finished(Outcome::Clarification(request)),
                format!("{} filter(s) unresolved", unresolved.len()),
            ));
        }

        let detail = format!(
            "{} field candidate(s), confidence {:.2}",
            context.fields.len(),
            context.overall_confidence
        );
        let plan = GenerationPlan {
            context: Some(context),
            template: None,
            snippets: Vec::new(),
            composition_warnings: Vec::new(),
            token: expensive.clone(),
        };
        Ok(match degraded {
            Some(reason) => Transition::to(State::Generation(plan), reason).degraded(),
            None => Transition::to(State::Generation(plan), detail),
        })
    }

    async fn run_generation(
        &self,
        run: &mut Run,
        plan: GenerationPlan,
    ) -> Result<Transition, Failure> {
        let filters = enforced_filters(&run.filter_state);
        let request = GenerationRequest {
            question: run.question.clone(),
            context: plan.context,
            template: plan.template,
            snippets: plan.snippets.iter().map(snippet_reference).collect(),
            composition_mode: run.composition_mode,
            filters: filters.clone(),
            clarifications: run.notes.clone(),
        };

        let response = self
            .generation
            .generate(&request, &plan.token)
            .await
            .map_err(|source| match source {
                CollaboratorError::Cancelled => Failure::Cancelled(Stage::Generation),
                source => Failure::Collaborator {
                    stage: Stage::Generation,
                    service: "generation",
                    source,
                },
            })?;
        if plan.token.is_cancelled() {
            return Err(Failure::Cancelled(Stage::Generation));
        }

        match response {
            GenerationResponse::Sql {
                sql,
                confidence,
                assumptions,
            } => {
                run.assumptions.extend(assumptions);
                run.confidence = Some(confidence);
                let candidate = Candidate {
                    sql,
                    filters,
                    snippets_required: run.composition_mode == Some(CompositionMode::Chain),
                    snippets: plan.snippets,
                    composition_warnings: plan.composition_warnings,
                };
                Ok(Transition::to(
                    State::Validation(candidate),
                    format!("SQL generated (confidence {confidence:.2})"),
                ))
            }
            GenerationResponse::Clarification {
                clarification_needed,
                options,
                reasoning,
            } => {
                let request = request_from_generation(&clarification_needed, &options, &reasoning);
                Ok(Transition::to(
                    State::Finished(Outcome::Clarification(request)),
                    "generation requested clarification",
                ))
            }
        }
    }

    fn run_validation(&self, candidate: Candidate) -> Result<Transition, Failure> {
        let refs: Vec<&Snippet> = candidate.snippets.iter().collect();
        let mut validation = validate_sql(
            &candidate.sql,
            &Expectations {
                filters: &candidate.filters,
                snippets: &refs,
                snippets_required: candidate.snippets_required,
            },
        );
        validation
            .warnings
            .extend(candidate.composition_warnings.iter().cloned());

        info!(
            verdict = %validation.verdict,
            errors = validation.structural.errors.len(),
            dropped_filters = validation.dropped_filters.len(),
            "Generated SQL validated"
        );

        if validation.is_reject() {
            return Err(Failure::Rejected {
                sql: candidate.sql,
                validation: Box::new(validation),
            });
        }

        let detail = format!("verdict {}", validation.verdict);
        Ok(Transition::to(State::Execution(candidate, validation), detail))
    }

    async fn run_execution(
        &self,
        run: &Run,
        candidate: Candidate,
        validation: SqlValidationResult,
    ) -> Result<Transition, Failure> {
        let rows = match self
            .executor
            .execute_query(&run.question.customer_id, &candidate.sql)
            .await
        {
            Ok(rows) => rows,
            Err(source) => {
                return Err(Failure::Execution {
                    sql: candidate.sql,
                    source,
                })
            }
        };

        let detail = format!("{} row(s)", rows.row_count);
        Ok(Transition::to(
            State::Finished(Outcome::Done(Completion {
                sql: candidate.sql,
                validation,
                rows,
            })),
            detail,
        ))
    }

    /// Approved snippets of `intent` above the snippet threshold, best first,
    /// capped, then placed in chain order
    fn match_snippets(&self, question: &str, intent: &str) -> Vec<Snippet> {
        let chain = self.chains.for_intent(intent);
        let mut scored: Vec<(f64, &Snippet)> = self
            .catalog
            .snippets_for_intent(intent)
            .into_iter()
            .map(|s| (self.scorer.score(question, &s.template).total, s))
            .filter(|(score, _)| *score >= self.config.snippet_threshold)
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(self.config.max_snippets);
        scored.sort_by_key(|(_, s)| {
            chain
                .and_then(|c| c.index_of(&s.template.id))
                .unwrap_or(usize::MAX)
        });
        scored.into_iter().map(|(_, s)| s.clone()).collect()
    }

    /// Validate filters not yet resolved. Entries that pass with enough
    /// confidence are marked resolved; the rest are returned with their errors.
    fn validate_unresolved(
        &self,
        run: &mut Run,
        stage: Stage,
    ) -> Result<Vec<(usize, Vec<FilterIssue>)>, Failure> {
        let mut unresolved = Vec::new();

        for index in run.filter_state.unresolved() {
            let Some(entry) = run.filter_state.get(index) else {
                return Err(Failure::Internal {
                    stage,
                    message: format!("filter state has no entry {index}"),
                });
            };
            let confidence = entry.confidence;
            let issues = validate_filter(&entry.filter, self.schema.as_ref());
            let (errors, warnings): (Vec<_>, Vec<_>) = issues
                .into_iter()
                .partition(|i| i.severity == Severity::Error);
            run.warnings.extend(warnings.into_iter().map(|w| w.message));

            if errors.is_empty() && confidence >= self.config.filter_confidence_threshold {
                run.filter_state.mark_resolved(index);
            } else {
                unresolved.push((index, errors));
            }
        }

        Ok(unresolved)
    }
}

/// Filters the generated SQL must carry: residual or user-supplied filters that
/// validated, excluding ones already bound through template placeholders
fn enforced_filters(state: &MergedFilterState) -> Vec<ResidualFilter> {
    state
        .entries()
        .iter()
        .filter(|m| m.resolved)
        .filter(|m| !m.has_source(FilterSource::TemplatePlaceholder))
        .filter(|m| {
            m.has_source(FilterSource::ResidualExtraction)
                || m.has_source(FilterSource::UserClarification)
        })
        .map(|m| m.filter.clone())
        .collect()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn snippet_reference(snippet: &Snippet) -> SnippetReference {
    SnippetReference {
        id: snippet.template.id.clone(),
        sql: snippet.template.sql.clone(),
        inputs: snippet.inputs.clone(),
        outputs: snippet.outputs.clone(),
    }
}
