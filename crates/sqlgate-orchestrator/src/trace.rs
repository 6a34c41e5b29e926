//! Advisory step trace returned with every result

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Matching,
    TemplateExecute,
    Discovery,
    Generation,
    Validation,
    Execution,
    Clarification,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Matching => "matching",
            Stage::TemplateExecute => "template_execute",
            Stage::Discovery => "discovery",
            Stage::Generation => "generation",
            Stage::Validation => "validation",
            Stage::Execution => "execution",
            Stage::Clarification => "clarification",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Skipped,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    pub stage: Stage,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub steps: Vec<TraceStep>,
}

/// Running timer for one stage
#[derive(Debug)]
pub struct StepTimer {
    stage: Stage,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl StepTimer {
    pub fn start(stage: Stage) -> Self {
        Self {
            stage,
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }
}

impl Trace {
    pub fn record(&mut self, timer: StepTimer, status: StepStatus, detail: Option<String>) {
        self.steps.push(TraceStep {
            stage: timer.stage,
            status,
            detail,
            started_at: timer.started_at,
            duration_ms: timer.started.elapsed().as_millis() as u64,
        });
    }

    pub fn skip(&mut self, stage: Stage, detail: impl Into<String>) {
        self.record(StepTimer::start(stage), StepStatus::Skipped, Some(detail.into()));
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.steps.iter().map(|s| s.stage).collect()
    }

    pub fn last(&self) -> Option<&TraceStep> {
        self.steps.last()
    }

    pub fn contains(&self, stage: Stage, status: StepStatus) -> bool {
        self.steps.iter().any(|s| s.stage == stage && s.status == status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_recorded_in_order() {
        let mut trace = Trace::default();
        trace.record(StepTimer::start(Stage::Matching), StepStatus::Completed, None);
        trace.skip(Stage::Discovery, "template path");
        assert_eq!(trace.stages(), vec![Stage::Matching, Stage::Discovery]);
        assert!(trace.contains(Stage::Discovery, StepStatus::Skipped));
        assert_eq!(trace.last().unwrap().detail.as_deref(), Some("template path"));
    }
}
