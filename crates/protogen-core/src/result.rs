//! Per-stage and per-run results.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use protogen_pm::{DeliverableKind, PriorStage};

use crate::config::CompletionMode;
use crate::error::{ErrorKind, InferenceError};
use crate::wire::TokenUsage;

/// Terminal state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    /// Never attempted because the run was cancelled first.
    Skipped,
}

/// Outcome of one stage of a run.
///
/// A failed stage always has empty `text` and a classified error; a
/// succeeded stage has non-empty text and no error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageResult {
    kind: DeliverableKind,
    status: StageStatus,
    text: String,
    error_message: Option<String>,
    error_kind: Option<ErrorKind>,
    attempts: u32,
    #[serde(with = "duration_millis", rename = "duration_ms")]
    duration: Duration,
    usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<String>,
}

impl StageResult {
    pub(crate) fn succeeded(
        kind: DeliverableKind,
        text: String,
        attempts: u32,
        duration: Duration,
        usage: Option<TokenUsage>,
        prompt: String,
    ) -> Self {
        Self {
            kind,
            status: StageStatus::Succeeded,
            text,
            error_message: None,
            error_kind: None,
            attempts,
            duration,
            usage,
            prompt: Some(prompt),
        }
    }

    pub(crate) fn failed(
        kind: DeliverableKind,
        error: &InferenceError,
        attempts: u32,
        duration: Duration,
        prompt: Option<String>,
    ) -> Self {
        Self {
            kind,
            status: StageStatus::Failed,
            text: String::new(),
            error_message: Some(error.message().to_owned()),
            error_kind: Some(error.kind()),
            attempts,
            duration,
            usage: None,
            prompt,
        }
    }

    pub(crate) fn with_usage(mut self, usage: Option<TokenUsage>) -> Self {
        self.usage = usage;
        self
    }

    pub(crate) fn skipped(kind: DeliverableKind) -> Self {
        Self {
            kind,
            status: StageStatus::Skipped,
            text: String::new(),
            error_message: Some("not attempted: run was cancelled".to_owned()),
            error_kind: Some(ErrorKind::Cancelled),
            attempts: 0,
            duration: Duration::ZERO,
            usage: None,
            prompt: None,
        }
    }

    pub fn kind(&self) -> DeliverableKind {
        self.kind
    }

    pub fn status(&self) -> StageStatus {
        self.status
    }

    pub fn success(&self) -> bool {
        self.status == StageStatus::Succeeded
    }

    /// Generated text; empty unless the stage succeeded.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }

    /// Engine-level attempts made for this stage.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn usage(&self) -> Option<TokenUsage> {
        self.usage
    }

    /// The last prompt sent for this stage, if one was built.
    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref()
    }

    pub(crate) fn as_prior(&self) -> PriorStage<'_> {
        if self.success() {
            PriorStage::succeeded(self.kind, &self.text)
        } else {
            PriorStage::failed(self.kind)
        }
    }
}

/// Overall classification of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    PartialFailure,
    Failed,
    Cancelled,
}

/// Everything a run produced, in the requested stage order.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationResult {
    stage_results: Vec<StageResult>,
    merged_document: Option<String>,
    model: Option<String>,
    completion_mode: CompletionMode,
    #[serde(with = "duration_millis", rename = "total_duration_ms")]
    total_duration: Duration,
    usage: TokenUsage,
    success_count: usize,
    failure_count: usize,
    cancelled: bool,
}

impl OrchestrationResult {
    pub(crate) fn new(
        stage_results: Vec<StageResult>,
        merged_document: Option<String>,
        model: Option<String>,
        completion_mode: CompletionMode,
        total_duration: Duration,
        cancelled: bool,
    ) -> Self {
        let success_count = stage_results.iter().filter(|r| r.success()).count();
        let failure_count = stage_results.len() - success_count;
        let mut usage = TokenUsage::default();
        for stage_usage in stage_results.iter().filter_map(StageResult::usage) {
            usage += stage_usage;
        }

        Self {
            stage_results,
            merged_document,
            model,
            completion_mode,
            total_duration,
            usage,
            success_count,
            failure_count,
            cancelled,
        }
    }

    pub fn stage_results(&self) -> &[StageResult] {
        &self.stage_results
    }

    pub fn into_stage_results(self) -> Vec<StageResult> {
        self.stage_results
    }

    /// Result for `kind`, if it was requested.
    pub fn stage(&self, kind: DeliverableKind) -> Option<&StageResult> {
        self.stage_results.iter().find(|r| r.kind == kind)
    }

    pub fn merged_document(&self) -> Option<&str> {
        self.merged_document.as_deref()
    }

    /// Model the run resolved to, if resolution succeeded.
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn completion_mode(&self) -> CompletionMode {
        self.completion_mode
    }

    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }

    /// Token usage summed over succeeded stages.
    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn success_count(&self) -> usize {
        self.success_count
    }

    /// Stages that did not succeed, skipped ones included.
    pub fn failure_count(&self) -> usize {
        self.failure_count
    }

    pub fn skipped_count(&self) -> usize {
        self.stage_results
            .iter()
            .filter(|r| r.status == StageStatus::Skipped)
            .count()
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn outcome(&self) -> RunOutcome {
        if self.cancelled {
            RunOutcome::Cancelled
        } else if self.failure_count == 0 {
            RunOutcome::Succeeded
        } else if self.success_count == 0 {
            RunOutcome::Failed
        } else {
            RunOutcome::PartialFailure
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(kind: DeliverableKind, tokens: u64) -> StageResult {
        StageResult::succeeded(
            kind,
            format!("{kind} text"),
            1,
            Duration::from_millis(5),
            Some(TokenUsage {
                prompt_tokens: tokens,
                completion_tokens: tokens,
                total_tokens: tokens * 2,
            }),
            "prompt".to_owned(),
        )
    }

    fn failed(kind: DeliverableKind) -> StageResult {
        let err = InferenceError::new(ErrorKind::Server, "down").with_status(503);
        StageResult::failed(kind, &err, 4, Duration::from_millis(5), None)
    }

    fn run(results: Vec<StageResult>, cancelled: bool) -> OrchestrationResult {
        OrchestrationResult::new(
            results,
            None,
            Some("m".to_owned()),
            CompletionMode::Sequential,
            Duration::from_millis(10),
            cancelled,
        )
    }

    #[test]
    fn test_should_keep_failed_stage_text_empty() {
        let result = failed(DeliverableKind::Personas);
        assert!(!result.success());
        assert_eq!(result.text(), "");
        assert_eq!(result.error_kind(), Some(ErrorKind::Server));
        assert_eq!(result.error_message(), Some("down"));
        assert_eq!(result.as_prior().text, None);
    }

    #[test]
    fn test_should_count_and_sum_usage() {
        let result = run(
            vec![
                ok(DeliverableKind::ProblemStatement, 10),
                failed(DeliverableKind::Personas),
                ok(DeliverableKind::UseCases, 5),
            ],
            false,
        );

        assert_eq!(result.success_count(), 2);
        assert_eq!(result.failure_count(), 1);
        assert_eq!(result.usage().total_tokens, 30);
        assert_eq!(result.outcome(), RunOutcome::PartialFailure);
        assert!(result.stage(DeliverableKind::UseCases).is_some());
        assert!(result.stage(DeliverableKind::ToolOutline).is_none());
    }

    #[test]
    fn test_should_classify_outcomes() {
        assert_eq!(
            run(vec![ok(DeliverableKind::Personas, 1)], false).outcome(),
            RunOutcome::Succeeded
        );
        assert_eq!(
            run(vec![failed(DeliverableKind::Personas)], false).outcome(),
            RunOutcome::Failed
        );

        let cancelled = run(
            vec![
                ok(DeliverableKind::ProblemStatement, 1),
                StageResult::skipped(DeliverableKind::Personas),
            ],
            true,
        );
        assert_eq!(cancelled.outcome(), RunOutcome::Cancelled);
        assert_eq!(cancelled.skipped_count(), 1);
        assert_eq!(cancelled.failure_count(), 1);
    }

    #[test]
    fn test_should_serialize_sent_prompt_for_audit() {
        let json = serde_json::to_value(ok(DeliverableKind::Personas, 1)).expect("serialize");
        assert_eq!(json["kind"], "personas");
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["duration_ms"], 5);
        assert_eq!(json["prompt"], "prompt");

        let skipped = serde_json::to_value(StageResult::skipped(DeliverableKind::UseCases))
            .expect("serialize");
        assert!(skipped.get("prompt").is_none(), "no prompt was built");
    }
}
