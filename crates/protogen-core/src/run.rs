//! Orchestration run implementation.
//!
//! Stages run one at a time in the order the caller supplied. Every stage
//! moves through `Pending -> Generating{attempt} -> Succeeded | Failed`, or
//! `Pending -> Skipped` when the run is cancelled before it is reached.
//!
//! # Edge cases
//!
//! - **Model resolution fails**: no stage is attempted against the server;
//!   every stage is recorded as failed with the resolution error.
//! - **Empty completion**: treated as a retryable failure.
//! - **Cancellation mid-run**: the stage in progress (or the next one to
//!   start) is recorded as failed with a cancellation error and every later
//!   stage is skipped.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use protogen_pm::{DeliverableKind, PriorStage};

use crate::aggregate::{AggregateOptions, aggregate};
use crate::cancel::CancelSignal;
use crate::config::CompletionMode;
use crate::engine::Engine;
use crate::error::{CoreError, ErrorKind, InferenceError};
use crate::events::StageProgress;
use crate::result::{OrchestrationResult, StageResult};
use crate::wire::{CompletionRequest, TokenUsage};

/// Lifecycle of one stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StageState {
    Pending,
    Generating { attempt: u32 },
    Succeeded,
    Failed,
    Skipped,
}

impl StageState {
    fn can_move_to(self, next: StageState) -> bool {
        use StageState::*;
        match (self, next) {
            (Pending, Generating { attempt }) => attempt == 1,
            (Generating { attempt: a }, Generating { attempt: b }) => b == a + 1,
            (Pending | Generating { .. }, Failed) => true,
            (Generating { .. }, Succeeded) => true,
            (Pending, Skipped) => true,
            _ => false,
        }
    }
}

/// Per-run state of every stage, indexed by position.
#[derive(Debug)]
struct StageBoard {
    kinds: Vec<DeliverableKind>,
    states: Vec<StageState>,
}

impl StageBoard {
    fn new(kinds: &[DeliverableKind]) -> Self {
        Self {
            kinds: kinds.to_vec(),
            states: vec![StageState::Pending; kinds.len()],
        }
    }

    fn transition(&mut self, index: usize, next: StageState) {
        let current = self.states[index];
        debug_assert!(
            current.can_move_to(next),
            "illegal stage transition {current:?} -> {next:?}"
        );
        debug!(stage = %self.kinds[index], from = ?current, to = ?next, "stage transition");
        self.states[index] = next;
    }
}

pub(crate) async fn run_orchestration(
    engine: &Engine,
    user_input: &str,
    kinds: &[DeliverableKind],
    extra_context: Option<&serde_json::Value>,
    cancel: Option<&CancelSignal>,
) -> Result<OrchestrationResult, CoreError> {
    if kinds.is_empty() {
        return Err(CoreError::NoDeliverables);
    }
    if is_cancelled(cancel) {
        return Err(CoreError::Cancelled);
    }

    let config = engine.config();
    let started = Instant::now();
    if config.completion_mode() == CompletionMode::Batch {
        debug!("batch mode submits stages one at a time; stages depend on earlier output");
    }

    let model = match with_cancel(engine.resolve_model(), cancel).await {
        Err(e) if e.kind() == ErrorKind::Cancelled => return Err(CoreError::Cancelled),
        other => other,
    };
    match &model {
        Ok(name) => info!(model = %name, stages = kinds.len(), "starting orchestration"),
        Err(e) => warn!(error = %e, "model resolution failed, every stage will fail"),
    }

    let total = kinds.len();
    let mut board = StageBoard::new(kinds);
    let mut results: Vec<StageResult> = Vec::with_capacity(total);
    let mut cancelled = false;

    for (index, &kind) in kinds.iter().enumerate() {
        if cancelled {
            board.transition(index, StageState::Skipped);
            results.push(StageResult::skipped(kind));
            continue;
        }

        if let Some(observer) = engine.observer() {
            observer.on_stage_started(kind, index, total);
        }

        let result = match &model {
            Ok(name) => {
                let stage = Stage {
                    engine,
                    model: name,
                    user_input,
                    extra_context,
                    kind,
                    index,
                    cancel,
                };
                stage.execute(&results, &mut board).await
            }
            Err(e) => {
                board.transition(index, StageState::Failed);
                StageResult::failed(kind, e, 0, Duration::ZERO, None)
            }
        };

        if result.success() {
            info!(stage = %kind, attempts = result.attempts(), "stage succeeded");
        } else {
            warn!(
                stage = %kind,
                attempts = result.attempts(),
                error_kind = ?result.error_kind(),
                error = result.error_message().unwrap_or_default(),
                "stage failed"
            );
        }
        cancelled = result.error_kind() == Some(ErrorKind::Cancelled);

        if let Some(observer) = engine.observer() {
            observer.on_stage_finished(&StageProgress {
                kind,
                success: result.success(),
                stage_index: index,
                total_stages: total,
                attempts: result.attempts(),
                error_kind: result.error_kind(),
            });
        }
        results.push(result);
    }

    let model = model.ok();
    let merged_document = config.merge_document().then(|| {
        let options = AggregateOptions {
            include_toc: config.include_table_of_contents(),
            include_metadata: config.include_metadata(),
        };
        engine
            .renderer()
            .render(&aggregate(&results, model.as_deref(), options))
    });

    let result = OrchestrationResult::new(
        results,
        merged_document,
        model,
        config.completion_mode(),
        started.elapsed(),
        cancelled,
    );
    info!(
        succeeded = result.success_count(),
        failed = result.failure_count(),
        cancelled,
        duration_ms = result.total_duration().as_millis() as u64,
        "orchestration finished"
    );
    Ok(result)
}

/// One stage of a run, with everything needed to execute it.
struct Stage<'a> {
    engine: &'a Engine,
    model: &'a str,
    user_input: &'a str,
    extra_context: Option<&'a serde_json::Value>,
    kind: DeliverableKind,
    index: usize,
    cancel: Option<&'a CancelSignal>,
}

impl Stage<'_> {
    /// Run the stage with engine-level retries.
    ///
    /// Only retryable failures are retried. Cancellation is checked before
    /// every attempt and interrupts in-flight requests and backoff sleeps.
    async fn execute(&self, earlier: &[StageResult], board: &mut StageBoard) -> StageResult {
        let config = self.engine.config();
        let started = Instant::now();
        let prior: Vec<PriorStage<'_>> = earlier.iter().map(StageResult::as_prior).collect();
        let max_attempts = config.stage_attempts();

        let mut attempts = 0;
        let mut prompt = None;
        let mut usage: Option<TokenUsage> = None;
        let mut last_error = InferenceError::cancelled();

        while attempts < max_attempts {
            if is_cancelled(self.cancel) {
                last_error = InferenceError::cancelled();
                break;
            }

            attempts += 1;
            board.transition(self.index, StageState::Generating { attempt: attempts });

            let generated = self.engine.prompts().generate_with_context(
                self.kind,
                self.user_input,
                &prior,
                self.extra_context,
            );
            let text = match generated {
                Ok(text) => text,
                Err(e) => {
                    last_error = InferenceError::new(ErrorKind::Unknown, e.to_string());
                    break;
                }
            };
            let request = CompletionRequest::builder()
                .model(self.model)
                .prompt(text.as_str())
                .max_tokens(config.max_tokens())
                .temperature(config.temperature())
                .top_p(config.top_p())
                .stop(config.stop().to_vec())
                .build();
            prompt = Some(text);

            match with_cancel(self.engine.backend().complete(&request), self.cancel).await {
                Ok(completion) => {
                    // Empty completions are still billed.
                    if let Some(billed) = completion.usage {
                        *usage.get_or_insert_default() += billed;
                    }
                    let text = completion.text.trim();
                    if !text.is_empty() {
                        board.transition(self.index, StageState::Succeeded);
                        return StageResult::succeeded(
                            self.kind,
                            text.to_owned(),
                            attempts,
                            started.elapsed(),
                            usage,
                            prompt.unwrap_or_default(),
                        );
                    }
                    last_error = InferenceError::new(
                        ErrorKind::EmptyResponse,
                        "model returned an empty completion",
                    );
                }
                Err(e) => last_error = e,
            }

            if last_error.kind() == ErrorKind::Cancelled || !last_error.is_retryable() {
                break;
            }
            if attempts < max_attempts {
                let delay = config.stage_backoff_for(attempts);
                warn!(
                    stage = %self.kind,
                    attempt = attempts,
                    max_attempts,
                    error = %last_error,
                    delay_ms = delay.as_millis() as u64,
                    "stage attempt failed, retrying"
                );
                let sleep = async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                };
                if let Err(e) = with_cancel(sleep, self.cancel).await {
                    last_error = e;
                    break;
                }
            }
        }

        board.transition(self.index, StageState::Failed);
        StageResult::failed(self.kind, &last_error, attempts, started.elapsed(), prompt)
            .with_usage(usage)
    }
}

fn is_cancelled(cancel: Option<&CancelSignal>) -> bool {
    cancel.is_some_and(CancelSignal::is_cancelled)
}

/// Race `fut` against cancellation.
async fn with_cancel<T>(
    fut: impl Future<Output = Result<T, InferenceError>>,
    cancel: Option<&CancelSignal>,
) -> Result<T, InferenceError> {
    match cancel {
        Some(signal) => {
            tokio::select! {
                biased;
                () = signal.cancelled() => Err(InferenceError::cancelled()),
                result = fut => result,
            }
        }
        None => fut.await,
    }
}
