//! Inference client and orchestration engine for protogen.
//!
//! The [`Engine`] turns one free-text idea into an ordered set of generated
//! deliverables. Each stage's prompt is built from the outputs of every stage
//! before it, sent to an OpenAI-compatible server through an
//! [`InferenceBackend`], and the results are merged into a single document.

mod aggregate;
mod cache;
mod cancel;
mod client;
mod config;
mod engine;
mod error;
mod events;
mod result;
mod run;
mod wire;

#[cfg(test)]
mod test_support;

pub use aggregate::{
    AggregateOptions, AggregatedDocument, DocumentMetadata, DocumentRenderer, MarkdownRenderer,
    Section, TocEntry, aggregate, render_markdown,
};
pub use cache::ModelCache;
pub use cancel::{CancelHandle, CancelSignal, cancel_pair};
pub use client::{HealthReport, InferenceBackend, InferenceClient};
pub use config::{
    ApiKey, CompletionMode, GenerationConfig, GenerationSettings, ModelSelection,
    OrchestrationSettings, OutputSettings, ProjectConfig, RetryPolicy, RetrySettings,
    ServerSettings, load_project_config,
};
pub use engine::Engine;
pub use error::{CoreError, ErrorKind, InferenceError};
pub use events::{
    ChannelObserver, ProgressEvent, ProgressObserver, ProgressStream, StageProgress,
    progress_channel,
};
pub use protogen_pm::{DeliverableKind, PromptManager, normalize_input};
pub use result::{OrchestrationResult, RunOutcome, StageResult, StageStatus};
pub use wire::{Completion, CompletionRequest, ModelInfo, TokenUsage};
