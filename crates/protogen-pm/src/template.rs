//! Template sources and the prior-stage view fed into prompts.

use serde::{Deserialize, Serialize};

use crate::kind::DeliverableKind;

/// Metadata about a prompt template, including its name and source content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    /// Template name used for lookup (e.g., `instructions/personas`).
    pub name: String,

    /// Raw Jinja2 template source.
    pub source: String,
}

impl PromptTemplate {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Output of a stage that ran earlier in the same orchestration run.
///
/// `text` is `None` when that stage failed; the prompt then carries an
/// explicit "unavailable" marker instead of any partial output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorStage<'a> {
    pub kind: DeliverableKind,
    pub text: Option<&'a str>,
}

impl<'a> PriorStage<'a> {
    pub fn succeeded(kind: DeliverableKind, text: &'a str) -> Self {
        Self {
            kind,
            text: Some(text),
        }
    }

    pub fn failed(kind: DeliverableKind) -> Self {
        Self { kind, text: None }
    }
}

/// Serialized shape of a [`PriorStage`] inside the template context.
#[derive(Debug, Serialize)]
pub(crate) struct StageView<'a> {
    pub kind: &'static str,
    pub title: &'static str,
    pub available: bool,
    pub text: &'a str,
}

impl<'a> From<&PriorStage<'a>> for StageView<'a> {
    fn from(stage: &PriorStage<'a>) -> Self {
        Self {
            kind: stage.kind.slug(),
            title: stage.kind.title(),
            available: stage.text.is_some(),
            text: stage.text.unwrap_or_default(),
        }
    }
}
