//! Deliverable kinds and input helpers.
//!
//! [`DeliverableKind`] is the closed set of stage types the pipeline can
//! generate. The canonical order in [`DeliverableKind::ALL`] is only a
//! convenience for front-ends; the engine always follows the order the caller
//! supplies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PmError;

/// One stage type of generated artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverableKind {
    /// Business problem, current and desired state, success criteria.
    ProblemStatement,
    /// Target user personas.
    Personas,
    /// Actors, scenarios and flows.
    UseCases,
    /// Features and architecture of the proposed tool.
    ToolOutline,
    /// Step-by-step build and rollout plan.
    ImplementationInstructions,
    /// Prompt for generating an executive slide deck.
    #[serde(alias = "copilot365_presentation_prompt")]
    PresentationPrompt,
    /// KPIs and evaluation framework.
    EffectivenessAssessment,
}

impl DeliverableKind {
    /// Every kind, in the canonical pipeline order.
    pub const ALL: [DeliverableKind; 7] = [
        Self::ProblemStatement,
        Self::Personas,
        Self::UseCases,
        Self::ToolOutline,
        Self::ImplementationInstructions,
        Self::PresentationPrompt,
        Self::EffectivenessAssessment,
    ];

    /// Stable snake_case identifier, also used as the template file stem.
    pub fn slug(self) -> &'static str {
        match self {
            Self::ProblemStatement => "problem_statement",
            Self::Personas => "personas",
            Self::UseCases => "use_cases",
            Self::ToolOutline => "tool_outline",
            Self::ImplementationInstructions => "implementation_instructions",
            Self::PresentationPrompt => "presentation_prompt",
            Self::EffectivenessAssessment => "effectiveness_assessment",
        }
    }

    /// Human-readable section title.
    pub fn title(self) -> &'static str {
        match self {
            Self::ProblemStatement => "Problem Statement",
            Self::Personas => "Personas",
            Self::UseCases => "Use Cases",
            Self::ToolOutline => "Tool Outline",
            Self::ImplementationInstructions => "Implementation Instructions",
            Self::PresentationPrompt => "Presentation Prompt",
            Self::EffectivenessAssessment => "Effectiveness Assessment",
        }
    }

    /// Name of the instruction template registered for this kind.
    pub fn instructions_template(self) -> String {
        format!("instructions/{}", self.slug())
    }

    /// Guess which deliverable a free-text idea is asking for.
    ///
    /// Each kind is scored by the fraction of its keywords that occur in the
    /// lowercased text. Returns the best kind with its score, or `None` when
    /// no keyword matches at all. Ties go to the kind listed first in
    /// [`ALL`](Self::ALL).
    pub fn infer(text: &str) -> Option<(DeliverableKind, f64)> {
        let lowered = text.to_lowercase();
        let mut best: Option<(DeliverableKind, f64)> = None;

        for kind in Self::ALL {
            let keywords = kind.keywords();
            let hits = keywords.iter().filter(|k| lowered.contains(*k)).count();
            let score = hits as f64 / keywords.len() as f64;
            if score > 0.0 && best.is_none_or(|(_, top)| score > top) {
                best = Some((kind, score));
            }
        }

        best
    }

    fn keywords(self) -> &'static [&'static str] {
        match self {
            Self::ProblemStatement => &[
                "problem",
                "issue",
                "challenge",
                "current state",
                "pain point",
                "stakeholder",
                "constraint",
                "assumption",
                "business case",
            ],
            Self::Personas => &[
                "persona",
                "user",
                "customer",
                "actor",
                "role",
                "demographic",
                "behavior",
                "motivation",
                "goal",
                "frustration",
            ],
            Self::UseCases => &[
                "use case",
                "scenario",
                "user story",
                "requirement",
                "functional",
                "precondition",
                "postcondition",
                "actor",
                "system",
            ],
            Self::ToolOutline => &[
                "tool",
                "application",
                "system",
                "software",
                "architecture",
                "component",
                "feature",
                "api",
                "interface",
                "technology",
            ],
            Self::ImplementationInstructions => &[
                "implementation",
                "development",
                "deployment",
                "configuration",
                "setup",
                "installation",
                "coding",
                "programming",
                "build",
            ],
            Self::PresentationPrompt => &[
                "presentation",
                "slide",
                "powerpoint",
                "copilot",
                "demo",
                "meeting",
                "audience",
                "pitch",
                "proposal",
            ],
            Self::EffectivenessAssessment => &[
                "assessment",
                "evaluation",
                "analysis",
                "performance",
                "metric",
                "kpi",
                "effectiveness",
                "success",
                "feedback",
                "review",
            ],
        }
    }
}

impl fmt::Display for DeliverableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for DeliverableKind {
    type Err = PmError;

    /// Accepts snake_case or kebab-case names, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        if normalized == "copilot365_presentation_prompt" {
            return Ok(Self::PresentationPrompt);
        }
        Self::ALL
            .into_iter()
            .find(|kind| kind.slug() == normalized)
            .ok_or_else(|| PmError::UnknownKind(s.to_owned()))
    }
}

/// Collapse every run of whitespace (including newlines) into a single space
/// and trim both ends.
pub fn normalize_input(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_round_trip_every_slug_through_from_str() {
        for kind in DeliverableKind::ALL {
            let parsed: DeliverableKind = kind.slug().parse().expect("should parse slug");
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_should_parse_kebab_case_and_legacy_names() {
        assert_eq!(
            "Use-Cases".parse::<DeliverableKind>().expect("should parse"),
            DeliverableKind::UseCases
        );
        assert_eq!(
            "copilot365_presentation_prompt"
                .parse::<DeliverableKind>()
                .expect("should parse"),
            DeliverableKind::PresentationPrompt
        );
    }

    #[test]
    fn test_should_reject_unknown_kind() {
        let err = "roadmap".parse::<DeliverableKind>().unwrap_err();
        assert!(matches!(err, PmError::UnknownKind(name) if name == "roadmap"));
    }

    #[test]
    fn test_should_serialize_as_snake_case() {
        let json = serde_json::to_value(DeliverableKind::ImplementationInstructions)
            .expect("should serialize");
        assert_eq!(json, "implementation_instructions");

        let legacy: DeliverableKind =
            serde_json::from_value(serde_json::json!("copilot365_presentation_prompt"))
                .expect("should deserialize alias");
        assert_eq!(legacy, DeliverableKind::PresentationPrompt);
    }

    #[test]
    fn test_should_infer_personas_from_user_centric_text() {
        let (kind, confidence) =
            DeliverableKind::infer("Describe the customer persona, their goal and frustration")
                .expect("should infer a kind");
        assert_eq!(kind, DeliverableKind::Personas);
        assert!(confidence > 0.0 && confidence <= 1.0);
    }

    #[test]
    fn test_should_return_none_when_no_keyword_matches() {
        assert!(DeliverableKind::infer("lorem ipsum dolor").is_none());
    }

    #[test]
    fn test_should_normalize_whitespace() {
        assert_eq!(
            normalize_input("  task   tracker\n\n app \t"),
            "task tracker app"
        );
        assert_eq!(normalize_input("   "), "");
    }
}
