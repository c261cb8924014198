use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use minijinja::{AutoEscape, Environment, UndefinedBehavior, context};
use tracing::debug;

use crate::error::PmError;
use crate::kind::DeliverableKind;
use crate::template::{PriorStage, PromptTemplate, StageView};

/// Name of the shared layout every stage prompt is rendered through.
pub const LAYOUT_TEMPLATE: &str = "layout";

const TEMPLATE_EXTENSIONS: [&str; 2] = ["j2", "jinja"];

const BUILTIN_TEMPLATES: [(&str, &str); 8] = [
    (LAYOUT_TEMPLATE, include_str!("../templates/layout.j2")),
    (
        "instructions/problem_statement",
        include_str!("../templates/instructions/problem_statement.j2"),
    ),
    (
        "instructions/personas",
        include_str!("../templates/instructions/personas.j2"),
    ),
    (
        "instructions/use_cases",
        include_str!("../templates/instructions/use_cases.j2"),
    ),
    (
        "instructions/tool_outline",
        include_str!("../templates/instructions/tool_outline.j2"),
    ),
    (
        "instructions/implementation_instructions",
        include_str!("../templates/instructions/implementation_instructions.j2"),
    ),
    (
        "instructions/presentation_prompt",
        include_str!("../templates/instructions/presentation_prompt.j2"),
    ),
    (
        "instructions/effectiveness_assessment",
        include_str!("../templates/instructions/effectiveness_assessment.j2"),
    ),
];

/// Manages prompt templates and renders them with context variables.
///
/// Created with every built-in template registered. Deployments can replace
/// any of them through [`load_dir`](Self::load_dir) or
/// [`add_template`](Self::add_template); the last registration of a name wins.
#[derive(Clone)]
pub struct PromptManager {
    env: Environment<'static>,
    names: BTreeSet<String>,
}

impl PromptManager {
    /// Create a manager holding the built-in layout and instruction templates.
    ///
    /// # Errors
    ///
    /// Returns `PmError::InvalidTemplate` if a built-in template fails to parse.
    pub fn new() -> Result<Self, PmError> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);

        let mut manager = Self {
            env,
            names: BTreeSet::new(),
        };
        for (name, source) in BUILTIN_TEMPLATES {
            manager.add_template(PromptTemplate::new(name, source))?;
        }
        Ok(manager)
    }

    /// Load all `.j2` / `.jinja` templates from a directory, recursively.
    ///
    /// A file at `<dir>/instructions/personas.j2` registers the template
    /// `instructions/personas`, overriding the built-in one.
    ///
    /// # Errors
    ///
    /// Returns `PmError::Io` if the directory cannot be read and
    /// `PmError::InvalidTemplate` if a file fails to parse.
    pub fn load_dir(&mut self, dir: &Path) -> Result<(), PmError> {
        self.load_dir_inner(dir, dir)
    }

    fn load_dir_inner(&mut self, root: &Path, dir: &Path) -> Result<(), PmError> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                self.load_dir_inner(root, &path)?;
                continue;
            }

            let is_template = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| TEMPLATE_EXTENSIONS.contains(&ext));
            if !is_template {
                continue;
            }

            let Ok(relative) = path.with_extension("").strip_prefix(root).map(Path::to_path_buf)
            else {
                continue;
            };
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            let source = std::fs::read_to_string(&path)?;
            debug!(template = %name, path = %path.display(), "loaded template override");
            self.add_template(PromptTemplate { name, source })?;
        }
        Ok(())
    }

    /// Register a single template, replacing any template with the same name.
    ///
    /// # Errors
    ///
    /// Returns `PmError::InvalidTemplate` if the source fails to parse.
    pub fn add_template(&mut self, template: PromptTemplate) -> Result<(), PmError> {
        let PromptTemplate { name, source } = template;
        self.env
            .add_template_owned(name.clone(), source)
            .map_err(|e| PmError::InvalidTemplate(format!("{name}: {e}")))?;
        self.names.insert(name);
        Ok(())
    }

    /// Render a template by name with the given context.
    ///
    /// # Errors
    ///
    /// Returns `PmError::TemplateNotFound` for an unknown name and
    /// `PmError::RenderError` if rendering fails.
    pub fn render(&self, name: &str, ctx: &serde_json::Value) -> Result<String, PmError> {
        let template = self.template(name)?;
        template
            .render(ctx)
            .map_err(|e| PmError::RenderError(format!("{name}: {e}")))
    }

    /// Build the prompt for one stage.
    ///
    /// `prior` holds every stage already produced in this run, in production
    /// order. Succeeded stages contribute their text; failed ones appear as an
    /// explicit "unavailable" marker so later stages never see partial output.
    ///
    /// # Errors
    ///
    /// Returns `PmError::RenderError` if an overridden template references an
    /// unknown variable.
    pub fn generate(
        &self,
        kind: DeliverableKind,
        user_input: &str,
        prior: &[PriorStage<'_>],
    ) -> Result<String, PmError> {
        self.generate_with_context(kind, user_input, prior, None)
    }

    /// Like [`generate()`](PromptManager::generate), with caller-supplied
    /// context rendered as pretty JSON under "Additional Context".
    ///
    /// `null` and empty objects or arrays add nothing to the prompt.
    ///
    /// # Errors
    ///
    /// Same as [`generate()`](PromptManager::generate).
    pub fn generate_with_context(
        &self,
        kind: DeliverableKind,
        user_input: &str,
        prior: &[PriorStage<'_>],
        extra: Option<&serde_json::Value>,
    ) -> Result<String, PmError> {
        let additional_context = extra
            .filter(|value| !is_blank(value))
            .map(serde_json::to_string_pretty)
            .transpose()
            .map_err(|e| PmError::RenderError(format!("additional context: {e}")))?;

        let instructions_name = kind.instructions_template();
        let instructions = self
            .template(&instructions_name)?
            .render(context! { user_input => user_input, kind => kind.slug() })
            .map_err(|e| PmError::RenderError(format!("{instructions_name}: {e}")))?;

        let prior_stages: Vec<StageView<'_>> = prior.iter().map(StageView::from).collect();

        self.template(LAYOUT_TEMPLATE)?
            .render(context! {
                kind => kind.slug(),
                title => kind.title(),
                instructions => instructions,
                user_input => user_input,
                additional_context => additional_context,
                prior_stages => prior_stages,
            })
            .map_err(|e| PmError::RenderError(format!("{LAYOUT_TEMPLATE}: {e}")))
    }

    /// Names of all registered templates, sorted.
    pub fn list_templates(&self) -> Vec<&str> {
        self.names.iter().map(String::as_str).collect()
    }

    fn template(&self, name: &str) -> Result<minijinja::Template<'_, '_>, PmError> {
        self.env.get_template(name).map_err(|e| match e.kind() {
            minijinja::ErrorKind::TemplateNotFound => PmError::TemplateNotFound(name.to_owned()),
            _ => PmError::InvalidTemplate(format!("{name}: {e}")),
        })
    }
}

fn is_blank(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        serde_json::Value::String(text) => text.trim().is_empty(),
        _ => false,
    }
}

impl fmt::Debug for PromptManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromptManager")
            .field("templates", &self.names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PromptManager {
        PromptManager::new().expect("built-in templates should parse")
    }

    #[test]
    fn test_should_register_layout_and_every_instruction_template() {
        let pm = manager();
        let names = pm.list_templates();
        assert!(names.contains(&LAYOUT_TEMPLATE));
        for kind in DeliverableKind::ALL {
            assert!(
                names.contains(&kind.instructions_template().as_str()),
                "missing template for {kind}"
            );
        }
    }

    #[test]
    fn test_should_generate_first_stage_without_context_section() {
        let prompt = manager()
            .generate(DeliverableKind::ProblemStatement, "task tracker app", &[])
            .expect("should render");

        assert!(prompt.contains("## Task: Generate Problem Statement"));
        assert!(prompt.contains("task tracker app"));
        assert!(prompt.contains("Current state analysis"));
        assert!(!prompt.contains("Context From Earlier Deliverables"));
        assert!(prompt.trim_end().ends_with("## Generated Content:"));
    }

    #[test]
    fn test_should_chain_succeeded_stage_text_into_later_prompt() {
        let prior = [PriorStage::succeeded(
            DeliverableKind::ProblemStatement,
            "Teams lose track of tasks.",
        )];
        let prompt = manager()
            .generate(DeliverableKind::Personas, "task tracker app", &prior)
            .expect("should render");

        assert!(prompt.contains("## Context From Earlier Deliverables:"));
        assert!(prompt.contains("### Problem Statement"));
        assert!(prompt.contains("Teams lose track of tasks."));
    }

    #[test]
    fn test_should_mark_failed_stage_unavailable() {
        let prior = [
            PriorStage::failed(DeliverableKind::ProblemStatement),
            PriorStage::succeeded(DeliverableKind::Personas, "Alice, a PM."),
        ];
        let prompt = manager()
            .generate(DeliverableKind::UseCases, "task tracker app", &prior)
            .expect("should render");

        assert!(prompt.contains(
            "[unavailable: the Problem Statement deliverable could not be generated in this run]"
        ));
        assert!(prompt.contains("Alice, a PM."));

        let problem_at = prompt.find("### Problem Statement").expect("problem header");
        let personas_at = prompt.find("### Personas").expect("personas header");
        assert!(problem_at < personas_at, "prior stages keep production order");
    }

    #[test]
    fn test_should_render_additional_context_after_user_input() {
        let extra = serde_json::json!({ "audience": "investors", "budget": 5000 });
        let prompt = manager()
            .generate_with_context(DeliverableKind::ProblemStatement, "idea", &[], Some(&extra))
            .expect("should render");

        let input_at = prompt.find("## User Requirements:").expect("requirements header");
        let context_at = prompt.find("## Additional Context:").expect("context header");
        assert!(input_at < context_at);
        assert!(prompt.contains("\"audience\": \"investors\""));
        assert!(prompt.contains("\"budget\": 5000"));
    }

    #[test]
    fn test_should_omit_blank_additional_context() {
        let pm = manager();
        let plain = pm
            .generate(DeliverableKind::Personas, "idea", &[])
            .expect("should render");
        for extra in [
            serde_json::Value::Null,
            serde_json::json!({}),
            serde_json::json!([]),
        ] {
            let prompt = pm
                .generate_with_context(DeliverableKind::Personas, "idea", &[], Some(&extra))
                .expect("should render");
            assert_eq!(prompt, plain);
        }
        assert!(!plain.contains("Additional Context"));
    }

    #[test]
    fn test_should_be_deterministic() {
        let pm = manager();
        let prior = [PriorStage::succeeded(DeliverableKind::ProblemStatement, "x")];
        let a = pm
            .generate(DeliverableKind::Personas, "idea", &prior)
            .expect("should render");
        let b = pm
            .generate(DeliverableKind::Personas, "idea", &prior)
            .expect("should render");
        assert_eq!(a, b);
    }

    #[test]
    fn test_should_override_instructions_with_add_template() {
        let mut pm = manager();
        pm.add_template(PromptTemplate::new(
            "instructions/personas",
            "Write exactly two personas for {{ user_input }}.",
        ))
        .expect("should add");

        let prompt = pm
            .generate(DeliverableKind::Personas, "a bakery", &[])
            .expect("should render");
        assert!(prompt.contains("Write exactly two personas for a bakery."));
    }

    #[test]
    fn test_should_load_overrides_from_directory() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let nested = dir.path().join("instructions");
        std::fs::create_dir_all(&nested).expect("should create dir");
        std::fs::write(nested.join("tool_outline.j2"), "Outline the tool briefly.")
            .expect("should write");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("should write");

        let mut pm = manager();
        pm.load_dir(dir.path()).expect("should load dir");

        assert!(!pm.list_templates().contains(&"notes"));
        let prompt = pm
            .generate(DeliverableKind::ToolOutline, "idea", &[])
            .expect("should render");
        assert!(prompt.contains("Outline the tool briefly."));
    }

    #[test]
    fn test_should_reject_invalid_template_source() {
        let mut pm = manager();
        let err = pm
            .add_template(PromptTemplate::new("broken", "{% if %}"))
            .unwrap_err();
        assert!(matches!(err, PmError::InvalidTemplate(_)));
    }

    #[test]
    fn test_should_fail_render_for_unknown_template() {
        let err = manager()
            .render("missing", &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, PmError::TemplateNotFound(name) if name == "missing"));
    }

    #[test]
    fn test_should_fail_render_on_undefined_variable() {
        let mut pm = manager();
        pm.add_template(PromptTemplate::new("strict", "{{ nope }}"))
            .expect("should add");
        let err = pm.render("strict", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, PmError::RenderError(_)));
    }
}
