use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use protogen_core::{
    DeliverableKind, Engine, GenerationConfig, InferenceClient, OrchestrationResult,
    ProjectConfig, RunOutcome, StageProgress, cancel_pair, load_project_config, normalize_input,
};

#[derive(Debug, Parser)]
#[command(
    name = "protogen",
    version,
    about = "Generate chained product documents with a local LLM server"
)]
pub struct Cli {
    /// Path to the YAML config file (defaults apply when it does not exist)
    #[arg(short, long, global = true, default_value = "protogen.yaml")]
    pub config: PathBuf,

    /// Inference server base URL, e.g. http://localhost:1234/v1
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Model name, or "auto" for the first loaded model
    #[arg(short, long, global = true)]
    pub model: Option<String>,

    /// Directory for JSON log files; file logging is off when unset
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Generate deliverables from an idea
    Generate(GenerateArgs),

    /// List the models loaded on the server
    Models,

    /// Check whether the server is reachable
    Health,
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    /// The idea to generate documents for
    #[arg(short, long, required_unless_present = "input_file", conflicts_with = "input_file")]
    pub input: Option<String>,

    /// Read the idea from a file
    #[arg(long)]
    pub input_file: Option<PathBuf>,

    /// Comma-separated deliverable kinds, in generation order (default: all)
    #[arg(short, long, value_delimiter = ',', conflicts_with = "infer")]
    pub kinds: Vec<DeliverableKind>,

    /// Generate only the deliverable the input most likely asks for
    #[arg(long)]
    pub infer: bool,

    /// Extra JSON context added to every prompt, e.g. '{"audience":"investors"}'
    #[arg(long, value_parser = parse_context)]
    pub context: Option<serde_json::Value>,

    /// Write the result to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Emit the full run result as JSON instead of the merged document
    #[arg(long)]
    pub json: bool,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let mut project = load_project_config(&self.config)
            .with_context(|| format!("failed to load config {}", self.config.display()))?;
        self.apply_overrides(&mut project);
        let config = GenerationConfig::from_project(&project)?;

        match self.command {
            Commands::Generate(args) => generate(config, args).await,
            Commands::Models => {
                let engine = Engine::new(config)?;
                for id in engine.list_available_models().await? {
                    println!("{id}");
                }
                Ok(())
            }
            Commands::Health => {
                config.validate()?;
                let report = InferenceClient::new(&config)?.health_report().await;
                println!("{}", serde_json::to_string_pretty(&report)?);
                if !report.healthy {
                    bail!("inference server at {} is not healthy", report.base_url);
                }
                Ok(())
            }
        }
    }

    /// Command-line flags take precedence over the config file.
    fn apply_overrides(&self, project: &mut ProjectConfig) {
        if let Some(url) = &self.base_url {
            project.server.base_url.clone_from(url);
        }
        if let Some(model) = &self.model {
            project.generation.model.clone_from(model);
        }
    }
}

async fn generate(config: GenerationConfig, args: GenerateArgs) -> Result<()> {
    let raw = match (&args.input, &args.input_file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read input file {}", path.display()))?,
        (None, None) => bail!("either --input or --input-file is required"),
    };
    let input = normalize_input(&raw);
    if input.is_empty() {
        bail!("input is empty");
    }
    let kinds = resolve_kinds(&args, &input)?;

    info!(
        stages = kinds.len(),
        worst_case_secs = config.worst_case_run_duration(kinds.len()).as_secs(),
        "starting generation"
    );

    let progress = |p: &StageProgress| {
        let status = if p.success { "done" } else { "failed" };
        let suffix = p
            .error_kind
            .map(|kind| format!(" ({kind})"))
            .unwrap_or_default();
        eprintln!(
            "[{}/{}] {} {status} after {} attempt(s){suffix}",
            p.stage_index + 1,
            p.total_stages,
            p.kind,
            p.attempts,
        );
    };
    let engine = Engine::new(config)?.with_observer(Arc::new(progress));

    let (handle, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            handle.cancel();
        }
    });

    let result = match &args.context {
        Some(context) => {
            engine
                .orchestrate_with_context(&input, &kinds, context, Some(&signal))
                .await?
        }
        None => engine.orchestrate(&input, &kinds, Some(&signal)).await?,
    };
    write_output(&result, &args)?;

    match result.outcome() {
        RunOutcome::Succeeded => Ok(()),
        RunOutcome::PartialFailure => {
            warn!(
                failed = result.failure_count(),
                "some deliverables could not be generated"
            );
            Ok(())
        }
        RunOutcome::Failed => bail!("no deliverable could be generated"),
        RunOutcome::Cancelled => bail!("run was cancelled"),
    }
}

fn parse_context(raw: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {e}"))
}

fn resolve_kinds(args: &GenerateArgs, input: &str) -> Result<Vec<DeliverableKind>> {
    if args.infer {
        let Some((kind, confidence)) = DeliverableKind::infer(input) else {
            bail!("could not infer a deliverable kind from the input; pass --kinds instead");
        };
        info!(%kind, confidence, "inferred deliverable kind");
        return Ok(vec![kind]);
    }
    if args.kinds.is_empty() {
        return Ok(DeliverableKind::ALL.to_vec());
    }
    Ok(args.kinds.clone())
}

fn render_output(result: &OrchestrationResult, json: bool) -> Result<String> {
    if json {
        return Ok(serde_json::to_string_pretty(result)?);
    }
    if let Some(document) = result.merged_document() {
        return Ok(document.to_owned());
    }
    let sections: Vec<String> = result
        .stage_results()
        .iter()
        .filter(|r| r.success())
        .map(|r| format!("## {}\n\n{}\n", r.kind().title(), r.text()))
        .collect();
    Ok(sections.join("\n"))
}

fn write_output(result: &OrchestrationResult, args: &GenerateArgs) -> Result<()> {
    let text = render_output(result, args.json)?;
    match &args.output {
        Some(path) => write_file(path, &text),
        None => {
            println!("{text}");
            Ok(())
        }
    }
}

fn write_file(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "output written");
    Ok(())
}
