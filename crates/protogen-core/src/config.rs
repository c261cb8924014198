//! Configuration types for protogen-core.
//!
//! [`GenerationConfig`] is the validated, immutable configuration the engine
//! runs with. [`ProjectConfig`] mirrors the on-disk YAML file; front-ends load
//! it, apply their own overrides to it, and convert it with
//! [`GenerationConfig::from_project`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::CoreError;

pub(crate) const DEFAULT_BASE_URL: &str = "http://localhost:1234/v1";
const DEFAULT_RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

// ── Generation Configuration ─────────────────────────────────

/// Model to request completions from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ModelSelection {
    /// Use the first model the server reports as loaded.
    #[default]
    Auto,
    /// Use this model name verbatim.
    Named(String),
}

impl From<String> for ModelSelection {
    fn from(value: String) -> Self {
        if value.trim().eq_ignore_ascii_case("auto") {
            Self::Auto
        } else {
            Self::Named(value)
        }
    }
}

impl From<&str> for ModelSelection {
    fn from(value: &str) -> Self {
        Self::from(value.to_owned())
    }
}

impl From<ModelSelection> for String {
    fn from(value: ModelSelection) -> Self {
        match value {
            ModelSelection::Auto => "auto".to_owned(),
            ModelSelection::Named(name) => name,
        }
    }
}

impl fmt::Display for ModelSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

/// How stages are submitted to the server.
///
/// Stages always depend on earlier outputs, so both modes run them one at a
/// time in request order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMode {
    #[default]
    Sequential,
    Batch,
}

/// Bearer token for the inference server. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<String> for ApiKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ApiKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Transport-level retry behaviour of the inference client.
///
/// The delay before retry `n` (1-based) is `backoff_factor * 2^(n-1)`, capped
/// at `max_backoff`.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    #[builder(default = 3)]
    max_retries: u32,

    #[builder(default = Duration::from_secs(1))]
    backoff_factor: Duration,

    #[builder(default = Duration::from_secs(60))]
    max_backoff: Duration,

    /// HTTP statuses that may be retried.
    #[builder(default = DEFAULT_RETRY_STATUSES.to_vec())]
    retry_on_status: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total attempts per request, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn backoff_factor(&self) -> Duration {
        self.backoff_factor
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn retry_on_status(&self) -> &[u16] {
        &self.retry_on_status
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retry_on_status.contains(&status)
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        exponential(self.backoff_factor, attempt, self.max_backoff)
    }
}

fn exponential(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1_u32 << exponent).min(cap)
}

/// Validated configuration for the engine and the inference client.
///
/// # Examples
///
/// ```
/// use protogen_core::GenerationConfig;
///
/// let config = GenerationConfig::builder()
///     .base_url("http://localhost:8080/v1")
///     .model("mistral-7b-instruct")
///     .temperature(0.2)
///     .build();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct GenerationConfig {
    /// Server base URL, including the `/v1` prefix.
    #[builder(default = DEFAULT_BASE_URL.to_owned(), setter(into))]
    base_url: String,

    #[builder(default, setter(strip_option, into))]
    api_key: Option<ApiKey>,

    #[builder(default, setter(into))]
    model: ModelSelection,

    #[builder(default = 2048)]
    max_tokens: u32,

    #[builder(default = 0.7)]
    temperature: f32,

    #[builder(default = 0.9)]
    top_p: f32,

    #[builder(default)]
    stop: Vec<String>,

    #[builder(default)]
    completion_mode: CompletionMode,

    /// Engine-level retries of a failed stage, after the first attempt.
    #[builder(default = 3)]
    max_retries_per_deliverable: u32,

    /// Delay before the first stage retry; doubles on every further retry.
    #[builder(default = Duration::from_secs(1))]
    stage_retry_delay: Duration,

    #[builder(default = Duration::from_secs(60))]
    request_timeout: Duration,

    #[builder(default = Duration::from_secs(10))]
    connect_timeout: Duration,

    #[builder(default)]
    retry: RetryPolicy,

    #[builder(default = Duration::from_secs(300))]
    model_cache_ttl: Duration,

    #[builder(default = true)]
    merge_document: bool,

    #[builder(default = true)]
    include_table_of_contents: bool,

    #[builder(default = true)]
    include_metadata: bool,

    /// Directory of template overrides loaded on top of the built-ins.
    #[builder(default, setter(strip_option, into))]
    template_dir: Option<PathBuf>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl GenerationConfig {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn api_key(&self) -> Option<&ApiKey> {
        self.api_key.as_ref()
    }

    pub fn model(&self) -> &ModelSelection {
        &self.model
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn top_p(&self) -> f32 {
        self.top_p
    }

    pub fn stop(&self) -> &[String] {
        &self.stop
    }

    pub fn completion_mode(&self) -> CompletionMode {
        self.completion_mode
    }

    pub fn max_retries_per_deliverable(&self) -> u32 {
        self.max_retries_per_deliverable
    }

    pub fn stage_retry_delay(&self) -> Duration {
        self.stage_retry_delay
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn model_cache_ttl(&self) -> Duration {
        self.model_cache_ttl
    }

    pub fn merge_document(&self) -> bool {
        self.merge_document
    }

    pub fn include_table_of_contents(&self) -> bool {
        self.include_table_of_contents
    }

    pub fn include_metadata(&self) -> bool {
        self.include_metadata
    }

    pub fn template_dir(&self) -> Option<&Path> {
        self.template_dir.as_deref()
    }

    /// Attempts per stage at the engine level, including the first.
    pub fn stage_attempts(&self) -> u32 {
        self.max_retries_per_deliverable.saturating_add(1)
    }

    /// Delay before engine-level retry `attempt` (1-based) of a stage.
    pub fn stage_backoff_for(&self, attempt: u32) -> Duration {
        exponential(self.stage_retry_delay, attempt, self.retry.max_backoff)
    }

    /// Upper bound on wall-clock time for a run of `num_stages` stages when
    /// every attempt times out and every retry is used.
    pub fn worst_case_run_duration(&self, num_stages: usize) -> Duration {
        let client_backoff: Duration = (1..=self.retry.max_retries)
            .map(|a| self.retry.backoff_for(a))
            .sum();
        let per_call = self
            .request_timeout
            .saturating_mul(self.retry.max_attempts())
            .saturating_add(client_backoff);

        let stage_backoff: Duration = (1..=self.max_retries_per_deliverable)
            .map(|a| self.stage_backoff_for(a))
            .sum();
        let per_stage = per_call
            .saturating_mul(self.stage_attempts())
            .saturating_add(stage_backoff);

        per_stage.saturating_mul(u32::try_from(num_stages).unwrap_or(u32::MAX))
    }

    /// Check every value the engine relies on.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<(), CoreError> {
        let invalid = |msg: String| -> Result<(), CoreError> { Err(CoreError::InvalidConfig(msg)) };

        if !(0.0..=1.0).contains(&self.temperature) {
            return invalid(format!(
                "temperature must be within [0, 1], got {}",
                self.temperature
            ));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return invalid(format!("top_p must be within [0, 1], got {}", self.top_p));
        }
        if self.max_tokens == 0 {
            return invalid("max_tokens must be positive".to_owned());
        }
        if self.request_timeout.is_zero() {
            return invalid("request timeout must be positive".to_owned());
        }
        if self.connect_timeout.is_zero() {
            return invalid("connect timeout must be positive".to_owned());
        }
        if let ModelSelection::Named(name) = &self.model
            && name.trim().is_empty()
        {
            return invalid("model name must not be empty".to_owned());
        }

        match reqwest::Url::parse(&self.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
            Ok(url) => invalid(format!(
                "base url must use http or https, got {}",
                url.scheme()
            )),
            Err(e) => invalid(format!("base url {:?} is not a valid URL: {e}", self.base_url)),
        }
    }

    /// Build a configuration from the YAML project file.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidConfig` for negative or non-finite durations.
    pub fn from_project(project: &ProjectConfig) -> Result<Self, CoreError> {
        let server = &project.server;
        let generation = &project.generation;
        let retry = &project.retry;
        let orchestration = &project.orchestration;
        let output = &project.output;

        let policy = RetryPolicy::builder()
            .max_retries(retry.max_retries)
            .backoff_factor(seconds("retry.backoffFactorSecs", retry.backoff_factor_secs)?)
            .max_backoff(seconds("retry.maxBackoffSecs", retry.max_backoff_secs)?)
            .retry_on_status(retry.retry_on_status.clone())
            .build();

        Ok(Self {
            base_url: server.base_url.clone(),
            api_key: server.api_key.clone().map(ApiKey::from),
            model: ModelSelection::from(generation.model.clone()),
            max_tokens: generation.max_tokens,
            temperature: generation.temperature,
            top_p: generation.top_p,
            stop: generation.stop.clone(),
            completion_mode: orchestration.completion_mode,
            max_retries_per_deliverable: orchestration.max_retries_per_deliverable,
            stage_retry_delay: seconds(
                "orchestration.stageRetryDelaySecs",
                orchestration.stage_retry_delay_secs,
            )?,
            request_timeout: seconds("server.requestTimeoutSecs", server.request_timeout_secs)?,
            connect_timeout: seconds("server.connectTimeoutSecs", server.connect_timeout_secs)?,
            retry: policy,
            model_cache_ttl: seconds(
                "orchestration.modelCacheTtlSecs",
                orchestration.model_cache_ttl_secs,
            )?,
            merge_document: output.merge_document,
            include_table_of_contents: output.include_table_of_contents,
            include_metadata: output.include_metadata,
            template_dir: orchestration.template_dir.clone(),
        })
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration, CoreError> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| CoreError::InvalidConfig(format!("{field}: {e}")))
}

// ── Project Configuration (protogen.yaml) ───────────────────

/// Project-level configuration, deserialized from `protogen.yaml`.
///
/// All fields have serde defaults so that a missing or partial file produces
/// the same values as [`GenerationConfig::default`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub generation: GenerationSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub orchestration: OrchestrationSettings,

    #[serde(default)]
    pub output: OutputSettings,
}

/// Where the inference server lives and how long to wait for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: f64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: f64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Sampling parameters sent with every completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSettings {
    /// Model name, or `auto` to use the first loaded model.
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default)]
    pub stop: Vec<String>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            stop: Vec::new(),
        }
    }
}

/// Transport retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor_secs: f64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: f64,

    #[serde(default = "default_retry_statuses")]
    pub retry_on_status: Vec<u16>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_factor_secs: default_backoff_factor(),
            max_backoff_secs: default_max_backoff(),
            retry_on_status: default_retry_statuses(),
        }
    }
}

/// Engine-level settings for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationSettings {
    #[serde(default)]
    pub completion_mode: CompletionMode,

    #[serde(default = "default_max_retries")]
    pub max_retries_per_deliverable: u32,

    #[serde(default = "default_backoff_factor")]
    pub stage_retry_delay_secs: f64,

    #[serde(default = "default_model_cache_ttl")]
    pub model_cache_ttl_secs: f64,

    /// Directory of prompt template overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_dir: Option<PathBuf>,
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        Self {
            completion_mode: CompletionMode::default(),
            max_retries_per_deliverable: default_max_retries(),
            stage_retry_delay_secs: default_backoff_factor(),
            model_cache_ttl_secs: default_model_cache_ttl(),
            template_dir: None,
        }
    }
}

/// Shape of the merged document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSettings {
    #[serde(default = "default_true")]
    pub merge_document: bool,

    #[serde(default = "default_true")]
    pub include_table_of_contents: bool,

    #[serde(default = "default_true")]
    pub include_metadata: bool,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            merge_document: true,
            include_table_of_contents: true,
            include_metadata: true,
        }
    }
}

// ── Default value functions for serde ────────────────────────

fn default_true() -> bool {
    true
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_owned()
}

fn default_model() -> String {
    "auto".to_owned()
}

fn default_request_timeout() -> f64 {
    60.0
}

fn default_connect_timeout() -> f64 {
    10.0
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_factor() -> f64 {
    1.0
}

fn default_max_backoff() -> f64 {
    60.0
}

fn default_retry_statuses() -> Vec<u16> {
    DEFAULT_RETRY_STATUSES.to_vec()
}

fn default_model_cache_ttl() -> f64 {
    300.0
}

// ── Config loading ───────────────────────────────────────────

/// Load [`ProjectConfig`] from a YAML file.
///
/// If the file does not exist, returns the default configuration.
///
/// # Errors
///
/// Returns `CoreError::Io` if the file exists but cannot be read.
/// Returns `CoreError::Yaml` if the file contains invalid YAML.
pub fn load_project_config(config_path: &Path) -> Result<ProjectConfig, CoreError> {
    if !config_path.exists() {
        return Ok(ProjectConfig::default());
    }
    let content = std::fs::read_to_string(config_path)?;
    let config: ProjectConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}
