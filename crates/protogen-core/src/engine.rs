//! Core orchestration engine.
//!
//! The [`Engine`] is the main entry point for protogen-core. It owns the
//! validated configuration, the prompt manager and the inference backend, and
//! runs the stage pipeline through [`orchestrate()`](Engine::orchestrate).

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use protogen_pm::{DeliverableKind, PromptManager};

use crate::aggregate::{DocumentRenderer, MarkdownRenderer};
use crate::cache::ModelCache;
use crate::cancel::CancelSignal;
use crate::client::{InferenceBackend, InferenceClient};
use crate::config::{GenerationConfig, ModelSelection};
use crate::error::{CoreError, ErrorKind, InferenceError};
use crate::events::ProgressObserver;
use crate::result::OrchestrationResult;

/// Drives multi-stage generation runs against one inference server.
///
/// An engine holds no per-run state: concurrent calls to
/// [`orchestrate()`](Engine::orchestrate) are independent and share only the
/// model cache.
///
/// # Examples
///
/// ```no_run
/// use protogen_core::{DeliverableKind, Engine, GenerationConfig};
///
/// # async fn example() -> Result<(), protogen_core::CoreError> {
/// let engine = Engine::new(GenerationConfig::default())?;
/// let result = engine
///     .orchestrate(
///         "a task tracker for small teams",
///         &[DeliverableKind::ProblemStatement, DeliverableKind::Personas],
///         None,
///     )
///     .await?;
/// println!("{}", result.merged_document().unwrap_or_default());
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    config: GenerationConfig,
    backend: Arc<dyn InferenceBackend>,
    prompts: PromptManager,
    model_cache: Arc<ModelCache>,
    observer: Option<Arc<dyn ProgressObserver>>,
    renderer: Arc<dyn DocumentRenderer>,
}

impl Engine {
    /// Create an engine talking to the server described by `config`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidConfig` if the configuration is invalid.
    /// Returns `CoreError::Prompt` if template overrides cannot be loaded.
    #[instrument(skip_all, fields(base_url = %config.base_url()))]
    pub fn new(config: GenerationConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let client = InferenceClient::new(&config)?;
        Self::with_backend(config, Arc::new(client))
    }

    /// Create an engine over an arbitrary backend.
    ///
    /// # Errors
    ///
    /// Same as [`new()`](Engine::new).
    pub fn with_backend(
        config: GenerationConfig,
        backend: Arc<dyn InferenceBackend>,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let mut prompts = PromptManager::new()?;
        if let Some(dir) = config.template_dir() {
            prompts.load_dir(dir)?;
            debug!(dir = %dir.display(), "loaded template overrides");
        }

        info!(
            model = %config.model(),
            mode = ?config.completion_mode(),
            max_retries_per_deliverable = config.max_retries_per_deliverable(),
            "engine ready"
        );

        Ok(Self {
            model_cache: Arc::new(ModelCache::new(config.model_cache_ttl())),
            config,
            backend,
            prompts,
            observer: None,
            renderer: Arc::new(MarkdownRenderer),
        })
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Share a model cache with other engines pointed at the same server.
    #[must_use]
    pub fn with_model_cache(mut self, cache: Arc<ModelCache>) -> Self {
        self.model_cache = cache;
        self
    }

    #[must_use]
    pub fn with_renderer(mut self, renderer: Arc<dyn DocumentRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    #[must_use]
    pub fn with_prompt_manager(mut self, prompts: PromptManager) -> Self {
        self.prompts = prompts;
        self
    }

    /// Generate every requested deliverable in the given order.
    ///
    /// Each stage sees the text of every earlier succeeded stage. Stage
    /// failures never abort the run; they are recorded in the result.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NoDeliverables` for an empty `kinds` slice and
    /// `CoreError::Cancelled` if `cancel` fires before the first stage starts.
    #[instrument(skip(self, user_input, cancel), fields(stages = kinds.len()))]
    pub async fn orchestrate(
        &self,
        user_input: &str,
        kinds: &[DeliverableKind],
        cancel: Option<&CancelSignal>,
    ) -> Result<OrchestrationResult, CoreError> {
        crate::run::run_orchestration(self, user_input, kinds, None, cancel).await
    }

    /// Like [`orchestrate()`](Engine::orchestrate), with extra context added
    /// to every stage prompt under "Additional Context".
    ///
    /// # Errors
    ///
    /// Same as [`orchestrate()`](Engine::orchestrate).
    #[instrument(skip(self, user_input, context, cancel), fields(stages = kinds.len()))]
    pub async fn orchestrate_with_context(
        &self,
        user_input: &str,
        kinds: &[DeliverableKind],
        context: &serde_json::Value,
        cancel: Option<&CancelSignal>,
    ) -> Result<OrchestrationResult, CoreError> {
        crate::run::run_orchestration(self, user_input, kinds, Some(context), cancel).await
    }

    /// Ids of the models the server has loaded, served from the model cache.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Inference` if the listing fails.
    #[instrument(skip(self))]
    pub async fn list_available_models(&self) -> Result<Vec<String>, CoreError> {
        let models = self.model_cache.get_or_refresh(self.backend.as_ref()).await?;
        Ok(models.into_iter().map(|m| m.id).collect())
    }

    /// Single un-retried liveness check.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> bool {
        self.backend.health_check().await
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn model_cache(&self) -> &Arc<ModelCache> {
        &self.model_cache
    }

    pub fn prompts(&self) -> &PromptManager {
        &self.prompts
    }

    /// Model name for this run: the configured one, or the first listed.
    pub(crate) async fn resolve_model(&self) -> Result<String, InferenceError> {
        match self.config.model() {
            ModelSelection::Named(name) => Ok(name.clone()),
            ModelSelection::Auto => {
                let models = self
                    .model_cache
                    .get_or_refresh(self.backend.as_ref())
                    .await?;
                models.into_iter().next().map(|m| m.id).ok_or_else(|| {
                    InferenceError::new(ErrorKind::Unknown, "server reported no loaded models")
                })
            }
        }
    }

    pub(crate) fn backend(&self) -> &dyn InferenceBackend {
        self.backend.as_ref()
    }

    pub(crate) fn observer(&self) -> Option<&dyn ProgressObserver> {
        self.observer.as_deref()
    }

    pub(crate) fn renderer(&self) -> &dyn DocumentRenderer {
        self.renderer.as_ref()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("prompts", &self.prompts)
            .field("model_cache", &self.model_cache)
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::ScriptedBackend;

    fn engine(
        config: GenerationConfig,
        backend: ScriptedBackend,
    ) -> (Engine, Arc<ScriptedBackend>) {
        let backend = Arc::new(backend);
        let engine = Engine::with_backend(config, backend.clone()).expect("should build engine");
        (engine, backend)
    }

    #[test]
    fn test_should_create_engine_with_defaults() {
        let engine = Engine::new(GenerationConfig::default());
        assert!(engine.is_ok(), "engine creation should succeed: {:?}", engine.err());
    }

    #[test]
    fn test_should_reject_invalid_config() {
        let config = GenerationConfig::builder().temperature(3.0).build();
        let err = Engine::new(config).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn test_should_load_template_dir_overrides() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        std::fs::create_dir_all(dir.path().join("instructions")).expect("should create dir");
        std::fs::write(dir.path().join("instructions/personas.j2"), "Only one persona.")
            .expect("should write");

        let config = GenerationConfig::builder().template_dir(dir.path()).build();
        let (engine, _) = engine(config, ScriptedBackend::new());

        let prompt = engine
            .prompts()
            .generate(DeliverableKind::Personas, "idea", &[])
            .expect("should render");
        assert!(prompt.contains("Only one persona."));
    }

    #[test]
    fn test_should_fail_on_missing_template_dir() {
        let config = GenerationConfig::builder()
            .template_dir("/nonexistent/protogen-templates")
            .build();
        let err = Engine::with_backend(config, Arc::new(ScriptedBackend::new())).unwrap_err();
        assert!(matches!(err, CoreError::Prompt(_)));
    }

    #[tokio::test]
    async fn test_should_resolve_named_model_without_listing() {
        let config = GenerationConfig::builder().model("phi-3").build();
        let (engine, backend) = engine(config, ScriptedBackend::new().with_models(&["other"]));

        assert_eq!(engine.resolve_model().await.expect("should resolve"), "phi-3");
        assert_eq!(backend.list_calls(), 0);
    }

    #[tokio::test]
    async fn test_should_resolve_auto_to_first_listed_model() {
        let (engine, backend) = engine(
            GenerationConfig::default(),
            ScriptedBackend::new().with_models(&["first", "second"]),
        );

        assert_eq!(engine.resolve_model().await.expect("should resolve"), "first");
        assert_eq!(engine.resolve_model().await.expect("should resolve"), "first");
        assert_eq!(backend.list_calls(), 1, "second lookup should hit the cache");
    }

    #[tokio::test]
    async fn test_should_fail_auto_resolution_with_no_models() {
        let (engine, _) = engine(GenerationConfig::default(), ScriptedBackend::new());
        let err = engine.resolve_model().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unknown);
    }

    #[tokio::test]
    async fn test_should_list_models_and_share_cache() {
        let cache = Arc::new(ModelCache::new(Duration::from_secs(60)));
        let backend = Arc::new(ScriptedBackend::new().with_models(&["a", "b"]));

        let first = Engine::with_backend(GenerationConfig::default(), backend.clone())
            .expect("should build")
            .with_model_cache(cache.clone());
        let second = Engine::with_backend(GenerationConfig::default(), backend.clone())
            .expect("should build")
            .with_model_cache(cache);

        assert_eq!(
            first.list_available_models().await.expect("should list"),
            vec!["a", "b"]
        );
        second.list_available_models().await.expect("should list");
        assert_eq!(backend.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_should_pass_health_check_through() {
        let (healthy, _) = engine(GenerationConfig::default(), ScriptedBackend::new());
        assert!(healthy.health_check().await);

        let (unhealthy, _) = engine(
            GenerationConfig::default(),
            ScriptedBackend::new().with_list_error(ErrorKind::Network),
        );
        assert!(!unhealthy.health_check().await);
    }
}
