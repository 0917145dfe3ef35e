//! Composition root — owns every collaborator and wires them together once,
//! in place of ad-hoc module-level singletons. One struct, one constructor,
//! no globals.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::cache::Cache;
use crate::config::Config;
use crate::credential::CredentialIssuer;
use crate::dispatcher::{Dispatcher, RuleBasedClassifier, TemplateSynthesizer};
use crate::error::CoreError;
use crate::model::FinalResponse;
use crate::pipeline::{AnalyticsSource, Pipeline, RawSnapshot};
use crate::specialist::{Specialist, SpecialistAdapter};
use crate::tasks::{TaskEngine, TaskEngineStats, TaskId, TaskResult, TaskSpec};

/// Stand-in used when the host doesn't wire a real analytics backend;
/// every refresh attempt fails, so users fall back to `empty_fallback`
/// snapshots rather than the process panicking for want of a collaborator.
struct NullAnalyticsSource;

#[async_trait::async_trait]
impl AnalyticsSource for NullAnalyticsSource {
    async fn comprehensive_summary(&self, _user_id: &str) -> Result<RawSnapshot, String> {
        Err("no analytics source configured".to_string())
    }
    async fn basic_summary(&self, _user_id: &str) -> Result<RawSnapshot, String> {
        Err("no analytics source configured".to_string())
    }
}

/// Everything a host needs to run the dispatcher: the specialists it wants
/// registered, and optionally a real analytics backend and persistent store.
#[derive(Default)]
pub struct CoreBuilder {
    specialists: Vec<Arc<dyn Specialist>>,
    analytics_source: Option<Arc<dyn AnalyticsSource>>,
    store: Option<Arc<sled::Db>>,
}

impl CoreBuilder {
    pub fn new() -> Self {
        CoreBuilder::default()
    }

    pub fn with_specialist(mut self, specialist: Arc<dyn Specialist>) -> Self {
        self.specialists.push(specialist);
        self
    }

    pub fn with_analytics_source(mut self, source: Arc<dyn AnalyticsSource>) -> Self {
        self.analytics_source = Some(source);
        self
    }

    pub fn with_store(mut self, store: Arc<sled::Db>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self, config: Config) -> Result<Arc<Core>, CoreError> {
        Core::assemble(config, self.specialists, self.analytics_source, self.store)
    }
}

/// The assembled system: cache, breakers, credentials, task engine, pipeline,
/// specialist adapter and dispatcher, all sharing one `Config`.
pub struct Core {
    config: Config,
    cache: Arc<Cache>,
    pipeline: Arc<Pipeline>,
    tasks: Arc<TaskEngine>,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
}

impl Core {
    fn assemble(
        config: Config,
        specialists: Vec<Arc<dyn Specialist>>,
        analytics_source: Option<Arc<dyn AnalyticsSource>>,
        store: Option<Arc<sled::Db>>,
    ) -> Result<Arc<Self>, CoreError> {
        config.validate()?;

        // A concrete network-backed RemoteStore is an external collaborator
        // a host plugs in separately; until one is wired, every `cache.*`
        // config still drives the local fallback's capacity.
        let cache = Arc::new(Cache::with_no_remote(config.cache.local_capacity));

        let breakers = BreakerRegistry::new(BreakerConfig {
            failure_threshold: config.breaker.failure_threshold,
            recovery_timeout: config.recovery_timeout(),
        });

        let secret = config.dispatcher.secret.clone().unwrap_or_default();
        let credentials = Arc::new(CredentialIssuer::new(&secret, config.credential_ttl())?);

        let tasks = TaskEngine::new(
            config.tasks.workers,
            config.tasks.queue_capacity,
            config.tasks.queue_capacity,
            Arc::clone(&cache),
        );

        let mut adapter = SpecialistAdapter::new(
            Arc::clone(&credentials),
            Arc::clone(&cache),
            breakers,
            Arc::clone(&tasks),
        );
        for specialist in specialists {
            adapter.register(specialist);
        }

        let source = analytics_source.unwrap_or_else(|| Arc::new(NullAnalyticsSource));
        let pipeline = Pipeline::new(config.pipeline.clone(), source, store);

        let dispatcher = Dispatcher::new(
            Arc::clone(&pipeline),
            Arc::new(adapter),
            Arc::new(RuleBasedClassifier),
            Arc::new(TemplateSynthesizer),
            config.default_deadline(),
        );

        Ok(Arc::new(Core {
            config,
            cache,
            pipeline,
            tasks,
            dispatcher,
            shutdown: CancellationToken::new(),
        }))
    }

    /// Loads `Config` from the environment/file/default chain and assembles
    /// a standalone core with no specialists and no external analytics
    /// backend — enough to run the dispatcher's general-query path and
    /// exercise the task engine, but every specialist query will report
    /// "no specialist registered".
    pub fn bootstrap() -> Result<Arc<Self>, CoreError> {
        let config = Config::load()?;
        CoreBuilder::new().build(config)
    }

    /// Starts the task engine workers and the pipeline's three background
    /// loops, plus the cache's remote-reconnect probe.
    pub fn start(self: &Arc<Self>) {
        self.tasks.start();
        self.pipeline.start();

        let cache = Arc::clone(&self.cache);
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            cache.run_reconnect_probe(Duration::from_secs(30), cancel).await;
        });

        info!("dispatch core started");
    }

    pub fn stop(&self) {
        self.tasks.stop();
        self.pipeline.stop();
        self.shutdown.cancel();
        info!("dispatch core stopping");
    }

    pub async fn handle_query(&self, user_id: &str, message: &str, metadata: serde_json::Value) -> FinalResponse {
        self.dispatcher.handle_query(user_id, message, metadata).await
    }

    pub async fn register_interaction(&self, user_id: &str) {
        self.pipeline.register_interaction(user_id).await;
    }

    pub async fn force_refresh(&self, user_id: &str) -> bool {
        self.pipeline.force_refresh(user_id).await
    }

    pub async fn get_enrichment(&self, user_id: &str) -> crate::model::PipelineSnapshot {
        self.pipeline.get_enrichment(user_id).await
    }

    pub async fn submit_task(&self, spec: TaskSpec) -> Result<TaskId, CoreError> {
        self.tasks.submit(spec).await
    }

    pub async fn get_task_result(&self, task_id: TaskId, wait: bool, timeout: Option<Duration>) -> Option<TaskResult> {
        self.tasks.get_result(task_id, wait, timeout).await
    }

    pub async fn cancel_task(&self, task_id: TaskId) -> bool {
        self.tasks.cancel(task_id).await
    }

    pub async fn task_stats(&self) -> TaskEngineStats {
        self.tasks.stats().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Used by hosts that want a fresh id up front (e.g. to log it before the
/// query resolves). `Core::handle_query` mints its own internally regardless.
pub fn new_request_id() -> Uuid {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::specialist::test_support::MockSpecialist;
    use crate::model::SpecialistKind;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.dispatcher.secret = Some("test-secret".to_string());
        config
    }

    #[tokio::test]
    async fn bootstrap_without_specialists_answers_general_queries() {
        let core = CoreBuilder::new().build(test_config()).unwrap();
        core.start();

        let response = core.handle_query("u1", "hello", serde_json::Value::Null).await;
        assert_eq!(response.intent, "general");
        assert!(!response.degraded);

        core.stop();
    }

    #[tokio::test]
    async fn registered_specialist_is_reachable_through_core() {
        let core = CoreBuilder::new()
            .with_specialist(Arc::new(MockSpecialist::new(SpecialistKind::ContentAnalysis, true, false)))
            .build(test_config())
            .unwrap();
        core.start();

        let response = core
            .handle_query("u1", "how did my videos perform", serde_json::Value::Null)
            .await;
        assert!(response.sources.contains(&SpecialistKind::ContentAnalysis));

        core.stop();
    }

    #[tokio::test]
    async fn task_submission_round_trips_through_core() {
        let core = CoreBuilder::new().build(test_config()).unwrap();
        core.start();

        let func: crate::tasks::TaskFn = Arc::new(|| Box::pin(async { Ok(serde_json::json!(7)) }));
        let id = core
            .submit_task(TaskSpec {
                func,
                priority: crate::model::Priority::Normal,
                timeout: Duration::from_secs(5),
                mode: crate::tasks::ExecutionMode::Async,
                owner_user_id: None,
                owner_specialist: None,
            })
            .await
            .unwrap();

        let result = core.get_task_result(id, true, Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(result.value, Some(serde_json::json!(7)));

        core.stop();
    }

    #[test]
    fn config_without_secret_fails_to_assemble() {
        let result = CoreBuilder::new().build(Config::default());
        assert!(result.is_err());
    }
}
