//! Specialist adapter (C7) — the uniform call site wrapping each black-box
//! specialist.
//!
//! Generalizes a `Vec<Box<dyn HealthCheck>>`-style registry idiom to a
//! `HashMap<SpecialistKind, Box<dyn Specialist>>`, since callers need to
//! look one up by kind rather than walk all of them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::breaker::BreakerRegistry;
use crate::cache::{Cache, CacheCategory};
use crate::credential::CredentialIssuer;
use crate::error::{CoreError, ErrorKind};
use crate::model::{
    Analysis, AnalysisDepth, CacheInfo, FailureReason, PipelineSnapshot, SpecialistKind,
    SpecialistRequest, SpecialistResponse, TokenUsage,
};
use crate::tasks::{ExecutionMode, TaskEngine, TaskFn, TaskSpec};
use crate::model::Priority;

/// A black-box domain specialist.
#[async_trait]
pub trait Specialist: Send + Sync {
    fn kind(&self) -> SpecialistKind;
    async fn process(&self, request: SpecialistRequest) -> Result<SpecialistResponse, CoreError>;
}

fn cache_key(kind: SpecialistKind, user_id: &str, query_type: &str, context: &PipelineSnapshot, depth: AnalysisDepth) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    query_type.hash(&mut hasher);
    context.key_metrics.len().hash(&mut hasher);
    context.last_updated.hash(&mut hasher);
    format!("{:?}", depth).hash(&mut hasher);
    let digest = hasher.finish();
    format!("specialist:{}:{}:{:x}", kind.as_str(), user_id, digest)
}

fn ttl_category(depth: AnalysisDepth) -> CacheCategory {
    match depth {
        AnalysisDepth::Quick => CacheCategory::AgentResponseQuick,
        AnalysisDepth::Standard => CacheCategory::AgentResponseStandard,
        AnalysisDepth::Deep => CacheCategory::AgentResponseDeep,
    }
}

/// Outcome of one adapter call, carrying enough to feed the dispatcher's
/// partial-failure accounting.
pub enum AdapterOutcome {
    Success(SpecialistResponse),
    NoContribution(SpecialistResponse),
    Failed(FailureReason),
}

/// Registry of specialists plus the shared collaborators each call needs:
/// credential issuer, cache, breaker registry, task engine.
pub struct SpecialistAdapter {
    specialists: HashMap<SpecialistKind, Arc<dyn Specialist>>,
    credentials: Arc<CredentialIssuer>,
    cache: Arc<Cache>,
    breakers: BreakerRegistry,
    tasks: Arc<TaskEngine>,
}

impl SpecialistAdapter {
    pub fn new(
        credentials: Arc<CredentialIssuer>,
        cache: Arc<Cache>,
        breakers: BreakerRegistry,
        tasks: Arc<TaskEngine>,
    ) -> Self {
        SpecialistAdapter { specialists: HashMap::new(), credentials, cache, breakers, tasks }
    }

    pub fn register(&mut self, specialist: Arc<dyn Specialist>) {
        self.specialists.insert(specialist.kind(), specialist);
    }

    /// Cache check, breaker check, credential mint, dispatch through the
    /// task engine under a depth-appropriate deadline, validate the
    /// envelope, then cache the result.
    pub async fn call(
        &self,
        kind: SpecialistKind,
        request_id: Uuid,
        user_id: &str,
        query_type: &str,
        context: PipelineSnapshot,
        analysis_depth: AnalysisDepth,
        priority: Priority,
    ) -> AdapterOutcome {
        let Some(specialist) = self.specialists.get(&kind).cloned() else {
            return AdapterOutcome::Failed(FailureReason::Error(format!("no specialist registered for {kind}")));
        };

        // Step 2: cache lookup, before minting a credential or touching the breaker.
        let key = cache_key(kind, user_id, query_type, &context, analysis_depth);
        if let Some(mut cached) = self.cache.get_json::<SpecialistResponse>(&key).await {
            cached.cache_info = CacheInfo { hit: true, ttl_remaining: None };
            debug!(specialist = %kind, user_id, "specialist cache hit");
            return if cached.domain_match {
                AdapterOutcome::Success(cached)
            } else {
                AdapterOutcome::NoContribution(cached)
            };
        }

        // Step 3: breaker check.
        let breaker = self.breakers.get_or_create(kind.as_str());
        if breaker.allow().await.is_err() {
            warn!(specialist = %kind, "breaker open, skipping call");
            return AdapterOutcome::Failed(FailureReason::BreakerOpen);
        }

        // Step 1: mint credential bound to this request and specialist.
        let credential = match self.credentials.mint(request_id, kind.as_str()) {
            Ok(token) => token,
            Err(e) => {
                breaker.record_failure().await;
                return AdapterOutcome::Failed(FailureReason::Error(e.to_string()));
            }
        };

        let token_budget = analysis_depth.token_budget();
        let specialist_request = SpecialistRequest {
            request_id,
            query_type: query_type.to_string(),
            context,
            token_budget,
            analysis_depth,
            credential,
        };

        // Step 4+5: invoke under the task engine, priority inherited, deadline
        // enforced via the engine's own timeout handling.
        let deadline = analysis_depth.deadline();
        let specialist_clone = Arc::clone(&specialist);
        let func: TaskFn = Arc::new(move || {
            let specialist = Arc::clone(&specialist_clone);
            let request = specialist_request.clone();
            Box::pin(async move {
                specialist
                    .process(request)
                    .await
                    .map(|resp| serde_json::to_value(resp).unwrap_or(serde_json::Value::Null))
            })
        });

        let start = Instant::now();
        let result = self
            .tasks
            .submit_and_await(TaskSpec {
                func,
                priority,
                timeout: deadline,
                mode: ExecutionMode::Async,
                owner_user_id: Some(user_id.to_string()),
                owner_specialist: Some(kind.as_str().to_string()),
            })
            .await;

        let response = match result.status {
            crate::tasks::SerializableStatus::Timeout => {
                breaker.record_failure().await;
                warn!(specialist = %kind, elapsed_ms = start.elapsed().as_millis(), "specialist timed out");
                return AdapterOutcome::Failed(FailureReason::Timeout);
            }
            crate::tasks::SerializableStatus::Cancelled => {
                return AdapterOutcome::Failed(FailureReason::Error("cancelled".to_string()));
            }
            crate::tasks::SerializableStatus::Failed => {
                breaker.record_failure().await;
                let message = result.error.unwrap_or_else(|| "specialist failed".to_string());
                return AdapterOutcome::Failed(FailureReason::Error(message));
            }
            crate::tasks::SerializableStatus::Completed => {
                match result.value.and_then(|v| serde_json::from_value::<SpecialistResponse>(v).ok()) {
                    Some(response) => response,
                    None => {
                        breaker.record_failure().await;
                        return AdapterOutcome::Failed(FailureReason::ProtocolViolation);
                    }
                }
            }
        };

        // Step 6: validate the response envelope.
        if !response.is_protocol_valid(request_id) {
            breaker.record_failure().await;
            warn!(specialist = %kind, "response failed protocol validation");
            return AdapterOutcome::Failed(FailureReason::ProtocolViolation);
        }

        breaker.record_success().await;

        if !response.domain_match {
            return AdapterOutcome::NoContribution(response);
        }

        // Step 7: cache under the depth-appropriate TTL.
        self.cache.set_json(&key, &response, ttl_category(analysis_depth)).await;
        AdapterOutcome::Success(response)
    }
}

/// Test doubles shared between this crate's unit tests and the integration
/// tests under `tests/`. Not gated behind `#[cfg(test)]` since integration
/// tests link against the library built without it.
pub mod test_support {
    use super::*;

    /// A specialist double used by integration tests — echoes back a fixed
    /// response, optionally simulating a domain mismatch or hard failure.
    pub struct MockSpecialist {
        kind: SpecialistKind,
        pub domain_match: bool,
        pub fail: bool,
        pub violate_protocol: bool,
        pub delay: Option<std::time::Duration>,
    }

    impl MockSpecialist {
        pub fn new(kind: SpecialistKind, domain_match: bool, fail: bool) -> Self {
            MockSpecialist { kind, domain_match, fail, violate_protocol: false, delay: None }
        }

        /// Returns `for_dispatcher_only: false`, simulating a specialist that
        /// breaks the response envelope contract.
        pub fn with_protocol_violation(mut self) -> Self {
            self.violate_protocol = true;
            self
        }

        /// Sleeps before responding, simulating a slow specialist call.
        pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
            self.delay = Some(delay);
            self
        }
    }

    #[async_trait]
    impl Specialist for MockSpecialist {
        fn kind(&self) -> SpecialistKind {
            self.kind
        }

        async fn process(&self, request: SpecialistRequest) -> Result<SpecialistResponse, CoreError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(ErrorKind::BusinessLogic("mock specialist failure".into()).into());
            }
            Ok(SpecialistResponse {
                agent_type: self.kind,
                request_id: request.request_id,
                domain_match: self.domain_match,
                confidence: 0.9,
                analysis: Analysis {
                    summary: "mock summary".to_string(),
                    key_insights: vec!["insight".to_string()],
                    recommendations: vec!["recommendation".to_string()],
                    metrics: serde_json::Value::Null,
                    detailed_analysis: "detail".to_string(),
                },
                token_usage: TokenUsage { input: 100, output: 50 },
                cache_info: CacheInfo { hit: false, ttl_remaining: None },
                processing_time_ms: 10,
                for_dispatcher_only: !self.violate_protocol,
            })
        }
    }
}
