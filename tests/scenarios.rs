//! End-to-end scenarios driven through [`dispatch_core::Core`], exercising
//! the full classify -> fan-out -> collect -> synthesize path plus the
//! priority task engine independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dispatch_core::config::Config;
use dispatch_core::core::CoreBuilder;
use dispatch_core::model::{FailureReason, Priority, SpecialistKind};
use dispatch_core::pipeline::{AnalyticsSource, RawSnapshot};
use dispatch_core::specialist::test_support::MockSpecialist;
use dispatch_core::tasks::{ExecutionMode, TaskFn, TaskSpec};

fn config() -> Config {
    let mut config = Config::default();
    config.dispatcher.secret = Some("integration-test-secret".to_string());
    config
}

struct StubAnalyticsSource {
    metrics: HashMap<String, f64>,
}

#[async_trait::async_trait]
impl AnalyticsSource for StubAnalyticsSource {
    async fn comprehensive_summary(&self, _user_id: &str) -> Result<RawSnapshot, String> {
        Ok(RawSnapshot {
            key_metrics: self.metrics.clone(),
            performance_insights: vec!["views are up".to_string()],
        })
    }

    async fn basic_summary(&self, _user_id: &str) -> Result<RawSnapshot, String> {
        Ok(RawSnapshot { key_metrics: self.metrics.clone(), performance_insights: Vec::new() })
    }
}

struct AlwaysFailsSource;

#[async_trait::async_trait]
impl AnalyticsSource for AlwaysFailsSource {
    async fn comprehensive_summary(&self, _user_id: &str) -> Result<RawSnapshot, String> {
        Err("analytics backend unreachable".to_string())
    }
    async fn basic_summary(&self, _user_id: &str) -> Result<RawSnapshot, String> {
        Err("analytics backend unreachable".to_string())
    }
}

/// S1 — a content query against a warm, real-time enrichment gets a
/// non-degraded answer sourced from the content specialist.
#[tokio::test]
async fn successful_content_query() {
    let mut metrics = HashMap::new();
    metrics.insert("views".to_string(), 12_000.0);
    let source = Arc::new(StubAnalyticsSource { metrics });

    let core = CoreBuilder::new()
        .with_specialist(Arc::new(MockSpecialist::new(SpecialistKind::ContentAnalysis, true, false)))
        .with_analytics_source(source)
        .build(config())
        .unwrap();
    core.start();

    assert!(core.force_refresh("u1").await);
    let enrichment = core.get_enrichment("u1").await;
    assert_eq!(enrichment.key_metrics.get("views"), Some(&12_000.0));

    let response = core.handle_query("u1", "How did my last videos perform?", serde_json::Value::Null).await;

    assert!(response.sources.contains(&SpecialistKind::ContentAnalysis));
    assert!(!response.degraded);
    assert_eq!(response.intent, SpecialistKind::ContentAnalysis.to_string());

    core.stop();
}

/// S2 — one specialist times out on a comprehensive query while the rest
/// succeed; the response still reports the other sources and isn't
/// degraded.
#[tokio::test(start_paused = true)]
async fn one_specialist_times_out_others_succeed() {
    let core = CoreBuilder::new()
        .with_specialist(Arc::new(MockSpecialist::new(SpecialistKind::ContentAnalysis, true, false)))
        .with_specialist(
            Arc::new(MockSpecialist::new(SpecialistKind::AudienceInsights, true, false).with_delay(Duration::from_secs(40))),
        )
        .with_specialist(Arc::new(MockSpecialist::new(SpecialistKind::SeoDiscoverability, true, false)))
        .with_specialist(Arc::new(MockSpecialist::new(SpecialistKind::CompetitiveAnalysis, true, false)))
        .with_specialist(Arc::new(MockSpecialist::new(SpecialistKind::Monetization, true, false)))
        .build(config())
        .unwrap();
    core.start();

    let response = core.handle_query("u2", "Give me a full report on everything", serde_json::Value::Null).await;

    assert!(!response.degraded);
    assert!(response.sources.contains(&SpecialistKind::ContentAnalysis));
    assert!(response.sources.contains(&SpecialistKind::SeoDiscoverability));
    assert!(response.sources.contains(&SpecialistKind::CompetitiveAnalysis));
    assert!(response.sources.contains(&SpecialistKind::Monetization));
    assert!(!response.sources.contains(&SpecialistKind::AudienceInsights));
    assert!(response
        .agents_failed
        .iter()
        .any(|(kind, reason)| *kind == SpecialistKind::AudienceInsights && *reason == FailureReason::Timeout));

    core.stop();
}

/// S3 — every specialist fails (breakers open); the dispatcher still
/// returns within its deadline, degraded, synthesized from enrichment alone.
#[tokio::test]
async fn all_specialists_failing_degrades_gracefully() {
    let core = CoreBuilder::new()
        .with_specialist(Arc::new(MockSpecialist::new(SpecialistKind::ContentAnalysis, true, true)))
        .with_specialist(Arc::new(MockSpecialist::new(SpecialistKind::AudienceInsights, true, true)))
        .with_specialist(Arc::new(MockSpecialist::new(SpecialistKind::SeoDiscoverability, true, true)))
        .with_specialist(Arc::new(MockSpecialist::new(SpecialistKind::CompetitiveAnalysis, true, true)))
        .with_specialist(Arc::new(MockSpecialist::new(SpecialistKind::Monetization, true, true)))
        .build(config())
        .unwrap();
    core.start();

    let response = core.handle_query("u3", "Analyze everything", serde_json::Value::Null).await;

    assert!(response.sources.is_empty());
    assert!(response.degraded);
    assert!(!response.text.is_empty());

    core.stop();
}

/// S4 — a specialist that violates the response envelope contract
/// (`for_dispatcher_only=false`) never contributes text and is reported as
/// a protocol violation, not folded into the answer.
#[tokio::test]
async fn protocol_violation_is_rejected_outright() {
    let core = CoreBuilder::new()
        .with_specialist(
            Arc::new(MockSpecialist::new(SpecialistKind::ContentAnalysis, true, false).with_protocol_violation()),
        )
        .build(config())
        .unwrap();
    core.start();

    let response = core.handle_query("u4", "How did my videos perform", serde_json::Value::Null).await;

    assert!(!response.sources.contains(&SpecialistKind::ContentAnalysis));
    assert!(response
        .agents_failed
        .iter()
        .any(|(kind, reason)| *kind == SpecialistKind::ContentAnalysis && *reason == FailureReason::ProtocolViolation));
    assert!(!response.text.contains("mock summary"));

    core.stop();
}

/// S5 — a brand-new user gets an empty-fallback enrichment and a
/// general-path answer, never an exception.
#[tokio::test]
async fn cold_user_gets_empty_fallback_without_error() {
    let core = CoreBuilder::new()
        .with_analytics_source(Arc::new(AlwaysFailsSource))
        .build(config())
        .unwrap();
    core.start();

    let enrichment = core.get_enrichment("u_new").await;
    assert_eq!(enrichment.context_quality, dispatch_core::model::ContextQuality::EmptyFallback);

    let response = core.handle_query("u_new", "hello there", serde_json::Value::Null).await;
    assert_eq!(response.intent, "general");

    core.stop();
}

/// S6 — with a single worker, a critical task preempts a backlog of
/// low-priority work: it completes before the fifth queued low-priority
/// task would even start.
#[tokio::test]
async fn critical_task_preempts_low_priority_backlog() {
    use dispatch_core::cache::Cache;
    use dispatch_core::tasks::TaskEngine;

    let cache = Arc::new(Cache::with_no_remote(100));
    let engine = TaskEngine::new(1, 100, 100, cache);
    engine.start();

    for _ in 0..5 {
        let func: TaskFn = Arc::new(|| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(serde_json::json!("low"))
            })
        });
        engine
            .submit(TaskSpec {
                func,
                priority: Priority::Low,
                timeout: Duration::from_secs(30),
                mode: ExecutionMode::Async,
                owner_user_id: None,
                owner_specialist: None,
            })
            .await
            .unwrap();
    }

    let critical_func: TaskFn = Arc::new(|| Box::pin(async { Ok(serde_json::json!("critical")) }));
    let critical_id = engine
        .submit(TaskSpec {
            func: critical_func,
            priority: Priority::Critical,
            timeout: Duration::from_secs(30),
            mode: ExecutionMode::Async,
            owner_user_id: None,
            owner_specialist: None,
        })
        .await
        .unwrap();

    let result = engine
        .get_result(critical_id, true, Some(Duration::from_secs(10)))
        .await
        .expect("critical task should complete");
    assert_eq!(result.value, Some(serde_json::json!("critical")));

    engine.stop();
}
