//! Dispatcher (C8) — intent classify → fan-out → synthesize.
//!
//! `Classifier` and `Synthesizer` are pluggable function-object seams, in
//! place of a duck-typed dict of callables. A default rule-based pair ships
//! so the crate runs standalone; the actual NLP classification/synthesis
//! model is out of scope.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::model::{
    AnalysisDepth, DispatchRequest, FailureReason, FinalResponse, Intent, IntentTag, Priority,
    SpecialistKind, SpecialistResponse, TokenUsage, UserContext,
};
use crate::pipeline::Pipeline;
use crate::specialist::{AdapterOutcome, SpecialistAdapter};

/// `(message, enrichment) -> Intent`. Swappable per host.
pub trait Classifier: Send + Sync {
    fn classify(&self, message: &str, enrichment: &crate::model::PipelineSnapshot) -> Intent;
}

/// `(message, successful_responses, enrichment) -> text`. Swappable per
/// host.
pub trait Synthesizer: Send + Sync {
    fn synthesize(
        &self,
        message: &str,
        responses: &[(SpecialistKind, SpecialistResponse)],
        enrichment: &crate::model::PipelineSnapshot,
    ) -> String;
}

/// Keyword-matching classifier; good enough to exercise the dispatcher
/// end-to-end without an external NLP model.
pub struct RuleBasedClassifier;

impl Classifier for RuleBasedClassifier {
    fn classify(&self, message: &str, _enrichment: &crate::model::PipelineSnapshot) -> Intent {
        let lower = message.to_lowercase();
        let rules: &[(&str, SpecialistKind)] = &[
            ("view", SpecialistKind::ContentAnalysis),
            ("video", SpecialistKind::ContentAnalysis),
            ("post", SpecialistKind::ContentAnalysis),
            ("audience", SpecialistKind::AudienceInsights),
            ("follower", SpecialistKind::AudienceInsights),
            ("seo", SpecialistKind::SeoDiscoverability),
            ("search", SpecialistKind::SeoDiscoverability),
            ("competitor", SpecialistKind::CompetitiveAnalysis),
            ("compare", SpecialistKind::CompetitiveAnalysis),
            ("revenue", SpecialistKind::Monetization),
            ("monetiz", SpecialistKind::Monetization),
        ];

        let matched: Vec<SpecialistKind> = rules
            .iter()
            .filter(|(keyword, _)| lower.contains(keyword))
            .map(|(_, kind)| *kind)
            .collect();

        if lower.contains("everything") || lower.contains("comprehensive") || lower.contains("full report") {
            return Intent::new(IntentTag::Comprehensive, 0.95, SpecialistKind::ALL.to_vec());
        }

        if matched.is_empty() {
            return Intent::new(IntentTag::General, 0.2, Vec::new());
        }

        let mut deduped = Vec::new();
        for kind in matched {
            if !deduped.contains(&kind) {
                deduped.push(kind);
            }
        }
        let confidence = if deduped.len() == 1 { 0.85 } else { 0.6 };
        Intent::new(IntentTag::Specialist(deduped[0]), confidence, deduped)
    }
}

/// Template synthesizer; concatenates each contributing specialist's summary.
pub struct TemplateSynthesizer;

impl Synthesizer for TemplateSynthesizer {
    fn synthesize(
        &self,
        _message: &str,
        responses: &[(SpecialistKind, SpecialistResponse)],
        enrichment: &crate::model::PipelineSnapshot,
    ) -> String {
        if responses.is_empty() {
            return general_answer(enrichment);
        }

        let mut text = String::new();
        for (kind, response) in responses {
            text.push_str(&format!("[{kind}] {}\n", response.analysis.summary));
        }
        text.trim_end().to_string()
    }
}

fn general_answer(enrichment: &crate::model::PipelineSnapshot) -> String {
    if enrichment.performance_insights.is_empty() {
        "We don't have enough data yet to answer that in detail.".to_string()
    } else {
        format!("Here's what we know so far: {}", enrichment.performance_insights.join("; "))
    }
}

/// Whether `domain_match=false` responses still count toward billed
/// `token_usage`.
fn counts_toward_token_usage(domain_match: bool) -> bool {
    domain_match
}

pub struct Dispatcher {
    pipeline: Arc<Pipeline>,
    adapter: Arc<SpecialistAdapter>,
    classifier: Arc<dyn Classifier>,
    synthesizer: Arc<dyn Synthesizer>,
    default_deadline: std::time::Duration,
}

impl Dispatcher {
    pub fn new(
        pipeline: Arc<Pipeline>,
        adapter: Arc<SpecialistAdapter>,
        classifier: Arc<dyn Classifier>,
        synthesizer: Arc<dyn Synthesizer>,
        default_deadline: std::time::Duration,
    ) -> Self {
        Dispatcher { pipeline, adapter, classifier, synthesizer, default_deadline }
    }

    /// Never raises to its caller; internal
    /// panics are caught at this outer boundary and folded into a degraded
    /// response.
    pub async fn handle_query(&self, user_id: &str, message: &str, metadata: serde_json::Value) -> FinalResponse {
        let request_id = Uuid::new_v4();
        let started = Instant::now();

        let outcome = AssertUnwindSafe(self.run_pipeline(user_id, message, metadata, request_id))
            .catch_unwind()
            .await;

        match outcome {
            Ok(response) => response,
            Err(panic) => {
                let reason = panic_message(&panic);
                error!(request_id = %request_id, user_id, reason, "dispatcher caught an internal panic");
                FinalResponse {
                    text: "Something went wrong while processing your request.".to_string(),
                    intent: IntentTag::General.to_string(),
                    sources: HashSet::new(),
                    token_usage: TokenUsage::default(),
                    agents_failed: Vec::new(),
                    degraded: true,
                    request_id,
                    processing_time_ms: started.elapsed().as_millis() as u64,
                }
            }
        }
    }

    async fn run_pipeline(
        &self,
        user_id: &str,
        message: &str,
        metadata: serde_json::Value,
        request_id: Uuid,
    ) -> FinalResponse {
        let started = Instant::now();

        // Step 1: enrich.
        let enrichment = self.pipeline.get_enrichment(user_id).await;
        let context = UserContext { user_id: user_id.to_string(), channel_summary: enrichment.clone(), metadata };
        let request = DispatchRequest::new(user_id, message, context, self.default_deadline);
        let request = DispatchRequest { request_id, ..request };

        // Step 2: classify.
        let intent = self.classifier.classify(message, &enrichment);
        let selected = intent.selected_specialists();

        if selected.is_empty() {
            // Step 6: general path.
            let text = general_answer(&enrichment);
            return FinalResponse {
                text,
                intent: intent.tag.to_string(),
                sources: HashSet::new(),
                token_usage: TokenUsage::default(),
                agents_failed: Vec::new(),
                degraded: false,
                request_id,
                processing_time_ms: started.elapsed().as_millis() as u64,
            };
        }

        // Step 3: select & dispatch. All submissions happen before any await
        // (fan-out is concurrent) — `join_all` below starts every future.
        let analysis_depth = AnalysisDepth::Standard;
        let calls = selected.iter().map(|kind| {
            let adapter = Arc::clone(&self.adapter);
            let kind = *kind;
            let user_id = user_id.to_string();
            let enrichment = enrichment.clone();
            let message = message.to_string();
            async move {
                let outcome = adapter
                    .call(
                        kind,
                        request_id,
                        &user_id,
                        &message,
                        enrichment,
                        analysis_depth,
                        Priority::High,
                    )
                    .await;
                (kind, outcome)
            }
        });

        // Step 4: collect, order-independent.
        let remaining = request.time_remaining();
        let results = match tokio::time::timeout(remaining, futures::future::join_all(calls)).await {
            Ok(results) => results,
            Err(_) => selected.iter().map(|k| (*k, AdapterOutcome::Failed(FailureReason::Timeout))).collect(),
        };

        let mut successes = Vec::new();
        let mut sources = HashSet::new();
        let mut agents_failed = Vec::new();
        let mut token_usage = TokenUsage::default();

        for (kind, outcome) in results {
            match outcome {
                AdapterOutcome::Success(response) => {
                    sources.insert(kind);
                    if counts_toward_token_usage(response.domain_match) {
                        token_usage = token_usage + response.token_usage;
                    }
                    successes.push((kind, response));
                }
                AdapterOutcome::NoContribution(response) => {
                    if counts_toward_token_usage(response.domain_match) {
                        token_usage = token_usage + response.token_usage;
                    }
                    agents_failed.push((kind, FailureReason::DomainMismatch));
                }
                AdapterOutcome::Failed(reason) => {
                    agents_failed.push((kind, reason));
                }
            }
        }

        let degraded = successes.is_empty();
        if degraded {
            warn!(request_id = %request_id, user_id, "no specialist produced usable output, degrading");
        }

        // Step 5: synthesize.
        let text = self.synthesizer.synthesize(message, &successes, &enrichment);

        FinalResponse {
            text,
            intent: intent.tag.to_string(),
            sources,
            token_usage,
            agents_failed,
            degraded,
            request_id,
            processing_time_ms: started.elapsed().as_millis() as u64,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
