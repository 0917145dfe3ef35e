//! Shared data structures crossing component boundaries.
//!
//! Every dict-shaped envelope in the source system is promoted here to a
//! typed record with explicit optional fields.

mod context;
mod intent;
mod response;
mod specialist;

pub use context::*;
pub use intent::*;
pub use response::*;
pub use specialist::*;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Relative scheduling priority, shared between dispatch requests and the
/// task engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
    Critical,
}

impl Priority {
    /// All levels, lowest to highest — used to size the task engine's queues.
    pub const ALL: [Priority; 5] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Urgent,
        Priority::Critical,
    ];

    pub fn index(self) -> usize {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
            Priority::Critical => 4,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// The depth of analysis a specialist should perform, driving both its
/// token budget and its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisDepth {
    Quick,
    Standard,
    Deep,
}

impl AnalysisDepth {
    pub fn token_budget(self) -> TokenBudget {
        match self {
            AnalysisDepth::Quick => TokenBudget { input: 2000, output: 1000 },
            AnalysisDepth::Standard => TokenBudget { input: 3500, output: 1750 },
            AnalysisDepth::Deep => TokenBudget { input: 5000, output: 2500 },
        }
    }

    pub fn deadline(self) -> std::time::Duration {
        match self {
            AnalysisDepth::Quick => std::time::Duration::from_secs(10),
            AnalysisDepth::Standard => std::time::Duration::from_secs(30),
            AnalysisDepth::Deep => std::time::Duration::from_secs(90),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBudget {
    pub input: u32,
    pub output: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u32,
    pub output: u32,
}

impl std::ops::Add for TokenUsage {
    type Output = TokenUsage;
    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage { input: self.input + rhs.input, output: self.output + rhs.output }
    }
}

impl std::iter::Sum for TokenUsage {
    fn sum<I: Iterator<Item = TokenUsage>>(iter: I) -> Self {
        iter.fold(TokenUsage::default(), |a, b| a + b)
    }
}

/// The enumerated specialist domains, plus the two dispatcher-only tags
/// `General` and `Comprehensive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialistKind {
    ContentAnalysis,
    AudienceInsights,
    SeoDiscoverability,
    CompetitiveAnalysis,
    Monetization,
}

impl SpecialistKind {
    pub const ALL: [SpecialistKind; 5] = [
        SpecialistKind::ContentAnalysis,
        SpecialistKind::AudienceInsights,
        SpecialistKind::SeoDiscoverability,
        SpecialistKind::CompetitiveAnalysis,
        SpecialistKind::Monetization,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SpecialistKind::ContentAnalysis => "content_analysis",
            SpecialistKind::AudienceInsights => "audience_insights",
            SpecialistKind::SeoDiscoverability => "seo_discoverability",
            SpecialistKind::CompetitiveAnalysis => "competitive_analysis",
            SpecialistKind::Monetization => "monetization",
        }
    }
}

impl std::fmt::Display for SpecialistKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reason a specialist's contribution didn't make it into the final answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    DomainMismatch,
    Timeout,
    BreakerOpen,
    ProtocolViolation,
    Error(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::DomainMismatch => write!(f, "domain_mismatch"),
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::BreakerOpen => write!(f, "breaker_open"),
            FailureReason::ProtocolViolation => write!(f, "protocol_violation"),
            FailureReason::Error(msg) => write!(f, "error: {msg}"),
        }
    }
}

/// The top-level operation request.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub request_id: Uuid,
    pub user_id: String,
    pub message: String,
    pub context: UserContext,
    pub priority: Priority,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub deadline: chrono::DateTime<chrono::Utc>,
}

impl DispatchRequest {
    pub fn new(
        user_id: impl Into<String>,
        message: impl Into<String>,
        context: UserContext,
        default_deadline: std::time::Duration,
    ) -> Self {
        let created_at = chrono::Utc::now();
        DispatchRequest {
            request_id: Uuid::new_v4(),
            user_id: user_id.into(),
            message: message.into(),
            context,
            priority: Priority::Normal,
            created_at,
            deadline: created_at
                + chrono::Duration::from_std(default_deadline).unwrap_or(chrono::Duration::seconds(60)),
        }
    }

    pub fn time_remaining(&self) -> std::time::Duration {
        let delta = self.deadline - chrono::Utc::now();
        delta.to_std().unwrap_or(std::time::Duration::ZERO)
    }
}

/// The final user-facing answer produced by the dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct FinalResponse {
    pub text: String,
    pub intent: String,
    pub sources: HashSet<SpecialistKind>,
    pub token_usage: TokenUsage,
    pub agents_failed: Vec<(SpecialistKind, FailureReason)>,
    pub degraded: bool,
    pub request_id: Uuid,
    pub processing_time_ms: u64,
}
