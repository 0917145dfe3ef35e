//! `UserContext` and the pipeline enrichment blob merged into every
//! [`super::DispatchRequest`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Input blob per query. Never stored by the core — constructed fresh for
/// each [`super::DispatchRequest`] and dropped at the end of the call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    pub channel_summary: PipelineSnapshot,
    pub metadata: serde_json::Value,
}

/// How fresh the enrichment data backing a [`PipelineSnapshot`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFreshness {
    RealTime,
    Degraded,
    Unavailable,
}

impl Default for DataFreshness {
    fn default() -> Self {
        DataFreshness::Unavailable
    }
}

/// How complete the enrichment context is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextQuality {
    Complete,
    BasicFallback,
    EmptyFallback,
}

impl Default for ContextQuality {
    fn default() -> Self {
        ContextQuality::EmptyFallback
    }
}

/// The enrichment blob consumed by the dispatcher. Always returned, shape
/// constant across freshness levels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,
    pub key_metrics: HashMap<String, f64>,
    pub performance_insights: Vec<String>,
    pub recent_alerts: Vec<PerformanceAlert>,
    pub data_freshness: DataFreshness,
    pub context_quality: ContextQuality,
}

impl PipelineSnapshot {
    /// The snapshot returned for a user id the pipeline has never seen
    ///.
    pub fn empty_fallback() -> Self {
        PipelineSnapshot {
            last_updated: None,
            key_metrics: HashMap::new(),
            performance_insights: Vec::new(),
            recent_alerts: Vec::new(),
            data_freshness: DataFreshness::Unavailable,
            context_quality: ContextQuality::EmptyFallback,
        }
    }
}

/// What kind of change triggered a [`PerformanceAlert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Spike,
    Drop,
    Milestone,
    Anomaly,
}

/// How significant a detected change is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Significance {
    Low,
    Medium,
    High,
}

/// Direction of a metric change, used as part of the alert dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceAlert {
    pub user_id: String,
    pub kind: AlertKind,
    pub metric: String,
    pub current: f64,
    pub previous: f64,
    pub change_pct: f64,
    pub significance: Significance,
    pub message: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl PerformanceAlert {
    pub fn direction(&self) -> Direction {
        if self.current >= self.previous {
            Direction::Up
        } else {
            Direction::Down
        }
    }
}
