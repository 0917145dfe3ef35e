//! `SpecialistResponse` — the uniform envelope every specialist returns.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{SpecialistKind, TokenUsage};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Analysis {
    pub summary: String,
    pub key_insights: Vec<String>,
    pub recommendations: Vec<String>,
    pub metrics: serde_json::Value,
    pub detailed_analysis: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheInfo {
    pub hit: bool,
    pub ttl_remaining: Option<std::time::Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialistResponse {
    pub agent_type: SpecialistKind,
    pub request_id: Uuid,
    /// `false` means "not my domain, do not consume my body as analysis".
    pub domain_match: bool,
    pub confidence: f64,
    pub analysis: Analysis,
    pub token_usage: TokenUsage,
    pub cache_info: CacheInfo,
    pub processing_time_ms: u64,
    /// Invariant: must be `true`, or the dispatcher rejects the response
    /// outright.
    pub for_dispatcher_only: bool,
}

impl SpecialistResponse {
    /// Whether this response passes the protocol envelope checks,
    /// independent of `domain_match` (which is a content signal, not a
    /// protocol violation).
    pub fn is_protocol_valid(&self, expected_request_id: Uuid) -> bool {
        self.for_dispatcher_only && self.request_id == expected_request_id
    }
}
