//! `SpecialistRequest` — the envelope handed to each specialist's `process`
//! entry point.

use uuid::Uuid;

use super::{AnalysisDepth, PipelineSnapshot, TokenBudget};

#[derive(Debug, Clone)]
pub struct SpecialistRequest {
    pub request_id: Uuid,
    pub query_type: String,
    pub context: PipelineSnapshot,
    pub token_budget: TokenBudget,
    pub analysis_depth: AnalysisDepth,
    /// Opaque wire token minted by [`crate::credential::CredentialIssuer::mint`].
    pub credential: String,
}
