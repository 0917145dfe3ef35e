//! Error taxonomy (C1) — a closed set of failure kinds shared by every
//! component in the core. Every public operation either returns a value or
//! fails with exactly one [`ErrorKind`]; cache failures are the one
//! exception and must never reach this type (they downgrade to "not
//! cached" silently inside [`crate::cache`]).

use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

/// Failure category, used for metrics bucketing and client-facing grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Auth,
    Validation,
    RateLimit,
    External,
    Storage,
    Agent,
    Cache,
    System,
    Domain,
}

/// How severe a failure is, independent of whether it's retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// The closed set of failure kinds the core can report.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ErrorKind {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("authorization denied: {0}")]
    Authorization(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limit exceeded, retry after {retry_after_s}s")]
    RateLimit { retry_after_s: u64 },

    #[error("external API error: {0}")]
    ExternalAPI(String),

    #[error("storage error: {0}")]
    Database(String),

    #[error("specialist {specialist} timed out after {deadline_ms}ms")]
    SpecialistTimeout { specialist: String, deadline_ms: u64 },

    #[error("specialist {0} unavailable")]
    SpecialistUnavailable(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("business logic error: {0}")]
    BusinessLogic(String),

    #[error("internal system error: {0}")]
    System(String),
}

impl ErrorKind {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorKind::Authentication(_) | ErrorKind::Authorization(_) => ErrorCategory::Auth,
            ErrorKind::Validation(_) => ErrorCategory::Validation,
            ErrorKind::RateLimit { .. } => ErrorCategory::RateLimit,
            ErrorKind::ExternalAPI(_) => ErrorCategory::External,
            ErrorKind::Database(_) => ErrorCategory::Storage,
            ErrorKind::SpecialistTimeout { .. } | ErrorKind::SpecialistUnavailable(_) => {
                ErrorCategory::Agent
            }
            ErrorKind::Cache(_) => ErrorCategory::Cache,
            ErrorKind::Configuration(_) | ErrorKind::System(_) => ErrorCategory::System,
            ErrorKind::BusinessLogic(_) => ErrorCategory::Domain,
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorKind::Authentication(_) | ErrorKind::Authorization(_) => Severity::High,
            ErrorKind::Validation(_) => Severity::Low,
            ErrorKind::RateLimit { .. } => Severity::Low,
            ErrorKind::ExternalAPI(_) => Severity::Medium,
            ErrorKind::Database(_) => Severity::High,
            ErrorKind::SpecialistTimeout { .. } => Severity::Medium,
            ErrorKind::SpecialistUnavailable(_) => Severity::Medium,
            ErrorKind::Cache(_) => Severity::Low,
            ErrorKind::Configuration(_) => Severity::Critical,
            ErrorKind::BusinessLogic(_) => Severity::Medium,
            ErrorKind::System(_) => Severity::High,
        }
    }

    /// Whether a caller may retry, and if so after how long.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ErrorKind::RateLimit { retry_after_s } => Some(Duration::from_secs(*retry_after_s)),
            ErrorKind::Database(_) => Some(Duration::from_millis(200)),
            ErrorKind::SpecialistUnavailable(_) => Some(Duration::from_secs(1)),
            ErrorKind::ExternalAPI(_) => Some(Duration::from_millis(500)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retry_after().is_some()
    }
}

/// The error value carried across every component boundary in the core.
#[derive(Debug, Clone, Serialize)]
pub struct CoreError {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub user_message: String,
    #[serde(skip)]
    pub internal_message: String,
    pub details: serde_json::Value,
    pub retry_after: Option<Duration>,
    pub error_id: Uuid,
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (error_id={})", self.user_message, self.error_id)
    }
}

impl std::error::Error for CoreError {}

impl From<ErrorKind> for CoreError {
    fn from(kind: ErrorKind) -> Self {
        let category = kind.category();
        let severity = kind.default_severity();
        let retry_after = kind.retry_after();
        let internal_message = kind.to_string();
        let user_message = user_facing_message(&kind);

        CoreError {
            category,
            severity,
            user_message,
            internal_message,
            details: serde_json::Value::Null,
            retry_after,
            error_id: Uuid::new_v4(),
        }
    }
}

impl CoreError {
    /// Attach structured detail without leaking internal_message to the user.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Never let internal detail leak into `user_message`.
fn user_facing_message(kind: &ErrorKind) -> String {
    match kind {
        ErrorKind::Authentication(_) | ErrorKind::Authorization(_) => {
            "We couldn't verify this request.".to_string()
        }
        ErrorKind::Validation(_) => "That request wasn't valid.".to_string(),
        ErrorKind::RateLimit { retry_after_s } => {
            format!("Please slow down and retry in {retry_after_s}s.")
        }
        ErrorKind::ExternalAPI(_) | ErrorKind::SpecialistTimeout { .. } | ErrorKind::SpecialistUnavailable(_) => {
            "Some sources were unavailable.".to_string()
        }
        ErrorKind::Database(_) | ErrorKind::System(_) => {
            "Something went wrong on our end.".to_string()
        }
        ErrorKind::Cache(_) => "Temporary slowdown, no action needed.".to_string(),
        ErrorKind::Configuration(_) => "The service is misconfigured.".to_string(),
        ErrorKind::BusinessLogic(_) => "We couldn't complete that request.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_carry_retry_after() {
        let err: CoreError = ErrorKind::RateLimit { retry_after_s: 5 }.into();
        assert_eq!(err.retry_after, Some(Duration::from_secs(5)));
        assert_eq!(err.category, ErrorCategory::RateLimit);
    }

    #[test]
    fn user_message_never_contains_internal_detail() {
        let kind = ErrorKind::Database("connection refused at 10.0.0.5:5432".to_string());
        let err: CoreError = kind.into();
        assert!(!err.user_message.contains("10.0.0.5"));
    }

    #[test]
    fn non_retryable_kinds_have_no_retry_after() {
        let err: CoreError = ErrorKind::Validation("bad field".into()).into();
        assert!(err.retry_after.is_none());
        assert!(!err.category.eq(&ErrorCategory::Auth));
    }
}
