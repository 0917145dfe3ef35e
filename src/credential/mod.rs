//! Delegation credential (C4) — short-lived capability tokens binding every
//! specialist call to the dispatcher's request.
//!
//! Wire format: a signed JWT (HS256) via `jsonwebtoken`. A long-lived
//! stored-secret/bcrypt scheme is the wrong shape for minting a new,
//! request-scoped, short-lived token per call, so this reaches for
//! `jsonwebtoken` instead (see DESIGN.md).

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, ErrorKind};

const ISSUER: &str = "dispatcher";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub request_id: Uuid,
    pub iat: i64,
    pub exp: i64,
    pub permissions: Vec<String>,
}

/// The subject and permission set recovered from a verified credential.
#[derive(Debug, Clone)]
pub struct VerifiedCredential {
    pub subject: String,
    pub permissions: Vec<String>,
}

/// Mints and verifies delegation credentials under a single secret known
/// only to the dispatcher process.
pub struct CredentialIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: std::time::Duration,
}

impl CredentialIssuer {
    /// Fails closed with `ErrorKind::Configuration` if the secret is empty —
    /// never falls back to an auto-generated ephemeral secret, which would
    /// silently break cross-process verification.
    pub fn new(secret: &str, ttl: std::time::Duration) -> Result<Self, CoreError> {
        if secret.is_empty() {
            return Err(ErrorKind::Configuration("credential signing secret is empty".into()).into());
        }
        Ok(CredentialIssuer {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        })
    }

    /// `expires_at = now + ttl` (capped to 1h by [`crate::config::Config::validate`]).
    pub fn mint(&self, request_id: Uuid, subject: &str) -> Result<String, CoreError> {
        let now = Utc::now();
        let exp = now + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::hours(1));

        let claims = Claims {
            iss: ISSUER.to_string(),
            sub: subject.to_string(),
            request_id,
            iat: now.timestamp(),
            exp: exp.timestamp(),
            permissions: vec!["delegate".to_string()],
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| ErrorKind::Configuration(format!("failed to mint credential: {e}")).into())
    }

    /// Rejects an expired, mis-issued, mismatched-request, or
    /// under-permissioned credential, in that order.
    pub fn verify(&self, token: &str, expected_request_id: Uuid) -> Result<VerifiedCredential, CoreError> {
        // jsonwebtoken validates the signature and `exp` as part of `decode`.
        let mut validation = Validation::default();
        validation.set_issuer(&[ISSUER]);
        validation.validate_exp = true;

        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| ErrorKind::Authentication(format!("credential rejected: {e}")))?;

        let claims = data.claims;

        if claims.iss != ISSUER {
            return Err(ErrorKind::Authentication("issuer mismatch".into()).into());
        }
        if claims.request_id != expected_request_id {
            return Err(ErrorKind::Authentication("request_id mismatch".into()).into());
        }
        if !claims.permissions.iter().any(|p| p == "delegate") {
            return Err(ErrorKind::Authentication("missing required permission".into()).into());
        }

        Ok(VerifiedCredential { subject: claims.sub, permissions: claims.permissions })
    }

    pub fn expires_at(&self, issued_at: DateTime<Utc>) -> DateTime<Utc> {
        issued_at + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::hours(1))
    }
}
