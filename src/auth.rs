//! Credential verification at the daemon boundary.
//!
//! The engines never see credentials, only the stable user id a verifier
//! resolves them to.

use crate::store::StoreError;
use std::collections::HashMap;

/// Resolves a bearer credential to a stable user id.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, credential: &str) -> Result<String, StoreError>;
}

/// Strip an optional `Bearer ` scheme prefix.
fn bearer_token(credential: &str) -> &str {
    let trimmed = credential.trim();
    match trimmed.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        None if trimmed.eq_ignore_ascii_case("bearer") => "",
        _ => trimmed,
    }
}

/// Accepts only tokens from a fixed table.
#[derive(Debug, Clone, Default)]
pub struct TokenVerifier {
    tokens: HashMap<String, String>,
}

impl TokenVerifier {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl IdentityVerifier for TokenVerifier {
    fn verify(&self, credential: &str) -> Result<String, StoreError> {
        self.tokens
            .get(bearer_token(credential))
            .cloned()
            .ok_or(StoreError::Unauthenticated)
    }
}

/// Treats the credential itself as the user id. Local development only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustedVerifier;

impl IdentityVerifier for TrustedVerifier {
    fn verify(&self, credential: &str) -> Result<String, StoreError> {
        let token = bearer_token(credential);
        if token.is_empty() || token.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(StoreError::Unauthenticated);
        }
        Ok(token.to_string())
    }
}
