//! Seam to the external authentication collaborator.
//!
//! The engine never interprets token internals; any verification failure is
//! surfaced as Unauthorized and nothing else.

use futures::future::BoxFuture;
use thiserror::Error;

/// Verified identity extracted from a session token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthClaims {
    /// Stable user identifier; survives reconnects.
    pub identity: String,
    /// Trusted display name carried by the token.
    pub nickname: String,
}

/// Failure to verify a session token.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The token is missing, malformed, or not signed by the auth subsystem.
    #[error("invalid session token")]
    InvalidToken,
}

/// Verifies session tokens issued by the external auth subsystem.
pub trait AuthVerifier: Send + Sync {
    /// Verify `token` and extract the claims it carries.
    fn verify(&self, token: &str) -> BoxFuture<'static, Result<AuthClaims, AuthError>>;
}

/// Development verifier accepting `identity:nickname` tokens.
///
/// Deployments wire a real verifier against the auth subsystem here; the
/// engine only ever sees the [`AuthVerifier`] trait.
pub struct DevTokenVerifier;

impl AuthVerifier for DevTokenVerifier {
    fn verify(&self, token: &str) -> BoxFuture<'static, Result<AuthClaims, AuthError>> {
        let token = token.to_owned();
        Box::pin(async move {
            let (identity, nickname) = token.split_once(':').ok_or(AuthError::InvalidToken)?;
            if identity.is_empty() || nickname.is_empty() {
                return Err(AuthError::InvalidToken);
            }
            Ok(AuthClaims {
                identity: identity.to_string(),
                nickname: nickname.to_string(),
            })
        })
    }
}
