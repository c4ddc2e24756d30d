//! Connection authentication.
//!
//! The `connect` frame may carry a token; an [`Authenticator`] turns it into
//! the session's identity.

use std::collections::HashMap;
use tenvis_courier_core::Identity;
use thiserror::Error;

use crate::config::AuthConfig;

/// Authentication failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No token and anonymous access is disabled.
    #[error("authentication required")]
    Missing,

    /// The token is not recognised.
    #[error("invalid token")]
    Invalid,
}

/// Resolves connection tokens to identities.
pub trait Authenticator: Send + Sync + 'static {
    /// Authenticate the token presented in `connect`.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] when the connection must be refused.
    fn authenticate(&self, token: Option<&str>) -> Result<Identity, AuthError>;
}

/// Token authenticator backed by the server configuration.
///
/// With an empty token table every token is accepted as the user id it
/// names.
#[derive(Debug, Clone, Default)]
pub struct TokenAuthenticator {
    allow_anonymous: bool,
    tokens: HashMap<String, String>,
}

impl TokenAuthenticator {
    /// Build from configuration.
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            allow_anonymous: config.allow_anonymous,
            tokens: config.tokens.clone(),
        }
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        match token.filter(|t| !t.is_empty()) {
            None if self.allow_anonymous => Ok(Identity::Anonymous),
            None => Err(AuthError::Missing),
            Some(token) if self.tokens.is_empty() => Ok(Identity::user(token)),
            Some(token) => self
                .tokens
                .get(token)
                .map(|user| Identity::user(user.as_str()))
                .ok_or(AuthError::Invalid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_user() {
        let auth = TokenAuthenticator::default();
        assert_eq!(auth.authenticate(Some("alice")), Ok(Identity::user("alice")));
        assert_eq!(auth.authenticate(None), Err(AuthError::Missing));
        assert_eq!(auth.authenticate(Some("")), Err(AuthError::Missing));
    }

    #[test]
    fn test_token_table() {
        let auth = TokenAuthenticator::new(&AuthConfig {
            allow_anonymous: true,
            tokens: HashMap::from([("s3cret".to_string(), "bob".to_string())]),
        });
        assert_eq!(auth.authenticate(Some("s3cret")), Ok(Identity::user("bob")));
        assert_eq!(auth.authenticate(Some("guess")), Err(AuthError::Invalid));
        assert_eq!(auth.authenticate(None), Ok(Identity::Anonymous));
    }
}
