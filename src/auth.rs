//! Bearer-token authentication.
//!
//! The server trusts an [`AuthProvider`] to turn a bearer token into an
//! authenticated user. The bundled [`StaticTokenProvider`] maps fixed
//! tokens to users from the config file; deployments fronted by an
//! identity-aware proxy can implement the trait against their own verifier.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Unauthorized")]
    Unauthorized,
}

pub type Result<T> = std::result::Result<T, AuthError>;

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub id: Uuid,
    pub email: String,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Resolve a bearer token to a user, or `Unauthorized`.
    async fn authenticate(&self, token: &str) -> Result<AuthenticatedUser>;
}

/// A configured token-to-user entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenEntry {
    pub token: String,
    pub user_id: Uuid,
    pub email: String,
}

/// Token table loaded from configuration.
pub struct StaticTokenProvider {
    users: HashMap<String, AuthenticatedUser>,
}

impl StaticTokenProvider {
    pub fn new(entries: Vec<TokenEntry>) -> Self {
        let users = entries
            .into_iter()
            .map(|e| {
                (
                    e.token,
                    AuthenticatedUser {
                        id: e.user_id,
                        email: e.email,
                    },
                )
            })
            .collect();
        Self { users }
    }
}

#[async_trait]
impl AuthProvider for StaticTokenProvider {
    async fn authenticate(&self, token: &str) -> Result<AuthenticatedUser> {
        self.users.get(token).cloned().ok_or(AuthError::Unauthorized)
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    header_value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
