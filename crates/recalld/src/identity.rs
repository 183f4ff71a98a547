//! Resolving API credentials to owners.

use async_trait::async_trait;

use crate::store::FaceStore;

/// The authenticated caller. All faces are scoped to `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub id: String,
    pub display_name: String,
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// `None` when the token does not belong to a known user.
    async fn verify(&self, token: &str) -> Option<Owner>;
}

#[async_trait]
impl IdentityVerifier for FaceStore {
    async fn verify(&self, token: &str) -> Option<Owner> {
        match self.user_for_token(token).await {
            Ok(user) => user.map(|u| Owner {
                id: u.owner_id,
                display_name: u.display_name,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "token lookup failed");
                None
            }
        }
    }
}

/// Extract the token from an `Authorization` header value.
///
/// Accepts `Bearer <token>` or the bare token. Blank values yield `None`.
pub fn parse_credential(header: &str) -> Option<&str> {
    let token = header.strip_prefix("Bearer ").unwrap_or(header).trim();
    (!token.is_empty()).then_some(token)
}
