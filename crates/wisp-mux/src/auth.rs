//! Credential verification boundary for the auth extension.

use async_trait::async_trait;

/// Verifies the username/password pair carried by the auth sub-protocol.
///
/// The session only moves bytes; where credentials live is up to the
/// implementation.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn verify(&self, username: &str, password: &str) -> bool;
}
