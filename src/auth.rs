//! Caller authentication for the request handler.
//!
//! Every POST carries a bearer token. In production the token is validated
//! against the identity provider that issued it; tests and standalone mode
//! use a shared static token instead.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::WorkerError;

/// Validates bearer tokens presented by callers.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Ok(()) for a valid token, `Unauthorized` otherwise.
    async fn verify(&self, token: &str) -> Result<(), WorkerError>;
}

/// Token validation against the hosted identity provider.
///
/// Asks the provider's user endpoint who the token belongs to; any
/// non-success answer means the caller is not authenticated. Provider
/// outages also surface as `Unauthorized` - the worker never lets traffic
/// through on a fault.
pub struct HttpAuthenticator {
    user_endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpAuthenticator {
    pub fn new(
        user_endpoint: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WorkerError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            user_endpoint: user_endpoint.into(),
            api_key: api_key.into(),
            client,
        })
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn verify(&self, token: &str) -> Result<(), WorkerError> {
        let response = self
            .client
            .get(&self.user_endpoint)
            .header("apikey", &self.api_key)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| {
                debug!(error = %e, "identity provider unreachable");
                WorkerError::Unauthorized
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            debug!(status = %response.status(), "identity provider rejected token");
            Err(WorkerError::Unauthorized)
        }
    }
}

/// Shared-secret token check for tests and standalone deployments.
pub struct StaticAuthenticator {
    token: String,
}

impl StaticAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn verify(&self, token: &str) -> Result<(), WorkerError> {
        if !self.token.is_empty() && token == self.token {
            Ok(())
        } else {
            Err(WorkerError::Unauthorized)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_authenticator() {
        let auth = StaticAuthenticator::new("secret");
        assert!(auth.verify("secret").await.is_ok());
        assert!(auth.verify("wrong").await.is_err());
        assert!(auth.verify("").await.is_err());
    }

    #[tokio::test]
    async fn test_static_authenticator_empty_secret_rejects_all() {
        let auth = StaticAuthenticator::new("");
        assert!(auth.verify("").await.is_err());
        assert!(auth.verify("anything").await.is_err());
    }
}
