//! Credential resolution.
//!
//! Backends never decide where credentials come from. They receive an
//! [`AccessTokenSource`], usually a [`CredentialChain`] that tries a list of
//! strategies in order and sticks with the first one that applies.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Something that can hand out bearer tokens for a cloud API.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String>;

    /// Drop any cached token after the API rejected it.
    async fn invalidate(&self) {}
}

/// One credential-resolution strategy.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` when the strategy does not apply to this environment.
    async fn resolve(&self) -> Result<Option<Arc<dyn AccessTokenSource>>>;
}

/// The token source picked by a chain, with the strategy that produced it.
#[derive(Clone)]
pub struct ResolvedCredentials {
    pub strategy: &'static str,
    pub source: Arc<dyn AccessTokenSource>,
}

/// Ordered list of credential strategies, resolved on first use.
///
/// A failed resolution is not cached, so the next caller tries again.
pub struct CredentialChain {
    providers: Vec<Box<dyn CredentialProvider>>,
    resolved: OnceCell<ResolvedCredentials>,
}

impl CredentialChain {
    pub fn new(providers: Vec<Box<dyn CredentialProvider>>) -> Self {
        Self {
            providers,
            resolved: OnceCell::new(),
        }
    }

    pub fn strategies(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Resolve (once) and return the winning strategy.
    pub async fn resolve(&self) -> Result<&ResolvedCredentials> {
        self.resolved.get_or_try_init(|| self.try_providers()).await
    }

    async fn try_providers(&self) -> Result<ResolvedCredentials> {
        for provider in &self.providers {
            match provider.resolve().await {
                Ok(Some(source)) => {
                    info!(strategy = provider.name(), "Resolved cloud credentials");
                    return Ok(ResolvedCredentials {
                        strategy: provider.name(),
                        source,
                    });
                }
                Ok(None) => {
                    debug!(strategy = provider.name(), "Credential strategy not applicable");
                }
                Err(e) => {
                    warn!(strategy = provider.name(), error = %e, "Credential strategy failed");
                }
            }
        }

        Err(Error::Auth(format!(
            "no usable credentials (tried: {})",
            self.strategies().join(", ")
        )))
    }
}

#[async_trait]
impl AccessTokenSource for CredentialChain {
    async fn access_token(&self) -> Result<String> {
        self.resolve().await?.source.access_token().await
    }

    async fn invalidate(&self) {
        if let Some(resolved) = self.resolved.get() {
            resolved.source.invalidate().await;
        }
    }
}

/// A fixed token, for emulators and tests.
pub struct StaticToken(pub String);

#[async_trait]
impl AccessTokenSource for StaticToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}
