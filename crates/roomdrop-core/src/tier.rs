//! Account tiers
//!
//! Account storage lives outside roomdrop. The relay and the peers only see
//! it through [`TierResolver`], which maps a client credential to a tier.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Account tier of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// No account
    #[default]
    Anonymous,
    /// Logged-in account
    Authenticated,
    /// Paid account
    Premium,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Anonymous => "anonymous",
            Tier::Authenticated => "authenticated",
            Tier::Premium => "premium",
        };
        f.write_str(name)
    }
}

/// Resolves the tier of a client from its credential
#[async_trait]
pub trait TierResolver: Send + Sync {
    /// `token` is whatever credential the client presented, if any
    async fn resolve(&self, token: Option<&str>) -> Tier;
}

#[async_trait]
impl<T: TierResolver + ?Sized> TierResolver for Arc<T> {
    async fn resolve(&self, token: Option<&str>) -> Tier {
        (**self).resolve(token).await
    }
}

/// Fixed token table, used by tests and single-node deployments
#[derive(Debug, Clone, Default)]
pub struct StaticTierResolver {
    tokens: HashMap<String, Tier>,
}

impl StaticTierResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token
    pub fn with_token(mut self, token: impl Into<String>, tier: Tier) -> Self {
        self.tokens.insert(token.into(), tier);
        self
    }
}

#[async_trait]
impl TierResolver for StaticTierResolver {
    async fn resolve(&self, token: Option<&str>) -> Tier {
        token
            .and_then(|t| self.tokens.get(t).copied())
            .unwrap_or(Tier::Anonymous)
    }
}
