//! OpenID providers — the authorities a PK Token leans on.
//!
//! Provider kinds (Google, Azure, GitLab, GitHub Actions, GCE metadata,
//! mock) share one capability set behind [`OpenIdProvider`]:
//!
//! | Capability | Required | Notes |
//! |------------|----------|-------|
//! | `issuer` / `audiences` / `expiration_policy` | yes | static config |
//! | `verify_id_token` | yes | signature check against provider keys |
//! | `request_tokens` | no | interactive kinds only |
//! | `refresh` | no | callers check [`supports_refresh`](OpenIdProvider::supports_refresh) |
//! | `extra_validation` | no | claim pinning (GitHub repos, GCE projects) |

pub mod callback;
pub mod discovery;
pub mod mock;
pub mod standard;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ExpirationPolicy, ProviderEntry, ProviderKind, ProviderRegistry};
use crate::pktoken::IdTokenClaims;
use crate::{Error, Result};

pub use mock::MockProvider;
pub use standard::StandardProvider;

/// Tokens handed back by a provider after login or refresh.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    /// The compact-serialized ID token.
    pub id_token: String,
    /// Refresh token, when the provider issues one.
    pub refresh_token: Option<String>,
}

/// Knobs for the interactive login flow.
#[derive(Debug, Clone)]
pub struct LoginOptions {
    /// Spawn the system browser at the authorization URL.
    pub open_browser: bool,
}

impl Default for LoginOptions {
    fn default() -> Self {
        Self { open_browser: true }
    }
}

/// Common capability set over all provider kinds.
#[async_trait]
pub trait OpenIdProvider: Send + Sync + std::fmt::Debug {
    /// The issuer URL this provider vouches for.
    fn issuer(&self) -> &str;

    /// Audiences acceptable in tokens from this provider.
    fn audiences(&self) -> &[String];

    /// The freshness rule configured for this provider.
    fn expiration_policy(&self) -> ExpirationPolicy;

    /// Drive the provider's login flow and return an ID token whose
    /// `nonce` claim is `nonce`.
    async fn request_tokens(&self, nonce: &str, options: &LoginOptions) -> Result<TokenGrant>;

    /// Verify a compact ID token's signature against the provider's keys
    /// and return its claims. Audience, nonce binding, and freshness are
    /// the caller's business.
    async fn verify_id_token(&self, compact: &str) -> Result<IdTokenClaims>;

    /// Whether [`refresh`](Self::refresh) is available.
    fn supports_refresh(&self) -> bool {
        false
    }

    /// Exchange a refresh token for a fresh ID token.
    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant> {
        Err(Error::RefreshUnsupported(self.issuer().to_string()))
    }

    /// Provider-specific claim checks applied after the token verifies.
    fn extra_validation(&self, _claims: &IdTokenClaims) -> Result<()> {
        Ok(())
    }
}

/// Instantiate a provider object for a registry entry.
pub fn from_entry(
    entry: &ProviderEntry,
    request_timeout: Duration,
) -> Result<Arc<dyn OpenIdProvider>> {
    match entry.kind {
        ProviderKind::Standard | ProviderKind::Github | ProviderKind::Gcp => Ok(Arc::new(
            StandardProvider::new(entry.clone(), request_timeout)?,
        )),
        ProviderKind::Mock => Ok(Arc::new(MockProvider::from_entry(entry)?)),
    }
}

/// Resolve the provider responsible for `issuer`, or fail the way the
/// verifier reports an unregistered issuer.
pub fn resolve_for_issuer(
    registry: &ProviderRegistry,
    issuer: &str,
    request_timeout: Duration,
) -> Result<Arc<dyn OpenIdProvider>> {
    let entry = registry
        .by_issuer(issuer)
        .ok_or_else(|| Error::ProviderUnknown(issuer.to_string()))?;
    from_entry(entry, request_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_issuer_resolution_fails() {
        let registry = ProviderRegistry::default();
        let err = resolve_for_issuer(&registry, "https://nobody.example", Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, Error::ProviderUnknown(_)));
    }

    #[test]
    fn mock_entries_build_mock_providers() {
        let mut entry =
            ProviderEntry::from_provider_string("https://mock.example,mock-cid,never_expire")
                .unwrap();
        entry.kind = ProviderKind::Mock;
        let provider = from_entry(&entry, Duration::from_secs(5)).unwrap();
        assert_eq!(provider.issuer(), "https://mock.example");
        assert_eq!(provider.audiences(), ["mock-cid"]);
    }
}
