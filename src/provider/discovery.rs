//! OIDC discovery and JWKS retrieval.
//!
//! Discovery documents and key sets are cached in-memory for the life of
//! the process. The verifier is short-lived, so this never goes stale
//! across SSH connections; the login refresh loop benefits from the cache
//! between iterations.
//!
//! An unknown `kid` triggers exactly one forced JWKS refresh before
//! failing, so a rotated provider key is picked up without letting a
//! garbage token cause unbounded re-fetching.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Error, Result};

/// The subset of the OIDC discovery document opkssh consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    /// Issuer URL as published by the provider.
    pub issuer: String,
    /// Authorization endpoint for the login flow.
    #[serde(default)]
    pub authorization_endpoint: Option<String>,
    /// Token endpoint for code exchange and refresh.
    #[serde(default)]
    pub token_endpoint: Option<String>,
    /// Where the provider publishes its signing keys.
    pub jwks_uri: String,
}

impl DiscoveryDocument {
    /// Fetch `<issuer>/.well-known/openid-configuration`.
    pub async fn fetch(http: &reqwest::Client, issuer: &str) -> Result<Self> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        debug!(url = %url, "Fetching OIDC discovery document");

        let response = http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::ProviderNet(format!("discovery fetch failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::ProviderNet(format!(
                "discovery returned HTTP {}",
                response.status()
            )));
        }
        let doc: Self = response
            .json()
            .await
            .map_err(|e| Error::ProviderNet(format!("bad discovery document: {e}")))?;

        if doc.issuer.trim_end_matches('/') != issuer.trim_end_matches('/') {
            warn!(
                expected = %issuer,
                published = %doc.issuer,
                "Discovery document issuer does not match configuration"
            );
        }
        Ok(doc)
    }
}

/// Cached JWKS entry.
struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
    ttl: Duration,
}

impl CachedJwks {
    fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() >= self.ttl
    }
}

/// JWKS cache — one entry per issuer.
pub struct JwksCache {
    inner: DashMap<String, CachedJwks>,
    ttl: Duration,
}

impl JwksCache {
    /// Create with a 1-hour TTL.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
            ttl: Duration::from_secs(3600),
        }
    }

    /// Return the cached JWKS for `issuer`, or fetch from `jwks_uri`.
    ///
    /// `force_refresh` bypasses the cache regardless of TTL.
    pub async fn get_or_fetch(
        &self,
        http: &reqwest::Client,
        issuer: &str,
        jwks_uri: &str,
        force_refresh: bool,
    ) -> Result<JwkSet> {
        if !force_refresh {
            if let Some(cached) = self.inner.get(issuer) {
                if !cached.is_stale() {
                    return Ok(cached.keys.clone());
                }
            }
        }

        debug!(issuer = %issuer, "Fetching JWKS from {jwks_uri}");
        let jwks: JwkSet = fetch_json(http, jwks_uri).await?;

        self.inner.insert(
            issuer.to_string(),
            CachedJwks {
                keys: jwks.clone(),
                fetched_at: Instant::now(),
                ttl: self.ttl,
            },
        );

        Ok(jwks)
    }

    /// Find the decoding key for `kid`, refreshing the cache once if the
    /// key is unknown.
    pub async fn decoding_key(
        &self,
        http: &reqwest::Client,
        issuer: &str,
        jwks_uri: &str,
        kid: &str,
    ) -> Result<DecodingKey> {
        let jwks = self.get_or_fetch(http, issuer, jwks_uri, false).await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }

        debug!(kid = %kid, "Key not in cached JWKS, refreshing");
        let jwks = self.get_or_fetch(http, issuer, jwks_uri, true).await?;
        find_key_in_jwks(&jwks, kid)
            .ok_or_else(|| Error::BadSignature(format!("no JWKS key with kid {kid:?}")))
    }
}

impl Default for JwksCache {
    fn default() -> Self {
        Self::new()
    }
}

async fn fetch_json<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
) -> Result<T> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| Error::ProviderNet(format!("fetch {url} failed: {e}")))?;
    if !response.status().is_success() {
        return Err(Error::ProviderNet(format!(
            "{url} returned HTTP {}",
            response.status()
        )));
    }
    response
        .json()
        .await
        .map_err(|e| Error::ProviderNet(format!("bad response from {url}: {e}")))
}

/// Find a JWK by `kid` and convert it to a [`DecodingKey`].
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    for jwk in &jwks.keys {
        if jwk.common.key_id.as_deref() != Some(kid) {
            continue;
        }
        return match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
            AlgorithmParameters::EllipticCurve(ec) => {
                DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
            }
            AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
        };
    }
    None
}

/// Build a [`Validation`] for an ID token header.
///
/// Expiration and audience are enforced by the PK Token pipeline (the
/// expiration policy is per-provider), so only the signature and algorithm
/// are delegated to `jsonwebtoken`. The RSA (PKCS#1 and PSS) and ECDSA
/// families providers actually sign with are accepted; anything else is
/// rejected here rather than misdiagnosed as a bad signature downstream.
pub fn signature_only_validation(header: &Header) -> Result<Validation> {
    let alg = match header.alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512
        | Algorithm::ES256
        | Algorithm::ES384 => header.alg,
        other => {
            return Err(Error::Malformed(format!(
                "unsupported ID token algorithm {other:?}"
            )))
        }
    };

    let mut v = Validation::new(alg);
    v.validate_exp = false;
    v.validate_aud = false;
    v.required_spec_claims = std::collections::HashSet::new();
    v.leeway = 0;
    Ok(v)
}
