//! The mock provider — an in-process OP for tests and local development.
//!
//! Mints ES256-signed ID tokens with its own throwaway P-256 key and
//! verifies them against that key, so the whole login/verify path can run
//! without a network. The key can be pinned to disk so a `login` in one
//! process can be verified in another.

use std::path::Path;

use p256::ecdsa::SigningKey;
use serde_json::json;
use ssh_key::rand_core::OsRng;

use super::{LoginOptions, OpenIdProvider, TokenGrant};
use crate::config::{ExpirationPolicy, ProviderEntry};
use crate::jose;
use crate::pktoken::{IdTokenClaims, JwsParts};
use crate::{Error, Result};

const MOCK_KID: &str = "mock-1";
const REFRESH_TOKEN: &str = "mock-refresh";

/// In-process OpenID provider.
pub struct MockProvider {
    issuer: String,
    audiences: Vec<String>,
    policy: ExpirationPolicy,
    email: Option<String>,
    subject: String,
    token_ttl: i64,
    key: SigningKey,
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProvider")
            .field("issuer", &self.issuer)
            .field("audiences", &self.audiences)
            .finish_non_exhaustive()
    }
}

impl MockProvider {
    /// Build from a registry entry with a fresh signing key.
    pub fn from_entry(entry: &ProviderEntry) -> Result<Self> {
        Ok(Self::new(
            &entry.issuer,
            &entry.client_id,
            entry.expiration_policy,
        ))
    }

    /// Build a mock provider with a fresh signing key.
    #[must_use]
    pub fn new(issuer: &str, client_id: &str, policy: ExpirationPolicy) -> Self {
        Self {
            issuer: issuer.to_string(),
            audiences: vec![client_id.to_string()],
            policy,
            email: None,
            subject: "mock-subject".to_string(),
            token_ttl: 3600,
            key: SigningKey::random(&mut OsRng),
        }
    }

    /// Set the email claim minted into tokens.
    #[must_use]
    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    /// Set the subject claim minted into tokens.
    #[must_use]
    pub fn with_subject(mut self, sub: &str) -> Self {
        self.subject = sub.to_string();
        self
    }

    /// Load (or create and persist) the signing key at `path`, so separate
    /// processes agree on the provider key.
    pub fn with_key_file(mut self, path: &Path) -> Result<Self> {
        if path.exists() {
            let text = std::fs::read_to_string(path)?;
            let bytes = jose::b64u_decode(text.trim())?;
            self.key = SigningKey::from_slice(&bytes)
                .map_err(|e| Error::Internal(format!("bad mock key file: {e}")))?;
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, jose::b64u(self.key.to_bytes()))?;
            let mut perms = std::fs::metadata(path)?.permissions();
            use std::os::unix::fs::PermissionsExt;
            perms.set_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }
        Ok(self)
    }

    /// Mint an ID token with explicit timestamps. Test hook for expiry
    /// scenarios.
    pub fn issue_id_token(&self, nonce: &str, iat: i64, exp: i64) -> Result<String> {
        let mut claims = json!({
            "iss": self.issuer,
            "sub": self.subject,
            "aud": self.audiences[0],
            "iat": iat,
            "exp": exp,
            "nonce": nonce,
        });
        if let Some(email) = &self.email {
            claims["email"] = json!(email);
        }

        let protected = jose::b64u(jose::canonical_json(&json!({
            "alg": "ES256",
            "kid": MOCK_KID,
            "typ": "JWT",
        }))?);
        let payload = jose::b64u(jose::canonical_json(&claims)?);
        let signature = jose::sign_es256(&self.key, &protected, &payload);
        Ok(format!("{protected}.{payload}.{signature}"))
    }
}

#[async_trait::async_trait]
impl OpenIdProvider for MockProvider {
    fn issuer(&self) -> &str {
        &self.issuer
    }

    fn audiences(&self) -> &[String] {
        &self.audiences
    }

    fn expiration_policy(&self) -> ExpirationPolicy {
        self.policy
    }

    async fn request_tokens(&self, nonce: &str, _options: &LoginOptions) -> Result<TokenGrant> {
        let now = jose::unix_now();
        Ok(TokenGrant {
            id_token: self.issue_id_token(nonce, now, now + self.token_ttl)?,
            refresh_token: Some(REFRESH_TOKEN.to_string()),
        })
    }

    async fn verify_id_token(&self, compact: &str) -> Result<IdTokenClaims> {
        let jws = JwsParts::from_compact(compact)?;

        let header: serde_json::Value = serde_json::from_slice(&jose::b64u_decode(&jws.protected)?)
            .map_err(|e| Error::Malformed(format!("bad ID token header: {e}")))?;
        if header.get("alg").and_then(serde_json::Value::as_str) != Some("ES256") {
            return Err(Error::BadSignature("mock provider only signs ES256".into()));
        }

        jose::verify_es256(
            self.key.verifying_key(),
            &jws.protected,
            &jws.payload,
            &jws.signature,
        )?;
        jws.claims()
    }

    fn supports_refresh(&self) -> bool {
        true
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        if refresh_token != REFRESH_TOKEN {
            return Err(Error::BadSignature("unknown refresh token".into()));
        }
        let now = jose::unix_now();
        Ok(TokenGrant {
            // Refreshed tokens carry no nonce; the binding lives in the
            // original ID token.
            id_token: self.issue_id_token("", now, now + self.token_ttl)?,
            refresh_token: Some(REFRESH_TOKEN.to_string()),
        })
    }
}
