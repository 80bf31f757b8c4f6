//! The config-driven provider: discovery, JWKS verification, and the
//! authorization-code (PKCE) login flow on a loopback redirect.
//!
//! Covers every spec-compliant issuer (Google, Azure, GitLab, Zitadel) as
//! well as the non-interactive token sources (GitHub Actions, GCE instance
//! identity), which reuse the verification side and reject login/refresh.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use jsonwebtoken::TokenData;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::callback;
use super::discovery::{self, DiscoveryDocument, JwksCache};
use super::{LoginOptions, OpenIdProvider, TokenGrant};
use crate::config::{ExpirationPolicy, ProviderEntry, ProviderKind};
use crate::pktoken::IdTokenClaims;
use crate::{Error, Result};

/// How long the login flow waits for the browser redirect.
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

/// Discovery + JWKS + authorization-code provider.
pub struct StandardProvider {
    entry: ProviderEntry,
    audiences: Vec<String>,
    http: reqwest::Client,
    discovery: OnceCell<DiscoveryDocument>,
    jwks: JwksCache,
}

impl std::fmt::Debug for StandardProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandardProvider")
            .field("issuer", &self.entry.issuer)
            .field("audiences", &self.audiences)
            .finish_non_exhaustive()
    }
}

impl StandardProvider {
    /// Build a provider for a registry entry.
    pub fn new(entry: ProviderEntry, request_timeout: Duration) -> Result<Self> {
        if !entry.issuer.starts_with("https://") {
            warn!(issuer = %entry.issuer, "OIDC issuer is not HTTPS");
        }
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client build failed: {e}")))?;
        let audiences = entry.audiences();
        Ok(Self {
            entry,
            audiences,
            http,
            discovery: OnceCell::new(),
            jwks: JwksCache::new(),
        })
    }

    async fn discovery(&self) -> Result<&DiscoveryDocument> {
        self.discovery
            .get_or_try_init(|| DiscoveryDocument::fetch(&self.http, &self.entry.issuer))
            .await
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenGrant> {
        let doc = self.discovery().await?;
        let endpoint = doc
            .token_endpoint
            .clone()
            .ok_or_else(|| Error::ProviderNet("provider publishes no token endpoint".into()))?;

        let response = self
            .http
            .post(&endpoint)
            .form(form)
            .send()
            .await
            .map_err(|e| Error::ProviderNet(format!("token endpoint request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::ProviderNet(format!(
                "token endpoint returned HTTP {}",
                response.status()
            )));
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::ProviderNet(format!("bad token endpoint response: {e}")))?;
        let id_token = tokens
            .id_token
            .ok_or_else(|| Error::ProviderNet("token endpoint returned no id_token".into()))?;
        Ok(TokenGrant {
            id_token,
            refresh_token: tokens.refresh_token,
        })
    }
}

#[async_trait::async_trait]
impl OpenIdProvider for StandardProvider {
    fn issuer(&self) -> &str {
        &self.entry.issuer
    }

    fn audiences(&self) -> &[String] {
        &self.audiences
    }

    fn expiration_policy(&self) -> ExpirationPolicy {
        self.entry.expiration_policy
    }

    async fn request_tokens(&self, nonce: &str, options: &LoginOptions) -> Result<TokenGrant> {
        if self.entry.kind != ProviderKind::Standard {
            return Err(Error::Internal(format!(
                "provider {} does not support interactive login",
                self.entry.issuer
            )));
        }

        let doc = self.discovery().await?;
        let auth_endpoint = doc.authorization_endpoint.clone().ok_or_else(|| {
            Error::ProviderNet("provider publishes no authorization endpoint".into())
        })?;

        let pkce = Pkce::generate();
        let state = random_segment(16);
        let server = callback::start(state.clone(), &self.entry.redirect_uris).await?;
        let redirect_uri = server.redirect_uri.clone();

        let mut auth_url = url::Url::parse(&auth_endpoint)
            .map_err(|e| Error::ProviderNet(format!("bad authorization endpoint: {e}")))?;
        auth_url
            .query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.entry.client_id)
            .append_pair("redirect_uri", &redirect_uri)
            .append_pair("scope", &self.entry.scopes.join(" "))
            .append_pair("state", &state)
            .append_pair("nonce", nonce)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256");

        info!(issuer = %self.entry.issuer, "Open this URL to authenticate:\n\n  {auth_url}\n");
        if options.open_browser {
            open_browser(auth_url.as_str());
        }

        let result = tokio::time::timeout(CALLBACK_TIMEOUT, server.wait())
            .await
            .map_err(|_| Error::ProviderNet("timed out waiting for the browser redirect".into()))??;

        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", result.code.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("client_id", self.entry.client_id.as_str()),
            ("code_verifier", pkce.verifier.as_str()),
        ];
        if let Some(secret) = &self.entry.client_secret {
            form.push(("client_secret", secret.as_str()));
        }
        self.token_request(&form).await
    }

    async fn verify_id_token(&self, compact: &str) -> Result<IdTokenClaims> {
        let header = jsonwebtoken::decode_header(compact)?;
        let kid = header
            .kid
            .clone()
            .ok_or_else(|| Error::BadSignature("ID token header has no kid".into()))?;

        let doc = self.discovery().await?;
        let key = self
            .jwks
            .decoding_key(&self.http, &self.entry.issuer, &doc.jwks_uri, &kid)
            .await?;

        let validation = discovery::signature_only_validation(&header)?;
        let data: TokenData<IdTokenClaims> = jsonwebtoken::decode(compact, &key, &validation)
            .map_err(|e| Error::BadSignature(format!("ID token signature rejected: {e}")))?;
        Ok(data.claims)
    }

    fn supports_refresh(&self) -> bool {
        self.entry.kind == ProviderKind::Standard
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        if !self.supports_refresh() {
            return Err(Error::RefreshUnsupported(self.entry.issuer.clone()));
        }
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.entry.client_id.as_str()),
        ];
        if let Some(secret) = &self.entry.client_secret {
            form.push(("client_secret", secret.as_str()));
        }
        let mut grant = self.token_request(&form).await?;
        // Providers that do not rotate refresh tokens return none; keep the
        // old one so the loop can refresh again.
        if grant.refresh_token.is_none() {
            grant.refresh_token = Some(refresh_token.to_string());
        }
        Ok(grant)
    }

    fn extra_validation(&self, claims: &IdTokenClaims) -> Result<()> {
        for (claim, expected) in &self.entry.required_claims {
            let actual = claim_as_string(claims, claim);
            if actual.as_deref() != Some(expected.as_str()) {
                return Err(Error::BadSignature(format!(
                    "claim {claim:?} is {actual:?}, required {expected:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// PKCE verifier/challenge pair.
struct Pkce {
    verifier: String,
    challenge: String,
}

impl Pkce {
    fn generate() -> Self {
        let verifier = random_segment(48);
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
        }
    }
}

fn random_segment(len: usize) -> String {
    use rand::RngExt;
    let mut bytes = vec![0u8; len];
    rand::rng().fill(bytes.as_mut_slice());
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Best-effort browser launch; the URL is always printed as a fallback.
fn open_browser(url: &str) {
    #[cfg(target_os = "macos")]
    let opener = "open";
    #[cfg(not(target_os = "macos"))]
    let opener = "xdg-open";

    if let Err(e) = std::process::Command::new(opener)
        .arg(url)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
    {
        debug!(error = %e, "Could not launch a browser");
    }
}

fn claim_as_string(claims: &IdTokenClaims, name: &str) -> Option<String> {
    match name {
        "iss" => Some(claims.iss.clone()),
        "sub" => Some(claims.sub.clone()),
        "email" => claims.email.clone(),
        other => claims.extra.get(other).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            v => v.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(kind: ProviderKind, required: &[(&str, &str)]) -> StandardProvider {
        let mut entry =
            ProviderEntry::from_provider_string("https://op.example,cid,oidc").unwrap();
        entry.kind = kind;
        entry.required_claims = required
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        StandardProvider::new(entry, Duration::from_secs(5)).unwrap()
    }

    fn claims(extra: &[(&str, serde_json::Value)]) -> IdTokenClaims {
        IdTokenClaims {
            iss: "https://op.example".to_string(),
            sub: "u1".to_string(),
            aud: serde_json::json!("cid"),
            exp: 2_000_000_000,
            iat: 0,
            nonce: None,
            email: Some("alice@example.com".to_string()),
            groups: None,
            extra: extra
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn pkce_challenge_commits_to_verifier() {
        let pkce = Pkce::generate();
        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(pkce.verifier.as_bytes()));
        assert_eq!(pkce.challenge, expected);
    }

    #[test]
    fn required_claims_pass_when_present() {
        let p = provider(
            ProviderKind::Github,
            &[("repository", "openpubkey/opkssh")],
        );
        let c = claims(&[("repository", serde_json::json!("openpubkey/opkssh"))]);
        p.extra_validation(&c).unwrap();
    }

    #[test]
    fn required_claims_fail_on_mismatch_or_absence() {
        let p = provider(ProviderKind::Github, &[("repository", "openpubkey/opkssh")]);
        let wrong = claims(&[("repository", serde_json::json!("evil/repo"))]);
        assert!(p.extra_validation(&wrong).is_err());
        let absent = claims(&[]);
        assert!(p.extra_validation(&absent).is_err());
    }

    #[test]
    fn non_interactive_kinds_refuse_refresh() {
        let p = provider(ProviderKind::Gcp, &[]);
        assert!(!p.supports_refresh());
    }
}
