//! PK Token verification.
//!
//! Deterministic given the token, the resolved provider, and a clock:
//!
//! 1. Provider signature over the ID token (JWKS or in-process key).
//! 2. `iss` must equal the provider's configured issuer.
//! 3. `aud` must be one of the provider's allowed audiences.
//! 4. The `nonce` must equal the CIC commitment (hash binding).
//! 5. The CIC signature must verify under the `upk` it carries.
//! 6. The provider's expiration policy must hold.
//! 7. Provider-specific claim checks (extended validation).
//!
//! A deny is never recovered into an allow; the first failing step wins.

use crate::jose;
use crate::provider::OpenIdProvider;
use crate::config::ExpirationPolicy;
use crate::{Error, Result};

use super::{IdTokenClaims, PkToken};

/// Verify a PK Token against its resolved provider at time `now`.
///
/// Returns the verified ID token claims on success.
pub async fn verify_pk_token(
    pkt: &PkToken,
    provider: &dyn OpenIdProvider,
    now: i64,
) -> Result<IdTokenClaims> {
    let claims = provider.verify_id_token(&pkt.op.compact()).await?;

    if claims.iss != provider.issuer() {
        return Err(Error::IssuerMismatch {
            expected: provider.issuer().to_string(),
            actual: claims.iss,
        });
    }

    if !claims.audience_matches(provider.audiences()) {
        return Err(Error::AudienceMismatch(claims.audience_display()));
    }

    let cic = pkt.cic()?;
    if cic.alg != "ES256" {
        return Err(Error::Malformed(format!(
            "unsupported CIC algorithm {:?}",
            cic.alg
        )));
    }

    let commitment = cic.commitment()?;
    if claims.nonce.as_deref() != Some(commitment.as_str()) {
        return Err(Error::NonceBinding);
    }

    let upk = jose::verifying_key_from_jwk(&cic.upk)?;
    jose::verify_es256(&upk, &pkt.cic_protected, &pkt.op.payload, &pkt.cic_signature)?;

    enforce_freshness(pkt, provider, &claims, now).await?;
    provider.extra_validation(&claims)?;

    Ok(claims)
}

/// Apply the provider's expiration policy.
async fn enforce_freshness(
    pkt: &PkToken,
    provider: &dyn OpenIdProvider,
    claims: &IdTokenClaims,
    now: i64,
) -> Result<()> {
    match provider.expiration_policy() {
        ExpirationPolicy::Oidc => {
            if now >= claims.exp {
                return Err(Error::TokenExpired(format!(
                    "ID token expired at {}",
                    claims.exp
                )));
            }
        }
        ExpirationPolicy::OidcRefreshed => {
            let refresh = pkt.refresh.as_ref().ok_or_else(|| {
                Error::TokenExpired("policy requires a refresh signature, none present".into())
            })?;
            let refreshed = provider.verify_id_token(&refresh.compact()).await?;
            if refreshed.iss != claims.iss || refreshed.sub != claims.sub {
                return Err(Error::BadSignature(
                    "refreshed ID token speaks for a different identity".into(),
                ));
            }
            if !refreshed.audience_matches(provider.audiences()) {
                return Err(Error::AudienceMismatch(refreshed.audience_display()));
            }
            if now >= refreshed.exp {
                return Err(Error::TokenExpired(format!(
                    "refreshed ID token expired at {}",
                    refreshed.exp
                )));
            }
        }
        ExpirationPolicy::MaxAge(window) => {
            let age = now.saturating_sub(claims.iat);
            let limit = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);
            if age >= limit {
                return Err(Error::TokenExpired(format!(
                    "ID token is {age}s old, limit {limit}s"
                )));
            }
        }
        ExpirationPolicy::NeverExpire => {}
    }
    Ok(())
}
