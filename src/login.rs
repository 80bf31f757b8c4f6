//! The login pipeline.
//!
//! 1. Generate an ephemeral key and client instance claims.
//! 2. Drive the provider to mint an ID token committed to those claims.
//! 3. Assemble the PK Token and bind it into a self-issued certificate.
//! 4. Write the key pair to disk, never clobbering a foreign key.
//! 5. Optionally keep the certificate fresh with a refresh loop.
//!
//! The refresh loop is one cooperative task: it sleeps until a minute
//! before expiry (or backs off after a transient failure), wakes to
//! refresh, and exits promptly on SIGINT/SIGTERM. Token rejections and
//! unknown-provider errors are fatal; network hiccups retry with capped
//! exponential backoff.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::cert;
use crate::jose;
use crate::keys::{self, EphemeralKey};
use crate::pktoken::{Cic, JwsParts, PkToken};
use crate::provider::{LoginOptions, OpenIdProvider};
use crate::{Error, Result};

/// Refresh this long before the token expires.
const REFRESH_LEAD: Duration = Duration::from_secs(60);

/// Transient-failure backoff bounds.
const BACKOFF_INITIAL: Duration = Duration::from_secs(5);
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// What a login should do besides the defaults.
#[derive(Debug, Clone, Default)]
pub struct LoginRequest {
    /// Where the private key lands; `None` selects a `~/.ssh` slot.
    pub output_key: Option<PathBuf>,
    /// Print the raw ID token after login (debugging aid).
    pub print_id_token: bool,
    /// Keep refreshing until interrupted.
    pub auto_refresh: bool,
    /// Do not spawn a browser; print the URL only.
    pub disable_browser_open: bool,
}

/// Mint a PK Token: CIC → nonce → provider → assembled token.
///
/// Returns the token and the provider's refresh token, if any.
pub async fn mint_pk_token(
    provider: &dyn OpenIdProvider,
    key: &EphemeralKey,
    options: &LoginOptions,
) -> Result<(PkToken, Option<String>)> {
    let cic = Cic::new(key.public_jwk()?);
    let nonce = cic.commitment()?;

    let grant = provider.request_tokens(&nonce, options).await?;
    let op = JwsParts::from_compact(&grant.id_token)?;

    let cic_protected = cic.protected_segment()?;
    let cic_signature = jose::sign_es256(key.signing_key(), &cic_protected, &op.payload);
    let pkt = PkToken {
        op,
        cic_protected,
        cic_signature,
        refresh: None,
    };

    // The provider must have committed to our claims; catch a broken or
    // hostile OP before anything lands on disk.
    let claims = pkt.claims()?;
    if claims.nonce.as_deref() != Some(nonce.as_str()) {
        return Err(Error::NonceBinding);
    }

    Ok((pkt, grant.refresh_token))
}

/// Run a login end to end.
pub async fn run(provider: &dyn OpenIdProvider, request: &LoginRequest, home: &Path) -> Result<()> {
    let key = EphemeralKey::generate()?;
    let options = LoginOptions {
        open_browser: !request.disable_browser_open,
    };

    let (pkt, refresh_token) = mint_pk_token(provider, &key, &options).await?;
    if request.print_id_token {
        println!("{}", pkt.op.compact());
    }

    let certificate = cert::issue(&pkt, &key, &[])?;
    let key_path = keys::select_output_path(request.output_key.as_deref(), home)?;
    keys::write_keypair(&key_path, &key, &certificate)?;

    info!(
        event = "login.issued",
        identity = %pkt.identity_string()?,
        key = %key_path.display(),
        "Login complete"
    );

    if request.auto_refresh {
        refresh_loop(provider, &key, pkt, refresh_token, &key_path).await?;
    }
    Ok(())
}

/// Keep the on-disk certificate fresh until cancelled.
async fn refresh_loop(
    provider: &dyn OpenIdProvider,
    key: &EphemeralKey,
    mut pkt: PkToken,
    mut refresh_token: Option<String>,
    key_path: &Path,
) -> Result<()> {
    if !provider.supports_refresh() {
        return Err(Error::RefreshUnsupported(provider.issuer().to_string()));
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut backoff = BACKOFF_INITIAL;

    loop {
        let wait = time_until_refresh(&pkt)?;
        info!(seconds = wait.as_secs(), "Next refresh scheduled");
        if !sleep_or_cancel(wait, &mut sigterm).await {
            info!("Refresh loop cancelled");
            return Ok(());
        }

        let token = refresh_token
            .clone()
            .ok_or_else(|| Error::RefreshUnsupported(provider.issuer().to_string()))?;
        match provider.refresh(&token).await {
            Ok(grant) => {
                pkt.refresh = Some(JwsParts::from_compact(&grant.id_token)?);
                refresh_token = grant.refresh_token.or(refresh_token);

                let certificate = cert::issue(&pkt, key, &[])?;
                keys::write_keypair(key_path, key, &certificate)?;
                backoff = BACKOFF_INITIAL;
                info!(event = "login.refreshed", key = %key_path.display(), "Certificate refreshed");
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, retry_in = backoff.as_secs(), "Refresh failed, will retry");
                if !sleep_or_cancel(backoff, &mut sigterm).await {
                    return Ok(());
                }
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Seconds until one minute before the governing expiry.
fn time_until_refresh(pkt: &PkToken) -> Result<Duration> {
    let exp = match &pkt.refresh {
        Some(refresh) => refresh.claims::<crate::pktoken::IdTokenClaims>()?.exp,
        None => pkt.claims()?.exp,
    };
    let now = jose::unix_now();
    let lead = i64::try_from(REFRESH_LEAD.as_secs()).unwrap_or(60);
    let secs = exp.saturating_sub(now).saturating_sub(lead).max(0);
    Ok(Duration::from_secs(u64::try_from(secs).unwrap_or(0)))
}

/// Sleep, returning `false` when interrupted by SIGINT/SIGTERM.
async fn sleep_or_cancel(
    duration: Duration,
    sigterm: &mut tokio::signal::unix::Signal,
) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        _ = tokio::signal::ctrl_c() => false,
        _ = sigterm.recv() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExpirationPolicy;
    use crate::pktoken::verify::verify_pk_token;
    use crate::provider::MockProvider;

    fn provider() -> MockProvider {
        MockProvider::new("https://mock.example", "mock-cid", ExpirationPolicy::NeverExpire)
            .with_email("alice@example.com")
    }

    #[tokio::test]
    async fn minted_token_passes_verification() {
        let provider = provider();
        let key = EphemeralKey::generate().unwrap();

        let (pkt, refresh_token) = mint_pk_token(&provider, &key, &LoginOptions::default())
            .await
            .unwrap();
        assert!(refresh_token.is_some());

        let claims = verify_pk_token(&pkt, &provider, jose::unix_now())
            .await
            .unwrap();
        assert_eq!(claims.email.as_deref(), Some("alice@example.com"));
    }

    #[tokio::test]
    async fn login_writes_key_and_marked_certificate() {
        let provider = provider();
        let home = tempfile::tempdir().unwrap();
        let request = LoginRequest {
            disable_browser_open: true,
            ..LoginRequest::default()
        };

        run(&provider, &request, home.path()).await.unwrap();

        let key_path = home.path().join(".ssh").join("id_ecdsa");
        let cert_path = home.path().join(".ssh").join("id_ecdsa.pub");
        assert!(key_path.exists());
        let cert_line = std::fs::read_to_string(&cert_path).unwrap();
        assert!(cert_line.starts_with(cert::CERT_ALGORITHM));
        assert!(cert_line.contains(keys::KEY_MARKER));

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&key_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn second_login_reuses_the_marked_slot() {
        let provider = provider();
        let home = tempfile::tempdir().unwrap();
        let request = LoginRequest {
            disable_browser_open: true,
            ..LoginRequest::default()
        };

        run(&provider, &request, home.path()).await.unwrap();
        let first = std::fs::read(home.path().join(".ssh/id_ecdsa")).unwrap();
        run(&provider, &request, home.path()).await.unwrap();
        let second = std::fs::read(home.path().join(".ssh/id_ecdsa")).unwrap();
        assert_ne!(first, second);
        assert!(!home.path().join(".ssh/id_ed25519").exists());
    }

    #[test]
    fn refresh_timing_counts_down_to_the_lead() {
        let now = jose::unix_now();
        let pkt = {
            let provider = provider();
            let key = EphemeralKey::generate().unwrap();
            let cic = Cic::new(key.public_jwk().unwrap());
            let nonce = cic.commitment().unwrap();
            let id_token = provider.issue_id_token(&nonce, now, now + 600).unwrap();
            let op = JwsParts::from_compact(&id_token).unwrap();
            let cic_protected = cic.protected_segment().unwrap();
            let cic_signature =
                jose::sign_es256(key.signing_key(), &cic_protected, &op.payload);
            PkToken {
                op,
                cic_protected,
                cic_signature,
                refresh: None,
            }
        };

        let wait = time_until_refresh(&pkt).unwrap();
        assert!(wait <= Duration::from_secs(540));
        assert!(wait >= Duration::from_secs(500));
    }
}
