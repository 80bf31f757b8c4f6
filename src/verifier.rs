//! The `AuthorizedKeysCommand` core.
//!
//! sshd invokes `opkssh verify <user> <b64cert> <type>` once per offered
//! key. On success exactly one line goes to stdout:
//!
//! ```text
//! cert-authority ecdsa-sha2-nistp256 <base64 ephemeral public key>
//! ```
//!
//! which makes the self-issued certificate acceptable to the daemon. On
//! any failure the process exits nonzero with an empty stdout; the reason
//! goes to the log file only. A deny is never recovered into an allow.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::cert;
use crate::config::ProviderRegistry;
use crate::jose;
use crate::pktoken::{self, Identity};
use crate::policy::PolicyEngine;
use crate::provider::{self, OpenIdProvider};
use crate::{Error, Result};

/// Picks the provider object for a token issuer.
pub type ProviderResolver = Box<dyn Fn(&str) -> Result<Arc<dyn OpenIdProvider>> + Send + Sync>;

/// One verification pass, wired with its provider source and policy.
pub struct Verifier {
    resolver: ProviderResolver,
    policy: PolicyEngine,
    budget: Duration,
}

impl Verifier {
    /// Verifier over a provider registry (the production wiring).
    #[must_use]
    pub fn new(
        registry: ProviderRegistry,
        policy: PolicyEngine,
        request_timeout: Duration,
        budget: Duration,
    ) -> Self {
        let resolver: ProviderResolver = Box::new(move |issuer: &str| {
            provider::resolve_for_issuer(&registry, issuer, request_timeout)
        });
        Self {
            resolver,
            policy,
            budget,
        }
    }

    /// Verifier with an explicit provider resolver. Test seam.
    #[must_use]
    pub fn with_resolver(resolver: ProviderResolver, policy: PolicyEngine, budget: Duration) -> Self {
        Self {
            resolver,
            policy,
            budget,
        }
    }

    /// Run the full check and return the authority line.
    ///
    /// The whole pass is bounded by the configured budget; a hung provider
    /// denies rather than stalling sshd.
    pub async fn authorized_keys(
        &self,
        principal: &str,
        cert_b64: &str,
        algorithm: &str,
    ) -> Result<String> {
        let outcome = tokio::time::timeout(
            self.budget,
            self.evaluate(principal, cert_b64, algorithm),
        )
        .await
        .unwrap_or_else(|_| {
            Err(Error::ProviderNet(format!(
                "verification exceeded its {}s budget",
                self.budget.as_secs()
            )))
        });

        match &outcome {
            Ok(_) => {}
            Err(e) => {
                warn!(
                    event = "verify.denied",
                    principal = %principal,
                    error = %e,
                    "Denied SSH certificate"
                );
            }
        }
        outcome
    }

    async fn evaluate(&self, principal: &str, cert_b64: &str, algorithm: &str) -> Result<String> {
        let (certificate, pkt) = cert::parse_offered(algorithm, cert_b64)?;
        let now = jose::unix_now();

        cert::verify_self_signed(&certificate, now)?;

        // Unverified claims are only used to pick the provider; every claim
        // that matters is re-checked by the verification pipeline.
        let issuer = pkt.claims()?.iss;
        let provider = (self.resolver)(&issuer)?;

        let claims = pktoken::verify::verify_pk_token(&pkt, provider.as_ref(), now).await?;
        cert::verify_key_binding(&certificate, &pkt.cic()?.upk)?;

        let identity = Identity::from(&claims);
        self.policy.authorize(principal, &identity)?;

        info!(
            event = "verify.allowed",
            principal = %principal,
            issuer = %identity.issuer,
            sub = %identity.sub,
            email = identity.email.as_deref().unwrap_or(""),
            "Authorized SSH certificate"
        );
        cert::authority_line(&certificate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExpirationPolicy;
    use crate::keys::EphemeralKey;
    use crate::pktoken::{Cic, JwsParts, PkToken};
    use crate::policy::rooted_home_resolver;
    use crate::provider::MockProvider;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    const ISSUER: &str = "http://oidc.local:9998/";
    const EMAIL: &str = "test-user@zitadel.ch";

    struct Sandbox {
        dir: tempfile::TempDir,
        provider: Arc<MockProvider>,
    }

    impl Sandbox {
        fn new(policy: ExpirationPolicy) -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                provider: Arc::new(
                    MockProvider::new(ISSUER, "mock-cid", policy).with_email(EMAIL),
                ),
            }
        }

        fn write_policy(&self, text: &str, mode: u32) {
            let path = self.dir.path().join("auth_id");
            fs::write(&path, text).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        }

        fn verifier(&self) -> Verifier {
            let engine = PolicyEngine::with_paths(
                self.dir.path().join("auth_id"),
                crate::access::current_user(0o640),
                rooted_home_resolver(&self.dir.path().join("homes")),
            );
            let provider = Arc::clone(&self.provider);
            let resolver: ProviderResolver = Box::new(move |issuer: &str| {
                if issuer == ISSUER {
                    Ok(Arc::clone(&provider) as Arc<dyn OpenIdProvider>)
                } else {
                    Err(Error::ProviderUnknown(issuer.to_string()))
                }
            });
            Verifier::with_resolver(resolver, engine, Duration::from_secs(25))
        }

        /// Mint a certificate the way `opkssh login` does.
        fn login(&self, iat: i64, exp: i64) -> String {
            let key = EphemeralKey::generate().unwrap();
            let cic = Cic::new(key.public_jwk().unwrap());
            let nonce = cic.commitment().unwrap();
            let id_token = self.provider.issue_id_token(&nonce, iat, exp).unwrap();
            let op = JwsParts::from_compact(&id_token).unwrap();
            let cic_protected = cic.protected_segment().unwrap();
            let cic_signature =
                jose::sign_es256(key.signing_key(), &cic_protected, &op.payload);
            let pkt = PkToken {
                op,
                cic_protected,
                cic_signature,
                refresh: None,
            };
            let certificate = cert::issue(&pkt, &key, &[]).unwrap();
            let openssh = certificate.to_openssh().unwrap();
            openssh.split_whitespace().nth(1).unwrap().to_string()
        }
    }

    #[tokio::test]
    async fn happy_path_emits_one_authority_line() {
        let sandbox = Sandbox::new(ExpirationPolicy::NeverExpire);
        sandbox.write_policy("test test-user@zitadel.ch http://oidc.local:9998/\n", 0o600);
        let blob = sandbox.login(0, 1);

        let line = sandbox
            .verifier()
            .authorized_keys("test", &blob, cert::CERT_ALGORITHM)
            .await
            .unwrap();
        assert!(line.starts_with("cert-authority ecdsa-sha2-nistp256 "));
        assert_eq!(line.lines().count(), 1);
    }

    #[tokio::test]
    async fn wrong_principal_is_denied() {
        let sandbox = Sandbox::new(ExpirationPolicy::NeverExpire);
        sandbox.write_policy("test test-user@zitadel.ch http://oidc.local:9998/\n", 0o600);
        let blob = sandbox.login(0, 1);

        let err = sandbox
            .verifier()
            .authorized_keys("test2", &blob, cert::CERT_ALGORITHM)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PolicyDeny { .. }));
    }

    #[tokio::test]
    async fn expired_token_is_denied_under_oidc_policy() {
        let sandbox = Sandbox::new(ExpirationPolicy::Oidc);
        sandbox.write_policy("test test-user@zitadel.ch http://oidc.local:9998/\n", 0o600);
        let now = jose::unix_now();
        let blob = sandbox.login(now - 3600, now - 1);

        let err = sandbox
            .verifier()
            .authorized_keys("test", &blob, cert::CERT_ALGORITHM)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenExpired(_)));
    }

    #[tokio::test]
    async fn foreign_provider_key_is_denied() {
        let sandbox = Sandbox::new(ExpirationPolicy::NeverExpire);
        sandbox.write_policy("test test-user@zitadel.ch http://oidc.local:9998/\n", 0o600);

        // Same issuer string, but signed by a different mock instance; the
        // resolver's provider key does not verify the token.
        let foreign = Sandbox::new(ExpirationPolicy::NeverExpire);
        let blob = foreign.login(0, 1);

        let err = sandbox
            .verifier()
            .authorized_keys("test", &blob, cert::CERT_ALGORITHM)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadSignature(_)));
    }

    #[tokio::test]
    async fn unknown_issuer_is_denied() {
        let sandbox = Sandbox::new(ExpirationPolicy::NeverExpire);
        let engine = PolicyEngine::with_paths(
            sandbox.dir.path().join("auth_id"),
            crate::access::current_user(0o640),
            rooted_home_resolver(&sandbox.dir.path().join("homes")),
        );
        let resolver: ProviderResolver =
            Box::new(|issuer: &str| Err(Error::ProviderUnknown(issuer.to_string())));
        let verifier = Verifier::with_resolver(resolver, engine, Duration::from_secs(25));

        let blob = sandbox.login(0, 1);
        let err = verifier
            .authorized_keys("test", &blob, cert::CERT_ALGORITHM)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderUnknown(_)));
    }

    #[tokio::test]
    async fn bad_policy_file_mode_is_denied_regardless_of_contents() {
        let sandbox = Sandbox::new(ExpirationPolicy::NeverExpire);
        sandbox.write_policy("test test-user@zitadel.ch http://oidc.local:9998/\n", 0o644);
        let blob = sandbox.login(0, 1);

        let err = sandbox
            .verifier()
            .authorized_keys("test", &blob, cert::CERT_ALGORITHM)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FileAccess { .. }));
    }

    #[tokio::test]
    async fn tampered_op_signature_is_denied() {
        let sandbox = Sandbox::new(ExpirationPolicy::NeverExpire);
        sandbox.write_policy("test test-user@zitadel.ch http://oidc.local:9998/\n", 0o600);
        let blob = sandbox.login(0, 1);

        // Bit-flip inside the embedded PK Token's op signature.
        let openssh = format!("{} {blob}", cert::CERT_ALGORITHM);
        let certificate = ssh_key::Certificate::from_openssh(&openssh).unwrap();
        let wire = certificate.extensions().get(cert::PKT_EXTENSION).unwrap();
        let mut pkt = PkToken::from_wire(wire).unwrap();
        let mut sig = jose::b64u_decode(&pkt.op.signature).unwrap();
        sig[0] ^= 1;
        pkt.op.signature = jose::b64u(sig);

        // Rebind into a fresh self-issued certificate (the extension is
        // covered by the cert signature, so tampering means re-issuing).
        let key = EphemeralKey::generate().unwrap();
        let tampered_cert = cert::issue(&pkt, &key, &[]).unwrap();
        let tampered_openssh = tampered_cert.to_openssh().unwrap();
        let tampered_blob = tampered_openssh.split_whitespace().nth(1).unwrap();

        let err = sandbox
            .verifier()
            .authorized_keys("test", tampered_blob, cert::CERT_ALGORITHM)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadSignature(_)));
    }

    #[tokio::test]
    async fn wrong_certificate_type_is_denied() {
        let sandbox = Sandbox::new(ExpirationPolicy::NeverExpire);
        let err = sandbox
            .verifier()
            .authorized_keys("test", "AAAA", "ssh-rsa-cert-v01@openssh.com")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CertType(_)));
    }
}
