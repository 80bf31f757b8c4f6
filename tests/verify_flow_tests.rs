//! End-to-end flow tests
//!
//! Exercises the full path a real deployment takes, split across two
//! provider instances sharing a pinned key (standing in for the separate
//! login and verify processes):
//! - login: ephemeral key → PK Token → self-issued certificate → disk
//! - verify: certificate blob → provider → policy → authority line

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use opkssh::access;
use opkssh::cert;
use opkssh::config::ExpirationPolicy;
use opkssh::jose;
use opkssh::keys::{self, EphemeralKey};
use opkssh::login::{self, LoginRequest};
use opkssh::pktoken::verify::verify_pk_token;
use opkssh::pktoken::{JwsParts, PkToken};
use opkssh::policy::{rooted_home_resolver, PolicyEngine};
use opkssh::provider::{LoginOptions, MockProvider, OpenIdProvider};
use opkssh::verifier::{ProviderResolver, Verifier};
use opkssh::Error;

const ISSUER: &str = "http://oidc.local:9998/";
const EMAIL: &str = "test-user@zitadel.ch";

fn mock_with_key(key_file: &Path, policy: ExpirationPolicy) -> MockProvider {
    MockProvider::new(ISSUER, "mock-cid", policy)
        .with_email(EMAIL)
        .with_key_file(key_file)
        .unwrap()
}

fn write_policy(dir: &Path, text: &str, mode: u32) {
    let path = dir.join("auth_id");
    fs::write(&path, text).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
}

fn verifier_for(dir: &Path, provider: Arc<MockProvider>) -> Verifier {
    let engine = PolicyEngine::with_paths(
        dir.join("auth_id"),
        access::current_user(0o640),
        rooted_home_resolver(&dir.join("homes")),
    );
    let resolver: ProviderResolver = Box::new(move |issuer: &str| {
        if issuer == ISSUER {
            Ok(Arc::clone(&provider) as Arc<dyn OpenIdProvider>)
        } else {
            Err(Error::ProviderUnknown(issuer.to_string()))
        }
    });
    Verifier::with_resolver(resolver, engine, Duration::from_secs(25))
}

/// Read back the certificate blob a login wrote to `<home>/.ssh`.
fn offered_blob(home: &Path) -> String {
    let line = fs::read_to_string(home.join(".ssh").join("id_ecdsa.pub")).unwrap();
    let mut fields = line.split_whitespace();
    assert_eq!(fields.next(), Some(cert::CERT_ALGORITHM));
    fields.next().unwrap().to_string()
}

#[tokio::test]
async fn login_then_verify_yields_the_authority_line() {
    let state = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    let key_file = state.path().join("mock-op.key");

    // Login process.
    let op = mock_with_key(&key_file, ExpirationPolicy::NeverExpire);
    let request = LoginRequest {
        disable_browser_open: true,
        ..LoginRequest::default()
    };
    login::run(&op, &request, home.path()).await.unwrap();

    // Verify process: a fresh provider instance, same pinned key.
    write_policy(
        state.path(),
        "test test-user@zitadel.ch http://oidc.local:9998/\n",
        0o600,
    );
    let verify_op = Arc::new(mock_with_key(&key_file, ExpirationPolicy::NeverExpire));
    let verifier = verifier_for(state.path(), verify_op);

    let blob = offered_blob(home.path());
    let line = verifier
        .authorized_keys("test", &blob, cert::CERT_ALGORITHM)
        .await
        .unwrap();

    assert!(line.starts_with("cert-authority ecdsa-sha2-nistp256 "));
    assert_eq!(line.lines().count(), 1);

    // The trusted key is exactly the certificate's own (ephemeral) key.
    let parsed = ssh_key::Certificate::from_openssh(&format!("{} {blob}", cert::CERT_ALGORITHM))
        .unwrap();
    let expected = cert::authority_line(&parsed).unwrap();
    assert_eq!(line, expected);
}

#[tokio::test]
async fn wrong_principal_is_denied_with_no_output_line() {
    let state = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    let key_file = state.path().join("mock-op.key");

    let op = mock_with_key(&key_file, ExpirationPolicy::NeverExpire);
    let request = LoginRequest {
        disable_browser_open: true,
        ..LoginRequest::default()
    };
    login::run(&op, &request, home.path()).await.unwrap();

    write_policy(
        state.path(),
        "test test-user@zitadel.ch http://oidc.local:9998/\n",
        0o600,
    );
    let verify_op = Arc::new(mock_with_key(&key_file, ExpirationPolicy::NeverExpire));
    let verifier = verifier_for(state.path(), verify_op);

    let blob = offered_blob(home.path());
    let err = verifier
        .authorized_keys("test2", &blob, cert::CERT_ALGORITHM)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PolicyDeny { .. }));
}

#[tokio::test]
async fn refreshed_token_satisfies_the_refreshed_policy() {
    let state = tempfile::tempdir().unwrap();
    let key_file = state.path().join("mock-op.key");
    let op = mock_with_key(&key_file, ExpirationPolicy::OidcRefreshed);

    let key = EphemeralKey::generate().unwrap();
    let (mut pkt, refresh_token) =
        login::mint_pk_token(&op, &key, &LoginOptions::default())
            .await
            .unwrap();

    // Without a refresh member the policy rejects even a live token.
    let err = verify_pk_token(&pkt, &op, jose::unix_now()).await.unwrap_err();
    assert!(matches!(err, Error::TokenExpired(_)));

    let grant = op.refresh(&refresh_token.unwrap()).await.unwrap();
    pkt.refresh = Some(JwsParts::from_compact(&grant.id_token).unwrap());
    verify_pk_token(&pkt, &op, jose::unix_now()).await.unwrap();
}

#[tokio::test]
async fn every_single_byte_tamper_is_rejected() {
    let state = tempfile::tempdir().unwrap();
    let key_file = state.path().join("mock-op.key");
    let op = mock_with_key(&key_file, ExpirationPolicy::NeverExpire);

    let key = EphemeralKey::generate().unwrap();
    let (pkt, _) = login::mint_pk_token(&op, &key, &LoginOptions::default())
        .await
        .unwrap();
    verify_pk_token(&pkt, &op, jose::unix_now()).await.unwrap();

    let tamper_segment = |segment: &str| {
        let mut bytes = jose::b64u_decode(segment).unwrap();
        bytes[0] ^= 1;
        jose::b64u(bytes)
    };

    let mut tampered: Vec<PkToken> = Vec::new();
    let mut t = pkt.clone();
    t.op.signature = tamper_segment(&t.op.signature.clone());
    tampered.push(t);
    let mut t = pkt.clone();
    t.cic_signature = tamper_segment(&t.cic_signature.clone());
    tampered.push(t);
    let mut t = pkt.clone();
    t.op.payload = tamper_segment(&t.op.payload.clone());
    tampered.push(t);
    let mut t = pkt.clone();
    t.cic_protected = tamper_segment(&t.cic_protected.clone());
    tampered.push(t);

    for (i, pkt) in tampered.iter().enumerate() {
        let err = verify_pk_token(pkt, &op, jose::unix_now()).await.unwrap_err();
        assert!(
            matches!(
                err,
                Error::BadSignature(_) | Error::NonceBinding | Error::Malformed(_)
            ),
            "tamper case {i} produced {err:?}"
        );
    }
}

#[tokio::test]
async fn certificate_survives_disk_round_trip_byte_for_byte() {
    let state = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    let key_file = state.path().join("mock-op.key");

    let op = mock_with_key(&key_file, ExpirationPolicy::NeverExpire);
    let key = EphemeralKey::generate().unwrap();
    let (pkt, _) = login::mint_pk_token(&op, &key, &LoginOptions::default())
        .await
        .unwrap();
    let certificate = cert::issue(&pkt, &key, &[]).unwrap();

    let key_path = home.path().join(".ssh").join("id_ecdsa");
    keys::write_keypair(&key_path, &key, &certificate).unwrap();

    let blob = offered_blob(home.path());
    let (_, restored) = cert::parse_offered(cert::CERT_ALGORITHM, &blob).unwrap();
    assert_eq!(restored, pkt);
    assert_eq!(restored.to_wire().unwrap(), pkt.to_wire().unwrap());
}

#[tokio::test]
async fn group_rows_authorize_via_the_groups_claim() {
    // A provider that mints a groups claim, and a policy that keys on it.
    let state = tempfile::tempdir().unwrap();
    write_policy(
        state.path(),
        "ops anyone http://oidc.local:9998/ group=sre\n",
        0o600,
    );

    let engine = PolicyEngine::with_paths(
        state.path().join("auth_id"),
        access::current_user(0o640),
        rooted_home_resolver(&state.path().join("homes")),
    );

    let member = opkssh::pktoken::Identity {
        issuer: ISSUER.to_string(),
        sub: "sub-1".to_string(),
        email: Some("who@ever.example".to_string()),
        groups: vec!["dev".to_string(), "sre".to_string()],
    };
    engine.authorize("ops", &member).unwrap();

    let outsider = opkssh::pktoken::Identity {
        groups: vec!["dev".to_string()],
        ..member
    };
    assert!(engine.authorize("ops", &outsider).is_err());
}
