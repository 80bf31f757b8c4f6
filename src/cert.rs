//! SSH certificate binder — PK Tokens in and out of OpenSSH certificates.
//!
//! The certificate is *self-issued*: the ephemeral key is both the
//! certified key and the signing authority. What makes it trustworthy is
//! not the signature chain (there is none) but the PK Token riding in the
//! `openpubkey-pkt` extension, which the verifier checks against the OIDC
//! provider before telling sshd to accept the certificate's CA — i.e. the
//! ephemeral key itself.

use ssh_key::certificate::{Builder, CertType, Certificate};
use ssh_key::public::KeyData;
use ssh_key::rand_core::OsRng;
use ssh_key::{HashAlg, PublicKey};

use crate::jose;
use crate::keys::EphemeralKey;
use crate::pktoken::PkToken;
use crate::{Error, Result};

/// Extension key carrying the serialized PK Token. Stable wire name.
pub const PKT_EXTENSION: &str = "openpubkey-pkt";

/// The only certificate algorithm the verifier accepts.
pub const CERT_ALGORITHM: &str = "ecdsa-sha2-nistp256-cert-v01@openssh.com";

/// Key algorithm named on the emitted authority line.
pub const CA_LINE_ALGORITHM: &str = "ecdsa-sha2-nistp256";

/// Backdate to absorb clock skew between client and host.
const VALIDITY_BACKDATE_SECS: u64 = 60;

/// Default certificate lifetime: one week. Freshness is governed by the
/// PK Token expiration policy, not this window.
const VALIDITY_WINDOW_SECS: u64 = 7 * 24 * 3600;

/// Extensions OpenSSH grants user certificates by default.
const DEFAULT_PERMITS: [&str; 5] = [
    "permit-X11-forwarding",
    "permit-agent-forwarding",
    "permit-port-forwarding",
    "permit-pty",
    "permit-user-rc",
];

/// Issue a certificate binding `pkt` to the ephemeral key.
///
/// `KeyId` is the token's identity string; principals are usually empty
/// (the host decides who the identity may become via policy).
pub fn issue(pkt: &PkToken, key: &EphemeralKey, principals: &[String]) -> Result<Certificate> {
    let now = u64::try_from(jose::unix_now()).unwrap_or(0);
    let valid_after = now.saturating_sub(VALIDITY_BACKDATE_SECS);
    let valid_before = valid_after + VALIDITY_WINDOW_SECS;

    let public = key.ssh_private().public_key().key_data().clone();
    let mut builder = Builder::new_with_random_nonce(&mut OsRng, public, valid_after, valid_before)?;
    builder.cert_type(CertType::User)?;
    builder.key_id(pkt.identity_string()?)?;
    builder.comment(crate::keys::KEY_MARKER)?;

    if principals.is_empty() {
        builder.all_principals_valid()?;
    } else {
        for principal in principals {
            builder.valid_principal(principal.clone())?;
        }
    }

    builder.extension(PKT_EXTENSION, pkt.to_wire()?)?;
    for permit in DEFAULT_PERMITS {
        builder.extension(permit, "")?;
    }

    Ok(builder.sign(key.ssh_private())?)
}

/// Parse the certificate blob sshd hands to the `AuthorizedKeysCommand`.
///
/// Rejects any algorithm other than [`CERT_ALGORITHM`] and extracts the
/// embedded PK Token.
pub fn parse_offered(algorithm: &str, blob_b64: &str) -> Result<(Certificate, PkToken)> {
    if algorithm != CERT_ALGORITHM {
        return Err(Error::CertType(algorithm.to_string()));
    }

    let cert = Certificate::from_openssh(&format!("{algorithm} {blob_b64}"))
        .map_err(|e| Error::CertType(format!("unparsable certificate: {e}")))?;

    let wire = cert
        .extensions()
        .get(PKT_EXTENSION)
        .ok_or(Error::MissingPkToken)?;
    let pkt = PkToken::from_wire(wire)?;
    Ok((cert, pkt))
}

/// Check the self-signature: the certificate must verify under its own
/// embedded CA key, and that CA key must be the certified key.
pub fn verify_self_signed(cert: &Certificate, now: i64) -> Result<()> {
    let ca = cert.signature_key();
    if cert.public_key() != ca {
        return Err(Error::BadSignature(
            "certificate CA differs from the certified key".into(),
        ));
    }
    let fingerprint = ca.fingerprint(HashAlg::Sha256);
    cert.validate_at(u64::try_from(now).unwrap_or(0), [&fingerprint])
        .map_err(|e| Error::BadSignature(format!("certificate signature invalid: {e}")))?;
    Ok(())
}

/// Check that the certified key is exactly the `upk` the CIC commits to.
pub fn verify_key_binding(cert: &Certificate, upk: &serde_json::Value) -> Result<()> {
    use p256::elliptic_curve::sec1::ToEncodedPoint;

    let expected = jose::verifying_key_from_jwk(upk)?.to_encoded_point(false);
    match cert.public_key() {
        KeyData::Ecdsa(ecdsa) if ecdsa.as_sec1_bytes() == expected.as_bytes() => Ok(()),
        KeyData::Ecdsa(_) => Err(Error::BadSignature(
            "certificate key differs from the upk in the client instance claims".into(),
        )),
        other => Err(Error::CertType(format!(
            "certificate key is not ECDSA P-256: {other:?}"
        ))),
    }
}

/// The line handed to sshd on success:
/// `cert-authority ecdsa-sha2-nistp256 <base64 CA key>`.
pub fn authority_line(cert: &Certificate) -> Result<String> {
    let ca = PublicKey::new(cert.signature_key().clone(), "");
    let openssh = ca.to_openssh()?;
    let blob = openssh
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| Error::Internal("unencodable CA key".into()))?;
    Ok(format!("cert-authority {CA_LINE_ALGORITHM} {blob}"))
}
