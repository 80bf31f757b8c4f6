//! JOSE primitives shared by the PK Token model.
//!
//! Everything here operates on base64url (no padding) segments and on the
//! deterministic JSON form used for nonce commitments: object keys sorted,
//! no whitespace. `serde_json` maps are ordered, so re-serializing a parsed
//! value yields the canonical text.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Encode bytes as base64url without padding.
#[must_use]
pub fn b64u(data: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decode a base64url (no padding) segment.
pub fn b64u_decode(segment: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| Error::Malformed(format!("bad base64url segment: {e}")))
}

/// Serialize a JSON value in canonical form: sorted keys, no whitespace.
///
/// Parsing and re-serializing arbitrary JSON through [`Value`] is canonical
/// because `serde_json`'s map type keeps keys in sorted order.
pub fn canonical_json(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// base64url SHA-256 of the canonical form of `value`.
pub fn canonical_digest(value: &Value) -> Result<String> {
    let text = canonical_json(value)?;
    Ok(b64u(Sha256::digest(text.as_bytes())))
}

/// Sign `protected.payload` (both already base64url segments) with ES256.
///
/// Returns the base64url signature segment (64-byte `r || s`).
#[must_use]
pub fn sign_es256(key: &SigningKey, protected: &str, payload: &str) -> String {
    let input = signing_input(protected, payload);
    let sig: Signature = key.sign(input.as_bytes());
    b64u(sig.to_bytes())
}

/// Verify an ES256 signature segment over `protected.payload`.
pub fn verify_es256(
    key: &VerifyingKey,
    protected: &str,
    payload: &str,
    signature: &str,
) -> Result<()> {
    let sig_bytes = b64u_decode(signature)?;
    let sig = Signature::from_slice(&sig_bytes)
        .map_err(|e| Error::BadSignature(format!("not a P-256 signature: {e}")))?;
    let input = signing_input(protected, payload);
    key.verify(input.as_bytes(), &sig)
        .map_err(|e| Error::BadSignature(format!("ES256 verification failed: {e}")))
}

/// The JWS signing input `protected + "." + payload`.
#[must_use]
pub fn signing_input(protected: &str, payload: &str) -> String {
    format!("{protected}.{payload}")
}

/// Build the public JWK (EC, P-256) for a verifying key.
///
/// The member order is irrelevant here; canonicalization happens when the
/// JWK is embedded in the client instance claims and hashed.
pub fn p256_jwk(key: &VerifyingKey) -> Result<Value> {
    let point = key.to_encoded_point(false);
    let x = point
        .x()
        .ok_or_else(|| Error::Internal("public key has no affine x".into()))?;
    let y = point
        .y()
        .ok_or_else(|| Error::Internal("public key has no affine y".into()))?;
    Ok(serde_json::json!({
        "alg": "ES256",
        "crv": "P-256",
        "kty": "EC",
        "x": b64u(x),
        "y": b64u(y),
    }))
}

/// Reconstruct a verifying key from an EC P-256 JWK.
pub fn verifying_key_from_jwk(jwk: &Value) -> Result<VerifyingKey> {
    let kty = jwk.get("kty").and_then(Value::as_str);
    let crv = jwk.get("crv").and_then(Value::as_str);
    if kty != Some("EC") || crv != Some("P-256") {
        return Err(Error::Malformed(format!(
            "unsupported upk key type {kty:?}/{crv:?}"
        )));
    }

    let x = decode_coordinate(jwk, "x")?;
    let y = decode_coordinate(jwk, "y")?;
    let point = p256::EncodedPoint::from_affine_coordinates(
        p256::FieldBytes::from_slice(&x),
        p256::FieldBytes::from_slice(&y),
        false,
    );
    VerifyingKey::from_encoded_point(&point)
        .map_err(|e| Error::Malformed(format!("upk is not a valid P-256 point: {e}")))
}

fn decode_coordinate(jwk: &Value, member: &str) -> Result<Vec<u8>> {
    let segment = jwk
        .get(member)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Malformed(format!("upk JWK missing {member}")))?;
    let bytes = b64u_decode(segment)?;
    if bytes.len() != 32 {
        return Err(Error::Malformed(format!(
            "upk coordinate {member} has {} bytes, expected 32",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Current Unix time in seconds.
#[must_use]
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
