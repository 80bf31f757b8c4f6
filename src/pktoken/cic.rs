//! Client instance claims — the client-side half of a PK Token.
//!
//! The CIC describes the ephemeral key: `{alg, upk, rz, typ}`. Its canonical
//! JSON (sorted keys, no whitespace) is hashed into the OIDC `nonce`, which
//! is how the provider-signed identity commits to the client-held key.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jose;
use crate::{Error, Result};

/// Client instance claims carried in the CIC protected header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cic {
    /// Signature algorithm of the ephemeral key, always `ES256` here.
    pub alg: String,
    /// Random value making each commitment unique per login.
    pub rz: String,
    /// Claim type marker, always `CIC`.
    pub typ: String,
    /// Public JWK of the ephemeral key.
    pub upk: Value,
}

impl Cic {
    /// Build fresh claims for an ephemeral public key.
    #[must_use]
    pub fn new(upk: Value) -> Self {
        use rand::RngExt;
        let rz: [u8; 32] = rand::rng().random();
        Self {
            alg: "ES256".to_string(),
            rz: jose::b64u(rz),
            typ: "CIC".to_string(),
            upk,
        }
    }

    /// The nonce commitment: base64url SHA-256 of the canonical claims JSON.
    pub fn commitment(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        jose::canonical_digest(&value)
    }

    /// The claims as a base64url protected-header segment (canonical JSON).
    pub fn protected_segment(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        Ok(jose::b64u(jose::canonical_json(&value)?))
    }

    /// Parse claims back out of a protected-header segment.
    pub fn from_protected(segment: &str) -> Result<Self> {
        let bytes = jose::b64u_decode(segment)?;
        let cic: Self = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Malformed(format!("bad CIC header: {e}")))?;
        if cic.typ != "CIC" {
            return Err(Error::Malformed(format!("CIC typ is {:?}", cic.typ)));
        }
        Ok(cic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::SigningKey;
    use ssh_key::rand_core::OsRng;

    fn test_cic() -> Cic {
        let key = SigningKey::random(&mut OsRng);
        Cic::new(jose::p256_jwk(key.verifying_key()).unwrap())
    }

    #[test]
    fn commitment_matches_digest_of_protected_segment() {
        // The protected segment is the canonical claims JSON, so hashing its
        // decoded bytes must reproduce the commitment.
        let cic = test_cic();
        let decoded = jose::b64u_decode(&cic.protected_segment().unwrap()).unwrap();
        let value: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(
            cic.commitment().unwrap(),
            jose::canonical_digest(&value).unwrap()
        );
    }

    #[test]
    fn protected_segment_round_trips() {
        let cic = test_cic();
        let restored = Cic::from_protected(&cic.protected_segment().unwrap()).unwrap();
        assert_eq!(restored, cic);
    }

    #[test]
    fn rz_makes_commitments_unique_per_login() {
        let key = SigningKey::random(&mut OsRng);
        let jwk = jose::p256_jwk(key.verifying_key()).unwrap();
        let a = Cic::new(jwk.clone());
        let b = Cic::new(jwk);
        assert_ne!(a.commitment().unwrap(), b.commitment().unwrap());
    }

    #[test]
    fn wrong_typ_is_rejected() {
        let mut cic = test_cic();
        cic.typ = "JWT".to_string();
        let segment = cic.protected_segment().unwrap();
        assert!(Cic::from_protected(&segment).is_err());
    }
}
