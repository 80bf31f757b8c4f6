//! PK Token model — the compound credential at the heart of opkssh.
//!
//! A PK Token binds an OIDC ID token to an ephemeral, client-held key:
//!
//! - **op** — the provider's ID token, split into JWS segments.
//! - **cic** — a second signature over the *same* payload, made by the
//!   ephemeral key, whose protected header carries the client instance
//!   claims. The ID token's `nonce` commits to those claims, closing the
//!   loop between provider-signed identity and client-controlled key.
//! - **refresh** — optionally, a fresh ID token obtained later via the
//!   provider's refresh flow, used by the `oidc_refreshed` expiration
//!   policy.
//!
//! The wire form is a JSON object of compact JWS strings, small enough to
//! ride inside an SSH certificate extension.

pub mod cic;
pub mod verify;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jose;
use crate::{Error, Result};

pub use cic::Cic;

/// One JWS split into its base64url segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwsParts {
    /// Protected header segment.
    pub protected: String,
    /// Payload segment.
    pub payload: String,
    /// Signature segment.
    pub signature: String,
}

impl JwsParts {
    /// Reassemble the compact `header.payload.signature` form.
    #[must_use]
    pub fn compact(&self) -> String {
        format!("{}.{}.{}", self.protected, self.payload, self.signature)
    }

    /// Split a compact JWS into segments.
    pub fn from_compact(compact: &str) -> Result<Self> {
        let mut parts = compact.split('.');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(p), Some(s), None) if !h.is_empty() && !s.is_empty() => Ok(Self {
                protected: h.to_string(),
                payload: p.to_string(),
                signature: s.to_string(),
            }),
            _ => Err(Error::Malformed("expected a three-segment JWS".into())),
        }
    }

    /// Decode the payload segment as JSON claims.
    pub fn claims<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let bytes = jose::b64u_decode(&self.payload)?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Malformed(format!("bad claims: {e}")))
    }
}

/// Standard claims extracted from an OIDC ID token payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// Issuer
    pub iss: String,
    /// Subject
    pub sub: String,
    /// Audience (single string or array)
    #[serde(default)]
    pub aud: Value,
    /// Expiry (Unix timestamp)
    pub exp: i64,
    /// Issued-at (Unix timestamp)
    pub iat: i64,
    /// The CIC commitment placed during login
    #[serde(default)]
    pub nonce: Option<String>,
    /// Email address, when the provider supplies one
    #[serde(default)]
    pub email: Option<String>,
    /// Group memberships (custom claim)
    #[serde(default)]
    pub groups: Option<Vec<String>>,
    /// Remaining provider-specific claims, kept for extended validation
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl IdTokenClaims {
    /// Check the `aud` claim (string or array form) against an allow-list.
    #[must_use]
    pub fn audience_matches(&self, allowed: &[String]) -> bool {
        match &self.aud {
            Value::String(s) => allowed.iter().any(|a| a == s),
            Value::Array(arr) => arr
                .iter()
                .filter_map(Value::as_str)
                .any(|s| allowed.iter().any(|a| a == s)),
            _ => false,
        }
    }

    /// Render the `aud` claim for error messages.
    #[must_use]
    pub fn audience_display(&self) -> String {
        match &self.aud {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// The identity a verified PK Token speaks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Issuer URL
    pub issuer: String,
    /// OIDC subject
    pub sub: String,
    /// Email, when present
    pub email: Option<String>,
    /// Group memberships
    pub groups: Vec<String>,
}

impl From<&IdTokenClaims> for Identity {
    fn from(claims: &IdTokenClaims) -> Self {
        Self {
            issuer: claims.iss.clone(),
            sub: claims.sub.clone(),
            email: claims.email.clone(),
            groups: claims.groups.clone().unwrap_or_default(),
        }
    }
}

/// Wire form: named members, each a compact JWS.
#[derive(Serialize, Deserialize)]
struct WirePkToken {
    op: String,
    cic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh: Option<String>,
}

/// A PK Token: ID token + CIC signature (+ optional refreshed ID token).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkToken {
    /// The provider-signed ID token.
    pub op: JwsParts,
    /// CIC protected-header segment (canonical claims JSON).
    pub cic_protected: String,
    /// Ephemeral-key signature over `cic_protected.op.payload`.
    pub cic_signature: String,
    /// Refreshed ID token, present after a refresh flow.
    pub refresh: Option<JwsParts>,
}

impl PkToken {
    /// Serialize to the compact wire string carried in SSH certificates.
    pub fn to_wire(&self) -> Result<String> {
        let cic = JwsParts {
            protected: self.cic_protected.clone(),
            payload: self.op.payload.clone(),
            signature: self.cic_signature.clone(),
        };
        let wire = WirePkToken {
            op: self.op.compact(),
            cic: cic.compact(),
            refresh: self.refresh.as_ref().map(JwsParts::compact),
        };
        Ok(serde_json::to_string(&wire)?)
    }

    /// Parse the wire string back into a PK Token.
    ///
    /// The `cic` member must share the `op` payload; a divergent payload
    /// means the token was not assembled by a conforming client.
    pub fn from_wire(text: &str) -> Result<Self> {
        let wire: WirePkToken = serde_json::from_str(text)
            .map_err(|e| Error::Malformed(format!("bad PK Token wire form: {e}")))?;
        let op = JwsParts::from_compact(&wire.op)?;
        let cic = JwsParts::from_compact(&wire.cic)?;
        if cic.payload != op.payload {
            return Err(Error::Malformed(
                "cic member does not share the ID token payload".into(),
            ));
        }
        let refresh = wire
            .refresh
            .as_deref()
            .map(JwsParts::from_compact)
            .transpose()?;
        Ok(Self {
            op,
            cic_protected: cic.protected,
            cic_signature: cic.signature,
            refresh,
        })
    }

    /// The client instance claims from the CIC protected header.
    pub fn cic(&self) -> Result<Cic> {
        Cic::from_protected(&self.cic_protected)
    }

    /// The (unverified) ID token claims.
    pub fn claims(&self) -> Result<IdTokenClaims> {
        self.op.claims()
    }

    /// Identity string for the certificate `KeyId`: email when present,
    /// otherwise `sub@iss`.
    pub fn identity_string(&self) -> Result<String> {
        let claims = self.claims()?;
        Ok(claims
            .email
            .unwrap_or_else(|| format!("{}@{}", claims.sub, claims.iss)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_token(refresh: bool) -> PkToken {
        let payload = jose::b64u(r#"{"iss":"https://op.example","sub":"u1","aud":"cid","exp":1,"iat":0}"#);
        PkToken {
            op: JwsParts {
                protected: jose::b64u(r#"{"alg":"RS256"}"#),
                payload: payload.clone(),
                signature: "c2ln".to_string(),
            },
            cic_protected: jose::b64u(r#"{"alg":"ES256","rz":"r","typ":"CIC","upk":{}}"#),
            cic_signature: "Y2lj".to_string(),
            refresh: refresh.then(|| JwsParts {
                protected: jose::b64u(r#"{"alg":"RS256"}"#),
                payload,
                signature: "cmVm".to_string(),
            }),
        }
    }

    #[test]
    fn wire_round_trip_is_byte_exact() {
        for refresh in [false, true] {
            let token = sample_token(refresh);
            let wire = token.to_wire().unwrap();
            let restored = PkToken::from_wire(&wire).unwrap();
            assert_eq!(restored, token);
            assert_eq!(restored.to_wire().unwrap(), wire);
        }
    }

    #[test]
    fn diverging_cic_payload_is_rejected() {
        let token = sample_token(false);
        let wire = token.to_wire().unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&wire).unwrap();
        let tampered = {
            let cic = value["cic"].as_str().unwrap();
            let mut parts: Vec<String> = cic.split('.').map(String::from).collect();
            parts[1] = jose::b64u("{}");
            parts.join(".")
        };
        value["cic"] = serde_json::Value::String(tampered);
        assert!(PkToken::from_wire(&value.to_string()).is_err());
    }

    #[test]
    fn identity_string_prefers_email() {
        let mut token = sample_token(false);
        assert_eq!(token.identity_string().unwrap(), "u1@https://op.example");

        token.op.payload = jose::b64u(
            r#"{"iss":"https://op.example","sub":"u1","aud":"cid","exp":1,"iat":0,"email":"a@b.c"}"#,
        );
        assert_eq!(token.identity_string().unwrap(), "a@b.c");
    }

    #[test]
    fn audience_matches_string_and_array_forms() {
        let allowed = vec!["cid".to_string()];
        let token = sample_token(false);
        assert!(token.claims().unwrap().audience_matches(&allowed));

        let mut claims = token.claims().unwrap();
        claims.aud = serde_json::json!(["other", "cid"]);
        assert!(claims.audience_matches(&allowed));
        claims.aud = serde_json::json!(["other"]);
        assert!(!claims.audience_matches(&allowed));
    }

    #[test]
    fn two_segment_jws_is_rejected() {
        assert!(JwsParts::from_compact("a.b").is_err());
        assert!(JwsParts::from_compact("a.b.c.d").is_err());
    }
}
