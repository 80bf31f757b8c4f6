//! Error types for opkssh

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for opkssh
pub type Result<T> = std::result::Result<T, Error>;

/// opkssh errors
#[derive(Error, Debug)]
pub enum Error {
    /// A trusted file has the wrong owner, group, or permission bits.
    /// The file is ignored regardless of its contents.
    #[error("refusing {path}: {detail}")]
    FileAccess {
        /// Path of the offending file
        path: PathBuf,
        /// What deviated (owner, group, or mode)
        detail: String,
    },

    /// Malformed YAML or an otherwise unreadable trusted file.
    #[error("failed to parse {path}: {detail}")]
    ConfigParse {
        /// Path of the offending file
        path: PathBuf,
        /// Parser error
        detail: String,
    },

    /// The token's issuer is not present in the provider registry.
    #[error("no provider registered for issuer {0}")]
    ProviderUnknown(String),

    /// Network, discovery, or JWKS failure while talking to a provider.
    #[error("provider request failed: {0}")]
    ProviderNet(String),

    /// A signature in the PK Token did not verify.
    #[error("PK Token signature verification failed: {0}")]
    BadSignature(String),

    /// The ID token nonce does not commit to the client instance claims.
    #[error("ID token nonce does not match the client instance claims")]
    NonceBinding,

    /// The PK Token is no longer fresh under the provider's expiration policy.
    #[error("PK Token expired: {0}")]
    TokenExpired(String),

    /// The `iss` claim does not match the resolved provider.
    #[error("issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Issuer the provider is configured for
        expected: String,
        /// Issuer found in the token
        actual: String,
    },

    /// The `aud` claim matches none of the allowed audiences.
    #[error("audience {0:?} is not accepted for this provider")]
    AudienceMismatch(String),

    /// The offered certificate carries no PK Token extension.
    #[error("certificate has no PK Token extension")]
    MissingPkToken,

    /// The offered key is not a supported certificate type.
    #[error("unsupported certificate type: {0}")]
    CertType(String),

    /// Structurally invalid PK Token or JWS.
    #[error("malformed PK Token: {0}")]
    Malformed(String),

    /// No policy row authorizes the identity for the requested principal.
    #[error("identity is not authorized for principal {principal}")]
    PolicyDeny {
        /// The local username that was requested
        principal: String,
    },

    /// The privileged helper was invoked without the required uid.
    #[error("privileged operation refused")]
    HelperRefused,

    /// Refresh was requested from a provider that cannot refresh.
    #[error("provider {0} does not support refresh")]
    RefreshUnsupported(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JWT decode/verify error from the provider token path
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// OpenSSH key or certificate encoding error
    #[error("SSH key error: {0}")]
    SshKey(#[from] ssh_key::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the error is a transient provider/network condition that a
    /// refresh loop may retry with backoff. Token rejections and unknown
    /// issuers are fatal.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ProviderNet(_) | Self::Http(_) | Self::Io(_))
    }
}
