//! Ephemeral keys and their on-disk lifecycle.
//!
//! One EC P-256 key is generated per login. It plays two roles: ES256
//! signer of the client instance claims, and certificate authority for the
//! self-issued SSH certificate. Only the public half ever leaves the host.
//!
//! On disk, the private key goes to `~/.ssh/id_ecdsa` (or a caller-chosen
//! path) and the certificate to the sibling `.pub`. Files written by a
//! previous login carry an `openpubkey` marker comment; anything without
//! the marker belongs to the user and is never overwritten.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use p256::ecdsa::SigningKey;
use serde_json::Value;
use ssh_key::private::{EcdsaKeypair, KeypairData};
use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, Certificate, EcdsaCurve, LineEnding, PrivateKey};
use tracing::info;

use crate::jose;
use crate::{Error, Result};

/// Marker comment identifying keys and certs managed by opkssh.
pub const KEY_MARKER: &str = "openpubkey";

/// The per-login EC P-256 key in both of its guises.
pub struct EphemeralKey {
    ssh: PrivateKey,
    signing: SigningKey,
}

impl EphemeralKey {
    /// Generate a fresh key.
    pub fn generate() -> Result<Self> {
        let mut ssh = PrivateKey::random(
            &mut OsRng,
            Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP256,
            },
        )?;
        ssh.set_comment(KEY_MARKER);
        Self::from_ssh(ssh)
    }

    /// Wrap an existing OpenSSH private key; must be ECDSA P-256.
    pub fn from_ssh(ssh: PrivateKey) -> Result<Self> {
        let signing = match ssh.key_data() {
            KeypairData::Ecdsa(EcdsaKeypair::NistP256 { private, .. }) => {
                SigningKey::from_slice(private.as_slice())
                    .map_err(|e| Error::Internal(format!("unusable P-256 scalar: {e}")))?
            }
            _ => {
                return Err(Error::Internal(
                    "ephemeral key must be ECDSA P-256".into(),
                ))
            }
        };
        Ok(Self { ssh, signing })
    }

    /// The ES256 signer for client instance claims.
    #[must_use]
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    /// The OpenSSH private key (certificate authority role).
    #[must_use]
    pub fn ssh_private(&self) -> &PrivateKey {
        &self.ssh
    }

    /// Public JWK of the ephemeral key, for the `upk` claim.
    pub fn public_jwk(&self) -> Result<Value> {
        jose::p256_jwk(self.signing.verifying_key())
    }
}

/// Pick where the key pair lands: an explicit path wins; otherwise the
/// first of `~/.ssh/id_ecdsa`, `~/.ssh/id_ed25519` that is either absent
/// or was written by a previous login. A key the user made themselves is
/// never touched.
pub fn select_output_path(explicit: Option<&Path>, home: &Path) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    for name in ["id_ecdsa", "id_ed25519"] {
        let path = home.join(".ssh").join(name);
        if is_available(&path)? {
            return Ok(path);
        }
    }

    Err(Error::Internal(
        "no usable key slot in ~/.ssh; pass --output-key to choose a path".into(),
    ))
}

/// A slot is available when neither file exists, or when the existing cert
/// carries the opkssh marker.
fn is_available(path: &Path) -> Result<bool> {
    let pub_path = public_path(path);
    if !path.exists() && !pub_path.exists() {
        return Ok(true);
    }
    if pub_path.exists() {
        let contents = fs::read_to_string(&pub_path)?;
        return Ok(contents.contains(KEY_MARKER));
    }
    Ok(false)
}

/// Sibling `.pub` path for a private key path.
#[must_use]
pub fn public_path(private: &Path) -> PathBuf {
    let mut name = private
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".pub");
    private.with_file_name(name)
}

/// Write the private key (mode 600) and certificate (mode 644).
pub fn write_keypair(path: &Path, key: &EphemeralKey, cert: &Certificate) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let pem = key.ssh_private().to_openssh(LineEnding::LF)?;
    fs::write(path, pem.as_bytes())?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

    let pub_path = public_path(path);
    let mut line = cert.to_openssh()?;
    if !line.contains(KEY_MARKER) {
        line.push(' ');
        line.push_str(KEY_MARKER);
    }
    line.push('\n');
    fs::write(&pub_path, line)?;
    fs::set_permissions(&pub_path, fs::Permissions::from_mode(0o644))?;

    info!(key = %path.display(), cert = %pub_path.display(), "Wrote SSH key and certificate");
    Ok(())
}
