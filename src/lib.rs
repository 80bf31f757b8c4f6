//! opkssh — SSH access via OpenID Connect.
//!
//! Replaces long-lived `authorized_keys` entries with short-lived SSH
//! certificates whose authority is an OIDC identity:
//!
//! - `opkssh login` mints a **PK Token** (an ID token bound to a per-login
//!   ephemeral key) and binds it into a self-issued SSH certificate.
//! - sshd's `AuthorizedKeysCommand` runs `opkssh verify`, which checks the
//!   token against the issuing provider, evaluates the host's policy
//!   files, and on success prints a `cert-authority` line trusting the
//!   ephemeral key.
//! - `opkssh add` appends policy rows, re-executing under `sudo` for the
//!   root-owned system policy.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod access;
pub mod cert;
pub mod cli;
pub mod config;
pub mod error;
pub mod helper;
pub mod jose;
pub mod keys;
pub mod login;
pub mod pktoken;
pub mod policy;
pub mod provider;
pub mod verifier;

pub use error::{Error, Result};

use std::path::Path;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Set up tracing. With a file target, stdout stays untouched — the
/// verifier's stdout belongs to sshd.
pub fn init_logging(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            registry
                .with(fmt::layer().with_ansi(false).with_writer(std::sync::Arc::new(file)))
                .init();
        }
        None => {
            registry
                .with(fmt::layer().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
    }
    Ok(())
}
