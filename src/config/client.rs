//! Client configuration — `~/.opk/config.yml`.
//!
//! Layered the usual way: built-in defaults, then the YAML file. The
//! `OPKSSH_CONFIG` environment variable moves the file; `OPKSSH_DEFAULT`
//! and `OPKSSH_PROVIDERS` participate in provider *resolution* (see
//! [`super::resolve_login_provider`]) rather than being config fields.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use figment::providers::{Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use super::providers::ProviderEntry;
use crate::{Error, Result};

/// Client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Alias used when no provider is named on the command line.
    pub default_provider: Option<String>,
    /// Known providers, alias → entry.
    pub providers: BTreeMap<String, ProviderEntry>,
    /// Optional log directory for `login --auto-refresh`.
    pub log_dir: Option<PathBuf>,
}

impl ClientConfig {
    /// The config file path: explicit override, then `OPKSSH_CONFIG`, then
    /// `~/.opk/config.yml`.
    #[must_use]
    pub fn path(override_path: Option<&Path>) -> PathBuf {
        if let Some(p) = override_path {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("OPKSSH_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".opk")
            .join("config.yml")
    }

    /// Load the config, merging the YAML file over defaults. A missing
    /// file is fine; a malformed one is not.
    pub fn load(path: &Path) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if path.exists() {
            figment = figment.merge(Yaml::file(path));
        }
        figment.extract().map_err(|e| Error::ConfigParse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    /// Write a commented starter config, refusing to clobber an existing
    /// file.
    pub fn write_default(path: &Path) -> Result<()> {
        if path.exists() {
            return Err(Error::Internal(format!(
                "{} already exists, not overwriting",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, DEFAULT_CONFIG)?;
        Ok(())
    }
}

const DEFAULT_CONFIG: &str = "\
# opkssh client configuration.
#
# default_provider: google
#
# providers:
#   google:
#     issuer: https://accounts.google.com
#     client_id: <your-client-id>.apps.googleusercontent.com
#     expiration_policy: oidc
#   gitlab:
#     issuer: https://gitlab.com
#     client_id: <application-id>
#     expiration_policy: max_age:24h
providers: {}
";
