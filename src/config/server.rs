//! Server configuration — verifier tuning and environment exports.
//!
//! `/etc/opk/server_config.yml` is optional. When present it must satisfy
//! the same ownership discipline as the system policy file; a deviating
//! file fails the verification outright rather than silently running with
//! defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::access::{self, ExpectedOwner};
use crate::{Error, Result};

/// Default server configuration path.
pub const SERVER_CONFIG_PATH: &str = "/etc/opk/server_config.yml";

/// Default log directory for the verifier.
pub const DEFAULT_LOG_DIR: &str = "/var/log/opkssh";

/// Verifier-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Environment variables exported into the verifier process before any
    /// provider call (proxy settings, CA bundles, and the like).
    pub env_vars: HashMap<String, String>,
    /// Hard deadline for any single OIDC network request.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Total budget for one verification.
    #[serde(with = "humantime_serde")]
    pub verify_budget: Duration,
    /// Where verifier logs go. stdout is reserved for the authority line.
    pub log_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            env_vars: HashMap::new(),
            request_timeout: Duration::from_secs(10),
            verify_budget: Duration::from_secs(25),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
        }
    }
}

impl ServerConfig {
    /// Load the server config, enforcing ownership when the file exists.
    ///
    /// A missing file yields defaults; a present-but-untrusted or
    /// unparsable file is an error.
    pub fn load(path: &Path, owner: &ExpectedOwner) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No server config, using defaults");
            return Ok(Self::default());
        }
        access::enforce(path, owner)?;
        let text = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&text).map_err(|e| Error::ConfigParse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    /// Export `env_vars` into the process environment.
    pub fn export_env(&self) {
        for (key, value) in &self.env_vars {
            debug!(key = %key, "Exporting server config environment variable");
            std::env::set_var(key, value);
        }
    }
}
