//! Provider registry — who may vouch for an identity.
//!
//! Providers are registered either as one YAML file per provider under
//! `/etc/opk/providers.d/` (same ownership rule as the system policy), or in
//! compact string form `<issuer>,<client_id>[,<client_secret>],<policy>` for
//! environment-driven setups (`OPKSSH_PROVIDERS`).

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::access::{self, ExpectedOwner};
use crate::{Error, Result};

/// Default on-disk provider registry.
pub const PROVIDERS_DIR: &str = "/etc/opk/providers.d";

/// Alias reserved for "ask the user to choose interactively".
pub const WEBCHOOSER_ALIAS: &str = "WEBCHOOSER";

/// When a PK Token stops being acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ExpirationPolicy {
    /// Fresh while the ID token's `exp` has not passed.
    Oidc,
    /// Fresh while the refreshed ID token's `exp` has not passed.
    OidcRefreshed,
    /// Fresh for a fixed window after the ID token's `iat`.
    MaxAge(Duration),
    /// Always fresh. Test and local development only.
    NeverExpire,
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self::Oidc
    }
}

impl fmt::Display for ExpirationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oidc => f.write_str("oidc"),
            Self::OidcRefreshed => f.write_str("oidc_refreshed"),
            Self::MaxAge(d) => write!(f, "max_age:{}", humantime::format_duration(*d)),
            Self::NeverExpire => f.write_str("never_expire"),
        }
    }
}

impl std::str::FromStr for ExpirationPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "oidc" => Ok(Self::Oidc),
            "oidc_refreshed" => Ok(Self::OidcRefreshed),
            "never_expire" => Ok(Self::NeverExpire),
            other => {
                let spec = other.strip_prefix("max_age:").ok_or_else(|| {
                    Error::Malformed(format!("unknown expiration policy {other:?}"))
                })?;
                let d = humantime::parse_duration(spec)
                    .map_err(|e| Error::Malformed(format!("bad max_age duration: {e}")))?;
                Ok(Self::MaxAge(d))
            }
        }
    }
}

impl TryFrom<String> for ExpirationPolicy {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ExpirationPolicy> for String {
    fn from(p: ExpirationPolicy) -> Self {
        p.to_string()
    }
}

/// Which login/validation quirks a provider needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Discovery + JWKS + authorization-code login (Google, Azure, GitLab,
    /// Zitadel, any spec-compliant issuer).
    #[default]
    Standard,
    /// GitHub Actions OIDC tokens; no interactive login, no refresh.
    Github,
    /// GCE instance identity tokens; no interactive login, no refresh.
    Gcp,
    /// In-process signer for tests and local development.
    Mock,
}

/// One registered provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Issuer URL, compared byte-for-byte against the token `iss`.
    pub issuer: String,
    /// OAuth client id; the expected token audience.
    pub client_id: String,
    /// Client secret for providers that require one at the token endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Loopback redirect URIs to offer during login.
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    /// Scopes requested during login.
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Freshness rule applied at verification time.
    #[serde(default)]
    pub expiration_policy: ExpirationPolicy,
    /// Provider behavior class.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Claims that must equal the given values (extended validation, e.g.
    /// pinning GitHub `repository` or GCE `google.compute_engine.project_id`).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub required_claims: HashMap<String, String>,
}

fn default_scopes() -> Vec<String> {
    vec!["openid".to_string(), "email".to_string(), "profile".to_string()]
}

impl ProviderEntry {
    /// Parse the compact string form
    /// `<issuer>,<client_id>[,<client_secret>],<policy>`.
    pub fn from_provider_string(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split(',').map(str::trim).collect();
        let (issuer, client_id, client_secret, policy) = match fields.as_slice() {
            [iss, cid, policy] => (*iss, *cid, None, *policy),
            [iss, cid, secret, policy] => (*iss, *cid, Some((*secret).to_string()), *policy),
            _ => {
                return Err(Error::Malformed(format!(
                    "provider string needs 3 or 4 comma-separated fields, got {}",
                    fields.len()
                )))
            }
        };
        if issuer.is_empty() || client_id.is_empty() {
            return Err(Error::Malformed(
                "provider string has an empty issuer or client_id".into(),
            ));
        }
        Ok(Self {
            issuer: issuer.to_string(),
            client_id: client_id.to_string(),
            client_secret,
            redirect_uris: Vec::new(),
            scopes: default_scopes(),
            expiration_policy: policy.parse()?,
            kind: ProviderKind::Standard,
            required_claims: HashMap::new(),
        })
    }

    /// Audiences acceptable for this provider.
    #[must_use]
    pub fn audiences(&self) -> Vec<String> {
        vec![self.client_id.clone()]
    }
}

/// The resolved provider registry: alias → entry, in load order.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    entries: Vec<(String, ProviderEntry)>,
}

impl ProviderRegistry {
    /// Build from explicit alias/entry pairs.
    #[must_use]
    pub fn new(entries: Vec<(String, ProviderEntry)>) -> Self {
        Self { entries }
    }

    /// Load `<dir>/*.yml`, one provider per file, alias = file stem.
    ///
    /// Files with wrong ownership or unparsable YAML are skipped with a
    /// warning; the remaining providers still load.
    #[must_use]
    pub fn load_dir(dir: &Path, owner: &ExpectedOwner) -> Self {
        let mut entries = Vec::new();
        let mut paths: Vec<PathBuf> = match std::fs::read_dir(dir) {
            Ok(rd) => rd
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| {
                    p.extension()
                        .is_some_and(|ext| ext == "yml" || ext == "yaml")
                })
                .collect(),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Provider registry directory unreadable");
                return Self::default();
            }
        };
        paths.sort();

        for path in paths {
            if let Err(e) = access::enforce(&path, owner) {
                warn!(file = %path.display(), error = %e, "Skipping provider file");
                continue;
            }
            match load_entry(&path) {
                Ok(entry) => {
                    let alias = path
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    entries.push((alias, entry));
                }
                Err(e) => warn!(file = %path.display(), error = %e, "Skipping provider file"),
            }
        }
        Self { entries }
    }

    /// Parse `OPKSSH_PROVIDERS`-style input: provider strings joined by `;`.
    pub fn from_provider_strings(joined: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for (i, part) in joined.split(';').filter(|p| !p.trim().is_empty()).enumerate() {
            let entry = ProviderEntry::from_provider_string(part)?;
            entries.push((format!("env{i}"), entry));
        }
        Ok(Self { entries })
    }

    /// Look up a provider by issuer, byte-for-byte.
    #[must_use]
    pub fn by_issuer(&self, issuer: &str) -> Option<&ProviderEntry> {
        self.entries.iter().find(|(_, e)| e.issuer == issuer).map(|(_, e)| e)
    }

    /// Look up a provider by alias.
    #[must_use]
    pub fn by_alias(&self, alias: &str) -> Option<&ProviderEntry> {
        self.entries.iter().find(|(a, _)| a == alias).map(|(_, e)| e)
    }

    /// All aliases, in load order.
    #[must_use]
    pub fn aliases(&self) -> Vec<&str> {
        self.entries.iter().map(|(a, _)| a.as_str()).collect()
    }

    /// Iterate entries in load order.
    pub fn iter(&self) -> impl Iterator<Item = &(String, ProviderEntry)> {
        self.entries.iter()
    }

    /// Number of registered providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no providers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append the entries of `other` after the current ones.
    pub fn extend(&mut self, other: Self) {
        self.entries.extend(other.entries);
    }
}

fn load_entry(path: &Path) -> Result<ProviderEntry> {
    let text = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&text).map_err(|e| Error::ConfigParse {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn expiration_policy_parses_all_forms() {
        assert_eq!("oidc".parse::<ExpirationPolicy>().unwrap(), ExpirationPolicy::Oidc);
        assert_eq!(
            "oidc_refreshed".parse::<ExpirationPolicy>().unwrap(),
            ExpirationPolicy::OidcRefreshed
        );
        assert_eq!(
            "never_expire".parse::<ExpirationPolicy>().unwrap(),
            ExpirationPolicy::NeverExpire
        );
        assert_eq!(
            "max_age:24h".parse::<ExpirationPolicy>().unwrap(),
            ExpirationPolicy::MaxAge(Duration::from_secs(86_400))
        );
        assert!("weekly".parse::<ExpirationPolicy>().is_err());
        assert!("max_age:soon".parse::<ExpirationPolicy>().is_err());
    }

    #[test]
    fn provider_string_three_fields() {
        let entry = ProviderEntry::from_provider_string(
            "https://accounts.google.com,client-123,oidc",
        )
        .unwrap();
        assert_eq!(entry.issuer, "https://accounts.google.com");
        assert_eq!(entry.client_id, "client-123");
        assert_eq!(entry.client_secret, None);
        assert_eq!(entry.expiration_policy, ExpirationPolicy::Oidc);
    }

    #[test]
    fn provider_string_four_fields_includes_secret() {
        let entry = ProviderEntry::from_provider_string(
            "https://gitlab.com,cid,s3cret,max_age:1h",
        )
        .unwrap();
        assert_eq!(entry.client_secret.as_deref(), Some("s3cret"));
        assert_eq!(
            entry.expiration_policy,
            ExpirationPolicy::MaxAge(Duration::from_secs(3600))
        );
    }

    #[test]
    fn provider_string_wrong_arity_is_rejected() {
        assert!(ProviderEntry::from_provider_string("https://op.example,cid").is_err());
        assert!(ProviderEntry::from_provider_string("a,b,c,d,e").is_err());
    }

    #[test]
    fn provider_yaml_round_trips_with_defaults() {
        let yaml = "issuer: https://op.example\nclient_id: cid\n";
        let entry: ProviderEntry = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(entry.kind, ProviderKind::Standard);
        assert_eq!(entry.expiration_policy, ExpirationPolicy::Oidc);
        assert_eq!(entry.scopes, vec!["openid", "email", "profile"]);
    }

    #[test]
    fn registry_lookup_by_issuer_and_alias() {
        let registry = ProviderRegistry::from_provider_strings(
            "https://a.example,cid-a,oidc;https://b.example,cid-b,never_expire",
        )
        .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.by_issuer("https://b.example").unwrap().client_id, "cid-b");
        assert!(registry.by_issuer("https://c.example").is_none());
        assert_eq!(registry.by_alias("env0").unwrap().client_id, "cid-a");
    }

    #[test]
    fn load_dir_skips_bad_files_but_keeps_good_ones() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("good.yml"),
            "issuer: https://op.example\nclient_id: cid\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("bad.yml"), ": not yaml {").unwrap();
        set_mode(&dir.path().join("good.yml"), 0o600);
        set_mode(&dir.path().join("bad.yml"), 0o600);

        let registry =
            ProviderRegistry::load_dir(dir.path(), &crate::access::current_user(0o640));
        assert_eq!(registry.aliases(), vec!["good"]);
    }

    fn set_mode(path: &Path, mode: u32) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
    }
}
