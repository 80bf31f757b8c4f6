//! Configuration: client config, server config, and the provider registry.

pub mod client;
pub mod providers;
pub mod server;

pub use client::ClientConfig;
pub use providers::{
    ExpirationPolicy, ProviderEntry, ProviderKind, ProviderRegistry, PROVIDERS_DIR,
    WEBCHOOSER_ALIAS,
};
pub use server::{ServerConfig, SERVER_CONFIG_PATH};

use crate::{Error, Result};

/// Resolve which provider a login should use.
///
/// Precedence: `--provider` string, then `--provider-alias`, then the
/// `OPKSSH_PROVIDERS`/`OPKSSH_DEFAULT` environment, then the config file's
/// `default_provider`, then the interactive chooser sentinel. The chooser
/// itself lives outside this crate, so when resolution lands there we pick
/// the sole configured provider or ask the caller to disambiguate.
pub fn resolve_login_provider(
    provider_string: Option<&str>,
    alias: Option<&str>,
    config: &ClientConfig,
) -> Result<ProviderEntry> {
    if let Some(s) = provider_string {
        return ProviderEntry::from_provider_string(s);
    }

    let mut registry = ProviderRegistry::new(
        config
            .providers
            .iter()
            .map(|(a, e)| (a.clone(), e.clone()))
            .collect(),
    );
    if let Ok(joined) = std::env::var("OPKSSH_PROVIDERS") {
        registry.extend(ProviderRegistry::from_provider_strings(&joined)?);
    }

    let chosen_alias = alias
        .map(str::to_string)
        .or_else(|| std::env::var("OPKSSH_DEFAULT").ok())
        .or_else(|| config.default_provider.clone())
        .unwrap_or_else(|| WEBCHOOSER_ALIAS.to_string());

    if chosen_alias != WEBCHOOSER_ALIAS {
        return registry
            .by_alias(&chosen_alias)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("no provider with alias {chosen_alias:?}")));
    }

    // Chooser sentinel: unambiguous with one candidate, otherwise the user
    // must name one.
    match registry.len() {
        0 => Err(Error::Internal(
            "no providers configured; pass --provider or add one to ~/.opk/config.yml".into(),
        )),
        1 => registry
            .iter()
            .next()
            .map(|(_, e)| e.clone())
            .ok_or_else(|| Error::Internal("provider registry emptied underneath us".into())),
        _ => Err(Error::Internal(format!(
            "multiple providers configured ({}); choose one with --provider-alias",
            registry.aliases().join(", ")
        ))),
    }
}
