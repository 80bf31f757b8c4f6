//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// SSH access via OpenID Connect — certificates instead of authorized keys
#[derive(Parser, Debug)]
#[command(name = "opkssh")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "OPKSSH_LOG_LEVEL")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Log in via an OpenID provider and write an SSH key + certificate
    Login {
        /// Keep the certificate fresh until interrupted
        #[arg(long)]
        auto_refresh: bool,

        /// Client config file (default ~/.opk/config.yml)
        #[arg(long, env = "OPKSSH_CONFIG")]
        config_path: Option<PathBuf>,

        /// Write a starter config file and continue
        #[arg(long)]
        create_config: bool,

        /// Log to a file in this directory instead of stderr
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Print the authorization URL instead of opening a browser
        #[arg(long)]
        disable_browser_open: bool,

        /// Print the raw ID token after login
        #[arg(long)]
        print_id_token: bool,

        /// Where to write the private key (certificate goes to <path>.pub)
        #[arg(long)]
        output_key: Option<PathBuf>,

        /// One-shot provider: "<issuer>,<client_id>[,<client_secret>],<policy>"
        #[arg(long)]
        provider: Option<String>,

        /// Pick a configured provider by alias
        #[arg(long)]
        provider_alias: Option<String>,
    },

    /// AuthorizedKeysCommand hook: decide whether a certificate may log in
    Verify {
        /// Local username the connection asks for (%u)
        user: String,

        /// Base64 certificate blob (%k)
        cert: String,

        /// Key type string (%t)
        key_type: String,
    },

    /// Grant an identity access to a principal (may re-exec under sudo)
    Add {
        /// Local username to grant
        principal: String,

        /// Email or OIDC subject
        identity: String,

        /// Issuer URL
        issuer: String,

        /// Require membership in this group instead of an identity match
        #[arg(long)]
        group: Option<String>,
    },

    /// Print a user's policy file (root only; used by unprivileged verifiers)
    Readhome {
        /// Local username whose ~/.opk/auth_id to print
        username: String,
    },
}
