//! opkssh — SSH access via OpenID Connect.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use opkssh::access::ExpectedOwner;
use opkssh::cli::{Cli, Command};
use opkssh::config::{
    self, ClientConfig, ProviderRegistry, ServerConfig, PROVIDERS_DIR, SERVER_CONFIG_PATH,
};
use opkssh::helper::{self, AddOutcome, AddRequest};
use opkssh::policy::PolicyEngine;
use opkssh::verifier::Verifier;
use opkssh::{init_logging, login, provider};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Login {
            auto_refresh,
            config_path,
            create_config,
            log_dir,
            disable_browser_open,
            print_id_token,
            output_key,
            provider,
            provider_alias,
        } => {
            run_login(
                &cli.log_level,
                LoginArgs {
                    auto_refresh,
                    config_path,
                    create_config,
                    log_dir,
                    disable_browser_open,
                    print_id_token,
                    output_key,
                    provider,
                    provider_alias,
                },
            )
            .await
        }
        Command::Verify {
            user,
            cert,
            key_type,
        } => run_verify(&cli.log_level, &user, &cert, &key_type).await,
        Command::Add {
            principal,
            identity,
            issuer,
            group,
        } => run_add(&cli.log_level, AddRequest {
            principal,
            identity,
            issuer,
            group,
        }),
        Command::Readhome { username } => run_readhome(&cli.log_level, &username),
    }
}

struct LoginArgs {
    auto_refresh: bool,
    config_path: Option<PathBuf>,
    create_config: bool,
    log_dir: Option<PathBuf>,
    disable_browser_open: bool,
    print_id_token: bool,
    output_key: Option<PathBuf>,
    provider: Option<String>,
    provider_alias: Option<String>,
}

async fn run_login(log_level: &str, args: LoginArgs) -> ExitCode {
    let log_file = args.log_dir.as_ref().map(|d| d.join("login.log"));
    if let Err(e) = init_logging(log_level, log_file.as_deref()) {
        eprintln!("Failed to set up logging: {e}");
        return ExitCode::FAILURE;
    }

    let config_path = ClientConfig::path(args.config_path.as_deref());
    if args.create_config {
        match ClientConfig::write_default(&config_path) {
            Ok(()) => info!(path = %config_path.display(), "Wrote starter config"),
            Err(e) => {
                error!("Could not write config: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    let client_config = match ClientConfig::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Could not load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    let entry = match config::resolve_login_provider(
        args.provider.as_deref(),
        args.provider_alias.as_deref(),
        &client_config,
    ) {
        Ok(entry) => entry,
        Err(e) => {
            error!("Could not resolve a provider: {e}");
            return ExitCode::FAILURE;
        }
    };

    let op = match provider::from_entry(&entry, std::time::Duration::from_secs(10)) {
        Ok(op) => op,
        Err(e) => {
            error!("Could not build provider for {}: {e}", entry.issuer);
            return ExitCode::FAILURE;
        }
    };

    let Some(home) = dirs::home_dir() else {
        error!("Cannot determine a home directory");
        return ExitCode::FAILURE;
    };

    let request = login::LoginRequest {
        output_key: args.output_key,
        print_id_token: args.print_id_token,
        auto_refresh: args.auto_refresh,
        disable_browser_open: args.disable_browser_open,
    };

    match login::run(op.as_ref(), &request, &home).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Login failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_verify(log_level: &str, user: &str, cert: &str, key_type: &str) -> ExitCode {
    // Everything before the authority line is log-only; stdout belongs to
    // sshd.
    let owner = ExpectedOwner::system();
    let server_config = match ServerConfig::load(Path::new(SERVER_CONFIG_PATH), &owner) {
        Ok(cfg) => cfg,
        Err(e) => {
            let _ = init_logging(log_level, None);
            error!("Server config rejected: {e}");
            return ExitCode::FAILURE;
        }
    };
    server_config.export_env();

    let log_file = server_config.log_dir.join("verify.log");
    if init_logging(log_level, Some(&log_file)).is_err() {
        // No log file (e.g. unpacked test install): stderr still never
        // touches stdout.
        let _ = init_logging(log_level, None);
    }

    let registry = ProviderRegistry::load_dir(Path::new(PROVIDERS_DIR), &owner);
    let verifier = Verifier::new(
        registry,
        PolicyEngine::system(),
        server_config.request_timeout,
        server_config.verify_budget,
    );

    match verifier.authorized_keys(user, cert, key_type).await {
        Ok(line) => {
            println!("{line}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Verification denied for {user}: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_add(log_level: &str, request: AddRequest) -> ExitCode {
    if let Err(e) = init_logging(log_level, None) {
        eprintln!("Failed to set up logging: {e}");
        return ExitCode::FAILURE;
    }

    match helper::add(&request) {
        Ok(AddOutcome::Added) => {
            println!(
                "Added: {} may log in as {}",
                request.identity, request.principal
            );
            ExitCode::SUCCESS
        }
        Ok(AddOutcome::AlreadyPresent) => {
            println!("Already present, nothing to do");
            ExitCode::SUCCESS
        }
        // The sudo child printed the outcome already.
        Ok(AddOutcome::Delegated) => ExitCode::SUCCESS,
        Err(e) => {
            error!("add failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_readhome(log_level: &str, username: &str) -> ExitCode {
    if let Err(e) = init_logging(log_level, None) {
        eprintln!("Failed to set up logging: {e}");
        return ExitCode::FAILURE;
    }

    match helper::read_home(username) {
        Ok(contents) => {
            print!("{contents}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("readhome refused: {e}");
            ExitCode::FAILURE
        }
    }
}
