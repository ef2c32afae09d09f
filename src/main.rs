//! dbgate - database direct-access allowlist manager
//!
//! Manages the list of addresses allowed to reach the database directly and
//! keeps the firewall in step with it.
//!
//! # Usage
//!
//! ```bash
//! dbgate --api-key "$KEY" show                   # Effective allowlist
//! dbgate --api-key "$KEY" update 93.184.216.34 151.101.0.0/24
//! dbgate --api-key "$KEY" delete                 # Clear the allowlist
//! dbgate check 93.184.216.34 10.0.0.1           # Validate only
//! dbgate hash-key "$KEY"                         # Digest for config.json
//! dbgate init                                    # Write a default config.json
//! dbgate audit -n 50                             # Recent allowlist changes
//! ```

use clap::{Parser, Subcommand};
use dbgate::config::{self, AppConfig};
use dbgate::core::identity::hash_api_key;
use dbgate::core::manager::AllowlistManager;
use dbgate::core::sync::Backend;
use dbgate::service::{Credentials, Response, Service};
use dbgate::validators;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::process::ExitCode;

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "dbgate")]
#[command(about = "Database direct-access allowlist manager", long_about = None)]
#[command(version, long_version = build::CLAP_LONG_VERSION)]
struct Cli {
    /// API key of the calling account
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Configuration file (default: <config dir>/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective allowlist
    Show,
    /// Replace the allowlist with the given addresses
    Update {
        /// IPv4/IPv6 addresses or CIDR ranges
        #[arg(value_name = "IP")]
        ips: Vec<String>,
    },
    /// Clear the allowlist
    Delete,
    /// Validate addresses without changing anything
    Check {
        #[arg(value_name = "IP", required = true)]
        ips: Vec<String>,
    },
    /// Print the digest to store as `api_key_sha256`
    HashKey { key: String },
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print recent audit events, newest first
    Audit {
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,
    },
}

fn main() -> ExitCode {
    let _ = dbgate::utils::ensure_dirs();
    init_logging();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    if let Some(mut log_path) = dbgate::utils::get_state_dir() {
        log_path.push("dbgate.log");
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
        {
            tracing_subscriber::fmt()
                .with_writer(file)
                .with_ansi(false)
                .init();
            return;
        }
    }
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();
}

async fn handle_cli(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config_path = cli.config.as_deref();
    let credentials = cli.api_key.map(Credentials::ApiKey);

    let response = match cli.command {
        Commands::HashKey { key } => {
            println!("{}", hash_api_key(&key));
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Check { ips } => {
            let config = config::load_config(config_path).await?;
            return Ok(check(&config, &ips));
        }
        Commands::Init { force } => {
            let path = config::init_config(config_path, force).await?;
            println!("Wrote default configuration to {}", path.display());
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Audit { count } => {
            let config = config::load_config(config_path).await?;
            let Some(audit) = config.audit_log() else {
                return Err("Audit logging is disabled".into());
            };
            let events = audit
                .read_recent(count)
                .await
                .map_err(|e| format!("Cannot read {}: {e}", audit.path().display()))?;
            for event in events {
                println!("{}", serde_json::to_string(&event)?);
            }
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Show => {
            let service = build_service(&config::load_config(config_path).await?)?;
            service.show(credentials.as_ref()).await
        }
        Commands::Update { ips } => {
            let service = build_service(&config::load_config(config_path).await?)?;
            service
                .update(credentials.as_ref(), &json!({ "ips": ips }))
                .await
        }
        Commands::Delete => {
            let service = build_service(&config::load_config(config_path).await?)?;
            service.destroy(credentials.as_ref()).await
        }
    };

    print_response(&response)?;
    Ok(if response.status.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

type CliService = Service<
    dbgate::core::identity::Directory,
    dbgate::core::identity::Directory,
    Backend,
    dbgate::core::store::FileStore,
>;

fn build_service(config: &AppConfig) -> Result<CliService, config::ConfigError> {
    let directory = config.directory()?;
    let mut manager = AllowlistManager::new(config.firewall_backend()?, config.store()?)
        .with_policy(config.policy)
        .with_sync_timeout(config.sync_timeout());
    if let Some(audit) = config.audit_log() {
        manager = manager.with_audit(audit);
    }
    if !nix::unistd::getuid().is_root() {
        tracing::debug!("Not running as root; nft calls rely on the configured elevation");
    }
    Ok(Service::new(directory.clone(), directory, manager))
}

fn check(config: &AppConfig, ips: &[String]) -> ExitCode {
    let mut ok = true;
    for ip in ips {
        match validators::validate_ip_or_cidr(ip, &config.policy) {
            Ok(cidr) => println!("✓ {cidr}"),
            Err(e) => {
                ok = false;
                println!("✗ {e}");
            }
        }
    }
    if ips.len() > config.policy.max_entries {
        ok = false;
        println!(
            "✗ {} entries exceed the limit of {}",
            ips.len(),
            config.policy.max_entries
        );
    }
    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

fn print_response(response: &Response) -> Result<(), serde_json::Error> {
    let body = response.body.as_ref().unwrap_or(&Value::Null);
    let is_atty = {
        use std::os::fd::AsFd;
        nix::unistd::isatty(std::io::stdout().as_fd()).unwrap_or(false)
    };
    if is_atty {
        eprintln!("{}", response.status);
        if !body.is_null() {
            println!("{}", serde_json::to_string_pretty(body)?);
        }
    } else if !body.is_null() {
        println!("{}", serde_json::to_string(body)?);
    }
    Ok(())
}
