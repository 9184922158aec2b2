use cartridge::{AppConfig, AppState, PlatformError, Result, Store, TokenStore, DEFAULT_PORT, PLATFORM_VERSION};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

/// Cartridge - a self-hosted personal PaaS in one binary
#[derive(Parser)]
#[command(name = "cartridge")]
#[command(about = "Deploy static sites and serverless scripts under your own domain")]
#[command(version = PLATFORM_VERSION)]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Main domain; tenant sites are served at <site>.<domain>
    #[arg(short, long, default_value = "localhost")]
    domain: String,

    /// Listen port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Data directory for the database and PID file
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Development mode: permissive CORS
    #[arg(long)]
    dev: bool,

    /// Production mode: HSTS and the production ACME directory
    #[arg(long)]
    production: bool,

    /// Obtain and renew TLS certificates automatically
    #[arg(long)]
    tls: bool,

    /// Contact mailbox for the ACME account
    #[arg(long)]
    tls_contact: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server (default)
    Serve,
    /// Manage deploy tokens directly against the store
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Issue a new deploy token and print the secret once
    Create {
        /// Display name for the token
        #[arg(short, long)]
        name: String,
        /// Optional scope string
        #[arg(short, long)]
        scope: Option<String>,
    },
    /// List tokens (metadata only)
    List,
    /// Revoke a token by id
    Revoke {
        /// Token id
        #[arg(short, long)]
        id: i64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .parse_filters(&cli.log_level)
        .init();

    let config = AppConfig {
        domain: cli.domain.clone(),
        port: cli.port,
        data_dir: cli.data_dir.clone(),
        dev_mode: cli.dev,
        production: cli.production,
        tls_enabled: cli.tls,
        tls_contact: cli.tls_contact.clone(),
    };

    if let Err(e) = run(cli, config).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, config: AppConfig) -> Result<()> {
    let store = Arc::new(Store::open(config.database_path()).map_err(PlatformError::from)?);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            info!("Starting cartridge v{}", PLATFORM_VERSION);
            let state = AppState::new(config, store);
            cartridge::start_server(state).await
        }
        Commands::Token { action } => token_command(store, action).await,
    }
}

async fn token_command(store: Arc<Store>, action: TokenAction) -> Result<()> {
    let tokens = TokenStore::new(store);

    match action {
        TokenAction::Create { name, scope } => {
            let issued = tokio::task::spawn_blocking(move || {
                tokens.issue(&name, scope.as_deref())
            })
            .await
            .map_err(|e| PlatformError::Internal(e.to_string()))??;

            println!("Token '{}' created (id {}).", issued.name, issued.id);
            println!("Secret (shown once, store it now):");
            println!("{}", issued.secret);
        }
        TokenAction::List => {
            let listed = tokens.list()?;
            if listed.is_empty() {
                println!("No tokens issued.");
            }
            for token in listed {
                println!(
                    "{}\t{}\tcreated {}\tlast used {}",
                    token.id,
                    token.name,
                    token.created_at,
                    token.last_used_at.as_deref().unwrap_or("never")
                );
            }
        }
        TokenAction::Revoke { id } => {
            tokens.revoke(id)?;
            println!("Token {} revoked.", id);
        }
    }

    Ok(())
}
