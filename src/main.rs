//! turn-probe - TURN/STUN reachability prober
//!
//! Checks whether TURN and STUN servers are reachable and whether a
//! credential pair is accepted, by gathering ICE candidates against each
//! server and reading the candidate types that come back.

mod config;
mod credentials;
mod error;
mod probe;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use credentials::{
    server, Credential, CredentialIssuer, CredentialProvider, HttpCredentials, StaticCredentials,
    DEFAULT_IDENTITY,
};
use probe::gatherer::UdpGatherer;
use probe::orchestrator::Orchestrator;

const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 3600;

#[derive(Parser)]
#[command(name = "turn-probe")]
#[command(about = "Probe TURN/STUN servers for reachability and credential acceptance", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe servers and print one verdict per server
    Probe(ProbeArgs),

    /// Serve time-limited TURN credentials over HTTP
    ServeCredentials {
        /// Shared secret configured on the TURN server
        #[arg(env = "TURN_PROBE_SECRET", hide_env_values = true)]
        secret: String,

        /// Identity embedded in issued usernames
        #[arg(long, default_value = DEFAULT_IDENTITY)]
        identity: String,

        /// Address to listen on
        #[arg(long, default_value = server::DEFAULT_BIND)]
        bind: SocketAddr,
    },

    /// Mint one credential pair and print it as JSON
    Mint {
        /// Shared secret configured on the TURN server
        #[arg(env = "TURN_PROBE_SECRET", hide_env_values = true)]
        secret: String,

        /// Identity embedded in the username
        #[arg(long, default_value = DEFAULT_IDENTITY)]
        identity: String,

        /// Validity in seconds (at most ten years)
        #[arg(long, default_value = "86400", value_parser = clap::value_parser!(u64).range(1..=MAX_TTL_SECS))]
        ttl: u64,
    },

    /// Manage the configured server list
    Servers {
        #[command(subcommand)]
        action: ServersAction,
    },
}

#[derive(Args)]
struct ProbeArgs {
    /// Server URIs (turn:, turns:, stun:); defaults to the configured list
    servers: Vec<String>,

    /// Fetch credentials from this endpoint
    #[arg(long, conflicts_with = "username")]
    credentials_url: Option<String>,

    /// TURN username
    #[arg(short, long, requires = "password")]
    username: Option<String>,

    /// TURN password
    #[arg(short, long, requires = "username")]
    password: Option<String>,

    /// Mint credentials locally from the TURN shared secret
    #[arg(long, env = "TURN_PROBE_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Identity for locally minted credentials
    #[arg(long)]
    identity: Option<String>,

    /// Per-server gathering timeout in seconds
    #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
    timeout: Option<u64>,

    /// Timeout for the whole batch in seconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    batch_timeout: Option<u64>,

    /// Print the full report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum ServersAction {
    /// Show configured servers
    List,
    /// Add a server URI
    Add { uri: String },
    /// Remove a server URI
    Remove { uri: String },
    /// Remove all servers
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Probe(args) => {
            let config = Config::load()?;
            if !run_probe(args, &config).await? {
                std::process::exit(1);
            }
        }
        Commands::ServeCredentials {
            secret,
            identity,
            bind,
        } => {
            let issuer = CredentialIssuer::new(secret, identity)?;
            let identity = issuer.identity().to_string();
            let (addr, handle) = server::spawn(bind, issuer)?;
            tracing::info!(
                "Serving credentials for {} on http://{}{}",
                identity,
                addr,
                server::CREDENTIALS_PATH
            );

            tokio::select! {
                _ = handle => bail!("Credential endpoint stopped"),
                r = tokio::signal::ctrl_c() => {
                    r.context("Failed to listen for ctrl-c")?;
                    tracing::info!("Shutting down");
                }
            }
        }
        Commands::Mint {
            secret,
            identity,
            ttl,
        } => {
            let credential = CredentialIssuer::new(secret, identity)?
                .with_ttl(Duration::from_secs(ttl))
                .issue();
            if let Some(expires) = credential.expires_at() {
                tracing::debug!("Credential expires {}", expires);
            }
            println!("{}", serde_json::to_string_pretty(&credential)?);
        }
        Commands::Servers { action } => manage_servers(action)?,
    }

    Ok(())
}

/// Returns whether every server came back `Connection Complete`.
async fn run_probe(args: ProbeArgs, config: &Config) -> Result<bool> {
    let uris = if args.servers.is_empty() {
        config.servers.clone()
    } else {
        args.servers.clone()
    };
    if uris.is_empty() {
        bail!("No servers given and none configured (see `turn-probe servers add`)");
    }
    let servers = probe::parse_servers(&uris)?;

    let provider = credential_provider(&args, config)?;
    let engine = UdpGatherer::new();

    let mut orchestrator = Orchestrator::new(provider.as_ref(), &engine)
        .with_batch_timeout(args.batch_timeout.map(Duration::from_secs).or(config.batch_timeout()));
    if let Some(timeout) = args.timeout.map(Duration::from_secs).or(config.server_timeout()) {
        orchestrator = orchestrator.with_server_timeout(timeout);
    }

    let report = orchestrator.run(&servers).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for line in report.messages() {
            println!("{}", line);
        }
        for (_, error) in report.errors() {
            println!("{}", error);
        }
    }

    Ok(report.all_succeeded())
}

/// Pick the credential source: flags first, then the configured endpoint.
fn credential_provider(args: &ProbeArgs, config: &Config) -> Result<Box<dyn CredentialProvider>> {
    if let (Some(username), Some(password)) = (&args.username, &args.password) {
        return Ok(Box::new(StaticCredentials::new(Credential::new(
            username.as_str(),
            password.as_str(),
        ))));
    }

    if let Some(secret) = &args.secret {
        let identity = args
            .identity
            .clone()
            .or_else(|| config.identity.clone())
            .unwrap_or_else(|| DEFAULT_IDENTITY.to_string());
        return Ok(Box::new(CredentialIssuer::new(secret.as_str(), identity)?));
    }

    match args.credentials_url.as_ref().or(config.credentials_url.as_ref()) {
        Some(url) => Ok(Box::new(HttpCredentials::new(url)?)),
        None => bail!(
            "No credential source: pass --credentials-url, --username/--password or --secret"
        ),
    }
}

fn manage_servers(action: ServersAction) -> Result<()> {
    let mut config = Config::load()?;

    match action {
        ServersAction::List => {
            if config.servers.is_empty() {
                println!("No servers configured");
            }
            for server in &config.servers {
                println!("{}", server);
            }
            return Ok(());
        }
        ServersAction::Add { uri } => {
            if !config.add_server(&uri)? {
                println!("{} is already configured", uri.trim());
                return Ok(());
            }
        }
        ServersAction::Remove { uri } => {
            if !config.remove_server(&uri) {
                bail!("{} is not configured", uri.trim());
            }
        }
        ServersAction::Clear => config.servers.clear(),
    }

    config.save()?;
    tracing::info!("Saved {} server(s) to {}", config.servers.len(), Config::config_path()?.display());
    Ok(())
}
