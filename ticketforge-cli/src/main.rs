//! Ticketforge CLI
//!
//! Command-line interface for acquiring Kerberos service tickets.
//!
//! # Usage
//!
//! ```bash
//! # Print a base64 negotiation token for a service
//! ticketforge ticket HTTP/intranet.example.com
//!
//! # Print a ready-made Authorization header value for a configured name
//! ticketforge ticket intranet --header
//!
//! # Show the platform backend and local credential
//! ticketforge status
//!
//! # List configured service identities
//! ticketforge spns
//! ```

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use ticketforge_core::{
    NamedSpn, Session, TicketBroker, TicketforgeConfig, TokenCache,
};
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt};

/// Environment variable naming the identity used when none is given.
const SPN_ENV: &str = "KRB5_SPN";

#[derive(Parser)]
#[command(name = "ticketforge")]
#[command(about = "Kerberos service tickets for HTTP Negotiate authentication")]
#[command(version)]
struct Cli {
    /// Enable step-by-step diagnostics
    #[arg(short, long, global = true)]
    debug: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire a service ticket and print it
    Ticket {
        /// Service principal (HTTP/host or HTTP@host) or configured name.
        /// Defaults to $KRB5_SPN.
        spn: Option<String>,

        /// Print the Authorization header value instead of the bare token
        #[arg(long)]
        header: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Show the platform backend, default principal and credential cache
    Status {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// List configured service identities
    Spns,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let mut config = TicketforgeConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if cli.debug {
        config.debug = true;
    }
    debug!(path = ?config.config_path, "configuration loaded");

    match cli.command {
        Commands::Ticket { spn, header, format } => {
            let query = spn.or_else(|| std::env::var(SPN_ENV).ok());
            ticket(&config, query.as_deref(), header, format).await
        }
        Commands::Status { format } => status(&config, format).await,
        Commands::Spns => {
            list_spns(&config);
            Ok(())
        }
    }
}

/// Resolve the requested identity against the configuration.
fn resolve_spn(config: &TicketforgeConfig, query: Option<&str>) -> Result<NamedSpn> {
    let query = query
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| anyhow!("No service principal given and {} is not set", SPN_ENV))?;
    config
        .find_spn(query)
        .with_context(|| format!("Failed to resolve service principal {:?}", query))
}

async fn ticket(
    config: &TicketforgeConfig,
    query: Option<&str>,
    header: bool,
    format: Format,
) -> Result<()> {
    let named = resolve_spn(config, query)?;
    let broker = TicketBroker::native(
        TokenCache::with_sweep_interval(config.sweep_interval()),
        config.broker_settings(),
    );
    let session = Session::new();

    let token = broker
        .select(&session, named.spn.clone(), Some(named.name.clone()))
        .await
        .with_context(|| format!("Failed to acquire ticket for {}", named.spn))?;
    broker.cache().shutdown();

    let value = if header {
        session
            .authorization_header()
            .context("Session holds no token after refresh")?
    } else {
        token.encoded.clone()
    };

    match format {
        Format::Json => {
            let out = serde_json::json!({
                "name": named.name,
                "spn": token.spn.as_str(),
                "token": token.encoded.expose(),
                "header": header.then(|| value.expose()),
                "length": token.len,
                "obtained_at": token.obtained_at.to_rfc3339(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Format::Text => println!("{}", value.expose()),
    }
    Ok(())
}

async fn status(config: &TicketforgeConfig, format: Format) -> Result<()> {
    let broker = TicketBroker::native(
        TokenCache::with_sweep_interval(std::time::Duration::ZERO),
        config.broker_settings(),
    );
    let status = broker
        .status()
        .await
        .context("Failed to query the credential backend")?;

    match format {
        Format::Json => {
            let out = serde_json::json!({
                "platform": status.platform.label(),
                "supported": status.platform.is_supported(),
                "cache": status.cache_location,
                "principal": status.principal.as_ref().ok(),
                "error": status.principal.as_ref().err(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Format::Text => {
            println!("Platform:  {}", status.platform.label());
            println!("Cache:     {}", status.cache_location);
            match &status.principal {
                Ok(principal) => println!("Principal: {}", principal),
                Err(e) => println!("Principal: unavailable ({})", e),
            }
        }
    }
    Ok(())
}

fn list_spns(config: &TicketforgeConfig) {
    if config.spns.is_empty() {
        println!("No service principals configured");
        return;
    }
    println!("Configured service principals:");
    for entry in &config.spns {
        if entry.name == entry.spn {
            println!("  {}", entry.spn);
        } else {
            println!("  {:<20} {}", entry.name, entry.spn);
        }
    }
}
