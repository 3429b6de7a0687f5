//! API Provider Node
//!
//! Commands:
//! - run: register APIs with every aggregator, heartbeat, serve the status API
//! - address: print the node's public address
//! - check-config: validate the configuration and exit

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use provider_common::{Identity, NodeConfig};
use provider_ledger::{open_store, QueueSweeper};
use provider_node::{config, create_router, AppState, JobRunner};
use provider_registrar::{HttpAggregatorClient, MultiaddrSource, Registrar, StaticMultiaddrs};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "provider-node")]
#[command(about = "Pay-per-call API provider node", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "PROVIDER_CONFIG", default_value = "./config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register with aggregators and serve until interrupted
    Run,

    /// Print the public address derived from the configured private key
    Address,

    /// Validate the configuration file
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before clap reads PROVIDER_CONFIG
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "info,provider_node=debug,provider_registrar=debug,provider_ledger=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = config::load(&cli.config)?;

    match cli.command {
        Commands::Run => run(config).await?,
        Commands::Address => {
            let identity = load_identity(&config)?;
            println!("{}", identity.public_address());
        }
        Commands::CheckConfig => check_config(&config)?,
    }

    Ok(())
}

/// Derive the node identity; any failure stops startup
fn load_identity(config: &NodeConfig) -> Result<Identity> {
    let identity = Identity::from_input(&config.wallet.private_key)
        .context("Failed to derive node identity from wallet.privateKey")?;

    if identity.public_address() != config.wallet.address {
        warn!(
            "wallet.address {} does not match derived address {}",
            config.wallet.address,
            identity.public_address()
        );
    }

    Ok(identity)
}

fn check_config(config: &NodeConfig) -> Result<()> {
    let identity = load_identity(config)?;

    println!("Configuration OK");
    println!("  Address:     {}", identity.public_address());
    println!("  Aggregators: {}", config.aggregators.len());
    println!("  Token:       {} ({})", config.token.symbol, config.token.mint);
    println!("  Network:     {}", config.solana.network);
    if let Some(provider) = &config.provider {
        println!("  APIs:        {}", provider.apis.len());
        println!("  Ledger:      {} ({})", provider.database.kind, provider.database.path.display());
        println!("  HTTP:        {}", if provider.http_enabled() { "enabled" } else { "disabled" });
        println!("  P2P:         {}", if provider.p2p.enabled { "enabled" } else { "disabled" });
    }

    Ok(())
}

async fn run(config: NodeConfig) -> Result<()> {
    info!("Starting API provider node");

    let identity = Arc::new(load_identity(&config)?);
    info!("Provider address: {}", identity.public_address());

    let provider = config
        .provider
        .clone()
        .context("provider section is required to run a node")?;

    let store = open_store(&provider.database)
        .await
        .context("Failed to open ledger store")?;

    let p2p: Option<Arc<dyn MultiaddrSource>> = if provider.p2p.enabled {
        Some(Arc::new(StaticMultiaddrs(provider.p2p.multiaddrs.clone())))
    } else {
        None
    };

    let registrar = Arc::new(Registrar::new(
        &config,
        identity.clone(),
        Arc::new(provider.apis.clone()),
        p2p,
        Arc::new(HttpAggregatorClient::new()),
    )?);

    let report = registrar.register_all().await;
    if report.all_failed() {
        anyhow::bail!(
            "Registration failed with every aggregator ({} attempt(s)); node is unreachable",
            report.failed_count()
        );
    }
    info!(
        "Registration complete: {} registered, {} failed",
        report.registered_count(),
        report.failed_count()
    );

    let heartbeat = registrar.start_heartbeat()?;
    let sweeper = QueueSweeper::spawn(store.clone(), provider.queue.sweep_interval());

    let server_task = if provider.http_enabled() {
        tokio::fs::create_dir_all(&provider.results.storage_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create results directory: {}",
                    provider.results.storage_path.display()
                )
            })?;

        let runner = Arc::new(JobRunner::for_provider(&provider, store.clone()));
        info!("API handlers: {:?}", runner.handler_ids());

        let state = AppState {
            store: store.clone(),
            runner,
            registrar: Some(registrar.clone()),
            apis: provider.apis.clone(),
            provider_address: identity.public_address().to_string(),
        };
        let app = create_router(state, &provider.results.storage_path);

        let port = provider.port.context("provider.port is required")?;
        let addr = format!("0.0.0.0:{}", port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        info!("Status API listening on http://{}", addr);

        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Server error: {:#}", e);
            }
        }))
    } else {
        info!("HTTP disabled, status API not started");
        None
    };

    info!("Provider node is running");

    match server_task {
        Some(task) => {
            tokio::select! {
                _ = task => {
                    error!("Server task terminated unexpectedly");
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                }
            }
        }
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            info!("Received shutdown signal");
        }
    }

    heartbeat.stop().await;
    sweeper.stop().await;

    info!("Provider node stopped");
    Ok(())
}
