//! WolfCollective - Collective Membership for Management Servers
//!
//! Runs one collective member: the TLS listener other members connect to,
//! the collective manager and the local admin API.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfcollective::api::HttpServer;
use wolfcollective::collective::Collective;
use wolfcollective::config::{CollectiveConfig, LoggingConfig};
use wolfcollective::error::Result;
use wolfcollective::identity::NameCache;
use wolfcollective::network::{CollectiveServer, TlsTransport};
use wolfcollective::rebalance::StoreInventory;
use wolfcollective::store::{ConfigStore, MemoryStore};

/// WolfCollective - Collective Membership for Management Servers
#[derive(Parser)]
#[command(name = "wolfcollective")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/wolfcollective/wolfcollective.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the collective member
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfcollective.toml")]
        output: PathBuf,

        /// Member name
        #[arg(long, default_value = "mgt1")]
        name: String,
    },

    /// Validate configuration file
    Validate,

    /// Show member information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = CollectiveConfig::from_file(&cli.config)?;
            init_logging(&config.logging, cli.log_level.as_deref())?;
            run_start(config).await
        }
        Commands::Init { output, name } => run_init(output, name),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(config: &LoggingConfig, level: Option<&str>) -> Result<()> {
    let level = level.unwrap_or(&config.level);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let writer = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
        None => tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::io::stdout),
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(writer))
            .init();
    }
    Ok(())
}

/// Start the collective member
async fn run_start(config: CollectiveConfig) -> Result<()> {
    tracing::info!("Starting WolfCollective member...");

    if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
        tracing::error!("Failed to create data directory {:?}: {}", config.data_dir(), e);
        return Err(e.into());
    }

    let transport = match TlsTransport::from_files(
        &config.tls.certificate,
        &config.tls.private_key,
        config.node.port,
        config.collective.connect_timeout(),
    ) {
        // Outbound sessions leave from the listen address unless it is a wildcard
        Ok(t) => match config.node.bind_address.parse::<IpAddr>() {
            Ok(ip) if !ip.is_unspecified() => Arc::new(t.with_source(ip)),
            _ => Arc::new(t),
        },
        Err(e) => {
            tracing::error!("Failed to load TLS material: {}", e);
            return Err(e);
        }
    };
    let identity = transport.identity();
    tracing::info!("Certificate fingerprint: {}", identity.fingerprint);

    let name = NameCache::new(config.node.name_file.clone(), config.collective.name_cache_ttl());
    if let Some(configured) = &config.node.name {
        name.set(configured).await?;
    }

    let store: Arc<dyn ConfigStore> = match MemoryStore::open(config.store_path()).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!("Failed to open configuration store {:?}: {}", config.store_path(), e);
            return Err(e);
        }
    };
    tracing::info!(
        "Configuration store opened at transaction {} with {} members",
        store.txcount().await,
        store.members().await.len()
    );

    let inventory = Arc::new(StoreInventory::new(Arc::clone(&store)));
    let collective = Collective::new(
        name,
        identity,
        Arc::clone(&store),
        transport.clone(),
        inventory,
        config.collective.clone(),
    );
    tracing::info!("Member name: {}", collective.myname().await);

    let server = CollectiveServer::new(
        config.listen_address(),
        Arc::clone(&transport),
        collective.clone(),
    );
    let http_server = HttpServer::new(config.api.clone(), Arc::clone(&collective));

    collective.startup().await;

    tokio::select! {
        result = server.start() => {
            if let Err(e) = result {
                tracing::error!("Collective server error: {}", e);
            }
        }
        result = http_server.start(), if config.api.enabled => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    server.stop();
    collective.shutdown().await;
    Ok(())
}

/// Initialize a configuration file
fn run_init(output: PathBuf, name: String) -> Result<()> {
    std::fs::write(&output, CollectiveConfig::template(&name))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to point at this member's certificate and key.");
    println!("Then start with: wolfcollective --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match CollectiveConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Member Name: {}", config.node.name.as_deref().unwrap_or("(from name file)"));
            println!("  Listen Address: {}", config.listen_address());
            println!("  Certificate: {}", config.tls.certificate.display());
            println!("  Admin API: {}", config.api.bind_address);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show member information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = CollectiveConfig::from_file(&config_path)?;
    let protocol = &config.collective;

    println!("WolfCollective Member Information");
    println!("=================================");
    println!();
    println!("Member Name:      {}", config.node.name.as_deref().unwrap_or("(from name file)"));
    println!("Name File:        {}", config.node.name_file.display());
    println!("Listen Address:   {}", config.listen_address());
    println!("Data Directory:   {}", config.data_dir().display());
    println!("Store:            {}", config.store_path().display());
    println!();
    println!("TLS:");
    println!("  Certificate:    {}", config.tls.certificate.display());
    println!("  Private Key:    {}", config.tls.private_key.display());
    println!();
    println!("Collective Protocol:");
    println!("  Connect:        {} ms", protocol.connect_timeout_ms);
    println!("  Stream Idle:    {} s", protocol.stream_idle_timeout_secs);
    println!("  Keepalive:      {} s", protocol.keepalive_interval_secs);
    println!("  Dial Pool:      {}", protocol.max_concurrent_dials);
    println!("  Retry:          {} ms + up to {} ms", protocol.retry_base_delay_ms, protocol.retry_jitter_ms);
    println!();
    println!("Admin API:        {} ({})", config.api.bind_address, if config.api.enabled { "enabled" } else { "disabled" });

    Ok(())
}
