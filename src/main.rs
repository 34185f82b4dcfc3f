//! Router Broker
//!
//! Serves the request router over REST: routers are created on resources
//! handed out by the configured allocation policy and dispatched to the
//! backend their binding names.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use router_broker::{
    ApiServer, BackendFactory, BrokerConfig, BrokerMetrics, PluginRegistry, PolicyManager,
    RequestRouter, ResourceBroker, Result, SqliteBindingStore,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Router Broker - Multi-backend resource broker and request router
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "ROUTER_BROKER_CONFIG")]
    config: Option<PathBuf>,

    /// REST API bind address (overrides the configuration file)
    #[arg(long, env = "API_ADDR")]
    api_addr: Option<String>,

    /// Binding store URL (overrides the configuration file)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => BrokerConfig::from_file(path)?,
        None => BrokerConfig::default(),
    };
    if let Some(addr) = &args.api_addr {
        config.api.bind_addr = addr.clone();
    }
    if let Some(url) = &args.database_url {
        config.store.database_url = url.clone();
    }
    config.validate()?;

    info!("Starting Router Broker");
    info!("  Version: {}", router_broker::VERSION);
    info!("  REST API: {}", config.api.bind_addr);
    info!("  Binding store: {}", config.store.database_url);

    // Binding store
    let store = Arc::new(SqliteBindingStore::connect(&config.store).await?);

    // Allocation policy
    let policy = PolicyManager::from_config(&config.policy)?;

    // Backend plugins
    let registry = Arc::new(PluginRegistry::from_config(&config.plugins, &BackendFactory)?);

    let broker = Arc::new(ResourceBroker::new(policy, store, BrokerMetrics::new()?));
    let router = Arc::new(RequestRouter::new(broker, registry));

    let api_server = ApiServer::new(config.api.clone(), router);
    api_server.run().await?;

    info!("Router Broker shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "sqlx=warn", "tower_http=info", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
