//! CephFS Provisioner
//!
//! Runs the provisioning controller in standalone mode against an in-memory
//! cluster seeded from the command line. The API server exposes the
//! controller operations next to health, readiness and metrics.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cephfs_provisioner::{
    ApiServer, ApiServerConfig, ControllerConfig, ControllerServer, Error, InMemoryCluster,
    MappingSource, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// CephFS Provisioner - idempotent subvolume and snapshot provisioning
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Controller instance ID, suffix of the journal directory objects
    #[arg(long, env = "INSTANCE_ID", default_value = "default")]
    instance_id: String,

    /// Path of the disaster-recovery cluster mapping file
    #[arg(long, env = "CLUSTER_MAPPING")]
    cluster_mapping: Option<PathBuf>,

    /// API server (operations, health, readiness, metrics) bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8080")]
    api_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Prefix of generated subvolume names
    #[arg(long, env = "VOLUME_PREFIX", default_value = "csi-vol-")]
    volume_prefix: String,

    /// Prefix of generated snapshot names
    #[arg(long, env = "SNAPSHOT_PREFIX", default_value = "csi-snap-")]
    snapshot_prefix: String,

    /// Cluster ID of the standalone cluster
    #[arg(long, env = "CLUSTER_ID", default_value = "standalone")]
    cluster_id: String,

    /// Filesystem of the standalone cluster
    #[arg(long, env = "FS_NAME", default_value = "cephfs")]
    fs_name: String,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    info!("Starting CephFS Provisioner");
    info!("  Version: {}", cephfs_provisioner::VERSION);
    info!("  Instance: {}", args.instance_id);
    info!("  API: {}", args.api_addr);
    info!(
        "  Cluster mapping: {}",
        args.cluster_mapping
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".to_string())
    );

    // Seed the standalone cluster
    let cluster = InMemoryCluster::new();
    let metadata_pool = format!("{}.meta", args.fs_name);
    cluster.add_filesystem(&args.cluster_id, &args.fs_name, &metadata_pool, 1);
    cluster.add_pool(&args.cluster_id, &format!("{}.data", args.fs_name), 2);
    info!(
        "Standalone cluster {} with filesystem {}",
        args.cluster_id, args.fs_name
    );

    let config = ControllerConfig {
        instance_id: args.instance_id.clone(),
        volume_name_prefix: args.volume_prefix.clone(),
        snapshot_name_prefix: args.snapshot_prefix.clone(),
        mapping: args
            .cluster_mapping
            .clone()
            .map(MappingSource::File)
            .unwrap_or_default(),
        ..Default::default()
    };
    let controller = Arc::new(ControllerServer::new(config, cluster.clone(), cluster)?);
    info!("Controller initialized");

    let api_config = ApiServerConfig {
        addr: args.api_addr.parse().map_err(|e| {
            Error::Configuration(format!("Invalid API address: {}", e))
        })?,
    };
    let server = Arc::new(ApiServer::new(api_config, controller));
    server.set_ready(true);

    let signal_server = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal_server.shutdown();
    });

    server.run().await?;

    info!("Provisioner shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "tower=warn", "tower_http=info", "axum=info"] {
        filter = filter.add_directive(directive.parse().map_err(|e| {
            Error::Configuration(format!("Invalid log directive {}: {}", directive, e))
        })?);
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

    Ok(())
}
