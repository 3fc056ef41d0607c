//! Booster accelerator server binary.
//!
//! # Usage
//!
//! ```bash
//! booster-server --bind 0.0.0.0:7420 --cache-dir /var/cache/booster
//! ```

use std::path::PathBuf;

use booster_server::{DriverConfig, Server, ServerRuntimeConfig};
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Booster accelerator protocol server.
#[derive(Parser, Debug)]
#[command(name = "booster-server")]
#[command(about = "Booster client/server coordination core server")]
#[command(version)]
struct Args {
    /// Address to bind to.
    #[arg(short, long, default_value = "0.0.0.0:7420")]
    bind: String,

    /// Directory cache artifacts are stored under.
    #[arg(long, default_value = "/var/cache/booster")]
    cache_dir: PathBuf,

    /// Maximum concurrent connections.
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Session idle timeout before eviction, in seconds.
    #[arg(long, default_value = "300")]
    session_timeout_secs: u64,

    /// Unused-program timeout before eviction, in seconds.
    #[arg(long, default_value = "600")]
    program_timeout_secs: u64,

    /// Consecutive heartbeat misses tolerated before a daemon stream is
    /// evicted.
    #[arg(long, default_value = "4")]
    max_heartbeat_misses: u32,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("booster-server starting");
    tracing::info!(bind = %args.bind, "binding");

    let bind_address = args.bind.parse()?;
    let driver = DriverConfig {
        session_no_ref_timeout_secs: args.session_timeout_secs,
        unused_shared_data_timeout_secs: args.program_timeout_secs,
        max_heartbeat_misses: args.max_heartbeat_misses,
        ..DriverConfig::default()
    };

    let config = ServerRuntimeConfig {
        bind_address,
        cache_dir: args.cache_dir,
        max_connections: args.max_connections,
        driver,
    };

    let server = Server::bind(config)?;
    tracing::info!(addr = %server.local_addr()?, "listening");

    server.run().await;

    Ok(())
}
