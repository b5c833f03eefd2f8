//! Docket host: runs the example factory until interrupted.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::info;

use docket_server::service::domain::{example_factory, EXAMPLE_FACTORY_LINK};
use docket_server::storage::{open_store, StoreBackend};
use docket_server::{HostConfig, ServiceHost};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "docket-host", about = "Path-addressed document service host")]
struct Args {
    /// Identifier reported in logs.
    #[arg(long, env = "DOCKET_HOST_ID", default_value = "docket-host")]
    host_id: String,

    /// redb file for durable documents; in-memory when absent.
    #[arg(long, env = "DOCKET_STORE_PATH")]
    store_path: Option<PathBuf>,

    /// Read persistent state from the store on every access.
    #[arg(long, env = "DOCKET_NO_STATE_CACHING")]
    no_state_caching: bool,

    /// Deadline for operations that carry none.
    #[arg(long, env = "DOCKET_OPERATION_TIMEOUT_MS", default_value_t = 30_000)]
    operation_timeout_ms: u64,

    #[arg(long, env = "DOCKET_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("docket_server=info,docket_host=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let backend = args
        .store_path
        .clone()
        .map_or(StoreBackend::Memory, |path| StoreBackend::Redb { path });
    let store = open_store(&backend).await?;

    let config = HostConfig {
        host_id: args.host_id,
        default_operation_timeout_ms: args.operation_timeout_ms,
        service_state_caching: !args.no_state_caching,
        ..HostConfig::default()
    };
    let host = ServiceHost::builder(config).store(store).build();
    host.start().await?;
    host.start_factory(EXAMPLE_FACTORY_LINK, example_factory())?;
    info!(factory = EXAMPLE_FACTORY_LINK, "host ready");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    host.shutdown().await;
    Ok(())
}
