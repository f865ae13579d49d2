//! kubelb-dns - authoritative DNS for Kubernetes LoadBalancer services

pub mod config;
pub mod dns_server;
pub mod dnsutil;
pub mod plugin;
pub mod types;
pub mod wire;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use chrono::Local;
use rolling_file::{RollingConditionBasic, RollingFileAppender};

// log timestamps in local time instead of UTC
struct LocalTimer;
impl fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

#[derive(Parser, Debug)]
#[command(name = "kubelb-dns")]
#[command(about = "Serves DNS records for Kubernetes LoadBalancer service addresses", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "Corefile")]
    config: String,

    /// Listen IP; ports come from the server blocks.
    #[arg(long, default_value = "0.0.0.0:53")]
    address: String,
}

fn main() -> Result<()> {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cores)
        .thread_name("kubelb-dns-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cores))
}

async fn async_main(cores: usize) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // rotated at local midnight, 30 days kept
    let file_appender = RollingFileAppender::new(
        "logs/kubelb-dns.log",
        RollingConditionBasic::new().daily(),
        30,
    )?;

    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false).with_timer(LocalTimer))
        .with(fmt::layer().with_writer(std::io::stdout).with_timer(LocalTimer))
        .init();

    let args = Args::parse();
    info!("Starting kubelb-dns version {}", env!("CARGO_PKG_VERSION"));
    info!(">>> Multi-core runtime: {} worker threads", cores);

    let abs_path = std::fs::canonicalize(&args.config)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| args.config.clone());
    info!(">>> Configuration: {}", abs_path);

    let shared = Arc::new(plugin::SharedState::new());
    let cfg = config::Config::load(&abs_path, shared)?;
    for zone_config in &cfg.zones {
        info!("Server block: {} loaded with {} plugins", zone_config.name, zone_config.plugins.len());
    }

    let server = dns_server::DnsServer::new(cfg);
    if let Err(e) = server.start_plugins().await {
        server.stop_plugins();
        return Err(e);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, stopping...");
        shutdown_tx.send_replace(true);
    });

    let result = server.run(&args.address, shutdown_rx).await;
    server.stop_plugins();
    result
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("SIGTERM handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
