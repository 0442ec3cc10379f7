//! dnsctx - a plugin-pipeline DNS server built around a per-query context

use anyhow::Result;
use chrono::Local;
use clap::Parser;
use dnsctx::config::Config;
use dnsctx::dns_server::DnsServer;
use rolling_file::{RollingConditionBasic, RollingFileAppender};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// log timestamps in local time instead of UTC
struct LocalTimer;
impl fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

#[derive(Parser, Debug)]
#[command(name = "dnsctx")]
#[command(about = "A plugin-pipeline DNS server", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "Corefile")]
    config: String,

    #[arg(long, default_value = "0.0.0.0:53")]
    address: String,

    /// Directory for the daily rolling log file.
    #[arg(long, default_value = "logs")]
    log_dir: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cores)
        .thread_name("dnsctx-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, cores))
}

fn init_logging(log_dir: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = RollingFileAppender::new(
        format!("{}/dnsctx.log", log_dir),
        RollingConditionBasic::new().daily(),
        30,
    )?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false).with_timer(LocalTimer))
        .with(fmt::layer().with_writer(std::io::stdout).with_timer(LocalTimer))
        .init();
    Ok(guard)
}

async fn async_main(args: Args, cores: usize) -> Result<()> {
    let _guard = init_logging(&args.log_dir)?;
    info!("Starting dnsctx version {} on {} worker threads", env!("CARGO_PKG_VERSION"), cores);

    let cfg = Config::load(&args.config)?;
    for zone in &cfg.zones {
        info!("Zone: {} loaded with plugins {:?}", zone.name, zone.pipeline.names());
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    DnsServer::new(cfg).run(&args.address, shutdown_rx).await
}
