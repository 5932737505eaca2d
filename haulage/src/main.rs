use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use haulage::capture::{PacketSource, PcapSource};
use haulage::config::Config;
use haulage::effector::ShellEffector;
use haulage::error::StartupError;
use haulage::store::MySqlStore;
use haulage::supervisor::Supervisor;
use tracing::{error, info, warn};

/// `haulage` — in-line traffic accountant and prepaid-balance enforcer.
#[derive(Parser, Debug)]
#[command(name = "haulage", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/haulage/config.yml")]
    config: String,

    /// Raise the default log level one notch (info -> debug) without
    /// needing RUST_LOG.
    #[arg(short, long)]
    verbose: bool,
}

/// Name of the `nft`/`iptables`-style utility the shell effector invokes
/// (§6: "the reference implementation uses the kernel forwarding chain's
/// reject rule scoped to the subscriber source IP").
const FILTER_UTILITY: &str = "haulage-filter";

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal startup error");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "haulage=debug" } else { "haulage=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("HAULAGE_LOG")
                .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

async fn run(cli: Cli) -> Result<(), StartupError> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting haulage");

    let config = Config::from_file(&cli.config)?;
    let classifier = config.build_classifier().map_err(StartupError::Config)?;

    let pool = haulage::db::init(&config.database_url()).await?;
    info!("connected to persistence backend");
    let store: Arc<dyn haulage::store::Store> = Arc::new(MySqlStore::new(pool));

    let effector: Arc<dyn haulage::effector::PacketFilterEffector> =
        Arc::new(ShellEffector::new(FILTER_UTILITY));

    let (supervisor, status_rx) = Supervisor::new(
        store,
        effector,
        classifier,
        config.flow_log_interval,
        config.user_log_interval,
        config.custom.reenable_poll_interval,
    );

    // Startup reconciliation: the kernel filter table persists across
    // restarts, so it must be made to match the persisted `bridged`
    // column before any traffic is forwarded (§4.5).
    if let Err(e) = supervisor.reconcile_startup_state().await {
        error!(error = %e, "startup reconciliation failed, continuing with existing filter state");
    }

    supervisor.start_enforcement(status_rx);

    let source: Box<dyn PacketSource> = Box::new(
        PcapSource::open(&config.interface).map_err(|e| StartupError::CaptureOpen(e.to_string()))?,
    );
    info!(interface = %config.interface, "capture source open");

    let shutdown_tx = supervisor.shutdown_signal();
    let ingress = tokio::spawn(supervisor.clone().run_ingress_loop(source, shutdown_tx.subscribe()));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining in-flight work");
    let _ = shutdown_tx.send(());

    tokio::select! {
        result = ingress => {
            if let Err(e) = result {
                warn!(error = %e, "ingress task did not join cleanly");
            }
        }
        _ = wait_for_shutdown_signal() => {
            warn!("second shutdown signal received, aborting — connections may be orphaned");
        }
    }

    info!("haulage stopped cleanly");
    Ok(())
}

/// Wait for either SIGINT or SIGTERM. Called a second time during drain so
/// a second signal can abort immediately per §4.8.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
