use clap::Parser;
use link_archiver::{apply_overrides, install_prometheus, setup_logging, Cli, CliRunner, Config, Metrics};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting link-archiver v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;

    // Handles registered before the exporter is installed stay no-ops.
    if let Some(port) = config.metrics_port {
        install_prometheus(port)?;
    }
    let metrics = Arc::new(Metrics::new());

    let runner = CliRunner::new(config, metrics);

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    if let Err(e) = runner.run(args.command, shutdown_rx).await {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("link-archiver stopped");
    Ok(())
}

fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(args.config.as_deref())?;
    apply_overrides(&mut config, args);
    config.validate()?;

    info!("Configuration loaded successfully");
    info!(
        "Backend: {}",
        if config.broker_configured() { "queue" } else { "polling" }
    );
    info!("Workers: {}", config.workers);
    info!("Session pool size: {}", config.session_pool_size);

    Ok(config)
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Failed to create SIGTERM handler: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(());
    })
}
