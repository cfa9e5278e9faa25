mod config;
mod stub_server;

use clap::{Args, Parser, Subcommand};
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const METRICS_PREFIX: &str = "sentrytunnel";

#[derive(Parser)]
#[command(name = "sentrytunnel", version, about = "Relays Sentry envelopes from browsers to their upstream")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the tunnel
    Run(RunArgs),
    /// Run a local stand-in for an upstream ingestion service
    StubServer(StubServerArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long)]
    config_file_path: PathBuf,
}

#[derive(Args, Debug)]
struct StubServerArgs {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(long, default_value_t = 9000)]
    port: u16,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Tunnel(#[from] tunnel::errors::TunnelError),
    #[error("invalid log filter: {0}")]
    LogFilter(#[from] tracing_subscriber::filter::ParseError),
    #[error("failed to set up statsd: {0}")]
    Statsd(#[from] metrics_exporter_statsd::StatsdError),
    #[error("failed to install metrics recorder")]
    MetricsRecorder,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn main() -> Result<(), CliError> {
    let cli = Cli::parse();

    match cli.command {
        CliCommand::Run(args) => run_tunnel(args),
        CliCommand::StubServer(args) => run_stub_server(args),
    }
}

fn run_tunnel(args: RunArgs) -> Result<(), CliError> {
    let config = config::Config::from_file(&args.config_file_path)?;

    // Keep the guard alive for the lifetime of the process so events flush on exit
    let _sentry = config.logging.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });
    init_tracing(&config.logging.level)?;

    if let Some(metrics) = &config.metrics {
        let recorder = StatsdBuilder::from(metrics.statsd_host.as_str(), metrics.statsd_port)
            .build(Some(METRICS_PREFIX))?;
        metrics::set_global_recorder(recorder).map_err(|_| CliError::MetricsRecorder)?;
        tracing::info!(
            host = %metrics.statsd_host,
            port = metrics.statsd_port,
            "sending metrics to statsd"
        );
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(tunnel::run(config.tunnel, shutdown_signal()))?;
    Ok(())
}

fn run_stub_server(args: StubServerArgs) -> Result<(), CliError> {
    init_tracing("info")?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(stub_server::run(&args.host, args.port, shutdown_signal()))?;
    Ok(())
}

fn init_tracing(default_level: &str) -> Result<(), CliError> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) if !value.is_empty() => EnvFilter::try_new(value)?,
        _ => EnvFilter::try_new(default_level)?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry::integrations::tracing::layer())
        .init();
    Ok(())
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
