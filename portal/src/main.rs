use clap::{Parser, Subcommand};
use portal::config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "portal", about = "Data upload and analysis portal")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the HTTP server.
    Serve {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Load and validate the configuration, then print it.
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not render config: {0}")]
    Render(#[from] serde_yaml::Error),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    Run(#[from] portal::RunError),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        CliCommand::Serve { config } => serve(config),
        CliCommand::CheckConfig { config } => check_config(config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "portal exited with an error");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn check_config(path: Option<PathBuf>) -> Result<(), CliError> {
    let config = Config::load(path.as_deref())?;
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

fn serve(path: Option<PathBuf>) -> Result<(), CliError> {
    let config = Config::load(path.as_deref())?;
    let _sentry = init_logging(config.logging.as_ref());

    if let Some(metrics) = &config.metrics {
        init_statsd(metrics)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(portal::run(config))?;
    Ok(())
}

/// Installs the log subscriber. The returned guard flushes Sentry on drop.
fn init_logging(logging: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let guard = logging.map(|l| {
        sentry::init((
            l.sentry_dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .init();

    guard
}

fn init_statsd(config: &MetricsConfig) -> Result<(), CliError> {
    let recorder =
        metrics_exporter_statsd::StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port)
            .build(Some("portal"))
            .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;

    shared::metrics_defs::describe_metrics(portal::metrics_defs::ALL_METRICS);
    shared::metrics_defs::describe_metrics(cloud::metrics_defs::ALL_METRICS);
    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "statsd metrics enabled"
    );
    Ok(())
}
