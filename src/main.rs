//! leproxy: certificate lifecycle for an nginx reverse proxy.
//!
//! This is the application entry point. It initializes tracing, reads the
//! environment settings and optional configuration file, wires nginx, certbot
//! and the process registry into the orchestrator, and runs it until nginx
//! exits or a termination signal arrives.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use leproxy::certificate::CertificateStore;
use leproxy::config::{AppConfig, ConfigError, Settings, DEFAULT_LOG_FILTER};
use leproxy::issuer::Certbot;
use leproxy::orchestrator::Orchestrator;
use leproxy::process::ProcessRegistry;
use leproxy::proxy::NginxServer;
use leproxy::shutdown::ShutdownSignals;
use leproxy::AppError;

/// leproxy: Let's Encrypt certificates for an nginx reverse proxy
#[derive(Parser, Debug)]
#[command(name = "leproxy", version, about)]
struct Args {
    /// Path to an optional configuration file overriding paths and commands
    #[arg(short, long)]
    config: Option<String>,

    /// Log level filter (e.g., "leproxy=debug")
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log format: "text" or "json"
    #[arg(long)]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => AppConfig::load(path),
        None => Ok(AppConfig::default()),
    };

    // Initialize tracing with priority: CLI > env > default
    let log_filter = args
        .log_level
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    let log_format = args.log_format.unwrap_or_else(|| match &config {
        Ok(config) => config.logging.format.clone(),
        Err(_) => leproxy::config::DEFAULT_LOG_FORMAT.to_string(),
    });
    init_tracing(&log_filter, &log_format);

    match run(config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(filter: &str, format: &str) {
    let registry =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(filter));

    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run(config: Result<AppConfig, ConfigError>) -> Result<ExitCode, AppError> {
    let config = config?;
    // Validated before anything is spawned.
    let settings = Arc::new(Settings::from_env()?);

    tracing::info!(
        domain = %settings.domain,
        email = %settings.email,
        server = ?settings.server,
        staging = settings.staging,
        debug = settings.debug,
        "Loaded configuration"
    );

    let mut signals = ShutdownSignals::install()
        .map_err(|e| AppError::Internal(format!("failed to install signal handlers: {}", e)))?;

    let registry = ProcessRegistry::new();
    // Kills every tracked child exactly once, however this function exits.
    let _cleanup = registry.cleanup_guard();

    let proxy = NginxServer::new(&config, registry.clone())?;
    let issuer = Certbot::new(
        Arc::clone(&settings),
        config.certbot.program.clone(),
        registry.clone(),
    );
    let orchestrator = Orchestrator::new(
        settings,
        Arc::new(issuer),
        Arc::new(proxy),
        CertificateStore::new(&config.paths.letsencrypt_dir),
        config.renewal.interval(),
    );

    tokio::select! {
        result = orchestrator.run() => {
            let exit = result?;
            if exit.success() {
                tracing::info!("nginx exited, shutting down");
                Ok(ExitCode::SUCCESS)
            } else {
                tracing::error!(status = ?exit.status, "nginx exited with failure");
                Ok(ExitCode::FAILURE)
            }
        }
        name = signals.recv() => {
            tracing::info!(signal = name, "received termination signal, shutting down");
            Ok(ExitCode::SUCCESS)
        }
    }
}
