use std::io;
use std::process::ExitStatus;

use crate::config::ConfigError;

/// Failure of a certbot invocation. The message always carries the exact
/// command line so an operator can rerun it by hand.
#[derive(Debug, thiserror::Error)]
pub enum IssuanceError {
    #[error("Command failed to start: {invocation}: {source}")]
    Spawn {
        invocation: String,
        #[source]
        source: io::Error,
    },

    #[error("Command failed: {invocation} ({status})")]
    Failed {
        invocation: String,
        status: ExitStatus,
    },

    #[error("Command failed: {invocation} (exit status unavailable)")]
    Lost { invocation: String },
}

/// Misuse of, or failure to control, the proxy server process.
#[derive(Debug, thiserror::Error)]
pub enum ServerControlError {
    #[error("proxy server has not been started")]
    NotStarted,

    #[error("failed to start proxy server: {0}")]
    Spawn(#[source] io::Error),

    #[error("proxy server exited before accepting connections")]
    ExitedBeforeReady,

    #[error("failed to signal proxy server: {0}")]
    Signal(#[from] nix::Error),
}

/// Failure to render or persist a proxy configuration artifact.
#[derive(Debug, thiserror::Error)]
pub enum ProxyConfigError {
    #[error("Template rendering error: {0}")]
    Template(#[from] tera::Error),

    #[error("IO error writing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Issuance(#[from] IssuanceError),

    #[error(transparent)]
    ServerControl(#[from] ServerControlError),

    #[error(transparent)]
    ProxyConfig(#[from] ProxyConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}
