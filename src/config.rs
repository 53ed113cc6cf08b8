//! Configuration loading and constants.
//!
//! Two sources feed the process. `Settings` is the environment snapshot
//! (domain, contact email, ACME overrides) read once at startup and shared by
//! reference with every component. `AppConfig` is an optional TOML file that
//! overrides the fixed on-disk layout and the external commands; without it
//! the defaults below describe the stock container image.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use const_format::formatcp;
use serde::Deserialize;

// =============================================================================
// Certificate Layout
// =============================================================================
// The layout under the live directory is owned by certbot. Server configuration
// must reference these exact names.

/// Base directory holding one subdirectory per issued domain
pub const LETSENCRYPT_LIVE_DIR: &str = "/etc/letsencrypt/live";

/// Full certificate chain; its presence means "certificate issued"
pub const FULL_CHAIN: &str = "fullchain.pem";

/// Private key for the certificate
pub const PRIVATE_KEY: &str = "privkey.pem";

/// Intermediate chain used for OCSP stapling verification
pub const CHAIN: &str = "chain.pem";

/// Lifetime of a Let's Encrypt certificate (90 days)
pub const CERTIFICATE_LIFETIME_SECS: u64 = 90 * 86400;

// =============================================================================
// Nginx Layout
// =============================================================================

/// Directory nginx includes site configuration from
pub const NGINX_CONF_DIR: &str = "/etc/nginx/conf.d";

/// Temporary plaintext proxy configuration used while issuing
pub const BOOTSTRAP_CONFIG_PATH: &str = formatcp!("{}/reverse_proxy.conf", NGINX_CONF_DIR);

/// Optional operator-supplied fragments included in the TLS server block
pub const CUSTOM_INCLUDE_DIR: &str = formatcp!("{}/custom", NGINX_CONF_DIR);

/// Diffie-Hellman parameters for DHE cipher suites
pub const DHPARAM_PATH: &str = "/etc/ssl/certs/dhparam.pem";

/// Nginx binary, run in the foreground so the process can be waited on
pub const NGINX_PROGRAM: &str = "nginx";
pub const NGINX_FOREGROUND_ARGS: [&str; 2] = ["-g", "daemon off;"];

/// Address the bootstrap server block listens on
pub const DEFAULT_BOOTSTRAP_LISTEN: &str = "443";

/// Local HTTP target the bootstrap configuration forwards to
pub const DEFAULT_BOOTSTRAP_UPSTREAM: &str = "http://localhost";

/// How long to wait for the readiness probe before opening the gate anyway
pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 10;

/// Interval between readiness probe attempts
pub const READY_PROBE_INTERVAL_MS: u64 = 100;

// =============================================================================
// Certbot
// =============================================================================

/// Certbot binary
pub const CERTBOT_PROGRAM: &str = "certbot";

/// Pre-hook stopping nginx so the standalone responder can bind its port
pub const RENEW_PRE_HOOK: &str = formatcp!("{} -s stop", NGINX_PROGRAM);

/// Delay between renewal cycles (1 hour)
pub const RENEWAL_INTERVAL_SECS: u64 = 3600;

// =============================================================================
// Environment Keys
// =============================================================================

pub const ENV_DOMAIN: &str = "DOMAIN";
pub const ENV_EMAIL: &str = "EMAIL";
pub const ENV_SERVER: &str = "SERVER";
pub const ENV_STAGING: &str = "STAGING";
pub const ENV_DEBUG: &str = "DEBUG";

/// Flag values treated as "disabled" even though the variable is set
const FALSE_FLAG_VALUES: [&str; 4] = ["0", "false", "no", "off"];

// =============================================================================
// Logging
// =============================================================================

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "leproxy=info";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

/// Environment snapshot taken once at process start.
///
/// `domain` and `email` are guaranteed non-empty; a missing value is a
/// [`ConfigError::Missing`] at load time and never a runtime state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub domain: String,
    pub email: String,
    /// Alternate ACME directory URL
    pub server: Option<String>,
    /// Use the Let's Encrypt staging environment
    pub staging: bool,
    /// Verbose certbot tracing and forced renewal
    pub debug: bool,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let domain = non_empty(ENV_DOMAIN).ok_or(ConfigError::Missing(ENV_DOMAIN))?;
        let email = non_empty(ENV_EMAIL).ok_or(ConfigError::Missing(ENV_EMAIL))?;

        Ok(Self {
            domain,
            email,
            server: non_empty(ENV_SERVER),
            staging: non_empty(ENV_STAGING).is_some_and(|v| flag_enabled(&v)),
            debug: non_empty(ENV_DEBUG).is_some_and(|v| flag_enabled(&v)),
        })
    }
}

/// Loopback address reaching an nginx `listen` value such as `443`,
/// `0.0.0.0:8443` or `[::]:443 ssl`.
fn loopback_for_listen(listen: &str) -> Option<SocketAddr> {
    let address = listen.split_whitespace().next()?;
    if let Ok(port) = address.parse::<u16>() {
        return Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    }

    let mut addr: SocketAddr = address.parse().ok()?;
    if addr.ip().is_unspecified() {
        let loopback = match addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        };
        addr.set_ip(loopback);
    }
    Some(addr)
}

fn flag_enabled(value: &str) -> bool {
    !FALSE_FLAG_VALUES
        .iter()
        .any(|f| value.eq_ignore_ascii_case(f))
}

/// File-based configuration. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub nginx: NginxConfig,
    #[serde(default)]
    pub certbot: CertbotConfig,
    #[serde(default)]
    pub renewal: RenewalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// On-disk layout shared with certbot and nginx
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "PathsConfig::default_letsencrypt_dir")]
    pub letsencrypt_dir: PathBuf,
    #[serde(default = "PathsConfig::default_nginx_conf_dir")]
    pub nginx_conf_dir: PathBuf,
    #[serde(default = "PathsConfig::default_bootstrap_config")]
    pub bootstrap_config: PathBuf,
    #[serde(default = "PathsConfig::default_custom_include_dir")]
    pub custom_include_dir: PathBuf,
    #[serde(default = "PathsConfig::default_dhparam")]
    pub dhparam: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            letsencrypt_dir: Self::default_letsencrypt_dir(),
            nginx_conf_dir: Self::default_nginx_conf_dir(),
            bootstrap_config: Self::default_bootstrap_config(),
            custom_include_dir: Self::default_custom_include_dir(),
            dhparam: Self::default_dhparam(),
        }
    }
}

impl PathsConfig {
    fn default_letsencrypt_dir() -> PathBuf {
        PathBuf::from(LETSENCRYPT_LIVE_DIR)
    }
    fn default_nginx_conf_dir() -> PathBuf {
        PathBuf::from(NGINX_CONF_DIR)
    }
    fn default_bootstrap_config() -> PathBuf {
        PathBuf::from(BOOTSTRAP_CONFIG_PATH)
    }
    fn default_custom_include_dir() -> PathBuf {
        PathBuf::from(CUSTOM_INCLUDE_DIR)
    }
    fn default_dhparam() -> PathBuf {
        PathBuf::from(DHPARAM_PATH)
    }
}

/// Nginx process and bootstrap proxy settings
#[derive(Debug, Clone, Deserialize)]
pub struct NginxConfig {
    /// Program followed by its arguments
    #[serde(default = "NginxConfig::default_command")]
    pub command: Vec<String>,
    #[serde(default = "NginxConfig::default_bootstrap_listen")]
    pub bootstrap_listen: String,
    #[serde(default = "NginxConfig::default_bootstrap_upstream")]
    pub bootstrap_upstream: String,
    /// Address polled until nginx accepts connections. Unset probes the
    /// bootstrap listen port on loopback; empty skips the probe.
    #[serde(default)]
    pub ready_probe: Option<String>,
    #[serde(default = "NginxConfig::default_ready_timeout")]
    pub ready_timeout_seconds: u64,
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            command: Self::default_command(),
            bootstrap_listen: Self::default_bootstrap_listen(),
            bootstrap_upstream: Self::default_bootstrap_upstream(),
            ready_probe: None,
            ready_timeout_seconds: Self::default_ready_timeout(),
        }
    }
}

impl NginxConfig {
    fn default_command() -> Vec<String> {
        std::iter::once(NGINX_PROGRAM)
            .chain(NGINX_FOREGROUND_ARGS)
            .map(String::from)
            .collect()
    }
    fn default_bootstrap_listen() -> String {
        DEFAULT_BOOTSTRAP_LISTEN.to_string()
    }
    fn default_bootstrap_upstream() -> String {
        DEFAULT_BOOTSTRAP_UPSTREAM.to_string()
    }
    fn default_ready_timeout() -> u64 {
        DEFAULT_READY_TIMEOUT_SECS
    }

    /// Parsed readiness probe address, `None` when probing is disabled.
    pub fn ready_probe_addr(&self) -> Option<SocketAddr> {
        match self.ready_probe.as_deref() {
            None => loopback_for_listen(&self.bootstrap_listen),
            Some("") => None,
            Some(addr) => addr.parse().ok(),
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CertbotConfig {
    #[serde(default = "CertbotConfig::default_program")]
    pub program: String,
}

impl Default for CertbotConfig {
    fn default() -> Self {
        Self {
            program: Self::default_program(),
        }
    }
}

impl CertbotConfig {
    fn default_program() -> String {
        CERTBOT_PROGRAM.to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenewalConfig {
    /// Seconds slept between renewal attempts (default: 1 hour)
    #[serde(default = "RenewalConfig::default_interval")]
    pub interval_seconds: u64,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            interval_seconds: Self::default_interval(),
        }
    }
}

impl RenewalConfig {
    fn default_interval() -> u64 {
        RENEWAL_INTERVAL_SECS
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(contents)?;

        if config.nginx.command.is_empty() {
            return Err(ConfigError::Validation(
                "nginx.command must name a program".to_string(),
            ));
        }
        match config.nginx.ready_probe.as_deref() {
            Some("") => {}
            Some(probe) if probe.parse::<SocketAddr>().is_err() => {
                return Err(ConfigError::Validation(format!(
                    "nginx.ready_probe must be a socket address, got \"{}\"",
                    probe
                )));
            }
            Some(_) => {}
            None if loopback_for_listen(&config.nginx.bootstrap_listen).is_none() => {
                return Err(ConfigError::Validation(format!(
                    "cannot derive a readiness probe from nginx.bootstrap_listen \"{}\", set nginx.ready_probe",
                    config.nginx.bootstrap_listen
                )));
            }
            None => {}
        }
        if config.certbot.program.trim().is_empty() {
            return Err(ConfigError::Validation(
                "certbot.program must not be empty".to_string(),
            ));
        }
        if config.renewal.interval_seconds == 0 {
            return Err(ConfigError::Validation(
                "renewal.interval_seconds must be greater than zero".to_string(),
            ));
        }
        if !matches!(config.logging.format.as_str(), "text" | "json") {
            return Err(ConfigError::Validation(format!(
                "logging.format must be \"text\" or \"json\", got \"{}\"",
                config.logging.format
            )));
        }

        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be passed as an env variable")]
    Missing(&'static str),
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}
