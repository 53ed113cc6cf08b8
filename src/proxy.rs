//! The nginx reverse proxy as a controlled external process.
//!
//! Nginx runs in one of two configurations. The bootstrap variant is a plain
//! proxy that keeps the public side answering while certbot's HTTP-01
//! responder works; the served variant terminates TLS with the issued
//! certificate. Switching means rewriting the file and sending SIGHUP.
//!
//! ```text
//! Unstarted -> BootstrapRunning -> ServedRunning   (issuance path)
//! Unstarted -> ServedRunning                       (certificate present)
//! ServedRunning -> Stopped -> ServedRunning        (renewal pre-hook, restart)
//! ```

use std::fs::Permissions;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use serde::Serialize;
use tera::{Context, Tera};

use crate::certificate::CertificateBundle;
use crate::config::{AppConfig, NGINX_PROGRAM, READY_PROBE_INTERVAL_MS};
use crate::error::{ProxyConfigError, ServerControlError};
use crate::gate::Gate;
use crate::process::{CommandSpec, ProcessExit, ProcessHandle, ProcessRegistry};
use crate::templates::{
    init_templates, BOOTSTRAP_TEMPLATE, HSTS_MAX_AGE, OCSP_RESOLVERS, SERVED_TEMPLATE,
    SSL_CIPHERS, SSL_PROTOCOLS,
};

/// Which configuration to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigVariant {
    /// Plain proxy used while the first certificate is issued
    Bootstrap,
    /// TLS termination with the given certificate
    Served(CertificateBundle),
}

/// Result of [`ProxyServer::start`].
#[derive(Debug)]
pub enum StartOutcome {
    /// The server had already been started by an earlier call
    AlreadyRunning,
    /// The server process ran and exited
    Exited(Arc<ProcessExit>),
}

#[async_trait]
pub trait ProxyServer: Send + Sync + 'static {
    /// Atomically replace the configuration file for `variant`.
    fn write_configuration(
        &self,
        variant: &ConfigVariant,
        domain: &str,
    ) -> Result<PathBuf, ProxyConfigError>;

    /// Delete the bootstrap configuration; absent is not an error.
    fn remove_configuration(&self) -> Result<(), ProxyConfigError>;

    /// Spawn the server once, open `ready` when it accepts connections and
    /// wait for it to exit. Only the first call spawns.
    async fn start(&self, ready: &Gate) -> Result<StartOutcome, ServerControlError>;

    /// Spawn the server again after the started process has exited, with
    /// whatever configuration is on disk, and wait for it to exit.
    async fn restart(&self) -> Result<StartOutcome, ServerControlError>;

    /// Ask the running server to reload its configuration.
    fn reload(&self) -> Result<(), ServerControlError>;
}

// =============================================================================
// Typed configuration model
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct BootstrapSite {
    pub listen: String,
    pub upstream: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServedSite {
    pub domain: String,
    pub full_chain: PathBuf,
    pub private_key: PathBuf,
    pub chain: PathBuf,
    pub dhparam: PathBuf,
    /// Glob of operator-supplied fragments, referenced rather than inlined
    pub include: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SiteConfig {
    Bootstrap(BootstrapSite),
    Served(ServedSite),
}

impl SiteConfig {
    pub fn render(&self, tera: &Tera) -> Result<String, tera::Error> {
        match self {
            SiteConfig::Bootstrap(site) => {
                tera.render(BOOTSTRAP_TEMPLATE, &Context::from_serialize(site)?)
            }
            SiteConfig::Served(site) => {
                let mut context = Context::from_serialize(site)?;
                context.insert("protocols", SSL_PROTOCOLS);
                context.insert("ciphers", SSL_CIPHERS);
                context.insert("hsts_max_age", &HSTS_MAX_AGE);
                context.insert("resolvers", OCSP_RESOLVERS);
                tera.render(SERVED_TEMPLATE, &context)
            }
        }
    }
}

// =============================================================================
// Nginx
// =============================================================================

/// [`ProxyServer`] backed by an nginx process running in the foreground.
pub struct NginxServer {
    command: CommandSpec,
    conf_dir: PathBuf,
    bootstrap_path: PathBuf,
    custom_include_dir: PathBuf,
    dhparam: PathBuf,
    bootstrap_listen: String,
    bootstrap_upstream: String,
    ready_probe: Option<SocketAddr>,
    ready_timeout: Duration,
    tera: Tera,
    registry: ProcessRegistry,
    /// Doubles as the start lock: set exactly once, under the mutex.
    handle: Mutex<Option<ProcessHandle>>,
}

impl NginxServer {
    pub fn new(config: &AppConfig, registry: ProcessRegistry) -> Result<Self, ProxyConfigError> {
        let mut parts = config.nginx.command.iter();
        let program = parts.next().map(String::as_str).unwrap_or(NGINX_PROGRAM);

        Ok(Self {
            command: CommandSpec::new(program).args(parts.cloned()),
            conf_dir: config.paths.nginx_conf_dir.clone(),
            bootstrap_path: config.paths.bootstrap_config.clone(),
            custom_include_dir: config.paths.custom_include_dir.clone(),
            dhparam: config.paths.dhparam.clone(),
            bootstrap_listen: config.nginx.bootstrap_listen.clone(),
            bootstrap_upstream: config.nginx.bootstrap_upstream.clone(),
            ready_probe: config.nginx.ready_probe_addr(),
            ready_timeout: config.nginx.ready_timeout(),
            tera: init_templates()?,
            registry,
            handle: Mutex::new(None),
        })
    }

    /// Where the served configuration for `domain` lives.
    pub fn served_path(&self, domain: &str) -> PathBuf {
        self.conf_dir.join(format!("{}.conf", domain))
    }

    pub fn bootstrap_path(&self) -> &Path {
        &self.bootstrap_path
    }

    /// Build the typed configuration for `variant`.
    pub fn site(&self, variant: &ConfigVariant, domain: &str) -> SiteConfig {
        match variant {
            ConfigVariant::Bootstrap => SiteConfig::Bootstrap(BootstrapSite {
                listen: self.bootstrap_listen.clone(),
                upstream: self.bootstrap_upstream.clone(),
            }),
            ConfigVariant::Served(bundle) => {
                let include = if self.custom_include_dir.is_dir() {
                    tracing::info!(dir = %self.custom_include_dir.display(), "including custom configuration");
                    Some(format!("{}/*.conf", self.custom_include_dir.display()))
                } else {
                    None
                };
                SiteConfig::Served(ServedSite {
                    domain: domain.to_string(),
                    full_chain: bundle.full_chain.clone(),
                    private_key: bundle.private_key.clone(),
                    chain: bundle.chain.clone(),
                    dhparam: self.dhparam.clone(),
                    include,
                })
            }
        }
    }

    /// Wait for readiness, open `ready` if given, then wait for the exit.
    async fn serve(
        &self,
        handle: ProcessHandle,
        ready: Option<&Gate>,
    ) -> Result<StartOutcome, ServerControlError> {
        self.wait_until_ready(&handle).await?;
        if let Some(ready) = ready {
            ready.open();
        }
        tracing::info!(pid = handle.pid(), "nginx is serving");

        let exit = handle.wait().await;
        tracing::warn!(pid = handle.pid(), status = ?exit.status, "nginx exited");
        Ok(StartOutcome::Exited(exit))
    }

    fn current_handle(&self) -> Option<ProcessHandle> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Poll the readiness probe until it connects, the server dies, or the
    /// timeout passes (in which case the server is assumed ready).
    async fn wait_until_ready(&self, handle: &ProcessHandle) -> Result<(), ServerControlError> {
        let Some(addr) = self.ready_probe else {
            return Ok(());
        };

        let probe = async {
            loop {
                if !handle.is_alive() {
                    return Err(ServerControlError::ExitedBeforeReady);
                }
                if tokio::net::TcpStream::connect(addr).await.is_ok() {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(READY_PROBE_INTERVAL_MS)).await;
            }
        };

        match tokio::time::timeout(self.ready_timeout, probe).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    %addr,
                    timeout_secs = self.ready_timeout.as_secs(),
                    "nginx readiness probe timed out, continuing"
                );
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ProxyServer for NginxServer {
    fn write_configuration(
        &self,
        variant: &ConfigVariant,
        domain: &str,
    ) -> Result<PathBuf, ProxyConfigError> {
        let path = match variant {
            ConfigVariant::Bootstrap => self.bootstrap_path.clone(),
            ConfigVariant::Served(_) => self.served_path(domain),
        };
        let rendered = self.site(variant, domain).render(&self.tera)?;
        write_atomic(&path, rendered.as_bytes())?;

        match variant {
            ConfigVariant::Bootstrap => {
                tracing::info!(path = %path.display(), "bootstrap proxy configuration written")
            }
            ConfigVariant::Served(_) => {
                tracing::info!(%domain, path = %path.display(), "virtual host created")
            }
        }
        Ok(path)
    }

    fn remove_configuration(&self) -> Result<(), ProxyConfigError> {
        match std::fs::remove_file(&self.bootstrap_path) {
            Ok(()) => {
                tracing::info!(path = %self.bootstrap_path.display(), "bootstrap proxy configuration removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ProxyConfigError::Io {
                path: self.bootstrap_path.display().to_string(),
                source,
            }),
        }
    }

    async fn start(&self, ready: &Gate) -> Result<StartOutcome, ServerControlError> {
        let handle = {
            let mut slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                tracing::debug!("nginx already started");
                return Ok(StartOutcome::AlreadyRunning);
            }
            let handle = self
                .registry
                .spawn(&self.command)
                .map_err(ServerControlError::Spawn)?;
            *slot = Some(handle.clone());
            handle
        };

        self.serve(handle, Some(ready)).await
    }

    async fn restart(&self) -> Result<StartOutcome, ServerControlError> {
        let handle = {
            let mut slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                None => return Err(ServerControlError::NotStarted),
                Some(previous) if previous.is_alive() => {
                    tracing::debug!(pid = previous.pid(), "nginx still running");
                    return Ok(StartOutcome::AlreadyRunning);
                }
                Some(_) => {}
            }
            let handle = self
                .registry
                .spawn(&self.command)
                .map_err(ServerControlError::Spawn)?;
            *slot = Some(handle.clone());
            handle
        };

        tracing::info!(pid = handle.pid(), "restarting nginx");
        self.serve(handle, None).await
    }

    fn reload(&self) -> Result<(), ServerControlError> {
        let handle = self.current_handle().ok_or(ServerControlError::NotStarted)?;
        tracing::info!(pid = handle.pid(), "reloading nginx");
        handle.signal(Signal::SIGHUP)?;
        Ok(())
    }
}

/// Replace `path` with `contents` through a temporary file in the same
/// directory, so nginx never reads a half-written file.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ProxyConfigError> {
    let io_err = |source| ProxyConfigError::Io {
        path: path.display().to_string(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    file.write_all(contents).map_err(io_err)?;
    file.as_file()
        .set_permissions(Permissions::from_mode(0o644))
        .map_err(io_err)?;
    file.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::CertificateStore;

    struct Fixture {
        _dir: tempfile::TempDir,
        conf_dir: PathBuf,
        config: AppConfig,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let conf_dir = dir.path().join("conf.d");
        std::fs::create_dir_all(&conf_dir).unwrap();

        let mut config = AppConfig::default();
        config.paths.letsencrypt_dir = PathBuf::from("/etc/letsencrypt/live");
        config.paths.nginx_conf_dir = conf_dir.clone();
        config.paths.bootstrap_config = conf_dir.join("reverse_proxy.conf");
        config.paths.custom_include_dir = conf_dir.join("custom");
        config.nginx.ready_probe = Some(String::new());

        Fixture {
            _dir: dir,
            conf_dir,
            config,
        }
    }

    fn served(config: &AppConfig) -> ConfigVariant {
        ConfigVariant::Served(CertificateStore::new(&config.paths.letsencrypt_dir).bundle("example.com"))
    }

    #[test]
    fn test_served_config_references_certificate_paths() {
        let f = fixture();
        let nginx = NginxServer::new(&f.config, ProcessRegistry::new()).unwrap();

        let path = nginx.write_configuration(&served(&f.config), "example.com").unwrap();
        assert_eq!(path, f.conf_dir.join("example.com.conf"));

        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("server_name example.com;"));
        assert!(text.contains("ssl_certificate /etc/letsencrypt/live/example.com/fullchain.pem;"));
        assert!(text.contains("ssl_certificate_key /etc/letsencrypt/live/example.com/privkey.pem;"));
        assert!(text.contains("ssl_trusted_certificate /etc/letsencrypt/live/example.com/chain.pem;"));
        assert!(text.contains("ssl_stapling on;"));
        assert!(text.contains("Strict-Transport-Security max-age=15768000"));
        assert!(text.contains("ssl_protocols TLSv1.2 TLSv1.3;"));
        assert!(!text.contains("include "));
        assert!(text.trim_end().ends_with('}'));
    }

    #[test]
    fn test_served_config_references_custom_include() {
        let f = fixture();
        std::fs::create_dir_all(&f.config.paths.custom_include_dir).unwrap();
        std::fs::write(
            f.config.paths.custom_include_dir.join("extra.conf"),
            "client_max_body_size 10m;",
        )
        .unwrap();
        let nginx = NginxServer::new(&f.config, ProcessRegistry::new()).unwrap();

        let path = nginx.write_configuration(&served(&f.config), "example.com").unwrap();
        let text = std::fs::read_to_string(path).unwrap();

        let expected = format!(
            "include {}/*.conf;",
            f.config.paths.custom_include_dir.display()
        );
        assert_eq!(text.matches(&expected).count(), 1);
        // Referenced, never inlined.
        assert!(!text.contains("client_max_body_size"));
    }

    #[test]
    fn test_repeated_switching_keeps_single_directive_set() {
        let f = fixture();
        let nginx = NginxServer::new(&f.config, ProcessRegistry::new()).unwrap();

        for _ in 0..3 {
            nginx.write_configuration(&ConfigVariant::Bootstrap, "example.com").unwrap();
            nginx.remove_configuration().unwrap();
            nginx.write_configuration(&served(&f.config), "example.com").unwrap();
        }

        let text = std::fs::read_to_string(nginx.served_path("example.com")).unwrap();
        assert_eq!(text.matches("ssl_certificate ").count(), 1);
        assert_eq!(text.matches("fullchain.pem").count(), 1);
        assert_eq!(text.matches("privkey.pem").count(), 1);
        assert_eq!(text.matches("/chain.pem").count(), 1);
    }

    #[test]
    fn test_bootstrap_write_overwrites_and_remove_is_idempotent() {
        let f = fixture();
        let nginx = NginxServer::new(&f.config, ProcessRegistry::new()).unwrap();
        let path = nginx.bootstrap_path().to_path_buf();

        std::fs::write(&path, "stale content").unwrap();
        nginx.write_configuration(&ConfigVariant::Bootstrap, "example.com").unwrap();
        nginx.write_configuration(&ConfigVariant::Bootstrap, "example.com").unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("stale content"));
        assert_eq!(text.matches("proxy_pass http://localhost;").count(), 1);
        assert!(!text.contains("ssl_certificate"));

        nginx.remove_configuration().unwrap();
        assert!(!path.exists());
        nginx.remove_configuration().unwrap();
    }

    #[test]
    fn test_write_into_missing_directory_fails() {
        let mut f = fixture();
        f.config.paths.bootstrap_config = f.conf_dir.join("missing").join("reverse_proxy.conf");
        let nginx = NginxServer::new(&f.config, ProcessRegistry::new()).unwrap();

        let err = nginx
            .write_configuration(&ConfigVariant::Bootstrap, "example.com")
            .unwrap_err();
        assert!(matches!(err, ProxyConfigError::Io { .. }));
    }

    #[test]
    fn test_reload_before_start_is_rejected() {
        let f = fixture();
        let nginx = NginxServer::new(&f.config, ProcessRegistry::new()).unwrap();
        assert!(matches!(nginx.reload(), Err(ServerControlError::NotStarted)));
    }

    #[tokio::test]
    async fn test_start_opens_gate_and_runs_once() {
        let mut f = fixture();
        f.config.nginx.command = vec!["sleep".to_string(), "30".to_string()];
        let registry = ProcessRegistry::new();
        let nginx = Arc::new(NginxServer::new(&f.config, registry.clone()).unwrap());
        let ready = Gate::new("server_ready");

        let server = {
            let nginx = Arc::clone(&nginx);
            let ready = ready.clone();
            tokio::spawn(async move { nginx.start(&ready).await })
        };

        tokio::time::timeout(Duration::from_secs(5), ready.wait())
            .await
            .expect("gate opens once nginx is spawned");

        let second = nginx.start(&ready).await.unwrap();
        assert!(matches!(second, StartOutcome::AlreadyRunning));
        assert_eq!(registry.tracked(), 1);

        registry.kill_all();
        let outcome = server.await.unwrap().unwrap();
        match outcome {
            StartOutcome::Exited(exit) => assert!(!exit.success()),
            StartOutcome::AlreadyRunning => panic!("first start must run the server"),
        }
    }

    #[tokio::test]
    async fn test_restart_requires_start_and_an_exited_server() {
        let mut f = fixture();
        f.config.nginx.command = vec!["sleep".to_string(), "30".to_string()];
        let registry = ProcessRegistry::new();
        let nginx = Arc::new(NginxServer::new(&f.config, registry.clone()).unwrap());
        let ready = Gate::new("server_ready");

        assert!(matches!(
            nginx.restart().await,
            Err(ServerControlError::NotStarted)
        ));

        let first = {
            let nginx = Arc::clone(&nginx);
            let ready = ready.clone();
            tokio::spawn(async move { nginx.start(&ready).await })
        };
        ready.wait().await;
        let first_pid = nginx.current_handle().unwrap().pid();
        assert!(matches!(
            nginx.restart().await.unwrap(),
            StartOutcome::AlreadyRunning
        ));

        // Stopped from outside, as the renewal pre-hook does.
        nginx
            .current_handle()
            .unwrap()
            .signal(Signal::SIGTERM)
            .unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), first)
            .await
            .expect("stopped server returns from start")
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, StartOutcome::Exited(_)));

        let second = {
            let nginx = Arc::clone(&nginx);
            tokio::spawn(async move { nginx.restart().await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while nginx.current_handle().map(|h| h.pid()) == Some(first_pid) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("restart spawns a new process");
        assert_eq!(registry.tracked(), 1);
        nginx.reload().unwrap_or_else(|e| panic!("reload after restart: {e}"));

        registry.kill_all();
        let outcome = second.await.unwrap().unwrap();
        assert!(matches!(outcome, StartOutcome::Exited(_)));
    }

    #[tokio::test]
    async fn test_start_fails_when_server_dies_before_ready() {
        let mut f = fixture();
        f.config.nginx.command = vec!["false".to_string()];
        // Nothing listens on port 9 (discard) in the test environment.
        f.config.nginx.ready_probe = Some("127.0.0.1:9".to_string());
        let nginx = NginxServer::new(&f.config, ProcessRegistry::new()).unwrap();
        let ready = Gate::new("server_ready");

        let err = nginx.start(&ready).await.unwrap_err();
        assert!(matches!(err, ServerControlError::ExitedBeforeReady));
        assert!(!ready.is_open());
    }
}
