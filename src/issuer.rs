//! Certificate issuance through the certbot CLI.
//!
//! Two invocation shapes exist. `certonly` obtains the first certificate with
//! the standalone HTTP-01 responder; `renew` refreshes every certificate
//! certbot knows about. Neither is retried here: a failed `certonly` is fatal
//! to the caller and a failed `renew` waits for the next renewal cycle.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Settings, RENEW_PRE_HOOK};
use crate::error::IssuanceError;
use crate::process::{CommandSpec, ProcessExit, ProcessRegistry};

/// Output of a successful renewal run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenewOutput {
    pub stdout: String,
}

/// Obtains and renews certificates.
#[async_trait]
pub trait Issuer: Send + Sync + 'static {
    /// Obtain the initial certificate for the configured domain.
    async fn issue(&self) -> Result<(), IssuanceError>;

    /// Renew all known certificates that are due (or all of them when forced).
    async fn renew(&self) -> Result<RenewOutput, IssuanceError>;
}

/// [`Issuer`] backed by the certbot binary.
pub struct Certbot {
    settings: Arc<Settings>,
    program: String,
    registry: ProcessRegistry,
}

impl Certbot {
    pub fn new(settings: Arc<Settings>, program: impl Into<String>, registry: ProcessRegistry) -> Self {
        Self {
            settings,
            program: program.into(),
            registry,
        }
    }

    /// `certbot certonly` for the configured domain.
    ///
    /// Only HTTP-01 is usable: TLS-SNI raw routing sits in front of this
    /// proxy and TLS-SNI challenges rely on the reserved `acme.invalid` name.
    pub fn issue_command(&self) -> CommandSpec {
        let settings = &self.settings;
        let mut spec = CommandSpec::new(&self.program)
            .arg("certonly")
            .args(["--domain", settings.domain.as_str()])
            .args(["--email", settings.email.as_str()])
            .args([
                "--standalone",
                "--non-interactive",
                "--agree-tos",
                "--must-staple",
            ]);

        if settings.staging {
            spec = spec.arg("--staging");
        }
        if settings.debug {
            spec = spec.args(["-vvv", "--text"]);
        }
        if let Some(server) = &settings.server {
            spec = spec.args(["--server", server.as_str()]);
        }

        spec.args(["--preferred-challenges", "http-01"])
    }

    /// `certbot renew`; the pre-hook stops nginx so the standalone responder
    /// can bind, and DEBUG forces renewal to exercise the path on every cycle.
    pub fn renew_command(&self) -> CommandSpec {
        let spec = CommandSpec::new(&self.program)
            .arg("renew")
            .args(["--pre-hook", RENEW_PRE_HOOK])
            .capture_stdout();

        if self.settings.debug {
            spec.arg("--force-renewal")
        } else {
            spec
        }
    }

    async fn run(&self, spec: &CommandSpec) -> Result<Arc<ProcessExit>, IssuanceError> {
        let invocation = spec.to_string();
        let handle = self
            .registry
            .spawn(spec)
            .map_err(|source| IssuanceError::Spawn {
                invocation: invocation.clone(),
                source,
            })?;

        let exit = handle.wait().await;
        match exit.status {
            Some(status) if status.success() => Ok(exit),
            Some(status) => Err(IssuanceError::Failed { invocation, status }),
            None => Err(IssuanceError::Lost { invocation }),
        }
    }
}

#[async_trait]
impl Issuer for Certbot {
    async fn issue(&self) -> Result<(), IssuanceError> {
        tracing::info!(domain = %self.settings.domain, "obtaining certificates");
        self.run(&self.issue_command()).await?;
        tracing::info!(domain = %self.settings.domain, "certificate obtained");
        Ok(())
    }

    async fn renew(&self) -> Result<RenewOutput, IssuanceError> {
        let exit = self.run(&self.renew_command()).await?;
        Ok(RenewOutput {
            stdout: String::from_utf8_lossy(&exit.stdout).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            domain: "example.com".to_string(),
            email: "a@example.com".to_string(),
            server: None,
            staging: false,
            debug: false,
        }
    }

    fn certbot(settings: Settings) -> Certbot {
        Certbot::new(Arc::new(settings), "certbot", ProcessRegistry::new())
    }

    #[test]
    fn test_issue_command_default_flags() {
        let spec = certbot(settings()).issue_command();
        assert_eq!(
            spec.to_string(),
            "certbot certonly --domain example.com --email a@example.com \
             --standalone --non-interactive --agree-tos --must-staple \
             --preferred-challenges http-01"
        );
    }

    #[test]
    fn test_issue_command_optional_flags() {
        let spec = certbot(Settings {
            staging: true,
            debug: true,
            server: Some("https://acme.internal/dir".to_string()),
            ..settings()
        })
        .issue_command();

        let args = spec.get_args();
        assert!(args.contains(&"--staging".to_string()));
        let verbose = args.iter().position(|a| a == "-vvv").unwrap();
        assert_eq!(args[verbose + 1], "--text");
        let server = args.iter().position(|a| a == "--server").unwrap();
        assert_eq!(args[server + 1], "https://acme.internal/dir");
        // HTTP-01 is always forced, whatever else is set.
        assert_eq!(&args[args.len() - 2..], ["--preferred-challenges", "http-01"]);
    }

    #[test]
    fn test_renew_command() {
        let spec = certbot(settings()).renew_command();
        assert_eq!(spec.to_string(), "certbot renew --pre-hook \"nginx -s stop\"");
    }

    #[test]
    fn test_renew_command_debug_forces_renewal() {
        let spec = certbot(Settings {
            debug: true,
            ..settings()
        })
        .renew_command();
        assert_eq!(spec.get_args().last().map(String::as_str), Some("--force-renewal"));
    }

    #[tokio::test]
    async fn test_issue_failure_reports_invocation() {
        let certbot = Certbot::new(Arc::new(settings()), "false", ProcessRegistry::new());
        let err = certbot.issue().await.unwrap_err();

        assert!(matches!(err, IssuanceError::Failed { .. }));
        assert!(err
            .to_string()
            .contains("false certonly --domain example.com --email a@example.com"));
    }

    #[tokio::test]
    async fn test_issue_missing_program() {
        let certbot = Certbot::new(
            Arc::new(settings()),
            "/nonexistent/certbot",
            ProcessRegistry::new(),
        );
        let err = certbot.issue().await.unwrap_err();
        assert!(matches!(err, IssuanceError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_renew_captures_output() {
        // `echo` prints its arguments, standing in for certbot's report.
        let certbot = Certbot::new(Arc::new(settings()), "echo", ProcessRegistry::new());
        let output = certbot.renew().await.unwrap();
        assert_eq!(output.stdout.trim(), "renew --pre-hook nginx -s stop");
    }
}
