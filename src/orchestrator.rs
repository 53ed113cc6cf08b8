//! Certificate lifecycle orchestration.
//!
//! Three activities run concurrently and only talk through two gates and the
//! file system:
//!
//! - startup (the caller of [`Orchestrator::run`]) picks the path, writes the
//!   first proxy configuration and then parks inside the proxy server's
//!   `start`, which is the long-lived wait of the whole program;
//! - the issuance workflow (only without a certificate) waits for the server,
//!   runs certbot, swaps bootstrap for served configuration, reloads, and
//!   opens `issuance_settled`;
//! - the renewal loop waits on `issuance_settled` and then `server_ready`,
//!   after which it renews, sleeps and repeats forever.
//!
//! The renew pre-hook stops nginx. An exit while a renewal is in flight is
//! therefore expected: the run waits for certbot to finish and restarts the
//! server instead of ending.
//!
//! ```text
//! Init -> NeedsCertificate | HasCertificate -> Serving -> RenewCycle(1) -> RenewCycle(2) -> ...
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::certificate::CertificateStore;
use crate::config::{Settings, CERTIFICATE_LIFETIME_SECS};
use crate::error::AppError;
use crate::gate::OrchestrationGates;
use crate::issuer::Issuer;
use crate::process::ProcessExit;
use crate::proxy::{ConfigVariant, ProxyServer, StartOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Init,
    NeedsCertificate,
    HasCertificate,
    /// Both gates are open; the renewal loop is about to run
    Serving,
    /// The n-th renewal attempt (1-based) has started
    RenewCycle(u64),
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecyclePhase::Init => write!(f, "init"),
            LifecyclePhase::NeedsCertificate => write!(f, "needs-certificate"),
            LifecyclePhase::HasCertificate => write!(f, "has-certificate"),
            LifecyclePhase::Serving => write!(f, "serving"),
            LifecyclePhase::RenewCycle(n) => write!(f, "renew-cycle-{}", n),
        }
    }
}

struct Shared<I, P> {
    settings: Arc<Settings>,
    issuer: Arc<I>,
    proxy: Arc<P>,
    store: CertificateStore,
    gates: OrchestrationGates,
    renewal_interval: Duration,
    phase: watch::Sender<LifecyclePhase>,
    /// A certbot renewal is running
    renewing: watch::Sender<bool>,
}

/// Drives the proxy server, issuer and renewal loop through the lifecycle.
pub struct Orchestrator<I, P> {
    shared: Arc<Shared<I, P>>,
}

impl<I: Issuer, P: ProxyServer> Orchestrator<I, P> {
    pub fn new(
        settings: Arc<Settings>,
        issuer: Arc<I>,
        proxy: Arc<P>,
        store: CertificateStore,
        renewal_interval: Duration,
    ) -> Self {
        let (phase, _) = watch::channel(LifecyclePhase::Init);
        let (renewing, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                settings,
                issuer,
                proxy,
                store,
                gates: OrchestrationGates::new(),
                renewal_interval,
                phase,
                renewing,
            }),
        }
    }

    pub fn gates(&self) -> &OrchestrationGates {
        &self.shared.gates
    }

    /// Observe lifecycle transitions.
    pub fn subscribe_phase(&self) -> watch::Receiver<LifecyclePhase> {
        self.shared.phase.subscribe()
    }

    /// Run until the proxy server exits or a required step fails.
    ///
    /// Returns the server's exit. A server that exits during a renewal is
    /// restarted once the renewal finishes and does not end the run. A failed
    /// initial issuance is returned as an error without waiting for the
    /// server. Dropping the returned future stops the background activities.
    pub async fn run(&self) -> Result<Arc<ProcessExit>, AppError> {
        let shared = &self.shared;
        let domain = shared.settings.domain.as_str();

        // Aborted together with `run` when the set is dropped.
        let mut tasks = JoinSet::new();
        tasks.spawn(Arc::clone(shared).renewal_loop());

        if shared.store.exists(domain) {
            shared.set_phase(LifecyclePhase::HasCertificate);
            tracing::info!(%domain, "we already have the existing certificates");
            shared.warn_if_stale();

            // Nothing to issue; renewal only waits for the server now.
            shared.gates.issuance_settled.open();
            shared
                .proxy
                .write_configuration(&ConfigVariant::Served(shared.store.bundle(domain)), domain)?;
        } else {
            shared.set_phase(LifecyclePhase::NeedsCertificate);
            tracing::info!(%domain, "no certificate found, starting bootstrap proxy");

            shared
                .proxy
                .write_configuration(&ConfigVariant::Bootstrap, domain)?;
            tasks.spawn(Arc::clone(shared).obtain_certificate());
        }

        let mut server = shared.proxy.start(&shared.gates.server_ready);

        loop {
            tokio::select! {
                outcome = &mut server => {
                    let exit = match outcome? {
                        StartOutcome::Exited(exit) => exit,
                        StartOutcome::AlreadyRunning => {
                            return Err(AppError::Internal(
                                "proxy server was started outside the orchestrator".to_string(),
                            ))
                        }
                    };
                    if !*shared.renewing.borrow() {
                        return Ok(exit);
                    }

                    tracing::info!(status = ?exit.status, "nginx stopped during renewal, restarting once certbot finishes");
                    shared.renewal_finished().await;
                    server = shared.proxy.restart();
                }
                Some(joined) = tasks.join_next() => {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => return Err(e),
                        Err(e) => return Err(AppError::Internal(format!("background task failed: {}", e))),
                    }
                }
            }
        }
    }
}

impl<I: Issuer, P: ProxyServer> Shared<I, P> {
    fn set_phase(&self, phase: LifecyclePhase) {
        tracing::debug!(%phase, "lifecycle transition");
        self.phase.send_replace(phase);
    }

    async fn renewal_finished(&self) {
        let mut rx = self.renewing.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|renewing| !*renewing).await;
    }

    fn warn_if_stale(&self) {
        let domain = self.settings.domain.as_str();
        if let Some(age) = self.store.age(domain) {
            if age.as_secs() > CERTIFICATE_LIFETIME_SECS {
                let written = self
                    .store
                    .written_at(domain)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default();
                tracing::warn!(
                    %domain,
                    %written,
                    age_days = age.as_secs() / 86400,
                    "certificate file is older than its lifetime, renewal will run first"
                );
            }
        }
    }

    /// Issuance workflow for the no-certificate path.
    async fn obtain_certificate(self: Arc<Self>) -> Result<(), AppError> {
        let domain = self.settings.domain.as_str();

        // The challenge responder depends on the proxy already listening.
        self.gates.server_ready.wait().await;

        self.issuer.issue().await?;
        self.proxy.remove_configuration()?;
        self.proxy
            .write_configuration(&ConfigVariant::Served(self.store.bundle(domain)), domain)?;
        self.proxy.reload()?;

        self.gates.issuance_settled.open();
        tracing::info!(%domain, "issuance settled, serving TLS");
        Ok(())
    }

    /// Renewal loop; only returns if the surrounding task is aborted.
    async fn renewal_loop(self: Arc<Self>) -> Result<(), AppError> {
        self.gates.issuance_settled.wait().await;
        self.gates.server_ready.wait().await;
        self.set_phase(LifecyclePhase::Serving);

        let mut cycle: u64 = 0;
        loop {
            cycle += 1;
            self.set_phase(LifecyclePhase::RenewCycle(cycle));

            self.renewing.send_replace(true);
            let result = self.issuer.renew().await;
            self.renewing.send_replace(false);

            match result {
                Ok(output) if self.settings.debug => {
                    tracing::info!(cycle, output = %output.stdout, "renewal check complete");
                }
                Ok(output) => {
                    tracing::debug!(cycle, output = %output.stdout, "renewal check complete");
                }
                Err(e) => {
                    tracing::error!(cycle, error = %e, "certificate renewal failed, retrying next cycle");
                }
            }

            tokio::time::sleep(self.renewal_interval).await;
        }
    }
}
