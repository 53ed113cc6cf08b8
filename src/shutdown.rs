//! Termination signal handling.
//!
//! SIGTERM and SIGINT end the run. Children are not signalled here; the
//! process registry's cleanup guard force-kills them once `main` unwinds.

use tokio::signal::unix::{signal, Signal, SignalKind};

/// Installed SIGTERM/SIGINT listeners.
pub struct ShutdownSignals {
    terminate: Signal,
    interrupt: Signal,
}

impl ShutdownSignals {
    /// Install the handlers. Must be called from within a tokio runtime.
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    /// Wait for the next termination signal and return its name.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.interrupt.recv() => "SIGINT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_recv_reports_sigterm() {
        let mut signals = ShutdownSignals::install().unwrap();
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();

        let name = tokio::time::timeout(Duration::from_secs(5), signals.recv())
            .await
            .expect("signal delivered");
        assert_eq!(name, "SIGTERM");
    }
}
