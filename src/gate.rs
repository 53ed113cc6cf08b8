//! One-shot broadcast signals ordering the startup activities.

use std::sync::Arc;

use tokio::sync::watch;

/// A signal that starts closed and is opened at most once.
///
/// Any number of tasks may [`wait`](Gate::wait); all of them are released when
/// the gate opens, and later waiters return immediately. Gates never close again.
#[derive(Clone, Debug)]
pub struct Gate {
    name: &'static str,
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    pub fn new(name: &'static str) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            name,
            tx: Arc::new(tx),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Open the gate. Returns `false` if it was already open.
    pub fn open(&self) -> bool {
        let opened = self.tx.send_if_modified(|open| {
            if *open {
                false
            } else {
                *open = true;
                true
            }
        });
        if opened {
            tracing::debug!(gate = self.name, "gate opened");
        }
        opened
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate is open.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a close.
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// The two gates shared by the startup, issuance and renewal activities.
#[derive(Clone, Debug)]
pub struct OrchestrationGates {
    /// The proxy server has been started and accepts connections
    pub server_ready: Gate,
    /// Issuance finished, or was found unnecessary
    pub issuance_settled: Gate,
}

impl OrchestrationGates {
    pub fn new() -> Self {
        Self {
            server_ready: Gate::new("server_ready"),
            issuance_settled: Gate::new("issuance_settled"),
        }
    }
}

impl Default for OrchestrationGates {
    fn default() -> Self {
        Self::new()
    }
}
