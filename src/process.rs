//! Tracking of spawned external processes.
//!
//! Every child (nginx, certbot) is spawned through [`ProcessRegistry::spawn`],
//! which hands back a cloneable [`ProcessHandle`]. A reaper task owns the
//! underlying `tokio::process::Child`, publishes its exit through a watch
//! channel and drops the handle from tracking. Forced kills are requests to
//! that task, so SIGKILL only ever reaches a child that has not been reaped.
//! On shutdown the registry force-kills whatever is still alive; this is not
//! a supervisor and nothing is ever restarted.

use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};

/// A command line to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    capture_stdout: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            capture_stdout: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Collect stdout instead of inheriting it.
    pub fn capture_stdout(mut self) -> Self {
        self.capture_stdout = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for CommandSpec {
    /// Shell-like rendering used in logs and error messages.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// How a tracked process ended.
#[derive(Debug)]
pub struct ProcessExit {
    /// `None` when the exit status could not be collected
    pub status: Option<ExitStatus>,
    /// Captured stdout; empty unless the command asked for capture
    pub stdout: Vec<u8>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.status.is_some_and(|s| s.success())
    }
}

type ExitSlot = Option<Arc<ProcessExit>>;

/// Handle to a spawned child. Cheap to clone; all clones observe the same exit.
#[derive(Clone)]
pub struct ProcessHandle {
    program: Arc<str>,
    pid: u32,
    exit: watch::Receiver<ExitSlot>,
    kill: mpsc::UnboundedSender<()>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// Exit information if the process has already ended.
    pub fn try_exit(&self) -> Option<Arc<ProcessExit>> {
        self.exit.borrow().clone()
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> Arc<ProcessExit> {
        let mut rx = self.exit.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone().unwrap_or_else(lost_exit),
            // Reaper went away with the runtime; the status is gone with it.
            Err(_) => lost_exit(),
        };
        exit
    }

    /// Deliver `signal` to the process.
    pub fn signal(&self, signal: Signal) -> Result<(), nix::Error> {
        kill(Pid::from_raw(self.pid as i32), signal)
    }

    /// Ask the reaper to SIGKILL the child unless it has already been reaped.
    pub fn force_kill(&self) {
        tracing::info!(program = %self.program, pid = self.pid, "sending SIGKILL");
        if self.kill.send(()).is_err() {
            tracing::debug!(pid = self.pid, "process already gone");
        }
    }
}

fn lost_exit() -> Arc<ProcessExit> {
    Arc::new(ProcessExit {
        status: None,
        stdout: Vec::new(),
    })
}

type HandleList = Mutex<Vec<ProcessHandle>>;

/// Registry of live children, shared by every component that spawns one.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    handles: Arc<HandleList>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `spec`, track the resulting process and start reaping it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(&self, spec: &CommandSpec) -> io::Result<ProcessHandle> {
        let mut command = tokio::process::Command::new(&spec.program);
        // Backstop for a reaper dropped with the runtime.
        command.args(&spec.args).kill_on_drop(true);
        if spec.capture_stdout {
            command.stdout(Stdio::piped());
        }

        let child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("process exited before its pid was read"))?;

        let (tx, rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let handle = ProcessHandle {
            program: Arc::from(spec.program.as_str()),
            pid,
            exit: rx,
            kill: kill_tx,
        };

        lock(&self.handles).push(handle.clone());
        tracing::info!(program = %spec.program, pid, "started process");

        tokio::spawn(reap(child, tx, kill_rx, Arc::downgrade(&self.handles)));

        Ok(handle)
    }

    /// Number of processes currently tracked.
    pub fn tracked(&self) -> usize {
        lock(&self.handles).len()
    }

    /// Force-kill every tracked process that is still running.
    ///
    /// Safe to call repeatedly and after children have exited on their own.
    pub fn kill_all(&self) {
        tracing::info!("performing shutdown clean up");
        let alive: Vec<ProcessHandle> = lock(&self.handles)
            .iter()
            .filter(|h| h.is_alive())
            .cloned()
            .collect();

        for handle in alive {
            handle.force_kill();
        }
    }

    /// Guard that runs [`kill_all`](Self::kill_all) when dropped, covering
    /// normal return, early error return and unwinding alike.
    pub fn cleanup_guard(&self) -> CleanupGuard {
        CleanupGuard {
            registry: self.clone(),
        }
    }
}

pub struct CleanupGuard {
    registry: ProcessRegistry,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.registry.kill_all();
    }
}

fn lock(handles: &HandleList) -> std::sync::MutexGuard<'_, Vec<ProcessHandle>> {
    handles.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn reap(
    mut child: tokio::process::Child,
    tx: watch::Sender<ExitSlot>,
    mut kill: mpsc::UnboundedReceiver<()>,
    handles: Weak<HandleList>,
) {
    let pid = child.id();
    let stdout = child.stdout.take();

    let collect = async move {
        let mut buf = Vec::new();
        if let Some(mut stdout) = stdout {
            if let Err(e) = stdout.read_to_end(&mut buf).await {
                tracing::error!(?pid, error = %e, "failed to collect process output");
            }
        }
        buf
    };

    let wait = async {
        loop {
            tokio::select! {
                status = child.wait() => return status,
                Some(()) = kill.recv() => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(?pid, error = %e, "kill request after exit");
                    }
                }
            }
        }
    };

    let (status, stdout) = tokio::join!(wait, collect);
    let status = match status {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::error!(?pid, error = %e, "failed to wait for process");
            None
        }
    };
    let exit = ProcessExit { status, stdout };

    tracing::debug!(?pid, status = ?exit.status, "process exited");

    // Untrack before publishing so waiters never see a dead handle still listed.
    if let (Some(handles), Some(pid)) = (handles.upgrade(), pid) {
        lock(&handles).retain(|h| h.pid != pid);
    }
    tx.send_replace(Some(Arc::new(exit)));
}
