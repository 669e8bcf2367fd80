//! Engine Process Supervisor
//!
//! Keeps exactly one native engine process alive. The supervisor restarts
//! the engine when it exits on its own or when a restart signal arrives
//! through a [`RestartHandle`], backing off exponentially between attempts.
//!
//! # State Machine
//!
//! ```text
//! Stopped ──► Starting ──► Running(pid)
//!                ▲              │ exit / restart signal
//!                │              ▼
//!                └──── CrashedAwaitingRestart(attempt, backoff)
//! ```
//!
//! The supervisor never looks at frames. It only sees process exits and
//! the restart channel.

mod backoff;

pub use backoff::{BackoffConfig, BackoffPolicy};

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{RestartReason, RestartSignal};
use crate::application::services::SessionTracker;
use crate::infrastructure::metrics;

/// Capacity of the engine event channel.
const EVENT_CAPACITY: usize = 64;

// =============================================================================
// Engine Command
// =============================================================================

/// Deployment variant selecting the engine binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EngineVariant {
    /// Production CTP front (`main_linux`).
    #[default]
    Production,
    /// `OpenCTP` simulation front (`main_linux_openctp`).
    OpenCtp,
}

impl EngineVariant {
    /// Parse a variant name, case-insensitively.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Some(Self::Production),
            "openctp" => Some(Self::OpenCtp),
            _ => None,
        }
    }

    /// Binary file name for this variant.
    #[must_use]
    pub const fn binary_name(self) -> &'static str {
        match self {
            Self::Production => "main_linux",
            Self::OpenCtp => "main_linux_openctp",
        }
    }
}

/// How to launch the engine.
///
/// The child inherits the environment (credentials, front addresses) and
/// stdout/stderr of the bridge.
#[derive(Debug, Clone)]
pub struct EngineCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl EngineCommand {
    /// Launch `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Binary for `variant` under `home`.
    #[must_use]
    pub fn for_variant(home: &Path, variant: EngineVariant) -> Self {
        Self::new(home.join(variant.binary_name()))
    }

    /// Append arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Program path.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Process supervision errors.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The engine binary could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program path.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the child failed.
    #[error("failed to wait on engine process: {0}")]
    Wait(#[source] std::io::Error),
}

// =============================================================================
// Engine Process
// =============================================================================

/// A running engine process.
///
/// Dropping the guard kills the child, so every exit path of the owning task
/// (return, unwind, cancellation) terminates the engine.
#[derive(Debug)]
pub struct EngineProcess {
    child: Child,
    pid: u32,
}

impl EngineProcess {
    /// Spawn the engine.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::Spawn` if the program cannot be started.
    pub fn spawn(command: &EngineCommand) -> Result<Self, SupervisorError> {
        let child = command
            .command()
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: command.program.display().to_string(),
                source,
            })?;
        let pid = child.id().unwrap_or_default();
        Ok(Self { child, pid })
    }

    /// OS process id.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait for the process to exit.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::Wait` if the OS wait fails.
    pub async fn wait(&mut self) -> Result<ExitStatus, SupervisorError> {
        self.child.wait().await.map_err(SupervisorError::Wait)
    }

    /// Kill the process and reap it. Returns the exit code, if any.
    pub async fn terminate(mut self) -> Option<i32> {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(pid = self.pid, error = %e, "Engine already gone");
        }
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "Failed to reap engine process");
                None
            }
        }
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        // No-op once the child has been reaped.
        let _ = self.child.start_kill();
    }
}

// =============================================================================
// State and Events
// =============================================================================

/// Supervisor state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineState {
    /// No engine and none planned.
    #[default]
    Stopped,
    /// Spawning the engine.
    Starting,
    /// Engine is running.
    Running {
        /// OS process id.
        pid: u32,
    },
    /// Waiting out the backoff before the next start.
    CrashedAwaitingRestart {
        /// Restart attempt since the last stable run.
        attempt: u32,
        /// Backoff being waited, in milliseconds.
        backoff_ms: u64,
    },
}

impl EngineState {
    /// Short label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running { .. } => "running",
            Self::CrashedAwaitingRestart { .. } => "crashed_awaiting_restart",
        }
    }

    /// True while an engine process is up.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }
}

/// Why an engine process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The process exited on its own.
    Crashed,
    /// The supervisor killed it after a restart signal.
    Restart(RestartReason),
    /// The supervisor is shutting down.
    Shutdown,
}

/// Lifecycle events, published on a broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A new engine process started.
    Spawned {
        /// OS process id.
        pid: u32,
    },
    /// The engine process ended.
    Exited {
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
        /// Why it ended.
        reason: ExitReason,
    },
    /// The engine could not be started.
    SpawnFailed {
        /// Error text.
        message: String,
    },
}

// =============================================================================
// Restart Handle
// =============================================================================

/// Cloneable restart trigger.
///
/// Backed by a capacity-one channel: at most one restart cycle is ever
/// pending, and further requests coalesce into it.
#[derive(Debug, Clone)]
pub struct RestartHandle {
    tx: mpsc::Sender<RestartReason>,
    signals: Arc<AtomicU64>,
}

impl RestartHandle {
    /// Request a restart.
    ///
    /// Returns `true` if a new restart cycle was queued, `false` if the
    /// request coalesced into a pending one or the supervisor is gone.
    pub fn request(&self, reason: RestartReason) -> bool {
        self.signals.fetch_add(1, Ordering::Relaxed);
        metrics::record_restart_signal(reason);

        match self.tx.try_send(reason) {
            Ok(()) => {
                tracing::warn!(%reason, "Engine restart requested");
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(%reason, "Restart already pending");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(%reason, "Restart requested but supervisor has stopped");
                false
            }
        }
    }

    /// Signals received, coalesced ones included.
    #[must_use]
    pub fn signal_count(&self) -> u64 {
        self.signals.load(Ordering::Relaxed)
    }
}

impl RestartSignal for RestartHandle {
    fn request_restart(&self, reason: RestartReason) -> bool {
        self.request(reason)
    }
}

/// Read-only view of a supervisor, for health reporting.
#[derive(Debug, Clone)]
pub struct EngineMonitor {
    state: watch::Receiver<EngineState>,
    restarts: Arc<AtomicU64>,
    signals: Arc<AtomicU64>,
}

impl EngineMonitor {
    /// Current state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.state.borrow().clone()
    }

    /// Completed restart cycles.
    #[must_use]
    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Restart signals received.
    #[must_use]
    pub fn signal_count(&self) -> u64 {
        self.signals.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Owns the engine process and its restart loop.
#[derive(Debug)]
pub struct EngineSupervisor {
    command: EngineCommand,
    backoff: BackoffConfig,
    state: watch::Sender<EngineState>,
    events: broadcast::Sender<EngineEvent>,
    restart_tx: RestartHandle,
    restart_rx: mpsc::Receiver<RestartReason>,
    restarts: Arc<AtomicU64>,
}

impl EngineSupervisor {
    /// Create a supervisor in `Stopped`.
    #[must_use]
    pub fn new(command: EngineCommand, backoff: BackoffConfig) -> Self {
        let (tx, restart_rx) = mpsc::channel(1);
        Self {
            command,
            backoff,
            state: watch::channel(EngineState::Stopped).0,
            events: broadcast::channel(EVENT_CAPACITY).0,
            restart_tx: RestartHandle {
                tx,
                signals: Arc::new(AtomicU64::new(0)),
            },
            restart_rx,
            restarts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Restart trigger for the correlation layer and operators.
    #[must_use]
    pub fn restart_handle(&self) -> RestartHandle {
        self.restart_tx.clone()
    }

    /// State receiver.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Event receiver.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Health view.
    #[must_use]
    pub fn monitor(&self) -> EngineMonitor {
        EngineMonitor {
            state: self.state.subscribe(),
            restarts: Arc::clone(&self.restarts),
            signals: Arc::clone(&self.restart_tx.signals),
        }
    }

    /// Run until `cancel` fires. The engine is killed before returning.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut policy = BackoffPolicy::new(self.backoff.clone());
        tracing::info!(program = %self.command.program.display(), "Engine supervisor started");

        loop {
            self.set_state(EngineState::Starting);
            let mut engine = match EngineProcess::spawn(&self.command) {
                Ok(engine) => engine,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to start CTP engine");
                    self.emit(EngineEvent::SpawnFailed {
                        message: e.to_string(),
                    });
                    if self.back_off(&mut policy, &cancel).await {
                        continue;
                    }
                    break;
                }
            };

            let pid = engine.pid();
            let started = Instant::now();
            self.set_state(EngineState::Running { pid });
            self.emit(EngineEvent::Spawned { pid });
            tracing::info!(pid, "CTP engine started");

            // Signals raised while this cycle was in progress belong to it.
            self.drain_pending_signals();

            let (code, reason) = tokio::select! {
                () = cancel.cancelled() => {
                    let code = engine.terminate().await;
                    self.emit(EngineEvent::Exited { code, reason: ExitReason::Shutdown });
                    tracing::info!(pid, "CTP engine stopped");
                    break;
                }
                status = engine.wait() => {
                    let code = match status {
                        Ok(status) => status.code(),
                        Err(e) => {
                            tracing::error!(pid, error = %e, "Lost track of CTP engine");
                            drop(engine);
                            None
                        }
                    };
                    tracing::warn!(pid, ?code, "CTP engine exited");
                    (code, ExitReason::Crashed)
                }
                Some(reason) = self.restart_rx.recv() => {
                    tracing::warn!(pid, %reason, "Killing CTP engine for restart");
                    (engine.terminate().await, ExitReason::Restart(reason))
                }
            };
            self.emit(EngineEvent::Exited { code, reason });

            if policy.record_run(started.elapsed()) {
                tracing::info!("Engine ran long enough, backoff reset");
            }
            self.restarts.fetch_add(1, Ordering::Relaxed);
            metrics::record_engine_restart();

            if !self.back_off(&mut policy, &cancel).await {
                break;
            }
        }

        self.set_state(EngineState::Stopped);
        tracing::info!("Engine supervisor stopped");
    }

    /// Wait out the next backoff. Returns `false` if cancelled.
    async fn back_off(&self, policy: &mut BackoffPolicy, cancel: &CancellationToken) -> bool {
        let delay = policy.next_delay();
        let attempt = policy.attempt();
        let backoff_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.set_state(EngineState::CrashedAwaitingRestart {
            attempt,
            backoff_ms,
        });
        tracing::warn!(attempt, backoff_ms, "Restarting CTP engine after backoff");

        tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    fn drain_pending_signals(&mut self) {
        while let Ok(reason) = self.restart_rx.try_recv() {
            tracing::debug!(%reason, "Restart signal absorbed by current cycle");
        }
    }

    fn set_state(&self, state: EngineState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Fixed-delay backoff used by tests and local runs.
#[must_use]
pub fn fast_backoff(delay: Duration) -> BackoffConfig {
    BackoffConfig {
        initial_delay: delay,
        max_delay: delay,
        ..BackoffConfig::default()
    }
}

/// Reset `session` whenever the engine process starts or ends.
///
/// A new process has to log in again, so its predecessor's session must
/// never leak into it. Runs until the supervisor is gone.
pub async fn reset_session_on_engine_change(
    mut events: broadcast::Receiver<EngineEvent>,
    session: Arc<SessionTracker>,
) {
    loop {
        match events.recv().await {
            Ok(EngineEvent::Spawned { .. } | EngineEvent::Exited { .. }) => session.reset(),
            Ok(EngineEvent::SpawnFailed { .. }) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Engine events lagged, resetting session");
                session.reset();
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> EngineCommand {
        EngineCommand::new("sh").with_args(["-c", script])
    }

    async fn next_event(rx: &mut broadcast::Receiver<EngineEvent>) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[test]
    fn variant_selects_binary() {
        let home = Path::new("/opt/ctp");
        assert_eq!(EngineVariant::parse("OpenCTP"), Some(EngineVariant::OpenCtp));
        assert_eq!(EngineVariant::parse("production"), Some(EngineVariant::Production));
        assert_eq!(EngineVariant::parse("paper"), None);
        assert_eq!(
            EngineCommand::for_variant(home, EngineVariant::OpenCtp).program(),
            Path::new("/opt/ctp/main_linux_openctp")
        );
    }

    #[tokio::test]
    async fn crashed_engine_is_restarted() {
        let supervisor = EngineSupervisor::new(sh("exit 3"), fast_backoff(Duration::from_millis(10)));
        let mut events = supervisor.subscribe_events();
        let monitor = supervisor.monitor();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervisor.run(cancel.clone()));

        assert!(matches!(next_event(&mut events).await, EngineEvent::Spawned { .. }));
        assert_eq!(
            next_event(&mut events).await,
            EngineEvent::Exited {
                code: Some(3),
                reason: ExitReason::Crashed
            }
        );
        assert!(matches!(next_event(&mut events).await, EngineEvent::Spawned { .. }));

        cancel.cancel();
        task.await.unwrap();
        assert!(monitor.restart_count() >= 1);
        assert_eq!(monitor.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn concurrent_restart_signals_coalesce() {
        let supervisor = EngineSupervisor::new(sh("sleep 30"), fast_backoff(Duration::from_millis(10)));
        let mut events = supervisor.subscribe_events();
        let handle = supervisor.restart_handle();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervisor.run(cancel.clone()));

        let EngineEvent::Spawned { pid: first } = next_event(&mut events).await else {
            panic!("expected spawn");
        };

        assert!(handle.request(RestartReason::QueueOverflow));
        assert!(!handle.request(RestartReason::QueueOverflow));
        assert!(!handle.request(RestartReason::NetworkFailure));
        assert_eq!(handle.signal_count(), 3);

        assert!(matches!(
            next_event(&mut events).await,
            EngineEvent::Exited {
                reason: ExitReason::Restart(RestartReason::QueueOverflow),
                ..
            }
        ));
        let EngineEvent::Spawned { pid: second } = next_event(&mut events).await else {
            panic!("expected respawn");
        };
        assert_ne!(first, second);

        // No second cycle follows.
        assert!(
            tokio::time::timeout(Duration::from_millis(200), events.recv())
                .await
                .is_err()
        );

        cancel.cancel();
        task.await.unwrap();
        assert!(matches!(
            events.recv().await,
            Ok(EngineEvent::Exited {
                reason: ExitReason::Shutdown,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn missing_binary_reports_spawn_failure() {
        let supervisor = EngineSupervisor::new(
            EngineCommand::new("/nonexistent/main_linux"),
            fast_backoff(Duration::from_millis(10)),
        );
        let mut events = supervisor.subscribe_events();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervisor.run(cancel.clone()));

        assert!(matches!(
            next_event(&mut events).await,
            EngineEvent::SpawnFailed { .. }
        ));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn restart_after_supervisor_stops_is_rejected() {
        let supervisor = EngineSupervisor::new(sh("exit 0"), BackoffConfig::default());
        let handle = supervisor.restart_handle();
        drop(supervisor);
        assert!(!handle.request(RestartReason::Manual));
    }
}
