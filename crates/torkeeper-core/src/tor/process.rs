//! Tor process supervision.
//!
//! At most one Tor instance is alive per [`ProcessSupervisor`]. Once
//! launched, Tor is never given new arguments; changes go over the control
//! port. Termination is cooperative: [`ProcessSupervisor::cancel`] asks the
//! supervising task to kill and reap the process, and callers poll
//! [`ProcessSupervisor::is_finished`] to learn when that has happened.

use crate::error::{Error, Result};
use crate::logging::forward_engine_line;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineLaunch {
    /// Tor binary.
    pub binary: PathBuf,
    /// Full argument list.
    pub arguments: Vec<String>,
    /// Forward Tor's stdout through `tracing`.
    pub engine_logging: bool,
}

/// Execution status shared between a handle and its supervising task.
#[derive(Debug)]
pub struct EngineStatus {
    executing: AtomicBool,
    finished: AtomicBool,
    cancelled: AtomicBool,
}

impl EngineStatus {
    fn running() -> Self {
        Self {
            executing: AtomicBool::new(true),
            finished: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Still running.
    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    /// Exited and reaped.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Termination was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Owner side of a launched engine.
///
/// Dropping the handle counts as a cancellation request.
#[derive(Debug)]
pub struct EngineHandle {
    status: Arc<EngineStatus>,
    cancel: Option<oneshot::Sender<()>>,
    pid: Option<u32>,
}

/// Supervisor side of a launched engine.
#[derive(Debug)]
pub struct EngineMonitor {
    status: Arc<EngineStatus>,
    cancel: oneshot::Receiver<()>,
}

impl EngineHandle {
    /// Create a connected handle/monitor pair in the executing state.
    pub fn new(pid: Option<u32>) -> (Self, EngineMonitor) {
        let status = Arc::new(EngineStatus::running());
        let (tx, rx) = oneshot::channel();
        (
            Self {
                status: status.clone(),
                cancel: Some(tx),
                pid,
            },
            EngineMonitor { status, cancel: rx },
        )
    }

    /// Request termination.
    pub fn cancel(&mut self) {
        self.status.cancelled.store(true, Ordering::SeqCst);
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }

    /// Shared status.
    pub fn status(&self) -> &Arc<EngineStatus> {
        &self.status
    }

    /// OS process id, when known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl EngineMonitor {
    /// Resolves when termination is requested or the handle is dropped.
    pub async fn cancelled(&mut self) {
        let _ = (&mut self.cancel).await;
    }

    /// Mark the engine as exited.
    pub fn finish(self) {
        self.status.executing.store(false, Ordering::SeqCst);
        self.status.finished.store(true, Ordering::SeqCst);
    }
}

/// Launches engine processes.
pub trait EngineSpawner: Send + Sync {
    /// Launch and return the owner handle. Must be called inside a runtime.
    fn spawn(&self, launch: EngineLaunch) -> Result<EngineHandle>;
}

/// Launches the real `tor` binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct TorProcessSpawner;

impl EngineSpawner for TorProcessSpawner {
    fn spawn(&self, launch: EngineLaunch) -> Result<EngineHandle> {
        let mut cmd = Command::new(&launch.binary);
        cmd.args(&launch.arguments)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if launch.engine_logging {
            cmd.stdout(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null());
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::Engine(format!("failed to launch {}: {}", launch.binary.display(), e))
        })?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout));
        }

        info!(pid = ?pid, "Tor process launched");

        let (handle, mut monitor) = EngineHandle::new(pid);
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => info!(%status, "Tor process exited"),
                    Err(e) => warn!(error = %e, "Failed to wait for Tor process"),
                },
                _ = monitor.cancelled() => {
                    match child.kill().await {
                        Ok(()) => info!("Tor process terminated"),
                        Err(e) => warn!(error = %e, "Failed to terminate Tor process"),
                    }
                }
            }
            monitor.finish();
        });

        Ok(handle)
    }
}

async fn forward_output(stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => forward_engine_line(&line),
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Tor output closed");
                break;
            }
        }
    }
}

/// Owns the single engine slot.
pub struct ProcessSupervisor {
    spawner: Arc<dyn EngineSpawner>,
    current: Option<EngineHandle>,
}

impl ProcessSupervisor {
    /// Supervisor launching through `spawner`.
    pub fn new(spawner: Arc<dyn EngineSpawner>) -> Self {
        Self {
            spawner,
            current: None,
        }
    }

    /// A live, non-cancelled engine is present.
    pub fn is_running(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|h| !h.status.is_cancelled() && !h.status.is_finished())
    }

    /// Any engine handle is held, live or not.
    pub fn has_engine(&self) -> bool {
        self.current.is_some()
    }

    /// Launch the engine. Fails if one is already running.
    pub fn start(&mut self, launch: EngineLaunch) -> Result<()> {
        if self.is_running() {
            return Err(Error::Engine("engine already running".into()));
        }
        let handle = self.spawner.spawn(launch)?;
        self.current = Some(handle);
        Ok(())
    }

    /// Request termination of the current engine and return its status for
    /// polling.
    pub fn cancel(&mut self) -> Option<Arc<EngineStatus>> {
        let handle = self.current.as_mut()?;
        handle.cancel();
        Some(handle.status.clone())
    }

    /// No engine, or the engine has exited.
    pub fn is_finished(&self) -> bool {
        self.current.as_ref().map_or(true, |h| h.status.is_finished())
    }

    /// The engine is still executing.
    pub fn is_executing(&self) -> bool {
        self.current.as_ref().is_some_and(|h| h.status.is_executing())
    }

    /// Drop the handle if it is the one `status` belongs to.
    pub fn clear_if(&mut self, status: &Arc<EngineStatus>) {
        if self
            .current
            .as_ref()
            .is_some_and(|h| Arc::ptr_eq(&h.status, status))
        {
            self.current = None;
        }
    }

    /// Process id of the current engine.
    pub fn pid(&self) -> Option<u32> {
        self.current.as_ref().and_then(EngineHandle::pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Spawner whose engines exit as soon as they are cancelled.
    #[derive(Default)]
    struct CountingSpawner {
        launches: Mutex<Vec<EngineLaunch>>,
    }

    impl EngineSpawner for CountingSpawner {
        fn spawn(&self, launch: EngineLaunch) -> Result<EngineHandle> {
            self.launches.lock().expect("lock").push(launch);
            let (handle, mut monitor) = EngineHandle::new(None);
            tokio::spawn(async move {
                monitor.cancelled().await;
                monitor.finish();
            });
            Ok(handle)
        }
    }

    fn launch() -> EngineLaunch {
        EngineLaunch {
            binary: PathBuf::from("tor"),
            arguments: vec!["--AvoidDiskWrites".into(), "1".into()],
            engine_logging: false,
        }
    }

    #[tokio::test]
    async fn test_start_once_while_running() {
        let spawner = Arc::new(CountingSpawner::default());
        let mut supervisor = ProcessSupervisor::new(spawner.clone());

        supervisor.start(launch()).expect("first start");
        assert!(supervisor.is_running());
        assert!(supervisor.is_executing());
        assert!(matches!(supervisor.start(launch()), Err(Error::Engine(_))));
        assert_eq!(spawner.launches.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_then_finish() {
        let spawner = Arc::new(CountingSpawner::default());
        let mut supervisor = ProcessSupervisor::new(spawner);
        supervisor.start(launch()).expect("start");

        let status = supervisor.cancel().expect("status");
        assert!(!supervisor.is_running());

        for _ in 0..10 {
            if status.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(supervisor.is_finished());
        assert!(!supervisor.is_executing());

        supervisor.clear_if(&status);
        assert!(!supervisor.has_engine());
    }

    #[tokio::test]
    async fn test_restart_after_cancel() {
        let spawner = Arc::new(CountingSpawner::default());
        let mut supervisor = ProcessSupervisor::new(spawner.clone());
        supervisor.start(launch()).expect("start");
        let old = supervisor.cancel().expect("status");

        supervisor.start(launch()).expect("restart");
        assert!(supervisor.is_running());

        // Clearing with the stale status leaves the new engine alone.
        supervisor.clear_if(&old);
        assert!(supervisor.has_engine());
        assert_eq!(spawner.launches.lock().expect("lock").len(), 2);
    }

    #[test]
    fn test_empty_supervisor() {
        let supervisor = ProcessSupervisor::new(Arc::new(CountingSpawner::default()));
        assert!(!supervisor.is_running());
        assert!(supervisor.is_finished());
        assert!(!supervisor.is_executing());
    }

    #[tokio::test]
    async fn test_dropped_handle_counts_as_cancel() {
        let (handle, mut monitor) = EngineHandle::new(Some(42));
        assert_eq!(handle.pid(), Some(42));
        drop(handle);
        monitor.cancelled().await;
        let status = monitor.status.clone();
        monitor.finish();
        assert!(status.is_finished());
    }

    #[tokio::test]
    async fn test_missing_binary_is_engine_error() {
        let result = TorProcessSpawner.spawn(EngineLaunch {
            binary: PathBuf::from("/nonexistent/torkeeper-test-tor"),
            arguments: Vec::new(),
            engine_logging: false,
        });
        assert!(matches!(result, Err(Error::Engine(_))));
    }
}
