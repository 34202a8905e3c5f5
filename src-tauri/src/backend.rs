// NovelMind Backend Supervisor
// Spawns, tracks, and tears down the Python analysis sidecar. The backend is
// an opaque collaborator reached only over HTTP on a port chosen at startup.

use crate::error::{NovelMindError, Result};
use crate::launch_plan::LaunchPlan;
use crate::logs::{LogRingBuffer, SessionLog};
use serde::Serialize;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Fallback port when allocation fails or the UI runs outside the shell.
pub const DEFAULT_BACKEND_PORT: u16 = 5001;

/// Upper bound on waiting for the killed process to be reaped; shutdown
/// proceeds regardless once this elapses.
const KILL_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Ask the OS for an ephemeral port by binding and immediately releasing a
/// loopback listener. Another process could claim the port between release
/// and the backend's own bind; that race is accepted and not retried.
pub fn allocate_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).map_err(|e| {
        NovelMindError::PortAllocation(format!("Failed to bind an ephemeral port: {}", e))
    })?;
    let port = listener
        .local_addr()
        .map_err(|e| {
            NovelMindError::PortAllocation(format!("Failed to read the bound port: {}", e))
        })?
        .port();
    drop(listener);
    Ok(port)
}

/// Backend process state
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    NotStarted,
    Starting,
    Running,
    Exited,
    Killed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub state: BackendState,
    pub port: Option<u16>,
    pub pid: Option<u32>,
}

pub struct BackendManager {
    state: Arc<RwLock<BackendState>>,
    /// Serializes start/stop transitions so a second launch cannot slip in
    /// between the state check and the spawn.
    lifecycle_lock: Mutex<()>,
    process: Arc<Mutex<Option<Child>>>,
    /// Write-once for the session; read synchronously by the port bridge.
    port: std::sync::RwLock<Option<u16>>,
    /// Always-drained stdout/stderr lines from the backend.
    log_buffer: Arc<LogRingBuffer>,
    session_log: std::sync::RwLock<Option<Arc<SessionLog>>>,
}

impl BackendManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(BackendState::NotStarted)),
            lifecycle_lock: Mutex::new(()),
            process: Arc::new(Mutex::new(None)),
            port: std::sync::RwLock::new(None),
            log_buffer: Arc::new(LogRingBuffer::new(2000)),
            session_log: std::sync::RwLock::new(None),
        }
    }

    pub async fn state(&self) -> BackendState {
        *self.state.read().await
    }

    /// The port allocated for this session, if any.
    pub fn port(&self) -> Option<u16> {
        *self.port.read().unwrap()
    }

    /// Record the session port. Set once during setup, before the backend is
    /// spawned and before any window exists to query it.
    pub fn set_port(&self, port: u16) {
        *self.port.write().unwrap() = Some(port);
    }

    /// Mirror the backend's output into an append-only session log file.
    pub fn attach_session_log(&self, log: Arc<SessionLog>) {
        *self.session_log.write().unwrap() = Some(log);
    }

    pub fn logs_snapshot(&self, last_n: usize) -> (Vec<String>, u64) {
        (
            self.log_buffer.snapshot(last_n),
            self.log_buffer.dropped_total(),
        )
    }

    pub async fn status(&self) -> BackendStatus {
        BackendStatus {
            state: *self.state.read().await,
            port: self.port(),
            pid: self.process.lock().await.as_ref().map(|p| p.id()),
        }
    }

    /// Launch the backend according to `plan`.
    ///
    /// Refuses while a previous launch is starting or running: the session
    /// owns at most one backend process, and a silent double-spawn would
    /// orphan the first one.
    pub async fn start(&self, plan: LaunchPlan) -> Result<()> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        {
            let state = self.state.read().await;
            if matches!(*state, BackendState::Starting | BackendState::Running) {
                return Err(NovelMindError::Launch(
                    "Backend already running; refusing duplicate launch".to_string(),
                ));
            }
        }
        {
            *self.state.write().await = BackendState::Starting;
        }

        let port = self.port().unwrap_or(DEFAULT_BACKEND_PORT);
        tracing::info!(
            "Launching analysis backend: {:?} {:?} (port {})",
            plan.program,
            plan.args,
            port
        );
        if plan.interpreter_fallback {
            tracing::warn!(
                "No bundled backend executable found; falling back to a system interpreter. \
                 This is unreliable in a packaged install."
            );
        }

        let mut cmd = Command::new(&plan.program);
        cmd.args(&plan.args).current_dir(&plan.cwd);
        // The allocated port and the unbuffered-output flag ride on top of
        // the inherited parent environment.
        for (key, value) in &plan.envs {
            cmd.env(key, value);
        }

        // Hide console window on Windows
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                *self.state.write().await = BackendState::Exited;
                return Err(NovelMindError::Launch(format!(
                    "Failed to spawn backend ({:?}): {}",
                    plan.program, e
                )));
            }
        };

        let session_log = self.session_log.read().unwrap().clone();
        if let Some(log) = &session_log {
            log.write_session_start(port);
        }

        // Always drain stdout/stderr once piped; an undrained pipe deadlocks
        // the child when its stdio buffers fill.
        {
            use std::io::{BufRead, BufReader};

            if let Some(stdout) = child.stdout.take() {
                let ring = self.log_buffer.clone();
                let session = session_log.clone();
                std::thread::spawn(move || {
                    let reader = BufReader::new(stdout);
                    for line in reader.lines().flatten() {
                        if let Some(log) = &session {
                            log.write_line(&line);
                        }
                        ring.push(format!("STDOUT {line}"));
                    }
                });
            }

            if let Some(stderr) = child.stderr.take() {
                let ring = self.log_buffer.clone();
                let session = session_log.clone();
                std::thread::spawn(move || {
                    let reader = BufReader::new(stderr);
                    for line in reader.lines().flatten() {
                        if let Some(log) = &session {
                            log.write_line(&line);
                        }
                        ring.push(format!("STDERR {line}"));
                    }
                });
            }
        }

        let pid = child.id();
        {
            let mut process_guard = self.process.lock().await;
            *process_guard = Some(child);
        }
        {
            *self.state.write().await = BackendState::Running;
        }
        tracing::info!("Analysis backend started (pid {})", pid);

        self.spawn_exit_watcher(session_log);
        Ok(())
    }

    /// Observe the child until it exits on its own or the terminator takes
    /// it. An unexpected exit is logged with its code and the handle cleared
    /// so a future launch can proceed. No automatic relaunch.
    fn spawn_exit_watcher(&self, session_log: Option<Arc<SessionLog>>) {
        let process = self.process.clone();
        let state = self.state.clone();
        let ring = self.log_buffer.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
                let mut guard = process.lock().await;
                let Some(child) = guard.as_mut() else {
                    // Terminator already took the handle.
                    break;
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        let code = status.code();
                        tracing::warn!(
                            "Backend process exited unexpectedly with status {}",
                            status
                        );
                        let code_text = code
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "unknown".to_string());
                        if let Some(log) = &session_log {
                            log.write_exit(code);
                        }
                        ring.push(format!(
                            "[Exit] Backend process exited with code {}",
                            code_text
                        ));
                        *guard = None;
                        drop(guard);
                        *state.write().await = BackendState::Exited;
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!("Failed to query backend process status: {}", e);
                    }
                }
            }
        });
    }

    /// Tear down the backend process tree. Idempotent: an already-exited or
    /// never-started backend is a no-op, never an error. The kill is awaited
    /// with a bounded timeout so shutdown can proceed regardless.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        let child = {
            let mut process_guard = self.process.lock().await;
            process_guard.take()
        };
        let Some(child) = child else {
            return Ok(());
        };

        let pid = child.id();
        tracing::info!("Stopping analysis backend (pid {})", pid);
        {
            *self.state.write().await = BackendState::Killed;
        }

        let session_log = self.session_log.read().unwrap().clone();
        let outcome = tokio::time::timeout(
            KILL_WAIT_TIMEOUT,
            tokio::task::spawn_blocking(move || kill_process_tree(child)),
        )
        .await;

        match outcome {
            Ok(Ok(exit_code)) => {
                if let Some(log) = &session_log {
                    log.write_exit(exit_code);
                }
                tracing::info!("Analysis backend stopped");
            }
            Ok(Err(e)) => tracing::warn!("Backend kill task failed: {}", e),
            Err(_) => {
                tracing::warn!("Timed out waiting for backend to exit; continuing shutdown")
            }
        }
        Ok(())
    }
}

impl Default for BackendManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackendManager {
    fn drop(&mut self) {
        // Last-resort cleanup; Drop can't be async.
        if let Ok(mut process_guard) = self.process.try_lock() {
            if let Some(mut child) = process_guard.take() {
                tracing::info!("Killing analysis backend on drop");
                let _ = child.kill();
            }
        }
    }
}

/// Kill the process (tree, where the platform requires it) and reap it.
/// A process that already exited is treated as success.
fn kill_process_tree(mut child: Child) -> Option<i32> {
    #[cfg(windows)]
    {
        // The backend may have spawned workers of its own; taskkill /T takes
        // the whole tree down.
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;

        let pid = child.id();
        let mut cmd = Command::new("taskkill");
        cmd.args(["/F", "/T", "/PID", &pid.to_string()]);
        cmd.creation_flags(CREATE_NO_WINDOW);
        match cmd.output() {
            Ok(output) if !output.status.success() => {
                // "process not found" lands here when it already exited.
                tracing::debug!(
                    "taskkill: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to run taskkill: {}", e),
        }
    }

    #[cfg(not(windows))]
    {
        // A kill error means the process is already gone.
        let _ = child.kill();
    }

    match child.wait() {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!("Failed to reap backend process: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch_plan::{BACKEND_PORT_ENV, UNBUFFERED_ENV};
    use std::collections::HashMap;
    use std::time::Instant;

    #[test]
    fn allocated_port_is_usable_after_release() {
        let port = allocate_port().unwrap();
        assert!(port > 0);
        // Best effort: the port should be bindable right after release.
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[test]
    fn allocated_ports_are_distinct_across_calls() {
        // Not guaranteed by the OS, but consecutive allocations colliding
        // would point at the listener not being released.
        let a = allocate_port().unwrap();
        let _hold = std::net::TcpListener::bind(("127.0.0.1", a)).unwrap();
        let b = allocate_port().unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn stop_without_launch_is_a_noop() {
        let manager = BackendManager::new();
        manager.stop().await.unwrap();
        manager.stop().await.unwrap();
        assert_eq!(manager.state().await, BackendState::NotStarted);
        assert!(manager.status().await.pid.is_none());
    }

    #[cfg(unix)]
    fn shell_plan(script: &str, envs: HashMap<String, String>) -> LaunchPlan {
        LaunchPlan {
            program: "/bin/sh".into(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: std::env::temp_dir(),
            envs,
            interpreter_fallback: false,
        }
    }

    #[cfg(unix)]
    async fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met within 5s");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_injects_port_into_child_environment() {
        let manager = BackendManager::new();
        manager.set_port(43210);

        let mut envs = HashMap::new();
        envs.insert(BACKEND_PORT_ENV.to_string(), "43210".to_string());
        envs.insert(UNBUFFERED_ENV.to_string(), "1".to_string());
        let plan = shell_plan("echo PORT=$APP_PORT UNBUF=$PYTHONUNBUFFERED", envs);

        manager.start(plan).await.unwrap();
        wait_for(|| {
            manager
                .logs_snapshot(50)
                .0
                .iter()
                .any(|l| l.contains("PORT=43210 UNBUF=1"))
        })
        .await;
        manager.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unexpected_exit_clears_handle_and_logs_code() {
        let manager = BackendManager::new();
        manager.set_port(5001);

        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(SessionLog::open(&dir.path().join("backend.log")).unwrap());
        manager.attach_session_log(session.clone());

        manager
            .start(shell_plan("exit 7", HashMap::new()))
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.state().await != BackendState::Exited {
            assert!(Instant::now() < deadline, "backend did not exit within 5s");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(manager.status().await.pid.is_none());
        let (lines, _) = manager.logs_snapshot(50);
        assert!(lines
            .iter()
            .any(|l| l.contains("[Exit] Backend process exited with code 7")));
        let contents = std::fs::read_to_string(session.path()).unwrap();
        assert!(contents.contains("exited with code 7"));

        // Handle cleared: a future launch proceeds.
        manager
            .start(shell_plan("exit 0", HashMap::new()))
            .await
            .unwrap();
        manager.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn duplicate_launch_is_refused() {
        let manager = BackendManager::new();
        manager.set_port(5001);

        manager
            .start(shell_plan("sleep 5", HashMap::new()))
            .await
            .unwrap();
        let err = manager
            .start(shell_plan("sleep 5", HashMap::new()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("refusing duplicate launch"));

        manager.stop().await.unwrap();
        assert_eq!(manager.state().await, BackendState::Killed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_is_idempotent_after_kill() {
        let manager = BackendManager::new();
        manager.set_port(5001);

        manager
            .start(shell_plan("sleep 30", HashMap::new()))
            .await
            .unwrap();
        manager.stop().await.unwrap();
        manager.stop().await.unwrap();
        assert_eq!(manager.state().await, BackendState::Killed);
        assert!(manager.status().await.pid.is_none());
    }

    #[test]
    fn port_is_write_once_read_many() {
        let manager = BackendManager::new();
        assert_eq!(manager.port(), None);
        manager.set_port(6001);
        assert_eq!(manager.port(), Some(6001));
    }
}
