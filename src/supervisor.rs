//! Engine process supervision.
//!
//! The [`Supervisor`] keeps one engine process alive for the lifetime of the
//! gateway. A background task launches it, forwards its stdout/stderr lines to
//! `tracing` under the `docbridge::engine` target, waits for it to exit, sleeps
//! for the configured backoff and launches it again. There is no restart limit.
//!
//! Crashes are never reported to callers. Sessions only see the engine
//! through [`EngineEndpoint`], and discover an absent engine by failing to
//! connect.

use crate::bridge::BridgeAddress;
use crate::error::GatewayError;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// What sessions may know about the engine: where it listens, and whether a
/// process is currently up. No process control.
pub trait EngineEndpoint: Send + Sync {
    fn current_address(&self) -> BridgeAddress;

    fn is_available(&self) -> bool;
}

/// An engine managed outside this process.
#[derive(Debug, Clone)]
pub struct StaticEndpoint {
    address: BridgeAddress,
}

impl StaticEndpoint {
    pub fn new(address: BridgeAddress) -> Self {
        Self { address }
    }
}

impl EngineEndpoint for StaticEndpoint {
    fn current_address(&self) -> BridgeAddress {
        self.address.clone()
    }

    fn is_available(&self) -> bool {
        true
    }
}

// ── Command ──────────────────────────────────────────────────────────────

/// Program and arguments used for every launch.
#[derive(Debug, Clone)]
pub struct EngineCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl EngineCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Headless office engine bound to `address`, with its own profile in
    /// `profile_dir` so it never shares state with a desktop instance.
    pub fn soffice(
        program: impl Into<PathBuf>,
        profile_dir: &Path,
        address: &BridgeAddress,
    ) -> Result<Self, GatewayError> {
        let profile = Url::from_file_path(profile_dir).map_err(|()| {
            GatewayError::InvalidConfig(format!(
                "profile directory must be absolute: {}",
                profile_dir.display()
            ))
        })?;

        Ok(Self::new(program)
            .arg(format!("-env:UserInstallation={profile}"))
            .arg("-env:JFW_PLUGIN_DO_NOT_CHECK_ACCESSIBILITY=1")
            .arg("--nologo")
            .arg("--headless")
            .arg("--invisible")
            .arg("--nocrashreport")
            .arg("--nodefault")
            .arg("--norestore")
            .arg("--safe-mode")
            .arg(address.accept_arg()))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

// ── Supervisor ───────────────────────────────────────────────────────────

#[derive(Default)]
struct SupervisorState {
    launches: AtomicU64,
    running: AtomicBool,
    last_exit: Mutex<Option<ExitStatus>>,
}

/// Owns the engine process and its restart loop.
pub struct Supervisor {
    address: BridgeAddress,
    state: Arc<SupervisorState>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Start supervising `command`. Must be called from within a Tokio runtime.
    pub fn start(command: EngineCommand, address: BridgeAddress, backoff: Duration) -> Arc<Self> {
        let state = Arc::new(SupervisorState::default());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(supervise(
            command,
            Arc::clone(&state),
            backoff,
            shutdown.clone(),
        ));
        info!("Engine supervisor started for {}", address);

        Arc::new(Self {
            address,
            state,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// Number of launch attempts so far, failed spawns included.
    pub fn launches(&self) -> u64 {
        self.state.launches.load(Ordering::Acquire)
    }

    /// Exit status of the most recent engine process.
    pub fn last_exit(&self) -> Option<ExitStatus> {
        self.state.last_exit.lock().ok().and_then(|guard| *guard)
    }

    /// Stop the restart loop and kill the running engine. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Supervisor task failed: {e}");
            }
        }
    }
}

impl EngineEndpoint for Supervisor {
    fn current_address(&self) -> BridgeAddress {
        self.address.clone()
    }

    fn is_available(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }
}

async fn supervise(
    command: EngineCommand,
    state: Arc<SupervisorState>,
    backoff: Duration,
    shutdown: CancellationToken,
) {
    while !shutdown.is_cancelled() {
        state.launches.fetch_add(1, Ordering::AcqRel);
        let spawned = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(mut child) => {
                info!("Engine launched (pid {:?})", child.id());
                state.running.store(true, Ordering::Release);
                if let Some(stdout) = child.stdout.take() {
                    drain(stdout, "stdout");
                }
                if let Some(stderr) = child.stderr.take() {
                    drain(stderr, "stderr");
                }

                tokio::select! {
                    status = child.wait() => {
                        state.running.store(false, Ordering::Release);
                        match status {
                            Ok(status) => {
                                warn!("Engine exited with {status}");
                                if let Ok(mut last) = state.last_exit.lock() {
                                    *last = Some(status);
                                }
                            }
                            Err(e) => warn!("Failed to wait for engine: {e}"),
                        }
                    }
                    _ = shutdown.cancelled() => {
                        if let Err(e) = child.kill().await {
                            warn!("Failed to kill engine: {e}");
                        }
                        state.running.store(false, Ordering::Release);
                        info!("Engine stopped");
                        break;
                    }
                }
            }
            Err(e) => error!(
                "Failed to launch engine {}: {e}",
                command.program.display()
            ),
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => debug!("Relaunching engine"),
            _ = shutdown.cancelled() => break,
        }
    }
    debug!("Engine supervisor stopped");
}

/// Forward each output line of the engine to the log.
///
/// Lines are read as raw bytes: the pipe must stay open whatever the engine
/// prints, or its next write dies with SIGPIPE.
fn drain<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    let text = text.trim_end_matches(['\n', '\r']);
                    info!(target: "docbridge::engine", stream, "{text}");
                }
                Err(e) => {
                    debug!("Engine {stream} closed: {e}");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> EngineCommand {
        EngineCommand::new("/bin/sh").arg("-c").arg(script)
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn soffice_arguments() {
        let address = BridgeAddress::default();
        let command =
            EngineCommand::soffice("/usr/bin/soffice", Path::new("/tmp/soffice"), &address)
                .unwrap();
        assert_eq!(command.program(), Path::new("/usr/bin/soffice"));
        let args = command.args();
        assert_eq!(args[0], "-env:UserInstallation=file:///tmp/soffice");
        assert!(args.contains(&"--headless".to_string()));
        assert!(args.contains(&"--norestore".to_string()));
        assert_eq!(args.last().unwrap(), &address.accept_arg());
    }

    #[test]
    fn relative_profile_is_rejected() {
        let err = EngineCommand::soffice("soffice", Path::new("profile"), &BridgeAddress::default())
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn restarts_exited_engine_after_backoff() {
        let backoff = Duration::from_millis(50);
        let address = BridgeAddress::default();
        let started = Instant::now();
        let supervisor = Supervisor::start(sh("exit 3"), address.clone(), backoff);

        wait_for(|| supervisor.launches() >= 3).await;
        assert!(started.elapsed() >= backoff * 2);
        assert_eq!(supervisor.last_exit().and_then(|s| s.code()), Some(3));
        assert_eq!(supervisor.current_address(), address);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn backoff_limits_restart_rate() {
        let backoff = Duration::from_millis(100);
        let supervisor = Supervisor::start(sh("exit 0"), BridgeAddress::default(), backoff);
        tokio::time::sleep(Duration::from_millis(350)).await;
        supervisor.shutdown().await;

        let launches = supervisor.launches();
        assert!((2..=4).contains(&launches), "launches = {launches}");
    }

    #[tokio::test]
    async fn shutdown_kills_running_engine() {
        let supervisor = Supervisor::start(
            sh("echo ready; sleep 30"),
            BridgeAddress::default(),
            Duration::from_millis(50),
        );
        wait_for(|| supervisor.is_available()).await;

        let started = Instant::now();
        supervisor.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!supervisor.is_available());
        assert_eq!(supervisor.launches(), 1);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn non_utf8_output_keeps_engine_alive() {
        let supervisor = Supervisor::start(
            sh("printf '\\377\\n'; sleep 0.3; echo one; echo two; echo three; sleep 30"),
            BridgeAddress::default(),
            Duration::from_millis(50),
        );
        wait_for(|| supervisor.is_available()).await;
        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert_eq!(supervisor.launches(), 1);
        assert!(supervisor.is_available());
        assert!(supervisor.last_exit().is_none());
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn spawn_failures_are_retried() {
        let supervisor = Supervisor::start(
            EngineCommand::new("/nonexistent/engine"),
            BridgeAddress::default(),
            Duration::from_millis(20),
        );
        wait_for(|| supervisor.launches() >= 2).await;
        assert!(!supervisor.is_available());
        supervisor.shutdown().await;
    }
}
