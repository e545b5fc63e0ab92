//! Launching and tearing down one proxy-core process per lifecycle.
//!
//! The proxy core is a black box: it is started with a config path, observed
//! through liveness only, and stopped with a signal. Nothing here speaks its
//! protocol.

use std::{
    ffi::OsString,
    fmt,
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    process::ExitStatus,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::AsyncReadExt,
    net::TcpStream,
    process::{ChildStderr, Command},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, warn};

use crate::{config::ReadinessMode, template::ConfigArtifact};

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(50);
const READINESS_CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
const STDERR_CAPTURE_LIMIT: usize = 64 * 1024;
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

pub type TerminateFuture<'a> = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;
pub type StderrFuture<'a> = Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>>;

/// Starts a proxy-core process for a materialized config.
pub trait ProxyLauncher: Send + Sync {
    fn launch(&self, artifact: &ConfigArtifact) -> Result<Box<dyn ProxyProcess>, LaunchError>;
}

/// Handle to one running (or exited) proxy-core process.
pub trait ProxyProcess: Send {
    fn is_alive(&mut self) -> bool;

    /// Stops the process if it is still running and waits for it to exit.
    fn terminate(&mut self, stop_timeout: Duration) -> TerminateFuture<'_>;

    /// Last-resort synchronous kill, used when a lifecycle is dropped without
    /// an orderly teardown.
    fn kill_now(&mut self);

    /// Whatever the process wrote to stderr so far, if the launcher captured it.
    fn stderr_output(&mut self) -> StderrFuture<'_> {
        Box::pin(async { None })
    }
}

#[derive(Debug)]
pub enum LaunchError {
    NotFound { program: PathBuf },
    Spawn { program: PathBuf, source: std::io::Error },
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { program } => {
                write!(f, "proxy core not found: {}", program.display())
            }
            Self::Spawn { program, source } => {
                write!(f, "spawn {}: {source}", program.display())
            }
        }
    }
}

impl std::error::Error for LaunchError {}

/// Runs `<program> <args...> <config-path>`. stdin and stdout are discarded;
/// stderr is too unless [`CommandLauncher::capture_stderr`] is set.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    capture_stderr: bool,
}

impl CommandLauncher {
    pub fn new(
        program: impl Into<PathBuf>,
        args: impl IntoIterator<Item = impl Into<OsString>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            capture_stderr: false,
        }
    }

    /// Keeps the first 64 KiB of stderr for diagnostics. Only for single runs;
    /// scans discard it.
    pub fn capture_stderr(mut self) -> Self {
        self.capture_stderr = true;
        self
    }

    /// `xray run -c <config-path>`.
    pub fn xray(bin: impl Into<PathBuf>) -> Self {
        Self::new(bin, ["run", "-c"])
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl ProxyLauncher for CommandLauncher {
    fn launch(&self, artifact: &ConfigArtifact) -> Result<Box<dyn ProxyProcess>, LaunchError> {
        let stderr = if self.capture_stderr {
            std::process::Stdio::piped()
        } else {
            std::process::Stdio::null()
        };
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&artifact.path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    LaunchError::NotFound {
                        program: self.program.clone(),
                    }
                } else {
                    LaunchError::Spawn {
                        program: self.program.clone(),
                        source: err,
                    }
                }
            })?;
        debug!(pid = child.id(), port = artifact.port, "proxy core launched");
        let stderr = child.stderr.take().map(StderrCapture::spawn);
        Ok(Box::new(ChildProcess { child, stderr }))
    }
}

/// Drains a piped stderr in the background so the child never blocks on a
/// full pipe.
struct StderrCapture {
    buf: Arc<Mutex<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl StderrCapture {
    fn spawn(mut stderr: ChildStderr) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let reader = tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            while let Ok(n) = stderr.read(&mut chunk).await {
                if n == 0 {
                    break;
                }
                let Ok(mut buf) = sink.lock() else {
                    break;
                };
                let room = STDERR_CAPTURE_LIMIT.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        });
        Self {
            buf,
            reader: Some(reader),
        }
    }

    async fn snapshot(&mut self) -> String {
        // An exited child closes the pipe, so the reader finishes promptly.
        if let Some(reader) = self.reader.as_mut()
            && tokio::time::timeout(STDERR_DRAIN_TIMEOUT, reader).await.is_ok()
        {
            self.reader = None;
        }
        match self.buf.lock() {
            Ok(buf) => String::from_utf8_lossy(&buf).into_owned(),
            Err(_) => String::new(),
        }
    }
}

impl Drop for StderrCapture {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

struct ChildProcess {
    child: tokio::process::Child,
    stderr: Option<StderrCapture>,
}

/// `try_wait` errors leave the child's state unknown; it still gets signalled.
fn needs_stop(status: &std::io::Result<Option<ExitStatus>>) -> bool {
    !matches!(status, Ok(Some(_)))
}

impl ProxyProcess for ChildProcess {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self, stop_timeout: Duration) -> TerminateFuture<'_> {
        Box::pin(async move {
            let status = self.child.try_wait();
            if let Err(err) = &status {
                debug!(error = %err, "try_wait failed; stopping proxy core anyway");
            }
            if !needs_stop(&status) {
                return Ok(());
            }

            request_graceful_stop(&self.child);
            match tokio::time::timeout(stop_timeout, self.child.wait()).await {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(err)) => debug!(error = %err, "wait after graceful stop failed"),
                Err(_) => debug!("proxy core ignored graceful stop; killing"),
            }

            match tokio::time::timeout(stop_timeout, self.child.kill()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(format!("kill proxy core: {err}")),
                Err(_) => Err("proxy core did not exit after kill".to_string()),
            }
        })
    }

    fn kill_now(&mut self) {
        let _ = self.child.start_kill();
    }

    fn stderr_output(&mut self) -> StderrFuture<'_> {
        Box::pin(async move {
            match self.stderr.as_mut() {
                Some(capture) => Some(capture.snapshot().await),
                None => None,
            }
        })
    }
}

#[cfg(unix)]
fn request_graceful_stop(child: &tokio::process::Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: `pid` belongs to a child we own and have not reaped yet.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn request_graceful_stop(_child: &tokio::process::Child) {}

/// How a freshly launched process is judged ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub mode: ReadinessMode,
    /// Upper bound on the wait in both modes.
    pub grace: Duration,
}

impl Readiness {
    pub fn sleep(grace: Duration) -> Self {
        Self {
            mode: ReadinessMode::Sleep,
            grace,
        }
    }

    pub fn connect(grace: Duration) -> Self {
        Self {
            mode: ReadinessMode::Connect,
            grace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Pending,
    ConfigWritten,
    Launched,
    ReadyProbing,
    FailedEarly,
    TornDown,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::ConfigWritten => "config_written",
            Self::Launched => "launched",
            Self::ReadyProbing => "ready_probing",
            Self::FailedEarly => "failed_early",
            Self::TornDown => "torn_down",
        }
    }
}

/// Owns the process and config artifact of one candidate.
///
/// `teardown` must run on every path; it is idempotent. Dropping a lifecycle
/// that was not torn down kills the process and unlinks the artifact without
/// waiting.
pub struct Lifecycle {
    state: LifecycleState,
    artifact: Option<ConfigArtifact>,
    process: Option<Box<dyn ProxyProcess>>,
    stop_timeout: Duration,
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &self.state)
            .field("artifact", &self.artifact)
            .field("has_process", &self.process.is_some())
            .finish()
    }
}

impl Lifecycle {
    pub fn new(stop_timeout: Duration) -> Self {
        Self {
            state: LifecycleState::Pending,
            artifact: None,
            process: None,
            stop_timeout,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn artifact(&self) -> Option<&ConfigArtifact> {
        self.artifact.as_ref()
    }

    pub fn attach_artifact(&mut self, artifact: ConfigArtifact) {
        self.artifact = Some(artifact);
        self.state = LifecycleState::ConfigWritten;
    }

    /// Launches the process and waits for readiness. `Ok(false)` means the
    /// process exited (or never opened its port) within the grace period.
    pub async fn run(
        &mut self,
        launcher: &Arc<dyn ProxyLauncher>,
        readiness: Readiness,
    ) -> Result<bool, LaunchError> {
        let Some(artifact) = self.artifact.as_ref() else {
            self.state = LifecycleState::FailedEarly;
            return Ok(false);
        };
        let port = artifact.port;
        let process = launcher.launch(artifact)?;
        self.state = LifecycleState::Launched;
        let process = self.process.insert(process);

        let ready = wait_ready(process.as_mut(), port, readiness).await;
        self.state = if ready {
            LifecycleState::ReadyProbing
        } else {
            LifecycleState::FailedEarly
        };
        Ok(ready)
    }

    /// Captured stderr of the launched process, if any was captured.
    pub async fn stderr_output(&mut self) -> Option<String> {
        match self.process.as_mut() {
            Some(process) => process.stderr_output().await,
            None => None,
        }
    }

    /// Stops the process and deletes the artifact. Returns cleanup warnings;
    /// a second call is a no-op.
    pub async fn teardown(&mut self) -> Vec<String> {
        if self.state == LifecycleState::TornDown {
            return Vec::new();
        }

        let mut warnings = Vec::new();
        if let Some(mut process) = self.process.take() {
            if let Err(err) = process.terminate(self.stop_timeout).await {
                warn!(error = %err, "proxy core did not stop cleanly");
                warnings.push(err);
                process.kill_now();
            }
        }

        if let Some(artifact) = self.artifact.take()
            && let Err(err) = remove_artifact(&artifact.path)
        {
            warn!(
                path = %artifact.path.display(),
                error = %err,
                "failed to remove config artifact"
            );
            warnings.push(format!("remove {}: {err}", artifact.path.display()));
        }

        self.state = LifecycleState::TornDown;
        warnings
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        if self.state == LifecycleState::TornDown {
            return;
        }
        if let Some(process) = self.process.as_mut() {
            process.kill_now();
        }
        if let Some(artifact) = self.artifact.as_ref() {
            let _ = remove_artifact(&artifact.path);
        }
    }
}

fn remove_artifact(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

async fn wait_ready(process: &mut dyn ProxyProcess, port: u16, readiness: Readiness) -> bool {
    match readiness.mode {
        ReadinessMode::Sleep => {
            tokio::time::sleep(readiness.grace).await;
            process.is_alive()
        }
        ReadinessMode::Connect => {
            let deadline = Instant::now() + readiness.grace;
            loop {
                if !process.is_alive() {
                    return false;
                }
                let connect = TcpStream::connect(("127.0.0.1", port));
                if let Ok(Ok(_)) = tokio::time::timeout(READINESS_CONNECT_TIMEOUT, connect).await {
                    return process.is_alive();
                }
                if Instant::now() >= deadline {
                    debug!(port, "proxy port not accepting connections within grace period");
                    return false;
                }
                tokio::time::sleep(READINESS_POLL_INTERVAL).await;
            }
        }
    }
}
