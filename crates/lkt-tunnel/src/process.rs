//! Process Supervisor
//!
//! Launches the external tunnel clients, pumps their output into the log
//! stream, and tears them down again. Also reaches processes it did not
//! launch (WireGuard service helpers) through the OS process table.
//!
//! # Lifecycle
//!
//! ```text
//! start(spec)          → resolve executable, wrap for elevation, spawn
//! stream_output(h)     → one task per pipe, lines → LogSink
//! status(h)            → Running | Exited(code) | Unknown
//! terminate(h)         → kill, wait ≤ terminate timeout, forget handle
//! ```

use crate::log::{LogLevel, LogSink};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use sysinfo::{ProcessesToUpdate, System};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// pkexec exit codes for a dismissed or refused authorization
const ELEVATION_DENIED_CODES: [i32; 2] = [126, 127];

/// Windows: ERROR_ELEVATION_REQUIRED, ERROR_CANCELLED
const WIN_ELEVATION_ERRORS: [i32; 2] = [740, 1223];

/// Opaque reference to a launched process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle(pub(crate) u64);

/// What to launch
#[derive(Clone, Default)]
pub struct LaunchSpec {
    /// Executable name or path
    pub program: String,
    /// Arguments, already expanded
    pub args: Vec<String>,
    /// Extra environment (never logged)
    pub env: Vec<(String, String)>,
    /// Run with administrator/root rights
    pub elevated: bool,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ..Self::default()
        }
    }

    pub fn elevated(mut self, elevated: bool) -> Self {
        self.elevated = elevated;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Command line for logs
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl std::fmt::Debug for LaunchSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("elevated", &self.elevated)
            .finish()
    }
}

/// Observed state of a launched process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    /// Exited with a code (`None` when killed by a signal)
    Exited(Option<i32>),
    /// Handle no longer tracked
    Unknown,
}

/// Outcome of a one-shot command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Failed(Option<i32>),
    TimedOut,
}

/// Launch errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    #[error("Executable not found: {0}")]
    NotFound(String),

    #[error("Elevation denied: {0}")]
    ElevationDenied(String),

    #[error("Launch failed: {0}")]
    Other(String),
}

/// Process control seam used by every backend
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Spawn a long-running process
    fn start(&self, spec: &LaunchSpec) -> Result<ProcessHandle, LaunchError>;

    /// Forward stdout/stderr lines to the log until the process exits
    fn stream_output(&self, handle: ProcessHandle, log: LogSink);

    fn status(&self, handle: ProcessHandle) -> ProcessStatus;

    fn is_running(&self, handle: ProcessHandle) -> bool {
        self.status(handle) == ProcessStatus::Running
    }

    /// Kill and forget a launched process; never fails
    async fn terminate(&self, handle: ProcessHandle);

    /// Run a command to completion within `timeout`
    async fn run(
        &self,
        spec: &LaunchSpec,
        timeout: Duration,
        log: &LogSink,
    ) -> Result<RunStatus, LaunchError>;

    /// PIDs of running processes with this name
    fn find_by_name(&self, name: &str) -> Result<Vec<u32>, LaunchError>;

    /// Kill every process with this name, returning how many were found
    async fn kill_by_name(&self, name: &str) -> Result<usize, LaunchError>;
}

/// Does an early exit code mean the elevation prompt was refused?
pub fn is_elevation_denial(code: Option<i32>) -> bool {
    code.is_some_and(|c| ELEVATION_DENIED_CODES.contains(&c))
}

/// OS-backed supervisor
pub struct ProcessSupervisor {
    /// Wrapper prepended to elevated commands (e.g. `pkexec`)
    elevation: Vec<String>,
    /// Wait for killed processes
    terminate_timeout: Duration,
    /// Launched children
    children: Mutex<HashMap<ProcessHandle, Child>>,
    next_handle: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new(elevation: Vec<String>, terminate_timeout: Duration) -> Self {
        Self {
            elevation,
            terminate_timeout,
            children: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn command(&self, spec: &LaunchSpec) -> Result<Command, LaunchError> {
        let executable = resolve_executable(&spec.program)?;

        let mut command = if spec.elevated && needs_elevation() && !self.elevation.is_empty() {
            let wrapper = which::which(&self.elevation[0]).map_err(|_| {
                LaunchError::ElevationDenied(format!(
                    "elevation helper '{}' not found",
                    self.elevation[0]
                ))
            })?;
            let mut command = Command::new(wrapper);
            command.args(&self.elevation[1..]).arg(&executable);
            command
        } else {
            Command::new(&executable)
        };

        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(command)
    }
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    fn start(&self, spec: &LaunchSpec) -> Result<ProcessHandle, LaunchError> {
        let child = self
            .command(spec)?
            .spawn()
            .map_err(|e| classify_spawn_error(spec, e))?;

        let handle = ProcessHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        debug!("Started {} as {:?} (pid {:?})", spec.program, handle, child.id());
        self.children.lock().insert(handle, child);
        Ok(handle)
    }

    fn stream_output(&self, handle: ProcessHandle, log: LogSink) {
        let (stdout, stderr) = match self.children.lock().get_mut(&handle) {
            Some(child) => (child.stdout.take(), child.stderr.take()),
            None => return,
        };

        if let Some(stdout) = stdout {
            tokio::spawn(pump_lines(stdout, LogLevel::Info, log.clone()));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(pump_lines(stderr, LogLevel::Warn, log));
        }
    }

    fn status(&self, handle: ProcessHandle) -> ProcessStatus {
        match self.children.lock().get_mut(&handle) {
            Some(child) => match child.try_wait() {
                Ok(None) => ProcessStatus::Running,
                Ok(Some(status)) => ProcessStatus::Exited(status.code()),
                Err(_) => ProcessStatus::Unknown,
            },
            None => ProcessStatus::Unknown,
        }
    }

    async fn terminate(&self, handle: ProcessHandle) {
        let Some(mut child) = self.children.lock().remove(&handle) else {
            return;
        };

        if let Err(e) = child.start_kill() {
            debug!("Kill of {:?} failed: {}", handle, e);
        }
        if tokio::time::timeout(self.terminate_timeout, child.wait())
            .await
            .is_err()
        {
            warn!(
                "Process {:?} did not exit within {:?}, continuing",
                handle, self.terminate_timeout
            );
        }
    }

    async fn run(
        &self,
        spec: &LaunchSpec,
        timeout: Duration,
        log: &LogSink,
    ) -> Result<RunStatus, LaunchError> {
        let child = self
            .command(spec)?
            .spawn()
            .map_err(|e| classify_spawn_error(spec, e))?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| LaunchError::Other(e.to_string()))?,
            Err(_) => return Ok(RunStatus::TimedOut),
        };

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            log.info(line);
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            log.warn(line);
        }

        if output.status.success() {
            Ok(RunStatus::Success)
        } else {
            Ok(RunStatus::Failed(output.status.code()))
        }
    }

    fn find_by_name(&self, name: &str) -> Result<Vec<u32>, LaunchError> {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        Ok(matching_pids(&system, name))
    }

    async fn kill_by_name(&self, name: &str) -> Result<usize, LaunchError> {
        let name = name.to_string();
        let timeout = self.terminate_timeout;
        tokio::task::spawn_blocking(move || kill_matching(&name, timeout))
            .await
            .map_err(|e| LaunchError::Other(e.to_string()))?
    }
}

/// Resolve a bare name through PATH, or check an explicit path exists
pub fn resolve_executable(program: &str) -> Result<PathBuf, LaunchError> {
    let path = Path::new(program);
    if path.components().count() > 1 || path.is_absolute() {
        if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(LaunchError::NotFound(program.to_string()))
        }
    } else {
        which::which(program).map_err(|_| LaunchError::NotFound(program.to_string()))
    }
}

#[cfg(unix)]
fn needs_elevation() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() != 0 }
}

#[cfg(not(unix))]
fn needs_elevation() -> bool {
    false
}

fn classify_spawn_error(spec: &LaunchSpec, err: std::io::Error) -> LaunchError {
    if err
        .raw_os_error()
        .is_some_and(|code| WIN_ELEVATION_ERRORS.contains(&code))
    {
        return LaunchError::ElevationDenied(err.to_string());
    }
    match err.kind() {
        std::io::ErrorKind::NotFound => LaunchError::NotFound(spec.program.clone()),
        std::io::ErrorKind::PermissionDenied if spec.elevated => {
            LaunchError::ElevationDenied(err.to_string())
        }
        _ => LaunchError::Other(format!("{}: {}", spec.program, err)),
    }
}

async fn pump_lines<R>(reader: R, level: LogLevel, log: LogSink)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => log.send(level, line).await,
            Ok(None) => break,
            Err(e) => {
                debug!("Output pump stopped: {}", e);
                break;
            }
        }
    }
}

fn normalize_name(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    lower.strip_suffix(".exe").map(str::to_string).unwrap_or(lower)
}

fn matching_pids(system: &System, name: &str) -> Vec<u32> {
    let wanted = normalize_name(name);
    system
        .processes()
        .iter()
        .filter(|(_, process)| normalize_name(&process.name().to_string_lossy()) == wanted)
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

fn kill_matching(name: &str, timeout: Duration) -> Result<usize, LaunchError> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let pids = matching_pids(&system, name);
    for (pid, process) in system.processes() {
        if pids.contains(&pid.as_u32()) && !process.kill() {
            return Err(LaunchError::Other(format!(
                "kill refused for {} (pid {})",
                name,
                pid.as_u32()
            )));
        }
    }

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        system.refresh_processes(ProcessesToUpdate::All, true);
        if matching_pids(&system, name).is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    Ok(pids.len())
}
