//! Subprocess script host.
//!
//! Runs analysis scripts with a configured interpreter inside a throwaway
//! scratch directory. The child gets a cleared environment, `HOME` and
//! `TMPDIR` pinned to the scratch directory and a `ulimit -v` memory
//! ceiling. By default the whole command runs under `bwrap` with a
//! read-only system view, a private `/tmp`, no network and only the
//! scratch directory writable. Running without a wrapper must be asked
//! for explicitly with [`Isolation::Disabled`].
//!
//! Output is streamed through bounded buffers. The child is killed when
//! the wall-clock ceiling passes or stdout grows past `max_output_bytes`;
//! whatever was captured up to that point is still returned.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ScriptHost, ScriptOutput, ScriptRequest};

/// Directory (relative to the scratch root) holding mounted inputs
pub const INPUTS_DIR: &str = "inputs";

/// Placeholder in wrapper arguments replaced by the scratch directory
pub const SCRATCH_PLACEHOLDER: &str = "{scratch}";

const SCRIPT_FILE: &str = "analysis_script";

const CHILD_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Most stderr kept for diagnostics; older bytes are dropped first
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// How long to wait for pipes to close after the child is gone
const DRAIN_GRACE: Duration = Duration::from_millis(500);

const SIGKILL: i32 = 9;
const SIGXCPU: i32 = 24;

/// Host setup problems that no script change can fix
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(
        "No isolation wrapper configured for analysis scripts; \
         set analysis.unisolated: true to run them without one"
    )]
    Unisolated,

    #[error("Isolation wrapper '{0}' is not installed")]
    IsolationUnavailable(String),
}

/// How scripts are fenced off from the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolation {
    /// Command prefix; `{scratch}` expands to the scratch directory
    Wrapper(Vec<String>),

    /// Scripts see the host filesystem and network
    Disabled,
}

impl Default for Isolation {
    fn default() -> Self {
        Self::Wrapper(default_wrapper())
    }
}

/// Bubblewrap prefix: read-only system dirs, private `/tmp`, writable
/// scratch, every namespace unshared
#[rustfmt::skip]
pub fn default_wrapper() -> Vec<String> {
    [
        "bwrap",
        "--ro-bind", "/usr", "/usr",
        "--ro-bind-try", "/bin", "/bin",
        "--ro-bind-try", "/lib", "/lib",
        "--ro-bind-try", "/lib64", "/lib64",
        "--ro-bind-try", "/etc/ld.so.cache", "/etc/ld.so.cache",
        "--ro-bind-try", "/etc/alternatives", "/etc/alternatives",
        "--dev", "/dev",
        "--proc", "/proc",
        "--tmpfs", "/tmp",
        "--bind", SCRATCH_PLACEHOLDER, SCRATCH_PLACEHOLDER,
        "--chdir", SCRATCH_PLACEHOLDER,
        "--unshare-all",
        "--die-with-parent",
        "--new-session",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Script host using local subprocesses
pub struct ProcessScriptHost {
    /// Interpreter command, e.g. `["python3", "-I"]`
    interpreter: Vec<String>,

    isolation: Isolation,
}

impl Default for ProcessScriptHost {
    fn default() -> Self {
        Self::new(vec!["python3".to_string(), "-I".to_string()])
    }
}

impl ProcessScriptHost {
    pub fn new(interpreter: Vec<String>) -> Self {
        Self {
            interpreter,
            isolation: Isolation::default(),
        }
    }

    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    /// Build `[wrapper..] sh -c 'ulimit -v N; exec "$@"' sh interpreter.. script`
    fn command_line(&self, scratch: &Path, memory_limit_mb: u64) -> Vec<String> {
        let scratch = scratch.to_string_lossy();
        let mut argv: Vec<String> = match &self.isolation {
            Isolation::Wrapper(wrapper) => wrapper
                .iter()
                .map(|arg| arg.replace(SCRATCH_PLACEHOLDER, &scratch))
                .collect(),
            Isolation::Disabled => Vec::new(),
        };
        argv.push("sh".to_string());
        argv.push("-c".to_string());
        argv.push(format!("ulimit -v {}; exec \"$@\"", memory_limit_mb * 1024));
        argv.push("sh".to_string());
        argv.extend(self.interpreter.iter().cloned());
        argv.push(SCRIPT_FILE.to_string());
        argv
    }

    /// Refuse to run when isolation is missing or cannot work
    fn check_isolation(&self) -> Result<(), SandboxError> {
        let Isolation::Wrapper(wrapper) = &self.isolation else {
            return Ok(());
        };
        let program = wrapper.first().ok_or(SandboxError::Unisolated)?;
        if find_program(program).is_none() {
            return Err(SandboxError::IsolationUnavailable(program.clone()));
        }
        Ok(())
    }
}

/// Resolve a program the way the child's `PATH` would
fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return path.is_file().then_some(path);
    }
    CHILD_PATH
        .split(':')
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| candidate.is_file())
}

fn looks_like_memory_failure(stderr: &str) -> bool {
    stderr.contains("MemoryError")
        || stderr.contains("Cannot allocate memory")
        || stderr.contains("out of memory")
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// A signal death only counts as a memory breach for the kernel's
/// OOM kill or a resource-limit signal
fn is_resource_signal(signal: Option<i32>) -> bool {
    matches!(signal, Some(SIGKILL) | Some(SIGXCPU))
}

type Sink = Arc<Mutex<Vec<u8>>>;

fn drain_sink(sink: &Sink) -> Vec<u8> {
    let mut buf = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    std::mem::take(&mut *buf)
}

/// Copy into `sink` until EOF or `limit + 1` bytes; true when past `limit`
async fn capture_head<R: AsyncRead + Unpin>(reader: R, limit: usize, sink: Sink) -> bool {
    let mut reader = reader.take(limit as u64 + 1);
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let mut buf = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > limit {
            return true;
        }
    }
    false
}

/// Copy into `sink` until EOF, keeping only the last `limit` bytes
async fn capture_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize, sink: Sink) {
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let mut buf = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > limit {
            let excess = buf.len() - limit;
            buf.drain(..excess);
        }
    }
}

/// Why the wait loop stopped
enum Stop {
    Exited(ExitStatus),
    TimedOut,
    OutputExceeded,
}

async fn settle_reader<T>(task: &mut JoinHandle<T>) {
    if tokio::time::timeout(DRAIN_GRACE, &mut *task).await.is_err() {
        // A grandchild still holds the pipe
        task.abort();
    }
}

#[async_trait]
impl ScriptHost for ProcessScriptHost {
    fn name(&self) -> &str {
        "process"
    }

    async fn execute(&self, request: ScriptRequest) -> Result<ScriptOutput> {
        if self.interpreter.is_empty() {
            anyhow::bail!("No interpreter configured for analysis scripts");
        }
        self.check_isolation()?;

        let scratch = tempfile::Builder::new()
            .prefix("cosci-analysis-")
            .tempdir()
            .context("Failed to create analysis scratch directory")?;
        let inputs_dir = scratch.path().join(INPUTS_DIR);
        tokio::fs::create_dir_all(&inputs_dir)
            .await
            .context("Failed to create inputs directory")?;

        for input in &request.inputs {
            let path = inputs_dir.join(&input.name);
            tokio::fs::write(&path, &input.bytes)
                .await
                .with_context(|| format!("Failed to mount input: {}", path.display()))?;
        }

        tokio::fs::write(scratch.path().join(SCRIPT_FILE), request.source.as_bytes())
            .await
            .context("Failed to write analysis script")?;

        let argv = self.command_line(scratch.path(), request.limits.memory_limit_mb);
        debug!(?argv, inputs = request.inputs.len(), "Spawning analysis script");

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(scratch.path())
            .env_clear()
            .env("PATH", CHILD_PATH)
            .env("HOME", scratch.path())
            .env("TMPDIR", scratch.path())
            .env("COSCI_INPUTS_DIR", &inputs_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn analysis command '{}'", argv[0]))?;

        let stdout_pipe = child.stdout.take().context("Analysis stdout not captured")?;
        let stderr_pipe = child.stderr.take().context("Analysis stderr not captured")?;

        let stdout_sink = Sink::default();
        let stderr_sink = Sink::default();
        let max_output = request.limits.max_output_bytes;
        let mut stdout_task =
            tokio::spawn(capture_head(stdout_pipe, max_output, stdout_sink.clone()));
        let mut stderr_task =
            tokio::spawn(capture_tail(stderr_pipe, MAX_STDERR_BYTES, stderr_sink.clone()));

        let wall_clock = request.limits.wall_clock();
        let deadline = tokio::time::sleep(wall_clock);
        tokio::pin!(deadline);

        let mut stdout_closed = false;
        let stop = loop {
            tokio::select! {
                status = child.wait() => {
                    break Stop::Exited(status.context("Failed to wait for analysis script")?);
                }
                _ = &mut deadline => break Stop::TimedOut,
                overflowed = &mut stdout_task, if !stdout_closed => {
                    stdout_closed = true;
                    if matches!(overflowed, Ok(true)) {
                        break Stop::OutputExceeded;
                    }
                }
            }
        };

        if !matches!(stop, Stop::Exited(_)) {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill analysis script");
            }
        }

        if !stdout_closed {
            settle_reader(&mut stdout_task).await;
        }
        settle_reader(&mut stderr_task).await;

        let stdout = String::from_utf8_lossy(&drain_sink(&stdout_sink)).into_owned();
        let stderr = String::from_utf8_lossy(&drain_sink(&stderr_sink)).into_owned();

        let output = match stop {
            Stop::TimedOut => {
                warn!(?wall_clock, "Analysis script exceeded wall-clock ceiling");
                ScriptOutput {
                    stdout,
                    stderr,
                    timed_out: true,
                    ..Default::default()
                }
            }
            Stop::OutputExceeded => {
                warn!(max_output, "Analysis script exceeded output ceiling");
                ScriptOutput {
                    stdout,
                    stderr,
                    output_exceeded: true,
                    ..Default::default()
                }
            }
            Stop::Exited(status) => {
                let signal = exit_signal(&status);
                let memory_exceeded =
                    looks_like_memory_failure(&stderr) || is_resource_signal(signal);
                ScriptOutput {
                    stdout,
                    stderr,
                    exit_code: status.code(),
                    signal,
                    memory_exceeded,
                    ..Default::default()
                }
            }
        };

        Ok(output)
    }
}
