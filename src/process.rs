//! External process invocation with deadlines and capped output

use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::errors::{SandboxError, SandboxResult};
use crate::policy::ShellScope;
use crate::sanitize;

/// Interval between child status polls on the blocking path
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Marker appended when output was cut at the byte cap
const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// A shell command ready to run
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub scope: ShellScope,
    pub command: String,
    pub working_dir: PathBuf,
    pub max_output_bytes: usize,
}

/// Outcome of one external process invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub success: bool,
    /// Whether stdout or stderr hit the output cap
    #[serde(default)]
    pub truncated: bool,
}

impl CommandResult {
    fn new(exit_code: i32, stdout: Captured, stderr: Captured, duration: Duration) -> Self {
        Self {
            exit_code,
            truncated: stdout.truncated || stderr.truncated,
            stdout: stdout.into_text(),
            stderr: stderr.into_text(),
            duration_ms: duration.as_millis() as u64,
            success: exit_code == 0,
        }
    }
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn push(&mut self, chunk: &[u8], cap: usize) {
        let room = cap.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn into_text(self) -> String {
        let mut text = sanitize::strip_control_chars(&String::from_utf8_lossy(&self.bytes));
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

const BASH_ARGS: &[&str] = &["-c"];
const POWERSHELL_ARGS: &[&str] = &["-NoProfile", "-NonInteractive", "-Command"];

/// Program and leading arguments for a shell scope
fn shell_invocation(scope: ShellScope) -> (&'static str, &'static [&'static str]) {
    match scope {
        ShellScope::Bash => ("bash", BASH_ARGS),
        ShellScope::PowerShell => {
            let program = if cfg!(windows) { "powershell" } else { "pwsh" };
            (program, POWERSHELL_ARGS)
        }
    }
}

/// Process group led by a spawned shell
#[derive(Debug, Clone, Copy)]
struct ProcessGroup(u32);

impl ProcessGroup {
    /// Kill every process left in the group; an empty group is not an error
    #[cfg(unix)]
    fn kill(self) {
        let result = unsafe { libc::killpg(self.0 as libc::pid_t, libc::SIGKILL) };
        if result == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!("Failed to kill process group {}: {}", self.0, err);
            }
        }
    }

    #[cfg(not(unix))]
    fn kill(self) {}
}

fn timeout_error(cancel: &CancelToken, limit: Duration) -> SandboxError {
    let duration = match cancel.budget() {
        Some(budget) if cancel.is_cancelled() => budget,
        _ => limit,
    };
    SandboxError::Timeout { duration }
}

/// Run a command from a blocking worker thread.
///
/// The shell leads its own process group. It is polled until it exits and is
/// killed together with everything it started once `limit` elapses or
/// `cancel` fires. Background jobs still running when the shell exits are
/// killed as well, and output collection is bounded by the same deadline.
pub fn run_blocking(
    spec: &CommandSpec,
    limit: Duration,
    cancel: &CancelToken,
) -> SandboxResult<CommandResult> {
    let (program, args) = shell_invocation(spec.scope);
    let mut cmd = std::process::Command::new(program);
    cmd.args(args)
        .arg(&spec.command)
        .current_dir(&spec.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let start = Instant::now();
    let deadline = start
        .checked_add(limit)
        .unwrap_or_else(|| start + Duration::from_secs(u64::from(u32::MAX)));
    let mut child = cmd.spawn().map_err(|e| {
        warn!("Failed to spawn {}: {}", program, e);
        SandboxError::Io(e)
    })?;
    let group = ProcessGroup(child.id());

    let cap = spec.max_output_bytes;
    let stdout = child.stdout.take().map(|r| spawn_reader(r, cap));
    let stderr = child.stderr.take().map(|r| spawn_reader(r, cap));

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if cancel.is_cancelled() || Instant::now() >= deadline {
            warn!("Command exceeded its deadline, killing its process group");
            group.kill();
            let _ = child.kill();
            let _ = child.wait();
            return Err(timeout_error(cancel, limit));
        }
        std::thread::sleep(POLL_INTERVAL);
    };
    // Jobs the shell left running would otherwise hold the pipes open
    group.kill();

    let exit_code = status.code().unwrap_or(-1);
    debug!("Command exited with code {}", exit_code);
    match (
        join_reader(stdout, deadline, cancel),
        join_reader(stderr, deadline, cancel),
    ) {
        (Some(stdout), Some(stderr)) => Ok(CommandResult::new(
            exit_code,
            stdout,
            stderr,
            start.elapsed(),
        )),
        _ => {
            warn!("Command output stayed open past its deadline");
            Err(timeout_error(cancel, limit))
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut reader: R, cap: usize) -> Receiver<Captured> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut captured = Captured::default();
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => captured.push(&buf[..n], cap),
            }
        }
        let _ = tx.send(captured);
    });
    rx
}

/// Wait for a reader until `deadline`; `None` when it is still blocked
fn join_reader(
    reader: Option<Receiver<Captured>>,
    deadline: Instant,
    cancel: &CancelToken,
) -> Option<Captured> {
    let Some(reader) = reader else {
        return Some(Captured::default());
    };
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        let wait = deadline
            .saturating_duration_since(Instant::now())
            .min(POLL_INTERVAL * 10);
        match reader.recv_timeout(wait) {
            Ok(captured) => return Some(captured),
            Err(RecvTimeoutError::Timeout) if Instant::now() < deadline => continue,
            Err(RecvTimeoutError::Timeout) => return None,
            Err(RecvTimeoutError::Disconnected) => return Some(Captured::default()),
        }
    }
}
