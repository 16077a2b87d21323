//! Script execution on an embedded interpreter
//!
//! Each run builds a fresh [`molt::Interp`] on the worker thread, strips the
//! ambient commands that reach outside the sandbox and binds the
//! [`CapabilityContext`] as the only way to touch files or processes.

mod commands;
pub mod context;

use molt::types::{Exception, ResultCode};
use molt::Interp;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{ErrorInfo, SandboxError, SandboxResult};
use crate::policy::ShellScope;
use crate::process::CommandResult;
use crate::sanitize;

pub use self::context::{CapabilityContext, OutputSink, OUTPUT_TRUNCATED_MARKER};

/// Nesting depth allowed for procs and nested evaluation
pub const DEFAULT_RECURSION_LIMIT: usize = 200;

/// Stack frames kept from an uncaught script error
const MAX_FRAMES: usize = 5;

/// Per-execution lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Pending,
    Validating,
    Rejected,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Completed | Self::Failed | Self::TimedOut
        )
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Pending, Validating)
                | (Validating, Rejected)
                | (Validating, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, TimedOut)
        )
    }
}

/// State holder that refuses illegal transitions
#[derive(Debug)]
pub struct Lifecycle {
    request_id: Uuid,
    state: ExecutionState,
}

impl Lifecycle {
    pub fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            state: ExecutionState::Pending,
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Move to `next`; returns false and keeps the current state if the
    /// transition is not allowed
    pub fn advance(&mut self, next: ExecutionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                "Execution {}: refusing transition {:?} -> {:?}",
                self.request_id, self.state, next
            );
            return false;
        }
        debug!("Execution {}: {:?} -> {:?}", self.request_id, self.state, next);
        self.state = next;
        true
    }
}

/// What a request asks the sandbox to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Script { text: String },
    Command { scope: ShellScope, command: String },
}

/// One accepted request; immutable once built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub request_id: Uuid,
    pub payload: Payload,
    pub working_dir: PathBuf,
}

impl ExecutionRequest {
    pub fn script(text: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            payload: Payload::Script { text: text.into() },
            working_dir: working_dir.into(),
        }
    }

    pub fn command(
        scope: ShellScope,
        command: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            payload: Payload::Command {
                scope,
                command: command.into(),
            },
            working_dir: working_dir.into(),
        }
    }
}

/// Result handed back for every request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub request_id: Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<String>,
    pub output_lines: Vec<String>,
    #[serde(default)]
    pub output_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub duration_ms: u64,
    pub state: ExecutionState,
    /// Process details for command requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandResult>,
}

impl ExecutionResult {
    /// Result for a request that never started
    pub fn rejected(request_id: Uuid, error: &SandboxError, duration_ms: u64) -> Self {
        Self {
            request_id,
            success: false,
            return_value: None,
            output_lines: Vec::new(),
            output_truncated: false,
            error: Some(ErrorInfo::from(error)),
            duration_ms,
            state: ExecutionState::Rejected,
            command: None,
        }
    }

    /// Result for a request that ran, successfully or not
    pub fn finished(
        request_id: Uuid,
        outcome: &SandboxResult<String>,
        (output_lines, output_truncated): (Vec<String>, bool),
        duration_ms: u64,
    ) -> Self {
        let (state, return_value, error) = match outcome {
            Ok(value) => (
                ExecutionState::Completed,
                Some(sanitize::strip_control_chars(value)),
                None,
            ),
            Err(e @ SandboxError::Timeout { .. }) => {
                (ExecutionState::TimedOut, None, Some(ErrorInfo::from(e)))
            }
            Err(e) => (ExecutionState::Failed, None, Some(ErrorInfo::from(e))),
        };
        Self {
            request_id,
            success: state == ExecutionState::Completed,
            return_value,
            output_lines,
            output_truncated,
            error,
            duration_ms,
            state,
            command: None,
        }
    }

    /// Result for a shell command request; stdout becomes the output lines
    pub fn from_command(
        request_id: Uuid,
        outcome: SandboxResult<CommandResult>,
        duration_ms: u64,
    ) -> Self {
        match outcome {
            Ok(command) => Self {
                request_id,
                success: command.success,
                return_value: Some(command.exit_code.to_string()),
                output_lines: command.stdout.lines().map(String::from).collect(),
                output_truncated: command.truncated,
                error: None,
                duration_ms,
                state: if command.success {
                    ExecutionState::Completed
                } else {
                    ExecutionState::Failed
                },
                command: Some(command),
            },
            // Policy, working directory and admission checks run before any process starts
            Err(e @ (SandboxError::Policy(_)
            | SandboxError::Path(_)
            | SandboxError::ResourceExhausted(_))) => Self::rejected(request_id, &e, duration_ms),
            Err(e) => Self::finished(request_id, &Err(e), (Vec::new(), false), duration_ms),
        }
    }
}

/// Evaluates scripts against a capability context
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    recursion_limit: usize,
}

impl Default for ScriptRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptRunner {
    pub fn new() -> Self {
        Self {
            recursion_limit: DEFAULT_RECURSION_LIMIT,
        }
    }

    pub fn with_recursion_limit(recursion_limit: usize) -> Self {
        Self { recursion_limit }
    }

    /// Evaluate `script` and return the value of its last command.
    ///
    /// Uncaught script errors come back as `Runtime`, unless the error was
    /// raised by a capability call, whose own error is returned. Once the
    /// context's token is cancelled the result is `Timeout`.
    pub fn run(&self, script: &str, context: CapabilityContext) -> SandboxResult<String> {
        let cancel = context.cancel().clone();

        let mut interp = Interp::new();
        interp.set_recursion_limit(self.recursion_limit);
        let ctx = interp.save_context(context);
        commands::install(&mut interp, ctx);

        let outcome = interp.eval(script);
        let failure = interp.context::<CapabilityContext>(ctx).take_failure();

        if cancel.is_cancelled() {
            return Err(SandboxError::Timeout {
                duration: cancel.budget().unwrap_or_default(),
            });
        }

        match outcome {
            Ok(value) => Ok(value.as_str().to_string()),
            Err(exception) => match exception.code() {
                ResultCode::Return => Ok(exception.value().as_str().to_string()),
                ResultCode::Error => {
                    let message = exception.value().as_str().to_string();
                    match failure {
                        Some((failed, error)) if failed == message => Err(error),
                        _ => Err(SandboxError::Runtime {
                            frames: frames(&exception),
                            message,
                        }),
                    }
                }
                ResultCode::Break => Err(SandboxError::runtime("invoked \"break\" outside of a loop")),
                ResultCode::Continue => {
                    Err(SandboxError::runtime("invoked \"continue\" outside of a loop"))
                }
                _ => Err(SandboxError::runtime("script ended with an unexpected result code")),
            },
        }
    }
}

/// Context lines of the interpreter's error trace after the message itself
fn frames(exception: &Exception) -> Vec<String> {
    if !exception.is_error() {
        return Vec::new();
    }
    exception
        .error_info()
        .as_str()
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(MAX_FRAMES)
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::Auditor;
    use crate::cancel::CancelToken;
    use crate::config::{PolicyConfig, SandboxConfig, ScopePatterns};
    use crate::errors::{EditConflictError, PathError, PolicyError};
    use crate::files::BoundedFileAccess;
    use crate::policy::{CommandGate, PolicyStore};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        files: BoundedFileAccess,
        gate: CommandGate,
    }

    impl Harness {
        fn new(enable_write: bool) -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = SandboxConfig::new(vec![dir.path().to_path_buf()]);
            config.enable_write = enable_write;
            let policy = PolicyStore::new(&PolicyConfig {
                bash: ScopePatterns {
                    allowed_patterns: vec!["^echo .*".to_string()],
                    denied_patterns: vec![".*rm .*".to_string()],
                },
                powershell: ScopePatterns::default(),
            });
            Self {
                files: BoundedFileAccess::new(&config, Auditor::tracing()),
                gate: CommandGate::new(Arc::new(policy), Auditor::tracing()),
                dir,
            }
        }

        fn context(&self, output: &OutputSink, cancel: &CancelToken) -> CapabilityContext {
            let root = self.files.allowed_directories()[0].clone();
            CapabilityContext::new(
                root.clone(),
                self.files.scoped(root, cancel.clone()),
                self.gate.clone(),
                output.clone(),
                cancel.clone(),
                Duration::from_secs(10),
                4096,
            )
        }

        fn run(&self, script: &str) -> (SandboxResult<String>, Vec<String>) {
            self.run_with(script, CancelToken::new())
        }

        fn run_with(&self, script: &str, cancel: CancelToken) -> (SandboxResult<String>, Vec<String>) {
            let output = OutputSink::new(100, 4096);
            let result = ScriptRunner::new().run(script, self.context(&output, &cancel));
            (result, output.take().0)
        }
    }

    #[test]
    fn test_returns_last_value_and_output() {
        let harness = Harness::new(false);
        let (result, output) = harness.run("emit hello\nputs world\nset x [expr {6 * 7}]");

        assert_eq!(result.unwrap(), "42");
        assert_eq!(output, vec!["hello", "world"]);
    }

    #[test]
    fn test_ambient_commands_are_gone() {
        let harness = Harness::new(false);
        let (result, _) = harness.run("exit 1");
        assert!(matches!(result, Err(SandboxError::Runtime { .. })));

        let (result, _) = harness.run("source /etc/profile");
        assert!(matches!(result, Err(SandboxError::Runtime { .. })));
    }

    #[test]
    fn test_file_commands_return_dicts() {
        let harness = Harness::new(false);
        let body: String = (1..=200).map(|i| format!("{}\n", i)).collect();
        std::fs::write(harness.dir.path().join("n.txt"), body).unwrap();

        let (result, _) = harness.run(
            "set t [tail n.txt 50]\n\
             list [lindex [dict get $t lines] 0] [dict get $t total_lines] [llength [dict get [grep n.txt {^1} 5] matches]]",
        );
        assert_eq!(result.unwrap(), "151 200 5");
    }

    #[test]
    fn test_capability_error_keeps_category() {
        let harness = Harness::new(false);
        let (result, _) = harness.run("head /etc/hosts");
        assert!(matches!(
            result,
            Err(SandboxError::Path(PathError::NotAllowed { .. }))
        ));

        let (result, _) = harness.run("shell bash {ls; rm -rf /}");
        assert!(matches!(
            result,
            Err(SandboxError::Policy(PolicyError::ExplicitlyBlocked { .. }))
        ));
    }

    #[test]
    fn test_script_can_catch_capability_errors() {
        let harness = Harness::new(true);
        std::fs::write(harness.dir.path().join("f.txt"), "foo bar foo").unwrap();

        let (result, _) = harness.run(
            "if {[catch {replace_unique f.txt foo xxx} msg]} { set msg caught } else { set msg missed }",
        );
        assert_eq!(result.unwrap(), "caught");

        let (result, _) = harness.run("replace_unique f.txt foo xxx");
        assert!(matches!(
            result,
            Err(SandboxError::EditConflict(EditConflictError::Ambiguous { .. }))
        ));
    }

    #[test]
    fn test_uncaught_script_error_is_summarized() {
        let harness = Harness::new(false);
        let (result, output) = harness.run("emit before\nerror {token=supersecretvalue failed}");
        let err = result.unwrap_err();

        let info = ErrorInfo::from(&err);
        assert_eq!(info.code, "runtime.script_error");
        assert!(!info.message.contains("supersecretvalue"));
        assert_eq!(output, vec!["before"]);
    }

    #[test]
    fn test_cancelled_loop_stops() {
        let harness = Harness::new(false);
        let cancel = CancelToken::with_timeout(Duration::from_millis(100));

        let (result, _) = harness.run_with("set i 0\nwhile 1 { incr i }", cancel);
        assert!(matches!(result, Err(SandboxError::Timeout { .. })));

        let cancel = CancelToken::with_timeout(Duration::from_millis(100));
        let (result, _) = harness.run_with("for {set i 0} {1} {incr i} {}", cancel);
        assert!(matches!(result, Err(SandboxError::Timeout { .. })));
    }

    #[test]
    fn test_guarded_loops_keep_semantics() {
        let harness = Harness::new(false);
        let (result, _) = harness.run(
            "set out {}\n\
             for {set i 0} {$i < 10} {incr i} { if {$i == 2} continue; if {$i == 5} break; lappend out $i }\n\
             set j 0\n\
             while {$j < 3} { incr j }\n\
             list $out $j",
        );
        assert_eq!(result.unwrap(), "{0 1 3 4} 3");
    }

    #[test]
    fn test_cancelled_foreach_time_and_procs_stop() {
        let harness = Harness::new(false);
        let nested = "set l {}\n\
                      for {set i 0} {$i < 3000} {incr i} { lappend l $i }\n\
                      set n 0\n\
                      foreach a $l { foreach b $l { incr n } }";
        let start = std::time::Instant::now();
        let (result, _) = harness.run_with(nested, CancelToken::with_timeout(Duration::from_millis(200)));
        assert!(matches!(result, Err(SandboxError::Timeout { .. })));
        assert!(start.elapsed() < Duration::from_secs(5));

        let (result, _) = harness.run_with(
            "time { incr n } 1000000000",
            CancelToken::with_timeout(Duration::from_millis(200)),
        );
        assert!(matches!(result, Err(SandboxError::Timeout { .. })));

        let fan_out = "proc f {n} { if {$n > 0} { f [expr {$n - 1}]; f [expr {$n - 1}] } }\nf 25";
        let (result, _) = harness.run_with(fan_out, CancelToken::with_timeout(Duration::from_millis(200)));
        assert!(matches!(result, Err(SandboxError::Timeout { .. })));
    }

    #[test]
    fn test_foreach_time_and_proc_keep_semantics() {
        let harness = Harness::new(false);
        let (result, _) = harness.run(
            "set out {}\n\
             set i 0\n\
             foreach {k v} {a 1 b 2 c} { incr i; if {$i == 2} continue; lappend out $k $v }\n\
             foreach x {1 2 3 4} { if {$x == 3} break; lappend out $x }\n\
             proc double {x} { return [expr {$x * 2}] }\n\
             set t [time { double 4 } 3]\n\
             list $out [double 21] [lindex $t 1]",
        );
        assert_eq!(result.unwrap(), "{a 1 c {} 1 2} 42 microseconds");
    }

    #[test]
    fn test_runaway_recursion_fails() {
        let harness = Harness::new(false);
        let (result, _) = harness.run("proc f {} { f }\nf");
        assert!(matches!(result, Err(SandboxError::Runtime { .. })));
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut lifecycle = Lifecycle::new(Uuid::new_v4());
        assert!(!lifecycle.advance(ExecutionState::Running));
        assert!(lifecycle.advance(ExecutionState::Validating));
        assert!(lifecycle.advance(ExecutionState::Running));
        assert!(lifecycle.advance(ExecutionState::TimedOut));
        assert!(lifecycle.state().is_terminal());
        assert!(!lifecycle.advance(ExecutionState::Completed));
        assert_eq!(lifecycle.state(), ExecutionState::TimedOut);
    }
}
