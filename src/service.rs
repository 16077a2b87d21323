//! The sandbox facade: validation, admission, execution and auditing
//!
//! [`Sandbox`] wires the policy, validator, file access, governor and runner
//! together and is what a request dispatcher talks to.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditOutcome, Auditor};
use crate::cancel::CancelToken;
use crate::config::{LimitOverrides, ResourceLimits, SandboxConfig};
use crate::errors::{PolicyError, SandboxResult, ValidationError};
use crate::files::BoundedFileAccess;
use crate::governor::{GovernorStatus, ResourceGovernor};
use crate::policy::{CommandGate, PolicyStore, ShellScope};
use crate::process::{CommandResult, CommandSpec};
use crate::script::{
    CapabilityContext, ExecutionRequest, ExecutionResult, ExecutionState, Lifecycle, OutputSink,
    Payload, ScriptRunner,
};
use crate::validator::ScriptValidator;

/// Longest script prefix quoted in an audit subject
const SCRIPT_SUBJECT_CHARS: usize = 80;

pub struct Sandbox {
    config: RwLock<SandboxConfig>,
    policy: Arc<PolicyStore>,
    validator: ScriptValidator,
    files: BoundedFileAccess,
    gate: CommandGate,
    governor: Arc<ResourceGovernor>,
    runner: ScriptRunner,
    auditor: Auditor,
}

impl Sandbox {
    /// Build a sandbox from a validated configuration
    pub fn new(config: SandboxConfig, auditor: Auditor) -> Result<Self> {
        Self::with_governor(config, auditor, ResourceGovernor::new)
    }

    /// Build a sandbox whose audit sinks come from the configuration
    pub fn from_config(config: SandboxConfig) -> Result<Self> {
        let auditor = Auditor::from_config(&config.audit)?;
        Self::new(config, auditor)
    }

    /// Build a sandbox with a custom governor, e.g. one with a fixed memory source
    pub fn with_governor(
        config: SandboxConfig,
        auditor: Auditor,
        governor: impl FnOnce(ResourceLimits) -> ResourceGovernor,
    ) -> Result<Self> {
        config.validate()?;
        let policy = Arc::new(PolicyStore::new(&config.policy));
        let files = BoundedFileAccess::new(&config, auditor.clone());
        if files.allowed_directories().is_empty() {
            anyhow::bail!("none of the allowed directories exist");
        }
        info!(
            "Sandbox ready with {} allowed directories (write {})",
            files.allowed_directories().len(),
            if config.enable_write { "enabled" } else { "disabled" }
        );

        Ok(Self {
            validator: ScriptValidator::new(config.validator.clone(), auditor.clone()),
            gate: CommandGate::new(policy.clone(), auditor.clone()),
            governor: Arc::new(governor(config.limits)),
            runner: ScriptRunner::new(),
            config: RwLock::new(config),
            policy,
            files,
            auditor,
        })
    }

    /// Current configuration
    pub fn config(&self) -> SandboxConfig {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swap in a new configuration; running executions keep what they started with
    pub fn reload(&self, config: SandboxConfig) -> Result<()> {
        config.validate()?;
        self.policy.reload(&config.policy);
        self.validator.reload(config.validator.clone());
        self.files.reload(&config);
        self.governor.set_limits(config.limits);
        match self.config.write() {
            Ok(mut current) => *current = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
        info!("Sandbox configuration reloaded");
        Ok(())
    }

    /// Base limits every execution starts from
    pub fn limits(&self) -> ResourceLimits {
        self.governor.limits()
    }

    pub fn governor_status(&self) -> GovernorStatus {
        self.governor.status()
    }

    /// File primitives resolving relative paths against the first allowed directory
    pub fn files(&self) -> &BoundedFileAccess {
        &self.files
    }

    /// File primitives resolving relative paths against `working_dir`
    pub fn files_in(&self, working_dir: impl AsRef<Path>) -> SandboxResult<BoundedFileAccess> {
        let resolved = self.files.resolve_dir(working_dir)?;
        Ok(self.files.scoped(resolved, CancelToken::new()))
    }

    pub fn check_command(&self, scope: ShellScope, command: &str) -> Result<(), PolicyError> {
        self.gate.check(scope, command)
    }

    /// Run the static checks against the base limits without executing
    pub fn validate_script(&self, script: &str, working_dir: &Path) -> Result<(), ValidationError> {
        self.validator
            .validate(script, working_dir, self.limits().max_script_bytes)
    }

    pub async fn execute_script(
        &self,
        script: &str,
        working_dir: impl Into<PathBuf>,
    ) -> ExecutionResult {
        self.execute(ExecutionRequest::script(script, working_dir), &LimitOverrides::default())
            .await
    }

    /// Execute a script with limits overridden for this execution only
    pub async fn execute_script_with_limits(
        &self,
        script: &str,
        working_dir: impl Into<PathBuf>,
        overrides: &LimitOverrides,
    ) -> ExecutionResult {
        self.execute(ExecutionRequest::script(script, working_dir), overrides)
            .await
    }

    /// Run a shell command under the governor
    pub async fn run_command(
        &self,
        scope: ShellScope,
        command: &str,
        working_dir: impl AsRef<Path>,
    ) -> SandboxResult<CommandResult> {
        self.run_command_with_limits(
            Uuid::new_v4(),
            scope,
            command,
            working_dir.as_ref(),
            self.limits(),
        )
        .await
    }

    /// Execute any request. Never fails; errors are carried in the result.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        overrides: &LimitOverrides,
    ) -> ExecutionResult {
        let limits = match self.limits().with_overrides(overrides) {
            Ok(limits) => limits,
            Err(e) => {
                warn!("Rejecting execution {}: {}", request.request_id, e);
                match &request.payload {
                    Payload::Script { text } => {
                        self.audit_script(request.request_id, text, AuditOutcome::Rejected, Duration::ZERO)
                    }
                    Payload::Command { scope, command } => self.gate.record_rejection(*scope, command, &e),
                }
                return ExecutionResult::rejected(request.request_id, &e, 0);
            }
        };
        match &request.payload {
            Payload::Script { text } => self.execute_script_request(&request, text, limits).await,
            Payload::Command { scope, command } => {
                let start = Instant::now();
                let outcome = self
                    .run_command_with_limits(
                        request.request_id,
                        *scope,
                        command,
                        &request.working_dir,
                        limits,
                    )
                    .await;
                ExecutionResult::from_command(request.request_id, outcome, elapsed_ms(start))
            }
        }
    }

    async fn execute_script_request(
        &self,
        request: &ExecutionRequest,
        script: &str,
        limits: ResourceLimits,
    ) -> ExecutionResult {
        let start = Instant::now();
        let request_id = request.request_id;
        let mut lifecycle = Lifecycle::new(request_id);
        lifecycle.advance(ExecutionState::Validating);

        let admitted = self
            .admit_script(script, &request.working_dir, &limits)
            .and_then(|working_dir| Ok((working_dir, self.governor.register(request_id, &limits)?)));
        let (working_dir, guard) = match admitted {
            Ok(admitted) => admitted,
            Err(e) => {
                lifecycle.advance(ExecutionState::Rejected);
                self.audit_script(request_id, script, AuditOutcome::Rejected, start.elapsed());
                return ExecutionResult::rejected(request_id, &e, elapsed_ms(start));
            }
        };

        let cancel = CancelToken::with_timeout(Duration::from_secs(limits.max_execution_seconds));
        let output = self.output_sink();
        let context = self.context(working_dir, output.clone(), cancel.clone());

        lifecycle.advance(ExecutionState::Running);
        let runner = self.runner.clone();
        let text = script.to_string();
        let outcome = guard
            .run(cancel, move |_| runner.run(&text, context))
            .await;

        let result = ExecutionResult::finished(request_id, &outcome, output.take(), elapsed_ms(start));
        lifecycle.advance(result.state);
        let audit_outcome = match result.state {
            ExecutionState::Completed => AuditOutcome::Completed,
            ExecutionState::TimedOut => AuditOutcome::TimedOut,
            _ => AuditOutcome::Failed,
        };
        self.audit_script(request_id, script, audit_outcome, start.elapsed());
        if let Some(error) = &result.error {
            debug!("Execution {} failed: {}", request_id, error.message);
        }
        result
    }

    /// Static checks, then working directory resolution
    fn admit_script(
        &self,
        script: &str,
        working_dir: &Path,
        limits: &ResourceLimits,
    ) -> SandboxResult<PathBuf> {
        self.validator
            .validate(script, working_dir, limits.max_script_bytes)?;
        self.files.resolve_dir(working_dir)
    }

    async fn run_command_with_limits(
        &self,
        request_id: Uuid,
        scope: ShellScope,
        command: &str,
        working_dir: &Path,
        limits: ResourceLimits,
    ) -> SandboxResult<CommandResult> {
        self.gate.check(scope, command)?;
        let admitted = self
            .files
            .resolve_dir(working_dir)
            .and_then(|dir| Ok((dir, self.governor.register(request_id, &limits)?)));
        let (working_dir, guard) = match admitted {
            Ok(admitted) => admitted,
            Err(e) => {
                self.gate.record_rejection(scope, command, &e);
                return Err(e);
            }
        };

        let config = self.config();
        let spec = CommandSpec {
            scope,
            command: command.to_string(),
            working_dir,
            max_output_bytes: config.max_output_bytes,
        };
        let process_limit = Duration::from_secs(config.command_timeout_seconds);
        let cancel = CancelToken::with_timeout(Duration::from_secs(limits.max_execution_seconds));
        let gate = self.gate.clone();

        guard
            .run(cancel, move |cancel| gate.run_blocking(&spec, process_limit, &cancel))
            .await
    }

    fn output_sink(&self) -> OutputSink {
        let config = self.config();
        OutputSink::new(config.max_output_lines, config.max_output_bytes)
    }

    fn context(&self, working_dir: PathBuf, output: OutputSink, cancel: CancelToken) -> CapabilityContext {
        let config = self.config();
        CapabilityContext::new(
            working_dir.clone(),
            self.files.scoped(working_dir, cancel.clone()),
            self.gate.clone(),
            output,
            cancel,
            Duration::from_secs(config.command_timeout_seconds),
            config.max_output_bytes,
        )
    }

    fn audit_script(&self, request_id: Uuid, script: &str, outcome: AuditOutcome, elapsed: Duration) {
        let preview: String = script.chars().take(SCRIPT_SUBJECT_CHARS).collect();
        if outcome == AuditOutcome::TimedOut {
            warn!("Execution {} timed out", request_id);
        }
        self.auditor.record(
            AuditCategory::Script,
            &format!("{}: {}", request_id, preview.replace('\n', "; ")),
            outcome,
            elapsed,
        );
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("allowed_directories", &self.files.allowed_directories())
            .field("governor", &self.governor)
            .finish_non_exhaustive()
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
