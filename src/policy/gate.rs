//! Runtime gate every shell command passes before a process is spawned

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::audit::{AuditCategory, AuditOutcome, Auditor};
use crate::cancel::CancelToken;
use crate::errors::{PolicyError, SandboxError, SandboxResult};
use crate::policy::{PolicyDecision, PolicyStore, ShellScope};
use crate::process::{self, CommandResult, CommandSpec};

/// Checks commands against the [`PolicyStore`] and runs the approved ones
#[derive(Debug, Clone)]
pub struct CommandGate {
    policy: Arc<PolicyStore>,
    auditor: Auditor,
}

impl CommandGate {
    pub fn new(policy: Arc<PolicyStore>, auditor: Auditor) -> Self {
        Self { policy, auditor }
    }

    pub fn is_allowed(&self, scope: ShellScope, command: &str) -> bool {
        self.policy.is_allowed(command, scope)
    }

    /// Approve or reject a command; rejections are audited.
    pub fn check(&self, scope: ShellScope, command: &str) -> Result<(), PolicyError> {
        let error = match self.policy.evaluate(command, scope) {
            PolicyDecision::Allowed { pattern } => {
                debug!(scope = %scope, pattern = %pattern, "Command allowed");
                return Ok(());
            }
            PolicyDecision::Blocked { pattern } => PolicyError::ExplicitlyBlocked {
                scope: scope.to_string(),
                pattern,
            },
            PolicyDecision::NotWhitelisted => PolicyError::NotWhitelisted {
                scope: scope.to_string(),
            },
        };

        debug!("Command rejected: {}", error);
        self.auditor.record(
            AuditCategory::Command,
            &subject(scope, command),
            AuditOutcome::Denied,
            Duration::ZERO,
        );
        Err(error)
    }

    /// Audit a command turned away after the policy check, e.g. for its
    /// working directory or for lack of an execution slot
    pub fn record_rejection(&self, scope: ShellScope, command: &str, error: &SandboxError) {
        let (category, outcome) = if error.is_violation() {
            (AuditCategory::SecurityViolation, AuditOutcome::Denied)
        } else {
            (AuditCategory::Command, AuditOutcome::Rejected)
        };
        debug!("Command not admitted: {}", error);
        self.auditor.record(
            category,
            &format!("{} ({})", subject(scope, command), error),
            outcome,
            Duration::ZERO,
        );
    }

    /// Check and run a command from a blocking worker
    pub fn run_blocking(
        &self,
        spec: &CommandSpec,
        limit: Duration,
        cancel: &CancelToken,
    ) -> SandboxResult<CommandResult> {
        self.check(spec.scope, &spec.command)?;
        cancel.check()?;
        let start = Instant::now();
        let result = process::run_blocking(spec, limit, cancel);
        self.record_outcome(spec, &result, start.elapsed());
        result
    }

    fn record_outcome(
        &self,
        spec: &CommandSpec,
        result: &SandboxResult<CommandResult>,
        elapsed: Duration,
    ) {
        let outcome = match result {
            Ok(r) if r.success => AuditOutcome::Completed,
            Ok(_) => AuditOutcome::Failed,
            Err(SandboxError::Timeout { .. }) => AuditOutcome::TimedOut,
            Err(_) => AuditOutcome::Failed,
        };
        info!(scope = %spec.scope, outcome = %outcome, "Shell command finished");
        self.auditor.record(
            AuditCategory::Command,
            &subject(spec.scope, &spec.command),
            outcome,
            elapsed,
        );
    }
}

fn subject(scope: ShellScope, command: &str) -> String {
    format!("{}: {}", scope, command.trim())
}
