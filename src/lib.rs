//! Policy-enforced sandbox for untrusted TCL scripts and whitelisted shell
//! commands.
//!
//! Scripts run on an embedded interpreter that can only reach the file
//! primitives and shell gate bound into its [`CapabilityContext`]. Every
//! decision and outcome is recorded through an [`Auditor`].

pub mod audit;
pub mod cancel;
pub mod config;
pub mod errors;
pub mod files;
pub mod governor;
pub mod pattern;
pub mod platform_dirs;
pub mod policy;
pub mod process;
pub mod sanitize;
pub mod script;
pub mod service;
pub mod validator;
pub mod watcher;

// Re-export commonly used types
pub use self::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, Auditor};
pub use self::cancel::CancelToken;
pub use self::config::{LimitOverrides, ResourceLimits, SandboxConfig};
pub use self::errors::{
    EditConflictError, ErrorCategory, ErrorInfo, PathError, PolicyError, SandboxError,
    SandboxResult, ValidationError,
};
pub use self::files::BoundedFileAccess;
pub use self::governor::{GovernorStatus, ResourceGovernor};
pub use self::policy::{CommandGate, PolicyStore, ShellScope};
pub use self::process::CommandResult;
pub use self::script::{
    CapabilityContext, ExecutionRequest, ExecutionResult, ExecutionState, ScriptRunner,
};
pub use self::service::Sandbox;
pub use self::validator::ScriptValidator;
pub use self::watcher::{AutoReload, ConfigWatcher};
