//! Error taxonomy for the sandbox

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::time::Duration;

use crate::sanitize;

/// Result type for sandbox operations
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Script rejected before it runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Script text exceeds the configured size
    TooLarge { size: usize, limit: usize },

    /// Working directory contains a parent-reference segment
    PathTraversal { path: String },

    /// Script contains a denylisted construct
    DeniedConstruct { construct: String },

    /// Script mentions a denylisted filesystem path
    DeniedPath { path: String },
}

/// Shell command rejected by the command gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// No allow pattern matched
    NotWhitelisted { scope: String },

    /// A deny pattern matched
    ExplicitlyBlocked { scope: String, pattern: String },
}

/// Path resolution and file access failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    /// Path resolves outside every allowed directory, or is otherwise forbidden
    NotAllowed { path: String, reason: String },

    /// Path does not exist
    NotFound { path: String },

    /// Expected a regular file
    NotAFile { path: String },

    /// Expected a directory
    NotADirectory { path: String },

    /// File exceeds the configured size limit
    FileTooLarge { path: String, size: u64, limit: u64 },

    /// Writes are disabled by configuration
    WriteDisabled,
}

/// `replace_unique` could not find exactly one occurrence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditConflictError {
    /// The text to replace does not occur
    NotFound { path: String },

    /// The text to replace occurs more than once
    Ambiguous { path: String },
}

/// Top-level sandbox error
#[derive(Debug)]
pub enum SandboxError {
    Validation(ValidationError),
    Policy(PolicyError),
    Path(PathError),
    EditConflict(EditConflictError),

    /// Execution exceeded its deadline
    Timeout { duration: Duration },

    /// Uncaught error raised by script code
    Runtime { message: String, frames: Vec<String> },

    /// Concurrency or memory capacity exhausted
    ResourceExhausted(String),

    /// Caller supplied a malformed argument
    InvalidArgument(String),

    /// IO error
    Io(std::io::Error),
}

/// Stable, coarse-grained error category exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Policy,
    Path,
    EditConflict,
    Timeout,
    RuntimeScript,
    ResourceExhausted,
    InvalidArgument,
    Internal,
}

impl SandboxError {
    /// Create a runtime script error without stack frames
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            frames: Vec::new(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Policy(_) => ErrorCategory::Policy,
            Self::Path(_) => ErrorCategory::Path,
            Self::EditConflict(_) => ErrorCategory::EditConflict,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Runtime { .. } => ErrorCategory::RuntimeScript,
            Self::ResourceExhausted(_) => ErrorCategory::ResourceExhausted,
            Self::InvalidArgument(_) => ErrorCategory::InvalidArgument,
            Self::Io(_) => ErrorCategory::Internal,
        }
    }

    /// Fine-grained stable code, e.g. `validation.denied_construct`
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(e) => match e {
                ValidationError::TooLarge { .. } => "validation.too_large",
                ValidationError::PathTraversal { .. } => "validation.path_traversal",
                ValidationError::DeniedConstruct { .. } => "validation.denied_construct",
                ValidationError::DeniedPath { .. } => "validation.denied_path",
            },
            Self::Policy(e) => match e {
                PolicyError::NotWhitelisted { .. } => "policy.not_whitelisted",
                PolicyError::ExplicitlyBlocked { .. } => "policy.explicitly_blocked",
            },
            Self::Path(e) => match e {
                PathError::NotAllowed { .. } => "path.not_allowed",
                PathError::NotFound { .. } => "path.not_found",
                PathError::NotAFile { .. } => "path.not_a_file",
                PathError::NotADirectory { .. } => "path.not_a_directory",
                PathError::FileTooLarge { .. } => "path.file_too_large",
                PathError::WriteDisabled => "path.write_disabled",
            },
            Self::EditConflict(e) => match e {
                EditConflictError::NotFound { .. } => "edit.not_found",
                EditConflictError::Ambiguous { .. } => "edit.ambiguous",
            },
            Self::Timeout { .. } => "timeout",
            Self::Runtime { .. } => "runtime.script_error",
            Self::ResourceExhausted(_) => "resource.exhausted",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Io(_) => "internal.io",
        }
    }

    /// Whether the error is a security-relevant policy violation
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::Policy(_)
                | Self::Path(PathError::NotAllowed { .. })
                | Self::Path(PathError::WriteDisabled)
        )
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge { size, limit } => {
                write!(f, "script is {} bytes, limit is {} bytes", size, limit)
            }
            Self::PathTraversal { path } => {
                write!(f, "working directory '{}' contains a parent reference", path)
            }
            Self::DeniedConstruct { construct } => {
                write!(f, "script uses a denied construct: '{}'", construct)
            }
            Self::DeniedPath { path } => write!(f, "script references a denied path: '{}'", path),
        }
    }
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotWhitelisted { scope } => {
                write!(f, "command is not whitelisted for {}", scope)
            }
            Self::ExplicitlyBlocked { scope, pattern } => {
                write!(f, "command is blocked for {} by pattern '{}'", scope, pattern)
            }
        }
    }
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAllowed { path, reason } => {
                write!(f, "access to '{}' is not allowed: {}", path, reason)
            }
            Self::NotFound { path } => write!(f, "path not found: {}", path),
            Self::NotAFile { path } => write!(f, "not a file: {}", path),
            Self::NotADirectory { path } => write!(f, "not a directory: {}", path),
            Self::FileTooLarge { path, size, limit } => write!(
                f,
                "file '{}' is {} bytes, limit is {} bytes",
                path, size, limit
            ),
            Self::WriteDisabled => write!(f, "file writes are disabled"),
        }
    }
}

impl fmt::Display for EditConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { path } => write!(f, "text to replace not found in {}", path),
            Self::Ambiguous { path } => write!(
                f,
                "text to replace occurs more than once in {}; add surrounding context",
                path
            ),
        }
    }
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "Validation failed: {}", e),
            Self::Policy(e) => write!(f, "Policy violation: {}", e),
            Self::Path(e) => write!(f, "Path error: {}", e),
            Self::EditConflict(e) => write!(f, "Edit conflict: {}", e),
            Self::Timeout { duration } => write!(f, "Execution timed out after {:?}", duration),
            Self::Runtime { message, .. } => write!(f, "Script error: {}", message),
            Self::ResourceExhausted(msg) => write!(f, "Resource limit exceeded: {}", msg),
            Self::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl Error for ValidationError {}
impl Error for PolicyError {}
impl Error for PathError {}
impl Error for EditConflictError {}

impl Error for SandboxError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(e) => Some(e),
            Self::Policy(e) => Some(e),
            Self::Path(e) => Some(e),
            Self::EditConflict(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ValidationError> for SandboxError {
    fn from(error: ValidationError) -> Self {
        Self::Validation(error)
    }
}

impl From<PolicyError> for SandboxError {
    fn from(error: PolicyError) -> Self {
        Self::Policy(error)
    }
}

impl From<PathError> for SandboxError {
    fn from(error: PathError) -> Self {
        Self::Path(error)
    }
}

impl From<EditConflictError> for SandboxError {
    fn from(error: EditConflictError) -> Self {
        Self::EditConflict(error)
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

/// Sanitized error shape returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frames: Vec<String>,
}

/// Stack frames kept in an `ErrorInfo`
const MAX_FRAMES: usize = 5;

impl From<&SandboxError> for ErrorInfo {
    fn from(error: &SandboxError) -> Self {
        let frames = match error {
            SandboxError::Runtime { frames, .. } => frames
                .iter()
                .take(MAX_FRAMES)
                .map(|frame| sanitize::summarize(frame, sanitize::MAX_MESSAGE_CHARS))
                .collect(),
            _ => Vec::new(),
        };

        Self {
            category: error.category(),
            code: error.code().to_string(),
            message: sanitize::summarize(&error.to_string(), sanitize::MAX_MESSAGE_CHARS),
            frames,
        }
    }
}

impl From<SandboxError> for ErrorInfo {
    fn from(error: SandboxError) -> Self {
        Self::from(&error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SandboxError::from(PolicyError::NotWhitelisted {
            scope: "bash".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "Policy violation: command is not whitelisted for bash"
        );

        let err = SandboxError::Timeout {
            duration: Duration::from_secs(5),
        };
        assert_eq!(err.to_string(), "Execution timed out after 5s");
    }

    #[test]
    fn test_error_codes_are_stable() {
        let err = SandboxError::from(ValidationError::DeniedConstruct {
            construct: "exit".to_string(),
        });
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert_eq!(err.code(), "validation.denied_construct");
        assert!(err.is_violation());

        let err = SandboxError::from(EditConflictError::Ambiguous {
            path: "a.txt".to_string(),
        });
        assert_eq!(err.code(), "edit.ambiguous");
        assert!(!err.is_violation());
    }

    #[test]
    fn test_error_info_redacts_secrets() {
        let err = SandboxError::runtime("failed with password=hunter2hunter2");
        let info = ErrorInfo::from(&err);
        assert_eq!(info.category, ErrorCategory::RuntimeScript);
        assert!(!info.message.contains("hunter2hunter2"));
        assert!(info.message.contains("[REDACTED_SECRET]"));
    }

    #[test]
    fn test_error_info_keeps_first_frames() {
        let err = SandboxError::Runtime {
            message: "boom".to_string(),
            frames: (0..10).map(|i| format!("frame {}", i)).collect(),
        };
        let info = ErrorInfo::from(err);
        assert_eq!(info.frames.len(), MAX_FRAMES);
        assert_eq!(info.frames[0], "frame 0");
    }
}
