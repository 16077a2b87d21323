//! TOML configuration for the sandbox

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::{SandboxError, SandboxResult};

/// Main sandbox configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Directories scripts and commands may touch
    #[serde(default)]
    pub allowed_directories: Vec<PathBuf>,

    /// Whether write operations are permitted
    #[serde(default)]
    pub enable_write: bool,

    /// Whether symlinks may be traversed inside allowed directories
    #[serde(default)]
    pub allow_symlinks: bool,

    /// Largest file a whole-file operation will load
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,

    /// Timeout for a single shell command in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,

    /// Cap on captured stdout/stderr per command
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Cap on lines a script may emit
    #[serde(default = "default_max_output_lines")]
    pub max_output_lines: usize,

    /// Execution resource limits
    #[serde(default)]
    pub limits: ResourceLimits,

    /// Shell command whitelist/blacklist
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Static script checks
    #[serde(default)]
    pub validator: ValidatorConfig,

    /// Audit log settings
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Resource limits, read-only for the lifetime of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum script size in bytes
    #[serde(default = "default_max_script_bytes")]
    pub max_script_bytes: usize,

    /// Wall-clock limit per execution
    #[serde(default = "default_max_execution_seconds")]
    pub max_execution_seconds: u64,

    /// Process memory budget
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,

    /// Executions allowed at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,
}

/// Per-execution overrides; unset fields keep the base value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverrides {
    #[serde(default)]
    pub max_script_bytes: Option<usize>,
    #[serde(default)]
    pub max_execution_seconds: Option<u64>,
    #[serde(default)]
    pub max_memory_mb: Option<u64>,
    #[serde(default)]
    pub max_concurrent_executions: Option<usize>,
}

/// Allow/deny pattern lists for every shell scope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub bash: ScopePatterns,

    #[serde(default)]
    pub powershell: ScopePatterns,
}

/// Allow/deny regular expressions for one shell scope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopePatterns {
    #[serde(default)]
    pub allowed_patterns: Vec<String>,

    #[serde(default)]
    pub denied_patterns: Vec<String>,
}

/// Denylists consulted before a script runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Literal substrings naming process-spawn, exit, loading and eval constructs
    #[serde(default = "default_denied_constructs")]
    pub denied_constructs: Vec<String>,

    /// Literal substrings naming sensitive system paths and credential files
    #[serde(default = "default_denied_paths")]
    pub denied_paths: Vec<String>,
}

/// Audit log settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Append JSON lines here in addition to the tracing sink
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl SandboxConfig {
    /// Create a configuration rooted at the given directories
    pub fn new(allowed_directories: Vec<PathBuf>) -> Self {
        Self {
            allowed_directories,
            ..Self::default()
        }
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Save configuration to TOML string
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Read and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let toml_str = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&toml_str)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.allowed_directories.is_empty() {
            bail!("at least one allowed directory is required");
        }
        for dir in &self.allowed_directories {
            if !dir.is_absolute() {
                bail!("allowed directory must be absolute: {}", dir.display());
            }
        }
        self.limits.validate()?;
        if self.max_file_size_mb == 0 {
            bail!("max_file_size_mb must be greater than zero");
        }
        if self.command_timeout_seconds == 0 {
            bail!("command_timeout_seconds must be greater than zero");
        }
        Ok(())
    }

    /// Largest file size in bytes
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }
}

impl ResourceLimits {
    /// Create minimal resource limits
    pub fn minimal() -> Self {
        Self {
            max_script_bytes: 10_000,
            max_execution_seconds: 5,
            max_memory_mb: 256,
            max_concurrent_executions: 2,
        }
    }

    /// Create relaxed resource limits
    pub fn relaxed() -> Self {
        Self {
            max_script_bytes: 1_000_000,
            max_execution_seconds: 300,
            max_memory_mb: 4096,
            max_concurrent_executions: 64,
        }
    }

    /// Apply per-execution overrides, returning a new value.
    ///
    /// Script size and execution time may be raised or lowered. The memory
    /// and concurrency caps guard the whole process, so an override can only
    /// tighten them. Zero is never a valid override.
    pub fn with_overrides(&self, overrides: &LimitOverrides) -> SandboxResult<Self> {
        fn nonzero<T: Copy + PartialEq + Default>(value: Option<T>, name: &str) -> SandboxResult<Option<T>> {
            match value {
                Some(v) if v == T::default() => Err(SandboxError::invalid_argument(format!(
                    "{} override must be greater than zero",
                    name
                ))),
                other => Ok(other),
            }
        }

        let max_script_bytes = nonzero(overrides.max_script_bytes, "max_script_bytes")?;
        let max_execution_seconds = nonzero(overrides.max_execution_seconds, "max_execution_seconds")?;
        let max_memory_mb = nonzero(overrides.max_memory_mb, "max_memory_mb")?;
        let max_concurrent_executions =
            nonzero(overrides.max_concurrent_executions, "max_concurrent_executions")?;

        Ok(Self {
            max_script_bytes: max_script_bytes.unwrap_or(self.max_script_bytes),
            max_execution_seconds: max_execution_seconds.unwrap_or(self.max_execution_seconds),
            max_memory_mb: max_memory_mb.map_or(self.max_memory_mb, |mb| mb.min(self.max_memory_mb)),
            max_concurrent_executions: max_concurrent_executions
                .map_or(self.max_concurrent_executions, |n| n.min(self.max_concurrent_executions)),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_script_bytes == 0 {
            bail!("max_script_bytes must be greater than zero");
        }
        if self.max_execution_seconds == 0 {
            bail!("max_execution_seconds must be greater than zero");
        }
        if self.max_concurrent_executions == 0 {
            bail!("max_concurrent_executions must be greater than zero");
        }
        Ok(())
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            allowed_directories: Vec::new(),
            enable_write: false,
            allow_symlinks: false,
            max_file_size_mb: default_max_file_size_mb(),
            command_timeout_seconds: default_command_timeout(),
            max_output_bytes: default_max_output_bytes(),
            max_output_lines: default_max_output_lines(),
            limits: ResourceLimits::default(),
            policy: PolicyConfig::default(),
            validator: ValidatorConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_script_bytes: default_max_script_bytes(),
            max_execution_seconds: default_max_execution_seconds(),
            max_memory_mb: default_max_memory_mb(),
            max_concurrent_executions: default_max_concurrent(),
        }
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            denied_constructs: default_denied_constructs(),
            denied_paths: default_denied_paths(),
        }
    }
}

// Default value functions for serde
fn default_max_file_size_mb() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    30
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_max_output_lines() -> usize {
    10_000
}

fn default_max_script_bytes() -> usize {
    100_000
}

fn default_max_execution_seconds() -> u64 {
    30
}

fn default_max_memory_mb() -> u64 {
    1024
}

fn default_max_concurrent() -> usize {
    10
}

fn default_denied_constructs() -> Vec<String> {
    [
        // process spawning
        "exec ",
        "[exec",
        "open |",
        "open \"|",
        "open {|",
        "socket ",
        // forced exit
        "exit",
        // dynamic loading
        "load ",
        "package require",
        // reflective evaluation
        "eval ",
        "[eval",
        "interp ",
        "uplevel #0",
        // the interpreter's own proc, bypassing per-call cancellation checks
        "::sandbox::proc",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_denied_paths() -> Vec<String> {
    [
        "/etc/shadow",
        "/etc/passwd",
        "/etc/sudoers",
        "/etc/ssh",
        "/proc/",
        "/sys/",
        ".ssh/",
        "id_rsa",
        "id_ed25519",
        ".aws/credentials",
        ".gnupg",
        ".netrc",
        "c:\\windows\\system32",
        "\\config\\sam",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_serialization() {
        let config = SandboxConfig::new(vec![PathBuf::from("/srv/work")]);
        let toml = config.to_toml().unwrap();
        let parsed = SandboxConfig::from_toml(&toml).unwrap();

        assert_eq!(parsed, config);
    }

    #[test]
    fn test_defaults_from_minimal_toml() {
        let config = SandboxConfig::from_toml(
            r#"
            allowed_directories = ["/srv/work"]

            [policy.bash]
            allowed_patterns = ["^ls.*"]
            denied_patterns = [".*rm .*"]
            "#,
        )
        .unwrap();

        assert_eq!(config.limits.max_script_bytes, 100_000);
        assert_eq!(config.policy.bash.allowed_patterns, vec!["^ls.*"]);
        assert!(config.policy.powershell.allowed_patterns.is_empty());
        assert!(config.validator.denied_constructs.iter().any(|c| c == "exit"));
        assert!(!config.enable_write);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = SandboxConfig::default();
        assert!(config.validate().is_err());

        config.allowed_directories.push(PathBuf::from("relative"));
        assert!(config.validate().is_err());

        config.allowed_directories = vec![PathBuf::from("/srv/work")];
        assert!(config.validate().is_ok());

        config.limits.max_concurrent_executions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_produce_new_value() {
        let base = ResourceLimits::default();
        let overrides = LimitOverrides {
            max_execution_seconds: Some(2),
            ..LimitOverrides::default()
        };

        let effective = base.with_overrides(&overrides).unwrap();
        assert_eq!(effective.max_execution_seconds, 2);
        assert_eq!(effective.max_script_bytes, base.max_script_bytes);
        assert_eq!(base, ResourceLimits::default());
    }

    #[test]
    fn test_overrides_only_tighten_process_wide_caps() {
        let base = ResourceLimits::default();
        let raised = LimitOverrides {
            max_concurrent_executions: Some(base.max_concurrent_executions * 10),
            max_memory_mb: Some(base.max_memory_mb * 10),
            ..LimitOverrides::default()
        };
        let effective = base.with_overrides(&raised).unwrap();
        assert_eq!(effective.max_concurrent_executions, base.max_concurrent_executions);
        assert_eq!(effective.max_memory_mb, base.max_memory_mb);

        let lowered = LimitOverrides {
            max_concurrent_executions: Some(1),
            ..LimitOverrides::default()
        };
        assert_eq!(base.with_overrides(&lowered).unwrap().max_concurrent_executions, 1);
    }

    #[test]
    fn test_zero_overrides_are_rejected() {
        let base = ResourceLimits::default();
        for overrides in [
            LimitOverrides {
                max_execution_seconds: Some(0),
                ..LimitOverrides::default()
            },
            LimitOverrides {
                max_script_bytes: Some(0),
                ..LimitOverrides::default()
            },
            LimitOverrides {
                max_memory_mb: Some(0),
                ..LimitOverrides::default()
            },
            LimitOverrides {
                max_concurrent_executions: Some(0),
                ..LimitOverrides::default()
            },
        ] {
            assert!(matches!(
                base.with_overrides(&overrides),
                Err(SandboxError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("sandbox.toml");
        std::fs::write(&path, "allowed_directories = [\"/srv/work\"]\nenable_write = true\n").unwrap();

        let config = SandboxConfig::load(&path).unwrap();
        assert!(config.enable_write);

        std::fs::write(&path, "allowed_directories = []\n").unwrap();
        assert!(SandboxConfig::load(&path).is_err());
    }
}
