//! Static checks run on script text before any of it executes
//!
//! Construct and path checks are plain substring matches. They are a tripwire
//! in front of the capability surface, not a boundary: string building inside
//! a script gets around them, and harmless text that happens to contain a
//! listed substring is rejected.

use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::audit::{AuditCategory, AuditOutcome, Auditor};
use crate::config::ValidatorConfig;
use crate::errors::ValidationError;

#[derive(Debug)]
pub struct ScriptValidator {
    config: RwLock<ValidatorConfig>,
    auditor: Auditor,
}

impl ScriptValidator {
    pub fn new(config: ValidatorConfig, auditor: Auditor) -> Self {
        Self {
            config: RwLock::new(config),
            auditor,
        }
    }

    /// Swap the denylists; takes effect on the next validation
    pub fn reload(&self, config: ValidatorConfig) {
        match self.config.write() {
            Ok(mut current) => *current = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
        debug!("Script validator denylists reloaded");
    }

    /// Reject oversize scripts, traversing working directories, denied
    /// constructs and denied paths, in that order.
    pub fn validate(
        &self,
        script: &str,
        working_dir: &Path,
        max_script_bytes: usize,
    ) -> Result<(), ValidationError> {
        let result = self.check(script, working_dir, max_script_bytes);
        if let Err(ref e) = result {
            warn!("Script rejected: {}", e);
            self.auditor.record(
                AuditCategory::SecurityViolation,
                &format!("script rejected: {}", e),
                AuditOutcome::Rejected,
                Duration::ZERO,
            );
        }
        result
    }

    fn check(
        &self,
        script: &str,
        working_dir: &Path,
        max_script_bytes: usize,
    ) -> Result<(), ValidationError> {
        if script.len() > max_script_bytes {
            return Err(ValidationError::TooLarge {
                size: script.len(),
                limit: max_script_bytes,
            });
        }

        if has_parent_segment(working_dir) {
            return Err(ValidationError::PathTraversal {
                path: working_dir.display().to_string(),
            });
        }

        let config = match self.config.read() {
            Ok(config) => config,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(construct) = config
            .denied_constructs
            .iter()
            .find(|c| !c.is_empty() && script.contains(c.as_str()))
        {
            return Err(ValidationError::DeniedConstruct {
                construct: construct.clone(),
            });
        }

        let lowered = script.to_lowercase();
        if let Some(path) = config
            .denied_paths
            .iter()
            .find(|p| !p.is_empty() && lowered.contains(&p.to_lowercase()))
        {
            return Err(ValidationError::DeniedPath { path: path.clone() });
        }

        Ok(())
    }
}

/// Both separators count, so a Windows-style path is caught on Unix too.
fn has_parent_segment(path: &Path) -> bool {
    path.to_string_lossy()
        .split(['/', '\\'])
        .any(|segment| segment == "..")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use std::sync::Arc;

    fn validator() -> (ScriptValidator, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        let validator = ScriptValidator::new(ValidatorConfig::default(), Auditor::new(sink.clone()));
        (validator, sink)
    }

    #[test]
    fn test_accepts_plain_script() {
        let (validator, sink) = validator();
        let script = "set total 0\nforeach n {1 2 3} { incr total $n }\nemit $total";
        assert!(validator.validate(script, Path::new("/srv/work"), 1000).is_ok());
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_rejects_forced_exit_anywhere() {
        let (validator, sink) = validator();
        for script in ["exit", "set x 1; exit 0", "if {1} {\n    exit 2\n}", "proc f {} { exit }"] {
            let err = validator.validate(script, Path::new("/srv/work"), 1000).unwrap_err();
            assert_eq!(
                err,
                ValidationError::DeniedConstruct {
                    construct: "exit".to_string()
                }
            );
        }
        let events = sink.events_in(AuditCategory::SecurityViolation);
        assert_eq!(events.len(), 4);
        assert!(events.iter().all(|e| e.outcome == AuditOutcome::Rejected));
    }

    #[test]
    fn test_rejects_reflective_evaluation() {
        let (validator, _) = validator();
        for script in [
            "eval {emit hi}",
            "set x [eval $cmd]",
            "uplevel #0 {set y 1}",
            "::sandbox::proc f {} { while 1 {} }",
        ] {
            assert!(matches!(
                validator.validate(script, Path::new("/srv/work"), 1000),
                Err(ValidationError::DeniedConstruct { .. })
            ));
        }
        assert!(validator
            .validate("emit evaluation", Path::new("/srv/work"), 1000)
            .is_ok());
    }

    #[test]
    fn test_rejects_oversize_script_first() {
        let (validator, _) = validator();
        let err = validator
            .validate("exit exit exit", Path::new("/srv/../etc"), 4)
            .unwrap_err();
        assert_eq!(err, ValidationError::TooLarge { size: 14, limit: 4 });
    }

    #[test]
    fn test_rejects_parent_segment_in_working_dir() {
        let (validator, _) = validator();
        for wd in ["/srv/work/../etc", "..", "C:\\work\\..\\secrets"] {
            assert!(matches!(
                validator.validate("emit hi", Path::new(wd), 1000),
                Err(ValidationError::PathTraversal { .. })
            ));
        }
        // A dot-dot inside a name is not a parent reference
        assert!(validator.validate("emit hi", Path::new("/srv/a..b"), 1000).is_ok());
    }

    #[test]
    fn test_denied_paths_ignore_case() {
        let (validator, _) = validator();
        let err = validator
            .validate("read_file /ETC/Shadow", Path::new("/srv"), 1000)
            .unwrap_err();
        assert!(matches!(err, ValidationError::DeniedPath { .. }));
    }

    #[test]
    fn test_reload_changes_denylists() {
        let (validator, _) = validator();
        assert!(validator.validate("emit forbidden", Path::new("/srv"), 1000).is_ok());

        validator.reload(ValidatorConfig {
            denied_constructs: vec!["forbidden".to_string()],
            denied_paths: Vec::new(),
        });
        assert!(validator.validate("emit forbidden", Path::new("/srv"), 1000).is_err());
        assert!(validator.validate("exit", Path::new("/srv"), 1000).is_ok());
    }
}
