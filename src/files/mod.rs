//! Bounded, allow-listed file access
//!
//! Every operation resolves its path through [`AllowedDirectorySet`] and has a
//! bounded worst case: line operations stream the file once, directory
//! operations stop at their caps. Text returned to callers has control
//! characters stripped.

pub mod edit;
pub mod paths;
pub mod read;
pub mod walk;

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::debug;

use crate::audit::{AuditCategory, AuditOutcome, Auditor};
use crate::cancel::CancelToken;
use crate::config::SandboxConfig;
use crate::errors::{PathError, SandboxError, SandboxResult};

pub use self::paths::{is_reserved_name, AllowedDirectorySet};

/// Lines returned by `read_range`, `head` and `tail`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinesResult {
    pub lines: Vec<String>,
    /// 1-indexed number of the first returned line
    pub start_line: usize,
    pub total_lines: usize,
    /// More lines exist outside the returned window
    pub truncated: bool,
}

/// One matching line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineMatch {
    pub line_number: usize,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrepResult {
    pub matches: Vec<LineMatch>,
    /// The match cap was reached and scanning stopped
    pub truncated: bool,
    pub lines_scanned: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineCount {
    pub lines: usize,
    pub bytes: u64,
}

/// Matches found in one file by `search_tree`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMatches {
    pub path: String,
    pub matches: Vec<LineMatch>,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub files: Vec<FileMatches>,
    pub total_matches: usize,
    pub files_scanned: usize,
    /// The global result cap was reached
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
    /// Placeholder for entries cut by a depth or count cap
    Truncated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub name: String,
    pub path: String,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub kind: NodeKind,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub entries: Vec<DirEntryInfo>,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub path: String,
    pub bytes_written: usize,
}

/// Settings copied out of [`SandboxConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAccessSettings {
    pub enable_write: bool,
    pub allow_symlinks: bool,
    pub max_file_size_bytes: u64,
}

impl FileAccessSettings {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            enable_write: config.enable_write,
            allow_symlinks: config.allow_symlinks,
            max_file_size_bytes: config.max_file_size_bytes(),
        }
    }
}

#[derive(Debug)]
struct Shared {
    dirs: AllowedDirectorySet,
    settings: FileAccessSettings,
}

/// Handle to the file primitives
///
/// Clones share the directory set and settings, so a reload is seen by every
/// handle. [`BoundedFileAccess::scoped`] binds a working directory and a
/// cancellation token for one execution.
#[derive(Debug, Clone)]
pub struct BoundedFileAccess {
    shared: Arc<RwLock<Arc<Shared>>>,
    auditor: Auditor,
    base: Option<PathBuf>,
    cancel: Option<CancelToken>,
}

impl BoundedFileAccess {
    pub fn new(config: &SandboxConfig, auditor: Auditor) -> Self {
        Self {
            shared: Arc::new(RwLock::new(Arc::new(Shared::from_config(config)))),
            auditor,
            base: None,
            cancel: None,
        }
    }

    /// Re-read allowed directories and settings
    pub fn reload(&self, config: &SandboxConfig) {
        let fresh = Arc::new(Shared::from_config(config));
        match self.shared.write() {
            Ok(mut shared) => *shared = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
        debug!("File access settings reloaded");
    }

    /// Handle that resolves relative paths against `base` and stops when
    /// `cancel` fires
    pub fn scoped(&self, base: impl Into<PathBuf>, cancel: CancelToken) -> Self {
        Self {
            shared: self.shared.clone(),
            auditor: self.auditor.clone(),
            base: Some(base.into()),
            cancel: Some(cancel),
        }
    }

    pub fn settings(&self) -> FileAccessSettings {
        self.snapshot().settings
    }

    pub fn allowed_directories(&self) -> Vec<PathBuf> {
        self.snapshot().dirs.roots().to_vec()
    }

    /// Canonical allowed form of `path`
    pub fn resolve(&self, path: impl AsRef<Path>) -> SandboxResult<PathBuf> {
        let shared = self.snapshot();
        Ok(shared.dirs.resolve(
            path.as_ref(),
            self.base.as_deref(),
            shared.settings.allow_symlinks,
        )?)
    }

    /// Resolve a path that must be an existing directory
    pub fn resolve_dir(&self, path: impl AsRef<Path>) -> SandboxResult<PathBuf> {
        let resolved = self.resolve(path.as_ref())?;
        let meta = metadata(&resolved, path.as_ref())?;
        if !meta.is_dir() {
            return Err(PathError::NotADirectory {
                path: path.as_ref().display().to_string(),
            }
            .into());
        }
        Ok(resolved)
    }

    fn snapshot(&self) -> Arc<Shared> {
        match self.shared.read() {
            Ok(shared) => shared.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn check_cancel(&self) -> SandboxResult<()> {
        match &self.cancel {
            Some(cancel) => cancel.check(),
            None => Ok(()),
        }
    }

    /// Resolve and open an existing regular file
    fn open_file(&self, path: &Path) -> SandboxResult<(PathBuf, File)> {
        let resolved = self.resolve(path)?;
        let meta = metadata(&resolved, path)?;
        if !meta.is_file() {
            return Err(PathError::NotAFile {
                path: path.display().to_string(),
            }
            .into());
        }
        let file = File::open(&resolved)?;
        Ok((resolved, file))
    }

    /// Run one operation, auditing any failure
    fn audited<T>(
        &self,
        operation: &str,
        path: &Path,
        f: impl FnOnce() -> SandboxResult<T>,
    ) -> SandboxResult<T> {
        let start = Instant::now();
        let result = f();
        if let Err(ref e) = result {
            let (category, outcome) = if e.is_violation() {
                (AuditCategory::SecurityViolation, AuditOutcome::Denied)
            } else {
                (AuditCategory::FileOp, AuditOutcome::Failed)
            };
            debug!("{} {} failed: {}", operation, path.display(), e);
            self.auditor.record(
                category,
                &format!("{} {}: {}", operation, path.display(), e),
                outcome,
                start.elapsed(),
            );
        }
        result
    }
}

impl Shared {
    fn from_config(config: &SandboxConfig) -> Self {
        Self {
            dirs: AllowedDirectorySet::new(&config.allowed_directories),
            settings: FileAccessSettings::from_config(config),
        }
    }
}

fn metadata(resolved: &Path, shown: &Path) -> SandboxResult<fs::Metadata> {
    fs::metadata(resolved).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => SandboxError::Path(PathError::NotFound {
            path: shown.display().to_string(),
        }),
        _ => SandboxError::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use tempfile::TempDir;

    #[test]
    fn test_failures_are_audited() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(MemoryAuditSink::new());
        let files = BoundedFileAccess::new(
            &SandboxConfig::new(vec![dir.path().to_path_buf()]),
            Auditor::new(sink.clone()),
        );

        assert!(files.head("missing.txt", 10).is_err());
        assert!(files.head("/etc/hosts", 10).is_err());

        assert_eq!(sink.events_in(AuditCategory::FileOp).len(), 1);
        assert_eq!(sink.events_in(AuditCategory::SecurityViolation).len(), 1);
    }

    #[test]
    fn test_reload_changes_allowed_directories() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        std::fs::write(second.path().join("b.txt"), "b\n").unwrap();

        let files = BoundedFileAccess::new(
            &SandboxConfig::new(vec![first.path().to_path_buf()]),
            Auditor::tracing(),
        );
        let scoped = files.scoped(first.path(), CancelToken::new());
        let target = second.path().join("b.txt");
        assert!(scoped.head(&target, 1).is_err());

        files.reload(&SandboxConfig::new(vec![
            first.path().to_path_buf(),
            second.path().to_path_buf(),
        ]));
        assert_eq!(scoped.head(&target, 1).unwrap().lines, vec!["b"]);
    }

    #[test]
    fn test_directory_is_not_a_file() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let files = BoundedFileAccess::new(
            &SandboxConfig::new(vec![dir.path().to_path_buf()]),
            Auditor::tracing(),
        );

        assert!(matches!(
            files.count_lines("sub"),
            Err(SandboxError::Path(PathError::NotAFile { .. }))
        ));
        assert!(matches!(
            files.tree("sub/../missing", &[], 2, 10),
            Err(SandboxError::Path(PathError::NotFound { .. }))
        ));
    }
}
