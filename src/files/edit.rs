//! Write-side operations, only available with `enable_write`

use std::fs;
use std::path::Path;
use std::time::Instant;
use tracing::info;

use super::{metadata, BoundedFileAccess, WriteResult};
use crate::audit::{AuditCategory, AuditOutcome};
use crate::errors::{EditConflictError, PathError, SandboxError, SandboxResult};

impl BoundedFileAccess {
    fn require_write(&self) -> SandboxResult<()> {
        if self.settings().enable_write {
            Ok(())
        } else {
            Err(PathError::WriteDisabled.into())
        }
    }

    fn record_write(&self, operation: &str, path: &Path, start: Instant) {
        info!("{} wrote {}", operation, path.display());
        self.auditor.record(
            AuditCategory::FileOp,
            &format!("{} {}", operation, path.display()),
            AuditOutcome::Completed,
            start.elapsed(),
        );
    }

    /// Create or overwrite a file. The parent directory must exist.
    pub fn write_file(&self, path: impl AsRef<Path>, content: &str) -> SandboxResult<WriteResult> {
        let path = path.as_ref();
        let start = Instant::now();
        let result = self.audited("write_file", path, || {
            self.require_write()?;
            let limit = self.settings().max_file_size_bytes;
            if content.len() as u64 > limit {
                return Err(PathError::FileTooLarge {
                    path: path.display().to_string(),
                    size: content.len() as u64,
                    limit,
                }
                .into());
            }

            let resolved = self.resolve(path)?;
            if resolved.is_dir() {
                return Err(PathError::NotAFile {
                    path: path.display().to_string(),
                }
                .into());
            }
            fs::write(&resolved, content).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => SandboxError::Path(PathError::NotFound {
                    path: path.display().to_string(),
                }),
                _ => SandboxError::Io(e),
            })?;

            Ok(WriteResult {
                path: resolved.display().to_string(),
                bytes_written: content.len(),
            })
        })?;
        self.record_write("write_file", path, start);
        Ok(result)
    }

    /// Replace the single occurrence of `old_text`.
    ///
    /// Fails with `NotFound` when it is absent and `Ambiguous` when it
    /// occurs more than once; the file is untouched in both cases.
    pub fn replace_unique(
        &self,
        path: impl AsRef<Path>,
        old_text: &str,
        new_text: &str,
    ) -> SandboxResult<WriteResult> {
        let path = path.as_ref();
        let start = Instant::now();
        let result = self.audited("replace_unique", path, || {
            self.require_write()?;
            if old_text.is_empty() {
                return Err(SandboxError::invalid_argument("text to replace is empty"));
            }

            let (resolved, _) = self.open_file(path)?;
            let size = metadata(&resolved, path)?.len();
            let limit = self.settings().max_file_size_bytes;
            if size > limit {
                return Err(PathError::FileTooLarge {
                    path: path.display().to_string(),
                    size,
                    limit,
                }
                .into());
            }

            let content = fs::read_to_string(&resolved)?;
            let shown = path.display().to_string();
            match count_occurrences(&content, old_text, 2) {
                0 => return Err(EditConflictError::NotFound { path: shown }.into()),
                1 => {}
                _ => return Err(EditConflictError::Ambiguous { path: shown }.into()),
            }

            let updated = content.replacen(old_text, new_text, 1);
            fs::write(&resolved, &updated)?;
            Ok(WriteResult {
                path: resolved.display().to_string(),
                bytes_written: updated.len(),
            })
        })?;
        self.record_write("replace_unique", path, start);
        Ok(result)
    }
}

/// Occurrences of `needle` in `haystack` up to `limit`, overlapping ones included
fn count_occurrences(haystack: &str, needle: &str, limit: usize) -> usize {
    let step = needle.chars().next().map_or(1, char::len_utf8);
    let mut count = 0;
    let mut from = 0;
    while count < limit {
        match haystack[from..].find(needle) {
            Some(index) => {
                count += 1;
                from += index + step;
            }
            None => break,
        }
    }
    count
}
