//! Allowed-directory resolution
//!
//! A candidate path is lexically normalized, canonicalized (nearest existing
//! ancestor for paths that do not exist yet) and then accepted only if the
//! canonical form lies under an allowed root. Symlinks found inside a root
//! are refused unless symlink traversal is enabled.

use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::errors::PathError;

/// Device names Windows reserves in every directory, with or without extension
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Whether `name` is a reserved device name such as `NUL` or `com1.txt`
pub fn is_reserved_name(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name).trim_end();
    RESERVED_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(stem))
}

/// Ordered canonical roots a path must fall under
#[derive(Debug, Clone, Default)]
pub struct AllowedDirectorySet {
    roots: Vec<PathBuf>,
}

impl AllowedDirectorySet {
    /// Canonicalize the configured directories; missing ones are skipped.
    pub fn new(directories: &[PathBuf]) -> Self {
        let roots = directories
            .iter()
            .filter_map(|dir| match fs::canonicalize(dir) {
                Ok(root) => Some(root),
                Err(e) => {
                    warn!("Ignoring allowed directory {}: {}", dir.display(), e);
                    None
                }
            })
            .collect();
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Whether a canonical path equals or descends from some root
    pub fn contains(&self, canonical: &Path) -> bool {
        self.roots.iter().any(|root| canonical.starts_with(root))
    }

    /// Resolve `path` against `base` (or the first root) to a canonical path
    /// inside the set. The target itself need not exist.
    pub fn resolve(
        &self,
        path: &Path,
        base: Option<&Path>,
        allow_symlinks: bool,
    ) -> Result<PathBuf, PathError> {
        let shown = path.display().to_string();

        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            let base = base
                .or_else(|| self.roots.first().map(PathBuf::as_path))
                .ok_or_else(|| not_allowed(&shown, "no allowed directories are configured"))?;
            base.join(path)
        };

        let lexical = normalize_lexically(&joined);
        if let Some(name) = lexical.components().find_map(|c| match c {
            Component::Normal(name) if is_reserved_name(&name.to_string_lossy()) => Some(name),
            _ => None,
        }) {
            return Err(not_allowed(
                &shown,
                format!("'{}' is a reserved device name", name.to_string_lossy()),
            ));
        }

        let canonical = canonicalize_nearest(&lexical, &shown)?;
        if !self.contains(&canonical) {
            debug!("Path {} resolves outside allowed directories", shown);
            return Err(not_allowed(&shown, "outside the allowed directories"));
        }

        if !allow_symlinks {
            if let Some(link) = self.symlink_inside(&lexical) {
                return Err(not_allowed(
                    &shown,
                    format!("symlink traversal is disabled ({})", link.display()),
                ));
            }
        }

        Ok(canonical)
    }

    /// First ancestor of `lexical` that is a symlink living under a root
    fn symlink_inside(&self, lexical: &Path) -> Option<PathBuf> {
        lexical.ancestors().find_map(|ancestor| {
            let meta = ancestor.symlink_metadata().ok()?;
            if !meta.file_type().is_symlink() {
                return None;
            }
            let parent = fs::canonicalize(ancestor.parent()?).ok()?;
            self.contains(&parent).then(|| ancestor.to_path_buf())
        })
    }
}

fn not_allowed(path: &str, reason: impl Into<String>) -> PathError {
    PathError::NotAllowed {
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// Drop `.` segments and fold `..` into its parent without touching the disk
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize the longest existing prefix and re-append the missing tail
fn canonicalize_nearest(path: &Path, shown: &str) -> Result<PathBuf, PathError> {
    let mut tail: Vec<OsString> = Vec::new();
    let mut current = path;
    loop {
        if let Ok(mut canonical) = fs::canonicalize(current) {
            canonical.extend(tail.iter().rev());
            return Ok(canonical);
        }
        // A dangling link would be followed by a later create
        if current.symlink_metadata().is_ok() {
            return Err(not_allowed(shown, "dangling symlink"));
        }
        match (current.parent(), current.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                current = parent;
            }
            _ => {
                return Err(PathError::NotFound {
                    path: shown.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn set(dir: &TempDir) -> AllowedDirectorySet {
        AllowedDirectorySet::new(&[dir.path().to_path_buf()])
    }

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved_name("NUL"));
        assert!(is_reserved_name("con"));
        assert!(is_reserved_name("com1.txt"));
        assert!(is_reserved_name("LPT9.tar.gz"));
        assert!(!is_reserved_name("console.log"));
        assert!(!is_reserved_name("COM10"));
    }

    #[test]
    fn test_resolves_relative_and_absolute() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        let set = set(&dir);
        let root = set.roots()[0].clone();

        assert_eq!(set.resolve(Path::new("a.txt"), None, false).unwrap(), root.join("a.txt"));
        assert_eq!(
            set.resolve(&dir.path().join("./sub/../a.txt"), None, false).unwrap(),
            root.join("a.txt")
        );
        // Missing targets resolve so they can be created
        assert_eq!(set.resolve(Path::new("new/b.txt"), None, false).unwrap(), root.join("new/b.txt"));
    }

    #[test]
    fn test_rejects_escape() {
        let dir = TempDir::new().unwrap();
        let set = set(&dir);

        for path in ["/etc/hosts", "../../etc/hosts", "sub/../../outside"] {
            assert!(matches!(
                set.resolve(Path::new(path), None, false),
                Err(PathError::NotAllowed { .. })
            ), "{} should be rejected", path);
        }
    }

    #[test]
    fn test_rejects_sibling_with_shared_prefix() {
        let parent = TempDir::new().unwrap();
        let allowed = parent.path().join("work");
        let sibling = parent.path().join("work2");
        std::fs::create_dir(&allowed).unwrap();
        std::fs::create_dir(&sibling).unwrap();
        let set = AllowedDirectorySet::new(&[allowed]);

        assert!(set.resolve(&sibling.join("x"), None, false).is_err());
    }

    #[test]
    fn test_rejects_reserved_name() {
        let dir = TempDir::new().unwrap();
        let set = set(&dir);
        assert!(matches!(
            set.resolve(Path::new("logs/nul.txt"), None, false),
            Err(PathError::NotAllowed { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_policy() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "s").unwrap();
        std::fs::write(dir.path().join("real.txt"), "r").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("alias.txt")).unwrap();

        let set = set(&dir);
        // Escaping links are refused even when symlinks are allowed
        assert!(set.resolve(Path::new("escape/secret.txt"), None, true).is_err());
        assert!(set.resolve(Path::new("escape/secret.txt"), None, false).is_err());

        assert!(set.resolve(Path::new("alias.txt"), None, false).is_err());
        assert!(set.resolve(Path::new("alias.txt"), None, true).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_rejected() {
        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink("/nonexistent/target", dir.path().join("dangling")).unwrap();
        let set = set(&dir);
        assert!(set.resolve(Path::new("dangling"), None, true).is_err());
    }
}
