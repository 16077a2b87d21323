//! Directory walks: content search, tree rendering and listing

use regex::Regex;
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

use super::read::{scan_matches, Lines};
use super::{
    is_reserved_name, BoundedFileAccess, DirEntryInfo, FileMatches, Listing, NodeKind,
    SearchResult, TreeNode,
};
use crate::errors::SandboxResult;
use crate::pattern;

/// Directory names skipped by every walk
pub const DEFAULT_EXCLUDES: &[&str] = &[".git", "node_modules", "target"];

/// Bytes inspected for a NUL when deciding a file is binary
const BINARY_SNIFF_BYTES: u64 = 8 * 1024;

/// Entries returned by one `list_dir`
pub const MAX_LIST_ENTRIES: usize = 10_000;

fn is_skipped_name(name: &str) -> bool {
    DEFAULT_EXCLUDES.contains(&name) || is_reserved_name(name)
}

impl BoundedFileAccess {
    /// Search file contents under `dir`.
    ///
    /// No file contributes more than `max_matches_per_file` matches and the
    /// walk ends once `max_results` matches are collected. Binary files and
    /// files over the size limit are skipped.
    pub fn search_tree(
        &self,
        dir: impl AsRef<Path>,
        content_pattern: &str,
        file_pattern: Option<&str>,
        max_results: usize,
        max_matches_per_file: usize,
    ) -> SandboxResult<SearchResult> {
        let dir = dir.as_ref();
        self.audited("search", dir, || {
            let root = self.resolve_dir(dir)?;
            let content = pattern::safe_compile(content_pattern);
            let file_filter = file_pattern.map(pattern::safe_compile);
            let settings = self.settings();

            let mut result = SearchResult {
                files: Vec::new(),
                total_matches: 0,
                files_scanned: 0,
                truncated: false,
            };

            let walker = WalkDir::new(&root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !is_skipped_name(&e.file_name().to_string_lossy()));

            for entry in walker {
                self.check_cancel()?;
                if result.total_matches >= max_results {
                    result.truncated = true;
                    break;
                }

                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        debug!("Skipping unreadable entry: {}", e);
                        continue;
                    }
                };

                let file_type = entry.file_type();
                let path = if file_type.is_symlink() {
                    if !settings.allow_symlinks {
                        continue;
                    }
                    // The link target must itself be an allowed file
                    match self.resolve(entry.path()) {
                        Ok(target) if target.is_file() => target,
                        _ => continue,
                    }
                } else if file_type.is_file() {
                    entry.path().to_path_buf()
                } else {
                    continue;
                };

                if let Some(filter) = &file_filter {
                    if !filter.is_match(&entry.file_name().to_string_lossy()) {
                        continue;
                    }
                }

                let Some(file) = open_searchable(&path, settings.max_file_size_bytes) else {
                    continue;
                };
                result.files_scanned += 1;

                let cap = max_matches_per_file.min(max_results - result.total_matches);
                let lines = Lines::new(BufReader::new(file), self.cancel.clone());
                let found = scan_matches(lines, &content, cap)?;
                if found.matches.is_empty() {
                    continue;
                }

                result.total_matches += found.matches.len();
                result.files.push(FileMatches {
                    path: entry.path().display().to_string(),
                    matches: found.matches,
                    truncated: found.truncated,
                });
                if result.total_matches >= max_results {
                    result.truncated = true;
                    break;
                }
            }

            Ok(result)
        })
    }

    /// Nested view of `dir`.
    ///
    /// Directories at `max_depth` get a single truncated child; once
    /// `max_files` entries are emitted one truncated marker ends the walk.
    pub fn tree(
        &self,
        dir: impl AsRef<Path>,
        exclude_patterns: &[String],
        max_depth: usize,
        max_files: usize,
    ) -> SandboxResult<TreeNode> {
        let dir = dir.as_ref();
        self.audited("tree", dir, || {
            let root = self.resolve_dir(dir)?;
            let mut walk = TreeWalk {
                files: self,
                excludes: exclude_patterns
                    .iter()
                    .map(|p| pattern::safe_compile(p))
                    .collect(),
                max_depth,
                remaining: max_files,
                marker_emitted: false,
            };
            let children = walk.children(&root, 0)?;
            Ok(TreeNode {
                name: root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| root.display().to_string()),
                path: root.display().to_string(),
                kind: NodeKind::Directory,
                size: None,
                children,
            })
        })
    }

    /// Immediate entries of `dir`, reserved device names omitted
    pub fn list_dir(&self, dir: impl AsRef<Path>) -> SandboxResult<Listing> {
        let dir = dir.as_ref();
        self.audited("list_dir", dir, || {
            let root = self.resolve_dir(dir)?;
            let mut entries: Vec<DirEntryInfo> = fs::read_dir(&root)?
                .filter_map(Result::ok)
                .filter(|e| !is_reserved_name(&e.file_name().to_string_lossy()))
                .take(MAX_LIST_ENTRIES + 1)
                .map(|e| {
                    let (kind, size) = describe(&e);
                    DirEntryInfo {
                        name: e.file_name().to_string_lossy().into_owned(),
                        kind,
                        size,
                    }
                })
                .collect();

            let truncated = entries.len() > MAX_LIST_ENTRIES;
            entries.truncate(MAX_LIST_ENTRIES);
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(Listing { entries, truncated })
        })
    }
}

fn describe(entry: &fs::DirEntry) -> (NodeKind, Option<u64>) {
    match entry.file_type() {
        Ok(t) if t.is_symlink() => (NodeKind::Symlink, None),
        Ok(t) if t.is_dir() => (NodeKind::Directory, None),
        _ => (NodeKind::File, entry.metadata().ok().map(|m| m.len())),
    }
}

/// Open a regular file for searching unless it is too large or binary
fn open_searchable(path: &Path, max_bytes: u64) -> Option<File> {
    let size = fs::metadata(path).ok()?.len();
    if size > max_bytes {
        debug!("Skipping {} ({} bytes over limit)", path.display(), size);
        return None;
    }
    let mut file = File::open(path).ok()?;
    let mut head = Vec::with_capacity(BINARY_SNIFF_BYTES as usize);
    (&mut file).take(BINARY_SNIFF_BYTES).read_to_end(&mut head).ok()?;
    if head.contains(&0) {
        return None;
    }
    file.seek(SeekFrom::Start(0)).ok()?;
    Some(file)
}

struct TreeWalk<'a> {
    files: &'a BoundedFileAccess,
    excludes: Vec<Regex>,
    max_depth: usize,
    remaining: usize,
    marker_emitted: bool,
}

impl TreeWalk<'_> {
    fn excluded(&self, name: &str) -> bool {
        is_skipped_name(name) || self.excludes.iter().any(|re| re.is_match(name))
    }

    fn children(&mut self, dir: &Path, depth: usize) -> SandboxResult<Vec<TreeNode>> {
        let mut entries: Vec<fs::DirEntry> = match fs::read_dir(dir) {
            Ok(read_dir) => read_dir
                .filter_map(Result::ok)
                .filter(|e| !self.excluded(&e.file_name().to_string_lossy()))
                .collect(),
            Err(e) => {
                debug!("Cannot read {}: {}", dir.display(), e);
                return Ok(Vec::new());
            }
        };
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        if depth >= self.max_depth {
            return Ok(vec![marker(dir)]);
        }
        entries.sort_by_key(|e| e.file_name());
        entries.truncate(self.remaining.saturating_add(1));

        let mut nodes = Vec::with_capacity(entries.len());
        for entry in entries {
            self.files.check_cancel()?;
            if self.remaining == 0 {
                if !self.marker_emitted {
                    self.marker_emitted = true;
                    nodes.push(marker(dir));
                }
                break;
            }
            self.remaining -= 1;

            let path = entry.path();
            let (kind, size) = describe(&entry);
            let children = match kind {
                NodeKind::Directory => self.children(&path, depth + 1)?,
                _ => Vec::new(),
            };
            nodes.push(TreeNode {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: path.display().to_string(),
                kind,
                size,
                children,
            });
        }
        Ok(nodes)
    }
}

fn marker(dir: &Path) -> TreeNode {
    TreeNode {
        name: "...".to_string(),
        path: dir.display().to_string(),
        kind: NodeKind::Truncated,
        size: None,
        children: Vec::new(),
    }
}
