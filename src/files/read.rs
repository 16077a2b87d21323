//! Single-pass line operations
//!
//! The algorithms are written over plain line iterators so their reading
//! behaviour can be observed directly; the public methods feed them a
//! cancellable, lossy line reader over the resolved file.

use regex::Regex;
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use super::{metadata, BoundedFileAccess, GrepResult, LineCount, LineMatch, LinesResult};
use crate::cancel::CancelToken;
use crate::errors::{PathError, SandboxError, SandboxResult};
use crate::pattern;
use crate::sanitize;

/// Longest line kept; the rest of an overlong line is skipped
pub const MAX_LINE_BYTES: usize = 64 * 1024;

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Lines of a reader, decoded lossily and stripped of control characters
pub(crate) struct Lines<R> {
    reader: R,
    cancel: Option<CancelToken>,
    done: bool,
}

impl<R: BufRead> Lines<R> {
    pub(crate) fn new(reader: R, cancel: Option<CancelToken>) -> Self {
        Self {
            reader,
            cancel,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for Lines<R> {
    type Item = SandboxResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(cancel) = &self.cancel {
            if let Err(e) = cancel.check() {
                self.done = true;
                return Some(Err(e));
            }
        }
        match read_line_capped(&mut self.reader, MAX_LINE_BYTES) {
            Ok(Some(line)) => Some(Ok(line)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e.into()))
            }
        }
    }
}

/// Read one line keeping at most `cap` bytes of it; `None` at EOF.
fn read_line_capped<R: BufRead>(reader: &mut R, cap: usize) -> io::Result<Option<String>> {
    let mut buf = Vec::new();
    let mut read_any = false;
    loop {
        let available = match reader.fill_buf() {
            Ok(available) => available,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if available.is_empty() {
            break;
        }
        read_any = true;
        let (used, newline) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        let room = cap.saturating_sub(buf.len());
        buf.extend_from_slice(&available[..used.min(room)]);
        reader.consume(used);
        if newline {
            break;
        }
    }
    if !read_any {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    Ok(Some(sanitize::strip_control_chars(
        &String::from_utf8_lossy(&buf),
    )))
}

/// Collect `max_lines` lines starting at 1-indexed `start_line`, counting all
pub(crate) fn collect_range<I>(lines: I, start_line: usize, max_lines: usize) -> SandboxResult<LinesResult>
where
    I: Iterator<Item = SandboxResult<String>>,
{
    if start_line == 0 {
        return Err(SandboxError::invalid_argument("start line is 1-indexed"));
    }
    let end = start_line.saturating_add(max_lines);
    let mut collected = Vec::with_capacity(max_lines.min(1024));
    let mut total = 0;
    for line in lines {
        let line = line?;
        total += 1;
        if total >= start_line && total < end {
            collected.push(line);
        }
    }
    Ok(LinesResult {
        truncated: collected.len() < total,
        lines: collected,
        start_line,
        total_lines: total,
    })
}

/// Keep the last `n` lines in a ring buffer during one pass
pub(crate) fn collect_tail<I>(lines: I, n: usize) -> SandboxResult<LinesResult>
where
    I: Iterator<Item = SandboxResult<String>>,
{
    let mut ring: VecDeque<String> = VecDeque::with_capacity(n.min(1024));
    let mut total = 0;
    for line in lines {
        let line = line?;
        total += 1;
        if n == 0 {
            continue;
        }
        if ring.len() == n {
            ring.pop_front();
        }
        ring.push_back(line);
    }
    Ok(LinesResult {
        start_line: total - ring.len() + 1,
        truncated: total > ring.len(),
        lines: ring.into_iter().collect(),
        total_lines: total,
    })
}

/// Scan until `max_matches` lines match, then stop reading
pub(crate) fn scan_matches<I>(lines: I, regex: &Regex, max_matches: usize) -> SandboxResult<GrepResult>
where
    I: Iterator<Item = SandboxResult<String>>,
{
    let mut matches = Vec::new();
    let mut scanned = 0;
    if max_matches == 0 {
        return Ok(GrepResult {
            matches,
            truncated: true,
            lines_scanned: 0,
        });
    }
    for line in lines {
        let line = line?;
        scanned += 1;
        if regex.is_match(&line) {
            matches.push(LineMatch {
                line_number: scanned,
                line,
            });
            if matches.len() >= max_matches {
                return Ok(GrepResult {
                    matches,
                    truncated: true,
                    lines_scanned: scanned,
                });
            }
        }
    }
    Ok(GrepResult {
        matches,
        truncated: false,
        lines_scanned: scanned,
    })
}

impl BoundedFileAccess {
    fn lines(&self, path: &Path) -> SandboxResult<Lines<BufReader<std::fs::File>>> {
        let (_, file) = self.open_file(path)?;
        Ok(Lines::new(
            BufReader::with_capacity(READ_BUFFER_BYTES, file),
            self.cancel.clone(),
        ))
    }

    /// Up to `max_lines` lines starting at 1-indexed `start_line`
    pub fn read_range(
        &self,
        path: impl AsRef<Path>,
        start_line: usize,
        max_lines: usize,
    ) -> SandboxResult<LinesResult> {
        let path = path.as_ref();
        self.audited("read_range", path, || {
            collect_range(self.lines(path)?, start_line, max_lines)
        })
    }

    /// First `n` lines; the whole file is still scanned for the total
    pub fn head(&self, path: impl AsRef<Path>, n: usize) -> SandboxResult<LinesResult> {
        let path = path.as_ref();
        self.audited("head", path, || collect_range(self.lines(path)?, 1, n))
    }

    /// Last `n` lines in original order
    pub fn tail(&self, path: impl AsRef<Path>, n: usize) -> SandboxResult<LinesResult> {
        let path = path.as_ref();
        self.audited("tail", path, || collect_tail(self.lines(path)?, n))
    }

    /// Lines matching `pattern`, stopping at `max_matches`.
    ///
    /// An invalid pattern is matched literally.
    pub fn grep(
        &self,
        path: impl AsRef<Path>,
        pattern: &str,
        max_matches: usize,
    ) -> SandboxResult<GrepResult> {
        let path = path.as_ref();
        self.audited("grep", path, || {
            let regex = pattern::safe_compile(pattern);
            scan_matches(self.lines(path)?, &regex, max_matches)
        })
    }

    /// Line and byte count without retaining content
    pub fn count_lines(&self, path: impl AsRef<Path>) -> SandboxResult<LineCount> {
        let path = path.as_ref();
        self.audited("count_lines", path, || {
            let (_, mut file) = self.open_file(path)?;
            let mut buf = vec![0u8; READ_BUFFER_BYTES];
            let mut lines = 0;
            let mut bytes: u64 = 0;
            let mut last = b'\n';
            loop {
                self.check_cancel()?;
                let n = match file.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                };
                lines += buf[..n].iter().filter(|&&b| b == b'\n').count();
                bytes += n as u64;
                last = buf[n - 1];
            }
            // A final line without a newline still counts
            if last != b'\n' {
                lines += 1;
            }
            Ok(LineCount { lines, bytes })
        })
    }

    /// Whole file as text, refused above the configured size
    pub fn read_file(&self, path: impl AsRef<Path>) -> SandboxResult<String> {
        let path = path.as_ref();
        self.audited("read_file", path, || {
            let (resolved, file) = self.open_file(path)?;
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
            let mut bytes = Vec::with_capacity(size as usize);
            file.take(limit).read_to_end(&mut bytes)?;
            Ok(sanitize::strip_control_chars(&String::from_utf8_lossy(&bytes)))
        })
    }
}
