//! The capability object bound into a script's interpreter

use molt::types::{Exception, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::errors::{SandboxError, SandboxResult};
use crate::files::BoundedFileAccess;
use crate::policy::{CommandGate, ShellScope};
use crate::process::{CommandResult, CommandSpec};
use crate::sanitize;

/// Line appended once when the output cap is hit
pub const OUTPUT_TRUNCATED_MARKER: &str = "[output truncated]";

#[derive(Debug, Default)]
struct OutputBuffer {
    lines: Vec<String>,
    partial: String,
    bytes: usize,
    truncated: bool,
}

/// Ordered, capped capture of everything a script emits
///
/// Clones share the buffer, so the caller keeps a handle while the worker
/// writes; output emitted before a timeout is still returned.
#[derive(Debug, Clone)]
pub struct OutputSink {
    buffer: Arc<Mutex<OutputBuffer>>,
    max_lines: usize,
    max_bytes: usize,
}

impl OutputSink {
    pub fn new(max_lines: usize, max_bytes: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(OutputBuffer::default())),
            max_lines,
            max_bytes,
        }
    }

    /// Append text; embedded newlines start new lines
    pub fn emit(&self, text: &str) {
        self.write(text, true);
    }

    /// Append text to the current line without ending it
    pub fn emit_partial(&self, text: &str) {
        self.write(text, false);
    }

    fn write(&self, text: &str, end_line: bool) {
        let mut buffer = match self.buffer.lock() {
            Ok(buffer) => buffer,
            Err(poisoned) => poisoned.into_inner(),
        };
        if buffer.truncated {
            return;
        }

        let mut pieces = text.split('\n').peekable();
        while let Some(piece) = pieces.next() {
            buffer.partial.push_str(piece);
            let last = pieces.peek().is_none();
            if !last || end_line {
                let line = std::mem::take(&mut buffer.partial);
                if !self.push_line(&mut buffer, line) {
                    return;
                }
            }
        }
    }

    fn push_line(&self, buffer: &mut OutputBuffer, line: String) -> bool {
        let line = sanitize::strip_control_chars(&line);
        if buffer.lines.len() >= self.max_lines || buffer.bytes + line.len() > self.max_bytes {
            buffer.truncated = true;
            buffer.partial.clear();
            buffer.lines.push(OUTPUT_TRUNCATED_MARKER.to_string());
            return false;
        }
        buffer.bytes += line.len();
        buffer.lines.push(line);
        true
    }

    /// Drain captured lines, flushing any unfinished line
    pub fn take(&self) -> (Vec<String>, bool) {
        let mut buffer = match self.buffer.lock() {
            Ok(buffer) => buffer,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !buffer.partial.is_empty() && !buffer.truncated {
            let line = std::mem::take(&mut buffer.partial);
            self.push_line(&mut buffer, line);
        }
        let truncated = buffer.truncated;
        (std::mem::take(&mut buffer.lines), truncated)
    }
}

/// Everything a running script can reach
pub struct CapabilityContext {
    working_dir: PathBuf,
    files: BoundedFileAccess,
    gate: CommandGate,
    output: OutputSink,
    cancel: CancelToken,
    command_timeout: Duration,
    max_output_bytes: usize,
    last_failure: Option<(String, SandboxError)>,
}

impl CapabilityContext {
    /// `files` must already be scoped to `working_dir` and `cancel`
    pub fn new(
        working_dir: PathBuf,
        files: BoundedFileAccess,
        gate: CommandGate,
        output: OutputSink,
        cancel: CancelToken,
        command_timeout: Duration,
        max_output_bytes: usize,
    ) -> Self {
        Self {
            working_dir,
            files,
            gate,
            output,
            cancel,
            command_timeout,
            max_output_bytes,
            last_failure: None,
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn files(&self) -> &BoundedFileAccess {
        &self.files
    }

    pub fn output(&self) -> &OutputSink {
        &self.output
    }

    pub fn cancel(&self) -> &CancelToken {
        &self.cancel
    }

    /// Run a shell command through the command gate.
    ///
    /// The process deadline is the command timeout or whatever is left of the
    /// execution budget, whichever is shorter.
    pub fn run_shell(&self, scope: ShellScope, command: &str) -> SandboxResult<CommandResult> {
        let limit = match self.cancel.remaining() {
            Some(remaining) => remaining.min(self.command_timeout),
            None => self.command_timeout,
        };
        let spec = CommandSpec {
            scope,
            command: command.to_string(),
            working_dir: self.working_dir.clone(),
            max_output_bytes: self.max_output_bytes,
        };
        self.gate.run_blocking(&spec, limit, &self.cancel)
    }

    /// Script-level error for a failed capability, remembered so the runner
    /// can report its category if the script does not catch it
    pub fn fail(&mut self, error: SandboxError) -> Exception {
        let message = sanitize::summarize(&error.to_string(), sanitize::MAX_MESSAGE_CHARS);
        debug!("Capability call failed: {}", message);
        self.last_failure = Some((message.clone(), error));
        Exception::molt_err(Value::from(message))
    }

    /// Error out of the script once the deadline passes
    pub fn check_cancel(&mut self) -> Result<(), Exception> {
        match self.cancel.check() {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    pub(crate) fn take_failure(&mut self) -> Option<(String, SandboxError)> {
        self.last_failure.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_lines_and_partials() {
        let sink = OutputSink::new(100, 1024);
        sink.emit("one");
        sink.emit_partial("tw");
        sink.emit_partial("o");
        sink.emit("\nthree\u{1b}");
        sink.emit_partial("tail");

        let (lines, truncated) = sink.take();
        assert_eq!(lines, vec!["one", "two", "three", "tail"]);
        assert!(!truncated);
    }

    #[test]
    fn test_output_line_cap() {
        let sink = OutputSink::new(3, 1024);
        for i in 0..10 {
            sink.emit(&i.to_string());
        }
        let (lines, truncated) = sink.take();
        assert_eq!(lines, vec!["0", "1", "2", OUTPUT_TRUNCATED_MARKER]);
        assert!(truncated);
    }

    #[test]
    fn test_output_byte_cap() {
        let sink = OutputSink::new(100, 10);
        sink.emit("12345");
        sink.emit("67890");
        sink.emit("x");
        let (lines, truncated) = sink.take();
        assert_eq!(lines, vec!["12345", "67890", OUTPUT_TRUNCATED_MARKER]);
        assert!(truncated);
    }
}
