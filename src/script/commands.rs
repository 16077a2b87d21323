//! Interpreter commands backed by [`CapabilityContext`]
//!
//! Structured results are returned as flat key/value lists so scripts can
//! use `dict get` on them.

use molt::types::*;
use molt::{check_args, molt_err, molt_ok, Interp};

use super::context::CapabilityContext;
use crate::errors::{SandboxError, SandboxResult};
use crate::files::{
    DirEntryInfo, GrepResult, LineCount, LineMatch, LinesResult, Listing, NodeKind, SearchResult,
    TreeNode, WriteResult,
};
use crate::policy::ShellScope;
use crate::process::CommandResult;

const DEFAULT_LINES: usize = 10;
const DEFAULT_MAX_MATCHES: usize = 100;
const DEFAULT_MAX_RESULTS: usize = 100;
const DEFAULT_MAX_PER_FILE: usize = 10;
const DEFAULT_TREE_DEPTH: usize = 3;
const DEFAULT_TREE_FILES: usize = 200;

/// Ambient commands that reach outside the capability object
pub(crate) const REMOVED_COMMANDS: &[&str] = &["exit", "source"];

/// Name the interpreter's own `proc` is moved to; the bound `proc` defines
/// procedures through it
const BUILTIN_PROC: &str = "::sandbox::proc";

/// Command every procedure body starts with
const CHECKPOINT: &str = "checkpoint";

/// Commands bound to the execution's context. `puts`, `while`, `for`,
/// `foreach`, `time` and `proc` replace the interpreter's own versions so
/// that output is captured and every loop iteration and procedure call
/// observes cancellation.
pub(crate) const CONTEXT_COMMANDS: &[(&str, CommandFunc)] = &[
    ("emit", cmd_emit as CommandFunc),
    ("puts", cmd_puts as CommandFunc),
    ("pwd", cmd_pwd as CommandFunc),
    ("checkpoint", cmd_checkpoint as CommandFunc),
    ("while", cmd_while as CommandFunc),
    ("for", cmd_for as CommandFunc),
    ("foreach", cmd_foreach as CommandFunc),
    ("time", cmd_time as CommandFunc),
    ("proc", cmd_proc as CommandFunc),
    ("read_range", cmd_read_range as CommandFunc),
    ("head", cmd_head as CommandFunc),
    ("tail", cmd_tail as CommandFunc),
    ("grep", cmd_grep as CommandFunc),
    ("count_lines", cmd_count_lines as CommandFunc),
    ("search", cmd_search as CommandFunc),
    ("tree", cmd_tree as CommandFunc),
    ("list_dir", cmd_list_dir as CommandFunc),
    ("read_file", cmd_read_file as CommandFunc),
    ("write_file", cmd_write_file as CommandFunc),
    ("replace_unique", cmd_replace_unique as CommandFunc),
    ("shell", cmd_shell as CommandFunc),
];

/// Strip ambient commands and bind the capability commands to `ctx`
pub(crate) fn install(interp: &mut Interp, ctx: ContextID) {
    for name in REMOVED_COMMANDS {
        interp.remove_command(name);
    }
    // The environment array is not part of the capability surface
    let _ = interp.eval("catch {unset env}");
    interp.rename_command("proc", BUILTIN_PROC);
    for (name, func) in CONTEXT_COMMANDS {
        interp.add_context_command(name, *func, ctx);
    }
}

/// Run one capability call, turning its failure into a script error
fn call<T>(
    interp: &mut Interp,
    ctx: ContextID,
    op: impl FnOnce(&CapabilityContext) -> SandboxResult<T>,
) -> Result<T, Exception> {
    let cx = interp.context::<CapabilityContext>(ctx);
    cx.check_cancel()?;
    let result = op(&*cx);
    result.map_err(|e| cx.fail(e))
}

fn count_arg(argv: &[Value], index: usize, default: usize) -> Result<usize, Exception> {
    let Some(value) = argv.get(index) else {
        return Ok(default);
    };
    let n = value.as_int()?;
    usize::try_from(n).map_err(|_| {
        Exception::molt_err(Value::from(format!(
            "expected non-negative integer but got \"{}\"",
            value.as_str()
        )))
    })
}

fn int(n: usize) -> Value {
    Value::from(n as MoltInt)
}

fn flag(b: bool) -> Value {
    Value::from(b as MoltInt)
}

fn dict(pairs: Vec<(&str, Value)>) -> Value {
    let mut list = Vec::with_capacity(pairs.len() * 2);
    for (key, value) in pairs {
        list.push(Value::from(key));
        list.push(value);
    }
    Value::from(list)
}

fn strings(items: &[String]) -> Value {
    Value::from(items.iter().map(|s| Value::from(s.as_str())).collect::<Vec<Value>>())
}

fn kind_name(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::File => "file",
        NodeKind::Directory => "directory",
        NodeKind::Symlink => "symlink",
        NodeKind::Truncated => "truncated",
    }
}

fn lines_value(result: &LinesResult) -> Value {
    dict(vec![
        ("lines", strings(&result.lines)),
        ("start_line", int(result.start_line)),
        ("total_lines", int(result.total_lines)),
        ("truncated", flag(result.truncated)),
    ])
}

fn matches_value(matches: &[LineMatch]) -> Value {
    Value::from(
        matches
            .iter()
            .map(|m| {
                dict(vec![
                    ("line_number", int(m.line_number)),
                    ("line", Value::from(m.line.as_str())),
                ])
            })
            .collect::<Vec<Value>>(),
    )
}

fn grep_value(result: &GrepResult) -> Value {
    dict(vec![
        ("matches", matches_value(&result.matches)),
        ("truncated", flag(result.truncated)),
        ("lines_scanned", int(result.lines_scanned)),
    ])
}

fn count_value(count: &LineCount) -> Value {
    dict(vec![
        ("lines", int(count.lines)),
        ("bytes", Value::from(count.bytes as MoltInt)),
    ])
}

fn search_value(result: &SearchResult) -> Value {
    let files = result
        .files
        .iter()
        .map(|f| {
            dict(vec![
                ("path", Value::from(f.path.as_str())),
                ("matches", matches_value(&f.matches)),
                ("truncated", flag(f.truncated)),
            ])
        })
        .collect::<Vec<Value>>();
    dict(vec![
        ("files", Value::from(files)),
        ("total_matches", int(result.total_matches)),
        ("files_scanned", int(result.files_scanned)),
        ("truncated", flag(result.truncated)),
    ])
}

fn tree_value(node: &TreeNode) -> Value {
    let mut pairs = vec![
        ("name", Value::from(node.name.as_str())),
        ("path", Value::from(node.path.as_str())),
        ("kind", Value::from(kind_name(node.kind))),
    ];
    if let Some(size) = node.size {
        pairs.push(("size", Value::from(size as MoltInt)));
    }
    pairs.push((
        "children",
        Value::from(node.children.iter().map(tree_value).collect::<Vec<Value>>()),
    ));
    dict(pairs)
}

fn entry_value(entry: &DirEntryInfo) -> Value {
    let mut pairs = vec![
        ("name", Value::from(entry.name.as_str())),
        ("kind", Value::from(kind_name(entry.kind))),
    ];
    if let Some(size) = entry.size {
        pairs.push(("size", Value::from(size as MoltInt)));
    }
    dict(pairs)
}

fn listing_value(listing: &Listing) -> Value {
    dict(vec![
        (
            "entries",
            Value::from(listing.entries.iter().map(entry_value).collect::<Vec<Value>>()),
        ),
        ("truncated", flag(listing.truncated)),
    ])
}

fn write_value(result: &WriteResult) -> Value {
    dict(vec![
        ("path", Value::from(result.path.as_str())),
        ("bytes_written", int(result.bytes_written)),
    ])
}

// Keyed `status`: the text `exit` is a denied construct
fn command_value(result: &CommandResult) -> Value {
    dict(vec![
        ("status", Value::from(result.exit_code as MoltInt)),
        ("stdout", Value::from(result.stdout.as_str())),
        ("stderr", Value::from(result.stderr.as_str())),
        ("duration_ms", Value::from(result.duration_ms as MoltInt)),
        ("success", flag(result.success)),
        ("truncated", flag(result.truncated)),
    ])
}

fn cmd_emit(interp: &mut Interp, ctx: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 2, 2, "line")?;
    let cx = interp.context::<CapabilityContext>(ctx);
    cx.check_cancel()?;
    cx.output().emit(argv[1].as_str());
    molt_ok!()
}

fn cmd_puts(interp: &mut Interp, ctx: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 2, 4, "?-nonewline? ?channelId? string")?;
    let nonewline = argv.len() > 2 && argv[1].as_str() == "-nonewline";
    if argv.len() == 4 && !nonewline {
        return molt_err!("bad argument \"{}\": should be \"nonewline\"", argv[1].as_str());
    }
    // Every channel goes to the capture buffer
    let text = argv[argv.len() - 1].as_str();

    let cx = interp.context::<CapabilityContext>(ctx);
    cx.check_cancel()?;
    if nonewline {
        cx.output().emit_partial(text);
    } else {
        cx.output().emit(text);
    }
    molt_ok!()
}

fn cmd_pwd(interp: &mut Interp, ctx: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 1, 1, "")?;
    let cx = interp.context::<CapabilityContext>(ctx);
    molt_ok!(cx.working_dir().display().to_string())
}

fn check_cancel(interp: &mut Interp, ctx: ContextID) -> Result<(), Exception> {
    interp.context::<CapabilityContext>(ctx).check_cancel()
}

/// `while` that stops once the execution is cancelled
fn cmd_while(interp: &mut Interp, ctx: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 3, 3, "test command")?;
    loop {
        check_cancel(interp, ctx)?;
        if !interp.expr_bool(&argv[1])? {
            break;
        }
        if let Flow::Stop = run_body(interp, &argv[2])? {
            break;
        }
    }
    molt_ok!()
}

/// Outcome of one loop body evaluation
enum Flow {
    Next,
    Stop,
}

fn run_body(interp: &mut Interp, body: &Value) -> Result<Flow, Exception> {
    match interp.eval_value(body) {
        Ok(_) => Ok(Flow::Next),
        Err(exception) => match exception.code() {
            ResultCode::Break => Ok(Flow::Stop),
            ResultCode::Continue => Ok(Flow::Next),
            _ => Err(exception),
        },
    }
}

fn cmd_checkpoint(interp: &mut Interp, ctx: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 1, 1, "")?;
    check_cancel(interp, ctx)?;
    molt_ok!()
}

/// `foreach` that stops once the execution is cancelled
fn cmd_foreach(interp: &mut Interp, ctx: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 4, 4, "varList list body")?;
    let vars = argv[1].as_list()?;
    let items = argv[2].as_list()?;
    if vars.is_empty() {
        return molt_err!("foreach varlist is empty");
    }

    let mut next = 0;
    while next < items.len() {
        check_cancel(interp, ctx)?;
        for var in vars.iter() {
            let value = items.get(next).cloned().unwrap_or_else(Value::empty);
            interp.set_var(var, value)?;
            next += 1;
        }
        if let Flow::Stop = run_body(interp, &argv[3])? {
            break;
        }
    }
    molt_ok!()
}

/// `time` that stops once the execution is cancelled
fn cmd_time(interp: &mut Interp, ctx: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 2, 3, "command ?count?")?;
    let count = match argv.get(2) {
        Some(value) => value.as_int()?,
        None => 1,
    };

    let start = std::time::Instant::now();
    for _ in 0..count {
        check_cancel(interp, ctx)?;
        interp.eval_value(&argv[1])?;
    }
    let per_iteration = if count > 0 {
        start.elapsed().as_micros() as MoltInt / count
    } else {
        0
    };
    molt_ok!("{} microseconds per iteration", per_iteration)
}

/// `proc` whose bodies check for cancellation on every call
fn cmd_proc(interp: &mut Interp, ctx: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 4, 4, "name args body")?;
    check_cancel(interp, ctx)?;
    let body = format!("{}\n{}", CHECKPOINT, argv[3].as_str());
    let definition = Value::from(vec![
        Value::from(BUILTIN_PROC),
        argv[1].clone(),
        argv[2].clone(),
        Value::from(body),
    ]);
    interp.eval_value(&definition)
}

/// `for` that stops once the execution is cancelled
fn cmd_for(interp: &mut Interp, ctx: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 5, 5, "start test next command")?;
    interp.eval_value(&argv[1])?;
    loop {
        check_cancel(interp, ctx)?;
        if !interp.expr_bool(&argv[2])? {
            break;
        }
        if let Flow::Stop = run_body(interp, &argv[4])? {
            break;
        }
        interp.eval_value(&argv[3])?;
    }
    molt_ok!()
}

fn cmd_read_range(interp: &mut Interp, ctx: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 4, 4, "path start_line max_lines")?;
    let start = count_arg(argv, 2, 1)?;
    let max = count_arg(argv, 3, DEFAULT_LINES)?;
    let path = argv[1].as_str();
    let result = call(interp, ctx, |cx| cx.files().read_range(path, start, max))?;
    Ok(lines_value(&result))
}

fn cmd_head(interp: &mut Interp, ctx: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 2, 3, "path ?count?")?;
    let n = count_arg(argv, 2, DEFAULT_LINES)?;
    let path = argv[1].as_str();
    let result = call(interp, ctx, |cx| cx.files().head(path, n))?;
    Ok(lines_value(&result))
}

fn cmd_tail(interp: &mut Interp, ctx: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 2, 3, "path ?count?")?;
    let n = count_arg(argv, 2, DEFAULT_LINES)?;
    let path = argv[1].as_str();
    let result = call(interp, ctx, |cx| cx.files().tail(path, n))?;
    Ok(lines_value(&result))
}

fn cmd_grep(interp: &mut Interp, ctx: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 3, 4, "path pattern ?max_matches?")?;
    let max = count_arg(argv, 3, DEFAULT_MAX_MATCHES)?;
    let (path, pattern) = (argv[1].as_str(), argv[2].as_str());
    let result = call(interp, ctx, |cx| cx.files().grep(path, pattern, max))?;
    Ok(grep_value(&result))
}

fn cmd_count_lines(interp: &mut Interp, ctx: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 2, 2, "path")?;
    let path = argv[1].as_str();
    let result = call(interp, ctx, |cx| cx.files().count_lines(path))?;
    Ok(count_value(&result))
}

fn cmd_search(interp: &mut Interp, ctx: ContextID, argv: &[Value]) -> MoltResult {
    check_args(
        1,
        argv,
        3,
        6,
        "dir content_pattern ?file_pattern? ?max_results? ?max_per_file?",
    )?;
    let file_pattern = argv
        .get(3)
        .map(|v| v.as_str())
        .filter(|pattern| !pattern.is_empty());
    let max_results = count_arg(argv, 4, DEFAULT_MAX_RESULTS)?;
    let max_per_file = count_arg(argv, 5, DEFAULT_MAX_PER_FILE)?;
    let (dir, content) = (argv[1].as_str(), argv[2].as_str());
    let result = call(interp, ctx, |cx| {
        cx.files()
            .search_tree(dir, content, file_pattern, max_results, max_per_file)
    })?;
    Ok(search_value(&result))
}

fn cmd_tree(interp: &mut Interp, ctx: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 2, 5, "dir ?max_depth? ?max_files? ?exclude_patterns?")?;
    let max_depth = count_arg(argv, 2, DEFAULT_TREE_DEPTH)?;
    let max_files = count_arg(argv, 3, DEFAULT_TREE_FILES)?;
    let excludes: Vec<String> = match argv.get(4) {
        Some(list) => list.as_list()?.iter().map(|v| v.as_str().to_string()).collect(),
        None => Vec::new(),
    };
    let dir = argv[1].as_str();
    let result = call(interp, ctx, |cx| cx.files().tree(dir, &excludes, max_depth, max_files))?;
    Ok(tree_value(&result))
}

fn cmd_list_dir(interp: &mut Interp, ctx: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 1, 2, "?dir?")?;
    let dir = argv.get(1).map(|v| v.as_str()).unwrap_or(".");
    let result = call(interp, ctx, |cx| cx.files().list_dir(dir))?;
    Ok(listing_value(&result))
}

fn cmd_read_file(interp: &mut Interp, ctx: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 2, 2, "path")?;
    let path = argv[1].as_str();
    let content = call(interp, ctx, |cx| cx.files().read_file(path))?;
    molt_ok!(content)
}

fn cmd_write_file(interp: &mut Interp, ctx: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 3, 3, "path content")?;
    let (path, content) = (argv[1].as_str(), argv[2].as_str());
    let result = call(interp, ctx, |cx| cx.files().write_file(path, content))?;
    Ok(write_value(&result))
}

fn cmd_replace_unique(interp: &mut Interp, ctx: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 4, 4, "path old_text new_text")?;
    let (path, old, new) = (argv[1].as_str(), argv[2].as_str(), argv[3].as_str());
    let result = call(interp, ctx, |cx| cx.files().replace_unique(path, old, new))?;
    Ok(write_value(&result))
}

fn cmd_shell(interp: &mut Interp, ctx: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 3, 3, "scope command")?;
    let (scope, command) = (argv[1].as_str(), argv[2].as_str());
    let result = call(interp, ctx, |cx| {
        let scope: ShellScope = scope.parse().map_err(SandboxError::InvalidArgument)?;
        cx.run_shell(scope, command)
    })?;
    Ok(command_value(&result))
}
