//! Built-in functions invoked with `#CALL name(args)`.
//!
//! Functions are read-only with respect to the host, except `wait`, which
//! only asks the task loop to pause. Results are free text fed back to the
//! model; failures are reported in that text rather than raised.

use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::core::directive::{BUILTIN_FUNCTIONS, FunctionCall};
use crate::core::truncate::truncate_middle;
use crate::core::types::TaskId;
use crate::core::validator::validate_function_call;
use crate::io::config::EngineConfig;
use crate::io::probe::{EnvironmentProbe, find_on_path};
use crate::registry::TaskRegistry;

/// One executed call and its result text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub call: FunctionCall,
    pub result: String,
}

/// Everything one reply's calls produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub records: Vec<CallRecord>,
    /// Largest wait requested in the reply, already clamped. Zero means no wait.
    pub wait_seconds: u64,
}

impl DispatchOutcome {
    pub fn results(&self) -> Vec<String> {
        self.records.iter().map(|r| r.result.clone()).collect()
    }
}

pub struct FunctionDispatcher {
    registry: Arc<TaskRegistry>,
    probe: Arc<dyn EnvironmentProbe>,
    read_file_chars: usize,
    max_wait_secs: u64,
    guard_paths: bool,
}

impl FunctionDispatcher {
    pub fn new(
        registry: Arc<TaskRegistry>,
        probe: Arc<dyn EnvironmentProbe>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            probe,
            read_file_chars: config.limits.read_file_chars,
            max_wait_secs: config.limits.max_wait_secs,
            guard_paths: config.guard_function_paths,
        }
    }

    /// Run every call in order. All calls are processed even when one of them
    /// is a `wait`.
    pub fn execute(&self, task_id: TaskId, calls: &[FunctionCall]) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        for call in calls {
            let (result, wait) = self.execute_one(task_id, call);
            info!(task_id = %task_id, function = %call.name, args = %call.args, "function executed");
            outcome.wait_seconds = outcome.wait_seconds.max(wait);
            outcome.records.push(CallRecord {
                call: call.clone(),
                result,
            });
        }
        outcome
    }

    fn execute_one(&self, task_id: TaskId, call: &FunctionCall) -> (String, u64) {
        if self.guard_paths {
            let verdict = validate_function_call(call);
            if !verdict.ok {
                return (format!("Error: {}", verdict.reason), 0);
            }
        }
        match call.name.as_str() {
            "read_file" => (self.read_file(call.plain_arg()), 0),
            "list_directory" => (list_directory(call.plain_arg()), 0),
            "check_status" => (self.check_status(task_id, call.plain_arg()), 0),
            "wait" => self.wait(call),
            "check_command" => (check_command(call.plain_arg()), 0),
            "get_environment" => (self.probe.capture().dump(), 0),
            "help" => (help(), 0),
            other => (format!("Unknown function: {other}"), 0),
        }
    }

    fn read_file(&self, path: &str) -> String {
        if path.is_empty() {
            return "Error: No path specified for read_file".to_string();
        }
        let shown = match read_bounded(Path::new(path), self.read_file_chars) {
            Ok(Some(text)) => text,
            Ok(None) => return format!("Error: Not a regular file: {path}"),
            Err(err) => return read_error(path, &err),
        };
        format!("#FILE_CONTENT from {path}\n{shown}\n#END_FILE_CONTENT")
    }

    fn check_status(&self, current: TaskId, arg: &str) -> String {
        let target = if arg.is_empty() {
            current.to_string()
        } else {
            arg.to_string()
        };
        let Ok(id) = target.parse::<TaskId>() else {
            return format!("Task {target} not found");
        };
        match self.registry.get(id) {
            Ok(Some(task)) => format!("Task {id} status: {}", task.status),
            Ok(None) => format!("Task {id} not found"),
            Err(err) => format!("Error checking task {id}: {err:#}"),
        }
    }

    fn wait(&self, call: &FunctionCall) -> (String, u64) {
        match call.plain_arg().parse::<i64>() {
            Ok(requested) if requested > 0 => {
                let seconds = (requested as u64).min(self.max_wait_secs);
                (format!("Waiting for {seconds} seconds..."), seconds)
            }
            _ => (
                format!(
                    "Invalid wait duration: {}. Please provide a number of seconds.",
                    call.args
                ),
                0,
            ),
        }
    }
}

/// Read at most `chars * 4` bytes of a regular file, elided in the middle to
/// `chars` characters. `None` for devices, pipes and directories.
fn read_bounded(path: &Path, chars: usize) -> io::Result<Option<String>> {
    let mut file = File::open(path)?;
    let meta = file.metadata()?;
    if !meta.is_file() {
        return Ok(None);
    }
    let budget = chars.saturating_mul(4) as u64;
    if meta.len() <= budget {
        let mut bytes = Vec::new();
        file.take(budget).read_to_end(&mut bytes)?;
        let text = String::from_utf8_lossy(&bytes);
        return Ok(Some(truncate_middle(&text, chars, "content").text));
    }

    let half = chars / 2;
    let mut head = Vec::new();
    (&mut file).take(budget / 2).read_to_end(&mut head)?;
    let mut tail = Vec::new();
    file.seek(SeekFrom::End(-((budget / 2) as i64)))?;
    file.take(budget / 2).read_to_end(&mut tail)?;
    let head: String = String::from_utf8_lossy(&head).chars().take(half).collect();
    let tail = String::from_utf8_lossy(&tail);
    let skip = tail.chars().count().saturating_sub(half);
    let tail: String = tail.chars().skip(skip).collect();
    Ok(Some(format!(
        "{head}\n...[content truncated, {} bytes total]...\n{tail}",
        meta.len()
    )))
}

fn read_error(path: &str, err: &std::io::Error) -> String {
    match err.kind() {
        ErrorKind::NotFound => format!("Error: File not found: {path}"),
        ErrorKind::PermissionDenied => format!("Error: Permission denied when reading {path}"),
        _ => format!("Error reading file {path}: {err}"),
    }
}

fn list_directory(arg: &str) -> String {
    let path = if arg.is_empty() { "." } else { arg };
    let read = match fs::read_dir(Path::new(path)) {
        Ok(read) => read,
        Err(err) => return format!("Error listing directory {path}: {err}"),
    };
    let mut lines: Vec<(String, String)> = read
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let line = match entry.metadata() {
                Ok(meta) if meta.is_dir() => format!("d {name}/"),
                Ok(meta) if meta.file_type().is_symlink() => format!("l {name}"),
                Ok(meta) => format!("f {name} ({} bytes)", meta.len()),
                Err(_) => format!("? {name}"),
            };
            (name, line)
        })
        .collect();
    lines.sort_by(|a, b| a.0.cmp(&b.0));
    let mut buf = format!("Directory listing for {path}:");
    if lines.is_empty() {
        buf.push_str("\n(empty)");
    }
    for (_, line) in lines {
        buf.push('\n');
        buf.push_str(&line);
    }
    buf
}

fn check_command(name: &str) -> String {
    if name.is_empty() {
        return "No command specified for check_command".to_string();
    }
    let state = if find_on_path(name).is_some() {
        "available"
    } else {
        "not available"
    };
    format!("Command '{name}' is {state}")
}

fn help() -> String {
    let mut buf = String::from("Available functions:");
    for function in BUILTIN_FUNCTIONS {
        buf.push_str(&format!("\n- #CALL {} - {}", function.signature, function.summary));
    }
    buf
}
