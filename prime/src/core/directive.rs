//! Classification of model replies into executable directives.
//!
//! Markers understood in a reply, highest priority first:
//!
//! - `#DONE` (anywhere, case-insensitive): the goal is complete.
//! - `#SELFUPDATE`: everything after the marker replaces the engine source.
//! - `#CALL name(args)`: zero or more built-in function calls.
//! - A code block tagged `#SH` or `#PY`, fenced or loose.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::types::{CodeKind, ScriptLanguage};

static SELF_UPDATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)#SELFUPDATE").expect("self-update regex"));
// A quoted argument may itself contain `)`.
static CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"#CALL\s+(\w+)\s*\(\s*('[^']*'|"[^"]*"|[^)]*?)\s*\)"#).expect("call regex")
});
static FENCED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:python|py|bash|sh|shell)?\s*#(SH|PY)[ \t]*\r?\n(.*?)```")
        .expect("fenced code regex")
});
static LOOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)#(SH|PY)[ \t]*\r?\n(.*)").expect("loose code regex"));
static TRAILING_TICKS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`+\s*$").expect("trailing ticks regex"));
static TICK_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^`.*$").expect("tick line regex"));

/// A built-in function the model may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FunctionSpec {
    pub name: &'static str,
    pub signature: &'static str,
    pub summary: &'static str,
}

/// Built-in functions, in the order they are advertised.
pub const BUILTIN_FUNCTIONS: &[FunctionSpec] = &[
    FunctionSpec {
        name: "read_file",
        signature: "read_file(path)",
        summary: "Read file content",
    },
    FunctionSpec {
        name: "list_directory",
        signature: "list_directory(path)",
        summary: "List directory contents (use quotes around path)",
    },
    FunctionSpec {
        name: "check_status",
        signature: "check_status(task_id)",
        summary: "Report the status of a task (defaults to this one)",
    },
    FunctionSpec {
        name: "wait",
        signature: "wait(seconds)",
        summary: "Wait before continuing",
    },
    FunctionSpec {
        name: "check_command",
        signature: "check_command(cmd)",
        summary: "Check if a command is available",
    },
    FunctionSpec {
        name: "get_environment",
        signature: "get_environment()",
        summary: "Get complete environment information",
    },
    FunctionSpec {
        name: "help",
        signature: "help()",
        summary: "List the available functions",
    },
];

/// One `#CALL name(args)` occurrence. Arguments are passed through unparsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub args: String,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: args.into(),
        }
    }

    /// Argument text with surrounding quotes and whitespace stripped.
    pub fn plain_arg(&self) -> &str {
        self.args.trim_matches(|c: char| c == '\'' || c == '"' || c.is_whitespace())
    }
}

/// The classified interpretation of one model reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Shell { code: String },
    Script { language: ScriptLanguage, code: String },
    FunctionCalls(Vec<FunctionCall>),
    SelfUpdate { new_source: String },
    Done,
    /// No recognizable directive in the reply.
    Unrecognized,
}

impl Directive {
    /// Code and its kind for Shell/Script directives.
    pub fn code(&self) -> Option<(CodeKind, &str)> {
        match self {
            Directive::Shell { code } => Some((CodeKind::Shell, code)),
            Directive::Script { language, code } => Some((CodeKind::Script(*language), code)),
            _ => None,
        }
    }
}

/// Return the single most specific directive found in `reply`.
pub fn extract(reply: &str) -> Directive {
    if reply.to_uppercase().contains("#DONE") {
        return Directive::Done;
    }

    if let Some(marker) = SELF_UPDATE_RE.find(reply) {
        let new_source = strip_fence(reply[marker.end()..].trim());
        return Directive::SelfUpdate { new_source };
    }

    let calls = extract_function_calls(reply);
    if !calls.is_empty() {
        return Directive::FunctionCalls(calls);
    }

    let captures = FENCED_RE
        .captures(reply)
        .or_else(|| LOOSE_RE.captures(reply));
    let Some(caps) = captures else {
        return Directive::Unrecognized;
    };
    let code = clean_code(&dedent(&caps[2]));
    match &caps[1] {
        "PY" => Directive::Script {
            language: ScriptLanguage::Python,
            code,
        },
        _ => Directive::Shell { code },
    }
}

/// All `#CALL name(args)` occurrences in order of appearance.
pub fn extract_function_calls(reply: &str) -> Vec<FunctionCall> {
    CALL_RE
        .captures_iter(reply)
        .map(|caps| FunctionCall::new(&caps[1], caps[2].trim()))
        .collect()
}

/// Strip stray fence and backtick artifacts. Cosmetic only; not a security boundary.
pub fn clean_code(code: &str) -> String {
    let without_trailing = TRAILING_TICKS_RE.replace(code, "");
    let without_tick_lines = TICK_LINE_RE.replace_all(&without_trailing, "");
    without_tick_lines.trim().to_string()
}

/// Remove whitespace common to the start of every non-blank line.
fn dedent(text: &str) -> String {
    let indent = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);
    text.lines()
        .map(|line| line.get(indent..).unwrap_or_else(|| line.trim_start()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Unwrap a source body that was sent inside a single fenced block.
fn strip_fence(body: &str) -> String {
    let Some(rest) = body.strip_prefix("```") else {
        return body.to_string();
    };
    let Some((_, inner)) = rest.split_once('\n') else {
        return body.to_string();
    };
    inner
        .trim_end()
        .strip_suffix("```")
        .unwrap_or(inner)
        .trim_end()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_wins_over_everything_else() {
        let reply = "#CALL wait(5)\n```bash #SH\nls\n```\nall good #done";
        assert_eq!(extract(reply), Directive::Done);
    }

    #[test]
    fn self_update_takes_text_after_marker() {
        let reply = "Updating myself.\n#SELFUPDATE\nprint('v2')\n";
        assert_eq!(
            extract(reply),
            Directive::SelfUpdate {
                new_source: "print('v2')".to_string()
            }
        );
    }

    #[test]
    fn self_update_unwraps_fenced_source() {
        let reply = "#SELFUPDATE\n```python\nprint('v2')\n```";
        assert_eq!(
            extract(reply),
            Directive::SelfUpdate {
                new_source: "print('v2')".to_string()
            }
        );
    }

    #[test]
    fn function_calls_are_collected_in_order() {
        let reply = "#CALL read_file('/etc/hosts')\nthen\n#CALL list_directory()";
        assert_eq!(
            extract(reply),
            Directive::FunctionCalls(vec![
                FunctionCall::new("read_file", "'/etc/hosts'"),
                FunctionCall::new("list_directory", ""),
            ])
        );
    }

    #[test]
    fn function_calls_beat_code_blocks() {
        let reply = "#CALL check_command(git)\n```bash #SH\nls\n```";
        assert!(matches!(extract(reply), Directive::FunctionCalls(calls) if calls.len() == 1));
    }

    #[test]
    fn fenced_python_block_becomes_script() {
        let reply = "Let me check.\n```python #PY\nprint(\"hello\")\n```\n";
        assert_eq!(
            extract(reply),
            Directive::Script {
                language: ScriptLanguage::Python,
                code: "print(\"hello\")".to_string()
            }
        );
    }

    #[test]
    fn marker_on_its_own_line_inside_fence() {
        let reply = "```bash\n#SH\necho hi\n```";
        assert_eq!(
            extract(reply),
            Directive::Shell {
                code: "echo hi".to_string()
            }
        );
    }

    #[test]
    fn loose_marker_without_fence_runs_to_end() {
        let reply = "#SH\n  uname -a\n  whoami\n";
        assert_eq!(
            extract(reply),
            Directive::Shell {
                code: "uname -a\nwhoami".to_string()
            }
        );
    }

    #[test]
    fn only_first_code_block_is_taken() {
        let reply = "```sh #SH\necho one\n```\n```sh #SH\necho two\n```";
        assert_eq!(
            extract(reply),
            Directive::Shell {
                code: "echo one".to_string()
            }
        );
    }

    #[test]
    fn plain_prose_is_unrecognized() {
        assert_eq!(extract("I think we should look around."), Directive::Unrecognized);
    }

    #[test]
    fn clean_code_strips_stray_backticks() {
        assert_eq!(clean_code("echo hi\n```"), "echo hi");
        assert_eq!(clean_code("```bash\nls -la`"), "ls -la");
    }

    #[test]
    fn quoted_call_argument_may_contain_parentheses() {
        let reply = "#CALL read_file('/tmp/a(1).txt')\n#CALL list_directory(\"/srv/(old)\")";
        assert_eq!(
            extract(reply),
            Directive::FunctionCalls(vec![
                FunctionCall::new("read_file", "'/tmp/a(1).txt'"),
                FunctionCall::new("list_directory", "\"/srv/(old)\""),
            ])
        );
    }

    #[test]
    fn plain_arg_strips_quotes() {
        let call = FunctionCall::new("read_file", " \"/tmp/x\" ");
        assert_eq!(call.plain_arg(), "/tmp/x");
    }
}
