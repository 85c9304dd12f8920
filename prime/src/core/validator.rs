//! Pattern-based safety gate for directives.
//!
//! This is a deny-list, not a sandbox: it rejects known-destructive shapes and
//! lets everything else through.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::core::directive::FunctionCall;
use crate::core::types::CodeKind;

/// Outcome of validating one directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub ok: bool,
    pub reason: String,
}

impl Verdict {
    fn pass() -> Self {
        Self {
            ok: true,
            reason: "Code passed validation".to_string(),
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: reason.into(),
        }
    }
}

struct Rule {
    pattern: Regex,
    reason: &'static str,
}

fn rules(specs: &[(&str, &'static str)]) -> Vec<Rule> {
    specs
        .iter()
        .map(|(pattern, reason)| Rule {
            pattern: Regex::new(pattern).expect("deny-list pattern"),
            reason,
        })
        .collect()
}

static COMMON_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    rules(&[
        (
            r#"\brm\s+(-{1,2}[a-zA-Z-]+\s+)*-{1,2}[a-zA-Z-]*[rR][a-zA-Z-]*\s+(-{1,2}[a-zA-Z-]+\s+)*(--\s+)?/(\*|$|[\s;&|'")])"#,
            "Dangerous recursive deletion of root directory",
        ),
        (
            r"--no-preserve-root",
            "Dangerous recursive deletion of root directory",
        ),
        (r"\bmkfs(\.\w+)?\b", "Filesystem formatting command detected"),
        (
            r"\bdd\s+[^\n]*of=/dev/(sd|hd|nvme|xvd|vd|mmcblk)",
            "Disk overwrite operation detected",
        ),
        (
            r">\s*/dev/(sd|hd|nvme|xvd|vd|mmcblk)[a-z0-9]*",
            "Disk overwrite operation detected",
        ),
        (r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:", "Fork bomb detected"),
        (
            r">>?\s*/etc/(passwd|shadow|gshadow|sudoers)\b",
            "Modifying system credential file",
        ),
        (
            r"\b(tee|cp|mv)\b[^\n]*\s/etc/(passwd|shadow|gshadow|sudoers)\b",
            "Modifying system credential file",
        ),
        (
            r"\bchmod\s+(-[a-zA-Z]+\s+)*0?777\s+/(\s|$|bin|boot|etc|lib|opt|root|sbin|sys|usr|var)",
            "Setting dangerous permissions on system directories",
        ),
        (
            r"\b(curl|wget)\b[^\n|]*\|\s*(sudo\s+)?(ba|z|da|k)?sh\b",
            "Piping web content directly to a shell",
        ),
        (
            r"\b(curl|wget)\b[^\n|]*\|\s*(sudo\s+)?python[0-9.]*\b",
            "Piping web content directly to an interpreter",
        ),
    ])
});

static SCRIPT_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    rules(&[
        (
            r#"__import__\(\s*['"]os['"]\s*\)[^\n]*system"#,
            "Indirect os.system call",
        ),
        (r"\bexec\s*\([^\n]*input", "Executing user input"),
        (r"\beval\s*\([^\n]*input", "Evaluating user input"),
    ])
});

static SUBPROCESS_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"import\s+subprocess|from\s+subprocess\s+import").expect("subprocess regex")
});
static DESTRUCTIVE_UTIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(shred|fdisk|sfdisk)\b").expect("destructive util regex"));

/// Paths `read_file` / `list_directory` refuse to touch when the function
/// guard is enabled.
static SENSITIVE_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(/etc/(shadow|gshadow|sudoers)(\.d)?|.*/\.ssh/id_[^/]*|/root/\.ssh(/.*)?)$")
        .expect("sensitive path regex")
});

/// Validate Shell/Script code before execution.
pub fn validate(code: &str, kind: CodeKind) -> Verdict {
    if code.trim().is_empty() {
        return Verdict::reject("Empty code block");
    }

    if let Some(rule) = COMMON_RULES.iter().find(|rule| rule.pattern.is_match(code)) {
        return Verdict::reject(rule.reason);
    }

    match kind {
        CodeKind::Script(_) => {
            if let Some(rule) = SCRIPT_RULES.iter().find(|rule| rule.pattern.is_match(code)) {
                return Verdict::reject(rule.reason);
            }
            if SUBPROCESS_IMPORT_RE.is_match(code) {
                warn!("script imports subprocess, which can execute shell commands");
            }
        }
        CodeKind::Shell => {
            if let Some(util) = DESTRUCTIVE_UTIL_RE.find(code) {
                warn!(utility = util.as_str(), "shell code uses a destructive utility");
            }
        }
    }

    Verdict::pass()
}

/// Guard for path-taking built-in functions.
pub fn validate_function_call(call: &FunctionCall) -> Verdict {
    match call.name.as_str() {
        "read_file" | "list_directory" => {
            let raw = call.plain_arg();
            let path = raw.trim_end_matches('/');
            let normalized = lexical_absolute(raw);
            if SENSITIVE_PATH_RE.is_match(path) || SENSITIVE_PATH_RE.is_match(&normalized) {
                return Verdict::reject(format!("Access to sensitive path denied: {path}"));
            }
            Verdict::pass()
        }
        _ => Verdict::pass(),
    }
}

/// `path` made absolute against the working directory with `.`, `..` and
/// repeated separators folded away. Symlinks are not resolved.
fn lexical_absolute(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    let Ok(absolute) = std::path::absolute(Path::new(path)) else {
        return path.to_string();
    };
    let mut clean = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                clean.pop();
            }
            other => clean.push(other.as_os_str()),
        }
    }
    clean.to_string_lossy().into_owned()
}
