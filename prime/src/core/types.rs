//! Shared deterministic types for the engine core.
//!
//! These types define stable contracts between the loop, the store and the
//! API layer. They carry no I/O and serialize to the JSON rows persisted under
//! `state/tasks/`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::environment::EnvironmentContext;

/// First id handed out when the store is empty.
pub const FIRST_TASK_ID: u64 = 100_000_001;

/// Sequential task identifier, rendered as a decimal string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(TaskId)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    Starting,
    Prompting,
    Running { step: u32 },
    Waiting { seconds: u64 },
    AwaitingCode,
    Restarting,
    Cancelled,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Terminal statuses never transition again within this process.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Cancelled
                | TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Restarting
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Starting => "starting",
            TaskStatus::Prompting => "prompting",
            TaskStatus::Running { .. } => "running",
            TaskStatus::Waiting { .. } => "waiting",
            TaskStatus::AwaitingCode => "awaiting_code",
            TaskStatus::Restarting => "restarting",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Running { step } => write!(f, "running(step={step})"),
            TaskStatus::Waiting { seconds } => write!(f, "waiting({seconds})"),
            other => f.write_str(other.label()),
        }
    }
}

/// One goal-pursuit session. Persisted as one row per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub goal: String,
    pub status: TaskStatus,
    pub step: u32,
    /// Append-only markdown transcript.
    pub output: String,
    pub environment: Option<EnvironmentContext>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Elapsed seconds, set once the task reaches a terminal status.
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Task {
    pub fn new(id: TaskId, goal: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            goal: goal.into(),
            status: TaskStatus::Starting,
            step: 0,
            output: String::new(),
            environment: None,
            created: now,
            updated: now,
            duration: None,
            failure_reason: None,
        }
    }

    /// Append a transcript fragment on its own line.
    pub fn append_output(&mut self, text: &str) {
        if !self.output.is_empty() && !self.output.ends_with('\n') {
            self.output.push('\n');
        }
        self.output.push_str(text);
    }

    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.created).num_seconds().max(0) as u64
    }
}

/// Interpreted language for script directives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    Python,
}

impl ScriptLanguage {
    pub fn extension(self) -> &'static str {
        match self {
            ScriptLanguage::Python => "py",
        }
    }
}

/// How a block of code is run: directly through the shell or via an interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "language")]
pub enum CodeKind {
    Shell,
    Script(ScriptLanguage),
}

impl CodeKind {
    /// Marker used in transcripts and prompts (`SH` / `PY`).
    pub fn marker(self) -> &'static str {
        match self {
            CodeKind::Shell => "SH",
            CodeKind::Script(ScriptLanguage::Python) => "PY",
        }
    }
}

/// Outcome of running one Shell/Script directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// `None` when the process never produced an exit status (timeout, spawn error, cancel).
    pub exit_code: Option<i32>,
    /// stdout followed by stderr, not strictly interleaved.
    pub combined_output: String,
    pub timed_out: bool,
    /// The in-memory capture hit its ceiling and dropped bytes.
    pub truncated: bool,
}

impl ExecutionResult {
    /// Synthetic result for failures that never produced an exit status.
    pub fn synthetic(message: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            combined_output: message.into(),
            timed_out: false,
            truncated: false,
        }
    }

    pub fn timed_out(timeout_secs: u64) -> Self {
        Self {
            exit_code: None,
            combined_output: format!("ERROR: Command timed out after {timeout_secs} seconds"),
            timed_out: true,
            truncated: false,
        }
    }

    /// Text fed back to the model and appended to the transcript.
    pub fn render(&self) -> String {
        match self.exit_code {
            Some(code) if code != 0 => format!("[Exit code: {code}]\n{}", self.combined_output),
            _ => self.combined_output.clone(),
        }
    }
}

/// Phase of a step log artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogPhase {
    UserGoal,
    PromptToModel,
    ModelReply,
    ExecutionCommand,
    ExecutionOutput,
    FunctionResult,
    /// Entering or leaving `waiting(s)`.
    Wait,
    Error,
    Completion,
    Cancellation,
    SelfUpdate,
}

impl LogPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            LogPhase::UserGoal => "user-goal",
            LogPhase::PromptToModel => "prompt-to-model",
            LogPhase::ModelReply => "model-reply",
            LogPhase::ExecutionCommand => "execution-command",
            LogPhase::ExecutionOutput => "execution-output",
            LogPhase::FunctionResult => "function-result",
            LogPhase::Wait => "wait",
            LogPhase::Error => "error",
            LogPhase::Completion => "completion",
            LogPhase::Cancellation => "cancellation",
            LogPhase::SelfUpdate => "self-update",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            LogPhase::UserGoal => "User Goal",
            LogPhase::PromptToModel => "Prompt To Model",
            LogPhase::ModelReply => "Model Reply",
            LogPhase::ExecutionCommand => "Execution Command",
            LogPhase::ExecutionOutput => "Execution Output",
            LogPhase::FunctionResult => "Function Result",
            LogPhase::Wait => "Wait",
            LogPhase::Error => "Error",
            LogPhase::Completion => "Completion",
            LogPhase::Cancellation => "Cancellation",
            LogPhase::SelfUpdate => "Self Update",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_matches_wire_names() {
        assert_eq!(TaskStatus::Running { step: 3 }.to_string(), "running(step=3)");
        assert_eq!(TaskStatus::Waiting { seconds: 5 }.to_string(), "waiting(5)");
        assert_eq!(TaskStatus::AwaitingCode.to_string(), "awaiting_code");
    }

    #[test]
    fn status_serializes_with_state_tag() {
        let json = serde_json::to_string(&TaskStatus::Waiting { seconds: 5 }).expect("json");
        assert_eq!(json, r#"{"state":"waiting","seconds":5}"#);
        let json = serde_json::to_string(&TaskStatus::Completed).expect("json");
        assert_eq!(json, r#"{"state":"completed"}"#);
    }

    #[test]
    fn render_prefixes_non_zero_exit_code() {
        let failed = ExecutionResult {
            exit_code: Some(2),
            combined_output: "boom".to_string(),
            timed_out: false,
            truncated: false,
        };
        assert_eq!(failed.render(), "[Exit code: 2]\nboom");

        let ok = ExecutionResult {
            exit_code: Some(0),
            ..failed
        };
        assert_eq!(ok.render(), "boom");
    }

    #[test]
    fn append_output_separates_fragments_with_newline() {
        let mut task = Task::new(TaskId(FIRST_TASK_ID), "goal", Utc::now());
        task.append_output("first");
        task.append_output("second");
        assert_eq!(task.output, "first\nsecond");
    }

    #[test]
    fn task_id_parses_from_decimal() {
        let id: TaskId = " 100000002 ".parse().expect("parse");
        assert_eq!(id, TaskId(100_000_002));
        assert_eq!(id.to_string(), "100000002");
    }
}
