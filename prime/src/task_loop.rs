//! The per-task state machine.
//!
//! `starting -> prompting -> running(step=k)* -> {completed | failed | restarting | cancelled}`,
//! with `waiting(s)` entered only through the `wait` function and
//! `awaiting_code` after a reply with no recognizable directive.
//!
//! Within a task everything is sequential: directive N+1 is never requested
//! before directive N's result is recorded. Every transition is persisted
//! through the registry, written to the step log and published on the bus.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::bus::NotificationBus;
use crate::core::conversation::{ChatMessage, WindowLimits, window};
use crate::core::directive::{Directive, FunctionCall, extract};
use crate::core::truncate::truncate_middle;
use crate::core::types::{CodeKind, LogPhase, ScriptLanguage, Task, TaskId, TaskStatus};
use crate::core::validator::validate;
use crate::error::EngineError;
use crate::functions::FunctionDispatcher;
use crate::io::config::EngineConfig;
use crate::io::executor::{ExecRequest, Executor};
use crate::io::model::{ModelAdapter, ModelRequest};
use crate::io::probe::EnvironmentProbe;
use crate::io::process::CancelToken;
use crate::io::prompt::PromptEngine;
use crate::io::self_update::SelfUpdater;
use crate::io::step_log::StepLog;
use crate::io::store::HistoryEntry;
use crate::registry::TaskRegistry;

/// Everything a task worker needs. Shared by all workers of one engine.
pub struct Services {
    pub config: EngineConfig,
    pub model: Arc<dyn ModelAdapter>,
    pub executor: Arc<dyn Executor>,
    pub probe: Arc<dyn EnvironmentProbe>,
    pub registry: Arc<TaskRegistry>,
    pub bus: NotificationBus,
    pub step_log: StepLog,
    pub prompts: PromptEngine,
    pub dispatcher: FunctionDispatcher,
    pub self_updater: SelfUpdater,
    pub restart: watch::Sender<bool>,
}

/// Reason why a task loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    Completed,
    Failed { reason: String },
    Cancelled,
    /// The engine source was replaced; the process should restart.
    Restarting,
}

/// Summary of one task run.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    pub task: Task,
    pub stop: LoopStop,
    /// Model turns taken.
    pub turns: u32,
}

enum Next {
    Prompt(String),
    Stop(LoopStop),
}

/// Drive one task to a terminal status. Never panics or errors: plumbing
/// failures end the task as `failed`.
#[instrument(skip_all, fields(task_id = %task.id))]
pub fn run_task(services: &Services, task: Task, cancel: CancelToken) -> LoopOutcome {
    let mut run = TaskRun {
        s: services,
        id: task.id,
        goal: task.goal.clone(),
        cancel,
        history: Vec::new(),
        unrecognized: 0,
        turns: 0,
    };
    let stop = match run.drive() {
        Ok(stop) => stop,
        Err(err) => {
            let reason = format!("{err:#}");
            error!(err = %reason, "task aborted");
            run.fail(&reason)
        }
    };
    info!(?stop, turns = run.turns, "task loop finished");
    let task = services
        .registry
        .get(run.id)
        .ok()
        .flatten()
        .unwrap_or(task);
    LoopOutcome {
        task,
        stop,
        turns: run.turns,
    }
}

struct TaskRun<'a> {
    s: &'a Services,
    id: TaskId,
    goal: String,
    cancel: CancelToken,
    history: Vec<ChatMessage>,
    unrecognized: u32,
    turns: u32,
}

impl TaskRun<'_> {
    fn drive(&mut self) -> Result<LoopStop> {
        self.log(LogPhase::UserGoal, &self.goal)?;
        let env = self.s.probe.capture();
        let mut prompt = self.s.prompts.initial(&self.goal, &env)?;
        self.update(|task| {
            task.environment = Some(env);
            task.append_output(&format!("Goal: {}", task.goal));
        })?;

        loop {
            if self.cancel_requested()? {
                return self.cancelled();
            }
            if self.turns >= self.s.config.limits.max_steps {
                let reason = format!(
                    "Step limit reached after {} model turns",
                    self.s.config.limits.max_steps
                );
                return Ok(self.fail(&reason));
            }
            self.turns += 1;

            let reply = match self.ask(&prompt) {
                Ok(reply) => reply,
                Err(err) => {
                    let reason = EngineError::ModelUnavailable(format!("{err:#}")).to_string();
                    return Ok(self.fail(&reason));
                }
            };
            if self.cancel_requested()? {
                return self.cancelled();
            }

            let next = match extract(&reply) {
                Directive::Done => self.on_done()?,
                Directive::SelfUpdate { new_source } => self.on_self_update(&new_source)?,
                Directive::FunctionCalls(calls) => self.on_function_calls(&calls)?,
                Directive::Shell { code } => self.on_code(CodeKind::Shell, &code)?,
                Directive::Script { language, code } => {
                    self.on_code(CodeKind::Script(language), &code)?
                }
                Directive::Unrecognized => self.on_unrecognized()?,
            };
            match next {
                Next::Prompt(text) => prompt = text,
                Next::Stop(stop) => return Ok(stop),
            }
        }
    }

    /// Send `prompt` with the windowed history and record both sides.
    fn ask(&mut self, prompt: &str) -> Result<String> {
        self.update(|task| {
            if task.status == TaskStatus::Starting {
                task.status = TaskStatus::Prompting;
            }
        })?;
        self.log(LogPhase::PromptToModel, prompt)?;

        let limits = &self.s.config.limits;
        let request = ModelRequest {
            system: self.s.prompts.system()?,
            history: window(
                &self.history,
                WindowLimits {
                    max_messages: limits.history_messages,
                    char_budget: limits.history_char_budget,
                    per_message_chars: limits.history_output_chars,
                },
            ),
            prompt: prompt.to_string(),
        };
        let reply = self.s.model.complete(&request)?;
        self.history.push(ChatMessage::user(prompt));
        self.history.push(ChatMessage::assistant(reply.clone()));
        self.log(LogPhase::ModelReply, &reply)?;
        Ok(reply)
    }

    fn on_done(&mut self) -> Result<Next> {
        self.unrecognized = 0;
        let task = self.update(|task| {
            task.status = TaskStatus::Completed;
            task.append_output(&format!("Goal completed after {} steps.", task.step));
        })?;
        if task.status != TaskStatus::Completed {
            return Ok(Next::Stop(self.cancelled()?));
        }
        self.log(
            LogPhase::Completion,
            &format!(
                "Goal completed after {} steps in {} seconds.",
                task.step,
                task.duration.unwrap_or_default()
            ),
        )?;
        self.record_history(&task)?;
        info!(steps = task.step, "goal completed");
        Ok(Next::Stop(LoopStop::Completed))
    }

    fn on_self_update(&mut self, new_source: &str) -> Result<Next> {
        self.unrecognized = 0;
        let verdict = validate(new_source, CodeKind::Script(ScriptLanguage::Python));
        if !verdict.ok {
            let reason = EngineError::SelfUpdateRejected(verdict.reason.clone()).to_string();
            warn!(reason = %verdict.reason, "self-update rejected");
            self.log(LogPhase::SelfUpdate, &reason)?;
            self.update(|task| task.append_output(&reason))?;
            return Ok(Next::Prompt(
                self.s.prompts.self_update_rejected(&self.goal, &verdict.reason)?,
            ));
        }

        let outcome = match self.s.self_updater.apply(new_source, Utc::now()) {
            Ok(outcome) => outcome,
            Err(err) => {
                let detail = format!("{err:#}");
                let reason = EngineError::SelfUpdateFailed(detail.clone()).to_string();
                warn!(err = %detail, "self-update failed");
                self.log(LogPhase::SelfUpdate, &reason)?;
                self.update(|task| task.append_output(&reason))?;
                return Ok(Next::Prompt(
                    self.s.prompts.self_update_rejected(&self.goal, &detail)?,
                ));
            }
        };

        let summary = format!(
            "Self-update applied: wrote {} bytes to {}; backup at {}. Restarting.",
            outcome.bytes_written,
            outcome.source_path.display(),
            outcome.backup_path.display()
        );
        self.log(LogPhase::SelfUpdate, &summary)?;
        let task = self.update(|task| {
            task.status = TaskStatus::Restarting;
            task.append_output(&summary);
        })?;
        self.record_history(&task)?;
        self.s.restart.send_replace(true);
        info!(backup = %outcome.backup_path.display(), "restart requested after self-update");
        Ok(Next::Stop(LoopStop::Restarting))
    }

    fn on_function_calls(&mut self, calls: &[FunctionCall]) -> Result<Next> {
        self.unrecognized = 0;
        let outcome = self.s.dispatcher.execute(self.id, calls);
        for record in &outcome.records {
            self.log(
                LogPhase::FunctionResult,
                &format!(
                    "Function: {}({})\n\nResult:\n{}",
                    record.call.name, record.call.args, record.result
                ),
            )?;
        }
        let transcript = outcome
            .records
            .iter()
            .map(|r| format!("#CALL {}({})\n{}", r.call.name, r.call.args, r.result))
            .collect::<Vec<_>>()
            .join("\n");
        self.update(|task| {
            task.status = TaskStatus::Running { step: task.step };
            task.append_output(&transcript);
        })?;

        let results = outcome.results();
        if outcome.wait_seconds == 0 {
            return Ok(Next::Prompt(
                self.s.prompts.function_results(&self.goal, &results)?,
            ));
        }

        let seconds = outcome.wait_seconds;
        self.update(|task| task.status = TaskStatus::Waiting { seconds })?;
        self.log(LogPhase::Wait, &format!("Status: waiting({seconds})"))?;
        info!(seconds, "waiting before next prompt");
        if !self.cancel.sleep(Duration::from_secs(seconds)) {
            return Ok(Next::Stop(self.cancelled()?));
        }
        let task = self.update(|task| task.status = TaskStatus::Running { step: task.step })?;
        self.log(
            LogPhase::Wait,
            &format!("Waited {seconds} seconds\n\nStatus: {}", task.status),
        )?;
        Ok(Next::Prompt(
            self.s.prompts.wait_complete(&self.goal, seconds, &results)?,
        ))
    }

    fn on_code(&mut self, kind: CodeKind, code: &str) -> Result<Next> {
        self.unrecognized = 0;
        let verdict = validate(code, kind);
        if !verdict.ok {
            warn!(reason = %verdict.reason, "directive rejected");
            let reason = EngineError::UnsafeDirective(verdict.reason.clone()).to_string();
            self.log(
                LogPhase::Error,
                &format!("{reason}\n\nCode ({}):\n```\n{code}\n```", kind.marker()),
            )?;
            self.update(|task| {
                task.status = TaskStatus::Running { step: task.step };
                task.append_output(&format!("Code validation failed: {}", verdict.reason));
            })?;
            return Ok(Next::Prompt(
                self.s.prompts.rejected(&self.goal, &verdict.reason)?,
            ));
        }

        let task = self.update(|task| {
            task.step += 1;
            task.status = TaskStatus::Running { step: task.step };
            task.append_output(&format!(
                "Step {} ({}):\n```\n{code}\n```",
                task.step,
                kind.marker()
            ));
        })?;
        if task.status.is_terminal() {
            return Ok(Next::Stop(self.cancelled()?));
        }
        let step = task.step;
        self.log(
            LogPhase::ExecutionCommand,
            &format!("```{}\n{code}\n```", kind.marker()),
        )?;

        let timeout = match kind {
            CodeKind::Shell => self.s.config.shell_timeout(),
            CodeKind::Script(_) => self.s.config.script_timeout(),
        };
        let result = self.s.executor.run(&ExecRequest {
            kind,
            code: code.to_string(),
            timeout,
            cancel: self.cancel.clone(),
        });
        if result.timed_out {
            warn!(step, "{}", EngineError::ExecutionTimeout(timeout.as_secs()));
        }
        let rendered = result.render();
        self.log(LogPhase::ExecutionOutput, &rendered)?;
        if self.cancel_requested()? {
            return Ok(Next::Stop(self.cancelled()?));
        }

        let env = self.s.probe.capture();
        let shown = truncate_middle(&rendered, self.s.config.limits.prompt_output_chars, "output");
        let prompt = self
            .s
            .prompts
            .step_output(&self.goal, step, kind, &shown.text, &env)?;
        self.update(|task| {
            task.append_output(&format!("Output:\n```\n{rendered}\n```"));
            task.environment = Some(env);
        })?;
        Ok(Next::Prompt(prompt))
    }

    fn on_unrecognized(&mut self) -> Result<Next> {
        self.unrecognized += 1;
        let ceiling = self.s.config.limits.max_unrecognized_replies;
        warn!(count = self.unrecognized, ceiling, "{}", EngineError::DirectiveUnparseable);
        if self.unrecognized >= ceiling {
            let reason = format!(
                "No recognizable directive in {} consecutive replies",
                self.unrecognized
            );
            return Ok(Next::Stop(self.fail(&reason)));
        }
        self.log(
            LogPhase::Error,
            "No executable code or function calls detected in the reply.",
        )?;
        self.update(|task| {
            task.status = TaskStatus::AwaitingCode;
            task.append_output(
                "No executable code or function calls detected. Asking for a #SH or #PY block or a #CALL.",
            );
        })?;
        Ok(Next::Prompt(self.s.prompts.unrecognized(&self.goal)?))
    }

    /// Local token, or a `cancelled` durable row written by another process.
    fn cancel_requested(&self) -> Result<bool> {
        if self.cancel.is_cancelled() {
            return Ok(true);
        }
        self.s.registry.adopt_durable_cancel(self.id)
    }

    fn cancelled(&mut self) -> Result<LoopStop> {
        info!("task cancelled");
        self.log(LogPhase::Cancellation, "Task cancelled by user.")?;
        if let Some(task) = self.s.registry.get(self.id)? {
            self.record_history(&task)?;
            self.s.bus.publish(&task);
        }
        Ok(LoopStop::Cancelled)
    }

    /// Best-effort transition to `failed`; secondary errors are only logged.
    fn fail(&mut self, reason: &str) -> LoopStop {
        warn!(reason, "task failed");
        if let Err(err) = self.log(LogPhase::Error, &format!("Task failed: {reason}")) {
            warn!(err = %format!("{err:#}"), "write failure log");
        }
        match self.update(|task| {
            task.status = TaskStatus::Failed;
            task.failure_reason = Some(reason.to_string());
            task.append_output(&format!("Task failed: {reason}"));
        }) {
            Ok(task) if task.status == TaskStatus::Cancelled => return LoopStop::Cancelled,
            Ok(task) => {
                if let Err(err) = self.record_history(&task) {
                    warn!(err = %format!("{err:#}"), "write history row");
                }
            }
            Err(err) => warn!(err = %format!("{err:#}"), "persist failed status"),
        }
        LoopStop::Failed {
            reason: reason.to_string(),
        }
    }

    fn update<F>(&self, change: F) -> Result<Task>
    where
        F: FnOnce(&mut Task),
    {
        let task = self
            .s
            .registry
            .update(self.id, Utc::now(), change)
            .map_err(EngineError::store)
            .context("persist task transition")?;
        self.s.bus.publish(&task);
        Ok(task)
    }

    fn log(&self, phase: LogPhase, body: &str) -> Result<()> {
        self.s
            .step_log
            .write(self.id, phase, body, Utc::now())
            .with_context(|| format!("write {} log", phase.as_str()))?;
        Ok(())
    }

    fn record_history(&self, task: &Task) -> Result<()> {
        self.s
            .registry
            .store()
            .append_history(&HistoryEntry::from_task(task, Utc::now()))
            .context("append history row")
    }
}
