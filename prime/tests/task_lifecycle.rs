//! End-to-end task scenarios driven through `Engine` with scripted doubles.
//!
//! The model replies come from a queue, execution is recorded instead of
//! spawned, and every assertion is made against the durable task row, the
//! notification stream or the step log, the same surfaces a client sees.

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use prime::bus::Notification;
use prime::core::types::{CodeKind, FIRST_TASK_ID, LogPhase, ScriptLanguage, TaskId, TaskStatus};
use prime::task_loop::LoopStop;
use prime::test_support::{CountingProbe, RecordingExecutor, ScriptedModel, TestWorkspace};
use prime::{Engine, EngineError};
use tokio::sync::broadcast;

fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(20));
    }
}

fn phases(engine: &Engine, id: TaskId) -> Vec<LogPhase> {
    engine
        .task_logs(id)
        .expect("logs")
        .into_iter()
        .map(|entry| entry.phase)
        .collect()
}

#[test]
fn print_hello_runs_one_script_and_completes() {
    let ws = TestWorkspace::new();
    let model = Arc::new(ScriptedModel::new([
        "Sure.\n```python #PY\nprint(\"hello\")\n```",
        "#DONE",
    ]));
    let exec = Arc::new(RecordingExecutor::new());
    exec.push_output(0, "hello\n");
    let engine = ws.engine(model.clone(), exec.clone());

    let outcome = engine.run_blocking("print hello").expect("run");

    assert_eq!(outcome.stop, LoopStop::Completed);
    assert_eq!(outcome.task.status, TaskStatus::Completed);
    assert_eq!(outcome.task.step, 1);
    assert!(outcome.task.output.contains("hello"));
    assert!(outcome.task.duration.is_some());
    model.assert_drained();

    let runs = exec.requests();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].kind, CodeKind::Script(ScriptLanguage::Python));
    assert_eq!(runs[0].code, "print(\"hello\")");

    let requests = model.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].prompt.contains("print hello"));
    assert!(requests[1].prompt.contains("Output from step 1 (PY):"));
    assert!(requests[1].prompt.contains("hello"));
    assert_eq!(requests[1].history.len(), 2);

    let history = engine.history(10).expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, outcome.task.id);
    assert_eq!(history[0].status, TaskStatus::Completed);

    assert_eq!(
        phases(&engine, outcome.task.id),
        vec![
            LogPhase::UserGoal,
            LogPhase::PromptToModel,
            LogPhase::ModelReply,
            LogPhase::ExecutionCommand,
            LogPhase::ExecutionOutput,
            LogPhase::PromptToModel,
            LogPhase::ModelReply,
            LogPhase::Completion,
        ]
    );
}

#[test]
fn deny_listed_shell_never_reaches_executor() {
    let ws = TestWorkspace::new();
    let model = Arc::new(ScriptedModel::new(["```bash #SH\nrm -rf /\n```", "#DONE"]));
    let exec = Arc::new(RecordingExecutor::new());
    let engine = ws.engine(model.clone(), exec.clone());
    let mut events = engine.subscribe();

    let outcome = engine.run_blocking("clean up the disk").expect("run");

    assert!(exec.requests().is_empty());
    assert_eq!(outcome.task.step, 0);
    assert!(outcome.task.output.contains("Code validation failed"));

    let rejected = drain(&mut events)
        .into_iter()
        .find(|event| event.output.contains("Code validation failed"))
        .expect("rejection notification");
    assert_eq!(rejected.status, "running(step=0)");

    let requests = model.requests();
    assert!(requests[1].prompt.starts_with("Code validation failed:"));
    assert!(phases(&engine, outcome.task.id).contains(&LogPhase::Error));
}

#[test]
fn wait_pauses_prompting_and_reports_waiting_status() {
    let ws = TestWorkspace::new();
    let model = Arc::new(ScriptedModel::new(["#CALL wait(1)", "#DONE"]));
    let exec = Arc::new(RecordingExecutor::new());
    let engine = ws.engine(model.clone(), exec);
    let mut events = engine.subscribe();

    let outcome = engine.run_blocking("wait a moment").expect("run");

    assert_eq!(outcome.stop, LoopStop::Completed);
    let times = model.call_times();
    assert_eq!(times.len(), 2);
    assert!(times[1].duration_since(times[0]) >= Duration::from_secs(1));

    let statuses: Vec<String> = drain(&mut events).into_iter().map(|e| e.status).collect();
    let waiting = statuses
        .iter()
        .position(|s| s == "waiting(1)")
        .expect("waiting status published");
    assert!(statuses[waiting + 1..].iter().any(|s| s.starts_with("running")));
    assert!(model.requests()[1].prompt.contains("Waiting for 1 seconds"));

    let id = outcome.task.id;
    let waits: Vec<String> = engine
        .task_logs(id)
        .expect("logs")
        .into_iter()
        .filter(|entry| entry.phase == LogPhase::Wait)
        .map(|entry| {
            engine
                .task_log(id, &entry.filename)
                .expect("read")
                .expect("indexed")
        })
        .collect();
    assert_eq!(waits.len(), 2);
    assert!(waits[0].contains("waiting(1)"));
    assert!(waits[1].contains("running(step=0)"));
}

#[test]
fn environment_is_refreshed_after_every_executed_step() {
    let ws = TestWorkspace::new();
    let model = Arc::new(ScriptedModel::new([
        "```bash #SH\ncd /tmp\n```",
        "```bash #SH\nmkdir -p out\n```",
        "#DONE",
    ]));
    let probe = Arc::new(CountingProbe::new());
    let engine = ws.engine_with_probe(
        model.clone(),
        Arc::new(RecordingExecutor::new()),
        probe.clone(),
    );

    let outcome = engine.run_blocking("set up a workspace").expect("run");

    assert_eq!(outcome.stop, LoopStop::Completed);
    // One snapshot at start, one after each of the two steps.
    assert_eq!(probe.captures(), 3);
    let requests = model.requests();
    assert!(requests[0].prompt.contains("/work/1"));
    assert!(requests[1].prompt.contains("Output from step 1 (SH):"));
    assert!(requests[1].prompt.contains("- working_dir: /work/2"));
    assert!(requests[2].prompt.contains("Output from step 2 (SH):"));
    assert!(requests[2].prompt.contains("- working_dir: /work/3"));
    let env = outcome.task.environment.expect("environment");
    assert_eq!(env.working_dir, "/work/3");
}

#[test]
fn three_unrecognized_replies_fail_the_task() {
    let ws = TestWorkspace::new();
    let model = Arc::new(ScriptedModel::new([
        "I am thinking about it.",
        "Still thinking.",
        "No code today.",
    ]));
    let engine = ws.engine(model.clone(), Arc::new(RecordingExecutor::new()));
    let mut events = engine.subscribe();

    let outcome = engine.run_blocking("do something").expect("run");

    assert!(matches!(outcome.stop, LoopStop::Failed { .. }));
    assert_eq!(outcome.task.status, TaskStatus::Failed);
    let reason = outcome.task.failure_reason.expect("reason");
    assert!(reason.contains("3 consecutive"), "{reason}");
    assert_eq!(model.requests().len(), 3);
    assert!(
        drain(&mut events)
            .iter()
            .any(|event| event.status == "awaiting_code")
    );
}

#[test]
fn recognized_directive_resets_unrecognized_count() {
    let ws = TestWorkspace::new();
    let model = Arc::new(ScriptedModel::new([
        "hmm",
        "hmm again",
        "```bash #SH\nls\n```",
        "hmm",
        "hmm again",
        "#DONE",
    ]));
    let engine = ws.engine(model.clone(), Arc::new(RecordingExecutor::new()));

    let outcome = engine.run_blocking("list files").expect("run");

    assert_eq!(outcome.stop, LoopStop::Completed);
    model.assert_drained();
}

#[test]
fn self_update_leaves_one_identical_backup_and_signals_restart() {
    let original = "print('v1')\n";
    let ws = TestWorkspace::new().with_source(original);
    let model = Arc::new(ScriptedModel::new([
        "Improving myself.\n#SELFUPDATE\n```python\nprint('v2')\n```",
    ]));
    let engine = ws.engine(model, Arc::new(RecordingExecutor::new()));
    let restart = engine.restart_signal();

    let outcome = engine.run_blocking("upgrade yourself").expect("run");

    assert_eq!(outcome.stop, LoopStop::Restarting);
    assert_eq!(outcome.task.status, TaskStatus::Restarting);
    assert!(*restart.borrow());
    assert_eq!(
        fs::read_to_string(ws.source_path()).expect("source"),
        "print('v2')"
    );

    let backups: Vec<_> = fs::read_dir(ws.root())
        .expect("read dir")
        .filter_map(Result::ok)
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with("engine_source.py.bak.")
        })
        .collect();
    assert_eq!(backups.len(), 1);
    assert_eq!(
        fs::read_to_string(backups[0].path()).expect("backup"),
        original
    );
    assert_eq!(engine.history(10).expect("history").len(), 1);
}

#[test]
fn unsafe_self_update_is_rejected_and_source_untouched() {
    let original = "print('v1')\n";
    let ws = TestWorkspace::new().with_source(original);
    let model = Arc::new(ScriptedModel::new([
        "#SELFUPDATE\nimport os\nos.system('rm -rf /')",
        "#DONE",
    ]));
    let engine = ws.engine(model.clone(), Arc::new(RecordingExecutor::new()));
    let restart = engine.restart_signal();

    let outcome = engine.run_blocking("upgrade yourself").expect("run");

    assert_eq!(outcome.stop, LoopStop::Completed);
    assert!(!*restart.borrow());
    assert_eq!(
        fs::read_to_string(ws.source_path()).expect("source"),
        original
    );
    assert!(outcome.task.output.contains("self-update rejected"));
    assert!(
        model.requests()[1]
            .prompt
            .starts_with("Self-update was rejected:")
    );
    let entries = fs::read_dir(ws.root()).expect("read dir").count();
    // .prime/ and the source file only.
    assert_eq!(entries, 2);
}

#[test]
fn check_status_is_idempotent() {
    let ws = TestWorkspace::new();
    let first = TaskId(FIRST_TASK_ID);
    let model = Arc::new(ScriptedModel::new([
        "```bash #SH\necho done\n```".to_string(),
        "#DONE".to_string(),
        format!("#CALL check_status({first})"),
        format!("#CALL check_status({first})"),
        "#DONE".to_string(),
    ]));
    let engine = ws.engine(model.clone(), Arc::new(RecordingExecutor::new()));

    let done = engine.run_blocking("echo done").expect("first run");
    assert_eq!(done.task.id, first);
    let before = engine.task(first).expect("task");

    let checker = engine.run_blocking("check the first task").expect("second run");
    assert_eq!(checker.stop, LoopStop::Completed);

    let requests = model.requests();
    assert_eq!(requests.len(), 5);
    assert!(requests[3].prompt.contains("status: completed"));
    assert_eq!(requests[3].prompt, requests[4].prompt);
    assert_eq!(engine.task(first).expect("task"), before);
}

#[test]
fn prompt_copy_is_truncated_but_step_log_is_not() {
    let mut ws = TestWorkspace::new();
    ws.config.limits.prompt_output_chars = 100;
    let model = Arc::new(ScriptedModel::new(["```bash #SH\ncat big.txt\n```", "#DONE"]));
    let exec = Arc::new(RecordingExecutor::new());
    let big = format!("{}END", "x".repeat(5_000));
    exec.push_output(0, big.clone());
    let engine = ws.engine(model.clone(), exec);

    let outcome = engine.run_blocking("show the big file").expect("run");

    let prompt = &model.requests()[1].prompt;
    assert!(prompt.contains("[output truncated, 5003 characters total]"));
    assert!(!prompt.contains(&big));
    assert!(prompt.contains("END"));

    let entry = engine
        .task_logs(outcome.task.id)
        .expect("logs")
        .into_iter()
        .find(|entry| entry.phase == LogPhase::ExecutionOutput)
        .expect("execution output entry");
    let body = engine
        .task_log(outcome.task.id, &entry.filename)
        .expect("read")
        .expect("artifact");
    assert!(body.contains(&big));
    assert!(outcome.task.output.contains(&big));
}

#[test]
fn cancel_interrupts_running_step() {
    let ws = TestWorkspace::new();
    let model = Arc::new(ScriptedModel::new(["```bash #SH\nsleep 30\n```"]));
    let exec = Arc::new(RecordingExecutor::with_delay(Duration::from_secs(30)));
    let engine = ws.engine(model.clone(), exec.clone());

    let started = Instant::now();
    let id = engine.submit("sleep for a while").expect("submit");
    wait_until("executor call", || exec.requests().len() == 1);

    let cancelled = engine.cancel(id).expect("cancel");
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    wait_until("cancellation log", || {
        phases(&engine, id).contains(&LogPhase::Cancellation)
    });
    assert!(started.elapsed() < Duration::from_secs(30));

    let task = engine.task(id).expect("task");
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.output.contains("Task cancelled by user."));
    assert_eq!(model.requests().len(), 1);

    let again = engine.cancel(id).expect("cancel again");
    assert_eq!(again, task);
}

#[test]
fn unreachable_model_fails_the_task() {
    let ws = TestWorkspace::new();
    let model = Arc::new(ScriptedModel::default());
    model.push_error("connection refused");
    let engine = ws.engine(model, Arc::new(RecordingExecutor::new()));

    let outcome = engine.run_blocking("anything").expect("run");

    assert_eq!(outcome.task.status, TaskStatus::Failed);
    let reason = outcome.task.failure_reason.expect("reason");
    assert!(reason.contains("model unavailable"), "{reason}");
    assert!(reason.contains("connection refused"), "{reason}");
}

#[test]
fn step_limit_bounds_model_turns() {
    let mut ws = TestWorkspace::new();
    ws.config.limits.max_steps = 2;
    let model = Arc::new(ScriptedModel::new(["#CALL help()", "#CALL help()", "#DONE"]));
    let engine = ws.engine(model.clone(), Arc::new(RecordingExecutor::new()));

    let outcome = engine.run_blocking("loop forever").expect("run");

    assert!(matches!(outcome.stop, LoopStop::Failed { .. }));
    assert_eq!(model.requests().len(), 2);
}

#[test]
fn unknown_task_and_empty_goal_are_errors() {
    let ws = TestWorkspace::new();
    let engine = ws.engine(
        Arc::new(ScriptedModel::default()),
        Arc::new(RecordingExecutor::new()),
    );

    assert!(matches!(
        engine.task(TaskId(7)),
        Err(EngineError::TaskNotFound(TaskId(7)))
    ));
    assert!(matches!(
        engine.cancel(TaskId(7)),
        Err(EngineError::TaskNotFound(_))
    ));
    assert!(matches!(
        engine.submit("   "),
        Err(EngineError::InvalidGoal(_))
    ));
}
