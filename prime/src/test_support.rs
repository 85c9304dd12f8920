//! Test doubles and fixtures shared by unit and integration tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

use crate::core::environment::EnvironmentContext;
use crate::core::types::ExecutionResult;
use crate::engine::{Engine, EngineParts};
use crate::io::config::EngineConfig;
use crate::io::executor::{ExecRequest, Executor};
use crate::io::model::{ModelAdapter, ModelRequest};
use crate::io::probe::EnvironmentProbe;

/// Model that returns queued replies in order and records every request.
///
/// An exhausted queue yields an error, which the task loop reports as an
/// unavailable model.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, String>>>,
    requests: Mutex<Vec<(Instant, ModelRequest)>>,
}

impl ScriptedModel {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let model = Self::default();
        for reply in replies {
            model.push(reply);
        }
        model
    }

    pub fn push(&self, reply: impl Into<String>) {
        self.lock_replies().push_back(Ok(reply.into()));
    }

    /// Queue a transport failure.
    pub fn push_error(&self, message: impl Into<String>) {
        self.lock_replies().push_back(Err(message.into()));
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.lock_requests()
            .iter()
            .map(|(_, request)| request.clone())
            .collect()
    }

    /// When each request arrived, in order.
    pub fn call_times(&self) -> Vec<Instant> {
        self.lock_requests().iter().map(|(at, _)| *at).collect()
    }

    pub fn assert_drained(&self) {
        let left = self.lock_replies().len();
        assert_eq!(left, 0, "scripted model still has {left} queued replies");
    }

    fn lock_replies(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, String>>> {
        self.replies.lock().expect("scripted replies lock")
    }

    fn lock_requests(&self) -> std::sync::MutexGuard<'_, Vec<(Instant, ModelRequest)>> {
        self.requests.lock().expect("scripted requests lock")
    }
}

impl ModelAdapter for ScriptedModel {
    fn complete(&self, request: &ModelRequest) -> Result<String> {
        self.lock_requests().push((Instant::now(), request.clone()));
        match self.lock_replies().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted model has no more replies")),
        }
    }
}

/// Executor that records requests instead of spawning processes.
#[derive(Default)]
pub struct RecordingExecutor {
    results: Mutex<VecDeque<ExecutionResult>>,
    requests: Mutex<Vec<ExecRequest>>,
    delay: Option<Duration>,
}

impl RecordingExecutor {
    /// Every run succeeds with empty output unless results are queued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Each run blocks for `delay` or until the request is cancelled.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn push_output(&self, exit_code: i32, output: impl Into<String>) {
        self.results
            .lock()
            .expect("executor results lock")
            .push_back(ExecutionResult {
                exit_code: Some(exit_code),
                combined_output: output.into(),
                timed_out: false,
                truncated: false,
            });
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests.lock().expect("executor requests lock").clone()
    }
}

impl Executor for RecordingExecutor {
    fn run(&self, request: &ExecRequest) -> ExecutionResult {
        self.requests
            .lock()
            .expect("executor requests lock")
            .push(request.clone());
        if let Some(delay) = self.delay {
            if !request.cancel.sleep(delay) {
                return ExecutionResult::synthetic("ERROR: Command cancelled");
            }
        }
        self.results
            .lock()
            .expect("executor results lock")
            .pop_front()
            .unwrap_or(ExecutionResult {
                exit_code: Some(0),
                combined_output: String::new(),
                timed_out: false,
                truncated: false,
            })
    }
}

/// Probe returning a fixed snapshot.
#[derive(Debug, Clone)]
pub struct StaticProbe(pub EnvironmentContext);

impl Default for StaticProbe {
    fn default() -> Self {
        Self(EnvironmentContext {
            user: "tester".to_string(),
            is_root: false,
            os_info: "TestOS 1.0".to_string(),
            working_dir: "/work".to_string(),
            docker_status: "not installed".to_string(),
            ..EnvironmentContext::default()
        })
    }
}

impl EnvironmentProbe for StaticProbe {
    fn capture(&self) -> EnvironmentContext {
        self.0.clone()
    }
}

/// Probe whose snapshot changes on every capture: capture `n` (from 1)
/// reports working directory `/work/<n>`.
#[derive(Debug, Default)]
pub struct CountingProbe {
    captures: AtomicUsize,
}

impl CountingProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

impl EnvironmentProbe for CountingProbe {
    fn capture(&self) -> EnvironmentContext {
        let n = self.captures.fetch_add(1, Ordering::SeqCst) + 1;
        EnvironmentContext {
            working_dir: format!("/work/{n}"),
            ..StaticProbe::default().0
        }
    }
}

/// Temporary data directory with a fast, deterministic configuration.
pub struct TestWorkspace {
    pub temp: tempfile::TempDir,
    pub config: EngineConfig,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = EngineConfig {
            data_dir: temp.path().join(".prime"),
            ..EngineConfig::default()
        };
        config.model.max_retries = 1;
        config.model.retry_backoff_ms = 0;
        Self { temp, config }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// Enable self-update against a source file seeded with `contents`.
    pub fn with_source(mut self, contents: &str) -> Self {
        let path = self.source_path();
        std::fs::write(&path, contents).expect("seed source");
        self.config.self_update.source_path = Some(path);
        self
    }

    pub fn source_path(&self) -> PathBuf {
        self.temp.path().join("engine_source.py")
    }

    pub fn engine(&self, model: Arc<ScriptedModel>, executor: Arc<RecordingExecutor>) -> Engine {
        self.engine_with_probe(model, executor, Arc::new(StaticProbe::default()))
    }

    pub fn engine_with_probe(
        &self,
        model: Arc<ScriptedModel>,
        executor: Arc<RecordingExecutor>,
        probe: Arc<dyn EnvironmentProbe>,
    ) -> Engine {
        Engine::with_parts(
            self.config.clone(),
            EngineParts {
                model,
                executor,
                probe,
            },
        )
        .expect("engine")
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}
