//! Engine facade: submits goals, answers queries and cancels tasks.
//!
//! Each submitted goal gets its own worker thread running
//! [`task_loop::run_task`]. Workers share one [`Services`] bundle; task rows
//! are only mutated through the registry.

use std::fs;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tracing::{info, instrument, warn};

use crate::bus::{Notification, NotificationBus};
use crate::core::types::{Task, TaskId};
use crate::error::{EngineError, EngineResult};
use crate::functions::FunctionDispatcher;
use crate::io::config::EngineConfig;
use crate::io::executor::{Executor, HostExecutor};
use crate::io::model::{ModelAdapter, OllamaAdapter, RetryingModel};
use crate::io::probe::{EnvironmentProbe, HostProbe};
use crate::io::process::CancelToken;
use crate::io::prompt::PromptEngine;
use crate::io::self_update::SelfUpdater;
use crate::io::step_log::{LogEntry, StepLog};
use crate::io::store::{HistoryEntry, TaskStore};
use crate::registry::TaskRegistry;
use crate::task_loop::{self, LoopOutcome, Services};

/// Reachability of the configured model.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ModelStatus {
    pub model: String,
    pub url: String,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Adapters an engine is assembled from.
pub struct EngineParts {
    pub model: Arc<dyn ModelAdapter>,
    pub executor: Arc<dyn Executor>,
    pub probe: Arc<dyn EnvironmentProbe>,
}

#[derive(Clone)]
pub struct Engine {
    services: Arc<Services>,
}

impl Engine {
    /// Engine wired to the host: Ollama model, host executor and probe.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let adapter = OllamaAdapter::new(&config.model)?;
        let model = RetryingModel::from_config(adapter, &config.model);
        let executor = HostExecutor::new(&config);
        Self::with_parts(
            config,
            EngineParts {
                model: Arc::new(model),
                executor: Arc::new(executor),
                probe: Arc::new(HostProbe),
            },
        )
    }

    pub fn with_parts(config: EngineConfig, parts: EngineParts) -> Result<Self> {
        config.validate()?;
        for dir in [config.state_dir(), config.tasks_log_dir(), config.scratch_dir()] {
            fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        }
        let registry = Arc::new(TaskRegistry::open(TaskStore::new(&config.state_dir()))?);
        let dispatcher = FunctionDispatcher::new(registry.clone(), parts.probe.clone(), &config);
        let (restart, _) = watch::channel(false);
        let services = Services {
            model: parts.model,
            executor: parts.executor,
            probe: parts.probe,
            registry,
            bus: NotificationBus::new(),
            step_log: StepLog::new(&config.tasks_log_dir()),
            prompts: PromptEngine::new()?,
            dispatcher,
            self_updater: SelfUpdater::new(config.self_update.source_path.clone()),
            restart,
            config,
        };
        info!(data_dir = %services.config.data_dir.display(), "engine ready");
        Ok(Self {
            services: Arc::new(services),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    /// Create a task and start its worker. Returns as soon as the task row exists.
    #[instrument(skip_all)]
    pub fn submit(&self, goal: &str) -> EngineResult<TaskId> {
        let (task, cancel) = self.create(goal)?;
        let id = task.id;
        let services = self.services.clone();
        thread::Builder::new()
            .name(format!("task-{id}"))
            .spawn(move || {
                task_loop::run_task(&services, task, cancel);
            })
            .map_err(|err| EngineError::Store(format!("spawn worker for task {id}: {err}")))?;
        Ok(id)
    }

    /// Create a task and run it on the calling thread.
    pub fn run_blocking(&self, goal: &str) -> EngineResult<LoopOutcome> {
        let (task, cancel) = self.create(goal)?;
        Ok(task_loop::run_task(&self.services, task, cancel))
    }

    fn create(&self, goal: &str) -> EngineResult<(Task, CancelToken)> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(EngineError::InvalidGoal("goal must not be empty".to_string()));
        }
        let (task, cancel) = self
            .services
            .registry
            .create(goal, Utc::now())
            .map_err(EngineError::store)?;
        self.services.bus.publish(&task);
        Ok((task, cancel))
    }

    pub fn task(&self, id: TaskId) -> EngineResult<Task> {
        self.services
            .registry
            .get(id)
            .map_err(EngineError::store)?
            .ok_or(EngineError::TaskNotFound(id))
    }

    /// Cancel a task. Terminal tasks are returned unchanged.
    #[instrument(skip_all, fields(task_id = %id))]
    pub fn cancel(&self, id: TaskId) -> EngineResult<Task> {
        let task = self
            .services
            .registry
            .cancel(id, Utc::now())
            .map_err(EngineError::store)?
            .ok_or(EngineError::TaskNotFound(id))?;
        self.services.bus.publish(&task);
        Ok(task)
    }

    /// Tasks known to this process, ordered by id.
    pub fn tasks(&self) -> EngineResult<Vec<Task>> {
        self.services.registry.list().map_err(EngineError::store)
    }

    /// Finished tasks, newest first.
    pub fn history(&self, limit: usize) -> EngineResult<Vec<HistoryEntry>> {
        self.services
            .registry
            .store()
            .history(limit)
            .map_err(EngineError::store)
    }

    pub fn task_logs(&self, id: TaskId) -> EngineResult<Vec<LogEntry>> {
        self.task(id)?;
        self.services
            .step_log
            .entries(id)
            .map_err(EngineError::store)
    }

    /// Body of one step log artifact, `None` when the name is not indexed.
    pub fn task_log(&self, id: TaskId, filename: &str) -> EngineResult<Option<String>> {
        self.task(id)?;
        self.services
            .step_log
            .read(id, filename)
            .map_err(EngineError::store)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.services.bus.subscribe()
    }

    /// Flips to `true` once a self-update was applied.
    pub fn restart_signal(&self) -> watch::Receiver<bool> {
        self.services.restart.subscribe()
    }

    pub fn model_status(&self) -> ModelStatus {
        let model = &self.services.config.model;
        let error = match self.services.model.ping() {
            Ok(()) => None,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "model ping failed");
                Some(format!("{err:#}"))
            }
        };
        ModelStatus {
            model: model.name.clone(),
            url: model.url.clone(),
            reachable: error.is_none(),
            error,
        }
    }
}
