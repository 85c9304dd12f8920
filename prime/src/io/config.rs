//! Engine configuration stored at `<data_dir>/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values below; command-line flags override whatever the file says.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Root for task rows, history, step logs and scratch files.
    pub data_dir: PathBuf,

    pub model: ModelConfig,
    pub executor: ExecutorConfig,
    pub limits: LimitsConfig,
    pub self_update: SelfUpdateConfig,

    /// Refuse `read_file` / `list_directory` on credential paths.
    pub guard_function_paths: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL of the Ollama-compatible chat endpoint.
    pub url: String,
    pub name: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Shell used for `#SH` blocks, invoked as `<shell> -c <code>`.
    pub shell: String,
    pub shell_timeout_secs: u64,
    pub script_timeout_secs: u64,
    /// Interpreter for `#PY` blocks.
    pub python: String,
    /// In-memory capture ceiling per stream. Bytes beyond it are drained and dropped.
    pub capture_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Prompt-bound copy of execution output is elided beyond this many chars.
    pub prompt_output_chars: usize,
    pub read_file_chars: usize,
    pub max_wait_secs: u64,
    /// Consecutive unrecognized replies tolerated before the task fails.
    pub max_unrecognized_replies: u32,
    /// Model turns per task.
    pub max_steps: u32,
    pub history_messages: usize,
    pub history_char_budget: usize,
    /// Per-message cap applied to history before it is sent.
    pub history_output_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SelfUpdateConfig {
    /// File replaced by `#SELFUPDATE`. `None` disables self-update.
    pub source_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".prime"),
            model: ModelConfig::default(),
            executor: ExecutorConfig::default(),
            limits: LimitsConfig::default(),
            self_update: SelfUpdateConfig::default(),
            guard_function_paths: true,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            name: "llama3".to_string(),
            request_timeout_secs: 300,
            max_retries: 3,
            retry_backoff_ms: 5_000,
            temperature: 0.2,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            shell_timeout_secs: 300,
            script_timeout_secs: 300,
            python: "python3".to_string(),
            capture_limit_bytes: 1_000_000,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            prompt_output_chars: 4_000,
            read_file_chars: 4_000,
            max_wait_secs: 60,
            max_unrecognized_replies: 3,
            max_steps: 50,
            history_messages: 10,
            history_char_budget: 24_000,
            history_output_chars: 4_000,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(anyhow!("data_dir must be non-empty"));
        }
        if self.model.url.trim().is_empty() {
            return Err(anyhow!("model.url must be non-empty"));
        }
        if self.model.name.trim().is_empty() {
            return Err(anyhow!("model.name must be non-empty"));
        }
        if self.model.request_timeout_secs == 0 {
            return Err(anyhow!("model.request_timeout_secs must be > 0"));
        }
        if self.model.max_retries == 0 {
            return Err(anyhow!("model.max_retries must be > 0"));
        }
        if self.executor.shell.trim().is_empty() || self.executor.python.trim().is_empty() {
            return Err(anyhow!("executor.shell and executor.python must be non-empty"));
        }
        if self.executor.shell_timeout_secs == 0 || self.executor.script_timeout_secs == 0 {
            return Err(anyhow!("executor timeouts must be > 0"));
        }
        if self.executor.capture_limit_bytes == 0 {
            return Err(anyhow!("executor.capture_limit_bytes must be > 0"));
        }
        if self.limits.prompt_output_chars < 2 || self.limits.read_file_chars < 2 {
            return Err(anyhow!("limits.*_chars must be >= 2"));
        }
        if self.limits.max_unrecognized_replies == 0 {
            return Err(anyhow!("limits.max_unrecognized_replies must be > 0"));
        }
        if self.limits.max_steps == 0 {
            return Err(anyhow!("limits.max_steps must be > 0"));
        }
        if self.limits.history_messages == 0 {
            return Err(anyhow!("limits.history_messages must be > 0"));
        }
        Ok(())
    }

    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.executor.shell_timeout_secs)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.executor.script_timeout_secs)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub fn tasks_log_dir(&self) -> PathBuf {
        self.data_dir.join("tasks")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.data_dir.join("scratch")
    }

    pub fn config_path(&self) -> PathBuf {
        config_path(&self.data_dir)
    }
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()` rooted at the
/// file's directory.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let mut cfg = EngineConfig::default();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            cfg.data_dir = parent.to_path_buf();
        }
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Command-line / environment values that take precedence over the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub data_dir: PathBuf,
    pub model_url: Option<String>,
    pub model_name: Option<String>,
}

/// Load `<data_dir>/config.toml` and apply `overrides` on top.
pub fn resolve_config(overrides: &Overrides) -> Result<EngineConfig> {
    let mut cfg = load_config(&config_path(&overrides.data_dir))?;
    cfg.data_dir = overrides.data_dir.clone();
    if let Some(url) = &overrides.model_url {
        cfg.model.url = url.clone();
    }
    if let Some(name) = &overrides.model_name {
        cfg.model.name = name.clone();
    }
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` next to `path` and rename it into place.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
