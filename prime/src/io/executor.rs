//! Executor abstraction for running Shell/Script directives.
//!
//! The [`Executor`] trait decouples the task loop from the host. Tests use
//! recording executors that return predetermined results without spawning
//! processes.

use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{CodeKind, ExecutionResult, ScriptLanguage};
use crate::io::config::EngineConfig;
use crate::io::process::{CancelToken, CommandOutput, Termination, run_command_with_timeout};

/// Parameters for one execution.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub kind: CodeKind,
    pub code: String,
    /// Maximum time to wait for the process.
    pub timeout: Duration,
    pub cancel: CancelToken,
}

/// Abstraction over execution backends.
///
/// Implementations never fail: spawn errors, timeouts and cancellation are
/// reported as text in the returned [`ExecutionResult`].
pub trait Executor: Send + Sync {
    fn run(&self, request: &ExecRequest) -> ExecutionResult;
}

/// Executor that runs code on the local host.
#[derive(Debug, Clone)]
pub struct HostExecutor {
    shell: String,
    python: String,
    scratch_dir: PathBuf,
    capture_limit_bytes: usize,
}

impl HostExecutor {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            shell: config.executor.shell.clone(),
            python: config.executor.python.clone(),
            scratch_dir: config.scratch_dir(),
            capture_limit_bytes: config.executor.capture_limit_bytes,
        }
    }

    fn run_shell(&self, request: &ExecRequest) -> Result<CommandOutput> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(&request.code);
        run_command_with_timeout(
            cmd,
            request.timeout,
            self.capture_limit_bytes,
            &request.cancel,
        )
        .context("run shell code")
    }

    fn run_script(&self, language: ScriptLanguage, request: &ExecRequest) -> Result<CommandOutput> {
        std::fs::create_dir_all(&self.scratch_dir)
            .with_context(|| format!("create scratch dir {}", self.scratch_dir.display()))?;
        let suffix = format!(".{}", language.extension());
        // Removed when dropped, whatever the outcome.
        let mut script = tempfile::Builder::new()
            .prefix("prime_")
            .suffix(&suffix)
            .tempfile_in(&self.scratch_dir)
            .context("create script file")?;
        script
            .write_all(request.code.as_bytes())
            .context("write script file")?;
        script.flush().context("flush script file")?;
        debug!(path = %script.path().display(), "script written");

        let interpreter = match language {
            ScriptLanguage::Python => &self.python,
        };
        let mut cmd = Command::new(interpreter);
        cmd.arg(script.path());
        run_command_with_timeout(
            cmd,
            request.timeout,
            self.capture_limit_bytes,
            &request.cancel,
        )
        .context("run script")
    }
}

impl Executor for HostExecutor {
    #[instrument(skip_all, fields(kind = request.kind.marker(), timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &ExecRequest) -> ExecutionResult {
        info!("executing code");
        let output = match request.kind {
            CodeKind::Shell => self.run_shell(request),
            CodeKind::Script(language) => self.run_script(language, request),
        };
        match output {
            Ok(output) => to_result(&output, request.timeout),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "execution failed before exit");
                ExecutionResult::synthetic(format!("ERROR: {err:#}"))
            }
        }
    }
}

fn to_result(output: &CommandOutput, timeout: Duration) -> ExecutionResult {
    match output.termination {
        Termination::TimedOut => ExecutionResult::timed_out(timeout.as_secs()),
        Termination::Cancelled => ExecutionResult::synthetic("ERROR: Command cancelled"),
        Termination::Exited(status) => {
            if !status.success() {
                debug!(exit_code = ?status.code(), "command exited non-zero");
            }
            ExecutionResult {
                // Signal deaths have no code; report them as -1.
                exit_code: Some(status.code().unwrap_or(-1)),
                combined_output: output.combined(),
                timed_out: false,
                truncated: output.truncated(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(temp: &tempfile::TempDir) -> HostExecutor {
        let config = EngineConfig {
            data_dir: temp.path().to_path_buf(),
            ..EngineConfig::default()
        };
        HostExecutor::new(&config)
    }

    fn request(kind: CodeKind, code: &str) -> ExecRequest {
        ExecRequest {
            kind,
            code: code.to_string(),
            timeout: Duration::from_secs(10),
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn shell_output_is_captured() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = executor(&temp).run(&request(CodeKind::Shell, "echo hello"));
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.combined_output, "hello\n");
        assert_eq!(result.render(), "hello\n");
    }

    #[test]
    fn non_zero_exit_is_rendered_with_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = executor(&temp).run(&request(CodeKind::Shell, "echo nope >&2; exit 4"));
        assert_eq!(result.exit_code, Some(4));
        assert_eq!(result.render(), "[Exit code: 4]\nnope\n");
    }

    #[test]
    fn timeout_yields_timed_out_result() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(CodeKind::Shell, "sleep 30");
        req.timeout = Duration::from_secs(1);
        let result = executor(&temp).run(&req);
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert_eq!(
            result.combined_output,
            "ERROR: Command timed out after 1 seconds"
        );
    }

    #[test]
    fn capture_limit_leaves_a_notice_in_the_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            data_dir: temp.path().to_path_buf(),
            executor: crate::io::config::ExecutorConfig {
                capture_limit_bytes: 10,
                ..Default::default()
            },
            ..EngineConfig::default()
        };
        let code = "printf '0123456789ABCDEFGHIJ'";
        let result = HostExecutor::new(&config).run(&request(CodeKind::Shell, code));
        assert!(result.truncated);
        assert_eq!(result.render(), "0123456789\n[stdout truncated 10 bytes]\n");
    }

    #[test]
    fn spawn_failure_becomes_error_text() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            data_dir: temp.path().to_path_buf(),
            executor: crate::io::config::ExecutorConfig {
                shell: "/nonexistent/shell".to_string(),
                ..Default::default()
            },
            ..EngineConfig::default()
        };
        let result = HostExecutor::new(&config).run(&request(CodeKind::Shell, "true"));
        assert_eq!(result.exit_code, None);
        assert!(result.combined_output.starts_with("ERROR: "));
    }

    #[test]
    fn script_file_is_removed_after_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            data_dir: temp.path().to_path_buf(),
            executor: crate::io::config::ExecutorConfig {
                // `sh` stands in for the interpreter so the test does not need python.
                python: "sh".to_string(),
                ..Default::default()
            },
            ..EngineConfig::default()
        };
        let result = HostExecutor::new(&config).run(&request(
            CodeKind::Script(ScriptLanguage::Python),
            "echo from-script",
        ));
        assert_eq!(result.combined_output, "from-script\n");
        let leftovers = std::fs::read_dir(config.scratch_dir())
            .expect("scratch dir")
            .count();
        assert_eq!(leftovers, 0);
    }
}
