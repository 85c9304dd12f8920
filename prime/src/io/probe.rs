//! Host introspection producing [`EnvironmentContext`] values.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument};

use crate::core::environment::{EnvironmentContext, PROBED_COMMANDS};
use crate::io::process::{CancelToken, Termination, run_command_with_timeout};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_OUTPUT_LIMIT: usize = 16 * 1024;

pub trait EnvironmentProbe: Send + Sync {
    /// Build a fresh snapshot. Individual probe failures are recorded in
    /// `errors`, never raised.
    fn capture(&self) -> EnvironmentContext;
}

/// Probe that runs read-only commands on the local host.
#[derive(Debug, Clone, Default)]
pub struct HostProbe;

impl EnvironmentProbe for HostProbe {
    #[instrument(skip_all)]
    fn capture(&self) -> EnvironmentContext {
        let mut errors = Vec::new();
        let mut probe = |label: &str, script: &str| match run_probe(script) {
            Ok(value) => value,
            Err(err) => {
                errors.push(format!("{label}: {err:#}"));
                "unknown".to_string()
            }
        };

        let user = probe("user", "whoami");
        let uid = probe("uid", "id -u");
        let os_info = probe(
            "os_info",
            ". /etc/os-release 2>/dev/null && echo \"$PRETTY_NAME\" || uname -s",
        );
        let kernel = probe("kernel", "uname -r");
        let hostname = probe("hostname", "hostname 2>/dev/null || uname -n");
        let free_disk = probe("free_disk", "df -h / | awk 'NR==2 {print $4}'");
        let memory = probe(
            "memory",
            "free -h 2>/dev/null | awk '/^Mem:/ {print $2\" total, \"$7\" available\"}'",
        );
        let cpu = probe(
            "cpu",
            "(nproc 2>/dev/null || getconf _NPROCESSORS_ONLN) | tr -d '\\n'; echo ' cores'",
        );

        let commands: BTreeMap<String, bool> = PROBED_COMMANDS
            .iter()
            .map(|name| ((*name).to_string(), command_available(name)))
            .collect();
        let docker_status = if commands.get("docker").copied().unwrap_or(false) {
            probe(
                "docker_status",
                "docker info >/dev/null 2>&1 && echo running || echo 'installed, not running'",
            )
        } else {
            "not installed".to_string()
        };

        let working_dir = env::current_dir()
            .map(|dir| dir.display().to_string())
            .unwrap_or_else(|err| {
                errors.push(format!("working_dir: {err}"));
                "unknown".to_string()
            });

        debug!(errors = errors.len(), "environment captured");
        EnvironmentContext {
            is_root: uid == "0" || user == "root",
            user,
            os_info,
            kernel,
            hostname,
            working_dir,
            free_disk,
            memory,
            cpu,
            commands,
            docker_status,
            errors,
        }
    }
}

fn run_probe(script: &str) -> Result<String> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script);
    let output = run_command_with_timeout(cmd, PROBE_TIMEOUT, PROBE_OUTPUT_LIMIT, &CancelToken::new())?;
    match output.termination {
        Termination::Exited(status) if status.success() => {
            let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if text.is_empty() {
                Err(anyhow!("no output"))
            } else {
                Ok(text)
            }
        }
        Termination::Exited(status) => Err(anyhow!("exited with {:?}", status.code())),
        Termination::TimedOut => Err(anyhow!("timed out")),
        Termination::Cancelled => Err(anyhow!("cancelled")),
    }
}

/// Resolve `name` on `PATH`.
pub fn command_available(name: &str) -> bool {
    find_on_path(name).is_some()
}

pub fn find_on_path(name: &str) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }
    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sh_is_on_path() {
        assert!(command_available("sh"));
        assert!(!command_available("definitely-not-a-real-command-xyz"));
        assert!(!command_available(""));
    }

    #[test]
    fn non_executable_file_is_not_a_command() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plain.txt");
        fs::write(&path, "hi").expect("write");
        assert!(!command_available(path.to_str().expect("utf8")));
    }

    #[test]
    fn host_probe_fills_every_probed_command() {
        let ctx = HostProbe.capture();
        assert_eq!(ctx.commands.len(), PROBED_COMMANDS.len());
        assert!(!ctx.user.is_empty());
        assert!(!ctx.working_dir.is_empty());
    }
}
