//! Host facts used to condition prompts.
//!
//! [`EnvironmentContext`] is a value object: the probe in `io::probe` builds a
//! fresh one after every executed step and the task replaces its copy
//! wholesale.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Commands whose availability is reported to the model.
pub const PROBED_COMMANDS: &[&str] = &[
    "apt", "apt-get", "yum", "dnf", "pip", "python3", "python", "docker", "sudo", "git", "curl",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentContext {
    pub user: String,
    pub is_root: bool,
    pub os_info: String,
    pub kernel: String,
    pub hostname: String,
    pub working_dir: String,
    pub free_disk: String,
    pub memory: String,
    pub cpu: String,
    /// Command name -> resolvable on `PATH`.
    pub commands: BTreeMap<String, bool>,
    pub docker_status: String,
    /// Probe failures, kept so the model sees partial context rather than none.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl EnvironmentContext {
    pub fn available_commands(&self) -> Vec<&str> {
        self.commands
            .iter()
            .filter(|(_, available)| **available)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn unavailable_commands(&self) -> Vec<&str> {
        self.commands
            .iter()
            .filter(|(_, available)| !**available)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Short summary appended to step prompts.
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("- user: {}", self.user),
            format!("- is_root: {}", self.is_root),
            format!("- os_info: {}", self.os_info),
            format!("- working_dir: {}", self.working_dir),
            format!("- docker_status: {}", self.docker_status),
        ];
        let available = self.available_commands();
        if !available.is_empty() {
            lines.push(format!("- Available commands: {}", available.join(", ")));
        }
        let unavailable = self.unavailable_commands();
        if !unavailable.is_empty() {
            lines.push(format!("- Unavailable commands: {}", unavailable.join(", ")));
        }
        lines.join("\n")
    }

    /// Full dump returned by `get_environment()`.
    pub fn dump(&self) -> String {
        let mut buf = String::from("Environment Information:\n");
        let scalars = [
            ("user", self.user.clone()),
            ("is_root", self.is_root.to_string()),
            ("os_info", self.os_info.clone()),
            ("kernel", self.kernel.clone()),
            ("hostname", self.hostname.clone()),
            ("working_dir", self.working_dir.clone()),
            ("free_disk_space", self.free_disk.clone()),
            ("memory", self.memory.clone()),
            ("cpu", self.cpu.clone()),
            ("docker_status", self.docker_status.clone()),
        ];
        for (key, value) in scalars {
            buf.push_str(&format!("- {key}: {value}\n"));
        }
        buf.push_str("- available_commands:\n");
        for (name, available) in &self.commands {
            let state = if *available { "available" } else { "not available" };
            buf.push_str(&format!("  - {name}: {state}\n"));
        }
        for err in &self.errors {
            buf.push_str(&format!("- error: {err}\n"));
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EnvironmentContext {
        let mut commands = BTreeMap::new();
        commands.insert("python3".to_string(), true);
        commands.insert("docker".to_string(), false);
        EnvironmentContext {
            user: "root".to_string(),
            is_root: true,
            os_info: "Debian".to_string(),
            working_dir: "/srv".to_string(),
            docker_status: "not installed".to_string(),
            commands,
            ..EnvironmentContext::default()
        }
    }

    #[test]
    fn summary_splits_available_and_unavailable_commands() {
        let summary = sample().summary();
        assert!(summary.contains("- user: root"));
        assert!(summary.contains("- Available commands: python3"));
        assert!(summary.contains("- Unavailable commands: docker"));
    }

    #[test]
    fn dump_lists_every_probed_command() {
        let dump = sample().dump();
        assert!(dump.starts_with("Environment Information:\n"));
        assert!(dump.contains("  - docker: not available"));
        assert!(dump.contains("  - python3: available"));
    }
}
