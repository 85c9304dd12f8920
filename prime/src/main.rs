//! Goal-execution engine CLI.
//!
//! Runs goals in the foreground and inspects the durable task rows, history
//! and step logs under the data directory (`.prime/` by default).

use std::fs;
use std::path::PathBuf;
use std::process;
use std::thread;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use prime::bus::NotificationKind;
use prime::core::types::{Task, TaskId};
use prime::exit_codes;
use prime::io::config::{EngineConfig, Overrides, config_path, resolve_config, write_config};
use prime::task_loop::LoopStop;
use prime::{Engine, logging};

#[derive(Parser)]
#[command(
    name = "prime",
    version,
    about = "Pursue natural-language goals by running model-proposed code"
)]
struct Cli {
    /// Directory holding config, task rows, history and step logs.
    #[arg(long, global = true, env = "PRIME_DATA_DIR", default_value = ".prime")]
    data_dir: PathBuf,

    /// Base URL of the Ollama-compatible model server.
    #[arg(long, global = true, env = "OLLAMA_URL")]
    model_url: Option<String>,

    /// Model name passed to the server.
    #[arg(long, global = true, env = "OLLAMA_MODEL")]
    model: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the data directory and a default `config.toml`.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run a goal in the foreground until it finishes.
    Run {
        /// The goal, in plain language.
        #[arg(required = true, num_args = 1..)]
        goal: Vec<String>,
    },
    /// Print a task row.
    Show {
        id: TaskId,
        /// Print the raw JSON row.
        #[arg(long)]
        json: bool,
    },
    /// List finished tasks, newest first.
    History {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Cancel a task, including one running in another process.
    Cancel { id: TaskId },
    /// List a task's step log, or print one artifact.
    Logs { id: TaskId, file: Option<String> },
}

fn main() {
    logging::init("warn");
    match run() {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let overrides = Overrides {
        data_dir: cli.data_dir,
        model_url: cli.model_url,
        model_name: cli.model,
    };
    let open = || -> Result<Engine> { Engine::open(resolve_config(&overrides)?) };
    match cli.command {
        Command::Init { force } => cmd_init(&overrides, force),
        Command::Run { goal } => cmd_run(&open()?, &goal.join(" ")),
        Command::Show { id, json } => cmd_show(&open()?, id, json),
        Command::History { limit } => cmd_history(&open()?, limit),
        Command::Cancel { id } => cmd_cancel(&open()?, id),
        Command::Logs { id, file } => cmd_logs(&open()?, id, file.as_deref()),
    }
}

fn cmd_init(overrides: &Overrides, force: bool) -> Result<i32> {
    let path = config_path(&overrides.data_dir);
    fs::create_dir_all(&overrides.data_dir)
        .with_context(|| format!("create {}", overrides.data_dir.display()))?;
    if path.exists() && !force {
        println!("{} already exists", path.display());
        return Ok(exit_codes::OK);
    }
    let mut cfg = EngineConfig {
        data_dir: overrides.data_dir.clone(),
        ..EngineConfig::default()
    };
    if let Some(url) = &overrides.model_url {
        cfg.model.url = url.clone();
    }
    if let Some(name) = &overrides.model_name {
        cfg.model.name = name.clone();
    }
    write_config(&path, &cfg)?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(engine: &Engine, goal: &str) -> Result<i32> {
    // Progress lines on stderr; the follower ends with the first terminal event.
    let mut events = engine.subscribe();
    thread::spawn(move || {
        let mut last = String::new();
        while let Ok(event) = events.blocking_recv() {
            if event.status != last {
                eprintln!("[task {}] {}", event.id, event.status);
                last = event.status.clone();
            }
            if event.kind == NotificationKind::TaskComplete {
                break;
            }
        }
    });

    let outcome = engine.run_blocking(goal)?;
    println!("{}", outcome.task.output);
    println!();
    print_summary(&outcome.task);
    Ok(match outcome.stop {
        LoopStop::Completed => exit_codes::OK,
        LoopStop::Failed { .. } => exit_codes::FAILED,
        LoopStop::Cancelled => exit_codes::CANCELLED,
        LoopStop::Restarting => exit_codes::RESTART,
    })
}

fn cmd_show(engine: &Engine, id: TaskId, json: bool) -> Result<i32> {
    let task = engine.task(id)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&task).context("serialize task")?
        );
    } else {
        print_summary(&task);
        println!();
        println!("{}", task.output);
    }
    Ok(exit_codes::OK)
}

fn cmd_history(engine: &Engine, limit: usize) -> Result<i32> {
    for entry in engine.history(limit)? {
        println!(
            "{}  {:<10} {:>6}  {}",
            entry.id,
            entry.status.label(),
            format!("{}s", entry.duration),
            first_line(&entry.goal)
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_cancel(engine: &Engine, id: TaskId) -> Result<i32> {
    let task = engine.cancel(id)?;
    println!("task {} {}", task.id, task.status);
    Ok(exit_codes::OK)
}

fn cmd_logs(engine: &Engine, id: TaskId, file: Option<&str>) -> Result<i32> {
    let Some(file) = file else {
        for entry in engine.task_logs(id)? {
            println!("{:>6}  {}", entry.bytes, entry.filename);
        }
        return Ok(exit_codes::OK);
    };
    match engine.task_log(id, file)? {
        Some(body) => {
            print!("{body}");
            Ok(exit_codes::OK)
        }
        None => bail!("no log artifact {file} for task {id}"),
    }
}

fn print_summary(task: &Task) {
    println!("task:    {}", task.id);
    println!("goal:    {}", first_line(&task.goal));
    println!("status:  {}", task.status);
    println!("steps:   {}", task.step);
    if let Some(secs) = task.duration {
        println!("elapsed: {secs}s");
    }
    if let Some(reason) = &task.failure_reason {
        println!("reason:  {reason}");
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["prime", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_run_joins_words() {
        let cli = Cli::parse_from(["prime", "run", "print", "hello"]);
        match cli.command {
            Command::Run { goal } => assert_eq!(goal.join(" "), "print hello"),
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_show_task_id() {
        let cli = Cli::parse_from(["prime", "--data-dir", "/tmp/p", "show", "100000001"]);
        assert_eq!(cli.data_dir, PathBuf::from("/tmp/p"));
        assert!(matches!(
            cli.command,
            Command::Show { id: TaskId(100_000_001), json: false }
        ));
    }

    #[test]
    fn run_requires_a_goal() {
        assert!(Cli::try_parse_from(["prime", "run"]).is_err());
    }
}
