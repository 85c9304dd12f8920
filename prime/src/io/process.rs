//! Helpers for running child processes with timeouts, cancellation and
//! bounded output.

use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Poll interval while waiting on a child or sleeping.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// How long output readers may keep draining once the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Shared cancellation flag for one task.
///
/// Cloning shares the flag. Subprocess waits and `wait()` sleeps poll it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless cancelled first. Returns `false` when cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(POLL_SLICE.min(deadline - now));
        }
    }
}

/// How a child run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub termination: Termination,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
}

impl CommandOutput {
    pub fn exit_code(&self) -> Option<i32> {
        match self.termination {
            Termination::Exited(status) => status.code(),
            Termination::TimedOut | Termination::Cancelled => None,
        }
    }

    pub fn truncated(&self) -> bool {
        self.stdout_truncated > 0 || self.stderr_truncated > 0
    }

    pub fn stdout_truncated_notice(&self) -> String {
        if self.stdout_truncated > 0 {
            format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated)
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self) -> String {
        if self.stderr_truncated > 0 {
            format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated)
        } else {
            String::new()
        }
    }

    /// stdout followed by stderr, separated by a newline when both are present,
    /// then a notice for each stream that lost bytes to the capture limit.
    pub fn combined(&self) -> String {
        let stdout = String::from_utf8_lossy(&self.stdout);
        let stderr = String::from_utf8_lossy(&self.stderr);
        let mut text = match (stdout.is_empty(), stderr.is_empty()) {
            (_, true) => stdout.into_owned(),
            (true, false) => stderr.into_owned(),
            (false, false) => format!("{stdout}\n{stderr}"),
        };
        text.push_str(&self.stdout_truncated_notice());
        text.push_str(&self.stderr_truncated_notice());
        text
    }
}

/// Bytes kept from one stream plus the count of bytes dropped past the limit.
#[derive(Debug, Default)]
struct Capture {
    kept: Vec<u8>,
    dropped: usize,
}

type SharedCapture = Arc<Mutex<Capture>>;

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// The child is placed in its own process group so a timeout or cancellation
/// kills everything it spawned. Output is read concurrently while the child
/// runs; `output_limit_bytes` bounds what is kept in memory per stream (bytes
/// beyond this are discarded while still draining the pipe).
///
/// Background processes inherit the output pipes. Once the child exits they
/// get [`DRAIN_GRACE`] to release them before the group is killed, and readers
/// still blocked after a second grace are abandoned with what they captured.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (done_tx, done_rx) = mpsc::channel();
    let stdout_capture = spawn_reader(stdout, output_limit_bytes, done_tx.clone());
    let stderr_capture = spawn_reader(stderr, output_limit_bytes, done_tx);

    let pgid = child.id();
    let termination = wait_or_kill(&mut child, timeout, cancel)?;

    let mut open = drain_readers(&done_rx, 2, Instant::now() + DRAIN_GRACE)?;
    if open > 0 && matches!(termination, Termination::Exited(_)) {
        warn!(open, "background processes hold the output pipes, killing process group");
        signal_group(pgid);
        open = drain_readers(&done_rx, open, Instant::now() + DRAIN_GRACE)?;
    }
    if open > 0 {
        warn!(open, "abandoning output readers that never reached end of stream");
    }

    let (stdout, stdout_truncated) = take_capture(&stdout_capture);
    let (stderr, stderr_truncated) = take_capture(&stderr_capture);

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(?termination, "command finished");
    Ok(CommandOutput {
        termination,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
    })
}

fn wait_or_kill(child: &mut Child, timeout: Duration, cancel: &CancelToken) -> Result<Termination> {
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            warn!("command cancelled, killing process group");
            kill_group(child)?;
            return Ok(Termination::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing process group"
            );
            kill_group(child)?;
            return Ok(Termination::TimedOut);
        }
        let slice = POLL_SLICE.min(deadline - now);
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            return Ok(Termination::Exited(status));
        }
    }
}

/// Kill the child's whole process group, falling back to the child alone.
fn kill_group(child: &mut Child) -> Result<()> {
    if !signal_group(child.id()) {
        debug!("process group kill failed, killing child directly");
        if let Err(err) = child.kill() {
            warn!(err = %err, "kill child");
        }
    }
    child.wait().context("wait command after kill")?;
    Ok(())
}

/// SIGKILL every process in group `pgid`. Returns whether `kill` succeeded.
fn signal_group(pgid: u32) -> bool {
    Command::new("kill")
        .args(["-9", "--", &format!("-{pgid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    limit: usize,
    done: mpsc::Sender<Result<()>>,
) -> SharedCapture {
    let capture = SharedCapture::default();
    let sink = capture.clone();
    thread::spawn(move || {
        // The receiver is gone once the command was abandoned.
        let _ = done.send(read_stream_limited(reader, limit, &sink));
    });
    capture
}

/// Wait until `open` readers finish or `until` passes. Returns how many are still open.
fn drain_readers(
    done: &mpsc::Receiver<Result<()>>,
    mut open: usize,
    until: Instant,
) -> Result<usize> {
    while open > 0 {
        match done.recv_timeout(until.saturating_duration_since(Instant::now())) {
            Ok(result) => {
                result?;
                open -= 1;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => break,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("output reader thread panicked"));
            }
        }
    }
    Ok(open)
}

fn take_capture(capture: &SharedCapture) -> (Vec<u8>, usize) {
    let mut guard = capture.lock().unwrap_or_else(PoisonError::into_inner);
    let taken = std::mem::take(&mut *guard);
    (taken.kept, taken.dropped)
}

fn read_stream_limited<R: Read>(
    mut reader: R,
    limit: usize,
    capture: &Mutex<Capture>,
) -> Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok(());
        }
        let mut capture = capture.lock().unwrap_or_else(PoisonError::into_inner);
        let keep = n.min(limit.saturating_sub(capture.kept.len()));
        capture.kept.extend_from_slice(&chunk[..keep]);
        capture.dropped += n - keep;
    }
}
