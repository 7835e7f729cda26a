//! Supervised command execution: run once, retry once, then record.
//!
//! A failed first attempt is retried once before anything reaches the
//! tracker, so a single flaky run never counts toward the failure streak.
//! Per-attempt timeouts and spawn errors end the run right away; they are
//! recorded as failures with a tagged context and are not retried.

use std::{
    fmt, io,
    io::Read,
    process::{Child, Command, ExitStatus, Stdio},
    sync::mpsc::{self, RecvTimeoutError},
    thread,
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::tracker::{CommandFailureTracker, FailureLimitExceeded};

/// Per-attempt timeout unless configured otherwise.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the runner sleeps between checks on a running child.
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Why a single attempt produced no exit status.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("failed to spawn: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to wait for process: {0}")]
    Wait(#[source] io::Error),
}

/// A command to run, either through the shell or as an argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Run with `sh -c`.
    Shell(String),
    /// Run a program directly with arguments; no shell involved.
    Direct { program: String, args: Vec<String> },
}

impl Invocation {
    /// Builds an invocation from command text.
    ///
    /// Without `shell`, the text is split on whitespace; there is no quoting.
    pub fn from_text(text: &str, shell: bool) -> Self {
        if shell {
            return Self::Shell(text.to_string());
        }
        let mut words = text.split_whitespace().map(String::from);
        Self::Direct {
            program: words.next().unwrap_or_default(),
            args: words.collect(),
        }
    }

    /// Builds a direct invocation from an argument vector.
    pub fn from_argv(argv: &[String]) -> Self {
        match argv.split_first() {
            Some((program, args)) => Self::Direct {
                program: program.clone(),
                args: args.to_vec(),
            },
            None => Self::Direct {
                program: String::new(),
                args: Vec::new(),
            },
        }
    }

    fn to_command(&self) -> io::Result<Command> {
        match self {
            Self::Shell(text) => {
                let mut command = Command::new("sh");
                command.arg("-c").arg(text);
                Ok(command)
            }
            Self::Direct { program, .. } if program.is_empty() => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty command",
            )),
            Self::Direct { program, args } => {
                let mut command = Command::new(program);
                command.args(args);
                Ok(command)
            }
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell(text) => f.write_str(text),
            Self::Direct { program, args } => {
                f.write_str(program)?;
                for arg in args {
                    write!(f, " {arg}")?;
                }
                Ok(())
            }
        }
    }
}

/// What a finished process left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub success: bool,
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a single attempt of an invocation.
pub trait Runner: Send + Sync {
    fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<ProcessOutput, AttemptError>;
}

/// Runs invocations as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<ProcessOutput, AttemptError> {
        let mut command = invocation.to_command().map_err(AttemptError::Spawn)?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so a timeout also reaches anything the command
        // left running in the background.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);

        let mut child = command.spawn().map_err(AttemptError::Spawn)?;
        // Drain both pipes so a chatty child can't block on a full buffer.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    kill_group(&child);
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(AttemptError::Timeout(timeout));
                }
                Ok(None) => thread::sleep(WAIT_SLICE),
                Err(e) => {
                    kill_group(&child);
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(AttemptError::Wait(e));
                }
            }
        };

        // The pipes stay open while a background process still holds them,
        // so reading them is bounded by the same deadline.
        let (Some(stdout), Some(stderr)) = (collect(&stdout, deadline), collect(&stderr, deadline)) else {
            kill_group(&child);
            return Err(AttemptError::Timeout(timeout));
        };
        Ok(output_of(status, stdout, stderr))
    }
}

/// Reads `pipe` to the end on its own thread; the bytes arrive on the channel.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        let _ = tx.send(buf);
    });
    rx
}

/// The drained bytes, or `None` if the pipe is still open at `deadline`.
fn collect(rx: &mpsc::Receiver<Vec<u8>>, deadline: Instant) -> Option<Vec<u8>> {
    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(buf) => Some(buf),
        Err(RecvTimeoutError::Disconnected) => Some(Vec::new()),
        Err(RecvTimeoutError::Timeout) => None,
    }
}

/// Kills the child's whole process group.
#[cfg(unix)]
fn kill_group(child: &Child) {
    let status = Command::new("sh")
        .arg("-c")
        .arg(r#"kill -KILL "-$1""#)
        .arg("steward-kill")
        .arg(child.id().to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = status {
        tracing::debug!(pid = child.id(), error = %e, "could not kill process group");
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

fn output_of(status: ExitStatus, stdout: Vec<u8>, stderr: Vec<u8>) -> ProcessOutput {
    ProcessOutput {
        success: status.success(),
        code: status.code(),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    }
}

/// What the caller of [`SupervisedExecutor::run`] gets back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum RunOutcome {
    /// Exit status zero. `stderr` may still hold output.
    Succeeded { stdout: String, stderr: String },
    /// The command failed terminally; the failure has been recorded.
    Failed { diagnostic: String },
}

enum Attempt {
    Succeeded(ProcessOutput),
    Failed(ProcessOutput),
    Aborted(AttemptError),
}

/// Runs commands with a one-shot retry and reports outcomes to a tracker.
pub struct SupervisedExecutor<R = SystemRunner> {
    runner: R,
}

impl Default for SupervisedExecutor {
    fn default() -> Self {
        Self::new(SystemRunner)
    }
}

impl<R: Runner> SupervisedExecutor<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    /// Runs `invocation`, retrying once on a non-zero exit.
    ///
    /// Returns [`RunOutcome::Failed`] for an ordinary terminal failure, and
    /// propagates [`FailureLimitExceeded`] when that failure escalates.
    pub fn run(
        &self,
        tracker: &CommandFailureTracker,
        invocation: &Invocation,
        context: &str,
        timeout: Duration,
    ) -> Result<RunOutcome, FailureLimitExceeded> {
        let command = invocation.to_string();

        let (failure_context, diagnostic) = match self.attempt(invocation, timeout) {
            Attempt::Succeeded(output) => return Ok(succeed(tracker, &command, output)),
            Attempt::Aborted(e) => aborted(context, &e),
            Attempt::Failed(first) => {
                tracing::debug!(command = %command, code = ?first.code, "first attempt failed; retrying");
                match self.attempt(invocation, timeout) {
                    Attempt::Succeeded(output) => return Ok(succeed(tracker, &command, output)),
                    Attempt::Failed(second) => (context.to_string(), failed_twice(&second)),
                    Attempt::Aborted(e) => aborted(context, &e),
                }
            }
        };

        tracker.record_failure(&command, &failure_context)?;
        Ok(RunOutcome::Failed { diagnostic })
    }

    fn attempt(&self, invocation: &Invocation, timeout: Duration) -> Attempt {
        match self.runner.run(invocation, timeout) {
            Ok(output) if output.success => Attempt::Succeeded(output),
            Ok(output) => Attempt::Failed(output),
            Err(e) => Attempt::Aborted(e),
        }
    }
}

fn succeed(tracker: &CommandFailureTracker, command: &str, output: ProcessOutput) -> RunOutcome {
    tracker.record_success(command);
    RunOutcome::Succeeded {
        stdout: output.stdout,
        stderr: output.stderr,
    }
}

/// Context and diagnostic for an attempt that never produced an exit status.
fn aborted(context: &str, error: &AttemptError) -> (String, String) {
    let tag = match error {
        AttemptError::Timeout(_) => "timeout",
        AttemptError::Spawn(_) | AttemptError::Wait(_) => "error",
    };
    let diagnostic = format!("[{tag}] command {error}");
    let context = if context.is_empty() {
        diagnostic.clone()
    } else {
        format!("{context} | {diagnostic}")
    };
    (context, diagnostic)
}

fn failed_twice(output: &ProcessOutput) -> String {
    let status = output
        .code
        .map_or_else(|| "terminated by signal".to_string(), |c| format!("exit status {c}"));
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        format!("command failed twice ({status})")
    } else {
        format!("command failed twice ({status}): {stderr}")
    }
}
