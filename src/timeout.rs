//! Wall-clock supervision of long-running tasks.
//!
//! A [`TimeoutEnforcer`] watches one task at a time. Polling
//! [`TimeoutEnforcer::check_timeout`] walks a small state machine:
//!
//! ```text
//! Idle ──start_task──▶ Monitoring ──80% of budget──▶ (warning, once)
//!                          │
//!                          └──budget spent──▶ Enforced (once; a notice instead when opted out)
//! ```
//!
//! Enforcement is advisory. [`TimeoutEnforcer::execute_with_timeout`] returns
//! a timeout to its caller and trips the task's [`CancelToken`], but a task
//! that never looks at the token keeps running on its worker thread until it
//! finishes on its own.

use std::{
    any::Any,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    thread,
    time::{Duration, Instant},
};

use serde::Serialize;

/// How often `execute_with_timeout` re-checks the budget.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Share of the budget after which the one-time warning fires.
const WARNING_FRACTION: f64 = 0.8;

/// Errors surfaced by [`TimeoutEnforcer::execute_with_timeout`].
#[derive(Debug, thiserror::Error)]
pub enum SupervisionError<E> {
    /// The whole-task budget ran out. The worker may still be running.
    #[error("task '{task}' exceeded its supervision budget of {}s", .budget.as_secs_f64())]
    Timeout { task: String, budget: Duration },

    /// The task finished first and reported an error.
    #[error("task failed: {0}")]
    Task(E),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Source of the current instant. Swappable so tests can simulate elapsed time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The real monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Cooperative cancellation flag handed to supervised tasks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of one [`TimeoutEnforcer::check_timeout`] poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutSignal {
    /// Nothing new to report.
    Quiet,
    /// The warning threshold was crossed. Fires once per task.
    Warning(String),
    /// The budget was spent but enforcement is opted out. Fires once per task.
    Breach(String),
    /// The budget was spent; the caller should stop waiting. Fires once per task.
    Enforce(String),
}

impl TimeoutSignal {
    pub fn should_enforce(&self) -> bool {
        matches!(self, Self::Enforce(_))
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Quiet => None,
            Self::Warning(m) | Self::Breach(m) | Self::Enforce(m) => Some(m),
        }
    }
}

/// Snapshot of the monitored task, for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub task: String,
    pub elapsed_secs: f64,
    pub timeout_secs: f64,
    pub warning_issued: bool,
    pub enforced: bool,
    pub opt_out: bool,
}

#[derive(Debug, Default)]
struct TimeoutState {
    task: Option<MonitoredTask>,
    opt_out: bool,
}

#[derive(Debug)]
struct MonitoredTask {
    name: String,
    started: Instant,
    timeout: Duration,
    warning_issued: bool,
    enforced: bool,
}

impl MonitoredTask {
    fn warning_threshold(&self) -> Duration {
        self.timeout.mul_f64(WARNING_FRACTION)
    }
}

/// Watches one task generation at a time against a wall-clock budget.
pub struct TimeoutEnforcer {
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    state: Mutex<TimeoutState>,
}

impl Default for TimeoutEnforcer {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl TimeoutEnforcer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            poll_interval: DEFAULT_POLL_INTERVAL,
            state: Mutex::new(TimeoutState::default()),
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Opts the current and following tasks out of enforcement.
    ///
    /// An opted-out task still gets its warning and a one-time breach notice.
    pub fn set_opt_out(&self, opt_out: bool) {
        self.lock().opt_out = opt_out;
    }

    /// Starts monitoring `name`, replacing any task already being watched.
    pub fn start_task(&self, name: &str, timeout: Duration) {
        let mut state = self.lock();
        state.task = Some(MonitoredTask {
            name: name.to_string(),
            started: self.clock.now(),
            timeout,
            warning_issued: false,
            enforced: false,
        });
        tracing::debug!(task = name, budget_secs = timeout.as_secs_f64(), "monitoring task");
    }

    /// Stops monitoring. Does nothing when idle.
    pub fn stop_task(&self) {
        if let Some(task) = self.lock().task.take() {
            tracing::debug!(task = %task.name, "stopped monitoring task");
        }
    }

    /// Polls the monitored task's budget.
    ///
    /// Each of warning, breach and enforcement is reported at most once per
    /// task; every other poll is [`TimeoutSignal::Quiet`].
    pub fn check_timeout(&self) -> TimeoutSignal {
        let now = self.clock.now();
        let mut state = self.lock();
        let opt_out = state.opt_out;
        let Some(task) = state.task.as_mut() else {
            return TimeoutSignal::Quiet;
        };

        let elapsed = now.saturating_duration_since(task.started);
        let budget = task.timeout.as_secs_f64();

        if elapsed >= task.timeout {
            if task.enforced {
                return TimeoutSignal::Quiet;
            }
            task.enforced = true;

            if opt_out {
                let message = format!(
                    "task '{}' exceeded its {budget}s budget after {:.1}s; \
                     continuing because timeout enforcement is opted out",
                    task.name,
                    elapsed.as_secs_f64()
                );
                tracing::warn!(task = %task.name, budget_secs = budget, "timeout breached (opted out)");
                return TimeoutSignal::Breach(message);
            }

            let message = format!(
                "task '{}' exceeded its {budget}s budget after {:.1}s; enforcing timeout",
                task.name,
                elapsed.as_secs_f64()
            );
            tracing::error!(task = %task.name, budget_secs = budget, "timeout enforced");
            return TimeoutSignal::Enforce(message);
        }

        if elapsed >= task.warning_threshold() && !task.warning_issued {
            task.warning_issued = true;
            let remaining = task.timeout.saturating_sub(elapsed);
            let message = format!(
                "task '{}' is approaching its {budget}s budget: {:.1}s remaining",
                task.name,
                remaining.as_secs_f64()
            );
            tracing::warn!(task = %task.name, remaining_secs = remaining.as_secs_f64(), "timeout approaching");
            return TimeoutSignal::Warning(message);
        }

        TimeoutSignal::Quiet
    }

    /// The monitored task, if any.
    pub fn status(&self) -> Option<TaskStatus> {
        let now = self.clock.now();
        let state = self.lock();
        state.task.as_ref().map(|task| TaskStatus {
            task: task.name.clone(),
            elapsed_secs: now.saturating_duration_since(task.started).as_secs_f64(),
            timeout_secs: task.timeout.as_secs_f64(),
            warning_issued: task.warning_issued,
            enforced: task.enforced,
            opt_out: state.opt_out,
        })
    }

    /// Runs `task` on a worker thread under a `timeout` budget.
    ///
    /// The calling thread waits for the worker in `poll_interval` slices and
    /// checks the budget between slices. On enforcement the task's token is
    /// cancelled and [`SupervisionError::Timeout`] is returned immediately;
    /// the worker is left to finish (or notice the token) on its own.
    /// Monitoring stops when this returns, however it returns.
    pub fn execute_with_timeout<T, E, F>(
        &self,
        name: &str,
        timeout: Duration,
        task: F,
    ) -> Result<T, SupervisionError<E>>
    where
        F: FnOnce(CancelToken) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let token = CancelToken::default();
        let (tx, rx) = mpsc::channel();

        self.start_task(name, timeout);
        let _monitoring = StopOnDrop(self);

        let worker_token = token.clone();
        thread::Builder::new()
            .name("steward-worker".to_string())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| task(worker_token)));
                // Nobody is listening once the budget was enforced.
                let _ = tx.send(outcome);
            })
            .map_err(SupervisionError::Spawn)?;

        loop {
            match rx.recv_timeout(self.poll_interval) {
                Ok(Ok(result)) => return result.map_err(SupervisionError::Task),
                Ok(Err(payload)) => return Err(SupervisionError::Panicked(panic_message(&*payload))),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SupervisionError::Panicked(
                        "worker exited without a result".to_string(),
                    ));
                }
                Err(RecvTimeoutError::Timeout) => {}
            }

            if self.check_timeout().should_enforce() {
                token.cancel();
                return Err(SupervisionError::Timeout {
                    task: name.to_string(),
                    budget: timeout,
                });
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimeoutState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Stops monitoring when dropped.
struct StopOnDrop<'a>(&'a TimeoutEnforcer);

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        self.0.stop_task();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
