//! A supervision session: one tracker and one enforcer for one logical run.
//!
//! Sessions are independent. Two sessions running commands side by side keep
//! separate failure streaks and separate task budgets; only the journal file
//! may be shared.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use uuid::Uuid;

use crate::{
    config::Config,
    executor::{DEFAULT_ATTEMPT_TIMEOUT, Invocation, RunOutcome, Runner, SupervisedExecutor, SystemRunner},
    journal::{Journal, MarkdownJournal},
    timeout::{CancelToken, SupervisionError, TaskStatus, TimeoutEnforcer},
    tracker::{CommandFailureTracker, FailureLimitExceeded, TrackerStatus},
};

/// Everything a status query reports about a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session: Uuid,
    pub tracker: TrackerStatus,
    /// The task under supervision, if any.
    pub task: Option<TaskStatus>,
}

pub struct Session<R = SystemRunner> {
    id: Uuid,
    tracker: CommandFailureTracker,
    enforcer: TimeoutEnforcer,
    executor: SupervisedExecutor<R>,
    attempt_timeout: Duration,
}

impl Session {
    /// Builds a session from configuration, journaling to `journal_path`.
    pub fn from_config(config: &Config, journal_path: impl Into<std::path::PathBuf>) -> Self {
        let journal: Arc<dyn Journal> = Arc::new(MarkdownJournal::new(journal_path));
        let id = Uuid::new_v4();
        let tracker = CommandFailureTracker::new(journal)
            .with_limit(config.failure_limit)
            .with_section(config.recovery_section.as_str())
            .with_source_label(format!("steward/{}", short_id(id)));
        let enforcer = TimeoutEnforcer::default().with_poll_interval(config.poll_interval());

        Self {
            id,
            tracker,
            enforcer,
            executor: SupervisedExecutor::new(SystemRunner),
            attempt_timeout: config.attempt_timeout(),
        }
    }
}

impl<R: Runner> Session<R> {
    /// Assembles a session from parts.
    pub fn new(tracker: CommandFailureTracker, enforcer: TimeoutEnforcer, executor: SupervisedExecutor<R>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tracker,
            enforcer,
            executor,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tracker(&self) -> &CommandFailureTracker {
        &self.tracker
    }

    pub fn enforcer(&self) -> &TimeoutEnforcer {
        &self.enforcer
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Runs one command with the session's per-attempt timeout.
    pub fn run(&self, invocation: &Invocation, context: &str) -> Result<RunOutcome, FailureLimitExceeded> {
        self.run_with_timeout(invocation, context, self.attempt_timeout)
    }

    /// Runs one command with an explicit per-attempt timeout.
    pub fn run_with_timeout(
        &self,
        invocation: &Invocation,
        context: &str,
        timeout: Duration,
    ) -> Result<RunOutcome, FailureLimitExceeded> {
        self.executor.run(&self.tracker, invocation, context, timeout)
    }

    /// Runs commands in order, stopping early when `token` is cancelled.
    ///
    /// Escalation stops the sequence and is returned as the error.
    pub fn run_all(
        &self,
        invocations: &[Invocation],
        context: &str,
        token: &CancelToken,
    ) -> Result<Vec<(Invocation, RunOutcome)>, FailureLimitExceeded> {
        let mut outcomes = Vec::with_capacity(invocations.len());
        for invocation in invocations {
            if token.is_cancelled() {
                tracing::info!(session = %self.id, remaining = invocations.len() - outcomes.len(), "sequence cancelled");
                break;
            }
            let outcome = self.run(invocation, context)?;
            outcomes.push((invocation.clone(), outcome));
        }
        Ok(outcomes)
    }

    /// Consistent snapshots of the tracker and the supervised task.
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session: self.id,
            tracker: self.tracker.status(),
            task: self.enforcer.status(),
        }
    }
}

impl<R: Runner + 'static> Session<R> {
    /// Runs `work` against this session on a worker thread under a
    /// whole-task `budget`.
    ///
    /// See [`TimeoutEnforcer::execute_with_timeout`]: on timeout the worker
    /// keeps its reference to the session and may finish in the background.
    pub fn supervise<T, E, F>(self: &Arc<Self>, name: &str, budget: Duration, work: F) -> Result<T, SupervisionError<E>>
    where
        F: FnOnce(&Self, CancelToken) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let session = Arc::clone(self);
        self.enforcer
            .execute_with_timeout(name, budget, move |token| work(session.as_ref(), token))
    }
}

fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use tempfile::TempDir;

    use crate::journal::Document;

    fn session_in(dir: &TempDir) -> Session {
        let config = Config {
            poll_interval_ms: 10,
            attempt_timeout_secs: 5,
            ..Config::default()
        };
        Session::from_config(&config, dir.path().join("journal.md"))
    }

    fn shell(text: &str) -> Invocation {
        Invocation::from_text(text, true)
    }

    #[test]
    fn escalation_and_recovery_reach_the_journal() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);

        for cmd in ["exit 1", "exit 2"] {
            assert!(matches!(session.run(&shell(cmd), "ci").unwrap(), RunOutcome::Failed { .. }));
        }
        let err = session.run(&shell("exit 3"), "ci").unwrap_err();
        assert_eq!(err.commands, vec!["exit 1", "exit 2", "exit 3"]);
        assert!(session.status().tracker.limit_reached);

        session.run(&shell("true"), "").unwrap();

        let text = fs::read_to_string(dir.path().join("journal.md")).unwrap();
        let doc = Document::parse(&text);
        assert_eq!(doc.sections(), vec!["Command Recovery"]);
        let body = doc.section("Command Recovery").unwrap();
        for cmd in ["`exit 1`", "`exit 2`", "`exit 3`", "`true`"] {
            assert!(body.contains(cmd), "missing {cmd}");
        }
        assert!(body.contains(&format!("[steward/{}] recovery", short_id(session.id()))));
        assert_eq!(session.status().tracker.consecutive_failures, 0);
    }

    #[test]
    fn commented_scripts_keep_the_journal_structure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.md");
        fs::write(&path, "# Goals\n\nShip it.\n").unwrap();
        let session = session_in(&dir);
        let script = shell("set -e\n# build step\nexit 1");

        session.run(&script, "").unwrap();
        session.run(&script, "").unwrap();
        session.run(&script, "nightly\n# not a heading").unwrap_err();
        session.run(&shell("true"), "").unwrap();

        let doc = Document::parse(&fs::read_to_string(&path).unwrap());
        assert_eq!(doc.sections(), vec!["Goals", "Command Recovery"]);
        assert_eq!(doc.section("Goals"), Some("\nShip it.\n\n"));
        let body = doc.section("Command Recovery").unwrap();
        assert_eq!(body.matches("   # build step\n").count(), 3);
        assert!(body.contains("nightly\n\\# not a heading\n"));
        assert!(body.contains("Recovered with: `true`"));
    }

    #[test]
    fn sessions_do_not_share_streaks() {
        let dir = TempDir::new().unwrap();
        let first = session_in(&dir);
        let second = session_in(&dir);

        first.run(&shell("exit 1"), "").unwrap();
        first.run(&shell("exit 1"), "").unwrap();

        assert_eq!(first.tracker().consecutive_failures(), 2);
        assert_eq!(second.tracker().consecutive_failures(), 0);
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn run_all_stops_at_escalation() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        let commands: Vec<_> = ["true", "false", "false", "false", "echo never"]
            .into_iter()
            .map(shell)
            .collect();

        let err = session
            .run_all(&commands, "", &CancelToken::default())
            .unwrap_err();
        assert_eq!(err.count, 3);
        assert_eq!(session.tracker().failed_commands(), vec!["false"; 3]);
    }

    #[test]
    fn run_all_honors_cancellation() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        let token = CancelToken::default();
        token.cancel();

        let outcomes = session.run_all(&[shell("true")], "", &token).unwrap();
        assert!(outcomes.is_empty());
    }

    #[test]
    fn supervised_work_reports_task_status_while_running() {
        let dir = TempDir::new().unwrap();
        let session = Arc::new(session_in(&dir));

        let seen = session
            .supervise("status-check", Duration::from_secs(5), |s, _token| {
                Ok::<_, String>(s.status().task.map(|t| t.task))
            })
            .unwrap();

        assert_eq!(seen.as_deref(), Some("status-check"));
        assert!(session.status().task.is_none());
    }

    #[test]
    fn supervised_batch_times_out() {
        let dir = TempDir::new().unwrap();
        let session = Arc::new(session_in(&dir));
        let commands = vec![shell("sleep 1"), shell("sleep 1"), shell("sleep 1")];

        let err = session
            .supervise("batch", Duration::from_millis(300), move |s, token| {
                s.run_all(&commands, "", &token)
            })
            .unwrap_err();

        assert!(matches!(err, SupervisionError::Timeout { ref task, .. } if task == "batch"));
    }
}
