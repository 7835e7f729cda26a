//! Consecutive-failure tracking with escalation and recovery notes.
//!
//! The tracker counts terminal command failures. Once the count reaches the
//! limit it escalates with [`FailureLimitExceeded`] on every further failure
//! until a success resets it. When a success ends an escalated streak, one
//! recovery entry summarizing the streak is appended to the journal.

use std::{
    fmt::Write,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::Serialize;

use crate::journal::{Journal, JournalEntry};

/// Consecutive failures that trigger escalation unless configured otherwise.
pub const DEFAULT_FAILURE_LIMIT: u32 = 3;

/// Journal section that receives recovery entries unless configured otherwise.
pub const DEFAULT_RECOVERY_SECTION: &str = "Command Recovery";

/// The consecutive-failure limit was reached.
///
/// Carries the whole streak so the caller can report it without a second
/// look at the tracker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "{count} consecutive command failures (limit {limit}): [{}]; last failure context: {}",
    .commands.join(", "),
    display_context(.last_context)
)]
pub struct FailureLimitExceeded {
    pub count: u32,
    pub limit: u32,
    /// Failed commands in the order they failed.
    pub commands: Vec<String>,
    pub last_context: String,
}

/// One recorded terminal failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub command: String,
    pub context: String,
}

/// Snapshot of the tracker for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerStatus {
    pub consecutive_failures: u32,
    pub failed_commands: Vec<String>,
    pub last_failure_context: String,
    pub limit_reached: bool,
    pub limit: u32,
}

#[derive(Debug, Clone, Default)]
struct TrackerState {
    consecutive_failures: u32,
    failures: Vec<FailureRecord>,
    last_failure_context: String,
    limit_reached: bool,
}

/// Counts consecutive failures and writes a recovery note when a streak ends.
///
/// All state sits behind one mutex, so concurrent `record_failure` and
/// `record_success` calls see each other's transitions atomically.
pub struct CommandFailureTracker {
    limit: u32,
    state: Mutex<TrackerState>,
    journal: Arc<dyn Journal>,
    section: String,
    source_label: String,
}

impl CommandFailureTracker {
    /// Creates an empty tracker that writes recovery notes to `journal`.
    pub fn new(journal: Arc<dyn Journal>) -> Self {
        Self {
            limit: DEFAULT_FAILURE_LIMIT,
            state: Mutex::new(TrackerState::default()),
            journal,
            section: DEFAULT_RECOVERY_SECTION.to_string(),
            source_label: "steward".to_string(),
        }
    }

    /// Sets the escalation limit. A limit of zero is treated as one.
    #[must_use]
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Sets the journal section recovery entries go under.
    #[must_use]
    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = section.into();
        self
    }

    /// Sets the source label stamped on recovery entries.
    #[must_use]
    pub fn with_source_label(mut self, label: impl Into<String>) -> Self {
        self.source_label = label.into();
        self
    }

    /// Records a terminal failure of `command`.
    ///
    /// Returns [`FailureLimitExceeded`] when this failure brings the streak to
    /// the limit or beyond. The failure is recorded either way.
    pub fn record_failure(&self, command: &str, context: &str) -> Result<(), FailureLimitExceeded> {
        let mut state = self.lock();
        state.consecutive_failures += 1;
        state.failures.push(FailureRecord {
            command: command.to_string(),
            context: context.to_string(),
        });
        state.last_failure_context = context.to_string();

        tracing::warn!(
            command,
            consecutive = state.consecutive_failures,
            limit = self.limit,
            "command failed"
        );

        if state.consecutive_failures < self.limit {
            return Ok(());
        }

        state.limit_reached = true;
        let exceeded = FailureLimitExceeded {
            count: state.consecutive_failures,
            limit: self.limit,
            commands: commands_of(&state.failures),
            last_context: state.last_failure_context.clone(),
        };
        drop(state);

        tracing::error!(
            count = exceeded.count,
            commands = ?exceeded.commands,
            "consecutive failure limit reached"
        );
        Err(exceeded)
    }

    /// Records a success of `command`, ending any failure streak.
    ///
    /// If the limit had been reached, a recovery entry is appended to the
    /// journal first. Journal errors are logged and otherwise ignored: the
    /// reset always happens.
    pub fn record_success(&self, command: &str) {
        let streak = {
            let mut state = self.lock();
            let previous = std::mem::take(&mut *state);
            previous.limit_reached.then_some(previous)
        };

        let Some(streak) = streak else {
            return;
        };

        let entry = JournalEntry::now(
            self.source_label.as_str(),
            "recovery",
            recovery_body(&streak, command),
        );
        match self
            .journal
            .append_under_section(&self.section, &entry.render())
        {
            Ok(()) => tracing::info!(
                command,
                recovered_from = streak.consecutive_failures,
                "failure streak ended; recovery note written"
            ),
            Err(e) => tracing::warn!(
                command,
                error = %e,
                "failure streak ended; could not write recovery note"
            ),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Failed commands of the current streak, oldest first.
    pub fn failed_commands(&self) -> Vec<String> {
        commands_of(&self.lock().failures)
    }

    /// Failure records of the current streak, oldest first.
    pub fn failures(&self) -> Vec<FailureRecord> {
        self.lock().failures.clone()
    }

    pub fn last_failure_context(&self) -> String {
        self.lock().last_failure_context.clone()
    }

    pub fn limit_reached(&self) -> bool {
        self.lock().limit_reached
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// A consistent snapshot of every field.
    pub fn status(&self) -> TrackerStatus {
        let state = self.lock();
        TrackerStatus {
            consecutive_failures: state.consecutive_failures,
            failed_commands: commands_of(&state.failures),
            last_failure_context: state.last_failure_context.clone(),
            limit_reached: state.limit_reached,
            limit: self.limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        // The state is plain data; a panic elsewhere can't leave it half-updated
        // in a way later calls can't handle.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn commands_of(failures: &[FailureRecord]) -> Vec<String> {
    failures.iter().map(|f| f.command.clone()).collect()
}

fn display_context(context: &str) -> &str {
    if context.is_empty() { "(none)" } else { context }
}

fn recovery_body(streak: &TrackerState, command: &str) -> String {
    let mut body = format!(
        "Recovered after {} consecutive failures.\n\nFailed commands:\n",
        streak.consecutive_failures
    );
    for (i, failure) in streak.failures.iter().enumerate() {
        let _ = write!(body, "{}.", i + 1);
        push_command(&mut body, &failure.command);
    }
    let _ = write!(
        body,
        "\nLast failure context: {}\n\nRecovered with:",
        display_context(&streak.last_failure_context)
    );
    push_command(&mut body, command);
    body
}

/// Inline code for a one-line command, an indented fenced block otherwise.
fn push_command(body: &mut String, command: &str) {
    if !command.contains('\n') {
        let _ = writeln!(body, " `{command}`");
        return;
    }
    body.push('\n');
    let _ = writeln!(body, "   ```sh");
    for line in command.lines() {
        let _ = writeln!(body, "   {line}");
    }
    let _ = writeln!(body, "   ```");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::thread;

    use crate::journal::{Document, JournalError, Result as JournalResult};

    /// Journal double that remembers every append.
    #[derive(Default)]
    pub(crate) struct RecordingJournal {
        pub(crate) appends: Mutex<Vec<(String, String)>>,
    }

    impl RecordingJournal {
        pub(crate) fn appends(&self) -> Vec<(String, String)> {
            self.appends.lock().unwrap().clone()
        }
    }

    impl Journal for RecordingJournal {
        fn append_under_section(&self, section: &str, entry: &str) -> JournalResult<()> {
            self.appends
                .lock()
                .unwrap()
                .push((section.to_string(), entry.to_string()));
            Ok(())
        }
    }

    struct FailingJournal;

    impl Journal for FailingJournal {
        fn append_under_section(&self, _section: &str, _entry: &str) -> JournalResult<()> {
            Err(JournalError::Io {
                path: "/nowhere/journal.md".into(),
                source: std::io::Error::other("disk full"),
            })
        }
    }

    fn tracker() -> (Arc<RecordingJournal>, CommandFailureTracker) {
        let journal = Arc::new(RecordingJournal::default());
        let tracker = CommandFailureTracker::new(journal.clone());
        (journal, tracker)
    }

    #[test]
    fn counts_failures_and_escalates_at_limit() {
        let (_journal, tracker) = tracker();

        for k in 1..=5u32 {
            let result = tracker.record_failure(&format!("cmd{k}"), "ctx");
            assert_eq!(tracker.consecutive_failures(), k);
            assert_eq!(tracker.failed_commands().len(), k as usize);
            assert_eq!(tracker.limit_reached(), k >= 3);
            assert_eq!(result.is_err(), k >= 3);
        }
    }

    #[test]
    fn limit_error_carries_history_and_context() {
        let (_journal, tracker) = tracker();
        tracker.record_failure("cmd1", "first").unwrap();
        tracker.record_failure("cmd2", "").unwrap();
        let err = tracker.record_failure("cmd3", "disk full").unwrap_err();

        assert_eq!(err.count, 3);
        assert_eq!(err.limit, 3);
        assert_eq!(err.commands, vec!["cmd1", "cmd2", "cmd3"]);
        assert_eq!(err.last_context, "disk full");

        let message = err.to_string();
        assert!(message.contains("cmd1, cmd2, cmd3"));
        assert!(message.contains("disk full"));
    }

    #[test]
    fn success_resets_every_field() {
        let (journal, tracker) = tracker();
        tracker.record_failure("cmd1", "ctx").unwrap();
        tracker.record_success("cmd2");

        assert_eq!(
            tracker.status(),
            TrackerStatus {
                consecutive_failures: 0,
                failed_commands: vec![],
                last_failure_context: String::new(),
                limit_reached: false,
                limit: 3,
            }
        );
        // Below the limit a success writes nothing.
        assert!(journal.appends().is_empty());
    }

    #[test]
    fn success_without_failures_is_a_no_op() {
        let (journal, tracker) = tracker();
        tracker.record_success("ls");
        tracker.record_success("ls");

        assert_eq!(tracker.consecutive_failures(), 0);
        assert!(!tracker.limit_reached());
        assert!(journal.appends().is_empty());
    }

    #[test]
    fn recovery_after_limit_writes_exactly_one_entry() {
        let (journal, tracker) = tracker();
        tracker.record_failure("cmd1", "a").unwrap();
        tracker.record_failure("cmd2", "b").unwrap();
        tracker.record_failure("cmd3", "c").unwrap_err();

        tracker.record_success("cmd4");
        tracker.record_success("cmd5");

        let appends = journal.appends();
        assert_eq!(appends.len(), 1);
        let (section, entry) = &appends[0];
        assert_eq!(section, DEFAULT_RECOVERY_SECTION);

        let positions: Vec<usize> = ["`cmd1`", "`cmd2`", "`cmd3`", "`cmd4`"]
            .iter()
            .map(|c| entry.find(c).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(entry.contains("Last failure context: c"));
        assert!(entry.contains("[steward] recovery"));
        assert!(!tracker.limit_reached());
    }

    #[test]
    fn journal_failure_does_not_block_reset() {
        let tracker = CommandFailureTracker::new(Arc::new(FailingJournal)).with_limit(1);
        tracker.record_failure("cmd1", "ctx").unwrap_err();

        tracker.record_success("cmd2");

        assert_eq!(tracker.consecutive_failures(), 0);
        assert!(tracker.failed_commands().is_empty());
        assert!(!tracker.limit_reached());
    }

    #[test]
    fn custom_section_and_label_are_used() {
        let journal = Arc::new(RecordingJournal::default());
        let tracker = CommandFailureTracker::new(journal.clone())
            .with_limit(1)
            .with_section("Lessons")
            .with_source_label("session-7");
        tracker.record_failure("make", "").unwrap_err();
        tracker.record_success("make");

        let appends = journal.appends();
        assert_eq!(appends[0].0, "Lessons");
        assert!(appends[0].1.contains("[session-7] recovery"));
        assert!(appends[0].1.contains("Last failure context: (none)"));
    }

    #[test]
    fn zero_limit_is_clamped_to_one() {
        let tracker = CommandFailureTracker::new(Arc::new(RecordingJournal::default())).with_limit(0);
        assert_eq!(tracker.limit(), 1);
        assert!(tracker.record_failure("cmd", "").is_err());
    }

    #[test]
    fn multi_line_commands_are_fenced() {
        let (journal, tracker) = tracker();
        let script = "set -e\n# build step\nexit 1";
        for _ in 0..3 {
            let _ = tracker.record_failure(script, "");
        }
        tracker.record_success("make");

        let appends = journal.appends();
        let entry = &appends[0].1;
        assert!(entry.contains("1.\n   ```sh\n   set -e\n   # build step\n   exit 1\n   ```\n"));
        assert!(entry.contains("Recovered with: `make`\n"));

        let mut doc = Document::default();
        doc.append_under_section(DEFAULT_RECOVERY_SECTION, entry);
        assert_eq!(doc.sections(), vec![DEFAULT_RECOVERY_SECTION]);
    }

    #[test]
    fn concurrent_failures_keep_state_consistent() {
        let (_journal, tracker) = tracker();
        let tracker = Arc::new(tracker);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    for i in 0..25 {
                        let _ = tracker.record_failure(&format!("t{t}-{i}"), "");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let status = tracker.status();
        assert_eq!(status.consecutive_failures, 200);
        assert_eq!(status.failed_commands.len(), 200);
        assert!(status.limit_reached);
    }

    #[test]
    fn interleaved_successes_journal_each_escalated_streak_once() {
        let (journal, tracker) = tracker();
        let tracker = Arc::new(tracker);
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let watcher = {
            let tracker = Arc::clone(&tracker);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while !done.load(std::sync::atomic::Ordering::Relaxed) {
                    let status = tracker.status();
                    assert_eq!(status.failed_commands.len(), status.consecutive_failures as usize);
                    assert_eq!(status.limit_reached, status.consecutive_failures >= status.limit);
                }
            })
        };

        let workers: Vec<_> = (0..4)
            .map(|t| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    let mut escalated = Vec::new();
                    for i in 0..200 {
                        if i % 5 == 4 {
                            tracker.record_success(&format!("ok{t}-{i}"));
                        } else {
                            let command = format!("t{t}-{i}");
                            if tracker.record_failure(&command, "").is_err() {
                                escalated.push(command);
                            }
                        }
                    }
                    escalated
                })
            })
            .collect();
        let escalated: Vec<String> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();
        done.store(true, std::sync::atomic::Ordering::Relaxed);
        watcher.join().unwrap();

        let entries: Vec<String> = journal.appends().into_iter().map(|(_, entry)| entry).collect();
        let open_streak = tracker.failed_commands();
        assert!(!escalated.is_empty());
        for command in &escalated {
            let needle = format!("`{command}`");
            let journaled = entries.iter().filter(|e| e.contains(&needle)).count();
            if open_streak.contains(command) {
                assert_eq!(journaled, 0, "{command} is still in the open streak");
            } else {
                assert_eq!(journaled, 1, "{command} journaled {journaled} times");
            }
        }
        for entry in &entries {
            assert_eq!(entry.matches("Recovered with: `ok").count(), 1);
        }
    }
}
