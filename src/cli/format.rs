//! Output formatting for CLI display.

use std::fmt::Write;

use steward::{
    executor::{Invocation, RunOutcome},
    tracker::FailureLimitExceeded,
};

/// One line per command run in a batch.
pub(super) fn format_outcome(invocation: &Invocation, outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Succeeded { .. } => format!("ok      {invocation}"),
        RunOutcome::Failed { diagnostic } => format!("failed  {invocation}: {diagnostic}"),
    }
}

/// The full streak behind an escalation, oldest failure first.
pub(super) fn format_escalation(exceeded: &FailureLimitExceeded) -> String {
    let mut out = format!(
        "{} consecutive command failures (limit {}); stopping.\nFailed commands:",
        exceeded.count, exceeded.limit
    );
    for (i, command) in exceeded.commands.iter().enumerate() {
        let _ = write!(out, "\n  {}. {command}", i + 1);
    }
    let context = if exceeded.last_context.is_empty() {
        "(none)"
    } else {
        exceeded.last_context.as_str()
    };
    let _ = write!(out, "\nLast failure context: {context}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_outcomes() {
        let invocation = Invocation::Shell("make test".into());
        let ok = RunOutcome::Succeeded {
            stdout: "fine".into(),
            stderr: String::new(),
        };
        let failed = RunOutcome::Failed {
            diagnostic: "command failed twice (exit status 2)".into(),
        };

        assert_eq!(format_outcome(&invocation, &ok), "ok      make test");
        assert_eq!(
            format_outcome(&invocation, &failed),
            "failed  make test: command failed twice (exit status 2)"
        );
    }

    #[test]
    fn format_escalation_lists_history() {
        let exceeded = FailureLimitExceeded {
            count: 3,
            limit: 3,
            commands: vec!["cmd1".into(), "cmd2".into(), "cmd3".into()],
            last_context: String::new(),
        };

        assert_eq!(
            format_escalation(&exceeded),
            "3 consecutive command failures (limit 3); stopping.\n\
             Failed commands:\n  1. cmd1\n  2. cmd2\n  3. cmd3\n\
             Last failure context: (none)"
        );
    }
}
