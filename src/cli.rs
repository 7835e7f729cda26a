//! CLI interface for Steward.
//!
//! Designed for agents and humans alike. Each subcommand is non-interactive:
//! arguments in, command output on stdout, diagnostics on stderr.
//!
//! - `steward run -- <command>...` — one supervised command.
//! - `steward batch <file>` — a sequence of shell commands in one session.
//! - `steward journal sections|show` — read the recovery journal.

mod format;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{Parser, Subcommand};

use steward::{
    config::Config,
    executor::{Invocation, RunOutcome},
    journal::MarkdownJournal,
    session::Session,
    timeout::{CancelToken, SupervisionError},
    tracker::FailureLimitExceeded,
};

use format::{format_escalation, format_outcome};

/// Steward — run commands under supervision.
#[derive(Debug, Parser)]
#[command(name = "steward", after_long_help = WORKFLOW_HELP)]
pub struct Cli {
    /// Journal file for recovery notes.
    /// Overrides `STEWARD_JOURNAL` and `journal-path` in the config.
    #[arg(long, global = true)]
    journal: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

const WORKFLOW_HELP: &str = r#"Examples:
  steward run -- cargo test
  steward run --shell --timeout 60 --context "nightly build" -- "make && make install"
  steward run --budget 600 -- ./long-migration.sh
  steward batch deploy.steps --budget 1800
  steward journal show "Command Recovery"

A command that fails is retried once before it counts as a failure.
Three consecutive failures stop the run; the next success writes a
recovery note to the journal."#;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one command under supervision.
    ///
    /// The command's stdout is passed through; its stderr goes to stderr.
    /// Exits non-zero if the command fails on both attempts.
    Run {
        #[command(flatten)]
        supervision: SupervisionArgs,

        /// Run the command through `sh -c` (arguments are joined with spaces).
        #[arg(long)]
        shell: bool,

        /// The command and its arguments.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Run each line of a file as a shell command, in order, in one session.
    ///
    /// Blank lines and lines starting with `#` are skipped. Stops when the
    /// failure limit is reached. Prints the session status as JSON.
    Batch {
        #[command(flatten)]
        supervision: SupervisionArgs,

        /// File with one shell command per line.
        file: PathBuf,
    },

    /// Read the recovery journal.
    Journal {
        #[command(subcommand)]
        command: JournalCommand,
    },
}

#[derive(Debug, clap::Args)]
pub struct SupervisionArgs {
    /// Per-attempt timeout in seconds (defaults to `attempt-timeout-secs`).
    #[arg(long)]
    timeout: Option<u64>,

    /// Free text recorded with failures.
    #[arg(long, default_value = "")]
    context: String,

    /// Wall-clock budget in seconds for the whole run.
    #[arg(long)]
    budget: Option<u64>,

    /// Report a spent budget instead of stopping.
    #[arg(long, requires = "budget")]
    opt_out: bool,
}

#[derive(Debug, Subcommand)]
pub enum JournalCommand {
    /// List section titles in document order.
    Sections,

    /// Print one section's body.
    Show {
        /// Section title, without the leading `# `.
        title: String,
    },
}

/// Run the CLI, returning an error message on failure.
pub fn run(config: &Config) -> Result<(), String> {
    let cli = Cli::parse();
    let journal = config
        .journal_path(cli.journal.as_deref())
        .map_err(|e| e.to_string())?;

    match cli.command {
        Command::Run {
            supervision,
            shell,
            command,
        } => {
            let invocation = if shell {
                Invocation::Shell(command.join(" "))
            } else {
                Invocation::from_argv(&command)
            };
            cmd_run(config, &journal, &supervision, invocation)
        }
        Command::Batch { supervision, file } => cmd_batch(config, &journal, &supervision, &file),
        Command::Journal { command } => match command {
            JournalCommand::Sections => cmd_sections(&journal),
            JournalCommand::Show { title } => cmd_show(&journal, &title),
        },
    }
}

fn open_session(config: &Config, journal: &Path, args: &SupervisionArgs) -> Arc<Session> {
    let mut session = Session::from_config(config, journal);
    if let Some(secs) = args.timeout {
        session = session.with_attempt_timeout(Duration::from_secs(secs));
    }
    session.enforcer().set_opt_out(args.opt_out);
    Arc::new(session)
}

fn cmd_run(
    config: &Config,
    journal: &Path,
    args: &SupervisionArgs,
    invocation: Invocation,
) -> Result<(), String> {
    let session = open_session(config, journal, args);

    let outcome = match args.budget {
        Some(secs) => {
            let name = invocation.to_string();
            let context = args.context.clone();
            session.supervise(&name, Duration::from_secs(secs), move |s, _token| {
                s.run(&invocation, &context)
            })
        }
        None => session
            .run(&invocation, &args.context)
            .map_err(SupervisionError::Task),
    }
    .map_err(|e| describe_error(&e))?;

    match outcome {
        RunOutcome::Succeeded { stdout, stderr } => {
            print!("{stdout}");
            eprint!("{stderr}");
            Ok(())
        }
        RunOutcome::Failed { diagnostic } => Err(diagnostic),
    }
}

fn cmd_batch(
    config: &Config,
    journal: &Path,
    args: &SupervisionArgs,
    file: &Path,
) -> Result<(), String> {
    let text = fs::read_to_string(file)
        .map_err(|e| format!("failed to read {}: {e}", file.display()))?;
    let commands = parse_batch(&text);
    if commands.is_empty() {
        return Err(format!("no commands in {}", file.display()));
    }

    let session = open_session(config, journal, args);
    let total = commands.len();

    let result = match args.budget {
        Some(secs) => {
            let context = args.context.clone();
            session.supervise(
                &format!("batch {}", file.display()),
                Duration::from_secs(secs),
                move |s, token| s.run_all(&commands, &context, &token),
            )
        }
        None => session
            .run_all(&commands, &args.context, &CancelToken::default())
            .map_err(SupervisionError::Task),
    };

    if let Ok(outcomes) = &result {
        for (invocation, outcome) in outcomes {
            eprintln!("{}", format_outcome(invocation, outcome));
        }
    }

    let status = serde_json::to_string_pretty(&session.status())
        .map_err(|e| format!("failed to serialize status: {e}"))?;
    println!("{status}");

    let outcomes = result.map_err(|e| describe_error(&e))?;
    let failed = outcomes
        .iter()
        .filter(|(_, o)| matches!(o, RunOutcome::Failed { .. }))
        .count();
    if failed > 0 {
        return Err(format!("{failed} of {total} commands failed"));
    }
    if outcomes.len() < total {
        return Err(format!("ran {} of {total} commands", outcomes.len()));
    }
    Ok(())
}

fn cmd_sections(journal: &Path) -> Result<(), String> {
    let document = MarkdownJournal::new(journal)
        .load()
        .map_err(|e| e.to_string())?;

    let sections = document.sections();
    if sections.is_empty() {
        println!("No sections");
        return Ok(());
    }
    for title in sections {
        println!("{title}");
    }
    Ok(())
}

fn cmd_show(journal: &Path, title: &str) -> Result<(), String> {
    let document = MarkdownJournal::new(journal)
        .load()
        .map_err(|e| e.to_string())?;

    let body = document
        .section(title)
        .ok_or_else(|| format!("no section '{title}' in {}", journal.display()))?;
    println!("{}", body.trim());
    Ok(())
}

/// One shell invocation per non-blank, non-comment line.
fn parse_batch(text: &str) -> Vec<Invocation> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| Invocation::Shell(line.to_string()))
        .collect()
}

fn describe_error(error: &SupervisionError<FailureLimitExceeded>) -> String {
    match error {
        SupervisionError::Task(exceeded) => format_escalation(exceeded),
        other => other.to_string(),
    }
}
