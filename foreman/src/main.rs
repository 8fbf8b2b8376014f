//! Foreman CLI.
//!
//! Thin wrapper over the library: loads `foreman.toml`, wires the adapters and
//! runs one of the loops (or a single pass of it).

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use foreman::core::types::RunStatus;
use foreman::io::config::{DEFAULT_CONFIG_PATH, ForemanConfig, load_config, write_config};
use foreman::io::ledger::RunLedger;
use foreman::logging;
use foreman::service::{Collaborators, Service, cancel_on_ctrl_c};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "foreman",
    version,
    about = "Dispatch tracker issues to coding agents and supervise their runs"
)]
struct Cli {
    /// Path to the config file.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Debug logging for foreman (ignored when RUST_LOG is set).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Recover interrupted runs, then dispatch and supervise until Ctrl-C.
    Run,
    /// Run a single dispatcher tick.
    Dispatch,
    /// Report what a supervisor scan would do, without doing it.
    ///
    /// Session activity is read from the session logs on disk. Remediation
    /// only happens inside `run`, the process that owns the agent sessions.
    Supervise,
    /// Fail runs left unfinished by a previous process.
    Recover,
    /// Print runs as JSON lines.
    Runs {
        /// Only runs in this status (pending, running, completed, failed, blocked).
        #[arg(long)]
        status: Option<String>,
        /// Only runs for this issue.
        #[arg(long)]
        issue: Option<String>,
    },
    /// Print the decision trail as JSON lines.
    Decisions {
        /// Only decisions about this run.
        #[arg(long)]
        run: Option<String>,
    },
    /// Rebuild the ledger index from the run log.
    Reindex,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    if let Err(err) = run(cli).await {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Command::Init { force } = cli.command {
        return cmd_init(&cli.config, force);
    }
    let config = load_config(&cli.config)?;
    match cli.command {
        Command::Init { .. } => Ok(()),
        Command::Run => cmd_run(&config).await,
        Command::Dispatch => {
            let report = service(&config, CancellationToken::new())?
                .dispatcher
                .tick()
                .await;
            eprintln!(
                "ready {}, finished {}, skipped {}, preempted {}, errors {}",
                report.ready,
                report.finished.len(),
                report.skipped,
                report.preempted,
                report.errors
            );
            print_json_lines(&report.finished)
        }
        Command::Supervise => {
            let report = service(&config, CancellationToken::new())?
                .supervisor
                .assess()
                .await;
            eprintln!(
                "inspected {}, needing action {}, skipped {}",
                report.inspected,
                report.actions.len(),
                report.skipped
            );
            for action in &report.actions {
                println!("{}\t{}\t{:?}", action.run_id, action.issue_id, action.verdict);
            }
            Ok(())
        }
        Command::Recover => {
            let recovered = service(&config, CancellationToken::new())?
                .supervisor
                .recover_interrupted_runs()
                .await;
            for run_id in recovered {
                println!("{run_id}");
            }
            Ok(())
        }
        Command::Runs { status, issue } => cmd_runs(&config, status.as_deref(), issue.as_deref()),
        Command::Decisions { run } => {
            let ledger = open_ledger(&config)?;
            let decisions = match run {
                Some(run_id) => ledger.decisions_for_run(&run_id),
                None => ledger.decisions(),
            };
            print_json_lines(&decisions)
        }
        Command::Reindex => {
            let count = open_ledger(&config)?.rebuild_index()?;
            eprintln!("indexed {count} runs");
            Ok(())
        }
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &ForemanConfig::default())
        .with_context(|| format!("write {}", path.display()))
}

async fn cmd_run(config: &ForemanConfig) -> Result<()> {
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    service(config, shutdown)?.run().await
}

fn cmd_runs(config: &ForemanConfig, status: Option<&str>, issue: Option<&str>) -> Result<()> {
    let status = status
        .map(|raw| RunStatus::parse(raw).with_context(|| format!("unknown run status '{raw}'")))
        .transpose()?;
    let runs: Vec<_> = open_ledger(config)?
        .runs()
        .into_iter()
        .filter(|run| status.is_none_or(|s| run.status == s))
        .filter(|run| issue.is_none_or(|id| run.issue_id == id))
        .collect();
    print_json_lines(&runs)
}

fn service(config: &ForemanConfig, shutdown: CancellationToken) -> Result<Service> {
    let deps = Collaborators::from_config(config)?;
    Service::new(config, deps, shutdown)
}

fn open_ledger(config: &ForemanConfig) -> Result<RunLedger> {
    RunLedger::open(config.ledger_dir()).context("open run ledger")
}

fn print_json_lines<T: Serialize>(items: &[T]) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for item in items {
        let line = serde_json::to_string(item).context("serialize json")?;
        writeln!(out, "{line}").context("write stdout")?;
    }
    Ok(())
}
