//! Dispatcher: turns ready issues into runs.
//!
//! Per tick, issues are prepared strictly in store order (resolve policy and
//! phase, select an agent, create the run, mark the issue in progress). Each
//! prepared run then executes on its own task holding a worker-pool permit;
//! the permit is taken before preparation, so a pool of one reproduces fully
//! sequential processing. The tick returns once all of its runs are done.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::claims::{IssueClaim, IssueClaims};
use crate::core::agents::SelectionConstraints;
use crate::core::labels::parse_markers;
use crate::core::policy::PhaseConfig;
use crate::core::types::{
    DecisionCategory, DecisionEntry, Issue, IssueStatus, IssueUpdate, Run, RunOutcome, RunStatus,
    SessionRef, Transition, TransitionKind,
};
use crate::error::DispatchError;
use crate::io::ledger::{LedgerError, NewRun, RunPatch};
use crate::io::prompt::{InstructionBuilder, InstructionInputs};
use crate::io::provider::{CompletionError, SessionConfig};
use crate::service::Collaborators;

/// A run that reached a terminal state and had its transition applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinishedRun {
    pub issue_id: String,
    pub run_id: String,
    pub status: RunStatus,
    pub transition: TransitionKind,
}

/// Summary of one dispatcher tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Issues reported ready by the store.
    pub ready: usize,
    pub finished: Vec<FinishedRun>,
    /// Issues skipped because they are claimed or already have an active run.
    pub skipped: usize,
    /// Runs the supervisor (or shutdown) took over while they were executing.
    pub preempted: usize,
    /// Issues whose processing ended in an error (including `no-agent`).
    pub errors: usize,
}

enum RunEnd {
    Finished(FinishedRun),
    Preempted,
    Failed,
}

/// Everything needed to execute a prepared run.
struct PreparedRun {
    claim: IssueClaim,
    run: Run,
    phase: PhaseConfig,
    retries: u32,
    instruction: String,
}

struct Shared {
    deps: Collaborators,
    claims: IssueClaims,
    instructions: InstructionBuilder,
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    pool: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        deps: Collaborators,
        claims: IssueClaims,
        max_concurrent_runs: usize,
        instruction_budget_bytes: usize,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            shared: Arc::new(Shared {
                deps,
                claims,
                instructions: InstructionBuilder::new(instruction_budget_bytes)?,
            }),
            pool: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
        })
    }

    /// Run one polling tick. Never fails: per-issue errors are recorded in the
    /// decision trail and counted in the report.
    #[instrument(skip_all)]
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let issues = match self.shared.deps.issues.list_ready().await {
            Ok(issues) => issues,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to list ready issues");
                report.errors += 1;
                return report;
            }
        };
        report.ready = issues.len();
        debug!(ready = issues.len(), "dispatcher tick");

        let mut tasks = Vec::new();
        for issue in &issues {
            if self.shared.claims.is_shutting_down() {
                info!("shutdown requested, not starting further runs");
                break;
            }
            let Ok(permit) = self.pool.clone().acquire_owned().await else {
                break;
            };
            match self.shared.prepare(issue).await {
                Ok(Some(prepared)) => {
                    let shared = self.shared.clone();
                    tasks.push(tokio::spawn(async move {
                        let _permit = permit;
                        shared.execute(prepared).await
                    }));
                }
                Ok(None) => report.skipped += 1,
                Err(err) => {
                    self.shared.record_error(&issue.id, None, &err);
                    report.errors += 1;
                }
            }
        }

        for task in tasks {
            match task.await {
                Ok(RunEnd::Finished(run)) => report.finished.push(run),
                Ok(RunEnd::Preempted) => report.preempted += 1,
                Ok(RunEnd::Failed) => report.errors += 1,
                Err(err) => {
                    error!(err = %err, "run task panicked");
                    report.errors += 1;
                }
            }
        }
        report
    }
}

impl Shared {
    /// Steps 1-3: resolve, select, create the run, mark the issue in progress.
    ///
    /// Returns `None` when the issue is already being worked on.
    #[instrument(skip_all, fields(issue_id = %issue.id))]
    async fn prepare(&self, issue: &Issue) -> Result<Option<PreparedRun>, DispatchError> {
        let Some(claim) = self.claims.try_claim(&issue.id) else {
            debug!("issue already claimed");
            return Ok(None);
        };
        if let Some(active) = self.deps.ledger.active_run_for_issue(&issue.id) {
            debug!(run_id = %active.id, status = %active.status, "issue has an active run");
            return Ok(None);
        }

        let labels = self
            .deps
            .issues
            .get_labels(&issue.id)
            .await
            .map_err(DispatchError::IssueStore)?;
        let markers = parse_markers(&labels);
        let phase_marker = markers.phase.clone().or_else(|| issue.phase.clone());
        let (policy, phase) = self
            .deps
            .policies
            .resolve(markers.policy.as_deref(), phase_marker.as_deref())?;

        let constraints = SelectionConstraints {
            tags: markers.tags.clone(),
            tier: markers.tier,
            pinned_agent: markers.pinned_agent.clone(),
        };
        let Some(agent) = self.deps.agents.select(&phase.capabilities, &constraints) else {
            return Err(DispatchError::Selection {
                required: join(phase.capabilities.iter()),
            });
        };

        let previous = self.previous_attempt(&issue.id, &phase.name);
        let instruction = self
            .instructions
            .build(&InstructionInputs {
                issue,
                policy,
                phase,
                attempt: markers.retries,
                previous,
            })
            .map_err(|err| DispatchError::Execution(format!("render instructions: {err:#}")))?;

        let run_id = Uuid::new_v4().to_string();
        self.deps.ledger.record_decision(DecisionEntry::new(
            Some(run_id.as_str()),
            &issue.id,
            DecisionCategory::AgentSelection,
            &agent.id,
            format!(
                "priority {} agent covering [{}] for phase '{}' of policy '{}'",
                agent.priority,
                join(phase.capabilities.iter()),
                phase.name,
                policy.name
            ),
        ))?;
        let run = self.deps.ledger.create_run(NewRun {
            id: run_id.clone(),
            issue_id: issue.id.clone(),
            agent_id: agent.id.clone(),
            policy: policy.name.clone(),
            phase: phase.name.clone(),
            attempt: markers.retries,
        })?;
        claim.bind_run(&run_id);

        if let Err(err) = self
            .deps
            .issues
            .update(&issue.id, &IssueUpdate::status(IssueStatus::InProgress))
            .await
        {
            let outcome = RunOutcome::failed(format!("mark issue in progress: {err:#}"));
            self.deps.ledger.transition(
                &run_id,
                RunStatus::Pending,
                RunStatus::Failed,
                RunPatch::outcome(outcome),
            )?;
            return Err(DispatchError::IssueStore(err));
        }

        info!(run_id = %run_id, agent_id = %agent.id, phase = %phase.name, "run created");
        Ok(Some(PreparedRun {
            claim,
            run,
            phase: phase.clone(),
            retries: markers.retries,
            instruction,
        }))
    }

    /// Steps 4-6 for one run. Errors are recorded here, at the run boundary.
    #[instrument(skip_all, fields(issue_id = %prepared.run.issue_id, run_id = %prepared.run.id, phase = %prepared.run.phase, agent_id = %prepared.run.agent_id))]
    async fn execute(&self, prepared: PreparedRun) -> RunEnd {
        let issue_id = prepared.run.issue_id.clone();
        let run_id = prepared.run.id.clone();
        match self.execute_inner(prepared).await {
            Ok(end) => end,
            Err(err) => {
                self.record_error(&issue_id, Some(run_id.as_str()), &err);
                RunEnd::Failed
            }
        }
    }

    async fn execute_inner(&self, prepared: PreparedRun) -> Result<RunEnd, DispatchError> {
        let PreparedRun {
            claim,
            run,
            phase,
            retries,
            instruction,
        } = prepared;

        let (from, outcome) = match self.start_and_wait(&run, &phase, &instruction, &claim).await? {
            Some(result) => result,
            None => return Ok(RunEnd::Preempted),
        };

        let target = if outcome.success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        match self
            .deps
            .ledger
            .transition(&run.id, from, target, RunPatch::outcome(outcome.clone()))
        {
            Ok(_) => {}
            Err(LedgerError::StatusConflict { actual, .. }) => {
                info!(status = %actual, "run was finalized by the supervisor");
                return Ok(RunEnd::Preempted);
            }
            Err(err) => return Err(err.into()),
        }

        let transition =
            self.deps
                .policies
                .transition(&run.policy, &run.phase, &outcome, retries)?;
        self.deps.ledger.record_decision(DecisionEntry::new(
            Some(run.id.as_str()),
            &run.issue_id,
            DecisionCategory::Transition,
            describe(&transition),
            transition.reason.clone(),
        ))?;
        self.deps
            .issues
            .update(&run.issue_id, &issue_update(&transition, retries))
            .await
            .map_err(DispatchError::IssueStore)?;

        info!(status = %target, transition = transition.kind.as_str(), "run finished");
        drop(claim);
        Ok(RunEnd::Finished(FinishedRun {
            issue_id: run.issue_id,
            run_id: run.id,
            status: target,
            transition: transition.kind,
        }))
    }

    /// Step 4-5: start a session and wait for it.
    ///
    /// Returns the status the run is in and the outcome to attach, or `None`
    /// when the wait was cancelled because someone else took over the run.
    async fn start_and_wait(
        &self,
        run: &Run,
        phase: &PhaseConfig,
        instruction: &str,
        claim: &IssueClaim,
    ) -> Result<Option<(RunStatus, RunOutcome)>, DispatchError> {
        let provider = &self.deps.provider;
        let session = match provider
            .create_session(&SessionConfig {
                run_id: run.id.clone(),
                issue_id: run.issue_id.clone(),
                agent_id: run.agent_id.clone(),
                phase: run.phase.clone(),
            })
            .await
        {
            Ok(session) => session,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to create session");
                self.record_execution_error(run, &format!("create session: {err:#}"));
                return Ok(Some((
                    RunStatus::Pending,
                    RunOutcome::failed(format!("create session: {err:#}")),
                )));
            }
        };

        if let Err(err) = self.deps.ledger.transition(
            &run.id,
            RunStatus::Pending,
            RunStatus::Running,
            RunPatch::session(session.clone()),
        ) {
            self.close_session(&session, true).await;
            return Err(err.into());
        }

        let handle = match provider.send_instruction(&session, instruction).await {
            Ok(handle) => handle,
            Err(err) => {
                let text = format!("send instruction: {err:#}");
                warn!(err = %text, "failed to send instruction");
                self.record_execution_error(run, &text);
                self.close_session(&session, true).await;
                return Ok(Some((RunStatus::Running, RunOutcome::failed(text))));
            }
        };

        let outcome = match provider
            .await_completion(&session, &handle, phase.timeout_base, claim.token())
            .await
        {
            Ok(result) => {
                self.close_session(&session, false).await;
                result.into_outcome(phase.requires_approval)
            }
            Err(CompletionError::Cancelled) => {
                info!("wait cancelled, leaving run to its new owner");
                return Ok(None);
            }
            Err(CompletionError::TimedOut(limit)) => {
                let text = timeout_text(limit);
                warn!(timeout_secs = limit.as_secs(), "run timed out, aborting session");
                self.close_session(&session, true).await;
                self.record_execution_error(run, &text);
                RunOutcome::failed(text)
            }
            Err(CompletionError::Failed(err)) => {
                let text = format!("{err:#}");
                warn!(err = %text, "execution failed");
                self.close_session(&session, false).await;
                self.record_execution_error(run, &text);
                RunOutcome::failed(text)
            }
        };
        Ok(Some((RunStatus::Running, outcome)))
    }

    /// Hand the session back to the provider, aborting it first if asked.
    async fn close_session(&self, session: &SessionRef, abort: bool) {
        let provider = &self.deps.provider;
        if abort && let Err(err) = provider.abort(session).await {
            warn!(session_id = %session, err = %format!("{err:#}"), "failed to abort session");
        }
        if let Err(err) = provider.release(session).await {
            warn!(session_id = %session, err = %format!("{err:#}"), "failed to release session");
        }
    }

    fn record_execution_error(&self, run: &Run, text: &str) {
        let entry = DecisionEntry::new(
            Some(run.id.as_str()),
            &run.issue_id,
            DecisionCategory::ExecutionError,
            "fail run",
            text,
        );
        if let Err(err) = self.deps.ledger.record_decision(entry) {
            error!(err = %err, "failed to record execution error");
        }
    }

    fn previous_attempt(&self, issue_id: &str, phase: &str) -> Option<String> {
        self.deps
            .ledger
            .runs_for_issue(issue_id)
            .into_iter()
            .rev()
            .filter(|run| run.phase == phase)
            .find_map(|run| run.outcome.filter(|outcome| !outcome.success))
            .map(|outcome| match outcome.error {
                Some(error) => format!("{}\nerror: {error}", outcome.summary),
                None => outcome.summary,
            })
    }

    /// Loop-boundary conversion of an error into a log line and decision entry.
    fn record_error(&self, issue_id: &str, run_id: Option<&str>, err: &DispatchError) {
        let decision = match err {
            DispatchError::Selection { .. } => "no run created",
            _ => "issue processing aborted",
        };
        match err {
            DispatchError::Selection { .. } => info!(issue_id, err = %err, "no agent for issue"),
            _ => warn!(issue_id, run_id, err = %err, "issue processing failed"),
        }
        let entry = DecisionEntry::new(run_id, issue_id, err.category(), decision, err.to_string());
        if let Err(record_err) = self.deps.ledger.record_decision(entry) {
            error!(issue_id, err = %record_err, "failed to record decision");
        }
    }
}

/// Issue update applied for a transition.
pub fn issue_update(transition: &Transition, retries: u32) -> IssueUpdate {
    match transition.kind {
        TransitionKind::Advance => IssueUpdate {
            status: Some(IssueStatus::Open),
            phase: transition.next_phase.clone(),
            retries: Some(0),
        },
        TransitionKind::Retry => IssueUpdate {
            status: Some(IssueStatus::Open),
            phase: None,
            retries: Some(retries + 1),
        },
        TransitionKind::Block => IssueUpdate::status(IssueStatus::Blocked),
        TransitionKind::Close => IssueUpdate::status(IssueStatus::Closed),
    }
}

fn describe(transition: &Transition) -> String {
    match &transition.next_phase {
        Some(next) => format!("{} -> {next}", transition.kind.as_str()),
        None => transition.kind.as_str().to_string(),
    }
}

fn timeout_text(limit: Duration) -> String {
    format!("timed out after {limit:?}")
}

fn join<'a>(items: impl Iterator<Item = &'a String>) -> String {
    items.map(String::as_str).collect::<Vec<_>>().join(", ")
}
