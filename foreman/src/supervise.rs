//! Supervisor: watches running runs and recovers after restarts.
//!
//! Each scan classifies every `running` run (see [`crate::core::supervision`])
//! and remediates the ones that need it. All ledger writes are
//! compare-and-swap on `running`, so a run the dispatcher finalized in the
//! meantime is left alone.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::claims::IssueClaims;
use crate::core::supervision::{
    SessionActivity, SupervisionLimits, Verdict, classify, remediation_outcome, scaled_timeout,
};
use crate::core::types::{
    DecisionCategory, DecisionEntry, IssueStatus, IssueUpdate, Run, RunOutcome, RunStatus,
};
use crate::io::ledger::{LedgerError, RunPatch};
use crate::service::Collaborators;

pub const ERROR_INTERRUPTED: &str = "interrupted by restart";
pub const ERROR_INTERRUPTED_BEFORE_START: &str = "interrupted before start";

/// One remediation applied during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorAction {
    pub run_id: String,
    pub issue_id: String,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Running runs looked at.
    pub inspected: usize,
    /// Remediations applied by `scan`, or due according to `assess`.
    pub actions: Vec<SupervisorAction>,
    /// Runs that could not be checked this scan (provider or policy errors).
    pub skipped: usize,
}

pub struct Supervisor {
    deps: Collaborators,
    claims: IssueClaims,
    timeout_multiplier: f64,
}

impl Supervisor {
    pub fn new(deps: Collaborators, claims: IssueClaims, timeout_multiplier: f64) -> Self {
        Self {
            deps,
            claims,
            timeout_multiplier,
        }
    }

    pub async fn scan(&self) -> ScanReport {
        self.scan_at(Utc::now()).await
    }

    /// Scan with an explicit clock.
    #[instrument(skip_all, fields(now = %now))]
    pub async fn scan_at(&self, now: DateTime<Utc>) -> ScanReport {
        let (mut report, findings) = self.survey(now).await;
        for (run, verdict, limits) in findings {
            if self.remediate(&run, verdict, &limits).await {
                report.actions.push(SupervisorAction {
                    run_id: run.id.clone(),
                    issue_id: run.issue_id.clone(),
                    verdict,
                });
            }
        }
        debug!(
            inspected = report.inspected,
            actions = report.actions.len(),
            skipped = report.skipped,
            "supervisor scan"
        );
        report
    }

    pub async fn assess(&self) -> ScanReport {
        self.assess_at(Utc::now()).await
    }

    /// Classify every running run like [`scan_at`](Self::scan_at) but change
    /// nothing: no ledger writes, no aborts, no issue updates.
    #[instrument(skip_all, fields(now = %now))]
    pub async fn assess_at(&self, now: DateTime<Utc>) -> ScanReport {
        let (mut report, findings) = self.survey(now).await;
        report.actions = findings
            .into_iter()
            .map(|(run, verdict, _)| SupervisorAction {
                run_id: run.id,
                issue_id: run.issue_id,
                verdict,
            })
            .collect();
        report
    }

    /// Running runs that need remediation, with the limits that applied.
    async fn survey(&self, now: DateTime<Utc>) -> (ScanReport, Vec<(Run, Verdict, SupervisionLimits)>) {
        let mut report = ScanReport::default();
        let mut findings = Vec::new();
        for run in self.deps.ledger.runs_with_status(RunStatus::Running) {
            report.inspected += 1;
            match self.inspect(&run, now).await {
                Ok((Verdict::Healthy, _)) => {}
                Ok((verdict, limits)) => findings.push((run, verdict, limits)),
                Err(err) => {
                    warn!(run_id = %run.id, err = %format!("{err:#}"), "skipping run this scan");
                    report.skipped += 1;
                }
            }
        }
        (report, findings)
    }

    async fn inspect(
        &self,
        run: &Run,
        now: DateTime<Utc>,
    ) -> anyhow::Result<(Verdict, SupervisionLimits)> {
        let policy = self.deps.policies.policy(&run.policy)?;
        let phase = self.deps.policies.phase_config(&run.policy, &run.phase)?;
        let limits = SupervisionLimits {
            stall_threshold: policy.stall_threshold,
            timeout: scaled_timeout(phase.timeout_base, self.timeout_multiplier),
            phase_requires_approval: phase.requires_approval,
        };

        let mut activity = SessionActivity::default();
        if let Some(session) = &run.session {
            let messages = self
                .deps
                .provider
                .messages_since(session, run.updated_at)
                .await?;
            activity.last_message_at = messages.iter().map(|m| m.created_at).max();
            activity.human_message_at = messages
                .iter()
                .filter(|m| self.deps.provider.is_human_origin(m))
                .map(|m| m.created_at)
                .max();
        }
        Ok((classify(run, &activity, &limits, now), limits))
    }

    /// Apply a verdict. Returns `false` if the run was no longer `running`.
    #[instrument(skip_all, fields(run_id = %run.id, issue_id = %run.issue_id, verdict = ?verdict))]
    async fn remediate(&self, run: &Run, verdict: Verdict, limits: &SupervisionLimits) -> bool {
        let Some(target) = verdict.target_status() else {
            return false;
        };
        let patch = RunPatch {
            session: None,
            outcome: remediation_outcome(run, verdict),
        };
        match self
            .deps
            .ledger
            .transition(&run.id, RunStatus::Running, target, patch)
        {
            Ok(_) => {}
            Err(LedgerError::StatusConflict { actual, .. }) => {
                debug!(status = %actual, "run already left running");
                return false;
            }
            Err(err) => {
                error!(err = %err, "failed to finalize run");
                return false;
            }
        }
        info!(status = %target, "supervisor finalized run");

        // End the dispatcher's wait; it must not apply its own transition.
        self.claims.cancel_run(&run.id);

        if let Some(session) = &run.session {
            if verdict.aborts_session()
                && let Err(err) = self.deps.provider.abort(session).await
            {
                warn!(session_id = %session, err = %format!("{err:#}"), "failed to abort session");
            }
            // A session handed to a human keeps running, but foreman is done with it.
            if let Err(err) = self.deps.provider.release(session).await {
                warn!(session_id = %session, err = %format!("{err:#}"), "failed to release session");
            }
        }

        let issue_status = match target {
            RunStatus::Failed => IssueStatus::Open,
            _ => IssueStatus::Blocked,
        };
        if let Err(err) = self
            .deps
            .issues
            .update(&run.issue_id, &IssueUpdate::status(issue_status))
            .await
        {
            warn!(err = %format!("{err:#}"), "failed to update issue after remediation");
            self.record(DecisionEntry::new(
                Some(run.id.as_str()),
                &run.issue_id,
                DecisionCategory::IssueStoreError,
                format!("set issue {issue_status}"),
                format!("{err:#}"),
            ));
        }

        if let Some(category) = verdict.category() {
            self.record(DecisionEntry::new(
                Some(run.id.as_str()),
                &run.issue_id,
                category,
                format!("{target} run, issue {issue_status}"),
                explain(run, verdict, limits),
            ));
        }
        true
    }

    /// Fail every run a previous process left unfinished and reopen its issue.
    ///
    /// Idempotent: a run is only touched while it is still `running` or
    /// `pending`, so a second call finds nothing to do. Must run before either
    /// loop starts.
    #[instrument(skip_all)]
    pub async fn recover_interrupted_runs(&self) -> Vec<String> {
        let mut recovered = Vec::new();
        for run in self.deps.ledger.runs() {
            let error_text = match run.status {
                RunStatus::Running => ERROR_INTERRUPTED,
                RunStatus::Pending => ERROR_INTERRUPTED_BEFORE_START,
                _ => continue,
            };
            let patch = RunPatch {
                session: None,
                outcome: run
                    .outcome
                    .is_none()
                    .then(|| RunOutcome::failed(error_text)),
            };
            match self
                .deps
                .ledger
                .transition(&run.id, run.status, RunStatus::Failed, patch)
            {
                Ok(_) => {}
                Err(LedgerError::StatusConflict { .. }) => continue,
                Err(err) => {
                    error!(run_id = %run.id, err = %err, "failed to recover run");
                    continue;
                }
            }
            info!(run_id = %run.id, issue_id = %run.issue_id, "recovered interrupted run");

            if let Err(err) = self
                .deps
                .issues
                .update(&run.issue_id, &IssueUpdate::status(IssueStatus::Open))
                .await
            {
                warn!(issue_id = %run.issue_id, err = %format!("{err:#}"), "failed to reopen issue");
            }
            self.record(DecisionEntry::new(
                Some(run.id.as_str()),
                &run.issue_id,
                DecisionCategory::Recovery,
                "failed run, issue open",
                error_text,
            ));
            recovered.push(run.id);
        }
        recovered
    }

    fn record(&self, entry: DecisionEntry) {
        if let Err(err) = self.deps.ledger.record_decision(entry) {
            error!(err = %err, "failed to record decision");
        }
    }
}

fn explain(run: &Run, verdict: Verdict, limits: &SupervisionLimits) -> String {
    match verdict {
        Verdict::Stalled => format!(
            "no session activity for more than {:?}",
            limits.stall_threshold
        ),
        Verdict::TimedOut => format!("running for more than {:?}", limits.timeout),
        Verdict::HumanTakeover => "human message in session after the run's last update".to_string(),
        Verdict::ApprovalRequired => {
            if run.outcome.as_ref().is_some_and(|o| o.requires_approval) {
                "outcome requires approval".to_string()
            } else {
                format!("phase '{}' requires approval", run.phase)
            }
        }
        Verdict::Healthy => String::new(),
    }
}
