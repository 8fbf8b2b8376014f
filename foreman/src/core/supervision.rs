//! Deterministic classification of an in-flight run.
//!
//! The supervisor gathers observations (clock, session activity, thresholds)
//! and this module decides what, if anything, must happen to the run. Checks
//! run in a fixed order and the first match wins.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::types::{DecisionCategory, Run, RunOutcome, RunStatus};

pub const ERROR_STALLED: &str = "stalled";
pub const ERROR_TIMED_OUT: &str = "timed out";

/// Observed session activity for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionActivity {
    /// Timestamp of the newest message in the session, if any.
    pub last_message_at: Option<DateTime<Utc>>,
    /// Newest human-authored message strictly after the run's last update.
    pub human_message_at: Option<DateTime<Utc>>,
}

/// Limits that apply to the run's policy and phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisionLimits {
    pub stall_threshold: Duration,
    /// Phase timeout base multiplied by the configured multiplier.
    pub timeout: Duration,
    pub phase_requires_approval: bool,
}

/// Verdict for one run on one supervision tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No activity for longer than the stall threshold.
    Stalled,
    /// Wall-clock time since creation exceeded the scaled phase timeout.
    TimedOut,
    /// A human wrote into the session after the run last changed.
    HumanTakeover,
    /// The outcome or the phase demands approval.
    ApprovalRequired,
    Healthy,
}

impl Verdict {
    /// Whether remediation aborts the provider session.
    pub fn aborts_session(self) -> bool {
        matches!(self, Verdict::Stalled | Verdict::TimedOut)
    }

    /// Run status the supervisor moves the run to, if any.
    pub fn target_status(self) -> Option<RunStatus> {
        match self {
            Verdict::Stalled | Verdict::TimedOut => Some(RunStatus::Failed),
            Verdict::HumanTakeover | Verdict::ApprovalRequired => Some(RunStatus::Blocked),
            Verdict::Healthy => None,
        }
    }

    pub fn error_text(self) -> Option<&'static str> {
        match self {
            Verdict::Stalled => Some(ERROR_STALLED),
            Verdict::TimedOut => Some(ERROR_TIMED_OUT),
            _ => None,
        }
    }

    pub fn category(self) -> Option<DecisionCategory> {
        match self {
            Verdict::Stalled => Some(DecisionCategory::Stall),
            Verdict::TimedOut => Some(DecisionCategory::Timeout),
            Verdict::HumanTakeover => Some(DecisionCategory::HumanTakeover),
            Verdict::ApprovalRequired => Some(DecisionCategory::ApprovalRequired),
            Verdict::Healthy => None,
        }
    }
}

/// Classify a running run. Runs in any other status are always `Healthy`:
/// pending runs have not started and terminal runs are never touched.
pub fn classify(
    run: &Run,
    activity: &SessionActivity,
    limits: &SupervisionLimits,
    now: DateTime<Utc>,
) -> Verdict {
    if run.status != RunStatus::Running {
        return Verdict::Healthy;
    }

    let last_activity = activity
        .last_message_at
        .map_or(run.updated_at, |at| at.max(run.updated_at));
    if exceeds(now, last_activity, limits.stall_threshold) {
        return Verdict::Stalled;
    }

    if exceeds(now, run.created_at, limits.timeout) {
        return Verdict::TimedOut;
    }

    if activity
        .human_message_at
        .is_some_and(|at| at > run.updated_at)
    {
        return Verdict::HumanTakeover;
    }

    let outcome_wants_approval = run.outcome.as_ref().is_some_and(|o| o.requires_approval);
    if outcome_wants_approval || limits.phase_requires_approval {
        return Verdict::ApprovalRequired;
    }

    Verdict::Healthy
}

/// Outcome attached when the supervisor finalizes a run.
///
/// `None` when the run already carries an outcome, which is never replaced.
pub fn remediation_outcome(run: &Run, verdict: Verdict) -> Option<RunOutcome> {
    if run.outcome.is_some() {
        return None;
    }
    match verdict {
        Verdict::Stalled | Verdict::TimedOut => verdict.error_text().map(RunOutcome::failed),
        Verdict::HumanTakeover => Some(RunOutcome {
            success: false,
            requires_approval: true,
            summary: "human took over the session".to_string(),
            metrics: None,
            error: None,
        }),
        Verdict::ApprovalRequired => Some(RunOutcome {
            success: false,
            requires_approval: true,
            summary: "awaiting approval".to_string(),
            metrics: None,
            error: None,
        }),
        Verdict::Healthy => None,
    }
}

/// Scale a phase timeout by the configured multiplier.
///
/// Saturates at [`Duration::MAX`] instead of panicking on overflow; a
/// negative or NaN multiplier leaves the base unchanged.
pub fn scaled_timeout(base: Duration, multiplier: f64) -> Duration {
    if multiplier.is_nan() || multiplier < 0.0 {
        return base;
    }
    Duration::try_from_secs_f64(base.as_secs_f64() * multiplier).unwrap_or(Duration::MAX)
}

/// Strictly greater: elapsed exactly equal to the limit does not count.
fn exceeds(now: DateTime<Utc>, since: DateTime<Utc>, limit: Duration) -> bool {
    match (now - since).to_std() {
        Ok(elapsed) => elapsed > limit,
        // `since` is in the future (clock skew): nothing has elapsed.
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{RunOutcome, SessionRef};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).single().expect("time")
    }

    fn running_run() -> Run {
        Run {
            id: "run-1".to_string(),
            issue_id: "iss-1".to_string(),
            agent_id: "agent".to_string(),
            policy: "default".to_string(),
            phase: "plan".to_string(),
            attempt: 0,
            status: RunStatus::Running,
            session: Some(SessionRef("s-1".to_string())),
            created_at: t0(),
            updated_at: t0(),
            completed_at: None,
            outcome: None,
        }
    }

    fn limits() -> SupervisionLimits {
        SupervisionLimits {
            stall_threshold: Duration::from_secs(60),
            timeout: Duration::from_secs(600),
            phase_requires_approval: false,
        }
    }

    #[test]
    fn stall_boundary_is_strict() {
        let run = running_run();
        let activity = SessionActivity {
            last_message_at: Some(t0() + chrono::Duration::seconds(10)),
            human_message_at: None,
        };
        let exactly = t0() + chrono::Duration::seconds(70);
        assert_eq!(
            classify(&run, &activity, &limits(), exactly),
            Verdict::Healthy
        );
        let just_over = exactly + chrono::Duration::milliseconds(1);
        assert_eq!(
            classify(&run, &activity, &limits(), just_over),
            Verdict::Stalled
        );
    }

    #[test]
    fn no_messages_measures_from_last_update() {
        let run = running_run();
        let now = t0() + chrono::Duration::seconds(61);
        assert_eq!(
            classify(&run, &SessionActivity::default(), &limits(), now),
            Verdict::Stalled
        );
    }

    #[test]
    fn timeout_uses_creation_time() {
        let mut run = running_run();
        run.created_at = t0() - chrono::Duration::seconds(601);
        let activity = SessionActivity {
            last_message_at: Some(t0()),
            human_message_at: None,
        };
        assert_eq!(
            classify(&run, &activity, &limits(), t0()),
            Verdict::TimedOut
        );
    }

    #[test]
    fn stall_wins_over_timeout() {
        let mut run = running_run();
        run.created_at = t0() - chrono::Duration::seconds(10_000);
        let now = t0() + chrono::Duration::seconds(120);
        assert_eq!(
            classify(&run, &SessionActivity::default(), &limits(), now),
            Verdict::Stalled
        );
    }

    #[test]
    fn human_message_after_update_is_takeover() {
        let run = running_run();
        let at = t0() + chrono::Duration::seconds(5);
        let activity = SessionActivity {
            last_message_at: Some(at),
            human_message_at: Some(at),
        };
        assert_eq!(
            classify(&run, &activity, &limits(), at),
            Verdict::HumanTakeover
        );

        let stale = SessionActivity {
            last_message_at: Some(t0()),
            human_message_at: Some(t0()),
        };
        assert_eq!(classify(&run, &stale, &limits(), t0()), Verdict::Healthy);
    }

    #[test]
    fn approval_from_phase_or_outcome() {
        let run = running_run();
        let gated = SupervisionLimits {
            phase_requires_approval: true,
            ..limits()
        };
        assert_eq!(
            classify(&run, &SessionActivity::default(), &gated, t0()),
            Verdict::ApprovalRequired
        );

        let mut with_outcome = running_run();
        with_outcome.outcome = Some(RunOutcome {
            requires_approval: true,
            ..RunOutcome::succeeded("ok")
        });
        assert_eq!(
            classify(&with_outcome, &SessionActivity::default(), &limits(), t0()),
            Verdict::ApprovalRequired
        );
    }

    #[test]
    fn non_running_runs_are_left_alone() {
        let mut run = running_run();
        let late = t0() + chrono::Duration::days(1);
        for status in [
            RunStatus::Pending,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Blocked,
        ] {
            run.status = status;
            assert_eq!(
                classify(&run, &SessionActivity::default(), &limits(), late),
                Verdict::Healthy
            );
        }
    }

    #[test]
    fn remediation_never_replaces_an_outcome() {
        let run = running_run();
        let stalled = remediation_outcome(&run, Verdict::Stalled).expect("outcome");
        assert_eq!(stalled.error.as_deref(), Some(ERROR_STALLED));
        assert!(remediation_outcome(&run, Verdict::HumanTakeover).is_some_and(|o| o.requires_approval));

        let mut finished = running_run();
        finished.outcome = Some(RunOutcome::succeeded("done"));
        assert!(remediation_outcome(&finished, Verdict::ApprovalRequired).is_none());
    }

    #[test]
    fn scaled_timeout_multiplies_base() {
        assert_eq!(
            scaled_timeout(Duration::from_secs(100), 1.5),
            Duration::from_secs(150)
        );
    }

    #[test]
    fn scaled_timeout_saturates_instead_of_overflowing() {
        let base = Duration::from_secs(1800);
        assert_eq!(scaled_timeout(base, 1e17), Duration::MAX);
        assert_eq!(scaled_timeout(base, f64::INFINITY), Duration::MAX);
        assert_eq!(scaled_timeout(base, f64::NAN), base);
        assert_eq!(scaled_timeout(base, -2.0), base);
    }
}
