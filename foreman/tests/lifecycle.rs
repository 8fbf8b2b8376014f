//! Loop-level tests driving the dispatcher and supervisor together.
//!
//! Issues move through several ticks against the in-memory tracker and the
//! scripted provider, and the ledger is checked after each step.

use std::time::Duration;

use chrono::Utc;
use foreman::core::policy::{Policy, PolicyRegistry};
use foreman::core::supervision::Verdict;
use foreman::core::types::{DecisionCategory, IssueStatus, RunStatus, TransitionKind};
use foreman::io::ledger::RunLedger;
use foreman::io::provider::MessageOrigin;
use foreman::test_support::{Harness, Script, agent, issue, policy};

fn three_phase() -> Policy {
    policy(
        "default",
        &[("plan", "planning"), ("implement", "coding"), ("test", "testing")],
    )
}

fn harness() -> Harness {
    Harness::new(
        PolicyRegistry::new(vec![three_phase()], "default"),
        vec![
            agent("planner", &["planning"], 1),
            agent("generalist", &["planning", "coding", "testing"], 1),
            agent("coder", &["coding"], 9),
        ],
    )
}

/// Wait until the issue has a `running` run and return its id.
async fn wait_running(ledger: &RunLedger, issue_id: &str) -> String {
    for _ in 0..200 {
        if let Some(run) = ledger
            .runs_for_issue(issue_id)
            .into_iter()
            .find(|r| r.status == RunStatus::Running)
        {
            return run.id;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no running run for {issue_id}");
}

/// Full lifecycle: plan → implement (fails once, retried) → test → closed.
#[tokio::test]
async fn issue_walks_every_phase_with_one_retry() {
    let h = harness();
    h.issues.insert(issue("iss-1"), &[]);
    h.provider.push(Script::complete(true, "plan written"));
    h.provider.push(Script::complete(false, "compile error in parser"));
    h.provider.push(Script::complete(true, "implemented"));
    h.provider.push(Script::complete(true, "all tests pass"));
    let dispatcher = h.dispatcher(1);

    let kinds: Vec<TransitionKind> = {
        let mut kinds = Vec::new();
        for _ in 0..4 {
            let report = dispatcher.tick().await;
            assert_eq!(report.finished.len(), 1, "{report:?}");
            kinds.push(report.finished[0].transition);
        }
        kinds
    };
    assert_eq!(
        kinds,
        vec![
            TransitionKind::Advance,
            TransitionKind::Retry,
            TransitionKind::Advance,
            TransitionKind::Close
        ]
    );

    let runs = h.ledger.runs_for_issue("iss-1");
    let phases: Vec<&str> = runs.iter().map(|r| r.phase.as_str()).collect();
    assert_eq!(phases, vec!["plan", "implement", "implement", "test"]);
    let agents: Vec<&str> = runs.iter().map(|r| r.agent_id.as_str()).collect();
    assert_eq!(agents, vec!["planner", "coder", "coder", "generalist"]);
    assert_eq!(runs[1].status, RunStatus::Failed);
    assert_eq!(runs[2].attempt, 1);
    assert!(runs.iter().all(|r| r.completed_at.is_some()));

    // The retry sees the failure it is retrying.
    let retry_instruction = h.provider.instructions_for(&runs[2].id).concat();
    assert!(retry_instruction.contains("compile error in parser"));
    assert!(retry_instruction.contains("attempt: 2 of 3"));

    assert_eq!(h.issues.status("iss-1"), Some(IssueStatus::Closed));
    let labels = h.issues.labels_of("iss-1");
    assert!(labels.contains(&"phase:test".to_string()));
    assert!(labels.contains(&"retries:0".to_string()));

    for run in &runs {
        let categories: Vec<_> = h
            .ledger
            .decisions_for_run(&run.id)
            .into_iter()
            .map(|d| d.category)
            .collect();
        assert_eq!(
            categories,
            vec![DecisionCategory::AgentSelection, DecisionCategory::Transition]
        );
    }

    let report = dispatcher.tick().await;
    assert_eq!(report.ready, 0, "closed issues are not ready");
}

#[tokio::test]
async fn ledger_survives_reopen_with_same_trail() {
    let h = harness();
    h.issues.insert(issue("iss-1"), &[]);
    h.dispatcher(1).tick().await;

    let reopened = RunLedger::open(h.ledger.dir()).expect("reopen");
    assert_eq!(reopened.runs(), h.ledger.runs());
    assert_eq!(reopened.decisions(), h.ledger.decisions());
    assert_eq!(reopened.rebuild_index().expect("index"), 1);
}

/// A stall detected mid-wait: the supervisor owns the outcome, the
/// dispatcher backs off, and the issue is picked up again on the next tick.
#[tokio::test]
async fn supervisor_stall_preempts_dispatcher_wait() {
    let h = harness();
    h.issues.insert(issue("iss-1"), &[]);
    h.provider.push(Script::Hang);
    let dispatcher = h.dispatcher(1);
    let supervisor = h.supervisor(1.5);

    let tick = tokio::spawn(async move { dispatcher.tick().await });
    let run_id = wait_running(&h.ledger, "iss-1").await;

    let report = supervisor
        .scan_at(Utc::now() + chrono::Duration::seconds(61))
        .await;
    assert_eq!(report.actions[0].verdict, Verdict::Stalled);

    let tick_report = tokio::time::timeout(Duration::from_secs(5), tick)
        .await
        .expect("dispatcher wait ended")
        .expect("tick task");
    assert_eq!(tick_report.preempted, 1);
    assert!(tick_report.finished.is_empty());

    let run = h.ledger.get(&run_id).expect("run");
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.outcome.and_then(|o| o.error).as_deref(), Some("stalled"));
    assert_eq!(h.provider.aborted().len(), 1, "aborted once, by the supervisor");
    assert_eq!(h.provider.released(), h.provider.aborted(), "released by its new owner only");
    assert_eq!(h.issues.status("iss-1"), Some(IssueStatus::Open));
    assert!(
        h.ledger
            .decisions_for_run(&run_id)
            .iter()
            .all(|d| d.category != DecisionCategory::Transition),
        "dispatcher applied no transition"
    );
    assert!(h.claims.is_empty());

    // The stalled phase is tried again.
    let next = h.dispatcher(1).tick().await;
    assert_eq!(next.finished.len(), 1);
    let runs = h.ledger.runs_for_issue("iss-1");
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[1].phase, "plan");
}

#[tokio::test]
async fn human_takeover_blocks_issue_and_keeps_session() {
    let h = harness();
    h.issues.insert(issue("iss-1"), &[]);
    h.provider.push(Script::Hang);
    let dispatcher = h.dispatcher(1);
    let supervisor = h.supervisor(1.5);

    let tick = tokio::spawn(async move { dispatcher.tick().await });
    let run_id = wait_running(&h.ledger, "iss-1").await;
    let run = h.ledger.get(&run_id).expect("run");
    let session = run.session.clone().expect("session");
    h.provider.add_message(
        &session,
        MessageOrigin::Human,
        "pausing this, needs a design review",
        run.updated_at + chrono::Duration::milliseconds(5),
    );

    let report = supervisor
        .scan_at(run.updated_at + chrono::Duration::milliseconds(10))
        .await;
    assert_eq!(report.actions[0].verdict, Verdict::HumanTakeover);

    let tick_report = tokio::time::timeout(Duration::from_secs(5), tick)
        .await
        .expect("dispatcher wait ended")
        .expect("tick task");
    assert_eq!(tick_report.preempted, 1);

    assert_eq!(h.ledger.get(&run_id).expect("run").status, RunStatus::Blocked);
    assert_eq!(h.issues.status("iss-1"), Some(IssueStatus::Blocked));
    assert!(h.provider.aborted().is_empty());
    assert_eq!(h.dispatcher(1).tick().await.ready, 0);
}

#[tokio::test]
async fn shutdown_ends_waits_and_recovery_reopens() {
    let h = harness();
    h.issues.insert(issue("iss-1"), &[]);
    h.provider.push(Script::Hang);
    let dispatcher = h.dispatcher(1);

    let tick = tokio::spawn(async move { dispatcher.tick().await });
    let run_id = wait_running(&h.ledger, "iss-1").await;
    h.shutdown.cancel();

    let tick_report = tokio::time::timeout(Duration::from_secs(5), tick)
        .await
        .expect("dispatcher wait ended")
        .expect("tick task");
    assert_eq!(tick_report.preempted, 1);
    assert_eq!(h.ledger.get(&run_id).expect("run").status, RunStatus::Running);

    // Next process start.
    let recovered = h.supervisor(1.5).recover_interrupted_runs().await;
    assert_eq!(recovered, vec![run_id.clone()]);
    assert_eq!(h.ledger.get(&run_id).expect("run").status, RunStatus::Failed);
    assert_eq!(h.issues.status("iss-1"), Some(IssueStatus::Open));
    let last = h.ledger.decisions().pop().expect("decision");
    assert_eq!(last.category, DecisionCategory::Recovery);
}
