//! Shared deterministic types for the run lifecycle.
//!
//! These types define stable contracts between the dispatcher, the supervisor
//! and the run ledger. They carry no I/O and serialize to a stable JSON shape,
//! since run snapshots and decision entries are persisted verbatim.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Issue status as owned by the external issue store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl IssueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueStatus::Open => "open",
            IssueStatus::InProgress => "in_progress",
            IssueStatus::Blocked => "blocked",
            IssueStatus::Closed => "closed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "open" => Some(IssueStatus::Open),
            "in_progress" => Some(IssueStatus::InProgress),
            "blocked" => Some(IssueStatus::Blocked),
            "closed" => Some(IssueStatus::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work as reported by the issue store.
///
/// The core never caches issues between ticks; every read goes through the
/// store adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: IssueStatus,
    /// Current phase marker, if the issue carries one.
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Partial update applied to an issue through the store adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueUpdate {
    pub status: Option<IssueStatus>,
    pub phase: Option<String>,
    pub retries: Option<u32>,
}

impl IssueUpdate {
    pub fn status(status: IssueStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.phase.is_none() && self.retries.is_none()
    }
}

/// Lifecycle status of a run.
///
/// `pending → running → {completed | failed | blocked}`; terminal states are
/// never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Blocked
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Blocked => "blocked",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "blocked" => Some(RunStatus::Blocked),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured result of one run. Attached once, never replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub success: bool,
    #[serde(default)]
    pub requires_approval: bool,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn succeeded(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            requires_approval: false,
            summary: summary.into(),
            metrics: None,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            requires_approval: false,
            summary: format!("run failed: {error}"),
            metrics: None,
            error: Some(error),
        }
    }
}

/// Opaque session handle issued by the execution provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionRef(pub String);

impl fmt::Display for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One attempt to execute a phase of an issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub issue_id: String,
    pub agent_id: String,
    pub policy: String,
    pub phase: String,
    /// Retry counter of the issue when this run was created.
    #[serde(default)]
    pub attempt: u32,
    pub status: RunStatus,
    pub session: Option<SessionRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
}

/// What the policy decided to do with an issue after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Advance,
    Retry,
    Block,
    Close,
}

impl TransitionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransitionKind::Advance => "advance",
            TransitionKind::Retry => "retry",
            TransitionKind::Block => "block",
            TransitionKind::Close => "close",
        }
    }
}

/// A phase transition decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub kind: TransitionKind,
    pub next_phase: Option<String>,
    pub reason: String,
}

/// Performance tier advertised by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Fast,
    Standard,
    Premium,
}

impl Tier {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "fast" => Some(Tier::Fast),
            "standard" => Some(Tier::Standard),
            "premium" => Some(Tier::Premium),
            _ => None,
        }
    }
}

/// Capability set. Ordered so that rendering and logging are stable.
pub type Capabilities = BTreeSet<String>;

/// Category of an audit decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionCategory {
    AgentSelection,
    NoAgent,
    Transition,
    ExecutionError,
    TransitionError,
    PersistenceError,
    IssueStoreError,
    Stall,
    Timeout,
    HumanTakeover,
    ApprovalRequired,
    Recovery,
}

/// Immutable audit record explaining a dispatcher or supervisor choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionEntry {
    pub run_id: Option<String>,
    pub issue_id: String,
    pub category: DecisionCategory,
    pub decision: String,
    pub reasoning: String,
    pub timestamp: DateTime<Utc>,
}

impl DecisionEntry {
    pub fn new(
        run_id: Option<&str>,
        issue_id: &str,
        category: DecisionCategory,
        decision: impl Into<String>,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.map(str::to_string),
            issue_id: issue_id.to_string(),
            category,
            decision: decision.into(),
            reasoning: reasoning.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Blocked.is_terminal());
    }

    #[test]
    fn decision_category_serializes_kebab_case() {
        let json = serde_json::to_string(&DecisionCategory::NoAgent).expect("serialize");
        assert_eq!(json, "\"no-agent\"");
    }

    #[test]
    fn issue_status_parses_tracker_spelling() {
        assert_eq!(IssueStatus::parse("in_progress"), Some(IssueStatus::InProgress));
        assert_eq!(IssueStatus::parse("done"), None);
    }
}
