//! Issue store adapter.
//!
//! The [`IssueStore`] trait is the only way the core reads or writes issues;
//! it never caches issue state between calls. [`CommandIssueStore`] talks to
//! a tracker CLI (`bd` by default). Tests use the in-memory fake from
//! `test_support`.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::core::labels::{PHASE_PREFIX, RETRIES_PREFIX, has_prefix, phase_label, retries_label};
use crate::core::types::{Issue, IssueStatus, IssueUpdate};
use crate::io::config::IssueStoreConfig;
use crate::io::process::{CallLimits, call_tracker};

/// Read/write access to units of work.
#[async_trait]
pub trait IssueStore: Send + Sync {
    /// Issues whose dependencies are satisfied and that are ready for work,
    /// in the store's order.
    async fn list_ready(&self) -> Result<Vec<Issue>>;

    /// Apply a partial update. Fields left `None` are untouched.
    async fn update(&self, issue_id: &str, update: &IssueUpdate) -> Result<()>;

    async fn get_labels(&self, issue_id: &str) -> Result<Vec<String>>;
}

/// Issue as printed by the tracker's `--json` output.
#[derive(Debug, Deserialize)]
struct TrackerIssue {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    status: String,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    dependencies: Vec<TrackerDependency>,
}

/// Dependencies appear either as bare ids or as objects.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TrackerDependency {
    Id(String),
    Object {
        #[serde(alias = "depends_on_id")]
        id: String,
    },
}

impl TrackerDependency {
    fn into_id(self) -> String {
        match self {
            TrackerDependency::Id(id) | TrackerDependency::Object { id } => id,
        }
    }
}

/// Parse `ready --json` output.
pub fn parse_ready_issues(raw: &str) -> Result<Vec<Issue>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let parsed: Vec<TrackerIssue> =
        serde_json::from_str(trimmed).context("parse tracker issue list")?;
    parsed
        .into_iter()
        .map(|issue| {
            let status = IssueStatus::parse(&issue.status).ok_or_else(|| {
                anyhow!("issue {} has unknown status '{}'", issue.id, issue.status)
            })?;
            let phase = issue
                .labels
                .iter()
                .find_map(|label| label.strip_prefix(PHASE_PREFIX))
                .filter(|phase| !phase.is_empty())
                .map(str::to_string);
            Ok(Issue {
                id: issue.id,
                title: issue.title,
                description: issue.description,
                status,
                phase,
                dependencies: issue
                    .dependencies
                    .into_iter()
                    .map(TrackerDependency::into_id)
                    .collect(),
            })
        })
        .collect()
}

/// Parse `label list <id> --json` output.
pub fn parse_labels(raw: &str) -> Result<Vec<String>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed).context("parse tracker label list")
}

/// Label edits needed to move the `phase:`/`retries:` markers to `update`.
///
/// Returns `(remove, add)`. Labels already in the desired state are left alone.
pub fn marker_edits(current: &[String], update: &IssueUpdate) -> (Vec<String>, Vec<String>) {
    let mut remove = Vec::new();
    let mut add = Vec::new();
    let mut replace = |prefix: &str, desired: String| {
        for label in current.iter().filter(|l| has_prefix(l, prefix)) {
            if *label != desired {
                remove.push(label.clone());
            }
        }
        if !current.contains(&desired) {
            add.push(desired);
        }
    };
    if let Some(phase) = &update.phase {
        replace(PHASE_PREFIX, phase_label(phase));
    }
    if let Some(retries) = update.retries {
        replace(RETRIES_PREFIX, retries_label(retries));
    }
    (remove, add)
}

/// Issue store backed by a tracker CLI.
#[derive(Debug, Clone)]
pub struct CommandIssueStore {
    config: IssueStoreConfig,
}

impl CommandIssueStore {
    pub fn new(config: IssueStoreConfig) -> Result<Self> {
        if config.command.is_empty() {
            bail!("issue_store.command must not be empty");
        }
        Ok(Self { config })
    }

    /// Run `<command> <args..>` on the blocking pool and return stdout.
    async fn run(&self, args: Vec<String>) -> Result<String> {
        let argv: Vec<String> = self.config.command.iter().cloned().chain(args).collect();
        let limits = CallLimits {
            timeout: Duration::from_secs(self.config.timeout_secs),
            output_limit_bytes: self.config.output_limit_bytes,
        };
        let shown = argv.join(" ");
        debug!(command = %shown, "running tracker command");

        let output = tokio::task::spawn_blocking(move || call_tracker(&argv, limits))
            .await
            .context("tracker command task panicked")??;
        output.into_stdout(&shown)
    }
}

#[async_trait]
impl IssueStore for CommandIssueStore {
    #[instrument(skip_all)]
    async fn list_ready(&self) -> Result<Vec<Issue>> {
        let stdout = self.run(vec!["ready".into(), "--json".into()]).await?;
        parse_ready_issues(&stdout)
    }

    #[instrument(skip_all, fields(issue_id = %issue_id))]
    async fn update(&self, issue_id: &str, update: &IssueUpdate) -> Result<()> {
        if let Some(status) = update.status {
            self.run(vec![
                "update".into(),
                issue_id.into(),
                "--status".into(),
                status.as_str().into(),
            ])
            .await?;
        }
        if update.phase.is_none() && update.retries.is_none() {
            return Ok(());
        }
        let current = self.get_labels(issue_id).await?;
        let (remove, add) = marker_edits(&current, update);
        for label in remove {
            self.run(vec!["label".into(), "remove".into(), issue_id.into(), label])
                .await?;
        }
        for label in add {
            self.run(vec!["label".into(), "add".into(), issue_id.into(), label])
                .await?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(issue_id = %issue_id))]
    async fn get_labels(&self, issue_id: &str) -> Result<Vec<String>> {
        let stdout = self
            .run(vec![
                "label".into(),
                "list".into(),
                issue_id.into(),
                "--json".into(),
            ])
            .await?;
        parse_labels(&stdout)
    }
}
