//! In-memory collaborators and fixtures for tests.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::claims::IssueClaims;
use crate::core::agents::{AgentDescriptor, AgentRegistry};
use crate::core::policy::{PhaseConfig, Policy, PolicyRegistry};
use crate::core::types::{Issue, IssueStatus, IssueUpdate, Run, RunStatus, SessionRef};
use crate::dispatch::Dispatcher;
use crate::io::issue_store::{IssueStore, marker_edits};
use crate::io::ledger::{NewRun, RunLedger, RunPatch};
use crate::io::provider::{
    CompletionError, ExecutionProvider, ExecutionResult, Message, MessageHandle, MessageOrigin,
    SessionConfig,
};
use crate::service::Collaborators;
use crate::supervise::Supervisor;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Agent with the given capabilities and priority, no tag or tier limits.
pub fn agent(id: &str, capabilities: &[&str], priority: i64) -> AgentDescriptor {
    AgentDescriptor {
        id: id.to_string(),
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        allowed_tags: None,
        tier: None,
        priority,
    }
}

/// Open issue with no phase and no dependencies.
pub fn issue(id: &str) -> Issue {
    Issue {
        id: id.to_string(),
        title: format!("{id} title"),
        description: format!("{id} description"),
        status: IssueStatus::Open,
        phase: None,
        dependencies: Vec::new(),
    }
}

/// Policy with one capability per phase, a 60s stall threshold, 30 minute
/// phase timeouts and two retries.
pub fn policy(name: &str, phases: &[(&str, &str)]) -> Policy {
    Policy {
        name: name.to_string(),
        stall_threshold: Duration::from_secs(60),
        phases: phases
            .iter()
            .map(|(phase, capability)| PhaseConfig {
                name: phase.to_string(),
                capabilities: [capability.to_string()].into_iter().collect(),
                timeout_base: Duration::from_secs(30 * 60),
                retry_limit: 2,
                requires_approval: false,
            })
            .collect(),
    }
}

#[derive(Debug, Clone)]
struct StoredIssue {
    issue: Issue,
    labels: Vec<String>,
}

/// Issue store keeping issues and labels in memory, in insertion order.
#[derive(Debug, Default)]
pub struct InMemoryIssueStore {
    issues: Mutex<Vec<StoredIssue>>,
    updates: Mutex<Vec<(String, IssueUpdate)>>,
    fail_listing: Mutex<bool>,
}

impl InMemoryIssueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, issue: Issue, labels: &[&str]) {
        lock(&self.issues).push(StoredIssue {
            issue,
            labels: labels.iter().map(|l| l.to_string()).collect(),
        });
    }

    pub fn status(&self, issue_id: &str) -> Option<IssueStatus> {
        lock(&self.issues)
            .iter()
            .find(|s| s.issue.id == issue_id)
            .map(|s| s.issue.status)
    }

    pub fn labels_of(&self, issue_id: &str) -> Vec<String> {
        lock(&self.issues)
            .iter()
            .find(|s| s.issue.id == issue_id)
            .map(|s| s.labels.clone())
            .unwrap_or_default()
    }

    /// Every update applied so far, in order.
    pub fn updates(&self) -> Vec<(String, IssueUpdate)> {
        lock(&self.updates).clone()
    }

    pub fn fail_listing(&self, fail: bool) {
        *lock(&self.fail_listing) = fail;
    }
}

#[async_trait]
impl IssueStore for InMemoryIssueStore {
    async fn list_ready(&self) -> Result<Vec<Issue>> {
        if *lock(&self.fail_listing) {
            bail!("tracker unavailable");
        }
        Ok(lock(&self.issues)
            .iter()
            .filter(|s| s.issue.status == IssueStatus::Open)
            .map(|s| s.issue.clone())
            .collect())
    }

    async fn update(&self, issue_id: &str, update: &IssueUpdate) -> Result<()> {
        let mut issues = lock(&self.issues);
        let stored = issues
            .iter_mut()
            .find(|s| s.issue.id == issue_id)
            .ok_or_else(|| anyhow!("unknown issue {issue_id}"))?;
        if let Some(status) = update.status {
            stored.issue.status = status;
        }
        if let Some(phase) = &update.phase {
            stored.issue.phase = Some(phase.clone());
        }
        let (remove, add) = marker_edits(&stored.labels, update);
        stored.labels.retain(|l| !remove.contains(l));
        stored.labels.extend(add);
        lock(&self.updates).push((issue_id.to_string(), update.clone()));
        Ok(())
    }

    async fn get_labels(&self, issue_id: &str) -> Result<Vec<String>> {
        lock(&self.issues)
            .iter()
            .find(|s| s.issue.id == issue_id)
            .map(|s| s.labels.clone())
            .ok_or_else(|| anyhow!("unknown issue {issue_id}"))
    }
}

/// How the next scripted session behaves.
#[derive(Debug, Clone)]
pub enum Script {
    Complete(ExecutionResult),
    /// Complete after a delay, unless the wait times out or is cancelled first.
    CompleteAfter(Duration, ExecutionResult),
    /// `await_completion` fails with this error.
    Fail(String),
    /// Never completes; ends only on timeout or cancellation.
    Hang,
    /// `create_session` fails with this error.
    CreateFails(String),
}

impl Script {
    pub fn result(success: bool, summary: &str) -> ExecutionResult {
        ExecutionResult {
            success,
            requires_approval: false,
            summary: summary.to_string(),
            metrics: None,
            error: (!success).then(|| summary.to_string()),
        }
    }

    pub fn complete(success: bool, summary: &str) -> Script {
        Script::Complete(Script::result(success, summary))
    }
}

#[derive(Debug)]
struct ScriptedSession {
    session: SessionRef,
    config: SessionConfig,
    script: Script,
    instructions: Vec<String>,
    messages: Vec<Message>,
}

/// Provider replaying queued [`Script`]s, one per created session. With an
/// empty queue sessions complete successfully.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    sessions: Mutex<Vec<ScriptedSession>>,
    aborted: Mutex<Vec<SessionRef>>,
    released: Mutex<Vec<SessionRef>>,
    failing: Mutex<HashSet<SessionRef>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, script: Script) {
        lock(&self.scripts).push_back(script);
    }

    pub fn sessions(&self) -> Vec<SessionRef> {
        lock(&self.sessions).iter().map(|s| s.session.clone()).collect()
    }

    pub fn aborted(&self) -> Vec<SessionRef> {
        lock(&self.aborted).clone()
    }

    pub fn released(&self) -> Vec<SessionRef> {
        lock(&self.released).clone()
    }

    /// Instructions sent for the given run, in order.
    pub fn instructions_for(&self, run_id: &str) -> Vec<String> {
        lock(&self.sessions)
            .iter()
            .filter(|s| s.config.run_id == run_id)
            .flat_map(|s| s.instructions.clone())
            .collect()
    }

    pub fn add_message(
        &self,
        session: &SessionRef,
        origin: MessageOrigin,
        content: &str,
        at: DateTime<Utc>,
    ) {
        if let Some(s) = lock(&self.sessions).iter_mut().find(|s| &s.session == session) {
            s.messages.push(Message {
                created_at: at,
                ..Message::new(origin, content)
            });
        }
    }

    /// Make `messages_since` fail for this session.
    pub fn fail_messages(&self, session: &SessionRef) {
        lock(&self.failing).insert(session.clone());
    }

    /// Open a session with an explicit script, bypassing the queue.
    pub fn open_session(&self, config: &SessionConfig, script: Script) -> SessionRef {
        let session = SessionRef(format!("session-{}", Uuid::new_v4()));
        lock(&self.sessions).push(ScriptedSession {
            session: session.clone(),
            config: config.clone(),
            script,
            instructions: Vec::new(),
            messages: Vec::new(),
        });
        session
    }

    fn script_of(&self, session: &SessionRef) -> Result<Script> {
        lock(&self.sessions)
            .iter()
            .find(|s| &s.session == session)
            .map(|s| s.script.clone())
            .ok_or_else(|| anyhow!("unknown session {session}"))
    }
}

#[async_trait]
impl ExecutionProvider for ScriptedProvider {
    async fn create_session(&self, config: &SessionConfig) -> Result<SessionRef> {
        let script = lock(&self.scripts)
            .pop_front()
            .unwrap_or_else(|| Script::complete(true, "done"));
        if let Script::CreateFails(err) = script {
            bail!(err);
        }
        Ok(self.open_session(config, script))
    }

    async fn send_instruction(&self, session: &SessionRef, content: &str) -> Result<MessageHandle> {
        let mut sessions = lock(&self.sessions);
        let s = sessions
            .iter_mut()
            .find(|s| &s.session == session)
            .ok_or_else(|| anyhow!("unknown session {session}"))?;
        s.instructions.push(content.to_string());
        Ok(MessageHandle(format!("msg-{}", s.instructions.len())))
    }

    async fn await_completion(
        &self,
        session: &SessionRef,
        _message: &MessageHandle,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, CompletionError> {
        let (delay, result) = match self.script_of(session)? {
            Script::Complete(result) => return Ok(result),
            Script::Fail(err) => return Err(anyhow!(err).into()),
            Script::CompleteAfter(delay, result) => (Some(delay), Some(result)),
            Script::Hang | Script::CreateFails(_) => (None, None),
        };
        let finished = async {
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(CompletionError::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(CompletionError::TimedOut(timeout)),
            _ = finished => result.ok_or_else(|| anyhow!("session ended without result").into()),
        }
    }

    async fn messages_since(
        &self,
        session: &SessionRef,
        since: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        if lock(&self.failing).contains(session) {
            bail!("provider unavailable");
        }
        let sessions = lock(&self.sessions);
        let s = sessions
            .iter()
            .find(|s| &s.session == session)
            .ok_or_else(|| anyhow!("unknown session {session}"))?;
        let mut messages: Vec<Message> = s
            .messages
            .iter()
            .filter(|m| m.created_at > since)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn abort(&self, session: &SessionRef) -> Result<()> {
        lock(&self.aborted).push(session.clone());
        Ok(())
    }

    /// Recorded only; the session stays inspectable for assertions.
    async fn release(&self, session: &SessionRef) -> Result<()> {
        lock(&self.released).push(session.clone());
        Ok(())
    }
}

/// Collaborators wired to in-memory doubles and a temporary ledger.
pub struct Harness {
    pub issues: Arc<InMemoryIssueStore>,
    pub provider: Arc<ScriptedProvider>,
    pub ledger: Arc<RunLedger>,
    pub policies: Arc<PolicyRegistry>,
    pub agents: Arc<AgentRegistry>,
    pub claims: IssueClaims,
    pub shutdown: CancellationToken,
    _dir: TempDir,
}

impl Harness {
    pub fn new(policies: PolicyRegistry, agents: Vec<AgentDescriptor>) -> Self {
        Self::with_store(Arc::new(InMemoryIssueStore::new()), policies, agents)
    }

    pub fn with_store(
        issues: Arc<InMemoryIssueStore>,
        policies: PolicyRegistry,
        agents: Vec<AgentDescriptor>,
    ) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let ledger = RunLedger::open(dir.path().join("ledger")).expect("open ledger");
        let shutdown = CancellationToken::new();
        Self {
            issues,
            provider: Arc::new(ScriptedProvider::new()),
            ledger: Arc::new(ledger),
            policies: Arc::new(policies),
            agents: Arc::new(AgentRegistry::new(agents)),
            claims: IssueClaims::new(shutdown.clone()),
            shutdown,
            _dir: dir,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            issues: self.issues.clone(),
            provider: self.provider.clone(),
            ledger: self.ledger.clone(),
            policies: self.policies.clone(),
            agents: self.agents.clone(),
        }
    }

    pub fn dispatcher(&self, pool: usize) -> Dispatcher {
        Dispatcher::new(self.collaborators(), self.claims.clone(), pool, 16 * 1024)
            .expect("dispatcher")
    }

    pub fn supervisor(&self, timeout_multiplier: f64) -> Supervisor {
        Supervisor::new(self.collaborators(), self.claims.clone(), timeout_multiplier)
    }

    /// Create a run in `phase` of the default policy and move it to
    /// `running` with a fresh scripted session, bypassing the dispatcher.
    pub fn start_run(&self, issue_id: &str, phase: &str) -> Run {
        let run_id = Uuid::new_v4().to_string();
        let config = SessionConfig {
            run_id: run_id.clone(),
            issue_id: issue_id.to_string(),
            agent_id: "coder".to_string(),
            phase: phase.to_string(),
        };
        self.ledger
            .create_run(NewRun {
                id: run_id.clone(),
                issue_id: config.issue_id.clone(),
                agent_id: config.agent_id.clone(),
                policy: self.policies.default_policy().to_string(),
                phase: phase.to_string(),
                attempt: 0,
            })
            .expect("create run");
        let session = self.provider.open_session(&config, Script::Hang);
        self.ledger
            .transition(
                &run_id,
                RunStatus::Pending,
                RunStatus::Running,
                RunPatch::session(session),
            )
            .expect("start run")
    }
}
