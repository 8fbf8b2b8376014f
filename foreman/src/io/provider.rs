//! Execution provider adapter.
//!
//! The [`ExecutionProvider`] trait decouples dispatch and supervision from the
//! agent backend. [`CommandProvider`] runs a local agent CLI per session and
//! turns its stdout into session messages. Tests use the scripted provider
//! from `test_support`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::core::types::{RunOutcome, SessionRef};
use crate::io::config::ProviderConfig;

const RUN_RESULT_SCHEMA: &str = include_str!("../../schemas/run_result.schema.json");

/// How long stdout may stay open after the agent itself has exited.
const OUTPUT_GRACE: Duration = Duration::from_secs(5);

/// What a session is created for. Passed to the agent as environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub run_id: String,
    pub issue_id: String,
    pub agent_id: String,
    pub phase: String,
}

/// Handle of an instruction sent into a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandle(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageOrigin {
    Agent,
    Human,
    System,
}

/// One message observed in a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub origin: MessageOrigin,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(origin: MessageOrigin, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            origin,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Result reported by the agent when a session completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub requires_approval: bool,
    pub summary: String,
    #[serde(default)]
    pub metrics: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionResult {
    /// Build a run outcome. `phase_requires_approval` is OR-ed into the
    /// agent's own approval flag.
    pub fn into_outcome(self, phase_requires_approval: bool) -> RunOutcome {
        RunOutcome {
            success: self.success,
            requires_approval: self.requires_approval || phase_requires_approval,
            summary: self.summary,
            metrics: self.metrics,
            error: self.error,
        }
    }
}

/// Why waiting for completion did not produce a result.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    /// The caller's cancellation token fired.
    #[error("wait cancelled")]
    Cancelled,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Session/message transport to the agents.
#[async_trait]
pub trait ExecutionProvider: Send + Sync {
    async fn create_session(&self, config: &SessionConfig) -> Result<SessionRef>;

    async fn send_instruction(&self, session: &SessionRef, content: &str)
    -> Result<MessageHandle>;

    /// Wait until the session reports completion, `timeout` elapses, or
    /// `cancel` fires, whichever comes first.
    async fn await_completion(
        &self,
        session: &SessionRef,
        message: &MessageHandle,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, CompletionError>;

    /// Messages created strictly after `since`, oldest first.
    async fn messages_since(
        &self,
        session: &SessionRef,
        since: DateTime<Utc>,
    ) -> Result<Vec<Message>>;

    fn is_human_origin(&self, message: &Message) -> bool {
        message.origin == MessageOrigin::Human
    }

    async fn abort(&self, session: &SessionRef) -> Result<()>;

    /// Forget a session nobody will query again. An agent that is still
    /// running is left alone; [`abort`](Self::abort) it first to stop it.
    async fn release(&self, session: &SessionRef) -> Result<()>;
}

/// A classified stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentLine {
    Message { origin: MessageOrigin, content: String },
    Result(Value),
    Blank,
}

#[derive(Deserialize)]
struct WireMessage {
    origin: MessageOrigin,
    content: String,
}

#[derive(Deserialize)]
struct WireResult {
    result: Value,
}

/// Classify one stdout line. Anything that is not a structured message or a
/// result line is agent output.
pub fn parse_agent_line(line: &str) -> AgentLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return AgentLine::Blank;
    }
    if trimmed.starts_with('{') {
        if let Ok(wire) = serde_json::from_str::<WireResult>(trimmed) {
            return AgentLine::Result(wire.result);
        }
        if let Ok(wire) = serde_json::from_str::<WireMessage>(trimmed) {
            return AgentLine::Message {
                origin: wire.origin,
                content: wire.content,
            };
        }
    }
    AgentLine::Message {
        origin: MessageOrigin::Agent,
        content: trimmed.to_string(),
    }
}

/// Validate a result payload against the embedded schema and deserialize it.
pub fn decode_result(validator: &Validator, value: Value) -> Result<ExecutionResult> {
    let messages: Vec<String> = validator
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("result schema validation failed: {}", messages.join("; "));
    }
    serde_json::from_value(value).context("deserialize run result")
}

pub fn run_result_validator() -> Result<Validator> {
    let schema: Value = serde_json::from_str(RUN_RESULT_SCHEMA).context("parse result schema")?;
    jsonschema::validator_for(&schema).map_err(|err| anyhow!("invalid result schema: {}", err))
}

#[derive(Debug, Clone)]
struct ExitInfo {
    success: bool,
    code: Option<i32>,
    killed: bool,
}

struct Session {
    id: String,
    config: SessionConfig,
    dir: PathBuf,
    messages: Mutex<Vec<Message>>,
    result: Mutex<Option<Result<ExecutionResult, String>>>,
    exit: watch::Sender<Option<ExitInfo>>,
    kill: CancellationToken,
}

impl Session {
    fn push_message(&self, message: Message) {
        lock(&self.messages).push(message);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Provider that runs the configured agent CLI once per session.
///
/// The instruction is written to the child's stdin. Each stdout line becomes a
/// session message and is appended to `<sessions_dir>/<id>/messages.jsonl`; a
/// `{"result": {..}}` line carries the run result.
pub struct CommandProvider {
    command: Vec<String>,
    sessions_dir: PathBuf,
    output_limit_bytes: usize,
    validator: Arc<Validator>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl CommandProvider {
    pub fn new(config: &ProviderConfig, sessions_dir: impl Into<PathBuf>) -> Result<Self> {
        if config.command.is_empty() {
            bail!("provider.command must not be empty");
        }
        Ok(Self {
            command: config.command.clone(),
            sessions_dir: sessions_dir.into(),
            output_limit_bytes: config.output_limit_bytes,
            validator: Arc::new(run_result_validator()?),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn session(&self, session: &SessionRef) -> Result<Arc<Session>> {
        lock(&self.sessions)
            .get(&session.0)
            .cloned()
            .ok_or_else(|| anyhow!("unknown session '{}'", session.0))
    }

    /// Sessions currently registered.
    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    async fn logged_messages(
        &self,
        session: &SessionRef,
        since: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        // Session ids become path components.
        if Uuid::parse_str(&session.0).is_err() {
            bail!("unknown session '{}'", session.0);
        }
        let dir = self.sessions_dir.join(&session.0);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            bail!("unknown session '{}'", session.0);
        }
        let log_path = dir.join("messages.jsonl");
        let contents = match tokio::fs::read_to_string(&log_path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("read {}", log_path.display())),
        };
        // The writer may be mid-line, so unparseable lines are skipped.
        Ok(contents
            .lines()
            .filter_map(|line| serde_json::from_str::<Message>(line).ok())
            .filter(|message| message.created_at > since)
            .collect())
    }
}

#[async_trait]
impl ExecutionProvider for CommandProvider {
    #[instrument(skip_all, fields(run_id = %config.run_id))]
    async fn create_session(&self, config: &SessionConfig) -> Result<SessionRef> {
        let id = Uuid::new_v4().to_string();
        let dir = self.sessions_dir.join(&id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create session dir {}", dir.display()))?;
        let (exit, _) = watch::channel(None);
        let session = Arc::new(Session {
            id: id.clone(),
            config: config.clone(),
            dir,
            messages: Mutex::new(Vec::new()),
            result: Mutex::new(None),
            exit,
            kill: CancellationToken::new(),
        });
        lock(&self.sessions).insert(id.clone(), session);
        debug!(session_id = %id, "session created");
        Ok(SessionRef(id))
    }

    #[instrument(skip_all, fields(session_id = %session.0))]
    async fn send_instruction(
        &self,
        session: &SessionRef,
        content: &str,
    ) -> Result<MessageHandle> {
        let session = self.session(session)?;
        if session.exit.borrow().is_some() || session.kill.is_cancelled() {
            bail!("session '{}' is no longer active", session.id);
        }

        let instruction = Message::new(MessageOrigin::System, content);
        let handle = MessageHandle(instruction.id.clone());
        tokio::fs::write(session.dir.join("instruction.md"), content)
            .await
            .context("write instruction")?;

        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .env("FOREMAN_SESSION_ID", &session.id)
            .env("FOREMAN_RUN_ID", &session.config.run_id)
            .env("FOREMAN_ISSUE_ID", &session.config.issue_id)
            .env("FOREMAN_AGENT_ID", &session.config.agent_id)
            .env("FOREMAN_PHASE", &session.config.phase)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so an abort also reaches the agent's helpers.
        #[cfg(unix)]
        cmd.process_group(0);

        info!(program = %self.command[0], "starting agent");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn agent command '{}'", self.command[0]))?;
        let group = child.id();

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        session.push_message(instruction);

        let pump = tokio::spawn(pump_stdout(
            session.clone(),
            stdout,
            self.validator.clone(),
            self.output_limit_bytes,
        ));
        let stderr_path = session.dir.join("stderr.log");
        let drain = tokio::spawn(async move {
            let mut reader = stderr;
            let mut file = tokio::fs::File::create(&stderr_path).await?;
            tokio::io::copy(&mut reader, &mut file).await
        });
        tokio::spawn(watch_child(session.clone(), child, group, pump, drain));

        match stdin.write_all(content.as_bytes()).await {
            Ok(()) => {}
            // The agent stopped reading; whatever it printed still counts.
            Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!("agent closed stdin before the whole instruction was written");
            }
            Err(err) => {
                session.kill.cancel();
                return Err(err).context("write instruction to agent stdin");
            }
        }
        drop(stdin);

        Ok(handle)
    }

    #[instrument(skip_all, fields(session_id = %session.0, timeout_secs = timeout.as_secs()))]
    async fn await_completion(
        &self,
        session: &SessionRef,
        _message: &MessageHandle,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, CompletionError> {
        let session = self.session(session)?;
        let mut exit = session.exit.subscribe();

        let waited = tokio::select! {
            waited = tokio::time::timeout(timeout, exit.wait_for(Option::is_some)) => {
                waited.map(|res| res.map(|info| (*info).clone()))
            }
            () = cancel.cancelled() => return Err(CompletionError::Cancelled),
        };
        let info = match waited {
            Err(_) => return Err(CompletionError::TimedOut(timeout)),
            Ok(Err(_)) => return Err(anyhow!("session '{}' closed", session.id).into()),
            Ok(Ok(None)) => return Err(anyhow!("session '{}' has no exit status", session.id).into()),
            Ok(Ok(Some(info))) => info,
        };

        if info.killed {
            return Err(anyhow!("session '{}' was aborted", session.id).into());
        }
        let result = lock(&session.result).clone();
        if !info.success {
            let detail = match result {
                Some(Ok(r)) => r.error.unwrap_or(r.summary),
                Some(Err(err)) => err,
                None => "no result".to_string(),
            };
            return Err(anyhow!("agent exited with status {:?}: {}", info.code, detail).into());
        }
        match result {
            Some(Ok(result)) => Ok(result),
            Some(Err(err)) => Err(anyhow!(err).into()),
            None => Err(anyhow!("agent exited without a result line").into()),
        }
    }

    /// Sessions started by another process (or already released) are read
    /// back from their `messages.jsonl`.
    async fn messages_since(
        &self,
        session: &SessionRef,
        since: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let registered = lock(&self.sessions).get(&session.0).cloned();
        let Some(session) = registered else {
            return self.logged_messages(session, since).await;
        };
        let messages = lock(&session.messages);
        Ok(messages
            .iter()
            .filter(|message| message.created_at > since)
            .cloned()
            .collect())
    }

    #[instrument(skip_all, fields(session_id = %session.0))]
    async fn abort(&self, session: &SessionRef) -> Result<()> {
        let session = self.session(session)?;
        if session.exit.borrow().is_none() {
            info!("aborting agent session");
        }
        session.kill.cancel();
        Ok(())
    }

    #[instrument(skip_all, fields(session_id = %session.0))]
    async fn release(&self, session: &SessionRef) -> Result<()> {
        if lock(&self.sessions).remove(&session.0).is_some() {
            debug!("session released");
        }
        Ok(())
    }
}

/// Read agent stdout line by line into session messages.
async fn pump_stdout(
    session: Arc<Session>,
    stdout: ChildStdout,
    validator: Arc<Validator>,
    limit: usize,
) -> Result<()> {
    let log_path = session.dir.join("messages.jsonl");
    let mut log = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
        .with_context(|| format!("open {}", log_path.display()))?;
    let mut lines = BufReader::new(stdout).lines();

    while let Some(line) = lines.next_line().await.context("read agent stdout")? {
        match parse_agent_line(&line) {
            AgentLine::Blank => {}
            AgentLine::Result(value) => {
                let decoded = decode_result(&validator, value).map_err(|err| format!("{err:#}"));
                if let Err(err) = &decoded {
                    warn!(err = %err, "agent printed an invalid result");
                }
                *lock(&session.result) = Some(decoded);
            }
            AgentLine::Message {
                origin,
                mut content,
            } => {
                if content.len() > limit {
                    let mut cut = limit;
                    while !content.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    content.truncate(cut);
                    content.push_str(" [truncated]");
                }
                let message = Message::new(origin, content);
                let mut json = serde_json::to_string(&message).context("serialize message")?;
                json.push('\n');
                if let Err(err) = log.write_all(json.as_bytes()).await {
                    warn!(err = %err, "failed to append session message");
                }
                session.push_message(message);
            }
        }
    }
    log.flush().await.context("flush session messages")?;
    Ok(())
}

/// Wait for the agent to exit (or be killed), then publish its exit status.
///
/// A killed session is published as soon as the agent is reaped, without
/// waiting for output readers that descendants may still be holding open.
async fn watch_child(
    session: Arc<Session>,
    mut child: Child,
    group: Option<u32>,
    mut pump: JoinHandle<Result<()>>,
    mut drain: JoinHandle<std::io::Result<u64>>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        () = session.kill.cancelled() => None,
    };
    let (status, killed) = match exited {
        Some(status) => (status, false),
        None => {
            kill_group(group, &session.id);
            if let Err(err) = child.start_kill() {
                debug!(session_id = %session.id, err = %err, "agent already gone");
            }
            (child.wait().await, true)
        }
    };

    if killed {
        pump.abort();
        drain.abort();
    } else {
        match tokio::time::timeout(OUTPUT_GRACE, &mut pump).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => {
                warn!(session_id = %session.id, err = %format!("{err:#}"), "stdout reader failed");
            }
            Ok(Err(err)) => warn!(session_id = %session.id, err = %err, "stdout reader panicked"),
            Err(_) => {
                warn!(session_id = %session.id, "agent exited but its stdout stayed open, killing leftovers");
                kill_group(group, &session.id);
                pump.abort();
            }
        }
        match tokio::time::timeout(OUTPUT_GRACE, &mut drain).await {
            Ok(Ok(Ok(_))) => {}
            Ok(Ok(Err(err))) => {
                warn!(session_id = %session.id, err = %err, "failed to capture agent stderr");
            }
            Ok(Err(err)) => warn!(session_id = %session.id, err = %err, "stderr reader panicked"),
            Err(_) => drain.abort(),
        }
    }

    let info = match status {
        Ok(status) => ExitInfo {
            success: status.success() && !killed,
            code: status.code(),
            killed,
        },
        Err(err) => {
            warn!(session_id = %session.id, err = %err, "failed to wait for agent");
            ExitInfo {
                success: false,
                code: None,
                killed,
            }
        }
    };
    debug!(session_id = %session.id, exit_code = ?info.code, killed = info.killed, "agent exited");
    session.exit.send_replace(Some(info));
}

/// SIGKILL every process in the agent's group.
#[cfg(unix)]
fn kill_group(group: Option<u32>, session_id: &str) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pgid) = group.and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(session_id, pgid, err = %err, "failed to kill agent process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_group: Option<u32>, _session_id: &str) {}
