//! Run ledger: append-only run log, derived index, and decision trail.
//!
//! Layout under the ledger directory:
//!
//! - `runs.jsonl`: one full [`Run`] snapshot per mutation. Source of truth.
//! - `decisions.jsonl`: one [`DecisionEntry`] per line. Never rewritten.
//! - `index.json`: disposable snapshot of the derived index, written by
//!   [`RunLedger::rebuild_index`] for external readers.
//!
//! Every mutation appends to the log before the in-memory index changes, so
//! the index can always be rebuilt from the log alone.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::types::{DecisionEntry, Run, RunOutcome, RunStatus, SessionRef};

pub const RUNS_FILE: &str = "runs.jsonl";
pub const DECISIONS_FILE: &str = "decisions.jsonl";
pub const INDEX_FILE: &str = "index.json";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("run '{0}' not found")]
    NotFound(String),
    /// Compare-and-swap precondition failed: someone else already moved the run.
    #[error("run '{run_id}' is {actual}, expected {expected}")]
    StatusConflict {
        run_id: String,
        expected: RunStatus,
        actual: RunStatus,
    },
    #[error("issue '{issue_id}' already has non-terminal run '{run_id}'")]
    ActiveRunExists { issue_id: String, run_id: String },
    #[error("run '{0}' already has an outcome")]
    OutcomeAlreadyAttached(String),
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: RunStatus, to: RunStatus },
    #[error("ledger persistence failed: {0:#}")]
    Persistence(#[from] anyhow::Error),
}

/// Fields needed to create a run in `pending`.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: String,
    pub issue_id: String,
    pub agent_id: String,
    pub policy: String,
    pub phase: String,
    pub attempt: u32,
}

/// Changes applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub session: Option<SessionRef>,
    pub outcome: Option<RunOutcome>,
}

impl RunPatch {
    pub fn session(session: SessionRef) -> Self {
        Self {
            session: Some(session),
            outcome: None,
        }
    }

    pub fn outcome(outcome: RunOutcome) -> Self {
        Self {
            session: None,
            outcome: Some(outcome),
        }
    }
}

#[derive(Debug, Serialize)]
struct IndexSnapshot<'a> {
    generated_at: DateTime<Utc>,
    runs: Vec<&'a Run>,
}

struct LedgerState {
    /// Latest snapshot per run id.
    runs: HashMap<String, Run>,
    /// Run ids in order of first appearance.
    order: Vec<String>,
    decisions: Vec<DecisionEntry>,
    runs_log: BufWriter<File>,
    decisions_log: BufWriter<File>,
}

/// Durable run ledger shared by the dispatcher and supervisor.
pub struct RunLedger {
    dir: PathBuf,
    state: Mutex<LedgerState>,
}

impl RunLedger {
    /// Open (or create) a ledger directory and rebuild the index from the log.
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create ledger dir {}", dir.display()))?;
        let runs_path = dir.join(RUNS_FILE);
        let decisions_path = dir.join(DECISIONS_FILE);

        let run_log: Replay<Run> = replay_lines(&runs_path)?;
        repair_tail(&runs_path, &run_log)?;
        let decision_log: Replay<DecisionEntry> = replay_lines(&decisions_path)?;
        repair_tail(&decisions_path, &decision_log)?;
        let (runs, order) = index_runs(run_log.entries);
        let decisions = decision_log.entries;
        debug!(
            dir = %dir.display(),
            runs = runs.len(),
            decisions = decisions.len(),
            "ledger opened"
        );

        Ok(Self {
            state: Mutex::new(LedgerState {
                runs,
                order,
                decisions,
                runs_log: open_append(&runs_path)?,
                decisions_log: open_append(&decisions_path)?,
            }),
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create a run in `pending`.
    ///
    /// Rejects a second non-terminal run for the same issue.
    pub fn create_run(&self, new: NewRun) -> Result<Run, LedgerError> {
        let mut state = self.lock();
        if let Some(active) = active_for_issue(&state, &new.issue_id) {
            return Err(LedgerError::ActiveRunExists {
                issue_id: new.issue_id,
                run_id: active.id.clone(),
            });
        }
        let now = Utc::now();
        let run = Run {
            id: new.id,
            issue_id: new.issue_id,
            agent_id: new.agent_id,
            policy: new.policy,
            phase: new.phase,
            attempt: new.attempt,
            status: RunStatus::Pending,
            session: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            outcome: None,
        };
        append_line(&mut state.runs_log, &run)?;
        state.order.push(run.id.clone());
        state.runs.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    /// Move a run from `expected` to `to`, applying `patch` atomically.
    ///
    /// The current status is a compare-and-swap precondition: if another
    /// writer already moved the run, this fails with
    /// [`LedgerError::StatusConflict`] and nothing is written.
    pub fn transition(
        &self,
        run_id: &str,
        expected: RunStatus,
        to: RunStatus,
        patch: RunPatch,
    ) -> Result<Run, LedgerError> {
        if !transition_allowed(expected, to) {
            return Err(LedgerError::IllegalTransition { from: expected, to });
        }
        let mut state = self.lock();
        let current = state
            .runs
            .get(run_id)
            .ok_or_else(|| LedgerError::NotFound(run_id.to_string()))?;
        if current.status != expected {
            return Err(LedgerError::StatusConflict {
                run_id: run_id.to_string(),
                expected,
                actual: current.status,
            });
        }
        if patch.outcome.is_some() && current.outcome.is_some() {
            return Err(LedgerError::OutcomeAlreadyAttached(run_id.to_string()));
        }

        let mut next = current.clone();
        let now = Utc::now();
        next.status = to;
        next.updated_at = now;
        if to.is_terminal() {
            next.completed_at = Some(now);
        }
        if let Some(session) = patch.session {
            next.session = Some(session);
        }
        if let Some(outcome) = patch.outcome {
            next.outcome = Some(outcome);
        }

        append_line(&mut state.runs_log, &next)?;
        state.runs.insert(next.id.clone(), next.clone());
        debug!(run_id, from = %expected, to = %to, "run transitioned");
        Ok(next)
    }

    /// Append a decision entry to the audit trail.
    pub fn record_decision(&self, entry: DecisionEntry) -> Result<(), LedgerError> {
        let mut state = self.lock();
        append_line(&mut state.decisions_log, &entry)?;
        state.decisions.push(entry);
        Ok(())
    }

    pub fn get(&self, run_id: &str) -> Option<Run> {
        self.lock().runs.get(run_id).cloned()
    }

    /// All runs in creation order.
    pub fn runs(&self) -> Vec<Run> {
        let state = self.lock();
        ordered(&state).cloned().collect()
    }

    pub fn runs_with_status(&self, status: RunStatus) -> Vec<Run> {
        let state = self.lock();
        ordered(&state)
            .filter(|run| run.status == status)
            .cloned()
            .collect()
    }

    pub fn runs_for_issue(&self, issue_id: &str) -> Vec<Run> {
        let state = self.lock();
        ordered(&state)
            .filter(|run| run.issue_id == issue_id)
            .cloned()
            .collect()
    }

    /// The `pending` or `running` run of an issue, if any.
    pub fn active_run_for_issue(&self, issue_id: &str) -> Option<Run> {
        let state = self.lock();
        active_for_issue(&state, issue_id).cloned()
    }

    pub fn decisions(&self) -> Vec<DecisionEntry> {
        self.lock().decisions.clone()
    }

    pub fn decisions_for_run(&self, run_id: &str) -> Vec<DecisionEntry> {
        self.lock()
            .decisions
            .iter()
            .filter(|entry| entry.run_id.as_deref() == Some(run_id))
            .cloned()
            .collect()
    }

    /// Drop the in-memory index, rebuild it from the log, and write `index.json`.
    ///
    /// Returns the number of runs indexed.
    pub fn rebuild_index(&self) -> anyhow::Result<usize> {
        let mut state = self.lock();
        state
            .runs_log
            .flush()
            .context("flush run log before reindex")?;
        let replay: Replay<Run> = replay_lines(&self.dir.join(RUNS_FILE))?;
        let (runs, order) = index_runs(replay.entries);
        state.runs = runs;
        state.order = order;

        let snapshot = IndexSnapshot {
            generated_at: Utc::now(),
            runs: ordered(&state).collect(),
        };
        let mut buf = serde_json::to_string_pretty(&snapshot).context("serialize index")?;
        buf.push('\n');
        write_atomic(&self.dir.join(INDEX_FILE), &buf)?;
        Ok(state.order.len())
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // A panic while holding the lock cannot leave the index ahead of the
        // log (the log is written first), so a poisoned state is still usable.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn transition_allowed(from: RunStatus, to: RunStatus) -> bool {
    matches!(
        (from, to),
        (RunStatus::Pending, RunStatus::Running)
            | (RunStatus::Pending, RunStatus::Failed)
            | (RunStatus::Running, RunStatus::Completed)
            | (RunStatus::Running, RunStatus::Failed)
            | (RunStatus::Running, RunStatus::Blocked)
    )
}

fn ordered(state: &LedgerState) -> impl Iterator<Item = &Run> {
    state.order.iter().filter_map(|id| state.runs.get(id))
}

fn active_for_issue<'a>(state: &'a LedgerState, issue_id: &str) -> Option<&'a Run> {
    ordered(state).find(|run| run.issue_id == issue_id && !run.status.is_terminal())
}

fn index_runs(snapshots: Vec<Run>) -> (HashMap<String, Run>, Vec<String>) {
    let mut runs = HashMap::new();
    let mut order = Vec::new();
    for run in snapshots {
        if !runs.contains_key(&run.id) {
            order.push(run.id.clone());
        }
        runs.insert(run.id.clone(), run);
    }
    (runs, order)
}

/// Entries read from a JSONL log plus where its intact prefix ends.
struct Replay<T> {
    entries: Vec<T>,
    /// Bytes up to and including the last well-formed line.
    intact_len: u64,
    /// The final line was malformed and is not part of the intact prefix.
    torn: bool,
    /// The intact prefix does not end with a newline.
    unterminated: bool,
}

/// Read a JSONL file. A malformed final line is treated as a torn write and
/// skipped; malformed lines elsewhere are an error.
fn replay_lines<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Replay<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(Replay {
                entries: Vec::new(),
                intact_len: 0,
                torn: false,
                unterminated: false,
            });
        }
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let lines: Vec<&[u8]> = bytes.split(|b| *b == b'\n').collect();
    let last_content = lines.iter().rposition(|line| !line.trim_ascii().is_empty());

    let mut entries = Vec::with_capacity(lines.len());
    let mut intact_len = 0;
    let mut torn = false;
    let mut offset = 0;
    for (idx, line) in lines.iter().enumerate() {
        // End of this line including its newline, if it has one.
        let line_end = (offset + line.len() + 1).min(bytes.len());
        offset += line.len() + 1;
        if line.trim_ascii().is_empty() {
            intact_len = line_end;
            continue;
        }
        match serde_json::from_slice(line) {
            Ok(entry) => {
                entries.push(entry);
                intact_len = line_end;
            }
            Err(err) if Some(idx) == last_content => {
                warn!(path = %path.display(), line = idx + 1, err = %err, "skipping torn trailing ledger line");
                torn = true;
                break;
            }
            Err(err) => {
                return Err(anyhow!(
                    "parse {} line {}: {}",
                    path.display(),
                    idx + 1,
                    err
                ));
            }
        }
    }
    Ok(Replay {
        entries,
        intact_len: intact_len as u64,
        torn,
        unterminated: intact_len > 0 && bytes[intact_len - 1] != b'\n',
    })
}

/// Cut a torn tail off the log and newline-terminate the intact prefix, so
/// the next append starts on a line of its own.
fn repair_tail<T>(path: &Path, replay: &Replay<T>) -> anyhow::Result<()> {
    if !replay.torn && !replay.unterminated {
        return Ok(());
    }
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("open {} for repair", path.display()))?;
    file.set_len(replay.intact_len)
        .with_context(|| format!("truncate {}", path.display()))?;
    if replay.unterminated {
        file.seek(SeekFrom::End(0))
            .and_then(|_| file.write_all(b"\n"))
            .with_context(|| format!("terminate last line of {}", path.display()))?;
    }
    file.sync_all()
        .with_context(|| format!("sync {}", path.display()))?;
    warn!(path = %path.display(), len = replay.intact_len, "repaired ledger tail");
    Ok(())
}

fn open_append(path: &Path) -> anyhow::Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {} for append", path.display()))?;
    Ok(BufWriter::new(file))
}

fn append_line<T: Serialize>(writer: &mut BufWriter<File>, value: &T) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(value).context("serialize ledger entry")?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .context("append ledger entry")?;
    writer.flush().context("flush ledger entry")?;
    Ok(())
}

fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp index {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace index {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::DecisionCategory;

    fn new_run(id: &str, issue: &str) -> NewRun {
        NewRun {
            id: id.to_string(),
            issue_id: issue.to_string(),
            agent_id: "coder".to_string(),
            policy: "default".to_string(),
            phase: "plan".to_string(),
            attempt: 0,
        }
    }

    #[test]
    fn create_rejects_second_active_run_for_issue() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = RunLedger::open(temp.path()).expect("open");
        ledger.create_run(new_run("r1", "iss-1")).expect("create");

        let err = ledger
            .create_run(new_run("r2", "iss-1"))
            .expect_err("second active run");
        assert!(matches!(err, LedgerError::ActiveRunExists { .. }));

        ledger
            .transition("r1", RunStatus::Pending, RunStatus::Failed, RunPatch::default())
            .expect("fail r1");
        ledger
            .create_run(new_run("r2", "iss-1"))
            .expect("create after terminal");
    }

    #[test]
    fn transition_is_compare_and_swap() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = RunLedger::open(temp.path()).expect("open");
        ledger.create_run(new_run("r1", "iss-1")).expect("create");
        ledger
            .transition(
                "r1",
                RunStatus::Pending,
                RunStatus::Running,
                RunPatch::session(SessionRef("s1".to_string())),
            )
            .expect("start");
        ledger
            .transition(
                "r1",
                RunStatus::Running,
                RunStatus::Failed,
                RunPatch::outcome(RunOutcome::failed("stalled")),
            )
            .expect("fail");

        let err = ledger
            .transition(
                "r1",
                RunStatus::Running,
                RunStatus::Completed,
                RunPatch::outcome(RunOutcome::succeeded("late")),
            )
            .expect_err("conflict");
        assert!(matches!(
            err,
            LedgerError::StatusConflict {
                actual: RunStatus::Failed,
                ..
            }
        ));
        let run = ledger.get("r1").expect("run");
        assert_eq!(run.outcome.expect("outcome").error.as_deref(), Some("stalled"));
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn terminal_runs_cannot_be_resurrected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = RunLedger::open(temp.path()).expect("open");
        let err = ledger
            .transition("r1", RunStatus::Failed, RunStatus::Running, RunPatch::default())
            .expect_err("illegal");
        assert!(matches!(err, LedgerError::IllegalTransition { .. }));
    }

    #[test]
    fn index_is_rebuilt_from_log_on_open() {
        let temp = tempfile::tempdir().expect("tempdir");
        {
            let ledger = RunLedger::open(temp.path()).expect("open");
            ledger.create_run(new_run("r1", "iss-1")).expect("create");
            ledger.create_run(new_run("r2", "iss-2")).expect("create");
            ledger
                .transition(
                    "r2",
                    RunStatus::Pending,
                    RunStatus::Running,
                    RunPatch::session(SessionRef("s2".to_string())),
                )
                .expect("start");
            ledger
                .record_decision(DecisionEntry::new(
                    Some("r2"),
                    "iss-2",
                    DecisionCategory::AgentSelection,
                    "coder",
                    "highest priority",
                ))
                .expect("decision");
        }

        let reopened = RunLedger::open(temp.path()).expect("reopen");
        let ids: Vec<String> = reopened.runs().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
        assert_eq!(reopened.runs_with_status(RunStatus::Running).len(), 1);
        assert_eq!(reopened.decisions_for_run("r2").len(), 1);

        let log = fs::read_to_string(temp.path().join(RUNS_FILE)).expect("read log");
        assert_eq!(log.lines().count(), 3, "one snapshot per mutation");
    }

    #[test]
    fn torn_trailing_line_is_skipped_but_corruption_is_not() {
        let temp = tempfile::tempdir().expect("tempdir");
        {
            let ledger = RunLedger::open(temp.path()).expect("open");
            ledger.create_run(new_run("r1", "iss-1")).expect("create");
        }
        let log_path = temp.path().join(RUNS_FILE);
        let mut contents = fs::read_to_string(&log_path).expect("read");
        contents.push_str("{\"id\":\"r2\",\"iss");
        fs::write(&log_path, &contents).expect("write torn");
        let ledger = RunLedger::open(temp.path()).expect("open with torn tail");
        assert_eq!(ledger.runs().len(), 1);
        drop(ledger);

        let corrupted = format!("garbage\n{contents}\n");
        fs::write(&log_path, corrupted).expect("write corrupted");
        assert!(RunLedger::open(temp.path()).is_err());
    }

    #[test]
    fn appends_after_torn_tail_survive_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        {
            let ledger = RunLedger::open(temp.path()).expect("open");
            ledger.create_run(new_run("r1", "iss-1")).expect("create");
            ledger
                .record_decision(DecisionEntry::new(
                    Some("r1"),
                    "iss-1",
                    DecisionCategory::AgentSelection,
                    "coder",
                    "only candidate",
                ))
                .expect("decision");
        }
        for (file, torn) in [(RUNS_FILE, "{\"id\":\"r2\",\"iss"), (DECISIONS_FILE, "{\"run_")] {
            let path = temp.path().join(file);
            let mut contents = fs::read_to_string(&path).expect("read");
            contents.push_str(torn);
            fs::write(&path, contents).expect("write torn");
        }

        {
            let ledger = RunLedger::open(temp.path()).expect("open with torn tails");
            assert_eq!(ledger.runs().len(), 1);
            ledger.create_run(new_run("r3", "iss-3")).expect("create r3");
            ledger.create_run(new_run("r4", "iss-4")).expect("create r4");
            ledger
                .record_decision(DecisionEntry::new(
                    Some("r3"),
                    "iss-3",
                    DecisionCategory::AgentSelection,
                    "coder",
                    "only candidate",
                ))
                .expect("decision");
        }

        let reopened = RunLedger::open(temp.path()).expect("reopen after appends");
        let ids: Vec<String> = reopened.runs().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["r1", "r3", "r4"]);
        assert_eq!(reopened.decisions().len(), 2);
        assert_eq!(reopened.decisions_for_run("r3").len(), 1);
    }

    #[test]
    fn unterminated_last_line_is_kept_and_terminated() {
        let temp = tempfile::tempdir().expect("tempdir");
        {
            let ledger = RunLedger::open(temp.path()).expect("open");
            ledger.create_run(new_run("r1", "iss-1")).expect("create");
        }
        let path = temp.path().join(RUNS_FILE);
        let contents = fs::read_to_string(&path).expect("read");
        fs::write(&path, contents.trim_end()).expect("strip newline");

        {
            let ledger = RunLedger::open(temp.path()).expect("open");
            assert_eq!(ledger.runs().len(), 1);
            ledger.create_run(new_run("r2", "iss-2")).expect("create r2");
        }
        let reopened = RunLedger::open(temp.path()).expect("reopen");
        assert_eq!(reopened.runs().len(), 2);
    }

    #[test]
    fn rebuild_index_writes_disposable_snapshot() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = RunLedger::open(temp.path()).expect("open");
        ledger.create_run(new_run("r1", "iss-1")).expect("create");

        assert_eq!(ledger.rebuild_index().expect("reindex"), 1);
        let index = fs::read_to_string(temp.path().join(INDEX_FILE)).expect("index");
        assert!(index.contains("\"r1\""));

        fs::remove_file(temp.path().join(INDEX_FILE)).expect("drop index");
        let reopened = RunLedger::open(temp.path()).expect("reopen");
        assert!(reopened.get("r1").is_some());
    }
}
