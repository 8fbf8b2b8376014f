//! Per-issue mutual exclusion and per-run cancellation.
//!
//! The dispatcher claims an issue before creating a run and holds the claim
//! until the run's transition has been applied. Each claim owns a child of the
//! service's shutdown token, so the supervisor can end a dispatcher's wait for
//! a run it has already failed or blocked.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct ClaimEntry {
    /// Set once the run has been created.
    run_id: Option<String>,
    cancel: CancellationToken,
}

type ClaimTable = Arc<Mutex<HashMap<String, ClaimEntry>>>;

/// Shared table of claimed issues. Cheap to clone.
#[derive(Debug, Clone)]
pub struct IssueClaims {
    table: ClaimTable,
    root: CancellationToken,
}

impl IssueClaims {
    /// Claims whose tokens are children of `root`.
    pub fn new(root: CancellationToken) -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            root,
        }
    }

    /// Claim an issue. Returns `None` if it is already claimed.
    pub fn try_claim(&self, issue_id: &str) -> Option<IssueClaim> {
        let mut table = lock(&self.table);
        if table.contains_key(issue_id) {
            return None;
        }
        let cancel = self.root.child_token();
        table.insert(
            issue_id.to_string(),
            ClaimEntry {
                run_id: None,
                cancel: cancel.clone(),
            },
        );
        Some(IssueClaim {
            issue_id: issue_id.to_string(),
            cancel,
            table: self.table.clone(),
        })
    }

    pub fn is_claimed(&self, issue_id: &str) -> bool {
        lock(&self.table).contains_key(issue_id)
    }

    /// Cancel the claim bound to `run_id`. Returns whether one was found.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        let table = lock(&self.table);
        let found = table
            .iter()
            .find(|(_, entry)| entry.run_id.as_deref() == Some(run_id));
        match found {
            Some((issue_id, entry)) => {
                debug!(issue_id = %issue_id, run_id, "cancelling dispatcher wait");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether the service is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }

    pub fn len(&self) -> usize {
        lock(&self.table).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive claim on one issue. Released on drop.
#[derive(Debug)]
pub struct IssueClaim {
    issue_id: String,
    cancel: CancellationToken,
    table: ClaimTable,
}

impl IssueClaim {
    pub fn issue_id(&self) -> &str {
        &self.issue_id
    }

    /// Associate the claim with the run created for it.
    pub fn bind_run(&self, run_id: &str) {
        if let Some(entry) = lock(&self.table).get_mut(&self.issue_id) {
            entry.run_id = Some(run_id.to_string());
        }
    }

    /// Token cancelled by the supervisor or by service shutdown.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for IssueClaim {
    fn drop(&mut self) {
        lock(&self.table).remove(&self.issue_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
