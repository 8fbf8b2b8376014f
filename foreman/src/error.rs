//! Error taxonomy for per-issue processing.
//!
//! None of these ever stop a loop: the dispatcher converts each into a
//! decision entry and a log line at the issue boundary.

use thiserror::Error;

use crate::core::policy::PolicyError;
use crate::core::types::DecisionCategory;
use crate::io::ledger::LedgerError;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// No agent satisfies the phase requirements. The issue is left untouched.
    #[error("no agent provides capabilities [{required}]")]
    Selection { required: String },
    /// The provider failed or completion was not reached in time.
    #[error("execution failed: {0}")]
    Execution(String),
    /// Unknown policy or phase.
    #[error(transparent)]
    Transition(#[from] PolicyError),
    #[error(transparent)]
    Persistence(#[from] LedgerError),
    #[error("issue store: {0:#}")]
    IssueStore(anyhow::Error),
}

impl DispatchError {
    /// Decision category under which the error is recorded.
    pub fn category(&self) -> DecisionCategory {
        match self {
            DispatchError::Selection { .. } => DecisionCategory::NoAgent,
            DispatchError::Execution(_) => DecisionCategory::ExecutionError,
            DispatchError::Transition(_) => DecisionCategory::TransitionError,
            DispatchError::Persistence(_) => DecisionCategory::PersistenceError,
            DispatchError::IssueStore(_) => DecisionCategory::IssueStoreError,
        }
    }
}
