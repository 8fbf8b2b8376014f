//! Issue-driven orchestration of coding agents.
//!
//! Foreman polls an external issue tracker, assigns ready issues to agents by
//! capability, drives each issue through the phases of its policy, and
//! supervises running sessions for stalls, timeouts, human takeover and
//! approval gates. Every run and every decision is recorded in an append-only
//! ledger.
//!
//! - **[`core`]**: Pure, deterministic logic (policies, agent selection,
//!   supervision verdicts). No I/O.
//! - **[`io`]**: Side-effecting adapters (config, ledger files, tracker and
//!   agent CLIs). Behind traits where tests substitute doubles.
//!
//! Orchestration modules ([`dispatch`], [`supervise`], [`service`]) combine the
//! two into the dispatcher and supervisor loops.

pub mod claims;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod io;
pub mod logging;
pub mod service;
pub mod supervise;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
