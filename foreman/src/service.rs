//! Wires the adapters together and runs both loops.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::claims::IssueClaims;
use crate::core::agents::AgentRegistry;
use crate::core::policy::PolicyRegistry;
use crate::dispatch::Dispatcher;
use crate::io::config::ForemanConfig;
use crate::io::issue_store::{CommandIssueStore, IssueStore};
use crate::io::ledger::RunLedger;
use crate::io::provider::{CommandProvider, ExecutionProvider};
use crate::supervise::Supervisor;

/// Shared handles used by both loops.
#[derive(Clone)]
pub struct Collaborators {
    pub issues: Arc<dyn IssueStore>,
    pub provider: Arc<dyn ExecutionProvider>,
    pub ledger: Arc<RunLedger>,
    pub policies: Arc<PolicyRegistry>,
    pub agents: Arc<AgentRegistry>,
}

impl Collaborators {
    /// Build the command-backed adapters and open the ledger.
    pub fn from_config(config: &ForemanConfig) -> Result<Self> {
        let issues = CommandIssueStore::new(config.issue_store.clone())
            .context("configure issue store")?;
        let provider = CommandProvider::new(&config.provider, config.sessions_dir())
            .context("configure execution provider")?;
        let ledger = RunLedger::open(config.ledger_dir()).context("open run ledger")?;
        Ok(Self {
            issues: Arc::new(issues),
            provider: Arc::new(provider),
            ledger: Arc::new(ledger),
            policies: Arc::new(config.policy_registry()),
            agents: Arc::new(config.agent_registry()),
        })
    }
}

/// Dispatcher and supervisor sharing one claim table.
pub struct Service {
    pub dispatcher: Dispatcher,
    pub supervisor: Supervisor,
    claims: IssueClaims,
    shutdown: CancellationToken,
    dispatch_every: Duration,
    supervise_every: Duration,
}

impl Service {
    pub fn new(
        config: &ForemanConfig,
        deps: Collaborators,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let claims = IssueClaims::new(shutdown.clone());
        let dispatcher = Dispatcher::new(
            deps.clone(),
            claims.clone(),
            config.max_concurrent_runs,
            config.instruction_budget_bytes,
        )?;
        let supervisor = Supervisor::new(deps, claims.clone(), config.timeout_multiplier);
        Ok(Self {
            dispatcher,
            supervisor,
            claims,
            shutdown,
            dispatch_every: config.dispatch_interval(),
            supervise_every: config.supervise_interval(),
        })
    }

    /// Recover, then run both loops until the shutdown token fires.
    ///
    /// The dispatcher finishes the tick in progress (its waits end through the
    /// claim tokens) before this returns.
    #[instrument(skip_all)]
    pub async fn run(self) -> Result<()> {
        let recovered = self.supervisor.recover_interrupted_runs().await;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered interrupted runs");
        }

        let Service {
            dispatcher,
            supervisor,
            claims,
            shutdown,
            dispatch_every,
            supervise_every,
        } = self;

        let dispatch_shutdown = shutdown.clone();
        let dispatch_loop = tokio::spawn(async move {
            let mut ticker = interval(dispatch_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = dispatch_shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = dispatcher.tick().await;
                        debug!(?report, "dispatch tick done");
                    }
                }
            }
        });

        let supervise_shutdown = shutdown;
        let supervise_loop = tokio::spawn(async move {
            let mut ticker = interval(supervise_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = supervise_shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = supervisor.scan().await;
                        debug!(?report, "supervisor scan done");
                    }
                }
            }
        });

        info!(
            dispatch_secs = dispatch_every.as_secs(),
            supervise_secs = supervise_every.as_secs(),
            "foreman running"
        );
        let (dispatch, supervise) = tokio::join!(dispatch_loop, supervise_loop);
        dispatch.context("dispatcher loop panicked")?;
        supervise.context("supervisor loop panicked")?;
        if !claims.is_empty() {
            warn!(claims = claims.len(), "claims still held at shutdown");
        }
        info!("foreman stopped");
        Ok(())
    }
}

/// Cancel `shutdown` on Ctrl-C.
pub fn cancel_on_ctrl_c(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                shutdown.cancel();
            }
            Err(err) => warn!(err = %err, "failed to listen for interrupt"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{IssueStatus, RunStatus};
    use crate::test_support::{Harness, Script, agent, issue, policy};

    fn fast_config() -> ForemanConfig {
        ForemanConfig {
            dispatch_interval_secs: 1,
            supervise_interval_secs: 1,
            ..ForemanConfig::default()
        }
    }

    #[tokio::test]
    async fn loops_stop_on_shutdown_after_recovering() {
        let h = Harness::new(
            PolicyRegistry::new(vec![policy("default", &[("implement", "coding")])], "default"),
            vec![agent("coder", &["coding"], 1)],
        );
        h.issues.insert(issue("iss-1"), &[]);
        let orphan = h.start_run("iss-1", "implement");
        h.provider.push(Script::complete(true, "done"));

        let shutdown = CancellationToken::new();
        let service =
            Service::new(&fast_config(), h.collaborators(), shutdown.clone()).expect("service");
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stopper.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), service.run())
            .await
            .expect("service stopped")
            .expect("service ok");

        assert_eq!(h.ledger.get(&orphan.id).expect("run").status, RunStatus::Failed);
        // The first dispatch tick fires immediately and finishes the reopened issue.
        assert_eq!(h.issues.status("iss-1"), Some(IssueStatus::Closed));
    }
}
