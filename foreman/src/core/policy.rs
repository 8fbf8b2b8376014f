//! Named workflows and the phase transition function.

use std::time::Duration;

use thiserror::Error;

use crate::core::types::{Capabilities, RunOutcome, Transition, TransitionKind};

pub const REASON_APPROVAL_REQUIRED: &str = "approval required";
pub const REASON_RETRY_LIMIT_EXCEEDED: &str = "retry limit exceeded";

/// Policy lookup failures. Fatal for the issue being processed, never for the loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("unknown policy '{0}'")]
    UnknownPolicy(String),
    #[error("unknown phase '{phase}' in policy '{policy}'")]
    UnknownPhase { policy: String, phase: String },
    #[error("policy '{0}' has no phases")]
    EmptyPolicy(String),
}

/// Per-phase configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseConfig {
    pub name: String,
    pub capabilities: Capabilities,
    pub timeout_base: Duration,
    pub retry_limit: u32,
    pub requires_approval: bool,
}

/// A named workflow: ordered phases plus a stall threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub name: String,
    pub stall_threshold: Duration,
    pub phases: Vec<PhaseConfig>,
}

impl Policy {
    fn phase_index(&self, phase: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == phase)
    }
}

/// Read-only registry of policies, constructed once and shared by reference.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: Vec<Policy>,
    default_policy: String,
}

impl PolicyRegistry {
    /// Build a registry. Policies keep their definition order.
    pub fn new(policies: Vec<Policy>, default_policy: impl Into<String>) -> Self {
        Self {
            policies,
            default_policy: default_policy.into(),
        }
    }

    pub fn default_policy(&self) -> &str {
        &self.default_policy
    }

    pub fn policy(&self, name: &str) -> Result<&Policy, PolicyError> {
        self.policies
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| PolicyError::UnknownPolicy(name.to_string()))
    }

    /// Ordered phase names of a policy.
    pub fn phase_sequence(&self, policy: &str) -> Result<Vec<&str>, PolicyError> {
        Ok(self
            .policy(policy)?
            .phases
            .iter()
            .map(|p| p.name.as_str())
            .collect())
    }

    pub fn phase_config(&self, policy: &str, phase: &str) -> Result<&PhaseConfig, PolicyError> {
        let found = self.policy(policy)?;
        found
            .phase_index(phase)
            .map(|idx| &found.phases[idx])
            .ok_or_else(|| PolicyError::UnknownPhase {
                policy: policy.to_string(),
                phase: phase.to_string(),
            })
    }

    /// Resolve the policy and phase an issue is in.
    ///
    /// Missing markers fall back to the default policy and its first phase.
    pub fn resolve<'a>(
        &'a self,
        policy: Option<&'a str>,
        phase: Option<&'a str>,
    ) -> Result<(&'a Policy, &'a PhaseConfig), PolicyError> {
        let found = self.policy(policy.unwrap_or(&self.default_policy))?;
        let phase_cfg = match phase {
            Some(name) => self.phase_config(&found.name, name)?,
            None => found
                .phases
                .first()
                .ok_or_else(|| PolicyError::EmptyPolicy(found.name.clone()))?,
        };
        Ok((found, phase_cfg))
    }

    /// Decide what happens to an issue after a run of `phase` produced `outcome`.
    ///
    /// Pure: the same inputs always yield the same transition. Approval
    /// dominates success and failure; retry exhaustion is only considered once
    /// success is ruled out.
    pub fn transition(
        &self,
        policy: &str,
        phase: &str,
        outcome: &RunOutcome,
        retry_count: u32,
    ) -> Result<Transition, PolicyError> {
        let found = self.policy(policy)?;
        let idx = found
            .phase_index(phase)
            .ok_or_else(|| PolicyError::UnknownPhase {
                policy: policy.to_string(),
                phase: phase.to_string(),
            })?;
        let phase_cfg = &found.phases[idx];

        if outcome.requires_approval {
            return Ok(Transition {
                kind: TransitionKind::Block,
                next_phase: None,
                reason: REASON_APPROVAL_REQUIRED.to_string(),
            });
        }

        if outcome.success {
            return Ok(match found.phases.get(idx + 1) {
                None => Transition {
                    kind: TransitionKind::Close,
                    next_phase: None,
                    reason: format!("final phase '{phase}' succeeded"),
                },
                Some(next) => Transition {
                    kind: TransitionKind::Advance,
                    next_phase: Some(next.name.clone()),
                    reason: format!("phase '{phase}' succeeded"),
                },
            });
        }

        if retry_count < phase_cfg.retry_limit {
            return Ok(Transition {
                kind: TransitionKind::Retry,
                next_phase: Some(phase.to_string()),
                reason: format!(
                    "phase '{phase}' failed (retry {} of {})",
                    retry_count + 1,
                    phase_cfg.retry_limit
                ),
            });
        }

        Ok(Transition {
            kind: TransitionKind::Block,
            next_phase: None,
            reason: REASON_RETRY_LIMIT_EXCEEDED.to_string(),
        })
    }
}

/// Built-in `plan → implement → test` workflow used when none is configured.
pub fn builtin_default_policy(stall_threshold: Duration) -> Policy {
    let phase = |name: &str, capability: &str| PhaseConfig {
        name: name.to_string(),
        capabilities: [capability.to_string()].into_iter().collect(),
        timeout_base: Duration::from_secs(30 * 60),
        retry_limit: 2,
        requires_approval: false,
    };
    Policy {
        name: "default".to_string(),
        stall_threshold,
        phases: vec![
            phase("plan", "planning"),
            phase("implement", "coding"),
            phase("test", "testing"),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PolicyRegistry {
        let mut review = builtin_default_policy(Duration::from_secs(60));
        review.name = "review".to_string();
        review.phases[1].requires_approval = true;
        PolicyRegistry::new(
            vec![builtin_default_policy(Duration::from_secs(60)), review],
            "default",
        )
    }

    fn approval(success: bool) -> RunOutcome {
        let base = if success {
            RunOutcome::succeeded("ok")
        } else {
            RunOutcome::failed("boom")
        };
        RunOutcome {
            requires_approval: true,
            ..base
        }
    }

    #[test]
    fn phase_sequence_preserves_order() {
        let reg = registry();
        assert_eq!(
            reg.phase_sequence("default").expect("sequence"),
            vec!["plan", "implement", "test"]
        );
    }

    #[test]
    fn success_on_last_phase_closes() {
        let t = registry()
            .transition("default", "test", &RunOutcome::succeeded("ok"), 0)
            .expect("transition");
        assert_eq!(t.kind, TransitionKind::Close);
        assert_eq!(t.next_phase, None);
    }

    #[test]
    fn success_on_middle_phase_advances() {
        let t = registry()
            .transition("default", "plan", &RunOutcome::succeeded("ok"), 1)
            .expect("transition");
        assert_eq!(t.kind, TransitionKind::Advance);
        assert_eq!(t.next_phase.as_deref(), Some("implement"));
    }

    #[test]
    fn approval_blocks_instead_of_advancing() {
        let t = registry()
            .transition("default", "plan", &approval(true), 0)
            .expect("transition");
        assert_eq!(t.kind, TransitionKind::Block);
        assert_eq!(t.reason, REASON_APPROVAL_REQUIRED);
    }

    #[test]
    fn approval_dominates_failure_and_final_phase() {
        let reg = registry();
        let failed = reg
            .transition("default", "implement", &approval(false), 5)
            .expect("transition");
        assert_eq!(failed.reason, REASON_APPROVAL_REQUIRED);
        let last = reg
            .transition("default", "test", &approval(true), 0)
            .expect("transition");
        assert_eq!(last.kind, TransitionKind::Block);
    }

    #[test]
    fn failure_below_limit_retries_same_phase() {
        let t = registry()
            .transition("default", "implement", &RunOutcome::failed("boom"), 1)
            .expect("transition");
        assert_eq!(t.kind, TransitionKind::Retry);
        assert_eq!(t.next_phase.as_deref(), Some("implement"));
    }

    #[test]
    fn failure_at_limit_blocks() {
        let t = registry()
            .transition("default", "implement", &RunOutcome::failed("boom"), 2)
            .expect("transition");
        assert_eq!(t.kind, TransitionKind::Block);
        assert_eq!(t.reason, REASON_RETRY_LIMIT_EXCEEDED);
    }

    #[test]
    fn transition_is_pure() {
        let reg = registry();
        let outcome = RunOutcome::failed("boom");
        let first = reg.transition("default", "plan", &outcome, 1);
        for _ in 0..10 {
            assert_eq!(reg.transition("default", "plan", &outcome, 1), first);
        }
    }

    #[test]
    fn unknown_policy_and_phase_are_errors() {
        let reg = registry();
        assert_eq!(
            reg.transition("nope", "plan", &RunOutcome::succeeded("ok"), 0),
            Err(PolicyError::UnknownPolicy("nope".to_string()))
        );
        assert!(matches!(
            reg.phase_config("default", "deploy"),
            Err(PolicyError::UnknownPhase { .. })
        ));
    }

    #[test]
    fn resolve_defaults_to_first_phase_of_default_policy() {
        let reg = registry();
        let (policy, phase) = reg.resolve(None, None).expect("resolve");
        assert_eq!(policy.name, "default");
        assert_eq!(phase.name, "plan");

        let (policy, phase) = reg
            .resolve(Some("review"), Some("implement"))
            .expect("resolve");
        assert_eq!(policy.name, "review");
        assert!(phase.requires_approval);
    }
}
