//! Foreman configuration stored in `foreman.toml`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::agents::{AgentDescriptor, AgentRegistry};
use crate::core::policy::{PhaseConfig, Policy, PolicyRegistry, builtin_default_policy};
use crate::core::types::Tier;

pub const DEFAULT_CONFIG_PATH: &str = "foreman.toml";
/// Largest accepted `timeout_multiplier`.
pub const MAX_TIMEOUT_MULTIPLIER: f64 = 100.0;

/// Foreman configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// values suitable for a single local tracker and agent CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ForemanConfig {
    /// Seconds between dispatcher ticks.
    pub dispatch_interval_secs: u64,

    /// Seconds between supervisor scans.
    pub supervise_interval_secs: u64,

    /// Upper bound on simultaneously running runs.
    pub max_concurrent_runs: usize,

    /// Stall threshold for policies that do not set their own.
    pub stall_threshold_secs: u64,

    /// Supervisor timeout is the phase timeout scaled by this factor.
    pub timeout_multiplier: f64,

    pub default_policy: String,

    /// Directory holding the run ledger and provider sessions.
    pub state_dir: PathBuf,

    /// Maximum bytes for rendered phase instructions before dropping sections.
    pub instruction_budget_bytes: usize,

    pub issue_store: IssueStoreConfig,

    pub provider: ProviderConfig,

    pub policies: Vec<PolicyConfig>,

    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IssueStoreConfig {
    /// Tracker CLI argv prefix (e.g. `["bd"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for IssueStoreConfig {
    fn default() -> Self {
        Self {
            command: vec!["bd".to_string()],
            timeout_secs: 30,
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Agent CLI argv. Receives instructions on stdin.
    pub command: Vec<String>,
    /// Truncate captured stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyConfig {
    pub name: String,
    #[serde(default)]
    pub stall_threshold_secs: Option<u64>,
    pub phases: Vec<PhaseConfigEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseConfigEntry {
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_phase_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    #[serde(default)]
    pub requires_approval: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub allowed_tags: Option<Vec<String>>,
    #[serde(default)]
    pub tier: Option<Tier>,
    #[serde(default)]
    pub priority: i64,
}

fn default_phase_timeout_secs() -> u64 {
    30 * 60
}

fn default_retry_limit() -> u32 {
    2
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_secs: 10,
            supervise_interval_secs: 15,
            max_concurrent_runs: 1,
            stall_threshold_secs: 10 * 60,
            timeout_multiplier: 1.5,
            default_policy: "default".to_string(),
            state_dir: PathBuf::from(".foreman"),
            instruction_budget_bytes: 40_000,
            issue_store: IssueStoreConfig::default(),
            provider: ProviderConfig::default(),
            policies: Vec::new(),
            agents: Vec::new(),
        }
    }
}

impl ForemanConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dispatch_interval_secs == 0 {
            return Err(anyhow!("dispatch_interval_secs must be > 0"));
        }
        if self.supervise_interval_secs == 0 {
            return Err(anyhow!("supervise_interval_secs must be > 0"));
        }
        if self.max_concurrent_runs == 0 {
            return Err(anyhow!("max_concurrent_runs must be > 0"));
        }
        if self.stall_threshold_secs == 0 {
            return Err(anyhow!("stall_threshold_secs must be > 0"));
        }
        if !(self.timeout_multiplier > 0.0 && self.timeout_multiplier <= MAX_TIMEOUT_MULTIPLIER) {
            return Err(anyhow!(
                "timeout_multiplier must be in (0, {MAX_TIMEOUT_MULTIPLIER}]"
            ));
        }
        if self.instruction_budget_bytes == 0 {
            return Err(anyhow!("instruction_budget_bytes must be > 0"));
        }
        if self.issue_store.command.is_empty() || self.issue_store.command[0].trim().is_empty() {
            return Err(anyhow!("issue_store.command must be a non-empty array"));
        }
        if self.issue_store.timeout_secs == 0 {
            return Err(anyhow!("issue_store.timeout_secs must be > 0"));
        }
        if self.provider.command.is_empty() || self.provider.command[0].trim().is_empty() {
            return Err(anyhow!("provider.command must be a non-empty array"));
        }

        let mut policy_names = HashSet::new();
        for policy in &self.policies {
            if !policy_names.insert(policy.name.as_str()) {
                return Err(anyhow!("duplicate policy '{}'", policy.name));
            }
            if policy.phases.is_empty() {
                return Err(anyhow!("policy '{}' must define phases", policy.name));
            }
            if policy.stall_threshold_secs == Some(0) {
                return Err(anyhow!(
                    "policy '{}': stall_threshold_secs must be > 0",
                    policy.name
                ));
            }
            let mut phase_names = HashSet::new();
            for phase in &policy.phases {
                if !phase_names.insert(phase.name.as_str()) {
                    return Err(anyhow!(
                        "policy '{}': duplicate phase '{}'",
                        policy.name,
                        phase.name
                    ));
                }
                if phase.timeout_secs == 0 {
                    return Err(anyhow!(
                        "policy '{}' phase '{}': timeout_secs must be > 0",
                        policy.name,
                        phase.name
                    ));
                }
            }
        }
        let default_known = if self.policies.is_empty() {
            self.default_policy == "default"
        } else {
            policy_names.contains(self.default_policy.as_str())
        };
        if !default_known {
            return Err(anyhow!(
                "default_policy '{}' does not name a configured policy",
                self.default_policy
            ));
        }

        let mut agent_ids = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(anyhow!("agent id must not be empty"));
            }
            if !agent_ids.insert(agent.id.as_str()) {
                return Err(anyhow!("duplicate agent '{}'", agent.id));
            }
        }
        Ok(())
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs)
    }

    pub fn supervise_interval(&self) -> Duration {
        Duration::from_secs(self.supervise_interval_secs)
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.state_dir.join("ledger")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    /// Build the policy registry. Falls back to the built-in workflow.
    pub fn policy_registry(&self) -> PolicyRegistry {
        let default_stall = Duration::from_secs(self.stall_threshold_secs);
        if self.policies.is_empty() {
            return PolicyRegistry::new(
                vec![builtin_default_policy(default_stall)],
                self.default_policy.clone(),
            );
        }
        let policies = self
            .policies
            .iter()
            .map(|policy| Policy {
                name: policy.name.clone(),
                stall_threshold: policy
                    .stall_threshold_secs
                    .map_or(default_stall, Duration::from_secs),
                phases: policy
                    .phases
                    .iter()
                    .map(|phase| PhaseConfig {
                        name: phase.name.clone(),
                        capabilities: phase.capabilities.iter().cloned().collect(),
                        timeout_base: Duration::from_secs(phase.timeout_secs),
                        retry_limit: phase.retry_limit,
                        requires_approval: phase.requires_approval,
                    })
                    .collect(),
            })
            .collect();
        PolicyRegistry::new(policies, self.default_policy.clone())
    }

    /// Build the agent registry, preserving definition order.
    pub fn agent_registry(&self) -> AgentRegistry {
        AgentRegistry::new(
            self.agents
                .iter()
                .map(|agent| AgentDescriptor {
                    id: agent.id.clone(),
                    capabilities: agent.capabilities.iter().cloned().collect(),
                    allowed_tags: agent.allowed_tags.clone(),
                    tier: agent.tier,
                    priority: agent.priority,
                })
                .collect(),
        )
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ForemanConfig::default()`.
pub fn load_config(path: &Path) -> Result<ForemanConfig> {
    if !path.exists() {
        let cfg = ForemanConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ForemanConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ForemanConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ForemanConfig {
        ForemanConfig {
            max_concurrent_runs: 4,
            default_policy: "bugfix".to_string(),
            policies: vec![PolicyConfig {
                name: "bugfix".to_string(),
                stall_threshold_secs: Some(120),
                phases: vec![
                    PhaseConfigEntry {
                        name: "reproduce".to_string(),
                        capabilities: vec!["debugging".to_string()],
                        timeout_secs: 600,
                        retry_limit: 1,
                        requires_approval: false,
                    },
                    PhaseConfigEntry {
                        name: "fix".to_string(),
                        capabilities: vec!["coding".to_string()],
                        timeout_secs: 1200,
                        retry_limit: 3,
                        requires_approval: true,
                    },
                ],
            }],
            agents: vec![AgentConfig {
                id: "claude".to_string(),
                capabilities: vec!["coding".to_string(), "debugging".to_string()],
                allowed_tags: None,
                tier: Some(Tier::Premium),
                priority: 10,
            }],
            ..ForemanConfig::default()
        }
    }

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ForemanConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("foreman.toml");
        let cfg = sample_config();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_takes_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("foreman.toml");
        fs::write(
            &path,
            r#"
max_concurrent_runs = 3

[[agents]]
id = "coder"
capabilities = ["coding"]

[[policies]]
name = "default"

[[policies.phases]]
name = "implement"
capabilities = ["coding"]
"#,
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_concurrent_runs, 3);
        assert_eq!(cfg.dispatch_interval_secs, 10);
        assert_eq!(cfg.policies[0].phases[0].timeout_secs, 30 * 60);
        assert_eq!(cfg.policies[0].phases[0].retry_limit, 2);
        assert_eq!(cfg.agents[0].priority, 0);
    }

    #[test]
    fn registries_follow_config() {
        let cfg = sample_config();
        let policies = cfg.policy_registry();
        assert_eq!(policies.default_policy(), "bugfix");
        let policy = policies.policy("bugfix").expect("policy");
        assert_eq!(policy.stall_threshold, Duration::from_secs(120));
        let fix = policies.phase_config("bugfix", "fix").expect("phase");
        assert!(fix.requires_approval);
        assert_eq!(fix.timeout_base, Duration::from_secs(1200));

        let agents = cfg.agent_registry();
        assert_eq!(agents.agents()[0].id, "claude");
    }

    #[test]
    fn empty_policies_use_builtin_default() {
        let policies = ForemanConfig::default().policy_registry();
        assert_eq!(
            policies.phase_sequence("default").expect("sequence"),
            vec!["plan", "implement", "test"]
        );
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = ForemanConfig {
            max_concurrent_runs: 0,
            ..ForemanConfig::default()
        };
        assert!(cfg.validate().is_err());

        cfg = sample_config();
        cfg.default_policy = "missing".to_string();
        let err = cfg.validate().expect_err("unknown default policy");
        assert!(err.to_string().contains("default_policy"));

        cfg = sample_config();
        cfg.agents.push(cfg.agents[0].clone());
        let err = cfg.validate().expect_err("duplicate agent");
        assert!(err.to_string().contains("duplicate agent"));

        cfg = ForemanConfig {
            timeout_multiplier: 0.0,
            ..ForemanConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn timeout_multiplier_is_bounded() {
        for multiplier in [1e17, f64::INFINITY, f64::NAN, MAX_TIMEOUT_MULTIPLIER + 1.0] {
            let cfg = ForemanConfig {
                timeout_multiplier: multiplier,
                ..ForemanConfig::default()
            };
            let err = cfg.validate().expect_err("multiplier out of range");
            assert!(err.to_string().contains("timeout_multiplier"));
        }
        let cfg = ForemanConfig {
            timeout_multiplier: MAX_TIMEOUT_MULTIPLIER,
            ..ForemanConfig::default()
        };
        cfg.validate().expect("upper bound is allowed");
    }
}
