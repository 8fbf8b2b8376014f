//! Workflow markers carried as issue labels.
//!
//! The issue store only knows plain string labels. Markers use a `key:value`
//! shape (`policy:`, `phase:`, `retries:`, `agent:`, `tier:`); everything else
//! is a free tag used for agent tag constraints.

use crate::core::types::Tier;

pub const POLICY_PREFIX: &str = "policy:";
pub const PHASE_PREFIX: &str = "phase:";
pub const RETRIES_PREFIX: &str = "retries:";
pub const AGENT_PREFIX: &str = "agent:";
pub const TIER_PREFIX: &str = "tier:";

const MARKER_PREFIXES: [&str; 5] = [
    POLICY_PREFIX,
    PHASE_PREFIX,
    RETRIES_PREFIX,
    AGENT_PREFIX,
    TIER_PREFIX,
];

/// Markers parsed from an issue's labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueMarkers {
    pub policy: Option<String>,
    pub phase: Option<String>,
    pub retries: u32,
    pub pinned_agent: Option<String>,
    pub tier: Option<Tier>,
    /// Labels that are not workflow markers, in label order.
    pub tags: Vec<String>,
}

/// Parse workflow markers from labels.
///
/// The first occurrence of a marker wins. Unparseable `retries:` or `tier:`
/// values are ignored (treated as absent).
pub fn parse_markers(labels: &[String]) -> IssueMarkers {
    let mut markers = IssueMarkers::default();
    let mut retries_seen = false;
    for label in labels {
        let label = label.trim();
        if label.is_empty() {
            continue;
        }
        if let Some(value) = marker_value(label, POLICY_PREFIX) {
            markers.policy.get_or_insert_with(|| value.to_string());
        } else if let Some(value) = marker_value(label, PHASE_PREFIX) {
            markers.phase.get_or_insert_with(|| value.to_string());
        } else if let Some(value) = marker_value(label, RETRIES_PREFIX) {
            if !retries_seen && let Ok(n) = value.parse::<u32>() {
                markers.retries = n;
                retries_seen = true;
            }
        } else if let Some(value) = marker_value(label, AGENT_PREFIX) {
            markers.pinned_agent.get_or_insert_with(|| value.to_string());
        } else if let Some(value) = marker_value(label, TIER_PREFIX) {
            if markers.tier.is_none() {
                markers.tier = Tier::parse(value);
            }
        } else if !is_marker(label) {
            markers.tags.push(label.to_string());
        }
    }
    markers
}

/// Render a `phase:` label.
pub fn phase_label(phase: &str) -> String {
    format!("{PHASE_PREFIX}{phase}")
}

/// Render a `retries:` label.
pub fn retries_label(retries: u32) -> String {
    format!("{RETRIES_PREFIX}{retries}")
}

/// True if the label uses the given marker prefix (regardless of value).
pub fn has_prefix(label: &str, prefix: &str) -> bool {
    label.trim().starts_with(prefix)
}

fn is_marker(label: &str) -> bool {
    MARKER_PREFIXES.iter().any(|prefix| label.starts_with(prefix))
}

fn marker_value<'a>(label: &'a str, prefix: &str) -> Option<&'a str> {
    let value = label.strip_prefix(prefix)?.trim();
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_markers_and_keeps_free_tags_in_order() {
        let markers = parse_markers(&labels(&[
            "backend",
            "policy:bugfix",
            "phase:implement",
            "retries:2",
            "agent:claude",
            "tier:premium",
            "urgent",
        ]));
        assert_eq!(markers.policy.as_deref(), Some("bugfix"));
        assert_eq!(markers.phase.as_deref(), Some("implement"));
        assert_eq!(markers.retries, 2);
        assert_eq!(markers.pinned_agent.as_deref(), Some("claude"));
        assert_eq!(markers.tier, Some(Tier::Premium));
        assert_eq!(markers.tags, vec!["backend", "urgent"]);
    }

    #[test]
    fn first_marker_wins_and_bad_values_are_ignored() {
        let markers = parse_markers(&labels(&[
            "phase:plan",
            "phase:test",
            "retries:lots",
            "retries:1",
            "tier:gold",
        ]));
        assert_eq!(markers.phase.as_deref(), Some("plan"));
        assert_eq!(markers.retries, 1);
        assert_eq!(markers.tier, None);
        assert!(markers.tags.is_empty());
    }

    #[test]
    fn empty_marker_values_are_not_tags() {
        let markers = parse_markers(&labels(&["phase:", "policy: "]));
        assert_eq!(markers.phase, None);
        assert_eq!(markers.policy, None);
        assert!(markers.tags.is_empty());
    }

    #[test]
    fn renders_marker_labels() {
        assert_eq!(phase_label("test"), "phase:test");
        assert_eq!(retries_label(3), "retries:3");
        assert!(has_prefix("phase:test", PHASE_PREFIX));
    }
}
