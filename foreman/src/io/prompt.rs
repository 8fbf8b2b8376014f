//! Phase instruction builder.
//!
//! Instructions are rendered from an embedded minijinja template whose output
//! is split into sections by `<!-- section:KEY required|droppable -->` markers.
//! When the rendered text exceeds the byte budget, droppable sections go first,
//! then the longest remaining section is cut until the joined text fits.

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::policy::{PhaseConfig, Policy};
use crate::core::types::Issue;

const PHASE_TEMPLATE: &str = include_str!("prompts/phase.md");

/// Droppable sections, least important first.
const DROP_ORDER: [&str; 2] = ["dependencies", "previous"];

#[derive(Debug, Clone, Serialize)]
struct IssueContext<'a> {
    id: &'a str,
    title: &'a str,
    description: &'a str,
}

/// Everything the phase template needs.
#[derive(Debug, Clone)]
pub struct InstructionInputs<'a> {
    pub issue: &'a Issue,
    pub policy: &'a Policy,
    pub phase: &'a PhaseConfig,
    /// Retry counter of the issue for this phase.
    pub attempt: u32,
    /// Summary of the previous failed attempt of this phase, if any.
    pub previous: Option<String>,
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Renders phase instructions within a byte budget.
#[derive(Debug)]
pub struct InstructionBuilder {
    env: Environment<'static>,
    section_re: Regex,
    budget_bytes: usize,
}

impl InstructionBuilder {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("phase", PHASE_TEMPLATE)
            .context("phase template should be valid")?;
        let section_re = Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
            .context("section marker pattern")?;
        Ok(Self {
            env,
            section_re,
            budget_bytes,
        })
    }

    pub fn build(&self, input: &InstructionInputs<'_>) -> Result<String> {
        let rendered = self.render(input)?;
        let mut sections = self.parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join(SEPARATOR))
    }

    fn render(&self, input: &InstructionInputs<'_>) -> Result<String> {
        let position = input
            .policy
            .phases
            .iter()
            .position(|p| p.name == input.phase.name)
            .ok_or_else(|| {
                anyhow!(
                    "phase '{}' not in policy '{}'",
                    input.phase.name,
                    input.policy.name
                )
            })?;
        let template = self.env.get_template("phase")?;
        let rendered = template.render(context! {
            issue => IssueContext {
                id: &input.issue.id,
                title: input.issue.title.trim(),
                description: input.issue.description.trim(),
            },
            policy => &input.policy.name,
            phase => &input.phase.name,
            phase_position => position + 1,
            phase_count => input.policy.phases.len(),
            capabilities => input.phase.capabilities.iter().collect::<Vec<_>>(),
            attempt => input.attempt,
            retry_limit => input.phase.retry_limit,
            requires_approval => input.phase.requires_approval,
            dependencies => &input.issue.dependencies,
            previous => input.previous.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }

    fn parse_sections(&self, rendered: &str) -> Vec<ParsedSection> {
        let markers: Vec<_> = self.section_re.captures_iter(rendered).collect();
        let mut sections = Vec::new();
        for (i, caps) in markers.iter().enumerate() {
            let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            let end = markers
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map_or(rendered.len(), |m| m.start());
            let content = rendered[whole.end()..end].trim().to_string();
            let required = kind.as_str() == "required";
            if !content.is_empty() || required {
                sections.push(ParsedSection {
                    key: key.as_str().to_string(),
                    required,
                    content,
                });
            }
        }
        sections
    }
}

const SEPARATOR: &str = "\n\n";
const TRUNCATION_MARKER: &str = "\n[truncated]";

/// Length of the sections once joined.
fn joined_len(sections: &[ParsedSection]) -> usize {
    let content: usize = sections.iter().map(|s| s.content.len()).sum();
    content + SEPARATOR.len() * sections.len().saturating_sub(1)
}

fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    for key in DROP_ORDER {
        if joined_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    // Required sections too: cut the longest one until the text fits.
    while joined_len(sections) > budget {
        let excess = joined_len(sections) - budget;
        let Some((idx, _)) = sections
            .iter()
            .enumerate()
            .max_by_key(|(_, s)| s.content.len())
        else {
            return;
        };
        let section = &mut sections[idx];
        let before_len = section.content.len();
        let keep = before_len.saturating_sub(excess);
        if keep <= TRUNCATION_MARKER.len() {
            debug!(section = section.key, bytes_dropped = before_len, "dropped section for budget");
            sections.remove(idx);
            continue;
        }
        let mut cut = keep - TRUNCATION_MARKER.len();
        while !section.content.is_char_boundary(cut) {
            cut -= 1;
        }
        section.content.truncate(cut);
        section.content.push_str(TRUNCATION_MARKER);
        debug!(
            section = section.key,
            before_len,
            after_len = section.content.len(),
            "truncated section for budget"
        );
    }
}
