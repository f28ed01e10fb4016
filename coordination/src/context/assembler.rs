//! Context Assembler: builds the oracle prompt for one stage
//!
//! Pure function of its inputs: ticket text, repository excerpts, prior
//! stage artifacts, the run's accumulated refinements and the taxonomy.
//! Same inputs, same prompt.

use super::delta::ContextDelta;
use super::taxonomy::{ComponentMatch, Taxonomy};
use crate::pipeline::Stage;
use crate::sources::RepoExcerpt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;

static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[a-z0-9][a-z0-9_.-]*[a-z0-9]|[a-z0-9]").expect("TOKEN regex should compile")
});

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "are", "was", "were", "will",
    "should", "would", "could", "can", "must", "not", "but", "has", "have", "had", "been", "being",
    "when", "then", "than", "there", "their", "them", "they", "which", "what", "who", "how", "why",
    "all", "any", "each", "our", "your", "its", "also", "only", "via", "per", "use", "using", "used",
    "add", "new", "need", "needs", "make", "does", "did", "doing", "such", "other", "more", "most",
    "some", "very", "just", "about", "over", "under", "after", "before", "while", "where", "these",
    "those", "you", "out", "one", "two", "able", "ticket", "feature", "support", "test", "tests",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerConfig {
    pub max_keywords: usize,
    /// Character budget for repository excerpts
    pub excerpt_budget_chars: usize,
    /// How many of the most recent prior-stage artifacts to include
    pub max_prior_artifacts: usize,
    /// Character cap per prior artifact
    pub max_prior_artifact_chars: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            max_keywords: 12,
            excerpt_budget_chars: 6_000,
            max_prior_artifacts: 2,
            max_prior_artifact_chars: 4_000,
        }
    }
}

/// Everything the assembler may look at
#[derive(Debug, Clone, Copy)]
pub struct StageInputs<'a> {
    pub stage: Stage,
    pub ticket_id: &'a str,
    pub ticket_text: &'a str,
    pub excerpts: &'a [RepoExcerpt],
    /// Normalized artifacts of earlier stages, in pipeline order
    pub prior_artifacts: &'a [(Stage, String)],
    pub delta: &'a ContextDelta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssembledContext {
    pub prompt: String,
    pub keywords: Vec<String>,
    pub components: Vec<String>,
    pub excerpts_used: usize,
}

/// Most frequent meaningful lowercase tokens, ties broken alphabetically
pub fn extract_keywords(text: &str, max: usize) -> Vec<String> {
    let lowered = text.to_lowercase();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for m in TOKEN.find_iter(&lowered) {
        let token = m.as_str();
        if token.len() < 3
            || STOPWORDS.contains(&token)
            || token.bytes().all(|b| b.is_ascii_digit() || b == b'.')
        {
            continue;
        }
        *counts.entry(token).or_default() += 1;
    }
    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked
        .into_iter()
        .take(max)
        .map(|(token, _)| token.to_string())
        .collect()
}

/// Relevance of an excerpt: keyword hits in its path and content
fn excerpt_score(excerpt: &RepoExcerpt, keywords: &[String]) -> usize {
    let path = excerpt.path.to_lowercase();
    let content = excerpt.content.to_lowercase();
    keywords
        .iter()
        .map(|k| path.matches(k.as_str()).count() * 3 + content.matches(k.as_str()).count())
        .sum()
}

/// Relevant excerpts within `budget` characters, best first.
/// The first excerpt that does not fit is truncated into the remainder.
pub fn rank_excerpts(
    excerpts: &[RepoExcerpt],
    keywords: &[String],
    budget: usize,
) -> Vec<RepoExcerpt> {
    let mut scored: Vec<(usize, &RepoExcerpt)> = excerpts
        .iter()
        .map(|e| (excerpt_score(e, keywords), e))
        .filter(|(score, _)| *score > 0)
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.path.cmp(&b.1.path)));

    let mut remaining = budget;
    let mut picked = Vec::new();
    for (_, excerpt) in scored {
        if remaining == 0 {
            break;
        }
        if excerpt.content.len() <= remaining {
            remaining -= excerpt.content.len();
            picked.push(excerpt.clone());
        } else {
            picked.push(RepoExcerpt::new(
                excerpt.path.clone(),
                format!("{}\n[truncated]", truncate_chars(&excerpt.content, remaining)),
            ));
            break;
        }
    }
    picked
}

fn truncate_chars(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn stage_instructions(stage: Stage) -> &'static str {
    match stage {
        Stage::Setup => {
            "Summarize the ticket: scope, affected components and the environment the tests \
             need. Report any environment reachability problem explicitly."
        }
        Stage::RepoAccess => {
            "From the repository context, identify the resources, manifests and commands \
             relevant to the ticket."
        }
        Stage::Analysis => {
            "List the behaviours that must be tested and state for each whether the target \
             feature already exists. Name any missing resource or CRD explicitly."
        }
        Stage::PlanGeneration => {
            "Write the test plan as two-column markdown tables (| Step | Expected Result |). \
             Each step is one concrete action; each expected result is observable. \
             Do not use watch-style polling or fixed sleeps."
        }
        Stage::HumanReview => "Await operator review.",
        Stage::Implementation => {
            "Turn the approved test plan into executable test steps, keeping the step/result \
             table structure."
        }
        Stage::QualityValidation => {
            "Review the implemented tests against the approved plan and restate the final \
             plan as step/result tables."
        }
    }
}

pub struct ContextAssembler {
    config: AssemblerConfig,
    taxonomy: Taxonomy,
}

impl ContextAssembler {
    pub fn new(config: AssemblerConfig, taxonomy: Taxonomy) -> Self {
        Self { config, taxonomy }
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    pub fn keywords(&self, ticket_text: &str) -> Vec<String> {
        extract_keywords(ticket_text, self.config.max_keywords)
    }

    pub fn assemble(&self, inputs: &StageInputs<'_>) -> AssembledContext {
        let keywords = self.keywords(inputs.ticket_text);
        let components = self
            .taxonomy
            .match_components(&keywords, inputs.ticket_text);
        let excerpts = rank_excerpts(
            inputs.excerpts,
            &keywords,
            self.config.excerpt_budget_chars,
        );

        let mut prompt = format!("# Stage: {}\n\n", inputs.stage);
        prompt.push_str(&format!(
            "## Ticket {}\n\n{}\n\n",
            inputs.ticket_id,
            inputs.ticket_text.trim()
        ));

        if !keywords.is_empty() {
            prompt.push_str(&format!("## Keywords\n\n{}\n\n", keywords.join(", ")));
        }

        if !components.is_empty() {
            prompt.push_str("## Components\n\n");
            for component in &components {
                prompt.push_str(&render_component(component));
            }
            prompt.push('\n');
        }

        if !excerpts.is_empty() {
            prompt.push_str("## Repository Context\n\n");
            for excerpt in &excerpts {
                prompt.push_str(&format!(
                    "### {}\n\n```\n{}\n```\n\n",
                    excerpt.path,
                    excerpt.content.trim_end()
                ));
            }
        }

        let skip = inputs
            .prior_artifacts
            .len()
            .saturating_sub(self.config.max_prior_artifacts);
        let prior = &inputs.prior_artifacts[skip..];
        if !prior.is_empty() {
            prompt.push_str("## Prior Artifacts\n\n");
            for (stage, text) in prior {
                prompt.push_str(&format!(
                    "### {}\n\n{}\n\n",
                    stage,
                    truncate_chars(text, self.config.max_prior_artifact_chars).trim_end()
                ));
            }
        }

        if !inputs.delta.is_empty() {
            prompt.push_str(&format!(
                "## Refinements\n\nApply these corrections from earlier attempts:\n{}\n\n",
                inputs.delta.render()
            ));
        }

        prompt.push_str(&format!(
            "## Instructions\n\n{}\n",
            stage_instructions(inputs.stage)
        ));

        AssembledContext {
            prompt,
            keywords,
            components: components.into_iter().map(|c| c.name).collect(),
            excerpts_used: excerpts.len(),
        }
    }
}

fn render_component(component: &ComponentMatch) -> String {
    if component.actions.is_empty() {
        format!("- {}\n", component.name)
    } else {
        format!(
            "- {}: {}\n",
            component.name,
            component.actions.join("; ")
        )
    }
}
