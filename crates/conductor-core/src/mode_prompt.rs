use std::sync::Arc;

use conductor_context::estimate_tokens;
use conductor_types::{MergeMode, ModeDefinition, PromptSection};

use crate::store::RunStore;

/// Builds a mode's system prompt from templated sections plus per-scope
/// overrides, then prunes lowest-priority sections until the text fits the
/// mode's token budget.
#[derive(Clone)]
pub struct ModePromptAssembler {
    store: Arc<dyn RunStore>,
}

impl ModePromptAssembler {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Store-defined modes win; the built-in set is the fallback.
    pub async fn resolve_mode(&self, mode_id: &str) -> Option<ModeDefinition> {
        match self.store.get_mode(mode_id).await {
            Ok(Some(mode)) => return Some(mode),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(mode_id, "mode lookup failed, using built-ins: {err:#}");
            }
        }
        default_modes().into_iter().find(|mode| mode.id == mode_id)
    }

    pub async fn assemble(&self, mode: &ModeDefinition, budget: u32) -> String {
        let mut sections = base_sections(mode);
        let overrides = match self.store.list_prompt_sections(&mode.id).await {
            Ok(overrides) => overrides,
            Err(err) => {
                tracing::warn!(mode_id = %mode.id, "prompt override lookup failed: {err:#}");
                Vec::new()
            }
        };
        apply_overrides(&mut sections, overrides);
        prune_to_budget(&mut sections, mode.prompt_budget.unwrap_or(budget));

        sections.sort_by_key(|section| section.sort_order);
        sections
            .iter()
            .map(|section| section.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn apply_overrides(sections: &mut Vec<PromptSection>, overrides: Vec<PromptSection>) {
    for over in overrides {
        if !over.enabled {
            sections.retain(|section| section.name != over.name);
            continue;
        }
        match sections.iter_mut().find(|section| section.name == over.name) {
            Some(existing) => {
                match over.merge {
                    MergeMode::Replace => existing.content = over.content,
                    MergeMode::Append => {
                        existing.content.push_str("\n");
                        existing.content.push_str(&over.content);
                    }
                    MergeMode::Prepend => {
                        existing.content = format!("{}\n{}", over.content, existing.content);
                    }
                }
                existing.priority = over.priority;
            }
            None => sections.push(over),
        }
    }
}

/// Drop the lowest-priority section until the total fits. Ties break toward
/// dropping the later section so earlier template material survives.
fn prune_to_budget(sections: &mut Vec<PromptSection>, budget: u32) {
    loop {
        let total: u32 = sections
            .iter()
            .map(|section| estimate_tokens(&section.content))
            .sum();
        if total <= budget || sections.is_empty() {
            return;
        }
        let Some((index, _)) = sections
            .iter()
            .enumerate()
            .min_by(|(ia, a), (ib, b)| a.priority.cmp(&b.priority).then(ib.cmp(ia)))
        else {
            return;
        };
        sections.remove(index);
    }
}

pub fn default_modes() -> Vec<ModeDefinition> {
    vec![
        ModeDefinition {
            id: "coder".to_string(),
            prompt_prefix: "You are a coding agent working inside a checked-out repository. \
Make the smallest change that satisfies the task, keep the build green, and \
prefer editing existing files over adding new ones."
                .to_string(),
            tools: vec![
                "Read".into(),
                "Glob".into(),
                "Grep".into(),
                "Edit".into(),
                "Write".into(),
                "Bash".into(),
            ],
            denied_tools: Vec::new(),
            denied_actions: Vec::new(),
            required_artifact: None,
            prompt_budget: None,
        },
        ModeDefinition {
            id: "plan".to_string(),
            prompt_prefix: "You are a planning agent. Inspect the workspace read-only and \
produce a structured implementation plan; do not modify files."
                .to_string(),
            tools: vec!["Read".into(), "Glob".into(), "Grep".into()],
            denied_tools: vec!["Edit".into(), "Write".into(), "Bash".into()],
            denied_actions: vec!["file_write".into()],
            required_artifact: Some("markdown".to_string()),
            prompt_budget: None,
        },
        ModeDefinition {
            id: "review".to_string(),
            prompt_prefix: "You are a review agent. Read the changes under review and report \
defects with file and line references."
                .to_string(),
            tools: vec!["Read".into(), "Glob".into(), "Grep".into()],
            denied_tools: vec!["Edit".into(), "Write".into(), "Bash".into()],
            denied_actions: vec!["file_write".into()],
            required_artifact: Some("markdown".to_string()),
            prompt_budget: None,
        },
    ]
}

fn base_sections(mode: &ModeDefinition) -> Vec<PromptSection> {
    let mut sections = vec![
        PromptSection {
            name: "identity".to_string(),
            scope: mode.id.clone(),
            content: mode.prompt_prefix.clone(),
            priority: 100,
            sort_order: 0,
            enabled: true,
            merge: MergeMode::Replace,
        },
        PromptSection {
            name: "workspace".to_string(),
            scope: mode.id.clone(),
            content: "The workspace is the task's repository checkout. Paths in context \
entries are relative to its root."
                .to_string(),
            priority: 80,
            sort_order: 1,
            enabled: true,
            merge: MergeMode::Replace,
        },
        PromptSection {
            name: "safety".to_string(),
            scope: mode.id.clone(),
            content: "Every sensitive action is arbitrated by policy. A denied tool call is \
not an error; continue with an allowed approach."
                .to_string(),
            priority: 90,
            sort_order: 2,
            enabled: true,
            merge: MergeMode::Replace,
        },
    ];
    if !mode.denied_tools.is_empty() {
        sections.push(PromptSection {
            name: "denied_tools".to_string(),
            scope: mode.id.clone(),
            content: format!("Unavailable tools: {}.", mode.denied_tools.join(", ")),
            priority: 70,
            sort_order: 3,
            enabled: true,
            merge: MergeMode::Replace,
        });
    }
    if let Some(artifact) = mode.required_artifact.as_deref() {
        sections.push(PromptSection {
            name: "artifact".to_string(),
            scope: mode.id.clone(),
            content: format!("Your final output must be a valid {artifact} artifact."),
            priority: 85,
            sort_order: 4,
            enabled: true,
            merge: MergeMode::Replace,
        });
    }
    sections
}
