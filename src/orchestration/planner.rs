//! Phase task generation.
//!
//! Tasks for a phase are produced only when the workflow enters it, so a
//! planner can shape later phases from the context earlier phases produced.

use serde_json::{json, Value};

use crate::core::task::{Capability, Priority, TaskSpec};
use crate::workflow::{Phase, TaskBatch, WorkflowSnapshot};

/// Context key listing research topics, read when planning Research.
pub const RESEARCH_TOPICS_KEY: &str = "research_topics";

/// Context key listing document sections, read when planning Drafting.
pub const SECTIONS_KEY: &str = "sections";

/// Produces the tasks for a phase.
pub trait PhasePlanner: Send + Sync {
    /// Tasks to add when the workflow enters `phase`.
    ///
    /// The batch may be empty; a phase without tasks completes immediately.
    fn plan(&self, phase: Phase, snapshot: &WorkflowSnapshot) -> TaskBatch;
}

/// Default planner for drafting a legal document from a case file.
#[derive(Debug, Clone, Copy, Default)]
pub struct CasePlanner;

impl CasePlanner {
    fn string_list(snapshot: &WorkflowSnapshot, key: &str) -> Vec<String> {
        snapshot
            .context
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl PhasePlanner for CasePlanner {
    fn plan(&self, phase: Phase, snapshot: &WorkflowSnapshot) -> TaskBatch {
        let mut batch = TaskBatch::new();
        match phase {
            Phase::Intake => {
                for item in &snapshot.input_items {
                    batch.push(
                        TaskSpec::new(Capability::DocumentIntake, format!("Process {}", item))
                            .with_priority(Priority::High)
                            .with_input(json!({ "item": item })),
                    );
                }
            }
            Phase::Outline => {
                batch.push(TaskSpec::new(Capability::Outlining, "Build case outline"));
            }
            Phase::Research => {
                let topics = Self::string_list(snapshot, RESEARCH_TOPICS_KEY);
                if topics.is_empty() {
                    batch.push(TaskSpec::new(Capability::LegalResearch, "Research legal issues"));
                }
                for topic in topics {
                    batch.push(
                        TaskSpec::new(Capability::LegalResearch, format!("Research {}", topic))
                            .with_input(json!({ "topic": topic })),
                    );
                }
            }
            Phase::Drafting => {
                let sections = Self::string_list(snapshot, SECTIONS_KEY);
                if sections.is_empty() {
                    batch.push(TaskSpec::new(Capability::Drafting, "Draft document"));
                } else {
                    let mut compile = TaskSpec::new(Capability::Drafting, "Compile draft")
                        .with_priority(Priority::High);
                    for section in sections {
                        let id = batch.push(
                            TaskSpec::new(Capability::Drafting, format!("Draft {}", section))
                                .with_input(json!({ "section": section })),
                        );
                        compile = compile.depends_on(id);
                    }
                    batch.push(compile);
                }
            }
            Phase::Review => {
                batch.push(TaskSpec::new(Capability::Review, "Review draft"));
            }
            Phase::Editing => {
                batch.push(TaskSpec::new(Capability::Editing, "Apply review edits"));
            }
            Phase::Finalize => {
                batch.push(TaskSpec::new(Capability::Finalization, "Finalize document"));
            }
        }
        batch
    }
}
