//! Progress Calculation
//!
//! Overall and per-stage completion derived from a machine and a client's
//! completed-step history. Overall progress counts history entries; stage
//! progress counts the stage's steps found in the history.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::compiler::RuntimeMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    pub total: usize,
    pub completed: usize,
    pub remaining: usize,
    /// 0..=100, rounded half away from zero
    pub percentage: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage_id: String,
    pub stage_name: String,
    pub total: usize,
    pub completed: usize,
    pub percentage: u8,
}

fn percentage(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    (100.0 * completed as f64 / total as f64).round().min(100.0) as u8
}

fn known_completed<'a>(
    machine: &RuntimeMachine,
    completed_steps: &'a [String],
) -> HashSet<&'a str> {
    completed_steps
        .iter()
        .map(String::as_str)
        .filter(|id| machine.step_index_by_id.contains_key(*id))
        .collect()
}

/// `completed` is the history length clamped to the step count. Histories
/// kept by `ClientState` hold each step once, so this is the number of
/// distinct steps done.
pub fn workflow_progress(machine: &RuntimeMachine, completed_steps: &[String]) -> WorkflowProgress {
    let total = machine.steps.len();
    let completed = completed_steps.len().min(total);
    WorkflowProgress {
        total,
        completed,
        remaining: total - completed,
        percentage: percentage(completed, total),
    }
}

/// One entry per stage, in first-appearance order. Unstaged steps belong
/// to no stage.
pub fn stage_progress(machine: &RuntimeMachine, completed_steps: &[String]) -> Vec<StageProgress> {
    let done = known_completed(machine, completed_steps);
    machine
        .stages
        .iter()
        .map(|stage| {
            let total = stage.step_ids.len();
            let completed = stage
                .step_ids
                .iter()
                .filter(|id| done.contains(id.as_str()))
                .count();
            StageProgress {
                stage_id: stage.id.clone(),
                stage_name: stage.name.clone(),
                total,
                completed,
                percentage: percentage(completed, total),
            }
        })
        .collect()
}

/// Stage ids whose every step is completed, in stage order.
pub fn completed_stages(machine: &RuntimeMachine, completed_steps: &[String]) -> Vec<String> {
    stage_progress(machine, completed_steps)
        .into_iter()
        .filter(|s| s.total > 0 && s.completed == s.total)
        .map(|s| s.stage_id)
        .collect()
}
