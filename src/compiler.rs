//! Workflow Compiler
//!
//! Resolves a definition plus a client profile into an immutable
//! `RuntimeMachine`: ordered steps with explicit transition rules, an
//! id -> position index, stage groupings and the initial step.
//!
//! Compilation is pure. The same definition and profile always produce an
//! identical machine (ordered maps only, no clocks, no randomness).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::definition::{NextRule, VariantDef, WorkflowDefinition, END};
use crate::error::SelectionError;

/// The client attributes used to pick a variant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientProfile {
    pub client_type: String,
    pub jurisdiction: String,
}

impl ClientProfile {
    pub fn new(client_type: impl Into<String>, jurisdiction: impl Into<String>) -> Self {
        Self {
            client_type: client_type.into(),
            jurisdiction: jurisdiction.into(),
        }
    }

    /// Profile stored in a client's opaque data (`client_type` or
    /// `clientType`, plus `jurisdiction`).
    pub fn from_data(data: &serde_json::Value) -> Option<Self> {
        let client_type = data
            .get("client_type")
            .or_else(|| data.get("clientType"))
            .and_then(|v| v.as_str())?;
        let jurisdiction = data.get("jurisdiction").and_then(|v| v.as_str())?;
        Some(Self::new(client_type, jurisdiction))
    }
}

/// A step with its stage resolved and its transitions made explicit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledStep {
    pub id: String,
    pub position: usize,
    pub stage: Option<String>,
    pub stage_name: Option<String>,
    pub task_ref: Option<String>,
    pub description: String,
    pub required_fields: Vec<String>,
    pub next: NextRule,
}

/// Steps grouped under one stage, in declaration order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledStage {
    pub id: String,
    pub name: String,
    pub step_ids: Vec<String>,
}

/// Compiled, read-only form of one variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeMachine {
    pub workflow_id: String,
    pub variant_id: String,
    pub version: u32,
    pub steps: Vec<CompiledStep>,
    pub step_index_by_id: BTreeMap<String, usize>,
    pub stages: Vec<CompiledStage>,
    pub initial_step_id: String,
}

impl RuntimeMachine {
    pub fn step(&self, id: &str) -> Option<&CompiledStep> {
        self.step_index_by_id.get(id).and_then(|&i| self.steps.get(i))
    }

    pub fn initial_step(&self) -> Option<&CompiledStep> {
        self.step(&self.initial_step_id)
    }

    /// Declaration-order successor, used for display only. Real
    /// transitions go through `execute_transition`.
    pub fn step_after(&self, id: &str) -> Option<&CompiledStep> {
        let position = *self.step_index_by_id.get(id)?;
        self.steps.get(position + 1)
    }

    pub fn stage(&self, id: &str) -> Option<&CompiledStage> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Stage id of a step; `None` for `END` or unstaged steps.
    pub fn stage_of(&self, step_id: &str) -> Option<&str> {
        self.step(step_id).and_then(|s| s.stage.as_deref())
    }

    pub fn is_terminal(&self, step_id: &str) -> bool {
        step_id == END
    }

    /// True for any id a client cursor may hold: a step id or `END`.
    pub fn is_valid_position(&self, step_id: &str) -> bool {
        self.is_terminal(step_id) || self.step_index_by_id.contains_key(step_id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Step lookup for rendering layers.
pub fn get_step_by_id<'a>(machine: &'a RuntimeMachine, id: &str) -> Option<&'a CompiledStep> {
    machine.step(id)
}

/// Pick the variant for a profile. Jurisdiction-qualified matches beat
/// wildcard matches; two matches at the same level are ambiguous.
pub fn select_variant<'a>(
    definition: &'a WorkflowDefinition,
    profile: &ClientProfile,
) -> Result<&'a VariantDef, SelectionError> {
    let candidates: Vec<(u8, &VariantDef)> = definition
        .variants
        .iter()
        .filter(|v| v.applies_to.client_type == profile.client_type)
        .filter_map(|v| {
            if v.applies_to.is_wildcard() {
                Some((0, v))
            } else if v
                .applies_to
                .jurisdictions
                .iter()
                .any(|j| *j == profile.jurisdiction)
            {
                Some((1, v))
            } else {
                None
            }
        })
        .collect();

    let Some(best) = candidates.iter().map(|(score, _)| *score).max() else {
        return Err(SelectionError::NoMatch {
            workflow: definition.workflow.clone(),
            client_type: profile.client_type.clone(),
            jurisdiction: profile.jurisdiction.clone(),
        });
    };

    let winners: Vec<&VariantDef> = candidates
        .into_iter()
        .filter(|(score, _)| *score == best)
        .map(|(_, v)| v)
        .collect();

    match winners.as_slice() {
        [only] => Ok(*only),
        many => Err(SelectionError::Ambiguous {
            workflow: definition.workflow.clone(),
            client_type: profile.client_type.clone(),
            jurisdiction: profile.jurisdiction.clone(),
            variants: many.iter().map(|v| v.id.clone()).collect(),
        }),
    }
}

/// Select the variant for `profile` and compile it.
pub fn compile(
    definition: &WorkflowDefinition,
    profile: &ClientProfile,
) -> Result<RuntimeMachine, SelectionError> {
    let variant = select_variant(definition, profile)?;
    let machine = compile_variant(definition, variant)?;
    tracing::debug!(
        workflow = %machine.workflow_id,
        variant = %machine.variant_id,
        client_type = %profile.client_type,
        jurisdiction = %profile.jurisdiction,
        steps = machine.steps.len(),
        "Compiled runtime machine"
    );
    Ok(machine)
}

/// Compile a specific variant, bypassing profile selection.
pub fn compile_variant(
    definition: &WorkflowDefinition,
    variant: &VariantDef,
) -> Result<RuntimeMachine, SelectionError> {
    let Some(first) = variant.steps.first() else {
        return Err(SelectionError::EmptyVariant {
            variant: variant.id.clone(),
        });
    };

    let mut steps = Vec::with_capacity(variant.steps.len());
    let mut step_index_by_id = BTreeMap::new();
    let mut stages: Vec<CompiledStage> = Vec::new();

    for (position, def) in variant.steps.iter().enumerate() {
        let next = variant
            .resolved_next(position)
            .unwrap_or_else(|| NextRule::to(END));

        if let Some(stage_id) = &def.stage {
            match stages.iter_mut().find(|s| s.id == *stage_id) {
                Some(stage) => stage.step_ids.push(def.id.clone()),
                None => stages.push(CompiledStage {
                    id: stage_id.clone(),
                    name: definition.stage_name(stage_id).to_string(),
                    step_ids: vec![def.id.clone()],
                }),
            }
        }

        step_index_by_id.insert(def.id.clone(), position);
        steps.push(CompiledStep {
            id: def.id.clone(),
            position,
            stage: def.stage.clone(),
            stage_name: def
                .stage
                .as_deref()
                .map(|s| definition.stage_name(s).to_string()),
            task_ref: def.task_ref.clone(),
            description: def.description.clone(),
            required_fields: def.required_fields.clone(),
            next,
        });
    }

    let known: HashSet<&str> = step_index_by_id.keys().map(String::as_str).collect();
    for step in &steps {
        if let Some(target) = step.next.targets().find(|t| *t != END && !known.contains(t)) {
            return Err(SelectionError::UnresolvedTarget {
                step: step.id.clone(),
                target: target.to_string(),
            });
        }
    }

    Ok(RuntimeMachine {
        workflow_id: definition.workflow.clone(),
        variant_id: variant.id.clone(),
        version: definition.version,
        initial_step_id: first.id.clone(),
        steps,
        step_index_by_id,
        stages,
    })
}
