//! Client State Types
//!
//! The persisted per-client record: where the client is in the machine,
//! what it has collected so far, and its opaque profile payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compiler::RuntimeMachine;
use crate::definition::END;
use crate::error::TransitionError;
use crate::progress;
use crate::value::Inputs;

/// One client's position in a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientState {
    pub client_id: String,
    /// Workflow definition ID (e.g., "kyc_onboarding")
    pub workflow_id: String,
    /// A step id of the machine, or `END`
    pub current_step_id: String,
    /// Derived from `current_step_id`; `None` at `END`
    #[serde(default)]
    pub current_stage: Option<String>,
    /// Keys accumulate; nothing removes them implicitly
    #[serde(default)]
    pub collected_inputs: Inputs,
    /// Forward history, truncated on back-navigation
    #[serde(default)]
    pub completed_steps: Vec<String>,
    /// Derived: stages whose every step is completed
    #[serde(default)]
    pub completed_stages: Vec<String>,
    /// Opaque client profile payload
    #[serde(default)]
    pub data: serde_json::Value,
    pub last_updated: DateTime<Utc>,
}

impl ClientState {
    pub fn new(
        client_id: impl Into<String>,
        workflow_id: impl Into<String>,
        initial_step_id: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            workflow_id: workflow_id.into(),
            current_step_id: initial_step_id.into(),
            current_stage: None,
            collected_inputs: Inputs::new(),
            completed_steps: Vec::new(),
            completed_stages: Vec::new(),
            data: serde_json::Value::Null,
            last_updated: Utc::now(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.current_step_id == END
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    /// Add or overwrite the given keys; other keys are kept.
    pub fn merge_inputs(&mut self, inputs: Inputs) {
        self.collected_inputs.extend(inputs);
    }

    /// Recompute `current_stage` and `completed_stages` from the machine.
    pub fn refresh_derived(&mut self, machine: &RuntimeMachine) {
        self.current_stage = machine.stage_of(&self.current_step_id).map(str::to_string);
        self.completed_stages = progress::completed_stages(machine, &self.completed_steps);
    }

    /// Record leaving the current step for `to` (a step id or `END`).
    /// A step completes once; revisiting it through a loop does not add a
    /// second entry.
    pub fn record_advance(&mut self, machine: &RuntimeMachine, to: &str) {
        let from = std::mem::replace(&mut self.current_step_id, to.to_string());
        if !self.completed_steps.contains(&from) {
            self.completed_steps.push(from);
        }
        self.refresh_derived(machine);
    }

    /// Return to a previously completed step, dropping it and everything
    /// after it from the history.
    pub fn rewind_to(
        &mut self,
        machine: &RuntimeMachine,
        step_id: &str,
    ) -> Result<(), TransitionError> {
        if machine.step(step_id).is_none() {
            return Err(TransitionError::UnknownStep(step_id.to_string()));
        }
        let position = self
            .completed_steps
            .iter()
            .position(|s| s == step_id)
            .ok_or_else(|| TransitionError::NotRewindable(step_id.to_string()))?;

        self.completed_steps.truncate(position);
        self.current_step_id = step_id.to_string();
        self.refresh_derived(machine);
        Ok(())
    }

    /// Step back to the most recently completed step. Returns the step
    /// moved to, or `None` when there is no history.
    pub fn step_back(&mut self, machine: &RuntimeMachine) -> Result<Option<String>, TransitionError> {
        let Some(previous) = self.completed_steps.last().cloned() else {
            return Ok(None);
        };
        self.rewind_to(machine, &previous)?;
        Ok(Some(previous))
    }
}

/// Shallow partial update. Provided fields replace the stored ones.
/// `collected_inputs` replaces the whole map; `merge_inputs` adds keys to
/// it instead (applied after any replacement).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientStateUpdate {
    pub workflow_id: Option<String>,
    pub current_step_id: Option<String>,
    pub current_stage: Option<Option<String>>,
    pub collected_inputs: Option<Inputs>,
    pub merge_inputs: Option<Inputs>,
    pub completed_steps: Option<Vec<String>>,
    pub completed_stages: Option<Vec<String>>,
    pub data: Option<serde_json::Value>,
}

impl ClientStateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_step(mut self, step_id: impl Into<String>) -> Self {
        self.current_step_id = Some(step_id.into());
        self
    }

    pub fn replace_inputs(mut self, inputs: Inputs) -> Self {
        self.collected_inputs = Some(inputs);
        self
    }

    pub fn merge_inputs(mut self, inputs: Inputs) -> Self {
        self.merge_inputs = Some(inputs);
        self
    }

    pub fn completed_steps(mut self, steps: Vec<String>) -> Self {
        self.completed_steps = Some(steps);
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge into `state`. Does not touch `last_updated`.
    pub fn apply(self, state: &mut ClientState) {
        if let Some(workflow_id) = self.workflow_id {
            state.workflow_id = workflow_id;
        }
        if let Some(step) = self.current_step_id {
            state.current_step_id = step;
        }
        if let Some(stage) = self.current_stage {
            state.current_stage = stage;
        }
        if let Some(inputs) = self.collected_inputs {
            state.collected_inputs = inputs;
        }
        if let Some(inputs) = self.merge_inputs {
            state.merge_inputs(inputs);
        }
        if let Some(steps) = self.completed_steps {
            state.completed_steps = steps;
        }
        if let Some(stages) = self.completed_stages {
            state.completed_stages = stages;
        }
        if let Some(data) = self.data {
            state.data = data;
        }
    }
}
