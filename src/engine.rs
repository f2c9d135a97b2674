//! Journey Engine
//!
//! Drives one client through a compiled machine: find-or-start, status,
//! input submission with transition, and back-navigation. Every
//! read-modify-write goes through `ClientStateStore::modify`, so two
//! submissions for the same client never lose each other's inputs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::compiler::{compile, ClientProfile, CompiledStep, RuntimeMachine};
use crate::definition::WorkflowDefinition;
use crate::error::{JourneyError, TransitionError};
use crate::progress::{stage_progress, workflow_progress, StageProgress, WorkflowProgress};
use crate::state::ClientState;
use crate::store::ClientStateStore;
use crate::transition::{
    can_transition_from, execute_transition, missing_reason, missing_required_fields,
    TransitionCheck,
};
use crate::value::Inputs;

/// The journey execution engine
pub struct JourneyEngine<S> {
    store: S,
    definitions: Arc<BTreeMap<String, WorkflowDefinition>>,
}

/// Where a client stands, for rendering
#[derive(Debug, Clone, Serialize)]
pub struct JourneyStatus {
    pub client_id: String,
    pub workflow_id: String,
    pub variant_id: String,
    pub current_step_id: String,
    pub current_step: Option<CompiledStep>,
    pub current_stage: Option<String>,
    pub is_end: bool,
    pub missing_fields: Vec<String>,
    pub check: TransitionCheck,
    pub progress: WorkflowProgress,
    pub stages: Vec<StageProgress>,
    pub completed_steps: Vec<String>,
    pub collected_inputs: Inputs,
    pub last_updated: DateTime<Utc>,
}

/// Result of submitting inputs for the current step
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum SubmitOutcome {
    /// Inputs were stored but required fields are still missing
    Blocked { missing: Vec<String>, reason: String },
    /// The client moved from `from` to `to`
    Advanced { from: String, to: String, is_end: bool },
    /// The client was already at `END`; inputs were stored
    Finished,
}

impl<S: ClientStateStore> JourneyEngine<S> {
    pub fn new(store: S, definitions: BTreeMap<String, WorkflowDefinition>) -> Self {
        Self {
            store,
            definitions: Arc::new(definitions),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn definitions(&self) -> &BTreeMap<String, WorkflowDefinition> {
        &self.definitions
    }

    /// Compile the named workflow for a client profile.
    pub fn machine_for(
        &self,
        workflow_id: &str,
        profile: &ClientProfile,
    ) -> Result<RuntimeMachine, JourneyError> {
        let definition = self
            .definitions
            .get(workflow_id)
            .ok_or_else(|| JourneyError::UnknownWorkflow(workflow_id.to_string()))?;
        Ok(compile(definition, profile)?)
    }

    /// Existing state for the client, or a fresh record at the machine's
    /// initial step carrying `data`. Concurrent starts for one client all
    /// see the same record.
    pub async fn start(
        &self,
        client_id: &str,
        machine: &RuntimeMachine,
        data: Option<serde_json::Value>,
    ) -> Result<ClientState, JourneyError> {
        let mut fresh = ClientState::new(client_id, &machine.workflow_id, &machine.initial_step_id);
        if let Some(data) = data {
            fresh.data = data;
        }
        fresh.refresh_derived(machine);

        let (state, created) = self.store.find_or_create(fresh).await?;
        ensure_workflow(&state, machine)?;

        if created {
            info!(
                client_id,
                workflow = %machine.workflow_id,
                variant = %machine.variant_id,
                "Started journey"
            );
        }
        Ok(state)
    }

    pub async fn status(
        &self,
        client_id: &str,
        machine: &RuntimeMachine,
    ) -> Result<JourneyStatus, JourneyError> {
        let state = self.store.get(client_id).await?;
        ensure_workflow(&state, machine)?;

        let is_end = state.is_finished();
        let current_step = if is_end {
            None
        } else {
            Some(
                machine
                    .step(&state.current_step_id)
                    .ok_or_else(|| TransitionError::UnknownStep(state.current_step_id.clone()))?,
            )
        };

        let (missing_fields, check) = match current_step {
            Some(step) => (
                missing_required_fields(step, &state.collected_inputs)
                    .into_iter()
                    .collect(),
                can_transition_from(step, &state.collected_inputs),
            ),
            None => (
                Vec::new(),
                TransitionCheck {
                    can_transition: false,
                    reason: Some("Journey complete".to_string()),
                },
            ),
        };

        Ok(JourneyStatus {
            client_id: state.client_id.clone(),
            workflow_id: state.workflow_id.clone(),
            variant_id: machine.variant_id.clone(),
            current_step_id: state.current_step_id.clone(),
            current_step: current_step.cloned(),
            current_stage: machine.stage_of(&state.current_step_id).map(str::to_string),
            is_end,
            missing_fields,
            check,
            progress: workflow_progress(machine, &state.completed_steps),
            stages: stage_progress(machine, &state.completed_steps),
            completed_steps: state.completed_steps,
            collected_inputs: state.collected_inputs,
            last_updated: state.last_updated,
        })
    }

    /// Merge `inputs` into the client's collected inputs, then advance if
    /// the current step's required fields are all present. The merged
    /// inputs are stored either way.
    pub async fn submit(
        &self,
        client_id: &str,
        machine: &RuntimeMachine,
        inputs: Inputs,
    ) -> Result<SubmitOutcome, JourneyError> {
        let mut outcome = None;

        self.store
            .modify(client_id, &mut |state| {
                ensure_workflow(state, machine)?;
                state.merge_inputs(inputs.clone());

                if state.is_finished() {
                    outcome = Some(SubmitOutcome::Finished);
                    return Ok(());
                }

                let step = machine
                    .step(&state.current_step_id)
                    .ok_or_else(|| TransitionError::UnknownStep(state.current_step_id.clone()))?;

                let missing = missing_required_fields(step, &state.collected_inputs);
                if !missing.is_empty() {
                    outcome = Some(SubmitOutcome::Blocked {
                        reason: missing_reason(&missing),
                        missing: missing.into_iter().collect(),
                    });
                    return Ok(());
                }

                let transition = execute_transition(machine, step, &state.collected_inputs)?;
                let from = step.id.clone();
                state.record_advance(machine, &transition.target_step_id);
                outcome = Some(SubmitOutcome::Advanced {
                    from,
                    to: transition.target_step_id,
                    is_end: transition.is_end,
                });
                Ok(())
            })
            .await?;

        let outcome = outcome.unwrap_or(SubmitOutcome::Finished);
        match &outcome {
            SubmitOutcome::Advanced { from, to, .. } => {
                info!(client_id, from = %from, to = %to, "Advanced client")
            }
            SubmitOutcome::Blocked { reason, .. } => {
                debug!(client_id, reason = %reason, "Submission blocked")
            }
            SubmitOutcome::Finished => debug!(client_id, "Submission after journey end"),
        }
        Ok(outcome)
    }

    /// Move back to the most recently completed step. A client with no
    /// history stays where it is.
    pub async fn go_back(
        &self,
        client_id: &str,
        machine: &RuntimeMachine,
    ) -> Result<ClientState, JourneyError> {
        let state = self
            .store
            .modify(client_id, &mut |state| {
                ensure_workflow(state, machine)?;
                state.step_back(machine)?;
                Ok(())
            })
            .await?;
        debug!(client_id, step = %state.current_step_id, "Stepped back");
        Ok(state)
    }

    /// Return to a previously completed step, discarding later history.
    pub async fn rewind_to(
        &self,
        client_id: &str,
        machine: &RuntimeMachine,
        step_id: &str,
    ) -> Result<ClientState, JourneyError> {
        let state = self
            .store
            .modify(client_id, &mut |state| {
                ensure_workflow(state, machine)?;
                state.rewind_to(machine, step_id)?;
                Ok(())
            })
            .await?;
        info!(client_id, step = step_id, "Rewound client");
        Ok(state)
    }
}

fn ensure_workflow(state: &ClientState, machine: &RuntimeMachine) -> Result<(), JourneyError> {
    if state.workflow_id == machine.workflow_id {
        Ok(())
    } else {
        Err(JourneyError::WorkflowMismatch {
            client_id: state.client_id.clone(),
            expected: machine.workflow_id.clone(),
            actual: state.workflow_id.clone(),
        })
    }
}
