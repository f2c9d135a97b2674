//! Onboarding Journey Engine
//!
//! Compiles YAML workflow definitions into per-client runtime machines,
//! evaluates step transitions against collected inputs, reports progress,
//! and persists each client's position.
//!
//! # Architecture
//!
//! ```text
//! workflow YAML ──load──► WorkflowDefinition
//!                              │  + ClientProfile (client_type, jurisdiction)
//!                              ▼
//!                        compile ──► RuntimeMachine (immutable)
//!                                          │
//!   ClientStateStore ◄──── JourneyEngine ──┤ missing_required_fields
//!   (file / memory)        start / submit  │ can_transition_from
//!                          back / status   │ execute_transition
//!                                          └ workflow_progress / stage_progress
//! ```

pub mod compiler;
pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod progress;
pub mod state;
pub mod store;
pub mod transition;
pub mod value;

pub use compiler::{
    compile, compile_variant, get_step_by_id, select_variant, ClientProfile, CompiledStage,
    CompiledStep, RuntimeMachine,
};
pub use config::{ConfigError, JourneyConfig};
pub use definition::{
    load, AppliesTo, CompareOp, ConditionDef, NextRule, StageDef, StepDef, VariantDef,
    WorkflowDefinition, WorkflowLoader, END,
};
pub use engine::{JourneyEngine, JourneyStatus, SubmitOutcome};
pub use error::{JourneyError, ParseError, SelectionError, StoreError, TransitionError};
pub use progress::{stage_progress, workflow_progress, StageProgress, WorkflowProgress};
pub use state::{ClientState, ClientStateUpdate};
pub use store::{
    ClientStateStore, FileStateStore, InMemoryStateStore, InitializePolicy, LegacyClientRecord,
    LegacyDefaults, LegacyJsonFile, LegacySource,
};
pub use transition::{
    can_transition_from, execute_transition, missing_required_fields, TransitionCheck,
    TransitionOutcome,
};
pub use value::{FieldValue, Inputs};
