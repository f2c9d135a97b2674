//! Journey Errors
//!
//! One error enum per concern, plus `JourneyError` as the umbrella type the
//! engine returns. Missing required fields are not errors; they come back as
//! `TransitionCheck` / `SubmitOutcome::Blocked` values.

use std::path::PathBuf;

/// Malformed workflow definition. Surfaced to the definition author.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Workflow '{workflow}' declares no variants")]
    NoVariants { workflow: String },

    #[error("Variant '{variant}' has no steps")]
    EmptyVariant { variant: String },

    #[error("Duplicate variant id '{variant}'")]
    DuplicateVariant { variant: String },

    #[error("Duplicate step id '{step}' in variant '{variant}'")]
    DuplicateStep { variant: String, step: String },

    #[error("Step at position {position} in variant '{variant}' has an empty id")]
    EmptyStepId { variant: String, position: usize },

    #[error("Step id 'END' is reserved (variant '{variant}')")]
    ReservedStepId { variant: String },

    #[error("Step '{step}' has an empty required field name")]
    EmptyRequiredField { step: String },

    #[error("Step '{step}' has a condition without a field name")]
    EmptyConditionField { step: String },

    #[error("Step '{step}' transitions to unknown step '{target}'")]
    UnknownTarget { step: String, target: String },

    #[error("Step '{step}' references undeclared stage '{stage}'")]
    UnknownStage { step: String, stage: String },

    #[error("Workflow '{workflow}' is defined more than once")]
    DuplicateWorkflow { workflow: String },
}

/// No usable variant for a client profile. A configuration problem, not a
/// transient fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("No variant of '{workflow}' applies to client type '{client_type}' in '{jurisdiction}'")]
    NoMatch {
        workflow: String,
        client_type: String,
        jurisdiction: String,
    },

    #[error("Variants {variants:?} of '{workflow}' match equally for '{client_type}' in '{jurisdiction}'")]
    Ambiguous {
        workflow: String,
        client_type: String,
        jurisdiction: String,
        variants: Vec<String>,
    },

    #[error("Step '{step}' transitions to unknown step '{target}'")]
    UnresolvedTarget { step: String, target: String },

    #[error("Variant '{variant}' has no steps")]
    EmptyVariant { variant: String },
}

/// A transition resolved to something the machine does not contain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("Step '{from}' resolved to unknown step '{target}'")]
    UnknownTarget { from: String, target: String },

    #[error("Unknown step '{0}'")]
    UnknownStep(String),

    #[error("Step '{0}' is not in the completed history")]
    NotRewindable(String),
}

/// State store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Client not found: {0}")]
    NotFound(String),

    #[error("Client already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid client id: {0:?}")]
    InvalidClientId(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Legacy data error: {0}")]
    Legacy(String),
}

impl StoreError {
    /// True for the one failure an HTTP layer maps to "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Umbrella error for engine operations that cross concerns.
#[derive(Debug, thiserror::Error)]
pub enum JourneyError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("Client '{client_id}' belongs to workflow '{actual}', not '{expected}'")]
    WorkflowMismatch {
        client_id: String,
        expected: String,
        actual: String,
    },
}

impl JourneyError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, JourneyError::Store(e) if e.is_not_found())
    }
}
