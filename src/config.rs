//! Journey configuration.
//!
//! Where client records and workflow definitions live, how `initialize`
//! treats existing records, and where legacy client data comes from.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::definition::{WorkflowDefinition, WorkflowLoader};
use crate::error::{ParseError, StoreError};
use crate::store::{FileStateStore, InitializePolicy, LegacyDefaults, LegacyJsonFile};

pub const ENV_DATA_DIR: &str = "OB_JOURNEY_DATA_DIR";
pub const ENV_DEFINITIONS: &str = "OB_JOURNEY_DEFINITIONS";
pub const ENV_LEGACY_FILE: &str = "OB_JOURNEY_LEGACY_FILE";
pub const ENV_INIT_POLICY: &str = "OB_JOURNEY_INIT_POLICY";
pub const ENV_DEFAULT_WORKFLOW: &str = "OB_JOURNEY_DEFAULT_WORKFLOW";
pub const ENV_DEFAULT_STEP: &str = "OB_JOURNEY_DEFAULT_STEP";

#[derive(Debug, thiserror::Error)]
#[error("Invalid value for {key}: {message}")]
pub struct ConfigError {
    pub key: &'static str,
    pub message: String,
}

/// Configuration for the journey store and definitions.
#[derive(Debug, Clone, PartialEq)]
pub struct JourneyConfig {
    /// Directory holding one `<client_id>.json` per client.
    pub data_dir: PathBuf,

    /// Definition file, or a directory of `*.yaml` / `*.yml` / `*.json`.
    pub definitions_path: PathBuf,

    /// Behaviour of `initialize` on an existing record.
    pub initialize_policy: InitializePolicy,

    /// Legacy client records to migrate, if any.
    pub legacy_file: Option<PathBuf>,

    /// Workflow and step assigned to legacy records that carry none.
    pub legacy_defaults: LegacyDefaults,
}

impl Default for JourneyConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/clients"),
            definitions_path: PathBuf::from("config/workflows"),
            initialize_policy: InitializePolicy::default(),
            legacy_file: None,
            legacy_defaults: LegacyDefaults::default(),
        }
    }
}

impl JourneyConfig {
    /// Defaults overridden by `OB_JOURNEY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = get(ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(path) = get(ENV_DEFINITIONS) {
            config.definitions_path = PathBuf::from(path);
        }
        if let Some(path) = get(ENV_LEGACY_FILE) {
            config.legacy_file = Some(PathBuf::from(path));
        }
        if let Some(policy) = get(ENV_INIT_POLICY) {
            config.initialize_policy = policy.trim().parse().map_err(|message| ConfigError {
                key: ENV_INIT_POLICY,
                message,
            })?;
        }
        if let Some(workflow) = get(ENV_DEFAULT_WORKFLOW) {
            config.legacy_defaults.workflow_id = workflow;
        }
        if let Some(step) = get(ENV_DEFAULT_STEP) {
            config.legacy_defaults.initial_step_id = step;
        }
        Ok(config)
    }

    /// Set the client data directory.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set the definitions file or directory.
    pub fn definitions_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.definitions_path = path.into();
        self
    }

    pub fn initialize_policy(mut self, policy: InitializePolicy) -> Self {
        self.initialize_policy = policy;
        self
    }

    pub fn legacy_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.legacy_file = Some(path.into());
        self
    }

    /// Load every workflow definition under `definitions_path`.
    pub fn load_definitions(&self) -> Result<BTreeMap<String, WorkflowDefinition>, ParseError> {
        if self.definitions_path.is_file() {
            let def = WorkflowLoader::load_from_file(&self.definitions_path)?;
            Ok(BTreeMap::from([(def.workflow.clone(), def)]))
        } else {
            WorkflowLoader::load_from_dir(&self.definitions_path)
        }
    }

    /// Open the file store described by this configuration.
    pub async fn open_store(&self) -> Result<FileStateStore, StoreError> {
        let store = FileStateStore::open(&self.data_dir)
            .await?
            .with_policy(self.initialize_policy);
        Ok(match &self.legacy_file {
            Some(path) => {
                store.with_legacy_source(LegacyJsonFile::new(path), self.legacy_defaults.clone())
            }
            None => store,
        })
    }
}
