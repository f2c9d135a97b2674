//! Workflow Definition Types and YAML Loading
//!
//! Workflows are authored in YAML (JSON is accepted as a YAML subset) and
//! validated on load. A definition holds one or more variants, each scoped
//! to a client type and optionally to a set of jurisdictions.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::error::ParseError;
use crate::value::FieldValue;

/// Terminal sentinel. A transition to `END` finishes the journey.
pub const END: &str = "END";

/// A complete workflow definition loaded from YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawDefinition")]
pub struct WorkflowDefinition {
    /// Workflow identifier (e.g., "kyc_onboarding")
    pub workflow: String,
    pub version: u32,
    pub description: String,
    /// Optional stage catalogue with display names
    pub stages: Vec<StageDef>,
    pub variants: Vec<VariantDef>,
}

impl WorkflowDefinition {
    /// Display name for a stage id; falls back to the id itself.
    pub fn stage_name<'a>(&'a self, stage_id: &'a str) -> &'a str {
        self.stages
            .iter()
            .find(|s| s.id == stage_id)
            .and_then(|s| s.name.as_deref())
            .unwrap_or(stage_id)
    }

    pub fn variant(&self, id: &str) -> Option<&VariantDef> {
        self.variants.iter().find(|v| v.id == id)
    }
}

fn default_version() -> u32 {
    1
}

/// Wire shape. Accepts either `variants: [...]` or a single top-level
/// `applies_to` + `steps` pair.
#[derive(Deserialize)]
struct RawDefinition {
    workflow: String,
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    description: String,
    #[serde(default)]
    stages: Vec<StageDef>,
    #[serde(default)]
    variants: Vec<VariantDef>,
    #[serde(default)]
    applies_to: Option<AppliesTo>,
    #[serde(default)]
    steps: Vec<StepDef>,
}

impl From<RawDefinition> for WorkflowDefinition {
    fn from(raw: RawDefinition) -> Self {
        let mut variants = raw.variants;
        if variants.is_empty() {
            if let Some(applies_to) = raw.applies_to {
                variants.push(VariantDef {
                    id: raw.workflow.clone(),
                    applies_to,
                    steps: raw.steps,
                });
            }
        }
        Self {
            workflow: raw.workflow,
            version: raw.version,
            description: raw.description,
            stages: raw.stages,
            variants,
        }
    }
}

/// Stage catalogue entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One client-profile-specific flavour of the workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantDef {
    pub id: String,
    pub applies_to: AppliesTo,
    pub steps: Vec<StepDef>,
}

impl VariantDef {
    /// Effective transition rules for the step at `position`. Steps without
    /// `next` fall through to the following step, the last one to `END`.
    pub fn resolved_next(&self, position: usize) -> Option<NextRule> {
        let step = self.steps.get(position)?;
        Some(step.next.clone().unwrap_or_else(|| {
            let following = self
                .steps
                .get(position + 1)
                .map(|s| s.id.clone())
                .unwrap_or_else(|| END.to_string());
            NextRule::to(following)
        }))
    }
}

/// Which clients a variant is for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliesTo {
    pub client_type: String,
    /// Empty means any jurisdiction
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jurisdictions: Vec<String>,
}

impl AppliesTo {
    pub fn is_wildcard(&self) -> bool {
        self.jurisdictions.is_empty()
    }
}

/// Step definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Task the UI renders for this step
    #[serde(default, rename = "task", alias = "task_ref", skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<NextRule>,
}

/// Ordered conditions plus a fallback target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "NextSpec")]
pub struct NextRule {
    pub conditions: Vec<ConditionDef>,
    pub default: String,
}

impl NextRule {
    /// Unconditional transition
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            conditions: Vec::new(),
            default: target.into(),
        }
    }

    /// Every target this rule can resolve to, in declaration order.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.conditions
            .iter()
            .map(|c| c.target.as_str())
            .chain(std::iter::once(self.default.as_str()))
    }
}

/// `next: verify` or `next: { conditions: [...], default: verify }`
#[derive(Deserialize)]
#[serde(untagged)]
enum NextSpec {
    Target(String),
    Rules {
        #[serde(default)]
        conditions: Vec<ConditionDef>,
        default: String,
    },
}

impl From<NextSpec> for NextRule {
    fn from(spec: NextSpec) -> Self {
        match spec {
            NextSpec::Target(target) => NextRule::to(target),
            NextSpec::Rules {
                conditions,
                default,
            } => NextRule {
                conditions,
                default,
            },
        }
    }
}

/// `field op value -> target`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionDef {
    pub field: String,
    pub op: CompareOp,
    pub value: FieldValue,
    pub target: String,
}

/// Binary comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "==", alias = "eq")]
    Eq,
    #[serde(rename = "!=", alias = "ne")]
    Ne,
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = ">=", alias = "gte")]
    Gte,
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = "<=", alias = "lte")]
    Lte,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structural checks. Returns the first violation found.
pub fn validate(def: &WorkflowDefinition) -> Result<(), ParseError> {
    if def.variants.is_empty() {
        return Err(ParseError::NoVariants {
            workflow: def.workflow.clone(),
        });
    }

    let declared_stages: HashSet<&str> = def.stages.iter().map(|s| s.id.as_str()).collect();
    let mut variant_ids = HashSet::new();

    for variant in &def.variants {
        if !variant_ids.insert(variant.id.as_str()) {
            return Err(ParseError::DuplicateVariant {
                variant: variant.id.clone(),
            });
        }
        if variant.steps.is_empty() {
            return Err(ParseError::EmptyVariant {
                variant: variant.id.clone(),
            });
        }

        let mut step_ids = HashSet::new();
        for (position, step) in variant.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(ParseError::EmptyStepId {
                    variant: variant.id.clone(),
                    position,
                });
            }
            if step.id == END {
                return Err(ParseError::ReservedStepId {
                    variant: variant.id.clone(),
                });
            }
            if !step_ids.insert(step.id.as_str()) {
                return Err(ParseError::DuplicateStep {
                    variant: variant.id.clone(),
                    step: step.id.clone(),
                });
            }
            if step.required_fields.iter().any(|f| f.trim().is_empty()) {
                return Err(ParseError::EmptyRequiredField {
                    step: step.id.clone(),
                });
            }
            if let Some(next) = &step.next {
                if next.conditions.iter().any(|c| c.field.trim().is_empty()) {
                    return Err(ParseError::EmptyConditionField {
                        step: step.id.clone(),
                    });
                }
            }
            if let Some(stage) = &step.stage {
                if !declared_stages.is_empty() && !declared_stages.contains(stage.as_str()) {
                    return Err(ParseError::UnknownStage {
                        step: step.id.clone(),
                        stage: stage.clone(),
                    });
                }
            }
        }

        for position in 0..variant.steps.len() {
            let step = &variant.steps[position];
            let Some(next) = variant.resolved_next(position) else {
                continue;
            };
            let unknown = next
                .targets()
                .find(|t| *t != END && !step_ids.contains(t))
                .map(str::to_string);
            if let Some(target) = unknown {
                return Err(ParseError::UnknownTarget {
                    step: step.id.clone(),
                    target,
                });
            }
        }
    }

    Ok(())
}

/// Parse and validate a definition from YAML or JSON text.
pub fn load(source: &str) -> Result<WorkflowDefinition, ParseError> {
    WorkflowLoader::load_from_str(source)
}

/// Loader for workflow definitions
pub struct WorkflowLoader;

impl WorkflowLoader {
    /// Load all workflow definitions from a directory
    pub fn load_from_dir(
        dir: &Path,
    ) -> Result<BTreeMap<String, WorkflowDefinition>, ParseError> {
        let mut definitions = BTreeMap::new();

        if !dir.exists() {
            return Ok(definitions);
        }

        let io_err = |source| ParseError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path
                .extension()
                .map(|e| e == "yaml" || e == "yml" || e == "json")
                .unwrap_or(false)
            {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let def = Self::load_from_file(&path)?;
            if definitions.contains_key(&def.workflow) {
                return Err(ParseError::DuplicateWorkflow {
                    workflow: def.workflow,
                });
            }
            definitions.insert(def.workflow.clone(), def);
        }

        tracing::info!(
            "Loaded {} workflow definitions from {:?}",
            definitions.len(),
            dir
        );
        Ok(definitions)
    }

    /// Load a single workflow definition from a file
    pub fn load_from_file(path: &Path) -> Result<WorkflowDefinition, ParseError> {
        let content = std::fs::read_to_string(path).map_err(|source| ParseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let def = Self::load_from_str(&content)?;
        tracing::debug!(workflow = %def.workflow, path = ?path, "Loaded workflow definition");
        Ok(def)
    }

    /// Load from a YAML string
    pub fn load_from_str(yaml: &str) -> Result<WorkflowDefinition, ParseError> {
        let def: WorkflowDefinition = serde_yaml::from_str(yaml)?;
        validate(&def)?;
        Ok(def)
    }
}
