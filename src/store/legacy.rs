//! Legacy Client Records
//!
//! Records written by the earlier UI: camelCase JSON, workflow position
//! flattened next to the client profile. Everything that is not a known
//! workflow field is the profile and becomes `ClientState::data`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::StoreError;
use crate::state::ClientState;
use crate::value::{FieldValue, Inputs};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyClientRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    /// `null` reads as empty
    #[serde(default, alias = "formData")]
    pub collected_inputs: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub completed_steps: Option<Vec<String>>,
    /// RFC 3339 text or epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<serde_json::Value>,
    #[serde(flatten)]
    pub profile: serde_json::Map<String, serde_json::Value>,
}

/// Fallbacks for records that predate workflow tracking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyDefaults {
    pub workflow_id: String,
    pub initial_step_id: String,
}

impl Default for LegacyDefaults {
    fn default() -> Self {
        Self {
            workflow_id: "onboarding".to_string(),
            initial_step_id: "start".to_string(),
        }
    }
}

impl LegacyClientRecord {
    /// Native form of this record.
    pub fn into_client_state(self, defaults: &LegacyDefaults) -> ClientState {
        let last_updated = self
            .last_updated
            .as_ref()
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);

        let history = self.completed_steps.unwrap_or_default();
        let mut completed_steps: Vec<String> = Vec::with_capacity(history.len());
        for step in history {
            if !completed_steps.contains(&step) {
                completed_steps.push(step);
            }
        }

        let collected_inputs: Inputs = self
            .collected_inputs
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, FieldValue::from(v)))
            .collect();

        ClientState {
            client_id: self.id,
            workflow_id: self
                .workflow_id
                .unwrap_or_else(|| defaults.workflow_id.clone()),
            current_step_id: self
                .current_step_id
                .unwrap_or_else(|| defaults.initial_step_id.clone()),
            current_stage: None,
            collected_inputs,
            completed_steps,
            completed_stages: Vec::new(),
            data: serde_json::Value::Object(self.profile),
            last_updated,
        }
    }
}

fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// Where legacy records come from
#[async_trait]
pub trait LegacySource: Send + Sync {
    async fn records(&self) -> Result<Vec<LegacyClientRecord>, StoreError>;
}

/// A fixed set of records, e.g. already fetched by the caller
#[async_trait]
impl LegacySource for Vec<LegacyClientRecord> {
    async fn records(&self) -> Result<Vec<LegacyClientRecord>, StoreError> {
        Ok(self.clone())
    }
}

/// JSON file holding either `[record, ...]` or `{"clients": [record, ...]}`.
/// A missing file means there is nothing to migrate. Records that do not
/// parse are logged and skipped; the rest are returned.
#[derive(Debug, Clone)]
pub struct LegacyJsonFile {
    path: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LegacyFile {
    List(Vec<serde_json::Value>),
    Wrapped { clients: Vec<serde_json::Value> },
}

impl LegacyJsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl LegacySource for LegacyJsonFile {
    async fn records(&self) -> Result<Vec<LegacyClientRecord>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = ?self.path, "No legacy client file");
                return Ok(Vec::new());
            }
            Err(e) => return Err(StoreError::Storage(e)),
        };

        let file: LegacyFile = serde_json::from_slice(&bytes).map_err(|e| {
            StoreError::Legacy(format!("{}: {}", self.path.display(), e))
        })?;
        let raw = match file {
            LegacyFile::List(records) => records,
            LegacyFile::Wrapped { clients } => clients,
        };

        let mut records = Vec::with_capacity(raw.len());
        for (index, value) in raw.into_iter().enumerate() {
            match serde_json::from_value::<LegacyClientRecord>(value) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(
                    path = ?self.path,
                    index,
                    "Skipping unreadable legacy record: {}",
                    e
                ),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_legacy_record_conversion() {
        let record: LegacyClientRecord = serde_json::from_value(json!({
            "id": "acme",
            "name": "Acme Holdings",
            "clientType": "corporate",
            "jurisdiction": "LU",
            "currentStepId": "verify",
            "formData": {"email": "ops@acme.lu", "employees": 40},
            "completedSteps": ["start", "start"],
            "lastUpdated": "2024-03-01T10:00:00Z"
        }))
        .unwrap();

        let state = record.into_client_state(&LegacyDefaults::default());
        assert_eq!(state.client_id, "acme");
        assert_eq!(state.workflow_id, "onboarding");
        assert_eq!(state.current_step_id, "verify");
        assert_eq!(state.completed_steps, vec!["start"]);
        assert_eq!(state.collected_inputs["email"], FieldValue::from("ops@acme.lu"));
        assert_eq!(state.collected_inputs["employees"], FieldValue::from(40));
        assert_eq!(
            state.data,
            json!({"name": "Acme Holdings", "clientType": "corporate", "jurisdiction": "LU"})
        );
        assert_eq!(state.last_updated.to_rfc3339(), "2024-03-01T10:00:00+00:00");
    }

    #[test]
    fn test_defaults_fill_missing_position() {
        let record: LegacyClientRecord =
            serde_json::from_value(json!({"id": "bare", "lastUpdated": 1709287200000i64})).unwrap();
        let defaults = LegacyDefaults {
            workflow_id: "kyc".into(),
            initial_step_id: "intake".into(),
        };

        let state = record.into_client_state(&defaults);
        assert_eq!(state.workflow_id, "kyc");
        assert_eq!(state.current_step_id, "intake");
        assert_eq!(state.data, json!({}));
        assert_eq!(state.last_updated.timestamp_millis(), 1709287200000);
    }

    #[test]
    fn test_null_history_and_inputs() {
        let record: LegacyClientRecord = serde_json::from_value(json!({
            "id": "nulls",
            "formData": null,
            "completedSteps": null,
            "currentStepId": null
        }))
        .unwrap();

        let state = record.into_client_state(&LegacyDefaults::default());
        assert!(state.collected_inputs.is_empty());
        assert!(state.completed_steps.is_empty());
        assert_eq!(state.current_step_id, "start");
    }

    #[tokio::test]
    async fn test_json_file_shapes() {
        let dir = tempfile::TempDir::new().unwrap();

        let missing = LegacyJsonFile::new(dir.path().join("absent.json"));
        assert!(missing.records().await.unwrap().is_empty());

        let list = dir.path().join("list.json");
        std::fs::write(&list, r#"[{"id": "a"}, {"id": "b"}]"#).unwrap();
        assert_eq!(LegacyJsonFile::new(&list).records().await.unwrap().len(), 2);

        let wrapped = dir.path().join("wrapped.json");
        std::fs::write(&wrapped, r#"{"clients": [{"id": "c"}]}"#).unwrap();
        let records = LegacyJsonFile::new(&wrapped).records().await.unwrap();
        assert_eq!(records[0].id, "c");

        let mixed = dir.path().join("mixed.json");
        std::fs::write(
            &mixed,
            r#"[{"id": "ok"}, {"name": "no id"}, 7, {"id": "also_ok", "completedSteps": null}]"#,
        )
        .unwrap();
        let records = LegacyJsonFile::new(&mixed).records().await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["ok", "also_ok"]);

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{not json").unwrap();
        assert!(matches!(
            LegacyJsonFile::new(&broken).records().await,
            Err(StoreError::Legacy(_))
        ));
    }
}
