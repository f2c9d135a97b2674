//! In-memory client state store for tests and embedding.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use super::legacy::{LegacyDefaults, LegacySource};
use super::{validate_client_id, ClientStateStore, InitializePolicy, Mutation};
use crate::error::{JourneyError, StoreError};
use crate::state::ClientState;

/// Same contract as `FileStateStore`, nothing survives the process.
#[derive(Default)]
pub struct InMemoryStateStore {
    records: RwLock<BTreeMap<String, ClientState>>,
    policy: InitializePolicy,
    legacy: Option<(Arc<dyn LegacySource>, LegacyDefaults)>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: InitializePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_legacy_source(
        mut self,
        source: impl LegacySource + 'static,
        defaults: LegacyDefaults,
    ) -> Self {
        self.legacy = Some((Arc::new(source), defaults));
        self
    }
}

#[async_trait]
impl ClientStateStore for InMemoryStateStore {
    async fn initialize(
        &self,
        client_id: &str,
        workflow_id: &str,
        initial_step_id: &str,
    ) -> Result<ClientState, StoreError> {
        validate_client_id(client_id)?;
        let mut records = self.records.write().await;

        if self.policy == InitializePolicy::Fail && records.contains_key(client_id) {
            return Err(StoreError::AlreadyExists(client_id.to_string()));
        }
        let state = ClientState::new(client_id, workflow_id, initial_step_id);
        records.insert(client_id.to_string(), state.clone());
        Ok(state)
    }

    async fn find_or_create(&self, fresh: ClientState) -> Result<(ClientState, bool), StoreError> {
        validate_client_id(&fresh.client_id)?;
        let mut records = self.records.write().await;

        if let Some(existing) = records.get(&fresh.client_id) {
            return Ok((existing.clone(), false));
        }
        records.insert(fresh.client_id.clone(), fresh.clone());
        Ok((fresh, true))
    }

    async fn load(&self, client_id: &str) -> Result<Option<ClientState>, StoreError> {
        validate_client_id(client_id)?;
        Ok(self.records.read().await.get(client_id).cloned())
    }

    async fn save(&self, client_id: &str, mut state: ClientState) -> Result<ClientState, StoreError> {
        validate_client_id(client_id)?;
        state.client_id = client_id.to_string();
        state.touch();
        self.records
            .write()
            .await
            .insert(client_id.to_string(), state.clone());
        Ok(state)
    }

    async fn modify(
        &self,
        client_id: &str,
        mutation: &mut Mutation<'_>,
    ) -> Result<ClientState, JourneyError> {
        validate_client_id(client_id)?;
        let mut records = self.records.write().await;

        let mut state = records
            .get(client_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(client_id.to_string()))?;
        mutation(&mut state)?;
        state.client_id = client_id.to_string();
        state.touch();
        records.insert(client_id.to_string(), state.clone());
        Ok(state)
    }

    async fn delete(&self, client_id: &str) -> Result<(), StoreError> {
        validate_client_id(client_id)?;
        self.records.write().await.remove(client_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.records.read().await.keys().cloned().collect())
    }

    async fn migrate_legacy_data(&self) -> Result<usize, StoreError> {
        let Some((source, defaults)) = &self.legacy else {
            return Ok(0);
        };

        let incoming = source.records().await?;
        let mut records = self.records.write().await;
        let mut migrated = 0;
        for record in incoming {
            if validate_client_id(&record.id).is_err() || records.contains_key(&record.id) {
                continue;
            }
            let state = record.into_client_state(defaults);
            records.insert(state.client_id.clone(), state);
            migrated += 1;
        }

        debug!(migrated, "Legacy client migration finished");
        Ok(migrated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ClientStateUpdate;
    use crate::store::LegacyClientRecord;

    #[tokio::test]
    async fn test_memory_store_contract() {
        let store = InMemoryStateStore::new();

        store.initialize("b", "wf1", "start").await.unwrap();
        store.initialize("a", "wf1", "start").await.unwrap();
        assert!(matches!(
            store.initialize("a", "wf1", "start").await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert_eq!(store.list().await.unwrap(), vec!["a", "b"]);

        let updated = store
            .update("a", ClientStateUpdate::new().current_step("verify"))
            .await
            .unwrap();
        assert_eq!(updated.current_step_id, "verify");
        assert_eq!(store.get("a").await.unwrap(), updated);

        store.delete("a").await.unwrap();
        store.delete("a").await.unwrap();
        assert!(store.get("a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_memory_find_or_create() {
        let store = InMemoryStateStore::new();

        let (_, created) = store
            .find_or_create(ClientState::new("a", "wf1", "start"))
            .await
            .unwrap();
        assert!(created);

        let (existing, created) = store
            .find_or_create(ClientState::new("a", "wf2", "other"))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(existing.workflow_id, "wf1");

        assert!(matches!(
            store.find_or_create(ClientState::new("", "wf1", "start")).await,
            Err(StoreError::InvalidClientId(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_migration() {
        let records: Vec<LegacyClientRecord> = ["x", "y", "", "Acme Corp"]
            .iter()
            .map(|id| serde_json::from_value(serde_json::json!({"id": id})).unwrap())
            .collect();
        let store = InMemoryStateStore::new()
            .with_policy(InitializePolicy::Overwrite)
            .with_legacy_source(records, LegacyDefaults::default());

        assert_eq!(store.migrate_legacy_data().await.unwrap(), 3);
        assert_eq!(store.migrate_legacy_data().await.unwrap(), 0);
        assert_eq!(store.list().await.unwrap(), vec!["Acme Corp", "x", "y"]);
        assert_eq!(store.get("x").await.unwrap().current_step_id, "start");

        // overwrite policy resets a migrated record
        store.initialize("x", "kyc", "intake").await.unwrap();
        assert_eq!(store.get("x").await.unwrap().workflow_id, "kyc");
    }
}
