//! Client State Storage
//!
//! Abstract interface for persisting `ClientState` records keyed by client
//! id. Implementations target the local filesystem (one JSON file per
//! client) or memory (tests, embedding).
//!
//! Writes for one client id are serialized; writes for different ids never
//! wait on each other. Readers never observe a partially written record.
//! Client ids are arbitrary non-empty strings.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{JourneyError, StoreError};
use crate::state::{ClientState, ClientStateUpdate};

mod file;
mod legacy;
mod locks;
mod memory;

pub use file::FileStateStore;
pub use legacy::{LegacyClientRecord, LegacyDefaults, LegacyJsonFile, LegacySource};
pub use memory::InMemoryStateStore;

/// What `initialize` does when the client already has a record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitializePolicy {
    /// Refuse with `StoreError::AlreadyExists`
    #[default]
    Fail,
    /// Replace the existing record with a fresh one
    Overwrite,
}

impl std::str::FromStr for InitializePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail" => Ok(Self::Fail),
            "overwrite" => Ok(Self::Overwrite),
            _ => Err(format!("Unknown initialize policy: {}", s)),
        }
    }
}

/// In-place edit run under the store's per-client lock. Returning an
/// error aborts the write.
pub type Mutation<'a> = dyn FnMut(&mut ClientState) -> Result<(), JourneyError> + Send + 'a;

/// Persistent storage for client journey state
#[async_trait]
pub trait ClientStateStore: Send + Sync {
    /// Create a fresh record at `initial_step_id`
    async fn initialize(
        &self,
        client_id: &str,
        workflow_id: &str,
        initial_step_id: &str,
    ) -> Result<ClientState, StoreError>;

    /// Existing record for `fresh.client_id`, or `fresh` stored as a new
    /// one. Check and write happen under the client's lock, regardless of
    /// `InitializePolicy`. The flag is true when `fresh` was written.
    async fn find_or_create(&self, fresh: ClientState) -> Result<(ClientState, bool), StoreError>;

    /// Full record, or `None` if the client is unknown
    async fn load(&self, client_id: &str) -> Result<Option<ClientState>, StoreError>;

    /// Overwrite the whole record. Returns it as stored (fresh
    /// `last_updated`, `client_id` forced to the key).
    async fn save(&self, client_id: &str, state: ClientState) -> Result<ClientState, StoreError>;

    /// Read, edit and write back as one step for this client.
    async fn modify(
        &self,
        client_id: &str,
        mutation: &mut Mutation<'_>,
    ) -> Result<ClientState, JourneyError>;

    /// Remove the record. Unknown ids are not an error.
    async fn delete(&self, client_id: &str) -> Result<(), StoreError>;

    /// Known client ids, ascending
    async fn list(&self) -> Result<Vec<String>, StoreError>;

    /// Import legacy records that have no native record yet. Returns the
    /// number imported; a repeat run imports nothing new.
    async fn migrate_legacy_data(&self) -> Result<usize, StoreError>;

    /// Shallow merge of the provided fields
    async fn update(
        &self,
        client_id: &str,
        update: ClientStateUpdate,
    ) -> Result<ClientState, StoreError> {
        let mut update = Some(update);
        self.modify(client_id, &mut |state| {
            if let Some(update) = update.take() {
                update.apply(state);
            }
            Ok(())
        })
        .await
        .map_err(|e| match e {
            JourneyError::Store(e) => e,
            other => StoreError::Storage(std::io::Error::other(other.to_string())),
        })
    }

    /// Load, or fail with `StoreError::NotFound`
    async fn get(&self, client_id: &str) -> Result<ClientState, StoreError> {
        self.load(client_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(client_id.to_string()))
    }
}

/// Any non-empty string is a client id. Stores map ids to their own keys
/// (see `FileStateStore` for the on-disk encoding).
pub fn validate_client_id(client_id: &str) -> Result<(), StoreError> {
    if client_id.is_empty() {
        Err(StoreError::InvalidClientId(client_id.to_string()))
    } else {
        Ok(())
    }
}
