//! Filesystem client state store.
//!
//! Layout: `<dir>/<stem>.json`, one pretty-printed record per client.
//! Ids made of `[A-Za-z0-9_.-]` that do not start with a dot are their own
//! stem; any other id is stored as `~` followed by the hex of its UTF-8
//! bytes, so `ops@acme.lu` lives in `~6f707340616...json`.
//!
//! Writes go to `<dir>/.<stem>.<uuid>.tmp`, are synced, then renamed over
//! the record, so a reader sees either the old or the new record. The
//! directory is synced after the rename.

use async_trait::async_trait;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::legacy::{LegacyDefaults, LegacySource};
use super::locks::KeyedLocks;
use super::{validate_client_id, ClientStateStore, InitializePolicy, Mutation};
use crate::error::{JourneyError, StoreError};
use crate::state::ClientState;

/// Pause before the single retry of a transient I/O failure
const RETRY_BACKOFF_MS: u64 = 25;

const RECORD_EXTENSION: &str = "json";

const TMP_EXTENSION: &str = "tmp";

/// Temp files older than this are leftovers of an interrupted write
const STALE_TMP_AGE: Duration = Duration::from_secs(60);

const ENCODED_PREFIX: char = '~';

fn is_plain_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// File stem for a client id.
fn file_stem(client_id: &str) -> String {
    if is_plain_id(client_id) {
        client_id.to_string()
    } else {
        format!("{}{}", ENCODED_PREFIX, hex::encode(client_id.as_bytes()))
    }
}

/// Client id for a file stem; `None` for names this store never writes.
fn client_id_from_stem(stem: &str) -> Option<String> {
    match stem.strip_prefix(ENCODED_PREFIX) {
        Some(encoded) => hex::decode(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .filter(|id| !id.is_empty()),
        None if is_plain_id(stem) => Some(stem.to_string()),
        None => None,
    }
}

/// Client state store backed by a directory of JSON files
pub struct FileStateStore {
    dir: PathBuf,
    policy: InitializePolicy,
    legacy: Option<(Arc<dyn LegacySource>, LegacyDefaults)>,
    locks: KeyedLocks,
}

impl FileStateStore {
    /// Open (creating if needed) a store rooted at `dir`. Temp files left
    /// behind by interrupted writes are removed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let swept = sweep_stale_temp_files(&dir).await?;
        debug!(dir = ?dir, swept, "Opened file state store");
        Ok(Self {
            dir,
            policy: InitializePolicy::default(),
            legacy: None,
            locks: KeyedLocks::new(),
        })
    }

    pub fn with_policy(mut self, policy: InitializePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Source used by `migrate_legacy_data`
    pub fn with_legacy_source(
        mut self,
        source: impl LegacySource + 'static,
        defaults: LegacyDefaults,
    ) -> Self {
        self.legacy = Some((Arc::new(source), defaults));
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn policy(&self) -> InitializePolicy {
        self.policy
    }

    fn path_for(&self, client_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", file_stem(client_id), RECORD_EXTENSION))
    }

    async fn read_record(&self, client_id: &str) -> Result<Option<ClientState>, StoreError> {
        let path = self.path_for(client_id);
        match retry_once("read", || tokio::fs::read(&path)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Storage(e)),
        }
    }

    async fn write_record(&self, state: &ClientState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(state)?;
        let path = self.path_for(&state.client_id);
        let tmp = self.dir.join(format!(
            ".{}.{}.{}",
            file_stem(&state.client_id),
            Uuid::new_v4(),
            TMP_EXTENSION
        ));

        let result = match retry_once("write", || write_synced(&tmp, &bytes)).await {
            Ok(()) => retry_once("rename", || tokio::fs::rename(&tmp, &path)).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::Storage(e));
        }

        // The rename is visible already; a failed directory sync only
        // weakens durability across power loss.
        if let Err(e) = sync_dir(&self.dir).await {
            warn!(dir = ?self.dir, "Directory sync failed: {}", e);
        }
        Ok(())
    }

    async fn exists(&self, client_id: &str) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.path_for(client_id)).await?)
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Remove `.*.tmp` files older than `STALE_TMP_AGE`. Younger ones may
/// belong to a write in progress elsewhere.
async fn sweep_stale_temp_files(dir: &Path) -> Result<usize, StoreError> {
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with('.') || !name.ends_with(TMP_EXTENSION) {
            continue;
        }
        let age = entry
            .metadata()
            .await
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok());
        if !age.is_some_and(|age| age >= STALE_TMP_AGE) {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(file = name, "Could not remove stale temp file: {}", e),
        }
    }

    if removed > 0 {
        info!(removed, "Removed stale temp files");
    }
    Ok(removed)
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}

/// Run `op`, repeating it once if the first attempt failed transiently.
async fn retry_once<T, F, Fut>(what: &str, mut op: F) -> std::io::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    match op().await {
        Err(e) if is_transient(&e) => {
            warn!("Transient {} failure, retrying once: {}", what, e);
            tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS)).await;
            op().await
        }
        other => other,
    }
}

#[async_trait]
impl ClientStateStore for FileStateStore {
    async fn initialize(
        &self,
        client_id: &str,
        workflow_id: &str,
        initial_step_id: &str,
    ) -> Result<ClientState, StoreError> {
        validate_client_id(client_id)?;
        let _guard = self.locks.lock(client_id).await;

        if self.policy == InitializePolicy::Fail && self.exists(client_id).await? {
            return Err(StoreError::AlreadyExists(client_id.to_string()));
        }

        let state = ClientState::new(client_id, workflow_id, initial_step_id);
        self.write_record(&state).await?;
        info!(client_id, workflow_id, "Initialized client state");
        Ok(state)
    }

    async fn find_or_create(&self, fresh: ClientState) -> Result<(ClientState, bool), StoreError> {
        validate_client_id(&fresh.client_id)?;
        let _guard = self.locks.lock(&fresh.client_id).await;

        if let Some(existing) = self.read_record(&fresh.client_id).await? {
            return Ok((existing, false));
        }
        self.write_record(&fresh).await?;
        info!(
            client_id = %fresh.client_id,
            workflow_id = %fresh.workflow_id,
            "Created client state"
        );
        Ok((fresh, true))
    }

    async fn load(&self, client_id: &str) -> Result<Option<ClientState>, StoreError> {
        validate_client_id(client_id)?;
        self.read_record(client_id).await
    }

    async fn save(&self, client_id: &str, mut state: ClientState) -> Result<ClientState, StoreError> {
        validate_client_id(client_id)?;
        let _guard = self.locks.lock(client_id).await;

        state.client_id = client_id.to_string();
        state.touch();
        self.write_record(&state).await?;
        debug!(client_id, step = %state.current_step_id, "Saved client state");
        Ok(state)
    }

    async fn modify(
        &self,
        client_id: &str,
        mutation: &mut Mutation<'_>,
    ) -> Result<ClientState, JourneyError> {
        validate_client_id(client_id)?;
        let _guard = self.locks.lock(client_id).await;

        let mut state = self
            .read_record(client_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(client_id.to_string()))?;
        mutation(&mut state)?;
        state.client_id = client_id.to_string();
        state.touch();
        self.write_record(&state).await?;
        debug!(client_id, step = %state.current_step_id, "Updated client state");
        Ok(state)
    }

    async fn delete(&self, client_id: &str) -> Result<(), StoreError> {
        validate_client_id(client_id)?;
        let _guard = self.locks.lock(client_id).await;

        match tokio::fs::remove_file(self.path_for(client_id)).await {
            Ok(()) => {
                info!(client_id, "Deleted client state");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Storage(e)),
        }
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(client_id_from_stem)
            {
                ids.push(id);
            }
        }

        ids.sort();
        Ok(ids)
    }

    async fn migrate_legacy_data(&self) -> Result<usize, StoreError> {
        let Some((source, defaults)) = &self.legacy else {
            debug!("No legacy source configured");
            return Ok(0);
        };

        let mut migrated = 0;
        for record in source.records().await? {
            if let Err(e) = validate_client_id(&record.id) {
                warn!("Skipping legacy record: {}", e);
                continue;
            }
            let _guard = self.locks.lock(&record.id).await;
            if self.exists(&record.id).await? {
                continue;
            }
            let state = record.into_client_state(defaults);
            self.write_record(&state).await?;
            migrated += 1;
        }

        info!(migrated, "Legacy client migration finished");
        Ok(migrated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ClientStateUpdate;
    use crate::store::LegacyClientRecord;
    use crate::value::{FieldValue, Inputs};
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> FileStateStore {
        FileStateStore::open(dir.path().join("clients")).await.unwrap()
    }

    fn legacy(ids: &[&str]) -> Vec<LegacyClientRecord> {
        ids.iter()
            .map(|id| serde_json::from_value(serde_json::json!({"id": id, "name": id})).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;

        let mut state = ClientState::new("c1", "kyc_onboarding", "start");
        state.merge_inputs(Inputs::from([("email".to_string(), FieldValue::from("a@b.com"))]));
        state.completed_steps = vec!["intro".into()];
        state.data = serde_json::json!({"name": "Acme", "owners": [{"pct": 30}]});

        let saved = store.save("c1", state.clone()).await.unwrap();
        let loaded = store.load("c1").await.unwrap().unwrap();

        assert_eq!(loaded, saved);
        assert_eq!(loaded.data, state.data);
        assert_eq!(loaded.collected_inputs, state.collected_inputs);
        assert!(store.dir().join("c1.json").exists());
    }

    #[tokio::test]
    async fn test_initialize_policy() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;

        store.initialize("c1", "wf1", "start").await.unwrap();
        store
            .update("c1", ClientStateUpdate::new().current_step("verify"))
            .await
            .unwrap();

        let err = store.initialize("c1", "wf1", "start").await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        let store = store.with_policy(InitializePolicy::Overwrite);
        let fresh = store.initialize("c1", "wf1", "start").await.unwrap();
        assert_eq!(fresh.current_step_id, "start");
        assert_eq!(
            store.load("c1").await.unwrap().unwrap().current_step_id,
            "start"
        );
    }

    #[tokio::test]
    async fn test_update_unknown_client() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;

        let err = store
            .update("ghost", ClientStateUpdate::new().current_step("x"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_failed_mutation_writes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;
        let before = store.initialize("c1", "wf1", "start").await.unwrap();

        let result = store
            .modify("c1", &mut |state| {
                state.current_step_id = "elsewhere".into();
                Err(StoreError::Legacy("abort".into()).into())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.load("c1").await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_list_ignores_temp_and_foreign_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;
        assert!(store.list().await.unwrap().is_empty());

        store.initialize("b", "wf1", "start").await.unwrap();
        store.initialize("a", "wf1", "start").await.unwrap();
        std::fs::write(store.dir().join(".a.123.tmp"), "{").unwrap();
        std::fs::write(store.dir().join("notes.txt"), "x").unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;

        store.initialize("c1", "wf1", "start").await.unwrap();
        store.delete("c1").await.unwrap();
        assert!(store.load("c1").await.unwrap().is_none());
        store.delete("c1").await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_record_is_a_serialization_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;
        std::fs::write(store.dir().join("c1.json"), "{\"client_id\":").unwrap();

        assert!(matches!(
            store.load("c1").await,
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn test_file_stem_encoding() {
        assert_eq!(file_stem("ACME_LU.2024"), "ACME_LU.2024");
        assert_eq!(file_stem("a b"), "~612062");
        assert_eq!(file_stem(".hidden"), "~2e68696464656e");

        for id in ["c1", "ops@acme.lu", "Acme Corp", "../escape", "Zürich-01", "~x"] {
            assert_eq!(client_id_from_stem(&file_stem(id)).as_deref(), Some(id));
        }
        assert_eq!(client_id_from_stem("~zz"), None);
        assert_eq!(client_id_from_stem("~"), None);
        assert_eq!(client_id_from_stem("has space"), None);
    }

    #[tokio::test]
    async fn test_any_non_empty_client_id() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;

        for id in ["ops@acme.lu", "Acme Corp", "../escape", "c1"] {
            store.initialize(id, "wf1", "start").await.unwrap();
            assert_eq!(store.get(id).await.unwrap().client_id, id);
        }
        assert_eq!(
            store.list().await.unwrap(),
            vec!["../escape", "Acme Corp", "c1", "ops@acme.lu"]
        );
        // nothing escapes the store directory
        assert!(!temp_dir.path().join("escape.json").exists());

        store.delete("Acme Corp").await.unwrap();
        assert!(store.load("Acme Corp").await.unwrap().is_none());

        assert!(matches!(
            store.initialize("", "wf1", "start").await,
            Err(StoreError::InvalidClientId(_))
        ));
    }

    #[tokio::test]
    async fn test_find_or_create_keeps_existing() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await.with_policy(InitializePolicy::Overwrite);

        let (created, was_new) = store
            .find_or_create(ClientState::new("c1", "wf1", "start"))
            .await
            .unwrap();
        assert!(was_new);
        store
            .update("c1", ClientStateUpdate::new().current_step("verify"))
            .await
            .unwrap();

        let (found, was_new) = store
            .find_or_create(ClientState::new("c1", "wf1", "start"))
            .await
            .unwrap();
        assert!(!was_new);
        assert_eq!(found.current_step_id, "verify");
        assert_ne!(found, created);
    }

    #[tokio::test]
    async fn test_retry_once_recovers_from_transient_failure() {
        let mut calls = 0;
        let result = retry_once("read", || {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt == 1 {
                    Err(std::io::Error::from(ErrorKind::Interrupted))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_retry_once_gives_up_after_second_failure() {
        let mut calls = 0;
        let result: std::io::Result<()> = retry_once("write", || {
            calls += 1;
            async { Err(std::io::Error::from(ErrorKind::TimedOut)) }
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::TimedOut);
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let mut calls = 0;
        let result: std::io::Result<()> = retry_once("read", || {
            calls += 1;
            async { Err(std::io::Error::from(ErrorKind::PermissionDenied)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_open_sweeps_stale_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("clients");
        std::fs::create_dir_all(&dir).unwrap();

        let stale = dir.join(".c1.1111.tmp");
        let file = std::fs::File::create(&stale).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();
        drop(file);
        let fresh = dir.join(".c1.2222.tmp");
        std::fs::write(&fresh, "{").unwrap();

        let store = FileStateStore::open(&dir).await.unwrap();
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_migration_skips_existing_records() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await.with_legacy_source(
            legacy(&["a", "b", "c", "ops@acme.lu", "Acme Corp", ""]),
            LegacyDefaults::default(),
        );

        let native = store.initialize("b", "native_wf", "start").await.unwrap();

        assert_eq!(store.migrate_legacy_data().await.unwrap(), 4);
        assert_eq!(store.migrate_legacy_data().await.unwrap(), 0);
        assert_eq!(
            store.list().await.unwrap(),
            vec!["Acme Corp", "a", "b", "c", "ops@acme.lu"]
        );
        assert_eq!(store.load("b").await.unwrap().unwrap(), native);

        let a = store.load("a").await.unwrap().unwrap();
        assert_eq!(a.data, serde_json::json!({"name": "a"}));
    }

    #[tokio::test]
    async fn test_migration_without_source() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir).await;
        assert_eq!(store.migrate_legacy_data().await.unwrap(), 0);
    }
}
