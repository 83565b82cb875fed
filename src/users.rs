//! User record store: the authoritative intended state of every account

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{VpnAcctError, VpnAcctResult};
use crate::model::UserRecord;
use crate::validation;
use crate::vpn::common;

/// Storage for [`UserRecord`]s.
///
/// Implementations provide their own atomicity per call; the reconciler never
/// holds a store lock while talking to a backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserStore: Send + Sync {
    /// All records, ordered by username
    async fn list(&self) -> VpnAcctResult<Vec<UserRecord>>;

    async fn get(&self, username: &str) -> VpnAcctResult<Option<UserRecord>>;

    /// Insert or replace a record, returning the previous version
    async fn upsert(&self, record: UserRecord) -> VpnAcctResult<Option<UserRecord>>;

    async fn remove(&self, username: &str) -> VpnAcctResult<Option<UserRecord>>;

    /// Flip the stored `is_active` flag, returning the previous record.
    /// `NotFound` if the user does not exist.
    async fn set_active(&self, username: &str, active: bool) -> VpnAcctResult<UserRecord>;
}

type RecordMap = BTreeMap<String, UserRecord>;

fn apply_set_active(records: &mut RecordMap, username: &str, active: bool) -> VpnAcctResult<UserRecord> {
    let record = records
        .get_mut(username)
        .ok_or_else(|| VpnAcctError::NotFound(format!("User '{}'", username)))?;
    let previous = record.clone();
    record.is_active = active;
    Ok(previous)
}

/// Records held in process memory
#[derive(Default)]
pub struct MemoryUserStore {
    records: Mutex<RecordMap>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = UserRecord>) -> Self {
        Self {
            records: Mutex::new(records.into_iter().map(|r| (r.username.clone(), r)).collect()),
        }
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn list(&self) -> VpnAcctResult<Vec<UserRecord>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn get(&self, username: &str) -> VpnAcctResult<Option<UserRecord>> {
        Ok(self.records.lock().await.get(username).cloned())
    }

    async fn upsert(&self, record: UserRecord) -> VpnAcctResult<Option<UserRecord>> {
        validation::validate_record(&record)?;
        Ok(self.records.lock().await.insert(record.username.clone(), record))
    }

    async fn remove(&self, username: &str) -> VpnAcctResult<Option<UserRecord>> {
        Ok(self.records.lock().await.remove(username))
    }

    async fn set_active(&self, username: &str, active: bool) -> VpnAcctResult<UserRecord> {
        apply_set_active(&mut *self.records.lock().await, username, active)
    }
}

/// On-disk layout of the user database
#[derive(Debug, Default, Serialize, Deserialize)]
struct UserDocument {
    #[serde(default)]
    users: Vec<UserRecord>,
}

/// The user database holds secrets; owner read/write only
const USER_DB_MODE: u32 = 0o600;

/// Records kept in a TOML document of `[[users]]` tables.
///
/// Every mutation reloads the file, applies the change and rewrites it
/// atomically while holding the store's lock and the file's advisory lock.
pub struct FileUserStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileUserStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read(&self) -> VpnAcctResult<RecordMap> {
        let Some(content) = common::read_optional(&self.path).await? else {
            debug!("User database {:?} does not exist yet", self.path);
            return Ok(RecordMap::new());
        };

        let document: UserDocument = toml::from_str(&content)
            .map_err(|e| VpnAcctError::ParseError(format!("Invalid user database {:?}: {}", self.path, e)))?;

        let mut records = RecordMap::new();
        for record in document.users {
            if records.contains_key(&record.username) {
                return Err(VpnAcctError::AlreadyExists(format!(
                    "User '{}' appears twice in {:?}",
                    record.username, self.path
                )));
            }
            records.insert(record.username.clone(), record);
        }
        Ok(records)
    }

    async fn write(&self, records: &RecordMap) -> VpnAcctResult<()> {
        let document = UserDocument {
            users: records.values().cloned().collect(),
        };
        let content = toml::to_string_pretty(&document)
            .map_err(|e| VpnAcctError::Storage(format!("Failed to serialize user database: {}", e)))?;
        common::write_atomic(&self.path, &content, USER_DB_MODE).await?;
        info!("Saved {} user records to {:?}", records.len(), self.path);
        Ok(())
    }

    async fn modify<F, R>(&self, f: F) -> VpnAcctResult<R>
    where
        F: FnOnce(&mut RecordMap) -> VpnAcctResult<R> + Send,
    {
        let _guard = self.lock.lock().await;
        let _file_lock = common::lock_exclusive(&self.path).await?;
        let mut records = self.read().await?;
        let result = f(&mut records)?;
        self.write(&records).await?;
        Ok(result)
    }
}

#[async_trait]
impl UserStore for FileUserStore {
    async fn list(&self) -> VpnAcctResult<Vec<UserRecord>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.into_values().collect())
    }

    async fn get(&self, username: &str) -> VpnAcctResult<Option<UserRecord>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.remove(username))
    }

    async fn upsert(&self, record: UserRecord) -> VpnAcctResult<Option<UserRecord>> {
        validation::validate_record(&record)?;
        self.modify(move |records| Ok(records.insert(record.username.clone(), record)))
            .await
    }

    async fn remove(&self, username: &str) -> VpnAcctResult<Option<UserRecord>> {
        self.modify(|records| Ok(records.remove(username))).await
    }

    async fn set_active(&self, username: &str, active: bool) -> VpnAcctResult<UserRecord> {
        self.modify(|records| apply_set_active(records, username, active)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BackendKind;
    use crate::test_util::date;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_memory_store_crud() {
        let store = MemoryUserStore::new();
        let alice = UserRecord::new("alice", "s3cret", date(2030, 1, 1));

        assert!(assert_ok!(store.upsert(alice.clone()).await).is_none());
        assert_eq!(store.get("alice").await.unwrap(), Some(alice.clone()));

        let previous = store.set_active("alice", false).await.unwrap();
        assert!(previous.is_active);
        assert!(!store.get("alice").await.unwrap().unwrap().is_active);

        assert!(store.remove("alice").await.unwrap().is_some());
        assert!(store.list().await.unwrap().is_empty());
        assert!(matches!(
            store.set_active("alice", true).await,
            Err(VpnAcctError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_upsert_validates() {
        let store = MemoryUserStore::new();
        let bad = UserRecord::new("-rf", "pw", date(2030, 1, 1));
        assert!(matches!(store.upsert(bad).await, Err(VpnAcctError::InvalidParameter(_))));

        let colon = UserRecord::new("bob", "pa:ss", date(2030, 1, 1));
        assert!(store.upsert(colon).await.is_err());
    }

    #[tokio::test]
    async fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db/users.toml");

        let store = FileUserStore::new(&path);
        assert!(store.list().await.unwrap().is_empty());

        store
            .upsert(
                UserRecord::new("bob", "pw", date(2030, 6, 1))
                    .with_backend(BackendKind::Commercial)
                    .with_max_connections(3),
            )
            .await
            .unwrap();
        assert_ok!(store.upsert(UserRecord::new("alice", "s3cret", date(2030, 1, 1))).await);
        assert_ok!(store.set_active("bob", false).await);

        let reopened = FileUserStore::new(&path);
        let users = reopened.list().await.unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].username, "alice");
        assert_eq!(users[1].backend, BackendKind::Commercial);
        assert_eq!(users[1].max_connections, 3);
        assert!(!users[1].is_active);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("[[users]]"));
        assert!(content.contains("expiry_date = \"2030-06-01\""));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_file_store_handles_share_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.toml");
        let first = std::sync::Arc::new(FileUserStore::new(&path));
        let second = std::sync::Arc::new(FileUserStore::new(&path));

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = if i % 2 == 0 { first.clone() } else { second.clone() };
            handles.push(tokio::spawn(async move {
                store
                    .upsert(UserRecord::new(&format!("user{}", i), "pw", date(2030, 1, 1)))
                    .await
            }));
        }
        for handle in handles {
            assert_ok!(handle.await.unwrap());
        }

        assert_eq!(FileUserStore::new(&path).list().await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.toml");
        std::fs::write(&path, "users = 3").unwrap();

        let store = FileUserStore::new(&path);
        assert!(matches!(store.list().await, Err(VpnAcctError::ParseError(_))));
    }

    #[tokio::test]
    async fn test_file_store_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.toml");
        std::fs::write(
            &path,
            r#"
[[users]]
username = "alice"
secret = "a"
expiry_date = "2030-01-01"

[[users]]
username = "alice"
secret = "b"
expiry_date = "2030-01-01"
"#,
        )
        .unwrap();

        let store = FileUserStore::new(&path);
        assert!(matches!(store.list().await, Err(VpnAcctError::AlreadyExists(_))));
    }
}
