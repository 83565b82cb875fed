//! Credential file consumed by the community daemon
//!
//! One `username:secret:max_connections` line per user allowed to connect.
//! The file is always rewritten wholesale through a temp file and rename.
//! Every read-modify-write runs under the store's mutex and an advisory lock
//! on a sidecar file, so the CLI and the daemon cannot lose each other's
//! updates.

use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::VpnAcctResult;
use crate::model::CredentialEntry;
use crate::vpn::common;

/// Entries keyed by username
pub type CredentialMap = BTreeMap<String, CredentialEntry>;

/// Mode for the credential file; the daemon's auth script reads it via group
const CREDENTIAL_FILE_MODE: u32 = 0o640;

pub struct CredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Current entries; a missing file is an empty set
    pub async fn load(&self) -> VpnAcctResult<CredentialMap> {
        let _guard = self.lock.lock().await;
        self.read_entries().await
    }

    /// Replace the whole file with `entries`
    pub async fn save(&self, entries: &CredentialMap) -> VpnAcctResult<()> {
        let _guard = self.lock.lock().await;
        let _file_lock = common::lock_exclusive(&self.path).await?;
        self.write_entries(entries).await
    }

    /// Insert or replace one entry. Returns the previous entry when it
    /// differed; the file is left untouched when nothing changed.
    pub async fn upsert(&self, entry: CredentialEntry) -> VpnAcctResult<Upsert> {
        self.modify(|entries| match entries.get(&entry.username) {
            Some(existing) if *existing == entry => Upsert::Unchanged,
            _ => match entries.insert(entry.username.clone(), entry) {
                Some(previous) => Upsert::Replaced(previous),
                None => Upsert::Inserted,
            },
        })
        .await
    }

    /// Remove one entry, rewriting the file only if it was present
    pub async fn remove(&self, username: &str) -> VpnAcctResult<Option<CredentialEntry>> {
        self.modify(|entries| entries.remove(username)).await
    }

    /// Swap in a complete entry set, returning what the file held before
    pub async fn replace_all(&self, entries: CredentialMap) -> VpnAcctResult<CredentialMap> {
        self.modify(|current| std::mem::replace(current, entries)).await
    }

    /// Run `f` on the current entries under the lock and persist the result
    /// if `f` changed anything.
    async fn modify<F, R>(&self, f: F) -> VpnAcctResult<R>
    where
        F: FnOnce(&mut CredentialMap) -> R,
    {
        let _guard = self.lock.lock().await;
        let _file_lock = common::lock_exclusive(&self.path).await?;
        let mut entries = self.read_entries().await?;
        let before = entries.clone();
        let result = f(&mut entries);
        if entries != before {
            self.write_entries(&entries).await?;
        }
        Ok(result)
    }

    async fn read_entries(&self) -> VpnAcctResult<CredentialMap> {
        match common::read_optional(&self.path).await? {
            Some(content) => Ok(parse(&content)),
            None => {
                debug!("Credential file {:?} does not exist yet", self.path);
                Ok(CredentialMap::new())
            }
        }
    }

    async fn write_entries(&self, entries: &CredentialMap) -> VpnAcctResult<()> {
        common::write_atomic(&self.path, &render(entries), CREDENTIAL_FILE_MODE).await?;
        info!("Wrote {} credential entries to {:?}", entries.len(), self.path);
        Ok(())
    }
}

/// Outcome of [`CredentialStore::upsert`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced(CredentialEntry),
    Unchanged,
}

/// Parse the file body. The username runs to the first `:` and the limit
/// follows the last one, so only the secret could ever hold a delimiter.
pub fn parse(content: &str) -> CredentialMap {
    let mut entries = CredentialMap::new();

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_line(line) {
            Some(entry) => {
                entries.insert(entry.username.clone(), entry);
            }
            None => warn!("Ignoring malformed credential line {}", index + 1),
        }
    }

    entries
}

fn parse_line(line: &str) -> Option<CredentialEntry> {
    let (username, rest) = line.split_once(':')?;
    let (secret, max_connections) = rest.rsplit_once(':')?;
    if username.is_empty() {
        return None;
    }

    Some(CredentialEntry {
        username: username.to_string(),
        secret: secret.to_string(),
        max_connections: max_connections.trim().parse().ok()?,
    })
}

/// Serialize entries, one line each
pub fn render(entries: &CredentialMap) -> String {
    entries
        .values()
        .map(|entry| format!("{}\n", entry))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(username: &str, secret: &str, max_connections: u32) -> CredentialEntry {
        CredentialEntry {
            username: username.to_string(),
            secret: secret.to_string(),
            max_connections,
        }
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let entries = parse("alice:s3cret:2\n\nbroken-line\nbob::1\ncarol:pw:many\ndave:a:b:3\n");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries["alice"], entry("alice", "s3cret", 2));
        assert_eq!(entries["bob"].secret, "");
        assert_eq!(entries["dave"].secret, "a:b");
        assert!(!entries.contains_key("carol"));
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("psw-file"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_load_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("openvpn/psw-file");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "zed:pw:1\nalice:s3cret:2\n").unwrap();

        let store = CredentialStore::new(&path);
        let loaded = store.load().await.unwrap();
        store.save(&loaded).await.unwrap();

        let mut original: Vec<_> = "zed:pw:1\nalice:s3cret:2\n".lines().collect();
        let rewritten = std::fs::read_to_string(&path).unwrap();
        let mut rewritten: Vec<_> = rewritten.lines().collect();
        original.sort();
        rewritten.sort();
        assert_eq!(original, rewritten);
    }

    #[tokio::test]
    async fn test_upsert_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc/openvpn/psw-file");
        let store = CredentialStore::new(&path);

        assert_eq!(store.upsert(entry("alice", "s3cret", 2)).await.unwrap(), Upsert::Inserted);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "alice:s3cret:2\n");

        assert_eq!(store.upsert(entry("alice", "s3cret", 2)).await.unwrap(), Upsert::Unchanged);
        assert_eq!(
            store.upsert(entry("alice", "n3w", 2)).await.unwrap(),
            Upsert::Replaced(entry("alice", "s3cret", 2))
        );

        assert!(store.remove("bob").await.unwrap().is_none());
        assert_eq!(store.remove("alice").await.unwrap().unwrap().secret, "n3w");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[tokio::test]
    async fn test_concurrent_upserts_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path().join("psw-file")));

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.upsert(entry(&format!("user{}", i), "pw", 1)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.load().await.unwrap().len(), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_separate_handles_do_not_lose_updates() {
        // One handle per writer, as the CLI and the daemon each open their own
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("psw-file");
        let cli = Arc::new(CredentialStore::new(&path));
        let daemon = Arc::new(CredentialStore::new(&path));

        let mut handles = Vec::new();
        for i in 0..40 {
            let store = if i % 2 == 0 { cli.clone() } else { daemon.clone() };
            handles.push(tokio::spawn(async move {
                store.upsert(entry(&format!("user{}", i), "pw", 1)).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        let entries = parse(&std::fs::read_to_string(&path).unwrap());
        assert_eq!(entries.len(), 40);
    }
}
