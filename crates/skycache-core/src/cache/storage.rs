use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::net::Response;

/// One named URL→response map, persisted as a single JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Namespace {
    name: String,
    /// Creation order across the whole storage.
    seq: u64,
    created_at: DateTime<Utc>,
    entries: BTreeMap<String, Response>,
}

#[derive(Debug, Default)]
struct Inner {
    namespaces: HashMap<String, Namespace>,
    /// Namespaces whose file could not be read at open, with that file.
    unreadable: BTreeMap<String, PathBuf>,
    next_seq: u64,
}

/// Inventory line for one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSummary {
    pub name: String,
    pub entry_count: usize,
    pub urls: Vec<String>,
}

/// The set of cache namespaces on this device.
///
/// Every mutation is applied to a copy of the namespace, written through to
/// disk (temp file + rename) on the blocking pool and only then swapped in,
/// so a failed write leaves both memory and disk at the previous state.
/// Readers never wait on disk I/O. Without a root directory the storage is
/// memory-only.
///
/// A namespace file that cannot be parsed is remembered as unreadable: it
/// is listed by [`unreadable`](Self::unreadable), misses on every lookup
/// and is removed by [`delete`](Self::delete) or replaced by the next write.
#[derive(Debug)]
pub struct CacheStorage {
    root: Option<PathBuf>,
    inner: RwLock<Inner>,
    /// Held across a whole mutation so snapshots reach disk in order.
    writer: Mutex<()>,
}

impl CacheStorage {
    pub fn in_memory() -> Self {
        Self {
            root: None,
            inner: RwLock::new(Inner::default()),
            writer: Mutex::new(()),
        }
    }

    /// Open (or create) a storage directory and load every namespace in it.
    pub fn open(root: PathBuf) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&root)?;

        let mut inner = Inner::default();
        for entry in std::fs::read_dir(&root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::load_namespace(&path) {
                Ok(ns) => {
                    inner.next_seq = inner.next_seq.max(ns.seq + 1);
                    inner.namespaces.insert(ns.name.clone(), ns);
                }
                Err(e) => {
                    let stem = path.file_stem().unwrap_or_default().to_string_lossy();
                    let name = decode_name(&stem).unwrap_or_else(|| stem.into_owned());
                    warn!(
                        path = %path.display(),
                        cache = %name,
                        error = %e,
                        "Unreadable namespace file"
                    );
                    inner.unreadable.insert(name, path);
                }
            }
        }
        debug!(
            root = %root.display(),
            count = inner.namespaces.len(),
            unreadable = inner.unreadable.len(),
            "Cache storage opened"
        );

        Ok(Self {
            root: Some(root),
            inner: RwLock::new(inner),
            writer: Mutex::new(()),
        })
    }

    fn load_namespace(path: &Path) -> Result<Namespace, StorageError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn namespace_path(root: &Path, name: &str) -> PathBuf {
        root.join(format!("{}.json", encode_name(name)))
    }

    async fn persist(&self, ns: Namespace) -> Result<Namespace, StorageError> {
        let Some(root) = self.root.clone() else {
            return Ok(ns);
        };
        tokio::task::spawn_blocking(move || -> Result<Namespace, StorageError> {
            let path = Self::namespace_path(&root, &ns.name);
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, serde_json::to_vec(&ns)?)?;
            std::fs::rename(&tmp, &path)?;
            Ok(ns)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }

    async fn remove_file(path: PathBuf) -> Result<(), StorageError> {
        tokio::task::spawn_blocking(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from(e)),
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }

    /// Namespace names, oldest first.
    pub async fn keys(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut namespaces: Vec<&Namespace> = inner.namespaces.values().collect();
        namespaces.sort_by_key(|ns| ns.seq);
        namespaces.into_iter().map(|ns| ns.name.clone()).collect()
    }

    pub async fn has(&self, name: &str) -> bool {
        self.inner.read().await.namespaces.contains_key(name)
    }

    /// Names of namespaces whose file could not be read and is still on disk.
    pub async fn unreadable(&self) -> Vec<String> {
        self.inner.read().await.unreadable.keys().cloned().collect()
    }

    pub async fn is_unreadable(&self, name: &str) -> bool {
        self.inner.read().await.unreadable.contains_key(name)
    }

    /// Store a response, creating the namespace on first write.
    pub async fn put(&self, name: &str, key: &str, response: Response) -> Result<(), StorageError> {
        self.put_many(name, vec![(key.to_string(), response)]).await
    }

    /// Store several responses with a single write of the namespace.
    pub async fn put_many(
        &self,
        name: &str,
        entries: Vec<(String, Response)>,
    ) -> Result<(), StorageError> {
        let _writing = self.writer.lock().await;
        let mut ns = {
            let inner = self.inner.read().await;
            match inner.namespaces.get(name) {
                Some(existing) => existing.clone(),
                None => Namespace {
                    name: name.to_string(),
                    seq: inner.next_seq,
                    created_at: Utc::now(),
                    entries: BTreeMap::new(),
                },
            }
        };
        ns.entries.extend(entries);
        let ns = self.persist(ns).await?;

        let replaced = {
            let mut inner = self.inner.write().await;
            inner.next_seq = inner.next_seq.max(ns.seq + 1);
            inner.namespaces.insert(name.to_string(), ns);
            inner.unreadable.remove(name)
        };
        // A foreign file name that does not round-trip is not overwritten.
        if let (Some(old), Some(root)) = (replaced, self.root.as_deref()) {
            if old != Self::namespace_path(root, name) {
                Self::remove_file(old).await?;
            }
        }
        Ok(())
    }

    /// Look up a key in one namespace. A missing namespace is a miss.
    pub async fn lookup(&self, name: &str, key: &str) -> Option<Response> {
        let inner = self.inner.read().await;
        inner.namespaces.get(name)?.entries.get(key).cloned()
    }

    pub async fn contains(&self, name: &str, key: &str) -> bool {
        let inner = self.inner.read().await;
        inner
            .namespaces
            .get(name)
            .map(|ns| ns.entries.contains_key(key))
            .unwrap_or(false)
    }

    /// Keys stored in a namespace, or `None` if it does not exist.
    pub async fn entry_keys(&self, name: &str) -> Option<Vec<String>> {
        let inner = self.inner.read().await;
        inner
            .namespaces
            .get(name)
            .map(|ns| ns.entries.keys().cloned().collect())
    }

    /// Remove one entry. Returns whether it existed.
    pub async fn delete_entry(&self, name: &str, key: &str) -> Result<bool, StorageError> {
        let _writing = self.writer.lock().await;
        let mut ns = {
            let inner = self.inner.read().await;
            match inner.namespaces.get(name) {
                Some(existing) if existing.entries.contains_key(key) => existing.clone(),
                _ => return Ok(false),
            }
        };
        ns.entries.remove(key);
        let ns = self.persist(ns).await?;
        self.inner.write().await.namespaces.insert(name.to_string(), ns);
        Ok(true)
    }

    /// Delete a whole namespace, readable or not. Returns whether it existed.
    pub async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        let _writing = self.writer.lock().await;
        let path = {
            let inner = self.inner.read().await;
            match inner.unreadable.get(name) {
                Some(path) => Some(path.clone()),
                None if inner.namespaces.contains_key(name) => self
                    .root
                    .as_deref()
                    .map(|root| Self::namespace_path(root, name)),
                None => return Ok(false),
            }
        };
        if let Some(path) = path {
            Self::remove_file(path).await?;
        }

        let mut inner = self.inner.write().await;
        inner.namespaces.remove(name);
        inner.unreadable.remove(name);
        Ok(true)
    }

    /// Inventory of every namespace, oldest first.
    pub async fn summaries(&self) -> Vec<NamespaceSummary> {
        let inner = self.inner.read().await;
        let mut namespaces: Vec<&Namespace> = inner.namespaces.values().collect();
        namespaces.sort_by_key(|ns| ns.seq);
        namespaces
            .into_iter()
            .map(|ns| NamespaceSummary {
                name: ns.name.clone(),
                entry_count: ns.entries.len(),
                urls: ns.entries.keys().cloned().collect(),
            })
            .collect()
    }
}

/// File stem for a namespace name. Bytes outside `[A-Za-z0-9._-]` are
/// written as `%XX`, so distinct names never share a file.
fn encode_name(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

fn decode_name(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = std::str::from_utf8(bytes.get(i + 1..i + 3)?).ok()?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_creates_namespace() {
        let storage = CacheStorage::in_memory();
        assert!(!storage.has("app-1").await);

        storage
            .put("app-1", "https://app.example/", Response::ok("<html>"))
            .await
            .unwrap();

        assert!(storage.has("app-1").await);
        let hit = storage.lookup("app-1", "https://app.example/").await.unwrap();
        assert_eq!(hit.body, b"<html>");
    }

    #[tokio::test]
    async fn test_lookup_in_missing_namespace_is_miss() {
        let storage = CacheStorage::in_memory();
        assert!(storage.lookup("gone", "https://app.example/").await.is_none());
        assert!(storage.entry_keys("gone").await.is_none());
    }

    #[tokio::test]
    async fn test_keys_in_creation_order() {
        let storage = CacheStorage::in_memory();
        for name in ["c", "a", "b"] {
            storage.put(name, "k", Response::ok("v")).await.unwrap();
        }
        // Writing to an existing namespace keeps its position.
        storage.put("c", "k2", Response::ok("v")).await.unwrap();
        assert_eq!(storage.keys().await, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_delete() {
        let storage = CacheStorage::in_memory();
        storage.put("old", "k", Response::ok("v")).await.unwrap();
        assert!(storage.delete("old").await.unwrap());
        assert!(!storage.delete("old").await.unwrap());
        assert!(storage.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_entry() {
        let storage = CacheStorage::in_memory();
        storage.put("ns", "a", Response::ok("1")).await.unwrap();
        storage.put("ns", "b", Response::ok("2")).await.unwrap();

        assert!(storage.delete_entry("ns", "a").await.unwrap());
        assert!(!storage.delete_entry("ns", "a").await.unwrap());
        assert_eq!(storage.entry_keys("ns").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = CacheStorage::open(dir.path().to_path_buf()).unwrap();
            storage
                .put("skycache-b1", "https://app.example/app.js", Response::ok("js"))
                .await
                .unwrap();
            storage.put("skycache-b2", "k", Response::ok("v")).await.unwrap();
        }

        let storage = CacheStorage::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(storage.keys().await, vec!["skycache-b1", "skycache-b2"]);
        let hit = storage
            .lookup("skycache-b1", "https://app.example/app.js")
            .await
            .unwrap();
        assert_eq!(hit.body, b"js");

        // New namespaces continue the creation order.
        storage.put("skycache-b3", "k", Response::ok("v")).await.unwrap();
        assert_eq!(storage.keys().await.last().unwrap(), "skycache-b3");
    }

    #[tokio::test]
    async fn test_unreadable_namespace_file_is_listed_and_deletable() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("skycache-old.json");
        std::fs::write(&broken, b"{truncated").unwrap();

        let storage = CacheStorage::open(dir.path().to_path_buf()).unwrap();
        assert!(storage.keys().await.is_empty());
        assert_eq!(storage.unreadable().await, vec!["skycache-old"]);
        assert!(storage.is_unreadable("skycache-old").await);
        assert!(!storage.has("skycache-old").await);
        assert!(storage.lookup("skycache-old", "k").await.is_none());

        assert!(storage.delete("skycache-old").await.unwrap());
        assert!(!broken.exists());
        assert!(storage.unreadable().await.is_empty());
        assert!(!storage.delete("skycache-old").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_replaces_unreadable_namespace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ns.json"), [0xff, 0x00]).unwrap();

        let storage = CacheStorage::open(dir.path().to_path_buf()).unwrap();
        storage.put("ns", "k", Response::ok("v")).await.unwrap();
        assert!(!storage.is_unreadable("ns").await);
        assert_eq!(storage.keys().await, vec!["ns"]);

        let reopened = CacheStorage::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(reopened.lookup("ns", "k").await.unwrap().body, b"v");
    }

    #[tokio::test]
    async fn test_similar_names_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = CacheStorage::open(dir.path().to_path_buf()).unwrap();
            storage.put("skycache-1.0+5", "k", Response::ok("plus")).await.unwrap();
            storage.put("skycache-1.0_5", "k", Response::ok("underscore")).await.unwrap();
            storage.put("skycache-1.0%2B5", "k", Response::ok("percent")).await.unwrap();
        }

        let storage = CacheStorage::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(storage.keys().await.len(), 3);
        for (name, body) in [
            ("skycache-1.0+5", "plus"),
            ("skycache-1.0_5", "underscore"),
            ("skycache-1.0%2B5", "percent"),
        ] {
            let hit = storage.lookup(name, "k").await.unwrap();
            assert_eq!(hit.body, body.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_concurrent_writes_all_reach_disk() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CacheStorage::open(dir.path().to_path_buf()).unwrap();

        let keys: Vec<String> = (0..16).map(|i| format!("k{}", i)).collect();
        let writes = keys.iter().map(|key| storage.put("ns", key, Response::ok("v")));
        futures::future::try_join_all(writes).await.unwrap();
        storage
            .put_many(
                "ns",
                vec![
                    ("a".to_string(), Response::ok("1")),
                    ("b".to_string(), Response::ok("2")),
                ],
            )
            .await
            .unwrap();

        let reopened = CacheStorage::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(reopened.entry_keys("ns").await.unwrap().len(), 18);
    }

    #[tokio::test]
    async fn test_deleted_namespace_stays_deleted() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = CacheStorage::open(dir.path().to_path_buf()).unwrap();
            storage.put("old", "k", Response::ok("v")).await.unwrap();
            storage.delete("old").await.unwrap();
        }
        let storage = CacheStorage::open(dir.path().to_path_buf()).unwrap();
        assert!(!storage.has("old").await);
    }

    #[tokio::test]
    async fn test_summaries() {
        let storage = CacheStorage::in_memory();
        storage.put("ns", "https://app.example/a", Response::ok("1")).await.unwrap();
        storage.put("ns", "https://app.example/b", Response::ok("2")).await.unwrap();

        let summaries = storage.summaries().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].entry_count, 2);
        assert_eq!(
            summaries[0].urls,
            vec!["https://app.example/a", "https://app.example/b"]
        );
    }

    #[test]
    fn test_namespace_path_is_encoded() {
        let path = CacheStorage::namespace_path(Path::new("/data"), "app/../x y");
        assert_eq!(path, PathBuf::from("/data/app%2F..%2Fx%20y.json"));
        assert_eq!(decode_name("app%2F..%2Fx%20y").as_deref(), Some("app/../x y"));
        assert_eq!(encode_name("skycache-1.0+5"), "skycache-1.0%2B5");
        assert_eq!(decode_name("bad%zz"), None);
    }
}
