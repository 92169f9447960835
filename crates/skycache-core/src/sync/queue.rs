use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{truncate_body, StorageError};
use crate::net::{Network, Request};

/// How to rebuild the original request on replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: default_method(),
            headers: BTreeMap::new(),
            body: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryEntry {
    pub id: String,
    pub url: String,
    pub request_options: RequestOptions,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
}

impl RetryEntry {
    fn to_request(&self) -> Result<Request, String> {
        let url = Url::parse(&self.url).map_err(|e| format!("invalid url: {}", e))?;
        let method = Method::from_bytes(self.request_options.method.as_bytes())
            .map_err(|e| format!("invalid method: {}", e))?;
        let mut request = Request::new(method, url);
        for (name, value) in &self.request_options.headers {
            request = request.with_header(name, value);
        }
        if let Some(ref body) = self.request_options.body {
            request = request.with_body(body.clone().into_bytes());
        }
        Ok(request)
    }
}

/// Durable id-keyed storage behind the retry queue.
pub trait QueueStore: Send + Sync {
    fn insert(&self, entry: &RetryEntry) -> Result<(), StorageError>;

    /// Every entry, oldest first.
    fn list(&self) -> Result<Vec<RetryEntry>, StorageError>;

    fn delete(&self, id: &str) -> Result<bool, StorageError>;
}

/// One JSON file per entry.
pub struct FileQueueStore {
    dir: PathBuf,
}

impl FileQueueStore {
    pub fn open(dir: PathBuf) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

impl QueueStore for FileQueueStore {
    fn insert(&self, entry: &RetryEntry) -> Result<(), StorageError> {
        let path = self.entry_path(&entry.id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(entry)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<RetryEntry>, StorageError> {
        let mut entries = Vec::new();
        for dir_entry in std::fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read(&path).map_err(StorageError::from).and_then(|bytes| {
                serde_json::from_slice::<RetryEntry>(&bytes).map_err(StorageError::from)
            });
            match parsed {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable retry entry")
                }
            }
        }
        entries.sort_by(|a, b| (a.queued_at, &a.id).cmp(&(b.queued_at, &b.id)));
        Ok(entries)
    }

    fn delete(&self, id: &str) -> Result<bool, StorageError> {
        match std::fs::remove_file(self.entry_path(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Memory-only store, for tests and ephemeral agents.
#[derive(Default)]
pub struct MemoryQueueStore {
    entries: Mutex<HashMap<String, RetryEntry>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for MemoryQueueStore {
    fn insert(&self, entry: &RetryEntry) -> Result<(), StorageError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<RetryEntry>, StorageError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<RetryEntry> = entries.values().cloned().collect();
        list.sort_by(|a, b| (a.queued_at, &a.id).cmp(&(b.queued_at, &b.id)));
        Ok(list)
    }

    fn delete(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some())
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub replayed: usize,
    /// Entries left for the next drain.
    pub remaining: usize,
    /// Entries dropped because they can never be replayed.
    pub dropped: usize,
}

/// Requests that failed outside the resolver, replayed on sync signals.
pub struct RetryQueue {
    store: Box<dyn QueueStore>,
    network: Arc<dyn Network>,
    draining: tokio::sync::Mutex<()>,
}

impl RetryQueue {
    pub fn new(store: Box<dyn QueueStore>, network: Arc<dyn Network>) -> Self {
        Self {
            store,
            network,
            draining: tokio::sync::Mutex::new(()),
        }
    }

    pub fn enqueue(&self, url: &Url, options: RequestOptions) -> Result<RetryEntry, StorageError> {
        let now = Utc::now();
        let entry = RetryEntry {
            id: Uuid::new_v4().to_string(),
            url: url.to_string(),
            request_options: options,
            queued_at: now,
            attempts: 0,
        };
        self.store.insert(&entry)?;
        info!(id = %entry.id, url = %entry.url, "Request queued for retry");
        Ok(entry)
    }

    pub fn entries(&self) -> Result<Vec<RetryEntry>, StorageError> {
        self.store.list()
    }

    /// Replay every queued entry once, removing the ones that succeed.
    ///
    /// Overlapping drains run one after the other so an entry is never
    /// replayed twice concurrently.
    pub async fn drain(&self) -> Result<DrainReport, StorageError> {
        let _drain = self.draining.lock().await;
        let mut report = DrainReport::default();

        for mut entry in self.store.list()? {
            let request = match entry.to_request() {
                Ok(request) => request,
                Err(reason) => {
                    warn!(
                        id = %entry.id,
                        url = %entry.url,
                        reason = %reason,
                        "Dropping unreplayable entry"
                    );
                    self.remove(&entry.id);
                    report.dropped += 1;
                    continue;
                }
            };

            match self.network.fetch(&request).await {
                Ok(response) if response.is_ok() => {
                    debug!(id = %entry.id, url = %entry.url, "Replayed queued request");
                    self.remove(&entry.id);
                    report.replayed += 1;
                }
                outcome => {
                    match outcome {
                        Ok(response) => warn!(
                            id = %entry.id,
                            url = %entry.url,
                            status = response.status,
                            body = %truncate_body(&response.body),
                            "Replay rejected"
                        ),
                        Err(e) => {
                            warn!(id = %entry.id, url = %entry.url, error = %e, "Replay failed")
                        }
                    }
                    entry.attempts += 1;
                    if let Err(e) = self.store.insert(&entry) {
                        warn!(id = %entry.id, error = %e, "Failed to record replay attempt");
                    }
                    report.remaining += 1;
                }
            }
        }

        info!(
            replayed = report.replayed,
            remaining = report.remaining,
            dropped = report.dropped,
            "Retry queue drained"
        );
        Ok(report)
    }

    fn remove(&self, id: &str) {
        if let Err(e) = self.store.delete(id) {
            warn!(id, error = %e, "Failed to remove retry entry");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{Response, StaticNetwork};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn queue_with(store: Box<dyn QueueStore>) -> (RetryQueue, Arc<StaticNetwork>) {
        let network = Arc::new(StaticNetwork::new());
        let queue = RetryQueue::new(store, Arc::clone(&network) as Arc<dyn Network>);
        (queue, network)
    }

    #[tokio::test]
    async fn test_drain_removes_successful_replays() {
        let (queue, network) = queue_with(Box::new(MemoryQueueStore::new()));
        network.route("https://app.example/ok", Response::ok("done"));

        queue.enqueue(&url("https://app.example/ok"), RequestOptions::default()).unwrap();
        queue.enqueue(&url("https://app.example/later"), RequestOptions::default()).unwrap();

        let report = queue.drain().await.unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(report.remaining, 1);

        let left = queue.entries().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].url, "https://app.example/later");
        assert_eq!(left[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_failed_drain_keeps_everything() {
        let (queue, network) = queue_with(Box::new(MemoryQueueStore::new()));
        network.route("https://app.example/a", Response::ok("a"));
        network.route("https://app.example/b", Response::ok("b"));
        queue.enqueue(&url("https://app.example/a"), RequestOptions::default()).unwrap();
        queue.enqueue(&url("https://app.example/b"), RequestOptions::default()).unwrap();

        network.set_online(false);
        let report = queue.drain().await.unwrap();
        assert_eq!(report, DrainReport { replayed: 0, remaining: 2, dropped: 0 });

        network.set_online(true);
        let report = queue.drain().await.unwrap();
        assert_eq!(report.replayed, 2);
        assert!(queue.entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replay_uses_request_options() {
        let (queue, network) = queue_with(Box::new(MemoryQueueStore::new()));
        network.route("https://app.example/report", Response::ok("accepted"));
        let options = RequestOptions {
            method: "POST".to_string(),
            headers: BTreeMap::from([(
                "content-type".to_string(),
                "application/json".to_string(),
            )]),
            body: Some("{\"x\":1}".to_string()),
        };
        let entry = queue.enqueue(&url("https://app.example/report"), options).unwrap();

        let request = entry.to_request().unwrap();
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.body.as_deref(), Some(&b"{\"x\":1}"[..]));

        assert_eq!(queue.drain().await.unwrap().replayed, 1);
    }

    #[tokio::test]
    async fn test_unreplayable_entry_is_dropped() {
        let store = MemoryQueueStore::new();
        store
            .insert(&RetryEntry {
                id: "bad".to_string(),
                url: "not a url".to_string(),
                request_options: RequestOptions::default(),
                queued_at: Utc::now(),
                attempts: 0,
            })
            .unwrap();
        let (queue, _) = queue_with(Box::new(store));

        let report = queue.drain().await.unwrap();
        assert_eq!(report.dropped, 1);
        assert!(queue.entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let open = || Box::new(FileQueueStore::open(dir.path().to_path_buf()).unwrap());
        {
            let (queue, _) = queue_with(open());
            queue.enqueue(&url("https://app.example/a"), RequestOptions::default()).unwrap();
            queue.enqueue(&url("https://app.example/b"), RequestOptions::default()).unwrap();
        }

        let (queue, network) = queue_with(open());
        assert_eq!(queue.entries().unwrap().len(), 2);

        network.route("https://app.example/a", Response::ok("a"));
        network.route("https://app.example/b", Response::ok("b"));
        assert_eq!(queue.drain().await.unwrap().replayed, 2);
        assert!(queue.entries().unwrap().is_empty());
    }

    #[test]
    fn test_entry_ids_are_unique_uuids() {
        let (queue, _) = queue_with(Box::new(MemoryQueueStore::new()));
        let target = url("https://app.example/a");
        let first = queue.enqueue(&target, RequestOptions::default()).unwrap();
        let second = queue.enqueue(&target, RequestOptions::default()).unwrap();

        assert_ne!(first.id, second.id);
        let parsed = Uuid::parse_str(&first.id).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
        assert_eq!(queue.entries().unwrap().len(), 2);
    }

    #[test]
    fn test_file_store_delete_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileQueueStore::open(dir.path().to_path_buf()).unwrap();
        assert!(!store.delete("nope").unwrap());
    }

    #[test]
    fn test_request_options_defaults() {
        let options: RequestOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options.method, "GET");
        assert!(options.headers.is_empty());
        assert!(options.body.is_none());
    }
}
