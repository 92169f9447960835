use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::CacheStorage;
use crate::broadcast::{Broadcaster, Notification};
use crate::config::AgentConfig;
use crate::error::{StorageError, TtlStoreError};
use crate::net::Response;
use crate::utils::format_age;

/// Slot used by the health/analysis payload commands.
pub const HEALTH_KEY: &str = "health";

/// Prefix of auxiliary slot keys inside the auxiliary namespace.
const SLOT_PREFIX: &str = "/__aux/";

/// A stored perishable payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuxRecord {
    pub data: serde_json::Value,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub cached_at: DateTime<Utc>,
    /// Schema tag the record was written under.
    pub cache_version: u32,
    /// Time to live in milliseconds.
    pub ttl: u64,
}

impl AuxRecord {
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now - self.cached_at
    }

    fn ttl_duration(&self) -> Duration {
        Duration::milliseconds(i64::try_from(self.ttl).unwrap_or(i64::MAX))
    }

    /// Expired once strictly older than its TTL.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.age_at(now) > self.ttl_duration()
    }

    fn annotate(self, now: DateTime<Utc>, schema_version: u32) -> AnnotatedRecord {
        let age = self.age_at(now);
        let is_expired = self.is_expired_at(now);
        // Saturates for huge TTLs combined with a future `cached_at`.
        let expires_in = self
            .ttl_duration()
            .checked_sub(&age)
            .unwrap_or(Duration::MAX)
            .num_milliseconds()
            .max(0);
        let needs_refresh = is_expired || self.cache_version != schema_version;
        AnnotatedRecord {
            cache_age: age.num_milliseconds(),
            age_display: format_age(age.num_minutes()),
            is_expired,
            expires_in,
            needs_refresh,
            record: self,
        }
    }
}

/// A record plus the fields derived from the current time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotatedRecord {
    #[serde(flatten)]
    pub record: AuxRecord,
    /// Milliseconds since the record was written.
    pub cache_age: i64,
    pub age_display: String,
    pub is_expired: bool,
    /// Milliseconds left before expiry, zero once expired.
    pub expires_in: i64,
    /// Expired, or written under an older schema.
    pub needs_refresh: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuxLookup {
    Absent,
    /// The slot held unreadable bytes and has been deleted.
    Corrupted,
    Found(AnnotatedRecord),
}

/// TTL-bound key→record store for perishable derived data.
///
/// Records live in their own namespace so asset lifecycle sweeps leave
/// them alone.
pub struct TtlStore {
    storage: Arc<CacheStorage>,
    namespace: String,
    schema_version: u32,
    ttl_ms: u64,
    max_payload_bytes: usize,
    broadcaster: Broadcaster,
}

impl TtlStore {
    pub fn new(storage: Arc<CacheStorage>, config: &AgentConfig, broadcaster: Broadcaster) -> Self {
        Self {
            storage,
            namespace: config.auxiliary_namespace(),
            schema_version: config.auxiliary.schema_version,
            ttl_ms: config.auxiliary.ttl_secs.saturating_mul(1000),
            max_payload_bytes: config.auxiliary.max_payload_bytes,
            broadcaster,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn slot(key: &str) -> String {
        format!("{}{}", SLOT_PREFIX, key)
    }

    /// Validate, stamp and persist a payload, then notify every client.
    pub async fn put(
        &self,
        key: &str,
        payload: serde_json::Value,
    ) -> Result<AuxRecord, TtlStoreError> {
        if !payload.is_object() {
            return Err(TtlStoreError::InvalidPayload(format!(
                "expected a JSON object, got {}",
                json_kind(&payload)
            )));
        }

        let size = serde_json::to_vec(&payload).map_err(StorageError::from)?.len();
        if size > self.max_payload_bytes {
            warn!(key, size, max = self.max_payload_bytes, "Rejected oversized auxiliary payload");
            return Err(TtlStoreError::TooLarge {
                size,
                max: self.max_payload_bytes,
            });
        }

        let record = AuxRecord {
            data: payload,
            cached_at: Utc::now(),
            cache_version: self.schema_version,
            ttl: self.ttl_ms,
        };
        let body = serde_json::to_vec(&record).map_err(StorageError::from)?;
        let response = Response::ok(body)
            .with_header("content-type", "application/json")
            .stamped();
        self.storage
            .put(&self.namespace, &Self::slot(key), response)
            .await?;
        info!(key, size, cache = %self.namespace, "Auxiliary record stored");

        let clients = self.broadcaster.send(Notification::HealthDataUpdated {
            timestamp: record.cached_at,
            data: record.data.clone(),
        });
        debug!(key, clients, "Auxiliary update broadcast");

        Ok(record)
    }

    pub async fn get(&self, key: &str) -> Result<AuxLookup, StorageError> {
        self.get_at(key, Utc::now()).await
    }

    /// Look up a record, annotating it relative to `now`.
    ///
    /// An unreadable record, or an auxiliary namespace whose file could not
    /// be read, is deleted and reported as `Corrupted` once.
    pub async fn get_at(&self, key: &str, now: DateTime<Utc>) -> Result<AuxLookup, StorageError> {
        let slot = Self::slot(key);
        let Some(stored) = self.storage.lookup(&self.namespace, &slot).await else {
            if self.storage.is_unreadable(&self.namespace).await
                && self.storage.delete(&self.namespace).await?
            {
                warn!(key, cache = %self.namespace, "Auxiliary namespace was unreadable, deleted");
                return Ok(AuxLookup::Corrupted);
            }
            return Ok(AuxLookup::Absent);
        };

        match serde_json::from_slice::<AuxRecord>(&stored.body) {
            Ok(record) => Ok(AuxLookup::Found(record.annotate(now, self.schema_version))),
            Err(e) => {
                warn!(
                    key,
                    cache = %self.namespace,
                    error = %e,
                    "Corrupted auxiliary record, deleting"
                );
                if let Err(e) = self.storage.delete_entry(&self.namespace, &slot).await {
                    error!(key, error = %e, "Failed to delete corrupted auxiliary record");
                    return Err(e);
                }
                Ok(AuxLookup::Corrupted)
            }
        }
    }

    pub async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        self.storage.delete_entry(&self.namespace, &Self::slot(key)).await
    }

    /// Keys of every stored record.
    pub async fn keys(&self) -> Vec<String> {
        self.storage
            .entry_keys(&self.namespace)
            .await
            .unwrap_or_default()
            .into_iter()
            .filter_map(|slot| slot.strip_prefix(SLOT_PREFIX).map(str::to_string))
            .collect()
    }

    /// Drop every record that is expired, stale-schema or unreadable.
    /// Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize, StorageError> {
        let now = Utc::now();
        let mut purged = 0;
        for key in self.keys().await {
            match self.get_at(&key, now).await? {
                AuxLookup::Found(annotated) if annotated.needs_refresh => {
                    if self.remove(&key).await? {
                        purged += 1;
                    }
                }
                AuxLookup::Corrupted => purged += 1,
                _ => {}
            }
        }
        if purged > 0 {
            info!(purged, cache = %self.namespace, "Purged auxiliary records");
        }
        Ok(purged)
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

// ============================================================================
// Tests
// ============================================================================
