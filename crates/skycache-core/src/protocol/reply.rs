use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::error;

use crate::cache::{AnnotatedRecord, NamespaceSummary};
use crate::sync::{DrainReport, SyncTag};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: String,
    pub build_id: String,
    pub cache_name: String,
    pub auxiliary_cache: String,
}

/// Health of the auxiliary record, without its payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub present: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub corrupted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_age: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_display: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_expired: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needs_refresh: Option<bool>,
}

impl HealthSummary {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn corrupted() -> Self {
        Self {
            corrupted: true,
            ..Default::default()
        }
    }

    pub fn of(record: &AnnotatedRecord) -> Self {
        Self {
            present: true,
            corrupted: false,
            cache_age: Some(record.cache_age),
            age_display: Some(record.age_display.clone()),
            is_expired: Some(record.is_expired),
            needs_refresh: Some(record.needs_refresh),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestCoverage {
    pub total: usize,
    pub cached: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub active_cache: String,
    pub total_caches: usize,
    pub caches: Vec<NamespaceSummary>,
    pub health: HealthSummary,
    pub manifest: ManifestCoverage,
    pub queued_requests: usize,
    pub registered_syncs: Vec<SyncTag>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Complete,
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub status: Verdict,
    pub total: usize,
    pub present: usize,
    pub missing: usize,
    pub missing_urls: Vec<String>,
}

impl ValidationReport {
    pub fn new(total: usize, missing_urls: Vec<String>) -> Self {
        let missing = missing_urls.len();
        Self {
            status: if missing == 0 {
                Verdict::Complete
            } else {
                Verdict::Partial
            },
            total,
            present: total.saturating_sub(missing),
            missing,
            missing_urls,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearReport {
    pub cleared: usize,
    pub caches: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<String>,
}

/// Successful result of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Version(VersionInfo),
    Diagnostics(Diagnostics),
    Validation(ValidationReport),
    Cleared(ClearReport),
    HealthStored { cached_at: i64 },
    HealthData(Option<AnnotatedRecord>),
    HealthCorrupted,
    SyncRegistered { tag: SyncTag, interval_secs: u64 },
    Queued { id: String },
    Drained(DrainReport),
}

impl Reply {
    /// Fields merged into the `{success: true}` envelope.
    fn into_fields(self) -> Result<Map<String, Value>, serde_json::Error> {
        let value = match self {
            Reply::Version(info) => serde_json::to_value(info)?,
            Reply::Diagnostics(diagnostics) => serde_json::to_value(diagnostics)?,
            Reply::Validation(report) => serde_json::to_value(report)?,
            Reply::Cleared(report) => serde_json::to_value(report)?,
            Reply::HealthStored { cached_at } => serde_json::json!({ "cachedAt": cached_at }),
            Reply::HealthData(record) => serde_json::json!({ "data": record }),
            Reply::HealthCorrupted => serde_json::json!({ "data": null, "corrupted": true }),
            Reply::SyncRegistered { tag, interval_secs } => {
                serde_json::json!({ "tag": tag, "intervalSecs": interval_secs })
            }
            Reply::Queued { id } => serde_json::json!({ "id": id }),
            Reply::Drained(report) => serde_json::to_value(report)?,
        };
        Ok(match value {
            Value::Object(fields) => fields,
            other => {
                let mut fields = Map::new();
                fields.insert("data".to_string(), other);
                fields
            }
        })
    }
}

/// `{success: true, ...}` or `{success: false, error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl ReplyEnvelope {
    pub fn ok(reply: Reply) -> Self {
        match reply.into_fields() {
            Ok(body) => Self {
                success: true,
                error: None,
                body,
            },
            Err(e) => {
                error!(error = %e, "Failed to serialize reply");
                Self::failure(format!("Failed to serialize reply: {}", e))
            }
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            body: Map::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.body.get(field)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"success":false,"error":"Failed to serialize reply: {}"}}"#, e)
        })
    }
}
