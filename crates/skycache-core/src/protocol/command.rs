use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CommandError;
use crate::sync::RequestOptions;

/// Reply deadline for cheap reads.
const QUICK_TIMEOUT: Duration = Duration::from_secs(2);

/// Reply deadline for inventory and registration commands.
const STANDARD_TIMEOUT: Duration = Duration::from_secs(5);

/// Reply deadline for commands that walk or mutate whole namespaces.
const SLOW_TIMEOUT: Duration = Duration::from_secs(10);

/// Payload of `QUEUE_REQUEST`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRequest {
    /// Absolute, or relative to the agent origin.
    pub url: String,
    #[serde(flatten)]
    pub options: RequestOptions,
}

/// The closed set of control commands.
///
/// On the wire a command is `{"type": "GET_VERSION"}`, with a `payload`
/// field for the variants that carry data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    GetVersion,
    GetDiagnostics,
    ValidateCache,
    ClearAllCaches,
    CacheHealthData(serde_json::Value),
    GetCachedHealthData,
    RegisterPeriodicSync,
    RegisterFavoritesSync,
    RegisterHealthSync,
    QueueRequest(QueueRequest),
    SyncNow,
}

impl Command {
    /// Parse one raw JSON message.
    pub fn parse(raw: &str) -> Result<Self, CommandError> {
        serde_json::from_str(raw).map_err(|e| CommandError::InvalidCommand(e.to_string()))
    }

    /// Wire name, used in logs and timeout errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::GetVersion => "GET_VERSION",
            Command::GetDiagnostics => "GET_DIAGNOSTICS",
            Command::ValidateCache => "VALIDATE_CACHE",
            Command::ClearAllCaches => "CLEAR_ALL_CACHES",
            Command::CacheHealthData(_) => "CACHE_HEALTH_DATA",
            Command::GetCachedHealthData => "GET_CACHED_HEALTH_DATA",
            Command::RegisterPeriodicSync => "REGISTER_PERIODIC_SYNC",
            Command::RegisterFavoritesSync => "REGISTER_FAVORITES_SYNC",
            Command::RegisterHealthSync => "REGISTER_HEALTH_SYNC",
            Command::QueueRequest(_) => "QUEUE_REQUEST",
            Command::SyncNow => "SYNC_NOW",
        }
    }

    /// How long a caller should wait for the reply.
    pub fn reply_timeout(&self) -> Duration {
        match self {
            Command::GetVersion | Command::GetCachedHealthData | Command::CacheHealthData(_) => {
                QUICK_TIMEOUT
            }
            Command::GetDiagnostics
            | Command::RegisterPeriodicSync
            | Command::RegisterFavoritesSync
            | Command::RegisterHealthSync
            | Command::QueueRequest(_) => STANDARD_TIMEOUT,
            Command::ValidateCache | Command::ClearAllCaches | Command::SyncNow => SLOW_TIMEOUT,
        }
    }
}
