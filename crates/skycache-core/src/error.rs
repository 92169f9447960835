use std::time::Duration;

use thiserror::Error;

/// Maximum length for response bodies quoted in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Transport-level failure while talking to the network.
///
/// A response with a non-success status is *not* a `FetchError`; the
/// network answered and the resolver decides what to do with it.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Network unreachable: {0}")]
    Unreachable(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage task failed: {0}")]
    Task(String),
}

/// Errors from the auxiliary TTL store.
#[derive(Error, Debug)]
pub enum TtlStoreError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Payload too large: {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failure while executing a control command.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error(transparent)]
    TtlStore(#[from] TtlStoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Caller-side failures of the control protocol.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("No reply to {command} within {after:?}")]
    Timeout { command: &'static str, after: Duration },

    #[error("Agent is not running")]
    AgentGone,
}

/// Truncate a response body to avoid logging excessive data
pub fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= MAX_ERROR_BODY_LENGTH {
        text.into_owned()
    } else {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &text[..end], body.len())
    }
}
