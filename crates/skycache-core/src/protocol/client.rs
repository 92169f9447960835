use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use super::{Command, ReplyEnvelope};
use crate::agent::AgentEvent;
use crate::error::ClientError;

/// Caller side of the control protocol.
///
/// The agent replies exactly once per command but enforces no deadline of
/// its own, so every call here is bounded by the command's reply timeout.
#[derive(Debug, Clone)]
pub struct ControlClient {
    tx: mpsc::Sender<AgentEvent>,
}

impl ControlClient {
    pub fn new(tx: mpsc::Sender<AgentEvent>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, command: Command) -> Result<ReplyEnvelope, ClientError> {
        let kind = command.kind();
        let after = command.reply_timeout();
        let (respond_to, reply) = oneshot::channel();

        self.tx
            .send(AgentEvent::Command { command, respond_to })
            .await
            .map_err(|_| ClientError::AgentGone)?;

        match tokio::time::timeout(after, reply).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(ClientError::AgentGone),
            Err(_) => {
                warn!(command = kind, ?after, "Command timed out");
                Err(ClientError::Timeout {
                    command: kind,
                    after,
                })
            }
        }
    }

    /// Parse a raw JSON message and send it.
    ///
    /// Malformed messages get a failure envelope without a round trip.
    pub async fn send_raw(&self, raw: &str) -> Result<ReplyEnvelope, ClientError> {
        match Command::parse(raw) {
            Ok(command) => self.send(command).await,
            Err(e) => Ok(ReplyEnvelope::failure(e.to_string())),
        }
    }
}
