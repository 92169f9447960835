//! Notifications pushed to every live application instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Buffer of notifications kept for slow subscribers.
const NOTIFICATION_BUFFER_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notification {
    HealthDataUpdated {
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
        data: serde_json::Value,
    },
    WeatherUpdate {
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
}

/// Fan-out sender. Clone is cheap and every clone feeds the same subscribers.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Notification>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_BUFFER_SIZE);
        Self { tx }
    }

    /// Register a new application instance.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Send to every current subscriber. Returns how many received it.
    pub fn send(&self, notification: Notification) -> usize {
        match self.tx.send(notification) {
            Ok(count) => count,
            Err(_) => {
                debug!("No live clients for notification");
                0
            }
        }
    }
}
