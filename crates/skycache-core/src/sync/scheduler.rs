use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::SyncConfig;

/// Buffer size for pending sync signals.
const SIGNAL_BUFFER_SIZE: usize = 16;

/// Periodic timers never fire more often than this.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Named background refresh signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncTag {
    /// Drain the retry queue and announce fresh weather data.
    WeatherSync,
    /// Refresh cached content for favorited locations.
    FavoritesSync,
    /// Purge expired auxiliary records.
    HealthSync,
}

impl SyncTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTag::WeatherSync => "weather-sync",
            SyncTag::FavoritesSync => "favorites-sync",
            SyncTag::HealthSync => "health-sync",
        }
    }

    pub fn interval(&self, config: &SyncConfig) -> Duration {
        let secs = match self {
            SyncTag::WeatherSync => config.weather_secs,
            SyncTag::FavoritesSync => config.favorites_secs,
            SyncTag::HealthSync => config.health_secs,
        };
        Duration::from_secs(secs).max(MIN_INTERVAL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Periodic,
    OneShot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSignal {
    pub tag: SyncTag,
    pub trigger: Trigger,
}

impl SyncSignal {
    pub fn periodic(tag: SyncTag) -> Self {
        Self {
            tag,
            trigger: Trigger::Periodic,
        }
    }

    pub fn one_shot(tag: SyncTag) -> Self {
        Self {
            tag,
            trigger: Trigger::OneShot,
        }
    }
}

/// Emits `SyncSignal`s on registered periodic timers.
pub struct SyncScheduler {
    tx: mpsc::Sender<SyncSignal>,
    timers: Mutex<HashMap<SyncTag, JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new() -> (Self, mpsc::Receiver<SyncSignal>) {
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER_SIZE);
        (
            Self {
                tx,
                timers: Mutex::new(HashMap::new()),
            },
            rx,
        )
    }

    /// Start (or restart) the periodic timer for a tag.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register(&self, tag: SyncTag, every: Duration) -> Duration {
        let every = every.max(MIN_INTERVAL);
        let tx = self.tx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tx.send(SyncSignal::periodic(tag)).await.is_err() {
                    debug!(tag = tag.as_str(), "Signal receiver gone, stopping timer");
                    break;
                }
            }
        });

        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = timers.insert(tag, handle) {
            previous.abort();
        }
        info!(tag = tag.as_str(), ?every, "Periodic sync registered");
        every
    }

    pub fn registered(&self) -> Vec<SyncTag> {
        let timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tags: Vec<SyncTag> = timers.keys().copied().collect();
        tags.sort_by_key(|t| t.as_str());
        tags
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        let timers = self.timers.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_names() {
        assert_eq!(SyncTag::WeatherSync.as_str(), "weather-sync");
        assert_eq!(
            serde_json::to_value(SyncTag::FavoritesSync).unwrap(),
            serde_json::json!("favorites-sync")
        );
    }

    #[test]
    fn test_interval_has_floor() {
        let config = SyncConfig {
            weather_secs: 0,
            ..Default::default()
        };
        assert_eq!(SyncTag::WeatherSync.interval(&config), MIN_INTERVAL);
        assert_eq!(SyncTag::HealthSync.interval(&config), Duration::from_secs(6 * 60 * 60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_signal_fires() {
        let (scheduler, mut rx) = SyncScheduler::new();
        scheduler.register(SyncTag::WeatherSync, Duration::from_secs(60));

        let signal = rx.recv().await.unwrap();
        assert_eq!(signal, SyncSignal::periodic(SyncTag::WeatherSync));
        assert_eq!(signal.trigger, Trigger::Periodic);
    }

    #[tokio::test]
    async fn test_reregister_replaces_timer() {
        let (scheduler, _rx) = SyncScheduler::new();
        scheduler.register(SyncTag::FavoritesSync, Duration::from_secs(60));
        scheduler.register(SyncTag::FavoritesSync, Duration::from_secs(120));
        scheduler.register(SyncTag::HealthSync, Duration::from_secs(60));
        assert_eq!(
            scheduler.registered(),
            vec![SyncTag::FavoritesSync, SyncTag::HealthSync]
        );
    }
}
