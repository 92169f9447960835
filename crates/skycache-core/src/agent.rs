//! The offline agent: one owned value tying storage, lifecycle, resolution,
//! the control protocol and background sync together.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::broadcast::{Broadcaster, Notification};
use crate::cache::{is_cacheable, AuxLookup, CacheStorage, TtlStore, HEALTH_KEY};
use crate::config::AgentConfig;
use crate::error::{CommandError, FetchError, StorageError};
use crate::lifecycle::{ActivateReport, InstallReport, LifecycleManager};
use crate::net::{CacheMode, HttpNetwork, Network, Request};
use crate::protocol::{
    ClearReport, Command, ControlClient, Diagnostics, HealthSummary, ManifestCoverage, QueueRequest,
    Reply, ReplyEnvelope, ValidationReport, VersionInfo,
};
use crate::resolver::{Resolution, Resolver};
use crate::sync::{
    DrainReport, FileQueueStore, MemoryQueueStore, QueueStore, RetryQueue, SyncScheduler,
    SyncSignal, SyncTag,
};

/// Buffer size for the agent event channel.
const EVENT_BUFFER_SIZE: usize = 64;

/// Subdirectories of the data directory.
const CACHES_DIR: &str = "caches";
const RETRY_QUEUE_DIR: &str = "retry-queue";

/// Everything the agent reacts to.
#[derive(Debug)]
pub enum AgentEvent {
    Install,
    Activate,
    Fetch {
        request: Request,
        respond_to: oneshot::Sender<Result<Resolution, FetchError>>,
    },
    Command {
        command: Command,
        respond_to: oneshot::Sender<ReplyEnvelope>,
    },
    Shutdown,
}

pub struct Agent {
    config: AgentConfig,
    network: Arc<dyn Network>,
    storage: Arc<CacheStorage>,
    lifecycle: LifecycleManager,
    resolver: Resolver,
    health: TtlStore,
    retry: RetryQueue,
    scheduler: SyncScheduler,
    broadcaster: Broadcaster,
    event_tx: mpsc::Sender<AgentEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<AgentEvent>>>,
    sync_rx: Mutex<Option<mpsc::Receiver<SyncSignal>>>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        network: Arc<dyn Network>,
        storage: Arc<CacheStorage>,
        queue: Box<dyn QueueStore>,
    ) -> Self {
        let broadcaster = Broadcaster::new();
        let lifecycle = LifecycleManager::new(&config, Arc::clone(&network), Arc::clone(&storage));
        let resolver = Resolver::new(&config, Arc::clone(&network), Arc::clone(&storage));
        let health = TtlStore::new(Arc::clone(&storage), &config, broadcaster.clone());
        let retry = RetryQueue::new(queue, Arc::clone(&network));
        let (scheduler, sync_rx) = SyncScheduler::new();
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER_SIZE);

        Self {
            config,
            network,
            storage,
            lifecycle,
            resolver,
            health,
            retry,
            scheduler,
            broadcaster,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            sync_rx: Mutex::new(Some(sync_rx)),
        }
    }

    /// Durable agent under the configured data directory, talking HTTP.
    pub fn open(config: AgentConfig) -> Result<Self> {
        let network = HttpNetwork::new(config.request_timeout())
            .context("Failed to create HTTP client")?;
        Self::open_with_network(config, Arc::new(network))
    }

    /// Durable agent under the configured data directory.
    pub fn open_with_network(config: AgentConfig, network: Arc<dyn Network>) -> Result<Self> {
        let data_dir = config.data_dir()?;
        let storage = CacheStorage::open(data_dir.join(CACHES_DIR))
            .with_context(|| format!("Failed to open cache storage in {}", data_dir.display()))?;
        let queue = FileQueueStore::open(data_dir.join(RETRY_QUEUE_DIR))
            .with_context(|| format!("Failed to open retry queue in {}", data_dir.display()))?;
        info!(data_dir = %data_dir.display(), cache = %config.active_namespace(), "Agent opened");
        Ok(Self::new(config, network, Arc::new(storage), Box::new(queue)))
    }

    /// Memory-only agent.
    pub fn in_memory(config: AgentConfig, network: Arc<dyn Network>) -> Self {
        Self::new(
            config,
            network,
            Arc::new(CacheStorage::in_memory()),
            Box::new(MemoryQueueStore::new()),
        )
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<CacheStorage> {
        &self.storage
    }

    pub fn sender(&self) -> mpsc::Sender<AgentEvent> {
        self.event_tx.clone()
    }

    pub fn client(&self) -> ControlClient {
        ControlClient::new(self.sender())
    }

    /// Register a live application instance for broadcast notifications.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Notification> {
        self.broadcaster.subscribe()
    }

    pub async fn install(&self) -> Option<InstallReport> {
        self.lifecycle.install().await
    }

    pub async fn activate(&self) -> Option<ActivateReport> {
        self.lifecycle.activate().await
    }

    pub async fn fetch(&self, request: &Request) -> Result<Resolution, FetchError> {
        self.resolver.resolve(request).await
    }

    /// Stop a running event loop.
    pub async fn shutdown(&self) {
        if self.event_tx.send(AgentEvent::Shutdown).await.is_err() {
            debug!("Event loop already stopped");
        }
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Process events and sync signals until shut down.
    ///
    /// Each event runs as its own task so a slow command never holds up
    /// the next one.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let events = self
            .event_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let signals = self
            .sync_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let (Some(mut events), Some(mut signals)) = (events, signals) else {
            bail!("Agent event loop is already running");
        };

        info!(cache = %self.lifecycle.active_namespace(), "Agent running");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    None | Some(AgentEvent::Shutdown) => break,
                    Some(event) => {
                        let agent = Arc::clone(&self);
                        tokio::spawn(async move { agent.dispatch(event).await });
                    }
                },
                Some(signal) = signals.recv() => {
                    let agent = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = agent.on_sync(signal).await {
                            warn!(tag = signal.tag.as_str(), error = %e, "Sync failed");
                        }
                    });
                }
            }
        }
        info!("Agent stopped");
        Ok(())
    }

    async fn dispatch(self: Arc<Self>, event: AgentEvent) {
        match event {
            AgentEvent::Install => {
                self.install().await;
            }
            AgentEvent::Activate => {
                self.activate().await;
            }
            AgentEvent::Fetch {
                request,
                respond_to,
            } => {
                let resolution = self.fetch(&request).await;
                if respond_to.send(resolution).is_err() {
                    debug!(url = %request.url, "Fetch caller went away");
                }
            }
            AgentEvent::Command {
                command,
                respond_to,
            } => {
                let kind = command.kind();
                // A panicking handler still owes the caller a reply.
                let agent = Arc::clone(&self);
                let envelope = match tokio::spawn(async move { agent.reply(command).await }).await {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        error!(command = kind, error = %e, "Command handler crashed");
                        ReplyEnvelope::failure(format!("{} failed: {}", kind, e))
                    }
                };
                if respond_to.send(envelope).is_err() {
                    debug!(command = kind, "Command caller went away");
                }
            }
            AgentEvent::Shutdown => {}
        }
    }

    // ========================================================================
    // Control protocol
    // ========================================================================

    /// Parse and execute one raw JSON command.
    pub async fn handle_message(&self, raw: &str) -> ReplyEnvelope {
        match Command::parse(raw) {
            Ok(command) => self.reply(command).await,
            Err(e) => {
                warn!(error = %e, "Rejected malformed command");
                ReplyEnvelope::failure(e.to_string())
            }
        }
    }

    /// Execute a command and wrap the outcome in a reply envelope.
    pub async fn reply(&self, command: Command) -> ReplyEnvelope {
        let kind = command.kind();
        debug!(command = kind, "Handling command");
        match self.handle_command(command).await {
            Ok(reply) => ReplyEnvelope::ok(reply),
            Err(e) => {
                warn!(command = kind, error = %e, "Command failed");
                ReplyEnvelope::failure(e.to_string())
            }
        }
    }

    pub async fn handle_command(&self, command: Command) -> Result<Reply, CommandError> {
        match command {
            Command::GetVersion => Ok(Reply::Version(self.version())),
            Command::GetDiagnostics => Ok(Reply::Diagnostics(self.diagnostics().await?)),
            Command::ValidateCache => Ok(Reply::Validation(self.validate().await)),
            Command::ClearAllCaches => Ok(Reply::Cleared(self.clear_all().await)),
            Command::CacheHealthData(payload) => {
                let record = self.health.put(HEALTH_KEY, payload).await?;
                Ok(Reply::HealthStored {
                    cached_at: record.cached_at.timestamp_millis(),
                })
            }
            Command::GetCachedHealthData => match self.health.get(HEALTH_KEY).await? {
                AuxLookup::Absent => Ok(Reply::HealthData(None)),
                AuxLookup::Corrupted => Ok(Reply::HealthCorrupted),
                AuxLookup::Found(record) => Ok(Reply::HealthData(Some(record))),
            },
            Command::RegisterPeriodicSync => Ok(self.register_sync(SyncTag::WeatherSync)),
            Command::RegisterFavoritesSync => Ok(self.register_sync(SyncTag::FavoritesSync)),
            Command::RegisterHealthSync => Ok(self.register_sync(SyncTag::HealthSync)),
            Command::QueueRequest(request) => self.queue_request(request),
            Command::SyncNow => {
                let drained = self.on_sync(SyncSignal::one_shot(SyncTag::WeatherSync)).await?;
                Ok(Reply::Drained(drained.unwrap_or_default()))
            }
        }
    }

    fn version(&self) -> VersionInfo {
        VersionInfo {
            version: self.config.app_version.clone(),
            build_id: self.config.build_id.clone(),
            cache_name: self.lifecycle.active_namespace().to_string(),
            auxiliary_cache: self.lifecycle.auxiliary_namespace().to_string(),
        }
    }

    async fn diagnostics(&self) -> Result<Diagnostics, CommandError> {
        let caches = self.storage.summaries().await;
        let health = match self.health.get(HEALTH_KEY).await? {
            AuxLookup::Absent => HealthSummary::absent(),
            AuxLookup::Corrupted => HealthSummary::corrupted(),
            AuxLookup::Found(record) => HealthSummary::of(&record),
        };
        let total = self.lifecycle.manifest().len();
        let missing = self.missing_assets().await.len();
        let queued_requests = match self.retry.entries() {
            Ok(entries) => entries.len(),
            Err(e) => {
                warn!(error = %e, "Failed to read retry queue");
                0
            }
        };

        Ok(Diagnostics {
            active_cache: self.lifecycle.active_namespace().to_string(),
            total_caches: caches.len(),
            caches,
            health,
            manifest: ManifestCoverage {
                total,
                cached: total.saturating_sub(missing),
            },
            queued_requests,
            registered_syncs: self.scheduler.registered(),
        })
    }

    /// Manifest entries absent from the active namespace, as URLs.
    async fn missing_assets(&self) -> Vec<String> {
        let active = self.lifecycle.active_namespace();
        let mut missing = Vec::new();
        for path in self.lifecycle.manifest().paths() {
            match self.lifecycle.manifest().resolve(path) {
                Ok(url) => {
                    let key = Request::get(url).cache_key();
                    if !self.storage.contains(active, &key).await {
                        missing.push(key);
                    }
                }
                Err(_) => missing.push(path.clone()),
            }
        }
        missing
    }

    async fn validate(&self) -> ValidationReport {
        let total = self.lifecycle.manifest().len();
        let report = ValidationReport::new(total, self.missing_assets().await);
        info!(
            cache = %self.lifecycle.active_namespace(),
            present = report.present,
            missing = report.missing,
            "Cache validated"
        );
        report
    }

    async fn clear_all(&self) -> ClearReport {
        let mut report = ClearReport::default();
        let mut names = self.storage.keys().await;
        names.extend(self.storage.unreadable().await);
        for name in names {
            match self.storage.delete(&name).await {
                Ok(true) => report.caches.push(name),
                Ok(false) => {}
                Err(e) => {
                    warn!(cache = %name, error = %e, "Failed to clear namespace");
                    report.failed.push(name);
                }
            }
        }
        report.cleared = report.caches.len();
        warn!(cleared = report.cleared, failed = report.failed.len(), "All caches cleared");
        report
    }

    /// (Re)start a periodic timer, replacing any earlier registration.
    fn register_sync(&self, tag: SyncTag) -> Reply {
        let interval = self.scheduler.register(tag, tag.interval(&self.config.sync));
        Reply::SyncRegistered {
            tag,
            interval_secs: interval.as_secs(),
        }
    }

    fn queue_request(&self, request: QueueRequest) -> Result<Reply, CommandError> {
        let url = self.config.origin.join(&request.url).map_err(|e| {
            CommandError::InvalidCommand(format!("invalid url {}: {}", request.url, e))
        })?;
        let entry = self.retry.enqueue(&url, request.options)?;
        Ok(Reply::Queued { id: entry.id })
    }

    // ========================================================================
    // Background sync
    // ========================================================================

    /// React to a periodic or one-shot sync signal.
    ///
    /// Periodic and one-shot signals are handled identically. Returns the
    /// drain report for `weather-sync`.
    pub async fn on_sync(&self, signal: SyncSignal) -> Result<Option<DrainReport>, StorageError> {
        debug!(tag = signal.tag.as_str(), trigger = ?signal.trigger, "Sync signal");
        match signal.tag {
            SyncTag::WeatherSync => self.weather_sync().await.map(Some),
            SyncTag::FavoritesSync => {
                self.refresh_favorites().await;
                Ok(None)
            }
            SyncTag::HealthSync => {
                self.health.purge_expired().await?;
                Ok(None)
            }
        }
    }

    async fn weather_sync(&self) -> Result<DrainReport, StorageError> {
        let report = self.retry.drain().await?;
        self.broadcaster.send(Notification::WeatherUpdate {
            timestamp: Utc::now(),
        });
        Ok(report)
    }

    /// Re-fetch every favorite and store the cacheable responses.
    ///
    /// Failures are logged per item and never queued for retry.
    async fn refresh_favorites(&self) -> usize {
        let active = self.lifecycle.active_namespace();
        let mut refreshed = 0;

        for favorite in &self.config.favorites {
            let url = match self.config.origin.join(favorite) {
                Ok(url) => url,
                Err(e) => {
                    warn!(favorite = %favorite, error = %e, "Invalid favorite");
                    continue;
                }
            };
            let request = Request::get(url.clone()).with_cache_mode(CacheMode::Reload);
            match self.network.fetch(&request).await {
                Ok(response) if is_cacheable(&self.config.origin, &url, &response) => {
                    match self
                        .storage
                        .put(active, &request.cache_key(), response.stamped())
                        .await
                    {
                        Ok(()) => refreshed += 1,
                        Err(e) => warn!(
                            url = %url,
                            cache = %active,
                            error = %e,
                            "Failed to store favorite"
                        ),
                    }
                }
                Ok(response) => {
                    warn!(url = %url, status = response.status, "Favorite response not cacheable")
                }
                Err(e) => warn!(url = %url, error = %e, "Favorite refresh failed"),
            }
        }

        info!(refreshed, total = self.config.favorites.len(), "Favorites refreshed");
        self.broadcaster.send(Notification::WeatherUpdate {
            timestamp: Utc::now(),
        });
        refreshed
    }
}

// ============================================================================
// Tests
// ============================================================================
