use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{AssetManifest, AssetOutcome, SingleFlight};
use crate::cache::CacheStorage;
use crate::config::AgentConfig;
use crate::net::{CacheMode, Network, Request, Response};

/// Result of one manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetReport {
    pub path: String,
    #[serde(flatten)]
    pub outcome: AssetOutcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallReport {
    pub namespace: String,
    pub cached: usize,
    pub failed: usize,
    pub assets: Vec<AssetReport>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateReport {
    pub active: String,
    pub deleted: Vec<String>,
    /// Namespaces that could not be deleted this time.
    pub failed: Vec<String>,
}

/// Owns the install/activate lifecycle of one build's namespace.
///
/// Both operations are idempotent and guarded by their own single-flight
/// flag; an overlapping call returns `None` without doing anything.
pub struct LifecycleManager {
    network: Arc<dyn Network>,
    storage: Arc<CacheStorage>,
    manifest: AssetManifest,
    active: String,
    auxiliary: String,
    installing: SingleFlight,
    activating: SingleFlight,
}

impl LifecycleManager {
    pub fn new(
        config: &AgentConfig,
        network: Arc<dyn Network>,
        storage: Arc<CacheStorage>,
    ) -> Self {
        let timeout = config.single_flight_timeout();
        Self {
            network,
            storage,
            manifest: AssetManifest::new(config.origin.clone(), config.manifest.clone()),
            active: config.active_namespace(),
            auxiliary: config.auxiliary_namespace(),
            installing: SingleFlight::new("install", timeout),
            activating: SingleFlight::new("activate", timeout),
        }
    }

    pub fn active_namespace(&self) -> &str {
        &self.active
    }

    pub fn auxiliary_namespace(&self) -> &str {
        &self.auxiliary
    }

    pub fn manifest(&self) -> &AssetManifest {
        &self.manifest
    }

    /// Populate the active namespace from the manifest.
    ///
    /// Assets are fetched concurrently and stored with a single write.
    /// Individual asset failures are recorded and never fail the install.
    pub async fn install(&self) -> Option<InstallReport> {
        let Some(_flight) = self.installing.try_acquire() else {
            info!(cache = %self.active, "Install already running, ignoring");
            return None;
        };

        info!(cache = %self.active, assets = self.manifest.len(), "Installing");

        let fetched = join_all(
            self.manifest
                .paths()
                .iter()
                .map(|path| async move { (path.clone(), self.fetch_asset(path).await) }),
        )
        .await;

        let mut entries = Vec::new();
        let mut assets = Vec::with_capacity(fetched.len());
        for (path, result) in fetched {
            let outcome = match result {
                Ok(entry) => {
                    entries.push(entry);
                    AssetOutcome::Cached
                }
                Err(outcome) => outcome,
            };
            assets.push(AssetReport { path, outcome });
        }

        if !entries.is_empty() {
            let stored = entries.len();
            match self.storage.put_many(&self.active, entries).await {
                Ok(()) => debug!(cache = %self.active, stored, "Assets stored"),
                Err(e) => {
                    warn!(cache = %self.active, error = %e, "Failed to store assets");
                    for asset in assets.iter_mut().filter(|a| a.outcome.is_cached()) {
                        asset.outcome = AssetOutcome::Error {
                            message: e.to_string(),
                        };
                    }
                }
            }
        }

        let cached = assets.iter().filter(|a| a.outcome.is_cached()).count();
        let failed = assets.len() - cached;
        info!(cache = %self.active, cached, failed, "Install complete");

        Some(InstallReport {
            namespace: self.active.clone(),
            cached,
            failed,
            assets,
        })
    }

    /// Fetch one manifest entry, yielding the cache key and stamped response.
    async fn fetch_asset(&self, path: &str) -> Result<(String, Response), AssetOutcome> {
        let url = match self.manifest.resolve(path) {
            Ok(url) => url,
            Err(e) => {
                warn!(path, error = %e, "Invalid manifest entry");
                return Err(AssetOutcome::Error {
                    message: e.to_string(),
                });
            }
        };

        if url.origin() != self.manifest.origin().origin() {
            warn!(url = %url, "Manifest entry is not same-origin, not caching");
            return Err(AssetOutcome::Error {
                message: format!("{} is not same-origin", url),
            });
        }

        let request = Request::get(url.clone()).with_cache_mode(CacheMode::Reload);
        let response = match self.network.fetch(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %url, error = %e, "Failed to fetch asset");
                return Err(AssetOutcome::Error {
                    message: e.to_string(),
                });
            }
        };

        if !response.is_ok() {
            warn!(url = %url, status = response.status, "Asset fetch returned error status");
            return Err(AssetOutcome::FetchFailed {
                code: response.status,
            });
        }

        debug!(url = %url, cache = %self.active, "Asset fetched");
        Ok((request.cache_key(), response.stamped()))
    }

    /// Delete every namespace other than the active and auxiliary ones,
    /// including namespaces whose file could not be read.
    ///
    /// Deletion failures are logged and reported; they never stop the sweep.
    pub async fn activate(&self) -> Option<ActivateReport> {
        let Some(_flight) = self.activating.try_acquire() else {
            info!(cache = %self.active, "Activate already running, ignoring");
            return None;
        };

        let mut report = ActivateReport {
            active: self.active.clone(),
            ..Default::default()
        };

        let mut names = self.storage.keys().await;
        names.extend(self.storage.unreadable().await);
        for name in names {
            if name == self.active || name == self.auxiliary {
                continue;
            }
            match self.storage.delete(&name).await {
                Ok(true) => {
                    info!(cache = %name, "Deleted stale namespace");
                    report.deleted.push(name);
                }
                // Already gone; another sweep got there first.
                Ok(false) => {}
                Err(e) => {
                    warn!(cache = %name, error = %e, "Failed to delete stale namespace");
                    report.failed.push(name);
                }
            }
        }

        info!(
            cache = %self.active,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "Activation complete"
        );
        Some(report)
    }
}

// ============================================================================
// Tests
// ============================================================================
