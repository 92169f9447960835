//! In-process networks for tests, demos and the CLI's offline mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;

use super::{Network, Request, Response};
use crate::error::FetchError;

/// A network that serves fixed responses keyed by URL.
///
/// Unknown URLs answer 404 while online. Taking the network offline makes
/// every fetch fail with `FetchError::Unreachable`.
#[derive(Debug, Default)]
pub struct StaticNetwork {
    routes: Mutex<HashMap<String, Response>>,
    offline: AtomicBool,
    latency: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every fetch, so overlapping operations actually overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn route(&self, url: &str, response: Response) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string(), response);
    }

    pub fn remove_route(&self, url: &str) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(url);
    }

    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    /// Number of fetches attempted so far, online or not.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn respond(&self, request: &Request) -> Result<Response, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Unreachable(request.url.to_string()));
        }
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(routes
            .get(&request.cache_key())
            .cloned()
            .unwrap_or_else(|| Response::new(404, "Not Found")))
    }
}

impl Network for StaticNetwork {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>> {
        Box::pin(self.respond(request))
    }
}

/// A network with no connectivity at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineNetwork;

impl Network for OfflineNetwork {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>> {
        let url = request.url.to_string();
        Box::pin(async move { Err(FetchError::Unreachable(url)) })
    }
}
