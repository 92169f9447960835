//! The fallback tiers consulted when the network fails.

use std::sync::Arc;

use futures::future::BoxFuture;
use url::Url;

use crate::cache::CacheStorage;
use crate::net::{Request, Response};

/// One ordered step of offline resolution.
pub trait FallbackTier: Send + Sync {
    fn name(&self) -> &'static str;

    fn lookup<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Option<Response>>;
}

/// Non-auxiliary namespaces, newest first, optionally bounded.
async fn asset_namespaces(
    storage: &CacheStorage,
    auxiliary: &str,
    limit: Option<usize>,
) -> Vec<String> {
    let mut names: Vec<String> = storage
        .keys()
        .await
        .into_iter()
        .rev()
        .filter(|name| name != auxiliary)
        .collect();
    if let Some(limit) = limit {
        names.truncate(limit);
    }
    names
}

/// Tier 2: the namespace owned by the running build.
pub struct ActiveNamespace {
    storage: Arc<CacheStorage>,
    namespace: String,
}

impl ActiveNamespace {
    pub fn new(storage: Arc<CacheStorage>, namespace: String) -> Self {
        Self { storage, namespace }
    }
}

impl FallbackTier for ActiveNamespace {
    fn name(&self) -> &'static str {
        "active-namespace"
    }

    fn lookup<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Option<Response>> {
        Box::pin(async move { self.storage.lookup(&self.namespace, &request.cache_key()).await })
    }
}

/// Tier 3: every asset namespace, including ones left behind by older
/// builds that have not been swept yet.
pub struct AnyNamespace {
    storage: Arc<CacheStorage>,
    auxiliary: String,
    limit: Option<usize>,
}

impl AnyNamespace {
    pub fn new(storage: Arc<CacheStorage>, auxiliary: String, limit: Option<usize>) -> Self {
        Self {
            storage,
            auxiliary,
            limit,
        }
    }
}

impl FallbackTier for AnyNamespace {
    fn name(&self) -> &'static str {
        "any-namespace"
    }

    fn lookup<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Option<Response>> {
        Box::pin(async move {
            let key = request.cache_key();
            for name in asset_namespaces(&self.storage, &self.auxiliary, self.limit).await {
                // A namespace swept away mid-lookup is just a miss.
                if let Some(hit) = self.storage.lookup(&name, &key).await {
                    return Some(hit);
                }
            }
            None
        })
    }
}

/// Tier 4: the root document, for page requests only.
pub struct RootDocument {
    storage: Arc<CacheStorage>,
    active: String,
    auxiliary: String,
    candidates: Vec<String>,
}

impl RootDocument {
    pub fn new(
        storage: Arc<CacheStorage>,
        origin: &Url,
        active: String,
        auxiliary: String,
    ) -> Self {
        let candidates = ["/", "/index.html"]
            .iter()
            .filter_map(|path| origin.join(path).ok())
            .map(|url| url.to_string())
            .collect();
        Self {
            storage,
            active,
            auxiliary,
            candidates,
        }
    }
}

impl FallbackTier for RootDocument {
    fn name(&self) -> &'static str {
        "root-document"
    }

    fn lookup<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Option<Response>> {
        Box::pin(async move {
            if !request.accepts_html() {
                return None;
            }
            let mut namespaces = vec![self.active.clone()];
            namespaces.extend(
                asset_namespaces(&self.storage, &self.auxiliary, None)
                    .await
                    .into_iter()
                    .filter(|name| *name != self.active),
            );
            for name in &namespaces {
                for key in &self.candidates {
                    if let Some(hit) = self.storage.lookup(name, key).await {
                        return Some(hit);
                    }
                }
            }
            None
        })
    }
}
