use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use reqwest::Method;
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use super::tiers::{ActiveNamespace, AnyNamespace, FallbackTier, RootDocument};
use crate::cache::{is_cacheable, CacheStorage};
use crate::config::AgentConfig;
use crate::error::FetchError;
use crate::net::{Network, Request, Response};

/// Status of the synthesized response when every tier misses.
pub const OFFLINE_STATUS: u16 = 503;

/// Where a resolved response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Not intercepted: non-GET or bypassed host.
    Passthrough,
    Network,
    /// Served by the named fallback tier.
    Fallback(&'static str),
    /// Synthesized offline response.
    Offline,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub response: Response,
    pub source: Source,
}

/// Network-first request resolution with ordered offline fallbacks.
pub struct Resolver {
    network: Arc<dyn Network>,
    storage: Arc<CacheStorage>,
    origin: Url,
    active: String,
    bypass_hosts: HashSet<String>,
    tiers: Vec<Box<dyn FallbackTier>>,
}

impl Resolver {
    pub fn new(
        config: &AgentConfig,
        network: Arc<dyn Network>,
        storage: Arc<CacheStorage>,
    ) -> Self {
        let active = config.active_namespace();
        let auxiliary = config.auxiliary_namespace();
        let tiers: Vec<Box<dyn FallbackTier>> = vec![
            Box::new(ActiveNamespace::new(Arc::clone(&storage), active.clone())),
            Box::new(AnyNamespace::new(
                Arc::clone(&storage),
                auxiliary.clone(),
                config.stale_namespace_limit,
            )),
            Box::new(RootDocument::new(
                Arc::clone(&storage),
                &config.origin,
                active.clone(),
                auxiliary,
            )),
        ];

        Self {
            network,
            storage,
            origin: config.origin.clone(),
            active,
            bypass_hosts: config
                .bypass_hosts
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            tiers,
        }
    }

    pub fn tier_names(&self) -> Vec<&'static str> {
        self.tiers.iter().map(|t| t.name()).collect()
    }

    /// Hosts on the bypass list, and their subdomains, are never intercepted.
    fn is_bypassed(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        self.bypass_hosts.iter().any(|bypass| {
            host == *bypass
                || host
                    .strip_suffix(bypass.as_str())
                    .map(|rest| rest.ends_with('.'))
                    .unwrap_or(false)
        })
    }

    /// Resolve a request.
    ///
    /// Intercepted GETs always produce a response: from the network, from a
    /// fallback tier, or the synthesized offline response. Only
    /// passthrough requests can return a `FetchError`.
    pub async fn resolve(&self, request: &Request) -> Result<Resolution, FetchError> {
        if request.method != Method::GET || self.is_bypassed(&request.url) {
            debug!(url = %request.url, method = %request.method, "Passing through");
            let response = self.network.fetch(request).await?;
            return Ok(Resolution {
                response,
                source: Source::Passthrough,
            });
        }

        match self.network.fetch(request).await {
            Ok(response) => {
                self.write_back(request, &response).await;
                Ok(Resolution {
                    response,
                    source: Source::Network,
                })
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed, trying fallbacks");
                Ok(self.fallback(request).await)
            }
        }
    }

    async fn write_back(&self, request: &Request, response: &Response) {
        if !is_cacheable(&self.origin, &request.url, response) {
            return;
        }
        if let Err(e) = self
            .storage
            .put(&self.active, &request.cache_key(), response.clone().stamped())
            .await
        {
            warn!(url = %request.url, cache = %self.active, error = %e, "Failed to cache response");
        }
    }

    async fn fallback(&self, request: &Request) -> Resolution {
        for tier in &self.tiers {
            if let Some(response) = tier.lookup(request).await {
                info!(url = %request.url, tier = tier.name(), "Served from cache");
                return Resolution {
                    response,
                    source: Source::Fallback(tier.name()),
                };
            }
        }

        warn!(url = %request.url, "Offline and not cached");
        Resolution {
            response: offline_response(request),
            source: Source::Offline,
        }
    }
}

/// The structured response returned when nothing can serve a request.
pub fn offline_response(request: &Request) -> Response {
    let body = json!({
        "error": "offline",
        "message": "Network unavailable and no cached copy of this resource exists",
        "url": request.path_and_query(),
        "timestamp": Utc::now().timestamp_millis(),
    });
    Response::json(OFFLINE_STATUS, &body).with_header("cache-control", "no-store")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::StaticNetwork;

    const ORIGIN: &str = "https://app.example";

    fn config() -> AgentConfig {
        AgentConfig {
            build_id: "b2".to_string(),
            origin: Url::parse(ORIGIN).unwrap(),
            bypass_hosts: vec!["api.weather.gov".to_string()],
            ..Default::default()
        }
    }

    fn url(path: &str) -> Url {
        Url::parse(&format!("{}{}", ORIGIN, path)).unwrap()
    }

    struct Fixture {
        network: Arc<StaticNetwork>,
        storage: Arc<CacheStorage>,
        resolver: Resolver,
    }

    fn fixture() -> Fixture {
        let network = Arc::new(StaticNetwork::new());
        let storage = Arc::new(CacheStorage::in_memory());
        let resolver = Resolver::new(
            &config(),
            Arc::clone(&network) as Arc<dyn Network>,
            Arc::clone(&storage),
        );
        Fixture {
            network,
            storage,
            resolver,
        }
    }

    #[tokio::test]
    async fn test_network_success_is_written_back() {
        let f = fixture();
        f.network.route(url("/app.js").as_str(), Response::ok("fresh js"));

        let resolution = f.resolver.resolve(&Request::get(url("/app.js"))).await.unwrap();
        assert_eq!(resolution.source, Source::Network);
        assert_eq!(resolution.response.body, b"fresh js");
        assert!(resolution.response.stored_at.is_none());

        let stored = f.storage.lookup("skycache-b2", url("/app.js").as_str()).await.unwrap();
        assert_eq!(stored.body, b"fresh js");
    }

    #[tokio::test]
    async fn test_error_responses_are_not_cached() {
        let f = fixture();
        f.network.route(url("/broken").as_str(), Response::new(500, "boom"));

        let resolution = f.resolver.resolve(&Request::get(url("/broken"))).await.unwrap();
        assert_eq!(resolution.source, Source::Network);
        assert_eq!(resolution.response.status, 500);
        assert!(!f.storage.has("skycache-b2").await);
    }

    #[tokio::test]
    async fn test_cross_origin_is_not_cached() {
        let f = fixture();
        let cdn = Url::parse("https://cdn.example/lib.js").unwrap();
        f.network.route(cdn.as_str(), Response::ok("lib"));

        let resolution = f.resolver.resolve(&Request::get(cdn)).await.unwrap();
        assert_eq!(resolution.source, Source::Network);
        assert!(!f.storage.has("skycache-b2").await);
    }

    #[tokio::test]
    async fn test_round_trip_offline() {
        let f = fixture();
        let body = vec![0u8, 159, 146, 150, 255];
        f.network.route(url("/logo.png").as_str(), Response::ok(body.clone()));
        f.resolver.resolve(&Request::get(url("/logo.png"))).await.unwrap();

        f.network.set_online(false);
        let resolution = f.resolver.resolve(&Request::get(url("/logo.png"))).await.unwrap();
        assert_eq!(resolution.source, Source::Fallback("active-namespace"));
        assert_eq!(resolution.response.body, body);
    }

    #[tokio::test]
    async fn test_stale_namespace_serves_before_root_document() {
        let f = fixture();
        f.storage
            .put("skycache-b1", url("/legacy.html").as_str(), Response::ok("legacy"))
            .await
            .unwrap();
        f.storage
            .put("skycache-b2", url("/").as_str(), Response::ok("root"))
            .await
            .unwrap();
        f.network.set_online(false);

        let resolution = f
            .resolver
            .resolve(&Request::document(url("/legacy.html")))
            .await
            .unwrap();
        assert_eq!(resolution.source, Source::Fallback("any-namespace"));
        assert_eq!(resolution.response.body, b"legacy");
    }

    #[tokio::test]
    async fn test_html_miss_falls_back_to_root_document() {
        let f = fixture();
        f.storage
            .put("skycache-b2", url("/").as_str(), Response::ok("root"))
            .await
            .unwrap();
        f.network.set_online(false);

        let resolution = f.resolver.resolve(&Request::document(url("/nowhere"))).await.unwrap();
        assert_eq!(resolution.source, Source::Fallback("root-document"));
        assert_eq!(resolution.response.body, b"root");
    }

    #[tokio::test]
    async fn test_total_miss_is_offline_response() {
        let f = fixture();
        f.storage
            .put("skycache-b2", url("/").as_str(), Response::ok("root"))
            .await
            .unwrap();
        f.network.set_online(false);

        let resolution = f
            .resolver
            .resolve(&Request::get(url("/missing.js")))
            .await
            .unwrap();
        assert_eq!(resolution.source, Source::Offline);
        assert_eq!(resolution.response.status, OFFLINE_STATUS);
        assert_eq!(resolution.response.header("content-type"), Some("application/json"));

        let body: serde_json::Value = serde_json::from_slice(&resolution.response.body).unwrap();
        assert_eq!(body["error"], "offline");
        assert_eq!(body["url"], "/missing.js");
        assert!(body["message"].is_string());
        assert!(body["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn test_non_get_passes_through_without_fallback() {
        let f = fixture();
        f.network.route(url("/api/report").as_str(), Response::ok("accepted"));

        let post = Request::new(Method::POST, url("/api/report")).with_body(b"{}".to_vec());
        let resolution = f.resolver.resolve(&post).await.unwrap();
        assert_eq!(resolution.source, Source::Passthrough);
        assert!(!f.storage.has("skycache-b2").await);

        f.network.set_online(false);
        assert!(f.resolver.resolve(&post).await.is_err());
    }

    #[tokio::test]
    async fn test_bypass_hosts_are_untouched() {
        let f = fixture();
        let points = Url::parse("https://api.weather.gov/points/39.7,-104.9").unwrap();
        f.network.route(points.as_str(), Response::ok("{}"));

        let resolution = f.resolver.resolve(&Request::get(points.clone())).await.unwrap();
        assert_eq!(resolution.source, Source::Passthrough);

        f.network.set_online(false);
        assert!(f.resolver.resolve(&Request::get(points)).await.is_err());
    }

    #[test]
    fn test_bypass_matches_subdomains_only() {
        let f = fixture();
        assert!(f.resolver.is_bypassed(&Url::parse("https://api.weather.gov/x").unwrap()));
        assert!(f.resolver.is_bypassed(&Url::parse("https://alerts.api.weather.gov/x").unwrap()));
        assert!(!f.resolver.is_bypassed(&Url::parse("https://notapi.weather.gov/x").unwrap()));
        assert!(!f.resolver.is_bypassed(&url("/x")));
    }

    #[test]
    fn test_default_tier_order() {
        let f = fixture();
        assert_eq!(
            f.resolver.tier_names(),
            vec!["active-namespace", "any-namespace", "root-document"]
        );
    }
}
