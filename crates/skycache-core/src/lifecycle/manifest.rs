use serde::Serialize;
use url::Url;

/// Ordered list of resources that must be present in the active namespace.
#[derive(Debug, Clone)]
pub struct AssetManifest {
    origin: Url,
    paths: Vec<String>,
}

/// How one manifest entry fared during install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum AssetOutcome {
    Cached,
    FetchFailed { code: u16 },
    Error { message: String },
}

impl AssetOutcome {
    pub fn is_cached(&self) -> bool {
        matches!(self, AssetOutcome::Cached)
    }
}

impl AssetManifest {
    pub fn new(origin: Url, paths: Vec<String>) -> Self {
        Self { origin, paths }
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Absolute URL of a manifest entry.
    pub fn resolve(&self, path: &str) -> Result<Url, url::ParseError> {
        let mut url = self.origin.join(path)?;
        url.set_fragment(None);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> AssetManifest {
        AssetManifest::new(
            Url::parse("https://app.example/").unwrap(),
            vec!["/".to_string(), "/app.js".to_string(), "icons/icon.png".to_string()],
        )
    }

    #[test]
    fn test_resolve() {
        let manifest = manifest();
        assert_eq!(manifest.resolve("/").unwrap().as_str(), "https://app.example/");
        assert_eq!(
            manifest.resolve("/app.js").unwrap().as_str(),
            "https://app.example/app.js"
        );
        assert_eq!(
            manifest.resolve("icons/icon.png").unwrap().as_str(),
            "https://app.example/icons/icon.png"
        );
    }

    #[test]
    fn test_outcome_wire_shape() {
        let json = serde_json::to_value(AssetOutcome::FetchFailed { code: 404 }).unwrap();
        assert_eq!(json, serde_json::json!({"status": "fetch-failed", "code": 404}));
        let json = serde_json::to_value(AssetOutcome::Cached).unwrap();
        assert_eq!(json, serde_json::json!({"status": "cached"}));
    }
}
