use url::Url;

use crate::net::Response;

/// Whether a network response may be written into a namespace used for
/// fallback: same origin, `http`/`https`, and a 2xx status.
pub fn is_cacheable(origin: &Url, url: &Url, response: &Response) -> bool {
    matches!(url.scheme(), "http" | "https")
        && url.origin() == origin.origin()
        && response.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_same_origin_ok_is_cacheable() {
        let origin = url("https://app.example/");
        assert!(is_cacheable(&origin, &url("https://app.example/app.js"), &Response::ok("x")));
    }

    #[test]
    fn test_cross_origin_is_not_cacheable() {
        let origin = url("https://app.example/");
        let response = Response::ok("x");
        assert!(!is_cacheable(&origin, &url("https://cdn.example/app.js"), &response));
        assert!(!is_cacheable(&origin, &url("http://app.example/app.js"), &response));
        assert!(!is_cacheable(&origin, &url("https://app.example:8443/app.js"), &response));
    }

    #[test]
    fn test_error_status_is_not_cacheable() {
        let origin = url("https://app.example/");
        let target = url("https://app.example/app.js");
        assert!(!is_cacheable(&origin, &target, &Response::new(404, "missing")));
        assert!(!is_cacheable(&origin, &target, &Response::new(500, "boom")));
    }
}
