use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::{Method, header};

/// Decides whether a signaling handshake may proceed.
pub trait OriginPolicy: Send + Sync {
    fn allows(&self, request: &Request) -> bool;
}

/// Accepts any request that declares an origin or uses a safe read method.
///
/// WebSocket upgrades are always GET, so in practice this accepts every
/// handshake.
#[derive(Debug, Default, Clone, Copy)]
pub struct Permissive;

impl OriginPolicy for Permissive {
    fn allows(&self, request: &Request) -> bool {
        request.headers().contains_key(header::ORIGIN)
            || request.method() == Method::GET
            || request.method() == Method::HEAD
    }
}

/// Accepts only requests whose `Origin` matches one of the listed origins.
#[derive(Debug, Clone)]
pub struct AllowList {
    origins: Vec<String>,
}

impl AllowList {
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            origins: origins
                .into_iter()
                .map(|o| o.into().trim_end_matches('/').to_string())
                .collect(),
        }
    }
}

impl OriginPolicy for AllowList {
    fn allows(&self, request: &Request) -> bool {
        let Some(origin) = request
            .headers()
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        let origin = origin.trim_end_matches('/');
        self.origins
            .iter()
            .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(origin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: Method, origin: Option<&str>) -> Request {
        let mut builder = Request::builder().method(method).uri("/ws");
        if let Some(origin) = origin {
            builder = builder.header(header::ORIGIN, origin);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn permissive_accepts_origin_or_safe_method() {
        assert!(Permissive.allows(&request(Method::GET, None)));
        assert!(Permissive.allows(&request(Method::HEAD, None)));
        assert!(Permissive.allows(&request(Method::POST, Some("http://a.example"))));
        assert!(!Permissive.allows(&request(Method::POST, None)));
    }

    #[test]
    fn allow_list_matches_exact_origins() {
        let policy = AllowList::new(["https://probe.example/", "http://localhost:52611"]);
        assert!(policy.allows(&request(Method::GET, Some("https://probe.example"))));
        assert!(policy.allows(&request(Method::GET, Some("HTTP://LOCALHOST:52611"))));
        assert!(!policy.allows(&request(Method::GET, Some("https://evil.example"))));
        assert!(!policy.allows(&request(Method::GET, None)));
    }

    #[test]
    fn allow_list_wildcard() {
        let policy = AllowList::new(["*"]);
        assert!(policy.allows(&request(Method::GET, Some("https://anything.example"))));
        assert!(!policy.allows(&request(Method::GET, None)));
    }
}
