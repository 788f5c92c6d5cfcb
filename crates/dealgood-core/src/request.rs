use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use url::Url;

/// One logical HTTP call, shared read-only by every backend it is fanned out to.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    /// Path and query, or a full URL whose path and query are used.
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Host header to send regardless of backend configuration.
    pub host: Option<String>,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: HeaderMap::new(),
            body: None,
            host: None,
        }
    }

    pub fn get(uri: impl Into<String>) -> Self {
        Self::new(Method::GET, uri)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// The part of the URI that is appended to a backend's base URL.
    pub fn path_and_query(&self) -> String {
        if let Ok(url) = Url::parse(&self.uri) {
            return match url.query() {
                Some(q) => format!("{}?{}", url.path(), q),
                None => url.path().to_string(),
            };
        }
        if self.uri.starts_with('/') {
            self.uri.clone()
        } else {
            format!("/{}", self.uri)
        }
    }

    /// Full URL of this request against `base`, keeping any path prefix the base carries.
    pub fn target_url(&self, base: &Url) -> String {
        let base = base.as_str().trim_end_matches('/');
        format!("{}{}", base, self.path_and_query())
    }
}
