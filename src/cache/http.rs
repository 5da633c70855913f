//! Request/response values and the network seam.
//!
//! [`Request`] and [`Response`] are plain data so they can cross the host
//! bridge as JSON and be stored by any [`crate::cache::backend::CacheBackend`].
//! Bodies are base64 on the wire and at rest.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, WorkerError};

/// What the requesting context intends to do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    /// Top-level page load.
    Document,
    Image,
    Script,
    Style,
    Font,
    Manifest,
    /// `fetch()`/XHR and anything else.
    #[default]
    Empty,
}

/// An intercepted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: Url,
    /// Value of the `Accept` header, if any.
    #[serde(default)]
    pub accept: Option<String>,
    #[serde(default)]
    pub destination: Destination,
    /// Request mode was `navigate`.
    #[serde(default)]
    pub navigate: bool,
}

fn default_method() -> String {
    "GET".to_owned()
}

impl Request {
    /// Plain GET for `url`.
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self {
            method: default_method(),
            url,
            accept: None,
            destination: Destination::Empty,
            navigate: false,
        }
    }

    /// Set the `Accept` header.
    #[must_use]
    pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
        self.accept = Some(accept.into());
        self
    }

    /// Mark as a page navigation.
    #[must_use]
    pub fn as_navigation(mut self) -> Self {
        self.destination = Destination::Document;
        self.navigate = true;
        self
    }

    #[must_use]
    pub fn is_get(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }

    /// Page loads get the offline placeholder instead of a bare error.
    #[must_use]
    pub fn is_navigation(&self) -> bool {
        self.navigate || self.destination == Destination::Document
    }

    /// Cache key for this request.
    #[must_use]
    pub fn key(&self) -> RequestKey {
        RequestKey::new(&self.method, &self.url)
    }
}

/// Cache identity of a request: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey(String);

impl RequestKey {
    #[must_use]
    pub fn new(method: &str, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self(format!("{} {}", method.to_ascii_uppercase(), url))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A response, live or cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_base64", default)]
    pub body: Bytes,
}

impl Response {
    /// A 200 response with the given content type and body.
    #[must_use]
    pub fn ok(content_type: &str, body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            status_text: "OK".to_owned(),
            headers: vec![("content-type".to_owned(), content_type.to_owned())],
            body: body.into(),
        }
    }

    /// Synthetic response used when neither cache nor network can answer.
    #[must_use]
    pub fn offline() -> Self {
        Self {
            status: OFFLINE_STATUS,
            status_text: "Offline".to_owned(),
            headers: vec![("content-type".to_owned(), "text/plain; charset=utf-8".to_owned())],
            body: Bytes::from_static("Recurso offline".as_bytes()),
        }
    }

    /// Built-in page for navigations when the offline page itself is not cached.
    #[must_use]
    pub fn offline_page() -> Self {
        Self {
            status: 503,
            status_text: "Service Unavailable".to_owned(),
            headers: vec![("content-type".to_owned(), "text/html; charset=utf-8".to_owned())],
            body: Bytes::from_static(OFFLINE_HTML.as_bytes()),
        }
    }

    /// 2xx status.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First header value with this name, case-insensitive.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Status carried by [`Response::offline`].
pub const OFFLINE_STATUS: u16 = 408;

const OFFLINE_HTML: &str = "<!doctype html><html lang=\"pt-BR\"><head><meta charset=\"utf-8\">\
<title>Meu Remédio - offline</title></head><body><h1>Você está offline</h1>\
<p>Os lembretes continuam funcionando. Reconecte-se para atualizar os dados.</p></body></html>";

mod body_base64 {
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let raw = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(raw.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Source of live responses.
///
/// `Err` means the request never produced a response (offline, DNS, reset).
/// HTTP error statuses are `Ok` responses.
#[async_trait]
pub trait Network: Send + Sync + 'static {
    async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// [`Network`] backed by reqwest. Relies on the client's own timeouts.
#[derive(Clone, Default)]
pub struct HttpNetwork {
    client: reqwest::Client,
}

impl HttpNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| WorkerError::InvalidCommand(format!("bad method {}: {e}", request.method)))?;

        let mut builder = self.client.request(method, request.url.clone());
        if let Some(accept) = &request.accept {
            builder = builder.header(reqwest::header::ACCEPT, accept);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| WorkerError::Network(format!("{} failed: {e}", request.url)))?;

        let status = resp.status();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_owned(), v.to_owned())))
            .collect();
        let body = resp
            .bytes()
            .await
            .map_err(|e| WorkerError::Network(format!("{} body read failed: {e}", request.url)))?;

        Ok(Response {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn request_key_ignores_fragment_and_normalises_method() {
        let a = RequestKey::new("get", &Url::parse("http://x.test/a.png#top").unwrap());
        let b = Request::get(Url::parse("http://x.test/a.png").unwrap()).key();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "GET http://x.test/a.png");
    }

    #[test]
    fn navigation_detection() {
        let url = Url::parse("http://x.test/").unwrap();
        assert!(!Request::get(url.clone()).is_navigation());
        assert!(Request::get(url.clone()).as_navigation().is_navigation());

        let mut req = Request::get(url);
        req.destination = Destination::Document;
        assert!(req.is_navigation());
    }

    #[test]
    fn response_json_carries_base64_body() {
        let resp = Response::ok("image/png", vec![0_u8, 159, 146, 150]);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["body"], "AJ+Slg==");
        let back: Response = serde_json::from_value(json).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn request_defaults_to_get() {
        let req: Request = serde_json::from_str(r#"{"url":"http://x.test/api/meds"}"#).unwrap();
        assert!(req.is_get());
        assert_eq!(req.destination, Destination::Empty);
    }

    #[test]
    fn offline_response_is_distinguishable() {
        let resp = Response::offline();
        assert_eq!(resp.status, OFFLINE_STATUS);
        assert!(!resp.is_success());
        assert_eq!(resp.status_text, "Offline");
    }
}
