// ABOUTME: Page fetching for book sources: the PageFetcher trait, a reqwest-backed implementation, and cancellation.
// ABOUTME: Handles request bodies, content-length limits, charset decoding and JSON parsing of fetched pages.

//! Fetching.
//!
//! The engine only talks to a [`PageFetcher`]. [`HttpFetcher`] is the
//! default transport; hosts can supply their own (a proxying bridge, a test
//! double) through [`crate::EngineBuilder::fetcher`].
//!
//! Submodules:
//! - `cache`: TTL page cache wrapping any fetcher.

pub mod cache;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use encoding_rs::Encoding;
use reqwest::Method;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::options::Options;
use crate::template::UrlOptions;

pub use cache::CachedFetcher;

/// Maximum allowed content length (10 MB).
pub const MAX_CONTENT_LENGTH: usize = 10 * 1024 * 1024;

/// A cloneable cancellation flag shared between a caller and in-flight fetches.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    inner: Arc<SignalInner>,
}

#[derive(Debug, Default)]
struct SignalInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort every fetch observing this signal. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Per-request settings passed to a [`PageFetcher`].
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub method: Method,
    pub body: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// Charset override for decoding the response.
    pub charset: Option<&'static Encoding>,
    pub signal: Option<CancelSignal>,
}

impl FetchRequest {
    /// A plain GET.
    pub fn get() -> Self {
        Self::default()
    }

    /// Build a request from the options blob of a URL template. `body` is the
    /// already-substituted request body.
    pub fn from_url_options(options: &UrlOptions, body: Option<String>) -> Self {
        Self {
            method: if options.is_post() {
                Method::POST
            } else {
                Method::GET
            },
            body,
            headers: options.headers.clone(),
            charset: options.encoding(),
            signal: None,
        }
    }

    pub fn with_signal(mut self, signal: Option<CancelSignal>) -> Self {
        self.signal = signal;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.as_ref().is_some_and(CancelSignal::is_cancelled)
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.keys().any(|k| k.eq_ignore_ascii_case(name))
    }
}

/// The transport the engine fetches pages through.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch `url` and return the decoded body. Non-2xx statuses are errors.
    async fn fetch_text(&self, url: &str, req: &FetchRequest) -> Result<String, SourceError>;

    /// Fetch `url` and parse the body as JSON.
    async fn fetch_json(&self, url: &str, req: &FetchRequest) -> Result<Value, SourceError> {
        let text = self.fetch_text(url, req).await?;
        parse_json_body(url, &text)
    }
}

#[async_trait]
impl<F: PageFetcher + ?Sized> PageFetcher for Arc<F> {
    async fn fetch_text(&self, url: &str, req: &FetchRequest) -> Result<String, SourceError> {
        (**self).fetch_text(url, req).await
    }

    async fn fetch_json(&self, url: &str, req: &FetchRequest) -> Result<Value, SourceError> {
        (**self).fetch_json(url, req).await
    }
}

/// Parse a fetched body as JSON, stripping a UTF-8 BOM first.
///
/// An HTML page where JSON was expected is reported as
/// [`crate::ErrorCode::UnexpectedContentType`].
pub fn parse_json_body(url: &str, text: &str) -> Result<Value, SourceError> {
    let body = text.trim_start_matches('\u{feff}').trim();
    if body.starts_with('<') {
        return Err(SourceError::content_type(
            url,
            "FetchJson",
            Some(anyhow::anyhow!("received HTML where JSON was expected")),
        ));
    }
    serde_json::from_str(body).map_err(|e| {
        SourceError::content_type(
            url,
            "FetchJson",
            Some(anyhow::anyhow!("invalid JSON: {}", e)),
        )
    })
}

/// reqwest-backed [`PageFetcher`].
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    headers: BTreeMap<String, String>,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            headers: BTreeMap::new(),
        }
    }

    /// Build a fetcher from engine options, reusing `opts.http_client` when set.
    pub fn from_options(opts: &Options) -> Self {
        let client = opts.http_client.clone().unwrap_or_else(|| {
            reqwest::Client::builder()
                .user_agent(&opts.user_agent)
                .timeout(opts.timeout)
                .cookie_store(true)
                .gzip(true)
                .brotli(true)
                .deflate(true)
                .build()
                .unwrap_or_else(|e| {
                    warn!(error = %e, "failed to build configured HTTP client; using defaults");
                    reqwest::Client::new()
                })
        });
        Self {
            client,
            headers: opts.headers.clone(),
        }
    }

    /// Headers sent with every request; per-request headers win.
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    async fn send(&self, url: &str, req: &FetchRequest) -> Result<String, SourceError> {
        let mut headers = self.headers.clone();
        headers.extend(req.headers.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut request = self.client.request(req.method.clone(), url);
        for (key, value) in &headers {
            request = request.header(key, value);
        }
        if let Some(body) = &req.body {
            if !req.has_header("content-type") {
                request = request.header("content-type", body_content_type(body));
            }
            request = request.body(body.clone());
        }

        debug!(method = %req.method, url, "fetching page");
        let response = request.send().await.map_err(|e| {
            SourceError::fetch(url, "Fetch", Some(anyhow::anyhow!("request failed: {}", e)))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::fetch(
                url,
                "Fetch",
                Some(anyhow::anyhow!("HTTP status {}", status.as_u16())),
            ));
        }

        if let Some(len) = response.content_length() {
            if len as usize > MAX_CONTENT_LENGTH {
                return Err(SourceError::fetch(
                    url,
                    "Fetch",
                    Some(anyhow::anyhow!("content too large")),
                ));
            }
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_lowercase());

        let body: Bytes = response.bytes().await.map_err(|e| {
            SourceError::fetch(
                url,
                "Fetch",
                Some(anyhow::anyhow!("failed to read body: {}", e)),
            )
        })?;
        if body.len() > MAX_CONTENT_LENGTH {
            return Err(SourceError::fetch(
                url,
                "Fetch",
                Some(anyhow::anyhow!("content too large")),
            ));
        }

        Ok(decode_body(&body, req.charset, content_type.as_deref()))
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str, req: &FetchRequest) -> Result<String, SourceError> {
        let parsed = url::Url::parse(url).map_err(|e| {
            SourceError::invalid_url(url, "Fetch", Some(anyhow::anyhow!("invalid URL: {}", e)))
        })?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(SourceError::invalid_url(
                url,
                "Fetch",
                Some(anyhow::anyhow!("scheme must be http or https")),
            ));
        }

        match &req.signal {
            Some(signal) => {
                if signal.is_cancelled() {
                    return Err(SourceError::cancelled(url, "Fetch"));
                }
                tokio::select! {
                    biased;
                    _ = signal.cancelled() => Err(SourceError::cancelled(url, "Fetch")),
                    result = self.send(url, req) => result,
                }
            }
            None => self.send(url, req).await,
        }
    }
}

/// Content-Type for a request body that has none configured.
fn body_content_type(body: &str) -> &'static str {
    match body.trim_start().chars().next() {
        Some('{') | Some('[') => "application/json",
        _ => "application/x-www-form-urlencoded",
    }
}

/// Decode body bytes using, in order: the explicit charset hint, the
/// Content-Type charset, then `chardetng` detection.
pub fn decode_body(body: &[u8], hint: Option<&'static Encoding>, content_type: Option<&str>) -> String {
    let declared = hint.or_else(|| {
        content_type
            .and_then(extract_charset)
            .and_then(|charset| Encoding::for_label(charset.as_bytes()))
    });
    if let Some(encoding) = declared {
        let (decoded, _, _) = encoding.decode(body);
        return decoded.into_owned();
    }

    let mut detector = chardetng::EncodingDetector::new();
    detector.feed(body, true);
    let encoding = detector.guess(None, true);
    let (decoded, _, _) = encoding.decode(body);
    decoded.into_owned()
}

/// Extract charset value from a Content-Type header.
fn extract_charset(content_type: &str) -> Option<String> {
    let lower = content_type.to_lowercase();
    for part in lower.split(';') {
        if let Some(charset) = part.trim().strip_prefix("charset=") {
            return Some(charset.trim_matches('"').trim_matches('\'').to_string());
        }
    }
    None
}
