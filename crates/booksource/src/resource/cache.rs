// ABOUTME: TTL page cache wrapping any PageFetcher.
// ABOUTME: Entries are keyed by method, resolved URL, body and response kind so differing requests never collide.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{FetchRequest, PageFetcher};
use crate::error::SourceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BodyKind {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    method: String,
    url: String,
    body: Option<String>,
    kind: BodyKind,
}

impl CacheKey {
    fn new(url: &str, req: &FetchRequest, kind: BodyKind) -> Self {
        Self {
            method: req.method.as_str().to_string(),
            url: url.to_string(),
            body: req.body.clone(),
            kind,
        }
    }
}

#[derive(Debug, Clone)]
enum CachedBody {
    Text(String),
    Json(Value),
}

/// Caches successful fetches of an inner [`PageFetcher`] for `ttl`.
///
/// Failures are never cached.
#[derive(Debug)]
pub struct CachedFetcher<F> {
    inner: F,
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, (Instant, CachedBody)>>,
}

impl<F: PageFetcher> CachedFetcher<F> {
    pub fn new(inner: F, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lookup(&self, key: &CacheKey) -> Option<CachedBody> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some((stored, body)) if stored.elapsed() < self.ttl => Some(body.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn store(&self, key: CacheKey, body: CachedBody) {
        let ttl = self.ttl;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, (t, _)| t.elapsed() < ttl);
        entries.insert(key, (Instant::now(), body));
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.values().filter(|(t, _)| t.elapsed() < self.ttl).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries. Every store also does this.
    pub fn purge_expired(&self) {
        let ttl = self.ttl;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, (t, _)| t.elapsed() < ttl);
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[async_trait]
impl<F: PageFetcher> PageFetcher for CachedFetcher<F> {
    async fn fetch_text(&self, url: &str, req: &FetchRequest) -> Result<String, SourceError> {
        let key = CacheKey::new(url, req, BodyKind::Text);
        if let Some(CachedBody::Text(text)) = self.lookup(&key) {
            debug!(url, "page cache hit");
            return Ok(text);
        }
        let text = self.inner.fetch_text(url, req).await?;
        self.store(key, CachedBody::Text(text.clone()));
        Ok(text)
    }

    async fn fetch_json(&self, url: &str, req: &FetchRequest) -> Result<Value, SourceError> {
        let key = CacheKey::new(url, req, BodyKind::Json);
        if let Some(CachedBody::Json(value)) = self.lookup(&key) {
            debug!(url, "page cache hit");
            return Ok(value);
        }
        let value = self.inner.fetch_json(url, req).await?;
        self.store(key, CachedBody::Json(value.clone()));
        Ok(value)
    }
}
