// ABOUTME: Configuration options for the book-source engine and the fluent EngineBuilder.
// ABOUTME: Covers HTTP transport settings, default headers, search page size and the optional page cache.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::Engine;
use crate::resource::PageFetcher;

/// Default page size substituted for `pageSize` in search templates.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Configuration options for the engine.
#[derive(Clone)]
pub struct Options {
    pub timeout: Duration,
    pub user_agent: String,
    pub headers: BTreeMap<String, String>,
    pub page_size: u32,
    /// When set, fetched pages are cached for this long.
    pub cache_ttl: Option<Duration>,
    /// Maximum sources searched at once by `search_all`.
    pub concurrency: usize,
    pub http_client: Option<reqwest::Client>,
    /// Replaces the HTTP transport entirely.
    pub fetcher: Option<Arc<dyn PageFetcher>>,
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .field("headers", &self.headers)
            .field("page_size", &self.page_size)
            .field("cache_ttl", &self.cache_ttl)
            .field("concurrency", &self.concurrency)
            .field("http_client", &self.http_client.is_some())
            .field("fetcher", &self.fetcher.is_some())
            .finish()
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("digests-booksource/{}", env!("CARGO_PKG_VERSION")),
            headers: BTreeMap::new(),
            page_size: DEFAULT_PAGE_SIZE,
            cache_ttl: None,
            concurrency: 4,
            http_client: None,
            fetcher: None,
        }
    }
}

/// Builder for constructing Engine instances with custom configuration.
#[derive(Debug, Clone)]
pub struct EngineBuilder {
    opts: Options,
}

impl EngineBuilder {
    /// Create a new EngineBuilder with default options.
    pub fn new() -> Self {
        Self {
            opts: Options::default(),
        }
    }

    /// Set the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.opts.timeout = timeout;
        self
    }

    /// Set the User-Agent header.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.opts.user_agent = user_agent.into();
        self
    }

    /// Add a header to all requests.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.opts.headers.insert(key.into(), value.into());
        self
    }

    /// Set the `pageSize` search parameter. Zero is ignored.
    pub fn page_size(mut self, page_size: u32) -> Self {
        if page_size > 0 {
            self.opts.page_size = page_size;
        }
        self
    }

    /// Cache fetched pages for `ttl`.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.opts.cache_ttl = Some(ttl);
        self
    }

    /// Bound concurrent searches in `search_all`. Zero is treated as one.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.opts.concurrency = concurrency.max(1);
        self
    }

    /// Use a custom HTTP client.
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.opts.http_client = Some(client);
        self
    }

    /// Fetch pages through `fetcher` instead of HTTP.
    pub fn fetcher(mut self, fetcher: impl PageFetcher + 'static) -> Self {
        self.opts.fetcher = Some(Arc::new(fetcher));
        self
    }

    /// Build the Engine with the configured options.
    pub fn build(self) -> Engine {
        Engine::new(self.opts)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
