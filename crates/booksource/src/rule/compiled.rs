// ABOUTME: Pre-compiled CSS selector cache keyed by normalized selector text.
// ABOUTME: Rules are re-parsed on every use, so selector compilation is memoized here instead.

//! Selector caching for repeated DOM queries.
//!
//! Book sources evaluate the same handful of selectors for every list item
//! of every page. Parsing a selector costs more than matching it, so parsed
//! selectors (and parse failures) are cached process-wide.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use scraper::Selector;
use tracing::debug;

static SELECTOR_CACHE: Lazy<RwLock<HashMap<String, Option<Arc<Selector>>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Gets or compiles a CSS selector, caching the result.
///
/// Returns `None` for selectors scraper cannot parse; the failure is cached too.
pub fn get_or_compile(css: &str) -> Option<Arc<Selector>> {
    {
        let cache = SELECTOR_CACHE.read().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = cache.get(css) {
            return cached.clone();
        }
    }

    let compiled = match Selector::parse(css) {
        Ok(sel) => Some(Arc::new(sel)),
        Err(e) => {
            debug!(selector = css, error = %e, "invalid CSS selector");
            None
        }
    };
    let mut cache = SELECTOR_CACHE.write().unwrap_or_else(|e| e.into_inner());
    // Another thread may have inserted while we were compiling.
    if let Some(cached) = cache.get(css) {
        return cached.clone();
    }
    cache.insert(css.to_string(), compiled.clone());
    compiled
}
