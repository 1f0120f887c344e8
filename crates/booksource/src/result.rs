// ABOUTME: Result types returned by the engine: search hits, chapter lists, validation reports and batch outcomes.
// ABOUTME: All types serialize to camelCase JSON for hosts and the CLI.

use serde::{Deserialize, Serialize};

use crate::collection::{ImportSummary, Subscription};
use crate::error::SourceError;

/// One search hit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: String,
    pub source_id: String,
    pub source_name: String,
    pub title: String,
    pub cover: Option<String>,
    pub author: Option<String>,
    pub artist: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    /// Absolute URL of the book's chapter page; empty when none could be extracted.
    pub book_url: String,
}

impl SearchResult {
    pub fn has_cover(&self) -> bool {
        self.cover.as_ref().is_some_and(|c| !c.is_empty())
    }

    pub fn has_book_url(&self) -> bool {
        !self.book_url.is_empty()
    }
}

/// One page of search results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    pub total: usize,
    pub page: u32,
    pub results: Vec<SearchResult>,
}

impl SearchPage {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// One playable chapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    /// Position in the source's chapter list, counted before incomplete entries were dropped.
    pub index: usize,
    pub title: String,
    pub chapter_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterList {
    pub total: usize,
    pub chapters: Vec<Chapter>,
}

/// Outcome of [`crate::Engine::validate_source`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub has_search: bool,
    pub has_chapter: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationReport {
    pub(crate) fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Per-source outcome of [`crate::Engine::search_all`].
#[derive(Debug)]
pub struct SourceOutcome {
    pub source_id: String,
    pub source_name: String,
    pub result: Result<SearchPage, SourceError>,
}

impl SourceOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Outcome of [`crate::Engine::add_subscription`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionOutcome {
    pub subscription: Subscription,
    pub summary: ImportSummary,
    /// True when the URL was already subscribed and was refreshed instead.
    pub refreshed: bool,
}

/// Per-subscription outcome of [`crate::Engine::refresh_all_subscriptions`].
#[derive(Debug)]
pub struct RefreshOutcome {
    pub id: String,
    pub name: String,
    pub result: Result<ImportSummary, SourceError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_result_serializes_camel_case() {
        let r = SearchResult {
            id: "s-1-0".into(),
            source_id: "s".into(),
            title: "Hello".into(),
            book_url: "http://s/book/1".into(),
            ..Default::default()
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["bookUrl"], "http://s/book/1");
        assert_eq!(v["sourceId"], "s");
        assert!(r.has_book_url());
        assert!(!r.has_cover());
    }

    #[test]
    fn failed_report_omits_name() {
        let v = serde_json::to_value(ValidationReport::failed("boom")).unwrap();
        assert_eq!(v["valid"], false);
        assert_eq!(v["error"], "boom");
        assert!(v.get("name").is_none());
    }
}
