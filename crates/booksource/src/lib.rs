// ABOUTME: Main library entry point for the book-source rule engine.
// ABOUTME: Re-exports the public API: Engine, EngineBuilder, Source, SourceCollection, SourceError and result types.

//! digests-booksource - a rule engine for declarative audiobook sources.
//!
//! A book source describes, with a handful of rule strings, how to search a
//! site, list a book's chapters and find each chapter's audio URL. Rules mix
//! CSS selectors (including Legado's `class.x@tag.a@href` dialect), JSON
//! paths and regular expressions; this crate normalizes and evaluates them.
//!
//! # Example
//!
//! ```no_run
//! use digests_booksource::{normalize_source, Engine, SourceError};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), SourceError> {
//!     let source = normalize_source(
//!         &json!({
//!             "name": "Example",
//!             "baseUrl": "https://example.com",
//!             "searchUrl": "/search?q={{key}}",
//!             "searchList": "li.result",
//!             "searchName": "a@text",
//!             "searchNoteUrl": "a@href",
//!             "chapterList": "#toc a"
//!         }),
//!         None,
//!     )
//!     .expect("source has a name");
//!
//!     let engine = Engine::builder().build();
//!     let page = engine.search(&source, "dune", 1).await?;
//!     if let Some(book) = page.results.first() {
//!         let chapters = engine.get_chapters(&source, &book.book_url).await?;
//!         if let Some(first) = chapters.chapters.first() {
//!             println!("{}", engine.get_audio_url(&source, &first.chapter_url).await?);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod collection;
pub mod engine;
pub mod error;
pub mod extract;
pub mod options;
pub mod resource;
pub mod result;
pub mod rule;
pub mod source;
pub mod template;

pub use crate::collection::{ImportSummary, SourceCollection, Subscription};
pub use crate::engine::Engine;
pub use crate::error::{ErrorCode, SourceError};
pub use crate::extract::{extract, extract_list, Content, Extracted, ListItem};
pub use crate::options::{EngineBuilder, Options};
pub use crate::resource::{
    CachedFetcher, CancelSignal, FetchRequest, HttpFetcher, PageFetcher,
};
pub use crate::result::{
    Chapter, ChapterList, RefreshOutcome, SearchPage, SearchResult, SourceOutcome,
    SubscriptionOutcome, ValidationReport,
};
pub use crate::rule::{parse_rule, Extraction, Rule, RuleKind};
pub use crate::source::{normalize_source, SearchFieldRules, Source};
pub use crate::template::{resolve_template, split_url_config, TemplateParams, UrlOptions};
