// ABOUTME: The Engine orchestrating search, chapter listing, audio URL resolution and source validation.
// ABOUTME: Also drives multi-source search and subscription import/refresh against a SourceCollection.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::Html;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::collection::{audio_only, source_list, ImportSummary, SourceCollection, Subscription};
use crate::error::SourceError;
use crate::extract::{
    extract, extract_json_list, extract_list, is_absolute_http, json_field, resolve_url, rule_problem,
    Content, ListItem,
};
use crate::options::{EngineBuilder, Options};
use crate::resource::{CachedFetcher, CancelSignal, FetchRequest, HttpFetcher, PageFetcher};
use crate::result::{
    Chapter, ChapterList, RefreshOutcome, SearchPage, SearchResult, SourceOutcome,
    SubscriptionOutcome, ValidationReport,
};
use crate::rule::compiled::get_or_compile;
use crate::rule::{parse_rule, Extraction, Rule, RuleKind};
use crate::source::Source;
use crate::template::{resolve_body, resolve_template, split_url_config, TemplateParams};

/// Elements probed first when a chapter page has no audio rule.
const AUDIO_ELEMENT_SELECTOR: &str = r#"audio source, audio[src], source[type*="audio"]"#;

/// Script patterns probed in order; capture group 1 is the candidate URL.
static SCRIPT_AUDIO_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#"(?i)["']?(https?://[^"'\s]+\.(?:mp3|m4a|aac|wav|ogg)[^"'\s]*)"#,
        r#"(?i)src\s*[:=]\s*["']?(https?://[^"'\s]+)"#,
        r#"(?i)url\s*[:=]\s*["']?(https?://[^"'\s]+)"#,
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

const AUDIO_HINTS: &[&str] = &[".mp3", ".m4a", ".aac", ".wav", ".ogg", "audio"];

/// Rule strings already reported as unusable.
static REPORTED_RULES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

const SUBSCRIPTION_ACCEPT: &str = "application/json,text/plain;q=0.9,*/*;q=0.8";

/// Runs book-source rules against remote pages.
///
/// Cheap to clone; clones share the transport and page cache.
#[derive(Clone)]
pub struct Engine {
    opts: Options,
    fetcher: Arc<dyn PageFetcher>,
    signal: Option<CancelSignal>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("opts", &self.opts)
            .field("signal", &self.signal)
            .finish()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Options::default())
    }
}

impl Engine {
    /// Create a new EngineBuilder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn new(opts: Options) -> Self {
        let transport: Arc<dyn PageFetcher> = match &opts.fetcher {
            Some(fetcher) => fetcher.clone(),
            None => Arc::new(HttpFetcher::from_options(&opts)),
        };
        let fetcher: Arc<dyn PageFetcher> = match opts.cache_ttl {
            Some(ttl) => Arc::new(CachedFetcher::new(transport, ttl)),
            None => transport,
        };
        Self {
            opts,
            fetcher,
            signal: None,
        }
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// An engine whose fetches abort when `signal` is cancelled.
    pub fn with_signal(&self, signal: CancelSignal) -> Self {
        Self {
            signal: Some(signal),
            ..self.clone()
        }
    }

    fn request(&self, req: FetchRequest) -> FetchRequest {
        req.with_signal(self.signal.clone())
    }

    /// Search `source` for `keyword`.
    ///
    /// Configuration problems are reported before any fetch. Items without a
    /// title are dropped; only fetch and response-type failures are errors.
    pub async fn search(
        &self,
        source: &Source,
        keyword: &str,
        page: u32,
    ) -> Result<SearchPage, SourceError> {
        let template = source
            .search_url_template
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                SourceError::invalid_config(
                    &source.id,
                    "Search",
                    Some(anyhow::anyhow!("source has no search URL template")),
                )
            })?;

        let (url_template, url_options) = split_url_config(template);
        let params = TemplateParams::search(keyword, page, self.opts.page_size)
            .with_encoding(url_options.encoding());
        let url = resolve_url(&source.base_url, &resolve_template(&url_template, &params));
        if !is_absolute_http(&url) {
            return Err(SourceError::invalid_url(
                &url,
                "Search",
                Some(anyhow::anyhow!("search URL does not resolve to http(s)")),
            ));
        }

        let list_rule = parse_rule(source.search_list_rule.as_deref().unwrap_or(""));
        let fields = &source.search_field_rules;
        report_rule_problems(
            source,
            &url,
            [
                source.search_list_rule.as_deref(),
                fields.name.as_deref(),
                fields.cover.as_deref(),
                fields.author.as_deref(),
                fields.artist.as_deref(),
                fields.intro.as_deref(),
                fields.kind.as_deref(),
                fields.book_url.as_deref(),
            ],
        );
        let expects_json =
            url_template.contains(".json") || url_options.is_post() || list_rule.is_json_path();
        let body = url_options.body.as_deref().map(|b| resolve_body(b, &params));
        let req = self.request(FetchRequest::from_url_options(&url_options, body));

        debug!(source = %source.label(), url = %url, json = expects_json, "searching");
        let results = if expects_json {
            let payload = self
                .fetcher
                .fetch_json(&url, &req)
                .await
                .map_err(|e| e.with_op("Search"))?;
            json_search_results(source, &payload, &list_rule, &url, page)
        } else {
            let text = self
                .fetcher
                .fetch_text(&url, &req)
                .await
                .map_err(|e| e.with_op("Search"))?;
            html_search_results(source, &text, &list_rule, &url, page)
        };

        if results.is_empty() {
            debug!(source = %source.label(), url = %url, rule = %list_rule.raw, "search matched nothing");
        }
        Ok(SearchPage {
            total: results.len(),
            page,
            results,
        })
    }

    /// Search every enabled source that has a search template, a bounded number at a time.
    ///
    /// Never fails as a whole; outcomes are returned in input order.
    pub async fn search_all<'a>(
        &self,
        sources: impl IntoIterator<Item = &'a Source>,
        keyword: &str,
        page: u32,
    ) -> Vec<SourceOutcome> {
        let searchable: Vec<(usize, &Source)> = sources
            .into_iter()
            .filter(|s| s.enabled && s.has_search())
            .enumerate()
            .collect();

        let mut outcomes: Vec<(usize, SourceOutcome)> = stream::iter(searchable)
            .map(|(i, source)| async move {
                let result = self.search(source, keyword, page).await;
                if let Err(e) = &result {
                    warn!(source = %source.label(), error = %e, "source search failed");
                }
                (
                    i,
                    SourceOutcome {
                        source_id: source.id.clone(),
                        source_name: source.name.clone(),
                        result,
                    },
                )
            })
            .buffer_unordered(self.opts.concurrency.max(1))
            .collect()
            .await;

        outcomes.sort_by_key(|(i, _)| *i);
        outcomes.into_iter().map(|(_, o)| o).collect()
    }

    /// List the chapters of the book at `book_url`.
    pub async fn get_chapters(
        &self,
        source: &Source,
        book_url: &str,
    ) -> Result<ChapterList, SourceError> {
        let list_raw = source
            .chapter_list_rule
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| {
                SourceError::invalid_config(
                    &source.id,
                    "GetChapters",
                    Some(anyhow::anyhow!("source has no chapter list rule")),
                )
            })?;
        require_absolute(book_url, "GetChapters")?;

        let list_rule = parse_rule(list_raw);
        report_rule_problems(
            source,
            book_url,
            [
                Some(list_raw),
                source.chapter_name_rule.as_deref(),
                source.chapter_url_rule.as_deref(),
            ],
        );
        let req = self.request(FetchRequest::get());
        let chapters = if list_rule.is_json_path() {
            let payload = self
                .fetcher
                .fetch_json(book_url, &req)
                .await
                .map_err(|e| e.with_op("GetChapters"))?;
            json_chapters(source, &payload, &list_rule, book_url)
        } else {
            let text = self
                .fetcher
                .fetch_text(book_url, &req)
                .await
                .map_err(|e| e.with_op("GetChapters"))?;
            html_chapters(source, &text, &list_rule, book_url)
        };

        debug!(source = %source.label(), url = book_url, count = chapters.len(), "listed chapters");
        Ok(ChapterList {
            total: chapters.len(),
            chapters,
        })
    }

    /// Resolve the playable audio URL of the chapter at `chapter_url`.
    ///
    /// Uses the source's audio rule when configured, otherwise scans the page
    /// for audio elements and then script text.
    pub async fn get_audio_url(
        &self,
        source: &Source,
        chapter_url: &str,
    ) -> Result<String, SourceError> {
        require_absolute(chapter_url, "GetAudioUrl")?;
        let rule = parse_rule(source.audio_url_rule.as_deref().unwrap_or(""));
        report_rule_problems(source, chapter_url, [source.audio_url_rule.as_deref()]);
        let req = self.request(FetchRequest::get());

        if rule.is_json_path() {
            let payload = self
                .fetcher
                .fetch_json(chapter_url, &req)
                .await
                .map_err(|e| e.with_op("GetAudioUrl"))?;
            return extract(Content::Json(&payload), &rule, chapter_url)
                .and_then(|v| v.first().map(|u| resolve_url(chapter_url, u)))
                .filter(|u| !u.is_empty())
                .ok_or_else(|| rule_matched_nothing(source, chapter_url, &rule));
        }

        let text = self
            .fetcher
            .fetch_text(chapter_url, &req)
            .await
            .map_err(|e| e.with_op("GetAudioUrl"))?;

        if rule.is_none() {
            return scan_for_audio(&text, chapter_url).ok_or_else(|| {
                SourceError::no_audio(
                    chapter_url,
                    "GetAudioUrl",
                    Some(anyhow::anyhow!("no audio rule configured and no audio found on page")),
                )
            });
        }

        extract_audio_from_html(&text, &rule, chapter_url)
            .ok_or_else(|| rule_matched_nothing(source, chapter_url, &rule))
    }

    /// Check that the source's base URL is reachable and report which capabilities it configures.
    ///
    /// Never fails; problems are reported in the returned value.
    pub async fn validate_source(&self, source: &Source) -> ValidationReport {
        if source.base_url.trim().is_empty() {
            return ValidationReport::failed("source has no base URL");
        }
        let req = self.request(FetchRequest::get());
        match self.fetcher.fetch_text(&source.base_url, &req).await {
            Ok(_) => ValidationReport {
                valid: true,
                has_search: source.has_search(),
                has_chapter: source.has_chapter(),
                name: Some(source.name.clone()),
                error: None,
            },
            Err(e) => {
                warn!(source = %source.label(), error = %e, "source validation failed");
                ValidationReport::failed(e.to_string())
            }
        }
    }

    async fn fetch_source_list(&self, url: &str) -> Result<Vec<Value>, SourceError> {
        let mut req = FetchRequest::get();
        req.headers.insert("Accept".to_string(), SUBSCRIPTION_ACCEPT.to_string());
        let payload = self
            .fetcher
            .fetch_json(url, &self.request(req))
            .await
            .map_err(|e| e.with_op("FetchSubscription"))?;
        Ok(audio_only(source_list(payload)))
    }

    /// Subscribe to a remote source list and import its audio sources.
    ///
    /// A URL that is already subscribed is refreshed (with sync-delete)
    /// instead. A failed first import leaves no subscription behind.
    pub async fn add_subscription(
        &self,
        collection: &mut SourceCollection,
        url: &str,
        name: Option<&str>,
    ) -> Result<SubscriptionOutcome, SourceError> {
        let url = url.trim();
        url::Url::parse(url).map_err(|e| {
            SourceError::invalid_url(url, "AddSubscription", Some(anyhow::Error::new(e)))
        })?;

        if let Some(existing) = collection.subscription_by_url(url) {
            let id = existing.id.clone();
            let summary = self.refresh_subscription(collection, &id).await?;
            let subscription = collection.subscription_mut(&id).map(|sub| {
                sub.enabled = true;
                if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
                    sub.name = name.to_string();
                }
                sub.clone()
            });
            return match subscription {
                Some(subscription) => Ok(SubscriptionOutcome {
                    subscription,
                    summary,
                    refreshed: true,
                }),
                None => Err(unknown_subscription(&id, "AddSubscription")),
            };
        }

        let list = self.fetch_source_list(url).await?;
        let id = collection.next_subscription_id();
        let name = name
            .filter(|n| !n.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Subscription {}", collection.subscriptions().len() + 1));

        let summary = collection.import_list(list, Some(&id), false)?;
        let mut subscription = Subscription::new(id, url, name);
        subscription.source_count = summary.total;
        subscription.last_updated = Some(chrono::Utc::now());
        collection.insert_subscription(subscription.clone());

        info!(subscription = %subscription.id, url, sources = summary.total, "added subscription");
        Ok(SubscriptionOutcome {
            subscription,
            summary,
            refreshed: false,
        })
    }

    /// Re-fetch a subscription and sync its sources, deleting ones the remote list dropped.
    pub async fn refresh_subscription(
        &self,
        collection: &mut SourceCollection,
        id: &str,
    ) -> Result<ImportSummary, SourceError> {
        let url = collection
            .subscription(id)
            .map(|s| s.url.clone())
            .ok_or_else(|| unknown_subscription(id, "RefreshSubscription"))?;

        let list = self.fetch_source_list(&url).await?;
        let summary = collection.import_list(list, Some(id), true)?;
        if let Some(sub) = collection.subscription_mut(id) {
            sub.last_updated = Some(chrono::Utc::now());
            sub.source_count = summary.total;
        }
        Ok(summary)
    }

    /// Refresh every enabled subscription, one at a time, collecting per-subscription outcomes.
    pub async fn refresh_all_subscriptions(
        &self,
        collection: &mut SourceCollection,
    ) -> Vec<RefreshOutcome> {
        let targets: Vec<(String, String)> = collection
            .subscriptions()
            .iter()
            .filter(|s| s.enabled)
            .map(|s| (s.id.clone(), s.name.clone()))
            .collect();

        let mut outcomes = Vec::with_capacity(targets.len());
        for (id, name) in targets {
            let result = self.refresh_subscription(collection, &id).await;
            if let Err(e) = &result {
                warn!(subscription = %id, error = %e, "subscription refresh failed");
            }
            outcomes.push(RefreshOutcome { id, name, result });
        }
        outcomes
    }
}

fn require_absolute(url: &str, op: &str) -> Result<(), SourceError> {
    if is_absolute_http(url.trim()) {
        Ok(())
    } else {
        Err(SourceError::invalid_url(
            url,
            op,
            Some(anyhow::anyhow!("expected an absolute http(s) URL")),
        ))
    }
}

/// Warn, once per rule string, about configured rules that can never match.
fn report_rule_problems<'a>(
    source: &Source,
    url: &str,
    rules: impl IntoIterator<Item = Option<&'a str>>,
) {
    for raw in rules.into_iter().flatten() {
        let rule = parse_rule(raw);
        let Some(problem) = rule_problem(&rule) else {
            continue;
        };
        if first_report(&rule.raw) {
            warn!(
                source = %source.label(),
                url,
                rule = %rule.raw.chars().take(80).collect::<String>(),
                problem = %problem,
                "rule cannot be evaluated; extraction skipped"
            );
        }
    }
}

fn first_report(raw: &str) -> bool {
    REPORTED_RULES
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(raw.to_string())
}

fn unknown_subscription(id: &str, op: &str) -> SourceError {
    SourceError::invalid_config(id, op, Some(anyhow::anyhow!("unknown subscription")))
}

fn rule_matched_nothing(source: &Source, url: &str, rule: &Rule) -> SourceError {
    warn!(source = %source.label(), url, rule = %rule.raw, "audio rule matched nothing");
    SourceError::no_audio(
        url,
        "GetAudioUrl",
        Some(anyhow::anyhow!("audio rule {:?} matched nothing", rule.raw)),
    )
}

fn first_non_empty(candidates: impl IntoIterator<Item = Option<String>>) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .find(|v| !v.trim().is_empty())
}

/// Read a field from a JSON item by rule, falling back to common property names.
fn json_item_field(item: &Value, rule: Option<&str>, fallbacks: &[&str]) -> Option<String> {
    let by_rule = rule.and_then(|r| json_field(item, r));
    first_non_empty(std::iter::once(by_rule).chain(fallbacks.iter().map(|k| json_field(item, k))))
}

fn finish_result(source: &Source, mut result: SearchResult) -> SearchResult {
    if let Some(cover) = result.cover.take() {
        result.cover = Some(resolve_url(&source.base_url, &cover));
    }
    if !result.book_url.is_empty() && !is_absolute_http(&result.book_url) {
        result.book_url = resolve_url(&source.base_url, &result.book_url);
    }
    result
}

fn result_stub(source: &Source, page: u32, index: usize) -> SearchResult {
    SearchResult {
        id: format!("{}-{}-{}", source.id, page, index),
        source_id: source.id.clone(),
        source_name: source.name.clone(),
        ..Default::default()
    }
}

fn json_search_results(
    source: &Source,
    payload: &Value,
    list_rule: &Rule,
    page_url: &str,
    page: u32,
) -> Vec<SearchResult> {
    let items = match (list_rule.kind, payload) {
        (RuleKind::None, Value::Array(items)) => items.clone(),
        (RuleKind::None, _) => Vec::new(),
        _ => extract_json_list(payload, list_rule),
    };
    let rules = &source.search_field_rules;

    items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| {
            let mut result = result_stub(source, page, index);
            match item {
                Value::String(s) => {
                    result.title = s.trim().to_string();
                    result.book_url = s.trim().to_string();
                }
                Value::Object(_) => {
                    result.title =
                        json_item_field(item, rules.name.as_deref(), &["name", "title"]).unwrap_or_default();
                    result.cover = json_item_field(item, rules.cover.as_deref(), &["cover", "coverUrl"]);
                    result.author = json_item_field(item, rules.author.as_deref(), &["author"]);
                    result.artist = json_item_field(item, rules.artist.as_deref(), &["artist"]);
                    result.description =
                        json_item_field(item, rules.intro.as_deref(), &["intro", "description"]);
                    result.book_url = json_item_field(item, rules.book_url.as_deref(), &["bookUrl", "noteUrl"])
                        .unwrap_or_default();
                    result.category = json_item_field(item, rules.kind.as_deref(), &["kind", "category"]);
                }
                _ => {
                    debug!(
                        source = %source.label(),
                        url = page_url,
                        rule = %list_rule.raw,
                        index,
                        "skipping non-object search item"
                    );
                    return None;
                }
            }
            if result.title.is_empty() {
                debug!(
                    source = %source.label(),
                    url = page_url,
                    rule = rules.name.as_deref().unwrap_or(""),
                    index,
                    "skipping search item without title"
                );
                return None;
            }
            Some(finish_result(source, result))
        })
        .collect()
}

fn item_field(item: &ListItem<'_>, rule: Option<&str>) -> Option<String> {
    rule.map(parse_rule).and_then(|r| item.field(&r))
}

fn html_search_results(
    source: &Source,
    html: &str,
    list_rule: &Rule,
    page_url: &str,
    page: u32,
) -> Vec<SearchResult> {
    let doc = Html::parse_document(html);
    let items = extract_list(&doc, list_rule, page_url);
    let rules = &source.search_field_rules;

    items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| {
            let mut result = result_stub(source, page, index);
            result.title = item_field(item, rules.name.as_deref()).unwrap_or_default();
            if result.title.is_empty() {
                debug!(
                    source = %source.label(),
                    url = page_url,
                    rule = rules.name.as_deref().unwrap_or(""),
                    index,
                    "skipping search item without title"
                );
                return None;
            }
            result.cover = item_field(item, rules.cover.as_deref());
            result.author = item_field(item, rules.author.as_deref());
            result.artist = item_field(item, rules.artist.as_deref());
            result.description = item_field(item, rules.intro.as_deref());
            result.category = item_field(item, rules.kind.as_deref());
            result.book_url = item_field(item, rules.book_url.as_deref()).unwrap_or_default();
            Some(finish_result(source, result))
        })
        .collect()
}

/// Chapter URL rule for HTML items. A bare selector reads `href`; no rule reads the item's own `href`.
fn chapter_url_rule(raw: Option<&str>) -> Rule {
    let mut rule = parse_rule(raw.unwrap_or("@attr:href"));
    if rule.is_none() {
        rule = parse_rule("@attr:href");
    }
    if rule.kind == RuleKind::Css && rule.extraction.is_none() {
        rule.extraction = Some(Extraction::Attr("href".to_string()));
    }
    rule
}

fn html_chapters(source: &Source, html: &str, list_rule: &Rule, book_url: &str) -> Vec<Chapter> {
    let doc = Html::parse_document(html);
    let items = extract_list(&doc, list_rule, book_url);
    let name_rule = parse_rule(source.chapter_name_rule.as_deref().unwrap_or("@text"));
    let url_rule = chapter_url_rule(source.chapter_url_rule.as_deref());
    let url_text_rule = Rule {
        extraction: Some(Extraction::Text),
        ..url_rule.clone()
    };

    items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| {
            let title = item.field(&name_rule).unwrap_or_else(|| item.text());
            let url = item
                .field(&url_rule)
                .or_else(|| (url_rule.kind == RuleKind::Css).then(|| item.field(&url_text_rule)).flatten())
                .map(|u| resolve_url(book_url, &u))
                .unwrap_or_default();
            if title.is_empty() || url.is_empty() {
                debug!(
                    source = %source.label(),
                    url = book_url,
                    rule = %list_rule.raw,
                    index,
                    "skipping incomplete chapter"
                );
                return None;
            }
            Some(Chapter {
                index,
                title,
                chapter_url: url,
            })
        })
        .collect()
}

fn json_chapters(source: &Source, payload: &Value, list_rule: &Rule, book_url: &str) -> Vec<Chapter> {
    let name_rule = source.chapter_name_rule.as_deref();
    let url_rule = source.chapter_url_rule.as_deref();

    extract_json_list(payload, list_rule)
        .iter()
        .enumerate()
        .filter_map(|(index, item)| {
            let title = json_item_field(item, name_rule, &["name", "title", "chapterName"]);
            let url = json_item_field(item, url_rule, &["url", "chapterUrl", "href"])
                .map(|u| resolve_url(book_url, &u))
                .filter(|u| !u.is_empty());
            match (title, url) {
                (Some(title), Some(chapter_url)) => Some(Chapter {
                    index,
                    title,
                    chapter_url,
                }),
                _ => {
                    debug!(
                        source = %source.label(),
                        url = book_url,
                        rule = %list_rule.raw,
                        index,
                        "skipping incomplete chapter"
                    );
                    None
                }
            }
        })
        .collect()
}

fn extract_audio_from_html(html: &str, rule: &Rule, page_url: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    extract(Content::Html { doc: &doc, raw: html }, rule, page_url)
        .and_then(|v| v.first().map(|u| resolve_url(page_url, u)))
        .filter(|u| !u.is_empty())
}

/// Find an audio URL on a page without a rule: audio elements first, then script text.
fn scan_for_audio(html: &str, page_url: &str) -> Option<String> {
    let doc = Html::parse_document(html);

    if let Some(sel) = get_or_compile(AUDIO_ELEMENT_SELECTOR) {
        let found = doc
            .select(&sel)
            .filter_map(|el| el.value().attr("src"))
            .map(str::trim)
            .find(|src| !src.is_empty());
        if let Some(src) = found {
            debug!(url = page_url, "audio found in media element");
            return Some(resolve_url(page_url, src));
        }
    }

    let script_sel = get_or_compile("script")?;
    for script in doc.select(&script_sel) {
        let text: String = script.text().collect();
        for pattern in SCRIPT_AUDIO_PATTERNS.iter() {
            let Some(candidate) = pattern.captures(&text).and_then(|c| c.get(1)) else {
                continue;
            };
            let url = candidate.as_str();
            let lower = url.to_lowercase();
            if AUDIO_HINTS.iter().any(|hint| lower.contains(hint)) {
                debug!(url = page_url, "audio found in script text");
                return Some(url.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves canned bodies by URL and records every request.
    #[derive(Default)]
    struct StaticFetcher {
        pages: HashMap<String, String>,
        calls: Mutex<Vec<String>>,
    }

    impl StaticFetcher {
        fn with(mut self, url: &str, body: &str) -> Self {
            self.pages.insert(url.to_string(), body.to_string());
            self
        }
    }

    #[async_trait]
    impl PageFetcher for StaticFetcher {
        async fn fetch_text(&self, url: &str, _req: &FetchRequest) -> Result<String, SourceError> {
            self.calls.lock().unwrap().push(url.to_string());
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| SourceError::fetch(url, "Fetch", Some(anyhow::anyhow!("HTTP status 404"))))
        }
    }

    fn engine(fetcher: StaticFetcher) -> (Engine, Arc<StaticFetcher>) {
        let fetcher = Arc::new(fetcher);
        let engine = Engine::builder().fetcher(fetcher.clone()).build();
        (engine, fetcher)
    }

    fn source(v: Value) -> Source {
        crate::source::normalize_source(&v, None).unwrap()
    }

    #[tokio::test]
    async fn search_without_template_never_fetches() {
        let (engine, fetcher) = engine(StaticFetcher::default());
        let s = source(json!({"name": "X", "baseUrl": "http://s"}));
        let err = engine.search(&s, "abc", 1).await.unwrap_err();
        assert!(err.is_invalid_config());
        assert!(fetcher.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn html_search_end_to_end() {
        let (engine, fetcher) = engine(StaticFetcher::default().with(
            "http://s/s?kw=abc",
            r#"<ul><li class="r"><a href="/book/1">Hello</a></li><li class="r"><a href="/book/2"></a></li></ul>"#,
        ));
        let s = source(json!({
            "id": "src",
            "name": "S",
            "baseUrl": "http://s",
            "searchUrlTemplate": "/s?kw={{key}},{'method':'GET'}",
            "searchListRule": "li.r",
            "searchFieldRules": {"name": "a@text", "bookUrl": "a@attr:href"}
        }));
        let page = engine.search(&s, "abc", 1).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.results[0].title, "Hello");
        assert_eq!(page.results[0].book_url, "http://s/book/1");
        assert_eq!(page.results[0].id, "src-1-0");
        assert_eq!(fetcher.calls.lock().unwrap().as_slice(), ["http://s/s?kw=abc"]);
    }

    #[tokio::test]
    async fn json_search_with_fallback_fields() {
        let (engine, _) = engine(StaticFetcher::default().with(
            "http://api/search.json?q=x&size=20",
            r#"{"data": {"list": [
                {"title": "A", "coverUrl": "/c/a.jpg", "noteUrl": "/b/a", "author": "Au"},
                {"name": "", "title": ""},
                "http://api/b/raw"
            ]}}"#,
        ));
        let s = source(json!({
            "name": "Api",
            "baseUrl": "http://api",
            "searchUrl": "/search.json?q={{key}}&size={{pageSize}}",
            "searchList": "$.data.list"
        }));
        let page = engine.search(&s, "x", 1).await.unwrap();
        assert_eq!(page.total, 2);
        let a = &page.results[0];
        assert_eq!(a.title, "A");
        assert_eq!(a.cover.as_deref(), Some("http://api/c/a.jpg"));
        assert_eq!(a.book_url, "http://api/b/a");
        assert_eq!(a.author.as_deref(), Some("Au"));
        assert_eq!(page.results[1].book_url, "http://api/b/raw");
    }

    #[tokio::test]
    async fn json_search_rejects_html_payload() {
        let (engine, _) = engine(
            StaticFetcher::default().with("http://api/s.json", "<html>blocked</html>"),
        );
        let s = source(json!({"name": "Api", "baseUrl": "http://api", "searchUrl": "/s.json"}));
        assert!(engine.search(&s, "x", 1).await.unwrap_err().is_content_type());
    }

    #[tokio::test]
    async fn chapters_from_html() {
        let (engine, _) = engine(StaticFetcher::default().with(
            "http://s/book/1",
            r#"<div id="toc">
                <a href="c1.html">Chapter 1</a>
                <a href="/c2.html">Chapter 2</a>
                <a>No link</a>
            </div>"#,
        ));
        let s = source(json!({"name": "S", "chapterList": "id.toc@tag.a"}));
        let list = engine.get_chapters(&s, "http://s/book/1").await.unwrap();
        assert_eq!(list.total, 2);
        assert_eq!(list.chapters[0].chapter_url, "http://s/book/c1.html");
        assert_eq!(list.chapters[1].title, "Chapter 2");
        assert_eq!(list.chapters[1].chapter_url, "http://s/c2.html");
        assert_eq!(list.chapters[1].index, 1);
    }

    #[tokio::test]
    async fn chapters_with_nested_rules() {
        let (engine, _) = engine(StaticFetcher::default().with(
            "http://s/book/1",
            r#"<ul><li class="ch"><span>One</span><a href="/p/1">play</a></li>
                   <li class="ch"><span>Two</span><a href="/p/2">play</a></li></ul>"#,
        ));
        let s = source(json!({
            "name": "S",
            "ruleToc": {"chapterList": "li.ch", "chapterName": "span@text", "chapterUrl": "a"}
        }));
        let list = engine.get_chapters(&s, "http://s/book/1").await.unwrap();
        assert_eq!(
            list.chapters,
            vec![
                Chapter { index: 0, title: "One".into(), chapter_url: "http://s/p/1".into() },
                Chapter { index: 1, title: "Two".into(), chapter_url: "http://s/p/2".into() },
            ]
        );
    }

    #[tokio::test]
    async fn chapters_from_json() {
        let (engine, _) = engine(StaticFetcher::default().with(
            "http://api/book/1",
            r#"{"chapters": [{"chapterName": "A", "url": "/a.mp3"}, {"title": "B"}]}"#,
        ));
        let s = source(json!({"name": "S", "chapterList": "$.chapters"}));
        let list = engine.get_chapters(&s, "http://api/book/1").await.unwrap();
        assert_eq!(list.total, 1);
        assert_eq!(list.chapters[0].chapter_url, "http://api/a.mp3");
    }

    #[tokio::test]
    async fn chapters_require_rule_before_fetch() {
        let (engine, fetcher) = engine(StaticFetcher::default());
        let s = source(json!({"name": "S"}));
        assert!(engine.get_chapters(&s, "http://s/b").await.unwrap_err().is_invalid_config());
        let s = source(json!({"name": "S", "chapterList": "li"}));
        assert!(engine.get_chapters(&s, "").await.unwrap_err().is_invalid_url());
        assert!(fetcher.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn audio_heuristics_in_order() {
        let (engine, _) = engine(
            StaticFetcher::default()
                .with("http://s/c/1", r#"<audio src="http://cdn/x.mp3"></audio>"#)
                .with(
                    "http://s/c/2",
                    r#"<script>var src = "http://cdn/y.mp3";</script>"#,
                )
                .with("http://s/c/3", r#"<audio><source src="/media/z.m4a"></audio>"#)
                .with("http://s/c/4", r#"<script>var url = "http://cdn/page.html";</script>"#),
        );
        let s = source(json!({"name": "S"}));
        assert_eq!(engine.get_audio_url(&s, "http://s/c/1").await.unwrap(), "http://cdn/x.mp3");
        assert_eq!(engine.get_audio_url(&s, "http://s/c/2").await.unwrap(), "http://cdn/y.mp3");
        assert_eq!(engine.get_audio_url(&s, "http://s/c/3").await.unwrap(), "http://s/media/z.m4a");
        assert!(engine.get_audio_url(&s, "http://s/c/4").await.unwrap_err().is_no_audio());
    }

    #[tokio::test]
    async fn audio_rule_extraction() {
        let (engine, _) = engine(
            StaticFetcher::default()
                .with("http://s/c/1", r#"<div id="player" data-src="/a/1.mp3"></div>"#)
                .with("http://s/c/2", r#"{"data": {"url": "http://cdn/2.mp3"}}"#),
        );
        let rule_source = source(json!({"name": "S", "audioUrlRule": "id.player@data-src"}));
        assert_eq!(
            engine.get_audio_url(&rule_source, "http://s/c/1").await.unwrap(),
            "http://s/a/1.mp3"
        );
        let json_source = source(json!({"name": "S", "ruleContent": {"content": "$.data.url"}}));
        assert_eq!(
            engine.get_audio_url(&json_source, "http://s/c/2").await.unwrap(),
            "http://cdn/2.mp3"
        );
        let miss = source(json!({"name": "S", "audioUrlRule": "div.none@src"}));
        assert!(engine.get_audio_url(&miss, "http://s/c/1").await.unwrap_err().is_no_audio());
    }

    #[tokio::test]
    async fn validate_reports_without_failing() {
        let (engine, _) = engine(StaticFetcher::default().with("http://ok", "<html></html>"));
        let ok = engine
            .validate_source(&source(json!({"name": "Ok", "baseUrl": "http://ok", "searchUrl": "/s"})))
            .await;
        assert_eq!(
            ok,
            ValidationReport {
                valid: true,
                has_search: true,
                has_chapter: false,
                name: Some("Ok".into()),
                error: None
            }
        );

        let down = engine
            .validate_source(&source(json!({"name": "Down", "baseUrl": "http://down"})))
            .await;
        assert!(!down.valid);
        assert!(down.error.unwrap().contains("fetch failed"));

        let no_url = engine.validate_source(&source(json!({"name": "None"}))).await;
        assert!(!no_url.valid);
    }

    #[tokio::test]
    async fn search_all_reports_each_source() {
        let (engine, _) = engine(
            StaticFetcher::default().with("http://a/s?q=k", r#"<li class="r"><a href="/1">A1</a></li>"#),
        );
        let good = source(json!({
            "id": "a", "name": "A", "baseUrl": "http://a", "searchUrl": "/s?q={{key}}",
            "searchList": "li.r", "searchName": "a@text", "searchNoteUrl": "a@href"
        }));
        let bad = source(json!({"id": "b", "name": "B", "baseUrl": "http://b", "searchUrl": "/s?q={{key}}"}));
        let disabled = source(json!({"id": "c", "name": "C", "searchUrl": "/s", "enabled": false}));
        let no_search = source(json!({"id": "d", "name": "D"}));

        let outcomes = engine.search_all([&good, &bad, &disabled, &no_search], "k", 1).await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].source_id, "a");
        assert_eq!(outcomes[0].result.as_ref().unwrap().results[0].book_url, "http://a/1");
        assert!(outcomes[1].result.as_ref().unwrap_err().is_fetch());
    }

    #[tokio::test]
    async fn subscriptions_import_and_sync() {
        let list_v1 = json!([
            {"bookSourceName": "Audio 1", "bookSourceUrl": "http://a1", "bookSourceType": 1},
            {"bookSourceName": "Audio 2", "bookSourceUrl": "http://a2", "bookSourceType": 1},
            {"bookSourceName": "Text", "bookSourceUrl": "http://t", "bookSourceType": 0}
        ]);
        let (engine, _) = engine(
            StaticFetcher::default().with("http://subs/list.json", &list_v1.to_string()),
        );
        let mut c = SourceCollection::new();
        let outcome = engine
            .add_subscription(&mut c, "http://subs/list.json", Some("Mine"))
            .await
            .unwrap();
        assert!(!outcome.refreshed);
        assert_eq!(outcome.subscription.name, "Mine");
        assert_eq!(outcome.subscription.source_count, 2);
        assert!(c.get("http://t").is_none());

        let list_v2 = json!([{"bookSourceName": "Audio 2b", "bookSourceUrl": "http://a2", "bookSourceType": 1}]);
        let (engine, _) = self::engine(
            StaticFetcher::default().with("http://subs/list.json", &list_v2.to_string()),
        );
        let again = engine
            .add_subscription(&mut c, "http://subs/list.json", None)
            .await
            .unwrap();
        assert!(again.refreshed);
        assert_eq!(again.summary.deleted, 1);
        assert_eq!(c.len(), 1);
        assert_eq!(c.get("http://a2").unwrap().name, "Audio 2b");
        assert_eq!(c.subscriptions()[0].source_count, 1);
        assert_eq!(c.subscriptions()[0].name, "Mine");
    }

    #[tokio::test]
    async fn failed_first_import_leaves_no_subscription() {
        let (engine, _) = engine(StaticFetcher::default().with("http://subs/bad.json", r#"[{"x": 1}]"#));
        let mut c = SourceCollection::new();
        let err = engine
            .add_subscription(&mut c, "http://subs/bad.json", None)
            .await
            .unwrap_err();
        assert!(err.is_invalid_config());
        assert!(c.subscriptions().is_empty());

        let err = engine.add_subscription(&mut c, "not a url", None).await.unwrap_err();
        assert!(err.is_invalid_url());
    }

    #[tokio::test]
    async fn refresh_all_collects_failures() {
        let (engine, _) = engine(
            StaticFetcher::default().with("http://subs/a.json", r#"[{"name": "A", "id": "a"}]"#),
        );
        let mut c = SourceCollection::new();
        engine.add_subscription(&mut c, "http://subs/a.json", None).await.unwrap();
        c.insert_subscription(Subscription::new("gone", "http://subs/gone.json", "Gone"));

        let outcomes = engine.refresh_all_subscriptions(&mut c).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[1].result.as_ref().unwrap_err().is_fetch());
        assert!(engine.refresh_subscription(&mut c, "missing").await.unwrap_err().is_invalid_config());
    }

    #[tokio::test]
    async fn cancelled_engine_fails_fast() {
        let server = httpmock::MockServer::start();
        let mock = server.mock(|when, then| {
            when.path("/");
            then.status(200).body("ok");
        });
        let signal = CancelSignal::new();
        signal.cancel();
        let engine = Engine::default().with_signal(signal);
        let report = engine
            .validate_source(&source(json!({"name": "S", "baseUrl": server.url("/")})))
            .await;
        assert!(!report.valid);
        assert!(report.error.unwrap().contains("cancelled"));
        assert_eq!(mock.calls(), 0);
    }

    #[test]
    fn chapter_url_rule_defaults() {
        assert_eq!(chapter_url_rule(None).extraction, Some(Extraction::Attr("href".into())));
        assert_eq!(chapter_url_rule(Some("a")).extraction, Some(Extraction::Attr("href".into())));
        assert_eq!(chapter_url_rule(Some("a@data-url")).extraction, Some(Extraction::Attr("data-url".into())));
    }

    #[tokio::test]
    async fn errors_name_the_failing_operation() {
        let (engine, _) = engine(StaticFetcher::default());
        let s = source(json!({"name": "X", "baseUrl": "http://s"}));
        let err = engine.get_chapters(&s, "http://s/book").await.unwrap_err();
        assert_eq!(err.op, "GetChapters");
        let err = engine.get_audio_url(&s, "/relative").await.unwrap_err();
        assert_eq!(err.op, "GetAudioUrl");
    }

    #[tokio::test]
    async fn unusable_field_rules_do_not_break_search() {
        let (engine, _) = engine(StaticFetcher::default().with(
            "http://s/s?kw=x",
            r#"<li><a href="/b/1">One</a></li>"#,
        ));
        let s = source(json!({
            "name": "S",
            "baseUrl": "http://s",
            "searchUrl": "/s?kw={{key}}",
            "searchList": "li",
            "searchName": "a@text",
            "searchNoteUrl": "a@href",
            "searchAuthor": "@js:result.author",
            "searchIntro": "div[[@text"
        }));
        let page = engine.search(&s, "x", 1).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.results[0].author, None);
        assert_eq!(page.results[0].description, None);
        assert_eq!(page.results[0].book_url, "http://s/b/1");
    }

    #[test]
    fn rule_problems_are_reported_once() {
        assert!(first_report("@js:reported-once"));
        assert!(!first_report("@js:reported-once"));
        assert!(first_report("@js:another"));
    }
}
