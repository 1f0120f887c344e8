// ABOUTME: Canonical book-source model and the normalizer that maps Legado and legacy shapes onto it.
// ABOUTME: Each logical field is resolved through an ordered chain of accessor keys; first non-empty value wins.

//! Book sources.
//!
//! Sources arrive in several shapes: this crate's own canonical camelCase
//! form (what [`Source`] serializes to), an older flat form (`searchUrl`,
//! `ruleSearchList`, ...) and Legado's form with nested `ruleSearch` /
//! `ruleToc` / `ruleContent` / `ruleBookInfo` sections, which may themselves
//! be JSON-encoded strings. [`normalize_source`] folds all of them into one
//! [`Source`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Per-field rules applied to each search-result item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFieldRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intro: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_url: Option<String>,
}

/// A normalized book source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_url_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_list_rule: Option<String>,
    #[serde(default)]
    pub search_field_rules: SearchFieldRules,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_list_rule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_name_rule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_url_rule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url_rule: Option<String>,
    /// The object this source was normalized from.
    #[serde(rename = "_raw", default, skip_serializing_if = "Value::is_null")]
    pub raw: Value,
}

fn default_enabled() -> bool {
    true
}

impl Source {
    /// True when a search URL template is configured.
    pub fn has_search(&self) -> bool {
        self.search_url_template.is_some()
    }

    /// True when a chapter list rule is configured.
    pub fn has_chapter(&self) -> bool {
        self.chapter_list_rule.is_some()
    }

    /// Display label used in logs: `name (id)`.
    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.id)
    }
}

/// Where a logical field may be found in a raw source object.
#[derive(Debug, Clone, Copy)]
enum Key {
    /// A top-level property.
    Flat(&'static str),
    /// A property of a nested Legado section (`ruleSearch`, `ruleToc`, ...).
    Nested(&'static str, &'static str),
}

use Key::{Flat, Nested};

const NAME: &[Key] = &[Flat("name"), Flat("sourceName"), Flat("bookSourceName"), Flat("title")];
const BASE_URL: &[Key] = &[Flat("baseUrl"), Flat("sourceUrl"), Flat("bookSourceUrl"), Flat("url")];
const GROUP: &[Key] = &[Flat("group"), Flat("sourceGroup"), Flat("bookSourceGroup")];
const DESCRIPTION: &[Key] = &[
    Flat("description"),
    Flat("sourceComment"),
    Flat("bookSourceComment"),
];
const SEARCH_URL: &[Key] = &[
    Flat("searchUrlTemplate"),
    Flat("searchUrl"),
    Flat("ruleSearchUrl"),
    Nested("ruleSearch", "searchUrl"),
];
const SEARCH_LIST: &[Key] = &[
    Flat("searchListRule"),
    Flat("searchList"),
    Flat("ruleSearchList"),
    Nested("ruleSearch", "bookList"),
    Nested("ruleSearch", "list"),
];
const SEARCH_NAME: &[Key] = &[
    Nested("searchFieldRules", "name"),
    Flat("searchName"),
    Flat("ruleSearchName"),
    Nested("ruleSearch", "name"),
];
const SEARCH_COVER: &[Key] = &[
    Nested("searchFieldRules", "cover"),
    Flat("searchCover"),
    Flat("ruleSearchCover"),
    Nested("ruleSearch", "coverUrl"),
    Nested("ruleBookInfo", "coverUrl"),
];
const SEARCH_AUTHOR: &[Key] = &[
    Nested("searchFieldRules", "author"),
    Flat("searchAuthor"),
    Flat("ruleSearchAuthor"),
    Nested("ruleSearch", "author"),
    Nested("ruleBookInfo", "author"),
];
const SEARCH_ARTIST: &[Key] = &[
    Nested("searchFieldRules", "artist"),
    Flat("searchArtist"),
    Flat("ruleSearchArtist"),
    Nested("ruleSearch", "artist"),
];
const SEARCH_INTRO: &[Key] = &[
    Nested("searchFieldRules", "intro"),
    Flat("searchIntro"),
    Flat("ruleSearchIntro"),
    Nested("ruleSearch", "intro"),
    Nested("ruleBookInfo", "intro"),
];
const SEARCH_KIND: &[Key] = &[
    Nested("searchFieldRules", "kind"),
    Flat("searchKind"),
    Flat("ruleSearchKind"),
    Nested("ruleSearch", "kind"),
];
const SEARCH_BOOK_URL: &[Key] = &[
    Nested("searchFieldRules", "bookUrl"),
    Flat("searchNoteUrl"),
    Flat("ruleSearchNoteUrl"),
    Nested("ruleSearch", "bookUrl"),
    Nested("ruleSearch", "noteUrl"),
];
const CHAPTER_LIST: &[Key] = &[
    Flat("chapterListRule"),
    Flat("chapterList"),
    Flat("ruleChapterList"),
    Nested("ruleToc", "chapterList"),
];
const CHAPTER_NAME: &[Key] = &[
    Flat("chapterNameRule"),
    Flat("chapterName"),
    Flat("ruleChapterName"),
    Nested("ruleToc", "chapterName"),
];
const CHAPTER_URL: &[Key] = &[
    Flat("chapterUrlRule"),
    Flat("chapterUrl"),
    Flat("ruleChapterUrl"),
    Nested("ruleToc", "chapterUrl"),
];
const AUDIO_URL: &[Key] = &[
    Flat("audioUrlRule"),
    Flat("ruleContentUrl"),
    Flat("contentUrl"),
    Nested("ruleContent", "content"),
];

/// Nested sections that may be JSON objects or JSON-encoded strings.
const SECTIONS: &[&str] = &[
    "ruleSearch",
    "ruleToc",
    "ruleContent",
    "ruleBookInfo",
    "searchFieldRules",
];

/// A raw source object with its nested sections decoded.
struct RawSource<'a> {
    top: &'a Map<String, Value>,
    sections: Map<String, Value>,
}

impl<'a> RawSource<'a> {
    fn new(top: &'a Map<String, Value>) -> Self {
        let sections = SECTIONS
            .iter()
            .map(|name| (name.to_string(), parse_section(top.get(*name))))
            .collect();
        Self { top, sections }
    }

    fn lookup(&self, key: Key) -> Option<&Value> {
        match key {
            Flat(name) => self.top.get(name),
            Nested(section, name) => self.sections.get(section)?.get(name),
        }
    }

    /// First non-empty value along `chain`.
    fn resolve(&self, chain: &[Key]) -> Option<String> {
        chain
            .iter()
            .find_map(|key| self.lookup(*key).and_then(non_empty_text))
    }

    fn flag(&self, name: &str) -> bool {
        !matches!(self.top.get(name), Some(Value::Bool(false)))
    }
}

/// Decode a Legado section. Strings are parsed as JSON; anything unusable is `{}`.
fn parse_section(value: Option<&Value>) -> Value {
    match value {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(Value::String(s)) if !s.trim().is_empty() => {
            match serde_json::from_str::<Value>(s) {
                Ok(v @ Value::Object(_)) => v,
                _ => {
                    debug!("ignoring unparsable rule section");
                    Value::Object(Map::new())
                }
            }
        }
        _ => Value::Object(Map::new()),
    }
}

fn non_empty_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Normalize a raw source object into a [`Source`].
///
/// Returns `None` when no name can be resolved or `raw` is not an object.
/// `subscription_id`, when given, overrides any id already on the object.
pub fn normalize_source(raw: &Value, subscription_id: Option<&str>) -> Option<Source> {
    let top = raw.as_object()?;
    let src = RawSource::new(top);

    let Some(name) = src.resolve(NAME) else {
        debug!("source has no resolvable name; skipping");
        return None;
    };
    let base_url = src.resolve(BASE_URL).unwrap_or_default();
    let id = top
        .get("id")
        .and_then(non_empty_text)
        .or_else(|| (!base_url.is_empty()).then(|| base_url.clone()))
        .unwrap_or_else(|| format!("source-{}", name));

    let subscription_id = subscription_id
        .map(str::to_string)
        .or_else(|| top.get("subscriptionId").and_then(non_empty_text));

    let original = match top.get("_raw") {
        Some(inner) if inner.is_object() => inner.clone(),
        _ => raw.clone(),
    };

    Some(Source {
        id,
        name,
        base_url,
        enabled: src.flag("enabled") && src.flag("enabledExplore"),
        group: src.resolve(GROUP),
        description: src.resolve(DESCRIPTION),
        subscription_id,
        search_url_template: src.resolve(SEARCH_URL),
        search_list_rule: src.resolve(SEARCH_LIST),
        search_field_rules: SearchFieldRules {
            name: src.resolve(SEARCH_NAME),
            cover: src.resolve(SEARCH_COVER),
            author: src.resolve(SEARCH_AUTHOR),
            artist: src.resolve(SEARCH_ARTIST),
            intro: src.resolve(SEARCH_INTRO),
            kind: src.resolve(SEARCH_KIND),
            book_url: src.resolve(SEARCH_BOOK_URL),
        },
        chapter_list_rule: src.resolve(CHAPTER_LIST),
        chapter_name_rule: src.resolve(CHAPTER_NAME),
        chapter_url_rule: src.resolve(CHAPTER_URL),
        audio_url_rule: src.resolve(AUDIO_URL),
        raw: original,
    })
}
