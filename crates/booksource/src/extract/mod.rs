// ABOUTME: Document extractor applying parsed rules to HTML documents, elements, JSON and raw text.
// ABOUTME: Returns one or many values, resolves href/src links, and degrades to None on unsupported rules.

//! Rule evaluation.
//!
//! [`extract`] evaluates a [`Rule`] against fetched [`Content`]; the result is
//! `None` (no match), [`Extracted::One`] or [`Extracted::Many`].
//! [`extract_list`] enumerates list elements (search hits, chapters), and
//! [`ListItem::field`] pulls a single field out of one of them.
//!
//! Submodules:
//! - `json_path`: the `$.a.b[0]` walker.
//! - `urls`: relative URL resolution.

pub mod json_path;
pub mod urls;

use regex::Regex;
use scraper::{ElementRef, Html};
use serde_json::Value;

use crate::rule::compiled::get_or_compile;
use crate::rule::{parse_rule, Extraction, Rule, RuleKind};

pub use json_path::get_by_path;
pub use urls::{is_absolute_http, resolve_url};

/// Why `rule` can never match, or `None` when it can be evaluated.
///
/// Evaluation itself stays silent on these rules and extracts nothing;
/// callers that know the source and URL report the problem.
pub fn rule_problem(rule: &Rule) -> Option<String> {
    match rule.kind {
        RuleKind::Unsupported => Some("unsupported rule".to_string()),
        RuleKind::Regex => Regex::new(&rule.selector)
            .err()
            .map(|e| format!("invalid regex: {}", e)),
        RuleKind::Css | RuleKind::Attribute if !rule.selector.is_empty() => {
            get_or_compile(&rule.selector)
                .is_none()
                .then(|| "invalid CSS selector".to_string())
        }
        _ => None,
    }
}

/// The outcome of a successful extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    One(String),
    Many(Vec<String>),
}

impl Extracted {
    fn from_vec(mut values: Vec<String>) -> Option<Self> {
        match values.len() {
            0 => None,
            1 => values.pop().map(Extracted::One),
            _ => Some(Extracted::Many(values)),
        }
    }

    /// The first extracted value.
    pub fn first(&self) -> Option<&str> {
        match self {
            Extracted::One(v) => Some(v),
            Extracted::Many(vs) => vs.first().map(String::as_str),
        }
    }

    pub fn into_vec(self) -> Vec<String> {
        match self {
            Extracted::One(v) => vec![v],
            Extracted::Many(vs) => vs,
        }
    }
}

/// Fetched content a rule can be evaluated against.
#[derive(Debug, Clone, Copy)]
pub enum Content<'a> {
    /// A parsed document together with the text it was parsed from.
    Html { doc: &'a Html, raw: &'a str },
    /// One element, typically a matched list item.
    Element(ElementRef<'a>),
    Json(&'a Value),
    Text(&'a str),
}

/// Evaluate `rule` against `content`. `base_url` resolves relative `href`/`src` values.
pub fn extract(content: Content<'_>, rule: &Rule, base_url: &str) -> Option<Extracted> {
    match rule.kind {
        RuleKind::None | RuleKind::Unsupported => None,
        RuleKind::Css | RuleKind::Attribute => extract_dom(content, rule, base_url),
        RuleKind::JsonPath => extract_json(content, rule),
        RuleKind::Regex => {
            let owned;
            let text = match content {
                Content::Html { raw, .. } => raw,
                Content::Text(t) => t,
                Content::Element(el) => {
                    owned = el.html();
                    owned.as_str()
                }
                Content::Json(v) => {
                    owned = v.to_string();
                    owned.as_str()
                }
            };
            extract_regex(text, rule)
        }
    }
}

fn select_all<'a>(scope: ElementRef<'a>, rule: &Rule, include_self: bool) -> Vec<ElementRef<'a>> {
    if rule.selector.is_empty() {
        return if include_self { vec![scope] } else { vec![] };
    }
    match get_or_compile(&rule.selector) {
        Some(sel) => scope.select(&sel).collect(),
        None => vec![],
    }
}

fn extract_dom(content: Content<'_>, rule: &Rule, base_url: &str) -> Option<Extracted> {
    let elements = match content {
        Content::Html { doc, .. } => {
            if rule.selector.is_empty() {
                vec![doc.root_element()]
            } else {
                let sel = get_or_compile(&rule.selector)?;
                doc.select(&sel).collect()
            }
        }
        Content::Element(el) => select_all(el, rule, true),
        Content::Json(_) | Content::Text(_) => return None,
    };
    if elements.is_empty() {
        return None;
    }

    let values = elements
        .into_iter()
        .filter_map(|el| read_element(el, rule.extraction.as_ref(), base_url))
        .collect();
    Extracted::from_vec(values)
}

fn extract_json(content: Content<'_>, rule: &Rule) -> Option<Extracted> {
    match content {
        Content::Json(v) => json_to_extracted(get_by_path(v, &rule.selector)?),
        Content::Text(t) => {
            let v: Value = serde_json::from_str(t.trim_start_matches('\u{feff}')).ok()?;
            json_to_extracted(get_by_path(&v, &rule.selector)?)
        }
        _ => None,
    }
}

fn compile_regex(rule: &Rule) -> Option<Regex> {
    Regex::new(&rule.selector).ok()
}

fn extract_regex(text: &str, rule: &Rule) -> Option<Extracted> {
    let re = compile_regex(rule)?;
    let matches = re.find_iter(text).map(|m| m.as_str().to_string()).collect();
    Extracted::from_vec(matches)
}

/// Read text, inner HTML or an attribute from one element.
///
/// No extraction means text. Empty results are treated as missing.
fn read_element(el: ElementRef<'_>, extraction: Option<&Extraction>, base_url: &str) -> Option<String> {
    let value = match extraction {
        None | Some(Extraction::Text) => el.text().collect::<String>().trim().to_string(),
        Some(Extraction::Html) => el.inner_html(),
        Some(Extraction::Attr(name)) => {
            let raw = el.value().attr(name)?.trim();
            if matches!(name.as_str(), "href" | "src") && !base_url.is_empty() {
                resolve_url(base_url, raw)
            } else {
                raw.to_string()
            }
        }
    };
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Stringify a scalar JSON value. Arrays of scalars are joined with `,`.
pub fn json_value_to_string(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(|v| match v {
                Value::Array(_) | Value::Object(_) => None,
                other => json_value_to_string(other),
            })
            .collect::<Vec<_>>()
            .join(","),
        Value::Null | Value::Object(_) => return None,
    };
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn json_to_extracted(value: &Value) -> Option<Extracted> {
    match value {
        Value::Array(items) => {
            Extracted::from_vec(items.iter().filter_map(json_value_to_string).collect())
        }
        other => json_value_to_string(other).map(Extracted::One),
    }
}

/// Evaluate a JSON-path list rule, returning the matched items.
///
/// An array yields its elements; any other non-null value is a single item.
pub fn extract_json_list(value: &Value, rule: &Rule) -> Vec<Value> {
    if !rule.is_json_path() {
        return vec![];
    }
    match get_by_path(value, &rule.selector) {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Null) | None => vec![],
        Some(other) => vec![other.clone()],
    }
}

/// Read one field from a JSON list item.
///
/// JSON-path rules walk the item; any other rule is treated as a plain
/// property name once `.`, `@` and `#` are stripped.
pub fn json_field(item: &Value, rule: &str) -> Option<String> {
    let parsed = parse_rule(rule);
    match parsed.kind {
        RuleKind::None | RuleKind::Unsupported => None,
        RuleKind::JsonPath => get_by_path(item, &parsed.selector).and_then(json_value_to_string),
        _ => {
            let key: String = rule.trim().chars().filter(|c| !matches!(c, '.' | '@' | '#')).collect();
            item.get(key.as_str()).and_then(json_value_to_string)
        }
    }
}

/// A matched list element plus the page URL its relative links resolve against.
#[derive(Debug, Clone)]
pub struct ListItem<'a> {
    pub element: ElementRef<'a>,
    pub base_url: String,
}

impl<'a> ListItem<'a> {
    /// Extract a single field: the first match under this element (or the
    /// element itself for an empty selector).
    pub fn field(&self, rule: &Rule) -> Option<String> {
        match rule.kind {
            RuleKind::None | RuleKind::Unsupported | RuleKind::JsonPath => None,
            RuleKind::Css | RuleKind::Attribute => {
                let target = if rule.selector.is_empty() {
                    self.element
                } else {
                    let sel = get_or_compile(&rule.selector)?;
                    self.element.select(&sel).next()?
                };
                read_element(target, rule.extraction.as_ref(), &self.base_url)
            }
            RuleKind::Regex => {
                let re = compile_regex(rule)?;
                let html = self.element.html();
                re.find(&html).map(|m| m.as_str().to_string())
            }
        }
    }

    /// The element's trimmed text.
    pub fn text(&self) -> String {
        self.element.text().collect::<String>().trim().to_string()
    }

    /// Content view of this element for [`extract`].
    pub fn content(&self) -> Content<'a> {
        Content::Element(self.element)
    }
}

/// Enumerate the elements matched by a list rule.
///
/// Only CSS list rules apply to HTML; anything else yields no items.
pub fn extract_list<'a>(doc: &'a Html, list_rule: &Rule, base_url: &str) -> Vec<ListItem<'a>> {
    if list_rule.kind != RuleKind::Css {
        return vec![];
    }
    let Some(sel) = get_or_compile(&list_rule.selector) else {
        return vec![];
    };
    doc.select(&sel)
        .map(|element| ListItem {
            element,
            base_url: base_url.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const ITEM_HTML: &str = r#"<div class="item"><a href="/b">Title</a></div>"#;

    #[test]
    fn text_extraction_ignores_child_markup() {
        let doc = Html::parse_document(ITEM_HTML);
        let rule = parse_rule("div.item@text");
        let got = extract(Content::Html { doc: &doc, raw: ITEM_HTML }, &rule, "");
        assert_eq!(got, Some(Extracted::One("Title".into())));
    }

    #[test]
    fn legado_class_rule_matches() {
        let doc = Html::parse_document(ITEM_HTML);
        let rule = parse_rule("class.item@text");
        let got = extract(Content::Html { doc: &doc, raw: ITEM_HTML }, &rule, "");
        assert_eq!(got.as_ref().and_then(Extracted::first), Some("Title"));
    }

    #[test]
    fn href_is_resolved_against_base() {
        let doc = Html::parse_document(ITEM_HTML);
        let rule = parse_rule("a@attr:href");
        let got = extract(Content::Html { doc: &doc, raw: ITEM_HTML }, &rule, "http://site.com");
        assert_eq!(got, Some(Extracted::One("http://site.com/b".into())));
    }

    #[test]
    fn non_link_attrs_are_not_resolved() {
        let html = r#"<a data-id="/x" href="/b">T</a>"#;
        let doc = Html::parse_document(html);
        let got = extract(Content::Html { doc: &doc, raw: html }, &parse_rule("a@data-id"), "http://s");
        assert_eq!(got, Some(Extracted::One("/x".into())));
    }

    #[test]
    fn many_matches_and_zero_matches() {
        let html = "<ul><li>a</li><li>b</li><li> </li></ul>";
        let doc = Html::parse_document(html);
        let content = Content::Html { doc: &doc, raw: html };
        assert_eq!(
            extract(content, &parse_rule("li@text"), ""),
            Some(Extracted::Many(vec!["a".into(), "b".into()]))
        );
        assert_eq!(extract(content, &parse_rule("p@text"), ""), None);
    }

    #[test]
    fn html_extraction_returns_inner_markup() {
        let doc = Html::parse_document(ITEM_HTML);
        let got = extract(Content::Html { doc: &doc, raw: ITEM_HTML }, &parse_rule(".item@html"), "");
        assert_eq!(got, Some(Extracted::One(r#"<a href="/b">Title</a>"#.into())));
    }

    #[test]
    fn json_path_extraction() {
        let v = json!({"data": {"list": [{"name": "a"}, {"name": "b"}], "count": 2}});
        assert_eq!(
            extract(Content::Json(&v), &parse_rule("$.data.list[0].name"), ""),
            Some(Extracted::One("a".into()))
        );
        assert_eq!(
            extract(Content::Json(&v), &parse_rule("$.data.count"), ""),
            Some(Extracted::One("2".into()))
        );
        assert_eq!(extract(Content::Json(&v), &parse_rule("$.data.none.x"), ""), None);
        assert_eq!(
            extract(Content::Text(r#"{"url":"http://a/x.mp3"}"#), &parse_rule("$.url"), ""),
            Some(Extracted::One("http://a/x.mp3".into()))
        );
    }

    #[test]
    fn regex_extraction() {
        let text = "a http://x/1.mp3 b http://x/2.mp3";
        let rule = parse_rule(r"@regex:http://\S+\.mp3");
        assert_eq!(
            extract(Content::Text(text), &rule, ""),
            Some(Extracted::Many(vec!["http://x/1.mp3".into(), "http://x/2.mp3".into()]))
        );
        assert_eq!(extract(Content::Text("none"), &rule, ""), None);
    }

    #[test]
    fn rule_problems_are_described() {
        assert_eq!(rule_problem(&parse_rule("@js:result")).as_deref(), Some("unsupported rule"));
        assert!(rule_problem(&parse_rule("/(unclosed/")).unwrap().starts_with("invalid regex"));
        assert_eq!(rule_problem(&parse_rule("div[[@text")).as_deref(), Some("invalid CSS selector"));
        assert_eq!(rule_problem(&parse_rule("div.item@text")), None);
        assert_eq!(rule_problem(&parse_rule("$.data.list")), None);
        assert_eq!(rule_problem(&parse_rule("")), None);
    }

    #[test]
    fn unsupported_rules_yield_none() {
        let doc = Html::parse_document(ITEM_HTML);
        let content = Content::Html { doc: &doc, raw: ITEM_HTML };
        assert_eq!(extract(content, &parse_rule("@js:1+1"), ""), None);
        assert_eq!(extract(content, &parse_rule("@js:1+1"), ""), None);
        assert_eq!(extract(content, &parse_rule(""), ""), None);
    }

    #[test]
    fn list_items_and_fields() {
        let html = r#"<ul>
            <li class="r"><a href="/book/1">One</a><img src="c1.jpg"></li>
            <li class="r"><a href="/book/2">Two</a></li>
        </ul>"#;
        let doc = Html::parse_document(html);
        let items = extract_list(&doc, &parse_rule("li.r"), "http://s/list/");
        assert_eq!(items.len(), 2);

        assert_eq!(items[0].field(&parse_rule("a@text")).as_deref(), Some("One"));
        assert_eq!(
            items[0].field(&parse_rule("a@href")).as_deref(),
            Some("http://s/book/1")
        );
        assert_eq!(
            items[0].field(&parse_rule("img@src")).as_deref(),
            Some("http://s/list/c1.jpg")
        );
        assert_eq!(items[1].field(&parse_rule("img@src")), None);
        assert_eq!(items[1].field(&parse_rule("@text")).as_deref(), Some("Two"));
        assert_eq!(items[1].text(), "Two");
    }

    #[test]
    fn self_reference_attribute_on_element() {
        let html = r#"<a class="ch" href="/c/1">Chapter 1</a>"#;
        let doc = Html::parse_document(html);
        let items = extract_list(&doc, &parse_rule("a.ch"), "http://s/");
        assert_eq!(items[0].field(&parse_rule("@href")).as_deref(), Some("http://s/c/1"));
        assert_eq!(
            extract(items[0].content(), &parse_rule("@attr:href"), "http://s/"),
            Some(Extracted::One("http://s/c/1".into()))
        );
    }

    #[test]
    fn non_css_list_rule_yields_nothing() {
        let doc = Html::parse_document(ITEM_HTML);
        assert!(extract_list(&doc, &parse_rule("$.list"), "").is_empty());
        assert!(extract_list(&doc, &parse_rule("@js:x"), "").is_empty());
    }

    #[test]
    fn json_lists_and_fields() {
        let v = json!({"data": [{"title": "A", "author": ["x", "y"], "id": 7}]});
        let items = extract_json_list(&v, &parse_rule("$.data"));
        assert_eq!(items.len(), 1);
        assert_eq!(json_field(&items[0], "title").as_deref(), Some("A"));
        assert_eq!(json_field(&items[0], "$.author").as_deref(), Some("x,y"));
        assert_eq!(json_field(&items[0], "@json:id").as_deref(), Some("7"));
        assert_eq!(json_field(&items[0], "missing"), None);

        let single = json!({"data": {"title": "only"}});
        assert_eq!(extract_json_list(&single, &parse_rule("$.data")).len(), 1);
        assert!(extract_json_list(&single, &parse_rule("$.nope")).is_empty());
    }
}
