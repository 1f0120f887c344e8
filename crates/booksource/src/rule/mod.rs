// ABOUTME: Rule parser that classifies raw book-source rule strings into typed Rule values.
// ABOUTME: Normalizes the Legado selector dialect (class./id./tag., indices, @-chains) into plain CSS.

//! Rule parsing.
//!
//! A rule is a single string telling the extractor how to locate one piece of
//! data. Source authors mix several dialects, so every rule is classified
//! here before evaluation:
//!
//! - empty -> [`RuleKind::None`]
//! - `@js:`, `<js>`, `@operate:`, `$$.`, XPath -> [`RuleKind::Unsupported`]
//! - `$.path`, `@json:path` -> [`RuleKind::JsonPath`]
//! - `@regex:pat`, `/:pat`, `/pat/flags` -> [`RuleKind::Regex`]
//! - `@attr` with no selector -> [`RuleKind::Attribute`] (read from the current element)
//! - anything else -> [`RuleKind::Css`], after Legado normalization
//!
//! Submodules:
//! - `compiled`: process-wide cache of parsed CSS selectors.

pub mod compiled;

use once_cell::sync::Lazy;
use regex::Regex;

static CLASS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bclass\.([A-Za-z0-9_-]+)").unwrap());
static ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bid\.([A-Za-z0-9_-]+)").unwrap());
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\btag\.([A-Za-z0-9]+)").unwrap());
static INDEX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.-?\d+(\s|$)").unwrap());

/// The category a rule string falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// Empty rule; nothing to extract.
    None,
    /// A dialect this engine does not evaluate (JavaScript, DOM mutation, XPath).
    Unsupported,
    /// Dotted/bracket path into a JSON document.
    JsonPath,
    /// Regular expression applied to raw text.
    Regex,
    /// CSS selector with an optional extraction suffix.
    Css,
    /// Extraction suffix only; applies to the current element.
    Attribute,
}

/// What to read from a matched element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// Trimmed text content.
    Text,
    /// Inner markup.
    Html,
    /// A named attribute.
    Attr(String),
}

impl Extraction {
    fn parse(suffix: &str) -> Option<Self> {
        let suffix = suffix.trim();
        if suffix.is_empty() {
            return None;
        }
        match suffix {
            "text" | "textNodes" | "ownText" => Some(Extraction::Text),
            "html" | "all" => Some(Extraction::Html),
            _ => {
                let name = suffix.strip_prefix("attr:").unwrap_or(suffix).trim();
                if name.is_empty() {
                    None
                } else {
                    Some(Extraction::Attr(name.to_string()))
                }
            }
        }
    }

    /// Returns the attribute name when this extraction reads an attribute.
    pub fn attr_name(&self) -> Option<&str> {
        match self {
            Extraction::Attr(name) => Some(name),
            _ => None,
        }
    }

    /// True for `href`/`src`, whose values are resolved against the page URL.
    pub fn is_link_attr(&self) -> bool {
        matches!(self.attr_name(), Some("href") | Some("src"))
    }
}

/// A parsed rule. Cheap to build; derived fresh from the rule string on use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub kind: RuleKind,
    /// CSS selector, `$.`-prefixed JSON path, or regex pattern, depending on `kind`.
    pub selector: String,
    pub extraction: Option<Extraction>,
    /// The original rule string, kept for diagnostics.
    pub raw: String,
}

impl Rule {
    fn new(kind: RuleKind, selector: impl Into<String>, raw: &str) -> Self {
        Self {
            kind,
            selector: selector.into(),
            extraction: None,
            raw: raw.to_string(),
        }
    }

    /// Parse a raw rule string. See the module docs for the classification order.
    pub fn parse(raw: &str) -> Self {
        parse_rule(raw)
    }

    pub fn is_none(&self) -> bool {
        self.kind == RuleKind::None
    }

    pub fn is_json_path(&self) -> bool {
        self.kind == RuleKind::JsonPath
    }

    /// True for rules evaluated against a DOM (CSS selectors and bare attributes).
    pub fn is_dom(&self) -> bool {
        matches!(self.kind, RuleKind::Css | RuleKind::Attribute)
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len()
        && s.is_char_boundary(prefix.len())
        && s[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// Classify and parse a raw rule string.
pub fn parse_rule(raw: &str) -> Rule {
    let rule = raw.trim();
    if rule.is_empty() {
        return Rule::new(RuleKind::None, "", raw);
    }

    if rule.starts_with("@js:") || rule.contains("<js>") {
        return Rule::new(RuleKind::Unsupported, "", raw);
    }
    if rule.starts_with("@operate:") || rule.starts_with("$$.") {
        return Rule::new(RuleKind::Unsupported, "", raw);
    }
    if strip_prefix_ci(rule, "@xpath:").is_some() || rule.starts_with("//") {
        return Rule::new(RuleKind::Unsupported, "", raw);
    }

    if rule.starts_with("$.") || rule.starts_with("$[") {
        return Rule::new(RuleKind::JsonPath, normalize_json_path(rule), raw);
    }
    if let Some(rest) = strip_prefix_ci(rule, "@json:") {
        return Rule::new(RuleKind::JsonPath, normalize_json_path(rest.trim()), raw);
    }

    if let Some(rest) = rule.strip_prefix("@regex:") {
        return Rule::new(RuleKind::Regex, rest, raw);
    }
    if let Some(rest) = rule.strip_prefix("/:") {
        return Rule::new(RuleKind::Regex, rest, raw);
    }
    if let Some(pattern) = parse_delimited_regex(rule) {
        return Rule::new(RuleKind::Regex, pattern, raw);
    }

    let css = strip_prefix_ci(rule, "@css:").unwrap_or(rule);
    parse_css_rule(css, raw)
}

/// Canonicalize a JSON path so it always starts with `$.` (or `$[`).
fn normalize_json_path(path: &str) -> String {
    let body = path
        .strip_prefix("$.")
        .or_else(|| path.strip_prefix('$'))
        .unwrap_or(path);
    if body.starts_with('[') {
        format!("${}", body)
    } else {
        format!("$.{}", body)
    }
}

/// `/pattern/flags` -> pattern with `i`/`m`/`s` turned into inline flags.
fn parse_delimited_regex(rule: &str) -> Option<String> {
    let inner = rule.strip_prefix('/')?;
    let close = inner.rfind('/')?;
    let (pattern, flags) = (&inner[..close], &inner[close + 1..]);
    if pattern.is_empty() || !flags.chars().all(|c| "gimsuvy".contains(c)) {
        return None;
    }
    let inline: String = flags.chars().filter(|c| "ims".contains(*c)).collect();
    if inline.is_empty() {
        Some(pattern.to_string())
    } else {
        Some(format!("(?{}){}", inline, pattern))
    }
}

/// Rewrite one Legado selector segment into standard CSS.
///
/// `class.x` -> `.x`, `id.x` -> `#x`, `tag.x` -> `x`, and trailing `.N`
/// index segments are dropped (the first match is used instead).
pub fn normalize_legado_selector(segment: &str) -> String {
    let out = CLASS_RE.replace_all(segment, ".$1");
    let out = ID_RE.replace_all(&out, "#$1");
    let out = TAG_RE.replace_all(&out, "$1");
    let out = INDEX_RE.replace_all(&out, "${1}");
    out.trim().to_string()
}

/// Whether an `@`-segment is another selector in a Legado chain rather than an extraction.
fn looks_like_selector(segment: &str) -> bool {
    let s = segment.trim();
    if s.starts_with("attr:") {
        return false;
    }
    s.starts_with("class.")
        || s.starts_with("id.")
        || s.starts_with("tag.")
        || s.contains(['.', '#', '[', '>', ' ', ':'])
}

fn parse_css_rule(css: &str, raw: &str) -> Rule {
    let mut css = css.trim();
    css = css.strip_prefix('+').unwrap_or(css);
    css = css.strip_prefix('$').unwrap_or(css);

    let segments: Vec<&str> = css.split('@').collect();
    let (selector_parts, suffix) = match segments.split_last() {
        Some((last, rest)) if !rest.is_empty() && !looks_like_selector(last) => (rest, Some(*last)),
        _ => (&segments[..], None),
    };

    let selector = selector_parts
        .iter()
        .map(|part| normalize_legado_selector(part))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let extraction = suffix.and_then(Extraction::parse);

    let kind = if selector.is_empty() {
        if extraction.is_some() {
            RuleKind::Attribute
        } else {
            RuleKind::None
        }
    } else {
        RuleKind::Css
    };

    Rule {
        kind,
        selector,
        extraction,
        raw: raw.to_string(),
    }
}
