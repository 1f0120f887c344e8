// ABOUTME: URL template resolver for book-source search URLs and their trailing request config.
// ABOUTME: Expands {{key}}/{key}/@key placeholders and repairs single-quoted pseudo-JSON options.

//! URL template resolution.
//!
//! A source's search URL is a template such as
//! `/search?kw={{key}}&p={{page}},{'method': 'POST', 'charset': 'gbk'}`:
//! the part before the first `,{` / `,'` / `,"` is the URL, the rest is a
//! pseudo-JSON options blob. [`split_url_config`] separates the two and
//! [`resolve_template`] fills in the placeholders.

use std::collections::BTreeMap;

use encoding_rs::{Encoding, UTF_8};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

static DOUBLE_BRACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{(\w+)\}\}").unwrap());
static SINGLE_BRACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(\w+)\}").unwrap());
static AT_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"@(\w+)(=?)").unwrap());
static QUERY_SEPARATOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([A-Za-z_][A-Za-z0-9_]*=)").unwrap());
static QUOTED_VALUE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r":\s*'([^']*?)'").unwrap());
static QUOTED_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"'([^']+?)':").unwrap());
static NEWLINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*").unwrap());

/// Request options parsed from the trailing config blob of a URL template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlOptions {
    pub method: Option<String>,
    pub body: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub charset: Option<String>,
}

impl UrlOptions {
    /// True when the configured method is POST (case-insensitive).
    pub fn is_post(&self) -> bool {
        self.method
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case("POST"))
    }

    /// The method to send, defaulting to GET.
    pub fn method(&self) -> &str {
        if self.is_post() {
            "POST"
        } else {
            "GET"
        }
    }

    /// Resolve the charset hint to an encoding; unknown labels yield `None`.
    pub fn encoding(&self) -> Option<&'static Encoding> {
        self.charset
            .as_deref()
            .and_then(|label| Encoding::for_label(label.trim().as_bytes()))
    }

    fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let text = |v: &Value| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let headers = obj
            .get("headers")
            .and_then(|h| match h {
                // Legado sometimes stores headers as a JSON string.
                Value::String(s) => serde_json::from_str::<Value>(s).ok(),
                other => Some(other.clone()),
            })
            .and_then(|h| h.as_object().cloned())
            .map(|h| h.iter().map(|(k, v)| (k.clone(), text(v))).collect())
            .unwrap_or_default();

        Some(Self {
            method: obj.get("method").and_then(Value::as_str).map(str::to_string),
            body: obj.get("body").filter(|b| !b.is_null()).map(text),
            headers,
            charset: obj.get("charset").and_then(Value::as_str).map(str::to_string),
        })
    }
}

/// Placeholder values for a template, plus the charset used to percent-encode them.
#[derive(Debug, Clone)]
pub struct TemplateParams {
    values: BTreeMap<String, String>,
    encoding: &'static Encoding,
}

impl Default for TemplateParams {
    fn default() -> Self {
        Self {
            values: BTreeMap::new(),
            encoding: UTF_8,
        }
    }
}

impl TemplateParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard search parameters: `key`, `page`, `pageSize`.
    pub fn search(keyword: &str, page: u32, page_size: u32) -> Self {
        Self::new()
            .with("key", keyword)
            .with("page", page.to_string())
            .with("pageSize", page_size.to_string())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Percent-encode values in this charset instead of UTF-8.
    pub fn with_encoding(mut self, encoding: Option<&'static Encoding>) -> Self {
        self.encoding = encoding.unwrap_or(UTF_8);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn encode(&self, value: &str) -> String {
        if self.encoding == UTF_8 {
            urlencoding::encode(value).into_owned()
        } else {
            let (bytes, _, _) = self.encoding.encode(value);
            urlencoding::encode_binary(&bytes).into_owned()
        }
    }
}

/// Expand placeholders in a URL template.
///
/// `{{key}}` and `{key}` are replaced by the encoded value (empty when the key
/// is unknown); `@key` is replaced only when `key` is a known parameter.
/// Afterwards, if no `?` exists, the first `@name=` is rewritten to `?name=`.
pub fn resolve_template(template: &str, params: &TemplateParams) -> String {
    if template.is_empty() {
        return String::new();
    }

    let url = DOUBLE_BRACE_RE.replace_all(template, |caps: &Captures| {
        params.encode(params.get(&caps[1]).unwrap_or(""))
    });
    let url = SINGLE_BRACE_RE.replace_all(&url, |caps: &Captures| {
        params.encode(params.get(&caps[1]).unwrap_or(""))
    });
    // `@name=` is a query separator, not a placeholder.
    let url = AT_KEY_RE.replace_all(&url, |caps: &Captures| match params.get(&caps[1]) {
        Some(value) if caps[2].is_empty() => params.encode(value),
        _ => caps[0].to_string(),
    });

    if url.contains('@') && !url.contains('?') {
        QUERY_SEPARATOR_RE.replace(&url, "?$1").into_owned()
    } else {
        url.into_owned()
    }
}

/// Substitute `{{key}}`/`{key}` placeholders in a request body.
///
/// JSON bodies get JSON-escaped raw values; anything else is treated as a
/// form body and percent-encoded.
pub fn resolve_body(body: &str, params: &TemplateParams) -> String {
    let json_like = matches!(body.trim_start().chars().next(), Some('{') | Some('['));
    let fill = |caps: &Captures| {
        let value = params.get(&caps[1]).unwrap_or("");
        if json_like {
            let quoted = Value::String(value.to_string()).to_string();
            quoted[1..quoted.len() - 1].to_string()
        } else {
            params.encode(value)
        }
    };
    let out = DOUBLE_BRACE_RE.replace_all(body, &fill);
    SINGLE_BRACE_RE.replace_all(&out, &fill).into_owned()
}

/// Find the byte offset of the comma that starts the trailing config blob.
fn config_start(template: &str) -> Option<usize> {
    template.char_indices().find_map(|(i, c)| {
        if c != ',' {
            return None;
        }
        let rest = template[i + 1..].trim_start();
        if rest.starts_with('{') || rest.starts_with('\'') || rest.starts_with('"') {
            Some(i)
        } else {
            None
        }
    })
}

/// Split a URL template into its URL prefix and parsed options.
///
/// Never fails: when the options blob cannot be repaired into JSON, the
/// whole template is returned as the URL with default options.
pub fn split_url_config(template: &str) -> (String, UrlOptions) {
    let Some(start) = config_start(template) else {
        return (template.to_string(), UrlOptions::default());
    };

    let url = &template[..start];
    let config = template[start + 1..].trim();
    match coerce_pseudo_json(config).as_ref().and_then(UrlOptions::from_value) {
        Some(options) => (url.to_string(), options),
        None => {
            warn!(
                config = %config.chars().take(100).collect::<String>(),
                "could not parse URL config; using template as URL"
            );
            (template.to_string(), UrlOptions::default())
        }
    }
}

/// Best-effort repair of Legado's single-quoted pseudo-JSON into a JSON value.
///
/// Tries, in order: the text as-is, pattern substitution of `'value'` and
/// `'key':` with newline collapsing, then a quote-aware rewrite of every
/// single-quoted string. Returns `None` if all fail.
pub fn coerce_pseudo_json(text: &str) -> Option<Value> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(v) = serde_json::from_str(text) {
        return Some(v);
    }

    let substituted = QUOTED_VALUE_RE.replace_all(text, ": \"$1\"");
    let substituted = QUOTED_KEY_RE.replace_all(&substituted, "\"$1\":");
    let substituted = NEWLINE_RE.replace_all(&substituted, " ");
    if let Ok(v) = serde_json::from_str(&substituted) {
        return Some(v);
    }

    let requoted = NEWLINE_RE.replace_all(&requote_single_quoted(text), " ").into_owned();
    serde_json::from_str(&requoted).ok()
}

/// Rewrite single-quoted strings as double-quoted JSON strings, escaping inner `"`.
fn requote_single_quoted(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut chars = text.chars().peekable();
    let mut in_double = false;
    let mut in_single = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' if in_double => {
                out.push(c);
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '\\' if in_single => match chars.next() {
                Some('\'') => out.push('\''),
                Some(next) => {
                    out.push('\\');
                    out.push(next);
                }
                None => out.push('\\'),
            },
            '"' if in_single => out.push_str("\\\""),
            '"' => {
                in_double = !in_double;
                out.push(c);
            }
            '\'' if !in_double => {
                in_single = !in_single;
                out.push('"');
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params() -> TemplateParams {
        TemplateParams::new().with("key", "v")
    }

    #[test]
    fn all_three_placeholder_dialects() {
        assert_eq!(resolve_template("/s?q={{key}}", &params()), "/s?q=v");
        assert_eq!(resolve_template("/s?q={key}", &params()), "/s?q=v");
        assert_eq!(resolve_template("/s?q=@key", &params()), "/s?q=v");
    }

    #[test]
    fn values_are_percent_encoded() {
        let p = TemplateParams::search("三体 2", 1, 20);
        assert_eq!(
            resolve_template("/s?q={{key}}&p={{page}}&n={{pageSize}}", &p),
            "/s?q=%E4%B8%89%E4%BD%93%202&p=1&n=20"
        );
    }

    #[test]
    fn gbk_charset_encodes_in_gbk() {
        let p = TemplateParams::new()
            .with("key", "中")
            .with_encoding(Encoding::for_label(b"gbk"));
        assert_eq!(resolve_template("/s?q={{key}}", &p), "/s?q=%D6%D0");
    }

    #[test]
    fn unknown_keys() {
        assert_eq!(resolve_template("/s?q={{nope}}&r={nope}", &params()), "/s?q=&r=");
        assert_eq!(resolve_template("/s?mail=a@nope.com", &params()), "/s?mail=a@nope.com");
    }

    #[test]
    fn at_query_separator_is_rewritten() {
        assert_eq!(
            resolve_template("/search.php@searchword={{key}}", &params()),
            "/search.php?searchword=v"
        );
        assert_eq!(
            resolve_template("/list?a=1@b=2", &params()),
            "/list?a=1@b=2"
        );
    }

    #[test]
    fn at_separator_named_like_a_parameter() {
        let params = TemplateParams::search("abc", 1, 20);
        assert_eq!(
            resolve_template("/programlisthome@page={{page}}", &params),
            "/programlisthome?page=1"
        );
        assert_eq!(
            resolve_template("/list@key={{key}}&n=@pageSize", &params),
            "/list?key=abc&n=20"
        );
    }

    #[test]
    fn split_single_quoted_config() {
        let (url, opts) = split_url_config("http://x/y,{'method': 'POST'}");
        assert_eq!(url, "http://x/y");
        assert_eq!(opts.method.as_deref(), Some("POST"));
        assert!(opts.is_post());
    }

    #[test]
    fn split_with_whitespace_and_charset() {
        let (url, opts) = split_url_config("/s?kw={{key}}, {\"charset\": \"gbk\"}");
        assert_eq!(url, "/s?kw={{key}}");
        assert_eq!(opts.charset.as_deref(), Some("gbk"));
        assert!(opts.encoding().is_some());
        assert_eq!(opts.method(), "GET");
    }

    #[test]
    fn split_without_config() {
        let (url, opts) = split_url_config("/s?kw={{key}}");
        assert_eq!(url, "/s?kw={{key}}");
        assert_eq!(opts, UrlOptions::default());
    }

    #[test]
    fn split_nested_quoted_body() {
        let (url, opts) =
            split_url_config("/api/search,{'method': 'POST', 'body': '{\"key\":\"{{key}}\"}'}");
        assert_eq!(url, "/api/search");
        assert!(opts.is_post());
        assert_eq!(opts.body.as_deref(), Some("{\"key\":\"{{key}}\"}"));
    }

    #[test]
    fn split_headers_object() {
        let (_, opts) = split_url_config(
            "/s,{'headers': {'Referer': 'http://s/', 'X-N': 1}}",
        );
        assert_eq!(opts.headers.get("Referer").map(String::as_str), Some("http://s/"));
        assert_eq!(opts.headers.get("X-N").map(String::as_str), Some("1"));
    }

    #[test]
    fn malformed_config_never_fails() {
        let template = "http://x/y,{method: POST";
        let (url, opts) = split_url_config(template);
        assert_eq!(url, template);
        assert_eq!(opts, UrlOptions::default());

        let (url, _) = split_url_config("http://x/y,'just a string'");
        assert_eq!(url, "http://x/y,'just a string'");
    }

    #[test]
    fn multiline_config_is_collapsed() {
        let v = coerce_pseudo_json("{\n  'method': 'POST',\n  'charset': 'gbk'\n}").unwrap();
        assert_eq!(v["method"], "POST");
        assert_eq!(v["charset"], "gbk");
    }

    #[test]
    fn json_body_gets_raw_escaped_values() {
        let p = TemplateParams::search("a\"b c", 2, 20);
        assert_eq!(
            resolve_body("{\"key\":\"{{key}}\",\"page\":{{page}}}", &p),
            "{\"key\":\"a\\\"b c\",\"page\":2}"
        );
    }

    #[test]
    fn form_body_is_percent_encoded() {
        let p = TemplateParams::search("a b", 1, 20);
        assert_eq!(resolve_body("kw={{key}}&p={page}", &p), "kw=a%20b&p=1");
    }
}
