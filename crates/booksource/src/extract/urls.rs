// ABOUTME: Relative URL resolution against a page's base URL.
// ABOUTME: Never fails: unresolvable inputs are returned unchanged.

use url::Url;

/// True for `http://` and `https://` URLs.
pub fn is_absolute_http(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Resolve `relative` against `base`.
///
/// Absolute http(s) URLs are returned as-is, protocol-relative `//host/path`
/// gets `https:`, everything else goes through standard URL joining. When
/// `base` is empty or joining fails the input is returned unchanged.
pub fn resolve_url(base: &str, relative: &str) -> String {
    let relative = relative.trim();
    if relative.is_empty() {
        return String::new();
    }
    if is_absolute_http(relative) {
        return relative.to_string();
    }
    if relative.starts_with("//") {
        return format!("https:{}", relative);
    }

    Url::parse(base)
        .and_then(|b| b.join(relative))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| relative.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_is_untouched() {
        assert_eq!(resolve_url("http://s", "https://cdn/a.mp3"), "https://cdn/a.mp3");
    }

    #[test]
    fn protocol_relative_gets_https() {
        assert_eq!(resolve_url("http://s", "//cdn.x/a.mp3"), "https://cdn.x/a.mp3");
    }

    #[test]
    fn relative_paths_join() {
        assert_eq!(resolve_url("http://site.com", "/b"), "http://site.com/b");
        assert_eq!(resolve_url("http://s/book/1/", "2.html"), "http://s/book/1/2.html");
        assert_eq!(resolve_url("http://s/book/1", "../c"), "http://s/c");
    }

    #[test]
    fn failures_return_input() {
        assert_eq!(resolve_url("", "/b"), "/b");
        assert_eq!(resolve_url("not a url", "x/y"), "x/y");
        assert_eq!(resolve_url("http://s", ""), "");
    }
}
