// ABOUTME: Minimal JSON path walker for `$.data.list[0].name` style rules.
// ABOUTME: Missing keys, bad indices and null intermediates yield None instead of errors.

use serde_json::Value;

/// Split a path into its object keys / array indices.
///
/// `$.data.list[0]['name']` -> `["data", "list", "0", "name"]`.
fn segments(path: &str) -> Vec<&str> {
    let path = path.trim();
    let path = path
        .strip_prefix("$.")
        .or_else(|| path.strip_prefix('$'))
        .unwrap_or(path);
    path.split(['.', '[', ']'])
        .map(|s| s.trim().trim_matches(|c| c == '\'' || c == '"'))
        .filter(|s| !s.is_empty())
        .collect()
}

/// Walk `path` through `value`. An empty path returns the value itself.
pub fn get_by_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in segments(path) {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn walks_objects_and_arrays() {
        let v = json!({"data": {"list": [{"name": "a"}, {"name": "b"}]}});
        assert_eq!(get_by_path(&v, "$.data.list[1].name"), Some(&json!("b")));
        assert_eq!(get_by_path(&v, "$.data.list").map(|l| l.as_array().unwrap().len()), Some(2));
        assert_eq!(get_by_path(&v, "data.list[0]['name']"), Some(&json!("a")));
    }

    #[test]
    fn missing_intermediates_yield_none() {
        let v = json!({"data": null, "n": 3});
        assert_eq!(get_by_path(&v, "$.data.list[0].name"), None);
        assert_eq!(get_by_path(&v, "$.missing.key"), None);
        assert_eq!(get_by_path(&v, "$.n.x"), None);
        assert_eq!(get_by_path(&v, "$.data"), Some(&Value::Null));
    }

    #[test]
    fn bad_index_yields_none() {
        let v = json!({"list": [1, 2]});
        assert_eq!(get_by_path(&v, "$.list[5]"), None);
        assert_eq!(get_by_path(&v, "$.list[x]"), None);
    }

    #[test]
    fn root_path_returns_root() {
        let v = json!([1, 2, 3]);
        assert_eq!(get_by_path(&v, "$"), Some(&v));
        assert_eq!(get_by_path(&v, "$[2]"), Some(&json!(3)));
    }
}
