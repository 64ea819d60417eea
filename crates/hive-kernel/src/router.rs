//! Route keys and path matching.
//!
//! A route key is an uppercase HTTP method, one space, and a normalised path
//! pattern such as `GET /users/:id`. Everything here is pure so it can be
//! evaluated on the host side before a request is queued onto a VM.

use std::collections::{BTreeMap, HashMap};

pub type PathParams = BTreeMap<String, String>;

/// Leading slash, and a single trailing slash stripped unless the path is root.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    let mut normalized = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    };
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Matches a concrete path against a pattern with `:name` segments.
pub fn match_path(pattern: &str, path: &str) -> Option<PathParams> {
    let pattern_segments = segments(pattern);
    let path_segments = segments(path);
    if pattern_segments.len() != path_segments.len() {
        return None;
    }

    let mut params = PathParams::new();
    for (expected, actual) in pattern_segments.iter().zip(&path_segments) {
        match expected.strip_prefix(':') {
            Some(name) => {
                params.insert(name.to_string(), (*actual).to_string());
            }
            None if expected == actual => {}
            None => return None,
        }
    }
    Some(params)
}

/// A parsed `"<METHOD> <path>"` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteKey {
    pub method: String,
    pub pattern: String,
}

impl RouteKey {
    /// Parses a declared key; returns `None` when it is not `<METHOD> <path>`.
    pub fn parse(key: &str) -> Option<Self> {
        let (method, path) = key.trim().split_once(char::is_whitespace)?;
        let path = path.trim();
        if method.is_empty()
            || !method.chars().all(|c| c.is_ascii_alphabetic())
            || path.is_empty()
            || path.contains(char::is_whitespace)
        {
            return None;
        }
        Some(Self {
            method: method.to_ascii_uppercase(),
            pattern: normalize_path(path),
        })
    }

    pub fn is_parameterized(&self) -> bool {
        segments(&self.pattern).iter().any(|s| s.starts_with(':'))
    }

    /// Whether some concrete path could satisfy both patterns.
    pub fn overlaps(&self, other: &RouteKey) -> bool {
        if self.method != other.method {
            return false;
        }
        let ours = segments(&self.pattern);
        let theirs = segments(&other.pattern);
        ours.len() == theirs.len()
            && ours
                .iter()
                .zip(&theirs)
                .all(|(a, b)| a.starts_with(':') || b.starts_with(':') || a == b)
    }
}

impl std::fmt::Display for RouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.pattern)
    }
}

/// Two parameterised routes that can match the same path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ambiguity {
    pub first: String,
    pub second: String,
}

/// Immutable dispatch table for one VM.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    exact: HashMap<String, RouteKey>,
    parameterized: Vec<RouteKey>,
}

impl RouteTable {
    /// Builds the table, rejecting overlapping parameterised routes.
    pub fn build(keys: impl IntoIterator<Item = RouteKey>) -> Result<Self, Ambiguity> {
        let mut table = RouteTable::default();
        for key in keys {
            if key.is_parameterized() {
                if !table.parameterized.contains(&key) {
                    table.parameterized.push(key);
                }
            } else {
                table.exact.insert(key.to_string(), key);
            }
        }
        table.parameterized.sort_by(|a, b| a.to_string().cmp(&b.to_string()));

        for (i, a) in table.parameterized.iter().enumerate() {
            if let Some(b) = table.parameterized[i + 1..].iter().find(|b| a.overlaps(b)) {
                return Err(Ambiguity {
                    first: a.to_string(),
                    second: b.to_string(),
                });
            }
        }
        Ok(table)
    }

    /// Exact keys win over patterns; the returned key is the matched route key.
    pub fn resolve(&self, method: &str, path: &str) -> Option<(String, PathParams)> {
        let method = method.to_ascii_uppercase();
        let path = normalize_path(path);
        let exact = format!("{method} {path}");
        if self.exact.contains_key(&exact) {
            return Some((exact, PathParams::new()));
        }
        self.parameterized
            .iter()
            .filter(|key| key.method == method)
            .find_map(|key| match_path(&key.pattern, &path).map(|params| (key.to_string(), params)))
    }

    pub fn keys(&self) -> Vec<String> {
        self.exact
            .keys()
            .cloned()
            .chain(self.parameterized.iter().map(RouteKey::to_string))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.parameterized.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> RouteKey {
        RouteKey::parse(raw).unwrap()
    }

    #[test]
    fn normalize() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("users"), "/users");
        assert_eq!(normalize_path("/users/"), "/users");
        assert_eq!(normalize_path("/users//"), "/users/");
    }

    #[test]
    fn parse_route_keys() {
        assert_eq!(key("get /ping/").to_string(), "GET /ping");
        assert_eq!(key("POST users").to_string(), "POST /users");
        assert!(RouteKey::parse("/ping").is_none());
        assert!(RouteKey::parse("GET").is_none());
        assert!(RouteKey::parse("G3T /x").is_none());
        assert!(RouteKey::parse("GET /a b").is_none());
    }

    #[test]
    fn match_captures_params() {
        let params = match_path("/users/:id/posts/:post", "/users/42/posts/7").unwrap();
        assert_eq!(params.get("id").map(String::as_str), Some("42"));
        assert_eq!(params.get("post").map(String::as_str), Some("7"));
        assert!(match_path("/users/:id", "/users").is_none());
        assert!(match_path("/users/:id", "/teams/1").is_none());
        assert_eq!(match_path("/", "/").unwrap().len(), 0);
    }

    #[test]
    fn match_is_deterministic() {
        let first = match_path("/a/:x", "/a/b");
        let second = match_path("/a/:x", "/a/b");
        assert_eq!(first, second);
    }

    #[test]
    fn exact_beats_parameterized() {
        let table = RouteTable::build([key("GET /users/:id"), key("GET /users/me")]).unwrap();
        let (route, params) = table.resolve("get", "/users/me/").unwrap();
        assert_eq!(route, "GET /users/me");
        assert!(params.is_empty());

        let (route, params) = table.resolve("GET", "/users/9").unwrap();
        assert_eq!(route, "GET /users/:id");
        assert_eq!(params["id"], "9");
        assert!(table.resolve("POST", "/users/9").is_none());
    }

    #[test]
    fn overlapping_patterns_are_rejected() {
        let err = RouteTable::build([key("GET /a/:x"), key("GET /:y/b")]).unwrap_err();
        assert_eq!(err.first, "GET /:y/b");
        assert_eq!(err.second, "GET /a/:x");

        assert!(RouteTable::build([key("GET /a/:x"), key("POST /:y/b")]).is_ok());
        assert!(RouteTable::build([key("GET /a/:x"), key("GET /b/:y")]).is_ok());
        assert!(RouteTable::build([key("GET /a/:x"), key("GET /a/:x/c")]).is_ok());
    }

    #[test]
    fn keys_lists_every_route() {
        let table = RouteTable::build([key("GET /ping"), key("DELETE /items/:id")]).unwrap();
        let mut keys = table.keys();
        keys.sort();
        assert_eq!(keys, vec!["DELETE /items/:id", "GET /ping"]);
        assert_eq!(table.len(), 2);
    }
}
