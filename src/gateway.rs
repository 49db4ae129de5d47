//! Gateway route table.
//!
//! The gateway configuration is a nested JSON object whose keys are path
//! segments and whose leaves are mount targets:
//!
//! ```json
//! { "api": { "v1": "http://127.0.0.1:8080" }, "static": "dir:/srv/www" }
//! ```
//!
//! `http(s)://` leaves mount a reverse proxy, `dir:` leaves mount a directory.
//! Requests are matched on the longest mounted prefix, and the prefix is
//! stripped before the request is handed on. Serving is left to the embedder.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde_json::Value;

#[derive(Debug)]
pub enum GatewayConfigError {
    InvalidJson(serde_json::Error),
    /// Leaf or node that is neither an object nor a supported target.
    UnsupportedEntry(String),
}

impl fmt::Display for GatewayConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayConfigError::InvalidJson(e) => write!(f, "invalid gateway config: {}", e),
            GatewayConfigError::UnsupportedEntry(path) => {
                write!(f, "cannot process gateway entry: {}", path)
            }
        }
    }
}

impl std::error::Error for GatewayConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GatewayConfigError::InvalidJson(e) => Some(e),
            GatewayConfigError::UnsupportedEntry(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Proxy { upstream: String },
    Directory { root: PathBuf },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    /// mount prefix (e.g. `/api/v1`) → route
    routes: BTreeMap<String, Route>,
}

impl RouteTable {
    pub fn from_json(config: &str) -> Result<Self, GatewayConfigError> {
        let value: Value = serde_json::from_str(config).map_err(GatewayConfigError::InvalidJson)?;
        let Value::Object(root) = value else {
            return Err(GatewayConfigError::UnsupportedEntry(String::new()));
        };
        let mut table = Self::default();
        table.walk(&root, "")?;
        Ok(table)
    }

    fn walk(
        &mut self,
        node: &serde_json::Map<String, Value>,
        prefix: &str,
    ) -> Result<(), GatewayConfigError> {
        for (segment, entry) in node {
            let path = format!("{}/{}", prefix, segment);
            match entry {
                Value::Object(children) => self.walk(children, &path)?,
                Value::String(target) => {
                    let route = parse_target(target)
                        .ok_or_else(|| GatewayConfigError::UnsupportedEntry(path.clone()))?;
                    self.routes.insert(path, route);
                }
                _ => return Err(GatewayConfigError::UnsupportedEntry(path)),
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> impl Iterator<Item = (&str, &Route)> {
        self.routes.iter().map(|(path, route)| (path.as_str(), route))
    }

    /// Route for `path` and the remainder after its mount prefix.
    ///
    /// Prefixes match whole segments only: `/api` serves `/api/x` but not
    /// `/apix`.
    pub fn resolve<'a>(&self, path: &'a str) -> Option<(&Route, &'a str)> {
        self.routes
            .iter()
            .filter_map(|(prefix, route)| {
                let rest = path.strip_prefix(prefix.as_str())?;
                (rest.is_empty() || rest.starts_with('/')).then_some((prefix.len(), route, rest))
            })
            .max_by_key(|(len, _, _)| *len)
            .map(|(_, route, rest)| (route, if rest.is_empty() { "/" } else { rest }))
    }
}

fn parse_target(target: &str) -> Option<Route> {
    if let Some(dir) = target.strip_prefix("dir:") {
        return Some(Route::Directory { root: PathBuf::from(dir.trim_start_matches('/')) });
    }
    let (scheme, rest) = target.split_once("://")?;
    match scheme {
        "http" | "https" if !rest.is_empty() => Some(Route::Proxy { upstream: target.to_string() }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "api": { "v1": "http://127.0.0.1:8080", "v2": "https://example.org" },
        "static": "dir:/srv/www"
    }"#;

    #[test]
    fn nested_tree_becomes_prefixes() {
        let table = RouteTable::from_json(CONFIG).unwrap();
        let prefixes: Vec<&str> = table.routes().map(|(p, _)| p).collect();
        assert_eq!(prefixes, vec!["/api/v1", "/api/v2", "/static"]);
        assert_eq!(
            table.resolve("/static/index.html"),
            Some((&Route::Directory { root: PathBuf::from("srv/www") }, "/index.html"))
        );
    }

    #[test]
    fn resolve_matches_whole_segments() {
        let table = RouteTable::from_json(CONFIG).unwrap();
        let (route, rest) = table.resolve("/api/v1/users").unwrap();
        assert_eq!(route, &Route::Proxy { upstream: "http://127.0.0.1:8080".into() });
        assert_eq!(rest, "/users");
        assert_eq!(table.resolve("/api/v1").unwrap().1, "/");
        assert!(table.resolve("/api/v10").is_none());
        assert!(table.resolve("/other").is_none());
    }

    #[test]
    fn longest_prefix_wins() {
        let table = RouteTable::from_json(r#"{"a": "dir:/one", "a/b": "dir:/two"}"#).unwrap();
        let (route, rest) = table.resolve("/a/b/c").unwrap();
        assert_eq!(route, &Route::Directory { root: PathBuf::from("two") });
        assert_eq!(rest, "/c");
    }

    #[test]
    fn unsupported_entries_are_rejected() {
        match RouteTable::from_json(r#"{"x": {"y": "ftp://host"}}"#) {
            Err(GatewayConfigError::UnsupportedEntry(path)) => assert_eq!(path, "/x/y"),
            other => panic!("expected UnsupportedEntry, got {:?}", other),
        }
        assert!(matches!(
            RouteTable::from_json(r#"{"n": 3}"#),
            Err(GatewayConfigError::UnsupportedEntry(_))
        ));
        assert!(matches!(RouteTable::from_json("{"), Err(GatewayConfigError::InvalidJson(_))));
    }
}
