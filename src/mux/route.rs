use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;

use crate::error::{ProxyError, Result};
use crate::mux::location::HttpLocation;
use crate::mux::trie::PathTrie;

/// Parsed form of a location's path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathExpression {
    /// `TrieRoute("<pattern>")` — template with `<name>` segment wildcards.
    Trie(String),
    /// `RegexpRoute("<regex>")` — expression anchored at the path start.
    Regexp(String),
}

/// Bare paths are coerced to regexp routes: `/home` becomes
/// `RegexpRoute("/home")`. Regex metacharacters in a literal path are NOT
/// escaped by this coercion.
pub fn convert_path(path: &str) -> String {
    if path.starts_with("TrieRoute(") || path.starts_with("RegexpRoute(") {
        path.to_string()
    } else {
        format!(r#"RegexpRoute("{path}")"#)
    }
}

impl PathExpression {
    pub fn parse(raw: &str) -> Result<Self> {
        let converted = convert_path(raw);
        if let Some(inner) = strip_call(&converted, "TrieRoute") {
            return Ok(PathExpression::Trie(inner));
        }
        if let Some(inner) = strip_call(&converted, "RegexpRoute") {
            return Ok(PathExpression::Regexp(inner));
        }
        Err(ProxyError::Config(format!("bad path expression: {raw}")))
    }
}

fn strip_call(raw: &str, name: &str) -> Option<String> {
    let body = raw.strip_prefix(name)?;
    let body = body.strip_prefix(r#"(""#)?;
    let body = body.strip_suffix(r#"")"#)?;
    Some(body.to_string())
}

struct RegexpEntry {
    pattern: String,
    re: Regex,
    location: Arc<HttpLocation>,
}

#[derive(Default)]
struct Tables {
    trie: PathTrie<Arc<HttpLocation>>,
    regexps: Vec<RegexpEntry>,
}

/// Per-host request matcher. Trie routes dispatch first (most specific),
/// regexp routes second in registration order; first match wins.
#[derive(Default)]
pub struct PathRouter {
    tables: RwLock<Tables>,
}

impl PathRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the location at the given path expression, replacing any
    /// location already bound to the identical pattern.
    pub fn set_location(&self, path: &str, location: Arc<HttpLocation>) -> Result<()> {
        let expr = PathExpression::parse(path)?;
        let mut tables = self.tables.write();
        Self::insert(&mut tables, expr, location)
    }

    fn insert(tables: &mut Tables, expr: PathExpression, location: Arc<HttpLocation>) -> Result<()> {
        match expr {
            PathExpression::Trie(pattern) => {
                tables.trie.insert(&pattern, location);
            }
            PathExpression::Regexp(pattern) => {
                let re = compile_anchored(&pattern)?;
                if let Some(entry) = tables.regexps.iter_mut().find(|e| e.pattern == pattern) {
                    entry.re = re;
                    entry.location = location;
                } else {
                    tables.regexps.push(RegexpEntry {
                        pattern,
                        re,
                        location,
                    });
                }
            }
        }
        Ok(())
    }

    /// Drops whatever is bound at the pattern; false when nothing was.
    pub fn remove_path(&self, path: &str) -> Result<bool> {
        let expr = PathExpression::parse(path)?;
        let mut tables = self.tables.write();
        Ok(Self::remove(&mut tables, &expr))
    }

    fn remove(tables: &mut Tables, expr: &PathExpression) -> bool {
        match expr {
            PathExpression::Trie(pattern) => tables.trie.remove(pattern),
            PathExpression::Regexp(pattern) => {
                let before = tables.regexps.len();
                tables.regexps.retain(|e| &e.pattern != pattern);
                tables.regexps.len() != before
            }
        }
    }

    /// Moves a location from one pattern to another in a single critical
    /// section: concurrent traffic sees the old or the new binding, never
    /// neither.
    pub fn rebind(&self, old_path: &str, new_path: &str, location: Arc<HttpLocation>) -> Result<()> {
        let old_expr = PathExpression::parse(old_path)?;
        let new_expr = PathExpression::parse(new_path)?;
        let mut tables = self.tables.write();
        Self::remove(&mut tables, &old_expr);
        Self::insert(&mut tables, new_expr, location)
    }

    pub fn route(&self, path: &str) -> Option<Arc<HttpLocation>> {
        let tables = self.tables.read();
        if let Some(location) = tables.trie.lookup(path) {
            return Some(location);
        }
        tables
            .regexps
            .iter()
            .find(|e| e.re.is_match(path))
            .map(|e| e.location.clone())
    }

    pub fn is_empty(&self) -> bool {
        let tables = self.tables.read();
        tables.trie.is_empty() && tables.regexps.is_empty()
    }
}

fn compile_anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^{pattern}"))
        .map_err(|e| ProxyError::Config(format!("bad route regexp '{pattern}': {e}")))
}
