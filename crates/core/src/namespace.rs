//! URL namespaces and the longest-match namespace lookup.

use glob::Pattern;
use serde::{Deserialize, Serialize};

/// What a matching namespace does with a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    /// Serve the target entry when the network request fails.
    Fallback,
    /// Serve the target entry instead of going to the network.
    Intercept,
    /// Online whitelist: never served from the cache.
    Network,
}

impl NamespaceType {
    /// Integer stored in the `Namespaces.type` column.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Fallback => 1,
            Self::Intercept => 2,
            Self::Network => 3,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Fallback),
            2 => Some(Self::Intercept),
            3 => Some(Self::Network),
            _ => None,
        }
    }
}

/// A rule mapping a namespace URL (prefix or pattern) to a target URL.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    #[serde(rename = "type")]
    pub kind: NamespaceType,
    pub namespace_url: String,
    /// Empty for network namespaces.
    #[serde(default)]
    pub target_url: String,
    #[serde(default)]
    pub is_pattern: bool,
}

impl Namespace {
    pub fn new(
        kind: NamespaceType,
        namespace_url: impl Into<String>,
        target_url: impl Into<String>,
        is_pattern: bool,
    ) -> Self {
        Self {
            kind,
            namespace_url: namespace_url.into(),
            target_url: target_url.into(),
            is_pattern,
        }
    }

    /// Literal prefix match, or wildcard match when the namespace is a pattern.
    pub fn is_match(&self, url: &str) -> bool {
        if self.is_pattern {
            match_pattern(url, &self.namespace_url)
        } else {
            url.starts_with(&self.namespace_url)
        }
    }
}

/// Pick the most specific namespace matching `url`.
///
/// The longest namespace URL wins; among equally long matches the one declared
/// first wins.
pub fn find_namespace<'a>(namespaces: &'a [Namespace], url: &str) -> Option<&'a Namespace> {
    let mut best: Option<&Namespace> = None;
    for namespace in namespaces.iter().filter(|ns| ns.is_match(url)) {
        match best {
            Some(current) if current.namespace_url.len() >= namespace.namespace_url.len() => {}
            _ => best = Some(namespace),
        }
    }
    best
}

/// Glob match supporting `*` (any run of characters) and `?` (one character).
///
/// Brackets are literal; a pattern that still fails to compile matches nothing.
pub fn match_pattern(input: &str, pattern: &str) -> bool {
    let mut escaped = String::with_capacity(pattern.len());
    let mut previous = None;
    for c in pattern.chars() {
        match c {
            '[' => escaped.push_str("[[]"),
            ']' => escaped.push_str("[]]"),
            // `**` is a path-component wildcard in glob syntax; one star is equivalent here.
            '*' if previous == Some('*') => {}
            _ => escaped.push(c),
        }
        previous = Some(c);
    }
    Pattern::new(&escaped).is_ok_and(|compiled| compiled.matches(input))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fallback(ns: &str, target: &str) -> Namespace {
        Namespace::new(NamespaceType::Fallback, ns, target, false)
    }

    #[test]
    fn longest_prefix_wins() {
        let namespaces = vec![
            fallback("http://h/a/", "http://h/a.html"),
            fallback("http://h/a/b/", "http://h/ab.html"),
        ];
        let found = find_namespace(&namespaces, "http://h/a/b/c").unwrap();
        assert_eq!(found.namespace_url, "http://h/a/b/");

        // Declaration order does not matter for the longest match.
        let reversed: Vec<_> = namespaces.into_iter().rev().collect();
        let found = find_namespace(&reversed, "http://h/a/b/c").unwrap();
        assert_eq!(found.namespace_url, "http://h/a/b/");
    }

    #[test]
    fn equal_length_ties_go_to_first_declared() {
        let namespaces = vec![
            Namespace::new(NamespaceType::Fallback, "http://h/*/x", "http://h/one", true),
            Namespace::new(NamespaceType::Fallback, "http://h/a/*", "http://h/two", true),
        ];
        let found = find_namespace(&namespaces, "http://h/a/x").unwrap();
        assert_eq!(found.target_url, "http://h/one");
    }

    #[test]
    fn no_match_returns_none() {
        let namespaces = vec![fallback("http://h/a/", "http://h/a.html")];
        assert!(find_namespace(&namespaces, "http://h/b/").is_none());
    }

    #[test]
    fn pattern_namespaces_use_wildcards() {
        let ns = Namespace::new(
            NamespaceType::Intercept,
            "http://h/*/page?.html",
            "http://h/t",
            true,
        );
        assert!(ns.is_match("http://h/x/y/page1.html"));
        assert!(!ns.is_match("http://h/x/page12.html"));
        assert!(!ns.is_match("http://other/x/page1.html"));
    }

    #[test]
    fn literal_namespaces_do_not_expand_wildcards() {
        let ns = fallback("http://h/*", "http://h/t");
        assert!(!ns.is_match("http://h/anything"));
        assert!(ns.is_match("http://h/*suffix"));
    }

    #[test]
    fn match_pattern_edge_cases() {
        assert!(match_pattern("", ""));
        assert!(match_pattern("", "*"));
        assert!(!match_pattern("a", ""));
        assert!(match_pattern("abc", "a*c"));
        assert!(match_pattern("abcbc", "a*bc"));
        assert!(!match_pattern("abcd", "a*c"));
        assert!(match_pattern("http://h/a/b", "http://h/**"));
    }

    #[test]
    fn brackets_in_patterns_are_literal() {
        assert!(match_pattern("http://h/q[1]=x", "http://h/q[1]=*"));
        assert!(!match_pattern("http://h/q1=x", "http://h/q[1]=*"));
        assert!(match_pattern("http://h/[", "http://h/?"));
    }

    #[test]
    fn namespace_type_roundtrips_through_column_value() {
        for kind in [
            NamespaceType::Fallback,
            NamespaceType::Intercept,
            NamespaceType::Network,
        ] {
            assert_eq!(NamespaceType::from_i64(kind.as_i64()), Some(kind));
        }
        assert_eq!(NamespaceType::from_i64(9), None);
    }
}
