//! Manifest parser output contract.
//!
//! The manifest grammar lives outside this workspace. Update jobs only consume
//! the [`Manifest`] produced by a [`ManifestParser`]. [`JsonManifestParser`]
//! maps a JSON document onto the same contract for tooling and tests.

use crate::namespace::{Namespace, NamespaceType};
use crate::{Error, Result, is_cacheable_scheme, origin_of, strip_fragment};
use serde::Deserialize;
use std::collections::BTreeSet;
use url::Url;

/// Whether intercept namespaces may be honored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseMode {
    /// Manifest was not served as `text/cache-manifest`; intercepts are dropped.
    PerStandard,
    /// Manifest was served with the exact cache-manifest content type.
    AllowInterceptNamespaces,
}

/// Parsed manifest: what an update should download and how to route requests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    pub explicit_urls: BTreeSet<String>,
    /// In declaration order.
    pub fallback_namespaces: Vec<Namespace>,
    /// In declaration order.
    pub intercept_namespaces: Vec<Namespace>,
    pub online_whitelist: Vec<Namespace>,
    /// `*` in the network section: anything not cached may go to the network.
    pub online_whitelist_all: bool,
    pub did_ignore_intercept_namespaces: bool,
}

impl Manifest {
    /// Drop intercept namespaces, remembering that some were present.
    pub fn ignore_intercept_namespaces(&mut self) {
        if !self.intercept_namespaces.is_empty() {
            self.intercept_namespaces.clear();
            self.did_ignore_intercept_namespaces = true;
        }
    }
}

/// External manifest parser.
pub trait ManifestParser: Send + Sync + 'static {
    fn parse(&self, manifest_url: &Url, data: &[u8], mode: ParseMode) -> Result<Manifest>;
}

#[derive(Debug, Deserialize)]
struct JsonManifest {
    #[serde(default)]
    explicit: Vec<String>,
    #[serde(default)]
    fallback: Vec<JsonNamespace>,
    #[serde(default)]
    intercept: Vec<JsonNamespace>,
    #[serde(default)]
    network: Vec<JsonNetworkEntry>,
}

#[derive(Debug, Deserialize)]
struct JsonNamespace {
    namespace: String,
    target: String,
    #[serde(default)]
    pattern: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonNetworkEntry {
    Url(String),
    Namespace {
        namespace: String,
        #[serde(default)]
        pattern: bool,
    },
}

/// Maps a JSON manifest document onto the [`Manifest`] contract.
///
/// Relative URLs resolve against the manifest URL. Fallback and intercept
/// namespaces whose namespace or target is cross-origin are dropped.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonManifestParser;

impl JsonManifestParser {
    fn resolve(base: &Url, value: &str) -> Option<Url> {
        let url = base.join(value).ok()?;
        is_cacheable_scheme(&url).then(|| strip_fragment(&url))
    }

    fn namespaces(
        manifest_url: &Url,
        kind: NamespaceType,
        entries: &[JsonNamespace],
    ) -> Vec<Namespace> {
        let origin = origin_of(manifest_url);
        entries
            .iter()
            .filter_map(|entry| {
                // Patterns keep their wildcards; the parsed form only decides
                // which origin they belong to.
                let parsed = Self::resolve(manifest_url, &entry.namespace)?;
                let target = Self::resolve(manifest_url, &entry.target)?;
                if origin_of(&parsed) != origin || origin_of(&target) != origin {
                    return None;
                }
                let namespace = if entry.pattern {
                    entry.namespace.clone()
                } else {
                    parsed.to_string()
                };
                Some(Namespace::new(kind, namespace, target.to_string(), entry.pattern))
            })
            .collect()
    }
}

impl ManifestParser for JsonManifestParser {
    fn parse(&self, manifest_url: &Url, data: &[u8], mode: ParseMode) -> Result<Manifest> {
        let doc: JsonManifest =
            serde_json::from_slice(data).map_err(|e| Error::ManifestParse(e.to_string()))?;

        let mut manifest = Manifest {
            explicit_urls: doc
                .explicit
                .iter()
                .filter_map(|url| Self::resolve(manifest_url, url))
                .map(|url| url.to_string())
                .collect(),
            fallback_namespaces: Self::namespaces(
                manifest_url,
                NamespaceType::Fallback,
                &doc.fallback,
            ),
            intercept_namespaces: Self::namespaces(
                manifest_url,
                NamespaceType::Intercept,
                &doc.intercept,
            ),
            ..Manifest::default()
        };

        for entry in &doc.network {
            match entry {
                JsonNetworkEntry::Url(url) if url == "*" => manifest.online_whitelist_all = true,
                JsonNetworkEntry::Url(url) => {
                    if let Some(url) = Self::resolve(manifest_url, url) {
                        manifest.online_whitelist.push(Namespace::new(
                            NamespaceType::Network,
                            url.to_string(),
                            "",
                            false,
                        ));
                    }
                }
                JsonNetworkEntry::Namespace { namespace, pattern } => {
                    let namespace = if *pattern {
                        Some(namespace.clone())
                    } else {
                        Self::resolve(manifest_url, namespace).map(|url| url.to_string())
                    };
                    if let Some(namespace) = namespace {
                        manifest.online_whitelist.push(Namespace::new(
                            NamespaceType::Network,
                            namespace,
                            "",
                            *pattern,
                        ));
                    }
                }
            }
        }

        if mode == ParseMode::PerStandard {
            manifest.ignore_intercept_namespaces();
        }
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_url() -> Url {
        Url::parse("http://example.com/app/manifest").unwrap()
    }

    #[test]
    fn resolves_relative_urls_against_manifest() {
        let doc = br#"{
            "explicit": ["a.html", "/b.js#frag", "http://cdn.example.net/c.css"],
            "fallback": [{"namespace": "/x/", "target": "/offline.html"}]
        }"#;
        let manifest = JsonManifestParser
            .parse(&manifest_url(), doc, ParseMode::PerStandard)
            .unwrap();

        assert!(manifest.explicit_urls.contains("http://example.com/app/a.html"));
        assert!(manifest.explicit_urls.contains("http://example.com/b.js"));
        assert!(manifest.explicit_urls.contains("http://cdn.example.net/c.css"));
        assert_eq!(manifest.fallback_namespaces.len(), 1);
        assert_eq!(
            manifest.fallback_namespaces[0].namespace_url,
            "http://example.com/x/"
        );
        assert_eq!(
            manifest.fallback_namespaces[0].target_url,
            "http://example.com/offline.html"
        );
    }

    #[test]
    fn cross_origin_fallbacks_are_dropped() {
        let doc = br#"{
            "fallback": [
                {"namespace": "http://other.com/x/", "target": "/offline.html"},
                {"namespace": "/y/", "target": "http://other.com/offline.html"}
            ]
        }"#;
        let manifest = JsonManifestParser
            .parse(&manifest_url(), doc, ParseMode::PerStandard)
            .unwrap();
        assert!(manifest.fallback_namespaces.is_empty());
    }

    #[test]
    fn origin_is_compared_by_host_not_by_prefix() {
        let doc = br#"{
            "fallback": [
                {"namespace": "http://example.com.evil.org/x/", "target": "/offline.html"},
                {"namespace": "http://example.com:8080/x/", "target": "/offline.html"},
                {"namespace": "https://example.com/x/", "target": "/offline.html"},
                {"namespace": "http://example.com.evil.org/*", "target": "/offline.html", "pattern": true},
                {"namespace": "http://example.com/ok/", "target": "/offline.html"}
            ]
        }"#;
        let manifest = JsonManifestParser
            .parse(&manifest_url(), doc, ParseMode::PerStandard)
            .unwrap();

        let kept: Vec<&str> = manifest
            .fallback_namespaces
            .iter()
            .map(|ns| ns.namespace_url.as_str())
            .collect();
        assert_eq!(kept, vec!["http://example.com/ok/"]);
    }

    #[test]
    fn same_origin_patterns_are_kept_verbatim() {
        let doc = br#"{
            "intercept": [{"namespace": "http://example.com/app/*/page", "target": "/t.html", "pattern": true}]
        }"#;
        let manifest = JsonManifestParser
            .parse(&manifest_url(), doc, ParseMode::AllowInterceptNamespaces)
            .unwrap();
        assert_eq!(manifest.intercept_namespaces.len(), 1);
        assert_eq!(
            manifest.intercept_namespaces[0].namespace_url,
            "http://example.com/app/*/page"
        );
        assert!(manifest.intercept_namespaces[0].is_pattern);
    }

    #[test]
    fn intercepts_require_allowing_mode() {
        let doc = br#"{"intercept": [{"namespace": "/i/", "target": "/t.html"}]}"#;

        let strict = JsonManifestParser
            .parse(&manifest_url(), doc, ParseMode::PerStandard)
            .unwrap();
        assert!(strict.intercept_namespaces.is_empty());
        assert!(strict.did_ignore_intercept_namespaces);

        let allowed = JsonManifestParser
            .parse(&manifest_url(), doc, ParseMode::AllowInterceptNamespaces)
            .unwrap();
        assert_eq!(allowed.intercept_namespaces.len(), 1);
        assert!(!allowed.did_ignore_intercept_namespaces);
    }

    #[test]
    fn network_section_supports_wildcard_and_patterns() {
        let doc = br#"{"network": ["*", "/api/", {"namespace": "http://example.com/*.json", "pattern": true}]}"#;
        let manifest = JsonManifestParser
            .parse(&manifest_url(), doc, ParseMode::PerStandard)
            .unwrap();
        assert!(manifest.online_whitelist_all);
        assert_eq!(manifest.online_whitelist.len(), 2);
        assert_eq!(
            manifest.online_whitelist[0].namespace_url,
            "http://example.com/api/"
        );
        assert!(manifest.online_whitelist[1].is_pattern);
    }

    #[test]
    fn malformed_document_is_a_parse_error() {
        let result = JsonManifestParser.parse(&manifest_url(), b"CACHE MANIFEST", ParseMode::PerStandard);
        assert!(matches!(result, Err(Error::ManifestParse(_))));
    }
}
