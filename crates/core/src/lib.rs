//! Core domain types and shared logic for the stowage offline cache.
//!
//! This crate defines the data model used across all other crates:
//! - Entry roles and cached entry metadata
//! - Fallback, intercept and network namespaces, and the namespace matcher
//! - The manifest parser output contract
//! - Stored response headers
//! - Host-facing events and error details
//! - Configuration

pub mod config;
pub mod entry;
pub mod error;
pub mod event;
pub mod info;
pub mod manifest;
pub mod namespace;
pub mod response;

pub use entry::{Entry, EntryFlags};
pub use error::{Error, Result};
pub use event::{ErrorDetails, ErrorReason, EventId, UpdateStatus};
pub use info::{AppCacheInfo, AppCacheInfoCollection};
pub use manifest::{JsonManifestParser, Manifest, ManifestParser, ParseMode};
pub use namespace::{Namespace, NamespaceType, find_namespace, match_pattern};
pub use response::ResponseInfo;
pub use url::Url;

/// Content type that enables intercept namespaces in a manifest.
pub const CACHE_MANIFEST_MIME_TYPE: &str = "text/cache-manifest";

/// Serialized origin (`scheme://host[:port]`) of a URL.
pub fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Strip the fragment so lookups match the stored entry key.
pub fn strip_fragment(url: &Url) -> Url {
    let mut url = url.clone();
    url.set_fragment(None);
    url
}

/// Whether the URL uses a scheme the cache can serve.
pub fn is_cacheable_scheme(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_includes_non_default_port() {
        let url = Url::parse("http://example.com:8080/app/manifest").unwrap();
        assert_eq!(origin_of(&url), "http://example.com:8080");

        let url = Url::parse("https://example.com/manifest").unwrap();
        assert_eq!(origin_of(&url), "https://example.com");
    }

    #[test]
    fn strip_fragment_drops_only_the_fragment() {
        let url = Url::parse("http://example.com/page?q=1#top").unwrap();
        assert_eq!(strip_fragment(&url).as_str(), "http://example.com/page?q=1");
    }

    #[test]
    fn only_http_schemes_are_cacheable() {
        assert!(is_cacheable_scheme(&Url::parse("http://a/").unwrap()));
        assert!(is_cacheable_scheme(&Url::parse("https://a/").unwrap()));
        assert!(!is_cacheable_scheme(&Url::parse("ftp://a/").unwrap()));
    }
}
