//! Resource key derivation from request URLs.
//!
//! Two derivations exist. [`derive_key`] is used when intercepting requests
//! and normalizes cache-busting suffixes and in-page fragments.
//! [`content_key`] is used when diffing cached entries during activation
//! and only maps the empty path to the root.

use crate::manifest::ResourceKey;

/// Query marker appended by the application loader to bust HTTP caches.
const VERSION_QUERY: &str = "?v=";

/// Derives the manifest key for an intercepted request.
///
/// - the URL is taken relative to `origin + "/"`
/// - everything from `?v=` onwards is dropped
/// - the origin itself, `origin + "/#..."` and an empty relative path all
///   map to the root key `"/"`
///
/// A URL outside `origin` yields the URL itself as key, which never matches
/// an origin-relative manifest entry.
#[must_use]
pub fn derive_key(request_url: &str, origin: &str) -> ResourceKey {
    let origin = origin.trim_end_matches('/');
    let Some(rest) = request_url.strip_prefix(origin) else {
        return ResourceKey::new(request_url);
    };
    if rest.is_empty() || rest.starts_with("/#") {
        return ResourceKey::root();
    }
    let Some(relative) = rest.strip_prefix('/') else {
        // Same prefix, different host (`https://app.example.com.evil/...`).
        return ResourceKey::new(request_url);
    };
    let relative = relative
        .split_once(VERSION_QUERY)
        .map_or(relative, |(path, _)| path);
    ResourceKey::new(relative)
}

/// Derives the manifest key of a URL stored in the content partition.
#[must_use]
pub fn content_key(cached_url: &str, origin: &str) -> ResourceKey {
    let origin = origin.trim_end_matches('/');
    cached_url
        .strip_prefix(origin)
        .and_then(|rest| rest.strip_prefix('/'))
        .map_or_else(|| ResourceKey::new(cached_url), ResourceKey::new)
}

/// The URL a key is cached under.
///
/// Every request that derives to the same key shares this entry.
#[must_use]
pub fn canonical_url(key: &ResourceKey, origin: &str) -> String {
    let origin = origin.trim_end_matches('/');
    if key.is_root() {
        format!("{origin}/")
    } else {
        format!("{origin}/{key}")
    }
}
