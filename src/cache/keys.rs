//! Cache key derivation.
//!
//! A request is reduced to a canonical byte buffer built from the attributes
//! selected by a [`KeyMask`]. The buffer yields two values:
//!
//! - a [`CacheKey`]: hex of the first 128 bits of its SHA-256 digest, used as
//!   the entry file name and as the lock registry key;
//! - a [`Fingerprint`]: its CRC-32, stored inside the entry and compared on
//!   every read to catch two requests landing on the same key.

use std::fmt;
use std::ops::BitOr;

use axum::http::{header, request::Parts};
use sha2::{Digest, Sha256};
use thiserror::Error;

const KEY_DIGEST_BYTES: usize = 16;
const PART_SEPARATOR: u8 = 0;

/// Selects which request attributes participate in the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyMask(u8);

impl KeyMask {
    pub const NONE: Self = Self(0);
    pub const METHOD: Self = Self(1 << 0);
    pub const SCHEME: Self = Self(1 << 1);
    pub const HOST: Self = Self(1 << 2);
    pub const PATH: Self = Self(1 << 3);
    pub const QUERY: Self = Self(1 << 4);
    pub const COOKIE: Self = Self(1 << 5);

    const NAMED: [(&'static str, KeyMask); 6] = [
        ("method", Self::METHOD),
        ("scheme", Self::SCHEME),
        ("host", Self::HOST),
        ("path", Self::PATH),
        ("query", Self::QUERY),
        ("cookie", Self::COOKIE),
    ];

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Build a mask from attribute names such as `["method", "path"]`.
    pub fn from_names<I, S>(names: I) -> Result<Self, KeyMaskError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names.into_iter().try_fold(Self::NONE, |mask, name| {
            let name = name.as_ref().trim();
            Self::NAMED
                .iter()
                .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
                .map(|(_, part)| mask | *part)
                .ok_or_else(|| KeyMaskError::UnknownPart(name.to_string()))
        })
    }

    /// Attribute names selected by this mask, in canonical order.
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(_, part)| self.contains(*part))
            .map(|(name, _)| *name)
            .collect()
    }
}

impl Default for KeyMask {
    /// Method, scheme, host, path and query. Cookies stay out of the key.
    fn default() -> Self {
        Self::METHOD | Self::SCHEME | Self::HOST | Self::PATH | Self::QUERY
    }
}

impl BitOr for KeyMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyMaskError {
    #[error("unknown cache key part `{0}` (expected method, scheme, host, path, query or cookie)")]
    UnknownPart(String),
}

/// Request attributes that may feed the key.
#[derive(Debug, Clone, Default)]
pub struct KeyRequest<'a> {
    pub method: &'a str,
    pub scheme: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub query: &'a str,
    pub cookies: Vec<&'a str>,
}

impl<'a> KeyRequest<'a> {
    /// Extract key attributes from request head parts.
    ///
    /// Server-side request URIs are usually in origin form, so the host falls
    /// back to the `Host` header and the scheme may be empty.
    pub fn from_parts(parts: &'a Parts) -> Self {
        let host = parts.uri.host().unwrap_or_else(|| {
            parts
                .headers
                .get(header::HOST)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("")
        });

        Self {
            method: parts.method.as_str(),
            scheme: parts.uri.scheme_str().unwrap_or(""),
            host,
            path: parts.uri.path(),
            query: parts.uri.query().unwrap_or(""),
            cookies: parts
                .headers
                .get_all(header::COOKIE)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .collect(),
        }
    }

    fn canonical_bytes(&self, mask: KeyMask) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        let mut push = |part: &str| {
            buf.extend_from_slice(part.as_bytes());
            buf.push(PART_SEPARATOR);
        };

        if mask.contains(KeyMask::METHOD) {
            push(self.method);
        }
        if mask.contains(KeyMask::SCHEME) {
            push(self.scheme);
        }
        if mask.contains(KeyMask::HOST) {
            push(self.host);
        }
        if mask.contains(KeyMask::PATH) {
            push(self.path);
        }
        if mask.contains(KeyMask::QUERY) {
            push(self.query);
        }
        if mask.contains(KeyMask::COOKIE) {
            for cookie in &self.cookies {
                push(cookie);
            }
        }
        buf
    }
}

/// Hex digest naming an entry on disk and a record in the lock registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// CRC-32 of the canonical request buffer. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u32);

impl Fingerprint {
    /// Wrap a stored value. Zero is not a valid fingerprint.
    pub fn new(value: u32) -> Option<Self> {
        (value != 0).then_some(Self(value))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derive the cache key and fingerprint for a request.
pub fn compute_key(mask: KeyMask, request: &KeyRequest<'_>) -> (CacheKey, Fingerprint) {
    let buf = request.canonical_bytes(mask);

    let digest = Sha256::digest(&buf);
    let key = CacheKey(hex::encode(&digest[..KEY_DIGEST_BYTES]));

    // An entry with a zero fingerprint is rejected on read.
    let fingerprint = Fingerprint(crc32fast::hash(&buf).max(1));

    (key, fingerprint)
}

#[cfg(test)]
mod tests {
    use axum::http::Request;

    use super::*;

    fn request(path: &'static str, query: &'static str) -> KeyRequest<'static> {
        KeyRequest {
            method: "GET",
            scheme: "http",
            host: "example.com",
            path,
            query,
            cookies: Vec::new(),
        }
    }

    #[test]
    fn same_attributes_produce_same_key() {
        let (key1, fp1) = compute_key(KeyMask::default(), &request("/file.txt", "a=1"));
        let (key2, fp2) = compute_key(KeyMask::default(), &request("/file.txt", "a=1"));
        assert_eq!(key1, key2);
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn key_is_32_hex_chars() {
        let (key, _) = compute_key(KeyMask::default(), &request("/", ""));
        assert_eq!(key.as_str().len(), 32);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn query_changes_the_key() {
        let (key1, _) = compute_key(KeyMask::default(), &request("/posts", "page=1"));
        let (key2, _) = compute_key(KeyMask::default(), &request("/posts", "page=2"));
        assert_ne!(key1, key2);
    }

    #[test]
    fn masked_out_attributes_are_ignored() {
        let mask = KeyMask::METHOD | KeyMask::PATH;
        let (key1, fp1) = compute_key(mask, &request("/posts", "page=1"));
        let (key2, fp2) = compute_key(mask, &request("/posts", "page=2"));
        assert_eq!(key1, key2);
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn separators_keep_path_and_query_apart() {
        let (key1, _) = compute_key(KeyMask::default(), &request("/ab", ""));
        let (key2, _) = compute_key(KeyMask::default(), &request("/a", "b"));
        assert_ne!(key1, key2);
    }

    #[test]
    fn host_is_part_of_the_default_key() {
        let mut other = request("/", "");
        other.host = "other.example.com";
        let (key1, _) = compute_key(KeyMask::default(), &request("/", ""));
        let (key2, _) = compute_key(KeyMask::default(), &other);
        assert_ne!(key1, key2);
    }

    #[test]
    fn cookies_only_count_when_selected() {
        let mut with_cookie = request("/", "");
        with_cookie.cookies = vec!["session=abc"];

        let (plain, _) = compute_key(KeyMask::default(), &request("/", ""));
        let (cookie_ignored, _) = compute_key(KeyMask::default(), &with_cookie);
        assert_eq!(plain, cookie_ignored);

        let mask = KeyMask::default() | KeyMask::COOKIE;
        let (cookie_keyed, _) = compute_key(mask, &with_cookie);
        let (no_cookie, _) = compute_key(mask, &request("/", ""));
        assert_ne!(cookie_keyed, no_cookie);
    }

    #[test]
    fn from_parts_falls_back_to_host_header() {
        let (parts, _) = Request::builder()
            .uri("/posts?tag=rust")
            .header("host", "blog.example.com")
            .header("cookie", "a=1")
            .header("cookie", "b=2")
            .body(())
            .unwrap()
            .into_parts();

        let req = KeyRequest::from_parts(&parts);
        assert_eq!(req.method, "GET");
        assert_eq!(req.scheme, "");
        assert_eq!(req.host, "blog.example.com");
        assert_eq!(req.path, "/posts");
        assert_eq!(req.query, "tag=rust");
        assert_eq!(req.cookies, vec!["a=1", "b=2"]);
    }

    #[test]
    fn from_parts_prefers_absolute_uri() {
        let (parts, _) = Request::builder()
            .uri("https://cdn.example.com/img.png")
            .header("host", "ignored.example.com")
            .body(())
            .unwrap()
            .into_parts();

        let req = KeyRequest::from_parts(&parts);
        assert_eq!(req.scheme, "https");
        assert_eq!(req.host, "cdn.example.com");
    }

    #[test]
    fn mask_from_names() {
        let mask = KeyMask::from_names(["method", "PATH", " query "]).unwrap();
        assert_eq!(mask, KeyMask::METHOD | KeyMask::PATH | KeyMask::QUERY);
        assert_eq!(mask.names(), vec!["method", "path", "query"]);

        let err = KeyMask::from_names(["method", "fragment"]).unwrap_err();
        assert_eq!(err, KeyMaskError::UnknownPart("fragment".to_string()));
    }

    #[test]
    fn fingerprint_rejects_zero() {
        assert!(Fingerprint::new(0).is_none());
        assert_eq!(Fingerprint::new(42).map(Fingerprint::get), Some(42));
    }
}
