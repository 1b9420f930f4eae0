//! Canonical request encoding.
//!
//! A [`Request`] is an ordered mapping from string keys to string values
//! that uniquely identifies a computation. Two requests with the same
//! key/value pairs always produce the same canonical text form, regardless
//! of the order keys were inserted in -- this is what lets the cache and
//! the scheduler use the canonical string as an identity key.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use crate::error::PipelineError;

/// An ordered string-to-string mapping identifying a single computation.
///
/// Backed by a `BTreeMap` so that iteration order -- and therefore the
/// canonical text form produced by [`Request::to_canonical_string`] -- is
/// always sorted by key, independent of insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Request {
    pairs: BTreeMap<String, String>,
}

impl Request {
    /// An empty request.
    pub fn new() -> Self {
        Request {
            pairs: BTreeMap::new(),
        }
    }

    /// Inserts or overwrites `key`, returning the previous value if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.pairs.insert(key.into(), value.into())
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Removes `key`, returning its value if present.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.pairs.remove(key)
    }

    /// Drops every key not in `keep`. Used before cache lookup so that a
    /// source does not key its storage on control keywords it never reads
    /// (spec.md invariant: a source never stores an item under a key that
    /// contains keys it does not itself consume).
    pub fn remove_all_keys_except(&mut self, keep: &BTreeSet<&str>) {
        self.pairs.retain(|k, _| keep.contains(k.as_str()));
    }

    /// True if `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.pairs.contains_key(key)
    }

    /// True if every key in `keys` is present.
    pub fn contains_all(&self, keys: &BTreeSet<&str>) -> bool {
        keys.iter().all(|k| self.pairs.contains_key(*k))
    }

    /// Raw string value lookup.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs.get(key).map(String::as_str)
    }

    /// Parses `key` as an `i64`.
    pub fn get_int(&self, key: &str) -> Result<i64, PipelineError> {
        let raw = self
            .get(key)
            .ok_or_else(|| PipelineError::Key(format!("missing key {}", key)))?;
        raw.parse::<i64>()
            .map_err(|_| PipelineError::Value(format!("key {} is not an integer: {}", key, raw)))
    }

    /// Parses `key` as an `f64`.
    pub fn get_f64(&self, key: &str) -> Result<f64, PipelineError> {
        let raw = self
            .get(key)
            .ok_or_else(|| PipelineError::Key(format!("missing key {}", key)))?;
        raw.parse::<f64>()
            .map_err(|_| PipelineError::Value(format!("key {} is not a float: {}", key, raw)))
    }

    /// Parses `key` as a Unix-epoch timestamp in seconds.
    pub fn get_timestamp(&self, key: &str) -> Result<i64, PipelineError> {
        self.get_int(key)
    }

    /// Parses a slash-joined, ascending-sorted set of unsigned integers,
    /// e.g. `SELECTED_MEMBERS=0/2/5`.
    pub fn get_uint_set(&self, key: &str) -> Result<BTreeSet<u32>, PipelineError> {
        let raw = self
            .get(key)
            .ok_or_else(|| PipelineError::Key(format!("missing key {}", key)))?;
        if raw.is_empty() {
            return Ok(BTreeSet::new());
        }
        raw.split('/')
            .map(|piece| {
                piece.parse::<u32>().map_err(|_| {
                    PipelineError::Value(format!("key {} is not a uint set: {}", key, raw))
                })
            })
            .collect()
    }

    /// Encodes a sorted set of unsigned integers the way [`Request::get_uint_set`]
    /// expects to decode it.
    pub fn encode_uint_set(members: &BTreeSet<u32>) -> String {
        members
            .iter()
            .map(|m| m.to_string())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Replaces `key`'s value with the result of applying `f`, if `key` is
    /// present. Used for inserting derived keys, e.g. resolving
    /// `INIT_TIME=REQUESTED_VALID_TIME` into an actual timestamp value.
    pub fn insert_derived(&mut self, key: &str, f: impl FnOnce(&str) -> String) {
        if let Some(existing) = self.pairs.get(key).cloned() {
            self.pairs.insert(key.to_string(), f(&existing));
        }
    }

    /// Iterates `(key, value)` pairs in canonical (sorted-by-key) order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The canonical text form: keys sorted ascending, `KEY=VALUE` pairs
    /// joined by `;`. `=`, `;`, and `\` within a value are backslash-escaped
    /// so that parsing is unambiguous.
    pub fn to_canonical_string(&self) -> String {
        self.pairs
            .iter()
            .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Parses a string produced by [`Request::to_canonical_string`].
    pub fn parse(text: &str) -> Result<Request, PipelineError> {
        let mut pairs = BTreeMap::new();
        if text.is_empty() {
            return Ok(Request { pairs });
        }
        for segment in split_unescaped(text, ';') {
            let mut kv = split_unescaped(&segment, '=');
            let key = kv
                .next()
                .ok_or_else(|| PipelineError::BadRequest(format!("malformed segment: {}", segment)))?;
            let value = kv
                .next()
                .ok_or_else(|| PipelineError::BadRequest(format!("malformed segment: {}", segment)))?;
            pairs.insert(unescape(&key), unescape(&value));
        }
        Ok(Request { pairs })
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '\\' || c == '=' || c == ';' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn split_unescaped(s: &str, delim: char) -> std::vec::IntoIter<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            current.push(c);
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if c == delim {
            pieces.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    pieces.push(current);
    pieces.into_iter()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalization_ignores_insertion_order() {
        let a = Request::new().with("B", "2").with("A", "1");
        let b = Request::new().with("A", "1").with("B", "2");
        assert_eq!(a.to_canonical_string(), b.to_canonical_string());
        assert_eq!(a, b);
    }

    #[test]
    fn canon_is_idempotent() {
        let r = Request::new().with("VALID_TIME", "2019-01-01T00:00:00");
        let once = r.to_canonical_string();
        let parsed = Request::parse(&once).unwrap();
        assert_eq!(parsed.to_canonical_string(), once);
    }

    #[test]
    fn escapes_reserved_characters_round_trip() {
        let r = Request::new().with("FILTER_BBOX", "-10/20;30/40=x");
        let text = r.to_canonical_string();
        let parsed = Request::parse(&text).unwrap();
        assert_eq!(parsed, r);
    }

    #[test]
    fn remove_all_keys_except_drops_unrelated_keys() {
        let mut r = Request::new().with("A", "1").with("B", "2").with("C", "3");
        let keep: BTreeSet<&str> = ["A", "C"].into_iter().collect();
        r.remove_all_keys_except(&keep);
        assert!(r.contains_key("A"));
        assert!(!r.contains_key("B"));
        assert!(r.contains_key("C"));
    }

    #[test]
    fn uint_set_round_trips_sorted() {
        let members: BTreeSet<u32> = [5, 0, 2].into_iter().collect();
        let encoded = Request::encode_uint_set(&members);
        assert_eq!(encoded, "0/2/5");
        let r = Request::new().with("SELECTED_MEMBERS", encoded);
        assert_eq!(r.get_uint_set("SELECTED_MEMBERS").unwrap(), members);
    }

    #[test]
    fn insert_derived_replaces_placeholder() {
        let mut r = Request::new().with("INIT_TIME", "REQUESTED_VALID_TIME");
        r.insert_derived("INIT_TIME", |_| "2019-01-01T00:00:00".to_string());
        assert_eq!(r.get("INIT_TIME"), Some("2019-01-01T00:00:00"));
    }
}
