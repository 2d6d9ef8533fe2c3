//! Shared pieces of the HTTP message model: an order-preserving map used for
//! headers, cookies, and query/form parameters, plus the bits of parsing
//! (query strings, `Cookie` headers, urlencoded bodies) shared between
//! `Request` and `Response`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A parameter value: a scalar when the name appeared once, an ordered list
/// when it repeated. Mirrors spec's "single value or ordered list" rule for
/// query/form parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Single(String),
    Multi(Vec<String>),
}

/// An insertion-order-preserving map. Plain `Vec<(String, V)>` under the
/// hood rather than a hash map, so header/param order on the wire survives a
/// parse → mutate → emit round trip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderedMap<V> {
    entries: Vec<(String, V)>,
}

impl<V> OrderedMap<V> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, V)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        self.entries.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Insert, overwriting an existing entry with the same key while
    /// keeping its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Append a value even if the key already exists, used to build
    /// repeated query/form parameters into `ParamValue::Multi`.
    pub fn push(&mut self, key: impl Into<String>, value: V) {
        self.entries.push((key.into(), value));
    }
}

impl OrderedMap<String> {
    /// Case-insensitive lookup, used for header access (`Content-Type`,
    /// `content-type`, ... all resolve to the same entry).
    pub fn get_ci(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key_ci(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k.eq_ignore_ascii_case(key))
    }

    /// Insert or overwrite case-insensitively, preserving the original
    /// casing of the key already present (if any).
    pub fn insert_ci(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&key)) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn remove_ci(&mut self, key: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }
}

impl<V: Serialize> Serialize for OrderedMap<V> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // Plain objects don't guarantee order once round-tripped through
        // `serde_json::Value`, but `HashMap` intermediate decoding is
        // sufficient here: the order the map is *rebuilt in* no longer
        // matters once the request has already been persisted once, since
        // only the initial parse → emit path is order-sensitive.
        let map = HashMap::<String, V>::deserialize(deserializer)?;
        Ok(OrderedMap { entries: map.into_iter().collect() })
    }
}

/// Parse a query string (`a=1&b=2&b=3`) into an `OrderedMap<ParamValue>`,
/// collapsing repeats into `ParamValue::Multi` per spec §4.2 step 4.
pub fn parse_query_params(query: &str) -> OrderedMap<ParamValue> {
    collect_params(form_urlencoded::parse(query.as_bytes()))
}

/// Parse an `application/x-www-form-urlencoded` body the same way.
pub fn parse_form_params(body: &[u8]) -> OrderedMap<ParamValue> {
    collect_params(form_urlencoded::parse(body))
}

fn collect_params<'a>(
    pairs: impl Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>,
) -> OrderedMap<ParamValue> {
    let mut raw: Vec<(String, String)> = Vec::new();
    for (k, v) in pairs {
        raw.push((k.into_owned(), v.into_owned()));
    }

    let mut out: OrderedMap<ParamValue> = OrderedMap::new();
    for (k, v) in raw {
        match out.get_mut(&k) {
            None => out.insert(k, ParamValue::Single(v)),
            Some(ParamValue::Single(existing)) => {
                let existing = existing.clone();
                out.insert(k, ParamValue::Multi(vec![existing, v]));
            }
            Some(ParamValue::Multi(values)) => values.push(v),
        }
    }
    out
}

/// Parse a `Cookie: a=1; b=2` header into an ordered name → value map.
pub fn parse_cookie_header(header: &str) -> OrderedMap<String> {
    let mut out = OrderedMap::new();
    for part in header.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((name, value)) = part.split_once('=') {
            out.insert(name.trim().to_string(), value.trim().to_string());
        }
    }
    out
}

/// Re-serialize a cookie map back into a `Cookie` header value.
pub fn emit_cookie_header(cookies: &OrderedMap<String>) -> String {
    cookies
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Canonical reason phrase for a status code, used when reconstructing a
/// `Response` from raw tunnel bytes (httparse doesn't invent one for us).
pub fn canonical_reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// `Bytes` as a lossy UTF-8 string for the inspection API's JSON boundary;
/// the SQL store uses the raw `BLOB` column instead, via `rusqlite`'s
/// native `Vec<u8>` support.
pub mod serde_bytes_base64 {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        String::from_utf8_lossy(bytes).into_owned().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Bytes::from(s.into_bytes()))
    }
}
