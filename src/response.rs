//! Captured-response model: parsing, gzip handling, persistence, and the
//! status+length equality the scanner relies on.

use crate::error::ProxyError;
use crate::message::{self, OrderedMap};
use crate::store::Store;
use anyhow::{Context, Result};
use bytes::Bytes;
use flate2::read::GzDecoder;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// One captured upstream response, persisted alongside its request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: Option<i64>,
    pub request_id: i64,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: OrderedMap<String>,
    pub set_cookie: OrderedMap<String>,
    #[serde(with = "message::serde_bytes_base64")]
    pub body: Bytes,
    /// Set when `Content-Encoding: gzip` was present but decompression
    /// failed; the raw (still-encoded) bytes are kept in `body` instead.
    pub body_decode_failed: bool,
}

impl Response {
    /// Build from a live `hyper` response on the plain-proxy / replay path.
    pub async fn from_client(resp: hyper::Response<Incoming>, request_id: i64) -> Result<Self> {
        let (parts, body) = resp.into_parts();
        let raw_body = body
            .collect()
            .await
            .map_err(|e| ProxyError::MalformedRequest(format!("failed to read response body: {e}")))?
            .to_bytes();

        let mut headers: OrderedMap<String> = OrderedMap::new();
        for (name, value) in parts.headers.iter() {
            headers.insert_ci(name.as_str(), value.to_str().unwrap_or("").to_string());
        }

        let set_cookie = headers
            .get_ci("Set-Cookie")
            .map(message::parse_cookie_header)
            .unwrap_or_default();

        let (body, body_decode_failed) = decompress_if_needed(&headers, raw_body);

        Ok(Self {
            id: None,
            request_id,
            status_code: parts.status.as_u16(),
            reason_phrase: parts
                .status
                .canonical_reason()
                .unwrap_or_else(|| message::canonical_reason_phrase(parts.status.as_u16()))
                .to_string(),
            headers,
            set_cookie,
            body,
            body_decode_failed,
        })
    }

    /// Build from raw HTTP/1.1 bytes accumulated inside a MITM tunnel.
    pub fn from_raw(bytes: &[u8], request_id: i64) -> Result<Self> {
        let mut headers_buf = [httparse::EMPTY_HEADER; 64];
        let mut resp = httparse::Response::new(&mut headers_buf);

        let parsed = resp
            .parse(bytes)
            .map_err(|e| ProxyError::TunnelParseFailure(e.to_string()))?;
        let body_offset = match parsed {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => {
                return Err(ProxyError::TunnelParseFailure("incomplete response".into()).into())
            }
        };

        let status_code = resp
            .code
            .ok_or_else(|| ProxyError::TunnelParseFailure("missing status code".into()))?;

        let mut headers: OrderedMap<String> = OrderedMap::new();
        for h in resp.headers.iter() {
            headers.insert_ci(h.name, String::from_utf8_lossy(h.value).into_owned());
        }

        let set_cookie = headers
            .get_ci("Set-Cookie")
            .map(message::parse_cookie_header)
            .unwrap_or_default();

        let raw_body = Bytes::copy_from_slice(&bytes[body_offset..]);
        let (body, body_decode_failed) = decompress_if_needed(&headers, raw_body);

        Ok(Self {
            id: None,
            request_id,
            status_code,
            reason_phrase: message::canonical_reason_phrase(status_code).to_string(),
            headers,
            set_cookie,
            body,
            body_decode_failed,
        })
    }

    /// Reconstruct from a persisted row.
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let headers_json: String = row.get("headers")?;
        let set_cookie_json: String = row.get("set_cookie")?;
        let body: Vec<u8> = row.get("body")?;

        Ok(Self {
            id: Some(row.get("id")?),
            request_id: row.get("request_id")?,
            status_code: row.get::<_, i64>("code")? as u16,
            reason_phrase: row.get("message")?,
            headers: serde_json::from_str(&headers_json).unwrap_or_default(),
            set_cookie: serde_json::from_str(&set_cookie_json).unwrap_or_default(),
            body: Bytes::from(body),
            body_decode_failed: false,
        })
    }

    /// Persist via a single INSERT against `request_id`, returning the
    /// assigned row id.
    pub fn save(&mut self, store: &Store) -> Result<i64> {
        let id = store
            .save_response(self)
            .context("failed to persist response")?;
        self.id = Some(id);
        Ok(id)
    }

    /// Equality used by the scanner: `status_code` and body length only.
    /// Deliberately loose per spec §9 ("policy knob, not a contract").
    pub fn scan_eq(&self, other: &Response) -> bool {
        self.status_code == other.status_code && self.body.len() == other.body.len()
    }
}

fn decompress_if_needed(headers: &OrderedMap<String>, raw: Bytes) -> (Bytes, bool) {
    let is_gzip = headers
        .get_ci("Content-Encoding")
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);

    if !is_gzip {
        return (raw, false);
    }

    let mut decoder = GzDecoder::new(&raw[..]);
    let mut decoded = Vec::new();
    match decoder.read_to_end(&mut decoded) {
        Ok(_) => (Bytes::from(decoded), false),
        Err(_) => (raw, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body_len: usize) -> Response {
        Response {
            id: None,
            request_id: 1,
            status_code: status,
            reason_phrase: "OK".to_string(),
            headers: OrderedMap::new(),
            set_cookie: OrderedMap::new(),
            body: Bytes::from(vec![0u8; body_len]),
            body_decode_failed: false,
        }
    }

    #[test]
    fn scan_eq_ignores_headers_and_body_content() {
        let a = response(200, 10);
        let b = response(200, 10);
        assert!(a.scan_eq(&b));
    }

    #[test]
    fn scan_eq_differs_on_status_or_length() {
        let baseline = response(200, 500);
        assert!(!baseline.scan_eq(&response(500, 80)));
        assert!(!baseline.scan_eq(&response(200, 80)));
    }

    #[test]
    fn gzip_failure_keeps_raw_bytes_and_sets_flag() {
        let mut headers = OrderedMap::new();
        headers.insert_ci("Content-Encoding", "gzip");
        let (body, failed) = decompress_if_needed(&headers, Bytes::from_static(b"not gzip"));
        assert!(failed);
        assert_eq!(body, Bytes::from_static(b"not gzip"));
    }

    #[test]
    fn from_raw_parses_status_line_and_headers() {
        let raw = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        let response = Response::from_raw(raw, 1).unwrap();
        assert_eq!(response.status_code, 404);
        assert_eq!(response.reason_phrase, "Not Found");
    }
}
