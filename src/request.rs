//! Captured-request model: parsing, normalization, persistence, and wire
//! re-emission.

use crate::error::ProxyError;
use crate::message::{self, OrderedMap, ParamValue};
use crate::store::Store;
use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::Uri;
use serde::{Deserialize, Serialize};

/// One captured client request, normalized per spec §4.2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: Option<i64>,
    pub method: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub get_params: OrderedMap<ParamValue>,
    pub headers: OrderedMap<String>,
    pub cookies: OrderedMap<String>,
    #[serde(with = "message::serde_bytes_base64")]
    pub body: Bytes,
    pub post_params: OrderedMap<ParamValue>,
    pub is_https: bool,
}

impl Request {
    /// Build from a live `hyper` request on the plain-proxy path.
    pub async fn from_handler(req: hyper::Request<Incoming>, is_https: bool) -> Result<Self> {
        let (parts, body) = req.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| ProxyError::MalformedRequest(format!("failed to read body: {e}")))?
            .to_bytes();

        Self::from_parts(&parts.method, parts.uri, &parts.headers, body_bytes, is_https)
    }

    fn from_parts(
        method: &hyper::Method,
        uri: Uri,
        headers: &hyper::HeaderMap,
        body: Bytes,
        is_https: bool,
    ) -> Result<Self> {
        let mut header_map: OrderedMap<String> = OrderedMap::new();
        for (name, value) in headers.iter() {
            let value = value.to_str().unwrap_or("").to_string();
            header_map.insert_ci(name.as_str(), value);
        }
        header_map.remove_ci("Proxy-Connection");

        let (host, port) = derive_host_port(&uri, &header_map, is_https)?;
        // Absolute-URI targets overwrite `Host` with the derived value; the
        // Host-header fallback case leaves it as-is (that's where host/port
        // were read from in the first place). Spec §4.2 step 2.
        if uri.host().is_some() {
            header_map.insert_ci("Host", format!("{host}:{port}"));
        }

        let path = uri.path().to_string();
        let get_params = uri
            .query()
            .map(message::parse_query_params)
            .unwrap_or_default();

        let cookies = header_map
            .get_ci("Cookie")
            .map(message::parse_cookie_header)
            .unwrap_or_default();

        let post_params = if is_form_urlencoded(&header_map) && !body.is_empty() {
            message::parse_form_params(&body)
        } else {
            OrderedMap::new()
        };

        Ok(Self {
            id: None,
            method: method.as_str().to_string(),
            host,
            port,
            path,
            get_params,
            headers: header_map,
            cookies,
            body,
            post_params,
            is_https,
        })
    }

    /// Build from raw HTTP/1.1 bytes accumulated inside a MITM tunnel.
    pub fn from_raw(bytes: &[u8], host: &str, port: u16) -> Result<Self> {
        let mut headers_buf = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers_buf);

        let parsed = req
            .parse(bytes)
            .map_err(|e| ProxyError::TunnelParseFailure(e.to_string()))?;
        let body_offset = match parsed {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => {
                return Err(ProxyError::TunnelParseFailure("incomplete request".into()).into())
            }
        };

        let method = req
            .method
            .ok_or_else(|| ProxyError::TunnelParseFailure("missing method".into()))?;
        let target = req
            .path
            .ok_or_else(|| ProxyError::TunnelParseFailure("missing target".into()))?;

        let mut header_map: OrderedMap<String> = OrderedMap::new();
        for h in req.headers.iter() {
            header_map.insert_ci(h.name, String::from_utf8_lossy(h.value).into_owned());
        }
        header_map.remove_ci("Proxy-Connection");

        let body = Bytes::copy_from_slice(&bytes[body_offset..]);

        let uri: Uri = target
            .parse()
            .unwrap_or_else(|_| format!("/{}", target.trim_start_matches('/')).parse().unwrap());

        let path = uri.path().to_string();
        let get_params = uri
            .query()
            .map(message::parse_query_params)
            .unwrap_or_default();

        let cookies = header_map
            .get_ci("Cookie")
            .map(message::parse_cookie_header)
            .unwrap_or_default();

        let post_params = if is_form_urlencoded(&header_map) && !body.is_empty() {
            message::parse_form_params(&body)
        } else {
            OrderedMap::new()
        };

        Ok(Self {
            id: None,
            method: method.to_string(),
            host: host.to_string(),
            port,
            path,
            get_params,
            headers: header_map,
            cookies,
            body,
            post_params,
            is_https: true,
        })
    }

    /// Plain-field constructor used by tests and the injection iterator.
    #[allow(clippy::too_many_arguments)]
    pub fn from_fields(
        method: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
        get_params: OrderedMap<ParamValue>,
        headers: OrderedMap<String>,
        cookies: OrderedMap<String>,
        body: Bytes,
        post_params: OrderedMap<ParamValue>,
        is_https: bool,
    ) -> Self {
        Self {
            id: None,
            method: method.into(),
            host: host.into(),
            port,
            path: path.into(),
            get_params,
            headers,
            cookies,
            body,
            post_params,
            is_https,
        }
    }

    /// Reconstruct from a persisted row. `row` is `(id, method, host, port,
    /// path, get_params_json, headers_json, cookies_json, body, post_params_json, is_https)`.
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let get_params_json: String = row.get("get_params")?;
        let headers_json: String = row.get("headers")?;
        let cookies_json: String = row.get("cookies")?;
        let post_params_json: String = row.get("post_params")?;
        let body: Vec<u8> = row.get("body")?;

        Ok(Self {
            id: Some(row.get("id")?),
            method: row.get("method")?,
            host: row.get("host")?,
            port: row.get::<_, i64>("port")? as u16,
            path: row.get("path")?,
            get_params: serde_json::from_str(&get_params_json).unwrap_or_default(),
            headers: serde_json::from_str(&headers_json).unwrap_or_default(),
            cookies: serde_json::from_str(&cookies_json).unwrap_or_default(),
            body: Bytes::from(body),
            post_params: serde_json::from_str(&post_params_json).unwrap_or_default(),
            is_https: row.get("is_https")?,
        })
    }

    /// Persist via a single INSERT, returning the assigned row id.
    pub fn save(&mut self, store: &Store) -> Result<i64> {
        let id = store
            .save_request(self)
            .context("failed to persist request")?;
        self.id = Some(id);
        Ok(id)
    }

    /// Reassemble the request for the wire: `METHOD path?query HTTP/1.1`,
    /// headers in original order, then `CRLFCRLF`, then body.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 256);

        out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", self.method, self.target()).as_bytes());

        for (name, value) in self.headers.iter() {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    /// `path` plus a `?query` suffix rebuilt from `get_params`, used both
    /// for wire emission and for building the outbound request URI.
    pub fn target(&self) -> String {
        let query = self.query_string();
        if query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, query)
        }
    }

    /// Rebuild the query string from `get_params`, in insertion order.
    fn query_string(&self) -> String {
        let mut pairs: Vec<(String, String)> = Vec::new();
        for (name, value) in self.get_params.iter() {
            match value {
                ParamValue::Single(v) => pairs.push((name.clone(), v.clone())),
                ParamValue::Multi(values) => {
                    for v in values {
                        pairs.push((name.clone(), v.clone()));
                    }
                }
            }
        }
        form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish()
    }
}

fn is_form_urlencoded(headers: &OrderedMap<String>) -> bool {
    headers
        .get_ci("Content-Type")
        .map(|v| v.contains("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

/// Derive `(host, port)` per spec §4.2 step 2: absolute-URI wins, falling
/// back to splitting the `Host` header on its first colon.
fn derive_host_port(uri: &Uri, headers: &OrderedMap<String>, is_https: bool) -> Result<(String, u16)> {
    if let Some(host) = uri.host() {
        let default_port = if is_https { 443 } else { 80 };
        let port = match uri.port_u16() {
            Some(p) => p,
            // `http::Uri` treats a malformed port segment as "no port" rather
            // than a parse error, so `http://ex:ample.com/test` would
            // otherwise silently default to port 80/443 with host "ex". Spec
            // §8 scenario 2 requires this to fail as a bad request instead.
            None => {
                let authority = uri.authority().map(|a| a.as_str()).unwrap_or("");
                match authority.rsplit_once(':') {
                    Some((_, port_str)) if !port_str.is_empty() && port_str.parse::<u16>().is_err() => {
                        return Err(ProxyError::MalformedRequest(format!(
                            "invalid port in URI authority: {authority}"
                        ))
                        .into());
                    }
                    _ => default_port,
                }
            }
        };
        return Ok((host.to_string(), port));
    }

    let host_header = headers
        .get_ci("Host")
        .ok_or_else(|| ProxyError::MalformedRequest("no Host header or absolute URI".into()))?;

    match host_header.split_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| ProxyError::MalformedRequest(format!("bad port in Host: {host_header}")))?;
            Ok((host.to_string(), port))
        }
        None => {
            let default_port = if is_https { 443 } else { 80 };
            Ok((host_header.to_string(), default_port))
        }
    }
}
