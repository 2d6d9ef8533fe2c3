//! The single outbound-send path shared by plain-proxy forwarding, replay,
//! and the differential scanner: build a client request from a captured
//! `Request`, send it, and fold the answer back into a `Response`.

use crate::error::ProxyError;
use crate::request::Request;
use crate::response::Response;
use bytes::Bytes;
use http_body_util::Full;
use hyper::Uri;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

/// Re-emit `request` against its recorded `(host, port, is_https)` and
/// return the upstream's answer, classified into `ProxyError` on failure.
pub async fn send_request(request: &Request) -> Result<Response, ProxyError> {
    let scheme = if request.is_https { "https" } else { "http" };
    let uri: Uri = format!("{scheme}://{}:{}{}", request.host, request.port, request.target())
        .parse()
        .map_err(|e| ProxyError::MalformedRequest(format!("invalid replay URI: {e}")))?;

    let connector = HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|e| ProxyError::UpstreamTlsFailure {
            host: request.host.clone(),
            port: request.port,
            detail: e.to_string(),
        })?
        .https_or_http()
        .enable_http1()
        .build();
    let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build(connector);

    let mut builder = hyper::Request::builder().method(request.method.as_str()).uri(uri);
    for (name, value) in request.headers.iter() {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let outbound = builder
        .body(Full::new(request.body.clone()))
        .map_err(|e| ProxyError::MalformedRequest(e.to_string()))?;

    let response = client.request(outbound).await.map_err(|e| {
        if e.is_connect() {
            ProxyError::UnreachableUpstream { host: request.host.clone(), port: request.port }
        } else {
            ProxyError::UpstreamTlsFailure {
                host: request.host.clone(),
                port: request.port,
                detail: e.to_string(),
            }
        }
    })?;

    Response::from_client(response, request.id.unwrap_or(0))
        .await
        .map_err(|e| ProxyError::MalformedRequest(e.to_string()))
}
