//! Common test utilities shared by the integration suite.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request as HyperRequest, Response as HyperResponse, StatusCode};
use hyper_util::rt::TokioIo;
use sqli_proxy::message::{OrderedMap, ParamValue};
use sqli_proxy::request::Request;
use sqli_proxy::store::Store;
use std::net::SocketAddr;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Open an on-disk store inside a fresh temp directory, keeping the
/// directory alive for the caller's lifetime.
pub fn open_test_store() -> (Store, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let store = Store::open(dir.path().join("proxy.db")).expect("failed to open store");
    (store, dir)
}

/// Build a minimal captured request with a single query parameter, useful
/// wherever a test just needs *a* persistable request.
pub fn sample_request(host: &str, path: &str, param: &str, value: &str) -> Request {
    let mut get_params = OrderedMap::new();
    get_params.insert(param, ParamValue::Single(value.to_string()));

    let mut headers = OrderedMap::new();
    headers.insert_ci("Host", host);

    Request::from_fields(
        "GET",
        host,
        80,
        path,
        get_params,
        headers,
        OrderedMap::new(),
        Bytes::new(),
        OrderedMap::new(),
        false,
    )
}

/// Spin up a minimal HTTP server, bound to an OS-assigned port, whose
/// response diverges in status and body length whenever the request's query
/// string or any header value carries a raw quote character. Stands in for a
/// SQL-injection-vulnerable upstream in scanner/replay integration tests.
pub async fn spawn_vulnerable_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test upstream");
    let addr = listener.local_addr().expect("failed to read local addr");

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(handle_tainted_or_clean);
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    addr
}

async fn handle_tainted_or_clean(
    req: HyperRequest<Incoming>,
) -> Result<HyperResponse<Full<Bytes>>, std::convert::Infallible> {
    // Only the query string is treated as a taint source: callers that also
    // want header/cookie mutations to diverge should extend this, but a
    // query-only oracle keeps the scanner integration test's expected
    // finding count unambiguous (one point yields a divergence, not every
    // mutated header too).
    let query_tainted = req
        .uri()
        .query()
        .map(|q| q.contains('\'') || q.contains('"'))
        .unwrap_or(false);

    let (status, body_len) = if query_tainted {
        (StatusCode::INTERNAL_SERVER_ERROR, 80)
    } else {
        (StatusCode::OK, 500)
    };

    Ok(HyperResponse::builder()
        .status(status)
        .body(Full::new(Bytes::from(vec![b'x'; body_len])))
        .expect("static response is valid"))
}
