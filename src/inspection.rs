//! Inspection API (C6): a second `hyper` service exposing the five
//! read/action verbs of spec §4.6 over the store, injection iterator, and
//! differential scanner. Thin by design — no auth, no pagination, no write
//! verbs.

use crate::config::AppConfig;
use crate::error::ProxyError;
use crate::outbound::send_request;
use crate::scanner::DifferentialScanner;
use crate::store::Store;
use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

type BoxBody = http_body_util::combinators::UnsyncBoxBody<Bytes, hyper::Error>;

fn json_body(value: serde_json::Value) -> BoxBody {
    Full::new(Bytes::from(value.to_string())).map_err(|never| match never {}).boxed_unsync()
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(json_body(value))
        .expect("static response is valid")
}

pub struct ApiServer {
    config: Arc<AppConfig>,
    store: Arc<Store>,
}

impl ApiServer {
    pub fn new(config: Arc<AppConfig>, store: Arc<Store>) -> Self {
        Self { config, store }
    }

    pub async fn run(&self) -> Result<()> {
        let addr = SocketAddr::new(
            "0.0.0.0".parse().expect("static address"),
            self.config.api_port,
        );
        let listener = TcpListener::bind(addr).await.context("failed to bind inspection API listener")?;
        tracing::info!("inspection API listening on {addr}");

        loop {
            let (stream, peer) = listener.accept().await?;
            tracing::debug!("inspection API connection from {peer}");

            let store = self.store.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| Self::handle(req, store.clone()));
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::error!("inspection API connection error: {e}");
                }
            });
        }
    }

    async fn handle(req: Request<Incoming>, store: Arc<Store>) -> Result<Response<BoxBody>, hyper::Error> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

        let response = match (method, segments.as_slice()) {
            (Method::GET, ["requests"]) => Self::list_requests(&store),
            (Method::GET, ["requests", id]) => Self::get_request(&store, id),
            (Method::GET, ["responses"]) => Self::list_responses(&store),
            (Method::GET, ["responses", id]) => Self::get_response(&store, id),
            (Method::GET, ["repeat", id]) => Self::repeat(&store, id).await,
            (Method::GET, ["scan", id]) => Self::scan(&store, id).await,
            _ => json_response(StatusCode::NOT_FOUND, json!({"error": "unknown route"})),
        };

        Ok(response)
    }

    fn list_requests(store: &Store) -> Response<BoxBody> {
        match store.list_requests() {
            Ok(rows) => json_response(StatusCode::OK, json!(rows)),
            Err(e) => json_response(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": e.to_string()})),
        }
    }

    fn get_request(store: &Store, id: &str) -> Response<BoxBody> {
        let id: i64 = match id.parse() {
            Ok(id) => id,
            Err(_) => return json_response(StatusCode::NOT_FOUND, json!({"error": "invalid id"})),
        };
        match store.get_request(id) {
            Ok(request) => json_response(StatusCode::OK, json!(request)),
            Err(_) => json_response(
                StatusCode::NOT_FOUND,
                json!({"error": ProxyError::NotFound(format!("no request with id {id}")).to_string()}),
            ),
        }
    }

    fn list_responses(store: &Store) -> Response<BoxBody> {
        match store.list_responses() {
            Ok(rows) => json_response(StatusCode::OK, json!(rows)),
            Err(e) => json_response(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": e.to_string()})),
        }
    }

    fn get_response(store: &Store, id: &str) -> Response<BoxBody> {
        let id: i64 = match id.parse() {
            Ok(id) => id,
            Err(_) => return json_response(StatusCode::NOT_FOUND, json!({"error": "invalid id"})),
        };
        match store.get_response(id) {
            Ok(response) => json_response(StatusCode::OK, json!(response)),
            Err(_) => json_response(
                StatusCode::NOT_FOUND,
                json!({"error": ProxyError::NotFound(format!("no response with id {id}")).to_string()}),
            ),
        }
    }

    /// `GET /repeat/{id}`: reconstruct the request, re-issue it via the
    /// shared outbound path, and return the response as JSON. 501 if the
    /// body can't be decoded to text (spec §4.6).
    async fn repeat(store: &Store, id: &str) -> Response<BoxBody> {
        let id: i64 = match id.parse() {
            Ok(id) => id,
            Err(_) => return json_response(StatusCode::NOT_FOUND, json!({"error": "invalid id"})),
        };

        let request = match store.get_request(id) {
            Ok(r) => r,
            Err(_) => {
                return json_response(
                    StatusCode::NOT_FOUND,
                    json!({"error": ProxyError::NotFound(format!("no request with id {id}")).to_string()}),
                )
            }
        };

        let response = match send_request(&request).await {
            Ok(r) => r,
            Err(e) => return json_response(StatusCode::BAD_GATEWAY, json!({"error": e.to_string()})),
        };

        match std::str::from_utf8(&response.body) {
            Ok(body_text) => json_response(
                StatusCode::OK,
                json!({
                    "status_code": response.status_code,
                    "reason_phrase": response.reason_phrase,
                    "headers": response.headers,
                    "body": body_text,
                }),
            ),
            Err(_) => json_response(
                StatusCode::NOT_IMPLEMENTED,
                json!({"error": ProxyError::ReplayUndecodable.to_string()}),
            ),
        }
    }

    /// `GET /scan/{id}`: run the differential scanner against the stored
    /// request and report findings.
    async fn scan(store: &Store, id: &str) -> Response<BoxBody> {
        let id: i64 = match id.parse() {
            Ok(id) => id,
            Err(_) => return json_response(StatusCode::NOT_FOUND, json!({"error": "invalid id"})),
        };

        let request = match store.get_request(id) {
            Ok(r) => r,
            Err(_) => {
                return json_response(
                    StatusCode::NOT_FOUND,
                    json!({"error": ProxyError::ScanRequestNotFound(id).to_string()}),
                )
            }
        };

        match DifferentialScanner::scan(&request).await {
            Ok(findings) => json_response(StatusCode::OK, json!(findings)),
            Err(e) => json_response(StatusCode::BAD_GATEWAY, json!({"error": e.to_string()})),
        }
    }
}
