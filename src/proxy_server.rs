//! Connection handler (C4) and listener/dispatcher (C5): terminates one
//! client connection at a time, dispatching plain-proxy requests and
//! `CONNECT` tunnels, and owns the shared DB/CA/config state every
//! connection task borrows.

use crate::certificate_manager::{CertificateAuthority, LeafCertificate};
use crate::config::AppConfig;
use crate::error::ProxyError;
use crate::outbound::send_request;
use crate::request::Request as CapturedRequest;
use crate::response::Response as CapturedResponse;
use crate::store::Store;
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_rustls::{TlsAcceptor, TlsConnector};

type BoxBody = http_body_util::combinators::UnsyncBoxBody<Bytes, hyper::Error>;

const RELAY_BUFSIZE: usize = 4096;
const RELAY_TIMEOUT: Duration = Duration::from_secs(1);

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed_unsync()
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody> {
    Response::builder().status(status).body(full(body.into())).expect("static response is valid")
}

/// Removes the issued leaf certificate file on drop, regardless of which
/// `?`/return in `mitm_tunnel` triggers it. Guarantees "tunnel close" leaf
/// cleanup (spec §4.1/§4.4) even when TLS handshakes or the upstream
/// connect fail before the relay ever runs.
struct LeafGuard<'a> {
    ca: &'a CertificateAuthority,
    leaf: &'a LeafCertificate,
}

impl Drop for LeafGuard<'_> {
    fn drop(&mut self) {
        self.ca.remove_leaf(self.leaf);
    }
}

pub struct ProxyServer {
    config: Arc<AppConfig>,
    ca: Arc<CertificateAuthority>,
    store: Arc<Store>,
}

impl ProxyServer {
    pub fn new(config: Arc<AppConfig>, store: Arc<Store>) -> Result<Self> {
        let ca = Arc::new(CertificateAuthority::load(&config.tls.cert_dir, &config.tls.serial_dir)?);
        Ok(Self { config, ca, store })
    }

    pub async fn run(&self) -> Result<()> {
        let addr = SocketAddr::new(self.config.listen_addr, self.config.proxy_port);
        let listener = TcpListener::bind(addr).await.context("failed to bind proxy listener")?;
        tracing::info!("proxy listening on {addr}");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    tracing::debug!("accepted connection from {peer}");

                    let ca = self.ca.clone();
                    let store = self.store.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, ca, store).await {
                            tracing::error!("connection error: {e}");
                        }
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown signal received, purging CA material");
                    self.ca.purge();
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(stream: TcpStream, ca: Arc<CertificateAuthority>, store: Arc<Store>) -> Result<()> {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| Self::dispatch(req, ca.clone(), store.clone()));

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await?;

        Ok(())
    }

    async fn dispatch(
        req: Request<Incoming>,
        ca: Arc<CertificateAuthority>,
        store: Arc<Store>,
    ) -> Result<Response<BoxBody>, hyper::Error> {
        if req.method() == Method::CONNECT {
            return Ok(Self::handle_connect(req, ca, store).await);
        }
        Ok(Self::handle_plain_proxy(req, store).await)
    }

    /// Plain proxy mode, spec §4.4 steps 1-6.
    async fn handle_plain_proxy(req: Request<Incoming>, store: Arc<Store>) -> Response<BoxBody> {
        let mut captured = match CapturedRequest::from_handler(req, false).await {
            Ok(r) => r,
            Err(e) => {
                let proxy_err = ProxyError::MalformedRequest(e.to_string());
                return text_response(
                    StatusCode::from_u16(proxy_err.status_code()).unwrap_or(StatusCode::BAD_REQUEST),
                    proxy_err.phrase(),
                );
            }
        };

        let request_id = match captured.save(&store) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!("failed to persist request: {e}");
                0
            }
        };
        captured.id = Some(request_id);

        let upstream = match send_request(&captured).await {
            Ok(r) => r,
            Err(proxy_err) => {
                tracing::warn!("outbound request to {}:{} failed: {proxy_err}", captured.host, captured.port);
                let status = if proxy_err.status_code() == 0 { 502 } else { proxy_err.status_code() };
                return text_response(
                    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                    proxy_err.phrase(),
                );
            }
        };

        let mut response_to_save = upstream.clone();
        if let Err(e) = response_to_save.save(&store) {
            tracing::error!("failed to persist response: {e}");
        }

        let mut builder = Response::builder()
            .status(StatusCode::from_u16(upstream.status_code).unwrap_or(StatusCode::OK));
        for (name, value) in upstream.headers.iter() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
            .body(full(upstream.body.clone()))
            .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "response build failed"))
    }

    /// `CONNECT host:port`: reply `200 Connection established`, then hand
    /// the upgraded connection to `mitm_tunnel`.
    async fn handle_connect(
        req: Request<Incoming>,
        ca: Arc<CertificateAuthority>,
        store: Arc<Store>,
    ) -> Response<BoxBody> {
        let authority = match req.uri().authority() {
            Some(a) => a.as_str().to_string(),
            None => return text_response(StatusCode::BAD_REQUEST, "CONNECT missing authority"),
        };

        let (host, port) = split_authority(&authority);

        let upgrade = hyper::upgrade::on(req);
        tokio::spawn(async move {
            match upgrade.await {
                Ok(upgraded) => {
                    if let Err(e) = Self::mitm_tunnel(upgraded, host.clone(), port, ca, store).await {
                        tracing::warn!("tunnel to {host}:{port} ended with error: {e}");
                    }
                }
                Err(e) => tracing::error!("CONNECT upgrade failed: {e}"),
            }
        });

        Response::new(full(Bytes::new()))
    }

    async fn mitm_tunnel(
        upgraded: hyper::upgrade::Upgraded,
        host: String,
        port: u16,
        ca: Arc<CertificateAuthority>,
        store: Arc<Store>,
    ) -> Result<()> {
        let leaf = ca.issue(&host).await.context("failed to issue leaf certificate")?;
        // From here on, every exit path (`?` or early `return`) must remove
        // the just-issued leaf file; the guard's `Drop` makes that true
        // unconditionally instead of repeating the cleanup at each arm.
        let _leaf_guard = LeafGuard { ca: ca.as_ref(), leaf: &leaf };

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(leaf.certs_der.clone(), leaf.key_der.clone_key())
            .map_err(|e| ProxyError::ClientTlsFailure(e.to_string()))?;
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let client_tls = acceptor
            .accept(TokioIo::new(upgraded))
            .await
            .map_err(|e| ProxyError::ClientTlsFailure(e.to_string()))?;

        let upstream_tcp = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|_| ProxyError::UnreachableUpstream { host: host.clone(), port })?;

        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let client_config = ClientConfig::builder().with_root_certificates(root_store).with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client_config));
        let server_name = ServerName::try_from(host.clone()).map_err(|e| ProxyError::UpstreamTlsFailure {
            host: host.clone(),
            port,
            detail: e.to_string(),
        })?;
        let upstream_tls = connector
            .connect(server_name, upstream_tcp)
            .await
            .map_err(|e| ProxyError::UpstreamTlsFailure {
                host: host.clone(),
                port,
                detail: e.to_string(),
            })?;

        let (raw_request, raw_response) = Self::relay(client_tls, upstream_tls).await;

        if let Ok(mut request) = CapturedRequest::from_raw(&raw_request, &host, port) {
            let request_id = match request.save(&store) {
                Ok(id) => id,
                Err(e) => {
                    tracing::error!("failed to persist tunneled request: {e}");
                    return Ok(());
                }
            };

            if let Ok(mut response) = CapturedResponse::from_raw(&raw_response, request_id) {
                if let Err(e) = response.save(&store) {
                    tracing::error!("failed to persist tunneled response: {e}");
                }
            } else if !raw_response.is_empty() {
                tracing::warn!("failed to parse tunneled response for {host}");
            }
        } else if !raw_request.is_empty() {
            tracing::warn!("failed to parse tunneled request for {host}");
        }

        Ok(())
    }

    /// Bidirectional relay over the terminated TLS streams, using a
    /// bounded-timeout read loop per spec §4.4 step 4. Only the first
    /// request/response exchange is captured (§9b).
    async fn relay<A, B>(mut client: A, mut upstream: B) -> (Vec<u8>, Vec<u8>)
    where
        A: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        let mut raw_request = BytesMut::new();
        let mut raw_response = BytesMut::new();
        let mut buf = [0u8; RELAY_BUFSIZE];

        loop {
            tokio::select! {
                result = timeout(RELAY_TIMEOUT, client.read(&mut buf)) => {
                    // A bare timeout is not a socket exception: go back to
                    // waiting on both sides rather than tearing down the
                    // tunnel (spec §5).
                    match result {
                        Err(_) => continue,
                        Ok(Ok(0)) | Ok(Err(_)) => break,
                        Ok(Ok(n)) => {
                            raw_request.extend_from_slice(&buf[..n]);
                            if upstream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                result = timeout(RELAY_TIMEOUT, upstream.read(&mut buf)) => {
                    match result {
                        Err(_) => continue,
                        Ok(Ok(0)) | Ok(Err(_)) => break,
                        Ok(Ok(n)) => {
                            raw_response.extend_from_slice(&buf[..n]);
                            if client.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        (raw_request.to_vec(), raw_response.to_vec())
    }
}

fn split_authority(authority: &str) -> (String, u16) {
    match authority.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(443)),
        None => (authority.to_string(), 443),
    }
}
