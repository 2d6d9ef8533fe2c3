//! Error classification for the connection handler and inspection facade.
//!
//! Each variant carries what its disposition in the spec needs: a status
//! code plus a human phrase for the ones that talk back to the wire, and
//! nothing beyond a log line for the ones that don't.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Bad Request: {0}")]
    MalformedRequest(String),

    #[error("Cannot connect to {host}:{port}")]
    UnreachableUpstream { host: String, port: u16 },

    #[error("TLS handshake with upstream failed: {detail}")]
    UpstreamTlsFailure { host: String, port: u16, detail: String },

    #[error("TLS handshake with client failed: {0}")]
    ClientTlsFailure(String),

    #[error("missing CA material: {0}")]
    CaUnavailable(String),

    #[error("failed to persist to store: {0}")]
    DbWriteFailure(String),

    #[error("response body is not decodable text")]
    ReplayUndecodable,

    #[error("no request with id {0}")]
    ScanRequestNotFound(i64),

    #[error("{0}")]
    NotFound(String),

    #[error("failed to parse captured tunnel bytes: {0}")]
    TunnelParseFailure(String),
}

impl ProxyError {
    /// The status code the wire-facing handler replies with, per spec §7.
    /// Errors that never reach the wire (`DbWriteFailure`, `TunnelParseFailure`,
    /// `ClientTlsFailure`) have no meaningful mapping and are not expected to
    /// be passed here.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::MalformedRequest(_) => 400,
            ProxyError::UnreachableUpstream { .. } => 400,
            ProxyError::UpstreamTlsFailure { .. } => 502,
            ProxyError::ReplayUndecodable => 501,
            ProxyError::ScanRequestNotFound(_) => 404,
            ProxyError::NotFound(_) => 404,
            ProxyError::ClientTlsFailure(_) => 0,
            ProxyError::CaUnavailable(_) => 0,
            ProxyError::DbWriteFailure(_) => 0,
            ProxyError::TunnelParseFailure(_) => 0,
        }
    }

    /// The diagnostic phrase to send alongside `status_code()`, where one applies.
    pub fn phrase(&self) -> String {
        match self {
            ProxyError::MalformedRequest(detail) => format!("Bad Request: {detail}"),
            ProxyError::UnreachableUpstream { host, port } => {
                format!("Could not send request to host {host}:{port}")
            }
            ProxyError::UpstreamTlsFailure { host, port, .. } => {
                format!("Cannot connect to host {host}:{port}")
            }
            ProxyError::ReplayUndecodable => "response body is not decodable text".to_string(),
            ProxyError::ScanRequestNotFound(id) => format!("no request with id {id}"),
            ProxyError::NotFound(detail) => detail.clone(),
            other => other.to_string(),
        }
    }
}
