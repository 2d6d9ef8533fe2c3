//! SQL-injection testing proxy library components.
//!
//! Exposes the certificate authority, message model, persistence layer,
//! injection iterator, connection handler, and inspection facade so both
//! `main` and the integration tests can drive them directly.

pub mod certificate_manager;
pub mod config;
pub mod error;
pub mod injection;
pub mod inspection;
pub mod message;
pub mod outbound;
pub mod proxy_server;
pub mod request;
pub mod response;
pub mod scanner;
pub mod store;

pub use certificate_manager::CertificateAuthority;
pub use config::AppConfig;
pub use error::ProxyError;
pub use injection::InjectionIterator;
pub use inspection::ApiServer;
pub use proxy_server::ProxyServer;
pub use request::Request;
pub use response::Response;
pub use scanner::DifferentialScanner;
pub use store::Store;
