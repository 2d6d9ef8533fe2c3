//! Process-level configuration for the proxy and inspection API.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to the SQLite database file holding captured requests/responses.
    #[serde(default = "default_db_path")]
    pub db: PathBuf,

    /// Name reported by the inspection API (mirrors the Flask `APP_NAME`).
    #[serde(default = "default_app_name")]
    pub app_name: String,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,

    /// Port the intercepting proxy listens on.
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Port the inspection API listens on. Bound to all interfaces.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Directory holding `ca.crt`, `ca.key`, `cert.key`, and the generated
    /// per-host leaf certificates.
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,

    /// Directory holding the per-host `<host>_serial.txt` counter files.
    #[serde(default = "default_serial_dir")]
    pub serial_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db: default_db_path(),
            app_name: default_app_name(),
            listen_addr: default_listen_addr(),
            proxy_port: default_proxy_port(),
            api_port: default_api_port(),
            tls: TlsConfig::default(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_dir: default_cert_dir(),
            serial_dir: default_serial_dir(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .context("Failed to read configuration file")?;
        let config: AppConfig =
            toml::from_str(&contents).context("Failed to parse configuration file")?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(db) = std::env::var("PROXY_DB") {
            config.db = PathBuf::from(db);
        }

        if let Ok(name) = std::env::var("PROXY_APP_NAME") {
            config.app_name = name;
        }

        if let Ok(addr) = std::env::var("PROXY_LISTEN_ADDR") {
            if let Ok(ip) = addr.parse() {
                config.listen_addr = ip;
            }
        }

        if let Ok(port) = std::env::var("PROXY_PORT") {
            if let Ok(p) = port.parse() {
                config.proxy_port = p;
            }
        }

        if let Ok(port) = std::env::var("API_PORT") {
            if let Ok(p) = port.parse() {
                config.api_port = p;
            }
        }

        if let Ok(dir) = std::env::var("PROXY_CERT_DIR") {
            config.tls.cert_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("PROXY_SERIAL_DIR") {
            config.tls.serial_dir = PathBuf::from(dir);
        }

        config
    }

    /// Save configuration to a TOML file.
    #[allow(dead_code)]
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        std::fs::write(path.as_ref(), contents).context("Failed to write configuration file")?;
        Ok(())
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("proxy.db")
}

fn default_app_name() -> String {
    "proxy".to_string()
}

fn default_listen_addr() -> IpAddr {
    "0.0.0.0".parse().unwrap()
}

fn default_proxy_port() -> u16 {
    8080
}

fn default_api_port() -> u16 {
    8000
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("certs")
}

fn default_serial_dir() -> PathBuf {
    PathBuf::from("serial_numbers")
}
