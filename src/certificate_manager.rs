//! Certificate authority for the TLS MITM tunnel.
//!
//! Generates a leaf certificate per intercepted host, signed by a root CA
//! that must already exist on disk (`ca.crt`/`ca.key`), and shares a single
//! leaf private key (`cert.key`) across every issued certificate.

use crate::error::ProxyError;
use anyhow::{Context, Result};
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

const CA_CERT_FILE: &str = "ca.crt";
const CA_KEY_FILE: &str = "ca.key";
const LEAF_KEY_FILE: &str = "cert.key";

/// A freshly issued leaf certificate, ready to be handed to a `rustls`
/// server config.
pub struct LeafCertificate {
    pub host: String,
    pub serial: u64,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub certs_der: Vec<CertificateDer<'static>>,
    pub key_der: PrivateKeyDer<'static>,
}

pub struct CertificateAuthority {
    root_ca: Certificate,
    root_ca_keypair: KeyPair,
    leaf_keypair: KeyPair,
    cert_dir: PathBuf,
    serial_dir: PathBuf,
    leaf_key_path: PathBuf,
    /// Serializes serial allocation; a single process-wide lock suffices per
    /// spec §5 ("a global lock is acceptable").
    serial_lock: Mutex<()>,
}

impl CertificateAuthority {
    /// Load CA material from the working directory. Fails with
    /// `ProxyError::CaUnavailable` if `ca.crt`, `ca.key`, or `cert.key` are
    /// missing, per spec §4.1's startup precondition.
    pub fn load(cert_dir: impl AsRef<Path>, serial_dir: impl AsRef<Path>) -> Result<Self> {
        let cert_dir = cert_dir.as_ref().to_path_buf();
        let serial_dir = serial_dir.as_ref().to_path_buf();

        for path in [Path::new(CA_CERT_FILE), Path::new(CA_KEY_FILE), Path::new(LEAF_KEY_FILE)] {
            if !path.exists() {
                return Err(ProxyError::CaUnavailable(format!(
                    "missing CA material: {}",
                    path.display()
                ))
                .into());
            }
        }

        fs::create_dir_all(&cert_dir).context("failed to create certs directory")?;
        fs::create_dir_all(&serial_dir).context("failed to create serial_numbers directory")?;

        let (root_ca, root_ca_keypair) =
            Self::load_ca(Path::new(CA_CERT_FILE), Path::new(CA_KEY_FILE))?;
        let leaf_keypair = Self::load_leaf_key(Path::new(LEAF_KEY_FILE))?;

        Ok(Self {
            root_ca,
            root_ca_keypair,
            leaf_keypair,
            cert_dir,
            serial_dir,
            leaf_key_path: PathBuf::from(LEAF_KEY_FILE),
            serial_lock: Mutex::new(()),
        })
    }

    fn load_ca(cert_path: &Path, key_path: &Path) -> Result<(Certificate, KeyPair)> {
        let cert_pem = fs::read_to_string(cert_path).context("failed to read ca.crt")?;
        let key_pem = fs::read_to_string(key_path).context("failed to read ca.key")?;

        let keypair = KeyPair::from_pem(&key_pem).context("failed to parse ca.key")?;
        let params =
            CertificateParams::from_ca_cert_pem(&cert_pem).context("failed to parse ca.crt")?;
        let cert = params
            .self_signed(&keypair)
            .context("failed to reconstruct root CA certificate")?;

        Ok((cert, keypair))
    }

    fn load_leaf_key(key_path: &Path) -> Result<KeyPair> {
        let key_pem = fs::read_to_string(key_path).context("failed to read cert.key")?;
        KeyPair::from_pem(&key_pem).context("failed to parse cert.key")
    }

    /// Generate a fresh root CA and leaf key. Used by tests and by operators
    /// bootstrapping a new working directory — never by the proxy at
    /// startup, which requires the material to already exist (see `load`).
    pub fn bootstrap(cert_dir: impl AsRef<Path>, serial_dir: impl AsRef<Path>) -> Result<()> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "SQLi Proxy CA");
        dn.push(DnType::OrganizationName, "SQLi Proxy");
        params.distinguished_name = dn;
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
        ];

        let ca_keypair = KeyPair::generate()?;
        let ca_cert = params.self_signed(&ca_keypair)?;

        fs::write(CA_CERT_FILE, ca_cert.pem())?;
        fs::write(CA_KEY_FILE, ca_keypair.serialize_pem())?;

        let leaf_keypair = KeyPair::generate()?;
        fs::write(LEAF_KEY_FILE, leaf_keypair.serialize_pem())?;

        fs::create_dir_all(cert_dir.as_ref())?;
        fs::create_dir_all(serial_dir.as_ref())?;

        Ok(())
    }

    /// Issue (or re-sign) a leaf certificate for `host`, allocating the next
    /// serial for that host and writing `<host>_<serial>.crt` under the
    /// certs directory.
    pub async fn issue(&self, host: &str) -> Result<LeafCertificate> {
        let serial = self.next_serial(host).await?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![rcgen::SanType::DnsName(
            host.to_string()
                .try_into()
                .context("invalid hostname for SAN")?,
        )];
        params.serial_number = Some(rcgen::SerialNumber::from(serial));

        let cert = params
            .signed_by(&self.leaf_keypair, &self.root_ca, &self.root_ca_keypair)
            .context("failed to sign leaf certificate")?;

        let cert_path = self.cert_dir.join(format!("{host}_{serial}.crt"));
        fs::write(&cert_path, cert.pem()).context("failed to write leaf certificate")?;

        let certs_der = vec![CertificateDer::from(cert.der().to_vec())];
        let key_der = PrivateKeyDer::try_from(self.leaf_keypair.serialize_der())
            .map_err(|e| anyhow::anyhow!("failed to serialize leaf key: {e}"))?;

        Ok(LeafCertificate {
            host: host.to_string(),
            serial,
            cert_path,
            key_path: self.leaf_key_path.clone(),
            certs_der,
            key_der,
        })
    }

    /// Allocate the next serial number for `host`, atomically against
    /// concurrent issuance to the same host (spec §4.1/§5).
    async fn next_serial(&self, host: &str) -> Result<u64> {
        let _guard = self.serial_lock.lock().await;

        let serial_path = self.serial_dir.join(format!("{host}_serial.txt"));
        let current: u64 = if serial_path.exists() {
            fs::read_to_string(&serial_path)
                .context("failed to read serial counter")?
                .trim()
                .parse()
                .unwrap_or(0)
        } else {
            0
        };

        let next = current + 1;
        fs::write(&serial_path, next.to_string()).context("failed to write serial counter")?;

        Ok(next)
    }

    /// Best-effort removal of one leaf certificate file, called on tunnel close.
    pub fn remove_leaf(&self, leaf: &LeafCertificate) {
        let _ = fs::remove_file(&leaf.cert_path);
    }

    /// Purge every per-host leaf certificate and serial file. Called on
    /// process exit (SIGINT) per spec §4.5/§6.
    pub fn purge(&self) {
        if let Ok(entries) = fs::read_dir(&self.cert_dir) {
            for entry in entries.flatten() {
                let _ = fs::remove_file(entry.path());
            }
        }
        if let Ok(entries) = fs::read_dir(&self.serial_dir) {
            for entry in entries.flatten() {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}
