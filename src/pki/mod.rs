//! PKI operations for cluster node identities
//!
//! This module generates the private certificate authority of a test cluster
//! and issues one leaf certificate per node. The node server consumes its
//! identity as files, so every artifact is also written to the cluster's work
//! directory as PEM.
//!
//! # Trust Model
//!
//! - One self-signed CA per cluster (or an externally pinned one)
//! - Each node gets a fresh key pair and a leaf signed by that CA
//! - Leaves are valid for both server and client auth, since nodes present
//!   them to each other when joining raft
//! - The CA key is written to disk for debugging only; nothing reads it back

pub mod tls;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use rand::Rng;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType, SerialNumber,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

/// Backdating applied to `not_before` to tolerate clock skew between host and containers
pub const CLOCK_SKEW_TOLERANCE: ::time::Duration = ::time::Duration::seconds(30);

/// Validity of both CA and leaf certificates (~30 years)
pub const CERT_VALIDITY: ::time::Duration = ::time::Duration::hours(262_980);

/// Host alias that lets tooling running in other containers reach the node
pub const HOST_BRIDGE_ALIAS: &str = "host.docker.internal";

/// CA certificate file name inside the `ca/` directory
pub const CA_CERT_FILE: &str = "ca.pem";

/// CA key file name inside the `ca/` directory
pub const CA_KEY_FILE: &str = "ca_key.pem";

/// Leaf certificate file name inside a node directory
pub const NODE_CERT_FILE: &str = "cert.pem";

/// Leaf key file name inside a node directory
pub const NODE_KEY_FILE: &str = "key.pem";

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate generation or signing failed
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    /// Certificate or key parsing error
    #[error("parse error: {0}")]
    Parse(String),

    /// TLS client or listener configuration could not be built
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    /// Supplied CA material cannot be used
    #[error("invalid CA material: {0}")]
    InvalidMaterial(String),

    /// Writing a PEM artifact failed
    #[error("failed to write {}: {source}", path.display())]
    Io {
        /// Path being written
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Externally supplied CA material, used to pin the CA across test runs
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaMaterial {
    /// PEM-encoded CA certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_pem: Option<String>,
    /// PEM-encoded CA private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_pem: Option<String>,
}

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::Parse(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Returns (not_before, not_after) for a certificate issued now
fn compute_validity() -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now - CLOCK_SKEW_TOLERANCE, now + CERT_VALIDITY)
}

fn random_serial() -> SerialNumber {
    // Positive 63-bit serial, like a signed Int63
    let serial: u64 = rand::thread_rng().gen::<u64>() >> 1;
    SerialNumber::from(serial.to_be_bytes().to_vec())
}

fn loopback_ips() -> [IpAddr; 2] {
    [
        IpAddr::V6(Ipv6Addr::LOCALHOST),
        IpAddr::V4(Ipv4Addr::LOCALHOST),
    ]
}

fn to_san(name: &str) -> Result<SanType> {
    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    Ia5String::try_from(name.to_string())
        .map(SanType::DnsName)
        .map_err(|e| PkiError::CertificateGeneration(format!("invalid DNS name '{}': {}", name, e)))
}

fn common_name(name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(name.to_string()));
    dn
}

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| PkiError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, contents).map_err(|source| PkiError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Certificate authority of one test cluster
pub struct CertificateAuthority {
    /// PEM-encoded CA certificate
    cert_pem: String,
    /// DER-encoded CA certificate
    cert_der: Vec<u8>,
    /// CA key pair serialized as PEM (KeyPair isn't Clone, so we reload it per signing)
    key_pem: Zeroizing<String>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_pem", &self.cert_pem)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Create the cluster CA, reusing pinned material when supplied
    ///
    /// With both key and certificate the pair is reused as-is. With only a
    /// key, a fresh certificate is self-signed for it. A certificate without
    /// its key is rejected since nothing could be signed with it.
    pub fn create(existing: Option<&CaMaterial>) -> Result<Self> {
        let pinned_key = match existing {
            Some(CaMaterial {
                cert_pem: Some(cert),
                key_pem: Some(key),
            }) => return Self::from_pem(cert, key),
            Some(CaMaterial {
                cert_pem: Some(_),
                key_pem: None,
            }) => {
                return Err(PkiError::InvalidMaterial(
                    "a pinned CA certificate requires its private key".to_string(),
                ))
            }
            Some(CaMaterial {
                cert_pem: None,
                key_pem: Some(key),
            }) => Some(key.as_str()),
            _ => None,
        };

        let key_pair = match pinned_key {
            Some(pem) => KeyPair::from_pem(pem)
                .map_err(|e| PkiError::Parse(format!("failed to parse CA key: {}", e)))?,
            None => KeyPair::generate().map_err(|e| {
                PkiError::KeyGeneration(format!("failed to generate CA key: {}", e))
            })?,
        };

        Self::self_signed(key_pair)
    }

    /// Create a fresh self-signed CA
    pub fn new() -> Result<Self> {
        Self::create(None)
    }

    fn self_signed(key_pair: KeyPair) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = common_name("localhost");
        params.subject_alt_names = std::iter::once(to_san("localhost"))
            .chain(loopback_ips().into_iter().map(|ip| Ok(SanType::IpAddress(ip))))
            .collect::<Result<Vec<_>>>()?;

        // Certificate signing only
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.serial_number = Some(random_serial());

        let (not_before, not_after) = compute_validity();
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            cert_pem: cert.pem(),
            cert_der: cert.der().to_vec(),
            key_pem: Zeroizing::new(key_pair.serialize_pem()),
        })
    }

    /// Load a CA from PEM certificate and key
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to parse CA key: {}", e)))?;

        let cert_der = parse_pem(cert_pem)?;
        let (_, cert) = X509Certificate::from_der(&cert_der)
            .map_err(|e| PkiError::Parse(format!("failed to parse CA cert: {}", e)))?;
        if !cert.is_ca() {
            return Err(PkiError::InvalidMaterial(
                "pinned certificate is not a CA".to_string(),
            ));
        }
        if key_pair.subject_public_key_info() != cert.public_key().raw {
            return Err(PkiError::InvalidMaterial(
                "pinned key does not match the certificate's public key".to_string(),
            ));
        }

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            cert_der,
            key_pem: Zeroizing::new(key_pem.to_string()),
        })
    }

    /// PEM-encoded CA certificate
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// DER-encoded CA certificate
    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// PEM-encoded CA private key
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to load CA key: {}", e)))
    }

    /// Write `ca.pem` and `ca_key.pem` into `ca_dir`, returning the certificate path
    pub fn persist(&self, ca_dir: &Path) -> Result<PathBuf> {
        let cert_file = ca_dir.join(CA_CERT_FILE);
        write_file(&cert_file, self.cert_pem.as_bytes())?;
        // Not consumed by anything; kept for debugging failed runs
        write_file(&ca_dir.join(CA_KEY_FILE), self.key_pem.as_bytes())?;
        Ok(cert_file)
    }

    /// Issue a leaf certificate for a node
    ///
    /// The SAN list always contains `localhost`, the host bridge alias, both
    /// loopback addresses and `subject`; `alt_names` are appended (IP literals
    /// become IP SANs). Every call generates a new key pair.
    pub fn issue_leaf(&self, subject: &str, alt_names: &[String]) -> Result<NodeIdentity> {
        let mut params = CertificateParams::default();
        params.distinguished_name = common_name(subject);

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::KeyAgreement,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.serial_number = Some(random_serial());

        let (not_before, not_after) = compute_validity();
        params.not_before = not_before;
        params.not_after = not_after;

        let mut names = vec![
            "localhost".to_string(),
            HOST_BRIDGE_ALIAS.to_string(),
            subject.to_string(),
        ];
        for name in alt_names {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        let mut sans = names
            .iter()
            .map(|name| to_san(name))
            .collect::<Result<Vec<_>>>()?;
        for ip in loopback_ips() {
            let san = SanType::IpAddress(ip);
            if !sans.contains(&san) {
                sans.push(san);
            }
        }
        params.subject_alt_names = sans;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGeneration(format!("failed to generate key for {}: {}", subject, e))
        })?;

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)
            .map_err(|e| PkiError::Parse(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&key_pair, &issuer).map_err(|e| {
            PkiError::CertificateGeneration(format!(
                "failed to sign certificate for {}: {}",
                subject, e
            ))
        })?;

        Ok(NodeIdentity {
            subject: subject.to_string(),
            cert_pem: cert.pem(),
            cert_der: cert.der().to_vec(),
            key_pem: Zeroizing::new(key_pair.serialize_pem()),
        })
    }
}

/// A node's leaf certificate and private key
#[derive(Clone)]
pub struct NodeIdentity {
    subject: String,
    cert_pem: String,
    cert_der: Vec<u8>,
    key_pem: Zeroizing<String>,
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

/// Locations of a persisted node identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityFiles {
    /// Leaf certificate PEM file
    pub cert_file: PathBuf,
    /// Private key PEM file
    pub key_file: PathBuf,
}

impl NodeIdentity {
    /// Subject common name the certificate was issued for
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// PEM-encoded leaf certificate
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// DER-encoded leaf certificate
    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// PEM-encoded private key (PKCS#8)
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Write `cert.pem` and `key.pem` into `dir`
    pub fn persist(&self, dir: &Path) -> Result<IdentityFiles> {
        let files = IdentityFiles {
            cert_file: dir.join(NODE_CERT_FILE),
            key_file: dir.join(NODE_KEY_FILE),
        };
        write_file(&files.cert_file, self.cert_pem.as_bytes())?;
        write_file(&files.key_file, self.key_pem.as_bytes())?;
        Ok(files)
    }
}

/// Fields of a certificate relevant to node identities
#[derive(Clone, Debug)]
pub struct CertificateInfo {
    /// Subject common name
    pub common_name: String,
    /// DNS subject alternative names
    pub dns_names: Vec<String>,
    /// IP subject alternative names
    pub ip_addresses: Vec<IpAddr>,
    /// Start of validity (unix seconds)
    pub not_before: i64,
    /// End of validity (unix seconds)
    pub not_after: i64,
    /// Whether basic constraints mark this as a CA
    pub is_ca: bool,
    /// DER-encoded SubjectPublicKeyInfo
    pub public_key_der: Vec<u8>,
}

impl CertificateInfo {
    /// Parse certificate info from PEM
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        Self::from_der(&parse_pem(pem_data)?)
    }

    /// Parse certificate info from DER
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        let san = cert
            .subject_alternative_name()
            .map_err(|e| PkiError::Parse(format!("invalid SAN extension: {}", e)))?;
        if let Some(san) = san {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            ip_addresses.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(Self {
            common_name,
            dns_names,
            ip_addresses,
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            is_ca: cert.is_ca(),
            public_key_der: cert.public_key().raw.to_vec(),
        })
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

/// Check that `leaf_pem` carries a valid signature from the CA in `ca_pem`
pub fn verify_issued_by(leaf_pem: &str, ca_pem: &str) -> Result<bool> {
    let leaf_der = parse_pem(leaf_pem)?;
    let (_, leaf) = X509Certificate::from_der(&leaf_der)
        .map_err(|e| PkiError::Parse(format!("failed to parse leaf cert: {}", e)))?;

    let ca_der = parse_pem(ca_pem)?;
    let (_, ca) = X509Certificate::from_der(&ca_der)
        .map_err(|e| PkiError::Parse(format!("failed to parse CA cert: {}", e)))?;

    Ok(leaf.verify_signature(Some(ca.public_key())).is_ok())
}
