//! TLS settings derived from a node identity
//!
//! A node's identity is used on two sides: the node server loads it from
//! files through its listener configuration, and the harness presents the
//! same certificate when it talks to the node's admin API.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::json;
use zeroize::Zeroizing;

use super::{IdentityFiles, NodeIdentity, PkiError, Result};

/// How a node's listener treats client certificates
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientAuthPolicy {
    /// Ask for a client certificate but accept connections without one
    #[default]
    Request,
    /// Reject connections without a certificate signed by the cluster CA
    RequireAndVerify,
}

impl ClientAuthPolicy {
    /// Policy for a cluster's client-auth flag
    pub fn from_required(required: bool) -> Self {
        if required {
            Self::RequireAndVerify
        } else {
            Self::Request
        }
    }

    /// Whether client certificates are mandatory
    pub fn is_required(self) -> bool {
        matches!(self, Self::RequireAndVerify)
    }
}

/// Node TLS configuration: CA trust, the node's own identity and client auth policy
#[derive(Clone)]
pub struct NodeTlsConfig {
    /// CA certificate PEM trusted for both server and client verification
    ca_cert_pem: String,
    /// Node certificate PEM
    cert_pem: String,
    /// Node private key PEM (zeroized on drop)
    key_pem: Zeroizing<String>,
    /// Listener client auth policy
    client_auth: ClientAuthPolicy,
}

impl std::fmt::Debug for NodeTlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTlsConfig")
            .field("client_auth", &self.client_auth)
            .finish_non_exhaustive()
    }
}

impl NodeTlsConfig {
    /// Derive the TLS configuration for a node identity
    pub fn new(ca_cert_pem: &str, identity: &NodeIdentity, client_auth: ClientAuthPolicy) -> Self {
        Self {
            ca_cert_pem: ca_cert_pem.to_string(),
            cert_pem: identity.cert_pem().to_string(),
            key_pem: Zeroizing::new(identity.key_pem().to_string()),
            client_auth,
        }
    }

    /// CA certificate PEM
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Client auth policy of the node's listener
    pub fn client_auth(&self) -> ClientAuthPolicy {
        self.client_auth
    }

    /// Build an HTTP client builder for the node's admin API
    ///
    /// Trusts only the cluster CA, presents the node identity as client
    /// certificate and refuses redirects. Loading the identity here is what
    /// validates the freshly written key material, so a bad pair fails the
    /// bootstrap instead of the first request.
    pub fn http_client_builder(&self) -> Result<reqwest::ClientBuilder> {
        let ca_cert = reqwest::Certificate::from_pem(self.ca_cert_pem.as_bytes())
            .map_err(|e| PkiError::TlsConfig(format!("invalid CA certificate: {}", e)))?;

        let mut bundle = Zeroizing::new(String::with_capacity(
            self.cert_pem.len() + self.key_pem.len() + 1,
        ));
        bundle.push_str(&self.cert_pem);
        if !bundle.ends_with('\n') {
            bundle.push('\n');
        }
        bundle.push_str(&self.key_pem);
        let identity = reqwest::Identity::from_pem(bundle.as_bytes())
            .map_err(|e| PkiError::TlsConfig(format!("invalid node identity: {}", e)))?;

        Ok(reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(ca_cert)
            .identity(identity)
            .redirect(reqwest::redirect::Policy::custom(|attempt| {
                attempt.error("redirects not allowed in these tests")
            })))
    }

    /// Listener section of the node server configuration
    ///
    /// Paths are as seen from inside the node's runtime.
    pub fn listener_config(
        &self,
        address: &str,
        files: &IdentityFiles,
        ca_file: &Path,
    ) -> serde_json::Value {
        let mut tcp = json!({
            "address": address,
            "tls_cert_file": files.cert_file.display().to_string(),
            "tls_key_file": files.key_file.display().to_string(),
            "telemetry": {
                "unauthenticated_metrics_access": true
            }
        });
        if self.client_auth.is_required() {
            tcp["tls_require_and_verify_client_cert"] = json!(true);
            tcp["tls_client_ca_file"] = json!(ca_file.display().to_string());
        }
        json!({ "tcp": tcp })
    }
}
