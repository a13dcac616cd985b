//! TLS material for the QUIC transport

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use serde::Deserialize;
use tracing::{info, warn};

/// ALPN protocol identifier
pub(crate) const ALPN: &[u8] = b"gatenet";

/// Server certificate source
#[derive(Debug, Clone, Deserialize)]
pub struct ServerTls {
    /// PEM certificate chain
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// PEM private key
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// Generate a self-signed certificate when no files are configured
    #[serde(default = "default_true")]
    pub auto_generate: bool,
}

impl Default for ServerTls {
    fn default() -> Self {
        Self {
            cert_path: None,
            key_path: None,
            auto_generate: true,
        }
    }
}

/// Client verification policy
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientTls {
    /// SNI name; defaults to the host part of the dial address
    #[serde(default)]
    pub server_name: Option<String>,
    /// Extra trusted certificate (PEM), e.g. a game server's self-signed cert
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// Skip certificate verification (development only)
    #[serde(default)]
    pub insecure: bool,
}

fn default_true() -> bool {
    true
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build the rustls server config
pub(crate) fn server_crypto(tls: &ServerTls) -> Result<rustls::ServerConfig> {
    let (certs, key) = load_or_generate_certs(tls)?;

    let mut config = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unsupported by crypto provider")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to build TLS config")?;
    config.alpn_protocols = vec![ALPN.to_vec()];

    Ok(config)
}

/// Build the rustls client config
pub(crate) fn client_crypto(tls: &ClientTls) -> Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unsupported by crypto provider")?;

    let mut config = if tls.insecure {
        warn!("TLS certificate verification disabled (insecure mode)");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureServerVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(path) = &tls.ca_cert_path {
            for cert in read_certs(path)? {
                roots
                    .add(cert)
                    .with_context(|| format!("Invalid CA certificate in {:?}", path))?;
            }
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    config.alpn_protocols = vec![ALPN.to_vec()];

    Ok(config)
}

fn read_certs(path: &PathBuf) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificates")
}

/// Load certificates from files or generate self-signed
fn load_or_generate_certs(tls: &ServerTls) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    if let (Some(cert_path), Some(key_path)) = (&tls.cert_path, &tls.key_path) {
        if cert_path.exists() && key_path.exists() {
            info!(cert = ?cert_path, key = ?key_path, "Loading TLS certificates");

            let certs = read_certs(cert_path)?;
            let key_pem = std::fs::read(key_path).context("Failed to read key file")?;
            let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
                .context("Failed to parse private key")?
                .ok_or_else(|| anyhow::anyhow!("No private key found in file"))?;

            return Ok((certs, key));
        }
    }

    if !tls.auto_generate {
        anyhow::bail!("TLS certificate not configured and auto_generate is disabled");
    }

    warn!("Generating self-signed certificate (not for production use)");
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .context("Failed to generate self-signed certificate")?;

    let cert_der = CertificateDer::from(cert.cert);
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));

    Ok((vec![cert_der], key_der))
}

/// Accepts any server certificate
#[derive(Debug)]
struct InsecureServerVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
