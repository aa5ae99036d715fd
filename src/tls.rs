//! TLS client configuration for ldaps:// connections.

use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ClientConfig;
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pemfile::certs;
use std::fs;
use std::io::BufReader;
use std::sync::Arc;
use tracing::{debug, warn};

/// Build a client config trusting the system roots plus an optional CA file.
/// With `skip_verify` the server certificate is not checked at all.
pub fn client_config(ca_file: Option<&str>, skip_verify: bool) -> Result<Arc<ClientConfig>> {
    let mut root_store = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs().context("Load system CA certs")?;
    let (added, ignored) = root_store.add_parsable_certificates(native);
    debug!("Loaded {} system CA certificates ({} ignored)", added, ignored);

    if let Some(path) = ca_file {
        for cert in load_certs_from_file(path)? {
            root_store
                .add(cert)
                .with_context(|| format!("Add CA certificate from {}", path))?;
        }
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    if skip_verify {
        warn!("TLS server certificate verification is disabled");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(InsecureServerVerifier::new()));
    }
    Ok(Arc::new(config))
}

fn load_certs_from_file(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).with_context(|| format!("Open CA file: {}", path))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }
    Ok(certs)
}

/// Accepts any server certificate (`tls.skip_verify`). Advertises the ring
/// provider's full set of signature schemes.
#[derive(Debug)]
struct InsecureServerVerifier {
    schemes: Vec<SignatureScheme>,
}

impl InsecureServerVerifier {
    fn new() -> Self {
        let schemes = rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes();
        Self { schemes }
    }
}

impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_ca_file_is_error() {
        let err = load_certs_from_file("/nonexistent/ca.pem").unwrap_err();
        assert!(err.to_string().contains("Open CA file"));
    }

    #[test]
    fn test_ca_file_without_certificates_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let err = load_certs_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("No certificates found"));
    }

    #[test]
    fn test_insecure_verifier_offers_all_provider_schemes() {
        let schemes = InsecureServerVerifier::new().supported_verify_schemes();
        for scheme in [
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ] {
            assert!(schemes.contains(&scheme), "missing {:?}", scheme);
        }
    }
}
