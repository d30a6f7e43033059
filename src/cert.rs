//! Certificate material and TLS configuration.
//!
//! SHIP peers authenticate each other with self-signed X.509 certificates;
//! the only thing that matters about a peer certificate is a parseable
//! Subject Key Identifier (SHIP 12.1). Chain validation is deliberately
//! absent on both ends, so the verifiers here only check that an SKI can be
//! extracted while still validating the TLS handshake signatures.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CipherSuite, ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig};
use x509_parser::prelude::{FromDer, ParsedExtension, X509Certificate};

use crate::api::ShipError;

/// The local device certificate: a leaf chain plus its private key.
#[derive(Debug)]
pub struct DeviceCertificate {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl DeviceCertificate {
    /// Build from PEM-encoded certificate and key material.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let chain = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("parsing certificate PEM")?;
        if chain.is_empty() {
            return Err(anyhow!("no certificate found in PEM input"));
        }
        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .context("parsing private key PEM")?
            .ok_or_else(|| anyhow!("no private key found in PEM input"))?;
        Ok(Self { chain, key })
    }

    /// The lowercase hex SKI of the leaf certificate, the identity this
    /// node presents to every peer.
    pub fn ski(&self) -> Result<String, ShipError> {
        ski_from_certificate(&self.chain[0])
    }
}

/// Extract the Subject Key Identifier from a DER certificate as lowercase
/// hex. Returns [`ShipError::MissingSki`] when the extension is absent or
/// the certificate cannot be parsed.
pub fn ski_from_certificate(der: &CertificateDer<'_>) -> Result<String, ShipError> {
    let (_, cert) = X509Certificate::from_der(der.as_ref()).map_err(|_| ShipError::MissingSki)?;
    for ext in cert.extensions() {
        if let ParsedExtension::SubjectKeyIdentifier(kid) = ext.parsed_extension() {
            if kid.0.is_empty() {
                return Err(ShipError::MissingSki);
            }
            return Ok(hex::encode(kid.0));
        }
    }
    Err(ShipError::MissingSki)
}

// ────────────────────────────────────────────────────────────────────────────
// Cipher suites
// ────────────────────────────────────────────────────────────────────────────

/// Crypto provider restricted to the SHIP cipher family (SHIP 9.1).
///
/// SHIP mandates ECDHE-ECDSA with AES-128; rustls does not implement the
/// CBC half of that list, so this keeps the GCM members: the TLS 1.2
/// ECDHE-ECDSA suite plus its TLS 1.3 equivalent.
fn ship_crypto_provider() -> CryptoProvider {
    let mut provider = rustls::crypto::ring::default_provider();
    provider.cipher_suites.retain(|suite| {
        matches!(
            suite.suite(),
            CipherSuite::TLS13_AES_128_GCM_SHA256
                | CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
        )
    });
    provider
}

fn verification_algorithms() -> WebPkiSupportedAlgorithms {
    rustls::crypto::ring::default_provider().signature_verification_algorithms
}

// ────────────────────────────────────────────────────────────────────────────
// TLS configurations
// ────────────────────────────────────────────────────────────────────────────

/// Server-side TLS config: TLS 1.2+, SHIP ciphers, client certificate
/// required and accepted iff it carries a parseable SKI.
pub(crate) fn server_tls_config(certificate: &DeviceCertificate) -> Result<ServerConfig> {
    let config = ServerConfig::builder_with_provider(Arc::new(ship_crypto_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .context("building server TLS config")?
        .with_client_cert_verifier(Arc::new(SkiClientVerifier::new()))
        .with_single_cert(certificate.chain.clone(), certificate.key.clone_key())
        .context("applying server certificate")?;
    Ok(config)
}

/// Client-side TLS config: presents the local certificate and accepts any
/// server certificate. Peers are self-signed, identity is established by
/// comparing the SKI after the handshake.
pub(crate) fn client_tls_config(certificate: &DeviceCertificate) -> Result<ClientConfig> {
    let config = ClientConfig::builder_with_provider(Arc::new(ship_crypto_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .context("building client TLS config")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SelfSignedServerVerifier::new()))
        .with_client_auth_cert(certificate.chain.clone(), certificate.key.clone_key())
        .context("applying client certificate")?;
    Ok(config)
}

/// Build a TLS `ServerName` for a dial target; handles IP literals and
/// hostnames alike. The name is never verified against the peer
/// certificate.
pub(crate) fn server_name_for_host(host: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_owned()).map_err(|_| anyhow!("invalid dial host {host}"))
}

// ────────────────────────────────────────────────────────────────────────────
// Verifiers
// ────────────────────────────────────────────────────────────────────────────

/// Accepts any client certificate that carries a parseable SKI.
#[derive(Debug)]
struct SkiClientVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl SkiClientVerifier {
    fn new() -> Self {
        Self {
            algorithms: verification_algorithms(),
        }
    }
}

impl ClientCertVerifier for SkiClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        ski_from_certificate(end_entity)
            .map(|_| ClientCertVerified::assertion())
            .map_err(|_| {
                rustls::Error::General("no valid SKI provided in certificate".to_string())
            })
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Accepts any server certificate; SHIP peers are self-signed and the SKI
/// comparison after the handshake establishes identity.
#[derive(Debug)]
struct SelfSignedServerVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl SelfSignedServerVerifier {
    fn new() -> Self {
        Self {
            algorithms: verification_algorithms(),
        }
    }
}

impl ServerCertVerifier for SelfSignedServerVerifier {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testcert::{TEST_CERT_PEM, TEST_CERT_SKI, TEST_KEY_PEM};

    fn certificate() -> DeviceCertificate {
        DeviceCertificate::from_pem(TEST_CERT_PEM, TEST_KEY_PEM).unwrap()
    }

    #[test]
    fn extracts_the_ski_as_lowercase_hex() {
        assert_eq!(certificate().ski().unwrap(), TEST_CERT_SKI);
    }

    #[test]
    fn rejects_material_without_a_certificate() {
        assert!(DeviceCertificate::from_pem(b"not pem", TEST_KEY_PEM).is_err());
        assert!(DeviceCertificate::from_pem(TEST_CERT_PEM, b"not pem").is_err());
    }

    #[test]
    fn garbage_der_has_no_ski() {
        let der = CertificateDer::from(vec![0u8; 16]);
        assert_eq!(ski_from_certificate(&der), Err(ShipError::MissingSki));
    }

    #[test]
    fn tls_configs_build_from_the_device_certificate() {
        let certificate = certificate();
        assert!(server_tls_config(&certificate).is_ok());
        assert!(client_tls_config(&certificate).is_ok());
    }

    #[test]
    fn server_names_cover_hostnames_and_ip_literals() {
        assert!(server_name_for_host("evse.local").is_ok());
        assert!(server_name_for_host("192.168.1.10").is_ok());
        assert!(server_name_for_host("fe80::1").is_ok());
    }
}
