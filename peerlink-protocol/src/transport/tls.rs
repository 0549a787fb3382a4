//! TLS configuration
//!
//! Both directions use mutual TLS with self-signed certificates. Any peer
//! certificate is accepted at the TLS layer as long as it parses and carries a
//! common name, and handshake signatures are still verified against it. Trust
//! is decided afterwards by comparing the certificate fingerprint with the
//! one pinned at pairing time.

use crate::pairing::{device_id_from_certificate, CertificateInfo};
use crate::Result;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{
    ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider,
    WebPkiSupportedAlgorithms,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig,
    SignatureScheme,
};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// Ready-to-use TLS client and server sides for the local certificate
#[derive(Clone)]
pub struct TlsContext {
    connector: TlsConnector,
    acceptor: TlsAcceptor,
}

impl TlsContext {
    pub fn new(certificate: &CertificateInfo) -> Result<Self> {
        let provider = Arc::new(ring::default_provider());

        let client = create_client_config(certificate, provider.clone())?;
        let server = create_server_config(certificate, provider)?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client)),
            acceptor: TlsAcceptor::from(Arc::new(server)),
        })
    }

    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }
}

/// Client side: presents our certificate, accepts any server certificate
pub fn create_client_config(
    certificate: &CertificateInfo,
    provider: Arc<CryptoProvider>,
) -> Result<ClientConfig> {
    debug!("Creating TLS client config for {}", certificate.device_id);

    let verifier = AcceptAnyServerCert {
        algorithms: provider.signature_verification_algorithms,
    };

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(
            vec![certificate.certificate_der()],
            certificate.private_key_der(),
        )?;

    Ok(config)
}

/// Server side: presents our certificate, requires and accepts any client
/// certificate
pub fn create_server_config(
    certificate: &CertificateInfo,
    provider: Arc<CryptoProvider>,
) -> Result<ServerConfig> {
    debug!("Creating TLS server config for {}", certificate.device_id);

    let verifier = AcceptAnyClientCert {
        algorithms: provider.signature_verification_algorithms,
    };

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(
            vec![certificate.certificate_der()],
            certificate.private_key_der(),
        )?;

    Ok(config)
}

fn check_certificate(end_entity: &CertificateDer<'_>) -> std::result::Result<(), rustls::Error> {
    device_id_from_certificate(end_entity.as_ref())
        .map(|_| ())
        .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))
}

#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        check_certificate(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[derive(Debug)]
struct AcceptAnyClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        check_certificate(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::test_certificate;

    #[test]
    fn test_create_configs() {
        let cert = test_certificate("device1");
        let provider = Arc::new(ring::default_provider());

        let client = create_client_config(&cert, provider.clone()).unwrap();
        assert!(client.client_auth_cert_resolver.has_certs());

        assert!(create_server_config(&cert, provider).is_ok());
        assert!(TlsContext::new(&cert).is_ok());
    }

    #[test]
    fn test_rejects_certificate_without_common_name() {
        let verifier = AcceptAnyServerCert {
            algorithms: ring::default_provider().signature_verification_algorithms,
        };
        let garbage = CertificateDer::from(vec![0u8; 16]);
        let result = verifier.verify_server_cert(
            &garbage,
            &[],
            &ServerName::try_from("peer").unwrap(),
            &[],
            UnixTime::now(),
        );
        assert!(result.is_err());
    }
}
