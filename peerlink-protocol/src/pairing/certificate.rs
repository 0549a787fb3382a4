//! Local device certificate
//!
//! Each host owns one self-signed certificate. Its Common Name is the device
//! id and the SHA-256 digest of its DER encoding is the fingerprint peers pin
//! when pairing. Certificate generation is left to the operator; this module
//! only loads and inspects existing material.

use crate::{ProtocolError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Device certificate and private key
pub struct CertificateInfo {
    /// Device ID (certificate CN)
    pub device_id: String,

    /// DER-encoded certificate
    pub certificate: Vec<u8>,

    /// SHA-256 fingerprint of the certificate
    pub fingerprint: String,

    private_key: PrivateKeyDer<'static>,
}

impl CertificateInfo {
    /// Build from DER material; the device id is read from the certificate CN
    pub fn from_der(certificate: Vec<u8>, private_key: PrivateKeyDer<'static>) -> Result<Self> {
        let device_id = device_id_from_certificate(&certificate)?;
        let fingerprint = calculate_fingerprint(&certificate);

        Ok(Self {
            device_id,
            certificate,
            fingerprint,
            private_key,
        })
    }

    /// Parse a PEM certificate and a PEM private key (PKCS#8, PKCS#1 or SEC1)
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let certificate = rustls_pemfile::certs(&mut &cert_pem[..])
            .next()
            .ok_or_else(|| ProtocolError::Certificate("no certificate in PEM data".to_string()))?
            .map_err(|e| ProtocolError::Certificate(format!("invalid certificate PEM: {}", e)))?;

        let private_key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| ProtocolError::Certificate(format!("invalid private key PEM: {}", e)))?
            .ok_or_else(|| ProtocolError::Certificate("no private key in PEM data".to_string()))?;

        Self::from_der(certificate.to_vec(), private_key)
    }

    /// Load certificate and private key from PEM files
    pub fn load_from_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        debug!("Loading certificate from {:?}", cert_path);

        let cert_pem = fs::read(cert_path).map_err(|e| {
            ProtocolError::Certificate(format!("cannot read {}: {}", cert_path.display(), e))
        })?;
        let key_pem = fs::read(key_path).map_err(|e| {
            ProtocolError::Certificate(format!("cannot read {}: {}", key_path.display(), e))
        })?;

        let info = Self::from_pem(&cert_pem, &key_pem)?;
        info!(
            "Loaded certificate for device {} with fingerprint: {}",
            info.device_id, info.fingerprint
        );
        Ok(info)
    }

    pub fn certificate_der(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.certificate.clone())
    }

    pub fn private_key_der(&self) -> PrivateKeyDer<'static> {
        self.private_key.clone_key()
    }
}

impl Clone for CertificateInfo {
    fn clone(&self) -> Self {
        Self {
            device_id: self.device_id.clone(),
            certificate: self.certificate.clone(),
            fingerprint: self.fingerprint.clone(),
            private_key: self.private_key.clone_key(),
        }
    }
}

impl fmt::Debug for CertificateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateInfo")
            .field("device_id", &self.device_id)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Calculate the SHA-256 fingerprint of a DER certificate
///
/// Returns fingerprint in format: XX:XX:XX:...:XX (hex bytes separated by colons)
pub fn calculate_fingerprint(cert_der: &[u8]) -> String {
    let digest = Sha256::digest(cert_der);
    let hex = hex::encode_upper(digest);

    hex.as_bytes()
        .chunks(2)
        .filter_map(|pair| std::str::from_utf8(pair).ok())
        .collect::<Vec<_>>()
        .join(":")
}

/// Read the Common Name of a DER certificate
pub fn device_id_from_certificate(cert_der: &[u8]) -> Result<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| ProtocolError::Certificate(format!("cannot parse certificate: {}", e)))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .ok_or_else(|| ProtocolError::Certificate("certificate has no common name".to_string()))?
        .as_str()
        .map_err(|e| ProtocolError::Certificate(format!("unreadable common name: {}", e)))?;

    if common_name.is_empty() {
        return Err(ProtocolError::Certificate("empty common name".to_string()));
    }

    Ok(common_name.to_string())
}
