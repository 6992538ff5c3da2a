//! Leaf certificate fingerprinting
//!
//! The SHA-256 digest of the leaf certificate's DER encoding is embedded as
//! user data in every attestation document, binding the document to the TLS
//! certificate the client is talking to.

use crate::error::CertificateError;
use sha2::{Digest, Sha256};
use std::fmt;
use x509_parser::pem::Pem;

/// SHA-256 digest over a DER-encoded leaf certificate
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CertificateFingerprint([u8; 32]);

impl CertificateFingerprint {
    /// Computes the fingerprint of a DER-encoded certificate
    pub fn of_der(der: &[u8]) -> Self {
        Self(Sha256::digest(der).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for CertificateFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for CertificateFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CertificateFingerprint({})", self)
    }
}

/// Scans PEM blocks in order and fingerprints the first non-CA certificate.
///
/// Returns `Ok(None)` if every certificate in the buffer is a CA, and
/// [`CertificateError::MalformedInput`] if the buffer holds no PEM block.
/// Blocks with other labels (private keys, for instance) are skipped.
pub fn leaf_fingerprint(pem_data: &[u8]) -> Result<Option<CertificateFingerprint>, CertificateError> {
    let mut blocks = 0usize;

    for block in Pem::iter_from_buffer(pem_data) {
        let block = block.map_err(|e| CertificateError::Parse(format!("invalid PEM block: {e}")))?;
        blocks += 1;

        if block.label != "CERTIFICATE" {
            continue;
        }

        let cert = block
            .parse_x509()
            .map_err(|e| CertificateError::Parse(format!("failed to parse certificate: {e}")))?;

        if !cert.is_ca() {
            return Ok(Some(CertificateFingerprint::of_der(&block.contents)));
        }
    }

    if blocks == 0 {
        return Err(CertificateError::MalformedInput);
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};

    fn ca_pem() -> String {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![]).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.self_signed(&key).unwrap().pem()
    }

    fn leaf() -> (String, Vec<u8>) {
        let key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(vec!["example.test".to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), cert.der().to_vec())
    }

    #[test]
    fn test_leaf_first() {
        let (leaf_pem, leaf_der) = leaf();
        let chain = format!("{}{}", leaf_pem, ca_pem());
        let fpr = leaf_fingerprint(chain.as_bytes()).unwrap().unwrap();
        assert_eq!(fpr, CertificateFingerprint::of_der(&leaf_der));
    }

    #[test]
    fn test_leaf_after_intermediates() {
        let (leaf_pem, leaf_der) = leaf();
        let chain = format!("{}{}{}", ca_pem(), ca_pem(), leaf_pem);
        let fpr = leaf_fingerprint(chain.as_bytes()).unwrap().unwrap();
        assert_eq!(fpr, CertificateFingerprint::of_der(&leaf_der));
    }

    #[test]
    fn test_first_leaf_wins() {
        let (first_pem, first_der) = leaf();
        let (second_pem, _) = leaf();
        let chain = format!("{}{}", first_pem, second_pem);
        let fpr = leaf_fingerprint(chain.as_bytes()).unwrap().unwrap();
        assert_eq!(fpr, CertificateFingerprint::of_der(&first_der));
    }

    #[test]
    fn test_skips_private_key_block() {
        let key = KeyPair::generate().unwrap();
        let (leaf_pem, leaf_der) = leaf();
        let material = format!("{}{}", key.serialize_pem(), leaf_pem);
        let fpr = leaf_fingerprint(material.as_bytes()).unwrap().unwrap();
        assert_eq!(fpr, CertificateFingerprint::of_der(&leaf_der));
    }

    #[test]
    fn test_only_ca_certificates() {
        let chain = format!("{}{}", ca_pem(), ca_pem());
        assert!(leaf_fingerprint(chain.as_bytes()).unwrap().is_none());
    }

    #[test]
    fn test_no_pem_data() {
        assert!(matches!(
            leaf_fingerprint(b"not a certificate"),
            Err(CertificateError::MalformedInput)
        ));
        assert!(matches!(leaf_fingerprint(b""), Err(CertificateError::MalformedInput)));
    }

    #[test]
    fn test_display_is_hex() {
        let fpr = CertificateFingerprint::of_der(b"abc");
        assert_eq!(fpr.to_string().len(), 64);
        assert_eq!(
            fpr.to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
