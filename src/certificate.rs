//! TLS certificate bundles and the self-signed provisioning strategy
//!
//! Exactly one [`TlsCertificateBundle`] is active per process. It lives in an
//! [`ActiveCertificate`] cell that is written once and read by both the TLS
//! layer (per handshake) and the attestation endpoint (per request), so the
//! key being served and the fingerprint being attested always agree.

use crate::error::CertificateError;
use crate::fingerprint::{leaf_fingerprint, CertificateFingerprint};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use ring::rand::{SecureRandom, SystemRandom};
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{InconsistentKeys, ServerConfig};
use std::fmt;
use std::sync::{Arc, OnceLock};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

/// Lifetime of self-signed certificates
pub const CERTIFICATE_VALIDITY: Duration = Duration::days(365);

/// Private key, certificate chain (leaf first) and leaf fingerprint
#[derive(Clone)]
pub struct TlsCertificateBundle {
    certified_key: Arc<CertifiedKey>,
    fingerprint: CertificateFingerprint,
}

impl TlsCertificateBundle {
    /// Builds a bundle from PEM material holding a private key and a chain.
    ///
    /// The chain may list CA certificates before the leaf; the leaf is moved
    /// to the front before it is handed to rustls.
    pub fn from_pem(material: &[u8]) -> Result<Self, CertificateError> {
        let fingerprint = leaf_fingerprint(material)?.ok_or(CertificateError::NotFound)?;

        let mut chain = rustls_pemfile::certs(&mut &material[..])
            .collect::<Result<Vec<CertificateDer<'static>>, _>>()
            .map_err(|e| CertificateError::Parse(format!("invalid certificate chain: {e}")))?;
        if let Some(pos) = chain
            .iter()
            .position(|c| CertificateFingerprint::of_der(c.as_ref()) == fingerprint)
        {
            let leaf = chain.remove(pos);
            chain.insert(0, leaf);
        }

        let key = rustls_pemfile::private_key(&mut &material[..])
            .map_err(|e| CertificateError::Parse(format!("invalid private key: {e}")))?
            .ok_or_else(|| CertificateError::Parse("no private key in material".to_string()))?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| CertificateError::Parse(format!("unsupported private key: {e}")))?;

        let certified_key = CertifiedKey::new(chain, signing_key);
        match certified_key.keys_match() {
            // Key types that cannot report their public key are let through
            Ok(()) | Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {}
            Err(e) => {
                return Err(CertificateError::Parse(format!(
                    "private key does not match certificate: {e}"
                )))
            }
        }

        Ok(Self {
            certified_key: Arc::new(certified_key),
            fingerprint,
        })
    }

    pub fn fingerprint(&self) -> CertificateFingerprint {
        self.fingerprint
    }

    pub fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.certified_key
    }

    /// DER bytes of the leaf certificate
    pub fn leaf_der(&self) -> &[u8] {
        self.certified_key.cert[0].as_ref()
    }
}

impl fmt::Debug for TlsCertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsCertificateBundle")
            .field("chain_len", &self.certified_key.cert.len())
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Single-assignment holder of the certificate the TLS server presents.
///
/// Acts as the rustls certificate resolver, so certificates that become
/// available after the listener starts are picked up on the next handshake.
#[derive(Debug, Default)]
pub struct ActiveCertificate {
    bundle: OnceLock<TlsCertificateBundle>,
    host: Option<String>,
}

impl ActiveCertificate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only answers handshakes whose SNI (if any) matches `fqdn`
    pub fn for_host(fqdn: impl Into<String>) -> Self {
        Self {
            bundle: OnceLock::new(),
            host: Some(fqdn.into()),
        }
    }

    /// A cell that already holds `bundle`
    pub fn with_bundle(bundle: TlsCertificateBundle) -> Self {
        info!(fingerprint = %bundle.fingerprint(), "Installed TLS certificate");
        Self {
            bundle: OnceLock::from(bundle),
            host: None,
        }
    }

    /// Installs the bundle. Fails, returning the bundle, if one is already active.
    pub fn install(&self, bundle: TlsCertificateBundle) -> Result<(), TlsCertificateBundle> {
        let fingerprint = bundle.fingerprint();
        self.bundle.set(bundle)?;
        info!(fingerprint = %fingerprint, "Installed TLS certificate");
        Ok(())
    }

    pub fn fingerprint(&self) -> Option<CertificateFingerprint> {
        self.bundle.get().map(|b| b.fingerprint())
    }

    pub fn bundle(&self) -> Option<&TlsCertificateBundle> {
        self.bundle.get()
    }

    pub fn is_ready(&self) -> bool {
        self.bundle.get().is_some()
    }

    fn accepts(&self, server_name: Option<&str>) -> bool {
        match (&self.host, server_name) {
            (Some(host), Some(name)) => host.eq_ignore_ascii_case(name),
            _ => true,
        }
    }
}

impl ResolvesServerCert for ActiveCertificate {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name();
        if !self.accepts(server_name) {
            debug!(server_name = ?server_name, "Rejecting handshake for unknown host");
            return None;
        }
        let key = self.bundle.get().map(|b| Arc::clone(&b.certified_key));
        if key.is_none() {
            debug!("Handshake before certificate is available");
        }
        key
    }
}

/// Builds the rustls server configuration around the active certificate
pub fn server_config(active: Arc<ActiveCertificate>) -> ServerConfig {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(active);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

/// PEM output of the self-signed strategy
pub struct SelfSignedMaterial {
    pub cert_pem: String,
    pub key_pem: String,
}

impl SelfSignedMaterial {
    pub fn into_bundle(self) -> Result<TlsCertificateBundle, CertificateError> {
        let material = format!("{}{}", self.key_pem, self.cert_pem);
        TlsCertificateBundle::from_pem(material.as_bytes())
    }
}

/// Generates a P-256 key and a self-signed server certificate for `fqdn`
pub fn generate_self_signed(
    fqdn: &str,
    organization: &str,
) -> Result<SelfSignedMaterial, CertificateError> {
    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| CertificateError::KeyGeneration(format!("private key: {e}")))?;
    debug!("Generated private key for self-signed certificate");

    let mut params = CertificateParams::new(vec![fqdn.to_string()])
        .map_err(|e| CertificateError::Encoding(format!("invalid subject name: {e}")))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, organization);
    params.distinguished_name = dn;
    params.serial_number = Some(random_serial()?);

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + CERTIFICATE_VALIDITY;

    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.is_ca = IsCa::ExplicitNoCa;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertificateError::Encoding(format!("self-signing failed: {e}")))?;
    debug!("Created self-signed certificate");

    Ok(SelfSignedMaterial {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Self-signed strategy: generate, encode and fingerprint in one go
pub fn self_signed_bundle(
    fqdn: &str,
    organization: &str,
) -> Result<TlsCertificateBundle, CertificateError> {
    let bundle = generate_self_signed(fqdn, organization)?.into_bundle()?;
    info!(fqdn = %fqdn, fingerprint = %bundle.fingerprint(), "Generated self-signed certificate");
    Ok(bundle)
}

/// 128-bit random serial number, kept positive
fn random_serial() -> Result<SerialNumber, CertificateError> {
    let mut bytes = [0u8; 16];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| CertificateError::KeyGeneration("serial number".to_string()))?;
    bytes[0] &= 0x7f;
    Ok(SerialNumber::from_slice(&bytes))
}
