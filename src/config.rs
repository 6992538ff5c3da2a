//! Service configuration from `ENCLAVE_*` environment variables

use crate::error::{EnclaveError, Result};
use crate::transport::TransportKind;
use serde::Deserialize;
use std::path::PathBuf;

pub const LETS_ENCRYPT_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Fully qualified domain name the certificate is issued for
    pub fqdn: String,

    #[serde(default = "def_port")]
    pub port: u32,

    /// SOCKS proxy URL for outbound traffic
    pub socks_proxy: Option<String>,

    #[serde(default)]
    pub use_acme: bool,

    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub transport: TransportKind,

    #[serde(default = "def_certificate_org")]
    pub certificate_org: String,

    #[serde(default = "def_acme_directory_url")]
    pub acme_directory_url: String,

    pub acme_contact: Option<String>,

    #[serde(default = "def_acme_challenge_port")]
    pub acme_challenge_port: u32,

    #[serde(default = "def_acme_cache_dir")]
    pub acme_cache_dir: PathBuf,

    /// Give up polling for an issued certificate after this many attempts
    pub acme_max_poll_attempts: Option<u32>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        tracing::debug!("fetching config");
        let _ = dotenvy::dotenv();
        let cfg: Self = envy::prefixed("ENCLAVE_")
            .from_env()
            .map_err(|e| EnclaveError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Development defaults: TCP transport, self-signed certificate
    pub fn dev(fqdn: impl Into<String>, port: u32) -> Self {
        Config {
            fqdn: fqdn.into(),
            port,
            socks_proxy: None,
            use_acme: false,
            debug: true,
            transport: TransportKind::Tcp,
            certificate_org: def_certificate_org(),
            acme_directory_url: def_acme_directory_url(),
            acme_contact: None,
            acme_challenge_port: def_acme_challenge_port(),
            acme_cache_dir: def_acme_cache_dir(),
            acme_max_poll_attempts: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.fqdn.trim().is_empty() {
            return Err(EnclaveError::Config("FQDN must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(EnclaveError::Config("port must not be 0".to_string()));
        }
        if self.use_acme && self.acme_challenge_port == self.port {
            return Err(EnclaveError::Config(
                "ACME challenge port must differ from the service port".to_string(),
            ));
        }
        Ok(())
    }

    pub fn info(&self) {
        tracing::info!(
            fqdn = %self.fqdn,
            port = self.port,
            transport = ?self.transport,
            use_acme = self.use_acme,
            socks_proxy = ?self.socks_proxy,
            "effective config"
        );
        if self.use_acme {
            tracing::info!(
                directory = %self.acme_directory_url,
                challenge_port = self.acme_challenge_port,
                cache_dir = %self.acme_cache_dir.display(),
                max_poll_attempts = ?self.acme_max_poll_attempts,
                "ACME config"
            );
            tracing::warn!("certificates are not cached across restarts; frequent restarts may hit issuer rate limits");
        }
        if self.transport == TransportKind::Tcp {
            tracing::warn!("TCP transport selected; entropy seeding and loopback setup are skipped");
        }
    }
}

fn def_port() -> u32 {
    443
}

fn def_certificate_org() -> String {
    "Nitro Enclave".to_string()
}

fn def_acme_directory_url() -> String {
    LETS_ENCRYPT_DIRECTORY.to_string()
}

fn def_acme_challenge_port() -> u32 {
    80
}

fn def_acme_cache_dir() -> PathBuf {
    PathBuf::from("cert-cache")
}
