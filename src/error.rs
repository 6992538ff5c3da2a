//! Error types for the attestation service

use std::fmt;
use thiserror::Error;

/// Failures while asking the security module for an attestation document
#[derive(Error, Debug)]
pub enum AttestationError {
    #[error("failed to open NSM session: {0}")]
    Session(String),

    #[error("NSM device reported an error: {0}")]
    Device(String),

    #[error("NSM device did not return an attestation")]
    NoDocument,

    #[error("attestation task failed: {0}")]
    Join(String),
}

/// Failures while producing or inspecting TLS certificates
#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("no PEM data found in input")]
    MalformedInput,

    #[error("no leaf certificate found in chain")]
    NotFound,

    #[error("failed to parse certificate material: {0}")]
    Parse(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("certificate encoding failed: {0}")]
    Encoding(String),
}

/// Failures while reading or writing the certificate cache
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache miss")]
    Miss,

    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache lookup timed out")]
    Timeout,
}

/// Errors that can occur in the enclave service
#[derive(Error, Debug)]
pub enum EnclaveError {
    #[error(transparent)]
    Attestation(#[from] AttestationError),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("certificate issuance failed: {0}")]
    Issuance(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Startup(#[from] StartupError),
}

/// The ordered steps of enclave startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStep {
    SeedEntropy,
    AssignLoopback,
    ProvisionCertificate,
    RegisterEndpoint,
    ConfigureProxy,
    BindListener,
    Serve,
}

impl fmt::Display for StartupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StartupStep::SeedEntropy => "seed entropy",
            StartupStep::AssignLoopback => "assign loopback address",
            StartupStep::ProvisionCertificate => "provision certificate",
            StartupStep::RegisterEndpoint => "register attestation endpoint",
            StartupStep::ConfigureProxy => "configure proxy",
            StartupStep::BindListener => "bind listener",
            StartupStep::Serve => "serve",
        };
        f.write_str(name)
    }
}

/// A startup step failed; earlier steps are not retried
#[derive(Error, Debug)]
#[error("failed to start Nitro Enclave: {step}: {source}")]
pub struct StartupError {
    pub step: StartupStep,
    #[source]
    pub source: Box<EnclaveError>,
}

impl StartupError {
    pub fn new(step: StartupStep, source: impl Into<EnclaveError>) -> Self {
        Self {
            step,
            source: Box::new(source.into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, EnclaveError>;
