//! Nitro TLS Attest - TLS-bound attestation for AWS Nitro Enclaves
//!
//! This library lets a service inside a Nitro enclave prove that the TLS
//! certificate a client sees terminates inside that enclave:
//! - TLS certificate provisioning (self-signed or ACME-issued)
//! - Leaf certificate fingerprinting
//! - NSM attestation documents binding a client nonce to the fingerprint
//! - The `/attestation` HTTP endpoint and the enclave startup sequence

pub mod acme;
pub mod attestation;
pub mod cache;
pub mod certificate;
pub mod config;
pub mod enclave;
pub mod endpoint;
pub mod error;
pub mod fingerprint;
pub mod nsm;
pub mod outbound;
pub mod system;
pub mod transport;

pub use config::Config;
pub use enclave::EnclaveService;
pub use error::{EnclaveError, Result};
