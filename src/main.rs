//! Nitro TLS Attest Server
//!
//! Serves HTTPS on vsock (or TCP with `ENCLAVE_TRANSPORT=tcp`) and answers
//! `GET /attestation?nonce=<40 hex digits>` with an NSM attestation document
//! bound to the server's TLS certificate.
//!
//! Configuration comes from `ENCLAVE_*` environment variables; see
//! [`nitro_tls_attest::Config`].

use anyhow::Result;
use nitro_tls_attest::{Config, EnclaveService};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env()?;

    let level = if cfg.debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Nitro enclave service...");
    cfg.info();

    EnclaveService::new(cfg).start().await?;
    Ok(())
}
