//! Enclave service: startup sequence and TLS serving
//!
//! Startup is strictly ordered:
//!
//! 1. seed the entropy pool from the NSM
//! 2. give `lo` its address
//! 3. provision the TLS certificate (self-signed or ACME)
//! 4. register the attestation endpoint
//! 5. point outbound traffic at the SOCKS proxy
//! 6. bind the listener
//! 7. serve HTTPS
//!
//! Any failure aborts startup with the failing step attached.

use crate::acme::{self, AcmeSettings};
use crate::attestation::{AttestationDevice, AttestationProvider};
use crate::certificate::{self, ActiveCertificate};
use crate::config::Config;
use crate::endpoint::{AttestationEndpoint, ATTESTATION_PATH};
use crate::error::{EnclaveError, StartupError, StartupStep};
use crate::nsm::NsmDevice;
use crate::system::{self, EntropySource, SocksProxy};
use crate::transport::{self, Listener, TransportKind};
use axum::handler::Handler;
use axum::http::Method;
use axum::routing::{on, MethodFilter};
use axum::Router;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

type StartupResult<T> = std::result::Result<T, StartupError>;

fn step<T, E: Into<EnclaveError>>(step: StartupStep, result: std::result::Result<T, E>) -> StartupResult<T> {
    result.map_err(|e| StartupError::new(step, e))
}

/// A service running inside a Nitro Enclave
pub struct EnclaveService {
    cfg: Config,
    router: Router,
    routes: HashSet<(Method, String)>,
    device: Arc<dyn AttestationDevice>,
    entropy: Arc<dyn EntropySource>,
}

impl EnclaveService {
    /// Creates a service backed by the enclave's NSM
    pub fn new(cfg: Config) -> Self {
        let nsm = Arc::new(NsmDevice::new());
        Self::with_device(cfg, nsm.clone(), nsm)
    }

    pub fn with_device(
        cfg: Config,
        device: Arc<dyn AttestationDevice>,
        entropy: Arc<dyn EntropySource>,
    ) -> Self {
        Self {
            cfg,
            router: Router::new(),
            routes: HashSet::new(),
            device,
            entropy,
        }
    }

    /// Adds an application route. Only possible before [`Self::start`].
    ///
    /// `path` uses axum syntax (`/items/{id}`, `/files/{*rest}`).
    pub fn add_route<H, T>(&mut self, method: Method, path: &str, handler: H) -> crate::error::Result<()>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        let filter = MethodFilter::try_from(method.clone())
            .map_err(|_| EnclaveError::Config(format!("unsupported route method: {method}")))?;
        if !path.starts_with('/') || path.split('/').any(|seg| seg.starts_with([':', '*'])) {
            return Err(EnclaveError::Config(format!("invalid route path: {path}")));
        }
        if !self.routes.insert((method.clone(), path.to_string())) {
            return Err(EnclaveError::Config(format!("duplicate route: {method} {path}")));
        }

        debug!(method = %method, path = %path, "Registered route");
        self.router = std::mem::take(&mut self.router).route(path, on(filter, handler));
        Ok(())
    }

    /// Runs startup and serves HTTPS. Only returns on failure.
    pub async fn start(self) -> StartupResult<()> {
        self.prepare().await?.serve().await
    }

    /// Runs every startup step up to and including binding the listener
    pub async fn prepare(self) -> StartupResult<PreparedEnclave> {
        let EnclaveService {
            cfg,
            router,
            routes,
            device,
            entropy,
        } = self;

        if cfg.transport == TransportKind::Vsock {
            step(StartupStep::SeedEntropy, system::seed_entropy_pool(entropy.as_ref()))?;
            step(StartupStep::AssignLoopback, system::assign_loopback_address())?;
        } else {
            warn!("Development transport; skipping entropy seeding and loopback setup");
        }

        let (certificate, proxy_tx) = provision_certificate(&cfg).await?;

        if routes.iter().any(|(_, path)| path == ATTESTATION_PATH) {
            return Err(StartupError::new(
                StartupStep::RegisterEndpoint,
                EnclaveError::Config(format!("{ATTESTATION_PATH} is already routed")),
            ));
        }
        let attester = Arc::new(AttestationProvider::new(device));
        let endpoint = Arc::new(AttestationEndpoint::new(attester, Arc::clone(&certificate)));
        let router = router.route(ATTESTATION_PATH, endpoint.into_route());

        let proxy = step(
            StartupStep::ConfigureProxy,
            system::configure_proxy(cfg.socks_proxy.as_deref()),
        )?;
        if let Some(tx) = proxy_tx {
            if tx.send(proxy).is_err() {
                warn!("Certificate issuer is gone; proxy not handed over");
            }
        }

        info!(port = cfg.port, "Starting Web server");
        let listener = step(
            StartupStep::BindListener,
            Listener::bind(cfg.transport, cfg.port).await,
        )?;

        let tls = TlsAcceptor::from(Arc::new(certificate::server_config(Arc::clone(&certificate))));

        Ok(PreparedEnclave {
            listener,
            router,
            tls,
            certificate,
        })
    }
}

type ProxySender = oneshot::Sender<Option<SocksProxy>>;

/// Obtains the certificate according to the configured strategy.
///
/// In ACME mode the returned sender must receive the outbound proxy before
/// the issuer contacts the directory.
async fn provision_certificate(
    cfg: &Config,
) -> StartupResult<(Arc<ActiveCertificate>, Option<ProxySender>)> {
    if !cfg.use_acme {
        let bundle = step(
            StartupStep::ProvisionCertificate,
            certificate::self_signed_bundle(&cfg.fqdn, &cfg.certificate_org),
        )?;
        return Ok((Arc::new(ActiveCertificate::with_bundle(bundle)), None));
    }

    let active = Arc::new(ActiveCertificate::for_host(cfg.fqdn.clone()));
    let (proxy_tx, proxy_rx) = oneshot::channel();
    let ready = step(
        StartupStep::ProvisionCertificate,
        acme::start(AcmeSettings::from_config(cfg), proxy_rx).await,
    )?;

    let installer = Arc::clone(&active);
    tokio::spawn(async move {
        match ready.await {
            Ok(bundle) => {
                if installer.install(bundle).is_err() {
                    warn!("Certificate already installed; ignoring issued certificate");
                }
            }
            Err(_) => error!("Certificate issuance ended without a certificate"),
        }
    });
    Ok((active, Some(proxy_tx)))
}

/// An enclave whose listener is bound and whose certificate is provisioned
pub struct PreparedEnclave {
    listener: Listener,
    router: Router,
    tls: TlsAcceptor,
    certificate: Arc<ActiveCertificate>,
}

impl PreparedEnclave {
    pub fn certificate(&self) -> &Arc<ActiveCertificate> {
        &self.certificate
    }

    /// Bound address of a TCP listener
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.tcp_addr()
    }

    pub async fn serve(self) -> StartupResult<()> {
        step(
            StartupStep::Serve,
            transport::serve(self.listener, self.router, Some(self.tls)).await,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::tests::MockDevice;
    use crate::attestation::{DeviceResponse, DriverOutcome};
    use crate::cache::{CertCache, DirCache};
    use crate::certificate::generate_self_signed;
    use crate::error::AttestationError;
    use crate::fingerprint::CertificateFingerprint;
    use base64::Engine;
    use rustls::pki_types::{CertificateDer, ServerName};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::{sleep, timeout};
    use tokio_rustls::client::TlsStream;
    use tokio_rustls::TlsConnector;

    const NONCE: &str = "00112233445566778899aabbccddeeff00112233";

    struct NoEntropy;

    impl EntropySource for NoEntropy {
        fn random_bytes(&self) -> Result<Vec<u8>, AttestationError> {
            Err(AttestationError::Session("unused".to_string()))
        }
    }

    fn mock_device() -> Arc<MockDevice> {
        Arc::new(MockDevice::returning(DriverOutcome {
            response: DeviceResponse {
                error: String::new(),
                document: Some(b"signed-document".to_vec()),
            },
            driver_error: Some("spurious".to_string()),
        }))
    }

    async fn tls_connect(
        addr: SocketAddr,
        trusted_leaf: &[u8],
        server_name: &str,
    ) -> std::io::Result<TlsStream<TcpStream>> {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(CertificateDer::from(trusted_leaf.to_vec())).unwrap();
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let tcp = TcpStream::connect(addr).await?;
        let name = ServerName::try_from(server_name.to_string()).unwrap();
        connector.connect(name, tcp).await
    }

    async fn https_get(
        addr: SocketAddr,
        trusted_leaf: &[u8],
        path: &str,
    ) -> (String, CertificateFingerprint) {
        let mut tls = tls_connect(addr, trusted_leaf, "example.test").await.unwrap();
        let served = tls.get_ref().1.peer_certificates().unwrap()[0].clone();

        let request =
            format!("GET {path} HTTP/1.1\r\nHost: example.test\r\nConnection: close\r\n\r\n");
        tls.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match tls.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => response.extend_from_slice(&buf[..n]),
            }
        }
        (
            String::from_utf8(response).unwrap(),
            CertificateFingerprint::of_der(served.as_ref()),
        )
    }

    async fn running_enclave(
        device: Arc<MockDevice>,
        routes: impl FnOnce(&mut EnclaveService),
    ) -> (SocketAddr, Vec<u8>, Arc<ActiveCertificate>) {
        let mut service =
            EnclaveService::with_device(Config::dev("example.test", 0), device, Arc::new(NoEntropy));
        routes(&mut service);
        let enclave = service.prepare().await.unwrap();
        let addr = enclave.local_addr().unwrap();
        let active = Arc::clone(enclave.certificate());
        let leaf = active.bundle().unwrap().leaf_der().to_vec();
        tokio::spawn(enclave.serve());
        (addr, leaf, active)
    }

    /// Starts an ACME-mode enclave whose certificate is already cached
    async fn running_acme_enclave(
        device: Arc<MockDevice>,
        cache_dir: &std::path::Path,
    ) -> (SocketAddr, Vec<u8>, Arc<ActiveCertificate>) {
        let issued = generate_self_signed("example.test", "Issued Org").unwrap();
        let leaf = rustls_pemfile::certs(&mut issued.cert_pem.as_bytes())
            .next()
            .unwrap()
            .unwrap()
            .to_vec();
        let cache = DirCache::create(cache_dir).await.unwrap();
        cache
            .put(
                "example.test",
                format!("{}{}", issued.key_pem, issued.cert_pem).as_bytes(),
            )
            .await
            .unwrap();

        let mut cfg = Config::dev("example.test", 0);
        cfg.use_acme = true;
        cfg.acme_challenge_port = 0;
        cfg.acme_cache_dir = cache_dir.to_path_buf();
        cfg.acme_directory_url = "http://127.0.0.1:9/directory".to_string();

        let enclave = EnclaveService::with_device(cfg, device, Arc::new(NoEntropy))
            .prepare()
            .await
            .unwrap();
        let addr = enclave.local_addr().unwrap();
        let active = Arc::clone(enclave.certificate());
        tokio::spawn(enclave.serve());

        timeout(Duration::from_secs(10), async {
            while !active.is_ready() {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("cached certificate was not installed");
        (addr, leaf, active)
    }

    #[tokio::test]
    async fn test_attestation_binds_served_certificate() {
        let device = mock_device();
        let (addr, leaf, active) = running_enclave(device.clone(), |_| {}).await;

        let (response, served) =
            https_get(addr, &leaf, &format!("/attestation?nonce={NONCE}")).await;

        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        let expected = base64::engine::general_purpose::STANDARD.encode(b"signed-document");
        assert!(response.ends_with(&format!("\r\n\r\n{expected}\n")), "{response}");

        assert_eq!(Some(served), active.fingerprint());
        let requests = device.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].user_data, served.as_bytes().to_vec());
        assert_eq!(requests[0].nonce, hex::decode(NONCE).unwrap());
    }

    #[tokio::test]
    async fn test_acme_certificate_is_attested() {
        let tmp = tempfile::tempdir().unwrap();
        let device = mock_device();
        let (addr, leaf, active) = running_acme_enclave(device.clone(), tmp.path()).await;

        let (response, served) =
            https_get(addr, &leaf, &format!("/attestation?nonce={NONCE}")).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");

        assert_eq!(served, CertificateFingerprint::of_der(&leaf));
        assert_eq!(Some(served), active.fingerprint());
        let requests = device.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].user_data, served.as_bytes().to_vec());
    }

    #[tokio::test]
    async fn test_acme_refuses_other_server_name() {
        let tmp = tempfile::tempdir().unwrap();
        let (addr, leaf, _) = running_acme_enclave(mock_device(), tmp.path()).await;

        let err = tls_connect(addr, &leaf, "other.test").await.err().unwrap();
        let tls_err = err
            .get_ref()
            .and_then(|e| e.downcast_ref::<rustls::Error>())
            .unwrap();
        assert!(matches!(tls_err, rustls::Error::AlertReceived(_)), "{tls_err}");

        // The right name still gets through afterwards
        assert!(tls_connect(addr, &leaf, "example.test").await.is_ok());
    }

    #[tokio::test]
    async fn test_bad_nonce_over_tls() {
        let device = mock_device();
        let (addr, leaf, _) = running_enclave(device.clone(), |_| {}).await;

        let (response, _) = https_get(addr, &leaf, "/attestation?nonce=xyz").await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request"), "{response}");
        assert!(response.ends_with("bad nonce format\n"));
        assert!(device.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_application_routes() {
        let (addr, leaf, _) = running_enclave(mock_device(), |service| {
            service
                .add_route(Method::GET, "/hello", || async { "hello\n" })
                .unwrap();
        })
        .await;

        let (response, _) = https_get(addr, &leaf, "/hello").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("hello\n"));

        let (response, _) = https_get(addr, &leaf, "/missing").await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found"));
    }

    #[test]
    fn test_add_route_rejections() {
        let mut service = EnclaveService::with_device(
            Config::dev("example.test", 0),
            mock_device(),
            Arc::new(NoEntropy),
        );
        service
            .add_route(Method::GET, "/items/{id}", || async { "item" })
            .unwrap();

        let purge = Method::from_bytes(b"PURGE").unwrap();
        assert!(service.add_route(purge, "/items", || async { "" }).is_err());
        assert!(service.add_route(Method::GET, "items", || async { "" }).is_err());
        assert!(service.add_route(Method::GET, "/items/:id", || async { "" }).is_err());
        assert!(service
            .add_route(Method::GET, "/items/{id}", || async { "again" })
            .is_err());
        assert!(service
            .add_route(Method::POST, "/items/{id}", || async { "post" })
            .is_ok());
    }

    #[tokio::test]
    async fn test_attestation_path_is_reserved() {
        let mut service = EnclaveService::with_device(
            Config::dev("example.test", 0),
            mock_device(),
            Arc::new(NoEntropy),
        );
        service
            .add_route(Method::GET, ATTESTATION_PATH, || async { "mine" })
            .unwrap();

        let err = service.prepare().await.err().unwrap();
        assert_eq!(err.step, StartupStep::RegisterEndpoint);
    }

    #[tokio::test]
    async fn test_bind_failure_names_step() {
        let taken = tokio::net::TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = u32::from(taken.local_addr().unwrap().port());

        let service = EnclaveService::with_device(
            Config::dev("example.test", port),
            mock_device(),
            Arc::new(NoEntropy),
        );
        let err = service.prepare().await.err().unwrap();
        assert_eq!(err.step, StartupStep::BindListener);
        assert!(err.to_string().contains("bind listener"));
    }
}
