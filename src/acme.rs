//! External certificate issuance over ACME (HTTP-01)
//!
//! Three long-lived tasks run next to the HTTPS server:
//!
//! - the challenge responder answers HTTP-01 token lookups on the challenge
//!   port (80 by default) and redirects everything else to HTTPS;
//! - the issuer drives an ACME order to completion and stores
//!   `private key PEM ++ chain PEM` in the cache under the FQDN;
//! - the poller watches the cache until that material shows up, builds the
//!   TLS bundle and hands it over through a one-shot channel.
//!
//! Certificates are not cached across enclave restarts, so every restart
//! issues a new certificate. Restarting often will run into the issuer's
//! rate limits.

use crate::cache::{CertCache, DirCache};
use crate::certificate::TlsCertificateBundle;
use crate::config::Config;
use crate::endpoint::text_response;
use crate::error::{CacheError, EnclaveError, Result};
use crate::outbound::OutboundClient;
use crate::system::SocksProxy;
use crate::transport::{self, Listener, TransportKind};
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_TYPE, LOCATION};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, HttpClient, Identifier, NewAccount, NewOrder,
    Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

pub const CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Sleep between cache lookups
pub const POLL_BACKOFF: Duration = Duration::from_secs(5);
/// Upper bound for a single cache lookup
pub const POLL_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Wait before retrying a failed issuance
pub const ISSUANCE_RETRY_DELAY: Duration = Duration::from_secs(60);

const ORDER_POLL_LIMIT: u32 = 10;

/// How the poller waits for issued material
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub backoff: Duration,
    pub attempt_timeout: Duration,
    /// `None` polls forever
    pub max_attempts: Option<u32>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            backoff: POLL_BACKOFF,
            attempt_timeout: POLL_ATTEMPT_TIMEOUT,
            max_attempts: None,
        }
    }
}

/// Everything the issuance tasks need
#[derive(Debug, Clone)]
pub struct AcmeSettings {
    pub fqdn: String,
    pub directory_url: String,
    pub contact: Option<String>,
    pub transport: TransportKind,
    pub challenge_port: u32,
    pub https_port: u32,
    pub cache_dir: PathBuf,
    pub poll: PollPolicy,
}

impl AcmeSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            fqdn: cfg.fqdn.clone(),
            directory_url: cfg.acme_directory_url.clone(),
            contact: cfg.acme_contact.clone(),
            transport: cfg.transport,
            challenge_port: cfg.acme_challenge_port,
            https_port: cfg.port,
            cache_dir: cfg.acme_cache_dir.clone(),
            poll: PollPolicy {
                max_attempts: cfg.acme_max_poll_attempts,
                ..PollPolicy::default()
            },
        }
    }
}

/// HTTP-01 tokens and their key authorizations
#[derive(Clone, Default)]
pub struct ChallengeStore {
    tokens: Arc<RwLock<HashMap<String, String>>>,
}

impl ChallengeStore {
    pub async fn publish(&self, token: &str, key_authorization: &str) {
        debug!(token = %token, "Publishing HTTP-01 challenge");
        self.tokens
            .write()
            .await
            .insert(token.to_string(), key_authorization.to_string());
    }

    pub async fn revoke(&self, token: &str) {
        self.tokens.write().await.remove(token);
    }

    pub async fn lookup(&self, token: &str) -> Option<String> {
        self.tokens.read().await.get(token).cloned()
    }
}

#[derive(Clone)]
struct ChallengeState {
    store: ChallengeStore,
    origin: Arc<str>,
}

/// Router for the challenge port
pub fn challenge_router(store: ChallengeStore, fqdn: &str, https_port: u32) -> Router {
    let origin = if https_port == 443 {
        format!("https://{fqdn}")
    } else {
        format!("https://{fqdn}:{https_port}")
    };

    Router::new()
        .route(&format!("{CHALLENGE_PREFIX}{{token}}"), get(answer_challenge))
        .fallback(redirect_to_https)
        .with_state(ChallengeState {
            store,
            origin: origin.into(),
        })
}

async fn answer_challenge(
    State(state): State<ChallengeState>,
    Path(token): Path<String>,
) -> Response {
    match state.store.lookup(&token).await {
        Some(key_authorization) => {
            debug!(token = %token, "Answered HTTP-01 challenge");
            (StatusCode::OK, [(CONTENT_TYPE, "text/plain")], key_authorization).into_response()
        }
        None => text_response(StatusCode::NOT_FOUND, "unknown challenge token"),
    }
}

async fn redirect_to_https(State(state): State<ChallengeState>, method: Method, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return text_response(StatusCode::BAD_REQUEST, "Use HTTPS");
    }
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let target = format!("{}{path}", state.origin);
    (StatusCode::FOUND, [(LOCATION, target)]).into_response()
}

fn issuance_error(e: impl std::fmt::Display) -> EnclaveError {
    EnclaveError::Issuance(e.to_string())
}

/// Runs one ACME order for `settings.fqdn` over `http` and stores the
/// result in `cache`
pub async fn issue_certificate(
    settings: &AcmeSettings,
    challenges: &ChallengeStore,
    cache: &dyn CertCache,
    http: Box<dyn HttpClient>,
) -> Result<()> {
    let contact: Vec<String> = settings
        .contact
        .iter()
        .map(|c| format!("mailto:{c}"))
        .collect();
    let contact: Vec<&str> = contact.iter().map(String::as_str).collect();

    let (account, _credentials) = Account::create_with_http(
        &NewAccount {
            contact: &contact,
            terms_of_service_agreed: true,
            only_return_existing: false,
        },
        &settings.directory_url,
        None,
        http,
    )
    .await
    .map_err(issuance_error)?;
    debug!(directory = %settings.directory_url, "Created ACME account");

    let identifiers = [Identifier::Dns(settings.fqdn.clone())];
    let mut order = account
        .new_order(&NewOrder {
            identifiers: &identifiers,
        })
        .await
        .map_err(issuance_error)?;

    let authorizations = order.authorizations().await.map_err(issuance_error)?;
    let mut published = Vec::new();
    for authz in &authorizations {
        match &authz.status {
            AuthorizationStatus::Pending => {}
            AuthorizationStatus::Valid => continue,
            status => {
                return Err(issuance_error(format!(
                    "unexpected authorization status: {status:?}"
                )))
            }
        }

        let challenge = authz
            .challenges
            .iter()
            .find(|c| c.r#type == ChallengeType::Http01)
            .ok_or_else(|| issuance_error("no HTTP-01 challenge offered"))?;

        let key_authorization = order.key_authorization(challenge);
        challenges
            .publish(&challenge.token, key_authorization.as_str())
            .await;
        published.push(challenge.token.clone());

        order
            .set_challenge_ready(&challenge.url)
            .await
            .map_err(issuance_error)?;
    }

    let status = wait_for_order(&mut order).await;
    for token in &published {
        challenges.revoke(token).await;
    }
    let status = status?;
    if !matches!(status, OrderStatus::Ready) {
        return Err(issuance_error(format!("order not ready: {status:?}")));
    }

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| issuance_error(format!("key generation: {e}")))?;
    let mut params = CertificateParams::new(vec![settings.fqdn.clone()])
        .map_err(|e| issuance_error(format!("CSR parameters: {e}")))?;
    params.distinguished_name = DistinguishedName::new();
    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| issuance_error(format!("CSR encoding: {e}")))?;

    order.finalize(csr.der()).await.map_err(issuance_error)?;
    let chain_pem = wait_for_certificate(&mut order).await?;

    let material = format!("{}{}", key_pair.serialize_pem(), chain_pem);
    cache.put(&settings.fqdn, material.as_bytes()).await?;
    info!(fqdn = %settings.fqdn, "Certificate issued and cached");
    Ok(())
}

async fn wait_for_order(order: &mut Order) -> Result<OrderStatus> {
    let mut delay = Duration::from_millis(250);
    for _ in 0..ORDER_POLL_LIMIT {
        sleep(delay).await;
        let state = order.refresh().await.map_err(issuance_error)?;
        match &state.status {
            OrderStatus::Pending | OrderStatus::Processing => {
                debug!(status = ?state.status, "Order not ready yet");
            }
            status => return Ok(status.clone()),
        }
        delay *= 2;
    }
    Err(issuance_error("timed out waiting for order"))
}

async fn wait_for_certificate(order: &mut Order) -> Result<String> {
    let mut delay = Duration::from_millis(250);
    for _ in 0..ORDER_POLL_LIMIT {
        if let Some(chain) = order.certificate().await.map_err(issuance_error)? {
            return Ok(chain);
        }
        if matches!(order.state().status, OrderStatus::Invalid) {
            return Err(issuance_error("order became invalid after finalization"));
        }
        sleep(delay).await;
        delay *= 2;
    }
    Err(issuance_error("timed out waiting for certificate"))
}

/// Issues until the cache holds material for the FQDN.
///
/// No outbound request is made before startup has configured the proxy.
async fn run_issuer(
    settings: AcmeSettings,
    challenges: ChallengeStore,
    cache: Arc<dyn CertCache>,
    proxy: oneshot::Receiver<Option<SocksProxy>>,
) {
    let Ok(proxy) = proxy.await else {
        warn!("Startup ended before the outbound proxy was configured; not issuing");
        return;
    };

    loop {
        if cache.get(&settings.fqdn).await.is_ok() {
            debug!(fqdn = %settings.fqdn, "Certificate already cached; skipping issuance");
            return;
        }
        let http = Box::new(OutboundClient::new(proxy.clone()));
        match issue_certificate(&settings, &challenges, cache.as_ref(), http).await {
            Ok(()) => return,
            Err(e) => {
                warn!(error = %e, retry_in = ?ISSUANCE_RETRY_DELAY, "Certificate issuance failed");
                sleep(ISSUANCE_RETRY_DELAY).await;
            }
        }
    }
}

/// Polls `cache` for the FQDN's material until a usable bundle appears.
///
/// Lookup failures of any kind are retried after `policy.backoff`. Returns
/// `None` only when `policy.max_attempts` is exhausted.
pub async fn poll_for_certificate(
    cache: &dyn CertCache,
    fqdn: &str,
    policy: PollPolicy,
) -> Option<TlsCertificateBundle> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match timeout(policy.attempt_timeout, cache.get(fqdn)).await {
            Ok(Ok(material)) => match TlsCertificateBundle::from_pem(&material) {
                Ok(bundle) => {
                    info!(
                        fingerprint = %bundle.fingerprint(),
                        attempt = attempt,
                        "Got certificate from cache"
                    );
                    return Some(bundle);
                }
                Err(e) => warn!(error = %e, "Cached certificate material is unusable"),
            },
            Ok(Err(CacheError::Miss)) => debug!(attempt = attempt, "Certificate not cached yet"),
            Ok(Err(e)) => warn!(error = %e, attempt = attempt, "Cache lookup failed"),
            Err(_) => {
                let e = CacheError::Timeout;
                warn!(error = %e, attempt = attempt, "Cache lookup failed");
            }
        }

        if policy.max_attempts.is_some_and(|max| attempt >= max) {
            error!(attempts = attempt, "Giving up waiting for certificate");
            return None;
        }
        sleep(policy.backoff).await;
    }
}

/// Starts the external-issuance tasks.
///
/// The issuer waits for `proxy` before contacting the directory. The
/// returned receiver resolves once the issued certificate is available; it
/// is dropped without a value if the poller gives up.
pub async fn start(
    settings: AcmeSettings,
    proxy: oneshot::Receiver<Option<SocksProxy>>,
) -> Result<oneshot::Receiver<TlsCertificateBundle>> {
    info!(fqdn = %settings.fqdn, "ACME hostname set");
    let cache: Arc<dyn CertCache> = Arc::new(DirCache::create(&settings.cache_dir).await?);
    let challenges = ChallengeStore::default();

    let listener = Listener::bind(settings.transport, settings.challenge_port).await?;
    let router = challenge_router(challenges.clone(), &settings.fqdn, settings.https_port);
    tokio::spawn(async move {
        info!("Starting HTTP-01 challenge listener");
        if let Err(e) = transport::serve(listener, router, None).await {
            error!(error = %e, "HTTP-01 challenge listener stopped");
        }
    });

    tokio::spawn(run_issuer(settings.clone(), challenges, Arc::clone(&cache), proxy));

    let (tx, rx) = oneshot::channel();
    let fqdn = settings.fqdn.clone();
    let policy = settings.poll;
    tokio::spawn(async move {
        if let Some(bundle) = poll_for_certificate(cache.as_ref(), &fqdn, policy).await {
            if tx.send(bundle).is_err() {
                warn!("Certificate receiver dropped before installation");
            }
        }
    });

    Ok(rx)
}
