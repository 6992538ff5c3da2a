//! `GET /attestation?nonce=<40 hex digits>`
//!
//! Returns a base64-encoded attestation document binding the client's nonce
//! to the fingerprint of the certificate currently served over TLS.

use crate::attestation::Attester;
use crate::certificate::ActiveCertificate;
use crate::error::AttestationError;
use axum::extract::{Query, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, MethodRouter};
use base64::Engine;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub const ATTESTATION_PATH: &str = "/attestation";

/// Number of hex digits in a nonce
pub const NONCE_HEX_LEN: usize = 40;
pub const NONCE_LEN: usize = NONCE_HEX_LEN / 2;

const MSG_FAILED_ATTESTATION: &str = "failed to obtain attestation document";

/// Plain-text response; error bodies are newline-terminated like the success body
pub fn text_response(status: StatusCode, body: impl Into<String>) -> Response {
    let mut body = body.into();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    (status, body).into_response()
}

/// Rejections of client input, each with a fixed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceError {
    MethodNotGet,
    BadForm,
    Missing,
    BadFormat,
}

impl NonceError {
    pub fn status(&self) -> StatusCode {
        match self {
            NonceError::MethodNotGet => StatusCode::METHOD_NOT_ALLOWED,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            NonceError::MethodNotGet => "only GET requests are allowed",
            NonceError::BadForm => "failed to parse form data",
            NonceError::Missing => "missing nonce",
            NonceError::BadFormat => "bad nonce format",
        }
    }
}

/// Validates method and query, returning the raw nonce bytes
pub fn extract_nonce(method: &Method, uri: &Uri) -> Result<[u8; NONCE_LEN], NonceError> {
    if *method != Method::GET {
        return Err(NonceError::MethodNotGet);
    }
    if uri.query().is_some_and(|q| !is_well_formed(q)) {
        return Err(NonceError::BadForm);
    }
    let Query(params) =
        Query::<Vec<(String, String)>>::try_from_uri(uri).map_err(|_| NonceError::BadForm)?;

    let nonce = params
        .iter()
        .find(|(k, _)| k == "nonce")
        .map(|(_, v)| v.as_str())
        .filter(|v| !v.is_empty())
        .ok_or(NonceError::Missing)?;

    if nonce.len() != NONCE_HEX_LEN || !nonce.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(NonceError::BadFormat);
    }

    let mut raw = [0u8; NONCE_LEN];
    hex::decode_to_slice(nonce, &mut raw).map_err(|_| NonceError::BadFormat)?;
    Ok(raw)
}

/// Rejects `;` separators and percent signs not followed by two hex digits,
/// which the form decoder would otherwise pass through silently.
fn is_well_formed(query: &str) -> bool {
    if query.contains(';') {
        return false;
    }
    let bytes = query.as_bytes();
    bytes.iter().enumerate().all(|(i, &b)| {
        b != b'%'
            || bytes
                .get(i + 1..i + 3)
                .is_some_and(|d| d.iter().all(u8::is_ascii_hexdigit))
    })
}

/// Stateless attestation handler bound to the active certificate
pub struct AttestationEndpoint {
    attester: Arc<dyn Attester>,
    certificate: Arc<ActiveCertificate>,
}

impl AttestationEndpoint {
    pub fn new(attester: Arc<dyn Attester>, certificate: Arc<ActiveCertificate>) -> Self {
        Self {
            attester,
            certificate,
        }
    }

    pub async fn handle(&self, method: &Method, uri: &Uri) -> Response {
        let nonce = match extract_nonce(method, uri) {
            Ok(nonce) => nonce,
            Err(e) => {
                debug!(reason = e.message(), "Rejected attestation request");
                return text_response(e.status(), e.message());
            }
        };

        let Some(fingerprint) = self.certificate.fingerprint() else {
            warn!("Attestation requested before a certificate is installed");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, MSG_FAILED_ATTESTATION);
        };

        // The NSM ioctl blocks
        let attester = Arc::clone(&self.attester);
        let result = tokio::task::spawn_blocking(move || {
            attester.attest(&nonce, fingerprint.as_bytes(), None)
        })
        .await
        .map_err(|e| AttestationError::Join(e.to_string()))
        .and_then(|r| r);

        match result {
            Ok(document) => {
                let mut body = base64::engine::general_purpose::STANDARD.encode(document);
                body.push('\n');
                text_response(StatusCode::OK, body)
            }
            Err(e) => {
                error!(error = %e, "Failed to obtain attestation document");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, MSG_FAILED_ATTESTATION)
            }
        }
    }

    /// Method-agnostic route; the method check happens inside [`Self::handle`]
    pub fn into_route(self: Arc<Self>) -> MethodRouter {
        any(attest).with_state(self)
    }
}

async fn attest(
    State(endpoint): State<Arc<AttestationEndpoint>>,
    method: Method,
    uri: Uri,
) -> Response {
    endpoint.handle(&method, &uri).await
}
