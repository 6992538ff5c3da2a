//! Attestation documents from the security module
//!
//! [`AttestationProvider`] opens a session on an [`AttestationDevice`], asks
//! for a signed document binding a nonce and user data, and always closes the
//! session again. Devices are traits so tests can substitute a mock for the
//! Nitro Secure Module.

use crate::error::AttestationError;
use std::sync::Arc;
use tracing::{debug, warn};

/// What gets attested: constructed per request, never stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationRequest {
    pub nonce: Vec<u8>,
    pub user_data: Vec<u8>,
    pub public_key: Option<Vec<u8>>,
}

/// Response payload of an attestation exchange
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceResponse {
    /// Device-supplied error message; empty on success
    pub error: String,
    pub document: Option<Vec<u8>>,
}

/// Result of one request/response exchange with the driver.
///
/// `driver_error` is the driver's own low-level error indicator, reported
/// separately from the response payload.
#[derive(Debug, Clone, Default)]
pub struct DriverOutcome {
    pub response: DeviceResponse,
    pub driver_error: Option<String>,
}

/// An open, exclusive session with the security module
pub trait DeviceSession: Send {
    fn send(&mut self, request: &AttestationRequest) -> DriverOutcome;

    fn close(self: Box<Self>) -> Result<(), String>;
}

/// A security module able to open attestation sessions
pub trait AttestationDevice: Send + Sync {
    fn open_session(&self) -> Result<Box<dyn DeviceSession>, AttestationError>;
}

/// Anything that can produce attestation documents
pub trait Attester: Send + Sync {
    fn attest(
        &self,
        nonce: &[u8],
        user_data: &[u8],
        public_key: Option<&[u8]>,
    ) -> Result<Vec<u8>, AttestationError>;
}

/// Closes the wrapped session when dropped, on every exit path
struct SessionGuard(Option<Box<dyn DeviceSession>>);

impl SessionGuard {
    fn send(&mut self, request: &AttestationRequest) -> DriverOutcome {
        match self.0.as_deref_mut() {
            Some(session) => session.send(request),
            None => DriverOutcome {
                response: DeviceResponse {
                    error: "session already closed".to_string(),
                    document: None,
                },
                driver_error: None,
            },
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.0.take() {
            if let Err(e) = session.close() {
                warn!(error = %e, "Failed to close NSM session");
            }
        }
    }
}

/// Requests attestation documents from a device
pub struct AttestationProvider {
    device: Arc<dyn AttestationDevice>,
}

impl AttestationProvider {
    pub fn new(device: Arc<dyn AttestationDevice>) -> Self {
        Self { device }
    }
}

impl Attester for AttestationProvider {
    fn attest(
        &self,
        nonce: &[u8],
        user_data: &[u8],
        public_key: Option<&[u8]>,
    ) -> Result<Vec<u8>, AttestationError> {
        let mut guard = SessionGuard(Some(self.device.open_session()?));

        let request = AttestationRequest {
            nonce: nonce.to_vec(),
            user_data: user_data.to_vec(),
            public_key: public_key.map(<[u8]>::to_vec),
        };
        let outcome = guard.send(&request);

        document_from_outcome(outcome)
    }
}

/// Decides whether an exchange produced a document.
///
/// This is the one place where a driver error is deliberately ignored: the
/// driver can flag an error on a call that did return a document, so only the
/// response payload is trusted. A non-empty device error or a missing
/// document is a failure no matter what the driver indicator said.
pub fn document_from_outcome(outcome: DriverOutcome) -> Result<Vec<u8>, AttestationError> {
    if let Some(driver_error) = &outcome.driver_error {
        debug!(error = %driver_error, "Ignoring driver error indicator; inspecting response");
    }

    let DeviceResponse { error, document } = outcome.response;
    if !error.is_empty() {
        return Err(AttestationError::Device(error));
    }
    document.ok_or(AttestationError::NoDocument)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Mock device recording requests and session closes
    #[derive(Default)]
    pub(crate) struct MockDevice {
        pub outcome: Mutex<DriverOutcome>,
        pub fail_open: bool,
        pub fail_close: bool,
        pub opened: AtomicUsize,
        pub closed: Arc<AtomicUsize>,
        pub requests: Arc<Mutex<Vec<AttestationRequest>>>,
    }

    impl MockDevice {
        pub(crate) fn returning(outcome: DriverOutcome) -> Self {
            Self {
                outcome: Mutex::new(outcome),
                ..Default::default()
            }
        }
    }

    struct MockSession {
        outcome: DriverOutcome,
        fail_close: bool,
        closed: Arc<AtomicUsize>,
        requests: Arc<Mutex<Vec<AttestationRequest>>>,
    }

    impl DeviceSession for MockSession {
        fn send(&mut self, request: &AttestationRequest) -> DriverOutcome {
            self.requests.lock().unwrap().push(request.clone());
            self.outcome.clone()
        }

        fn close(self: Box<Self>) -> Result<(), String> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                Err("close failed".to_string())
            } else {
                Ok(())
            }
        }
    }

    impl AttestationDevice for MockDevice {
        fn open_session(&self) -> Result<Box<dyn DeviceSession>, AttestationError> {
            if self.fail_open {
                return Err(AttestationError::Session("device unavailable".to_string()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockSession {
                outcome: self.outcome.lock().unwrap().clone(),
                fail_close: self.fail_close,
                closed: Arc::clone(&self.closed),
                requests: Arc::clone(&self.requests),
            }))
        }
    }

    fn document(doc: &[u8]) -> DriverOutcome {
        DriverOutcome {
            response: DeviceResponse {
                error: String::new(),
                document: Some(doc.to_vec()),
            },
            driver_error: None,
        }
    }

    #[test]
    fn test_attest_success() {
        let device = Arc::new(MockDevice::returning(document(b"doc")));
        let provider = AttestationProvider::new(device.clone());

        let doc = provider.attest(b"nonce", b"fingerprint", None).unwrap();
        assert_eq!(doc, b"doc");

        let requests = device.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].nonce, b"nonce");
        assert_eq!(requests[0].user_data, b"fingerprint");
        assert_eq!(requests[0].public_key, None);
        assert_eq!(device.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_driver_error_with_document_is_success() {
        let mut outcome = document(b"doc");
        outcome.driver_error = Some("spurious error".to_string());
        assert_eq!(document_from_outcome(outcome).unwrap(), b"doc");
    }

    #[test]
    fn test_missing_document_is_failure() {
        let outcome = DriverOutcome::default();
        assert!(matches!(
            document_from_outcome(outcome),
            Err(AttestationError::NoDocument)
        ));
    }

    #[test]
    fn test_device_error_is_authoritative() {
        let mut outcome = document(b"doc");
        outcome.response.error = "InvalidArgument".to_string();
        match document_from_outcome(outcome) {
            Err(AttestationError::Device(msg)) => assert_eq!(msg, "InvalidArgument"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_session_closed_once_on_failure() {
        let device = Arc::new(MockDevice::returning(DriverOutcome::default()));
        let provider = AttestationProvider::new(device.clone());

        assert!(provider.attest(b"nonce", b"fpr", None).is_err());
        assert_eq!(device.opened.load(Ordering::SeqCst), 1);
        assert_eq!(device.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_failure_is_not_propagated() {
        let device = Arc::new(MockDevice {
            fail_close: true,
            ..MockDevice::returning(document(b"doc"))
        });
        let provider = AttestationProvider::new(device.clone());

        assert_eq!(provider.attest(b"nonce", b"fpr", None).unwrap(), b"doc");
        assert_eq!(device.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_open_failure() {
        let device = Arc::new(MockDevice {
            fail_open: true,
            ..Default::default()
        });
        let provider = AttestationProvider::new(device.clone());

        assert!(matches!(
            provider.attest(b"nonce", b"fpr", None),
            Err(AttestationError::Session(_))
        ));
        assert_eq!(device.closed.load(Ordering::SeqCst), 0);
    }
}
