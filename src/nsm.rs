//! Nitro Secure Module device adapter
//!
//! Each session is a file descriptor on `/dev/nsm` obtained from `nsm_init`
//! and released with `nsm_exit`.

use crate::attestation::{
    AttestationDevice, AttestationRequest, DeviceResponse, DeviceSession, DriverOutcome,
};
use crate::error::AttestationError;
use crate::system::EntropySource;
use aws_nitro_enclaves_nsm_api::api::{Request, Response};
use aws_nitro_enclaves_nsm_api::driver::{nsm_exit, nsm_init, nsm_process_request};
use serde_bytes::ByteBuf;
use tracing::{debug, warn};

/// The enclave's Nitro Secure Module
#[derive(Debug, Default, Clone, Copy)]
pub struct NsmDevice;

impl NsmDevice {
    pub fn new() -> Self {
        Self
    }

    fn open(&self) -> Result<NsmSession, AttestationError> {
        let fd = nsm_init();
        if fd < 0 {
            return Err(AttestationError::Session(
                "NSM device is not available".to_string(),
            ));
        }
        debug!(fd = fd, "Opened NSM session");
        Ok(NsmSession { fd })
    }
}

impl AttestationDevice for NsmDevice {
    fn open_session(&self) -> Result<Box<dyn DeviceSession>, AttestationError> {
        Ok(Box::new(self.open()?))
    }
}

impl EntropySource for NsmDevice {
    fn random_bytes(&self) -> Result<Vec<u8>, AttestationError> {
        let session = self.open()?;
        let response = nsm_process_request(session.fd, Request::GetRandom);
        if let Err(e) = Box::new(session).close() {
            warn!(error = %e, "Failed to close NSM session");
        }
        random_from_response(response)
    }
}

fn random_from_response(response: Response) -> Result<Vec<u8>, AttestationError> {
    match response {
        Response::GetRandom { random } if !random.is_empty() => Ok(random),
        Response::GetRandom { .. } => Err(AttestationError::Device(
            "empty random response".to_string(),
        )),
        Response::Error(code) => Err(AttestationError::Device(format!("{:?}", code))),
        _ => Err(AttestationError::Device("unexpected NSM response".to_string())),
    }
}

/// An open NSM file descriptor
struct NsmSession {
    fd: i32,
}

impl DeviceSession for NsmSession {
    fn send(&mut self, request: &AttestationRequest) -> DriverOutcome {
        let request = Request::Attestation {
            user_data: Some(ByteBuf::from(request.user_data.clone())),
            nonce: Some(ByteBuf::from(request.nonce.clone())),
            public_key: request
                .public_key
                .as_ref()
                .filter(|k| !k.is_empty())
                .map(|k| ByteBuf::from(k.clone())),
        };

        DriverOutcome {
            response: device_response(nsm_process_request(self.fd, request)),
            driver_error: None,
        }
    }

    fn close(self: Box<Self>) -> Result<(), String> {
        nsm_exit(self.fd);
        debug!(fd = self.fd, "Closed NSM session");
        Ok(())
    }
}

/// Maps a driver response onto the error-string/document payload
fn device_response(response: Response) -> DeviceResponse {
    match response {
        Response::Attestation { document } => DeviceResponse {
            error: String::new(),
            document: Some(document),
        },
        Response::Error(code) => DeviceResponse {
            error: format!("{:?}", code),
            document: None,
        },
        _ => DeviceResponse {
            error: "unexpected NSM response".to_string(),
            document: None,
        },
    }
}
