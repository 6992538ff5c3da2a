//! Outbound HTTP(S) client used to talk to the ACME directory
//!
//! An enclave has no network of its own: every outbound connection is
//! tunnelled through the parent's SOCKS5 proxy, and host names are sent to
//! the proxy unresolved. Without a proxy (development) connections are
//! dialled directly.

use crate::system::SocksProxy;
use crate::transport::BoxedStream;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use instant_acme::{BytesBody, BytesResponse, HttpClient};
use rustls::pki_types::ServerName;
use std::error::Error as StdError;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// HTTP/1.1 client that dials through an optional SOCKS5 proxy
#[derive(Clone)]
pub struct OutboundClient {
    proxy: Option<SocksProxy>,
    tls: TlsConnector,
}

impl OutboundClient {
    pub fn new(proxy: Option<SocksProxy>) -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            proxy,
            tls: TlsConnector::from(Arc::new(config)),
        }
    }

    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        match &self.proxy {
            Some(proxy) => {
                debug!(host = %host, port = port, proxy = %proxy.host, "Dialling through SOCKS proxy");
                let stream = Socks5Stream::connect((proxy.host.as_str(), proxy.port), (host, port))
                    .await
                    .map_err(io::Error::other)?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(TcpStream::connect((host, port)).await?)),
        }
    }

    /// Sends one request on a fresh connection and reads the whole body
    pub async fn send(&self, req: Request<Full<Bytes>>) -> Result<Response<Bytes>, BoxError> {
        let uri = req.uri().clone();
        let host = uri.host().ok_or("request URI has no host")?.to_string();
        let https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            other => return Err(format!("unsupported scheme: {other:?}").into()),
        };
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

        let stream = self.connect(&host, port).await?;
        let stream: BoxedStream = if https {
            let name = ServerName::try_from(host.clone())?;
            Box::new(self.tls.connect(name, stream).await?)
        } else {
            stream
        };

        let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "Outbound connection closed with error");
            }
        });

        let (mut parts, body) = req.into_parts();
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        parts.uri = path.parse::<Uri>()?;
        if !parts.headers.contains_key(HOST) {
            let authority = uri.authority().map(|a| a.as_str()).unwrap_or(host.as_str());
            parts.headers.insert(HOST, HeaderValue::from_str(authority)?);
        }

        let response = sender.send_request(Request::from_parts(parts, body)).await?;
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok(Response::from_parts(parts, body))
    }
}

impl HttpClient for OutboundClient {
    fn request(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Pin<Box<dyn Future<Output = Result<BytesResponse, instant_acme::Error>> + Send>> {
        let client = self.clone();
        Box::pin(async move {
            let response = client.send(req).await.map_err(instant_acme::Error::Other)?;
            Ok(bytes_response(response))
        })
    }
}

/// Response body that has already been read in full
struct CollectedBody(Option<Bytes>);

#[async_trait]
impl BytesBody for CollectedBody {
    async fn into_bytes(&mut self) -> Result<Bytes, BoxError> {
        Ok(self.0.take().unwrap_or_default())
    }
}

pub(crate) fn bytes_response(response: Response<Bytes>) -> BytesResponse {
    let (parts, body) = response.into_parts();
    BytesResponse {
        parts,
        body: Box::new(CollectedBody(Some(body))),
    }
}
