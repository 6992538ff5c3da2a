//! Stream listeners and the HTTP(S) serve loop
//!
//! Inside a Nitro enclave the only way in is vsock: the parent instance
//! forwards TCP traffic to a vsock port on `VMADDR_CID_ANY`. For local
//! development the same router is served on a plain TCP listener.

use axum::Router;
use serde::Deserialize;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Upper bound for a client to finish the TLS handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Which kind of listener to bind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Vsock,
    Tcp,
}

/// Any accepted byte stream
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

/// Address of either end of an accepted connection
#[derive(Debug, Clone)]
pub enum PeerAddr {
    #[cfg(target_os = "linux")]
    Vsock(tokio_vsock::VsockAddr),
    Tcp(SocketAddr),
}

/// A bound stream listener
pub enum Listener {
    #[cfg(target_os = "linux")]
    Vsock(tokio_vsock::VsockListener),
    Tcp(TcpListener),
}

impl Listener {
    /// Binds `port` on the given transport
    pub async fn bind(kind: TransportKind, port: u32) -> io::Result<Self> {
        match kind {
            TransportKind::Vsock => bind_vsock(port),
            TransportKind::Tcp => {
                let port = u16::try_from(port).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, format!("invalid TCP port: {port}"))
                })?;
                let addr = SocketAddr::from(([0, 0, 0, 0], port));
                let listener = TcpListener::bind(addr).await?;
                info!(address = %addr, "TCP listener bound");
                Ok(Listener::Tcp(listener))
            }
        }
    }

    async fn accept_stream(&mut self) -> io::Result<(BoxedStream, PeerAddr)> {
        match self {
            #[cfg(target_os = "linux")]
            Listener::Vsock(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((Box::new(stream), PeerAddr::Vsock(addr)))
            }
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((Box::new(stream), PeerAddr::Tcp(addr)))
            }
        }
    }

    /// Local TCP address; `None` for vsock listeners
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(target_os = "linux")]
            Listener::Vsock(_) => None,
        }
    }

    fn bound_addr(&self) -> io::Result<PeerAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().map(PeerAddr::Tcp),
            #[cfg(target_os = "linux")]
            Listener::Vsock(listener) => listener.local_addr().map(PeerAddr::Vsock),
        }
    }
}

impl axum::serve::Listener for Listener {
    type Io = BoxedStream;
    type Addr = PeerAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.accept_stream().await {
                Ok(accepted) => return accepted,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.bound_addr()
    }
}

/// Listener that completes the TLS handshake before handing a stream to axum
pub struct TlsListener {
    inner: Listener,
    acceptor: TlsAcceptor,
}

impl TlsListener {
    pub fn new(inner: Listener, acceptor: TlsAcceptor) -> Self {
        Self { inner, acceptor }
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<BoxedStream>;
    type Addr = PeerAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let (stream, peer) = axum::serve::Listener::accept(&mut self.inner).await;
            match timeout(HANDSHAKE_TIMEOUT, self.acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => return (tls_stream, peer),
                Ok(Err(e)) => debug!(peer = ?peer, error = %e, "TLS handshake failed"),
                Err(_) => debug!(peer = ?peer, "TLS handshake timed out"),
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.bound_addr()
    }
}

#[cfg(target_os = "linux")]
fn bind_vsock(port: u32) -> io::Result<Listener> {
    use tokio_vsock::{VsockAddr, VsockListener};

    let addr = VsockAddr::new(nix::libc::VMADDR_CID_ANY, port);
    let listener = VsockListener::bind(addr)?;
    info!(cid = "ANY", port = port, "vsock listener bound");
    Ok(Listener::Vsock(listener))
}

#[cfg(not(target_os = "linux"))]
fn bind_vsock(_port: u32) -> io::Result<Listener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "vsock is only supported on Linux",
    ))
}

/// Serves `app` on `listener`, wrapping connections in TLS when an acceptor
/// is given. Only returns if the server stops.
pub async fn serve(listener: Listener, app: Router, tls: Option<TlsAcceptor>) -> io::Result<()> {
    match tls {
        Some(acceptor) => axum::serve(TlsListener::new(listener, acceptor), app).await,
        None => axum::serve(listener, app).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn test_transport_kind_from_str() {
        #[derive(Deserialize)]
        struct Wrapper {
            kind: TransportKind,
        }
        let parsed: Wrapper = envy::from_iter([("KIND".to_string(), "tcp".to_string())]).unwrap();
        assert_eq!(parsed.kind, TransportKind::Tcp);
        assert_eq!(TransportKind::default(), TransportKind::Vsock);
    }

    #[tokio::test]
    async fn test_tcp_port_out_of_range() {
        let err = Listener::bind(TransportKind::Tcp, 70_000).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_serve_plain_http() {
        let app = Router::new().route("/ping", get(|| async { "pong\n" }));

        let listener = Listener::Tcp(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.tcp_addr().unwrap();
        tokio::spawn(serve(listener, app, None));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /ping HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("pong\n"));
    }
}
