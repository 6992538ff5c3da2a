//! Enclave system setup performed before serving
//!
//! A freshly booted enclave has an unseeded entropy pool, a loopback
//! interface without an address, and no direct network access.

use crate::error::{AttestationError, EnclaveError, Result};
use hyper::Uri;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use tracing::{info, warn};

pub const RANDOM_DEVICE: &str = "/dev/random";

const DEFAULT_SOCKS_PORT: u16 = 1080;

/// A source of hardware randomness
pub trait EntropySource: Send + Sync {
    fn random_bytes(&self) -> std::result::Result<Vec<u8>, AttestationError>;
}

/// Mixes hardware randomness into the kernel entropy pool
pub fn seed_entropy_pool(source: &dyn EntropySource) -> Result<usize> {
    seed_into(source, Path::new(RANDOM_DEVICE))
}

fn seed_into(source: &dyn EntropySource, device: &Path) -> Result<usize> {
    let bytes = source.random_bytes()?;
    let mut file = OpenOptions::new().write(true).open(device)?;
    file.write_all(&bytes)?;
    info!(bytes = bytes.len(), "Seeded system entropy pool");
    Ok(bytes.len())
}

#[cfg(target_os = "linux")]
mod ifconfig {
    use nix::libc;

    nix::ioctl_write_ptr_bad!(set_if_addr, libc::SIOCSIFADDR, libc::ifreq);
    nix::ioctl_readwrite_bad!(get_if_flags, libc::SIOCGIFFLAGS, libc::ifreq);
    nix::ioctl_write_ptr_bad!(set_if_flags, libc::SIOCSIFFLAGS, libc::ifreq);
}

/// Assigns 127.0.0.1 to `lo` and brings the interface up
#[cfg(target_os = "linux")]
pub fn assign_loopback_address() -> Result<()> {
    use nix::libc;
    use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
    use std::net::Ipv4Addr;
    use std::os::fd::AsRawFd;

    let sock = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(io::Error::from)?;
    let fd = sock.as_raw_fd();

    let mut ifr_name = [0 as libc::c_char; libc::IFNAMSIZ];
    for (dst, src) in ifr_name.iter_mut().zip(b"lo") {
        *dst = *src as libc::c_char;
    }

    // sockaddr_in layout inside sa_data: 2 bytes port, then the address
    let mut sa_data = [0 as libc::c_char; 14];
    for (dst, octet) in sa_data[2..6].iter_mut().zip(Ipv4Addr::LOCALHOST.octets()) {
        *dst = octet as libc::c_char;
    }
    let mut req = libc::ifreq {
        ifr_name,
        ifr_ifru: libc::__c_anonymous_ifr_ifru {
            ifru_addr: libc::sockaddr {
                sa_family: libc::AF_INET as libc::sa_family_t,
                sa_data,
            },
        },
    };

    // SAFETY: fd is an open socket and req is a valid ifreq for each call.
    unsafe { ifconfig::set_if_addr(fd, &req) }.map_err(io::Error::from)?;
    unsafe { ifconfig::get_if_flags(fd, &mut req) }.map_err(io::Error::from)?;

    // SAFETY: SIOCGIFFLAGS filled in the flags member.
    let flags = unsafe { req.ifr_ifru.ifru_flags };
    req.ifr_ifru.ifru_flags = flags | (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
    unsafe { ifconfig::set_if_flags(fd, &req) }.map_err(io::Error::from)?;

    info!("Assigned address to lo interface");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn assign_loopback_address() -> Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "loopback setup is only supported on Linux").into())
}

/// The parent instance's SOCKS5 proxy; host names are resolved by the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksProxy {
    pub host: String,
    pub port: u16,
}

impl SocksProxy {
    /// Parses `socks5://host[:port]` (or `socks5h://`)
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = || EnclaveError::Config(format!("proxy must be a URL such as socks5://host:port, got {url}"));
        let uri: Uri = url.parse().map_err(|_| invalid())?;
        if !matches!(uri.scheme_str(), Some("socks5" | "socks5h")) {
            return Err(invalid());
        }
        let host = uri.host().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
        Ok(Self {
            host: host.to_string(),
            port: uri.port_u16().unwrap_or(DEFAULT_SOCKS_PORT),
        })
    }
}

/// Resolves the outbound proxy that every outbound client dials through.
///
/// The process environment is left untouched; the result is handed to the
/// clients explicitly.
pub fn configure_proxy(proxy: Option<&str>) -> Result<Option<SocksProxy>> {
    let Some(url) = proxy.filter(|p| !p.is_empty()) else {
        warn!("No SOCKS proxy configured; outbound traffic is not proxied");
        return Ok(None);
    };
    let proxy = SocksProxy::parse(url)?;
    info!(host = %proxy.host, port = proxy.port, "Configured outbound proxy");
    Ok(Some(proxy))
}
