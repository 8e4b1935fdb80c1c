//! Packet-socket abstraction.
//!
//! The engines only assume a packet-oriented send/receive interface; this
//! module supplies it for `tokio`'s UDP socket and, on Linux, for a raw
//! ICMP socket. Anything else (an in-memory pair, a lossy wrapper for
//! tests) just implements [`PacketSocket`].

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;

/// Datagram send/receive as the engines consume it.
///
/// Concurrent sends from several tasks are permitted; implementations
/// whose host API forbids that must serialize internally.
#[async_trait]
pub trait PacketSocket: Send + Sync {
    async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl PacketSocket for tokio::net::UdpSocket {
    async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        tokio::net::UdpSocket::send_to(self, buf, peer).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        tokio::net::UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::UdpSocket::local_addr(self)
    }
}

#[cfg(target_os = "linux")]
pub use raw_icmp::RawIcmpSocket;

/// Raw ICMP socket (Linux only, needs CAP_NET_RAW).
///
/// Sends ICMP messages as-is; inbound datagrams arrive with the IPv4
/// header attached, which is stripped before hand-off so that receivers
/// see the bare ICMP message, matching the UDP impl's framing.
#[cfg(target_os = "linux")]
mod raw_icmp {
    use std::io;
    use std::mem;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    use async_trait::async_trait;

    use super::PacketSocket;

    const IPV4_MIN_HEADER_LEN: usize = 20;
    const MAX_DATAGRAM: usize = 65535;

    #[derive(Debug)]
    pub struct RawIcmpSocket {
        fd: OwnedFd,
    }

    impl RawIcmpSocket {
        pub fn new() -> io::Result<Self> {
            let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, libc::IPPROTO_ICMP) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(RawIcmpSocket {
                fd: unsafe { OwnedFd::from_raw_fd(fd) },
            })
        }
    }

    fn sockaddr_v4(ip: Ipv4Addr) -> libc::sockaddr_in {
        libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0,
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(ip.octets()),
            },
            sin_zero: [0; 8],
        }
    }

    /// Drops the IPv4 header by its IHL; the remainder is the ICMP message.
    fn strip_ipv4_header(pkt: &[u8]) -> Option<&[u8]> {
        if pkt.len() < IPV4_MIN_HEADER_LEN {
            return None;
        }
        let ihl = ((pkt[0] & 0x0F) as usize) * 4;
        if ihl < IPV4_MIN_HEADER_LEN || pkt.len() < ihl {
            return None;
        }
        Some(&pkt[ihl..])
    }

    #[async_trait]
    impl PacketSocket for RawIcmpSocket {
        async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
            let IpAddr::V4(ip) = peer.ip() else {
                return Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "raw icmp socket is IPv4 only",
                ));
            };
            let fd = self.fd.as_raw_fd();
            let data = buf.to_vec();
            tokio::task::spawn_blocking(move || {
                let addr = sockaddr_v4(ip);
                let n = unsafe {
                    libc::sendto(
                        fd,
                        data.as_ptr() as *const libc::c_void,
                        data.len(),
                        0,
                        &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            })
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
        }

        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            let fd = self.fd.as_raw_fd();
            let (pkt, peer) = tokio::task::spawn_blocking(move || {
                let mut tmp = vec![0u8; MAX_DATAGRAM];
                let mut src: libc::sockaddr_in = unsafe { mem::zeroed() };
                let mut addr_len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
                let n = unsafe {
                    libc::recvfrom(
                        fd,
                        tmp.as_mut_ptr() as *mut libc::c_void,
                        tmp.len(),
                        0,
                        &mut src as *mut libc::sockaddr_in as *mut libc::sockaddr,
                        &mut addr_len,
                    )
                };
                if n < 0 {
                    return Err(io::Error::last_os_error());
                }
                tmp.truncate(n as usize);
                let ip = Ipv4Addr::from(u32::from_be(src.sin_addr.s_addr));
                Ok((tmp, SocketAddr::from((ip, 0))))
            })
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

            let payload = strip_ipv4_header(&pkt).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "truncated ipv4 datagram")
            })?;
            let n = payload.len().min(buf.len());
            buf[..n].copy_from_slice(&payload[..n]);
            Ok((n, peer))
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
        }
    }
}
