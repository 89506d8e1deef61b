//! C1: owns the IPv4 (and best-effort IPv6) UDP sockets the crypto engine
//! sends and receives WireGuard datagrams through.

use std::net::{Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::UdpSocket;

use crate::error::HubError;

const MAX_DATAGRAM: usize = 65535;

/// A bound pair of UDP sockets (IPv4 required, IPv6 best-effort) sharing one port.
pub struct UdpBind {
    v4: Option<UdpSocket>,
    v6: Option<UdpSocket>,
    v4_blackholed: AtomicBool,
    v6_blackholed: AtomicBool,
}

impl UdpBind {
    /// Binds both sockets to `port` (0 picks an ephemeral port for v4, then
    /// retries v6 on the same number up to 100 times since both families must
    /// share it). `AFNOSUPPORT` on one family is tolerated if the other
    /// opens; if both fail, startup fails.
    pub async fn bind(bind_address: Option<&str>, port: u16) -> Result<(Self, u16), HubError> {
        let host = bind_address.unwrap_or("0.0.0.0");
        let v4_addr: SocketAddr = format!("{host}:{port}").parse().map_err(|_| {
            HubError::Config(format!("invalid bind address: {host}"))
        })?;

        let v4 = UdpSocket::bind(v4_addr).await.map_err(HubError::Bind)?;
        let bound_port = v4.local_addr().map_err(HubError::Bind)?.port();

        let v6 = bind_v6(bound_port).await;

        if v6.is_none() {
            tracing::warn!(port = bound_port, "IPv6 UDP socket unavailable, continuing IPv4-only");
        }

        Ok((
            Self {
                v4: Some(v4),
                v6,
                v4_blackholed: AtomicBool::new(false),
                v6_blackholed: AtomicBool::new(false),
            },
            bound_port,
        ))
    }

    /// Receives one datagram from whichever family delivers it first.
    pub async fn recv_from(&self) -> std::io::Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        match (&self.v4, &self.v6) {
            (Some(v4), Some(v6)) => tokio::select! {
                res = v4.recv_from(&mut buf) => {
                    let (n, addr) = res?;
                    Ok((buf[..n].to_vec(), addr))
                }
                res = v6.recv_from(&mut buf) => {
                    let (n, addr) = res?;
                    Ok((buf[..n].to_vec(), addr))
                }
            },
            (Some(v4), None) => {
                let (n, addr) = v4.recv_from(&mut buf).await?;
                Ok((buf[..n].to_vec(), addr))
            }
            (None, Some(v6)) => {
                let (n, addr) = v6.recv_from(&mut buf).await?;
                Ok((buf[..n].to_vec(), addr))
            }
            (None, None) => std::future::pending().await,
        }
    }

    /// Sends to `dst`, selecting the socket by its address family. Sending to
    /// a family whose socket is absent silently succeeds with no write
    /// (the address family's absence is treated as a silent blackhole).
    pub async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> std::io::Result<()> {
        let socket = match dst {
            SocketAddr::V4(_) => self.v4.as_ref(),
            SocketAddr::V6(_) => self.v6.as_ref(),
        };

        let Some(socket) = socket else {
            match dst {
                SocketAddr::V4(_) => self.v4_blackholed.store(true, Ordering::Relaxed),
                SocketAddr::V6(_) => self.v6_blackholed.store(true, Ordering::Relaxed),
            }
            return Ok(());
        };

        socket.send_to(buf, dst).await.map(|_| ())
    }

    /// Idempotent: resets both blackhole flags. The sockets themselves are
    /// dropped with `self`.
    pub fn close(&self) {
        self.v4_blackholed.store(false, Ordering::Relaxed);
        self.v6_blackholed.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_datagram_over_loopback() {
        let (a, port_a) = UdpBind::bind(Some("127.0.0.1"), 0).await.unwrap();
        let (b, _port_b) = UdpBind::bind(Some("127.0.0.1"), 0).await.unwrap();

        let dst: SocketAddr = format!("127.0.0.1:{port_a}").parse().unwrap();
        b.send_to(b"hello", dst).await.unwrap();

        let (payload, _src) = a.recv_from().await.unwrap();
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn send_to_an_unsupported_family_blackholes_without_erroring() {
        let (bind, _port) = UdpBind::bind(Some("127.0.0.1"), 0).await.unwrap();

        // Force the v6 socket out to exercise the blackhole path deterministically.
        let v4_only = UdpBind { v4: bind.v4, v6: None, v4_blackholed: AtomicBool::new(false), v6_blackholed: AtomicBool::new(false) };
        let dst: SocketAddr = "[::1]:9".parse().unwrap();

        v4_only.send_to(b"ignored", dst).await.unwrap();
        assert!(v4_only.v6_blackholed.load(Ordering::Relaxed));
    }
}

async fn bind_v6(port: u16) -> Option<UdpSocket> {
    let addr = SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port);

    for attempt in 0..100 {
        match UdpSocket::bind(addr).await {
            Ok(socket) => return Some(socket),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 99 => continue,
            Err(_) => return None,
        }
    }

    None
}
