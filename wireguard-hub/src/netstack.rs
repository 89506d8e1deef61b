//! C4: a second synthetic tun, backed by a userspace TCP/IP stack
//! ([`smoltcp`]) instead of the OS, bound to the hub's own overlay address.
//! An in-memory [`smoltcp::phy::Device`] feeds an [`Interface`] configured to
//! accept any destination and route everything back to itself, so no OS tun
//! or routing table is ever touched.
//!
//! The interface's address is the hub's real overlay IP, not a placeholder:
//! the whole point of C4 is to let in-process HTTP servers be dialable at
//! that address.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::task::{Context, Poll};

use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::tcp;
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{HardwareAddress, IpCidr, Ipv4Address, Ipv4Cidr};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Notify};

use crate::loopback::UpperSide;

const MAX_PACKET: usize = 65535;
const TCP_BUFFER: usize = 64 * 1024;

/// A `smoltcp::phy::Device` entirely backed by in-memory packet queues.
#[derive(Default)]
struct InMemoryDevice {
    inbound: VecDeque<Vec<u8>>,
    outbound: VecDeque<Vec<u8>>,
}

impl Device for InMemoryDevice {
    type RxToken<'a> = RawRxToken;
    type TxToken<'a> = RawTxToken<'a>;

    fn receive(&mut self, _timestamp: SmolInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = self.inbound.pop_front()?;
        Some((
            RawRxToken { packet },
            RawTxToken { outbound: &mut self.outbound },
        ))
    }

    fn transmit(&mut self, _timestamp: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(RawTxToken { outbound: &mut self.outbound })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = MAX_PACKET;
        caps
    }
}

struct RawRxToken {
    packet: Vec<u8>,
}

impl RxToken for RawRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.packet)
    }
}

struct RawTxToken<'a> {
    outbound: &'a mut VecDeque<Vec<u8>>,
}

impl TxToken for RawTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let result = f(&mut buf);
        self.outbound.push_back(buf);
        result
    }
}

fn create_interface(device: &mut InMemoryDevice, overlay_address: Ipv4Addr) -> Interface {
    let mut interface = Interface::new(Config::new(HardwareAddress::Ip), device, SmolInstant::ZERO);
    interface.set_any_ip(true);

    let ip = Ipv4Address::from(overlay_address);
    interface.update_ip_addrs(|ips| {
        ips.push(IpCidr::Ipv4(Ipv4Cidr::new(ip, 32))).expect("/32 is a valid IPv4 CIDR");
    });

    interface
        .routes_mut()
        .add_default_ipv4_route(ip)
        .expect("default IPv4 route fits in the routing table");

    interface
}

/// A connection accepted on the netstack's TCP listener. Reads and writes are
/// bridged to the owning [`NetstackActor`]'s poll loop through plain channels;
/// the actor is the only thing that ever touches the underlying socket.
pub struct NetstackStream {
    read_rx: mpsc::Receiver<Vec<u8>>,
    write_tx: mpsc::Sender<Vec<u8>>,
    wake: std::sync::Arc<Notify>,
}

impl AsyncRead for NetstackStream {
    fn poll_read(mut self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.read_rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                buf.put_slice(&data);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for NetstackStream {
    fn poll_write(self: std::pin::Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.write_tx.try_send(buf.to_vec()) {
            Ok(()) => {
                self.wake.notify_one();
                Poll::Ready(Ok(buf.len()))
            }
            Err(_) => Poll::Ready(Ok(0)),
        }
    }

    fn poll_flush(self: std::pin::Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: std::pin::Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Adapts a channel of accepted [`NetstackStream`]s to `axum::serve`'s
/// `Listener` trait, so the control API and debug surface can be served over
/// the netstack tun exactly as they would over a real `TcpListener`.
pub struct NetstackListener {
    connections: mpsc::Receiver<NetstackStream>,
}

impl NetstackListener {
    pub fn new(connections: mpsc::Receiver<NetstackStream>) -> Self {
        Self { connections }
    }
}

impl axum::serve::Listener for NetstackListener {
    type Io = NetstackStream;
    type Addr = ();

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            if let Some(stream) = self.connections.recv().await {
                return (stream, ());
            }
            std::future::pending::<()>().await;
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(())
    }
}

struct Listener {
    port: u16,
    handle: SocketHandle,
    accept_tx: mpsc::Sender<NetstackStream>,
}

struct ActiveConn {
    handle: SocketHandle,
    to_app: mpsc::Sender<Vec<u8>>,
    from_app: mpsc::Receiver<Vec<u8>>,
}

/// Drives the smoltcp interface: feeds it packets pulled off the loopback
/// device, pushes its outbound packets back down, and shuttles bytes between
/// established sockets and their [`NetstackStream`] handles. Runs as a single
/// background task — nothing else ever touches the socket set, matching the
/// non-reentrant discipline the crypto engine applies to its own IPC.
pub struct NetstackActor {
    device: InMemoryDevice,
    iface: Interface,
    sockets: SocketSet<'static>,
    upper: UpperSide,
    listeners: Vec<Listener>,
    active: Vec<ActiveConn>,
    wake: std::sync::Arc<Notify>,
}

impl NetstackActor {
    pub fn new(overlay_address: Ipv4Addr, upper: UpperSide) -> Self {
        let mut device = InMemoryDevice::default();
        let iface = create_interface(&mut device, overlay_address);

        Self {
            device,
            iface,
            sockets: SocketSet::new(Vec::new()),
            upper,
            listeners: Vec::new(),
            active: Vec::new(),
            wake: std::sync::Arc::new(Notify::new()),
        }
    }

    /// Registers a TCP listener on `port`. Returns a receiver that yields one
    /// [`NetstackStream`] per accepted connection.
    pub fn listen_tcp(&mut self, port: u16) -> mpsc::Receiver<NetstackStream> {
        let handle = self.new_listening_socket(port);
        let (accept_tx, accept_rx) = mpsc::channel(16);
        self.listeners.push(Listener { port, handle, accept_tx });
        accept_rx
    }

    fn new_listening_socket(&mut self, port: u16) -> SocketHandle {
        let mut socket = tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0; TCP_BUFFER]),
            tcp::SocketBuffer::new(vec![0; TCP_BUFFER]),
        );
        socket.listen(port).expect("port is free on a fresh interface");
        self.sockets.add(socket)
    }

    /// Runs forever: pumps packets in from the loopback device, polls the
    /// interface, shuttles established-connection bytes, and pumps resulting
    /// packets back out. Exits when the loopback device closes.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                incoming = self.upper.recv_up() => {
                    match incoming {
                        Ok(packet) => self.device.inbound.push_back(packet),
                        Err(_) => return,
                    }
                }
                _ = self.wake.notified() => {}
            }

            let timestamp = SmolInstant::now();
            self.iface.poll(timestamp, &mut self.device, &mut self.sockets);
            self.accept_pending();
            self.pump_active();

            while let Some(packet) = self.device.outbound.pop_front() {
                if self.upper.send_down(packet).await.is_err() {
                    return;
                }
            }
        }
    }

    /// Promotes any listening socket that has completed a handshake into an
    /// active connection, handing the application a [`NetstackStream`] and
    /// re-arming a fresh listener on the same port.
    fn accept_pending(&mut self) {
        let mut rearm = Vec::new();

        for listener in &self.listeners {
            let socket = self.sockets.get_mut::<tcp::Socket>(listener.handle);
            if socket.state() == tcp::State::Listen || socket.state() == tcp::State::SynReceived {
                continue;
            }

            let (to_app, read_rx) = mpsc::channel(16);
            let (write_tx, from_app) = mpsc::channel(16);
            let stream = NetstackStream { read_rx, write_tx, wake: self.wake.clone() };

            if listener.accept_tx.try_send(stream).is_ok() {
                self.active.push(ActiveConn { handle: listener.handle, to_app, from_app });
                rearm.push(listener.port);
            }
        }

        for port in rearm {
            let new_handle = self.new_listening_socket(port);
            if let Some(listener) = self.listeners.iter_mut().find(|l| l.port == port) {
                listener.handle = new_handle;
            }
        }
    }

    /// Drains queued application writes into each active socket's send
    /// buffer, and delivers received bytes to each socket's [`NetstackStream`].
    fn pump_active(&mut self) {
        self.active.retain_mut(|conn| {
            let socket = self.sockets.get_mut::<tcp::Socket>(conn.handle);

            while let Ok(chunk) = conn.from_app.try_recv() {
                if socket.can_send() {
                    let _ = socket.send_slice(&chunk);
                }
            }

            if socket.can_recv() {
                let mut buf = vec![0u8; TCP_BUFFER];
                if let Ok(n) = socket.recv_slice(&mut buf) {
                    buf.truncate(n);
                    if !buf.is_empty() {
                        let _ = conn.to_app.try_send(buf);
                    }
                }
            }

            !(socket.state() == tcp::State::Closed && !socket.can_recv())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_owns_its_overlay_address() {
        let mut device = InMemoryDevice::default();
        let overlay = "10.8.0.1".parse().unwrap();
        let interface = create_interface(&mut device, overlay);

        assert!(interface.ip_addrs().iter().any(|cidr| cidr.address() == smoltcp::wire::IpAddress::Ipv4(Ipv4Address::from(overlay))));
    }

    #[test]
    fn listen_tcp_registers_a_listening_socket() {
        let (_engine_side, upper) = crate::loopback::channel();
        let mut actor = NetstackActor::new("10.8.0.1".parse().unwrap(), upper);
        let _connections = actor.listen_tcp(80);

        assert_eq!(actor.listeners.len(), 1);
        let socket = actor.sockets.get_mut::<tcp::Socket>(actor.listeners[0].handle);
        assert_eq!(socket.state(), tcp::State::Listen);
    }
}
