//! The crypto engine: the standard WireGuard state machine (handshake, transport
//! keys, rekey) delegated entirely to [`boringtun::noise::Tunn`], wrapped in the
//! multi-peer bookkeeping (allowed-IP trie, session-index demux, IPC text codec)
//! that a kernel WireGuard implementation gets for free from the OS and that
//! `boringtun`'s own `Device` type gets from an epoll loop we are not using.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use boringtun::noise::{Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use ip_network::IpNetwork;
use ip_network_table::IpNetworkTable;
use ipnet::Ipv4Net;
use parking_lot::Mutex;

use crate::error::HubError;
use crate::ipc;

/// Largest buffer we ever hand to `Tunn::encapsulate`/`decapsulate`.
const MAX_PACKET: usize = 65535;

/// Something the engine wants written out as a result of processing a packet.
pub enum Outgoing {
    /// Send this ciphertext datagram to this UDP endpoint.
    ToNetwork(SocketAddr, Vec<u8>),
    /// Hand this plaintext IP packet to the loopback device (destined for the hub itself).
    ToLoopback(Vec<u8>),
}

struct PeerState {
    tunnel: Mutex<Tunn>,
    public_key: PublicKey,
    allowed_ip: Ipv4Net,
    endpoint: Mutex<Option<SocketAddr>>,
    index: u32,
}

/// A live, running instance of the WireGuard state machine for every peer of
/// one hub identity (the primary hub, or the secondary hub-attach identity;
/// [`crate::hub_attach`] runs two of these in the same process).
pub struct Engine {
    inner: Mutex<Inner>,
}

struct Inner {
    private_key: StaticSecret,
    public_key: PublicKey,
    listen_port: u16,
    peers_by_key: HashMap<[u8; 32], Arc<PeerState>>,
    peers_by_idx: HashMap<u32, Arc<PeerState>>,
    allowed_ips: IpNetworkTable<Arc<PeerState>>,
    next_index: u32,
    up: bool,
    /// This engine's own overlay address, if it has one. A decrypted packet
    /// addressed here is handed to the loopback device instead of being
    /// routed to another peer; only the hub-attach secondary engine sets
    /// this (the primary routes its own overlay traffic to a peer entry for
    /// the secondary, see `hub_attach`).
    own_address: Option<Ipv4Addr>,
}

impl Engine {
    pub fn new(private_key: StaticSecret, listen_port: u16) -> Self {
        let public_key = PublicKey::from(&private_key);
        Self {
            inner: Mutex::new(Inner {
                private_key,
                public_key,
                listen_port,
                peers_by_key: HashMap::new(),
                peers_by_idx: HashMap::new(),
                allowed_ips: IpNetworkTable::new(),
                next_index: 0,
                up: false,
                own_address: None,
            }),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.inner.lock().public_key
    }

    pub fn listen_port(&self) -> u16 {
        self.inner.lock().listen_port
    }

    /// Sets this engine's own overlay address, routing decrypted packets
    /// addressed here to the loopback device rather than to a peer.
    pub fn set_own_address(&self, address: Ipv4Addr) {
        self.inner.lock().own_address = Some(address);
    }

    /// Brings the engine online. Idempotent.
    pub async fn up(&self) {
        self.inner.lock().up = true;
        tracing::info!(public_key = %hex::encode(self.public_key().as_bytes()), "engine up");
    }

    /// Tears the engine down. Idempotent.
    pub async fn close(&self) {
        self.inner.lock().up = false;
    }

    /// Applies an IPC `set` text blob: newline-separated `key=value` lines,
    /// with a `public_key=` line opening a peer section.
    pub async fn set(&self, text: &str) -> Result<(), HubError> {
        let mut inner = self.inner.lock();
        inner.apply_set(text)
    }

    /// Produces an IPC `get` text dump: device-level keys followed by one
    /// section per peer.
    pub async fn get(&self) -> String {
        self.inner.lock().render_get()
    }

    /// Processes one inbound UDP datagram, returning zero or more packets to
    /// write back out (to the network, or to the hub's own loopback device).
    pub async fn handle_datagram(&self, src: SocketAddr, datagram: &[u8]) -> Vec<Outgoing> {
        let mut inner = self.inner.lock();
        inner.handle_datagram(src, datagram)
    }

    /// Processes one plaintext IP packet pulled off the loopback or netstack
    /// device and destined for a peer: encrypts it and returns the UDP
    /// datagram to send, if the destination matches a known peer.
    pub async fn encapsulate_outbound(&self, packet: &[u8]) -> Option<(SocketAddr, Vec<u8>)> {
        let mut inner = self.inner.lock();
        inner.encapsulate_outbound(packet)
    }

    /// Runs one round of timer-driven housekeeping (handshake retries,
    /// keepalives, rekeys) across every peer. Called periodically by the
    /// caller's own tick loop.
    pub async fn tick(&self) -> Vec<Outgoing> {
        let mut inner = self.inner.lock();
        inner.tick()
    }
}

impl Inner {
    fn apply_set(&mut self, text: &str) -> Result<(), HubError> {
        let mut lines = text.lines().peekable();
        let mut current_peer: Option<[u8; 32]> = None;
        let mut replace_ips = false;
        let mut remove = false;
        let mut pending_allowed_ips: Vec<Ipv4Net> = Vec::new();
        let mut pending_endpoint: Option<SocketAddr> = None;
        let mut pending_keepalive: Option<u16> = None;

        while let Some(line) = lines.next() {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| HubError::Engine(format!("malformed IPC line: {line}")))?;

            match key {
                "private_key" => {
                    let bytes = hex::decode(value)
                        .map_err(|e| HubError::Engine(format!("invalid private_key: {e}")))?;
                    let bytes: [u8; 32] = bytes
                        .try_into()
                        .map_err(|_| HubError::Engine("private_key must be 32 bytes".into()))?;
                    self.private_key = StaticSecret::from(bytes);
                    self.public_key = PublicKey::from(&self.private_key);
                }
                "listen_port" => {
                    self.listen_port = value
                        .parse()
                        .map_err(|e| HubError::Engine(format!("invalid listen_port: {e}")))?;
                }
                "replace_peers" => {
                    if value == "true" {
                        self.peers_by_key.clear();
                        self.peers_by_idx.clear();
                        self.allowed_ips = IpNetworkTable::new();
                    }
                }
                "public_key" => {
                    if let Some(key) = current_peer.take() {
                        self.commit_peer(key, remove, replace_ips, &pending_allowed_ips, pending_endpoint, pending_keepalive);
                    }
                    replace_ips = false;
                    remove = false;
                    pending_allowed_ips.clear();
                    pending_endpoint = None;
                    pending_keepalive = None;

                    let bytes = hex::decode(value)
                        .map_err(|e| HubError::Engine(format!("invalid public_key: {e}")))?;
                    let bytes: [u8; 32] = bytes
                        .try_into()
                        .map_err(|_| HubError::Engine("public_key must be 32 bytes".into()))?;
                    current_peer = Some(bytes);
                }
                "allowed_ip" => {
                    let net: Ipv4Net = value
                        .parse()
                        .map_err(|e| HubError::Engine(format!("invalid allowed_ip: {e}")))?;
                    pending_allowed_ips.push(net);
                }
                "replace_allowed_ips" => {
                    replace_ips = value == "true";
                }
                "remove" => {
                    remove = value == "true";
                }
                "endpoint" => {
                    pending_endpoint = Some(
                        value
                            .parse()
                            .map_err(|e| HubError::Engine(format!("invalid endpoint: {e}")))?,
                    );
                }
                "persistent_keepalive_interval" => {
                    pending_keepalive = Some(
                        value
                            .parse()
                            .map_err(|e| HubError::Engine(format!("invalid persistent_keepalive_interval: {e}")))?,
                    );
                }
                // preshared_key / protocol_version: accepted by the grammar but not
                // meaningfully used by this hub's own IPC producer (C7/C9 never emit
                // them); ignored rather than rejected so operators can still feed a
                // vanilla `wg setconf`-shaped blob.
                _ => {}
            }
        }

        if let Some(key) = current_peer.take() {
            self.commit_peer(key, remove, replace_ips, &pending_allowed_ips, pending_endpoint, pending_keepalive);
        }

        Ok(())
    }

    fn commit_peer(
        &mut self,
        public_key: [u8; 32],
        remove: bool,
        replace_ips: bool,
        allowed_ips: &[Ipv4Net],
        endpoint: Option<SocketAddr>,
        persistent_keepalive: Option<u16>,
    ) {
        if remove {
            if let Some(peer) = self.peers_by_key.remove(&public_key) {
                self.peers_by_idx.remove(&peer.index);
                self.allowed_ips.retain(|_, p| !Arc::ptr_eq(p, &peer));
            }
            return;
        }

        let peer = self.peers_by_key.get(&public_key).cloned().unwrap_or_else(|| {
            let index = self.next_index;
            self.next_index += 1;
            let tunn = Tunn::new(
                self.private_key.clone(),
                PublicKey::from(public_key),
                None,
                persistent_keepalive,
                index,
                None,
            );
            let peer = Arc::new(PeerState {
                tunnel: Mutex::new(tunn),
                public_key: PublicKey::from(public_key),
                allowed_ip: allowed_ips
                    .first()
                    .copied()
                    .unwrap_or_else(|| Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 32).unwrap()),
                endpoint: Mutex::new(endpoint),
                index,
            });
            self.peers_by_key.insert(public_key, peer.clone());
            self.peers_by_idx.insert(index, peer.clone());
            peer
        });

        if endpoint.is_some() {
            *peer.endpoint.lock() = endpoint;
        }

        if replace_ips || !allowed_ips.is_empty() {
            self.allowed_ips.retain(|_, p| !Arc::ptr_eq(p, &peer));
            for net in allowed_ips {
                self.allowed_ips.insert(to_ip_network(*net), peer.clone());
            }
        }
    }

    fn render_get(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("private_key={}\n", hex::encode(self.private_key.to_bytes())));
        out.push_str(&format!("own_public_key={}\n", hex::encode(self.public_key.as_bytes())));
        out.push_str(&format!("listen_port={}\n", self.listen_port));

        let mut peers: Vec<&Arc<PeerState>> = self.peers_by_key.values().collect();
        peers.sort_by_key(|p| p.index);

        for peer in peers {
            out.push_str(&format!("public_key={}\n", hex::encode(peer.public_key.as_bytes())));
            out.push_str(&format!("allowed_ip={}\n", peer.allowed_ip));
            if let Some(addr) = *peer.endpoint.lock() {
                out.push_str(&format!("endpoint={addr}\n"));
            }
            let (last_handshake, tx_bytes, rx_bytes, ..) = peer.tunnel.lock().stats();
            if let Some(d) = last_handshake {
                out.push_str(&format!("last_handshake_time_sec={}\n", d.as_secs()));
            }
            out.push_str(&format!("tx_bytes={tx_bytes}\n"));
            out.push_str(&format!("rx_bytes={rx_bytes}\n"));
        }

        out
    }

    fn handle_datagram(&mut self, src: SocketAddr, datagram: &[u8]) -> Vec<Outgoing> {
        let Ok(parsed) = Tunn::parse_incoming_packet(datagram) else {
            return Vec::new();
        };

        // No session index to demux a fresh handshake initiation on: the
        // responder only learns the sender's identity by successfully
        // decrypting it, so every known peer's tunnel gets one real attempt
        // (not a throwaway probe followed by a second, state-corrupting call)
        // until one of them claims the packet.
        if let boringtun::noise::Packet::HandshakeInit(_) = &parsed {
            for peer in self.peers_by_key.values().cloned().collect::<Vec<_>>() {
                let mut dst = vec![0u8; MAX_PACKET];
                let result = peer.tunnel.lock().decapsulate(Some(src.ip()), datagram, &mut dst);
                if matches!(result, TunnResult::Err(_)) {
                    continue;
                }
                *peer.endpoint.lock() = Some(src);
                return self.handle_tunn_result(&peer, result);
            }
            return Vec::new();
        }

        let peer = match &parsed {
            boringtun::noise::Packet::HandshakeResponse(r) => self.peers_by_idx.get(&(r.receiver_idx >> 8)),
            boringtun::noise::Packet::PacketCookieReply(r) => self.peers_by_idx.get(&(r.receiver_idx >> 8)),
            boringtun::noise::Packet::PacketData(d) => self.peers_by_idx.get(&(d.receiver_idx >> 8)),
            boringtun::noise::Packet::HandshakeInit(_) => unreachable!("handled above"),
        };

        let Some(peer) = peer.cloned() else {
            return Vec::new();
        };

        *peer.endpoint.lock() = Some(src);

        let mut dst = vec![0u8; MAX_PACKET];
        let result = peer.tunnel.lock().decapsulate(Some(src.ip()), datagram, &mut dst);
        self.handle_tunn_result(&peer, result)
    }

    fn handle_tunn_result(&mut self, source_peer: &Arc<PeerState>, result: TunnResult<'_>) -> Vec<Outgoing> {
        let mut out = Vec::new();

        match result {
            TunnResult::Done | TunnResult::Err(_) => {}
            TunnResult::WriteToNetwork(buf) => {
                if let Some(addr) = *source_peer.endpoint.lock() {
                    out.push(Outgoing::ToNetwork(addr, buf.to_vec()));
                }
                // A decapsulate() that produced a network write may have more
                // queued; boringtun's contract is to re-call with an empty
                // datagram until `Done`.
                loop {
                    let mut dst = vec![0u8; MAX_PACKET];
                    match source_peer.tunnel.lock().decapsulate(None, &[], &mut dst) {
                        TunnResult::WriteToNetwork(buf) => {
                            if let Some(addr) = *source_peer.endpoint.lock() {
                                out.push(Outgoing::ToNetwork(addr, buf.to_vec()));
                            }
                        }
                        _ => break,
                    }
                }
            }
            TunnResult::WriteToTunnelV4(packet, _) => {
                out.extend(self.route_plaintext(packet));
            }
            TunnResult::WriteToTunnelV6(_, _) => {
                // IPv6 overlay addressing is an explicit non-goal; drop silently.
            }
        }

        out
    }

    /// Routes a decrypted plaintext packet by destination address, mirroring
    /// the allowed-IP trie lookup a kernel WireGuard implementation performs
    /// via its routing table.
    fn route_plaintext(&mut self, packet: &[u8]) -> Vec<Outgoing> {
        let Some(dst) = ipv4_destination(packet) else {
            return Vec::new();
        };

        if self.own_address == Some(dst) {
            return vec![Outgoing::ToLoopback(packet.to_vec())];
        }

        match self.allowed_ips.longest_match(IpAddr::V4(dst)) {
            Some((_, peer)) => {
                let peer = peer.clone();
                let mut buf = vec![0u8; packet.len() + 32];
                match peer.tunnel.lock().encapsulate(packet, &mut buf) {
                    TunnResult::WriteToNetwork(encrypted) => {
                        if let Some(addr) = *peer.endpoint.lock() {
                            vec![Outgoing::ToNetwork(addr, encrypted.to_vec())]
                        } else {
                            Vec::new()
                        }
                    }
                    _ => Vec::new(),
                }
            }
            None => Vec::new(),
        }
    }

    fn encapsulate_outbound(&mut self, packet: &[u8]) -> Option<(SocketAddr, Vec<u8>)> {
        let dst = ipv4_destination(packet)?;
        let (_, peer) = self.allowed_ips.longest_match(IpAddr::V4(dst))?;
        let peer = peer.clone();
        let mut buf = vec![0u8; packet.len() + 32];
        match peer.tunnel.lock().encapsulate(packet, &mut buf) {
            TunnResult::WriteToNetwork(encrypted) => {
                let addr = (*peer.endpoint.lock())?;
                Some((addr, encrypted.to_vec()))
            }
            _ => None,
        }
    }

    fn tick(&mut self) -> Vec<Outgoing> {
        let mut out = Vec::new();
        let peers: Vec<Arc<PeerState>> = self.peers_by_key.values().cloned().collect();

        for peer in peers {
            let mut dst = vec![0u8; MAX_PACKET];
            let result = peer.tunnel.lock().update_timers(&mut dst);
            out.extend(self.handle_tunn_result(&peer, result));
        }

        out
    }
}

fn to_ip_network(net: Ipv4Net) -> IpNetwork {
    IpNetwork::new_truncate(IpAddr::V4(net.network()), net.prefix_len())
        .expect("prefix length is already validated by ipnet")
}

/// Reads the destination address out of a raw IPv4 packet's header.
/// Returns `None` for anything that isn't a well-formed IPv4 packet (in
/// particular, IPv6: the overlay is IPv4-only by explicit non-goal).
fn ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < 20 || (packet[0] >> 4) != 4 {
        return None;
    }
    Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> StaticSecret {
        StaticSecret::from([byte; 32])
    }

    #[tokio::test]
    async fn set_then_get_round_trips_allowed_ip() {
        let engine = Engine::new(key(1), 9999);
        let peer_public = PublicKey::from(&key(2));
        let blob = format!(
            "public_key={}\nallowed_ip=192.168.0.1/32\n",
            hex::encode(peer_public.as_bytes())
        );

        engine.set(&blob).await.unwrap();
        let dump = engine.get().await;

        assert!(dump.contains(&hex::encode(peer_public.as_bytes())));
        assert!(dump.contains("allowed_ip=192.168.0.1/32"));
    }

    #[tokio::test]
    async fn remove_drops_peer_from_dump() {
        let engine = Engine::new(key(1), 9999);
        let peer_public = PublicKey::from(&key(2));
        let pk_hex = hex::encode(peer_public.as_bytes());

        engine
            .set(&format!("public_key={pk_hex}\nallowed_ip=10.0.0.1/32\n"))
            .await
            .unwrap();
        engine.set(&format!("public_key={pk_hex}\nremove=true\n")).await.unwrap();

        assert!(!engine.get().await.contains(&pk_hex));
    }

    #[test]
    fn reads_ipv4_destination_from_header() {
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet[16..20].copy_from_slice(&[10, 0, 0, 7]);
        assert_eq!(ipv4_destination(&packet), Some(Ipv4Addr::new(10, 0, 0, 7)));
    }
}
