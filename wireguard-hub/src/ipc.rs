use std::net::SocketAddr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ipnet::Ipv4Net;

/// One peer as parsed out of the engine's `get()` dump.
///
/// Only the fields this system cares about are kept; any other key the
/// engine emits is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPeer {
    pub public_key: [u8; 32],
    pub allowed_ip: Option<Ipv4Net>,
    pub endpoint: Option<SocketAddr>,
    pub last_handshake_time_sec: Option<u64>,
    pub tx_bytes: Option<u64>,
    pub rx_bytes: Option<u64>,
}

impl ParsedPeer {
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public_key)
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key)
    }

    fn empty(public_key: [u8; 32]) -> Self {
        Self {
            public_key,
            allowed_ip: None,
            endpoint: None,
            last_handshake_time_sec: None,
            tx_bytes: None,
            rx_bytes: None,
        }
    }
}

/// Parses an engine `get()` dump into structured peer records, sorted by
/// base64 public key for deterministic listing. `own_public_key`,
/// `listen_port`, and any other device-level key is ignored here; callers
/// interested in those read them directly off the dump before calling this.
pub fn parse(text: &str) -> Vec<ParsedPeer> {
    let mut peers: Vec<ParsedPeer> = Vec::new();

    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };

        match key {
            "public_key" => {
                let Ok(bytes) = hex::decode(value) else {
                    continue;
                };
                let Ok(public_key) = <[u8; 32]>::try_from(bytes.as_slice()) else {
                    continue;
                };
                peers.push(ParsedPeer::empty(public_key));
            }
            "allowed_ip" => {
                if let (Some(peer), Ok(net)) = (peers.last_mut(), value.parse()) {
                    peer.allowed_ip = Some(net);
                }
            }
            "endpoint" => {
                if let (Some(peer), Ok(addr)) = (peers.last_mut(), value.parse()) {
                    peer.endpoint = Some(addr);
                }
            }
            "last_handshake_time_sec" => {
                if let (Some(peer), Ok(secs)) = (peers.last_mut(), value.parse()) {
                    peer.last_handshake_time_sec = Some(secs);
                }
            }
            "tx_bytes" => {
                if let (Some(peer), Ok(n)) = (peers.last_mut(), value.parse()) {
                    peer.tx_bytes = Some(n);
                }
            }
            "rx_bytes" => {
                if let (Some(peer), Ok(n)) = (peers.last_mut(), value.parse()) {
                    peer.rx_bytes = Some(n);
                }
            }
            // Unknown keys (fwmark, preshared_key, last_handshake_time_nsec, ...) are ignored.
            _ => {}
        }
    }

    peers.sort_by(|a, b| a.public_key_base64().cmp(&b.public_key_base64()));
    peers
}

/// Renders a `set` delta that adds a peer or replaces its allowed-IP set.
pub fn render_add(public_key_hex: &str, allowed_ip: Ipv4Net) -> String {
    format!("public_key={public_key_hex}\nreplace_allowed_ips=true\nallowed_ip={allowed_ip}\n")
}

/// Renders a `set` delta that removes a peer outright.
pub fn render_remove(public_key_hex: &str) -> String {
    format!("public_key={public_key_hex}\nremove=true\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = "\
private_key=0000000000000000000000000000000000000000000000000000000000000000\n\
listen_port=9999\n\
public_key=876fcf027921db1bfe8ff54d4a3bf523fbb50ac0e0ba2a23d689d1467dadad26\n\
allowed_ip=192.168.0.2/32\n\
last_handshake_time_sec=10\n\
tx_bytes=100\n\
rx_bytes=200\n\
public_key=3dc79647b2e06ed2df6a1dd8dfe9c8eaf54a42d8dc3ab92d9f76e7f09a8f0c3f\n\
allowed_ip=192.168.0.254/32\n\
public_key=875ff02792123456789012345678901234567890123456789012345678901234\n\
allowed_ip=192.168.0.1/32\n\
";

    #[test]
    fn parses_three_peers_from_dump() {
        let peers = parse(FIXTURE);
        assert_eq!(peers.len(), 3);
        assert_eq!(peers[0].tx_bytes, None);
    }

    #[test]
    fn sorted_by_base64_public_key() {
        let peers = parse(FIXTURE);
        let keys: Vec<String> = peers.iter().map(ParsedPeer::public_key_base64).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn add_delta_has_expected_shape() {
        let delta = render_add("aa".repeat(32).as_str(), "10.0.0.0/24".parse().unwrap());
        assert!(delta.starts_with("public_key="));
        assert!(delta.contains("replace_allowed_ips=true\n"));
        assert!(delta.ends_with("allowed_ip=10.0.0.0/24\n"));
    }

    #[test]
    fn remove_delta_has_expected_shape() {
        let delta = render_remove("bb".repeat(32).as_str());
        assert_eq!(delta, format!("public_key={}\nremove=true\n", "bb".repeat(32)));
    }
}
