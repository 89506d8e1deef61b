use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ipnet::Ipv4Net;

use crate::error::HubError;

/// A parsed, canonicalised peer record as produced by the CLI/env/YAML sources.
///
/// `allowed_ip` is always canonical: a bare address is promoted to `/32`, and
/// the address is masked by the prefix length (host bits cleared).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSpec {
    pub public_key: [u8; 32],
    pub allowed_ip: Ipv4Net,
}

impl PeerSpec {
    /// Parses the `<base64-public-key>,<ipv4-or-ipv4-prefix>` grammar.
    pub fn parse(s: &str) -> Result<Self, HubError> {
        let (key_part, ip_part) = s
            .split_once(',')
            .ok_or_else(|| HubError::Validation(format!("malformed peer entry: {s}")))?;

        let public_key = decode_public_key(key_part)?;
        let allowed_ip = parse_allowed_ip(ip_part)?;

        Ok(Self {
            public_key,
            allowed_ip,
        })
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public_key)
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key)
    }
}

/// Decodes a 44-char base64 WireGuard public key into its 32 raw bytes.
pub fn decode_public_key(s: &str) -> Result<[u8; 32], HubError> {
    let bytes = BASE64
        .decode(s.trim())
        .map_err(|e| HubError::Validation(format!("invalid base64 public key: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| HubError::Validation("public key must decode to 32 bytes".to_string()))
}

/// Parses an IPv4 address or prefix, promoting a bare address to `/32` and
/// masking host bits by the prefix length.
pub fn parse_allowed_ip(s: &str) -> Result<Ipv4Net, HubError> {
    let s = s.trim();
    let net: Ipv4Net = if s.contains('/') {
        s.parse()
            .map_err(|e| HubError::Validation(format!("invalid allowed-ip prefix {s}: {e}")))?
    } else {
        let addr: std::net::Ipv4Addr = s
            .parse()
            .map_err(|e| HubError::Validation(format!("invalid allowed-ip address {s}: {e}")))?;
        Ipv4Net::new(addr, 32).expect("/32 is always valid")
    };

    Ok(Ipv4Net::new(net.network(), net.prefix_len()).expect("re-masking a valid net is always valid"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key_base64() -> String {
        BASE64.encode([7u8; 32])
    }

    #[test]
    fn parses_bare_address_as_slash_32() {
        let s = format!("{},192.168.0.5", sample_key_base64());
        let peer = PeerSpec::parse(&s).unwrap();
        assert_eq!(peer.allowed_ip, "192.168.0.5/32".parse().unwrap());
    }

    #[test]
    fn canonicalises_host_bits() {
        let s = format!("{},192.168.0.5/24", sample_key_base64());
        let peer = PeerSpec::parse(&s).unwrap();
        assert_eq!(peer.allowed_ip, "192.168.0.0/24".parse().unwrap());
    }

    #[test]
    fn round_trip_parse_canonicalise_reparse() {
        let s = format!("{},10.1.2.3/28", sample_key_base64());
        let once = PeerSpec::parse(&s).unwrap();
        let reencoded = format!("{},{}", once.public_key_base64(), once.allowed_ip);
        let twice = PeerSpec::parse(&reencoded).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn rejects_missing_comma() {
        assert!(PeerSpec::parse(&sample_key_base64()).is_err());
    }

    #[test]
    fn rejects_bad_base64() {
        assert!(PeerSpec::parse("not-base64!!,10.0.0.1").is_err());
    }
}
