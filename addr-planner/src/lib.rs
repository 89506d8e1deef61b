//! Pure IPv4 address-range arithmetic for the hub.
//!
//! Three pieces of logic: the minimal enclosing supernet of a set of prefixes,
//! overlap detection between two prefixes, and random free-address generation
//! within a supernet. None of this touches sockets, peers, or the crypto engine;
//! it is deliberately kept dependency-light so it can be fuzzed and property-tested
//! in isolation.

use ipnet::Ipv4Net;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlannerError {
    #[error("prefix list must not be empty")]
    Empty,
}

/// Computes the smallest IPv4 prefix whose range covers every prefix in `prefixes`.
///
/// The computation is byte-granular, not bit-granular: at each step the supernet's
/// mask only ever shrinks by whole bytes. That is a deliberate, tested behaviour
/// (see DESIGN.md), not a shortcut.
pub fn supernet(prefixes: &[Ipv4Net]) -> Result<Ipv4Net, PlannerError> {
    let mut iter = prefixes.iter();
    let first = iter.next().ok_or(PlannerError::Empty)?;

    let mut addr = first.network().octets();
    let mut mask = first.netmask().octets();

    for next in iter {
        let next_addr = next.network().octets();
        let next_mask = next.netmask().octets();

        let common_addr_bytes = leading_equal_bytes(&addr, &next_addr);
        let common_mask_bytes = leading_equal_bytes(&mask, &next_mask);
        let shared_bytes = common_addr_bytes.min(common_mask_bytes);

        mask = byte_mask(shared_bytes);
        for i in 0..4 {
            addr[i] &= mask[i];
        }
    }

    let prefix_len = mask.iter().map(|b| b.count_ones()).sum::<u32>() as u8;
    Ok(Ipv4Net::new(Ipv4Addr::from(addr), prefix_len).expect("byte-aligned mask is always a valid prefix length"))
}

fn leading_equal_bytes(a: &[u8; 4], b: &[u8; 4]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn byte_mask(full_bytes: usize) -> [u8; 4] {
    let mut mask = [0u8; 4];
    for (i, byte) in mask.iter_mut().enumerate() {
        if i < full_bytes {
            *byte = 0xff;
        }
    }
    mask
}

/// Two prefixes overlap iff either one's network address falls inside the other's range.
pub fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    range_contains(a, b.network()) || range_contains(b, a.network())
}

fn range_contains(net: &Ipv4Net, addr: Ipv4Addr) -> bool {
    let addr = u32::from(addr);
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    (start..=end).contains(&addr)
}

const MAX_ATTEMPTS: usize = 10_000;

/// A process-wide generator of random free IPv4 addresses.
///
/// A single mutex-guarded RNG backs every call: two concurrent callers can
/// never observe the same draw from the generator.
pub struct FreeAddressGenerator {
    rng: Mutex<StdRng>,
}

impl Default for FreeAddressGenerator {
    fn default() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self::from_seed(seed)
    }
}

impl FreeAddressGenerator {
    /// Builds a generator from an explicit seed. Used by tests that need
    /// reproducible draws; production startup goes through [`Default`].
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Computes the supernet of `prefixes`, then draws a `/32` address inside it
    /// that overlaps no member of `prefixes` and is neither the supernet's network
    /// nor its broadcast address. Returns `Ok(None)` if 10,000 consecutive draws
    /// all collide — the caller is expected to already know the supernet (it can
    /// call [`supernet`] itself), so exhaustion is not an error.
    pub fn generate(&self, prefixes: &[Ipv4Net]) -> Result<Option<Ipv4Net>, PlannerError> {
        let net = supernet(prefixes)?;
        let base = net.network().octets();
        let mask = net.netmask().octets();
        let network_addr = net.network();
        let broadcast_addr = net.broadcast();

        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        for _ in 0..MAX_ATTEMPTS {
            let mut octets = [0u8; 4];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = if mask[i] == 0xff {
                    base[i]
                } else {
                    rng.gen_range(0..=255)
                };
            }

            // When the supernet's boundary falls exactly on the last octet (a /24
            // or shorter-host supernet), clamp that octet away from 0 and 255: those
            // are always the supernet's own network and broadcast addresses.
            if mask[3] != 0xff && mask[2] == 0xff {
                octets[3] = match octets[3] {
                    0 => 1,
                    255 => 254,
                    other => other,
                };
            }

            let candidate = Ipv4Addr::from(octets);
            if candidate == network_addr || candidate == broadcast_addr {
                continue;
            }

            let candidate_net =
                Ipv4Net::new(candidate, 32).expect("/32 is always a valid prefix length");

            if prefixes.iter().any(|p| overlaps(p, &candidate_net)) {
                continue;
            }

            return Ok(Some(candidate_net));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn supernet_of_four_adjacent_hosts() {
        let prefixes = [
            net("192.168.0.1/32"),
            net("192.168.0.2/32"),
            net("192.168.0.3/32"),
            net("192.168.0.4/32"),
        ];
        assert_eq!(supernet(&prefixes).unwrap(), net("192.168.0.0/24"));
    }

    #[test]
    fn supernet_widens_to_match_mask_divergence() {
        let prefixes = [net("192.168.0.1/32"), net("192.168.0.2/8")];
        assert_eq!(supernet(&prefixes).unwrap(), net("192.0.0.0/8"));
    }

    #[test]
    fn supernet_of_unrelated_hosts_is_default_route() {
        let prefixes = [net("192.168.0.1/32"), net("1.1.1.1/32")];
        assert_eq!(supernet(&prefixes).unwrap(), net("0.0.0.0/0"));
    }

    #[test]
    fn supernet_is_byte_granular_not_bit_granular() {
        // A bit-granular implementation would find 192.168.0.0/25; byte-granular
        // widens to /24 because the divergence is only resolved at the last byte.
        let prefixes = [net("192.168.0.1/31"), net("192.168.0.128/32")];
        assert_eq!(supernet(&prefixes).unwrap(), net("192.168.0.0/24"));
    }

    #[test]
    fn supernet_rejects_empty_input() {
        assert_eq!(supernet(&[]), Err(PlannerError::Empty));
    }

    #[test]
    fn overlap_is_reflexive_and_symmetric() {
        let a = net("10.0.0.0/24");
        let b = net("10.0.0.128/25");
        let c = net("10.1.0.0/24");

        assert!(overlaps(&a, &a));
        assert!(overlaps(&a, &b));
        assert!(overlaps(&b, &a));
        assert!(!overlaps(&a, &c));
        assert!(!overlaps(&c, &a));
    }

    #[test]
    fn free_address_respects_invariants() {
        let prefixes = [net("192.168.0.1/32"), net("192.168.0.2/32")];
        let gen = FreeAddressGenerator::from_seed(1337);
        let net_super = supernet(&prefixes).unwrap();

        for _ in 0..500 {
            let candidate = gen.generate(&prefixes).unwrap().expect("supernet has room");
            assert_eq!(candidate.prefix_len(), 32);
            assert!(overlaps(&net_super, &candidate));
            assert!(!prefixes.iter().any(|p| overlaps(p, &candidate)));
            assert_ne!(candidate.network(), net_super.network());
            assert_ne!(candidate.network(), net_super.broadcast());
        }
    }

    #[test]
    fn free_address_exhausts_a_slash_24() {
        let mut prefixes = vec![net("192.168.0.1/32"), net("192.168.0.2/32")];
        let gen = FreeAddressGenerator::from_seed(1337);

        while prefixes.len() < 254 {
            let candidate = gen
                .generate(&prefixes)
                .unwrap()
                .expect("free address remains in the /24");
            prefixes.push(candidate);
        }

        assert_eq!(gen.generate(&prefixes).unwrap(), None);
    }

    proptest::proptest! {
        #[test]
        fn supernet_covers_every_member(
            octets in proptest::collection::vec((0u8..=255, 0u8..=255, 0u8..=255, 0u8..=255, 8u8..=32), 1..8)
        ) {
            let prefixes: Vec<Ipv4Net> = octets
                .into_iter()
                .map(|(a, b, c, d, len)| Ipv4Net::new(Ipv4Addr::new(a, b, c, d), len).unwrap())
                .collect();
            let super_net = supernet(&prefixes).unwrap();
            for p in &prefixes {
                proptest::prop_assert!(overlaps(&super_net, p));
            }
        }

        #[test]
        fn overlap_is_always_symmetric(
            a in (0u8..=255, 0u8..=255, 0u8..=255, 0u8..=255, 0u8..=32),
            b in (0u8..=255, 0u8..=255, 0u8..=255, 0u8..=255, 0u8..=32),
        ) {
            let a = Ipv4Net::new(Ipv4Addr::new(a.0, a.1, a.2, a.3), a.4).unwrap();
            let b = Ipv4Net::new(Ipv4Addr::new(b.0, b.1, b.2, b.3), b.4).unwrap();
            proptest::prop_assert_eq!(overlaps(&a, &b), overlaps(&b, &a));
        }
    }
}
