//! Address helpers: normalisation, the 18-byte wire encoding, and the small
//! list operations used by the peer state machine.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// Wire size of an encoded `address:port`
pub const ADDR_PORT_LEN: usize = 18;

/// Map IPv4-mapped IPv6 addresses back to plain IPv4.
///
/// Every alias table, ping tracker and trust set stores normalised addresses,
/// so a peer seen via a dual-stack socket compares equal to its endpoint
/// announced by the control plane.
#[must_use]
pub fn normalise(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

/// Encode as 16 bytes of IPv6 (IPv4 as v4-mapped) and a big-endian port.
#[must_use]
pub fn encode(addr: SocketAddr) -> [u8; ADDR_PORT_LEN] {
    let v6 = match addr.ip() {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };

    let mut out = [0u8; ADDR_PORT_LEN];
    out[..16].copy_from_slice(&v6.octets());
    out[16..].copy_from_slice(&addr.port().to_be_bytes());
    out
}

/// Decode an 18-byte `address:port`, normalising v4-mapped addresses.
#[must_use]
pub fn decode(bytes: &[u8; ADDR_PORT_LEN]) -> SocketAddr {
    let mut ip = [0u8; 16];
    ip.copy_from_slice(&bytes[..16]);
    let port = u16::from_be_bytes([bytes[16], bytes[17]]);

    normalise(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port))
}

/// RFC 1918 for IPv4, unique-local `fc00::/7` for IPv6.
#[must_use]
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Order-preserving union of two lists with duplicates removed.
#[must_use]
pub fn union(a: &[SocketAddr], b: &[SocketAddr]) -> Vec<SocketAddr> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    for addr in a.iter().chain(b) {
        if !out.contains(addr) {
            out.push(*addr);
        }
    }
    out
}

/// Normalise and deduplicate, keeping first-seen order.
#[must_use]
pub fn canonical(addrs: impl IntoIterator<Item = SocketAddr>) -> Vec<SocketAddr> {
    let mut out: Vec<SocketAddr> = Vec::new();
    for addr in addrs.into_iter().map(normalise) {
        if !out.contains(&addr) {
            out.push(addr);
        }
    }
    out
}

/// Normalise, sort and deduplicate.
#[must_use]
pub fn sorted(addrs: impl IntoIterator<Item = SocketAddr>) -> Vec<SocketAddr> {
    let mut out: Vec<_> = addrs.into_iter().map(normalise).collect();
    out.sort();
    out.dedup();
    out
}

/// Compact rendering for log fields.
#[must_use]
pub fn pretty(addrs: &[SocketAddr]) -> String {
    let parts: Vec<String> = addrs.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalise_mapped() {
        let mapped: SocketAddr = "[::ffff:10.0.0.1]:41641".parse().unwrap();
        assert_eq!(normalise(mapped), "10.0.0.1:41641".parse().unwrap());

        let v6: SocketAddr = "[fd00::1]:1".parse().unwrap();
        assert_eq!(normalise(v6), v6);
    }

    #[test]
    fn test_encode_layout() {
        let addr: SocketAddr = "1.2.3.4:258".parse().unwrap();
        let b = encode(addr);
        assert_eq!(&b[..12], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]);
        assert_eq!(&b[12..16], &[1, 2, 3, 4]);
        assert_eq!(&b[16..], &[1, 2]);
    }

    #[test]
    fn test_is_private() {
        assert!(is_private("192.168.1.1".parse().unwrap()));
        assert!(is_private("fd12::1".parse().unwrap()));
        assert!(!is_private("8.8.8.8".parse().unwrap()));
        assert!(!is_private("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_union_keeps_order() {
        let a: SocketAddr = "1.1.1.1:1".parse().unwrap();
        let b: SocketAddr = "2.2.2.2:2".parse().unwrap();
        let c: SocketAddr = "3.3.3.3:3".parse().unwrap();
        assert_eq!(union(&[b, a], &[a, c]), vec![b, a, c]);
    }

    #[test]
    fn test_sorted_dedups_mapped() {
        let plain: SocketAddr = "10.0.0.1:5".parse().unwrap();
        let mapped: SocketAddr = "[::ffff:10.0.0.1]:5".parse().unwrap();
        assert_eq!(sorted([mapped, plain]), vec![plain]);
    }

    #[test]
    fn test_canonical_unmaps_and_keeps_order() {
        let b: SocketAddr = "198.51.100.7:6000".parse().unwrap();
        let a: SocketAddr = "203.0.113.5:4000".parse().unwrap();
        let mapped: SocketAddr = "[::ffff:198.51.100.7]:6000".parse().unwrap();
        assert_eq!(canonical([mapped, a, b]), vec![b, a]);
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(ip in any::<[u8; 16]>(), port in any::<u16>()) {
            let addr = normalise(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port));
            prop_assert_eq!(decode(&encode(addr)), addr);
        }
    }
}
