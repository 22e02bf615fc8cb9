//! Prefix arithmetic used to expand ip-block policy clauses.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Expresses a single address as a full-length prefix (/32 or /128).
pub fn host_subnet(addr: IpAddr) -> IpNet {
    IpNet::from(addr)
}

/// Parses an address string into a one-host subnet. Returns `None` on
/// malformed input; callers log and skip.
pub fn parse_host_subnet(addr: &str) -> Option<IpNet> {
    addr.parse::<IpAddr>().ok().map(IpNet::from)
}

/// Returns prefixes covering exactly the addresses of `net1` not in `net2`.
///
/// The returned prefixes are pairwise disjoint and their union equals the set
/// difference. When `net2` lies strictly inside `net1` the result is one
/// sibling prefix per bit between the two mask lengths, in ascending mask
/// order. Prefixes of different address families never overlap.
pub fn subtract(net1: &IpNet, net2: &IpNet) -> Vec<IpNet> {
    match (net1, net2) {
        (IpNet::V4(a), IpNet::V4(b)) => subtract_v4(a, b),
        (IpNet::V6(a), IpNet::V6(b)) => subtract_v6(a, b),
        _ => vec![*net1],
    }
}

fn subtract_v4(net1: &Ipv4Net, net2: &Ipv4Net) -> Vec<IpNet> {
    if net1.prefix_len() > net2.prefix_len() {
        // net1 is the more specific prefix: either inside net2 or disjoint.
        if net2.contains(&net1.network()) {
            vec![]
        } else {
            vec![IpNet::V4(*net1)]
        }
    } else if net1.prefix_len() == net2.prefix_len() {
        if net1.network() == net2.network() {
            vec![]
        } else {
            vec![IpNet::V4(*net1)]
        }
    } else if !net1.contains(&net2.network()) {
        vec![IpNet::V4(*net1)]
    } else {
        // net2 lies inside net1: peel off the sibling half at every bit
        // between the two mask lengths.
        let excluded = u32::from(net2.network());
        (net1.prefix_len()..net2.prefix_len())
            .map(|bit| {
                let sibling = excluded ^ (1 << (31 - bit));
                let net = Ipv4Net::new(Ipv4Addr::from(sibling), bit + 1)
                    .expect("prefix length stays within 32 bits")
                    .trunc();
                IpNet::V4(net)
            })
            .collect()
    }
}

fn subtract_v6(net1: &Ipv6Net, net2: &Ipv6Net) -> Vec<IpNet> {
    if net1.prefix_len() > net2.prefix_len() {
        if net2.contains(&net1.network()) {
            vec![]
        } else {
            vec![IpNet::V6(*net1)]
        }
    } else if net1.prefix_len() == net2.prefix_len() {
        if net1.network() == net2.network() {
            vec![]
        } else {
            vec![IpNet::V6(*net1)]
        }
    } else if !net1.contains(&net2.network()) {
        vec![IpNet::V6(*net1)]
    } else {
        let excluded = u128::from(net2.network());
        (net1.prefix_len()..net2.prefix_len())
            .map(|bit| {
                let sibling = excluded ^ (1 << (127 - bit));
                let net = Ipv6Net::new(Ipv6Addr::from(sibling), bit + 1)
                    .expect("prefix length stays within 128 bits")
                    .trunc();
                IpNet::V6(net)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn one_host() {
        assert_eq!(host_subnet("10.0.0.1".parse().unwrap()), net("10.0.0.1/32"));
        assert_eq!(host_subnet("2001:db8::1".parse().unwrap()), net("2001:db8::1/128"));
        assert_eq!(parse_host_subnet("10.0.0.1"), Some(net("10.0.0.1/32")));
        assert_eq!(parse_host_subnet("not-an-address"), None);
        assert_eq!(parse_host_subnet(""), None);
    }

    #[test]
    fn disjoint_prefixes() {
        assert_eq!(
            subtract(&net("10.0.0.0/24"), &net("10.0.1.0/24")),
            vec![net("10.0.0.0/24")],
        );
        assert_eq!(
            subtract(&net("10.0.0.0/24"), &net("192.168.0.0/16")),
            vec![net("10.0.0.0/24")],
        );
    }

    #[test]
    fn equal_prefixes_cancel() {
        assert!(subtract(&net("10.0.0.0/24"), &net("10.0.0.0/24")).is_empty());
    }

    #[test]
    fn contained_in_subtrahend() {
        assert!(subtract(&net("10.0.0.128/25"), &net("10.0.0.0/24")).is_empty());
        assert_eq!(
            subtract(&net("10.0.1.0/25"), &net("10.0.0.0/24")),
            vec![net("10.0.1.0/25")],
        );
    }

    #[test]
    fn half_carved_out() {
        assert_eq!(
            subtract(&net("10.0.0.0/24"), &net("10.0.0.128/25")),
            vec![net("10.0.0.0/25")],
        );
    }

    #[test]
    fn sibling_expansion() {
        assert_eq!(
            subtract(&net("10.0.0.0/24"), &net("10.0.0.64/26")),
            vec![net("10.0.0.128/25"), net("10.0.0.0/26")],
        );
    }

    #[test]
    fn mixed_families_are_disjoint() {
        assert_eq!(
            subtract(&net("10.0.0.0/24"), &net("2001:db8::/32")),
            vec![net("10.0.0.0/24")],
        );
    }

    #[test]
    fn v6_expansion() {
        assert_eq!(
            subtract(&net("2001:db8::/32"), &net("2001:db8:8000::/34")),
            vec![net("2001:db8::/33"), net("2001:db8:c000::/34")],
        );
    }

    /// The returned prefixes are pairwise disjoint and cover exactly the
    /// difference, address by address.
    #[test]
    fn exact_difference() {
        let minuend = net("10.0.0.0/24");
        let subtrahend = net("10.0.0.64/26");
        let parts = subtract(&minuend, &subtrahend);

        for (i, a) in parts.iter().enumerate() {
            for b in &parts[i + 1..] {
                assert!(!a.contains(b) && !b.contains(a), "{a} overlaps {b}");
            }
        }

        for host in 0u32..=255 {
            let addr = IpAddr::from(Ipv4Addr::from(u32::from_be_bytes([10, 0, 0, 0]) + host));
            let expected = minuend.contains(&addr) && !subtrahend.contains(&addr);
            let covered = parts.iter().any(|p| p.contains(&addr));
            assert_eq!(covered, expected, "{addr}");
        }
    }
}
