use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Subnets, Ipv6Subnets};

/// Check whether an address lies in a CIDR block of the same family
pub fn net_contains(network: &IpNet, ip: &IpAddr) -> bool {
    match (network, ip) {
        (IpNet::V4(net), IpAddr::V4(v4)) => net.contains(v4),
        (IpNet::V6(net), IpAddr::V6(v6)) => net.contains(v6),
        _ => false,
    }
}

/// Check whether an address lies in an inclusive range of the same family
pub fn range_contains(start: &IpAddr, end: &IpAddr, ip: &IpAddr) -> bool {
    match (start, end, ip) {
        (IpAddr::V4(s), IpAddr::V4(e), IpAddr::V4(v4)) => s <= v4 && v4 <= e,
        (IpAddr::V6(s), IpAddr::V6(e), IpAddr::V6(v6)) => s <= v6 && v6 <= e,
        _ => false,
    }
}

/// Smallest set of CIDR blocks exactly covering an inclusive range.
///
/// Mixed-family input yields nothing; the validator never lets it through.
pub fn range_to_cidrs(start: &IpAddr, end: &IpAddr) -> Vec<IpNet> {
    match (start, end) {
        (IpAddr::V4(s), IpAddr::V4(e)) => Ipv4Subnets::new(*s, *e, 0).map(IpNet::V4).collect(),
        (IpAddr::V6(s), IpAddr::V6(e)) => Ipv6Subnets::new(*s, *e, 0).map(IpNet::V6).collect(),
        _ => Vec::new(),
    }
}
