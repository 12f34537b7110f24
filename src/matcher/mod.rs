mod ip;

pub use ip::{net_contains, range_contains, range_to_cidrs};

use std::collections::BTreeSet;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::Serialize;

use crate::types::{Endpoint, NicId};

/// Trait for endpoint matchers
pub trait EndpointMatcher {
    /// Check if the endpoint matches this matcher
    fn matches(&self, endpoint: &Endpoint) -> bool;
}

/// A fully resolved rule subject, ready for matching or rendering
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    Net(IpNet),
    Range { start: IpAddr, end: IpAddr },
    Internal,
    External,
    Peer {
        network: String,
        peer: String,
        addresses: Vec<IpNet>,
    },
    /// Live member set of an ACL's port group at compile time
    Group { acl: String, members: BTreeSet<NicId> },
}

impl EndpointMatcher for Subject {
    fn matches(&self, endpoint: &Endpoint) -> bool {
        match self {
            Subject::Net(net) => endpoint.ip.is_some_and(|ip| net_contains(net, &ip)),
            Subject::Range { start, end } => endpoint
                .ip
                .is_some_and(|ip| range_contains(start, end, &ip)),
            Subject::Internal => endpoint.internal,
            Subject::External => !endpoint.internal,
            Subject::Peer { addresses, .. } => endpoint
                .ip
                .is_some_and(|ip| addresses.iter().any(|net| net_contains(net, &ip))),
            Subject::Group { members, .. } => endpoint
                .nic
                .as_ref()
                .is_some_and(|nic| members.contains(nic)),
        }
    }
}

/// A subject list; empty matches everything
impl EndpointMatcher for [Subject] {
    fn matches(&self, endpoint: &Endpoint) -> bool {
        self.is_empty() || self.iter().any(|s| s.matches(endpoint))
    }
}
