//! Rule model validation.
//!
//! This is the only place malformed input is rejected. Everything downstream
//! works on the typed [`ParsedRule`] produced here.

use std::net::IpAddr;

use ipnet::IpNet;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::error::{AclError, Result};
use crate::types::{Acl, Action, Direction, Protocol, Rule, RuleState, Side};

/// ACL name grammar: a letter, then letters, digits or dashes, not ending in a dash.
static NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z](?:[A-Za-z0-9-]*[A-Za-z0-9])?$")
        .expect("NAME_PATTERN: hardcoded regex is invalid")
});

/// Maximum ACL name length
pub const MAX_NAME_LEN: usize = 63;

/// Prefix of config keys that carry no meaning for the engine
pub const USER_CONFIG_PREFIX: &str = "user.";

/// Symbolic subject for traffic local to the network
pub const SUBJECT_INTERNAL: &str = "@internal";
/// Symbolic subject for traffic leaving the network
pub const SUBJECT_EXTERNAL: &str = "@external";

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }
}

/// Syntactic form of one entry in a `source` or `destination` list
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubjectSpec {
    /// Single address or CIDR block
    Net(IpNet),
    /// Inclusive address range of a single family
    Range(IpAddr, IpAddr),
    /// `@internal`
    Internal,
    /// `@external`
    External,
    /// `@<network>/<peer>`
    Peer { network: String, peer: String },
    /// Bare ACL name, standing for the NICs that ACL applies to
    Group(String),
}

impl SubjectSpec {
    /// Whether this is a selector rather than a literal address set
    pub fn is_selector(&self) -> bool {
        !matches!(self, SubjectSpec::Net(_) | SubjectSpec::Range(..))
    }
}

/// A validated rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRule {
    pub action: Action,
    pub state: RuleState,
    pub protocol: Protocol,
    pub source: Vec<(String, SubjectSpec)>,
    pub destination: Vec<(String, SubjectSpec)>,
    pub source_ports: Vec<PortRange>,
    pub destination_ports: Vec<PortRange>,
    pub icmp_type: Option<u8>,
    pub icmp_code: Option<u8>,
}

impl ParsedRule {
    /// Subjects for a side, each with its original text
    pub fn subjects(&self, side: Side) -> &[(String, SubjectSpec)] {
        match side {
            Side::Source => &self.source,
            Side::Destination => &self.destination,
        }
    }
}

/// Validate an ACL name
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(AclError::validation(
            name,
            "name",
            format!("must be 1 to {} characters", MAX_NAME_LEN),
        ));
    }
    if !NAME_PATTERN.is_match(name) {
        return Err(AclError::validation(
            name,
            "name",
            "must start with a letter, contain only letters, digits and dashes, and not end with a dash",
        ));
    }
    Ok(())
}

/// Validate a whole ACL: name, config keys and every rule in both directions.
pub fn validate_acl(acl: &Acl) -> Result<()> {
    validate_name(&acl.name)?;

    for key in acl.config.keys() {
        if !key.starts_with(USER_CONFIG_PREFIX) {
            return Err(AclError::validation(
                &acl.name,
                format!("config.{}", key),
                format!("only {}* keys are allowed", USER_CONFIG_PREFIX),
            ));
        }
    }

    for direction in Direction::ALL {
        for (index, rule) in acl.rules(direction).iter().enumerate() {
            parse_rule(&acl.name, direction, index, rule)?;
        }
    }
    Ok(())
}

/// Parse and validate one rule at `direction[index]` of ACL `acl`.
pub fn parse_rule(acl: &str, direction: Direction, index: usize, rule: &Rule) -> Result<ParsedRule> {
    let field = |name: &str| format!("{}[{}].{}", direction, index, name);

    if rule.action.is_empty() {
        return Err(AclError::validation(acl, field("action"), "action is required"));
    }
    let action = Action::parse(&rule.action).ok_or_else(|| {
        AclError::validation(
            acl,
            field("action"),
            format!("unknown action {:?}, expected allow, reject or drop", rule.action),
        )
    })?;

    let state = RuleState::parse(&rule.state).ok_or_else(|| {
        AclError::validation(
            acl,
            field("state"),
            format!("unknown state {:?}, expected enabled, disabled or logged", rule.state),
        )
    })?;

    let protocol = Protocol::parse(&rule.protocol).ok_or_else(|| {
        AclError::validation(
            acl,
            field("protocol"),
            format!("unknown protocol {:?}, expected tcp, udp, icmp4, icmp6 or empty", rule.protocol),
        )
    })?;

    // Port fields belong to tcp/udp, ICMP fields to icmp4/icmp6.
    for (name, value) in [("source_port", &rule.source_port), ("destination_port", &rule.destination_port)] {
        if !value.is_empty() && !protocol.has_ports() {
            return Err(AclError::validation(
                acl,
                field(name),
                format!("ports require protocol tcp or udp, got {:?}", protocol.as_str()),
            ));
        }
    }
    for (name, value) in [("icmp_type", &rule.icmp_type), ("icmp_code", &rule.icmp_code)] {
        if !value.is_empty() && !protocol.is_icmp() {
            return Err(AclError::validation(
                acl,
                field(name),
                format!("ICMP fields require protocol icmp4 or icmp6, got {:?}", protocol.as_str()),
            ));
        }
    }

    let source_ports = parse_port_list(&rule.source_port)
        .map_err(|msg| AclError::validation(acl, field("source_port"), msg))?;
    let destination_ports = parse_port_list(&rule.destination_port)
        .map_err(|msg| AclError::validation(acl, field("destination_port"), msg))?;
    let icmp_type = parse_icmp_value(&rule.icmp_type)
        .map_err(|msg| AclError::validation(acl, field("icmp_type"), msg))?;
    let icmp_code = parse_icmp_value(&rule.icmp_code)
        .map_err(|msg| AclError::validation(acl, field("icmp_code"), msg))?;

    let mut sides = [Vec::new(), Vec::new()];
    for (slot, side) in sides.iter_mut().zip([Side::Source, Side::Destination]) {
        for item in split_list(rule.subject(side)) {
            let spec = parse_subject(item)
                .map_err(|msg| AclError::validation(acl, field(side.as_str()), msg))?;
            if matches!(spec, SubjectSpec::Group(_)) && side != direction.far_side() {
                return Err(AclError::validation(
                    acl,
                    field(side.as_str()),
                    format!(
                        "subject name {:?} is only valid in {} of {} rules",
                        item,
                        direction.far_side().as_str(),
                        direction
                    ),
                ));
            }
            slot.push((item.to_string(), spec));
        }
    }
    let [source, destination] = sides;

    Ok(ParsedRule {
        action,
        state,
        protocol,
        source,
        destination,
        source_ports,
        destination_ports,
        icmp_type,
        icmp_code,
    })
}

/// Split a comma-separated list, trimming entries. Empty input gives no entries.
pub(crate) fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(',')
        .map(str::trim)
        .filter(move |_| !value.trim().is_empty())
}

/// Parse one subject entry.
pub fn parse_subject(item: &str) -> std::result::Result<SubjectSpec, String> {
    if item.is_empty() {
        return Err("empty subject in list".to_string());
    }

    if let Some(rest) = item.strip_prefix('@') {
        return match item {
            SUBJECT_INTERNAL => Ok(SubjectSpec::Internal),
            SUBJECT_EXTERNAL => Ok(SubjectSpec::External),
            _ => {
                let (network, peer) = rest
                    .split_once('/')
                    .ok_or_else(|| format!("unknown network selector {:?}", item))?;
                if !NAME_PATTERN.is_match(network) || !NAME_PATTERN.is_match(peer) {
                    return Err(format!("invalid network peer selector {:?}", item));
                }
                Ok(SubjectSpec::Peer {
                    network: network.to_string(),
                    peer: peer.to_string(),
                })
            }
        };
    }

    if let Ok(ip) = item.parse::<IpAddr>() {
        return Ok(SubjectSpec::Net(host_net(ip)));
    }

    if let Ok(net) = item.parse::<IpNet>() {
        return Ok(SubjectSpec::Net(net));
    }

    if let Some((start, end)) = item.split_once('-') {
        if let (Ok(start), Ok(end)) = (start.trim().parse::<IpAddr>(), end.trim().parse::<IpAddr>()) {
            if start.is_ipv4() != end.is_ipv4() {
                return Err(format!("IP range {:?} mixes address families", item));
            }
            if start > end {
                return Err(format!("IP range {:?} starts after it ends", item));
            }
            return Ok(SubjectSpec::Range(start, end));
        }
    }

    if item.len() <= MAX_NAME_LEN && NAME_PATTERN.is_match(item) {
        return Ok(SubjectSpec::Group(item.to_string()));
    }

    Err(format!(
        "{:?} is not an IP, CIDR, IP range, network selector or ACL name",
        item
    ))
}

/// Parse a port list such as `"80,443,8000-8080"`.
pub fn parse_port_list(value: &str) -> std::result::Result<Vec<PortRange>, String> {
    let mut ranges = Vec::new();
    for item in split_list(value) {
        let range = if let Some((start, end)) = item.split_once('-') {
            let start = parse_port(start)?;
            let end = parse_port(end)?;
            if start > end {
                return Err(format!("invalid port range: {} > {}", start, end));
            }
            PortRange { start, end }
        } else {
            let port = parse_port(item)?;
            PortRange { start: port, end: port }
        };
        ranges.push(range);
    }
    Ok(ranges)
}

fn parse_port(value: &str) -> std::result::Result<u16, String> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|_| format!("invalid port: {:?}", value))
}

fn parse_icmp_value(value: &str) -> std::result::Result<Option<u8>, String> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse::<u8>()
        .map(Some)
        .map_err(|_| format!("must be an integer between 0 and 255, got {:?}", value))
}

/// Single-address network for an IP
pub(crate) fn host_net(ip: IpAddr) -> IpNet {
    let prefix = if ip.is_ipv4() { 32 } else { 128 };
    IpNet::new(ip, prefix).expect("full-length prefix is always valid")
}
