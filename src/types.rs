use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Rule action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Reject,
    Drop,
}

impl Action {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Action::Allow),
            "reject" => Some(Action::Reject),
            "drop" => Some(Action::Drop),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Reject => "reject",
            Action::Drop => "drop",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleState {
    Enabled,
    Disabled,
    Logged,
}

impl RuleState {
    /// Empty input means `enabled`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" | "enabled" => Some(RuleState::Enabled),
            "disabled" => Some(RuleState::Disabled),
            "logged" => Some(RuleState::Logged),
            _ => None,
        }
    }
}

/// Network protocol a rule matches. `Any` is the empty wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Any,
    TCP,
    UDP,
    ICMP4,
    ICMP6,
}

impl Protocol {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" => Some(Protocol::Any),
            "tcp" => Some(Protocol::TCP),
            "udp" => Some(Protocol::UDP),
            "icmp4" => Some(Protocol::ICMP4),
            "icmp6" => Some(Protocol::ICMP6),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Any => "",
            Protocol::TCP => "tcp",
            Protocol::UDP => "udp",
            Protocol::ICMP4 => "icmp4",
            Protocol::ICMP6 => "icmp6",
        }
    }

    /// Whether port fields are meaningful for this protocol
    pub fn has_ports(&self) -> bool {
        matches!(self, Protocol::TCP | Protocol::UDP)
    }

    /// Whether ICMP type/code fields are meaningful for this protocol
    pub fn is_icmp(&self) -> bool {
        matches!(self, Protocol::ICMP4 | Protocol::ICMP6)
    }

    /// Check if a rule with this protocol matches a packet protocol
    pub fn matches(&self, packet: Protocol) -> bool {
        *self == Protocol::Any || *self == packet
    }
}

/// Traffic direction relative to the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Ingress, Direction::Egress];

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }

    /// The rule field that describes the far side of the traffic. Subject-name
    /// selectors are only valid there.
    pub fn far_side(&self) -> Side {
        match self {
            Direction::Ingress => Side::Source,
            Direction::Egress => Side::Destination,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which subject field of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Source,
    Destination,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Source => "source",
            Side::Destination => "destination",
        }
    }
}

/// A single ACL rule in its wire form.
///
/// Fields stay as text so a stored rule round-trips unchanged; the validator
/// turns them into a [`crate::validate::ParsedRule`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub action: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_port: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination_port: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icmp_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icmp_code: String,
}

impl Rule {
    /// Create an enabled rule with the given action and no match fields.
    pub fn new(action: Action) -> Self {
        Self {
            action: action.as_str().to_string(),
            ..Default::default()
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = state.into();
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }

    pub fn with_source_port(mut self, ports: impl Into<String>) -> Self {
        self.source_port = ports.into();
        self
    }

    pub fn with_destination_port(mut self, ports: impl Into<String>) -> Self {
        self.destination_port = ports.into();
        self
    }

    pub fn with_icmp(mut self, icmp_type: impl Into<String>, icmp_code: impl Into<String>) -> Self {
        self.icmp_type = icmp_type.into();
        self.icmp_code = icmp_code.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Subject field for a side
    pub fn subject(&self, side: Side) -> &str {
        match side {
            Side::Source => &self.source,
            Side::Destination => &self.destination,
        }
    }
}

/// A named access control list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub ingress: Vec<Rule>,
    #[serde(default)]
    pub egress: Vec<Rule>,
}

impl Acl {
    /// Create an empty ACL
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_ingress(mut self, rules: Vec<Rule>) -> Self {
        self.ingress = rules;
        self
    }

    pub fn with_egress(mut self, rules: Vec<Rule>) -> Self {
        self.egress = rules;
        self
    }

    /// Rule list for a direction
    pub fn rules(&self, direction: Direction) -> &[Rule] {
        match direction {
            Direction::Ingress => &self.ingress,
            Direction::Egress => &self.egress,
        }
    }
}

/// Identity of a NIC device: owning instance plus device name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NicId {
    pub instance: String,
    pub device: String,
}

impl NicId {
    pub fn new(instance: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            device: device.into(),
        }
    }
}

impl fmt::Display for NicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instance, self.device)
    }
}

/// An assignment target: a whole network or one NIC
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Network(String),
    Nic(NicId),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Network(name) => write!(f, "network:{}", name),
            Target::Nic(nic) => write!(f, "nic:{}", nic),
        }
    }
}

/// One side of a packet, as seen by the engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    /// Address, if known
    pub ip: Option<IpAddr>,
    /// The NIC this endpoint belongs to, if it is one of ours
    pub nic: Option<NicId>,
    /// Whether the endpoint is local to the target's network
    pub internal: bool,
}

impl Endpoint {
    /// An endpoint outside the network
    pub fn external(ip: IpAddr) -> Self {
        Self {
            ip: Some(ip),
            nic: None,
            internal: false,
        }
    }

    /// An endpoint on the target's network
    pub fn internal(ip: IpAddr) -> Self {
        Self {
            ip: Some(ip),
            nic: None,
            internal: true,
        }
    }

    /// An endpoint that is a known NIC on the target's network
    pub fn nic(nic: NicId, ip: Option<IpAddr>) -> Self {
        Self {
            ip,
            nic: Some(nic),
            internal: true,
        }
    }
}

/// A hypothetical packet to evaluate against a compiled rule set
#[derive(Debug, Clone)]
pub struct Packet {
    pub protocol: Protocol,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub source_port: Option<u16>,
    pub destination_port: Option<u16>,
    pub icmp_type: Option<u8>,
    pub icmp_code: Option<u8>,
}

impl Packet {
    /// TCP packet to a destination port
    pub fn tcp(source: Endpoint, destination: Endpoint, destination_port: u16) -> Self {
        Self::with_ports(Protocol::TCP, source, destination, destination_port)
    }

    /// UDP packet to a destination port
    pub fn udp(source: Endpoint, destination: Endpoint, destination_port: u16) -> Self {
        Self::with_ports(Protocol::UDP, source, destination, destination_port)
    }

    /// ICMP packet of a given protocol family, type and code
    pub fn icmp(
        protocol: Protocol,
        source: Endpoint,
        destination: Endpoint,
        icmp_type: u8,
        icmp_code: u8,
    ) -> Self {
        Self {
            protocol,
            source,
            destination,
            source_port: None,
            destination_port: None,
            icmp_type: Some(icmp_type),
            icmp_code: Some(icmp_code),
        }
    }

    fn with_ports(
        protocol: Protocol,
        source: Endpoint,
        destination: Endpoint,
        destination_port: u16,
    ) -> Self {
        Self {
            protocol,
            source,
            destination,
            source_port: None,
            destination_port: Some(destination_port),
            icmp_type: None,
            icmp_code: None,
        }
    }

    pub fn with_source_port(mut self, port: u16) -> Self {
        self.source_port = Some(port);
        self
    }
}

/// Outcome of evaluating a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// The action taken
    pub action: Action,
    /// ACL owning the matching rule; `None` for the default rule
    pub acl: Option<String>,
    /// Whether the matching rule is flagged for logging
    pub logged: bool,
}
