//! Priority compiler.
//!
//! Merges every ACL in effect on a target into one tiered rule sequence per
//! direction. Tiers are evaluated drop, reject, allow, default; rules inside a
//! tier share an action, so their relative order never changes a decision.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::assignment::AssignmentTable;
use crate::error::{AclError, ResolutionErrorKind, Result};
use crate::matcher::{EndpointMatcher, Subject};
use crate::portgroup::PortGroupIndex;
use crate::selector::{BackendInfo, ResolvedSubject, SelectorResolver};
use crate::types::{Acl, Action, Decision, Direction, Packet, Protocol, RuleState, Side, Target};
use crate::validate::{parse_rule, ParsedRule, PortRange, SubjectSpec};

/// Tier of a compiled rule, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    Drop,
    Reject,
    Allow,
    Default,
}

impl TierKind {
    /// Evaluation order
    pub const ORDER: [TierKind; 4] = [TierKind::Drop, TierKind::Reject, TierKind::Allow, TierKind::Default];

    fn for_action(action: Action) -> Self {
        match action {
            Action::Drop => TierKind::Drop,
            Action::Reject => TierKind::Reject,
            Action::Allow => TierKind::Allow,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TierKind::Drop => "drop",
            TierKind::Reject => "reject",
            TierKind::Allow => "allow",
            TierKind::Default => "default",
        }
    }
}

/// A compiled rule ready for matching and rendering
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompiledRule {
    /// Owning ACL; `None` for the synthesized default rule
    pub acl: Option<String>,
    /// Position in the owning ACL's list for this direction
    pub index: Option<usize>,
    pub action: Action,
    /// Flagged for log retrieval
    pub logged: bool,
    pub protocol: Protocol,
    pub source: Vec<Subject>,
    pub destination: Vec<Subject>,
    pub source_ports: Vec<PortRange>,
    pub destination_ports: Vec<PortRange>,
    pub icmp_type: Option<u8>,
    pub icmp_code: Option<u8>,
}

impl CompiledRule {
    /// The catch-all rule closing every non-empty rule set
    pub fn default_rule(action: Action, logged: bool) -> Self {
        Self {
            acl: None,
            index: None,
            action,
            logged,
            protocol: Protocol::Any,
            source: Vec::new(),
            destination: Vec::new(),
            source_ports: Vec::new(),
            destination_ports: Vec::new(),
            icmp_type: None,
            icmp_code: None,
        }
    }

    /// Stable name of the rule, used by backends as a log tag
    pub fn log_name(&self) -> Option<String> {
        match (&self.acl, self.index) {
            (Some(acl), Some(index)) => Some(format!("{}-{}", acl, index)),
            _ => None,
        }
    }

    /// Check if this rule matches the given packet
    pub fn matches(&self, packet: &Packet) -> bool {
        if !self.protocol.matches(packet.protocol) {
            return false;
        }

        if !ports_match(&self.source_ports, packet.source_port)
            || !ports_match(&self.destination_ports, packet.destination_port)
        {
            return false;
        }

        if self.icmp_type.is_some() && self.icmp_type != packet.icmp_type {
            return false;
        }
        if self.icmp_code.is_some() && self.icmp_code != packet.icmp_code {
            return false;
        }

        self.source.matches(&packet.source) && self.destination.matches(&packet.destination)
    }
}

fn ports_match(ranges: &[PortRange], port: Option<u16>) -> bool {
    if ranges.is_empty() {
        return true;
    }
    port.is_some_and(|p| ranges.iter().any(|r| r.contains(p)))
}

/// Rules sharing one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tier {
    pub kind: TierKind,
    pub rules: Vec<CompiledRule>,
}

/// Tiered rules of one target in one direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompiledRuleSet {
    pub target: Target,
    pub direction: Direction,
    /// Empty when no ACL is in effect; otherwise drop, reject, allow, default
    pub tiers: Vec<Tier>,
}

impl CompiledRuleSet {
    /// A rule set applying no policy
    pub fn empty(target: Target, direction: Direction) -> Self {
        Self {
            target,
            direction,
            tiers: Vec::new(),
        }
    }

    /// Whether no policy applies
    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Rules of a tier
    pub fn tier(&self, kind: TierKind) -> &[CompiledRule] {
        self.tiers
            .iter()
            .find(|t| t.kind == kind)
            .map(|t| t.rules.as_slice())
            .unwrap_or(&[])
    }

    /// All rules in evaluation order
    pub fn rules(&self) -> impl Iterator<Item = &CompiledRule> {
        self.tiers.iter().flat_map(|t| t.rules.iter())
    }

    /// Number of rules, default included
    pub fn rule_count(&self) -> usize {
        self.tiers.iter().map(|t| t.rules.len()).sum()
    }

    /// Rules flagged for log retrieval
    pub fn logged_rules(&self) -> impl Iterator<Item = &CompiledRule> {
        self.rules().filter(|r| r.logged)
    }

    /// Names of ACLs referenced as subject-name selectors
    pub fn referenced_groups(&self) -> BTreeSet<&str> {
        self.rules()
            .flat_map(|r| r.source.iter().chain(r.destination.iter()))
            .filter_map(|s| match s {
                Subject::Group { acl, .. } => Some(acl.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Evaluate a packet. `None` when no policy applies.
    pub fn decide(&self, packet: &Packet) -> Option<Decision> {
        self.rules().find(|r| r.matches(packet)).map(|r| Decision {
            action: r.action,
            acl: r.acl.clone(),
            logged: r.logged,
        })
    }

    /// Canonical JSON rendering; identical input renders identically.
    pub fn render(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Both directions of one target: the unit a backend applies
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnforcementPlan {
    pub target: Target,
    /// Network the target lives on
    pub network: String,
    pub ingress: CompiledRuleSet,
    pub egress: CompiledRuleSet,
}

impl EnforcementPlan {
    pub fn new(
        target: Target,
        network: impl Into<String>,
        ingress: CompiledRuleSet,
        egress: CompiledRuleSet,
    ) -> Self {
        Self {
            target,
            network: network.into(),
            ingress,
            egress,
        }
    }

    /// Rule set for a direction
    pub fn direction(&self, direction: Direction) -> &CompiledRuleSet {
        match direction {
            Direction::Ingress => &self.ingress,
            Direction::Egress => &self.egress,
        }
    }

    /// Whether neither direction carries policy
    pub fn is_empty(&self) -> bool {
        self.ingress.is_empty() && self.egress.is_empty()
    }
}

/// Everything the compiler reads
pub struct CompileContext<'a> {
    pub acls: &'a BTreeMap<String, Acl>,
    pub table: &'a AssignmentTable,
    pub index: &'a PortGroupIndex,
    pub resolver: &'a SelectorResolver,
    pub backend: &'a BackendInfo,
    pub global_default: Action,
}

/// Compile the rule set of `target` for one direction.
pub fn compile(target: &Target, direction: Direction, ctx: &CompileContext<'_>) -> Result<CompiledRuleSet> {
    let names = ctx.table.effective_acls(target);
    if names.is_empty() {
        return Ok(CompiledRuleSet::empty(target.clone(), direction));
    }

    let mut buckets: BTreeMap<TierKind, Vec<CompiledRule>> = BTreeMap::new();

    for name in &names {
        let acl = ctx
            .acls
            .get(name)
            .ok_or_else(|| compile_error(target, format!("assigned ACL {:?} does not exist", name)))?;

        for (index, rule) in acl.rules(direction).iter().enumerate() {
            let parsed = parse_rule(&acl.name, direction, index, rule).map_err(|e| {
                compile_error(target, format!("stored rule no longer validates: {}", e))
            })?;
            if parsed.state == RuleState::Disabled {
                continue;
            }

            let compiled = compile_rule(target, direction, &acl.name, index, &parsed, ctx)?;
            buckets
                .entry(TierKind::for_action(compiled.action))
                .or_default()
                .push(compiled);
        }
    }

    let (default_action, default_logged) = ctx
        .table
        .effective_default(target, direction, ctx.global_default);

    let tiers = TierKind::ORDER
        .iter()
        .map(|&kind| Tier {
            kind,
            rules: if kind == TierKind::Default {
                vec![CompiledRule::default_rule(default_action, default_logged)]
            } else {
                buckets.remove(&kind).unwrap_or_default()
            },
        })
        .collect();

    Ok(CompiledRuleSet {
        target: target.clone(),
        direction,
        tiers,
    })
}

/// Compile both directions of a target.
pub fn compile_plan(target: &Target, ctx: &CompileContext<'_>) -> Result<EnforcementPlan> {
    let network = ctx
        .table
        .network_of(target)
        .ok_or_else(|| compile_error(target, "target is not attached to a known network".to_string()))?;
    Ok(EnforcementPlan::new(
        target.clone(),
        network,
        compile(target, Direction::Ingress, ctx)?,
        compile(target, Direction::Egress, ctx)?,
    ))
}

fn compile_rule(
    target: &Target,
    direction: Direction,
    acl: &str,
    index: usize,
    rule: &ParsedRule,
    ctx: &CompileContext<'_>,
) -> Result<CompiledRule> {
    let mut sides: [Vec<Subject>; 2] = [Vec::new(), Vec::new()];
    for (slot, side) in sides.iter_mut().zip([Side::Source, Side::Destination]) {
        for (text, spec) in rule.subjects(side) {
            if *spec == SubjectSpec::Internal
                && side == direction.far_side()
                && rule.action != Action::Allow
                && !ctx.backend.capabilities.supports_intra_network_filtering
            {
                return Err(AclError::Resolution {
                    kind: ResolutionErrorKind::MissingCapability,
                    selector: text.clone(),
                    backend: ctx.backend.name.clone(),
                    message: format!(
                        "backend cannot filter traffic inside the network, so {} rules on {} cannot be enforced",
                        rule.action, text
                    ),
                });
            }

            let resolved = ctx.resolver.resolve_spec(text, spec, direction, side, ctx.backend)?;
            slot.push(substitute(target, resolved, ctx)?);
        }
    }
    let [source, destination] = sides;

    Ok(CompiledRule {
        acl: Some(acl.to_string()),
        index: Some(index),
        action: rule.action,
        logged: rule.state == RuleState::Logged,
        protocol: rule.protocol,
        source,
        destination,
        source_ports: rule.source_ports.clone(),
        destination_ports: rule.destination_ports.clone(),
        icmp_type: rule.icmp_type,
        icmp_code: rule.icmp_code,
    })
}

/// Turn a resolved selector into a concrete subject, reading live group
/// membership from the index.
fn substitute(target: &Target, resolved: ResolvedSubject, ctx: &CompileContext<'_>) -> Result<Subject> {
    Ok(match resolved {
        ResolvedSubject::Net(net) => Subject::Net(net),
        ResolvedSubject::Range(start, end) => Subject::Range { start, end },
        ResolvedSubject::Internal => Subject::Internal,
        ResolvedSubject::External => Subject::External,
        ResolvedSubject::Peer {
            network,
            peer,
            addresses,
        } => Subject::Peer {
            network,
            peer,
            addresses,
        },
        ResolvedSubject::GroupReference(acl) => {
            if !ctx.acls.contains_key(&acl) {
                return Err(compile_error(
                    target,
                    format!("subject name references ACL {:?} which does not exist", acl),
                ));
            }
            let members = ctx.index.members_of(&acl);
            Subject::Group { acl, members }
        }
    })
}

fn compile_error(target: &Target, message: String) -> AclError {
    tracing::error!(target_id = %target, %message, "ACL state diverged from assignments");
    AclError::Compile {
        target: target.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::{Assignment, NetworkEntry, NicEntry};
    use crate::selector::{Capabilities, PeerTable};
    use crate::types::{Endpoint, NicId, Rule};
    use std::sync::Arc;

    struct Fixture {
        acls: BTreeMap<String, Acl>,
        table: AssignmentTable,
        index: PortGroupIndex,
        resolver: SelectorResolver,
        backend: BackendInfo,
    }

    impl Fixture {
        fn new(network_acls: &[&str]) -> Self {
            let mut table = AssignmentTable::new();
            table.set_network(
                "net0",
                NetworkEntry {
                    backend: "ovn".into(),
                    assignment: Assignment::new(network_acls.iter().copied()),
                },
            );
            Self {
                acls: BTreeMap::new(),
                table,
                index: PortGroupIndex::new(),
                resolver: SelectorResolver::new(Arc::new(PeerTable::new()), 64),
                backend: BackendInfo::new("ovn", Capabilities::all()),
            }
        }

        fn acl(mut self, acl: Acl) -> Self {
            self.acls.insert(acl.name.clone(), acl);
            self
        }

        fn nic(mut self, instance: &str, assignment: Assignment) -> Self {
            let nic = NicId::new(instance, "eth0");
            self.table.set_nic(
                nic.clone(),
                NicEntry {
                    network: "net0".into(),
                    assignment,
                },
            );
            self.index.on_assignment_changed(&Target::Nic(nic), &self.table);
            self
        }

        fn ctx(&self) -> CompileContext<'_> {
            CompileContext {
                acls: &self.acls,
                table: &self.table,
                index: &self.index,
                resolver: &self.resolver,
                backend: &self.backend,
                global_default: Action::Reject,
            }
        }

        fn compile(&self, target: &Target, direction: Direction) -> Result<CompiledRuleSet> {
            compile(target, direction, &self.ctx())
        }
    }

    fn net0() -> Target {
        Target::Network("net0".into())
    }

    fn c1() -> Target {
        Target::Nic(NicId::new("c1", "eth0"))
    }

    fn web() -> Acl {
        Acl::new("web").with_ingress(vec![Rule::new(Action::Allow)
            .with_protocol("tcp")
            .with_source("@internal")
            .with_destination_port("80,443")])
    }

    fn internal() -> Endpoint {
        Endpoint::internal("10.0.0.2".parse().unwrap())
    }

    fn local() -> Endpoint {
        Endpoint::internal("10.0.0.10".parse().unwrap())
    }

    #[test]
    fn test_web_scenario() {
        let f = Fixture::new(&["web"]).acl(web());
        let set = f.compile(&net0(), Direction::Ingress).unwrap();

        let d = set.decide(&Packet::tcp(internal(), local(), 80)).unwrap();
        assert_eq!(d.action, Action::Allow);
        assert_eq!(d.acl.as_deref(), Some("web"));

        let d = set.decide(&Packet::tcp(internal(), local(), 8080)).unwrap();
        assert_eq!(d.action, Action::Reject);
        assert_eq!(d.acl, None);

        let d = set.decide(&Packet::udp(internal(), local(), 80)).unwrap();
        assert_eq!(d.action, Action::Reject);
    }

    #[test]
    fn test_drop_tier_wins_regardless_of_order() {
        let block = Acl::new("block-acl").with_ingress(vec![Rule::new(Action::Drop).with_state("enabled")]);
        for order in [["web", "block-acl"], ["block-acl", "web"]] {
            let f = Fixture::new(&[])
                .acl(web())
                .acl(block.clone())
                .nic("c1", Assignment::new(order));
            let set = f.compile(&c1(), Direction::Ingress).unwrap();
            for packet in [
                Packet::tcp(internal(), local(), 80),
                Packet::tcp(internal(), local(), 8080),
                Packet::udp(Endpoint::external("8.8.8.8".parse().unwrap()), local(), 53),
            ] {
                assert_eq!(set.decide(&packet).unwrap().action, Action::Drop);
            }
        }
    }

    #[test]
    fn test_declaration_order_does_not_matter() {
        let rules = vec![
            Rule::new(Action::Allow).with_protocol("tcp"),
            Rule::new(Action::Reject).with_protocol("tcp").with_destination_port("22"),
        ];
        let mut reversed = rules.clone();
        reversed.reverse();

        let a = Fixture::new(&["x"]).acl(Acl::new("x").with_ingress(rules));
        let b = Fixture::new(&["x"]).acl(Acl::new("x").with_ingress(reversed));
        let packet = Packet::tcp(internal(), local(), 22);
        let da = a.compile(&net0(), Direction::Ingress).unwrap().decide(&packet).unwrap();
        let db = b.compile(&net0(), Direction::Ingress).unwrap().decide(&packet).unwrap();
        assert_eq!(da.action, Action::Reject);
        assert_eq!(db.action, Action::Reject);
    }

    #[test]
    fn test_empty_assignment_yields_no_policy() {
        let f = Fixture::new(&[]).acl(web());
        let set = f.compile(&net0(), Direction::Ingress).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.rule_count(), 0);
        assert!(set.decide(&Packet::tcp(internal(), local(), 80)).is_none());
    }

    #[test]
    fn test_default_tier_always_present() {
        let f = Fixture::new(&["web"]).acl(web());
        let egress = f.compile(&net0(), Direction::Egress).unwrap();
        assert_eq!(egress.tiers.len(), 4);
        assert_eq!(egress.rule_count(), 1);
        assert_eq!(egress.tier(TierKind::Default)[0].action, Action::Reject);
    }

    #[test]
    fn test_nic_default_overrides_network() {
        let mut f = Fixture::new(&["web"]).acl(web());
        f.table.set_network(
            "net0",
            NetworkEntry {
                backend: "ovn".into(),
                assignment: Assignment::new(["web"]).with_default_action(Direction::Ingress, Action::Drop),
            },
        );
        let f = f.nic(
            "c1",
            Assignment::default().with_default_action(Direction::Ingress, Action::Allow),
        );

        let packet = Packet::tcp(internal(), local(), 8080);
        let network = f.compile(&net0(), Direction::Ingress).unwrap();
        assert_eq!(network.decide(&packet).unwrap().action, Action::Drop);
        let nic = f.compile(&c1(), Direction::Ingress).unwrap();
        assert_eq!(nic.decide(&packet).unwrap().action, Action::Allow);
    }

    #[test]
    fn test_disabled_rules_skipped_and_logged_flagged() {
        let acl = Acl::new("x").with_ingress(vec![
            Rule::new(Action::Drop).with_state("disabled"),
            Rule::new(Action::Allow).with_state("logged").with_protocol("udp"),
        ]);
        let f = Fixture::new(&["x"]).acl(acl);
        let set = f.compile(&net0(), Direction::Ingress).unwrap();
        assert!(set.tier(TierKind::Drop).is_empty());
        let logged: Vec<_> = set.logged_rules().collect();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].log_name().as_deref(), Some("x-1"));

        let d = set.decide(&Packet::udp(internal(), local(), 53)).unwrap();
        assert_eq!(d.action, Action::Allow);
        assert!(d.logged);
    }

    #[test]
    fn test_group_reference_uses_live_membership() {
        let db = Acl::new("db").with_ingress(vec![Rule::new(Action::Allow).with_source("web")]);
        let f = Fixture::new(&[])
            .acl(web())
            .acl(db)
            .nic("c1", Assignment::new(["db"]))
            .nic("c2", Assignment::new(["web"]));

        let c2 = Endpoint::nic(NicId::new("c2", "eth0"), None);
        let c3 = Endpoint::nic(NicId::new("c3", "eth0"), None);
        let set = f.compile(&c1(), Direction::Ingress).unwrap();
        assert_eq!(set.referenced_groups(), BTreeSet::from(["web"]));
        assert_eq!(set.decide(&Packet::udp(c2.clone(), local(), 1)).unwrap().action, Action::Allow);
        assert_eq!(set.decide(&Packet::udp(c3.clone(), local(), 1)).unwrap().action, Action::Reject);

        // c3 joins web; the rule text is untouched
        let f = f.nic("c3", Assignment::new(["web"]));
        let set = f.compile(&c1(), Direction::Ingress).unwrap();
        assert_eq!(set.decide(&Packet::udp(c3, local(), 1)).unwrap().action, Action::Allow);
    }

    #[test]
    fn test_recompile_is_byte_identical() {
        let db = Acl::new("db").with_ingress(vec![
            Rule::new(Action::Allow).with_source("web, 10.0.0.0/8"),
            Rule::new(Action::Drop).with_protocol("icmp4").with_icmp("8", "0"),
        ]);
        let f = Fixture::new(&["web"])
            .acl(web())
            .acl(db)
            .nic("c1", Assignment::new(["db"]))
            .nic("c2", Assignment::new(["web"]));
        let first = f.compile(&c1(), Direction::Ingress).unwrap().render().unwrap();
        let second = f.compile(&c1(), Direction::Ingress).unwrap().render().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_acl_is_compile_error() {
        let f = Fixture::new(&["ghost"]);
        let err = f.compile(&net0(), Direction::Ingress).unwrap_err();
        assert!(matches!(err, AclError::Compile { .. }), "got: {}", err);
    }

    #[test]
    fn test_unresolved_peer_fails() {
        let acl = Acl::new("x").with_ingress(vec![Rule::new(Action::Allow).with_source("@uplink/dc2")]);
        let f = Fixture::new(&["x"]).acl(acl);
        let err = f.compile(&net0(), Direction::Ingress).unwrap_err();
        assert!(err.to_string().contains("selector unresolved"), "got: {}", err);
    }

    #[test]
    fn test_intra_network_filtering_capability() {
        let acl = Acl::new("x").with_ingress(vec![
            Rule::new(Action::Drop).with_source("@internal"),
        ]);
        let mut f = Fixture::new(&["x"]).acl(acl);
        assert!(f.compile(&net0(), Direction::Ingress).is_ok());

        f.backend = BackendInfo::new("bridge", Capabilities::default());
        let err = f.compile(&net0(), Direction::Ingress).unwrap_err();
        assert!(matches!(
            err,
            AclError::Resolution { kind: ResolutionErrorKind::MissingCapability, .. }
        ));

        // allow rules on @internal stay acceptable
        let acl = Acl::new("x").with_ingress(vec![Rule::new(Action::Allow).with_source("@internal")]);
        let f = f.acl(acl);
        assert!(f.compile(&net0(), Direction::Ingress).is_ok());
    }

    #[test]
    fn test_icmp_matching() {
        let acl = Acl::new("x").with_ingress(vec![
            Rule::new(Action::Allow).with_protocol("icmp4").with_icmp("8", ""),
        ]);
        let f = Fixture::new(&["x"]).acl(acl);
        let set = f.compile(&net0(), Direction::Ingress).unwrap();
        let echo = Packet::icmp(Protocol::ICMP4, internal(), local(), 8, 0);
        let unreachable = Packet::icmp(Protocol::ICMP4, internal(), local(), 3, 1);
        assert_eq!(set.decide(&echo).unwrap().action, Action::Allow);
        assert_eq!(set.decide(&unreachable).unwrap().action, Action::Reject);
    }
}
