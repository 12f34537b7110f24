//! Bridge backend.
//!
//! Enforces ACLs at the host/bridge boundary through the host packet filter.
//! Each target gets one chain per direction: the baseline host-service rules
//! managed outside the engine, then drop, reject, allow and the default rule.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::{apply_error, target_slug, Backend};
use crate::compile::{CompiledRule, CompiledRuleSet, EnforcementPlan};
use crate::error::{ApplyErrorKind, Result};
use crate::logs::{tag_acl, LogEntry, LogStream};
use crate::matcher::Subject;
use crate::selector::Capabilities;
use crate::types::{Action, Direction, Protocol, Side, Target};
use crate::validate::PortRange;

/// Default registered name of the bridge backend
pub const BRIDGE_BACKEND: &str = "bridge";

/// Prefix of the log tag the packet filter writes for logged rules
const LOG_PREFIX: &str = "acl-";

/// One packet-filter chain, fully rendered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeChain {
    pub name: String,
    pub rules: Vec<String>,
}

/// Narrow interface to the host packet filter.
#[async_trait]
pub trait FirewallDriver: Send + Sync {
    /// Whether address ranges can be used in rules
    fn supports_ip_ranges(&self) -> bool;

    /// Host-service rules that must stay ahead of ACL output
    fn baseline_rules(&self, target: &Target, direction: Direction) -> Vec<String>;

    /// Replace the given chains in one transaction.
    async fn replace_chains(&self, target: &Target, chains: &[NativeChain]) -> Result<()>;

    /// Delete chains in one transaction. Missing chains are skipped.
    async fn delete_chains(&self, target: &Target, names: &[String]) -> Result<()>;

    /// Packet-filter log lines, oldest first
    fn log_lines(&self) -> Box<dyn Iterator<Item = String> + Send>;
}

/// Bridge backend over a host packet filter
pub struct BridgeBackend {
    name: String,
    driver: Arc<dyn FirewallDriver>,
    applied: Mutex<HashMap<Target, Vec<NativeChain>>>,
}

impl BridgeBackend {
    /// Create a bridge backend with the default name
    pub fn new(driver: Arc<dyn FirewallDriver>) -> Self {
        Self::with_name(BRIDGE_BACKEND, driver)
    }

    /// Create a bridge backend registered under a custom name
    pub fn with_name(name: impl Into<String>, driver: Arc<dyn FirewallDriver>) -> Self {
        Self {
            name: name.into(),
            driver,
            applied: Mutex::new(HashMap::new()),
        }
    }

    /// Chain name for a target and direction
    pub fn chain_name(target: &Target, direction: Direction) -> String {
        let suffix = match direction {
            Direction::Ingress => "in",
            Direction::Egress => "out",
        };
        format!("acl_{}_{}", target_slug(target), suffix)
    }

    /// Render both chains of a plan without touching the host.
    pub fn render(&self, plan: &EnforcementPlan) -> Result<Vec<NativeChain>> {
        Direction::ALL
            .iter()
            .map(|&direction| -> Result<NativeChain> {
                let set = plan.direction(direction);
                let mut rules = self.driver.baseline_rules(&plan.target, direction);
                render_set(set, &plan.network, self.driver.supports_ip_ranges(), &mut rules)
                    .map_err(|msg| apply_error(ApplyErrorKind::Malformed, &self.name, &plan.target, msg))?;
                Ok(NativeChain {
                    name: Self::chain_name(&plan.target, direction),
                    rules,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Backend for BridgeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_selectors: false,
            supports_ip_range_subjects: self.driver.supports_ip_ranges(),
            supports_intra_network_filtering: false,
        }
    }

    async fn apply(&self, plan: &EnforcementPlan) -> Result<()> {
        if plan.is_empty() {
            return self.remove(&plan.target).await;
        }

        let chains = self.render(plan)?;
        if self.applied.lock().get(&plan.target) == Some(&chains) {
            tracing::debug!(target_id = %plan.target, "bridge chains unchanged");
            return Ok(());
        }

        self.driver.replace_chains(&plan.target, &chains).await?;
        tracing::debug!(target_id = %plan.target, chains = chains.len(), "bridge chains replaced");
        self.applied.lock().insert(plan.target.clone(), chains);
        Ok(())
    }

    async fn remove(&self, target: &Target) -> Result<()> {
        // Chain names are derived from the target, so chains left by an
        // earlier process are deleted too.
        let names: Vec<String> = Direction::ALL
            .iter()
            .map(|&direction| Self::chain_name(target, direction))
            .collect();
        self.driver.delete_chains(target, &names).await?;
        self.applied.lock().remove(target);
        Ok(())
    }

    fn fetch_logs(&self, acl: &str) -> Result<LogStream> {
        let acl = acl.to_string();
        let backend = self.name.clone();
        let lines = self.driver.log_lines();
        Ok(Box::new(lines.filter_map(move |line| {
            let record = parse_log_line(&line)?;
            let tag = record.get("rule")?.as_str()?;
            if tag_acl(tag)? != acl {
                return None;
            }
            Some(LogEntry {
                acl: acl.clone(),
                backend: backend.clone(),
                record: Value::Object(record),
            })
        })))
    }
}

/// Parse a packet-filter log line of the form
/// `... acl-<tag> KEY=VALUE KEY=VALUE ...` into a record.
fn parse_log_line(line: &str) -> Option<Map<String, Value>> {
    let mut tokens = line.split_whitespace();
    let tag = tokens.find_map(|t| t.strip_prefix(LOG_PREFIX))?;

    let mut record = Map::new();
    record.insert("rule".to_string(), Value::String(tag.to_string()));
    for token in tokens {
        if let Some((key, value)) = token.split_once('=') {
            record.insert(key.to_string(), Value::String(value.to_string()));
        }
    }
    record.insert("raw".to_string(), Value::String(line.to_string()));
    Some(record)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

/// One way of matching a subject list in a single packet-filter rule
struct Alternative {
    family: Option<Family>,
    expr: String,
}

fn render_set(
    set: &CompiledRuleSet,
    bridge: &str,
    ranges: bool,
    out: &mut Vec<String>,
) -> std::result::Result<(), String> {
    for rule in set.rules() {
        render_rule(rule, bridge, ranges, out)?;
    }
    Ok(())
}

fn render_rule(
    rule: &CompiledRule,
    bridge: &str,
    ranges: bool,
    out: &mut Vec<String>,
) -> std::result::Result<(), String> {
    let sources = alternatives(&rule.source, Side::Source, bridge, ranges)?;
    let destinations = alternatives(&rule.destination, Side::Destination, bridge, ranges)?;
    let protocol_family = match rule.protocol {
        Protocol::ICMP4 => Some(Family::V4),
        Protocol::ICMP6 => Some(Family::V6),
        _ => None,
    };

    let tail = rule_tail(rule);
    for src in &sources {
        for dst in &destinations {
            let families = [protocol_family, src.family, dst.family];
            let mut known = families.iter().flatten();
            if let Some(first) = known.next() {
                if known.any(|f| f != first) {
                    // No packet can match both families.
                    continue;
                }
            }
            let parts: Vec<&str> = [src.expr.as_str(), dst.expr.as_str(), tail.as_str()]
                .into_iter()
                .filter(|p| !p.is_empty())
                .collect();
            out.push(parts.join(" "));
        }
    }
    Ok(())
}

fn alternatives(
    subjects: &[Subject],
    side: Side,
    bridge: &str,
    ranges: bool,
) -> std::result::Result<Vec<Alternative>, String> {
    if subjects.is_empty() {
        return Ok(vec![Alternative {
            family: None,
            expr: String::new(),
        }]);
    }

    let (addr_key, iface_key) = match side {
        Side::Source => ("saddr", "iifname"),
        Side::Destination => ("daddr", "oifname"),
    };
    let mut v4: Vec<String> = Vec::new();
    let mut v6: Vec<String> = Vec::new();
    let mut out = Vec::new();

    for subject in subjects {
        match subject {
            Subject::Net(IpNet::V4(net)) => v4.push(net.to_string()),
            Subject::Net(IpNet::V6(net)) => v6.push(net.to_string()),
            Subject::Range { start, end } => {
                if !ranges {
                    return Err(format!("IP range {}-{} needs a packet filter with range support", start, end));
                }
                let item = format!("{}-{}", start, end);
                if start.is_ipv4() {
                    v4.push(item);
                } else {
                    v6.push(item);
                }
            }
            Subject::Internal => out.push(Alternative {
                family: None,
                expr: format!("{} \"{}\"", iface_key, bridge),
            }),
            Subject::External => out.push(Alternative {
                family: None,
                expr: format!("{} != \"{}\"", iface_key, bridge),
            }),
            Subject::Peer { network, peer, .. } => {
                return Err(format!("peer selector @{}/{} is not supported on a bridge", network, peer));
            }
            Subject::Group { acl, .. } => {
                return Err(format!("subject name {:?} is not supported on a bridge", acl));
            }
        }
    }

    if !v4.is_empty() {
        out.push(Alternative {
            family: Some(Family::V4),
            expr: format!("ip {} {{ {} }}", addr_key, v4.join(", ")),
        });
    }
    if !v6.is_empty() {
        out.push(Alternative {
            family: Some(Family::V6),
            expr: format!("ip6 {} {{ {} }}", addr_key, v6.join(", ")),
        });
    }
    Ok(out)
}

fn port_set(ports: &[PortRange]) -> String {
    let items: Vec<String> = ports
        .iter()
        .map(|r| {
            if r.start == r.end {
                r.start.to_string()
            } else {
                format!("{}-{}", r.start, r.end)
            }
        })
        .collect();
    format!("{{ {} }}", items.join(", "))
}

/// Protocol, port, ICMP, log and verdict part of a rule
fn rule_tail(rule: &CompiledRule) -> String {
    let mut parts: Vec<String> = Vec::new();

    let (l4, icmp) = match rule.protocol {
        Protocol::Any => (None, None),
        Protocol::TCP => (Some("tcp"), None),
        Protocol::UDP => (Some("udp"), None),
        Protocol::ICMP4 => (Some("icmp"), Some("icmp")),
        Protocol::ICMP6 => (Some("ipv6-icmp"), Some("icmpv6")),
    };
    if let Some(l4) = l4 {
        parts.push(format!("meta l4proto {}", l4));
    }
    if rule.protocol.has_ports() {
        let proto = rule.protocol.as_str();
        if !rule.source_ports.is_empty() {
            parts.push(format!("{} sport {}", proto, port_set(&rule.source_ports)));
        }
        if !rule.destination_ports.is_empty() {
            parts.push(format!("{} dport {}", proto, port_set(&rule.destination_ports)));
        }
    }
    if let Some(icmp) = icmp {
        if let Some(t) = rule.icmp_type {
            parts.push(format!("{} type {}", icmp, t));
        }
        if let Some(c) = rule.icmp_code {
            parts.push(format!("{} code {}", icmp, c));
        }
    }
    if rule.logged {
        let tag = rule.log_name().unwrap_or_else(|| "default".to_string());
        parts.push(format!("log prefix \"{}{} \"", LOG_PREFIX, tag));
    }
    parts.push(
        match rule.action {
            Action::Allow => "accept",
            Action::Reject => "reject",
            Action::Drop => "drop",
        }
        .to_string(),
    );
    parts.join(" ")
}

/// In-memory packet filter for tests and dry runs
pub struct MemoryFirewall {
    ranges: bool,
    baseline: Vec<String>,
    chains: Mutex<BTreeMap<String, Vec<String>>>,
    log: Mutex<Vec<String>>,
    fail: Mutex<Option<ApplyErrorKind>>,
    writes: AtomicUsize,
}

impl MemoryFirewall {
    pub fn new() -> Self {
        Self {
            ranges: true,
            baseline: Vec::new(),
            chains: Mutex::new(BTreeMap::new()),
            log: Mutex::new(Vec::new()),
            fail: Mutex::new(None),
            writes: AtomicUsize::new(0),
        }
    }

    /// Whether the simulated filter supports address ranges
    pub fn with_ip_ranges(mut self, ranges: bool) -> Self {
        self.ranges = ranges;
        self
    }

    /// Baseline host-service rules placed at the top of every chain
    pub fn with_baseline(mut self, rules: Vec<String>) -> Self {
        self.baseline = rules;
        self
    }

    /// Append a log line
    pub fn push_log(&self, line: impl Into<String>) {
        self.log.lock().push(line.into());
    }

    /// Make the next write fail with the given kind
    pub fn fail_next(&self, kind: ApplyErrorKind) {
        *self.fail.lock() = Some(kind);
    }

    /// Current rules of a chain
    pub fn chain(&self, name: &str) -> Option<Vec<String>> {
        self.chains.lock().get(name).cloned()
    }

    /// Names of all chains
    pub fn chain_names(&self) -> Vec<String> {
        self.chains.lock().keys().cloned().collect()
    }

    /// Number of successful write transactions
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_fail(&self, target: &Target) -> Result<()> {
        match self.fail.lock().take() {
            Some(kind) => Err(apply_error(kind, "memory-firewall", target, "injected failure")),
            None => Ok(()),
        }
    }
}

impl Default for MemoryFirewall {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FirewallDriver for MemoryFirewall {
    fn supports_ip_ranges(&self) -> bool {
        self.ranges
    }

    fn baseline_rules(&self, _target: &Target, _direction: Direction) -> Vec<String> {
        self.baseline.clone()
    }

    async fn replace_chains(&self, target: &Target, chains: &[NativeChain]) -> Result<()> {
        self.check_fail(target)?;
        let mut state = self.chains.lock();
        for chain in chains {
            state.insert(chain.name.clone(), chain.rules.clone());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_chains(&self, target: &Target, names: &[String]) -> Result<()> {
        self.check_fail(target)?;
        let mut state = self.chains.lock();
        let mut deleted = false;
        for name in names {
            deleted |= state.remove(name).is_some();
        }
        if deleted {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn log_lines(&self) -> Box<dyn Iterator<Item = String> + Send> {
        Box::new(self.log.lock().clone().into_iter())
    }
}
