//! Overlay backend.
//!
//! Translates rule sets into the overlay control plane's ACL records. Network
//! targets attach to the logical switch, NIC targets to a per-NIC port group.
//! Subject-name selectors become port groups holding the member ports.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use super::{apply_error, escape_name, target_slug, Backend};
use crate::compile::{CompiledRule, EnforcementPlan, TierKind};
use crate::error::{ApplyErrorKind, Result};
use crate::logs::{tag_acl, LogEntry, LogStream};
use crate::matcher::{range_to_cidrs, Subject};
use crate::selector::Capabilities;
use crate::types::{Action, Direction, NicId, Protocol, Side, Target};
use crate::validate::PortRange;

/// Default registered name of the overlay backend
pub const OVERLAY_BACKEND: &str = "ovn";

const PRIORITY_DROP: u16 = 1300;
const PRIORITY_REJECT: u16 = 1200;
const PRIORITY_ALLOW: u16 = 1100;
const PRIORITY_DEFAULT: u16 = 100;

/// Raises a NIC's records above every switch record. A NIC plan already
/// contains its network's ACLs, so it replaces the switch plan for that port.
const NIC_PRIORITY_OFFSET: u16 = 2000;

/// A named set of logical ports
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortGroupDef {
    pub name: String,
    pub members: Vec<String>,
}

/// Where a target's ACL records are attached
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachPoint {
    /// Logical switch of a whole network
    Switch(String),
    /// Port group holding a single NIC's port
    PortGroup(PortGroupDef),
}

impl AttachPoint {
    pub fn name(&self) -> &str {
        match self {
            AttachPoint::Switch(name) => name,
            AttachPoint::PortGroup(group) => &group.name,
        }
    }
}

/// One overlay ACL record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlayAcl {
    /// `to-lport` or `from-lport`
    pub direction: String,
    pub priority: u16,
    pub match_expr: String,
    /// `allow-related`, `reject` or `drop`
    pub action: String,
    pub log: bool,
    /// Log name; set only on logged records
    pub name: Option<String>,
}

/// Everything a target needs, written in one control-plane transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlayTransaction {
    pub attach: AttachPoint,
    /// Subject-name port groups, created or updated
    pub port_groups: Vec<PortGroupDef>,
    /// Full ACL list of the attach point, replacing the previous one
    pub acls: Vec<OverlayAcl>,
    /// Subject-name port groups no longer referenced by any target, deleted
    /// in the same transaction
    pub removed_port_groups: Vec<String>,
}

/// Narrow interface to the overlay control plane.
#[async_trait]
pub trait OverlayController: Send + Sync {
    /// Commit a transaction atomically.
    async fn transact(&self, target: &Target, txn: &OverlayTransaction) -> Result<()>;

    /// Drop every ACL record of an attach point, the point itself for port
    /// groups, and the given subject-name port groups. Succeeds when nothing
    /// is there.
    async fn clear(&self, target: &Target, attach: &AttachPoint, port_groups: &[String]) -> Result<()>;

    /// ACL log records, oldest first. Each carries the record `name`.
    fn log_records(&self) -> Box<dyn Iterator<Item = Value> + Send>;
}

/// Overlay backend over a control-plane controller
pub struct OverlayBackend {
    name: String,
    controller: Arc<dyn OverlayController>,
    applied: Mutex<HashMap<Target, OverlayTransaction>>,
    /// Serializes commits so port group references stay consistent
    commit: tokio::sync::Mutex<()>,
}

impl OverlayBackend {
    pub fn new(controller: Arc<dyn OverlayController>) -> Self {
        Self::with_name(OVERLAY_BACKEND, controller)
    }

    pub fn with_name(name: impl Into<String>, controller: Arc<dyn OverlayController>) -> Self {
        Self {
            name: name.into(),
            controller,
            applied: Mutex::new(HashMap::new()),
            commit: tokio::sync::Mutex::new(()),
        }
    }

    /// Logical port name of a NIC
    pub fn port_name(nic: &NicId) -> String {
        format!("{}-{}", nic.instance, nic.device)
    }

    /// Port group carrying the members of an ACL's subject name
    pub fn acl_port_group(acl: &str) -> String {
        format!("pg_acl_{}", escape_name(acl))
    }

    fn attach_point(target: &Target) -> AttachPoint {
        match target {
            Target::Network(name) => AttachPoint::Switch(format!("ls_{}", escape_name(name))),
            Target::Nic(nic) => AttachPoint::PortGroup(PortGroupDef {
                name: format!("pg_{}", target_slug(target)),
                members: vec![Self::port_name(nic)],
            }),
        }
    }

    /// Build the transaction for a plan without touching the control plane.
    pub fn render(&self, plan: &EnforcementPlan) -> Result<OverlayTransaction> {
        let attach = Self::attach_point(&plan.target);
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut acls = Vec::new();

        for direction in Direction::ALL {
            let set = plan.direction(direction);
            for tier in &set.tiers {
                for rule in &tier.rules {
                    let match_expr = rule_match(rule, direction, &attach, &plan.network, &mut groups)
                        .map_err(|msg| apply_error(ApplyErrorKind::Malformed, &self.name, &plan.target, msg))?;
                    acls.push(OverlayAcl {
                        direction: match direction {
                            Direction::Ingress => "to-lport",
                            Direction::Egress => "from-lport",
                        }
                        .to_string(),
                        priority: priority(tier.kind, &attach),
                        match_expr,
                        action: match rule.action {
                            Action::Allow => "allow-related",
                            Action::Reject => "reject",
                            Action::Drop => "drop",
                        }
                        .to_string(),
                        log: rule.logged,
                        name: rule.logged.then(|| {
                            rule.log_name()
                                .unwrap_or_else(|| format!("default-{}", target_slug(&plan.target)))
                        }),
                    });
                }
            }
        }

        Ok(OverlayTransaction {
            attach,
            port_groups: groups
                .into_iter()
                .map(|(name, members)| PortGroupDef { name, members })
                .collect(),
            acls,
            removed_port_groups: Vec::new(),
        })
    }

    /// Subject-name port groups `target` uses today that no other target
    /// will use once `keep` is in place.
    fn orphaned_groups(&self, target: &Target, keep: &[PortGroupDef]) -> Vec<String> {
        let applied = self.applied.lock();
        let Some(previous) = applied.get(target) else {
            return Vec::new();
        };
        previous
            .port_groups
            .iter()
            .map(|group| &group.name)
            .filter(|name| !keep.iter().any(|group| &group.name == *name))
            .filter(|name| {
                !applied
                    .iter()
                    .any(|(other, txn)| other != target && txn.port_groups.iter().any(|g| &g.name == *name))
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Backend for OverlayBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    async fn apply(&self, plan: &EnforcementPlan) -> Result<()> {
        if plan.is_empty() {
            return self.remove(&plan.target).await;
        }

        let mut txn = self.render(plan)?;
        let _commit = self.commit.lock().await;
        if self.applied.lock().get(&plan.target) == Some(&txn) {
            tracing::debug!(target_id = %plan.target, "overlay ACLs unchanged");
            return Ok(());
        }

        txn.removed_port_groups = self.orphaned_groups(&plan.target, &txn.port_groups);
        self.controller.transact(&plan.target, &txn).await?;
        tracing::debug!(
            target_id = %plan.target,
            attach = txn.attach.name(),
            acls = txn.acls.len(),
            removed_port_groups = txn.removed_port_groups.len(),
            "overlay transaction committed"
        );
        txn.removed_port_groups.clear();
        self.applied.lock().insert(plan.target.clone(), txn);
        Ok(())
    }

    async fn remove(&self, target: &Target) -> Result<()> {
        // Names are derived from the target, so records left by an earlier
        // process are found too.
        let attach = Self::attach_point(target);
        let _commit = self.commit.lock().await;
        let orphans = self.orphaned_groups(target, &[]);
        self.controller.clear(target, &attach, &orphans).await?;
        self.applied.lock().remove(target);
        Ok(())
    }

    fn fetch_logs(&self, acl: &str) -> Result<LogStream> {
        let acl = acl.to_string();
        let backend = self.name.clone();
        let records = self.controller.log_records();
        Ok(Box::new(records.filter_map(move |record| {
            let name = record.get("name")?.as_str()?;
            if tag_acl(name)? != acl {
                return None;
            }
            Some(LogEntry {
                acl: acl.clone(),
                backend: backend.clone(),
                record,
            })
        })))
    }
}

fn priority(kind: TierKind, attach: &AttachPoint) -> u16 {
    let base = match kind {
        TierKind::Drop => PRIORITY_DROP,
        TierKind::Reject => PRIORITY_REJECT,
        TierKind::Allow => PRIORITY_ALLOW,
        TierKind::Default => PRIORITY_DEFAULT,
    };
    match attach {
        AttachPoint::Switch(_) => base,
        AttachPoint::PortGroup(_) => base + NIC_PRIORITY_OFFSET,
    }
}

fn rule_match(
    rule: &CompiledRule,
    direction: Direction,
    attach: &AttachPoint,
    network: &str,
    groups: &mut BTreeMap<String, Vec<String>>,
) -> std::result::Result<String, String> {
    let mut clauses: Vec<String> = Vec::new();

    if let AttachPoint::PortGroup(group) = attach {
        let port = match direction {
            Direction::Ingress => "outport",
            Direction::Egress => "inport",
        };
        clauses.push(format!("{} == @{}", port, group.name));
    }

    for side in [Side::Source, Side::Destination] {
        let subjects = match side {
            Side::Source => &rule.source,
            Side::Destination => &rule.destination,
        };
        if let Some(expr) = side_match(subjects, side, network, groups)? {
            clauses.push(expr);
        }
    }

    match rule.protocol {
        Protocol::Any => {}
        Protocol::TCP | Protocol::UDP => {
            let proto = rule.protocol.as_str();
            clauses.push(proto.to_string());
            if !rule.source_ports.is_empty() {
                clauses.push(port_match(&format!("{}.src", proto), &rule.source_ports));
            }
            if !rule.destination_ports.is_empty() {
                clauses.push(port_match(&format!("{}.dst", proto), &rule.destination_ports));
            }
        }
        Protocol::ICMP4 | Protocol::ICMP6 => {
            let proto = rule.protocol.as_str();
            clauses.push(proto.to_string());
            if let Some(t) = rule.icmp_type {
                clauses.push(format!("{}.type == {}", proto, t));
            }
            if let Some(c) = rule.icmp_code {
                clauses.push(format!("{}.code == {}", proto, c));
            }
        }
    }

    if clauses.is_empty() {
        return Ok("1".to_string());
    }
    Ok(clauses.join(" && "))
}

/// Match expression of one subject list; `None` when the list matches all.
fn side_match(
    subjects: &[Subject],
    side: Side,
    network: &str,
    groups: &mut BTreeMap<String, Vec<String>>,
) -> std::result::Result<Option<String>, String> {
    if subjects.is_empty() {
        return Ok(None);
    }

    let (field, port) = match side {
        Side::Source => ("src", "inport"),
        Side::Destination => ("dst", "outport"),
    };
    let internal_set = |family: &str| format!("$as_{}_internal_{}", escape_name(network), family);

    let mut v4: Vec<String> = Vec::new();
    let mut v6: Vec<String> = Vec::new();
    let mut alternatives: Vec<String> = Vec::new();

    for subject in subjects {
        match subject {
            Subject::Net(net) => push_net(net, &mut v4, &mut v6),
            Subject::Range { start, end } => {
                let cidrs = range_to_cidrs(start, end);
                if cidrs.is_empty() {
                    return Err(format!("IP range {}-{} cannot be expressed", start, end));
                }
                for net in &cidrs {
                    push_net(net, &mut v4, &mut v6);
                }
            }
            Subject::Peer { addresses, .. } => {
                for net in addresses {
                    push_net(net, &mut v4, &mut v6);
                }
            }
            Subject::Internal => {
                alternatives.push(format!("ip4.{} == {}", field, internal_set("ip4")));
                alternatives.push(format!("ip6.{} == {}", field, internal_set("ip6")));
            }
            Subject::External => {
                alternatives.push(format!("ip4.{} != {}", field, internal_set("ip4")));
                alternatives.push(format!("ip6.{} != {}", field, internal_set("ip6")));
            }
            Subject::Group { acl, members } => {
                let name = OverlayBackend::acl_port_group(acl);
                groups
                    .entry(name.clone())
                    .or_insert_with(|| members.iter().map(OverlayBackend::port_name).collect());
                alternatives.push(format!("{} == @{}", port, name));
            }
        }
    }

    if !v4.is_empty() {
        alternatives.push(format!("ip4.{} == {{{}}}", field, v4.join(", ")));
    }
    if !v6.is_empty() {
        alternatives.push(format!("ip6.{} == {{{}}}", field, v6.join(", ")));
    }

    Ok(Some(if alternatives.is_empty() {
        // e.g. a peer with no addresses: the list matches nothing
        "0".to_string()
    } else if alternatives.len() == 1 {
        alternatives.remove(0)
    } else {
        format!("({})", alternatives.join(" || "))
    }))
}

fn push_net(net: &IpNet, v4: &mut Vec<String>, v6: &mut Vec<String>) {
    match net {
        IpNet::V4(n) => v4.push(n.to_string()),
        IpNet::V6(n) => v6.push(n.to_string()),
    }
}

fn port_match(field: &str, ports: &[PortRange]) -> String {
    let mut singles: Vec<String> = Vec::new();
    let mut alternatives: Vec<String> = Vec::new();
    for range in ports {
        if range.start == range.end {
            singles.push(range.start.to_string());
        } else {
            alternatives.push(format!("({} >= {} && {} <= {})", field, range.start, field, range.end));
        }
    }
    if !singles.is_empty() {
        alternatives.insert(0, format!("{} == {{{}}}", field, singles.join(", ")));
    }
    if alternatives.len() == 1 {
        alternatives.remove(0)
    } else {
        format!("({})", alternatives.join(" || "))
    }
}

/// In-memory control plane for tests and dry runs
pub struct MemoryController {
    acls: Mutex<BTreeMap<String, Vec<OverlayAcl>>>,
    port_groups: Mutex<BTreeMap<String, BTreeSet<String>>>,
    log: Mutex<Vec<Value>>,
    fail: Mutex<Option<ApplyErrorKind>>,
    transactions: AtomicUsize,
}

impl MemoryController {
    pub fn new() -> Self {
        Self {
            acls: Mutex::new(BTreeMap::new()),
            port_groups: Mutex::new(BTreeMap::new()),
            log: Mutex::new(Vec::new()),
            fail: Mutex::new(None),
            transactions: AtomicUsize::new(0),
        }
    }

    /// ACL records attached to a switch or port group
    pub fn acls_on(&self, attach: &str) -> Vec<OverlayAcl> {
        self.acls.lock().get(attach).cloned().unwrap_or_default()
    }

    /// Members of a port group
    pub fn port_group(&self, name: &str) -> Option<BTreeSet<String>> {
        self.port_groups.lock().get(name).cloned()
    }

    /// Names of all port groups
    pub fn port_group_names(&self) -> Vec<String> {
        self.port_groups.lock().keys().cloned().collect()
    }

    /// Append a log record
    pub fn push_log(&self, record: Value) {
        self.log.lock().push(record);
    }

    /// Make the next transaction fail with the given kind
    pub fn fail_next(&self, kind: ApplyErrorKind) {
        *self.fail.lock() = Some(kind);
    }

    /// Number of committed transactions
    pub fn transactions(&self) -> usize {
        self.transactions.load(Ordering::SeqCst)
    }

    fn check_fail(&self, target: &Target) -> Result<()> {
        match self.fail.lock().take() {
            Some(kind) => Err(apply_error(kind, "memory-controller", target, "injected failure")),
            None => Ok(()),
        }
    }
}

impl Default for MemoryController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OverlayController for MemoryController {
    async fn transact(&self, target: &Target, txn: &OverlayTransaction) -> Result<()> {
        self.check_fail(target)?;
        let mut groups = self.port_groups.lock();
        let mut acls = self.acls.lock();
        if let AttachPoint::PortGroup(group) = &txn.attach {
            groups.insert(group.name.clone(), group.members.iter().cloned().collect());
        }
        for group in &txn.port_groups {
            groups.insert(group.name.clone(), group.members.iter().cloned().collect());
        }
        for name in &txn.removed_port_groups {
            groups.remove(name);
        }
        acls.insert(txn.attach.name().to_string(), txn.acls.clone());
        self.transactions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self, target: &Target, attach: &AttachPoint, port_groups: &[String]) -> Result<()> {
        self.check_fail(target)?;
        let mut groups = self.port_groups.lock();
        let mut changed = self.acls.lock().remove(attach.name()).is_some();
        if let AttachPoint::PortGroup(group) = attach {
            changed |= groups.remove(&group.name).is_some();
        }
        for name in port_groups {
            changed |= groups.remove(name).is_some();
        }
        if changed {
            self.transactions.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn log_records(&self) -> Box<dyn Iterator<Item = Value> + Send> {
        Box::new(self.log.lock().clone().into_iter())
    }
}
