//! ACL assignments on networks and NICs.
//!
//! The assignment table is the single source of truth for which ACLs apply
//! where. The port group index and the compiler only ever read from it.

use std::collections::{BTreeMap, HashMap};

use crate::error::{AclError, Result};
use crate::types::{Action, Direction, NicId, Target};
use crate::validate::{split_list, validate_name};

/// Config key holding the comma-separated ACL list
pub const KEY_ACLS: &str = "security.acls";

/// Default action when neither the NIC nor its network overrides it
pub const GLOBAL_DEFAULT_ACTION: Action = Action::Reject;

fn default_action_key(direction: Direction) -> String {
    format!("{}.default.{}.action", KEY_ACLS, direction)
}

fn default_logged_key(direction: Direction) -> String {
    format!("{}.default.{}.logged", KEY_ACLS, direction)
}

/// ACLs assigned to one target plus its default-rule overrides
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    /// ACL names in assignment order
    pub acls: Vec<String>,
    /// `security.acls.default.ingress.action`
    pub default_ingress_action: Option<Action>,
    /// `security.acls.default.egress.action`
    pub default_egress_action: Option<Action>,
    /// `security.acls.default.ingress.logged`
    pub default_ingress_logged: Option<bool>,
    /// `security.acls.default.egress.logged`
    pub default_egress_logged: Option<bool>,
}

impl Assignment {
    /// Assignment of the given ACLs with no overrides
    pub fn new<I, S>(acls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            acls: acls.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Override the default action for a direction
    pub fn with_default_action(mut self, direction: Direction, action: Action) -> Self {
        match direction {
            Direction::Ingress => self.default_ingress_action = Some(action),
            Direction::Egress => self.default_egress_action = Some(action),
        }
        self
    }

    /// Override whether the default rule is logged for a direction
    pub fn with_default_logged(mut self, direction: Direction, logged: bool) -> Self {
        match direction {
            Direction::Ingress => self.default_ingress_logged = Some(logged),
            Direction::Egress => self.default_egress_logged = Some(logged),
        }
        self
    }

    pub fn default_action(&self, direction: Direction) -> Option<Action> {
        match direction {
            Direction::Ingress => self.default_ingress_action,
            Direction::Egress => self.default_egress_action,
        }
    }

    pub fn default_logged(&self, direction: Direction) -> Option<bool> {
        match direction {
            Direction::Ingress => self.default_ingress_logged,
            Direction::Egress => self.default_egress_logged,
        }
    }

    /// Read an assignment from a network or NIC config map.
    ///
    /// Keys outside `security.acls*` are ignored; they belong to the device.
    pub fn from_config(config: &HashMap<String, String>) -> Result<Self> {
        let mut assignment = Assignment::default();

        if let Some(list) = config.get(KEY_ACLS) {
            for name in split_list(list) {
                validate_name(name)
                    .map_err(|e| AclError::Config(format!("{}: {}", KEY_ACLS, e)))?;
                if assignment.acls.iter().any(|n| n == name) {
                    return Err(AclError::Config(format!(
                        "{}: ACL {:?} listed more than once",
                        KEY_ACLS, name
                    )));
                }
                assignment.acls.push(name.to_string());
            }
        }

        for direction in Direction::ALL {
            let key = default_action_key(direction);
            if let Some(value) = config.get(&key).filter(|v| !v.is_empty()) {
                let action = Action::parse(value).ok_or_else(|| {
                    AclError::Config(format!(
                        "{}: unknown action {:?}, expected allow, reject or drop",
                        key, value
                    ))
                })?;
                assignment = assignment.with_default_action(direction, action);
            }

            let key = default_logged_key(direction);
            if let Some(value) = config.get(&key).filter(|v| !v.is_empty()) {
                let logged = match value.as_str() {
                    "true" => true,
                    "false" => false,
                    _ => {
                        return Err(AclError::Config(format!(
                            "{}: expected true or false, got {:?}",
                            key, value
                        )))
                    }
                };
                assignment = assignment.with_default_logged(direction, logged);
            }
        }

        Ok(assignment)
    }
}

/// A network's backend and assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEntry {
    /// Name of the registered backend enforcing this network
    pub backend: String,
    pub assignment: Assignment,
}

/// A NIC's network and assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicEntry {
    pub network: String,
    pub assignment: Assignment,
}

/// All current assignments
#[derive(Debug, Clone, Default)]
pub struct AssignmentTable {
    networks: BTreeMap<String, NetworkEntry>,
    nics: BTreeMap<NicId, NicEntry>,
}

impl AssignmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn network(&self, name: &str) -> Option<&NetworkEntry> {
        self.networks.get(name)
    }

    pub fn nic(&self, nic: &NicId) -> Option<&NicEntry> {
        self.nics.get(nic)
    }

    /// Insert or replace a network, returning the previous entry
    pub fn set_network(&mut self, name: impl Into<String>, entry: NetworkEntry) -> Option<NetworkEntry> {
        self.networks.insert(name.into(), entry)
    }

    pub fn remove_network(&mut self, name: &str) -> Option<NetworkEntry> {
        self.networks.remove(name)
    }

    /// Insert or replace a NIC, returning the previous entry
    pub fn set_nic(&mut self, nic: NicId, entry: NicEntry) -> Option<NicEntry> {
        self.nics.insert(nic, entry)
    }

    pub fn remove_nic(&mut self, nic: &NicId) -> Option<NicEntry> {
        self.nics.remove(nic)
    }

    /// NICs attached to a network
    pub fn nics_on<'a>(&'a self, network: &'a str) -> impl Iterator<Item = &'a NicId> + 'a {
        self.nics
            .iter()
            .filter(move |(_, entry)| entry.network == network)
            .map(|(nic, _)| nic)
    }

    /// All NICs
    pub fn nics(&self) -> impl Iterator<Item = &NicId> {
        self.nics.keys()
    }

    /// Every known target, networks first, in stable order
    pub fn targets(&self) -> Vec<Target> {
        self.networks
            .keys()
            .cloned()
            .map(Target::Network)
            .chain(self.nics.keys().cloned().map(Target::Nic))
            .collect()
    }

    /// Network a target lives on
    pub fn network_of<'a>(&'a self, target: &'a Target) -> Option<&'a str> {
        match target {
            Target::Network(name) => self.networks.contains_key(name).then_some(name.as_str()),
            Target::Nic(nic) => self.nics.get(nic).map(|e| e.network.as_str()),
        }
    }

    /// Backend enforcing a target
    pub fn backend_of(&self, target: &Target) -> Option<&str> {
        let network = self.network_of(target)?;
        self.networks.get(network).map(|e| e.backend.as_str())
    }

    /// Direct assignment of a target, if the target is known
    pub fn assignment(&self, target: &Target) -> Option<&Assignment> {
        match target {
            Target::Network(name) => self.networks.get(name).map(|e| &e.assignment),
            Target::Nic(nic) => self.nics.get(nic).map(|e| &e.assignment),
        }
    }

    /// ACLs in effect on a target in assignment order: the network's list,
    /// then the NIC's own list, first occurrence wins.
    pub fn effective_acls(&self, target: &Target) -> Vec<String> {
        let mut acls: Vec<String> = Vec::new();
        let mut push_all = |list: &[String]| {
            for name in list {
                if !acls.contains(name) {
                    acls.push(name.clone());
                }
            }
        };

        match target {
            Target::Network(name) => {
                if let Some(entry) = self.networks.get(name) {
                    push_all(&entry.assignment.acls);
                }
            }
            Target::Nic(nic) => {
                if let Some(entry) = self.nics.get(nic) {
                    if let Some(network) = self.networks.get(&entry.network) {
                        push_all(&network.assignment.acls);
                    }
                    push_all(&entry.assignment.acls);
                }
            }
        }
        acls
    }

    /// Effective default action and logging for a target: NIC override, then
    /// network override, then `global`.
    pub fn effective_default(&self, target: &Target, direction: Direction, global: Action) -> (Action, bool) {
        let nic = match target {
            Target::Nic(nic) => self.nics.get(nic).map(|e| &e.assignment),
            Target::Network(_) => None,
        };
        let network = self
            .network_of(target)
            .and_then(|n| self.networks.get(n))
            .map(|e| &e.assignment);

        let action = nic
            .and_then(|a| a.default_action(direction))
            .or_else(|| network.and_then(|a| a.default_action(direction)))
            .unwrap_or(global);
        let logged = nic
            .and_then(|a| a.default_logged(direction))
            .or_else(|| network.and_then(|a| a.default_logged(direction)))
            .unwrap_or(false);
        (action, logged)
    }

    /// Targets whose own assignment lists an ACL
    pub fn assigned_to(&self, acl: &str) -> Vec<Target> {
        self.targets()
            .into_iter()
            .filter(|t| {
                self.assignment(t)
                    .is_some_and(|a| a.acls.iter().any(|n| n == acl))
            })
            .collect()
    }

    /// Targets on which an ACL is in effect, directly or through their network
    pub fn in_effect(&self, acl: &str) -> Vec<Target> {
        self.targets()
            .into_iter()
            .filter(|t| self.effective_acls(t).iter().any(|n| n == acl))
            .collect()
    }
}
