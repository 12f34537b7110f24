//! Port group membership index.
//!
//! Maps each ACL name to the NICs that currently have it in effect. The index
//! is derived from the assignment table and never persisted.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;

use crate::assignment::AssignmentTable;
use crate::types::{NicId, Target};

#[derive(Debug, Default)]
struct IndexState {
    /// ACL name -> member NICs
    groups: HashMap<String, BTreeSet<NicId>>,
    /// NIC -> ACLs last committed for it
    nic_acls: HashMap<NicId, Vec<String>>,
}

impl IndexState {
    /// Replace the committed ACL list of one NIC, recording changed groups.
    fn update_nic(&mut self, nic: &NicId, new: Vec<String>, changed: &mut BTreeSet<String>) {
        let old = if new.is_empty() {
            self.nic_acls.remove(nic).unwrap_or_default()
        } else {
            self.nic_acls.insert(nic.clone(), new.clone()).unwrap_or_default()
        };

        for name in old.iter().filter(|n| !new.contains(n)) {
            if let Some(members) = self.groups.get_mut(name) {
                members.remove(nic);
                if members.is_empty() {
                    self.groups.remove(name);
                }
            }
            changed.insert(name.clone());
        }
        for name in new.iter().filter(|n| !old.contains(n)) {
            self.groups
                .entry(name.clone())
                .or_default()
                .insert(nic.clone());
            changed.insert(name.clone());
        }
    }
}

/// Live index of ACL name to member NICs.
///
/// Reads are concurrent; updates take the write lock only for the diff.
#[derive(Debug, Default)]
pub struct PortGroupIndex {
    state: RwLock<IndexState>,
}

impl PortGroupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute membership after `target`'s assignment changed in `table`.
    ///
    /// A network change touches every NIC on that network. NICs no longer in
    /// the table are dropped from every group. Returns the ACL names whose
    /// member set changed.
    pub fn on_assignment_changed(&self, target: &Target, table: &AssignmentTable) -> BTreeSet<String> {
        let nics: Vec<NicId> = match target {
            Target::Nic(nic) => vec![nic.clone()],
            Target::Network(network) => {
                let state = self.state.read();
                // Include NICs we still track for this network but which the
                // table no longer lists.
                let mut nics: BTreeSet<NicId> = table.nics_on(network).cloned().collect();
                nics.extend(
                    state
                        .nic_acls
                        .keys()
                        .filter(|nic| table.nic(nic).is_none())
                        .cloned(),
                );
                nics.into_iter().collect()
            }
        };

        let updates: Vec<(NicId, Vec<String>)> = nics
            .into_iter()
            .map(|nic| {
                let acls = table.effective_acls(&Target::Nic(nic.clone()));
                (nic, acls)
            })
            .collect();

        let mut changed = BTreeSet::new();
        let mut state = self.state.write();
        for (nic, acls) in updates {
            state.update_nic(&nic, acls, &mut changed);
        }
        drop(state);

        if !changed.is_empty() {
            tracing::debug!(target_id = %target, groups = ?changed, "port group membership changed");
        }
        changed
    }

    /// Drop a NIC from every group. Returns the affected ACL names.
    pub fn remove_nic(&self, nic: &NicId) -> BTreeSet<String> {
        let mut changed = BTreeSet::new();
        self.state.write().update_nic(nic, Vec::new(), &mut changed);
        changed
    }

    /// Rebuild the whole index from the assignment table (restart replay).
    pub fn rebuild(&self, table: &AssignmentTable) -> BTreeSet<String> {
        let mut fresh = IndexState::default();
        let mut changed = BTreeSet::new();
        for nic in table.nics() {
            let acls = table.effective_acls(&Target::Nic(nic.clone()));
            fresh.update_nic(nic, acls, &mut changed);
        }

        let mut state = self.state.write();
        changed.extend(state.groups.keys().cloned());
        *state = fresh;
        changed
    }

    /// Current members of an ACL's port group
    pub fn members_of(&self, acl: &str) -> BTreeSet<NicId> {
        self.state.read().groups.get(acl).cloned().unwrap_or_default()
    }

    /// Snapshot of all non-empty groups
    pub fn groups(&self) -> BTreeMap<String, BTreeSet<NicId>> {
        self.state
            .read()
            .groups
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
