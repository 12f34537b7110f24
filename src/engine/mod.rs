//! Engine module.
//!
//! Owns the ACL store, the assignment table, the port group index, the
//! selector resolver and the registered backends. Every mutation is
//! pre-checked, committed, and then pushed to the affected targets:
//! index update, cache invalidation, recompilation, apply.
//!
//! Pre-checks run under upgradable reads, so reconciles of other targets keep
//! reading state meanwhile; only the commit takes the exclusive lock. Every
//! checking mutation holds the upgradable read on `acls` from check to
//! commit, which serializes them. Lock order is `acls` before `table`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use serde::Serialize;

use crate::assignment::{Assignment, AssignmentTable, NetworkEntry, NicEntry, GLOBAL_DEFAULT_ACTION};
use crate::backend::{apply_error, Backend, DEFAULT_APPLY_TIMEOUT};
use crate::compile::{compile_plan, CompileContext, EnforcementPlan};
use crate::error::{AclError, ApplyErrorKind, Result};
use crate::logs::LogStream;
use crate::portgroup::PortGroupIndex;
use crate::selector::{PeerTopology, SelectorResolver, DEFAULT_CACHE_SIZE};
use crate::types::{Acl, Action, Direction, NicId, Side, Target};
use crate::validate::{parse_rule, split_list, validate_acl, validate_name, SubjectSpec};

/// Default number of attempts for a transient apply failure
pub const DEFAULT_MAX_APPLY_ATTEMPTS: u32 = 3;

/// Default delay before the first retry; doubled on every further retry
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Engine builder options.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// LRU cache size for resolved selectors
    pub cache_size: usize,
    /// Timeout of a single apply/remove call
    pub apply_timeout: Duration,
    /// Attempts per apply when failures are transient
    pub max_apply_attempts: u32,
    /// Delay before the first retry
    pub retry_backoff: Duration,
    /// Default action when no override is configured
    pub default_action: Action,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            apply_timeout: DEFAULT_APPLY_TIMEOUT,
            max_apply_attempts: DEFAULT_MAX_APPLY_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            default_action: GLOBAL_DEFAULT_ACTION,
        }
    }
}

impl EngineOptions {
    /// Create new engine options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set cache size.
    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    /// Set the timeout of a single backend call.
    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    /// Set how many times a transient failure is attempted.
    pub fn with_max_apply_attempts(mut self, attempts: u32) -> Self {
        self.max_apply_attempts = attempts;
        self
    }

    /// Set the initial retry backoff.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set the global default action.
    pub fn with_default_action(mut self, action: Action) -> Self {
        self.default_action = action;
        self
    }
}

/// What references an ACL
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsedBy {
    /// Networks and NICs assigning the ACL directly
    pub targets: Vec<Target>,
    /// Other ACLs using its name as a subject
    pub acls: Vec<String>,
}

impl UsedBy {
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty() && self.acls.is_empty()
    }
}

/// Network ACL engine.
pub struct AclEngine {
    options: EngineOptions,
    acls: RwLock<BTreeMap<String, Acl>>,
    table: RwLock<AssignmentTable>,
    index: PortGroupIndex,
    resolver: SelectorResolver,
    backends: RwLock<BTreeMap<String, Arc<dyn Backend>>>,
    locks: Mutex<HashMap<Target, Arc<tokio::sync::Mutex<()>>>>,
    /// Last plan enforced per target, with the backend holding it
    applied: Mutex<HashMap<Target, (String, EnforcementPlan)>>,
}

impl AclEngine {
    /// Create an engine reading peer state from `topology`.
    pub fn new(topology: Arc<dyn PeerTopology>, options: EngineOptions) -> Self {
        Self {
            resolver: SelectorResolver::new(topology, options.cache_size),
            options,
            acls: RwLock::new(BTreeMap::new()),
            table: RwLock::new(AssignmentTable::new()),
            index: PortGroupIndex::new(),
            backends: RwLock::new(BTreeMap::new()),
            locks: Mutex::new(HashMap::new()),
            applied: Mutex::new(HashMap::new()),
        }
    }

    /// Engine options
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Port group index
    pub fn index(&self) -> &PortGroupIndex {
        &self.index
    }

    /// Selector resolver
    pub fn resolver(&self) -> &SelectorResolver {
        &self.resolver
    }

    // ---- backends ----

    /// Register a backend under `name`.
    pub fn register_backend(&self, name: impl Into<String>, backend: Arc<dyn Backend>) -> Result<()> {
        let name = name.into();
        let mut backends = self.backends.write();
        if backends.contains_key(&name) {
            return Err(AclError::AlreadyExists(format!("backend {:?}", name)));
        }
        tracing::debug!(backend = %name, capabilities = ?backend.capabilities(), "backend registered");
        backends.insert(name, backend);
        Ok(())
    }

    /// Open every registered backend.
    pub async fn open(&self) -> Result<()> {
        for (name, backend) in self.backend_list() {
            backend.open().await?;
            tracing::debug!(backend = %name, "backend opened");
        }
        Ok(())
    }

    /// Close every registered backend. All are closed even if one fails.
    pub async fn close(&self) -> Result<()> {
        let mut first = None;
        for (name, backend) in self.backend_list() {
            if let Err(e) = backend.close().await {
                tracing::warn!(backend = %name, error = %e, "backend close failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    fn backend_list(&self) -> Vec<(String, Arc<dyn Backend>)> {
        self.backends
            .read()
            .iter()
            .map(|(name, backend)| (name.clone(), backend.clone()))
            .collect()
    }

    fn backend(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.read().get(name).cloned()
    }

    fn backend_for(&self, table: &AssignmentTable, target: &Target) -> Result<Arc<dyn Backend>> {
        let name = table
            .backend_of(target)
            .ok_or_else(|| AclError::NotFound(target.to_string()))?;
        self.backend(name).ok_or_else(|| {
            apply_error(ApplyErrorKind::Backend, name, target, "no backend registered under this name")
        })
    }

    // ---- ACL store ----

    /// Create a new ACL.
    pub fn create_acl(&self, acl: Acl) -> Result<()> {
        validate_acl(&acl)?;
        let mut acls = self.acls.write();
        if acls.contains_key(&acl.name) {
            return Err(AclError::AlreadyExists(format!("ACL {:?}", acl.name)));
        }
        check_references(&acl, &acls)?;
        tracing::debug!(acl = %acl.name, "ACL created");
        acls.insert(acl.name.clone(), acl);
        Ok(())
    }

    /// Replace an ACL's description, config and rule lists.
    ///
    /// Rejected without any change when the new rules cannot be enforced on
    /// a target the ACL is in effect on. Otherwise committed and pushed to
    /// those targets; an apply failure is returned but the definition stays.
    pub async fn update_acl(&self, acl: Acl) -> Result<()> {
        validate_acl(&acl)?;
        let targets = {
            let acls = self.acls.upgradable_read();
            if !acls.contains_key(&acl.name) {
                return Err(AclError::NotFound(format!("ACL {:?}", acl.name)));
            }
            check_references(&acl, &acls)?;

            let targets = {
                let table = self.table.read();
                let targets = table.in_effect(&acl.name);
                let mut candidate = acls.clone();
                candidate.insert(acl.name.clone(), acl.clone());
                self.precheck(&candidate, &table, &targets)
                    .inspect_err(|e| tracing::warn!(acl = %acl.name, error = %e, "ACL update rejected"))?;
                targets
            };

            RwLockUpgradableReadGuard::upgrade(acls).insert(acl.name.clone(), acl);
            targets
        };

        self.reconcile_all(targets).await
    }

    /// Rename an ACL that nothing references.
    pub fn rename_acl(&self, old: &str, new: &str) -> Result<()> {
        validate_name(new)?;
        let mut acls = self.acls.write();
        let table = self.table.read();

        if !acls.contains_key(old) {
            return Err(AclError::NotFound(format!("ACL {:?}", old)));
        }
        if acls.contains_key(new) {
            return Err(AclError::AlreadyExists(format!("ACL {:?}", new)));
        }
        let used = used_by(old, &acls, &table);
        if !used.is_empty() {
            return Err(AclError::InUse(format!("ACL {:?} is referenced", old)));
        }

        let Some(mut acl) = acls.remove(old) else {
            return Err(AclError::NotFound(format!("ACL {:?}", old)));
        };
        acl.name = new.to_string();
        rename_self_references(&mut acl, old, new);
        acls.insert(new.to_string(), acl);
        tracing::debug!(from = old, to = new, "ACL renamed");
        Ok(())
    }

    /// Delete an ACL that nothing references.
    pub fn delete_acl(&self, name: &str) -> Result<()> {
        let mut acls = self.acls.write();
        let table = self.table.read();
        if !acls.contains_key(name) {
            return Err(AclError::NotFound(format!("ACL {:?}", name)));
        }
        let used = used_by(name, &acls, &table);
        if !used.is_empty() {
            tracing::warn!(acl = name, used_by = ?used, "ACL delete refused");
            return Err(AclError::InUse(format!(
                "ACL {:?} is used by {} target(s) and {} ACL(s)",
                name,
                used.targets.len(),
                used.acls.len()
            )));
        }
        acls.remove(name);
        tracing::debug!(acl = name, "ACL deleted");
        Ok(())
    }

    /// Stored form of an ACL
    pub fn get_acl(&self, name: &str) -> Result<Acl> {
        self.acls
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| AclError::NotFound(format!("ACL {:?}", name)))
    }

    /// Names of all ACLs, sorted
    pub fn list_acls(&self) -> Vec<String> {
        self.acls.read().keys().cloned().collect()
    }

    /// Targets and ACLs referencing an ACL
    pub fn used_by(&self, name: &str) -> Result<UsedBy> {
        let acls = self.acls.read();
        let table = self.table.read();
        if !acls.contains_key(name) {
            return Err(AclError::NotFound(format!("ACL {:?}", name)));
        }
        Ok(used_by(name, &acls, &table))
    }

    // ---- assignments ----

    /// Create or update a network enforced by `backend`, reading its ACL
    /// assignment from `config`.
    pub async fn set_network(
        &self,
        network: &str,
        backend: &str,
        config: &HashMap<String, String>,
    ) -> Result<()> {
        let assignment = Assignment::from_config(config)?;
        if self.backend(backend).is_none() {
            return Err(AclError::NotFound(format!("backend {:?}", backend)));
        }

        let target = Target::Network(network.to_string());
        let (changed, nics) = {
            let acls = self.acls.upgradable_read();
            let table = self.table.upgradable_read();
            check_assigned(&assignment, &acls)?;

            let mut candidate = table.clone();
            candidate.set_network(
                network,
                NetworkEntry {
                    backend: backend.to_string(),
                    assignment,
                },
            );
            let mut checked = vec![target.clone()];
            checked.extend(candidate.nics_on(network).cloned().map(Target::Nic));
            self.precheck(&acls, &candidate, &checked)
                .inspect_err(|e| tracing::warn!(network, error = %e, "network assignment rejected"))?;

            let mut table = RwLockUpgradableReadGuard::upgrade(table);
            *table = candidate;
            let changed = self.index.on_assignment_changed(&target, &table);
            (changed, checked)
        };

        let mut targets = nics;
        targets.extend(self.referencing_targets(&changed));
        self.reconcile_all(targets).await
    }

    /// Remove a network. Its NICs must be removed first.
    pub async fn remove_network(&self, network: &str) -> Result<()> {
        let target = Target::Network(network.to_string());
        {
            let mut table = self.table.write();
            if table.network(network).is_none() {
                return Err(AclError::NotFound(target.to_string()));
            }
            if table.nics_on(network).next().is_some() {
                return Err(AclError::InUse(format!("network {:?} still has NICs", network)));
            }
            table.remove_network(network);
            self.index.on_assignment_changed(&target, &table);
        }
        self.resolver.invalidate_network(network);
        self.reconcile(&target).await
    }

    /// Create or update a NIC on `network`, reading its ACL assignment from
    /// `config`.
    pub async fn set_nic(&self, nic: NicId, network: &str, config: &HashMap<String, String>) -> Result<()> {
        let assignment = Assignment::from_config(config)?;
        let target = Target::Nic(nic.clone());
        let changed = {
            let acls = self.acls.upgradable_read();
            let table = self.table.upgradable_read();
            if table.network(network).is_none() {
                return Err(AclError::NotFound(Target::Network(network.to_string()).to_string()));
            }
            check_assigned(&assignment, &acls)?;

            let mut candidate = table.clone();
            candidate.set_nic(
                nic,
                NicEntry {
                    network: network.to_string(),
                    assignment,
                },
            );
            self.precheck(&acls, &candidate, std::slice::from_ref(&target))
                .inspect_err(|e| tracing::warn!(target_id = %target, error = %e, "NIC assignment rejected"))?;

            let mut table = RwLockUpgradableReadGuard::upgrade(table);
            *table = candidate;
            self.index.on_assignment_changed(&target, &table)
        };

        let mut targets = vec![target];
        targets.extend(self.referencing_targets(&changed));
        self.reconcile_all(targets).await
    }

    /// Remove a NIC and its enforcement.
    pub async fn remove_nic(&self, nic: &NicId) -> Result<()> {
        let target = Target::Nic(nic.clone());
        let changed = {
            let mut table = self.table.write();
            if table.remove_nic(nic).is_none() {
                return Err(AclError::NotFound(target.to_string()));
            }
            self.index.remove_nic(nic)
        };

        let mut targets = vec![target];
        targets.extend(self.referencing_targets(&changed));
        self.reconcile_all(targets).await
    }

    /// Recompile targets using peer selectors of `network` after its peer
    /// connections changed.
    pub async fn peers_changed(&self, network: &str) -> Result<()> {
        self.resolver.invalidate_network(network);
        let targets = {
            let acls = self.acls.read();
            let table = self.table.read();
            let mut targets = BTreeSet::new();
            for acl in acls.values() {
                if peer_networks(acl).contains(network) {
                    targets.extend(table.in_effect(&acl.name));
                }
            }
            targets
        };
        tracing::debug!(network, targets = targets.len(), "peer topology changed");
        self.reconcile_all(targets.into_iter().collect()).await
    }

    /// Push the current state of a target to its backend again.
    pub async fn reapply(&self, target: &Target) -> Result<()> {
        self.reconcile(target).await
    }

    /// Install persisted ACLs and assignments without enforcing anything.
    ///
    /// Replaces the current store and table. Follow with [`AclEngine::restore`].
    pub fn load(&self, definitions: Vec<Acl>, table: AssignmentTable) -> Result<()> {
        let mut loaded = BTreeMap::new();
        for acl in definitions {
            validate_acl(&acl)?;
            loaded.insert(acl.name.clone(), acl);
        }
        for acl in loaded.values() {
            check_references(acl, &loaded)?;
        }
        for target in table.targets() {
            if let Some(assignment) = table.assignment(&target) {
                check_assigned(assignment, &loaded)?;
            }
        }

        let mut acls = self.acls.write();
        let mut current = self.table.write();
        *acls = loaded;
        *current = table;
        tracing::debug!(acls = acls.len(), targets = current.targets().len(), "state loaded");
        Ok(())
    }

    /// Rebuild derived state from the assignment table and enforce every
    /// target, as after a restart.
    pub async fn restore(&self) -> Result<()> {
        let targets = {
            let table = self.table.read();
            self.index.rebuild(&table);
            table.targets()
        };
        self.resolver.clear_cache();
        tracing::debug!(targets = targets.len(), "restoring enforcement");
        self.reconcile_all(targets).await
    }

    // ---- inspection ----

    /// Compile a target against current state without applying it.
    pub fn compile_target(&self, target: &Target) -> Result<EnforcementPlan> {
        let acls = self.acls.read();
        let table = self.table.read();
        let backend = self.backend_for(&table, target)?;
        let info = backend.info();
        let ctx = CompileContext {
            acls: &acls,
            table: &table,
            index: &self.index,
            resolver: &self.resolver,
            backend: &info,
            global_default: self.options.default_action,
        };
        compile_plan(target, &ctx)
    }

    /// Plan last enforced on a target
    pub fn applied_plan(&self, target: &Target) -> Option<EnforcementPlan> {
        self.applied.lock().get(target).map(|(_, plan)| plan.clone())
    }

    /// Logged-rule records of an ACL from every backend.
    pub fn fetch_logs(&self, acl: &str) -> Result<LogStream> {
        if !self.acls.read().contains_key(acl) {
            return Err(AclError::NotFound(format!("ACL {:?}", acl)));
        }
        let mut streams = Vec::new();
        for (_, backend) in self.backend_list() {
            streams.push(backend.fetch_logs(acl)?);
        }
        Ok(Box::new(streams.into_iter().flatten()))
    }

    // ---- internals ----

    /// Compile `targets` against a candidate state; any error rejects the
    /// mutation.
    fn precheck(&self, acls: &BTreeMap<String, Acl>, table: &AssignmentTable, targets: &[Target]) -> Result<()> {
        for target in targets {
            let info = self.backend_for(table, target)?.info();
            let ctx = CompileContext {
                acls,
                table,
                index: &self.index,
                resolver: &self.resolver,
                backend: &info,
                global_default: self.options.default_action,
            };
            compile_plan(target, &ctx)?;
        }
        Ok(())
    }

    /// Targets with an ACL in effect that names one of `groups` as a subject
    fn referencing_targets(&self, groups: &BTreeSet<String>) -> Vec<Target> {
        if groups.is_empty() {
            return Vec::new();
        }
        let acls = self.acls.read();
        let table = self.table.read();
        let mut targets = BTreeSet::new();
        for acl in acls.values() {
            if !group_references(acl).is_disjoint(groups) {
                targets.extend(table.in_effect(&acl.name));
            }
        }
        targets.into_iter().collect()
    }

    fn target_lock(&self, target: &Target) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(target.clone()).or_default().clone()
    }

    /// Reconcile targets one at a time, returning the first failure.
    async fn reconcile_all(&self, targets: Vec<Target>) -> Result<()> {
        let mut seen = BTreeSet::new();
        let mut first = None;
        for target in targets {
            if !seen.insert(target.clone()) {
                continue;
            }
            if let Err(e) = self.reconcile(&target).await {
                tracing::warn!(target_id = %target, error = %e, "enforcement failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Bring a target's backend in line with current state.
    async fn reconcile(&self, target: &Target) -> Result<()> {
        let lock = self.target_lock(target);
        let _guard = lock.lock().await;

        let desired = self.desired(target)?;
        let previous = self.applied.lock().get(target).map(|(name, _)| name.clone());

        // Backend changed or target gone: clear the old backend first.
        if let Some(previous) = previous {
            let moved = desired.as_ref().map_or(true, |(backend, _)| backend.name() != previous);
            if moved {
                if let Some(old) = self.backend(&previous) {
                    self.call_backend(&previous, target, || old.remove(target)).await?;
                }
                self.applied.lock().remove(target);
            }
        }

        let Some((backend, plan)) = desired else {
            return Ok(());
        };
        let name = backend.name().to_string();

        if plan.is_empty() {
            self.call_backend(&name, target, || backend.remove(target)).await?;
            self.applied.lock().remove(target);
            tracing::debug!(target_id = %target, backend = %name, "no ACLs in effect, enforcement removed");
            return Ok(());
        }

        self.call_backend(&name, target, || backend.apply(&plan)).await?;
        tracing::debug!(
            target_id = %target,
            backend = %name,
            ingress = plan.ingress.rule_count(),
            egress = plan.egress.rule_count(),
            "plan applied"
        );
        self.applied.lock().insert(target.clone(), (name, plan));
        Ok(())
    }

    /// Backend and plan a target should have; `None` once the target is gone.
    fn desired(&self, target: &Target) -> Result<Option<(Arc<dyn Backend>, EnforcementPlan)>> {
        let acls = self.acls.read();
        let table = self.table.read();
        if table.network_of(target).is_none() {
            return Ok(None);
        }
        let backend = self.backend_for(&table, target)?;
        let info = backend.info();
        let ctx = CompileContext {
            acls: &acls,
            table: &table,
            index: &self.index,
            resolver: &self.resolver,
            backend: &info,
            global_default: self.options.default_action,
        };
        let plan = compile_plan(target, &ctx)?;
        Ok(Some((backend, plan)))
    }

    /// Run a backend call with the apply timeout, retrying transient
    /// failures with exponential backoff.
    async fn call_backend<F, Fut>(&self, backend: &str, target: &Target, call: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let attempts = self.options.max_apply_attempts.max(1);
        let mut backoff = self.options.retry_backoff;
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.options.apply_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(apply_error(
                    ApplyErrorKind::Timeout,
                    backend,
                    target,
                    format!("no answer within {:?}", self.options.apply_timeout),
                )),
            };

            match result {
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(
                        target_id = %target,
                        backend,
                        attempt,
                        error = %e,
                        "transient apply failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// ACL names a rule list refers to as subjects
fn group_references(acl: &Acl) -> BTreeSet<String> {
    subject_specs(acl)
        .filter_map(|spec| match spec {
            SubjectSpec::Group(name) => Some(name),
            _ => None,
        })
        .collect()
}

/// Networks whose peers an ACL refers to
fn peer_networks(acl: &Acl) -> BTreeSet<String> {
    subject_specs(acl)
        .filter_map(|spec| match spec {
            SubjectSpec::Peer { network, .. } => Some(network),
            _ => None,
        })
        .collect()
}

fn subject_specs(acl: &Acl) -> impl Iterator<Item = SubjectSpec> + '_ {
    Direction::ALL.into_iter().flat_map(move |direction| {
        acl.rules(direction)
            .iter()
            .enumerate()
            .filter_map(move |(index, rule)| parse_rule(&acl.name, direction, index, rule).ok())
            .flat_map(|parsed| {
                [Side::Source, Side::Destination]
                    .into_iter()
                    .flat_map(|side| parsed.subjects(side).to_vec())
                    .map(|(_, spec)| spec)
                    .collect::<Vec<_>>()
            })
    })
}

/// Subject names must refer to stored ACLs or to the ACL itself.
fn check_references(acl: &Acl, acls: &BTreeMap<String, Acl>) -> Result<()> {
    for name in group_references(acl) {
        if name != acl.name && !acls.contains_key(&name) {
            return Err(AclError::validation(
                &acl.name,
                "rules",
                format!("subject references unknown ACL {:?}", name),
            ));
        }
    }
    Ok(())
}

fn check_assigned(assignment: &Assignment, acls: &BTreeMap<String, Acl>) -> Result<()> {
    for name in &assignment.acls {
        if !acls.contains_key(name) {
            return Err(AclError::NotFound(format!("ACL {:?}", name)));
        }
    }
    Ok(())
}

fn used_by(name: &str, acls: &BTreeMap<String, Acl>, table: &AssignmentTable) -> UsedBy {
    UsedBy {
        targets: table.assigned_to(name),
        acls: acls
            .values()
            .filter(|acl| acl.name != name && group_references(acl).contains(name))
            .map(|acl| acl.name.clone())
            .collect(),
    }
}

fn rename_self_references(acl: &mut Acl, old: &str, new: &str) {
    let rewrite = |field: &mut String| {
        if split_list(field).any(|item| item == old) {
            let items: Vec<&str> = split_list(field)
                .map(|item| if item == old { new } else { item })
                .collect();
            *field = items.join(",");
        }
    };
    for rule in acl.ingress.iter_mut().chain(acl.egress.iter_mut()) {
        rewrite(&mut rule.source);
        rewrite(&mut rule.destination);
    }
}
