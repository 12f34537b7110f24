use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::{apply_error, Backend};
use crate::compile::EnforcementPlan;
use crate::error::{ApplyErrorKind, Result};
use crate::logs::{LogEntry, LogStream};
use crate::selector::Capabilities;
use crate::types::Target;

/// In-memory backend that records applied plans.
///
/// Supports configurable capabilities, injected failures and a per-call delay
/// so retry and timeout handling can be exercised.
pub struct MemoryBackend {
    name: String,
    capabilities: Capabilities,
    plans: Mutex<HashMap<Target, EnforcementPlan>>,
    calls: AtomicUsize,
    writes: AtomicUsize,
    failures: Mutex<Option<(ApplyErrorKind, usize)>>,
    delay: Mutex<Option<Duration>>,
    logs: Mutex<Vec<(String, Value)>>,
    open: AtomicBool,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            name: name.into(),
            capabilities,
            plans: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            failures: Mutex::new(None),
            delay: Mutex::new(None),
            logs: Mutex::new(Vec::new()),
            open: AtomicBool::new(false),
        }
    }

    /// Sleep this long inside every apply/remove call
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Fail the next `times` apply/remove calls with `kind`
    pub fn fail_next(&self, kind: ApplyErrorKind, times: usize) {
        *self.failures.lock() = (times > 0).then_some((kind, times));
    }

    /// Record a log entry for an ACL
    pub fn push_log(&self, acl: impl Into<String>, record: Value) {
        self.logs.lock().push((acl.into(), record));
    }

    /// Plan currently enforced on a target
    pub fn plan(&self, target: &Target) -> Option<EnforcementPlan> {
        self.plans.lock().get(target).cloned()
    }

    /// Targets with enforcement in place
    pub fn targets(&self) -> Vec<Target> {
        let mut targets: Vec<Target> = self.plans.lock().keys().cloned().collect();
        targets.sort();
        targets
    }

    /// Number of apply/remove calls, failed ones included
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of calls that changed enforced state
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Whether the backend is between `open` and `close`
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn enter(&self, target: &Target) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut failures = self.failures.lock();
        if let Some((kind, remaining)) = *failures {
            *failures = (remaining > 1).then_some((kind, remaining - 1));
            return Err(apply_error(kind, &self.name, target, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn apply(&self, plan: &EnforcementPlan) -> Result<()> {
        self.enter(&plan.target).await?;
        if plan.is_empty() {
            if self.plans.lock().remove(&plan.target).is_some() {
                self.writes.fetch_add(1, Ordering::SeqCst);
            }
            return Ok(());
        }

        let mut plans = self.plans.lock();
        if plans.get(&plan.target) != Some(plan) {
            plans.insert(plan.target.clone(), plan.clone());
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn remove(&self, target: &Target) -> Result<()> {
        self.enter(target).await?;
        if self.plans.lock().remove(target).is_some() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn fetch_logs(&self, acl: &str) -> Result<LogStream> {
        let backend = self.name.clone();
        let entries: Vec<LogEntry> = self
            .logs
            .lock()
            .iter()
            .filter(|(owner, _)| owner == acl)
            .map(|(owner, record)| LogEntry {
                acl: owner.clone(),
                backend: backend.clone(),
                record: record.clone(),
            })
            .collect();
        Ok(Box::new(entries.into_iter()))
    }
}
