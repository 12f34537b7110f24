//! Backend adapters.
//!
//! This module provides the enforcement backends:
//! - `BridgeBackend`: software bridge with a host packet-filter firewall
//! - `OverlayBackend`: overlay network with a distributed ACL control plane
//! - `MemoryBackend`: in-memory fake for tests and dry runs

use std::time::Duration;

use async_trait::async_trait;

use crate::compile::EnforcementPlan;
use crate::error::{AclError, ApplyErrorKind, Result};
use crate::logs::LogStream;
use crate::selector::{BackendInfo, Capabilities};
use crate::types::Target;

mod bridge;
mod memory;
mod overlay;

pub use bridge::{BridgeBackend, FirewallDriver, MemoryFirewall, NativeChain, BRIDGE_BACKEND};
pub use memory::MemoryBackend;
pub use overlay::{
    AttachPoint, MemoryController, OverlayAcl, OverlayBackend, OverlayController, OverlayTransaction,
    PortGroupDef, OVERLAY_BACKEND,
};

/// Default timeout for a single apply/remove call
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Enforcement backend interface.
///
/// `apply` must build the whole native representation before touching
/// backend state and then change it in one step: a target is either fully on
/// the new plan or still on the previous one. Re-applying an identical plan
/// is a no-op.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Registered name of the backend
    fn name(&self) -> &str;

    /// What the backend can express
    fn capabilities(&self) -> Capabilities;

    /// Name and capabilities for the resolver
    fn info(&self) -> BackendInfo {
        BackendInfo::new(self.name(), self.capabilities())
    }

    /// Called once when the engine opens
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    /// Called once when the engine closes
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Enforce a plan on its target, replacing whatever was there.
    async fn apply(&self, plan: &EnforcementPlan) -> Result<()>;

    /// Remove all enforcement from a target.
    async fn remove(&self, target: &Target) -> Result<()>;

    /// Matched-traffic records of an ACL's logged rules. Empty when none.
    fn fetch_logs(&self, acl: &str) -> Result<LogStream>;
}

pub(crate) fn apply_error(
    kind: ApplyErrorKind,
    backend: &str,
    target: &Target,
    message: impl Into<String>,
) -> AclError {
    AclError::Apply {
        kind,
        backend: backend.to_string(),
        target: target.to_string(),
        message: message.into(),
    }
}

/// Name fragment safe for chain, port group and switch names.
///
/// Distinct targets always get distinct slugs: non-alphanumeric bytes are
/// hex-escaped and the NIC parts are joined with `__`, which no escaped part
/// contains.
pub(crate) fn target_slug(target: &Target) -> String {
    match target {
        Target::Network(name) => format!("net_{}", escape_name(name)),
        Target::Nic(nic) => format!("nic_{}__{}", escape_name(&nic.instance), escape_name(&nic.device)),
    }
}

/// Keep ASCII alphanumerics, write every other byte as `_xx`.
pub(crate) fn escape_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() {
            out.push(byte as char);
        } else {
            out.push_str(&format!("_{:02x}", byte));
        }
    }
    out
}
