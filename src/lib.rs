//! Network ACL Engine - compiles declarative network ACLs into enforcement
//! plans for bridge and overlay backends
//!
//! This library provides:
//! - ACL and rule validation (actions, states, protocols, ports, ICMP, subjects)
//! - Selector resolution (`@internal`, `@external`, peers, ACL names as groups)
//! - A live port group membership index
//! - Priority compilation into drop, reject, allow and default tiers
//! - Bridge (packet filter) and overlay (distributed ACL) backend adapters
//! - Log retrieval for rules in the `logged` state
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use netacl_engine::{
//!     Acl, AclEngine, Action, Capabilities, EngineOptions, Endpoint, MemoryBackend, Packet,
//!     PeerTable, Rule, Target,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = AclEngine::new(Arc::new(PeerTable::new()), EngineOptions::new());
//! engine.register_backend("ovn", Arc::new(MemoryBackend::new("ovn", Capabilities::all())))?;
//!
//! // Allow web traffic from inside the network
//! engine.create_acl(Acl::new("web").with_ingress(vec![Rule::new(Action::Allow)
//!     .with_protocol("tcp")
//!     .with_source("@internal")
//!     .with_destination_port("80,443")]))?;
//!
//! // Assign it to a network
//! let config = HashMap::from([("security.acls".to_string(), "web".to_string())]);
//! engine.set_network("net0", "ovn", &config).await?;
//!
//! // Evaluate traffic against what was enforced
//! let plan = engine.applied_plan(&Target::Network("net0".into())).unwrap();
//! let client = Endpoint::internal("10.0.0.2".parse()?);
//! let server = Endpoint::internal("10.0.0.10".parse()?);
//! let decision = plan.ingress.decide(&Packet::tcp(client, server, 80)).unwrap();
//! assert_eq!(decision.action, Action::Allow);
//! # Ok(())
//! # }
//! # tokio::runtime::Builder::new_current_thread()
//! #     .enable_all()
//! #     .build()
//! #     .unwrap()
//! #     .block_on(run())
//! #     .unwrap();
//! ```
//!
//! # Rule Fields
//!
//! | Field | Example | Description |
//! |-------|---------|-------------|
//! | action | `allow` | `allow`, `reject` or `drop` |
//! | state | `logged` | `enabled` (default), `disabled` or `logged` |
//! | protocol | `tcp` | `tcp`, `udp`, `icmp4`, `icmp6` or empty for any |
//! | source / destination | `10.0.0.0/8, @internal` | Comma-separated subjects |
//! | source_port / destination_port | `80,8000-8080` | TCP/UDP only |
//! | icmp_type / icmp_code | `8` | ICMP only |
//!
//! ## Subjects
//!
//! | Type | Example | Description |
//! |------|---------|-------------|
//! | IP | `10.0.0.1` | Single address |
//! | CIDR | `10.0.0.0/8` | Address block |
//! | Range | `10.0.0.1-10.0.0.9` | Inclusive range, backend permitting |
//! | Internal | `@internal` | Inside the target's network |
//! | External | `@external` | Outside the target's network |
//! | Peer | `@uplink/dc2` | Addresses behind an established network peer |
//! | ACL name | `web` | Every NIC the named ACL applies to |

pub mod assignment;
pub mod backend;
pub mod compile;
pub mod engine;
pub mod error;
pub mod logs;
pub mod matcher;
pub mod portgroup;
pub mod selector;
pub mod types;
pub mod validate;

// Re-export commonly used items
pub use assignment::{Assignment, AssignmentTable, NetworkEntry, NicEntry, GLOBAL_DEFAULT_ACTION, KEY_ACLS};
pub use compile::{compile, compile_plan, CompileContext, CompiledRule, CompiledRuleSet, EnforcementPlan, Tier, TierKind};
pub use error::{AclError, ApplyErrorKind, ResolutionErrorKind, Result};
pub use logs::{LogEntry, LogStream};
pub use matcher::{EndpointMatcher, Subject};
pub use portgroup::PortGroupIndex;
pub use types::{
    Acl, Action, Decision, Direction, Endpoint, NicId, Packet, Protocol, Rule, RuleState, Side, Target,
};
pub use validate::{parse_rule, validate_acl, validate_name, ParsedRule, PortRange, SubjectSpec};

// Re-export selector types
pub use selector::{
    BackendInfo, Capabilities, PeerInfo, PeerTable, PeerTopology, ResolvedSubject, SelectorResolver,
    DEFAULT_CACHE_SIZE,
};

// Re-export backend types
pub use backend::{
    AttachPoint, Backend, BridgeBackend, FirewallDriver, MemoryBackend, MemoryController, MemoryFirewall,
    NativeChain, OverlayAcl, OverlayBackend, OverlayController, OverlayTransaction, PortGroupDef,
    BRIDGE_BACKEND, DEFAULT_APPLY_TIMEOUT, OVERLAY_BACKEND,
};

// Re-export engine types
pub use engine::{AclEngine, EngineOptions, UsedBy};
