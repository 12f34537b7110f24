//! Selector resolution.
//!
//! Turns the text of a rule's source/destination entries into either a
//! literal address set, a symbolic network subject, or a group reference,
//! checking the target backend's capabilities along the way.

mod peers;

pub use peers::{PeerInfo, PeerTable, PeerTopology};

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;

use ipnet::IpNet;
use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{AclError, ResolutionErrorKind, Result};
use crate::types::{Direction, Side};
use crate::validate::{parse_subject, SubjectSpec};

/// Default LRU cache size for resolved selectors
pub const DEFAULT_CACHE_SIZE: usize = 1024;

/// What a backend can express natively
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities {
    /// Subject-name and peer selectors
    pub supports_selectors: bool,
    /// `A-B` address ranges as subjects
    pub supports_ip_range_subjects: bool,
    /// Filtering between two NICs of the same network
    pub supports_intra_network_filtering: bool,
}

impl Capabilities {
    /// Every capability
    pub fn all() -> Self {
        Self {
            supports_selectors: true,
            supports_ip_range_subjects: true,
            supports_intra_network_filtering: true,
        }
    }
}

/// Backend identity and capabilities as seen by the resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInfo {
    pub name: String,
    pub capabilities: Capabilities,
}

impl BackendInfo {
    pub fn new(name: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            name: name.into(),
            capabilities,
        }
    }
}

/// Result of resolving one selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSubject {
    /// Literal CIDR or address
    Net(IpNet),
    /// Literal address range
    Range(IpAddr, IpAddr),
    /// Local to the network; the backend decides what that means
    Internal,
    /// Outside the network
    External,
    /// Traffic via an established peering connection
    Peer {
        network: String,
        peer: String,
        addresses: Vec<IpNet>,
    },
    /// NICs to which the named ACL applies, looked up at compile time
    GroupReference(String),
}

type CacheKey = (String, String);

/// Resolves selector text against a backend, caching results per backend.
pub struct SelectorResolver {
    topology: Arc<dyn PeerTopology>,
    cache: Mutex<LruCache<CacheKey, ResolvedSubject>>,
}

impl SelectorResolver {
    /// Create a resolver backed by a peer topology
    pub fn new(topology: Arc<dyn PeerTopology>, cache_size: usize) -> Self {
        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            topology,
            cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    /// Resolve one entry of the `side` field of a `direction` rule.
    pub fn resolve(
        &self,
        text: &str,
        direction: Direction,
        side: Side,
        backend: &BackendInfo,
    ) -> Result<ResolvedSubject> {
        let spec = parse_subject(text).map_err(|message| AclError::Resolution {
            kind: ResolutionErrorKind::Unresolved,
            selector: text.to_string(),
            backend: backend.name.clone(),
            message,
        })?;
        self.resolve_spec(text, &spec, direction, side, backend)
    }

    /// Resolve an already parsed subject.
    pub fn resolve_spec(
        &self,
        text: &str,
        spec: &SubjectSpec,
        direction: Direction,
        side: Side,
        backend: &BackendInfo,
    ) -> Result<ResolvedSubject> {
        let error = |kind, message: String| AclError::Resolution {
            kind,
            selector: text.to_string(),
            backend: backend.name.clone(),
            message,
        };
        let caps = backend.capabilities;

        match spec {
            SubjectSpec::Group(_) if side != direction.far_side() => {
                return Err(error(
                    ResolutionErrorKind::InvalidPosition,
                    format!(
                        "subject names are only valid in {} of {} rules",
                        direction.far_side().as_str(),
                        direction
                    ),
                ));
            }
            SubjectSpec::Group(_) | SubjectSpec::Peer { .. } if !caps.supports_selectors => {
                return Err(error(
                    ResolutionErrorKind::MissingCapability,
                    "backend does not support selectors".to_string(),
                ));
            }
            SubjectSpec::Range(..) if !caps.supports_ip_range_subjects => {
                return Err(error(
                    ResolutionErrorKind::MissingCapability,
                    "backend does not support IP range subjects".to_string(),
                ));
            }
            _ => {}
        }

        let key = (text.to_string(), backend.name.clone());
        if let Some(hit) = self.cache.lock().get(&key) {
            return Ok(hit.clone());
        }

        let resolved = match spec {
            SubjectSpec::Net(net) => ResolvedSubject::Net(*net),
            SubjectSpec::Range(start, end) => ResolvedSubject::Range(*start, *end),
            SubjectSpec::Internal => ResolvedSubject::Internal,
            SubjectSpec::External => ResolvedSubject::External,
            SubjectSpec::Group(name) => ResolvedSubject::GroupReference(name.clone()),
            SubjectSpec::Peer { network, peer } => {
                let info = self.topology.peer(network, peer).ok_or_else(|| {
                    error(
                        ResolutionErrorKind::Unresolved,
                        format!(
                            "selector unresolved: network {:?} has no established peer {:?}",
                            network, peer
                        ),
                    )
                })?;
                ResolvedSubject::Peer {
                    network: network.clone(),
                    peer: peer.clone(),
                    addresses: info.addresses,
                }
            }
        };

        self.cache.lock().put(key, resolved.clone());
        Ok(resolved)
    }

    /// Drop every cached selector for which `stale` returns true.
    pub fn invalidate<F>(&self, stale: F)
    where
        F: Fn(&str, &ResolvedSubject) -> bool,
    {
        let mut cache = self.cache.lock();
        let keys: Vec<CacheKey> = cache
            .iter()
            .filter(|((text, _), value)| stale(text, value))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            cache.pop(&key);
        }
    }

    /// Drop cached peer selectors of one network.
    pub fn invalidate_network(&self, network: &str) {
        self.invalidate(|_, value| {
            matches!(value, ResolvedSubject::Peer { network: n, .. } if n == network)
        });
    }

    /// Clear the cache
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    /// Number of cached entries
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}
