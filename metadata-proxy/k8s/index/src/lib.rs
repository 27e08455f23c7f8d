//! Metadata proxy identity index
//!
//! The index maps a caller's source IP to the role assigned to the workload at that address. It
//! is built entirely from cluster watches:
//!
//! - Each `Pod` on this node reports its IP and role annotations. Pods are indexed by IP; a pod
//!   without a role annotation is still indexed so that its namespace is known when the default
//!   role is served. Host-network pods share the node's address and are never indexed.
//! - An IP may briefly have several owners, e.g. when a new pod reuses the address of one whose
//!   deletion has not been observed yet. The most recently added owner is authoritative and
//!   deleting any owner leaves the others in place.
//! - Each `Namespace` may carry an allow-list of role patterns that restricts which roles its
//!   workloads may assume.
//!
//! ```text
//! [ Pod ] ---> [ Placement ] ---\
//!                                 >--> [ Event channel ] --> run() --> [ Index ] <-- proxy lookups
//! [ Namespace ] -> [ Restriction ]/
//! ```
//!
//! Watch events are translated by [`watch::Watcher`] and sent over a channel to a single task that
//! owns every mutation of the index. Request handlers only ever take the read lock.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod authz;
mod lookup;
pub mod metrics;
pub mod watch;


pub use self::{
    authz::RestrictionDump,
    lookup::{resolve_external_id, LookupError},
};
use ahash::AHashMap as HashMap;
use metadata_proxy_core::{Placement, PlacementEvent, RestrictionEvent};
use parking_lot::RwLock;
use std::{net::IpAddr, sync::Arc};
use tokio::sync::mpsc::UnboundedReceiver;

pub type SharedIndex = Arc<RwLock<Index>>;

/// A normalized cluster event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Placement(PlacementEvent),
    Restriction(RestrictionEvent),
}

/// Index settings fixed at startup.
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Served to callers without an assigned role.
    pub default_role: Option<String>,

    /// When false, namespace allow-lists are not enforced.
    pub namespace_restriction: bool,
}

/// The role that applies to a caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub role: String,

    /// The caller's namespace, when the caller is a known workload.
    pub namespace: Option<String>,

    /// True when `role` was assigned to the caller rather than defaulted.
    pub found: bool,
}

/// Holds all indexing state. Owned and updated by a single task that processes watch events.
#[derive(Debug)]
pub struct Index {
    config: Config,

    /// The workloads holding each IP, oldest first. The last entry is the current owner.
    by_ip: HashMap<IpAddr, Vec<Placement>>,

    /// Compiled allow-lists by namespace name.
    restrictions: HashMap<String, authz::Restriction>,
}

/// A JSON view of the index for debugging.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dump {
    pub roles_by_ip: std::collections::BTreeMap<String, String>,
    pub namespace_by_ip: std::collections::BTreeMap<String, String>,
    pub restrictions: std::collections::BTreeMap<String, RestrictionDump>,
    pub default_role: Option<String>,
}

/// Applies events to the index until the channel closes.
pub async fn run(index: SharedIndex, mut events: UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        tracing::trace!(?event);
        index.write().apply(event);
    }
    tracing::debug!("Event channel closed");
}

// === impl Event ===

impl From<PlacementEvent> for Event {
    fn from(event: PlacementEvent) -> Self {
        Self::Placement(event)
    }
}

impl From<RestrictionEvent> for Event {
    fn from(event: RestrictionEvent) -> Self {
        Self::Restriction(event)
    }
}

// === impl Index ===

impl Index {
    pub fn shared(config: Config) -> SharedIndex {
        Arc::new(RwLock::new(Self::new(config)))
    }

    pub fn new(config: Config) -> Self {
        Self {
            config,
            by_ip: HashMap::default(),
            restrictions: HashMap::default(),
        }
    }

    pub fn default_role(&self) -> Option<&str> {
        self.config.default_role.as_deref()
    }

    /// Returns the role that applies to the caller at `ip`.
    ///
    /// Falls back to the default role when no role is assigned; returns `None` when there is no
    /// default either.
    pub fn resolve(&self, ip: IpAddr) -> Option<Resolution> {
        let placement = self.owner(ip);
        if let Some(Placement {
            role: Some(role),
            namespace,
            ..
        }) = placement
        {
            return Some(Resolution {
                role: role.clone(),
                namespace: Some(namespace.clone()),
                found: true,
            });
        }

        let role = self.config.default_role.clone()?;
        Some(Resolution {
            role,
            namespace: placement.map(|p| p.namespace.clone()),
            found: false,
        })
    }

    /// Returns the external ID configured for the workload at `ip`.
    ///
    /// Fails while no workload is known at `ip`, which is expected shortly after a pod starts and
    /// before its watch event has been applied.
    pub fn external_id(&self, ip: IpAddr) -> Result<Option<String>, LookupError> {
        self.owner(ip)
            .map(|p| p.external_id.clone())
            .ok_or(LookupError::NotFound(ip))
    }

    fn owner(&self, ip: IpAddr) -> Option<&Placement> {
        self.by_ip.get(&ip).and_then(|owners| owners.last())
    }

    pub fn apply(&mut self, event: Event) {
        match event {
            Event::Placement(PlacementEvent::Added(placement)) => self.apply_add(placement),
            Event::Placement(PlacementEvent::Updated { old, new }) => self.apply_update(old, new),
            Event::Placement(PlacementEvent::Deleted(placement)) => self.apply_delete(placement),
            Event::Restriction(RestrictionEvent::Applied(restriction)) => {
                self.apply_restriction(restriction)
            }
            Event::Restriction(RestrictionEvent::Deleted(namespace)) => {
                self.delete_restriction(&namespace)
            }
        }
    }

    /// Records the placement at its IP. A workload already indexed at that IP is updated in
    /// place; otherwise the workload becomes the IP's current owner.
    pub fn apply_add(&mut self, placement: Placement) {
        let Some(ip) = placement.ip else {
            tracing::trace!(ns = %placement.namespace, name = %placement.name, "Ignoring workload without an IP");
            return;
        };

        tracing::debug!(%ip, ns = %placement.namespace, name = %placement.name, role = ?placement.role, "Indexed workload");
        let owners = self.by_ip.entry(ip).or_default();
        if let Some(existing) = owners.iter_mut().find(|p| p.same_workload(&placement)) {
            *existing = placement;
            return;
        }

        if let Some(prior) = owners.last() {
            tracing::debug!(
                %ip,
                prior.ns = %prior.namespace,
                prior.name = %prior.name,
                ns = %placement.namespace,
                name = %placement.name,
                "IP shared with another workload"
            );
        }
        owners.push(placement);
    }

    pub fn apply_update(&mut self, old: Placement, new: Placement) {
        if old.ip != new.ip {
            self.apply_delete(old);
        }
        self.apply_add(new);
    }

    /// Removes the workload from its IP. Other workloads at the same IP are kept.
    pub fn apply_delete(&mut self, placement: Placement) {
        let Some(ip) = placement.ip else {
            return;
        };
        let Some(owners) = self.by_ip.get_mut(&ip) else {
            return;
        };

        let before = owners.len();
        owners.retain(|p| !p.same_workload(&placement));
        if owners.len() == before {
            tracing::debug!(%ip, ns = %placement.namespace, name = %placement.name, "Ignoring delete for unknown workload");
            return;
        }

        tracing::debug!(%ip, ns = %placement.namespace, name = %placement.name, remaining = owners.len(), "Removed workload");
        if owners.is_empty() {
            self.by_ip.remove(&ip);
        }
    }

    /// Returns a serializable snapshot of the index.
    pub fn dump(&self) -> Dump {
        let mut roles_by_ip = std::collections::BTreeMap::new();
        let mut namespace_by_ip = std::collections::BTreeMap::new();
        for (ip, placement) in self
            .by_ip
            .iter()
            .filter_map(|(ip, owners)| Some((ip, owners.last()?)))
        {
            if let Some(role) = &placement.role {
                roles_by_ip.insert(ip.to_string(), role.clone());
            }
            namespace_by_ip.insert(ip.to_string(), placement.namespace.clone());
        }

        Dump {
            roles_by_ip,
            namespace_by_ip,
            restrictions: self
                .restrictions
                .iter()
                .map(|(ns, r)| (ns.clone(), r.dump()))
                .collect(),
            default_role: self.config.default_role.clone(),
        }
    }

    pub(crate) fn workloads(&self) -> impl Iterator<Item = &Placement> {
        self.by_ip.values().flatten()
    }

    pub(crate) fn restriction_count(&self) -> usize {
        self.restrictions.len()
    }
}
